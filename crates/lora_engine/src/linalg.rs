//! Dense decompositions used by the initializers.
//!
//! candle has no SVD or QR, so both run on the CPU in f64 over a flat
//! row-major copy of the input and hand the factors back as F32 tensors on
//! the input's device.

use candle_core::{DType, Device, Result, Tensor};

/// Sweeps before the Jacobi SVD gives up on convergence
const MAX_SWEEPS: usize = 64;
/// Relative off-diagonal tolerance for a Jacobi rotation
const JACOBI_EPS: f64 = 1e-14;
/// Columns below this norm are treated as numerically zero
const TINY: f64 = 1e-300;

/// Row-major f64 matrix
#[derive(Clone, Debug)]
struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.data[i * n + i] = 1.0;
        }
        m
    }

    fn from_tensor(t: &Tensor) -> Result<Self> {
        let (rows, cols) = t.dims2()?;
        let data = t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
        Ok(Self { rows, cols, data })
    }

    fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Tensor::from_vec(self.data.clone(), (self.rows, self.cols), device)?.to_dtype(DType::F32)
    }

    fn transpose(&self) -> Self {
        let mut t = Self::zeros(self.cols, self.rows);
        for i in 0..self.rows {
            for j in 0..self.cols {
                t.data[j * self.rows + i] = self.data[i * self.cols + j];
            }
        }
        t
    }

    fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.cols + j]
    }

    fn set(&mut self, i: usize, j: usize, v: f64) {
        self.data[i * self.cols + j] = v;
    }

    fn col_dot(&self, p: usize, q: usize) -> f64 {
        (0..self.rows).map(|i| self.get(i, p) * self.get(i, q)).sum()
    }

    /// Applies the plane rotation (c, s) to columns p and q
    fn rotate_cols(&mut self, p: usize, q: usize, c: f64, s: f64) {
        for i in 0..self.rows {
            let xp = self.get(i, p);
            let xq = self.get(i, q);
            self.set(i, p, c * xp - s * xq);
            self.set(i, q, s * xp + c * xq);
        }
    }

    fn select_cols(&self, order: &[usize]) -> Self {
        let mut m = Self::zeros(self.rows, order.len());
        for (dst, &src) in order.iter().enumerate() {
            for i in 0..self.rows {
                m.set(i, dst, self.get(i, src));
            }
        }
        m
    }
}

/// Thin singular value decomposition `m = u · diag(s) · vt`
pub struct Svd {
    /// (rows, k) with orthonormal columns
    pub u: Tensor,
    /// (k,) in descending order
    pub s: Tensor,
    /// (k, cols) with orthonormal rows
    pub vt: Tensor,
}

/// Thin SVD of a 2-D tensor, `k = min(rows, cols)`.
///
/// One-sided Jacobi (Hestenes) on the taller orientation. Columns of `u`
/// belonging to a zero singular value are left as zero vectors.
pub fn svd(m: &Tensor) -> Result<Svd> {
    let device = m.device().clone();
    let a = Matrix::from_tensor(m)?;
    let (u, s, v) = if a.rows >= a.cols {
        jacobi_svd(a)?
    } else {
        // m^T = u' s v'^T  =>  m = v' s u'^T
        let (u_t, s, v_t) = jacobi_svd(a.transpose())?;
        (v_t, s, u_t)
    };
    let k = s.len();
    Ok(Svd {
        u: u.to_tensor(&device)?,
        s: Tensor::from_vec(s, k, &device)?.to_dtype(DType::F32)?,
        vt: v.transpose().to_tensor(&device)?,
    })
}

/// Returns (u, s, v) for a matrix with rows >= cols
fn jacobi_svd(mut u: Matrix) -> Result<(Matrix, Vec<f64>, Matrix)> {
    let n = u.cols;
    let mut v = Matrix::identity(n);

    let mut converged = n < 2;
    for _ in 0..MAX_SWEEPS {
        if converged {
            break;
        }
        converged = true;
        for p in 0..n {
            for q in (p + 1)..n {
                let alpha = u.col_dot(p, p);
                let beta = u.col_dot(q, q);
                let gamma = u.col_dot(p, q);
                if gamma.abs() <= JACOBI_EPS * (alpha * beta).sqrt() {
                    continue;
                }
                converged = false;
                let zeta = (beta - alpha) / (2.0 * gamma);
                let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = c * t;
                u.rotate_cols(p, q, c, s);
                v.rotate_cols(p, q, c, s);
            }
        }
    }
    if !converged {
        candle_core::bail!("svd: Jacobi sweeps did not converge after {MAX_SWEEPS} sweeps");
    }

    let mut sigma: Vec<f64> = (0..n).map(|j| u.col_dot(j, j).sqrt()).collect();
    for (j, &norm) in sigma.iter().enumerate() {
        let inv = if norm > TINY { 1.0 / norm } else { 0.0 };
        for i in 0..u.rows {
            let x = u.get(i, j);
            u.set(i, j, x * inv);
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| sigma[b].total_cmp(&sigma[a]));
    let u = u.select_cols(&order);
    let v = v.select_cols(&order);
    sigma = order.iter().map(|&j| sigma[j]).collect();
    Ok((u, sigma, v))
}

/// Reduced QR of a (rows, cols) tensor with rows >= cols.
///
/// Returns `q` (rows, cols) with orthonormal columns and upper-triangular
/// `r` (cols, cols). Modified Gram-Schmidt with one reorthogonalization pass.
pub fn qr(m: &Tensor) -> Result<(Tensor, Tensor)> {
    let device = m.device().clone();
    let a = Matrix::from_tensor(m)?;
    let (rows, cols) = (a.rows, a.cols);
    if rows < cols {
        candle_core::bail!("qr: expected rows >= cols, got ({rows}, {cols})");
    }

    let mut q = a;
    let mut r = Matrix::zeros(cols, cols);
    for j in 0..cols {
        for _pass in 0..2 {
            for i in 0..j {
                let proj = q.col_dot(i, j);
                r.set(i, j, r.get(i, j) + proj);
                for k in 0..rows {
                    let x = q.get(k, j) - proj * q.get(k, i);
                    q.set(k, j, x);
                }
            }
        }
        let norm = q.col_dot(j, j).sqrt();
        if norm <= TINY {
            candle_core::bail!("qr: column {j} is linearly dependent");
        }
        r.set(j, j, norm);
        for k in 0..rows {
            let x = q.get(k, j) / norm;
            q.set(k, j, x);
        }
    }
    Ok((q.to_tensor(&device)?, r.to_tensor(&device)?))
}
