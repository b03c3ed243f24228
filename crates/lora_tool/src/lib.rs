pub mod cli;
pub mod demo;
pub mod inspect;
pub mod layers;
