pub mod activation;
pub mod clip;
mod layer;
pub mod linear;
pub mod model;
pub mod parallel;
pub mod param;
mod random;
pub mod solver;
pub mod tacotron;

pub use layer::*;
pub use random::*;
