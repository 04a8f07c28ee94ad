pub mod checkpoint;
pub mod data;
pub mod device;
pub mod ml;

mod error;

pub use error::{Error, Result};
