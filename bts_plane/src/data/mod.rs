pub mod converter;
pub mod manifest;
pub mod planner;
pub mod store;

pub use converter::{Batch, Converter};
pub use manifest::{DatasetIndex, UtteranceRecord};
pub use planner::{BatchConfig, BatchPlan, SortPolicy};
