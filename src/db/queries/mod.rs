//! Database queries

pub mod batch;
pub mod driver;
pub mod order;
