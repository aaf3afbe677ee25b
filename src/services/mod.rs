//! Dispatch engine services

pub mod assignment;
pub mod cancellation;
pub mod compatibility;
pub mod events;
pub mod geo;
pub mod grouping;
pub mod lifecycle;
pub mod locks;
pub mod retry;
pub mod route_updater;
pub mod sequencer;
pub mod workload;
