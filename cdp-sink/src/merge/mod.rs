//! Merge graph management and member merging
//!
//! `graph` holds the edge rules, `manager` persists them, `service` runs the
//! merge transaction itself.

mod graph;
pub mod manager;
mod service;

pub use graph::MergeGraph;
pub use service::{merge_in_transaction, MergeService};
