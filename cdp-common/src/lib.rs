//! # CDP Common Library
//!
//! Shared code for the community data platform services:
//! - Error types
//! - Event types (CdpEvent enum) and the in-process EventBus
//! - Configuration file and root folder resolution
//! - Timestamp helpers

pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
