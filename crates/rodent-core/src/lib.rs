//! rodent-core: Shared Foundation
//!
//! Provides:
//! - Error taxonomy shared by every rodent crate
//! - Configuration directory resolution

pub mod config;
pub mod error;

pub use error::{Error, Metadata, Result};
