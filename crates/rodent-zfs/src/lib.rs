//! rodent-zfs: Dataset Gateway
//!
//! Provides:
//! - DatasetGateway trait consumed by the policy engine
//! - ZfsCli production implementation driving the zfs binary
//! - MemoryGateway in-memory implementation for tests

pub mod cli;
pub mod gateway;
pub mod mock;

pub use cli::ZfsCli;
pub use gateway::{split_full_name, DatasetGateway, SnapshotInfo};
pub use mock::MemoryGateway;
