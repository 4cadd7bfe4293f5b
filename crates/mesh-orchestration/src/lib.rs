//! Process launching, artifact inventory and restart rules for the star
//! mesh
//!
//! This crate is the half of the control plane that touches the operating
//! system: it launches service processes from artifacts, keeps the
//! registry in sync with artifact stores, and restarts services that
//! breach configured resource rules.

#![warn(missing_docs)]

pub mod inventory;
pub mod launcher;
pub mod process_info;
pub mod restart;

pub use inventory::ArtifactInventory;
pub use launcher::ProcessLauncher;
pub use process_info::{InstanceMetrics, ProcessInfoTable, ProcessMetrics};
pub use restart::{RestartPolicyEngine, ServiceMatcher};

use thiserror::Error as ThisError;

/// Errors from orchestration operations
#[derive(ThisError, Debug)]
pub enum Error {
    /// Error from the registry layer
    #[error(transparent)]
    Registry(#[from] mesh_registry::Error),

    /// A restart rule or matcher could not be parsed
    #[error("Invalid rule: {0}")]
    Rule(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;
