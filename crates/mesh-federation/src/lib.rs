//! Star federation and relay fan-out for the star mesh
//!
//! A star is one dispatcher plus the services registered on it. Stars
//! form a loose federation: each probes its peers, tracks which are
//! alive, and can relay requests to a service across all active stars at
//! once.

#![warn(missing_docs)]

pub mod dispatcher;
pub mod federation;
pub mod relay;
pub mod star;
pub mod transport;

pub use dispatcher::Dispatcher;
pub use federation::{FederationEvent, StarFederation};
pub use relay::{FIRST_AVAILABLE_STAR, LOCAL_STAR, RelayCall, RelayRequest, RelayResponse};
pub use star::Star;
pub use transport::StarTransport;

use thiserror::Error as ThisError;

/// Errors from federation operations
#[derive(ThisError, Debug)]
pub enum Error {
    /// Error from the registry layer
    #[error(transparent)]
    Registry(#[from] mesh_registry::Error),

    /// A peer star could not be reached
    #[error("Transport error: {0}")]
    Transport(String),

    /// A request named a star this federation does not know
    #[error("Unknown star: {0}")]
    UnknownStar(String),

    /// A relay found no active star to call
    #[error("No active stars to call")]
    NoActiveStars,

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for federation operations
pub type Result<T> = std::result::Result<T, Error>;
