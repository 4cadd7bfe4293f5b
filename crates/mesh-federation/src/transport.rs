//! Transport seam for talking to peer stars

use async_trait::async_trait;

use crate::relay::{RelayCall, RelayResponse};
use crate::star::Star;
use crate::Result;

/// How the federation reaches peer dispatchers
///
/// The federation only decides who to call; the transport does the
/// calling. Tests plug in an in-memory implementation.
#[async_trait]
pub trait StarTransport: Send + Sync + std::fmt::Debug {
    /// Probe a star for liveness
    async fn ping(&self, star: &Star) -> Result<()>;

    /// Execute one relayed call on a star
    async fn exchange(&self, star: &Star, call: &RelayCall) -> Result<RelayResponse>;
}
