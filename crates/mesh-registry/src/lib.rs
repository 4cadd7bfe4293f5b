//! Service registry and request routing for the star mesh control plane
//!
//! Services register themselves on a dispatcher (a "star"). The registry
//! tracks every known variant of a service: live instances, launches in
//! flight, and dormant artifacts that can be launched on demand. The
//! router turns request paths into concrete targets.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mesh_registry::{
//!     DispatcherConfig, DisabledLauncher, DynamicConfig, LogOnlyControl,
//!     RegistrationRequest, RegistryContext, ServiceRegistry,
//! };
//!
//! # fn main() -> mesh_registry::Result<()> {
//! let config = Arc::new(DynamicConfig::new(DispatcherConfig::default()));
//! let ctx = Arc::new(RegistryContext::new(
//!     config,
//!     Arc::new(DisabledLauncher),
//!     Arc::new(LogOnlyControl),
//! ));
//! let registry = ServiceRegistry::new(ctx);
//! let request = RegistrationRequest {
//!     id: "main/metrics/1.2".to_string(),
//!     instance_id: None,
//!     start_time: None,
//!     protocol: None,
//!     url: None,
//! };
//! let registered = registry.register(&request, "127.0.0.1:9001".parse().unwrap())?;
//! println!("registered {registered}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod counter;
pub mod debounce;
pub mod error;
pub mod events;
pub mod headers;
pub mod identity;
pub mod registry;
pub mod router;
pub mod store;
pub mod variant;
pub mod variations;
pub mod version;

pub use config::{
    ArtifactsConfig, DispatcherConfig, DynamicConfig, LaunchConfig, RestartRule, ServicesConfig,
    StarConfig, StarsConfig,
};
pub use context::RegistryContext;
pub use counter::TimedCounter;
pub use debounce::Debouncer;
pub use error::{Error, Result};
pub use events::{EventEmitter, RegistryEvent};
pub use identity::{DEFAULT_GROUP, ServiceIdentity};
pub use registry::{RegistrationRequest, ServiceRegistry};
pub use router::{PathInfo, RequestRouter, RouteDecision, RouteTarget, join_url};
pub use store::{ArtifactRef, ArtifactStore, FsArtifactStore};
pub use variant::{
    DisabledLauncher, DormantService, LogOnlyControl, RegisteredService, ServiceControl,
    ServiceLauncher, ServiceVariant, StartingService,
};
pub use variations::{ServiceVariationSet, VariationViews};
pub use version::{semantic_cmp, version_cmp};

/// Commonly used types
pub mod prelude {
    pub use crate::config::{DispatcherConfig, DynamicConfig};
    pub use crate::context::RegistryContext;
    pub use crate::error::{Error, Result};
    pub use crate::identity::ServiceIdentity;
    pub use crate::registry::{RegistrationRequest, ServiceRegistry};
    pub use crate::router::{RequestRouter, RouteTarget};
    pub use crate::variant::{ServiceControl, ServiceLauncher, ServiceVariant};
    pub use crate::variations::ServiceVariationSet;
}
