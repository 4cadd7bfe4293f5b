//! The dispatcher facade
//!
//! One dispatcher is one star: it owns the registry, the router and the
//! federation, registers itself as a service, and resolves incoming
//! request paths either locally or toward the star the request names.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use mesh_registry::config::DynamicConfig;
use mesh_registry::variant::{ServiceControl, ServiceLauncher};
use mesh_registry::{
    RegisteredService, RegistrationRequest, RegistryContext, RequestRouter, ServiceIdentity,
    ServiceRegistry, join_url,
};
use tracing::info;
use uuid::Uuid;

use crate::federation::StarFederation;
use crate::transport::StarTransport;
use crate::{Error, Result};

/// The assembled control plane of one star
#[derive(Debug)]
pub struct Dispatcher {
    instance: Arc<RegisteredService>,
    registry: Arc<ServiceRegistry>,
    federation: Arc<StarFederation>,
    router: RequestRouter,
}

impl Dispatcher {
    /// Assemble a dispatcher and register it as a service of its own star
    pub fn new(
        identity: ServiceIdentity,
        config: Arc<DynamicConfig>,
        launcher: Arc<dyn ServiceLauncher>,
        control: Arc<dyn ServiceControl>,
        transport: Arc<dyn StarTransport>,
    ) -> Result<Arc<Self>> {
        let ctx = Arc::new(RegistryContext::new(config.clone(), launcher, control));
        let registry = ServiceRegistry::new(ctx);
        let request = RegistrationRequest {
            id: identity.combined(),
            instance_id: None,
            start_time: None,
            protocol: None,
            // self registration carries the public URL, like any platform
            // managed service
            url: Some(config.get().url.clone()),
        };
        let source = SocketAddr::from(([127, 0, 0, 1], 0));
        let instance = registry.register(&request, source)?;
        info!("Dispatcher is {}", instance);
        let federation = StarFederation::new(config, transport);
        let router = RequestRouter::new(registry.clone(), instance.instance_id);
        Ok(Arc::new(Self {
            instance,
            registry,
            federation,
            router,
        }))
    }

    /// Start the periodic maintenance loops: expired start pruning and
    /// peer probing
    pub fn start_background_tasks(&self) {
        self.registry.spawn_prune_task();
        self.federation.spawn_probe_task();
    }

    /// Resolve a request path to the URL it should be forwarded to
    ///
    /// Requests whose headers name another star go to that star's
    /// dispatcher unchanged; everything else resolves locally, launching
    /// dormant services on demand.
    pub async fn target_url(
        &self,
        path: &str,
        request_headers: &BTreeMap<String, String>,
    ) -> Result<String> {
        if self.federation.is_for_other_star(request_headers) {
            let name = request_headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(mesh_registry::headers::X_STAR_TARGET))
                .map(|(_, value)| value.clone())
                .unwrap_or_default();
            let star = self
                .federation
                .star(&name)
                .ok_or(Error::UnknownStar(name))?;
            return Ok(join_url(&star.url, path));
        }
        let decision = self.router.resolve(path, request_headers);
        decision
            .resolve_url(&self.instance.base_url)
            .await
            .map_err(Error::from)
    }

    /// This dispatcher's own instance id
    pub fn instance_id(&self) -> Uuid {
        self.instance.instance_id
    }

    /// This dispatcher's own registration
    pub fn instance(&self) -> &Arc<RegisteredService> {
        &self.instance
    }

    /// The service registry of this star
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// The federation this star belongs to
    pub fn federation(&self) -> &Arc<StarFederation> {
        &self.federation
    }

    /// The request router of this star
    pub fn router(&self) -> &RequestRouter {
        &self.router
    }
}
