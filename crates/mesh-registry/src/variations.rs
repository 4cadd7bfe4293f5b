//! All variants of one service, with call selection and on demand launch

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::RegistryContext;
use crate::error::{Error, Result};
use crate::events::RegistryEvent;
use crate::identity::ServiceIdentity;
use crate::store::ArtifactRef;
use crate::variant::{
    DormantService, RegisteredService, ServiceVariant, StartingService,
};
use crate::version::version_cmp;

/// Delay between retries while waiting out the initial register window
const REGISTER_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Derived, immutable views over the variant list
///
/// Recomputed whenever the list changes; readers grab the current `Arc`
/// without touching the write path.
#[derive(Debug, Default)]
pub struct VariationViews {
    /// Variants of the highest version present
    pub most_current: Vec<ServiceVariant>,
    /// Registered instances among the most current variants
    pub available: Vec<Arc<RegisteredService>>,
    /// Starting entries among the most current variants
    pub starting: Vec<Arc<StartingService>>,
}

/// What happened when a caller tried to begin an on demand launch
enum StartDecision {
    /// A launch was initiated, wait on this entry
    Started(Arc<StartingService>),
    /// Another caller made progress first, re-evaluate
    Race,
    /// Nothing can satisfy the request
    NotFound,
}

/// All variants of one `group/name`, every version included
///
/// The variant list is the single authority, guarded by a mutex that
/// serializes all writers. Derived views are published as a snapshot so
/// the hot call path never blocks on writers.
pub struct ServiceVariationSet {
    group: String,
    name: String,
    ctx: Arc<RegistryContext>,
    variants: Mutex<Vec<ServiceVariant>>,
    views: RwLock<Arc<VariationViews>>,
    call_counter: AtomicUsize,
}

impl ServiceVariationSet {
    /// Create an empty set for `group/name`
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        ctx: Arc<RegistryContext>,
    ) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            ctx,
            variants: Mutex::new(Vec::new()),
            views: RwLock::new(Arc::new(VariationViews::default())),
            call_counter: AtomicUsize::new(0),
        }
    }

    /// The `group/name` key of this set
    pub fn key(&self) -> String {
        format!("{}/{}", self.group, self.name)
    }

    /// Current derived views snapshot
    pub fn views(&self) -> Arc<VariationViews> {
        self.views.read().unwrap().clone()
    }

    /// All variants, highest version first
    pub fn variants(&self) -> Vec<ServiceVariant> {
        self.variants.lock().unwrap().clone()
    }

    /// Add a variant
    ///
    /// A registration whose instance id matches a starting entry completes
    /// that entry: the entry is removed, its waiters are woken with the
    /// registration, and any replace intents are carried out. Completion
    /// runs outside the list lock.
    pub fn add(&self, variant: ServiceVariant) {
        let mut completed: Option<(Arc<StartingService>, Arc<RegisteredService>)> = None;
        {
            let mut variants = self.variants.lock().unwrap();
            if let ServiceVariant::Registered(registered) = &variant {
                let matching = variants.iter().position(|existing| {
                    matches!(existing, ServiceVariant::Starting(starting)
                        if starting.instance_id == registered.instance_id)
                });
                if let Some(position) = matching {
                    if let ServiceVariant::Starting(starting) = variants.remove(position) {
                        completed = Some((starting, registered.clone()));
                    }
                }
            }
            variants.push(variant);
            self.recompute(&variants);
        }
        if let Some((starting, registered)) = completed {
            info!("Service {} completed startup", registered);
            starting.complete(registered.clone());
            if starting.replace_all {
                self.stop_siblings_of(&registered);
            }
            if let Some(instance_id) = starting.replace_instance {
                self.stop_instance(instance_id);
            }
        }
    }

    /// Remove a registered instance that stopped or lost its connection
    ///
    /// When the instance was launched from a known artifact, a dormant
    /// variant takes its place so the service can be started again.
    pub fn stopped(&self, instance_id: Uuid) -> Option<Arc<RegisteredService>> {
        let mut variants = self.variants.lock().unwrap();
        let position = variants.iter().position(|v| {
            matches!(v, ServiceVariant::Registered(r) if r.instance_id == instance_id)
        })?;
        let ServiceVariant::Registered(removed) = variants.remove(position) else {
            return None;
        };
        if let Some(artifact) = &removed.artifact {
            let identity = removed.identity.clone();
            let already_known = variants
                .iter()
                .any(|v| v.identity() == &identity && v.artifact().is_some());
            if !already_known {
                debug!("Reverting {} to dormant", identity);
                variants.push(ServiceVariant::Dormant(DormantService {
                    identity,
                    artifact: artifact.clone(),
                }));
            }
        }
        self.recompute(&variants);
        Some(removed)
    }

    /// Remove a starting or registered entry by instance id
    pub fn remove_instance(&self, instance_id: Uuid) {
        let mut variants = self.variants.lock().unwrap();
        let before = variants.len();
        variants.retain(|v| v.instance_id() != Some(instance_id));
        if variants.len() != before {
            self.recompute(&variants);
        }
    }

    /// Remove the dormant variant for an identity, if present
    pub fn remove_dormant(&self, identity: &ServiceIdentity) -> bool {
        let mut variants = self.variants.lock().unwrap();
        let before = variants.len();
        variants.retain(|v| {
            !matches!(v, ServiceVariant::Dormant(d) if &d.identity == identity)
        });
        let removed = variants.len() != before;
        if removed {
            self.recompute(&variants);
        }
        removed
    }

    /// Drop starting entries that are past their deadline, waking their
    /// waiters with a timeout
    pub fn prune_expired(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut variants = self.variants.lock().unwrap();
            variants.retain(|v| match v {
                ServiceVariant::Starting(starting) if starting.expired(now) => {
                    expired.push(starting.clone());
                    false
                }
                _ => true,
            });
            if !expired.is_empty() {
                self.recompute(&variants);
            }
        }
        for starting in expired {
            warn!("Service {} did not register in time", starting.identity);
            starting.cancel();
        }
    }

    /// The artifact known for an identity, searching all variants
    pub fn artifact_for(&self, identity: &ServiceIdentity) -> Option<ArtifactRef> {
        self.variants
            .lock()
            .unwrap()
            .iter()
            .find(|v| v.identity() == identity)
            .and_then(|v| v.artifact().cloned())
    }

    /// Begin launching the given identity from its known artifact
    ///
    /// Returns false when no artifact is known. `replace_all` stops all
    /// sibling instances once the new one registers; `replace_instance`
    /// stops just that one, which is how rolling restarts work.
    pub fn start_service(
        self: &Arc<Self>,
        identity: &ServiceIdentity,
        replace_all: bool,
        replace_instance: Option<Uuid>,
    ) -> bool {
        let Some(artifact) = self.artifact_for(identity) else {
            warn!("No artifact known for {}, cannot start it", identity);
            return false;
        };
        let starting = {
            let mut variants = self.variants.lock().unwrap();
            let starting = Arc::new(StartingService::new(
                identity.clone(),
                Some(artifact.clone()),
                self.ctx.config.get().services.startup_timeout(),
                replace_all,
                replace_instance,
            ));
            variants.push(ServiceVariant::Starting(starting.clone()));
            self.recompute(&variants);
            starting
        };
        self.spawn_launch(starting, artifact);
        true
    }

    /// Launch a replacement for a running instance; the old instance is
    /// stopped once the new one registers
    pub fn restart_service(self: &Arc<Self>, service: &RegisteredService) -> bool {
        info!("Restarting {}", service);
        self.start_service(&service.identity, false, Some(service.instance_id))
    }

    /// Pick or create an instance to route a call to
    ///
    /// Registered instances are used round robin. With only starting
    /// entries the caller waits for registration. With nothing running,
    /// the initial register window is waited out first, then a dormant
    /// artifact is launched on demand when allowed.
    pub async fn service_to_call(self: &Arc<Self>) -> Result<Arc<RegisteredService>> {
        loop {
            if let Some(found) = self.pick_available() {
                found.called();
                return Ok(found);
            }
            if let Some(starting) = self.pick_starting() {
                return starting
                    .await_registered(self.ctx.config.get().services.startup_timeout())
                    .await;
            }
            if self.ctx.in_initial_register_window() {
                // running services from before a dispatcher restart get a
                // chance to re-register before we launch duplicates
                smol::Timer::after(REGISTER_RETRY_DELAY).await;
                continue;
            }
            match self.begin_start_on_demand() {
                StartDecision::Started(starting) => {
                    return starting
                        .await_registered(self.ctx.config.get().services.startup_timeout())
                        .await;
                }
                StartDecision::Race => continue,
                StartDecision::NotFound => {
                    return Err(Error::NotFound(self.key()));
                }
            }
        }
    }

    fn pick_available(&self) -> Option<Arc<RegisteredService>> {
        let views = self.views();
        match views.available.len() {
            0 => None,
            1 => Some(views.available[0].clone()),
            n => {
                let index = self.call_counter.fetch_add(1, Ordering::Relaxed) % n;
                Some(views.available[index].clone())
            }
        }
    }

    fn pick_starting(&self) -> Option<Arc<StartingService>> {
        let views = self.views();
        match views.starting.len() {
            0 => None,
            1 => Some(views.starting[0].clone()),
            n => {
                let index = self.call_counter.fetch_add(1, Ordering::Relaxed) % n;
                Some(views.starting[index].clone())
            }
        }
    }

    /// Checked-then-launch under the list lock so concurrent callers
    /// cannot start the same service twice
    fn begin_start_on_demand(self: &Arc<Self>) -> StartDecision {
        let (starting, artifact) = {
            let mut variants = self.variants.lock().unwrap();
            let views = self.views.read().unwrap().clone();
            if !views.available.is_empty() || !views.starting.is_empty() {
                return StartDecision::Race;
            }
            if !self.ctx.config.get().services.start_when_called {
                return StartDecision::NotFound;
            }
            let Some(dormant) = views.most_current.iter().find_map(|v| match v {
                ServiceVariant::Dormant(dormant) => Some(dormant.clone()),
                _ => None,
            }) else {
                return StartDecision::NotFound;
            };
            info!("Starting {} on demand", dormant.identity);
            let starting = Arc::new(StartingService::new(
                dormant.identity.clone(),
                Some(dormant.artifact.clone()),
                self.ctx.config.get().services.startup_timeout(),
                false,
                None,
            ));
            variants.push(ServiceVariant::Starting(starting.clone()));
            self.recompute(&variants);
            (starting, dormant.artifact)
        };
        self.spawn_launch(starting.clone(), artifact);
        StartDecision::Started(starting)
    }

    fn spawn_launch(self: &Arc<Self>, starting: Arc<StartingService>, artifact: ArtifactRef) {
        self.ctx.events.emit(RegistryEvent::Starting {
            identity: starting.identity.clone(),
            instance_id: starting.instance_id,
        });
        let launcher = self.ctx.launcher.clone();
        let variables = self.launch_variables(&starting);
        let set = self.clone();
        smol::spawn(async move {
            if let Err(err) = launcher
                .launch(&starting.identity, &artifact, &variables)
                .await
            {
                warn!("Failed to launch {}: {}", starting.identity, err);
                starting.fail(err.to_string());
                set.remove_instance(starting.instance_id);
            }
        })
        .detach();
    }

    fn launch_variables(&self, starting: &StartingService) -> BTreeMap<String, String> {
        let config = self.ctx.config.get();
        BTreeMap::from([
            ("serviceName".to_string(), starting.identity.combined()),
            ("instanceId".to_string(), starting.instance_id.to_string()),
            ("dispatcher.url".to_string(), config.url.clone()),
        ])
    }

    fn stop_siblings_of(&self, keep: &Arc<RegisteredService>) {
        let views = self.views();
        for service in &views.available {
            if service.instance_id != keep.instance_id {
                self.request_stop(service.clone());
            }
        }
    }

    fn stop_instance(&self, instance_id: Uuid) {
        let found = self.variants.lock().unwrap().iter().find_map(|v| match v {
            ServiceVariant::Registered(r) if r.instance_id == instance_id => Some(r.clone()),
            _ => None,
        });
        if let Some(service) = found {
            self.request_stop(service);
        }
    }

    fn request_stop(&self, service: Arc<RegisteredService>) {
        info!("Requesting stop of {}", service);
        let control = self.ctx.control.clone();
        smol::spawn(async move {
            if let Err(err) = control.request_stop(&service).await {
                warn!("Stop request for {} failed: {}", service, err);
            }
        })
        .detach();
    }

    /// Recompute derived views; callers hold the variant lock
    fn recompute(&self, variants: &[ServiceVariant]) {
        let mut sorted: Vec<ServiceVariant> = variants.to_vec();
        sorted.sort_by(|a, b| version_cmp(&b.identity().version, &a.identity().version));
        let most_current: Vec<ServiceVariant> = match sorted.first() {
            Some(highest) => {
                let version = highest.identity().version.clone();
                sorted
                    .iter()
                    .filter(|v| v.identity().version == version)
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        };
        let available = most_current
            .iter()
            .filter_map(|v| match v {
                ServiceVariant::Registered(r) => Some(r.clone()),
                _ => None,
            })
            .collect();
        let starting = most_current
            .iter()
            .filter_map(|v| match v {
                ServiceVariant::Starting(s) => Some(s.clone()),
                _ => None,
            })
            .collect();
        *self.views.write().unwrap() = Arc::new(VariationViews {
            most_current,
            available,
            starting,
        });
    }
}

impl std::fmt::Debug for ServiceVariationSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceVariationSet")
            .field("key", &self.key())
            .field("variants", &self.variants.lock().unwrap().len())
            .finish()
    }
}
