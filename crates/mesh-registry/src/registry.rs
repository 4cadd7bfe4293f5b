//! The service registry
//!
//! Tracks every service variation set on this star plus an index of live
//! instances. Lookups read immutable snapshots; all mutations go through a
//! single write lock that swaps the snapshot.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::RegistryContext;
use crate::counter::TimedCounter;
use crate::error::{Error, Result};
use crate::events::RegistryEvent;
use crate::identity::ServiceIdentity;
use crate::store::ArtifactRef;
use crate::variant::{DormantService, RegisteredService, ServiceVariant};
use crate::variations::ServiceVariationSet;

/// Wire form of a service announcing itself
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    /// Combined service identity, `group/name/version`
    pub id: String,
    /// Instance id assigned at launch; generated when absent
    #[serde(default)]
    pub instance_id: Option<Uuid>,
    /// Process start time as epoch milliseconds
    #[serde(default)]
    pub start_time: Option<i64>,
    /// Protocol of the instance, defaults to `http`
    #[serde(default)]
    pub protocol: Option<String>,
    /// Externally reachable URL; when set, duplicate address checks are
    /// skipped because the platform manages addressing
    #[serde(default)]
    pub url: Option<String>,
}

/// Registry of all service variation sets on this star
pub struct ServiceRegistry {
    ctx: Arc<RegistryContext>,
    sets: RwLock<Arc<HashMap<String, Arc<ServiceVariationSet>>>>,
    instances: RwLock<Arc<HashMap<Uuid, Arc<RegisteredService>>>>,
    write_lock: Mutex<()>,
}

impl ServiceRegistry {
    /// Create an empty registry over the given context
    pub fn new(ctx: Arc<RegistryContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            sets: RwLock::new(Arc::new(HashMap::new())),
            instances: RwLock::new(Arc::new(HashMap::new())),
            write_lock: Mutex::new(()),
        })
    }

    /// The shared context
    pub fn context(&self) -> &Arc<RegistryContext> {
        &self.ctx
    }

    /// Handle a registration announcement
    ///
    /// The source address becomes the instance's base URL unless the
    /// request carries its own URL. Duplicate instance ids and duplicate
    /// addresses are conflicts, except for externally addressed
    /// registrations.
    pub fn register(
        self: &Arc<Self>,
        request: &RegistrationRequest,
        source: SocketAddr,
    ) -> Result<Arc<RegisteredService>> {
        let identity = ServiceIdentity::parse(&request.id)?;
        let instance_id = request.instance_id.unwrap_or_else(Uuid::new_v4);
        let protocol = request.protocol.clone().unwrap_or_else(|| "http".to_string());
        let external = request.url.is_some();
        let base_url = request
            .url
            .clone()
            .unwrap_or_else(|| format!("{}://{}:{}", protocol, source.ip(), source.port()));
        let set = self.get_or_create(&identity);
        let registered = Arc::new(RegisteredService {
            identity: identity.clone(),
            instance_id,
            start_time: start_time_of(request),
            protocol,
            base_url: base_url.clone(),
            address: (!external).then_some(source),
            artifact: set.artifact_for(&identity),
            calls: TimedCounter::default(),
        });
        {
            // check and insert under one guard so two announcements with
            // the same instance id or address cannot both pass the check
            let _guard = self.write_lock.lock().unwrap();
            if !external {
                self.check_duplicates(instance_id, source)?;
            }
            let mut updated: HashMap<_, _> = self.instances.read().unwrap().as_ref().clone();
            updated.insert(instance_id, registered.clone());
            *self.instances.write().unwrap() = Arc::new(updated);
        }
        info!("Registering service: {}", registered);
        set.add(ServiceVariant::Registered(registered.clone()));
        self.ctx.events.emit(RegistryEvent::Registered {
            identity,
            instance_id,
            base_url,
        });
        Ok(registered)
    }

    /// Record that an artifact is present for a service that may not be
    /// running
    pub fn register_dormant(self: &Arc<Self>, identity: ServiceIdentity, artifact: ArtifactRef) {
        let set = self.get_or_create(&identity);
        if set.artifact_for(&identity).is_some() {
            return;
        }
        debug!("Dormant service detected: {}", identity);
        set.add(ServiceVariant::Dormant(DormantService {
            identity: identity.clone(),
            artifact,
        }));
        self.ctx.events.emit(RegistryEvent::DormantDetected { identity });
    }

    /// Remove the dormant variant when its artifact disappeared
    pub fn remove_dormant(&self, identity: &ServiceIdentity) {
        if let Some(set) = self.variations(&identity.group, &identity.name) {
            if set.remove_dormant(identity) {
                info!("Dormant service removed: {}", identity);
                self.ctx.events.emit(RegistryEvent::DormantRemoved {
                    identity: identity.clone(),
                });
            }
        }
    }

    /// Remove a live instance, reverting it to dormant when its artifact
    /// is known
    pub fn unregister(&self, instance_id: Uuid) -> Option<Arc<RegisteredService>> {
        // every set gets to drop the instance; the index may lag behind
        // the sets after a replacement, so this never trusts it to know
        // which set holds the variant
        let mut removed = None;
        for set in self.all_variations() {
            if let Some(stopped) = set.stopped(instance_id) {
                removed.get_or_insert(stopped);
            }
        }
        let removed = removed?;
        self.drop_instance(instance_id);
        info!("Unregistering service: {}", removed);
        self.ctx.events.emit(RegistryEvent::Unregistered {
            identity: removed.identity.clone(),
            instance_id,
        });
        Some(removed)
    }

    /// Look up a live instance by id
    pub fn registered(&self, instance_id: Uuid) -> Option<Arc<RegisteredService>> {
        self.instances.read().unwrap().get(&instance_id).cloned()
    }

    /// The variation set for `group/name`, if any variant is known
    pub fn variations(&self, group: &str, name: &str) -> Option<Arc<ServiceVariationSet>> {
        self.sets
            .read()
            .unwrap()
            .get(&format!("{group}/{name}"))
            .cloned()
    }

    /// All variation sets
    pub fn all_variations(&self) -> Vec<Arc<ServiceVariationSet>> {
        self.sets.read().unwrap().values().cloned().collect()
    }

    /// All live instances
    pub fn all_running(&self) -> Vec<Arc<RegisteredService>> {
        self.instances.read().unwrap().values().cloned().collect()
    }

    /// Pick or create an instance of `group/name` to route a call to
    pub async fn service_to_call(
        &self,
        group: &str,
        name: &str,
    ) -> Result<Arc<RegisteredService>> {
        let set = self
            .variations(group, name)
            .ok_or_else(|| Error::NotFound(format!("{group}/{name}")))?;
        set.service_to_call().await
    }

    /// Expire starting entries and drop them from every set
    pub fn prune_starting(&self) {
        for set in self.all_variations() {
            set.prune_expired();
        }
    }

    /// Run the periodic prune loop until the registry is dropped
    pub fn spawn_prune_task(self: &Arc<Self>) {
        let registry = Arc::downgrade(self);
        let interval = self.ctx.config.get().services.prune_interval();
        smol::spawn(async move {
            loop {
                smol::Timer::after(interval).await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.prune_starting();
            }
        })
        .detach();
    }

    fn get_or_create(self: &Arc<Self>, identity: &ServiceIdentity) -> Arc<ServiceVariationSet> {
        let key = identity.without_version();
        if let Some(found) = self.sets.read().unwrap().get(&key) {
            return found.clone();
        }
        let _guard = self.write_lock.lock().unwrap();
        if let Some(found) = self.sets.read().unwrap().get(&key) {
            return found.clone();
        }
        let set = Arc::new(ServiceVariationSet::new(
            identity.group.clone(),
            identity.name.clone(),
            self.ctx.clone(),
        ));
        let mut updated: HashMap<_, _> = self.sets.read().unwrap().as_ref().clone();
        updated.insert(key, set.clone());
        *self.sets.write().unwrap() = Arc::new(updated);
        set
    }

    fn check_duplicates(&self, instance_id: Uuid, source: SocketAddr) -> Result<()> {
        let instances = self.instances.read().unwrap();
        if instances.contains_key(&instance_id) {
            warn!("Rejecting registration with duplicate instance id {}", instance_id);
            return Err(Error::Conflict(format!(
                "Instance id already registered: {instance_id}"
            )));
        }
        if let Some(existing) = instances.values().find(|r| r.address == Some(source)) {
            warn!("Rejecting registration from address already in use by {}", existing);
            return Err(Error::Conflict(format!(
                "Address already registered: {source}"
            )));
        }
        Ok(())
    }

    fn drop_instance(&self, instance_id: Uuid) {
        let _guard = self.write_lock.lock().unwrap();
        let mut updated: HashMap<_, _> = self.instances.read().unwrap().as_ref().clone();
        updated.remove(&instance_id);
        *self.instances.write().unwrap() = Arc::new(updated);
    }
}

fn start_time_of(request: &RegistrationRequest) -> DateTime<Utc> {
    request
        .start_time
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .unwrap_or_else(Utc::now)
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("sets", &self.sets.read().unwrap().len())
            .field("instances", &self.instances.read().unwrap().len())
            .finish()
    }
}
