//! Keeps the registry in sync with artifact stores
//!
//! Stores are polled periodically; new artifacts become dormant services,
//! artifacts that disappeared take their dormant entry with them. External
//! triggers (an upload finishing, a directory watch) are debounced into a
//! single rescan.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use mesh_registry::config::sections;
use mesh_registry::debounce::Debouncer;
use mesh_registry::store::{ArtifactRef, ArtifactStore, FsArtifactStore};
use mesh_registry::{ServiceIdentity, ServiceRegistry};
use tracing::{debug, info, warn};

const RESCAN_KEY: &str = "artifact-rescan";

/// Polls artifact stores and mirrors their content into the registry
pub struct ArtifactInventory {
    registry: Arc<ServiceRegistry>,
    stores: Mutex<Vec<Arc<dyn ArtifactStore>>>,
    known: Mutex<BTreeSet<(String, String)>>,
    debouncer: Debouncer,
}

impl ArtifactInventory {
    /// Create an inventory over the given stores
    pub fn new(registry: Arc<ServiceRegistry>, stores: Vec<Arc<dyn ArtifactStore>>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            stores: Mutex::new(stores),
            known: Mutex::new(BTreeSet::new()),
            debouncer: Debouncer::new(),
        })
    }

    /// Create an inventory over the stores the configuration names;
    /// store list changes are picked up on config reload
    pub async fn from_config(registry: Arc<ServiceRegistry>) -> Arc<Self> {
        let inventory = Self::new(registry, Vec::new());
        inventory.reload_stores().await;
        let weak = Arc::downgrade(&inventory);
        let config = inventory.registry.context().config.clone();
        config.on_change(move |_, changed| {
            if changed.contains(sections::ARTIFACTS) {
                if let Some(inventory) = weak.upgrade() {
                    smol::spawn(async move {
                        inventory.reload_stores().await;
                        inventory.scan_now().await;
                    })
                    .detach();
                }
            }
        });
        inventory
    }

    /// Rebuild the store list from the current configuration
    pub async fn reload_stores(&self) {
        let config = self.registry.context().config.get();
        let mut stores: Vec<Arc<dyn ArtifactStore>> = Vec::new();
        for dir in &config.artifacts.stores {
            match FsArtifactStore::open(dir.clone(), dir.clone()).await {
                Ok(store) => stores.push(Arc::new(store)),
                Err(err) => warn!("Cannot open artifact store {}: {}", dir, err),
            }
        }
        info!("Artifact inventory watches {} store(s)", stores.len());
        *self.stores.lock().unwrap() = stores;
    }

    /// Scan all stores once and apply the differences
    pub async fn scan_now(&self) {
        let stores: Vec<_> = self.stores.lock().unwrap().clone();
        let mut current = BTreeSet::new();
        for store in &stores {
            match store.list().await {
                Ok(names) => {
                    for name in names {
                        current.insert((store.name().to_string(), name));
                    }
                }
                Err(err) => {
                    // keep last known content of an unreadable store
                    warn!("Cannot list artifact store {}: {}", store.name(), err);
                    let known = self.known.lock().unwrap();
                    current.extend(
                        known
                            .iter()
                            .filter(|(s, _)| s == store.name())
                            .cloned(),
                    );
                }
            }
        }
        let (added, removed) = {
            let mut known = self.known.lock().unwrap();
            let added: Vec<_> = current.difference(&known).cloned().collect();
            let removed: Vec<_> = known.difference(&current).cloned().collect();
            *known = current;
            (added, removed)
        };
        for (store_name, artifact) in added {
            let Ok(identity) = ServiceIdentity::from_artifact_name(&artifact) else {
                warn!("Ignoring artifact with unparsable name: {}", artifact);
                continue;
            };
            let Some(store) = self.store(&store_name) else {
                continue;
            };
            debug!("New artifact {} in store {}", artifact, store_name);
            self.registry
                .register_dormant(identity, ArtifactRef::new(store, artifact));
        }
        for (store_name, artifact) in removed {
            if let Ok(identity) = ServiceIdentity::from_artifact_name(&artifact) {
                debug!("Artifact {} disappeared from store {}", artifact, store_name);
                self.registry.remove_dormant(&identity);
            }
        }
    }

    /// Request a rescan soon, collapsing bursts into one scan
    pub fn notify_changed(self: &Arc<Self>) {
        let inventory = self.clone();
        let delay = self
            .registry
            .context()
            .config
            .get()
            .artifacts
            .rescan_debounce();
        self.debouncer.debounce(RESCAN_KEY, delay, move || async move {
            inventory.scan_now().await;
        });
    }

    /// Poll the stores until the inventory is dropped; the period
    /// follows the configuration
    pub fn spawn_poll_task(self: &Arc<Self>) {
        let inventory = Arc::downgrade(self);
        smol::spawn(async move {
            loop {
                let Some(inventory) = inventory.upgrade() else {
                    break;
                };
                inventory.scan_now().await;
                let period = inventory
                    .registry
                    .context()
                    .config
                    .get()
                    .artifacts
                    .poll_period();
                drop(inventory);
                smol::Timer::after(period).await;
            }
        })
        .detach();
    }

    fn store(&self, name: &str) -> Option<Arc<dyn ArtifactStore>> {
        self.stores
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }
}

impl std::fmt::Debug for ArtifactInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactInventory")
            .field("stores", &self.stores.lock().unwrap().len())
            .field("known", &self.known.lock().unwrap().len())
            .finish()
    }
}
