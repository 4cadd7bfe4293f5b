//! End to end registry behavior: registration, call selection, on demand
//! launches and pruning

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mesh_registry::{
    ArtifactRef, ArtifactStore, DispatcherConfig, DynamicConfig, Error, LogOnlyControl,
    RegisteredService, RegistrationRequest, RegistryContext, ServiceIdentity, ServiceLauncher,
    ServiceRegistry, ServiceVariant,
};
use uuid::Uuid;

/// Store that pretends every artifact exists
#[derive(Debug)]
struct MemoryStore;

#[async_trait]
impl ArtifactStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list(&self) -> mesh_registry::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn exists(&self, _artifact: &str) -> mesh_registry::Result<bool> {
        Ok(true)
    }

    async fn copy_to(&self, _artifact: &str, _destination: &Path) -> mesh_registry::Result<()> {
        Ok(())
    }

    async fn remove(&self, _artifact: &str) -> mesh_registry::Result<bool> {
        Ok(false)
    }
}

/// Launcher that counts launches and registers the instance after a delay
#[derive(Debug)]
struct CountingLauncher {
    launches: AtomicUsize,
    registry: std::sync::Mutex<Option<Arc<ServiceRegistry>>>,
    register_after: Option<Duration>,
}

impl CountingLauncher {
    fn new(register_after: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            registry: std::sync::Mutex::new(None),
            register_after,
        })
    }

    fn attach(&self, registry: Arc<ServiceRegistry>) {
        *self.registry.lock().unwrap() = Some(registry);
    }

    fn count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceLauncher for CountingLauncher {
    async fn launch(
        &self,
        identity: &ServiceIdentity,
        _artifact: &ArtifactRef,
        variables: &BTreeMap<String, String>,
    ) -> mesh_registry::Result<()> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let instance_id: Uuid = variables
            .get("instanceId")
            .and_then(|v| v.parse().ok())
            .expect("launcher receives an instance id");
        if let Some(delay) = self.register_after {
            let registry = self.registry.lock().unwrap().clone().unwrap();
            let request = RegistrationRequest {
                id: identity.combined(),
                instance_id: Some(instance_id),
                start_time: None,
                protocol: None,
                url: None,
            };
            smol::spawn(async move {
                smol::Timer::after(delay).await;
                registry
                    .register(&request, free_address())
                    .expect("launched instance registers");
            })
            .detach();
        }
        Ok(())
    }
}

fn free_address() -> SocketAddr {
    use std::sync::atomic::AtomicU16;
    static PORT: AtomicU16 = AtomicU16::new(10_000);
    format!("127.0.0.1:{}", PORT.fetch_add(1, Ordering::SeqCst))
        .parse()
        .unwrap()
}

fn test_config() -> DispatcherConfig {
    let mut config = DispatcherConfig::default();
    config.services.initial_register_window_ms = 0;
    config.services.startup_timeout_ms = 2_000;
    config
}

fn registry_with(
    config: DispatcherConfig,
    launcher: Arc<dyn ServiceLauncher>,
) -> Arc<ServiceRegistry> {
    let ctx = Arc::new(RegistryContext::new(
        Arc::new(DynamicConfig::new(config)),
        launcher,
        Arc::new(LogOnlyControl),
    ));
    ServiceRegistry::new(ctx)
}

fn request(id: &str) -> RegistrationRequest {
    RegistrationRequest {
        id: id.to_string(),
        instance_id: None,
        start_time: None,
        protocol: None,
        url: None,
    }
}

fn register(registry: &Arc<ServiceRegistry>, id: &str) -> Arc<RegisteredService> {
    registry.register(&request(id), free_address()).unwrap()
}

#[smol_potat::test]
async fn round_robin_cycles_through_all_instances() {
    let registry = registry_with(test_config(), CountingLauncher::new(None));
    for _ in 0..3 {
        register(&registry, "main/metrics/1.0");
    }

    let mut seen_per_window = Vec::new();
    for _ in 0..3 {
        let mut window = HashSet::new();
        for _ in 0..3 {
            let instance = registry.service_to_call("main", "metrics").await.unwrap();
            window.insert(instance.instance_id);
        }
        seen_per_window.push(window.len());
    }
    assert_eq!(seen_per_window, vec![3, 3, 3]);
}

#[smol_potat::test]
async fn duplicate_instance_id_is_a_conflict() {
    let registry = registry_with(test_config(), CountingLauncher::new(None));
    let first = register(&registry, "main/metrics/1.0");

    let mut dup = request("main/metrics/1.0");
    dup.instance_id = Some(first.instance_id);
    let err = registry.register(&dup, free_address()).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[smol_potat::test]
async fn duplicate_address_is_a_conflict_unless_externally_addressed() {
    let registry = registry_with(test_config(), CountingLauncher::new(None));
    let address = free_address();
    registry.register(&request("main/metrics/1.0"), address).unwrap();

    let err = registry
        .register(&request("main/other/1.0"), address)
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // platform managed registrations carry their own URL and skip the check
    let mut external = request("main/other/1.0");
    external.url = Some("http://other.cluster.local:80".to_string());
    let registered = registry.register(&external, address).unwrap();
    assert_eq!(registered.base_url, "http://other.cluster.local:80");
}

#[smol_potat::test]
async fn only_most_current_version_is_called() {
    let registry = registry_with(test_config(), CountingLauncher::new(None));
    register(&registry, "main/metrics/1.2");
    let newest = register(&registry, "main/metrics/1.10");
    register(&registry, "main/metrics/1.2-SNAPSHOT");

    for _ in 0..5 {
        let instance = registry.service_to_call("main", "metrics").await.unwrap();
        assert_eq!(instance.instance_id, newest.instance_id);
    }
}

#[smol_potat::test]
async fn concurrent_calls_launch_only_once() {
    let launcher = CountingLauncher::new(Some(Duration::from_millis(50)));
    let registry = registry_with(test_config(), launcher.clone());
    launcher.attach(registry.clone());

    let identity = ServiceIdentity::new("main", "metrics", "1.0");
    registry.register_dormant(
        identity.clone(),
        ArtifactRef::new(Arc::new(MemoryStore), identity.artifact_name()),
    );

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            smol::spawn(async move { registry.service_to_call("main", "metrics").await })
        })
        .collect();
    let mut instance_ids = HashSet::new();
    for caller in callers {
        instance_ids.insert(caller.await.unwrap().instance_id);
    }
    assert_eq!(instance_ids.len(), 1);
    assert_eq!(launcher.count(), 1);
}

#[smol_potat::test]
async fn expired_start_times_out_waiters_and_is_pruned() {
    let mut config = test_config();
    config.services.startup_timeout_ms = 100;
    // launcher succeeds but the instance never registers
    let registry = registry_with(config, CountingLauncher::new(None));

    let identity = ServiceIdentity::new("main", "metrics", "1.0");
    registry.register_dormant(
        identity.clone(),
        ArtifactRef::new(Arc::new(MemoryStore), identity.artifact_name()),
    );

    let err = registry.service_to_call("main", "metrics").await.unwrap_err();
    assert!(matches!(err, Error::StartTimeout(_)));

    registry.prune_starting();
    let set = registry.variations("main", "metrics").unwrap();
    assert!(set.views().starting.is_empty());
    // the dormant entry is still there for the next attempt
    assert!(set
        .variants()
        .iter()
        .any(|v| matches!(v, ServiceVariant::Dormant(_))));
}

#[smol_potat::test]
async fn launch_failure_is_reported_to_the_caller() {
    let registry = registry_with(test_config(), Arc::new(mesh_registry::DisabledLauncher));
    let identity = ServiceIdentity::new("main", "metrics", "1.0");
    registry.register_dormant(
        identity.clone(),
        ArtifactRef::new(Arc::new(MemoryStore), identity.artifact_name()),
    );

    let err = registry.service_to_call("main", "metrics").await.unwrap_err();
    assert!(matches!(err, Error::Launch(_)));
}

#[smol_potat::test]
async fn unknown_service_is_not_found() {
    let mut config = test_config();
    config.services.start_when_called = false;
    let registry = registry_with(config, CountingLauncher::new(None));
    let err = registry.service_to_call("main", "nothing").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[smol_potat::test]
async fn stopped_instance_reverts_to_dormant() {
    let launcher = CountingLauncher::new(Some(Duration::from_millis(20)));
    let registry = registry_with(test_config(), launcher.clone());
    launcher.attach(registry.clone());

    let identity = ServiceIdentity::new("main", "metrics", "1.0");
    registry.register_dormant(
        identity.clone(),
        ArtifactRef::new(Arc::new(MemoryStore), identity.artifact_name()),
    );

    let instance = registry.service_to_call("main", "metrics").await.unwrap();
    assert!(instance.artifact.is_some());

    registry.unregister(instance.instance_id).unwrap();
    assert!(registry.registered(instance.instance_id).is_none());
    let set = registry.variations("main", "metrics").unwrap();
    assert!(set.views().available.is_empty());
    assert!(set
        .variants()
        .iter()
        .any(|v| matches!(v, ServiceVariant::Dormant(_))));
}

#[smol_potat::test]
async fn callers_wait_out_the_initial_register_window() {
    let mut config = test_config();
    config.services.initial_register_window_ms = 400;
    let launcher = CountingLauncher::new(Some(Duration::from_millis(20)));
    let registry = registry_with(config, launcher.clone());
    launcher.attach(registry.clone());

    let identity = ServiceIdentity::new("main", "metrics", "1.0");
    registry.register_dormant(
        identity.clone(),
        ArtifactRef::new(Arc::new(MemoryStore), identity.artifact_name()),
    );

    // a previously running instance re-registers during the window
    let registry_clone = registry.clone();
    smol::spawn(async move {
        smol::Timer::after(Duration::from_millis(100)).await;
        register(&registry_clone, "main/metrics/1.0");
    })
    .detach();

    let instance = registry.service_to_call("main", "metrics").await.unwrap();
    assert!(instance.artifact.is_some() || instance.address.is_some());
    // nothing was launched, the re-registered instance was used
    assert_eq!(launcher.count(), 0);
}

#[smol_potat::test]
async fn unregister_reaches_every_variation_set() {
    let registry = registry_with(test_config(), CountingLauncher::new(None));
    let instance = register(&registry, "main/metrics/1.0");

    // a stray copy of the variant in another set still gets dropped
    register(&registry, "main/other/1.0");
    let other = registry.variations("main", "other").unwrap();
    other.add(ServiceVariant::Registered(instance.clone()));

    registry.unregister(instance.instance_id).unwrap();
    assert!(registry.registered(instance.instance_id).is_none());
    for set in registry.all_variations() {
        assert!(!set.variants().iter().any(|v| match v {
            ServiceVariant::Registered(r) => r.instance_id == instance.instance_id,
            _ => false,
        }));
    }
}

#[smol_potat::test]
async fn simultaneous_duplicate_registrations_admit_only_one() {
    let registry = registry_with(test_config(), CountingLauncher::new(None));
    let instance_id = Uuid::new_v4();

    let attempts = (0..8).map(|_| {
        let registry = registry.clone();
        smol::spawn(async move {
            let mut announcement = request("main/metrics/1.0");
            announcement.instance_id = Some(instance_id);
            registry.register(&announcement, free_address())
        })
    });
    let outcomes = futures::future::join_all(attempts).await;

    let accepted = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(accepted, 1);
    assert!(outcomes
        .iter()
        .filter(|o| o.is_err())
        .all(|o| matches!(o, Err(Error::Conflict(_)))));
    assert_eq!(registry.all_running().len(), 1);
}
