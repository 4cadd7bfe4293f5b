//! Dispatcher configuration with hot reload
//!
//! Configuration is an immutable snapshot behind an `Arc`. Replacing it
//! swaps the snapshot and notifies listeners with the set of top level
//! sections that changed, so subsystems can react only to their own keys.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

/// Complete dispatcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatcherConfig {
    /// Public base URL of this dispatcher, also the local star URL
    pub url: String,
    /// Where unresolvable requests go; a literal `http(s)` URL enables
    /// single hop fallback forwarding
    pub fallback: String,
    /// Service lifecycle tuning
    pub services: ServicesConfig,
    /// Launching of service processes
    pub launch: LaunchConfig,
    /// Artifact store polling
    pub artifacts: ArtifactsConfig,
    /// Peer star settings
    pub stars: StarsConfig,
    /// Rules that trigger rolling restarts
    pub restart_rules: Vec<RestartRule>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            fallback: String::new(),
            services: ServicesConfig::default(),
            launch: LaunchConfig::default(),
            artifacts: ArtifactsConfig::default(),
            stars: StarsConfig::default(),
            restart_rules: Vec::new(),
        }
    }
}

/// Service lifecycle tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServicesConfig {
    /// Grace window after dispatcher boot during which callers wait for
    /// previously running services to re-register instead of launching
    pub initial_register_window_ms: u64,
    /// How long a caller waits for a starting service to register
    pub startup_timeout_ms: u64,
    /// How often starting entries are checked for expiry
    pub prune_interval_ms: u64,
    /// Launch a dormant service when a request arrives for it
    pub start_when_called: bool,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            initial_register_window_ms: 20_000,
            startup_timeout_ms: 20_000,
            prune_interval_ms: 10_000,
            start_when_called: true,
        }
    }
}

impl ServicesConfig {
    /// Startup timeout as a [`Duration`]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Initial register window as a [`Duration`]
    pub fn initial_register_window(&self) -> Duration {
        Duration::from_millis(self.initial_register_window_ms)
    }

    /// Prune interval as a [`Duration`]
    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }
}

/// Launching of service processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LaunchConfig {
    /// Executable that runs service artifacts
    pub runtime: String,
    /// Extra launch flags per service identity, keyed by `group/name` or
    /// `group/name/version`; overrides flags embedded in the artifact
    pub flags: BTreeMap<String, String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            runtime: "service-runtime".to_string(),
            flags: BTreeMap::new(),
        }
    }
}

/// Artifact store polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ArtifactsConfig {
    /// Directories that hold service artifacts
    pub stores: Vec<String>,
    /// How often stores are rescanned
    pub poll_period_ms: u64,
    /// Debounce for externally triggered rescans
    pub rescan_debounce_ms: u64,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            stores: vec!["artifacts".to_string()],
            poll_period_ms: 30_000,
            rescan_debounce_ms: 2_000,
        }
    }
}

impl ArtifactsConfig {
    /// Poll period as a [`Duration`]
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    /// Rescan debounce as a [`Duration`]
    pub fn rescan_debounce(&self) -> Duration {
        Duration::from_millis(self.rescan_debounce_ms)
    }
}

/// Peer star settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StarsConfig {
    /// Configured peer dispatchers
    pub instances: Vec<StarConfig>,
    /// How often peers are probed
    pub alive_check_interval_ms: u64,
    /// Debounce for star change notifications
    pub notify_debounce_ms: u64,
}

impl Default for StarsConfig {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            alive_check_interval_ms: 20_000,
            notify_debounce_ms: 5_000,
        }
    }
}

impl StarsConfig {
    /// Alive check interval as a [`Duration`]
    pub fn alive_check_interval(&self) -> Duration {
        Duration::from_millis(self.alive_check_interval_ms)
    }

    /// A peer is considered inactive after missing activity for twice the
    /// probe interval
    pub fn max_activity_age(&self) -> Duration {
        Duration::from_millis(self.alive_check_interval_ms * 2)
    }

    /// Notify debounce as a [`Duration`]
    pub fn notify_debounce(&self) -> Duration {
        Duration::from_millis(self.notify_debounce_ms)
    }
}

/// A single configured peer star
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StarConfig {
    /// Star name, unique within the federation
    pub name: String,
    /// Base URL of the star's dispatcher
    pub url: String,
}

/// A rule that restarts matching services when a threshold is breached
///
/// Thresholds of zero are disabled. Matchers use the
/// `group/name/version` grammar with `*` wildcards per segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct RestartRule {
    /// Matchers selecting services this rule applies to; empty means all
    pub include: Vec<String>,
    /// Matchers selecting services this rule never applies to
    pub exclude: Vec<String>,
    /// Restart when resident process memory exceeds this many bytes
    pub max_proc_mem: u64,
    /// Restart when current heap use exceeds this many bytes
    pub max_heap_used: u64,
    /// Restart when the low water mark of heap use exceeds this many bytes
    pub max_min_heap_used: u64,
    /// Restart when uptime exceeds this many milliseconds
    pub max_uptime_ms: u64,
    /// Restart daily within a window starting at this local time, `HH:MM`
    pub restart_time: Option<String>,
}

/// Section names reported to change listeners
pub mod sections {
    /// The `url` field
    pub const URL: &str = "url";
    /// The `fallback` field
    pub const FALLBACK: &str = "fallback";
    /// The `services` section
    pub const SERVICES: &str = "services";
    /// The `launch` section
    pub const LAUNCH: &str = "launch";
    /// The `artifacts` section
    pub const ARTIFACTS: &str = "artifacts";
    /// The `stars` section
    pub const STARS: &str = "stars";
    /// The `restartRules` section
    pub const RESTART_RULES: &str = "restartRules";
}

type ChangeListener = Box<dyn Fn(&Arc<DispatcherConfig>, &BTreeSet<String>) + Send + Sync>;

/// Hot reloadable configuration handle
pub struct DynamicConfig {
    current: RwLock<Arc<DispatcherConfig>>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl DynamicConfig {
    /// Wrap an initial configuration
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::new(serde_yaml::from_str(&text)?))
    }

    /// The current configuration snapshot
    pub fn get(&self) -> Arc<DispatcherConfig> {
        self.current.read().unwrap().clone()
    }

    /// Replace the configuration and notify listeners of changed sections
    ///
    /// Listeners only fire when at least one section actually differs.
    pub fn replace(&self, config: DispatcherConfig) {
        let new = Arc::new(config);
        let changed = {
            let mut current = self.current.write().unwrap();
            let changed = changed_sections(&current, &new);
            if !changed.is_empty() {
                *current = new.clone();
            }
            changed
        };
        if changed.is_empty() {
            return;
        }
        info!("Configuration changed: {:?}", changed);
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener(&new, &changed);
        }
    }

    /// Reload from a YAML file, replacing the current snapshot
    pub fn reload_from_yaml_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        self.replace(serde_yaml::from_str(&text)?);
        Ok(())
    }

    /// Register a listener called with the new snapshot and the changed
    /// section names
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(&Arc<DispatcherConfig>, &BTreeSet<String>) + Send + Sync + 'static,
    {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }
}

impl std::fmt::Debug for DynamicConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicConfig")
            .field("current", &self.get())
            .finish()
    }
}

fn changed_sections(old: &DispatcherConfig, new: &DispatcherConfig) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    if old.url != new.url {
        changed.insert(sections::URL.to_string());
    }
    if old.fallback != new.fallback {
        changed.insert(sections::FALLBACK.to_string());
    }
    if old.services != new.services {
        changed.insert(sections::SERVICES.to_string());
    }
    if old.launch != new.launch {
        changed.insert(sections::LAUNCH.to_string());
    }
    if old.artifacts != new.artifacts {
        changed.insert(sections::ARTIFACTS.to_string());
    }
    if old.stars != new.stars {
        changed.insert(sections::STARS.to_string());
    }
    if old.restart_rules != new.restart_rules {
        changed.insert(sections::RESTART_RULES.to_string());
    }
    changed
}
