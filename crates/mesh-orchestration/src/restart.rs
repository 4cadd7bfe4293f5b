//! Rule driven rolling restarts
//!
//! Rules are checked periodically and after configuration changes, both
//! debounced into a single pass. Within one pass each service is
//! restarted at most once, no matter how many rules it breaches.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime};
use mesh_registry::config::RestartRule;
use mesh_registry::debounce::Debouncer;
use mesh_registry::{ServiceIdentity, ServiceRegistry, RegisteredService};
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::process_info::{InstanceMetrics, ProcessInfoTable};
use crate::{Error, Result};

const CHECK_KEY: &str = "restart-rules-check";
const CHECK_INTERVAL: Duration = Duration::from_secs(30);
const CHECK_DEBOUNCE: Duration = Duration::from_secs(5);

/// Daily restart windows stay open this many minutes past the configured
/// time
const RESTART_WINDOW_MINUTES: i64 = 14;

/// Uptime below which time-of-day restarts never fire, so a service is
/// not restarted twice within one window
const MIN_UPTIME_FOR_TIMED_RESTART: Duration = Duration::from_secs(15 * 60);

/// Matches service identities against `group/name/version` patterns
///
/// A pattern has one to three `/` separated segments, each may use `*`
/// wildcards. One segment matches the name, two match `group/name` or
/// `name/version`, three match the full identity. Empty segments match
/// anything.
#[derive(Debug)]
pub struct ServiceMatcher {
    group: Option<Regex>,
    name: Regex,
    version: Option<Regex>,
    alt_name_version: Option<(Regex, Regex)>,
}

impl ServiceMatcher {
    /// Parse a matcher pattern
    pub fn parse(pattern: &str) -> Result<Self> {
        let parts: Vec<&str> = pattern.split('/').collect();
        match parts.as_slice() {
            [name] => Ok(Self {
                group: None,
                name: segment_regex(name)?,
                version: None,
                alt_name_version: None,
            }),
            // two segments are ambiguous: group/name or name/version
            [first, second] => Ok(Self {
                group: Some(segment_regex(first)?),
                name: segment_regex(second)?,
                version: None,
                alt_name_version: Some((segment_regex(first)?, segment_regex(second)?)),
            }),
            [group, name, version] => Ok(Self {
                group: Some(segment_regex(group)?),
                name: segment_regex(name)?,
                version: Some(segment_regex(version)?),
                alt_name_version: None,
            }),
            _ => Err(Error::Rule(format!("Invalid matcher pattern: {pattern}"))),
        }
    }

    /// Whether the identity matches this pattern
    pub fn matches(&self, identity: &ServiceIdentity) -> bool {
        let direct = self.group.as_ref().is_none_or(|g| g.is_match(&identity.group))
            && self.name.is_match(&identity.name)
            && self.version.as_ref().is_none_or(|v| v.is_match(&identity.version));
        if direct {
            return true;
        }
        self.alt_name_version.as_ref().is_some_and(|(name, version)| {
            name.is_match(&identity.name) && version.is_match(&identity.version)
        })
    }
}

fn segment_regex(segment: &str) -> Result<Regex> {
    if segment.is_empty() {
        return Regex::new(".*").map_err(|e| Error::Rule(e.to_string()));
    }
    let pattern = segment
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{pattern}$")).map_err(|e| Error::Rule(e.to_string()))
}

/// Checks restart rules against live services and restarts breachers
pub struct RestartPolicyEngine {
    registry: Arc<ServiceRegistry>,
    table: Arc<ProcessInfoTable>,
    local_instance_id: Uuid,
    debouncer: Debouncer,
}

impl RestartPolicyEngine {
    /// Create an engine; `local_instance_id` identifies the dispatcher
    /// itself, which is stopped rather than relaunched so its watchdog
    /// can bring it back
    pub fn new(
        registry: Arc<ServiceRegistry>,
        table: Arc<ProcessInfoTable>,
        local_instance_id: Uuid,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            table,
            local_instance_id,
            debouncer: Debouncer::new(),
        })
    }

    /// Run the periodic check loop and re-check on rule changes
    pub fn start(self: &Arc<Self>) {
        {
            let engine = self.clone();
            self.registry.context().config.on_change(move |_, changed| {
                if changed.contains(mesh_registry::config::sections::RESTART_RULES) {
                    engine.schedule_check();
                }
            });
        }
        let engine = Arc::downgrade(self);
        smol::spawn(async move {
            loop {
                smol::Timer::after(CHECK_INTERVAL).await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.schedule_check();
            }
        })
        .detach();
    }

    /// Queue a debounced rule check
    pub fn schedule_check(self: &Arc<Self>) {
        let engine = self.clone();
        self.debouncer.debounce(CHECK_KEY, CHECK_DEBOUNCE, move || async move {
            engine.check_rules_now().await;
        });
    }

    /// Check all rules against all running services once
    ///
    /// Each service is restarted at most once per pass.
    pub async fn check_rules_now(&self) {
        let rules = self.registry.context().config.get().restart_rules.clone();
        if rules.is_empty() {
            return;
        }
        let running = self.registry.all_running();
        let mut restarted: HashSet<Uuid> = HashSet::new();
        for rule in &rules {
            let matchers = match compile_matchers(rule) {
                Ok(matchers) => matchers,
                Err(err) => {
                    warn!("Skipping restart rule: {}", err);
                    continue;
                }
            };
            for service in &running {
                if restarted.contains(&service.instance_id) {
                    continue;
                }
                if !matchers.applies_to(&service.identity) {
                    continue;
                }
                if let Some(reason) = self.breach_of(rule, service) {
                    info!("Restart rule hit for {}: {}", service, reason);
                    restarted.insert(service.instance_id);
                    self.restart(service).await;
                }
            }
        }
    }

    fn breach_of(&self, rule: &RestartRule, service: &RegisteredService) -> Option<String> {
        let metrics = self.table.get(service.instance_id);
        if let Some(InstanceMetrics { resident_memory, .. }) = metrics {
            if rule.max_proc_mem > 0 && resident_memory > rule.max_proc_mem {
                return Some(format!(
                    "process memory {resident_memory} exceeds {}",
                    rule.max_proc_mem
                ));
            }
        }
        if let Some(InstanceMetrics { heap_used, .. }) = metrics {
            if rule.max_heap_used > 0 && heap_used > rule.max_heap_used {
                return Some(format!("heap {heap_used} exceeds {}", rule.max_heap_used));
            }
        }
        if let Some(InstanceMetrics { min_heap_used, .. }) = metrics {
            if rule.max_min_heap_used > 0 && min_heap_used > rule.max_min_heap_used {
                return Some(format!(
                    "heap low water mark {min_heap_used} exceeds {}",
                    rule.max_min_heap_used
                ));
            }
        }
        let uptime = service.uptime();
        if rule.max_uptime_ms > 0 && uptime > Duration::from_millis(rule.max_uptime_ms) {
            return Some(format!("uptime {}s exceeds limit", uptime.as_secs()));
        }
        if let Some(time) = &rule.restart_time {
            match NaiveTime::parse_from_str(time, "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M:%S"))
            {
                Ok(window_start) => {
                    let now = Local::now().time();
                    let window_end = window_start + chrono::Duration::minutes(RESTART_WINDOW_MINUTES);
                    let in_window = now >= window_start && now < window_end;
                    if in_window && uptime > MIN_UPTIME_FOR_TIMED_RESTART {
                        return Some(format!("daily restart window {time}"));
                    }
                }
                Err(err) => warn!("Invalid restart time {}: {}", time, err),
            }
        }
        None
    }

    async fn restart(&self, service: &Arc<RegisteredService>) {
        if service.instance_id == self.local_instance_id {
            // the dispatcher restarts by stopping; its watchdog relaunches
            debug!("Restart rule hit the dispatcher itself, requesting stop");
            let control = self.registry.context().control.clone();
            if let Err(err) = control.request_stop(service).await {
                warn!("Cannot stop the dispatcher: {}", err);
            }
            return;
        }
        let Some(set) = self
            .registry
            .variations(&service.identity.group, &service.identity.name)
        else {
            return;
        };
        set.restart_service(service);
    }
}

struct RuleMatchers {
    include: Vec<ServiceMatcher>,
    exclude: Vec<ServiceMatcher>,
}

impl RuleMatchers {
    fn applies_to(&self, identity: &ServiceIdentity) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|m| m.matches(identity));
        included && !self.exclude.iter().any(|m| m.matches(identity))
    }
}

fn compile_matchers(rule: &RestartRule) -> Result<RuleMatchers> {
    Ok(RuleMatchers {
        include: rule
            .include
            .iter()
            .map(|p| ServiceMatcher::parse(p))
            .collect::<Result<_>>()?,
        exclude: rule
            .exclude
            .iter()
            .map(|p| ServiceMatcher::parse(p))
            .collect::<Result<_>>()?,
    })
}

impl std::fmt::Debug for RestartPolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestartPolicyEngine")
            .field("local_instance_id", &self.local_instance_id)
            .finish()
    }
}
