//! Request routing
//!
//! Turns an incoming request path plus headers into a concrete target:
//! this dispatcher, a specific instance, a service variation set, or a
//! configured fallback URL.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::headers;
use crate::identity::{DEFAULT_GROUP, ServiceIdentity};
use crate::registry::ServiceRegistry;
use crate::variant::RegisteredService;
use crate::variations::ServiceVariationSet;

/// A request path split into its routing segments
///
/// Repeated slashes are ignored, so `//a///b/c` parses the same as
/// `/a/b/c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    /// First segment, the service name, group or instance id
    pub first: String,
    /// Second segment, when present
    pub second: String,
    /// Path after the first segment, leading slash included
    pub after_first: String,
    /// Path after the second segment, leading slash included
    pub after_second: String,
}

impl PathInfo {
    /// Split a request path into segments
    pub fn parse(path: &str) -> Self {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let first = segments.first().copied().unwrap_or("").to_string();
        let second = segments.get(1).copied().unwrap_or("").to_string();
        Self {
            first,
            second,
            after_first: join_segments(&segments[segments.len().min(1)..]),
            after_second: join_segments(&segments[segments.len().min(2)..]),
        }
    }
}

fn join_segments(segments: &[&str]) -> String {
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn join_path(prefix: &str, path: &str) -> String {
    format!(
        "/{}/{}",
        prefix.trim_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Join a base URL and a path with exactly one slash between them
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Where a request should go
#[derive(Debug, Clone)]
pub enum RouteTarget {
    /// This dispatcher itself
    LocalDispatcher,
    /// A specific live instance
    Instance(Arc<RegisteredService>),
    /// A service, instance chosen at call time
    Service(Arc<ServiceVariationSet>),
    /// The configured fallback URL, single hop
    Fallback {
        /// Base URL requests are forwarded to
        base_url: String,
    },
    /// Nothing matches
    Unknown,
}

/// A resolved route: the target plus the path to send it
#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// Where the request goes
    pub target: RouteTarget,
    /// Path to use downstream
    pub downstream_path: String,
}

impl RouteDecision {
    /// Whether nothing matched
    pub fn is_unknown(&self) -> bool {
        matches!(self.target, RouteTarget::Unknown)
    }

    /// Resolve the decision to a concrete URL, launching a service on
    /// demand when the target is a variation set
    pub async fn resolve_url(&self, local_base_url: &str) -> Result<String> {
        match &self.target {
            RouteTarget::LocalDispatcher => Ok(join_url(local_base_url, &self.downstream_path)),
            RouteTarget::Instance(instance) => {
                instance.called();
                Ok(join_url(&instance.base_url, &self.downstream_path))
            }
            RouteTarget::Service(set) => {
                let instance = set.service_to_call().await?;
                Ok(join_url(&instance.base_url, &self.downstream_path))
            }
            RouteTarget::Fallback { base_url } => Ok(join_url(base_url, &self.downstream_path)),
            RouteTarget::Unknown => Err(Error::NotFound(self.downstream_path.clone())),
        }
    }
}

/// Resolves request paths to route targets
#[derive(Debug)]
pub struct RequestRouter {
    registry: Arc<ServiceRegistry>,
    local_instance_id: Uuid,
}

impl RequestRouter {
    /// Create a router over the registry; `local_instance_id` is the
    /// dispatcher's own instance id
    pub fn new(registry: Arc<ServiceRegistry>, local_instance_id: Uuid) -> Self {
        Self {
            registry,
            local_instance_id,
        }
    }

    /// Resolve a request path to a target
    ///
    /// Resolution order: instance id in the first segment, explicit
    /// `group/name`, bare name with the caller's group preferred, then
    /// the configured fallback.
    pub fn resolve(&self, path: &str, request_headers: &BTreeMap<String, String>) -> RouteDecision {
        self.resolve_inner(path, request_headers, true)
    }

    fn resolve_inner(
        &self,
        path: &str,
        request_headers: &BTreeMap<String, String>,
        allow_fallback: bool,
    ) -> RouteDecision {
        let info = PathInfo::parse(path);
        if info.first.is_empty() {
            return RouteDecision {
                target: RouteTarget::Unknown,
                downstream_path: "/".to_string(),
            };
        }
        if let Ok(instance_id) = Uuid::parse_str(&info.first) {
            return self.resolve_instance(instance_id, &info);
        }
        if !info.second.is_empty() {
            if let Some(set) = self.registry.variations(&info.first, &info.second) {
                return RouteDecision {
                    target: RouteTarget::Service(set),
                    downstream_path: info.after_second.clone(),
                };
            }
        }
        if let Some(set) = self.resolve_by_name(&info.first, request_headers) {
            return RouteDecision {
                target: RouteTarget::Service(set),
                downstream_path: info.after_first.clone(),
            };
        }
        if allow_fallback {
            self.resolve_fallback(path, request_headers)
        } else {
            RouteDecision {
                target: RouteTarget::Unknown,
                downstream_path: path.to_string(),
            }
        }
    }

    fn resolve_instance(&self, instance_id: Uuid, info: &PathInfo) -> RouteDecision {
        if instance_id == self.local_instance_id {
            return RouteDecision {
                target: RouteTarget::LocalDispatcher,
                downstream_path: info.after_first.clone(),
            };
        }
        match self.registry.registered(instance_id) {
            Some(instance) => RouteDecision {
                target: RouteTarget::Instance(instance),
                downstream_path: info.after_first.clone(),
            },
            None => {
                debug!("No instance {} registered", instance_id);
                RouteDecision {
                    target: RouteTarget::Unknown,
                    downstream_path: info.after_first.clone(),
                }
            }
        }
    }

    /// Find a set for a bare service name: the caller's own group wins,
    /// then the default group, then the first group that has the name
    fn resolve_by_name(
        &self,
        name: &str,
        request_headers: &BTreeMap<String, String>,
    ) -> Option<Arc<ServiceVariationSet>> {
        if let Some(group) = caller_group(request_headers) {
            if let Some(set) = self.registry.variations(&group, name) {
                return Some(set);
            }
        }
        if let Some(set) = self.registry.variations(DEFAULT_GROUP, name) {
            return Some(set);
        }
        let mut groups: Vec<String> = self
            .registry
            .all_variations()
            .into_iter()
            .filter_map(|set| {
                let key = set.key();
                let (group, set_name) = key.split_once('/')?;
                (set_name == name).then(|| group.to_string())
            })
            .collect();
        groups.sort();
        groups
            .first()
            .and_then(|group| self.registry.variations(group, name))
    }

    /// One fallback hop: a literal URL forwards as-is, anything else is
    /// prefixed onto the path and resolved once more with fallback off
    fn resolve_fallback(
        &self,
        path: &str,
        request_headers: &BTreeMap<String, String>,
    ) -> RouteDecision {
        let fallback = self.registry.context().config.get().fallback.clone();
        if fallback.is_empty() {
            return RouteDecision {
                target: RouteTarget::Unknown,
                downstream_path: path.to_string(),
            };
        }
        if fallback.starts_with("http://") || fallback.starts_with("https://") {
            return RouteDecision {
                target: RouteTarget::Fallback { base_url: fallback },
                downstream_path: path.to_string(),
            };
        }
        debug!("Retrying unresolved path {} under fallback {}", path, fallback);
        self.resolve_inner(&join_path(&fallback, path), request_headers, false)
    }
}

fn caller_group(request_headers: &BTreeMap<String, String>) -> Option<String> {
    let value = request_headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(headers::X_SERVICE_ID))
        .map(|(_, value)| value)?;
    ServiceIdentity::parse(value).ok().map(|id| id.group)
}
