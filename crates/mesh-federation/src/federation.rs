//! Tracking peer stars and fanning requests out to them

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use mesh_registry::config::DynamicConfig;
use mesh_registry::debounce::Debouncer;
use mesh_registry::events::EventEmitter;
use mesh_registry::{headers, join_url};
use tracing::{debug, info, warn};

use crate::relay::{FIRST_AVAILABLE_STAR, LOCAL_STAR, RelayCall, RelayRequest, RelayResponse};
use crate::star::{Star, refers_to_local};
use crate::transport::StarTransport;
use crate::{Error, Result};

const UPDATE_ACTIVE_KEY: &str = "update-active-stars";
const UPDATE_ACTIVE_DELAY: Duration = Duration::from_millis(100);

/// A change in the set of active stars
#[derive(Debug, Clone)]
pub enum FederationEvent {
    /// A star became reachable
    StarJoined(Star),
    /// A star stopped being reachable
    StarLeft(Star),
    /// The active set changed; only emitted when the federation has peers
    StarsChanged {
        /// The new active set, in configured order
        active: Vec<Star>,
    },
}

/// Liveness tracking and relaying across the federation
///
/// Peers are probed periodically; any inbound activity from a peer also
/// counts as liveness. A peer missing activity for twice the probe
/// interval drops out of the active set. The local star is always active.
pub struct StarFederation {
    config: Arc<DynamicConfig>,
    transport: Arc<dyn StarTransport>,
    local: RwLock<Star>,
    stars: RwLock<Arc<Vec<Star>>>,
    last_seen: Mutex<HashMap<String, Instant>>,
    active: RwLock<Arc<Vec<Star>>>,
    events: EventEmitter<FederationEvent>,
    debouncer: Debouncer,
    weak_self: std::sync::Weak<Self>,
}

impl StarFederation {
    /// Create a federation from configuration; star list changes are
    /// picked up on config reload
    pub fn new(config: Arc<DynamicConfig>, transport: Arc<dyn StarTransport>) -> Arc<Self> {
        let federation = Arc::new_cyclic(|weak_self| Self {
            config: config.clone(),
            transport,
            local: RwLock::new(Star::new("local", "")),
            stars: RwLock::new(Arc::new(Vec::new())),
            last_seen: Mutex::new(HashMap::new()),
            active: RwLock::new(Arc::new(Vec::new())),
            events: EventEmitter::new(),
            debouncer: Debouncer::new(),
            weak_self: weak_self.clone(),
        });
        federation.reload_stars();
        {
            let weak = Arc::downgrade(&federation);
            config.on_change(move |_, changed| {
                let relevant = changed.contains(mesh_registry::config::sections::STARS)
                    || changed.contains(mesh_registry::config::sections::URL);
                if relevant {
                    if let Some(federation) = weak.upgrade() {
                        federation.reload_stars();
                    }
                }
            });
        }
        federation
    }

    /// Rebuild the star list from the current configuration
    pub fn reload_stars(&self) {
        let config = self.config.get();
        let mut stars: Vec<Star> = config
            .stars
            .instances
            .iter()
            .map(|s| Star::new(s.name.clone(), s.url.clone()))
            .collect();
        let local = stars
            .iter()
            .find(|star| refers_to_local(&star.url, &config.url))
            .cloned()
            .unwrap_or_else(|| Star::new("local", config.url.clone()));
        if !stars.contains(&local) {
            stars.insert(0, local.clone());
        }
        info!("Star federation: local is {}, peers: {}", local, stars.len() - 1);
        *self.local.write().unwrap() = local;
        *self.stars.write().unwrap() = Arc::new(stars);
        self.update_active_now();
    }

    /// The local star
    pub fn local_star(&self) -> Star {
        self.local.read().unwrap().clone()
    }

    /// All configured stars, the local one included
    pub fn stars(&self) -> Arc<Vec<Star>> {
        self.stars.read().unwrap().clone()
    }

    /// The currently active stars, in configured order
    pub fn active_stars(&self) -> Arc<Vec<Star>> {
        self.active.read().unwrap().clone()
    }

    /// Subscribe to federation events
    pub fn subscribe(&self) -> async_channel::Receiver<FederationEvent> {
        self.events.subscribe()
    }

    /// Look up a star by name; pseudo names resolve to the local star or
    /// the first active one
    pub fn star(&self, name: &str) -> Option<Star> {
        match name {
            LOCAL_STAR => Some(self.local_star()),
            FIRST_AVAILABLE_STAR => self.active_stars().first().cloned(),
            _ => self.stars().iter().find(|s| s.name == name).cloned(),
        }
    }

    /// Like [`star`](Self::star), but only when the star is active
    pub fn active_star(&self, name: &str) -> Option<Star> {
        self.star(name).filter(|star| self.is_active(star))
    }

    /// Whether a star currently counts as active
    pub fn is_active(&self, star: &Star) -> bool {
        if self.is_local(star) {
            return true;
        }
        let max_age = self.config.get().stars.max_activity_age();
        self.last_seen
            .lock()
            .unwrap()
            .get(&star.url)
            .is_some_and(|seen| seen.elapsed() <= max_age)
    }

    /// Whether a star is this dispatcher
    pub fn is_local(&self, star: &Star) -> bool {
        self.local.read().unwrap().url == star.url
    }

    /// Record liveness of a peer, from a probe or inbound traffic
    pub fn mark_star_alive(&self, star_url: &str) {
        self.last_seen
            .lock()
            .unwrap()
            .insert(star_url.to_string(), Instant::now());
        self.schedule_update_active();
    }

    /// Record that a peer could not be reached
    pub fn mark_star_unreachable(&self, star_url: &str) {
        self.last_seen.lock().unwrap().remove(star_url);
        self.schedule_update_active();
    }

    /// Probe all peers once, concurrently; one unreachable peer does not
    /// delay the others
    pub async fn probe_all(&self) {
        let stars = self.stars();
        let probes = stars.iter().filter(|star| !self.is_local(star)).map(|star| {
            let star = star.clone();
            async move {
                match self.transport.ping(&star).await {
                    Ok(()) => self.mark_star_alive(&star.url),
                    Err(err) => {
                        debug!("Star {} not reachable: {}", star, err);
                        self.mark_star_unreachable(&star.url);
                    }
                }
            }
        });
        join_all(probes).await;
    }

    /// Probe peers periodically until the federation is dropped
    pub fn spawn_probe_task(self: &Arc<Self>) {
        let federation = Arc::downgrade(self);
        let interval = self.config.get().stars.alive_check_interval();
        smol::spawn(async move {
            loop {
                let Some(federation) = federation.upgrade() else {
                    break;
                };
                federation.probe_all().await;
                drop(federation);
                smol::Timer::after(interval).await;
            }
        })
        .detach();
    }

    fn schedule_update_active(&self) {
        // collapses a burst of probe results into one recompute; tests
        // call update_active_now directly
        let weak = self.weak_self.clone();
        self.debouncer
            .debounce(UPDATE_ACTIVE_KEY, UPDATE_ACTIVE_DELAY, move || async move {
                if let Some(federation) = weak.upgrade() {
                    federation.update_active_now();
                }
            });
    }

    /// Recompute the active set and notify on changes
    pub fn update_active_now(&self) {
        let stars = self.stars();
        let new_active: Vec<Star> = stars
            .iter()
            .filter(|star| self.is_active(star))
            .cloned()
            .collect();
        let old_active = {
            let mut active = self.active.write().unwrap();
            if **active == new_active {
                return;
            }
            std::mem::replace(&mut *active, Arc::new(new_active.clone()))
        };
        for star in new_active.iter().filter(|s| !old_active.contains(s)) {
            info!("Star joined: {}", star);
            self.events.emit(FederationEvent::StarJoined(star.clone()));
        }
        for star in old_active.iter().filter(|s| !new_active.contains(s)) {
            warn!("Star left: {}", star);
            self.events.emit(FederationEvent::StarLeft(star.clone()));
        }
        if stars.len() > 1 {
            self.events.emit(FederationEvent::StarsChanged { active: new_active });
        }
    }

    /// Whether request headers address a different star than this one
    pub fn is_for_other_star(&self, request_headers: &BTreeMap<String, String>) -> bool {
        self.target_star_name(request_headers)
            .is_some_and(|name| name != self.local_star().name)
    }

    /// The star the request headers address, when they address one
    pub fn target_star(&self, request_headers: &BTreeMap<String, String>) -> Option<Star> {
        self.target_star_name(request_headers)
            .and_then(|name| self.star(&name))
    }

    fn target_star_name(&self, request_headers: &BTreeMap<String, String>) -> Option<String> {
        request_headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(headers::X_STAR_TARGET))
            .map(|(_, value)| value.clone())
    }

    /// Fan a request out to its target stars and collect every answer
    ///
    /// An unreachable star yields a failed response; it never poisons the
    /// answers of the others.
    pub async fn relay(&self, request: &RelayRequest) -> Result<Vec<RelayResponse>> {
        let targets = self.call_targets(request)?;
        let calls = targets.iter().map(|star| self.relay_to(star, request));
        Ok(join_all(calls).await)
    }

    /// Relay to the first target star only
    pub async fn relay_single(&self, request: &RelayRequest) -> Result<RelayResponse> {
        let targets = self.call_targets(request)?;
        let first = targets.first().ok_or(Error::NoActiveStars)?;
        Ok(self.relay_to(first, request).await)
    }

    fn call_targets(&self, request: &RelayRequest) -> Result<Vec<Star>> {
        match &request.star {
            Some(name) => {
                let star = self
                    .star(name)
                    .ok_or_else(|| Error::UnknownStar(name.clone()))?;
                if !self.is_active(&star) {
                    return Err(Error::NoActiveStars);
                }
                Ok(vec![star])
            }
            None => {
                let targets: Vec<Star> = self
                    .active_stars()
                    .iter()
                    .filter(|star| request.include_local || !self.is_local(star))
                    .cloned()
                    .collect();
                if targets.is_empty() {
                    return Err(Error::NoActiveStars);
                }
                Ok(targets)
            }
        }
    }

    async fn relay_to(&self, star: &Star, request: &RelayRequest) -> RelayResponse {
        let local = self.local_star();
        let mut relay_headers = vec![
            (headers::X_STAR_NAME.to_string(), local.name),
            (headers::X_STAR_TARGET.to_string(), star.name.clone()),
        ];
        if let Some(token) = &request.user_token {
            relay_headers.push((headers::X_USER_TOKEN.to_string(), token.clone()));
        }
        let call = RelayCall {
            method: request.method.clone(),
            url: join_url(
                &join_url(&star.url, &request.service_name),
                &request.service_path,
            ),
            params: request.params.clone(),
            headers: relay_headers,
            payload: request.payload.clone(),
        };
        match self.transport.exchange(star, &call).await {
            Ok(response) => {
                self.mark_star_alive(&star.url);
                response
            }
            Err(err) => {
                warn!("Relay to {} failed: {}", star, err);
                if !self.is_local(star) {
                    self.mark_star_unreachable(&star.url);
                }
                RelayResponse::failed(star.name.clone(), star.url.clone())
            }
        }
    }

}

impl std::fmt::Debug for StarFederation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StarFederation")
            .field("local", &self.local_star())
            .field("stars", &self.stars().len())
            .field("active", &self.active_stars().len())
            .finish()
    }
}
