//! Service variants: registered, starting and dormant
//!
//! A variant is one concrete way a service exists on this star. Registered
//! variants are live processes, starting variants are launches awaiting
//! registration, dormant variants are artifacts that could be launched.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;
use uuid::Uuid;

use crate::counter::TimedCounter;
use crate::error::{Error, Result};
use crate::identity::ServiceIdentity;
use crate::store::ArtifactRef;

/// Outcome a starting service resolves to: the registration, or a launch
/// failure message
pub type StartOutcome = std::result::Result<Arc<RegisteredService>, String>;

/// A live, registered service instance
#[derive(Debug)]
pub struct RegisteredService {
    /// Identity of the service
    pub identity: ServiceIdentity,
    /// Unique id of this instance
    pub instance_id: Uuid,
    /// When the instance reported it started
    pub start_time: DateTime<Utc>,
    /// Protocol the instance speaks, usually `http`
    pub protocol: String,
    /// Base URL requests to this instance are sent to
    pub base_url: String,
    /// Source address the registration came from, absent for external
    /// registrations that supplied their own URL
    pub address: Option<SocketAddr>,
    /// Artifact this instance was launched from, when known
    pub artifact: Option<ArtifactRef>,
    /// Calls routed to this instance
    pub calls: TimedCounter,
}

impl RegisteredService {
    /// Record that a request was routed to this instance
    pub fn called(&self) {
        self.calls.increase();
    }

    /// How long this instance has been up
    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.start_time).to_std().unwrap_or_default()
    }
}

impl fmt::Display for RegisteredService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] at {}", self.identity, self.instance_id, self.base_url)
    }
}

/// A launch that has been initiated and is waiting for its process to
/// register
///
/// Callers obtain a shared waiter that resolves when the registration
/// arrives. Dropping the entry without completing it wakes all waiters
/// with a timeout.
pub struct StartingService {
    /// Identity being started
    pub identity: ServiceIdentity,
    /// Instance id the new process is expected to register with
    pub instance_id: Uuid,
    /// When this entry expires and gets pruned
    pub deadline: Instant,
    /// Stop all other instances of this service once registered
    pub replace_all: bool,
    /// Stop this specific instance once registered
    pub replace_instance: Option<Uuid>,
    /// Artifact being launched, when launched from one
    pub artifact: Option<ArtifactRef>,
    sender: Mutex<Option<oneshot::Sender<StartOutcome>>>,
    waiter: Shared<oneshot::Receiver<StartOutcome>>,
}

impl StartingService {
    /// Create a starting entry that expires after `startup_timeout`
    pub fn new(
        identity: ServiceIdentity,
        artifact: Option<ArtifactRef>,
        startup_timeout: Duration,
        replace_all: bool,
        replace_instance: Option<Uuid>,
    ) -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            identity,
            instance_id: Uuid::new_v4(),
            deadline: Instant::now() + startup_timeout,
            replace_all,
            replace_instance,
            artifact,
            sender: Mutex::new(Some(sender)),
            waiter: receiver.shared(),
        }
    }

    /// Resolve all waiters with the registered instance
    pub fn complete(&self, registered: Arc<RegisteredService>) {
        if let Some(sender) = self.sender.lock().unwrap().take() {
            let _ = sender.send(Ok(registered));
        }
    }

    /// Resolve all waiters with a launch failure
    pub fn fail(&self, message: impl Into<String>) {
        if let Some(sender) = self.sender.lock().unwrap().take() {
            let _ = sender.send(Err(message.into()));
        }
    }

    /// Drop the completion channel so waiters observe a timeout
    pub fn cancel(&self) {
        self.sender.lock().unwrap().take();
    }

    /// Whether this entry is past its deadline
    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Wait until the service registers, fails to launch, or the timeout
    /// elapses
    pub async fn await_registered(&self, timeout: Duration) -> Result<Arc<RegisteredService>> {
        let waiter = self.waiter.clone();
        let outcome = smol::future::or(async move { Some(waiter.await) }, async {
            smol::Timer::after(timeout).await;
            None
        })
        .await;
        match outcome {
            Some(Ok(Ok(registered))) => Ok(registered),
            Some(Ok(Err(message))) => Err(Error::Launch(message)),
            Some(Err(_)) | None => Err(Error::StartTimeout(self.identity.combined())),
        }
    }
}

impl fmt::Debug for StartingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartingService")
            .field("identity", &self.identity)
            .field("instance_id", &self.instance_id)
            .field("replace_all", &self.replace_all)
            .field("replace_instance", &self.replace_instance)
            .finish()
    }
}

impl Drop for StartingService {
    fn drop(&mut self) {
        // waiters must never hang on an entry that no longer exists
        self.sender.lock().unwrap().take();
    }
}

/// A service artifact that is present but not running
#[derive(Debug, Clone)]
pub struct DormantService {
    /// Identity derived from the artifact name
    pub identity: ServiceIdentity,
    /// The artifact that would be launched
    pub artifact: ArtifactRef,
}

/// One concrete way a service exists on this star
#[derive(Debug, Clone)]
pub enum ServiceVariant {
    /// A live instance
    Registered(Arc<RegisteredService>),
    /// A launch awaiting registration
    Starting(Arc<StartingService>),
    /// An artifact that could be launched
    Dormant(DormantService),
}

impl ServiceVariant {
    /// Identity of the underlying service
    pub fn identity(&self) -> &ServiceIdentity {
        match self {
            Self::Registered(registered) => &registered.identity,
            Self::Starting(starting) => &starting.identity,
            Self::Dormant(dormant) => &dormant.identity,
        }
    }

    /// Instance id, when the variant has one
    pub fn instance_id(&self) -> Option<Uuid> {
        match self {
            Self::Registered(registered) => Some(registered.instance_id),
            Self::Starting(starting) => Some(starting.instance_id),
            Self::Dormant(_) => None,
        }
    }

    /// Artifact backing this variant, when known
    pub fn artifact(&self) -> Option<&ArtifactRef> {
        match self {
            Self::Registered(registered) => registered.artifact.as_ref(),
            Self::Starting(starting) => starting.artifact.as_ref(),
            Self::Dormant(dormant) => Some(&dormant.artifact),
        }
    }
}

/// Launches service processes from artifacts
///
/// Implemented by the orchestration layer; the registry only decides when
/// a launch is needed.
#[async_trait::async_trait]
pub trait ServiceLauncher: Send + Sync + fmt::Debug {
    /// Launch the artifact, passing the given variables to the new process
    async fn launch(
        &self,
        identity: &ServiceIdentity,
        artifact: &ArtifactRef,
        variables: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Asks running instances to stop gracefully
#[async_trait::async_trait]
pub trait ServiceControl: Send + Sync + fmt::Debug {
    /// Request a graceful stop of the instance
    async fn request_stop(&self, service: &RegisteredService) -> Result<()>;
}

/// Launcher that refuses to launch anything
///
/// Useful for dispatchers that only route to externally managed services.
#[derive(Debug, Default)]
pub struct DisabledLauncher;

#[async_trait::async_trait]
impl ServiceLauncher for DisabledLauncher {
    async fn launch(
        &self,
        identity: &ServiceIdentity,
        _artifact: &ArtifactRef,
        _variables: &BTreeMap<String, String>,
    ) -> Result<()> {
        Err(Error::Launch(format!(
            "Launching is disabled, cannot start {identity}"
        )))
    }
}

/// Control backend that only logs stop requests
#[derive(Debug, Default)]
pub struct LogOnlyControl;

#[async_trait::async_trait]
impl ServiceControl for LogOnlyControl {
    async fn request_stop(&self, service: &RegisteredService) -> Result<()> {
        tracing::info!("Stop requested for {}", service);
        Ok(())
    }
}
