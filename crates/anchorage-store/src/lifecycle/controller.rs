//! The lifecycle controller.
//!
//! Owns the backing store's state machine. The first call to
//! [`LifecycleController::ensure_ready`] provisions (or validates) the
//! backend; every concurrent caller waits on the same attempt and gets the
//! same outcome. Once ready, a background task probes the backend and
//! demotes it to `Degraded` when it stops answering.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{BackendMode, Config};
use crate::error::LifecycleError;
use crate::lifecycle::provisioner::{DockerProvisioner, Provisioner};
use crate::lifecycle::{BackingStoreHandle, LifecycleState};
use crate::ports::PortAllocator;
use crate::probe::{HealthProbe, HealthProbeResult, HttpHealthProbe};

/// Upper bound on concurrently running operations.
pub const MAX_IN_FLIGHT: u32 = 1024;

/// Launch attempts before a port race is reported as fatal.
const LAUNCH_ATTEMPTS: usize = 3;

/// Where the backend comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTarget {
    /// An already running store. Never provisioned or stopped by us.
    External { url: String },
    /// A local store we start (or reuse) through a [`Provisioner`].
    SelfManaged {
        preferred_port: Option<u16>,
        port_range: RangeInclusive<u16>,
        data_dir: PathBuf,
    },
}

/// Everything the controller needs from the configuration.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub target: BackendTarget,
    pub api_key: Option<String>,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub degraded_timeout: Duration,
    /// Period of the steady-state probe; `None` disables it.
    pub probe_interval: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl LifecycleSettings {
    /// Settings for `target` with the default timings.
    pub fn new(target: BackendTarget) -> Self {
        let defaults = Config::default();
        Self {
            target,
            api_key: None,
            health_check_interval: defaults.health_check_interval(),
            health_check_timeout: defaults.health_check_timeout(),
            degraded_timeout: defaults.degraded_timeout(),
            probe_interval: defaults.probe_interval(),
            shutdown_grace: defaults.shutdown_grace(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, LifecycleError> {
        let target = match config.mode {
            BackendMode::External => {
                let url = config.url.clone().ok_or_else(|| {
                    LifecycleError::Misconfigured("external mode requires a url".to_string())
                })?;
                BackendTarget::External { url }
            }
            BackendMode::SelfManaged => BackendTarget::SelfManaged {
                preferred_port: Some(config.preferred_port),
                port_range: config.port_range_start..=config.port_range_end,
                data_dir: config.data_dir.clone(),
            },
        };

        Ok(Self {
            target,
            api_key: config.api_key.clone(),
            health_check_interval: config.health_check_interval(),
            health_check_timeout: config.health_check_timeout(),
            degraded_timeout: config.degraded_timeout(),
            probe_interval: config.probe_interval(),
            shutdown_grace: config.shutdown_grace(),
        })
    }
}

/// State shared between the controller and its background probe.
#[derive(Debug)]
struct HealthTracker {
    state: watch::Sender<LifecycleState>,
    down_since: Mutex<Option<Instant>>,
    degraded_timeout: Duration,
}

impl HealthTracker {
    fn new(degraded_timeout: Duration) -> Self {
        let (state, _) = watch::channel(LifecycleState::Uninitialized);
        Self {
            state,
            down_since: Mutex::new(None),
            degraded_timeout,
        }
    }

    fn current(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Move to `to`. `Stopped` is terminal: once there, nothing moves out.
    fn transition(&self, to: LifecycleState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == to {
                return false;
            }
            log::info!("Backing store {} -> {}", state, to);
            *state = to;
            true
        })
    }

    /// Record a failed probe; returns when the outage began.
    fn mark_down(&self) -> Instant {
        let mut down = self.down_since.lock().unwrap_or_else(PoisonError::into_inner);
        *down.get_or_insert_with(Instant::now)
    }

    fn mark_up(&self) {
        *self.down_since.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Apply one steady-state probe result.
    fn record_probe(&self, endpoint: &str, result: &HealthProbeResult) {
        if result.reachable {
            if self.current() == LifecycleState::Degraded {
                self.transition(LifecycleState::HealthChecking);
                self.transition(LifecycleState::Ready);
                log::info!("Backing store at {} recovered", endpoint);
            }
            self.mark_up();
            return;
        }

        let since = self.mark_down();
        if self.transition(LifecycleState::Degraded) {
            log::warn!(
                "Backing store at {} failed its health probe: {}",
                endpoint,
                result.error.as_deref().unwrap_or("unknown error")
            );
        } else {
            log::debug!("Backing store at {} still down after {:?}", endpoint, since.elapsed());
        }
    }

    /// Whether an operation may proceed against `endpoint` right now.
    fn check_available(&self, endpoint: &str) -> Result<(), LifecycleError> {
        match self.current() {
            LifecycleState::Ready | LifecycleState::HealthChecking => Ok(()),
            LifecycleState::Degraded => {
                let since = *self.down_since.lock().unwrap_or_else(PoisonError::into_inner);
                match since {
                    Some(since) if since.elapsed() > self.degraded_timeout => {
                        Err(LifecycleError::BackendUnavailable {
                            endpoint: endpoint.to_string(),
                            down_for: since.elapsed(),
                        })
                    }
                    _ => Ok(()),
                }
            }
            LifecycleState::Stopped => Err(LifecycleError::Stopped),
            state => Err(LifecycleError::NotReady { state }),
        }
    }
}

/// Proof that an operation is running against a ready backend.
///
/// Shutdown waits (up to its grace period) for every permit to be dropped
/// before it stops the backend.
#[derive(Debug)]
pub struct OperationPermit {
    handle: BackingStoreHandle,
    _permit: OwnedSemaphorePermit,
}

impl OperationPermit {
    #[must_use]
    pub fn handle(&self) -> &BackingStoreHandle {
        &self.handle
    }
}

/// Provisions, health-checks and tears down the backing store.
#[derive(Debug)]
pub struct LifecycleController {
    settings: LifecycleSettings,
    provisioner: Arc<dyn Provisioner>,
    probe: Arc<dyn HealthProbe>,
    ports: PortAllocator,
    tracker: Arc<HealthTracker>,
    gate: OnceCell<Result<BackingStoreHandle, LifecycleError>>,
    in_flight: Arc<Semaphore>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleController {
    pub fn new(
        settings: LifecycleSettings,
        provisioner: Arc<dyn Provisioner>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let tracker = Arc::new(HealthTracker::new(settings.degraded_timeout));
        Self {
            settings,
            provisioner,
            probe,
            ports: PortAllocator::localhost(),
            tracker,
            gate: OnceCell::new(),
            in_flight: Arc::new(Semaphore::new(MAX_IN_FLIGHT as usize)),
            monitor: Mutex::new(None),
        }
    }

    /// Controller backed by the docker CLI and the HTTP readiness probe.
    pub fn from_config(config: &Config) -> Result<Self, LifecycleError> {
        let settings = LifecycleSettings::from_config(config)?;
        let probe = HttpHealthProbe::new(config.request_timeout(), config.api_key.clone())
            .map_err(|e| LifecycleError::Misconfigured(format!("HTTP client: {e}")))?;
        Ok(Self::new(
            settings,
            Arc::new(DockerProvisioner::from_config(config)),
            Arc::new(probe),
        ))
    }

    /// Probe ports on `allocator` instead of the IPv4 loopback.
    #[must_use]
    pub fn with_port_allocator(mut self, allocator: PortAllocator) -> Self {
        self.ports = allocator;
        self
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn state(&self) -> LifecycleState {
        self.tracker.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tracker.state.subscribe()
    }

    /// The handle, if the backend has been brought up successfully.
    pub fn handle(&self) -> Option<BackingStoreHandle> {
        match self.gate.get() {
            Some(Ok(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Bring the backend to `Ready`, or return the handle if it already is.
    ///
    /// Only the first call does any work. Concurrent callers wait for that
    /// attempt and receive its outcome; a failed attempt is not retried.
    pub async fn ensure_ready(&self) -> Result<BackingStoreHandle, LifecycleError> {
        if self.state().is_terminal() {
            return Err(LifecycleError::Stopped);
        }
        let handle = self.gate.get_or_init(|| self.bring_up()).await.clone()?;
        if self.state().is_terminal() {
            return Err(LifecycleError::Stopped);
        }
        Ok(handle)
    }

    /// Register an operation against the backend.
    ///
    /// Fails with `Stopped` once shutdown has begun, and with
    /// `BackendUnavailable` when the backend has been degraded for longer
    /// than the degraded timeout.
    pub async fn begin_operation(&self) -> Result<OperationPermit, LifecycleError> {
        let handle = self.ensure_ready().await?;
        let permit = Arc::clone(&self.in_flight)
            .acquire_owned()
            .await
            .map_err(|_| LifecycleError::Stopped)?;
        self.tracker.check_available(handle.endpoint())?;
        Ok(OperationPermit {
            handle,
            _permit: permit,
        })
    }

    /// Number of operations currently holding a permit.
    pub fn in_flight(&self) -> usize {
        (MAX_IN_FLIGHT as usize).saturating_sub(self.in_flight.available_permits())
    }

    /// Stop accepting operations, drain in-flight ones and stop a managed
    /// backend. External backends are left running. Calling this more than
    /// once is harmless.
    pub async fn shutdown(&self) -> Result<(), LifecycleError> {
        let previous = self.tracker.state.send_replace(LifecycleState::Stopped);
        if previous.is_terminal() {
            log::debug!("Backing store controller already stopped");
            return Ok(());
        }
        log::info!("Backing store {} -> {}", previous, LifecycleState::Stopped);

        if let Some(task) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        let grace = self.settings.shutdown_grace;
        let drained =
            tokio::time::timeout(grace, self.in_flight.acquire_many(MAX_IN_FLIGHT)).await;
        if drained.is_err() {
            log::warn!(
                "{} operations still running after {:?}; stopping anyway",
                self.in_flight(),
                grace
            );
        }
        self.in_flight.close();

        match self.handle() {
            Some(handle) if handle.is_managed() => self.provisioner.terminate(grace).await,
            Some(handle) => {
                log::info!("Leaving external backing store at {} running", handle.endpoint());
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn bring_up(&self) -> Result<BackingStoreHandle, LifecycleError> {
        let outcome = self.try_bring_up().await;
        if let Err(e) = &outcome {
            if e.is_fatal() {
                log::error!("Backing store failed to start: {}", e);
            }
        }
        outcome
    }

    async fn try_bring_up(&self) -> Result<BackingStoreHandle, LifecycleError> {
        let (endpoint, managed, launched) = match &self.settings.target {
            BackendTarget::External { url } => {
                log::info!("Using external backing store at {}", url);
                (url.trim_end_matches('/').to_string(), false, false)
            }
            BackendTarget::SelfManaged {
                preferred_port,
                port_range,
                data_dir,
            } => {
                self.tracker.transition(LifecycleState::Provisioning);
                let (port, launched) = self
                    .provision(*preferred_port, port_range.clone(), data_dir)
                    .await?;
                (format!("http://127.0.0.1:{port}"), true, launched)
            }
        };

        self.tracker.transition(LifecycleState::HealthChecking);
        let healthy = self.wait_until_healthy(&endpoint).await;

        if healthy.is_err() || self.state().is_terminal() {
            if launched {
                if let Err(e) = self.provisioner.terminate(self.settings.shutdown_grace).await {
                    log::warn!("Could not stop backing store after failed start: {}", e);
                }
            }
            healthy?;
            return Err(LifecycleError::Stopped);
        }

        if !self.tracker.transition(LifecycleState::Ready) && self.state().is_terminal() {
            return Err(LifecycleError::Stopped);
        }

        let handle = BackingStoreHandle::new(
            endpoint,
            self.settings.api_key.clone(),
            managed,
            self.tracker.state.subscribe(),
        );
        self.spawn_monitor(handle.endpoint().to_string());
        Ok(handle)
    }

    /// Reuse a running instance or launch a new one. Returns the host port
    /// and whether we launched it.
    async fn provision(
        &self,
        preferred: Option<u16>,
        range: RangeInclusive<u16>,
        data_dir: &Path,
    ) -> Result<(u16, bool), LifecycleError> {
        if let Some(port) = self.provisioner.find_running().await? {
            log::info!("Reusing running backing store on port {}", port);
            return Ok((port, false));
        }

        let mut preferred = preferred;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let port = self.ports.allocate(preferred, range.clone())?;
            match self.provisioner.launch(port, data_dir).await {
                Ok(()) => return Ok((port, true)),
                Err(LifecycleError::PortInUse { port }) if attempt < LAUNCH_ATTEMPTS => {
                    log::warn!("Port {} was taken before launch; trying another", port);
                    preferred = None;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll the readiness endpoint until it answers or the timeout expires.
    async fn wait_until_healthy(&self, endpoint: &str) -> Result<(), LifecycleError> {
        let started = Instant::now();
        let deadline = started + self.settings.health_check_timeout;

        loop {
            if self.state().is_terminal() {
                return Err(LifecycleError::Stopped);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let probed = tokio::time::timeout(remaining, self.probe.probe(endpoint)).await;
            let last_error = match probed {
                Ok(result) if result.reachable => {
                    log::info!(
                        "Backing store at {} healthy after {:?}",
                        endpoint,
                        started.elapsed()
                    );
                    return Ok(());
                }
                Ok(result) => {
                    let error = result.error.unwrap_or_else(|| "unreachable".to_string());
                    log::debug!("Backing store at {} not ready: {}", endpoint, error);
                    error
                }
                Err(_) => "health probe timed out".to_string(),
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(LifecycleError::ProvisioningTimeout {
                    endpoint: endpoint.to_string(),
                    waited: now - started,
                    last_error,
                });
            }
            tokio::time::sleep(self.settings.health_check_interval.min(deadline - now)).await;
        }
    }

    fn spawn_monitor(&self, endpoint: String) {
        let Some(period) = self.settings.probe_interval else {
            return;
        };
        let tracker = Arc::clone(&self.tracker);
        let probe = Arc::clone(&self.probe);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tracker.current().is_terminal() {
                    break;
                }
                let result = probe.probe(&endpoint).await;
                tracker.record_probe(&endpoint, &result);
            }
        });

        *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        if let Some(task) = self
            .monitor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
