//! Isolated acquisition worker and its controlling-side wrapper.
//!
//! The hardware is owned by a tokio task running [`continuous_poll`]. The
//! controlling side holds a [`WorkerSession`] and talks to the worker only
//! through three channels:
//!
//! ```text
//!  WorkerSession                               continuous_poll
//!  ─────────────                               ───────────────
//!  command_tx  ── WorkerCommand ─────────────▶ command_rx   (dedupe + apply)
//!  response_rx ◀─ WorkerResponse ───────────── response_tx  (one per frame)
//!  settings_rx ◀─ SettingsHandoff (once) ───── settings_tx
//! ```
//!
//! Everything crossing a channel is moved by value. The worker gets copies of
//! the device id, registry handle and timing it needs when it is spawned; it
//! never sees the `WorkerSession`.
//!
//! # Lifecycle
//!
//! 1. [`WorkerSession::connect`] spawns the worker and waits, bounded by
//!    `connect_timeout_ms`, for the settings handoff. Any failure poisons the
//!    command channel and detaches the task; [`WorkerSession::disconnect`]
//!    still has to be called to abort it.
//! 2. Settings changes are queued with [`WorkerSession::change_setting`]. The
//!    worker drains the queue once per frame, keeping only the latest value
//!    per setting.
//! 3. Readings are pulled with [`WorkerSession::acquire_data`] under one of
//!    the [`AcquisitionMode`] policies. The response channel is unbounded;
//!    under [`AcquisitionMode::KeepAll`] keeping up is the caller's job.
//! 4. The worker exits on a poison command, a hardware error or a reading
//!    that reports a failure, and always sends a poison response last. A
//!    poison command still lets the rest of its drained batch apply first.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::device::{BackendRegistry, DeviceId, DeviceSession, SpectrometerSettings};
use crate::error::{AppResult, SpectroError};
use crate::logging::LogHandle;
use crate::messages::{ControlObject, SettingsHandoff, WorkerCommand, WorkerResponse};
use crate::reading::Reading;

/// How [`WorkerSession::acquire_data`] dequeues readings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// Oldest pending reading, nothing discarded.
    KeepAll,
    /// Newest pending reading, the rest discarded.
    Latest,
    /// Newest completed average if any was pending, else the newest reading.
    #[default]
    KeepComplete,
}

impl FromStr for AcquisitionMode {
    type Err = SpectroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "keep_all" | "all" => Ok(AcquisitionMode::KeepAll),
            "latest" => Ok(AcquisitionMode::Latest),
            "keep_complete" | "complete" => Ok(AcquisitionMode::KeepComplete),
            other => Err(SpectroError::Configuration(format!(
                "invalid acquisition mode: {other}"
            ))),
        }
    }
}

impl fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AcquisitionMode::KeepAll => "keep-all",
            AcquisitionMode::Latest => "latest",
            AcquisitionMode::KeepComplete => "keep-complete",
        })
    }
}

/// Keep the latest item per key, in first-seen key order.
///
/// A later item replaces the earlier one in place rather than moving to the end.
pub fn dedupe_latest<T, K, F>(items: impl IntoIterator<Item = T>, key: F) -> Vec<T>
where
    K: PartialEq,
    F: Fn(&T) -> K,
{
    let mut out: Vec<T> = Vec::new();
    for item in items {
        let k = key(&item);
        match out.iter_mut().find(|existing| key(existing) == k) {
            Some(slot) => *slot = item,
            None => out.push(item),
        }
    }
    out
}

/// Drain every pending command and deduplicate by setting.
///
/// A closed channel means the controlling side is gone and is reported as a
/// poison command.
pub fn dedupe(rx: &mut UnboundedReceiver<WorkerCommand>) -> Vec<WorkerCommand> {
    let mut drained = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(cmd) => drained.push(cmd),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                debug!("command channel closed");
                drained.push(WorkerCommand::Poison);
                break;
            }
        }
    }

    let total = drained.len();
    let deduped = dedupe_latest(drained, WorkerCommand::dedupe_key);
    if deduped.len() < total {
        debug!(
            drained = total,
            kept = deduped.len(),
            "collapsed duplicate commands"
        );
    }
    deduped
}

/// Pick one reading out of a drained batch (oldest first).
pub fn select_reading(mut drained: Vec<Reading>, mode: AcquisitionMode) -> Option<Reading> {
    match mode {
        AcquisitionMode::KeepAll => {
            if drained.is_empty() {
                None
            } else {
                Some(drained.remove(0))
            }
        }
        AcquisitionMode::Latest => drained.pop(),
        AcquisitionMode::KeepComplete => match drained.iter().rposition(|r| r.averaged) {
            Some(index) => Some(drained.swap_remove(index)),
            None => drained.pop(),
        },
    }
}

/// Everything the worker needs, copied in at spawn time.
#[derive(Clone)]
pub struct WorkerArgs {
    /// Device to open.
    pub device_id: DeviceId,
    /// Backend factories.
    pub registry: Arc<BackendRegistry>,
    /// Sleep between acquisitions.
    pub poll_interval: Duration,
    /// Target for `log_level` commands.
    pub log_handle: Option<LogHandle>,
}

impl fmt::Debug for WorkerArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerArgs")
            .field("device_id", &self.device_id)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

/// Worker-side channel endpoints.
#[derive(Debug)]
pub struct WorkerEndpoints {
    /// Setting changes and poison from the controlling side.
    pub command_rx: UnboundedReceiver<WorkerCommand>,
    /// Readings, then one final poison.
    pub response_tx: UnboundedSender<WorkerResponse>,
    /// Sent exactly once, after connect succeeds or fails.
    pub settings_tx: oneshot::Sender<SettingsHandoff>,
}

/// Worker main loop.
///
/// Connects a [`DeviceSession`], hands its settings over once, then applies
/// queued commands and forwards one reading per `poll_interval` until told to
/// stop or the hardware fails.
#[tracing::instrument(name = "continuous_poll", skip_all, fields(device = %args.device_id))]
pub async fn continuous_poll(args: WorkerArgs, endpoints: WorkerEndpoints) {
    let WorkerEndpoints {
        mut command_rx,
        response_tx,
        settings_tx,
    } = endpoints;
    info!("worker starting");

    let mut session = match DeviceSession::new(args.device_id.clone(), &args.registry) {
        Ok(session) => session.with_log_handle(args.log_handle.clone()),
        Err(e) => {
            error!(error = %e, "failed to instantiate device session");
            let _ = settings_tx.send(SettingsHandoff::Failed);
            return;
        }
    };

    if let Err(e) = session.connect().await {
        error!(error = %e, "failed to connect");
        let _ = settings_tx.send(SettingsHandoff::Failed);
        return;
    }

    if settings_tx
        .send(SettingsHandoff::Ready(Box::new(session.settings())))
        .is_err()
    {
        // the poison that follows a timed-out connect ends the loop below
        warn!("controlling side stopped waiting for settings");
    }

    loop {
        if apply_commands(&mut session, dedupe(&mut command_rx)).await {
            info!("received poison pill");
            break;
        }

        let reading = match session.acquire().await {
            Ok(reading) => reading,
            Err(e) => {
                error!(error = %e, "hardware error during acquisition");
                break;
            }
        };

        if let Some(reading) = reading {
            if let Some(reason) = &reading.failure {
                error!(%reason, session_count = reading.session_count, "reading reported failure");
                break;
            }
            if response_tx.send(WorkerResponse::reading(reading)).is_err() {
                warn!("response channel closed");
                break;
            }
        }

        sleep(args.poll_interval).await;
    }

    session.disconnect().await;
    let _ = response_tx.send(WorkerResponse::Poison);
    info!("worker exiting");
}

/// Apply every setting in `batch`, in order. Returns whether the batch held
/// a poison pill; the pill does not cut the rest of the batch short.
async fn apply_commands(session: &mut DeviceSession, batch: Vec<WorkerCommand>) -> bool {
    let mut poisoned = false;
    for cmd in batch {
        match cmd {
            WorkerCommand::Poison => poisoned = true,
            WorkerCommand::Setting(cmd) => {
                if let Err(e) = session.change_setting(&cmd).await {
                    error!(setting = cmd.name(), error = %e, "failed to apply setting");
                }
            }
        }
    }
    poisoned
}

/// Channels and handoff receiver set aside until the worker is spawned.
#[derive(Debug)]
struct Unstarted {
    endpoints: WorkerEndpoints,
    settings_rx: oneshot::Receiver<SettingsHandoff>,
}

/// Controlling-side handle to one worker.
///
/// A session connects at most once; retry with a fresh instance.
pub struct WorkerSession {
    device_id: DeviceId,
    config: WorkerConfig,
    registry: Arc<BackendRegistry>,
    log_handle: Option<LogHandle>,

    command_tx: UnboundedSender<WorkerCommand>,
    response_rx: UnboundedReceiver<WorkerResponse>,
    unstarted: Option<Unstarted>,

    poller: Option<JoinHandle<()>>,
    orphan: Option<AbortHandle>,
    settings: Option<SpectrometerSettings>,
    closing: bool,
    terminated: bool,
}

impl fmt::Debug for WorkerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSession")
            .field("device_id", &self.device_id)
            .field("running", &self.poller.is_some())
            .field("closing", &self.closing)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl WorkerSession {
    /// Set up channels; nothing is spawned until `connect`.
    pub fn new(device_id: DeviceId, config: WorkerConfig, registry: Arc<BackendRegistry>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (settings_tx, settings_rx) = oneshot::channel();

        Self {
            device_id,
            config,
            registry,
            log_handle: None,
            command_tx,
            response_rx,
            unstarted: Some(Unstarted {
                endpoints: WorkerEndpoints {
                    command_rx,
                    response_tx,
                    settings_tx,
                },
                settings_rx,
            }),
            poller: None,
            orphan: None,
            settings: None,
            closing: false,
            terminated: false,
        }
    }

    /// Hand `log_level` commands in the worker to this handle.
    pub fn with_log_handle(mut self, handle: Option<LogHandle>) -> Self {
        self.log_handle = handle;
        self
    }

    /// Device this session drives.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Settings received during connect.
    pub fn settings(&self) -> Option<&SpectrometerSettings> {
        self.settings.as_ref()
    }

    /// `disconnect` has started; reads and setting changes are ignored.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// The worker has sent its final poison response.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Spawn the worker and wait for its settings handoff.
    pub async fn connect(&mut self) -> AppResult<()> {
        let Some(Unstarted {
            endpoints,
            settings_rx,
        }) = self.unstarted.take()
        else {
            return Err(SpectroError::AlreadyRunning(self.device_id.to_string()));
        };

        let args = WorkerArgs {
            device_id: self.device_id.clone(),
            registry: Arc::clone(&self.registry),
            poll_interval: self.config.poll_interval(),
            log_handle: self.log_handle.clone(),
        };
        debug!(device = %self.device_id, "spawning continuous_poll");
        self.poller = Some(tokio::spawn(continuous_poll(args, endpoints)));
        sleep(self.config.startup_delay()).await;

        let limit = self.config.connect_timeout();
        let failure = match timeout(limit, settings_rx).await {
            Ok(Ok(SettingsHandoff::Ready(settings))) => {
                info!(
                    device = %self.device_id,
                    model = %settings.eeprom.model,
                    serial = %settings.eeprom.serial_number,
                    "received spectrometer settings"
                );
                self.settings = Some(*settings);
                return Ok(());
            }
            Ok(Ok(SettingsHandoff::Failed)) => "worker reported connect failure".to_string(),
            Ok(Err(_)) => "worker exited without sending settings".to_string(),
            Err(_) => format!("no settings within {} ms", limit.as_millis()),
        };

        warn!(device = %self.device_id, reason = %failure, "connect failed");
        self.closing = true;
        if self.command_tx.send(WorkerCommand::Poison).is_err() {
            debug!("worker already gone");
        }
        sleep(self.config.connect_failure_grace()).await;
        if let Some(handle) = self.poller.take() {
            self.orphan = Some(handle.abort_handle());
        }
        Err(SpectroError::ConnectFailed(failure))
    }

    /// Stop the worker. Never fails; problems are logged.
    pub async fn disconnect(&mut self) {
        self.closing = true;
        if self.command_tx.send(WorkerCommand::Poison).is_err() {
            debug!(device = %self.device_id, "worker command channel already closed");
        }

        if let Some(mut handle) = self.poller.take() {
            match timeout(self.config.join_timeout(), &mut handle).await {
                Ok(Ok(())) => debug!(device = %self.device_id, "worker joined"),
                Ok(Err(e)) => error!(device = %self.device_id, error = %e, "worker task failed"),
                Err(_) => {
                    warn!(device = %self.device_id, "worker did not exit in time, aborting");
                    handle.abort();
                }
            }
        }

        if let Some(orphan) = self.orphan.take() {
            orphan.abort();
            debug!(device = %self.device_id, "aborted worker left over from failed connect");
        }

        info!(device = %self.device_id, "disconnected");
    }

    /// Queue a setting change for the worker.
    ///
    /// Dropped with a warning while closing.
    pub fn change_setting(&mut self, cmd: ControlObject) -> AppResult<()> {
        if self.closing {
            warn!(setting = cmd.name(), "closing, ignoring setting change");
            return Ok(());
        }
        if self.terminated {
            return Err(SpectroError::WorkerTerminated);
        }
        debug!(setting = cmd.name(), value = %cmd.value, "queueing setting");
        self.command_tx
            .send(WorkerCommand::Setting(cmd))
            .map_err(|_| SpectroError::WorkerTerminated)
    }

    /// Parse and queue a setting change from its text form.
    pub fn set(&mut self, name: &str, raw: &str) -> AppResult<()> {
        let cmd = ControlObject::parse(name, raw)?;
        self.change_setting(cmd)
    }

    /// Pull a reading without blocking.
    ///
    /// `Ok(None)` when nothing is pending or the session is closing.
    /// `Err(WorkerTerminated)` once the worker's final poison has been seen
    /// and nothing is left to return.
    pub fn acquire_data(&mut self, mode: AcquisitionMode) -> AppResult<Option<Reading>> {
        if self.closing {
            debug!("closing, not reading");
            return Ok(None);
        }
        if self.terminated {
            return Err(SpectroError::WorkerTerminated);
        }

        if mode == AcquisitionMode::KeepAll {
            return match self.response_rx.try_recv() {
                Ok(WorkerResponse::Reading(reading)) => Ok(Some(*reading)),
                Err(TryRecvError::Empty) => Ok(None),
                Ok(WorkerResponse::Poison) | Err(TryRecvError::Disconnected) => {
                    self.mark_terminated();
                    Err(SpectroError::WorkerTerminated)
                }
            };
        }

        let mut drained = Vec::new();
        let mut poisoned = false;
        loop {
            match self.response_rx.try_recv() {
                Ok(WorkerResponse::Reading(reading)) => drained.push(*reading),
                Ok(WorkerResponse::Poison) | Err(TryRecvError::Disconnected) => {
                    poisoned = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        if drained.len() > 1 {
            debug!(
                drained = drained.len(),
                discarded = drained.len() - 1,
                %mode,
                "discarding stale readings"
            );
        }
        let selected = select_reading(drained, mode);

        if poisoned {
            self.mark_terminated();
            if selected.is_none() {
                return Err(SpectroError::WorkerTerminated);
            }
        }
        Ok(selected)
    }

    fn mark_terminated(&mut self) {
        if !self.terminated {
            warn!(device = %self.device_id, "worker has terminated");
        }
        self.terminated = true;
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        // a running worker sees the closed command channel and exits on its own
        if let Some(orphan) = self.orphan.take() {
            orphan.abort();
        }
    }
}
