use crate::{
    config::{Iec104ServerConfig, ServerMode},
    dispatch::{ControlDestination, ForwarderSlot},
    reading::SouthEvent,
    tracker::CommandTracker,
    transport::SlaveTransport,
};
use chrono::Utc;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const TICK_PERIOD: Duration = Duration::from_millis(100);

pub const REQUEST_CONNECTION_STATUS: &str = "request_connection_status";

const CONNX_STARTED: &str = "started";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SouthStatus {
    pub connx_status: Option<String>,
    pub gi_status: Option<String>,
}

impl SouthStatus {
    #[inline]
    pub fn is_started(&self) -> bool {
        self.connx_status.as_deref() == Some(CONNX_STARTED)
    }
}

/// Connection status of the monitored south assets.
#[derive(Debug, Default)]
pub struct SouthMonitor {
    assets: Mutex<HashMap<String, SouthStatus>>,
}

impl SouthMonitor {
    pub fn new<I, S>(assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            assets: Mutex::new(
                assets
                    .into_iter()
                    .map(|a| (a.into(), SouthStatus::default()))
                    .collect(),
            ),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.assets.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    /// Applies `event` to `asset`. Returns false for assets that are not monitored.
    pub fn update(&self, asset: &str, event: &SouthEvent) -> bool {
        let mut assets = self.assets.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(status) = assets.get_mut(asset) else {
            debug!(asset, "South event for unmonitored asset ignored");
            return false;
        };
        if let Some(connx) = &event.connx_status {
            if status.connx_status.as_ref() != Some(connx) {
                info!(asset, connx_status = %connx, "South connection status changed");
                status.connx_status = Some(connx.clone());
            }
        }
        if let Some(gi) = &event.gi_status {
            if status.gi_status.as_ref() != Some(gi) {
                info!(asset, gi_status = %gi, "South interrogation status changed");
                status.gi_status = Some(gi.clone());
            }
        }
        true
    }

    pub fn status(&self, asset: &str) -> Option<SouthStatus> {
        self.assets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(asset)
            .cloned()
    }

    pub fn any_started(&self) -> bool {
        self.assets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(SouthStatus::is_started)
    }
}

/// Drives the listener lifecycle and the command timeout sweep.
pub struct SessionController {
    mode: ServerMode,
    transport: Arc<dyn SlaveTransport>,
    tracker: Arc<CommandTracker>,
    monitor: Arc<SouthMonitor>,
    forwarder: ForwarderSlot,
    destination: ControlDestination,
    status_requested: AtomicBool,
}

impl SessionController {
    pub fn new(
        config: &Iec104ServerConfig,
        transport: Arc<dyn SlaveTransport>,
        tracker: Arc<CommandTracker>,
        monitor: Arc<SouthMonitor>,
        forwarder: ForwarderSlot,
    ) -> Self {
        let mut mode = config.transport.mode;
        if mode == ServerMode::AcceptIfSouthConnxStarted && monitor.is_empty() {
            warn!("No south asset monitored, listener will accept connections unconditionally");
            mode = ServerMode::AcceptAlways;
        }
        Self {
            mode,
            transport,
            tracker,
            monitor,
            forwarder,
            destination: ControlDestination::from_config(&config.application.cmd_dest),
            status_requested: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn mode(&self) -> ServerMode {
        self.mode
    }

    fn should_listen(&self) -> bool {
        match self.mode {
            ServerMode::AcceptAlways => true,
            ServerMode::AcceptIfSouthConnxStarted => self.monitor.any_started(),
        }
    }

    /// One controller step.
    pub fn tick(&self, now_ms: i64) {
        self.tracker.sweep_timeouts(now_ms);

        if !self.status_requested.load(Ordering::Acquire) {
            match self
                .forwarder
                .operation(REQUEST_CONNECTION_STATUS, &[], &self.destination)
            {
                Ok(()) => {
                    debug!(destination = %self.destination, "South connection status requested");
                    self.status_requested.store(true, Ordering::Release);
                }
                Err(e) => debug!("South connection status not requested yet: {e}"),
            }
        }

        let listen = self.should_listen();
        let running = self.transport.is_running();
        if listen && !running {
            match self.transport.start() {
                Ok(()) => info!(mode = ?self.mode, "IEC 104 listener started"),
                Err(e) => error!("Failed to start IEC 104 listener: {e}"),
            }
        } else if !listen && running {
            self.transport.stop();
            info!(mode = ?self.mode, "IEC 104 listener stopped, no south connection");
        }
    }

    /// Runs [`tick`](Self::tick) every [`TICK_PERIOD`] until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_PERIOD);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => self.tick(Utc::now().timestamp_millis()),
                }
            }
            debug!("Session controller exited");
        })
    }
}
