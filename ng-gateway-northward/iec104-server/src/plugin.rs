use crate::{
    codec,
    config::Iec104ServerConfig,
    controller::{SessionController, SouthMonitor, SouthStatus},
    dispatch::{CommandDispatcher, CommandPolicy, ForwarderSlot, SouthForwarder},
    error::{Iec104ServerError, Iec104ServerResult},
    interrogation::InterrogationResponder,
    protocol::frame::{
        asdu::{
            AppLayerParameters, Asdu, AsduBuilder, Cause, CauseOfTransmission, CommonAddr,
            InfoObjAddr, TypeID,
        },
        csys::clock_synchronization_cmd,
        time::Cp56Time2a,
    },
    reading::{DataObject, Reading},
    registry::PointRegistry,
    tracker::CommandTracker,
    transport::{ConnectionEvent, MasterConnection, SlaveTransport},
    types::DataPoint,
};
use arc_swap::ArcSwap;
use bit_struct::*;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything derived from one configuration.
struct Runtime {
    config: Arc<Iec104ServerConfig>,
    params: AppLayerParameters,
    allowed_clients: HashSet<String>,
    registry: Arc<PointRegistry>,
    tracker: Arc<CommandTracker>,
    monitor: Arc<SouthMonitor>,
    dispatcher: CommandDispatcher,
    responder: InterrogationResponder,
    controller: Arc<SessionController>,
}

impl Runtime {
    fn build(
        config: Iec104ServerConfig,
        transport: Arc<dyn SlaveTransport>,
        forwarder: ForwarderSlot,
    ) -> Self {
        let config = Arc::new(config);
        let params = config.app_layer_parameters();
        let registry = Arc::new(PointRegistry::from_definitions(
            config.datapoints.iter().cloned(),
        ));
        let tracker = Arc::new(CommandTracker::new(config.application.cmd_exec_timeout));
        let monitor = Arc::new(SouthMonitor::new(
            config
                .application
                .south_monitoring
                .iter()
                .map(|m| m.asset.clone()),
        ));
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            forwarder.clone(),
            CommandPolicy::from_config(&config.application),
            params,
        );
        let responder = InterrogationResponder::new(Arc::clone(&registry), params);
        let controller = Arc::new(SessionController::new(
            &config,
            transport,
            Arc::clone(&tracker),
            Arc::clone(&monitor),
            forwarder,
        ));
        Self {
            allowed_clients: config.transport.allowed_clients(),
            config,
            params,
            registry,
            tracker,
            monitor,
            dispatcher,
            responder,
            controller,
        }
    }
}

/// Causes pushed to clients as soon as the south side reports them.
fn is_pushed_cause(cause: Cause) -> bool {
    matches!(
        cause,
        Cause::Periodic
            | Cause::Background
            | Cause::Spontaneous
            | Cause::Request
            | Cause::ReturnInfoRemote
            | Cause::ReturnInfoLocal
    )
}

/// IEC 60870-5-104 server (controlled station) north plugin.
///
/// The hosting transport calls the `handle_*` callbacks from its own tasks, the
/// gateway pipeline delivers south data through [`send_readings`](Self::send_readings).
pub struct Iec104ServerPlugin {
    transport: Arc<dyn SlaveTransport>,
    forwarder: ForwarderSlot,
    runtime: ArcSwap<Runtime>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Iec104ServerPlugin {
    pub fn new(config: Iec104ServerConfig, transport: Arc<dyn SlaveTransport>) -> Self {
        let forwarder = ForwarderSlot::default();
        let runtime = Runtime::build(config, Arc::clone(&transport), forwarder.clone());
        info!(
            points = runtime.registry.len(),
            mode = ?runtime.controller.mode(),
            "IEC 104 server plugin configured"
        );
        Self {
            transport,
            forwarder,
            runtime: ArcSwap::from_pointee(runtime),
            task: Mutex::new(None),
        }
    }

    #[inline]
    fn runtime(&self) -> Arc<Runtime> {
        self.runtime.load_full()
    }

    /// Installs the south control function used to forward commands.
    pub fn register_control(&self, forwarder: Arc<dyn SouthForwarder>) {
        self.forwarder.set(forwarder);
        debug!("South control function registered");
    }

    pub fn config(&self) -> Arc<Iec104ServerConfig> {
        Arc::clone(&self.runtime().config)
    }

    pub fn is_started(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Spawns the session controller. Calling it again while running does nothing.
    pub fn start(&self) -> Iec104ServerResult<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Iec104ServerError::Transport {
                reason: "start requires a tokio runtime".to_string(),
            });
        }
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&self.runtime().controller).spawn(cancel.clone());
        *task = Some((cancel, handle));
        info!("IEC 104 server plugin started");
        Ok(())
    }

    /// Stops the controller and the listener. Outstanding commands are dropped unanswered.
    pub async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!("Session controller task failed: {e}");
            }
        }
        if self.transport.is_running() {
            self.transport.stop();
            info!("IEC 104 listener stopped");
        }
        let dropped = self.runtime().tracker.clear();
        if dropped > 0 {
            debug!(dropped, "Outstanding commands discarded");
        }
    }

    /// Replaces the configuration. The point registry is rebuilt from scratch.
    pub async fn reconfigure(&self, config: Iec104ServerConfig) -> Iec104ServerResult<()> {
        let was_started = self.is_started();
        self.stop().await;
        let runtime = Runtime::build(config, Arc::clone(&self.transport), self.forwarder.clone());
        info!(points = runtime.registry.len(), "IEC 104 server plugin reconfigured");
        let old = self.runtime.swap(Arc::new(runtime));
        old.registry.clear();
        if was_started {
            self.start()?;
        }
        Ok(())
    }

    pub fn point(&self, ca: CommonAddr, ioa: InfoObjAddr) -> Option<DataPoint> {
        self.runtime().registry.lookup(ca, ioa)
    }

    pub fn outstanding_commands(&self) -> usize {
        self.runtime().tracker.len()
    }

    pub fn south_status(&self, asset: &str) -> Option<SouthStatus> {
        self.runtime().monitor.status(asset)
    }

    /// Runs one controller step outside the background loop.
    pub fn tick(&self, now_ms: i64) {
        self.runtime().controller.tick(now_ms);
    }

    /// Feeds south readings. Returns how many were consumed.
    pub fn send_readings(&self, readings: &[Reading]) -> usize {
        let rt = self.runtime();
        let mut consumed = 0;
        for reading in readings {
            if let Some(obj) = reading.data_object() {
                match obj {
                    Ok(obj) => {
                        self.apply_data_object(&rt, &obj);
                        consumed += 1;
                    }
                    Err(e) => warn!(asset = %reading.asset_name, "Reading ignored: {e}"),
                }
            } else if let Some(event) = reading.south_event() {
                rt.monitor.update(&reading.asset_name, &event);
                consumed += 1;
            } else {
                debug!(asset = %reading.asset_name, "Reading without data_object or south_event");
            }
        }
        consumed
    }

    fn apply_data_object(&self, rt: &Runtime, obj: &DataObject) {
        let Some(cause) = Cause::from_code(obj.cot) else {
            warn!(ca = obj.ca, ioa = obj.ioa, cot = obj.cot, "Data object with unknown cause");
            return;
        };
        match cause {
            Cause::ActivationCon => {
                rt.tracker
                    .resolve_act_con(obj.type_id, obj.ca, obj.ioa, obj.negative);
            }
            Cause::ActivationTerm => {
                rt.tracker
                    .resolve_act_term(obj.type_id, obj.ca, obj.ioa, obj.negative);
            }
            cause => {
                let Some(point) = rt.registry.lookup_typed(obj.ca, obj.ioa, obj.type_id) else {
                    warn!(
                        type_id = %obj.type_id,
                        ca = obj.ca,
                        ioa = obj.ioa,
                        "Data object for unknown point or mismatched type ignored"
                    );
                    return;
                };
                let value = obj.point_value(point.kind);
                if value.is_none() && obj.value.is_some() {
                    warn!(
                        label = %point.label,
                        ca = obj.ca,
                        ioa = obj.ioa,
                        value = ?obj.value,
                        "Value cannot be represented by the point type"
                    );
                }
                let updated = match rt.registry.update(
                    obj.ca,
                    obj.ioa,
                    obj.type_id,
                    value,
                    obj.quality,
                    obj.timestamp,
                ) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Point update failed: {e}");
                        return;
                    }
                };
                if is_pushed_cause(cause) {
                    self.push(rt, &updated, cause, obj.test);
                }
            }
        }
    }

    fn push(&self, rt: &Runtime, point: &DataPoint, cause: Cause, test: bool) {
        let obj = match codec::encode(point, point.type_id, &rt.params) {
            Ok(obj) => obj,
            Err(e) => {
                warn!(label = %point.label, ca = point.ca, ioa = point.ioa, "Point not sent: {e}");
                return;
            }
        };
        let mut cot = CauseOfTransmission::from_cause(cause);
        cot.test().set(test);
        let mut builder = AsduBuilder::new(point.type_id, cot, 0, point.ca, rt.params);
        if !builder.push(&obj) {
            warn!(label = %point.label, "Point does not fit an asdu");
            return;
        }
        if let Err(e) = self.transport.enqueue_asdu(builder.take()) {
            error!(label = %point.label, ca = point.ca, ioa = point.ioa, "Failed to queue asdu: {e}");
        }
    }

    /// Generic ASDU callback. Returns false for types this plugin does not serve.
    pub fn handle_asdu(&self, conn: &Arc<dyn MasterConnection>, asdu: &Asdu) -> bool {
        match asdu.type_id() {
            TypeID::C_IC_NA_1 => self.handle_interrogation(conn.as_ref(), asdu),
            TypeID::C_CS_NA_1 => self.handle_clock_sync(conn.as_ref(), asdu),
            t if t.is_command() => self.runtime().dispatcher.handle(conn, asdu),
            t => {
                debug!(type_id = %t, "Asdu type not handled");
                false
            }
        }
    }

    pub fn handle_interrogation(&self, conn: &dyn MasterConnection, asdu: &Asdu) -> bool {
        self.runtime().responder.respond(conn, asdu)
    }

    /// Clock synchronisation (C_CS_NA_1). Confirms with the local time when enabled.
    pub fn handle_clock_sync(&self, conn: &dyn MasterConnection, asdu: &Asdu) -> bool {
        let rt = self.runtime();
        let requested = if asdu.cause() == Cause::Activation {
            asdu.get_clock_synchronization_cmd(&rt.params)
                .map_err(|e| warn!("Malformed clock synchronisation: {e}"))
                .ok()
        } else {
            warn!(cause = ?asdu.cause(), "Clock synchronisation with unexpected cause");
            None
        };
        let Some((_, requested)) = requested else {
            let mut resp = asdu.mirror(Cause::UnknownCOT);
            resp.set_negative(true);
            send(conn, resp);
            return true;
        };

        if !rt.config.application.time_sync {
            info!(requested = %requested.datetime(), "Clock synchronisation refused, time_sync disabled");
            if let Err(e) = conn.send_act_con(asdu, true) {
                error!("Failed to answer clock synchronisation: {e}");
            }
            return true;
        }

        info!(requested = %requested.datetime(), peer = %conn.peer(), "Clock synchronisation");
        let mut cot = CauseOfTransmission::from_cause(Cause::ActivationCon);
        cot.test().set(asdu.is_test());
        match clock_synchronization_cmd(
            cot,
            asdu.orig_addr(),
            asdu.common_addr(),
            Cp56Time2a::now(),
            &rt.params,
        ) {
            Ok(resp) => send(conn, resp),
            Err(e) => {
                error!("Failed to build clock synchronisation reply: {e}");
                if let Err(e) = conn.send_act_con(asdu, true) {
                    error!("Failed to answer clock synchronisation: {e}");
                }
            }
        }
        true
    }

    /// Accepts a client when no redundancy group restricts the addresses, or when
    /// `ip` is listed.
    pub fn handle_connection_request(&self, ip: &str) -> bool {
        let rt = self.runtime();
        let accepted = rt.allowed_clients.is_empty() || rt.allowed_clients.contains(ip.trim());
        if accepted {
            debug!(ip, "Connection request accepted");
        } else {
            warn!(ip, "Connection request refused, client not in a redundancy group");
        }
        accepted
    }

    pub fn handle_connection_event(&self, conn: &dyn MasterConnection, event: ConnectionEvent) {
        info!(connection = conn.id(), peer = %conn.peer(), %event, "Connection event");
        if event.ends_data_transfer() {
            self.runtime().tracker.remove_all_for_connection(conn.id());
        }
    }
}

fn send(conn: &dyn MasterConnection, asdu: Asdu) {
    if let Err(e) = conn.send_asdu(asdu) {
        error!(connection = conn.id(), "Failed to send asdu: {e}");
    }
}
