use crate::{
    config::{ApplicationLayerConfig, CommandTimePolicy},
    error::{Iec104ServerError, Iec104ServerResult},
    protocol::frame::{
        asdu::{AppLayerParameters, Asdu, Cause, TypeID},
        cproc::CommandInfo,
        time::Cp56Time2a,
    },
    registry::PointRegistry,
    tracker::CommandTracker,
    transport::MasterConnection,
};
use arc_swap::ArcSwapOption;
use bit_struct::*;
use chrono::Utc;
use std::{
    collections::HashSet,
    fmt,
    sync::Arc,
};
use tracing::{debug, error, warn};

/// Where forwarded operations go on the south side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlDestination {
    Broadcast,
    Service(String),
}

impl ControlDestination {
    /// An empty `cmd_dest` means every south service.
    pub fn from_config(dest: &str) -> Self {
        let dest = dest.trim();
        if dest.is_empty() {
            ControlDestination::Broadcast
        } else {
            ControlDestination::Service(dest.to_string())
        }
    }
}

impl fmt::Display for ControlDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlDestination::Broadcast => f.write_str("broadcast"),
            ControlDestination::Service(s) => f.write_str(s),
        }
    }
}

/// Control entry point of the south side.
pub trait SouthForwarder: Send + Sync {
    fn operation(
        &self,
        name: &str,
        params: &[(String, String)],
        destination: &ControlDestination,
    ) -> Iec104ServerResult<()>;
}

struct RegisteredForwarder(Arc<dyn SouthForwarder>);

/// Forwarder installed by the host, shared by the dispatcher and the session controller.
#[derive(Clone, Default)]
pub struct ForwarderSlot(Arc<ArcSwapOption<RegisteredForwarder>>);

impl ForwarderSlot {
    /// Replaces any previously registered forwarder.
    pub fn set(&self, forwarder: Arc<dyn SouthForwarder>) {
        self.0.store(Some(Arc::new(RegisteredForwarder(forwarder))));
    }

    pub fn get(&self) -> Option<Arc<dyn SouthForwarder>> {
        self.0.load_full().map(|f| Arc::clone(&f.0))
    }

    pub fn operation(
        &self,
        name: &str,
        params: &[(String, String)],
        destination: &ControlDestination,
    ) -> Iec104ServerResult<()> {
        let forwarder = self.get().ok_or_else(|| Iec104ServerError::Forwarding {
            operation: name.to_string(),
            reason: "no control function registered".to_string(),
        })?;
        forwarder.operation(name, params, destination)
    }
}

/// Acceptance rules for incoming commands.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    pub filter_orig: bool,
    pub allowed_originators: HashSet<u8>,
    pub time_policy: CommandTimePolicy,
    /// 0 disables the check
    pub recv_timeout_ms: i64,
    pub destination: ControlDestination,
}

impl CommandPolicy {
    pub fn from_config(app: &ApplicationLayerConfig) -> Self {
        Self {
            filter_orig: app.filter_orig,
            allowed_originators: app.allowed_originators(),
            time_policy: app.accept_cmd_with_time,
            recv_timeout_ms: (app.cmd_recv_timeout as i64).saturating_mul(1000),
            destination: ControlDestination::from_config(&app.cmd_dest),
        }
    }

    fn originator_allowed(&self, orig: u8) -> bool {
        !self.filter_orig || self.allowed_originators.contains(&orig)
    }

    fn time_in_window(&self, time: &Cp56Time2a, now_ms: i64) -> bool {
        self.recv_timeout_ms == 0 || (now_ms - time.timestamp_ms).abs() <= self.recv_timeout_ms
    }
}

/// South side operation name for a command type.
pub fn operation_name(type_id: TypeID) -> Option<&'static str> {
    Some(match type_id {
        TypeID::C_SC_NA_1 => "SingleCommand",
        TypeID::C_SC_TA_1 => "SingleCommandWithCP56Time2a",
        TypeID::C_DC_NA_1 => "DoubleCommand",
        TypeID::C_DC_TA_1 => "DoubleCommandWithCP56Time2a",
        TypeID::C_RC_NA_1 => "StepCommand",
        TypeID::C_RC_TA_1 => "StepCommandWithCP56Time2a",
        TypeID::C_SE_NA_1 => "SetpointNormalized",
        TypeID::C_SE_TA_1 => "SetpointNormalizedWithCP56Time2a",
        TypeID::C_SE_NB_1 => "SetpointScaled",
        TypeID::C_SE_TB_1 => "SetpointScaledWithCP56Time2a",
        TypeID::C_SE_NC_1 => "SetpointShort",
        TypeID::C_SE_TC_1 => "SetpointShortWithCP56Time2a",
        _ => return None,
    })
}

fn command_value(cmd: &CommandInfo) -> String {
    match cmd.clone() {
        CommandInfo::Single(mut c) => (c.sco.scs().get() as u8).to_string(),
        CommandInfo::Double(mut c) => c.dco.dcs().get().value().to_string(),
        CommandInfo::Step(mut c) => c.rco.rcs().get().value().to_string(),
        CommandInfo::SetPointNormal(c) => c.value().to_string(),
        CommandInfo::SetPointScaled(c) => c.sva.to_string(),
        CommandInfo::SetPointFloat(c) => c.r.to_string(),
    }
}

/// Validates command ASDUs and forwards accepted ones to the south side.
pub struct CommandDispatcher {
    registry: Arc<PointRegistry>,
    tracker: Arc<CommandTracker>,
    forwarder: ForwarderSlot,
    policy: CommandPolicy,
    params: AppLayerParameters,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<PointRegistry>,
        tracker: Arc<CommandTracker>,
        forwarder: ForwarderSlot,
        policy: CommandPolicy,
        params: AppLayerParameters,
    ) -> Self {
        Self {
            registry,
            tracker,
            forwarder,
            policy,
            params,
        }
    }

    /// Returns false when `asdu` is not a supported command type, true otherwise,
    /// whether or not the command was accepted.
    pub fn handle(&self, conn: &Arc<dyn MasterConnection>, asdu: &Asdu) -> bool {
        self.handle_at(conn, asdu, Utc::now().timestamp_millis())
    }

    pub fn handle_at(&self, conn: &Arc<dyn MasterConnection>, asdu: &Asdu, now_ms: i64) -> bool {
        let type_id = asdu.type_id();
        let Some(operation) = operation_name(type_id) else {
            return false;
        };
        let ca = asdu.common_addr();

        if asdu.cause() != Cause::Activation {
            warn!(%type_id, ca, cause = ?asdu.cause(), "Command rejected: cause is not activation");
            reject(conn.as_ref(), asdu, Cause::UnknownCOT);
            return true;
        }

        if !self.registry.has_ca(ca) {
            warn!(%type_id, ca, "Command rejected: unknown common address");
            reject(conn.as_ref(), asdu, Cause::UnknownCA);
            return true;
        }

        let orig = asdu.orig_addr();
        if !self.policy.originator_allowed(orig) {
            warn!(%type_id, ca, orig, peer = %conn.peer(), "Command dropped: originator not allowed");
            return true;
        }

        let cmd = match asdu.get_command(&self.params) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(%type_id, ca, "Command rejected: malformed information object: {e}");
                reject(conn.as_ref(), asdu, Cause::ActivationCon);
                return true;
            }
        };
        let ioa = cmd.ioa();

        let Some(point) = self.registry.lookup(ca, ioa) else {
            warn!(%type_id, ca, ioa, "Command rejected: unknown object address");
            reject(conn.as_ref(), asdu, Cause::UnknownIOA);
            return true;
        };

        if !point.is_command || !point.accepts(type_id) {
            warn!(
                %type_id,
                ca,
                ioa,
                configured = %point.type_id,
                "Command rejected: type does not match the point"
            );
            reject(conn.as_ref(), asdu, Cause::UnknownTypeID);
            return true;
        }

        let with_time = type_id.needs_time();
        if !self.policy.time_policy.allows(with_time) {
            warn!(%type_id, ca, ioa, with_time, "Command rejected by time tag policy");
            reject(conn.as_ref(), asdu, Cause::ActivationCon);
            return true;
        }
        if let Some(time) = cmd.time().filter(|_| with_time) {
            if !self.policy.time_in_window(&time, now_ms) {
                warn!(
                    %type_id,
                    ca,
                    ioa,
                    command_time = %time.datetime(),
                    "Command rejected: time tag outside the receive window"
                );
                reject(conn.as_ref(), asdu, Cause::ActivationCon);
                return true;
            }
        }

        let is_select = cmd.is_select();
        let confirmation = asdu.mirror(Cause::ActivationCon);
        let handle = self
            .tracker
            .register_at(&confirmation, ioa, Arc::clone(conn), is_select, now_ms);

        let params = vec![
            ("ca".to_string(), ca.to_string()),
            ("ioa".to_string(), ioa.to_string()),
            ("value".to_string(), command_value(&cmd)),
            ("se".to_string(), (is_select as u8).to_string()),
        ];
        match self
            .forwarder
            .operation(operation, &params, &self.policy.destination)
        {
            Ok(()) => {
                debug!(%type_id, ca, ioa, operation, is_select, "Command forwarded");
            }
            Err(e) => {
                error!(%type_id, ca, ioa, operation, "Command forwarding failed: {e}");
                self.tracker.remove(handle);
                reject(conn.as_ref(), asdu, Cause::ActivationCon);
            }
        }
        true
    }
}

/// Answers `asdu` negatively with `cause`.
fn reject(conn: &dyn MasterConnection, asdu: &Asdu, cause: Cause) {
    let mut resp = asdu.mirror(cause);
    resp.set_negative(true);
    if let Err(e) = conn.send_asdu(resp) {
        error!(connection = conn.id(), "Failed to reject command: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_names() {
        assert_eq!(operation_name(TypeID::C_SC_NA_1), Some("SingleCommand"));
        assert_eq!(
            operation_name(TypeID::C_SE_TC_1),
            Some("SetpointShortWithCP56Time2a")
        );
        assert_eq!(operation_name(TypeID::C_BO_NA_1), None);
        assert_eq!(operation_name(TypeID::M_SP_NA_1), None);
    }

    #[test]
    fn destination_from_config() {
        assert_eq!(ControlDestination::from_config(" "), ControlDestination::Broadcast);
        assert_eq!(
            ControlDestination::from_config("iec104south"),
            ControlDestination::Service("iec104south".to_string())
        );
    }

    #[test]
    fn receive_window_is_symmetric() {
        let policy = CommandPolicy::from_config(&ApplicationLayerConfig {
            cmd_recv_timeout: 10,
            ..Default::default()
        });
        let now = 1_700_000_000_000;
        assert!(policy.time_in_window(&Cp56Time2a::from_millis(now - 10_000), now));
        assert!(policy.time_in_window(&Cp56Time2a::from_millis(now + 10_000), now));
        assert!(!policy.time_in_window(&Cp56Time2a::from_millis(now - 10_001), now));
        assert!(!policy.time_in_window(&Cp56Time2a::from_millis(now + 10_001), now));

        let unchecked = CommandPolicy::from_config(&ApplicationLayerConfig {
            cmd_recv_timeout: 0,
            ..Default::default()
        });
        assert!(unchecked.time_in_window(&Cp56Time2a::from_millis(0), now));
    }

    struct Counting(std::sync::atomic::AtomicUsize);

    impl SouthForwarder for Counting {
        fn operation(
            &self,
            _name: &str,
            _params: &[(String, String)],
            _destination: &ControlDestination,
        ) -> Iec104ServerResult<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn forwarder_slot_is_shared_and_replaceable() {
        let slot = ForwarderSlot::default();
        let shared = slot.clone();
        assert!(matches!(
            shared.operation("SingleCommand", &[], &ControlDestination::Broadcast),
            Err(Iec104ServerError::Forwarding { .. })
        ));

        let first = Arc::new(Counting(Default::default()));
        let second = Arc::new(Counting(Default::default()));
        slot.set(first.clone());
        assert!(shared
            .operation("SingleCommand", &[], &ControlDestination::Broadcast)
            .is_ok());
        slot.set(second.clone());
        assert!(shared
            .operation("SingleCommand", &[], &ControlDestination::Broadcast)
            .is_ok());

        let calls = |c: &Counting| c.0.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(calls(&first), 1);
        assert_eq!(calls(&second), 1);
    }

    #[test]
    fn originator_filter() {
        let mut app = ApplicationLayerConfig::default();
        assert!(CommandPolicy::from_config(&app).originator_allowed(5));
        app.filter_orig = true;
        app.filter_list = (0..3)
            .map(|orig_addr| crate::config::OriginatorFilter { orig_addr })
            .collect();
        let policy = CommandPolicy::from_config(&app);
        assert!(policy.originator_allowed(2));
        assert!(!policy.originator_allowed(5));
    }
}
