#![allow(dead_code)]

use ng_plugin_iec104_server::{
    protocol::frame::{
        asdu::{AppLayerParameters, Asdu, Cause, CauseOfTransmission, CommonAddr, InfoObjAddr, TypeID},
        cproc::{command, CommandInfo},
        csys::{clock_synchronization_cmd, interrogation_cmd},
        time::Cp56Time2a,
    },
    reading::{DATA_OBJECT, SOUTH_EVENT},
    ConnectionId, ControlDestination, Iec104ServerConfig, Iec104ServerError,
    Iec104ServerResult, MasterConnection, Reading, ReadingField, ReadingValue, SlaveTransport,
    SouthForwarder,
};
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex, Once,
};
use tracing::Level;

/// Lock a `Mutex<T>` without panicking.
fn lock_unpoisoned<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("test mutex poisoned; recovering inner value");
            poisoned.into_inner()
        }
    }
}

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .try_init();
    });
}

/// A client connection that records every ASDU sent to it.
#[derive(Debug, Default)]
pub struct CapturingConnection {
    pub id: ConnectionId,
    sent: Mutex<Vec<Asdu>>,
}

impl CapturingConnection {
    pub fn new(id: ConnectionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<Asdu> {
        lock_unpoisoned(&self.sent).clone()
    }

    /// (type id, cause, negative) of every ASDU sent so far.
    pub fn summary(&self) -> Vec<(TypeID, Cause, bool)> {
        self.sent()
            .iter()
            .map(|a| (a.type_id(), a.cause(), a.is_negative()))
            .collect()
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.sent).clear();
    }
}

impl MasterConnection for CapturingConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer(&self) -> String {
        format!("192.168.2.{}", self.id)
    }

    fn send_asdu(&self, asdu: Asdu) -> Iec104ServerResult<()> {
        lock_unpoisoned(&self.sent).push(asdu);
        Ok(())
    }
}

/// Listener stand-in that records lifecycle calls and queued ASDUs.
#[derive(Debug, Default)]
pub struct FakeTransport {
    running: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    enqueued: Mutex<Vec<Asdu>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enqueued(&self) -> Vec<Asdu> {
        lock_unpoisoned(&self.enqueued).clone()
    }
}

impl SlaveTransport for FakeTransport {
    fn start(&self) -> Iec104ServerResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn enqueue_asdu(&self, asdu: Asdu) -> Iec104ServerResult<()> {
        lock_unpoisoned(&self.enqueued).push(asdu);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedOperation {
    pub name: String,
    pub params: Vec<(String, String)>,
    pub destination: ControlDestination,
}

impl ForwardedOperation {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// South control function that records every operation.
#[derive(Debug, Default)]
pub struct CapturingForwarder {
    pub fail: bool,
    calls: Mutex<Vec<ForwardedOperation>>,
}

impl CapturingForwarder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<ForwardedOperation> {
        lock_unpoisoned(&self.calls).clone()
    }

    /// Forwarded commands, status requests left out.
    pub fn commands(&self) -> Vec<ForwardedOperation> {
        self.calls()
            .into_iter()
            .filter(|c| c.name != "request_connection_status")
            .collect()
    }
}

impl SouthForwarder for CapturingForwarder {
    fn operation(
        &self,
        name: &str,
        params: &[(String, String)],
        destination: &ControlDestination,
    ) -> Iec104ServerResult<()> {
        if self.fail {
            return Err(Iec104ServerError::Forwarding {
                operation: name.to_string(),
                reason: "south service unavailable".to_string(),
            });
        }
        lock_unpoisoned(&self.calls).push(ForwardedOperation {
            name: name.to_string(),
            params: params.to_vec(),
            destination: destination.clone(),
        });
        Ok(())
    }
}

/// Merges `overrides` into `base`, one level deep.
fn merged(mut base: Value, overrides: Value) -> Value {
    if let (Some(base), Value::Object(overrides)) = (base.as_object_mut(), overrides) {
        for (k, v) in overrides {
            base.insert(k, v);
        }
    }
    base
}

pub fn protocol_stack_json(transport: Value, application: Value) -> String {
    let transport = merged(
        json!({
            "redundancy_groups": [],
            "srv_ip": "0.0.0.0",
            "port": 2404,
            "k_value": 12,
            "w_value": 8,
            "tls": false,
            "mode": "accept_always"
        }),
        transport,
    );
    let application = merged(
        json!({
            "ca_asdu_size": 2,
            "ioaddr_size": 3,
            "asdu_size": 0,
            "time_sync": false,
            "cmd_exec_timeout": 20,
            "cmd_recv_timeout": 60,
            "accept_cmd_with_time": 2,
            "filter_orig": false,
            "filter_list": [],
            "cmd_dest": "iec104south"
        }),
        application,
    );
    json!({
        "protocol_stack": {
            "name": "iec104server",
            "version": "1.0",
            "transport_layer": transport,
            "application_layer": application
        }
    })
    .to_string()
}

/// (label, "CA-IOA", typeid, gi_groups)
pub type PointDef<'a> = (&'a str, &'a str, &'a str, &'a str);

pub fn exchanged_data_json(points: &[PointDef<'_>]) -> String {
    let datapoints: Vec<Value> = points
        .iter()
        .map(|(label, address, typeid, groups)| {
            json!({
                "label": label,
                "protocols": [
                    { "name": "iec104", "address": address, "typeid": typeid, "gi_groups": groups }
                ]
            })
        })
        .collect();
    json!({
        "exchanged_data": { "name": "iec104server", "version": "1.0", "datapoints": datapoints }
    })
    .to_string()
}

pub const STANDARD_POINTS: &[PointDef<'static>] = &[
    ("TS1", "45-672", "M_SP_NA_1", "station"),
    ("TS2", "45-673", "M_SP_NA_1", "station 1"),
    ("TM1", "45-984", "M_ME_NA_1", "station"),
    ("TS4", "45-700", "M_SP_TB_1", "2"),
    ("C1", "45-2000", "C_SC_NA_1", "station"),
    ("C2", "45-2001", "C_DC_TA_1", "station"),
    ("C3", "45-2002", "C_SE_NC_1", "station"),
    ("TD1", "12-1", "M_DP_NA_1", "station"),
];

pub fn build_config(
    transport: Value,
    application: Value,
    points: &[PointDef<'_>],
) -> anyhow::Result<Iec104ServerConfig> {
    Ok(Iec104ServerConfig::from_documents(
        &protocol_stack_json(transport, application),
        &exchanged_data_json(points),
        None,
    )?)
}

pub fn standard_config() -> anyhow::Result<Iec104ServerConfig> {
    build_config(json!({}), json!({}), STANDARD_POINTS)
}

pub fn params() -> AppLayerParameters {
    AppLayerParameters::default()
}

pub fn activation() -> CauseOfTransmission {
    CauseOfTransmission::from_cause(Cause::Activation)
}

pub fn command_asdu(
    type_id: TypeID,
    orig: u8,
    ca: CommonAddr,
    cmd: &CommandInfo,
) -> anyhow::Result<Asdu> {
    Ok(command(type_id, activation(), orig, ca, cmd, &params())?)
}

pub fn interrogation(ca: CommonAddr, qoi: u8) -> anyhow::Result<Asdu> {
    Ok(interrogation_cmd(activation(), 0, ca, qoi, &params())?)
}

pub fn clock_sync(ca: CommonAddr, time: Cp56Time2a) -> anyhow::Result<Asdu> {
    Ok(clock_synchronization_cmd(activation(), 0, ca, time, &params())?)
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn int(v: i64) -> ReadingValue {
    ReadingValue::Integer(v)
}

/// A `data_object` reading.
pub fn data_object(
    type_id: &str,
    ca: CommonAddr,
    ioa: InfoObjAddr,
    cot: u8,
    value: Option<ReadingValue>,
    extra: Vec<(&str, ReadingValue)>,
) -> Reading {
    let mut fields = vec![
        ReadingField::new("do_type", ReadingValue::Str(type_id.to_string())),
        ReadingField::new("do_ca", int(ca as i64)),
        ReadingField::new("do_ioa", int(ioa as i64)),
        ReadingField::new("do_cot", int(cot as i64)),
    ];
    if let Some(value) = value {
        fields.push(ReadingField::new("do_value", value));
    }
    for (name, value) in extra {
        fields.push(ReadingField::new(name, value));
    }
    Reading::new(
        format!("{ca}-{ioa}"),
        vec![ReadingField::new(DATA_OBJECT, ReadingValue::Object(fields))],
    )
}

/// South side acknowledgement of a command.
pub fn command_ack(type_id: &str, ca: CommonAddr, ioa: InfoObjAddr, cot: u8, negative: bool) -> Reading {
    data_object(
        type_id,
        ca,
        ioa,
        cot,
        None,
        vec![("do_negative", int(negative as i64))],
    )
}

pub fn south_event(asset: &str, connx_status: &str) -> Reading {
    Reading::new(
        asset,
        vec![ReadingField::new(
            SOUTH_EVENT,
            ReadingValue::Object(vec![ReadingField::new(
                "connx_status",
                ReadingValue::Str(connx_status.to_string()),
            )]),
        )],
    )
}

pub fn as_dyn(conn: &Arc<CapturingConnection>) -> Arc<dyn MasterConnection> {
    conn.clone()
}
