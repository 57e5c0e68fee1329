use crate::{
    error::{Iec104ServerError, Iec104ServerResult},
    protocol::frame::{
        asdu::{AppLayerParameters, CommonAddr, InfoObjAddr, TypeID, ASDU_SIZE_MAX},
        time::CP56TIME2A_SIZE,
    },
    types::{DataPoint, GiGroups},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{collections::HashSet, str::FromStr};
use tracing::{error, warn};

/// Largest information element exchanged, M_ME_TF_1 and C_SE_TC_1, address excluded.
const LARGEST_ELEMENT_SIZE: usize = 5 + CP56TIME2A_SIZE;

/// When the listener is allowed to accept clients.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    #[default]
    AcceptAlways,
    /// Listen only while a monitored south asset reports `connx_status = started`.
    AcceptIfSouthConnxStarted,
}

/// Which command flavours are accepted.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum CommandTimePolicy {
    WithoutTime = 0,
    WithTime = 1,
    #[default]
    Both = 2,
}

impl CommandTimePolicy {
    pub fn allows(&self, with_time: bool) -> bool {
        match self {
            CommandTimePolicy::WithoutTime => !with_time,
            CommandTimePolicy::WithTime => with_time,
            CommandTimePolicy::Both => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyConnection {
    #[serde(default)]
    pub clt_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyGroupConfig {
    #[serde(default)]
    pub rg_name: String,
    #[serde(default)]
    pub connections: Vec<RedundancyConnection>,
}

/// `protocol_stack.transport_layer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportLayerConfig {
    #[serde(default)]
    pub redundancy_groups: Vec<RedundancyGroupConfig>,

    /// Address to bind when `bind_on_ip` is set
    #[serde(default = "TransportLayerConfig::default_srv_ip")]
    pub srv_ip: String,

    #[serde(default = "TransportLayerConfig::default_port")]
    pub port: u16,

    #[serde(default)]
    pub bind_on_ip: bool,

    /// Max unacknowledged I-frames sent
    #[serde(default = "TransportLayerConfig::default_k")]
    pub k_value: u16,

    /// Latest acknowledge after receiving w I-frames
    #[serde(default = "TransportLayerConfig::default_w")]
    pub w_value: u16,

    /// Timeouts in seconds
    #[serde(default = "TransportLayerConfig::default_t0")]
    pub t0_timeout: u32,
    #[serde(default = "TransportLayerConfig::default_t1")]
    pub t1_timeout: u32,
    #[serde(default = "TransportLayerConfig::default_t2")]
    pub t2_timeout: u32,
    #[serde(default = "TransportLayerConfig::default_t3")]
    pub t3_timeout: u32,

    #[serde(default)]
    pub tls: bool,

    #[serde(default)]
    pub mode: ServerMode,
}

impl TransportLayerConfig {
    fn default_srv_ip() -> String {
        "0.0.0.0".to_string()
    }
    fn default_port() -> u16 {
        2404
    }
    fn default_k() -> u16 {
        12
    }
    fn default_w() -> u16 {
        8
    }
    fn default_t0() -> u32 {
        10
    }
    fn default_t1() -> u32 {
        15
    }
    fn default_t2() -> u32 {
        10
    }
    fn default_t3() -> u32 {
        20
    }

    fn sanitize(&mut self) {
        if self.port == 0 {
            warn!("transport_layer.port 0 is invalid, using {}", Self::default_port());
            self.port = Self::default_port();
        }
        if self.k_value == 0 || self.k_value > 32767 {
            warn!(k = self.k_value, "transport_layer.k_value out of range, using default");
            self.k_value = Self::default_k();
        }
        if self.w_value == 0 || self.w_value > self.k_value {
            warn!(
                w = self.w_value,
                k = self.k_value,
                "transport_layer.w_value must be in 1..=k_value, using default"
            );
            self.w_value = Self::default_w().min(self.k_value);
        }
        for (name, value, default) in [
            ("t0_timeout", &mut self.t0_timeout, Self::default_t0()),
            ("t1_timeout", &mut self.t1_timeout, Self::default_t1()),
            ("t2_timeout", &mut self.t2_timeout, Self::default_t2()),
            ("t3_timeout", &mut self.t3_timeout, Self::default_t3()),
        ] {
            if *value == 0 {
                warn!("transport_layer.{name} must be positive, using {default}");
                *value = default;
            }
        }
        if self.t2_timeout >= self.t1_timeout {
            warn!(
                t1 = self.t1_timeout,
                t2 = self.t2_timeout,
                "transport_layer.t2_timeout should be lower than t1_timeout"
            );
        }
    }

    /// Client addresses allowed by the redundancy groups. Empty means any client.
    pub fn allowed_clients(&self) -> HashSet<String> {
        self.redundancy_groups
            .iter()
            .flat_map(|rg| rg.connections.iter())
            .map(|c| c.clt_ip.trim().to_string())
            .filter(|ip| !ip.is_empty())
            .collect()
    }
}

impl Default for TransportLayerConfig {
    fn default() -> Self {
        Self {
            redundancy_groups: Vec::new(),
            srv_ip: Self::default_srv_ip(),
            port: Self::default_port(),
            bind_on_ip: false,
            k_value: Self::default_k(),
            w_value: Self::default_w(),
            t0_timeout: Self::default_t0(),
            t1_timeout: Self::default_t1(),
            t2_timeout: Self::default_t2(),
            t3_timeout: Self::default_t3(),
            tls: false,
            mode: ServerMode::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginatorFilter {
    pub orig_addr: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SouthMonitoringConfig {
    pub asset: String,
}

/// `protocol_stack.application_layer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationLayerConfig {
    /// Octets of the common address (1 or 2)
    #[serde(default = "ApplicationLayerConfig::default_ca_size")]
    pub ca_asdu_size: usize,

    /// Octets of the information object address (1 to 3)
    #[serde(default = "ApplicationLayerConfig::default_ioa_size")]
    pub ioaddr_size: usize,

    /// Max ASDU size, 0 means protocol maximum
    #[serde(default)]
    pub asdu_size: usize,

    /// Accept clock synchronisation from clients
    #[serde(default)]
    pub time_sync: bool,

    /// Seconds a forwarded command may wait for its south-side acknowledgement
    #[serde(default = "ApplicationLayerConfig::default_cmd_exec_timeout")]
    pub cmd_exec_timeout: u64,

    /// Max age in seconds of a time tagged command, 0 disables the check
    #[serde(default = "ApplicationLayerConfig::default_cmd_recv_timeout")]
    pub cmd_recv_timeout: u64,

    #[serde(default)]
    pub accept_cmd_with_time: CommandTimePolicy,

    #[serde(default)]
    pub filter_orig: bool,

    #[serde(default)]
    pub filter_list: Vec<OriginatorFilter>,

    /// South service receiving commands, empty for broadcast
    #[serde(default)]
    pub cmd_dest: String,

    #[serde(default = "ApplicationLayerConfig::default_asdu_queue_size")]
    pub asdu_queue_size: usize,

    #[serde(default)]
    pub south_monitoring: Vec<SouthMonitoringConfig>,
}

impl ApplicationLayerConfig {
    fn default_ca_size() -> usize {
        2
    }
    fn default_ioa_size() -> usize {
        3
    }
    fn default_cmd_exec_timeout() -> u64 {
        20
    }
    fn default_cmd_recv_timeout() -> u64 {
        60
    }
    fn default_asdu_queue_size() -> usize {
        100
    }

    fn sanitize(&mut self) {
        if !(1..=2).contains(&self.ca_asdu_size) {
            warn!(
                value = self.ca_asdu_size,
                "application_layer.ca_asdu_size must be 1 or 2, using default"
            );
            self.ca_asdu_size = Self::default_ca_size();
        }
        if !(1..=3).contains(&self.ioaddr_size) {
            warn!(
                value = self.ioaddr_size,
                "application_layer.ioaddr_size must be in 1..=3, using default"
            );
            self.ioaddr_size = Self::default_ioa_size();
        }
        if self.asdu_size != 0
            && (self.asdu_size > ASDU_SIZE_MAX
                || self.app_layer_parameters().max_info_objects(LARGEST_ELEMENT_SIZE) == 0)
        {
            warn!(
                value = self.asdu_size,
                min = self.min_asdu_size(),
                "application_layer.asdu_size out of range, using protocol maximum"
            );
            self.asdu_size = 0;
        }
        if self.cmd_exec_timeout == 0 {
            warn!("application_layer.cmd_exec_timeout must be positive, using default");
            self.cmd_exec_timeout = Self::default_cmd_exec_timeout();
        }
        if self.asdu_queue_size == 0 {
            warn!("application_layer.asdu_queue_size must be positive, using default");
            self.asdu_queue_size = Self::default_asdu_queue_size();
        }
    }

    /// Smallest ASDU still holding one object of every exchanged type.
    pub fn min_asdu_size(&self) -> usize {
        4 + self.ca_asdu_size + self.ioaddr_size + LARGEST_ELEMENT_SIZE
    }

    pub fn app_layer_parameters(&self) -> AppLayerParameters {
        AppLayerParameters {
            size_of_ca: self.ca_asdu_size,
            size_of_ioa: self.ioaddr_size,
            max_size_of_asdu: if self.asdu_size == 0 {
                ASDU_SIZE_MAX
            } else {
                self.asdu_size
            },
        }
    }

    pub fn allowed_originators(&self) -> HashSet<u8> {
        self.filter_list.iter().map(|f| f.orig_addr).collect()
    }
}

impl Default for ApplicationLayerConfig {
    fn default() -> Self {
        Self {
            ca_asdu_size: Self::default_ca_size(),
            ioaddr_size: Self::default_ioa_size(),
            asdu_size: 0,
            time_sync: false,
            cmd_exec_timeout: Self::default_cmd_exec_timeout(),
            cmd_recv_timeout: Self::default_cmd_recv_timeout(),
            accept_cmd_with_time: CommandTimePolicy::default(),
            filter_orig: false,
            filter_list: Vec::new(),
            cmd_dest: String::new(),
            asdu_queue_size: Self::default_asdu_queue_size(),
            south_monitoring: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertFile {
    pub cert_file: String,
}

/// `tls_conf`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub own_cert: String,
    #[serde(default)]
    pub ca_certs: Vec<CertFile>,
    #[serde(default)]
    pub remote_certs: Vec<CertFile>,
}

impl TlsConfig {
    pub fn is_usable(&self) -> bool {
        !self.private_key.trim().is_empty() && !self.own_cert.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ProtocolDefinition {
    #[serde(default)]
    name: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    typeid: String,
    #[serde(default)]
    gi_groups: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DatapointDefinition {
    #[serde(default)]
    label: String,
    #[serde(default)]
    protocols: Vec<ProtocolDefinition>,
}

pub const PROTOCOL_NAME: &str = "iec104";

/// Full plugin configuration, assembled from the protocol stack, exchanged data
/// and TLS documents.
#[derive(Debug, Clone, Default)]
pub struct Iec104ServerConfig {
    pub transport: TransportLayerConfig,
    pub application: ApplicationLayerConfig,
    pub tls: TlsConfig,
    pub datapoints: Vec<DataPoint>,
}

impl Iec104ServerConfig {
    /// Imports all documents. The protocol stack goes first as it fixes the address widths
    /// used to validate the exchanged data.
    pub fn from_documents(
        protocol_stack: &str,
        exchanged_data: &str,
        tls: Option<&str>,
    ) -> Iec104ServerResult<Self> {
        let mut config = Iec104ServerConfig::default();
        config.import_protocol_config(protocol_stack)?;
        config.import_exchange_config(exchanged_data)?;
        if let Some(tls) = tls {
            config.import_tls_config(tls)?;
        }
        config.check_tls();
        Ok(config)
    }

    #[inline]
    pub fn app_layer_parameters(&self) -> AppLayerParameters {
        self.application.app_layer_parameters()
    }

    pub fn import_protocol_config(&mut self, json: &str) -> Iec104ServerResult<()> {
        let doc = parse_document(json)?;
        let Some(stack) = doc.get("protocol_stack") else {
            warn!("'protocol_stack' is missing, using defaults");
            self.transport = TransportLayerConfig::default();
            self.application = ApplicationLayerConfig::default();
            return Ok(());
        };

        self.transport = section_or_default(stack, "transport_layer");
        self.transport.sanitize();
        self.application = section_or_default(stack, "application_layer");
        self.application.sanitize();
        Ok(())
    }

    pub fn import_tls_config(&mut self, json: &str) -> Iec104ServerResult<()> {
        let doc = parse_document(json)?;
        self.tls = match doc.get("tls_conf") {
            Some(section) => lenient(section, "tls_conf"),
            None => {
                warn!("'tls_conf' is missing, using defaults");
                TlsConfig::default()
            }
        };
        Ok(())
    }

    fn check_tls(&mut self) {
        if self.transport.tls && !self.tls.is_usable() {
            error!("TLS enabled but private_key/own_cert are not configured, TLS disabled");
            self.transport.tls = false;
        }
    }

    pub fn import_exchange_config(&mut self, json: &str) -> Iec104ServerResult<()> {
        let doc = parse_document(json)?;
        let datapoints = doc
            .get("exchanged_data")
            .and_then(|d| d.get("datapoints"))
            .and_then(Value::as_array);
        let Some(datapoints) = datapoints else {
            warn!("'exchanged_data.datapoints' is missing, no point exchanged");
            self.datapoints.clear();
            return Ok(());
        };

        let params = self.app_layer_parameters();
        let mut seen = HashSet::new();
        let mut points = Vec::with_capacity(datapoints.len());
        for (index, raw) in datapoints.iter().enumerate() {
            let def: DatapointDefinition = match serde_json::from_value(raw.clone()) {
                Ok(d) => d,
                Err(e) => {
                    warn!(index, error = %e, "Skipping malformed datapoint");
                    continue;
                }
            };
            let Some(point) = build_point(&def, &params) else {
                continue;
            };
            if !seen.insert((point.ca, point.ioa)) {
                warn!(
                    label = %point.label,
                    ca = point.ca,
                    ioa = point.ioa,
                    "Duplicate address, keeping first definition"
                );
                continue;
            }
            points.push(point);
        }
        self.datapoints = points;
        Ok(())
    }
}

fn parse_document(json: &str) -> Iec104ServerResult<Value> {
    serde_json::from_str::<Value>(json).map_err(|e| Iec104ServerError::Configuration {
        message: format!("unparsable configuration document: {e}"),
    })
}

fn section_or_default<T>(parent: &Value, name: &str) -> T
where
    T: DeserializeOwned + Serialize + Default,
{
    match parent.get(name) {
        Some(section) => lenient(section, name),
        None => {
            warn!("'{name}' is missing, using defaults");
            T::default()
        }
    }
}

/// Deserializes `value`, replacing every field that fails to deserialize by its default.
fn lenient<T>(value: &Value, section: &str) -> T
where
    T: DeserializeOwned + Serialize + Default,
{
    let err = match serde_json::from_value::<T>(value.clone()) {
        Ok(v) => return v,
        Err(e) => e,
    };
    let Value::Object(input) = value else {
        warn!(section, error = %err, "Section is not an object, using defaults");
        return T::default();
    };
    let mut merged = match serde_json::to_value(T::default()) {
        Ok(Value::Object(m)) => m,
        _ => return T::default(),
    };
    for (key, candidate) in input {
        let previous = merged.insert(key.clone(), candidate.clone());
        if serde_json::from_value::<T>(Value::Object(merged.clone())).is_err() {
            warn!(section, key = %key, value = %candidate, "Invalid value, using default");
            match previous {
                Some(p) => {
                    merged.insert(key.clone(), p);
                }
                None => {
                    merged.remove(key);
                }
            }
        }
    }
    serde_json::from_value(Value::Object(merged)).unwrap_or_default()
}

fn parse_address(address: &str) -> Option<(u64, u64)> {
    let (ca, ioa) = address.trim().split_once('-')?;
    Some((ca.trim().parse().ok()?, ioa.trim().parse().ok()?))
}

fn build_point(def: &DatapointDefinition, params: &AppLayerParameters) -> Option<DataPoint> {
    let proto = def
        .protocols
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(PROTOCOL_NAME))?;

    let Some((ca, ioa)) = parse_address(&proto.address) else {
        warn!(label = %def.label, address = %proto.address, "Skipping datapoint with malformed address");
        return None;
    };
    if ca == 0 || ca >= params.global_common_addr() as u64 {
        warn!(label = %def.label, ca, "Skipping datapoint, common address out of range");
        return None;
    }
    if ioa > params.max_info_obj_addr() as u64 {
        warn!(label = %def.label, ioa, "Skipping datapoint, object address out of range");
        return None;
    }
    let Ok(type_id) = TypeID::from_str(&proto.typeid) else {
        warn!(label = %def.label, typeid = %proto.typeid, "Skipping datapoint with unknown typeid");
        return None;
    };
    let groups = match proto.gi_groups.as_deref() {
        None => GiGroups::STATION,
        Some(s) => GiGroups::parse(s).unwrap_or_else(|token| {
            warn!(
                label = %def.label,
                gi_groups = %s,
                token = %token,
                "Invalid interrogation group, membership set to station only"
            );
            GiGroups::STATION
        }),
    };

    let point = DataPoint::new(
        def.label.clone(),
        ca as CommonAddr,
        ioa as InfoObjAddr,
        type_id,
        groups,
    );
    if point.is_none() {
        warn!(label = %def.label, %type_id, "Skipping datapoint, typeid cannot be exchanged");
    }
    point
}
