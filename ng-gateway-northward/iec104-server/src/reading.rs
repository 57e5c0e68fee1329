//! Readings delivered by the gateway pipeline.
//!
//! Two reading shapes matter here: `data_object` carries process data and command
//! acknowledgements from the south side, `south_event` carries its connection and
//! interrogation status.

use crate::{
    error::{Iec104ServerError, Iec104ServerResult},
    protocol::frame::{
        asdu::{CommonAddr, InfoObjAddr, TypeID},
        time::Cp56Time2a,
    },
    types::{DoublePointValue, PointKind, PointValue, Quality},
};
use serde::{de::Error as _, Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::str::FromStr;

pub const DATA_OBJECT: &str = "data_object";
pub const SOUTH_EVENT: &str = "south_event";

/// A reading field value. Nested objects keep their field order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub enum ReadingValue {
    Integer(i64),
    Float(f64),
    Str(String),
    Object(Vec<ReadingField>),
}

impl TryFrom<Value> for ReadingValue {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Ok(match value {
            Value::Bool(b) => ReadingValue::Integer(b as i64),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ReadingValue::Integer(i),
                None => ReadingValue::Float(n.as_f64().ok_or("number out of range")?),
            },
            Value::String(s) => ReadingValue::Str(s),
            Value::Object(map) => ReadingValue::Object(fields_of(map)?),
            other => return Err(format!("unsupported reading value: {other}")),
        })
    }
}

impl ReadingValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ReadingValue::Integer(i) => Some(*i),
            ReadingValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            ReadingValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ReadingValue::Integer(i) => Some(*i as f64),
            ReadingValue::Float(f) => Some(*f),
            ReadingValue::Str(s) => s.trim().parse().ok(),
            ReadingValue::Object(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ReadingValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Non-zero numbers are true.
    pub fn as_flag(&self) -> Option<bool> {
        self.as_f64().map(|v| v != 0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadingField {
    pub name: String,
    pub value: ReadingValue,
}

impl ReadingField {
    pub fn new(name: impl Into<String>, value: ReadingValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

fn fields_of(map: Map<String, Value>) -> Result<Vec<ReadingField>, String> {
    map.into_iter()
        .map(|(name, v)| ReadingValue::try_from(v).map(|value| ReadingField { name, value }))
        .collect()
}

fn deserialize_fields<'de, D>(deserializer: D) -> Result<Vec<ReadingField>, D::Error>
where
    D: Deserializer<'de>,
{
    let map = Map::<String, Value>::deserialize(deserializer)?;
    fields_of(map).map_err(D::Error::custom)
}

/// `{ "asset_name": "...", "fields": { "data_object": { ... } } }`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reading {
    #[serde(alias = "asset")]
    pub asset_name: String,
    #[serde(alias = "readings", deserialize_with = "deserialize_fields")]
    pub fields: Vec<ReadingField>,
}

impl Reading {
    pub fn new(asset_name: impl Into<String>, fields: Vec<ReadingField>) -> Self {
        Self {
            asset_name: asset_name.into(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&ReadingValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// `None` when the reading has no `data_object` field.
    pub fn data_object(&self) -> Option<Iec104ServerResult<DataObject>> {
        match self.field(DATA_OBJECT)? {
            ReadingValue::Object(fields) => Some(DataObject::from_fields(fields)),
            _ => Some(Err(malformed("data_object is not an object"))),
        }
    }

    pub fn south_event(&self) -> Option<SouthEvent> {
        match self.field(SOUTH_EVENT)? {
            ReadingValue::Object(fields) => Some(SouthEvent::from_fields(fields)),
            _ => None,
        }
    }
}

fn malformed(message: impl Into<String>) -> Iec104ServerError {
    Iec104ServerError::Configuration {
        message: format!("malformed reading: {}", message.into()),
    }
}

fn find<'a>(fields: &'a [ReadingField], name: &str) -> Option<&'a ReadingValue> {
    fields.iter().find(|f| f.name == name).map(|f| &f.value)
}

fn flag(fields: &[ReadingField], name: &str) -> bool {
    find(fields, name).and_then(ReadingValue::as_flag).unwrap_or(false)
}

/// Process data or command acknowledgement for one information object.
#[derive(Debug, Clone, PartialEq)]
pub struct DataObject {
    pub type_id: TypeID,
    pub ca: CommonAddr,
    pub ioa: InfoObjAddr,
    /// Raw cause of transmission code
    pub cot: u8,
    pub value: Option<ReadingValue>,
    pub transient: bool,
    pub quality: Quality,
    pub timestamp: Option<Cp56Time2a>,
    pub negative: bool,
    pub test: bool,
}

impl DataObject {
    pub fn from_fields(fields: &[ReadingField]) -> Iec104ServerResult<Self> {
        let type_id = find(fields, "do_type")
            .and_then(ReadingValue::as_str)
            .ok_or_else(|| malformed("do_type missing"))?;
        let type_id = TypeID::from_str(type_id)?;

        let ca = find(fields, "do_ca")
            .and_then(ReadingValue::as_i64)
            .and_then(|v| CommonAddr::try_from(v).ok())
            .ok_or_else(|| malformed("do_ca missing or out of range"))?;
        let ioa = find(fields, "do_ioa")
            .and_then(ReadingValue::as_i64)
            .and_then(|v| InfoObjAddr::try_from(v).ok())
            .ok_or_else(|| malformed("do_ioa missing or out of range"))?;
        let cot = find(fields, "do_cot")
            .and_then(ReadingValue::as_i64)
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| malformed("do_cot missing or out of range"))?;

        let quality = Quality {
            invalid: flag(fields, "do_quality_iv"),
            non_topical: flag(fields, "do_quality_nt"),
            substituted: flag(fields, "do_quality_sb"),
            blocked: flag(fields, "do_quality_bl"),
            overflow: flag(fields, "do_quality_ov"),
        };

        let timestamp = find(fields, "do_ts")
            .and_then(ReadingValue::as_i64)
            .map(|ms| Cp56Time2a {
                timestamp_ms: ms,
                invalid: flag(fields, "do_ts_iv"),
                summer_time: flag(fields, "do_ts_su"),
                substituted: flag(fields, "do_ts_sub"),
            });

        Ok(DataObject {
            type_id,
            ca,
            ioa,
            cot,
            value: find(fields, "do_value").cloned(),
            transient: flag(fields, "do_value_transient"),
            quality,
            timestamp,
            negative: flag(fields, "do_negative"),
            test: flag(fields, "do_test"),
        })
    }

    /// Converts `do_value` into a value of `kind`, `None` if absent or not representable.
    pub fn point_value(&self, kind: PointKind) -> Option<PointValue> {
        let value = self.value.as_ref()?;
        Some(match kind {
            PointKind::SinglePoint => PointValue::Single(value.as_flag()?),
            PointKind::DoublePoint => PointValue::Double(DoublePointValue::from_u8(
                u8::try_from(value.as_i64()?).ok()?,
            )?),
            PointKind::StepPosition => {
                let v = value.as_i64()?;
                if !(-64..=63).contains(&v) {
                    return None;
                }
                PointValue::Step {
                    value: v as i8,
                    transient: self.transient,
                }
            }
            PointKind::NormalizedMeasurement => {
                let v = value.as_f64()?;
                if !(-1.0..=1.0).contains(&v) {
                    return None;
                }
                PointValue::Normalized(v as f32)
            }
            PointKind::ScaledMeasurement => {
                PointValue::Scaled(i16::try_from(value.as_i64()?).ok()?)
            }
            PointKind::ShortFloatMeasurement => PointValue::ShortFloat(value.as_f64()? as f32),
        })
    }
}

/// Status reported by a south service for one of its assets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SouthEvent {
    pub connx_status: Option<String>,
    pub gi_status: Option<String>,
}

impl SouthEvent {
    pub fn from_fields(fields: &[ReadingField]) -> Self {
        let text = |name: &str| find(fields, name).and_then(ReadingValue::as_str).map(str::to_string);
        SouthEvent {
            connx_status: text("connx_status"),
            gi_status: text("gi_status"),
        }
    }
}
