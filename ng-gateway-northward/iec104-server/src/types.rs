use crate::protocol::frame::{
    asdu::{CommonAddr, InfoObjAddr, TypeID},
    time::Cp56Time2a,
};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::fmt;

/// Semantic type shared by a monitoring point and its command counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointKind {
    SinglePoint,
    DoublePoint,
    StepPosition,
    NormalizedMeasurement,
    ScaledMeasurement,
    ShortFloatMeasurement,
}

impl PointKind {
    /// Kind carried by a wire type. CP24Time2a tagged types are not used on 104 links.
    pub fn from_type_id(type_id: TypeID) -> Option<Self> {
        Some(match type_id {
            TypeID::M_SP_NA_1 | TypeID::M_SP_TB_1 | TypeID::C_SC_NA_1 | TypeID::C_SC_TA_1 => {
                PointKind::SinglePoint
            }
            TypeID::M_DP_NA_1 | TypeID::M_DP_TB_1 | TypeID::C_DC_NA_1 | TypeID::C_DC_TA_1 => {
                PointKind::DoublePoint
            }
            TypeID::M_ST_NA_1 | TypeID::M_ST_TB_1 | TypeID::C_RC_NA_1 | TypeID::C_RC_TA_1 => {
                PointKind::StepPosition
            }
            TypeID::M_ME_NA_1 | TypeID::M_ME_TD_1 | TypeID::C_SE_NA_1 | TypeID::C_SE_TA_1 => {
                PointKind::NormalizedMeasurement
            }
            TypeID::M_ME_NB_1 | TypeID::M_ME_TE_1 | TypeID::C_SE_NB_1 | TypeID::C_SE_TB_1 => {
                PointKind::ScaledMeasurement
            }
            TypeID::M_ME_NC_1 | TypeID::M_ME_TF_1 | TypeID::C_SE_NC_1 | TypeID::C_SE_TC_1 => {
                PointKind::ShortFloatMeasurement
            }
            _ => return None,
        })
    }

    /// Monitor direction wire type, with or without CP56Time2a.
    pub fn monitoring_type(&self, with_time: bool) -> TypeID {
        match (self, with_time) {
            (PointKind::SinglePoint, false) => TypeID::M_SP_NA_1,
            (PointKind::SinglePoint, true) => TypeID::M_SP_TB_1,
            (PointKind::DoublePoint, false) => TypeID::M_DP_NA_1,
            (PointKind::DoublePoint, true) => TypeID::M_DP_TB_1,
            (PointKind::StepPosition, false) => TypeID::M_ST_NA_1,
            (PointKind::StepPosition, true) => TypeID::M_ST_TB_1,
            (PointKind::NormalizedMeasurement, false) => TypeID::M_ME_NA_1,
            (PointKind::NormalizedMeasurement, true) => TypeID::M_ME_TD_1,
            (PointKind::ScaledMeasurement, false) => TypeID::M_ME_NB_1,
            (PointKind::ScaledMeasurement, true) => TypeID::M_ME_TE_1,
            (PointKind::ShortFloatMeasurement, false) => TypeID::M_ME_NC_1,
            (PointKind::ShortFloatMeasurement, true) => TypeID::M_ME_TF_1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum DoublePointValue {
    Intermediate = 0,
    #[default]
    Off = 1,
    On = 2,
    Indeterminate = 3,
}

impl DoublePointValue {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DoublePointValue::Intermediate),
            1 => Some(DoublePointValue::Off),
            2 => Some(DoublePointValue::On),
            3 => Some(DoublePointValue::Indeterminate),
            _ => None,
        }
    }
}

/// Typed value of a data point, one variant per [`PointKind`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointValue {
    Single(bool),
    Double(DoublePointValue),
    /// 7-bit signed position in -64..=63
    Step { value: i8, transient: bool },
    /// Fraction in [-1, 1)
    Normalized(f32),
    Scaled(i16),
    ShortFloat(f32),
}

impl PointValue {
    pub fn kind(&self) -> PointKind {
        match self {
            PointValue::Single(_) => PointKind::SinglePoint,
            PointValue::Double(_) => PointKind::DoublePoint,
            PointValue::Step { .. } => PointKind::StepPosition,
            PointValue::Normalized(_) => PointKind::NormalizedMeasurement,
            PointValue::Scaled(_) => PointKind::ScaledMeasurement,
            PointValue::ShortFloat(_) => PointKind::ShortFloatMeasurement,
        }
    }

    /// Value a point holds before its first update.
    pub fn initial(kind: PointKind) -> Self {
        match kind {
            PointKind::SinglePoint => PointValue::Single(false),
            PointKind::DoublePoint => PointValue::Double(DoublePointValue::default()),
            PointKind::StepPosition => PointValue::Step {
                value: 0,
                transient: false,
            },
            PointKind::NormalizedMeasurement => PointValue::Normalized(0.0),
            PointKind::ScaledMeasurement => PointValue::Scaled(0),
            PointKind::ShortFloatMeasurement => PointValue::ShortFloat(0.0),
        }
    }
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointValue::Single(v) => write!(f, "{}", *v as u8),
            PointValue::Double(v) => write!(f, "{}", *v as u8),
            PointValue::Step { value, .. } => write!(f, "{value}"),
            PointValue::Normalized(v) => write!(f, "{v}"),
            PointValue::Scaled(v) => write!(f, "{v}"),
            PointValue::ShortFloat(v) => write!(f, "{v}"),
        }
    }
}

/// Quality descriptor, bit-compatible with the QDS octet
/// (bit0 OV, bit4 BL, bit5 SB, bit6 NT, bit7 IV).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quality {
    pub invalid: bool,
    pub non_topical: bool,
    pub substituted: bool,
    pub blocked: bool,
    pub overflow: bool,
}

impl Quality {
    pub const GOOD: Quality = Quality {
        invalid: false,
        non_topical: false,
        substituted: false,
        blocked: false,
        overflow: false,
    };

    pub const INVALID: Quality = Quality {
        invalid: true,
        ..Quality::GOOD
    };

    pub fn bits(&self) -> u8 {
        (self.overflow as u8)
            | (self.blocked as u8) << 4
            | (self.substituted as u8) << 5
            | (self.non_topical as u8) << 6
            | (self.invalid as u8) << 7
    }

    pub fn from_bits(bits: u8) -> Self {
        Quality {
            invalid: bits & 0x80 != 0,
            non_topical: bits & 0x40 != 0,
            substituted: bits & 0x20 != 0,
            blocked: bits & 0x10 != 0,
            overflow: bits & 0x01 != 0,
        }
    }
}

/// Interrogation group membership. Bit 0 is the station group, bits 1..=16 the numbered groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GiGroups(u32);

impl Default for GiGroups {
    fn default() -> Self {
        GiGroups::STATION
    }
}

impl GiGroups {
    pub const STATION: GiGroups = GiGroups(1);
    pub const MAX_GROUP: u8 = 16;

    pub fn empty() -> Self {
        GiGroups(0)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, group: u8) -> bool {
        group <= Self::MAX_GROUP && self.0 & (1 << group) != 0
    }

    pub fn insert(&mut self, group: u8) -> bool {
        if group > Self::MAX_GROUP {
            return false;
        }
        self.0 |= 1 << group;
        true
    }

    /// Parses `"station 1 2"` style lists. An empty list means station only.
    /// Returns the first offending token on error.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut groups = GiGroups::empty();
        for token in s
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
        {
            let group = if token.eq_ignore_ascii_case("station") {
                Some(0)
            } else {
                token
                    .parse::<u8>()
                    .ok()
                    .filter(|g| (1..=Self::MAX_GROUP).contains(g))
            };
            match group {
                Some(g) => {
                    groups.insert(g);
                }
                None => return Err(token.to_string()),
            }
        }
        if groups.0 == 0 {
            return Ok(GiGroups::STATION);
        }
        Ok(groups)
    }
}

/// One exchanged point, addressed by (CA, IOA).
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub label: String,
    pub ca: CommonAddr,
    pub ioa: InfoObjAddr,
    /// Wire type from the exchange definition.
    pub type_id: TypeID,
    pub kind: PointKind,
    pub is_command: bool,
    pub groups: GiGroups,
    pub value: PointValue,
    pub quality: Quality,
    pub timestamp: Option<Cp56Time2a>,
}

impl DataPoint {
    /// `None` when `type_id` is not an exchangeable monitoring or command type.
    pub fn new(
        label: impl Into<String>,
        ca: CommonAddr,
        ioa: InfoObjAddr,
        type_id: TypeID,
        groups: GiGroups,
    ) -> Option<Self> {
        let kind = PointKind::from_type_id(type_id)?;
        Some(DataPoint {
            label: label.into(),
            ca,
            ioa,
            type_id,
            kind,
            is_command: type_id.is_command(),
            groups,
            value: PointValue::initial(kind),
            quality: Quality::INVALID,
            timestamp: None,
        })
    }

    /// Whether an ASDU of `type_id` may address this point: same direction and same kind.
    pub fn accepts(&self, type_id: TypeID) -> bool {
        type_id.is_command() == self.is_command
            && PointKind::from_type_id(type_id) == Some(self.kind)
    }
}
