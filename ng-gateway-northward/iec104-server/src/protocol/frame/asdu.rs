use super::super::error::Error;
use anyhow::{anyhow, Result};
use bit_struct::*;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use std::{
    fmt::{Debug, Display},
    io::Cursor,
    str::FromStr,
};

// ASDUSizeMax asdu max size
pub const ASDU_SIZE_MAX: usize = 249;

// Max number of information objects addressable by the variable structure qualifier.
pub const INFO_OBJ_NUMBER_MAX: usize = 127;

// ASDU format
//       | data unit identification | information object <1..n> |
//
//       | <------------  data unit identification ------------>|
//       | typeID | variable struct | cause  |  common address  |
// bytes |    1   |      1          |   2    |      [1,2]       |
//       | <------------  information object ------------------>|
//       | object address | element set  |  object time scale   |
// bytes |     [1,2,3]    |              |                      |
//
// The cause field is always two octets on 104 links: cause of transmission
// followed by the originator address.

pub type OriginAddr = u8;
pub type CommonAddr = u16;
pub type InfoObjAddr = u32;

// InfoObjAddrIrrelevant Zero means that the information object address is irrelevant.
pub const INFO_OBJ_ADDR_IRRELEVANT: InfoObjAddr = 0;

/// Sizes negotiated for the application layer of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppLayerParameters {
    /// Octets of the common address, 1 or 2.
    pub size_of_ca: usize,
    /// Octets of the information object address, 1 to 3.
    pub size_of_ioa: usize,
    /// Upper bound for one encoded ASDU.
    pub max_size_of_asdu: usize,
}

impl Default for AppLayerParameters {
    fn default() -> Self {
        Self {
            size_of_ca: 2,
            size_of_ioa: 3,
            max_size_of_asdu: ASDU_SIZE_MAX,
        }
    }
}

impl AppLayerParameters {
    #[inline]
    pub fn header_size(&self) -> usize {
        // type id + variable struct + cot + originator + common address
        4 + self.size_of_ca
    }

    /// Global (broadcast) common address for the configured CA width.
    #[inline]
    pub fn global_common_addr(&self) -> CommonAddr {
        if self.size_of_ca == 1 {
            0xFF
        } else {
            0xFFFF
        }
    }

    #[inline]
    pub fn max_info_obj_addr(&self) -> InfoObjAddr {
        ((1u64 << (8 * self.size_of_ioa)) - 1) as InfoObjAddr
    }

    /// How many objects of `element_size` bytes (address excluded) fit into one ASDU.
    pub fn max_info_objects(&self, element_size: usize) -> usize {
        let room = self.max_size_of_asdu.saturating_sub(self.header_size());
        (room / (self.size_of_ioa + element_size)).min(INFO_OBJ_NUMBER_MAX)
    }
}

#[derive(Debug, Clone)]
pub struct Asdu {
    pub identifier: Identifier,
    /// Information objects, addresses included.
    pub raw: Bytes,
}

impl Display for Asdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.identifier.to_string().as_str())?;
        let mut s = String::with_capacity(self.raw.len() * 6);
        for b in self.raw.iter() {
            use std::fmt::Write as _;
            let _ = write!(&mut s, "[{:#04X}]", b);
        }
        f.write_str(&s)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Identifier {
    pub type_id: TypeID,
    pub variable_struct: VariableStruct,
    pub cot: CauseOfTransmission,
    pub orig_addr: OriginAddr,
    pub common_addr: CommonAddr,
}

impl Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("[{:02X}]", self.type_id as u8))?;
        f.write_fmt(format_args!("[{:02X}]", self.variable_struct.raw()))?;
        f.write_fmt(format_args!("[{:02X}]", self.cot.raw()))?;
        f.write_fmt(format_args!("[{:02X}]", self.orig_addr))?;
        f.write_fmt(format_args!("[{:04X}]", self.common_addr))?;
        Ok(())
    }
}

bit_struct! {
    pub struct VariableStruct(u8) {
        is_sequence: u1,
        number: u7,
    }
}

enums! {
    pub Cause {
        Unused,
        Periodic,
        Background,
        Spontaneous,
        Initialized,
        Request,
        Activation,
        ActivationCon,
        Deactivation,
        DeactivationCon,
        ActivationTerm,
        ReturnInfoRemote,
        ReturnInfoLocal,
        FileTransfer,
        Authentication,
        SessionKey,
        UserRoleAndUpdateKey,
        Reserved1,
        Reserved2,
        Reserved3,
        InterrogatedByStation,
        InterrogatedByGroup1,
        InterrogatedByGroup2,
        InterrogatedByGroup3,
        InterrogatedByGroup4,
        InterrogatedByGroup5,
        InterrogatedByGroup6,
        InterrogatedByGroup7,
        InterrogatedByGroup8,
        InterrogatedByGroup9,
        InterrogatedByGroup10,
        InterrogatedByGroup11,
        InterrogatedByGroup12,
        InterrogatedByGroup13,
        InterrogatedByGroup14,
        InterrogatedByGroup15,
        InterrogatedByGroup16,
        RequestByGeneralCounter,
        RequestByGroup1Counter,
        RequestByGroup2Counter,
        RequestByGroup3Counter,
        RequestByGroup4Counter,
        Reserved4,
        Reserved5,
        UnknownTypeID,
        UnknownCOT,
        UnknownCA,
        UnknownIOA,
    }
}

impl Cause {
    /// Cause for a numeric code (the low six bits of the cause octet).
    pub fn from_code(code: u8) -> Option<Cause> {
        let mut cot = CauseOfTransmission::try_from(code & 0x3f).ok()?;
        Some(cot.cause().get())
    }

    /// `InterrogatedByStation` for group 0, `InterrogatedByGroupN` for 1..=16.
    pub fn interrogated_by(group: u8) -> Option<Cause> {
        if group > 16 {
            return None;
        }
        Self::from_code(Cause::InterrogatedByStation as u8 + group)
    }
}

// The P/N bit is set for negative confirmations.
bit_struct! {
    pub struct CauseOfTransmission(u8) {
        test: bool,
        negative: bool,
        cause: Cause,
    }
}

impl CauseOfTransmission {
    pub fn from_cause(cause: Cause) -> Self {
        CauseOfTransmission::new(false, false, cause)
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum TypeID {
    M_SP_NA_1 = 1,
    M_SP_TA_1 = 2,
    M_DP_NA_1 = 3,
    M_DP_TA_1 = 4,
    M_ST_NA_1 = 5,
    M_ST_TA_1 = 6,
    M_BO_NA_1 = 7,
    M_ME_NA_1 = 9,
    M_ME_TA_1 = 10,
    M_ME_NB_1 = 11,
    M_ME_TB_1 = 12,
    M_ME_NC_1 = 13,
    M_ME_TC_1 = 14,
    M_IT_NA_1 = 15,
    M_SP_TB_1 = 30,
    M_DP_TB_1 = 31,
    M_ST_TB_1 = 32,
    M_BO_TB_1 = 33,
    M_ME_TD_1 = 34,
    M_ME_TE_1 = 35,
    M_ME_TF_1 = 36,
    M_IT_TB_1 = 37,
    C_SC_NA_1 = 45,
    C_DC_NA_1 = 46,
    C_RC_NA_1 = 47,
    C_SE_NA_1 = 48,
    C_SE_NB_1 = 49,
    C_SE_NC_1 = 50,
    C_BO_NA_1 = 51,
    C_SC_TA_1 = 58,
    C_DC_TA_1 = 59,
    C_RC_TA_1 = 60,
    C_SE_TA_1 = 61,
    C_SE_TB_1 = 62,
    C_SE_TC_1 = 63,
    C_BO_TA_1 = 64,
    M_EI_NA_1 = 70,
    C_IC_NA_1 = 100,
    C_CI_NA_1 = 101,
    C_RD_NA_1 = 102,
    C_CS_NA_1 = 103,
    C_TS_NA_1 = 104,
    C_RP_NA_1 = 105,
    C_TS_TA_1 = 107,
}

// Bidirectional type id <-> mnemonic table, the mnemonics being the ones
// used by exchanged data definitions and south-side feedback.
const TYPE_NAMES: &[(TypeID, &str)] = &[
    (TypeID::M_SP_NA_1, "M_SP_NA_1"),
    (TypeID::M_SP_TA_1, "M_SP_TA_1"),
    (TypeID::M_DP_NA_1, "M_DP_NA_1"),
    (TypeID::M_DP_TA_1, "M_DP_TA_1"),
    (TypeID::M_ST_NA_1, "M_ST_NA_1"),
    (TypeID::M_ST_TA_1, "M_ST_TA_1"),
    (TypeID::M_BO_NA_1, "M_BO_NA_1"),
    (TypeID::M_ME_NA_1, "M_ME_NA_1"),
    (TypeID::M_ME_TA_1, "M_ME_TA_1"),
    (TypeID::M_ME_NB_1, "M_ME_NB_1"),
    (TypeID::M_ME_TB_1, "M_ME_TB_1"),
    (TypeID::M_ME_NC_1, "M_ME_NC_1"),
    (TypeID::M_ME_TC_1, "M_ME_TC_1"),
    (TypeID::M_IT_NA_1, "M_IT_NA_1"),
    (TypeID::M_SP_TB_1, "M_SP_TB_1"),
    (TypeID::M_DP_TB_1, "M_DP_TB_1"),
    (TypeID::M_ST_TB_1, "M_ST_TB_1"),
    (TypeID::M_BO_TB_1, "M_BO_TB_1"),
    (TypeID::M_ME_TD_1, "M_ME_TD_1"),
    (TypeID::M_ME_TE_1, "M_ME_TE_1"),
    (TypeID::M_ME_TF_1, "M_ME_TF_1"),
    (TypeID::M_IT_TB_1, "M_IT_TB_1"),
    (TypeID::C_SC_NA_1, "C_SC_NA_1"),
    (TypeID::C_DC_NA_1, "C_DC_NA_1"),
    (TypeID::C_RC_NA_1, "C_RC_NA_1"),
    (TypeID::C_SE_NA_1, "C_SE_NA_1"),
    (TypeID::C_SE_NB_1, "C_SE_NB_1"),
    (TypeID::C_SE_NC_1, "C_SE_NC_1"),
    (TypeID::C_BO_NA_1, "C_BO_NA_1"),
    (TypeID::C_SC_TA_1, "C_SC_TA_1"),
    (TypeID::C_DC_TA_1, "C_DC_TA_1"),
    (TypeID::C_RC_TA_1, "C_RC_TA_1"),
    (TypeID::C_SE_TA_1, "C_SE_TA_1"),
    (TypeID::C_SE_TB_1, "C_SE_TB_1"),
    (TypeID::C_SE_TC_1, "C_SE_TC_1"),
    (TypeID::C_BO_TA_1, "C_BO_TA_1"),
    (TypeID::M_EI_NA_1, "M_EI_NA_1"),
    (TypeID::C_IC_NA_1, "C_IC_NA_1"),
    (TypeID::C_CI_NA_1, "C_CI_NA_1"),
    (TypeID::C_RD_NA_1, "C_RD_NA_1"),
    (TypeID::C_CS_NA_1, "C_CS_NA_1"),
    (TypeID::C_TS_NA_1, "C_TS_NA_1"),
    (TypeID::C_RP_NA_1, "C_RP_NA_1"),
    (TypeID::C_TS_TA_1, "C_TS_TA_1"),
];

impl TypeID {
    pub fn as_str(&self) -> &'static str {
        TYPE_NAMES
            .iter()
            .find(|(t, _)| t == self)
            .map(|(_, name)| *name)
            .unwrap_or("UNKNOWN")
    }

    /// Process information in control direction.
    #[inline]
    pub fn is_command(&self) -> bool {
        matches!(
            *self,
            Self::C_SC_NA_1
                | Self::C_DC_NA_1
                | Self::C_RC_NA_1
                | Self::C_SE_NA_1
                | Self::C_SE_NB_1
                | Self::C_SE_NC_1
                | Self::C_BO_NA_1
                | Self::C_SC_TA_1
                | Self::C_DC_TA_1
                | Self::C_RC_TA_1
                | Self::C_SE_TA_1
                | Self::C_SE_TB_1
                | Self::C_SE_TC_1
                | Self::C_BO_TA_1
        )
    }

    /// Process information in monitor direction.
    #[inline]
    pub fn is_monitoring(&self) -> bool {
        (*self as u8) < 45
    }

    /// Whether the information objects carry a CP56Time2a tag.
    #[inline]
    pub fn needs_time(&self) -> bool {
        matches!(
            *self,
            Self::M_SP_TB_1
                | Self::M_DP_TB_1
                | Self::M_ST_TB_1
                | Self::M_BO_TB_1
                | Self::M_ME_TD_1
                | Self::M_ME_TE_1
                | Self::M_ME_TF_1
                | Self::M_IT_TB_1
                | Self::C_SC_TA_1
                | Self::C_DC_TA_1
                | Self::C_RC_TA_1
                | Self::C_SE_TA_1
                | Self::C_SE_TB_1
                | Self::C_SE_TC_1
                | Self::C_BO_TA_1
                | Self::C_TS_TA_1
        )
    }

    /// The untagged variant of a time tagged type, interrogation replies never carry time.
    pub fn without_time(&self) -> Self {
        match *self {
            Self::M_SP_TA_1 | Self::M_SP_TB_1 => Self::M_SP_NA_1,
            Self::M_DP_TA_1 | Self::M_DP_TB_1 => Self::M_DP_NA_1,
            Self::M_ST_TA_1 | Self::M_ST_TB_1 => Self::M_ST_NA_1,
            Self::M_BO_TB_1 => Self::M_BO_NA_1,
            Self::M_ME_TA_1 | Self::M_ME_TD_1 => Self::M_ME_NA_1,
            Self::M_ME_TB_1 | Self::M_ME_TE_1 => Self::M_ME_NB_1,
            Self::M_ME_TC_1 | Self::M_ME_TF_1 => Self::M_ME_NC_1,
            Self::M_IT_TB_1 => Self::M_IT_NA_1,
            Self::C_SC_TA_1 => Self::C_SC_NA_1,
            Self::C_DC_TA_1 => Self::C_DC_NA_1,
            Self::C_RC_TA_1 => Self::C_RC_NA_1,
            Self::C_SE_TA_1 => Self::C_SE_NA_1,
            Self::C_SE_TB_1 => Self::C_SE_NB_1,
            Self::C_SE_TC_1 => Self::C_SE_NC_1,
            Self::C_BO_TA_1 => Self::C_BO_NA_1,
            other => other,
        }
    }
}

impl Display for TypeID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TypeID {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        TYPE_NAMES
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(s.trim()))
            .map(|(t, _)| *t)
            .ok_or_else(|| anyhow!("Unknown TypeId name: {}", s))
    }
}

impl TryFrom<u8> for TypeID {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        TYPE_NAMES
            .iter()
            .find(|(t, _)| *t as u8 == value)
            .map(|(t, _)| *t)
            .ok_or_else(|| anyhow!("Unknown TypeId: {}", value))
    }
}

impl Asdu {
    pub fn new(type_id: TypeID, cot: CauseOfTransmission, orig_addr: OriginAddr, ca: CommonAddr) -> Self {
        Asdu {
            identifier: Identifier {
                type_id,
                variable_struct: VariableStruct::new(u1!(0), u7!(0)),
                cot,
                orig_addr,
                common_addr: ca,
            },
            raw: Bytes::new(),
        }
    }

    pub fn mirror(&self, cause: Cause) -> Self {
        let mut asdu = self.clone();
        asdu.identifier.cot.cause().set(cause);
        asdu
    }

    #[inline]
    pub fn type_id(&self) -> TypeID {
        self.identifier.type_id
    }

    #[inline]
    pub fn common_addr(&self) -> CommonAddr {
        self.identifier.common_addr
    }

    #[inline]
    pub fn orig_addr(&self) -> OriginAddr {
        self.identifier.orig_addr
    }

    #[inline]
    pub fn cause(&self) -> Cause {
        let mut cot = self.identifier.cot;
        cot.cause().get()
    }

    #[inline]
    pub fn set_cause(&mut self, cause: Cause) {
        self.identifier.cot.cause().set(cause);
    }

    #[inline]
    pub fn is_negative(&self) -> bool {
        let mut cot = self.identifier.cot;
        cot.negative().get()
    }

    #[inline]
    pub fn set_negative(&mut self, negative: bool) {
        self.identifier.cot.negative().set(negative);
    }

    #[inline]
    pub fn is_test(&self) -> bool {
        let mut cot = self.identifier.cot;
        cot.test().get()
    }

    #[inline]
    pub fn number_of_objects(&self) -> usize {
        let mut vsq = self.identifier.variable_struct;
        vsq.number().get().value() as usize
    }

    #[inline]
    pub fn is_sequence(&self) -> bool {
        let mut vsq = self.identifier.variable_struct;
        vsq.is_sequence().get().value() != 0
    }

    /// Address of the first information object.
    pub fn info_obj_addr(&self, params: &AppLayerParameters) -> Result<InfoObjAddr, Error> {
        let mut rdr = Cursor::new(&self.raw);
        read_info_obj_addr(&mut rdr, params)
    }

    pub fn decode(bytes: Bytes, params: &AppLayerParameters) -> Result<Self> {
        let header_size = params.header_size();
        if bytes.len() < header_size {
            return Err(anyhow!("asdu shorter than its header: {} bytes", bytes.len()));
        }
        let mut rdr = Cursor::new(&bytes);
        let type_id = TypeID::try_from(rdr.read_u8()?)?;
        let variable_struct = VariableStruct::try_from(rdr.read_u8()?)
            .map_err(|_| anyhow!("invalid variable struct"))?;
        let cot = CauseOfTransmission::try_from(rdr.read_u8()?)
            .map_err(|_| anyhow!("invalid cause of transmission"))?;
        let orig_addr = rdr.read_u8()?;
        let common_addr = match params.size_of_ca {
            1 => rdr.read_u8()? as CommonAddr,
            _ => rdr.read_u16::<LittleEndian>()?,
        };
        let mut bytes = bytes;
        Ok(Asdu {
            identifier: Identifier {
                type_id,
                variable_struct,
                cot,
                orig_addr,
                common_addr,
            },
            raw: bytes.split_off(header_size),
        })
    }

    pub fn encode(&self, params: &AppLayerParameters) -> Result<Bytes, Error> {
        let cap = params.header_size() + self.raw.len();
        if cap > params.max_size_of_asdu {
            return Err(Error::ErrAsduFull(cap));
        }
        let mut buf = BytesMut::with_capacity(cap);
        buf.put_u8(self.identifier.type_id as u8);
        buf.put_u8(self.identifier.variable_struct.raw());
        buf.put_u8(self.identifier.cot.raw());
        buf.put_u8(self.identifier.orig_addr);
        match params.size_of_ca {
            1 => {
                let ca = u8::try_from(self.identifier.common_addr)
                    .map_err(|_| Error::ErrCommonAddrRange(self.identifier.common_addr))?;
                buf.put_u8(ca);
            }
            _ => buf.put_u16_le(self.identifier.common_addr),
        }
        buf.extend_from_slice(&self.raw);

        Ok(buf.freeze())
    }
}

pub(crate) fn read_info_obj_addr(
    rdr: &mut Cursor<&Bytes>,
    params: &AppLayerParameters,
) -> Result<InfoObjAddr, Error> {
    let addr = rdr
        .read_uint::<LittleEndian>(params.size_of_ioa)
        .map_err(|_| Error::ErrTruncated)?;
    Ok(addr as InfoObjAddr)
}

pub(crate) fn write_info_obj_addr(
    buf: &mut BytesMut,
    addr: InfoObjAddr,
    params: &AppLayerParameters,
) -> Result<(), Error> {
    if addr > params.max_info_obj_addr() {
        return Err(Error::ErrInfoObjAddrRange {
            addr,
            size: params.size_of_ioa,
        });
    }
    buf.put_uint_le(addr as u64, params.size_of_ioa);
    Ok(())
}

/// Accumulates encoded information objects of one type into an ASDU,
/// refusing objects that would overflow the count or size limits.
#[derive(Debug)]
pub struct AsduBuilder {
    identifier: Identifier,
    params: AppLayerParameters,
    buf: BytesMut,
    count: usize,
}

impl AsduBuilder {
    pub fn new(
        type_id: TypeID,
        cot: CauseOfTransmission,
        orig_addr: OriginAddr,
        ca: CommonAddr,
        params: AppLayerParameters,
    ) -> Self {
        AsduBuilder {
            identifier: Asdu::new(type_id, cot, orig_addr, ca).identifier,
            params,
            buf: BytesMut::with_capacity(params.max_size_of_asdu),
            count: 0,
        }
    }

    #[inline]
    pub fn type_id(&self) -> TypeID {
        self.identifier.type_id
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn can_fit(&self, object_len: usize) -> bool {
        self.count < INFO_OBJ_NUMBER_MAX
            && self.params.header_size() + self.buf.len() + object_len
                <= self.params.max_size_of_asdu
    }

    /// Appends one complete information object. Returns false when it does not fit.
    pub fn push(&mut self, object: &[u8]) -> bool {
        if !self.can_fit(object.len()) {
            return false;
        }
        self.buf.extend_from_slice(object);
        self.count += 1;
        true
    }

    /// Hands out the ASDU built so far and starts over with the same header.
    pub fn take(&mut self) -> Asdu {
        let mut identifier = self.identifier;
        // count is bounded by INFO_OBJ_NUMBER_MAX in push
        let number = u7::new(self.count as u8).unwrap_or(u7!(0));
        identifier.variable_struct = VariableStruct::new(u1!(0), number);
        self.count = 0;
        Asdu {
            identifier,
            raw: self.buf.split().freeze(),
        }
    }
}
