use super::{
    super::error::Error,
    asdu::{read_info_obj_addr, write_info_obj_addr, AppLayerParameters, Asdu, InfoObjAddr, TypeID},
    time::{Cp56Time2a, CP56TIME2A_SIZE},
};
use bit_struct::*;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

// Application service data units for process information in monitor direction.

// 单点遥信对象 SIQ
bit_struct! {
    pub struct ObjectSIQ(u8) {
        invalid: bool,  // 数据无效标志
        nt: bool,       // 非最新状态
        sb: bool,       // 被取代/人工设置
        bl: bool,       // 封锁 blocking
        res: u3,        // 保留, 置0
        spi: bool,      // 遥信状态
    }
}

// 双点遥信对象 DIQ
bit_struct! {
    pub struct ObjectDIQ(u8) {
        invalid: bool,
        nt: bool,
        sb: bool,
        bl: bool,
        res: u2,
        dpi: u2,        // 0: intermediate, 1: off, 2: on, 3: indeterminate
    }
}

// 信息对象品质描述词 QDS
bit_struct! {
    pub struct ObjectQDS(u8) {
        invalid: bool,
        nt: bool,
        sb: bool,
        bl: bool,
        res: u3,
        ov: bool,       // 溢出 overflow
    }
}

// 步位置信息VTI: 高位bit7为瞬变(transient)，低7位为补码值(value)
bit_struct! {
    pub struct ObjectVTI(u8) {
        transient: bool,
        value: u7,
    }
}

impl ObjectVTI {
    /// Value in -64..=63.
    pub fn signed_value(&mut self) -> i8 {
        let v = self.value().get().value();
        if v & 0x40 != 0 {
            (v | 0x80) as i8
        } else {
            v as i8
        }
    }

    pub fn from_signed(value: i8, transient: bool) -> Self {
        let v = value.clamp(-64, 63) as u8 & 0x7f;
        ObjectVTI::new(transient, u7::new(v).unwrap_or(u7!(0)))
    }
}

/// Size of the information element set, address and time tag excluded.
pub fn element_size(type_id: TypeID) -> Option<usize> {
    Some(match type_id.without_time() {
        TypeID::M_SP_NA_1 | TypeID::M_DP_NA_1 => 1,
        TypeID::M_ST_NA_1 => 2,
        TypeID::M_ME_NA_1 | TypeID::M_ME_NB_1 => 3,
        TypeID::M_ME_NC_1 => 5,
        _ => return None,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinglePointInfo {
    pub ioa: InfoObjAddr,
    pub siq: ObjectSIQ,
    pub time: Option<Cp56Time2a>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DoublePointInfo {
    pub ioa: InfoObjAddr,
    pub diq: ObjectDIQ,
    pub time: Option<Cp56Time2a>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepPositionInfo {
    pub ioa: InfoObjAddr,
    pub vti: ObjectVTI,
    pub qds: ObjectQDS,
    pub time: Option<Cp56Time2a>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasuredValueNormalInfo {
    pub ioa: InfoObjAddr,
    pub nva: i16,
    pub qds: ObjectQDS,
    pub time: Option<Cp56Time2a>,
}

impl MeasuredValueNormalInfo {
    pub fn value(&self) -> f32 {
        self.nva as f32 / 32768.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasuredValueScaledInfo {
    pub ioa: InfoObjAddr,
    pub sva: i16,
    pub qds: ObjectQDS,
    pub time: Option<Cp56Time2a>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasuredValueFloatInfo {
    pub ioa: InfoObjAddr,
    pub r: f32,
    pub qds: ObjectQDS,
    pub time: Option<Cp56Time2a>,
}

/// One monitor direction information object of any supported kind.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitoringInfo {
    SinglePoint(SinglePointInfo),
    DoublePoint(DoublePointInfo),
    StepPosition(StepPositionInfo),
    MeasuredValueNormal(MeasuredValueNormalInfo),
    MeasuredValueScaled(MeasuredValueScaledInfo),
    MeasuredValueFloat(MeasuredValueFloatInfo),
}

impl MonitoringInfo {
    pub fn ioa(&self) -> InfoObjAddr {
        match self {
            MonitoringInfo::SinglePoint(i) => i.ioa,
            MonitoringInfo::DoublePoint(i) => i.ioa,
            MonitoringInfo::StepPosition(i) => i.ioa,
            MonitoringInfo::MeasuredValueNormal(i) => i.ioa,
            MonitoringInfo::MeasuredValueScaled(i) => i.ioa,
            MonitoringInfo::MeasuredValueFloat(i) => i.ioa,
        }
    }

    pub fn time(&self) -> Option<Cp56Time2a> {
        match self {
            MonitoringInfo::SinglePoint(i) => i.time,
            MonitoringInfo::DoublePoint(i) => i.time,
            MonitoringInfo::StepPosition(i) => i.time,
            MonitoringInfo::MeasuredValueNormal(i) => i.time,
            MonitoringInfo::MeasuredValueScaled(i) => i.time,
            MonitoringInfo::MeasuredValueFloat(i) => i.time,
        }
    }

    /// Encodes the complete information object (address, elements, optional time tag)
    /// for `type_id`. Nothing is written to `buf` when the type doesn't match the object.
    pub fn encode(
        &self,
        type_id: TypeID,
        params: &AppLayerParameters,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        let matches = matches!(
            (self, type_id.without_time()),
            (MonitoringInfo::SinglePoint(_), TypeID::M_SP_NA_1)
                | (MonitoringInfo::DoublePoint(_), TypeID::M_DP_NA_1)
                | (MonitoringInfo::StepPosition(_), TypeID::M_ST_NA_1)
                | (MonitoringInfo::MeasuredValueNormal(_), TypeID::M_ME_NA_1)
                | (MonitoringInfo::MeasuredValueScaled(_), TypeID::M_ME_NB_1)
                | (MonitoringInfo::MeasuredValueFloat(_), TypeID::M_ME_NC_1)
        );
        // only the CP56Time2a tagged variants are produced
        if !matches || is_cp24(type_id) {
            return Err(Error::ErrTypeIDNotMatch(type_id));
        }

        let mut obj = BytesMut::with_capacity(params.size_of_ioa + 5 + CP56TIME2A_SIZE);
        write_info_obj_addr(&mut obj, self.ioa(), params)?;
        match self {
            MonitoringInfo::SinglePoint(i) => obj.put_u8(i.siq.raw()),
            MonitoringInfo::DoublePoint(i) => obj.put_u8(i.diq.raw()),
            MonitoringInfo::StepPosition(i) => {
                obj.put_u8(i.vti.raw());
                obj.put_u8(i.qds.raw());
            }
            MonitoringInfo::MeasuredValueNormal(i) => {
                obj.put_i16_le(i.nva);
                obj.put_u8(i.qds.raw());
            }
            MonitoringInfo::MeasuredValueScaled(i) => {
                obj.put_i16_le(i.sva);
                obj.put_u8(i.qds.raw());
            }
            MonitoringInfo::MeasuredValueFloat(i) => {
                obj.put_f32_le(i.r);
                obj.put_u8(i.qds.raw());
            }
        }
        if type_id.needs_time() {
            self.time().unwrap_or_else(Cp56Time2a::now).encode(&mut obj);
        }
        buf.extend_from_slice(&obj);
        Ok(())
    }
}

#[inline]
fn is_cp24(type_id: TypeID) -> bool {
    matches!(
        type_id,
        TypeID::M_SP_TA_1
            | TypeID::M_DP_TA_1
            | TypeID::M_ST_TA_1
            | TypeID::M_ME_TA_1
            | TypeID::M_ME_TB_1
            | TypeID::M_ME_TC_1
    )
}

impl Asdu {
    /// Decodes every monitor direction information object carried by this ASDU,
    /// honouring the sequence bit of the variable structure qualifier.
    pub fn get_monitoring_infos(
        &self,
        params: &AppLayerParameters,
    ) -> Result<Vec<MonitoringInfo>, Error> {
        let type_id = self.identifier.type_id;
        if !type_id.is_monitoring() || is_cp24(type_id) || element_size(type_id).is_none() {
            return Err(Error::ErrTypeIDNotMatch(type_id));
        }
        let mut rdr = Cursor::new(&self.raw);
        let info_num = self.number_of_objects();
        let is_seq = self.is_sequence();
        let mut infos = Vec::with_capacity(info_num);
        let mut ioa: InfoObjAddr = 0;
        for n in 0..info_num {
            if !is_seq || n == 0 {
                ioa = read_info_obj_addr(&mut rdr, params)?;
            } else {
                ioa += 1;
            }
            let info = match type_id.without_time() {
                TypeID::M_SP_NA_1 => MonitoringInfo::SinglePoint(SinglePointInfo {
                    ioa,
                    siq: ObjectSIQ::try_from(read_u8(&mut rdr)?)?,
                    time: read_time(type_id, &mut rdr)?,
                }),
                TypeID::M_DP_NA_1 => MonitoringInfo::DoublePoint(DoublePointInfo {
                    ioa,
                    diq: ObjectDIQ::try_from(read_u8(&mut rdr)?)?,
                    time: read_time(type_id, &mut rdr)?,
                }),
                TypeID::M_ST_NA_1 => MonitoringInfo::StepPosition(StepPositionInfo {
                    ioa,
                    vti: ObjectVTI::try_from(read_u8(&mut rdr)?)?,
                    qds: ObjectQDS::try_from(read_u8(&mut rdr)?)?,
                    time: read_time(type_id, &mut rdr)?,
                }),
                TypeID::M_ME_NA_1 => MonitoringInfo::MeasuredValueNormal(MeasuredValueNormalInfo {
                    ioa,
                    nva: rdr.read_i16::<LittleEndian>().map_err(|_| Error::ErrTruncated)?,
                    qds: ObjectQDS::try_from(read_u8(&mut rdr)?)?,
                    time: read_time(type_id, &mut rdr)?,
                }),
                TypeID::M_ME_NB_1 => MonitoringInfo::MeasuredValueScaled(MeasuredValueScaledInfo {
                    ioa,
                    sva: rdr.read_i16::<LittleEndian>().map_err(|_| Error::ErrTruncated)?,
                    qds: ObjectQDS::try_from(read_u8(&mut rdr)?)?,
                    time: read_time(type_id, &mut rdr)?,
                }),
                TypeID::M_ME_NC_1 => MonitoringInfo::MeasuredValueFloat(MeasuredValueFloatInfo {
                    ioa,
                    r: rdr.read_f32::<LittleEndian>().map_err(|_| Error::ErrTruncated)?,
                    qds: ObjectQDS::try_from(read_u8(&mut rdr)?)?,
                    time: read_time(type_id, &mut rdr)?,
                }),
                _ => return Err(Error::ErrTypeIDNotMatch(type_id)),
            };
            infos.push(info);
        }
        Ok(infos)
    }
}

#[inline]
pub(crate) fn read_u8(rdr: &mut Cursor<&Bytes>) -> Result<u8, Error> {
    rdr.read_u8().map_err(|_| Error::ErrTruncated)
}

#[inline]
pub(crate) fn read_time(
    type_id: TypeID,
    rdr: &mut Cursor<&Bytes>,
) -> Result<Option<Cp56Time2a>, Error> {
    if type_id.needs_time() {
        Ok(Some(Cp56Time2a::decode(rdr)?))
    } else {
        Ok(None)
    }
}
