use super::{
    super::error::Error,
    asdu::{
        read_info_obj_addr, write_info_obj_addr, AppLayerParameters, Asdu, AsduBuilder, Cause,
        CauseOfTransmission, CommonAddr, InfoObjAddr, OriginAddr, TypeID,
        INFO_OBJ_ADDR_IRRELEVANT,
    },
    mproc::read_u8,
    time::Cp56Time2a,
};
use bytes::{BufMut, BytesMut};
use std::io::Cursor;

// Application service data units for system information in control direction.

// 召唤限定词 QOI
// <0> := 未用
// <1..19> := 为标准定义保留
// <20> := 站召唤(全局)
// <21..36> := 第1组召唤 .. 第16组召唤
// <37..63> := 为标准定义保留
// <64..255> := 为特定应用保留
pub const QOI_STATION: u8 = 20;
pub const QOI_GROUP_1: u8 = 21;
pub const QOI_GROUP_16: u8 = 36;

/// Interrogation group selected by a qualifier: 0 for station, 1..=16 for groups.
pub fn qoi_group(qoi: u8) -> Option<u8> {
    match qoi {
        QOI_STATION..=QOI_GROUP_16 => Some(qoi - QOI_STATION),
        _ => None,
    }
}

fn check_cause(cot: CauseOfTransmission) -> Result<(), Error> {
    let mut c = cot;
    let cause = c.cause().get();
    if !(cause == Cause::Activation
        || cause == Cause::ActivationCon
        || cause == Cause::Deactivation
        || cause == Cause::DeactivationCon
        || cause == Cause::ActivationTerm
        || cause == Cause::UnknownTypeID
        || cause == Cause::UnknownCOT
        || cause == Cause::UnknownCA
        || cause == Cause::UnknownIOA)
    {
        return Err(Error::ErrCmdCause(cot));
    }
    Ok(())
}

// InterrogationCmd send a new interrogation command [C_IC_NA_1]. 总召唤命令, 只有单个信息对象(SQ = 0)
// [C_IC_NA_1] See companion standard 101, subclass 7.3.4.1
pub fn interrogation_cmd(
    cot: CauseOfTransmission,
    orig_addr: OriginAddr,
    ca: CommonAddr,
    qoi: u8,
    params: &AppLayerParameters,
) -> Result<Asdu, Error> {
    check_cause(cot)?;
    let mut obj = BytesMut::with_capacity(params.size_of_ioa + 1);
    write_info_obj_addr(&mut obj, INFO_OBJ_ADDR_IRRELEVANT, params)?;
    obj.put_u8(qoi);
    let mut builder = AsduBuilder::new(TypeID::C_IC_NA_1, cot, orig_addr, ca, *params);
    builder.push(&obj);
    Ok(builder.take())
}

// ClockSynchronizationCmd send clock sync command [C_CS_NA_1]. 时钟同步命令, 只有单个信息对象(SQ = 0)
// [C_CS_NA_1] See companion standard 101, subclass 7.3.4.4
pub fn clock_synchronization_cmd(
    cot: CauseOfTransmission,
    orig_addr: OriginAddr,
    ca: CommonAddr,
    time: Cp56Time2a,
    params: &AppLayerParameters,
) -> Result<Asdu, Error> {
    check_cause(cot)?;
    let mut obj = BytesMut::with_capacity(params.size_of_ioa + 7);
    write_info_obj_addr(&mut obj, INFO_OBJ_ADDR_IRRELEVANT, params)?;
    time.encode(&mut obj);
    let mut builder = AsduBuilder::new(TypeID::C_CS_NA_1, cot, orig_addr, ca, *params);
    builder.push(&obj);
    Ok(builder.take())
}

impl Asdu {
    // [C_IC_NA_1] 获得总召唤信息体(信息对象地址，召唤限定词)
    pub fn get_interrogation_cmd(
        &self,
        params: &AppLayerParameters,
    ) -> Result<(InfoObjAddr, u8), Error> {
        if self.identifier.type_id != TypeID::C_IC_NA_1 {
            return Err(Error::ErrTypeIDNotMatch(self.identifier.type_id));
        }
        let mut rdr = Cursor::new(&self.raw);
        let ioa = read_info_obj_addr(&mut rdr, params)?;
        let qoi = read_u8(&mut rdr)?;
        Ok((ioa, qoi))
    }

    // [C_CS_NA_1] 获得时钟同步命令信息体(信息对象地址,时间)
    pub fn get_clock_synchronization_cmd(
        &self,
        params: &AppLayerParameters,
    ) -> Result<(InfoObjAddr, Cp56Time2a), Error> {
        if self.identifier.type_id != TypeID::C_CS_NA_1 {
            return Err(Error::ErrTypeIDNotMatch(self.identifier.type_id));
        }
        let mut rdr = Cursor::new(&self.raw);
        let ioa = read_info_obj_addr(&mut rdr, params)?;
        let time = Cp56Time2a::decode(&mut rdr)?;
        Ok((ioa, time))
    }
}
