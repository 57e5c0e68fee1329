use super::{
    super::error::Error,
    asdu::{
        read_info_obj_addr, write_info_obj_addr, AppLayerParameters, Asdu, AsduBuilder, Cause,
        CauseOfTransmission, CommonAddr, InfoObjAddr, OriginAddr, TypeID,
    },
    mproc::{read_time, read_u8},
    time::{Cp56Time2a, CP56TIME2A_SIZE},
};
use bit_struct::*;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use std::io::Cursor;

// Application service data units for process information in control direction.

// 单命令 遥控信息
bit_struct! {
    pub struct ObjectSCO(u8) {
        se: bool,   // 选择标志: 0:执行, 1:选择
        qu: u5,     // 输出方式: 0:被控确定, 1:短脉冲, 2:长脉冲, 3:持续脉冲
        res: u1,    // 预留: 置0
        scs: bool,  // 控制状态
    }
}

// 双命令 遥控信息
bit_struct! {
    pub struct ObjectDCO(u8) {
        /// 选择标志: 0:执行, 1:选择
        se: bool,
        /// 输出方式: 0:被控确定, 1:短脉冲, 2:长脉冲, 3:持续脉冲
        qu: u5,
        /// 控制状态
        dcs: u2,
    }
}

// 步调节命令 遥控信息
bit_struct! {
    pub struct ObjectRCO(u8) {
        /// 选择标志: 0:执行, 1:选择
        se: bool,
        /// 输出方式: 0:被控确定, 1:短脉冲, 2:长脉冲, 3:持续脉冲
        qu: u5,
        /// 步进命令状态: 1:降一步, 2:升一步
        rcs: u2,
    }
}

// 设定命令限定词
bit_struct! {
    pub struct ObjectQOS(u8) {
        /// 选择标志: 0:执行, 1:选择
        se: bool,
        /// 0: 默认 1-63: 预留为标准定义 64-127:特殊使用
        ql: u7,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SingleCommandInfo {
    pub ioa: InfoObjAddr,
    pub sco: ObjectSCO,
    pub time: Option<Cp56Time2a>,
}

impl SingleCommandInfo {
    pub fn new(ioa: InfoObjAddr, v: bool, se: bool) -> Self {
        SingleCommandInfo {
            ioa,
            sco: ObjectSCO::new(se, u5!(0), u1!(0), v),
            time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DoubleCommandInfo {
    pub ioa: InfoObjAddr,
    pub dco: ObjectDCO,
    pub time: Option<Cp56Time2a>,
}

impl DoubleCommandInfo {
    pub fn new(ioa: InfoObjAddr, v: u8, se: bool) -> Self {
        DoubleCommandInfo {
            ioa,
            dco: ObjectDCO::new(se, u5!(0), u2::new(v % 4).unwrap_or(u2!(0))),
            time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepCommandInfo {
    pub ioa: InfoObjAddr,
    pub rco: ObjectRCO,
    pub time: Option<Cp56Time2a>,
}

impl StepCommandInfo {
    pub fn new(ioa: InfoObjAddr, v: u8, se: bool) -> Self {
        StepCommandInfo {
            ioa,
            rco: ObjectRCO::new(se, u5!(0), u2::new(v % 4).unwrap_or(u2!(0))),
            time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetPointCommandNormalInfo {
    pub ioa: InfoObjAddr,
    pub nva: i16,
    pub qos: ObjectQOS,
    pub time: Option<Cp56Time2a>,
}

impl SetPointCommandNormalInfo {
    pub fn value(&self) -> f32 {
        self.nva as f32 / 32768.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetPointCommandScaledInfo {
    pub ioa: InfoObjAddr,
    pub sva: i16,
    pub qos: ObjectQOS,
    pub time: Option<Cp56Time2a>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetPointCommandFloatInfo {
    pub ioa: InfoObjAddr,
    pub r: f32,
    pub qos: ObjectQOS,
    pub time: Option<Cp56Time2a>,
}

/// The single information object of a command ASDU.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandInfo {
    Single(SingleCommandInfo),
    Double(DoubleCommandInfo),
    Step(StepCommandInfo),
    SetPointNormal(SetPointCommandNormalInfo),
    SetPointScaled(SetPointCommandScaledInfo),
    SetPointFloat(SetPointCommandFloatInfo),
}

impl CommandInfo {
    pub fn ioa(&self) -> InfoObjAddr {
        match self {
            CommandInfo::Single(c) => c.ioa,
            CommandInfo::Double(c) => c.ioa,
            CommandInfo::Step(c) => c.ioa,
            CommandInfo::SetPointNormal(c) => c.ioa,
            CommandInfo::SetPointScaled(c) => c.ioa,
            CommandInfo::SetPointFloat(c) => c.ioa,
        }
    }

    pub fn time(&self) -> Option<Cp56Time2a> {
        match self {
            CommandInfo::Single(c) => c.time,
            CommandInfo::Double(c) => c.time,
            CommandInfo::Step(c) => c.time,
            CommandInfo::SetPointNormal(c) => c.time,
            CommandInfo::SetPointScaled(c) => c.time,
            CommandInfo::SetPointFloat(c) => c.time,
        }
    }

    pub fn with_time(mut self, time: Cp56Time2a) -> Self {
        let slot = match &mut self {
            CommandInfo::Single(c) => &mut c.time,
            CommandInfo::Double(c) => &mut c.time,
            CommandInfo::Step(c) => &mut c.time,
            CommandInfo::SetPointNormal(c) => &mut c.time,
            CommandInfo::SetPointScaled(c) => &mut c.time,
            CommandInfo::SetPointFloat(c) => &mut c.time,
        };
        *slot = Some(time);
        self
    }

    /// Select (true) or execute (false).
    pub fn is_select(&self) -> bool {
        match self.clone() {
            CommandInfo::Single(mut c) => c.sco.se().get(),
            CommandInfo::Double(mut c) => c.dco.se().get(),
            CommandInfo::Step(mut c) => c.rco.se().get(),
            CommandInfo::SetPointNormal(mut c) => c.qos.se().get(),
            CommandInfo::SetPointScaled(mut c) => c.qos.se().get(),
            CommandInfo::SetPointFloat(mut c) => c.qos.se().get(),
        }
    }

    /// The untimed command type this object belongs to.
    pub fn type_id(&self) -> TypeID {
        match self {
            CommandInfo::Single(_) => TypeID::C_SC_NA_1,
            CommandInfo::Double(_) => TypeID::C_DC_NA_1,
            CommandInfo::Step(_) => TypeID::C_RC_NA_1,
            CommandInfo::SetPointNormal(_) => TypeID::C_SE_NA_1,
            CommandInfo::SetPointScaled(_) => TypeID::C_SE_NB_1,
            CommandInfo::SetPointFloat(_) => TypeID::C_SE_NC_1,
        }
    }

    pub fn encode(
        &self,
        type_id: TypeID,
        params: &AppLayerParameters,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        if !type_id.is_command() || type_id.without_time() != self.type_id() {
            return Err(Error::ErrTypeIDNotMatch(type_id));
        }
        let mut obj = BytesMut::with_capacity(params.size_of_ioa + 5 + CP56TIME2A_SIZE);
        write_info_obj_addr(&mut obj, self.ioa(), params)?;
        match self {
            CommandInfo::Single(c) => obj.put_u8(c.sco.raw()),
            CommandInfo::Double(c) => obj.put_u8(c.dco.raw()),
            CommandInfo::Step(c) => obj.put_u8(c.rco.raw()),
            CommandInfo::SetPointNormal(c) => {
                obj.put_i16_le(c.nva);
                obj.put_u8(c.qos.raw());
            }
            CommandInfo::SetPointScaled(c) => {
                obj.put_i16_le(c.sva);
                obj.put_u8(c.qos.raw());
            }
            CommandInfo::SetPointFloat(c) => {
                obj.put_f32_le(c.r);
                obj.put_u8(c.qos.raw());
            }
        }
        if type_id.needs_time() {
            self.time().unwrap_or_else(Cp56Time2a::now).encode(&mut obj);
        }
        buf.extend_from_slice(&obj);
        Ok(())
    }
}

// Command sends one of [C_SC_NA_1], [C_DC_NA_1], [C_RC_NA_1], [C_SE_NA_1], [C_SE_NB_1],
// [C_SE_NC_1] or their [C_xx_TA_1] time tagged counterparts, single information object (SQ = 0).
// See companion standard 101, subclass 7.3.2
// 传送原因(cot)用于
// 控制方向：
// <6> := 激活
// <8> := 停止激活
// 监视方向：
// <7> := 激活确认
// <9> := 停止激活确认
// <10> := 激活终止
// <44> := 未知的类型标识
// <45> := 未知的传送原因
// <46> := 未知的应用服务数据单元公共地址
// <47> := 未知的信息对象地址
pub fn command(
    type_id: TypeID,
    cot: CauseOfTransmission,
    orig_addr: OriginAddr,
    ca: CommonAddr,
    cmd: &CommandInfo,
    params: &AppLayerParameters,
) -> Result<Asdu, Error> {
    let mut cot = cot;
    let cause = cot.cause().get();

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

    let mut obj = BytesMut::new();
    cmd.encode(type_id, params, &mut obj)?;
    let mut builder = AsduBuilder::new(type_id, cot, orig_addr, ca, *params);
    if !builder.push(&obj) {
        return Err(Error::ErrAsduFull(obj.len()));
    }
    Ok(builder.take())
}

impl Asdu {
    /// Decodes the information object of a command ASDU.
    pub fn get_command(&self, params: &AppLayerParameters) -> Result<CommandInfo, Error> {
        let type_id = self.identifier.type_id;
        if !type_id.is_command() {
            return Err(Error::ErrTypeIDNotMatch(type_id));
        }
        let mut rdr = Cursor::new(&self.raw);
        let ioa = read_info_obj_addr(&mut rdr, params)?;
        let cmd = match type_id.without_time() {
            TypeID::C_SC_NA_1 => CommandInfo::Single(SingleCommandInfo {
                ioa,
                sco: ObjectSCO::try_from(read_u8(&mut rdr)?)?,
                time: read_time(type_id, &mut rdr)?,
            }),
            TypeID::C_DC_NA_1 => CommandInfo::Double(DoubleCommandInfo {
                ioa,
                dco: ObjectDCO::try_from(read_u8(&mut rdr)?)?,
                time: read_time(type_id, &mut rdr)?,
            }),
            TypeID::C_RC_NA_1 => CommandInfo::Step(StepCommandInfo {
                ioa,
                rco: ObjectRCO::try_from(read_u8(&mut rdr)?)?,
                time: read_time(type_id, &mut rdr)?,
            }),
            TypeID::C_SE_NA_1 => CommandInfo::SetPointNormal(SetPointCommandNormalInfo {
                ioa,
                nva: rdr.read_i16::<LittleEndian>().map_err(|_| Error::ErrTruncated)?,
                qos: ObjectQOS::try_from(read_u8(&mut rdr)?)?,
                time: read_time(type_id, &mut rdr)?,
            }),
            TypeID::C_SE_NB_1 => CommandInfo::SetPointScaled(SetPointCommandScaledInfo {
                ioa,
                sva: rdr.read_i16::<LittleEndian>().map_err(|_| Error::ErrTruncated)?,
                qos: ObjectQOS::try_from(read_u8(&mut rdr)?)?,
                time: read_time(type_id, &mut rdr)?,
            }),
            TypeID::C_SE_NC_1 => CommandInfo::SetPointFloat(SetPointCommandFloatInfo {
                ioa,
                r: rdr.read_f32::<LittleEndian>().map_err(|_| Error::ErrTruncated)?,
                qos: ObjectQOS::try_from(read_u8(&mut rdr)?)?,
                time: read_time(type_id, &mut rdr)?,
            }),
            _ => return Err(Error::ErrTypeIDNotMatch(type_id)),
        };
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn activation() -> CauseOfTransmission {
        CauseOfTransmission::from_cause(Cause::Activation)
    }

    #[test]
    fn single_command_layout() -> Result<(), Error> {
        let params = AppLayerParameters::default();
        let cmd = CommandInfo::Single(SingleCommandInfo::new(0x0A0B0C, true, true));
        let asdu = command(TypeID::C_SC_NA_1, activation(), 3, 45, &cmd, &params)?;
        assert_eq!(
            asdu.encode(&params)?,
            Bytes::from_static(&[0x2D, 0x01, 0x06, 0x03, 0x2D, 0x00, 0x0C, 0x0B, 0x0A, 0x81])
        );
        let decoded = asdu.get_command(&params)?;
        assert!(decoded.is_select());
        assert_eq!(decoded, cmd);
        Ok(())
    }

    #[test]
    fn decode_commands() -> Result<(), Error> {
        struct Test {
            name: &'static str,
            type_id: TypeID,
            cmd: CommandInfo,
            select: bool,
        }
        let tests = vec![
            Test {
                name: "C_DC_NA_1 execute on",
                type_id: TypeID::C_DC_NA_1,
                cmd: CommandInfo::Double(DoubleCommandInfo::new(7, 2, false)),
                select: false,
            },
            Test {
                name: "C_RC_TA_1 step up",
                type_id: TypeID::C_RC_TA_1,
                cmd: CommandInfo::Step(StepCommandInfo::new(8, 2, false))
                    .with_time(Cp56Time2a::from_millis(1_600_000_000_000)),
                select: false,
            },
            Test {
                name: "C_SE_NB_1 select",
                type_id: TypeID::C_SE_NB_1,
                cmd: CommandInfo::SetPointScaled(SetPointCommandScaledInfo {
                    ioa: 9,
                    sva: -1234,
                    qos: ObjectQOS::new(true, u7!(0)),
                    time: None,
                }),
                select: true,
            },
            Test {
                name: "C_SE_TC_1 execute",
                type_id: TypeID::C_SE_TC_1,
                cmd: CommandInfo::SetPointFloat(SetPointCommandFloatInfo {
                    ioa: 10,
                    r: 3.25,
                    qos: ObjectQOS::new(false, u7!(0)),
                    time: Some(Cp56Time2a::from_millis(1_600_000_000_123)),
                }),
                select: false,
            },
        ];

        let params = AppLayerParameters::default();
        for t in tests {
            let asdu = command(t.type_id, activation(), 0, 1, &t.cmd, &params)?;
            let got = asdu.get_command(&params)?;
            assert_eq!(got, t.cmd, "{}", t.name);
            assert_eq!(got.is_select(), t.select, "{}", t.name);
        }
        Ok(())
    }

    #[test]
    fn command_rejects_monitor_causes_and_wrong_types() {
        let params = AppLayerParameters::default();
        let cmd = CommandInfo::Single(SingleCommandInfo::new(1, true, false));
        assert!(matches!(
            command(
                TypeID::C_SC_NA_1,
                CauseOfTransmission::from_cause(Cause::Spontaneous),
                0,
                1,
                &cmd,
                &params
            ),
            Err(Error::ErrCmdCause(_))
        ));
        assert!(matches!(
            command(TypeID::C_DC_NA_1, activation(), 0, 1, &cmd, &params),
            Err(Error::ErrTypeIDNotMatch(TypeID::C_DC_NA_1))
        ));
    }
}
