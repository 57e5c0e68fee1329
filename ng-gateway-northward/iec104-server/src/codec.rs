//! Conversion between [`DataPoint`] values and monitor direction information objects.

use crate::{
    protocol::{
        frame::{
            asdu::{AppLayerParameters, Asdu, InfoObjAddr, TypeID},
            mproc::{
                DoublePointInfo, MeasuredValueFloatInfo, MeasuredValueNormalInfo,
                MeasuredValueScaledInfo, MonitoringInfo, ObjectDIQ, ObjectQDS, ObjectSIQ,
                ObjectVTI, SinglePointInfo, StepPositionInfo,
            },
            time::Cp56Time2a,
        },
        Error, Result,
    },
    types::{DataPoint, DoublePointValue, PointValue, Quality},
};
use bit_struct::*;
use bytes::BytesMut;

/// A value read back from an information object.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedValue {
    pub ioa: InfoObjAddr,
    pub value: PointValue,
    pub quality: Quality,
    pub timestamp: Option<Cp56Time2a>,
}

pub fn normalized_to_nva(v: f32) -> i16 {
    (v * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

#[inline]
fn qds(q: &Quality) -> ObjectQDS {
    ObjectQDS::new(
        q.invalid,
        q.non_topical,
        q.substituted,
        q.blocked,
        u3!(0),
        q.overflow,
    )
}

#[inline]
fn quality_of(mut q: ObjectQDS) -> Quality {
    Quality {
        invalid: q.invalid().get(),
        non_topical: q.nt().get(),
        substituted: q.sb().get(),
        blocked: q.bl().get(),
        overflow: q.ov().get(),
    }
}

/// Builds the information object for `point` as `type_id`. A time tag is only attached
/// when `type_id` carries one, falling back to the current time if the point has none.
pub fn to_monitoring_info(point: &DataPoint, type_id: TypeID) -> Result<MonitoringInfo> {
    if !type_id.is_monitoring() || !point.accepts(type_id) || point.value.kind() != point.kind {
        return Err(Error::ErrTypeIDNotMatch(type_id));
    }
    let time = if type_id.needs_time() {
        Some(point.timestamp.unwrap_or_else(Cp56Time2a::now))
    } else {
        None
    };
    let q = &point.quality;
    let ioa = point.ioa;
    let info = match point.value {
        PointValue::Single(v) => MonitoringInfo::SinglePoint(SinglePointInfo {
            ioa,
            siq: ObjectSIQ::new(q.invalid, q.non_topical, q.substituted, q.blocked, u3!(0), v),
            time,
        }),
        PointValue::Double(v) => MonitoringInfo::DoublePoint(DoublePointInfo {
            ioa,
            diq: ObjectDIQ::new(
                q.invalid,
                q.non_topical,
                q.substituted,
                q.blocked,
                u2!(0),
                u2::new(v as u8).unwrap_or(u2!(0)),
            ),
            time,
        }),
        PointValue::Step { value, transient } => MonitoringInfo::StepPosition(StepPositionInfo {
            ioa,
            vti: ObjectVTI::from_signed(value, transient),
            qds: qds(q),
            time,
        }),
        PointValue::Normalized(v) => MonitoringInfo::MeasuredValueNormal(MeasuredValueNormalInfo {
            ioa,
            nva: normalized_to_nva(v),
            qds: qds(q),
            time,
        }),
        PointValue::Scaled(v) => MonitoringInfo::MeasuredValueScaled(MeasuredValueScaledInfo {
            ioa,
            sva: v,
            qds: qds(q),
            time,
        }),
        PointValue::ShortFloat(v) => MonitoringInfo::MeasuredValueFloat(MeasuredValueFloatInfo {
            ioa,
            r: v,
            qds: qds(q),
            time,
        }),
    };
    Ok(info)
}

/// Encodes `point` as one complete information object of `type_id`.
pub fn encode(point: &DataPoint, type_id: TypeID, params: &AppLayerParameters) -> Result<BytesMut> {
    let info = to_monitoring_info(point, type_id)?;
    let mut buf = BytesMut::new();
    info.encode(type_id, params, &mut buf)?;
    Ok(buf)
}

pub fn from_monitoring_info(info: MonitoringInfo) -> DecodedValue {
    match info {
        MonitoringInfo::SinglePoint(mut i) => DecodedValue {
            ioa: i.ioa,
            value: PointValue::Single(i.siq.spi().get()),
            quality: Quality {
                invalid: i.siq.invalid().get(),
                non_topical: i.siq.nt().get(),
                substituted: i.siq.sb().get(),
                blocked: i.siq.bl().get(),
                overflow: false,
            },
            timestamp: i.time,
        },
        MonitoringInfo::DoublePoint(mut i) => DecodedValue {
            ioa: i.ioa,
            value: PointValue::Double(
                DoublePointValue::from_u8(i.diq.dpi().get().value())
                    .unwrap_or(DoublePointValue::Indeterminate),
            ),
            quality: Quality {
                invalid: i.diq.invalid().get(),
                non_topical: i.diq.nt().get(),
                substituted: i.diq.sb().get(),
                blocked: i.diq.bl().get(),
                overflow: false,
            },
            timestamp: i.time,
        },
        MonitoringInfo::StepPosition(mut i) => DecodedValue {
            ioa: i.ioa,
            value: PointValue::Step {
                value: i.vti.signed_value(),
                transient: i.vti.transient().get(),
            },
            quality: quality_of(i.qds),
            timestamp: i.time,
        },
        MonitoringInfo::MeasuredValueNormal(i) => DecodedValue {
            ioa: i.ioa,
            value: PointValue::Normalized(i.value()),
            quality: quality_of(i.qds),
            timestamp: i.time,
        },
        MonitoringInfo::MeasuredValueScaled(i) => DecodedValue {
            ioa: i.ioa,
            value: PointValue::Scaled(i.sva),
            quality: quality_of(i.qds),
            timestamp: i.time,
        },
        MonitoringInfo::MeasuredValueFloat(i) => DecodedValue {
            ioa: i.ioa,
            value: PointValue::ShortFloat(i.r),
            quality: quality_of(i.qds),
            timestamp: i.time,
        },
    }
}

/// Decodes all information objects of a monitor direction ASDU into typed values.
pub fn decode(asdu: &Asdu, params: &AppLayerParameters) -> Result<Vec<DecodedValue>> {
    Ok(asdu
        .get_monitoring_infos(params)?
        .into_iter()
        .map(from_monitoring_info)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::frame::asdu::{AsduBuilder, Cause, CauseOfTransmission},
        types::{GiGroups, PointKind},
    };

    fn point(type_id: TypeID, value: PointValue, quality: Quality, ts: Option<i64>) -> DataPoint {
        let mut p = DataPoint::new("p", 45, 0x1234, type_id, GiGroups::STATION).unwrap();
        p.value = value;
        p.quality = quality;
        p.timestamp = ts.map(Cp56Time2a::from_millis);
        p
    }

    fn round_trip(p: &DataPoint, type_id: TypeID) -> Result<DecodedValue> {
        let params = AppLayerParameters::default();
        let obj = encode(p, type_id, &params)?;
        let mut builder = AsduBuilder::new(
            type_id,
            CauseOfTransmission::from_cause(Cause::Spontaneous),
            0,
            p.ca,
            params,
        );
        assert!(builder.push(&obj));
        let mut decoded = decode(&builder.take(), &params)?;
        assert_eq!(decoded.len(), 1);
        Ok(decoded.remove(0))
    }

    #[test]
    fn every_kind_survives_encode_and_decode() -> Result<()> {
        let q = Quality {
            invalid: false,
            non_topical: true,
            substituted: false,
            blocked: true,
            overflow: false,
        };
        let q_ov = Quality {
            overflow: true,
            ..q
        };
        let ts = Some(1_700_000_000_789);
        let cases = vec![
            (TypeID::M_SP_NA_1, PointValue::Single(true), q, None),
            (TypeID::M_SP_TB_1, PointValue::Single(false), q, ts),
            (
                TypeID::M_DP_NA_1,
                PointValue::Double(DoublePointValue::On),
                q,
                None,
            ),
            (
                TypeID::M_DP_TB_1,
                PointValue::Double(DoublePointValue::Indeterminate),
                q,
                ts,
            ),
            (
                TypeID::M_ST_NA_1,
                PointValue::Step {
                    value: -17,
                    transient: true,
                },
                q_ov,
                None,
            ),
            (
                TypeID::M_ST_TB_1,
                PointValue::Step {
                    value: 63,
                    transient: false,
                },
                q,
                ts,
            ),
            (TypeID::M_ME_NA_1, PointValue::Normalized(0.5), q_ov, None),
            (TypeID::M_ME_TD_1, PointValue::Normalized(-0.25), q, ts),
            (TypeID::M_ME_NB_1, PointValue::Scaled(-32768), q_ov, None),
            (TypeID::M_ME_TE_1, PointValue::Scaled(1234), q, ts),
            (TypeID::M_ME_NC_1, PointValue::ShortFloat(3.75), q_ov, None),
            (TypeID::M_ME_TF_1, PointValue::ShortFloat(-1e6), q, ts),
        ];

        for (type_id, value, quality, ts) in cases {
            let p = point(type_id, value, quality, ts);
            let got = round_trip(&p, type_id)?;
            assert_eq!(got.ioa, p.ioa, "{type_id}");
            assert_eq!(got.value, value, "{type_id}");
            assert_eq!(got.quality, quality, "{type_id}");
            assert_eq!(
                got.timestamp.map(|t| t.timestamp_ms),
                ts,
                "{type_id}"
            );
        }
        Ok(())
    }

    #[test]
    fn untimed_type_drops_the_timestamp() -> Result<()> {
        let p = point(
            TypeID::M_ME_TF_1,
            PointValue::ShortFloat(1.5),
            Quality::GOOD,
            Some(1_700_000_000_000),
        );
        let got = round_trip(&p, TypeID::M_ME_NC_1)?;
        assert_eq!(got.timestamp, None);
        assert_eq!(got.value, PointValue::ShortFloat(1.5));
        Ok(())
    }

    #[test]
    fn timed_type_synthesizes_missing_timestamp() -> Result<()> {
        let before = chrono::Utc::now().timestamp_millis();
        let p = point(TypeID::M_SP_TB_1, PointValue::Single(true), Quality::GOOD, None);
        let got = round_trip(&p, TypeID::M_SP_TB_1)?;
        let ts = got.timestamp.map(|t| t.timestamp_ms).unwrap_or_default();
        assert!(ts >= before - 1);
        Ok(())
    }

    #[test]
    fn normalized_is_saturated() {
        assert_eq!(normalized_to_nva(1.0), 32767);
        assert_eq!(normalized_to_nva(-1.0), -32768);
        assert_eq!(normalized_to_nva(-2.0), -32768);
        assert_eq!(normalized_to_nva(0.5), 16384);
    }

    #[test]
    fn mismatched_or_unsupported_type_is_an_error() {
        let params = AppLayerParameters::default();
        let p = point(TypeID::M_SP_NA_1, PointValue::Single(true), Quality::GOOD, None);
        assert!(encode(&p, TypeID::M_DP_NA_1, &params).is_err());
        assert!(encode(&p, TypeID::M_SP_TA_1, &params).is_err());
        assert!(encode(&p, TypeID::C_SC_NA_1, &params).is_err());

        let mut broken = p.clone();
        broken.value = PointValue::Scaled(1);
        assert_eq!(broken.kind, PointKind::SinglePoint);
        assert!(encode(&broken, TypeID::M_SP_NA_1, &params).is_err());
    }
}
