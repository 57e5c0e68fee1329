mod common;

use common::{
    as_dyn, build_config, clock_sync, data_object, init_tracing, now_ms, params, south_event,
    standard_config, CapturingConnection, CapturingForwarder, FakeTransport, STANDARD_POINTS,
};
use ng_plugin_iec104_server::{
    config::ServerMode,
    protocol::frame::{
        asdu::{Cause, TypeID},
        mproc::MonitoringInfo,
        time::Cp56Time2a,
    },
    types::{PointValue, Quality},
    ControlDestination, Iec104ServerPlugin, Reading, ReadingField, ReadingValue, SlaveTransport,
};
use serde_json::json;
use std::{sync::atomic::Ordering, time::Duration};

const TS: i64 = 1_700_000_000_123;

#[test]
fn spontaneous_changes_are_queued_with_configured_type() -> anyhow::Result<()> {
    init_tracing();
    let transport = FakeTransport::new();
    let plugin = Iec104ServerPlugin::new(standard_config()?, transport.clone());

    let consumed = plugin.send_readings(&[data_object(
        "M_SP_TB_1",
        45,
        700,
        3,
        Some(ReadingValue::Integer(1)),
        vec![
            ("do_ts", ReadingValue::Integer(TS)),
            ("do_test", ReadingValue::Integer(1)),
        ],
    )]);
    assert_eq!(consumed, 1);

    let queued = transport.enqueued();
    assert_eq!(queued.len(), 1);
    let asdu = &queued[0];
    assert_eq!(asdu.type_id(), TypeID::M_SP_TB_1);
    assert_eq!(asdu.cause(), Cause::Spontaneous);
    assert_eq!(asdu.common_addr(), 45);
    assert_eq!(asdu.orig_addr(), 0);
    assert!(asdu.is_test());

    let infos = asdu.get_monitoring_infos(&params())?;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].ioa(), 700);
    assert_eq!(infos[0].time().map(|t| t.timestamp_ms), Some(TS));
    match infos[0].clone() {
        MonitoringInfo::SinglePoint(mut sp) => assert!(sp.siq.spi().get()),
        other => panic!("unexpected {other:?}"),
    }
    Ok(())
}

#[test]
fn untimed_update_of_timed_point_is_stamped() -> anyhow::Result<()> {
    init_tracing();
    let transport = FakeTransport::new();
    let plugin = Iec104ServerPlugin::new(standard_config()?, transport.clone());

    let before = now_ms();
    plugin.send_readings(&[data_object(
        "M_SP_NA_1",
        45,
        700,
        1,
        Some(ReadingValue::Integer(0)),
        vec![],
    )]);
    let point = plugin.point(45, 700).ok_or_else(|| anyhow::anyhow!("point missing"))?;
    let stamped = point.timestamp.map(|t| t.timestamp_ms).unwrap_or_default();
    assert!(stamped >= before);

    let queued = transport.enqueued();
    assert_eq!(queued[0].type_id(), TypeID::M_SP_TB_1);
    assert_eq!(queued[0].cause(), Cause::Periodic);
    assert!(!queued[0].is_test());
    Ok(())
}

#[test]
fn interrogated_values_update_without_push() -> anyhow::Result<()> {
    init_tracing();
    let transport = FakeTransport::new();
    let plugin = Iec104ServerPlugin::new(standard_config()?, transport.clone());

    let initial = plugin.point(45, 672).ok_or_else(|| anyhow::anyhow!("point missing"))?;
    assert_eq!(initial.quality, Quality::INVALID);

    plugin.send_readings(&[data_object(
        "M_SP_NA_1",
        45,
        672,
        20,
        Some(ReadingValue::Integer(1)),
        vec![],
    )]);
    assert!(transport.enqueued().is_empty());

    let point = plugin.point(45, 672).ok_or_else(|| anyhow::anyhow!("point missing"))?;
    assert_eq!(point.value, PointValue::Single(true));
    assert_eq!(point.quality, Quality::GOOD);
    Ok(())
}

#[test]
fn unusable_readings_are_not_consumed() -> anyhow::Result<()> {
    init_tracing();
    let transport = FakeTransport::new();
    let plugin = Iec104ServerPlugin::new(standard_config()?, transport.clone());

    let plain = Reading::new(
        "pump",
        vec![ReadingField::new("speed", ReadingValue::Integer(3))],
    );
    let missing_address = Reading::new(
        "45-672",
        vec![ReadingField::new(
            "data_object",
            ReadingValue::Object(vec![ReadingField::new(
                "do_type",
                ReadingValue::Str("M_SP_NA_1".to_string()),
            )]),
        )],
    );
    let unknown_point = data_object("M_SP_NA_1", 45, 9999, 3, Some(ReadingValue::Integer(1)), vec![]);
    let wrong_kind = data_object("M_DP_NA_1", 45, 672, 3, Some(ReadingValue::Integer(2)), vec![]);

    let consumed = plugin.send_readings(&[plain, missing_address, unknown_point, wrong_kind]);
    assert_eq!(consumed, 2);
    assert!(transport.enqueued().is_empty());

    let point = plugin.point(45, 672).ok_or_else(|| anyhow::anyhow!("point missing"))?;
    assert_eq!(point.value, PointValue::Single(false));
    Ok(())
}

#[test]
fn out_of_range_value_keeps_previous_value() -> anyhow::Result<()> {
    init_tracing();
    let plugin = Iec104ServerPlugin::new(standard_config()?, FakeTransport::new());

    plugin.send_readings(&[data_object(
        "M_ME_NA_1",
        45,
        984,
        3,
        Some(ReadingValue::Float(0.25)),
        vec![],
    )]);
    plugin.send_readings(&[data_object(
        "M_ME_NA_1",
        45,
        984,
        3,
        Some(ReadingValue::Float(7.5)),
        vec![("do_quality_iv", ReadingValue::Integer(1))],
    )]);

    let point = plugin.point(45, 984).ok_or_else(|| anyhow::anyhow!("point missing"))?;
    assert_eq!(point.value, PointValue::Normalized(0.25));
    assert!(point.quality.invalid);
    Ok(())
}

#[test]
fn clock_synchronisation_follows_time_sync_setting() -> anyhow::Result<()> {
    init_tracing();
    let conn = CapturingConnection::new(1);
    let requested = Cp56Time2a::from_millis(TS);

    let enabled = Iec104ServerPlugin::new(
        build_config(json!({}), json!({ "time_sync": true }), STANDARD_POINTS)?,
        FakeTransport::new(),
    );
    let before = now_ms();
    assert!(enabled.handle_asdu(&as_dyn(&conn), &clock_sync(45, requested)?));
    assert_eq!(
        conn.summary(),
        vec![(TypeID::C_CS_NA_1, Cause::ActivationCon, false)]
    );
    let (_, replied) = conn.sent()[0].get_clock_synchronization_cmd(&params())?;
    assert!(replied.timestamp_ms >= before - 1_000);

    conn.clear();
    let disabled = Iec104ServerPlugin::new(standard_config()?, FakeTransport::new());
    assert!(disabled.handle_asdu(&as_dyn(&conn), &clock_sync(45, requested)?));
    assert_eq!(
        conn.summary(),
        vec![(TypeID::C_CS_NA_1, Cause::ActivationCon, true)]
    );

    conn.clear();
    let mut spontaneous = clock_sync(45, requested)?;
    spontaneous.set_cause(Cause::Spontaneous);
    assert!(enabled.handle_asdu(&as_dyn(&conn), &spontaneous));
    assert_eq!(
        conn.summary(),
        vec![(TypeID::C_CS_NA_1, Cause::UnknownCOT, true)]
    );
    Ok(())
}

#[test]
fn connection_requests_are_filtered_by_redundancy_groups() -> anyhow::Result<()> {
    init_tracing();
    let open = Iec104ServerPlugin::new(standard_config()?, FakeTransport::new());
    assert!(open.handle_connection_request("10.0.0.1"));

    let config = build_config(
        json!({
            "redundancy_groups": [
                {
                    "rg_name": "red-group-1",
                    "connections": [ { "clt_ip": "192.168.2.10" }, { "clt_ip": "192.168.2.11" } ]
                }
            ]
        }),
        json!({}),
        STANDARD_POINTS,
    )?;
    let restricted = Iec104ServerPlugin::new(config, FakeTransport::new());
    assert!(restricted.handle_connection_request("192.168.2.11"));
    assert!(!restricted.handle_connection_request("192.168.2.12"));
    Ok(())
}

#[test]
fn listener_follows_south_connection_status() -> anyhow::Result<()> {
    init_tracing();
    let transport = FakeTransport::new();
    let config = build_config(
        json!({ "mode": "accept_if_south_connx_started" }),
        json!({ "south_monitoring": [ { "asset": "CONSTAT-1" } ] }),
        STANDARD_POINTS,
    )?;
    let plugin = Iec104ServerPlugin::new(config, transport.clone());

    plugin.tick(now_ms());
    assert!(!transport.is_running());

    assert_eq!(plugin.send_readings(&[south_event("CONSTAT-1", "started")]), 1);
    assert!(plugin.south_status("CONSTAT-1").is_some_and(|s| s.is_started()));
    plugin.tick(now_ms());
    assert!(transport.is_running());
    plugin.tick(now_ms());
    assert_eq!(transport.starts.load(Ordering::SeqCst), 1);

    plugin.send_readings(&[south_event("CONSTAT-1", "not connected")]);
    plugin.tick(now_ms());
    assert!(!transport.is_running());
    assert_eq!(transport.stops.load(Ordering::SeqCst), 1);

    // events for other assets change nothing
    plugin.send_readings(&[south_event("CONSTAT-2", "started")]);
    plugin.tick(now_ms());
    assert!(!transport.is_running());
    Ok(())
}

#[test]
fn conditional_mode_without_monitored_assets_always_listens() -> anyhow::Result<()> {
    init_tracing();
    let transport = FakeTransport::new();
    let config = build_config(
        json!({ "mode": "accept_if_south_connx_started" }),
        json!({}),
        STANDARD_POINTS,
    )?;
    assert_eq!(config.transport.mode, ServerMode::AcceptIfSouthConnxStarted);
    let plugin = Iec104ServerPlugin::new(config, transport.clone());

    plugin.tick(now_ms());
    assert!(transport.is_running());
    Ok(())
}

#[test]
fn connection_status_is_requested_once() -> anyhow::Result<()> {
    init_tracing();
    let plugin = Iec104ServerPlugin::new(standard_config()?, FakeTransport::new());

    // no control function yet
    plugin.tick(now_ms());

    let forwarder = CapturingForwarder::new();
    plugin.register_control(forwarder.clone());
    plugin.tick(now_ms());
    plugin.tick(now_ms());

    let calls = forwarder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "request_connection_status");
    assert!(calls[0].params.is_empty());
    assert_eq!(
        calls[0].destination,
        ControlDestination::Service("iec104south".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn start_and_stop_drive_the_listener() -> anyhow::Result<()> {
    init_tracing();
    let transport = FakeTransport::new();
    let plugin = Iec104ServerPlugin::new(standard_config()?, transport.clone());
    let forwarder = CapturingForwarder::new();
    plugin.register_control(forwarder.clone());

    plugin.start()?;
    plugin.start()?;
    assert!(plugin.is_started());
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(transport.is_running());
    assert_eq!(transport.starts.load(Ordering::SeqCst), 1);
    assert_eq!(forwarder.calls().len(), 1);

    plugin.stop().await;
    assert!(!plugin.is_started());
    assert!(!transport.is_running());
    assert_eq!(transport.stops.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn start_outside_a_runtime_fails() -> anyhow::Result<()> {
    init_tracing();
    let plugin = Iec104ServerPlugin::new(standard_config()?, FakeTransport::new());
    assert!(plugin.start().is_err());
    assert!(!plugin.is_started());
    Ok(())
}

#[test]
fn reconfigure_replaces_the_point_table() -> anyhow::Result<()> {
    init_tracing();
    let plugin = Iec104ServerPlugin::new(standard_config()?, FakeTransport::new());
    plugin.send_readings(&[data_object(
        "M_SP_NA_1",
        45,
        672,
        3,
        Some(ReadingValue::Integer(1)),
        vec![],
    )]);

    let replacement = build_config(
        json!({}),
        json!({ "time_sync": true }),
        &[
            ("TS1", "45-672", "M_SP_NA_1", "station"),
            ("NEW", "46-1", "M_ME_NC_1", "station"),
        ],
    )?;
    tokio_test::block_on(plugin.reconfigure(replacement))?;

    assert!(plugin.config().application.time_sync);
    assert!(plugin.point(45, 673).is_none());
    assert!(plugin.point(46, 1).is_some());
    let reloaded = plugin.point(45, 672).ok_or_else(|| anyhow::anyhow!("point missing"))?;
    assert_eq!(reloaded.quality, Quality::INVALID);
    assert_eq!(reloaded.value, PointValue::Single(false));
    Ok(())
}

#[tokio::test]
async fn reconfigure_keeps_a_started_plugin_running() -> anyhow::Result<()> {
    init_tracing();
    let transport = FakeTransport::new();
    let plugin = Iec104ServerPlugin::new(standard_config()?, transport.clone());
    plugin.start()?;

    plugin.reconfigure(standard_config()?).await?;
    assert!(plugin.is_started());
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(transport.is_running());

    plugin.stop().await;
    Ok(())
}
