use super::flight_mode::FlightMode;
use super::mavlink::{
    self, Frame, MavMessage, MSG_COMMAND_ACK, MSG_COMMAND_LONG, MSG_HEARTBEAT, Parser,
};
use super::{LinkState, SitlVehicle, TelemetrySim, VehicleBackend, VehicleKind};
use crate::schema::{
    AckStatus, CommandAck, CommandDetail, GotoParams, HoverParams, MissionState, TakeoffParams,
    Waypoint,
};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Tick period of the default 5 Hz loop.
const DT: f64 = 0.2;

async fn cmd(sim: &mut TelemetrySim, id: &str, detail: CommandDetail) -> CommandAck {
    sim.send_command(id, &detail).await.unwrap()
}

/// Runs ticks until a terminal ack for `id` shows up, panicking after
/// `max_ticks`.
fn fly_until_done(sim: &mut TelemetrySim, id: &str, max_ticks: usize) -> CommandAck {
    for _ in 0..max_ticks {
        for ack in sim.tick(DT) {
            if ack.id == id {
                return ack;
            }
        }
    }
    panic!("no terminal ack for {id} within {max_ticks} ticks");
}

#[tokio::test]
async fn test_sim_arm_and_takeoff() {
    let mut sim = TelemetrySim::new(42);
    assert!(!sim.is_armed());

    let ack = cmd(&mut sim, "arm-1", CommandDetail::Arm).await;
    assert_eq!(ack.status, AckStatus::Completed);
    assert!(sim.is_armed());

    let ack = cmd(&mut sim, "arm-2", CommandDetail::Arm).await;
    assert_eq!(ack, CommandAck::rejected("arm-2", "Already armed"));

    let ack =
        cmd(&mut sim, "to-1", CommandDetail::Takeoff(TakeoffParams { alt: 10.0 })).await;
    assert_eq!(ack.status, AckStatus::Executing);
    assert_eq!(sim.mode(), FlightMode::Guided);

    let done = fly_until_done(&mut sim, "to-1", 60);
    assert_eq!(done.status, AckStatus::Completed);
    let snap = sim.telemetry();
    assert!((snap.position.relative_alt - 10.0).abs() < 0.1, "{}", snap.position.relative_alt);
    assert_eq!(snap.mode, "GUIDED");
}

#[tokio::test]
async fn test_sim_takeoff_requires_arm() {
    let mut sim = TelemetrySim::new(42);
    let ack =
        cmd(&mut sim, "to-1", CommandDetail::Takeoff(TakeoffParams { alt: 10.0 })).await;
    assert_eq!(ack, CommandAck::rejected("to-1", "Not armed"));
}

#[tokio::test]
async fn test_sim_goto_flies_to_target() {
    let mut sim = TelemetrySim::new(42);
    cmd(&mut sim, "arm", CommandDetail::Arm).await;
    cmd(&mut sim, "to", CommandDetail::Takeoff(TakeoffParams { alt: 10.0 })).await;
    fly_until_done(&mut sim, "to", 60);

    // Roughly 100 m north at 5 m/s, one meter per tick.
    let target = GotoParams { lat: 26.5009, lon: 80.3, alt: 10.0, speed: None };
    let ack = cmd(&mut sim, "go", CommandDetail::Goto(target)).await;
    assert_eq!(ack.status, AckStatus::Executing);

    let done = fly_until_done(&mut sim, "go", 200);
    assert_eq!(done.status, AckStatus::Completed);
    let snap = sim.telemetry();
    assert!((snap.position.lat - 26.5009).abs() < 1e-9);
    assert!((snap.position.lon - 80.3).abs() < 1e-9);
    assert_eq!(snap.velocity.speed, 0.0);
}

#[tokio::test]
async fn test_sim_rtl_on_ground_auto_disarms() {
    let mut sim = TelemetrySim::new(42);
    cmd(&mut sim, "arm", CommandDetail::Arm).await;
    let ack = cmd(&mut sim, "rtl", CommandDetail::Rtl).await;
    assert_eq!(ack.status, AckStatus::Executing);
    assert_eq!(sim.mode(), FlightMode::Rtl);

    let done = fly_until_done(&mut sim, "rtl", 5);
    assert_eq!(done.status, AckStatus::Completed);
    assert!(!sim.is_armed());
    assert_eq!(sim.mode(), FlightMode::Stabilize);
}

#[tokio::test]
async fn test_sim_rtl_airborne_stays_armed() {
    let mut sim = TelemetrySim::new(42);
    cmd(&mut sim, "arm", CommandDetail::Arm).await;
    cmd(&mut sim, "to", CommandDetail::Takeoff(TakeoffParams { alt: 10.0 })).await;
    fly_until_done(&mut sim, "to", 60);
    let target = GotoParams { lat: 26.5002, lon: 80.3002, alt: 10.0, speed: None };
    cmd(&mut sim, "go", CommandDetail::Goto(target)).await;
    fly_until_done(&mut sim, "go", 200);

    cmd(&mut sim, "rtl", CommandDetail::Rtl).await;
    let done = fly_until_done(&mut sim, "rtl", 200);
    assert_eq!(done.status, AckStatus::Completed);
    // Back over launch but still at altitude.
    assert!(sim.is_armed());
    let snap = sim.telemetry();
    assert!((snap.position.lat - 26.5).abs() < 1e-9);
    assert!(snap.position.relative_alt > 5.0);
}

#[tokio::test]
async fn test_sim_disarm_fails_inflight_commands() {
    let mut sim = TelemetrySim::new(42);
    cmd(&mut sim, "arm", CommandDetail::Arm).await;
    cmd(&mut sim, "to", CommandDetail::Takeoff(TakeoffParams { alt: 10.0 })).await;
    // One tick of climb: 0.4 m, still inside the ground band where a
    // disarm is permitted.
    sim.tick(DT);

    let ack = cmd(&mut sim, "dis", CommandDetail::Disarm).await;
    assert_eq!(ack.status, AckStatus::Completed);
    assert!(!sim.is_armed());

    let acks = sim.tick(DT);
    assert_eq!(acks, vec![CommandAck::failed("to", "Disarmed")]);
}

#[tokio::test]
async fn test_sim_hover_resolves_on_sim_clock() {
    let mut sim = TelemetrySim::new(42);
    cmd(&mut sim, "arm", CommandDetail::Arm).await;
    let ack =
        cmd(&mut sim, "hov", CommandDetail::Hover(HoverParams { duration: 1.0 })).await;
    assert_eq!(ack.status, AckStatus::Executing);
    assert_eq!(sim.mode(), FlightMode::Hold);

    // 1 s of simulated time is five ticks.
    let done = fly_until_done(&mut sim, "hov", 6);
    assert_eq!(done.status, AckStatus::Completed);

    // Zero duration holds position without a pending command.
    let ack =
        cmd(&mut sim, "hov2", CommandDetail::Hover(HoverParams { duration: 0.0 })).await;
    assert_eq!(ack.status, AckStatus::Completed);
}

#[tokio::test]
async fn test_sim_mission_follows_waypoints() {
    let mut sim = TelemetrySim::new(42);
    cmd(&mut sim, "arm", CommandDetail::Arm).await;
    cmd(&mut sim, "to", CommandDetail::Takeoff(TakeoffParams { alt: 10.0 })).await;
    fly_until_done(&mut sim, "to", 60);

    let wps = vec![
        Waypoint { lat: 26.5001, lon: 80.3, alt: 10.0, command_code: 16 },
        Waypoint { lat: 26.5001, lon: 80.3001, alt: 10.0, command_code: 16 },
    ];
    let ack = cmd(&mut sim, "up", CommandDetail::UploadMission(wps)).await;
    assert_eq!(ack.status, AckStatus::Completed);

    let ack = cmd(&mut sim, "start", CommandDetail::StartMission).await;
    assert_eq!(ack.status, AckStatus::Executing);
    assert_eq!(sim.mode(), FlightMode::Auto);

    let done = fly_until_done(&mut sim, "start", 300);
    assert_eq!(done.status, AckStatus::Completed);
    assert_eq!(sim.mode(), FlightMode::Hold);
    assert_eq!(sim.mission().unwrap().state(), MissionState::Completed);
    let snap = sim.telemetry();
    assert!((snap.position.lat - 26.5001).abs() < 1e-9);
    assert!((snap.position.lon - 80.3001).abs() < 1e-9);
}

#[tokio::test]
async fn test_sim_abort_fails_running_mission() {
    let mut sim = TelemetrySim::new(42);
    cmd(&mut sim, "arm", CommandDetail::Arm).await;
    let wps = vec![Waypoint { lat: 26.6, lon: 80.4, alt: 10.0, command_code: 16 }];
    cmd(&mut sim, "up", CommandDetail::UploadMission(wps)).await;
    cmd(&mut sim, "start", CommandDetail::StartMission).await;

    let ack = cmd(&mut sim, "abort", CommandDetail::AbortMission).await;
    assert_eq!(ack.status, AckStatus::Completed);
    assert_eq!(sim.mode(), FlightMode::Hold);
    assert_eq!(sim.mission().unwrap().state(), MissionState::Aborted);

    let acks = sim.tick(DT);
    assert_eq!(acks, vec![CommandAck::failed("start", "Mission aborted")]);
}

#[tokio::test]
async fn test_sim_start_without_mission_rejected() {
    let mut sim = TelemetrySim::new(42);
    cmd(&mut sim, "arm", CommandDetail::Arm).await;
    let ack = cmd(&mut sim, "start", CommandDetail::StartMission).await;
    assert_eq!(ack, CommandAck::rejected("start", "No mission uploaded"));
}

#[tokio::test]
async fn test_sim_battery_drains_monotonically_while_armed() {
    let mut sim = TelemetrySim::new(42);
    let level_before = sim.telemetry().battery.level;
    for _ in 0..50 {
        sim.tick(DT);
    }
    // Disarmed: no drain at all.
    assert_eq!(sim.telemetry().battery.level, level_before);

    cmd(&mut sim, "arm", CommandDetail::Arm).await;
    let mut last_voltage = sim.telemetry().battery.voltage;
    for _ in 0..200 {
        sim.tick(DT);
        let voltage = sim.telemetry().battery.voltage;
        assert!(voltage <= last_voltage);
        last_voltage = voltage;
    }
    assert!(sim.telemetry().battery.voltage < 12.6);
}

#[tokio::test]
async fn test_sim_is_deterministic_per_seed() {
    let mut a = TelemetrySim::new(7);
    let mut b = TelemetrySim::new(7);
    let script: Vec<(&str, CommandDetail)> = vec![
        ("arm", CommandDetail::Arm),
        ("to", CommandDetail::Takeoff(TakeoffParams { alt: 12.0 })),
        ("go", CommandDetail::Goto(GotoParams { lat: 26.5004, lon: 80.3004, alt: 12.0, speed: None })),
    ];
    for (id, detail) in script {
        let ack_a = a.send_command(id, &detail).await.unwrap();
        let ack_b = b.send_command(id, &detail).await.unwrap();
        assert_eq!(ack_a, ack_b);
    }
    for _ in 0..300 {
        let acks_a = a.tick(DT);
        let acks_b = b.tick(DT);
        assert_eq!(acks_a, acks_b);
        assert!(a.telemetry().same_state(&b.telemetry()));
    }
}

#[tokio::test]
async fn test_sim_different_seeds_diverge_on_current() {
    let mut a = TelemetrySim::new(1);
    let mut b = TelemetrySim::new(2);
    a.send_command("arm", &CommandDetail::Arm).await.unwrap();
    b.send_command("arm", &CommandDetail::Arm).await.unwrap();
    let mut diverged = false;
    for _ in 0..20 {
        a.tick(DT);
        b.tick(DT);
        if a.telemetry().battery.current != b.telemetry().battery.current {
            diverged = true;
        }
    }
    assert!(diverged);
}

fn heartbeat_frame(seq: u8, custom_mode: u32, base_mode: u8) -> Frame {
    let mut payload = Vec::new();
    payload.extend_from_slice(&custom_mode.to_le_bytes());
    payload.push(2); // MAV_TYPE_QUADROTOR
    payload.push(3); // MAV_AUTOPILOT_ARDUPILOTMEGA
    payload.push(base_mode);
    payload.push(0); // system_status
    payload.push(3); // mavlink_version
    Frame { seq, sysid: 1, compid: 1, msgid: MSG_HEARTBEAT, payload }
}

#[test]
fn test_mavlink_encode_parse_roundtrip() {
    let frame = heartbeat_frame(7, 4, mavlink::MODE_FLAG_ARMED | mavlink::MODE_FLAG_CUSTOM);
    let bytes = frame.encode().unwrap();
    assert_eq!(bytes[0], mavlink::MAGIC);
    assert_eq!(bytes.len(), 6 + 9 + 2);
    // X.25 checksum over len..payload plus the heartbeat crc_extra of 50.
    assert_eq!(&bytes[15..], &[0x7F, 0x86]);

    let mut parser = Parser::new();
    let frames = parser.push(&bytes);
    assert_eq!(frames, vec![frame.clone()]);
    assert_eq!(parser.bad_crc(), 0);
    assert_eq!(parser.skipped(), 0);

    let msg = MavMessage::decode(&frame).unwrap();
    assert_eq!(msg, MavMessage::Heartbeat { custom_mode: 4, base_mode: 0x81 });
}

#[test]
fn test_mavlink_parser_handles_split_input() {
    let bytes = heartbeat_frame(0, 0, 0).encode().unwrap();
    let mut parser = Parser::new();
    assert!(parser.push(&bytes[..5]).is_empty());
    assert!(parser.push(&bytes[5..10]).is_empty());
    let frames = parser.push(&bytes[10..]);
    assert_eq!(frames.len(), 1);
}

#[test]
fn test_mavlink_parser_resyncs_past_garbage() {
    let bytes = heartbeat_frame(1, 5, 0).encode().unwrap();
    let mut input = vec![0x00, 0x42, 0x13];
    input.extend_from_slice(&bytes);
    let mut parser = Parser::new();
    let frames = parser.push(&input);
    assert_eq!(frames.len(), 1);
    assert_eq!(parser.skipped(), 3);
}

#[test]
fn test_mavlink_parser_drops_corrupted_frame() {
    let mut bytes = heartbeat_frame(1, 5, 0).encode().unwrap();
    bytes[8] ^= 0xFF; // flip a payload byte
    let good = heartbeat_frame(2, 6, 0).encode().unwrap();
    bytes.extend_from_slice(&good);

    let mut parser = Parser::new();
    let frames = parser.push(&bytes);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].seq, 2);
    assert!(parser.bad_crc() >= 1);
}

#[test]
fn test_mavlink_attitude_decode_keeps_axes_apart() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&1234u32.to_le_bytes()); // time_boot_ms
    for v in [0.1f32, 0.2, 0.3, 0.0, 0.0, 0.0] {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    let frame = Frame { seq: 0, sysid: 1, compid: 1, msgid: mavlink::MSG_ATTITUDE, payload };
    let Some(MavMessage::Attitude { roll, pitch, yaw }) = MavMessage::decode(&frame) else {
        panic!("attitude frame did not decode");
    };
    assert!((roll - 0.1).abs() < 1e-6);
    assert!((pitch - 0.2).abs() < 1e-6);
    assert!((yaw - 0.3).abs() < 1e-6);
}

#[test]
fn test_mavlink_vfr_hud_groundspeed_decode() {
    let mut payload = Vec::new();
    for v in [12.5f32, 4.5] {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    payload.extend_from_slice(&[0u8; 12]);
    let frame = Frame { seq: 0, sysid: 1, compid: 1, msgid: mavlink::MSG_VFR_HUD, payload };
    let msg = MavMessage::decode(&frame).unwrap();
    assert_eq!(msg, MavMessage::VfrHud { groundspeed: 4.5 });
}

#[test]
fn test_mavlink_command_ack_decode() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&400u16.to_le_bytes());
    payload.push(0); // MAV_RESULT_ACCEPTED
    let frame = Frame { seq: 0, sysid: 1, compid: 1, msgid: MSG_COMMAND_ACK, payload };
    let msg = MavMessage::decode(&frame).unwrap();
    assert_eq!(msg, MavMessage::CommandAck { command: 400, result: 0 });

    let bytes = frame.encode().unwrap();
    let mut parser = Parser::new();
    let frames = parser.push(&bytes);
    assert_eq!(frames.len(), 1);
}

#[test]
fn test_mavlink_payload_builders_lengths() {
    assert_eq!(mavlink::heartbeat_payload().len(), 9);
    assert_eq!(mavlink::command_long_payload(400, 1, 1, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).len(), 33);
    assert_eq!(
        mavlink::command_int_payload(192, 1, 1, [0.0; 4], 26.5, 80.3, 10.0).len(),
        35
    );
    assert_eq!(mavlink::mission_count_payload(3, 1, 1).len(), 4);
    assert_eq!(mavlink::mission_item_int_payload(0, 16, 1, 1, 26.5, 80.3, 10.0).len(), 37);
}

#[test]
fn test_mavlink_command_int_scales_coordinates() {
    let payload = mavlink::command_int_payload(192, 1, 1, [0.0; 4], 26.5, -80.3, 10.0);
    let lat = i32::from_le_bytes(payload[16..20].try_into().unwrap());
    let lon = i32::from_le_bytes(payload[20..24].try_into().unwrap());
    assert_eq!(lat, 265_000_000);
    assert_eq!(lon, -803_000_000);
}

/// Minimal autopilot stand-in: answers every inbound frame with a
/// heartbeat and accepts every COMMAND_LONG.
async fn fake_autopilot() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut parser = Parser::new();
        let mut buf = [0u8; 2048];
        let mut seq = 0u8;
        loop {
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            for frame in parser.push(&buf[..n]) {
                let hb = heartbeat_frame(seq, 0, 0);
                seq = seq.wrapping_add(1);
                socket.send_to(&hb.encode().unwrap(), peer).await.unwrap();
                if frame.msgid == MSG_COMMAND_LONG {
                    let command =
                        u16::from_le_bytes([frame.payload[28], frame.payload[29]]);
                    let mut payload = command.to_le_bytes().to_vec();
                    payload.push(0); // MAV_RESULT_ACCEPTED
                    let ack =
                        Frame { seq, sysid: 1, compid: 1, msgid: MSG_COMMAND_ACK, payload };
                    seq = seq.wrapping_add(1);
                    socket.send_to(&ack.encode().unwrap(), peer).await.unwrap();
                }
            }
        }
    });
    (addr, task)
}

#[tokio::test]
async fn test_sitl_connects_and_resolves_command_ack() {
    let (addr, task) = fake_autopilot().await;
    let mut sitl = SitlVehicle::connect(&addr.to_string(), 5).await.unwrap();
    assert_eq!(sitl.kind(), VehicleKind::Sitl);
    assert_eq!(sitl.link(), LinkState::Connected);

    let ack = sitl.send_command("a1", &CommandDetail::Arm).await.unwrap();
    assert_eq!(ack, CommandAck::executing("a1"));

    let mut done = Vec::new();
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        done.extend(sitl.tick(0.2));
        if !done.is_empty() {
            break;
        }
    }
    assert_eq!(done, vec![CommandAck::completed("a1")]);
    task.abort();
}

#[tokio::test(start_paused = true)]
async fn test_sitl_connect_fails_without_autopilot() {
    // A bound but silent socket: the probes get no heartbeat back and the
    // backoff runs on the paused clock.
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();
    match SitlVehicle::connect(&addr.to_string(), 5).await {
        Err(super::VehicleError::LinkDown(state)) => {
            assert_eq!(state, LinkState::Disconnected);
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("connect succeeded against a silent endpoint"),
    }
}

#[test]
fn test_flight_mode_custom_mode_mapping() {
    assert_eq!(FlightMode::Guided.custom_mode(), 4);
    assert_eq!(FlightMode::from_custom_mode(4), Some(FlightMode::Guided));
    assert_eq!(FlightMode::from_custom_mode(6), Some(FlightMode::Rtl));
    // HOLD shares the LOITER custom mode; decoding picks LOITER.
    assert_eq!(FlightMode::Hold.custom_mode(), FlightMode::Loiter.custom_mode());
    assert_eq!(FlightMode::from_custom_mode(99), None);
}
