use super::flight_mode::FlightMode;
use super::mavlink::{self, Frame, MavMessage, Parser};
use super::{LinkState, VehicleBackend, VehicleError, VehicleKind};
use crate::schema::{
    Attitude, Battery, CommandAck, CommandDetail, Position, TelemetrySnapshot, Velocity,
};
use crate::schema::telemetry::round2;
use crate::{info, log, telem, warn};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// What an outgoing command is waiting for on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKey {
    /// A `COMMAND_ACK` echoing this MAVLink command id.
    Command(u16),
    /// The `MISSION_ACK` closing a mission upload.
    Mission,
}

#[derive(Debug)]
struct PendingAck {
    id: String,
    key: AckKey,
    deadline: Instant,
}

/// Telemetry fields cached from the periodic autopilot messages.
#[derive(Debug)]
struct TelemetryCache {
    lat: f64,
    lon: f64,
    alt_msl: f64,
    alt_rel: f64,
    roll: f64,
    pitch: f64,
    yaw: f64,
    vx: f64,
    vy: f64,
    vz: f64,
    speed: f64,
    voltage: f64,
    current: Option<f64>,
    level: u8,
    mode: String,
    armed: bool,
}

impl Default for TelemetryCache {
    fn default() -> Self {
        Self {
            lat: 0.0,
            lon: 0.0,
            alt_msl: 0.0,
            alt_rel: 0.0,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            vx: 0.0,
            vy: 0.0,
            vz: 0.0,
            speed: 0.0,
            voltage: 0.0,
            current: None,
            level: 0,
            mode: "UNKNOWN".to_string(),
            armed: false,
        }
    }
}

/// State shared between the owning backend handle and its reader task.
#[derive(Debug)]
struct Shared {
    cache: RwLock<TelemetryCache>,
    pending: Mutex<Vec<PendingAck>>,
    completions: Mutex<Vec<CommandAck>>,
    link: watch::Sender<LinkState>,
    last_heartbeat: Mutex<Option<Instant>>,
    /// Autopilot (sysid, compid), learned from its first heartbeat.
    target: Mutex<(u8, u8)>,
}

/// Live-link backend speaking the MAVLink v1 subset over UDP.
///
/// A spawned reader task decodes incoming frames into the telemetry cache
/// and resolves pending acknowledgments; `tick` does the serialized
/// bookkeeping (heartbeat staleness, deadline expiry, completion drain) and
/// never touches the network beyond a non-blocking heartbeat send.
pub struct SitlVehicle {
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    seq: u8,
    tick_count: u64,
    ticks_per_heartbeat: u64,
}

impl SitlVehicle {
    /// No autopilot heartbeat for this long: connected degrades.
    const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);
    /// Continued silence past this total: the link counts as lost and the
    /// owning process falls back to the simulator.
    const LINK_GRACE: Duration = Duration::from_secs(10);
    /// Bounded wait for a command/mission acknowledgment.
    const ACK_TIMEOUT: Duration = Duration::from_secs(3);
    /// Initial connect: heartbeat probes with capped exponential backoff.
    const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
    const BACKOFF_CAP: Duration = Duration::from_secs(30);
    const CONNECT_ATTEMPTS: u32 = 5;

    /// Binds a local UDP port, starts the reader task and probes for the
    /// first autopilot heartbeat with capped exponential backoff. An `Err`
    /// here is the caller's cue to fall back to the simulator.
    pub async fn connect(addr: &str, telemetry_rate: u32) -> Result<SitlVehicle, VehicleError> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        socket.connect(addr).await?;
        info!("Connecting to MAVLink endpoint {addr}");

        let (link_tx, mut link_rx) = watch::channel(LinkState::Connecting);
        let shared = Arc::new(Shared {
            cache: RwLock::new(TelemetryCache::default()),
            pending: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
            link: link_tx,
            last_heartbeat: Mutex::new(None),
            target: Mutex::new((1, 1)),
        });

        let cancel = CancellationToken::new();
        tokio::spawn(Self::read_loop(Arc::clone(&socket), Arc::clone(&shared), cancel.clone()));

        let mut vehicle = SitlVehicle {
            socket,
            shared,
            cancel,
            seq: 0,
            tick_count: 0,
            ticks_per_heartbeat: u64::from(telemetry_rate.max(1)),
        };

        let mut delay = Self::BACKOFF_INITIAL;
        for attempt in 1..=Self::CONNECT_ATTEMPTS {
            vehicle.send_frame(mavlink::MSG_HEARTBEAT, mavlink::heartbeat_payload()).await?;
            let wait = tokio::time::timeout(delay, async {
                while *link_rx.borrow_and_update() != LinkState::Connected {
                    if link_rx.changed().await.is_err() {
                        break;
                    }
                }
            });
            if wait.await.is_ok() {
                info!("MAVLink heartbeat received, link up");
                return Ok(vehicle);
            }
            warn!("No heartbeat from {addr} (attempt {attempt}), backing off {delay:?}");
            delay = (delay * 2).min(Self::BACKOFF_CAP);
        }
        vehicle.shared.link.send_replace(LinkState::Disconnected);
        Err(VehicleError::LinkDown(LinkState::Disconnected))
    }

    async fn read_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>, cancel: CancellationToken) {
        let mut parser = Parser::new();
        let mut buf = [0u8; 2048];
        loop {
            let received = tokio::select! {
                r = socket.recv(&mut buf) => r,
                () = cancel.cancelled() => break,
            };
            let n = match received {
                Ok(n) => n,
                Err(e) => {
                    warn!("MAVLink socket read error: {e}");
                    continue;
                }
            };
            for frame in parser.push(&buf[..n]) {
                if let Some(msg) = MavMessage::decode(&frame) {
                    Self::handle_message(&shared, &frame, msg);
                }
            }
        }
    }

    fn handle_message(shared: &Shared, frame: &Frame, msg: MavMessage) {
        match msg {
            MavMessage::Heartbeat { custom_mode, base_mode } => {
                *shared.last_heartbeat.lock().unwrap() = Some(Instant::now());
                *shared.target.lock().unwrap() = (frame.sysid, frame.compid);
                {
                    let mut cache = shared.cache.write().unwrap();
                    cache.armed = base_mode & mavlink::MODE_FLAG_ARMED != 0;
                    cache.mode = FlightMode::from_custom_mode(custom_mode)
                        .map_or_else(|| format!("MODE_{custom_mode}"), |m| m.to_string());
                }
                // A fresh heartbeat repairs a degraded link immediately.
                if *shared.link.borrow() != LinkState::Connected {
                    shared.link.send_replace(LinkState::Connected);
                }
            }
            MavMessage::GlobalPositionInt { lat, lon, alt_mm, relative_alt_mm, vx, vy, vz } => {
                let mut cache = shared.cache.write().unwrap();
                cache.lat = f64::from(lat) / 1e7;
                cache.lon = f64::from(lon) / 1e7;
                cache.alt_msl = f64::from(alt_mm) / 1000.0;
                cache.alt_rel = f64::from(relative_alt_mm) / 1000.0;
                cache.vx = f64::from(vx) / 100.0;
                cache.vy = f64::from(vy) / 100.0;
                cache.vz = f64::from(vz) / 100.0;
            }
            MavMessage::Attitude { roll, pitch, yaw } => {
                let mut cache = shared.cache.write().unwrap();
                cache.roll = f64::from(roll).to_degrees();
                cache.pitch = f64::from(pitch).to_degrees();
                cache.yaw = f64::from(yaw).to_degrees().rem_euclid(360.0);
            }
            MavMessage::VfrHud { groundspeed } => {
                shared.cache.write().unwrap().speed = f64::from(groundspeed);
            }
            MavMessage::SysStatus { voltage_mv, current_10ma, battery_remaining } => {
                let mut cache = shared.cache.write().unwrap();
                cache.voltage = round2(f64::from(voltage_mv) / 1000.0);
                cache.current = (current_10ma != -1)
                    .then(|| round2(f64::from(current_10ma) / 100.0));
                cache.level = if battery_remaining >= 0 { battery_remaining as u8 } else { 0 };
            }
            MavMessage::CommandAck { command, result } => {
                telem!("COMMAND_ACK for {command}: result {result}");
                Self::resolve_pending(shared, AckKey::Command(command), result);
            }
            MavMessage::MissionAck { result } => {
                telem!("MISSION_ACK: result {result}");
                Self::resolve_pending(shared, AckKey::Mission, result);
            }
        }
    }

    /// Resolves the oldest pending entry waiting on `key`. Acks queued here
    /// stay queued across link transitions until the supervisor drains them.
    fn resolve_pending(shared: &Shared, key: AckKey, result: u8) {
        let mut pending = shared.pending.lock().unwrap();
        let Some(idx) = pending.iter().position(|p| p.key == key) else {
            return;
        };
        let entry = pending.remove(idx);
        drop(pending);
        let ack = if result == mavlink::RESULT_ACCEPTED {
            CommandAck::completed(&entry.id)
        } else {
            CommandAck::failed(&entry.id, mavlink::result_reason(result))
        };
        shared.completions.lock().unwrap().push(ack);
    }

    fn register_pending(&self, id: &str, key: AckKey) {
        self.shared.pending.lock().unwrap().push(PendingAck {
            id: id.to_string(),
            key,
            deadline: Instant::now() + Self::ACK_TIMEOUT,
        });
    }

    async fn send_frame(&mut self, msgid: u8, payload: Vec<u8>) -> Result<(), VehicleError> {
        let frame = Frame { seq: self.seq, sysid: 255, compid: 190, msgid, payload };
        self.seq = self.seq.wrapping_add(1);
        // encode only fails for ids outside the subset, which we never send
        let bytes = frame.encode().ok_or_else(|| {
            VehicleError::Io(std::io::Error::other("unencodable message id"))
        })?;
        self.socket.send(&bytes).await?;
        Ok(())
    }

    async fn send_command_long(
        &mut self,
        id: &str,
        command: u16,
        params: [f32; 7],
    ) -> Result<(), VehicleError> {
        let (sys, comp) = *self.shared.target.lock().unwrap();
        let payload = mavlink::command_long_payload(command, sys, comp, params);
        self.send_frame(mavlink::MSG_COMMAND_LONG, payload).await?;
        self.register_pending(id, AckKey::Command(command));
        Ok(())
    }

    async fn send_set_mode(&mut self, id: &str, mode: FlightMode) -> Result<(), VehicleError> {
        let params = [
            f32::from(mavlink::MODE_FLAG_CUSTOM),
            mode.custom_mode() as f32,
            0.0,
            0.0,
            0.0,
            0.0,
            0.0,
        ];
        self.send_command_long(id, mavlink::CMD_DO_SET_MODE, params).await
    }

    async fn send_reposition(
        &mut self,
        id: &str,
        lat: f64,
        lon: f64,
        alt: f64,
        speed: Option<f64>,
    ) -> Result<(), VehicleError> {
        let (sys, comp) = *self.shared.target.lock().unwrap();
        let ground_speed = speed.map_or(-1.0, |s| s as f32);
        let payload = mavlink::command_int_payload(
            mavlink::CMD_DO_REPOSITION,
            sys,
            comp,
            [ground_speed, 0.0, 0.0, f32::NAN],
            lat,
            lon,
            alt as f32,
        );
        self.send_frame(mavlink::MSG_COMMAND_INT, payload).await?;
        self.register_pending(id, AckKey::Command(mavlink::CMD_DO_REPOSITION));
        Ok(())
    }

    /// Fails every pending command; called when the link is lost so no
    /// in-flight command is left without a terminal ack.
    fn fail_pending(&self, reason: &str) {
        let drained: Vec<PendingAck> =
            std::mem::take(&mut *self.shared.pending.lock().unwrap());
        if drained.is_empty() {
            return;
        }
        let mut completions = self.shared.completions.lock().unwrap();
        for entry in drained {
            completions.push(CommandAck::failed(&entry.id, reason));
        }
    }
}

impl Drop for SitlVehicle {
    fn drop(&mut self) { self.cancel.cancel(); }
}

#[async_trait]
impl VehicleBackend for SitlVehicle {
    fn kind(&self) -> VehicleKind { VehicleKind::Sitl }

    fn telemetry(&self) -> TelemetrySnapshot {
        let cache = self.shared.cache.read().unwrap();
        TelemetrySnapshot {
            timestamp: chrono::Utc::now(),
            position: Position {
                lat: cache.lat,
                lon: cache.lon,
                alt: cache.alt_msl,
                relative_alt: cache.alt_rel,
            },
            attitude: Attitude { roll: cache.roll, pitch: cache.pitch, yaw: cache.yaw },
            velocity: Velocity { vx: cache.vx, vy: cache.vy, vz: cache.vz, speed: cache.speed },
            battery: Battery { voltage: cache.voltage, current: cache.current, level: cache.level },
            mode: cache.mode.clone(),
            armed: cache.armed,
        }
    }

    fn link(&self) -> LinkState { *self.shared.link.borrow() }

    fn tick(&mut self, _dt: f64) -> Vec<CommandAck> {
        self.tick_count += 1;
        // Keep our own heartbeat going at roughly 1 Hz.
        if (self.tick_count - 1) % self.ticks_per_heartbeat == 0 {
            let frame = Frame {
                seq: self.seq,
                sysid: 255,
                compid: 190,
                msgid: mavlink::MSG_HEARTBEAT,
                payload: mavlink::heartbeat_payload(),
            };
            self.seq = self.seq.wrapping_add(1);
            if let Some(bytes) = frame.encode() {
                let _ = self.socket.try_send(&bytes);
            }
        }

        // Heartbeat staleness drives the link state machine.
        let age = self.shared.last_heartbeat.lock().unwrap().map(|t| t.elapsed());
        let current = *self.shared.link.borrow();
        if let Some(age) = age {
            let next = if age >= Self::LINK_GRACE {
                LinkState::Disconnected
            } else if age >= Self::HEARTBEAT_TIMEOUT {
                LinkState::Degraded
            } else {
                LinkState::Connected
            };
            if next != current {
                log!("MAVLink link {current} -> {next} (heartbeat age {age:?})");
                self.shared.link.send_replace(next);
                if next == LinkState::Disconnected {
                    self.fail_pending("Link lost before acknowledgment");
                }
            }
        }

        // Expire acknowledgment deadlines.
        let now = Instant::now();
        let expired: Vec<PendingAck> = {
            let mut pending = self.shared.pending.lock().unwrap();
            let (timed_out, alive) =
                std::mem::take(&mut *pending).into_iter().partition(|p| p.deadline <= now);
            *pending = alive;
            timed_out
        };
        if !expired.is_empty() {
            let mut completions = self.shared.completions.lock().unwrap();
            for entry in expired {
                completions.push(CommandAck::failed(&entry.id, "Command ack timeout"));
            }
        }

        std::mem::take(&mut *self.shared.completions.lock().unwrap())
    }

    async fn send_command(
        &mut self,
        id: &str,
        detail: &CommandDetail,
    ) -> Result<CommandAck, VehicleError> {
        let state = self.link();
        if state == LinkState::Disconnected || state == LinkState::Connecting {
            return Err(VehicleError::LinkDown(state));
        }
        match detail {
            CommandDetail::Arm => {
                self.send_command_long(
                    id,
                    mavlink::CMD_COMPONENT_ARM_DISARM,
                    [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                )
                .await?;
            }
            CommandDetail::Disarm => {
                self.send_command_long(
                    id,
                    mavlink::CMD_COMPONENT_ARM_DISARM,
                    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                )
                .await?;
            }
            CommandDetail::Takeoff(p) => {
                self.send_command_long(
                    id,
                    mavlink::CMD_NAV_TAKEOFF,
                    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, p.alt as f32],
                )
                .await?;
            }
            CommandDetail::Goto(p) => {
                self.send_reposition(id, p.lat, p.lon, p.alt, p.speed).await?;
            }
            CommandDetail::SetAlt(p) => {
                let (lat, lon) = {
                    let cache = self.shared.cache.read().unwrap();
                    (cache.lat, cache.lon)
                };
                self.send_reposition(id, lat, lon, p.alt, p.speed).await?;
            }
            CommandDetail::Hover(_) | CommandDetail::PauseMission => {
                self.send_set_mode(id, FlightMode::Loiter).await?;
            }
            CommandDetail::SetMode(mode) => {
                self.send_set_mode(id, *mode).await?;
            }
            CommandDetail::Rtl => {
                self.send_command_long(
                    id,
                    mavlink::CMD_NAV_RETURN_TO_LAUNCH,
                    [0.0; 7],
                )
                .await?;
            }
            CommandDetail::UploadMission(waypoints) => {
                let (sys, comp) = *self.shared.target.lock().unwrap();
                let count = mavlink::mission_count_payload(waypoints.len() as u16, sys, comp);
                self.send_frame(mavlink::MSG_MISSION_COUNT, count).await?;
                for (seq, wp) in waypoints.iter().enumerate() {
                    let item = mavlink::mission_item_int_payload(
                        seq as u16,
                        wp.command_code,
                        sys,
                        comp,
                        wp.lat,
                        wp.lon,
                        wp.alt as f32,
                    );
                    self.send_frame(mavlink::MSG_MISSION_ITEM_INT, item).await?;
                }
                self.register_pending(id, AckKey::Mission);
            }
            CommandDetail::StartMission | CommandDetail::ContinueMission => {
                self.send_set_mode(id, FlightMode::Auto).await?;
            }
            CommandDetail::AbortMission => {
                self.send_set_mode(id, FlightMode::Loiter).await?;
            }
        }
        Ok(CommandAck::executing(id))
    }
}
