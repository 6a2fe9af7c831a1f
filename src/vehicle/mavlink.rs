//! Minimal MAVLink v1 framing for the SITL link.
//!
//! Only the message subset the core speaks is implemented: the periodic
//! state messages an autopilot emits (heartbeat, position, attitude, HUD,
//! battery) and the command/mission messages the GCS sends. Payload layouts
//! follow the common dialect with its size-sorted field order.

/// MAVLink v1 frame magic.
pub const MAGIC: u8 = 0xFE;
/// Header length (magic, len, seq, sysid, compid, msgid).
const HEADER_LEN: usize = 6;
/// Checksum length.
const CRC_LEN: usize = 2;

pub const MSG_HEARTBEAT: u8 = 0;
pub const MSG_SYS_STATUS: u8 = 1;
pub const MSG_ATTITUDE: u8 = 30;
pub const MSG_GLOBAL_POSITION_INT: u8 = 33;
pub const MSG_MISSION_COUNT: u8 = 44;
pub const MSG_MISSION_ACK: u8 = 47;
pub const MSG_MISSION_ITEM_INT: u8 = 73;
pub const MSG_VFR_HUD: u8 = 74;
pub const MSG_COMMAND_INT: u8 = 75;
pub const MSG_COMMAND_LONG: u8 = 76;
pub const MSG_COMMAND_ACK: u8 = 77;

pub const CMD_NAV_RETURN_TO_LAUNCH: u16 = 20;
pub const CMD_NAV_TAKEOFF: u16 = 22;
pub const CMD_DO_SET_MODE: u16 = 176;
pub const CMD_DO_REPOSITION: u16 = 192;
pub const CMD_COMPONENT_ARM_DISARM: u16 = 400;

/// `MAV_MODE_FLAG_SAFETY_ARMED` in the heartbeat base mode.
pub const MODE_FLAG_ARMED: u8 = 0x80;
/// `MAV_MODE_FLAG_CUSTOM_MODE_ENABLED`, set on every `DO_SET_MODE`.
pub const MODE_FLAG_CUSTOM: u8 = 0x01;

/// `MAV_RESULT_ACCEPTED`.
pub const RESULT_ACCEPTED: u8 = 0;

/// Seed byte appended to the checksum, per message id. `None` means the
/// message is outside the implemented subset.
fn crc_extra(msgid: u8) -> Option<u8> {
    match msgid {
        MSG_HEARTBEAT => Some(50),
        MSG_SYS_STATUS => Some(124),
        MSG_ATTITUDE => Some(39),
        MSG_GLOBAL_POSITION_INT => Some(104),
        MSG_MISSION_COUNT => Some(221),
        MSG_MISSION_ACK => Some(153),
        MSG_MISSION_ITEM_INT => Some(38),
        MSG_VFR_HUD => Some(20),
        MSG_COMMAND_INT => Some(158),
        MSG_COMMAND_LONG => Some(152),
        MSG_COMMAND_ACK => Some(143),
        _ => None,
    }
}

/// X.25 CRC as used by MAVLink, seeded with 0xFFFF.
fn crc_accumulate(crc: u16, byte: u8) -> u16 {
    let mut tmp = byte ^ (crc & 0xFF) as u8;
    tmp ^= tmp << 4;
    (crc >> 8) ^ (u16::from(tmp) << 8) ^ (u16::from(tmp) << 3) ^ (u16::from(tmp) >> 4)
}

fn crc_calculate(bytes: &[u8], extra: u8) -> u16 {
    let mut crc = 0xFFFFu16;
    for b in bytes {
        crc = crc_accumulate(crc, *b);
    }
    crc_accumulate(crc, extra)
}

/// One parsed (or to-be-encoded) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u8,
    pub sysid: u8,
    pub compid: u8,
    pub msgid: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Serializes the frame. Returns `None` for message ids outside the
    /// implemented subset (no crc_extra to seed the checksum with).
    pub fn encode(&self) -> Option<Vec<u8>> {
        let extra = crc_extra(self.msgid)?;
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + CRC_LEN);
        out.push(MAGIC);
        out.push(self.payload.len() as u8);
        out.push(self.seq);
        out.push(self.sysid);
        out.push(self.compid);
        out.push(self.msgid);
        out.extend_from_slice(&self.payload);
        let crc = crc_calculate(&out[1..], extra);
        out.extend_from_slice(&crc.to_le_bytes());
        Some(out)
    }
}

/// Incremental frame parser. Feed it raw datagram bytes; it yields whole
/// CRC-verified frames and silently drops garbage, counting what it drops.
#[derive(Debug, Default)]
pub struct Parser {
    buf: Vec<u8>,
    bad_crc: u64,
    skipped: u64,
}

impl Parser {
    pub fn new() -> Self { Self::default() }

    pub fn bad_crc(&self) -> u64 { self.bad_crc }
    pub fn skipped(&self) -> u64 { self.skipped }

    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            // Resync on the magic byte.
            match self.buf.iter().position(|b| *b == MAGIC) {
                Some(0) => {}
                Some(pos) => {
                    self.skipped += pos as u64;
                    self.buf.drain(..pos);
                }
                None => {
                    self.skipped += self.buf.len() as u64;
                    self.buf.clear();
                    break;
                }
            }
            if self.buf.len() < HEADER_LEN + CRC_LEN {
                break;
            }
            let payload_len = self.buf[1] as usize;
            let total = HEADER_LEN + payload_len + CRC_LEN;
            if self.buf.len() < total {
                break;
            }
            let msgid = self.buf[5];
            let Some(extra) = crc_extra(msgid) else {
                // Unknown message: trust the length field and move on.
                self.skipped += total as u64;
                self.buf.drain(..total);
                continue;
            };
            let crc_rx = u16::from_le_bytes([self.buf[total - 2], self.buf[total - 1]]);
            let crc = crc_calculate(&self.buf[1..total - CRC_LEN], extra);
            if crc != crc_rx {
                // Bad checksum: drop the magic byte and rescan.
                self.bad_crc += 1;
                self.buf.drain(..1);
                continue;
            }
            let frame = Frame {
                seq: self.buf[2],
                sysid: self.buf[3],
                compid: self.buf[4],
                msgid,
                payload: self.buf[HEADER_LEN..HEADER_LEN + payload_len].to_vec(),
            };
            self.buf.drain(..total);
            frames.push(frame);
        }
        frames
    }
}

/// Decoded incoming messages the link cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum MavMessage {
    Heartbeat { custom_mode: u32, base_mode: u8 },
    SysStatus { voltage_mv: u16, current_10ma: i16, battery_remaining: i8 },
    Attitude { roll: f32, pitch: f32, yaw: f32 },
    GlobalPositionInt {
        lat: i32,
        lon: i32,
        alt_mm: i32,
        relative_alt_mm: i32,
        vx: i16,
        vy: i16,
        vz: i16,
    },
    VfrHud { groundspeed: f32 },
    CommandAck { command: u16, result: u8 },
    MissionAck { result: u8 },
}

struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self { Self { buf, pos: 0 } }

    fn skip(&mut self, n: usize) { self.pos += n; }

    fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    fn i8(&mut self) -> i8 { self.u8() as i8 }

    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        v
    }

    fn i16(&mut self) -> i16 { self.u16() as i16 }

    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    fn i32(&mut self) -> i32 { self.u32() as i32 }

    fn f32(&mut self) -> f32 {
        let v = f32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }
}

impl MavMessage {
    /// Decodes a verified frame. Frames with a payload shorter than the
    /// dialect length are dropped.
    pub fn decode(frame: &Frame) -> Option<MavMessage> {
        let p = &frame.payload;
        match frame.msgid {
            MSG_HEARTBEAT if p.len() >= 9 => {
                let mut r = PayloadReader::new(p);
                let custom_mode = r.u32();
                r.skip(2); // type, autopilot
                let base_mode = r.u8();
                Some(MavMessage::Heartbeat { custom_mode, base_mode })
            }
            MSG_SYS_STATUS if p.len() >= 31 => {
                let mut r = PayloadReader::new(p);
                r.skip(12); // sensor bitmasks
                r.skip(2); // load
                let voltage_mv = r.u16();
                let current_10ma = r.i16();
                r.skip(12); // drop rate + error counters
                let battery_remaining = r.i8();
                Some(MavMessage::SysStatus { voltage_mv, current_10ma, battery_remaining })
            }
            MSG_ATTITUDE if p.len() >= 28 => {
                let mut r = PayloadReader::new(p);
                r.skip(4); // time_boot_ms
                let roll = r.f32();
                let pitch = r.f32();
                let yaw = r.f32();
                Some(MavMessage::Attitude { roll, pitch, yaw })
            }
            MSG_GLOBAL_POSITION_INT if p.len() >= 28 => {
                let mut r = PayloadReader::new(p);
                r.skip(4); // time_boot_ms
                let lat = r.i32();
                let lon = r.i32();
                let alt_mm = r.i32();
                let relative_alt_mm = r.i32();
                let vx = r.i16();
                let vy = r.i16();
                let vz = r.i16();
                Some(MavMessage::GlobalPositionInt { lat, lon, alt_mm, relative_alt_mm, vx, vy, vz })
            }
            MSG_VFR_HUD if p.len() >= 20 => {
                let mut r = PayloadReader::new(p);
                r.skip(4); // airspeed
                let groundspeed = r.f32();
                Some(MavMessage::VfrHud { groundspeed })
            }
            MSG_COMMAND_ACK if p.len() >= 3 => {
                let mut r = PayloadReader::new(p);
                let command = r.u16();
                let result = r.u8();
                Some(MavMessage::CommandAck { command, result })
            }
            MSG_MISSION_ACK if p.len() >= 3 => {
                let mut r = PayloadReader::new(p);
                r.skip(2); // target system/component
                let result = r.u8();
                Some(MavMessage::MissionAck { result })
            }
            _ => None,
        }
    }
}

/// Human-readable reason for a non-accepted `MAV_RESULT`.
pub fn result_reason(result: u8) -> &'static str {
    match result {
        1 => "Command temporarily rejected by autopilot",
        2 => "Command denied by autopilot",
        3 => "Command unsupported by autopilot",
        4 => "Command failed on autopilot",
        5 => "Command still in progress past deadline",
        _ => "Command refused by autopilot",
    }
}

struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    fn new(cap: usize) -> Self { Self { buf: Vec::with_capacity(cap) } }
    fn u8(&mut self, v: u8) { self.buf.push(v); }
    fn u16(&mut self, v: u16) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    fn u32(&mut self, v: u32) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    fn i32(&mut self, v: i32) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    fn f32(&mut self, v: f32) { self.buf.extend_from_slice(&v.to_le_bytes()); }
}

/// GCS heartbeat payload (type GCS, autopilot invalid).
pub fn heartbeat_payload() -> Vec<u8> {
    let mut w = PayloadWriter::new(9);
    w.u32(0); // custom_mode
    w.u8(6); // MAV_TYPE_GCS
    w.u8(8); // MAV_AUTOPILOT_INVALID
    w.u8(0); // base_mode
    w.u8(4); // MAV_STATE_ACTIVE
    w.u8(3); // mavlink_version
    w.buf
}

pub fn command_long_payload(
    command: u16,
    target_system: u8,
    target_component: u8,
    params: [f32; 7],
) -> Vec<u8> {
    let mut w = PayloadWriter::new(33);
    for p in params {
        w.f32(p);
    }
    w.u16(command);
    w.u8(target_system);
    w.u8(target_component);
    w.u8(0); // confirmation
    w.buf
}

/// `COMMAND_INT` with a global-relative-alt frame; lat/lon scaled 1e7.
pub fn command_int_payload(
    command: u16,
    target_system: u8,
    target_component: u8,
    params: [f32; 4],
    lat: f64,
    lon: f64,
    alt: f32,
) -> Vec<u8> {
    let mut w = PayloadWriter::new(35);
    for p in params {
        w.f32(p);
    }
    w.i32((lat * 1e7) as i32);
    w.i32((lon * 1e7) as i32);
    w.f32(alt);
    w.u16(command);
    w.u8(target_system);
    w.u8(target_component);
    w.u8(6); // MAV_FRAME_GLOBAL_RELATIVE_ALT_INT
    w.u8(0); // current
    w.u8(0); // autocontinue
    w.buf
}

pub fn mission_count_payload(count: u16, target_system: u8, target_component: u8) -> Vec<u8> {
    let mut w = PayloadWriter::new(4);
    w.u16(count);
    w.u8(target_system);
    w.u8(target_component);
    w.buf
}

pub fn mission_item_int_payload(
    seq: u16,
    command: u16,
    target_system: u8,
    target_component: u8,
    lat: f64,
    lon: f64,
    alt: f32,
) -> Vec<u8> {
    let mut w = PayloadWriter::new(37);
    for _ in 0..4 {
        w.f32(0.0); // param1-4
    }
    w.i32((lat * 1e7) as i32);
    w.i32((lon * 1e7) as i32);
    w.f32(alt);
    w.u16(seq);
    w.u16(command);
    w.u8(target_system);
    w.u8(target_component);
    w.u8(6); // MAV_FRAME_GLOBAL_RELATIVE_ALT_INT
    w.u8(0); // current
    w.u8(1); // autocontinue
    w.buf
}
