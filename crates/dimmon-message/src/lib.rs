//! Control messages: addressed, typed request/response envelopes exchanged
//! between nodes, plus the payload encodings for the `generic` command
//! namespace the runtime handles centrally.

use bitflags::bitflags;
use dimmon_error::{DmmError, DmmResult, NodeId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u32 {
        const RESPONSE = 0b01;
        const ERROR    = 0b10;
    }
}

/// The `type` namespace reserved for runtime-handled commands (table in
/// §4.4). Per-type extensions use any other value.
pub const TYPE_GENERIC: u32 = 0;

/// Command codes in the `generic` namespace.
pub mod generic {
    pub const NODE_CREATE: u32 = 1;
    pub const NODE_REMOVE: u32 = 2;
    pub const NODE_CONNECT: u32 = 3;
    pub const NODE_DISCONNECT: u32 = 4;
    pub const STARTUP: u32 = 5;
    pub const TIMER_CREATE: u32 = 6;
    pub const TIMER_SET: u32 = 7;
    pub const TIMER_SUBSCRIBE: u32 = 8;
    pub const TIMER_UNSUBSCRIBE: u32 = 9;
    pub const TIMER_REMOVE: u32 = 10;
    pub const TIMER_TRIGGER: u32 = 11;
    pub const SOCKEVENT_SUBSCRIBE: u32 = 12;
    pub const SOCKEVENT_UNSUBSCRIBE: u32 = 13;
    pub const SOCKEVENT_TRIGGER: u32 = 14;
    pub const WAVEFINISH_SUBSCRIBE: u32 = 15;
    pub const WAVEFINISH: u32 = 16;
}

/// A control message: fixed header plus inline payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// 0 means "system", i.e. not sent on behalf of any node.
    pub src: NodeId,
    pub cmd: u32,
    pub msg_type: u32,
    pub token: u32,
    pub flags: MessageFlags,
    pub payload: Vec<u8>,
}

pub const SYSTEM_SRC: NodeId = NodeId::from_raw(0);

impl ControlMessage {
    /// `create(src, cmd, type, token, flags, len)` — here `payload` stands in
    /// for the original's separate length/bytes pair.
    pub fn create(
        src: NodeId,
        cmd: u32,
        msg_type: u32,
        token: u32,
        flags: MessageFlags,
        payload: Vec<u8>,
    ) -> Self {
        ControlMessage {
            src,
            cmd,
            msg_type,
            token,
            flags,
            payload,
        }
    }

    /// Builds a response to `req`: copies `cmd`, `msg_type`, `token` and sets
    /// the RESPONSE flag.
    pub fn create_resp(src: NodeId, req: &ControlMessage, payload: Vec<u8>) -> Self {
        ControlMessage {
            src,
            cmd: req.cmd,
            msg_type: req.msg_type,
            token: req.token,
            flags: MessageFlags::RESPONSE,
            payload,
        }
    }

    /// A byte-wise independent duplicate (header and payload round-trip).
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(MessageFlags::RESPONSE)
    }

    pub fn mark_error(&mut self) {
        self.flags.insert(MessageFlags::ERROR);
    }

    pub fn is_error(&self) -> bool {
        self.flags.contains(MessageFlags::ERROR)
    }

    /// Network wire form: `{u32 src, cmd, type, token, flags, len; u8 payload[len]}`,
    /// all little-endian.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.payload.len());
        out.extend_from_slice(&(self.src.get() as u32).to_le_bytes());
        out.extend_from_slice(&self.cmd.to_le_bytes());
        out.extend_from_slice(&self.msg_type.to_le_bytes());
        out.extend_from_slice(&self.token.to_le_bytes());
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn from_wire(bytes: &[u8]) -> DmmResult<Self> {
        let mut cur = Cursor::new(bytes);
        let src = cur.read_u32()?;
        let cmd = cur.read_u32()?;
        let msg_type = cur.read_u32()?;
        let token = cur.read_u32()?;
        let flags = cur.read_u32()?;
        let len = cur.read_u32()? as usize;
        let payload = cur.read_bytes(len)?.to_vec();
        Ok(ControlMessage {
            src: NodeId::from_raw(src as u64),
            cmd,
            msg_type,
            token,
            flags: MessageFlags::from_bits_truncate(flags),
            payload,
        })
    }
}

/// Tiny cursor used by the generic-payload codecs below and by
/// [`ControlMessage::from_wire`]. Kept private-ish (pub(crate) would do, but
/// the payload structs in this crate need it too).
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> DmmResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(DmmError::InvalidArgument)?;
        let slice = self.bytes.get(self.pos..end).ok_or(DmmError::InvalidArgument)?;
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> DmmResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> DmmResult<i64> {
        let b = self.read_bytes(8)?;
        Ok(i64::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_u8(&mut self) -> DmmResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_string(&mut self) -> DmmResult<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DmmError::InvalidArgument)
    }
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    write_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

/// `NODE_CREATE` payload: `{type name}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCreatePayload {
    pub type_name: String,
}

impl NodeCreatePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_string(&mut out, &self.type_name);
        out
    }

    pub fn decode(bytes: &[u8]) -> DmmResult<Self> {
        let mut cur = Cursor::new(bytes);
        Ok(NodeCreatePayload {
            type_name: cur.read_string()?,
        })
    }
}

/// Shared payload shape for `NODE_CONNECT` / `NODE_DISCONNECT`:
/// `{src-hook, dst-addr, dst-hook}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePeeringPayload {
    pub src_hook: String,
    pub dst_addr: String,
    pub dst_hook: String,
}

impl NodePeeringPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_string(&mut out, &self.src_hook);
        write_string(&mut out, &self.dst_addr);
        write_string(&mut out, &self.dst_hook);
        out
    }

    pub fn decode(bytes: &[u8]) -> DmmResult<Self> {
        let mut cur = Cursor::new(bytes);
        Ok(NodePeeringPayload {
            src_hook: cur.read_string()?,
            dst_addr: cur.read_string()?,
            dst_hook: cur.read_string()?,
        })
    }
}

/// `STARTUP` payload: the verbatim pipeline-description remainder handed to
/// the starter node, plus the line number it starts at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPayload {
    pub descriptor: String,
    pub lineno: u32,
}

impl StartupPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, self.lineno);
        write_string(&mut out, &self.descriptor);
        out
    }

    pub fn decode(bytes: &[u8]) -> DmmResult<Self> {
        let mut cur = Cursor::new(bytes);
        let lineno = cur.read_u32()?;
        let descriptor = cur.read_string()?;
        Ok(StartupPayload { descriptor, lineno })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimerSetFlags: u32 {
        const ABSOLUTE = 0b01;
        const CHANGE_INTERVAL_ONLY = 0b10;
    }
}

/// `TIMER_SET` payload: `{id, next, interval, flags}`. `next`/`interval` are
/// milliseconds; `next` is signed only so that `0` is unambiguous versus a
/// negative value would be (the runtime never produces a negative one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSetPayload {
    pub id: u64,
    pub next: i64,
    pub interval: i64,
    pub flags: TimerSetFlags,
}

impl TimerSetPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, self.id as u32);
        write_i64(&mut out, self.next);
        write_i64(&mut out, self.interval);
        write_u32(&mut out, self.flags.bits());
        out
    }

    pub fn decode(bytes: &[u8]) -> DmmResult<Self> {
        let mut cur = Cursor::new(bytes);
        let id = cur.read_u32()? as u64;
        let next = cur.read_i64()?;
        let interval = cur.read_i64()?;
        let flags = TimerSetFlags::from_bits_truncate(cur.read_u32()?);
        Ok(TimerSetPayload {
            id,
            next,
            interval,
            flags,
        })
    }
}

/// Payload shared by `TIMER_SUBSCRIBE`/`TIMER_UNSUBSCRIBE`/`TIMER_REMOVE`/`TIMER_TRIGGER`: `{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerIdPayload {
    pub id: u64,
}

impl TimerIdPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, self.id as u32);
        out
    }

    pub fn decode(bytes: &[u8]) -> DmmResult<Self> {
        let mut cur = Cursor::new(bytes);
        Ok(TimerIdPayload {
            id: cur.read_u32()? as u64,
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReadinessFlags: u32 {
        const IN  = 0b001;
        const OUT = 0b010;
        const ERR = 0b100;
    }
}

/// `SOCKEVENT_SUBSCRIBE` payload: `{fd, events}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockeventSubscribePayload {
    pub fd: i32,
    pub events: ReadinessFlags,
}

impl SockeventSubscribePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, self.fd as u32);
        write_u32(&mut out, self.events.bits());
        out
    }

    pub fn decode(bytes: &[u8]) -> DmmResult<Self> {
        let mut cur = Cursor::new(bytes);
        let fd = cur.read_u32()? as i32;
        let events = ReadinessFlags::from_bits_truncate(cur.read_u32()?);
        Ok(SockeventSubscribePayload { fd, events })
    }
}

/// `SOCKEVENT_UNSUBSCRIBE` payload: `{fd}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockeventFdPayload {
    pub fd: i32,
}

impl SockeventFdPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, self.fd as u32);
        out
    }

    pub fn decode(bytes: &[u8]) -> DmmResult<Self> {
        let mut cur = Cursor::new(bytes);
        Ok(SockeventFdPayload {
            fd: cur.read_u32()? as i32,
        })
    }
}

/// `SOCKEVENT_TRIGGER` payload: `{fd, events}`.
pub type SockeventTriggerPayload = SockeventSubscribePayload;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_round_trips_header_and_payload() {
        let msg = ControlMessage::create(
            NodeId::from_raw(3),
            generic::NODE_REMOVE,
            TYPE_GENERIC,
            99,
            MessageFlags::empty(),
            vec![1, 2, 3],
        );
        let dup = msg.copy();
        assert_eq!(msg, dup);
    }

    #[test]
    fn create_resp_preserves_correlation_fields_and_sets_response_flag() {
        let req = ControlMessage::create(
            NodeId::from_raw(1),
            42,
            7,
            123,
            MessageFlags::empty(),
            Vec::new(),
        );
        let resp = ControlMessage::create_resp(NodeId::from_raw(2), &req, Vec::new());
        assert_eq!(resp.cmd, req.cmd);
        assert_eq!(resp.msg_type, req.msg_type);
        assert_eq!(resp.token, req.token);
        assert!(resp.is_response());
    }

    #[test]
    fn wire_round_trip() {
        let msg = ControlMessage::create(
            NodeId::from_raw(5),
            generic::TIMER_TRIGGER,
            TYPE_GENERIC,
            1,
            MessageFlags::ERROR,
            vec![9, 9],
        );
        let wire = msg.to_wire();
        let back = ControlMessage::from_wire(&wire).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn node_peering_payload_round_trip() {
        let p = NodePeeringPayload {
            src_hook: "out".into(),
            dst_addr: "sink".into(),
            dst_hook: "in".into(),
        };
        let back = NodePeeringPayload::decode(&p.encode()).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn timer_set_payload_round_trip() {
        let p = TimerSetPayload {
            id: 7,
            next: 100,
            interval: 100,
            flags: TimerSetFlags::ABSOLUTE,
        };
        let back = TimerSetPayload::decode(&p.encode()).unwrap();
        assert_eq!(p, back);
    }
}
