//! Synchronization wire format
//!
//! Frame: ASCII `COLL`, big-endian i32 payload length, payload. The payload
//! starts with a message type and a protocol version; version 1 carries no
//! global fields and no per-screen anchors. Strings use the length-prefixed
//! modified UTF-8 encoding of Java data streams.

use crate::sync::descriptor::{BlockPos, PlaneAxis, ScreenDescriptor};
use crate::utils::error::{CollinsError, Result};

pub const MAGIC: &[u8; 4] = b"COLL";

/// Largest accepted payload
pub const MAX_PAYLOAD_LEN: usize = 5_000_000;

/// Largest accepted screen count
pub const MAX_SCREENS: usize = 10_000;

pub const MSG_SYNC: u8 = 1;

pub const PROTOCOL_V1: i32 = 1;
pub const PROTOCOL_V2: i32 = 2;

const V1_GLOBAL_GAIN: f32 = 1.0;
const V1_HEAR_RADIUS: i32 = 100;

/// One decoded SYNC broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMessage {
    pub version: i32,
    pub global_gain: f32,

    /// Audibility radius in blocks, `<= 0` for unbounded
    pub hear_radius: i32,

    /// Server wall clock at send time, 0 when unknown
    pub server_now_ms: i64,

    pub screens: Vec<ScreenDescriptor>,
}

impl SyncMessage {
    /// Message in the current protocol version
    pub fn new(global_gain: f32, hear_radius: i32, server_now_ms: i64, screens: Vec<ScreenDescriptor>) -> Self {
        Self {
            version: PROTOCOL_V2,
            global_gain,
            hear_radius,
            server_now_ms,
            screens,
        }
    }
}

/// Decode a complete frame
///
/// Trailing bytes after the declared payload are ignored.
pub fn decode_frame(bytes: &[u8]) -> Result<SyncMessage> {
    if bytes.len() < 8 {
        return Err(CollinsError::protocol_error("Frame shorter than its header"));
    }
    if &bytes[..4] != MAGIC {
        return Err(CollinsError::protocol_error("Bad frame magic"));
    }

    let len = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if len < 0 || len as usize > MAX_PAYLOAD_LEN {
        return Err(CollinsError::protocol_error(format!("Payload length {} out of range", len)));
    }
    let len = len as usize;
    if bytes.len() - 8 < len {
        return Err(CollinsError::protocol_error(format!(
            "Truncated frame: {} of {} payload bytes",
            bytes.len() - 8,
            len
        )));
    }

    decode_payload(&bytes[8..8 + len])
}

/// Decode a payload without the outer frame
pub fn decode_payload(payload: &[u8]) -> Result<SyncMessage> {
    let mut r = WireReader::new(payload);

    let kind = r.u8()?;
    if kind != MSG_SYNC {
        return Err(CollinsError::protocol_error(format!("Unknown message type {}", kind)));
    }

    let version = r.i32()?;
    let (global_gain, hear_radius, server_now_ms) = match version {
        PROTOCOL_V1 => (V1_GLOBAL_GAIN, V1_HEAR_RADIUS, 0),
        PROTOCOL_V2 => (r.f32()?, r.i32()?, r.i64()?),
        other => {
            return Err(CollinsError::protocol_error(format!("Unsupported protocol version {}", other)));
        }
    };

    let count = r.i32()?;
    if count < 0 || count as usize > MAX_SCREENS {
        return Err(CollinsError::protocol_error(format!("Screen count {} out of range", count)));
    }

    let mut screens = Vec::with_capacity(count as usize);
    for _ in 0..count {
        screens.push(read_screen(&mut r, version)?);
    }

    Ok(SyncMessage {
        version,
        global_gain,
        hear_radius,
        server_now_ms,
        screens,
    })
}

fn read_screen(r: &mut WireReader<'_>, version: i32) -> Result<ScreenDescriptor> {
    let name = r.utf()?;
    let world = r.utf()?;
    let corner_a = BlockPos::new(r.i32()?, r.i32()?, r.i32()?);
    let corner_b = BlockPos::new(r.i32()?, r.i32()?, r.i32()?);
    let axis = PlaneAxis::from_wire(r.i8()?);
    let url = r.utf()?;
    let playing = r.bool()?;
    let looping = r.bool()?;
    let volume = r.f32()?;
    let (start_epoch_ms, base_pos_ms) = if version >= PROTOCOL_V2 {
        (r.i64()?, r.i64()?)
    } else {
        (0, 0)
    };

    Ok(ScreenDescriptor {
        name,
        world,
        corner_a,
        corner_b,
        axis,
        url,
        playing,
        looping,
        volume,
        start_epoch_ms,
        base_pos_ms,
    })
}

/// Encode a message into a complete frame, honoring `msg.version`
pub fn encode_frame(msg: &SyncMessage) -> Result<Vec<u8>> {
    let payload = encode_payload(msg)?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CollinsError::protocol_error("Payload too large"));
    }

    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(payload.len() as i32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn encode_payload(msg: &SyncMessage) -> Result<Vec<u8>> {
    if msg.version != PROTOCOL_V1 && msg.version != PROTOCOL_V2 {
        return Err(CollinsError::protocol_error(format!("Unsupported protocol version {}", msg.version)));
    }
    if msg.screens.len() > MAX_SCREENS {
        return Err(CollinsError::protocol_error("Too many screens"));
    }

    let mut w = WireWriter::default();
    w.u8(MSG_SYNC);
    w.i32(msg.version);
    if msg.version == PROTOCOL_V2 {
        w.f32(msg.global_gain);
        w.i32(msg.hear_radius);
        w.i64(msg.server_now_ms);
    }
    w.i32(msg.screens.len() as i32);

    for s in &msg.screens {
        w.utf(&s.name)?;
        w.utf(&s.world)?;
        for c in [s.corner_a, s.corner_b] {
            w.i32(c.x);
            w.i32(c.y);
            w.i32(c.z);
        }
        w.u8(s.axis.to_wire() as u8);
        w.utf(&s.url)?;
        w.u8(s.playing as u8);
        w.u8(s.looping as u8);
        w.f32(s.volume);
        if msg.version == PROTOCOL_V2 {
            w.i64(s.start_epoch_ms);
            w.i64(s.base_pos_ms);
        }
    }

    Ok(w.buf)
}

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| CollinsError::protocol_error(format!("Unexpected end of payload at byte {}", self.pos)))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_be_bytes(self.array()?))
    }

    /// u16 byte length followed by modified UTF-8
    fn utf(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        decode_modified_utf8(bytes)
    }
}

#[derive(Default)]
struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn utf(&mut self, s: &str) -> Result<()> {
        let encoded = encode_modified_utf8(s);
        if encoded.len() > u16::MAX as usize {
            return Err(CollinsError::protocol_error(format!("String of {} bytes too long", encoded.len())));
        }
        self.buf.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(&encoded);
        Ok(())
    }
}

fn decode_modified_utf8(bytes: &[u8]) -> Result<String> {
    let bad = || CollinsError::protocol_error("Malformed modified UTF-8");
    let cont = |b: Option<&u8>| -> Result<u16> {
        match b {
            Some(b) if b & 0xC0 == 0x80 => Ok((b & 0x3F) as u16),
            _ => Err(bad()),
        }
    };

    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 {
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            units.push((((b & 0x1F) as u16) << 6) | cont(bytes.get(i + 1))?);
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            let hi = cont(bytes.get(i + 1))?;
            let lo = cont(bytes.get(i + 2))?;
            units.push((((b & 0x0F) as u16) << 12) | (hi << 6) | lo);
            i += 3;
        } else {
            return Err(bad());
        }
    }

    String::from_utf16(&units).map_err(|_| bad())
}

fn encode_modified_utf8(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::descriptor::test_screen;

    fn anchored(name: &str) -> ScreenDescriptor {
        ScreenDescriptor {
            start_epoch_ms: 1_700_000_000_000,
            base_pos_ms: 12_500,
            axis: PlaneAxis::YZ,
            ..test_screen(name, "https://cdn.example/v.mp4")
        }
    }

    #[test]
    fn test_v2_frame_decodes() {
        let msg = SyncMessage::new(0.8, 48, 1_700_000_005_000, vec![anchored("Lobby"), anchored("Café ☕")]);
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(&frame[..4], b"COLL");

        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_v1_defaults() {
        let msg = SyncMessage {
            version: PROTOCOL_V1,
            ..SyncMessage::new(0.3, 7, 99, vec![anchored("a")])
        };
        let decoded = decode_frame(&encode_frame(&msg).unwrap()).unwrap();

        assert_eq!(decoded.version, PROTOCOL_V1);
        assert_eq!(decoded.global_gain, 1.0);
        assert_eq!(decoded.hear_radius, 100);
        assert_eq!(decoded.server_now_ms, 0);
        assert_eq!(decoded.screens[0].start_epoch_ms, 0);
        assert_eq!(decoded.screens[0].base_pos_ms, 0);
        assert_eq!(decoded.screens[0].axis, PlaneAxis::YZ);
    }

    #[test]
    fn test_hand_built_v1_payload() {
        let mut p = vec![MSG_SYNC];
        p.extend_from_slice(&1i32.to_be_bytes());
        p.extend_from_slice(&1i32.to_be_bytes());
        for s in ["s1", "world"] {
            p.extend_from_slice(&(s.len() as u16).to_be_bytes());
            p.extend_from_slice(s.as_bytes());
        }
        for v in [1i32, 2, 3, 4, 5, 6] {
            p.extend_from_slice(&v.to_be_bytes());
        }
        p.push(1);
        p.extend_from_slice(&0u16.to_be_bytes());
        p.extend_from_slice(&[1, 0]);
        p.extend_from_slice(&0.5f32.to_be_bytes());

        let msg = decode_payload(&p).unwrap();
        let s = &msg.screens[0];
        assert_eq!(s.name, "s1");
        assert_eq!(s.corner_b, BlockPos::new(4, 5, 6));
        assert_eq!(s.axis, PlaneAxis::XZ);
        assert!(s.playing && !s.looping);
        assert!(!s.has_url());
        assert_eq!(s.volume, 0.5);
    }

    #[test]
    fn test_rejects_bad_frames() {
        assert!(decode_frame(b"COL").is_err());
        assert!(decode_frame(b"XXXX\0\0\0\0").is_err());

        let mut negative = b"COLL".to_vec();
        negative.extend_from_slice(&(-1i32).to_be_bytes());
        assert!(decode_frame(&negative).is_err());

        let mut huge = b"COLL".to_vec();
        huge.extend_from_slice(&5_000_001i32.to_be_bytes());
        assert!(decode_frame(&huge).is_err());

        let frame = encode_frame(&SyncMessage::new(1.0, 10, 5, vec![anchored("a")])).unwrap();
        assert!(decode_frame(&frame[..frame.len() - 1]).is_err());
    }

    #[test]
    fn test_rejects_bad_payloads() {
        assert!(decode_payload(&[2, 0, 0, 0, 2]).is_err());
        assert!(decode_payload(&[MSG_SYNC, 0, 0, 0, 9]).is_err());

        let mut too_many = vec![MSG_SYNC];
        too_many.extend_from_slice(&1i32.to_be_bytes());
        too_many.extend_from_slice(&10_001i32.to_be_bytes());
        assert!(decode_payload(&too_many).is_err());
    }

    #[test]
    fn test_modified_utf8() {
        assert_eq!(encode_modified_utf8("\0"), vec![0xC0, 0x80]);
        assert_eq!(encode_modified_utf8("😀").len(), 6);
        assert_eq!(decode_modified_utf8(&encode_modified_utf8("a\0é😀")).unwrap(), "a\0é😀");
        assert!(decode_modified_utf8(&[0xC3]).is_err());
        assert!(decode_modified_utf8(&[0xFF]).is_err());
    }
}
