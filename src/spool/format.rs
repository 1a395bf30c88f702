//! Spool wire format (v1).
//!
//! ## File layout
//! ```text
//! Header:  MAGIC (8 bytes) + VERSION (u32 LE) = 12 bytes
//!
//! Record (length-prefixed):
//!   len(u32)                     — payload size in bytes, excluding this prefix
//!   pid(u32) + tid(u64)
//!   name_len(u16) + name bytes   — UTF-8, at most 256 bytes
//!   time_sec(i64) + time_nsec(u32)
//!   frame_count(u32)
//!   frames: frame_count × { ip(u64) + sp(u64) }
//! ```
//!
//! All integers little-endian. The reader treats a truncated trailing record
//! as end-of-stream, so a spool left behind by a crashed session reads
//! cleanly up to the last complete record.

use std::io::{Read, Result, Write};

use crate::sample::{Sample, StackFrame};

pub const MAGIC: &[u8; 8] = b"PROFSPOL";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 12; // 8 magic + 4 version

/// Thread names longer than this are truncated on the wire.
pub const MAX_THREAD_NAME: usize = 256;

/// Upper bound on a single record payload; anything larger is corruption.
const MAX_RECORD_SIZE: u32 = 1 << 24;

pub fn write_header(w: &mut impl Write) -> Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())
}

pub fn read_header(r: &mut impl Read) -> Result<(String, u32)> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    let mut version = [0u8; 4];
    r.read_exact(&mut version)?;
    Ok((
        String::from_utf8_lossy(&magic).to_string(),
        u32::from_le_bytes(version),
    ))
}

/// Truncate a thread name to the wire limit without splitting a UTF-8
/// character.
fn wire_name(name: &str) -> &str {
    if name.len() <= MAX_THREAD_NAME {
        return name;
    }
    let mut end = MAX_THREAD_NAME;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// The on-disk size of one record, including the length prefix.
pub fn wire_sample_size(sample: &Sample) -> usize {
    4 + payload_size(sample)
}

fn payload_size(sample: &Sample) -> usize {
    4 + 8 + 2 + wire_name(&sample.thread_name).len() + 8 + 4 + 4 + 16 * sample.frames.len()
}

pub fn write_sample(w: &mut impl Write, sample: &Sample) -> Result<()> {
    let name = wire_name(&sample.thread_name);
    w.write_all(&(payload_size(sample) as u32).to_le_bytes())?;
    w.write_all(&sample.pid.to_le_bytes())?;
    w.write_all(&sample.tid.to_le_bytes())?;
    w.write_all(&(name.len() as u16).to_le_bytes())?;
    w.write_all(name.as_bytes())?;
    w.write_all(&sample.time_sec.to_le_bytes())?;
    w.write_all(&sample.time_nsec.to_le_bytes())?;
    w.write_all(&(sample.frames.len() as u32).to_le_bytes())?;
    for frame in &sample.frames {
        w.write_all(&frame.ip.to_le_bytes())?;
        w.write_all(&frame.sp.to_le_bytes())?;
    }
    Ok(())
}

/// Read one record. Returns `Ok(None)` at EOF or on a truncated tail.
pub fn read_sample(r: &mut impl Read) -> Result<Option<Sample>> {
    let mut len_bytes = [0u8; 4];
    if r.read_exact(&mut len_bytes).is_err() {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_RECORD_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("spool record of {len} bytes exceeds the format limit"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    if r.read_exact(&mut payload).is_err() {
        // Partial trailing record: the session died mid-write.
        return Ok(None);
    }
    parse_payload(&payload)
}

struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let slice = self.buf.get(self.pos..self.pos + n).ok_or_else(invalid)?;
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

fn invalid() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed spool record")
}

fn parse_payload(payload: &[u8]) -> Result<Option<Sample>> {
    let mut r = PayloadReader {
        buf: payload,
        pos: 0,
    };

    let pid = r.u32()?;
    let tid = r.u64()?;
    let name_len = r.u16()? as usize;
    if name_len > MAX_THREAD_NAME {
        return Err(invalid());
    }
    let thread_name = std::str::from_utf8(r.take(name_len)?)
        .map_err(|_| invalid())?
        .to_string();
    let time_sec = r.i64()?;
    let time_nsec = r.u32()?;
    let frame_count = r.u32()? as usize;
    let mut frames = Vec::with_capacity(frame_count);
    for _ in 0..frame_count {
        let ip = r.u64()?;
        let sp = r.u64()?;
        frames.push(StackFrame::new(ip, sp));
    }
    if r.pos != payload.len() {
        return Err(invalid());
    }

    Ok(Some(Sample {
        pid,
        tid,
        thread_name,
        time_sec,
        time_nsec,
        frames,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SENTINEL_SP;
    use std::io::Cursor;

    fn sample(frames: usize) -> Sample {
        Sample {
            pid: 4242,
            tid: 777,
            thread_name: "tokio-runtime-w".to_string(),
            time_sec: 1_700_000_123,
            time_nsec: 456_789_012,
            frames: (0..frames)
                .map(|i| StackFrame::new(0x4000 + i as u64 * 8, 0x7ffc_0000 - i as u64 * 64))
                .collect(),
        }
    }

    /// Write a sample and read it back, asserting the wire size matches.
    fn roundtrip(sample: &Sample) -> Sample {
        let mut buf = Vec::new();
        write_sample(&mut buf, sample).unwrap();
        assert_eq!(buf.len(), wire_sample_size(sample));
        read_sample(&mut Cursor::new(buf)).unwrap().unwrap()
    }

    #[test]
    fn header_roundtrip() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        let (magic, version) = read_header(&mut Cursor::new(buf)).unwrap();
        assert_eq!(magic, "PROFSPOL");
        assert_eq!(version, VERSION);
    }

    #[test]
    fn sample_roundtrip() {
        let s = sample(5);
        assert_eq!(roundtrip(&s), s);
    }

    #[test]
    fn empty_stack_roundtrip() {
        let s = sample(0);
        let decoded = roundtrip(&s);
        assert!(decoded.frames.is_empty());
        assert_eq!(decoded.tid, 777);
    }

    #[test]
    fn sentinel_sp_survives() {
        let mut s = sample(1);
        s.frames[0] = StackFrame::new(0x1234, SENTINEL_SP);
        assert!(roundtrip(&s).frames[0].is_end_marker());
    }

    #[test]
    fn long_thread_name_is_truncated_on_wire() {
        let mut s = sample(1);
        s.thread_name = "x".repeat(1000);
        let decoded = roundtrip(&s);
        assert_eq!(decoded.thread_name.len(), MAX_THREAD_NAME);
    }

    #[test]
    fn multibyte_name_truncates_on_char_boundary() {
        let mut s = sample(0);
        // 'é' is two bytes; 200 of them exceed the 256-byte cap.
        s.thread_name = "é".repeat(200);
        let decoded = roundtrip(&s);
        assert!(decoded.thread_name.len() <= MAX_THREAD_NAME);
        assert!(decoded.thread_name.chars().all(|c| c == 'é'));
    }

    #[test]
    fn eof_returns_none() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_sample(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn truncated_tail_returns_none() {
        let mut buf = Vec::new();
        write_sample(&mut buf, &sample(3)).unwrap();
        // Chop the record anywhere: the reader must treat it as EOF.
        for cut in 1..buf.len() {
            let mut cursor = Cursor::new(&buf[..cut]);
            assert!(
                read_sample(&mut cursor).unwrap().is_none(),
                "cut at {cut} should read as a clean EOF"
            );
        }
    }

    #[test]
    fn oversized_length_prefix_is_corruption() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_le_bytes());
        assert!(read_sample(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn record_stream_preserves_order() {
        let mut buf = Vec::new();
        for i in 0..4u64 {
            let mut s = sample(i as usize);
            s.tid = i;
            write_sample(&mut buf, &s).unwrap();
        }
        let mut cursor = Cursor::new(buf);
        for i in 0..4u64 {
            let s = read_sample(&mut cursor).unwrap().unwrap();
            assert_eq!(s.tid, i);
            assert_eq!(s.frames.len(), i as usize);
        }
        assert!(read_sample(&mut cursor).unwrap().is_none());
    }
}
