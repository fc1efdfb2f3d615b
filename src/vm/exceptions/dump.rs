//! Binary exception record for post-mortem tools.
//!
//! Layout, native byte order:
//!
//! ```text
//! usize  exception type handle
//! i32    HRESULT
//! i32    frame count (N)
//! usize  frame address * N
//! ```
//!
//! Dump files prefix the record with [`DUMP_SIGNATURE`] as a `u32`. Any
//! change to the layout needs a new signature.
use super::{Exception, StackIp, StackTrace};
use crate::{error::DumpError, types::core_types, types::TypeHandle};
use tracing::warn;

/// `EX01`
pub const DUMP_SIGNATURE: u32 = 0x3130_5845;

const WORD: usize = size_of::<usize>();
pub const RECORD_HEADER_SIZE: usize = WORD + 4 + 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedException {
    pub type_handle: usize,
    pub hresult: i32,
    pub frames: Vec<StackIp>,
}

impl Exception {
    pub fn serialize_for_dump(&self) -> Vec<u8> {
        let frames = self.stack_ips();
        let count = frames.len().min(i32::MAX as usize);
        let mut buffer = Vec::with_capacity(RECORD_HEADER_SIZE + count * WORD);
        buffer.extend_from_slice(&self.type_handle().as_raw().to_ne_bytes());
        buffer.extend_from_slice(&self.hresult().to_ne_bytes());
        buffer.extend_from_slice(&(count as i32).to_ne_bytes());
        for ip in &frames[..count] {
            buffer.extend_from_slice(&ip.0.to_ne_bytes());
        }
        buffer
    }

    /// Rebuilds an exception from a record. Malformed input gives a plain
    /// `System.Exception` with no frames rather than an error.
    pub fn from_dump(bytes: &[u8]) -> Exception {
        match parse_dump(bytes) {
            Ok(record) => {
                let exception = Exception::new(resolve_type(record.type_handle));
                exception.set_hresult(record.hresult);
                exception.swap_trace(StackTrace::from_frames(record.frames));
                exception
            }
            Err(error) => {
                warn!(%error, "ignoring malformed exception record");
                Exception::new(core_types().exception)
            }
        }
    }
}

/// Only core types can be recognized from a bare address.
fn resolve_type(raw: usize) -> TypeHandle {
    core_types()
        .all()
        .into_iter()
        .find(|t| t.as_raw() == raw)
        .unwrap_or(core_types().exception)
}

fn read_word(bytes: &[u8], at: usize) -> usize {
    let mut word = [0u8; WORD];
    word.copy_from_slice(&bytes[at..at + WORD]);
    usize::from_ne_bytes(word)
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    i32::from_ne_bytes(raw)
}

pub fn parse_dump(bytes: &[u8]) -> Result<SerializedException, DumpError> {
    if bytes.len() < RECORD_HEADER_SIZE {
        return Err(DumpError::Truncated {
            expected: RECORD_HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    let type_handle = read_word(bytes, 0);
    let hresult = read_i32(bytes, WORD);
    let count = read_i32(bytes, WORD + 4);
    if count < 0 {
        return Err(DumpError::NegativeFrameCount(count));
    }

    let body = &bytes[RECORD_HEADER_SIZE..];
    let expected = (count as usize).checked_mul(WORD).unwrap_or(usize::MAX);
    if body.len() != expected {
        return Err(DumpError::LengthMismatch {
            expected,
            actual: body.len(),
        });
    }
    let frames = body
        .chunks_exact(WORD)
        .map(|chunk| StackIp(read_word(chunk, 0)))
        .collect();
    Ok(SerializedException {
        type_handle,
        hresult,
        frames,
    })
}

/// Signature followed by the record.
pub fn write_dump_file(exception: &Exception) -> Vec<u8> {
    let mut out = DUMP_SIGNATURE.to_ne_bytes().to_vec();
    out.extend(exception.serialize_for_dump());
    out
}

pub fn read_dump_file(bytes: &[u8]) -> Result<SerializedException, DumpError> {
    if bytes.len() < 4 {
        return Err(DumpError::Truncated {
            expected: 4,
            actual: bytes.len(),
        });
    }
    let signature = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if signature != DUMP_SIGNATURE {
        return Err(DumpError::BadSignature(signature));
    }
    parse_dump(&bytes[4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::exceptions::EhFrameFlags;

    fn thrown(frames: &[usize]) -> Exception {
        let e = Exception::from_message("boom");
        for (i, ip) in frames.iter().enumerate() {
            let flags = if i == 0 {
                EhFrameFlags::FIRST_FRAME
            } else {
                EhFrameFlags::empty()
            };
            e.append_stack_frame(StackIp(*ip), flags);
        }
        e
    }

    #[test]
    fn test_record_layout() {
        let e = thrown(&[0x1000, 0x2000]);
        let bytes = e.serialize_for_dump();
        assert_eq!(bytes.len(), RECORD_HEADER_SIZE + 2 * WORD);
        assert_eq!(read_word(&bytes, 0), core_types().exception.as_raw());
        assert_eq!(read_i32(&bytes, WORD), e.hresult());
        assert_eq!(read_i32(&bytes, WORD + 4), 2);
        assert_eq!(read_word(&bytes, RECORD_HEADER_SIZE + WORD), 0x2000);
    }

    #[test]
    fn test_unthrown_record_has_no_frames() {
        let bytes = Exception::from_message("boom").serialize_for_dump();
        assert_eq!(bytes.len(), RECORD_HEADER_SIZE);
        assert!(parse_dump(&bytes).unwrap().frames.is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(
            parse_dump(&[0; 3]),
            Err(DumpError::Truncated {
                expected: RECORD_HEADER_SIZE,
                actual: 3
            })
        );

        let mut negative = vec![0u8; RECORD_HEADER_SIZE];
        negative[WORD + 4..WORD + 8].copy_from_slice(&(-1i32).to_ne_bytes());
        assert_eq!(parse_dump(&negative), Err(DumpError::NegativeFrameCount(-1)));

        let mut short = thrown(&[0x1000, 0x2000]).serialize_for_dump();
        short.pop();
        assert!(matches!(parse_dump(&short), Err(DumpError::LengthMismatch { .. })));
    }

    #[test]
    fn test_from_dump_restores_type_and_frames() {
        let e = thrown(&[0x1000, 0x2000]);
        let mut bytes = e.serialize_for_dump();
        bytes[..WORD].copy_from_slice(&core_types().invalid_operation.as_raw().to_ne_bytes());

        let restored = Exception::from_dump(&bytes);
        assert!(restored.type_handle().equals(core_types().invalid_operation));
        assert_eq!(restored.stack_ips(), vec![StackIp(0x1000), StackIp(0x2000)]);
        assert_eq!(restored.hresult(), e.hresult());
    }

    #[test]
    fn test_from_dump_is_best_effort() {
        let restored = Exception::from_dump(&[1, 2, 3]);
        assert!(restored.type_handle().equals(core_types().exception));
        assert!(!restored.has_been_thrown());
    }

    #[test]
    fn test_dump_file_signature() {
        let bytes = write_dump_file(&thrown(&[0x1000]));
        assert_eq!(&bytes[..4], &DUMP_SIGNATURE.to_ne_bytes());
        assert_eq!(read_dump_file(&bytes).unwrap().frames, vec![StackIp(0x1000)]);

        let mut forged = bytes.clone();
        forged[0] ^= 0xff;
        assert!(matches!(read_dump_file(&forged), Err(DumpError::BadSignature(_))));
    }
}
