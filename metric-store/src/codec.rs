//! Binary encoding for point batches.
//!
//! The format is little-endian and self-delimiting so that a decoder can
//! validate a whole buffer before producing anything:
//!
//! ```text
//! magic "MSB1" (4) | point_count u32
//! per point:
//!   source_id str | metric_name str | timestamp i64 | value f64 (IEEE bits)
//!   label_count u16 | label_count x (key str | value str)
//! str = u16 byte length | UTF-8 bytes
//! ```
//!
//! # Design
//!
//! - Decoding never panics: every read is bounds checked through [`Reader`].
//! - Declared counts are checked against the remaining bytes before any
//!   allocation, so a hostile count cannot force a large reservation.
//! - Decoding is all-or-nothing. Errors never carry a partial batch.
//! - NaN values survive a round trip bit-for-bit.
//! - Encoding never truncates. A point that does not fit the format is an
//!   [`EncodeError`] and nothing is written.

use std::collections::BTreeMap;

use crate::error::{DecodeError, EncodeError};
use crate::point::{Batch, Point};

/// Leading bytes of every encoded batch.
pub const BATCH_MAGIC: [u8; 4] = *b"MSB1";

/// Longest encodable string, in bytes.
pub const MAX_STR_LEN: usize = u16::MAX as usize;

/// Most labels a point may carry.
pub const MAX_LABELS: usize = u16::MAX as usize;

/// Smallest possible encoded point: two empty strings, timestamp, value, label count.
const MIN_POINT_SIZE: usize = 2 + 2 + 8 + 8 + 2;

/// Smallest possible encoded label: two empty strings.
const MIN_LABEL_SIZE: usize = 2 + 2;

/// Encodes a batch into a fresh buffer.
///
/// # Errors
///
/// Returns [`EncodeError`] if any point exceeds a format limit (see
/// [`check_point`]) or the batch holds more than `u32::MAX` points.
///
/// # Examples
///
/// ```rust
/// use metric_store::codec::{decode, encode};
/// use metric_store::point::{Batch, Point};
///
/// let batch = Batch::new(vec![Point::new("app-1", "cpu", 1_000, 0.5).with_label("env", "prod")]);
/// let bytes = encode(&batch).unwrap();
/// assert_eq!(decode(&bytes).unwrap(), batch);
/// ```
pub fn encode(batch: &Batch) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::with_capacity(encoded_len(batch));
    encode_into(batch, &mut buf)?;
    Ok(buf)
}

/// Encodes a batch, appending to `buf`.
///
/// The whole batch is checked first; on error `buf` is left untouched.
///
/// # Errors
///
/// See [`encode`].
pub fn encode_into(batch: &Batch, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
    let count = u32::try_from(batch.points.len()).map_err(|_| EncodeError::TooManyPoints {
        count: batch.points.len(),
        max: u32::MAX as usize,
    })?;
    for point in &batch.points {
        check_point(point)?;
    }

    buf.extend_from_slice(&BATCH_MAGIC);
    buf.extend_from_slice(&count.to_le_bytes());
    for point in &batch.points {
        put_str(buf, &point.source_id);
        put_str(buf, &point.metric_name);
        buf.extend_from_slice(&point.timestamp.to_le_bytes());
        buf.extend_from_slice(&point.value.to_bits().to_le_bytes());

        // check_point bounds the label count
        #[allow(clippy::cast_possible_truncation)]
        buf.extend_from_slice(&(point.labels.len() as u16).to_le_bytes());
        for (key, value) in &point.labels {
            put_str(buf, key);
            put_str(buf, value);
        }
    }
    Ok(())
}

/// Checks that a point fits the format: every string at most
/// [`MAX_STR_LEN`] bytes and at most [`MAX_LABELS`] labels.
///
/// # Errors
///
/// Returns the first limit the point exceeds.
pub fn check_point(point: &Point) -> Result<(), EncodeError> {
    if point.labels.len() > MAX_LABELS {
        return Err(EncodeError::TooManyLabels {
            count: point.labels.len(),
            max: MAX_LABELS,
        });
    }
    let fields = [
        ("source_id", point.source_id.as_str()),
        ("metric_name", point.metric_name.as_str()),
    ];
    let labels = point
        .labels
        .iter()
        .flat_map(|(k, v)| [("label key", k.as_str()), ("label value", v.as_str())]);
    for (field, value) in fields.into_iter().chain(labels) {
        if value.len() > MAX_STR_LEN {
            return Err(EncodeError::StringTooLong {
                field,
                len: value.len(),
                max: MAX_STR_LEN,
            });
        }
    }
    Ok(())
}

/// Exact size of [`encode`]'s output for an encodable `batch`.
pub fn encoded_len(batch: &Batch) -> usize {
    8 + batch
        .points
        .iter()
        .map(|p| {
            MIN_POINT_SIZE
                + p.source_id.len()
                + p.metric_name.len()
                + p
                    .labels
                    .iter()
                    .map(|(k, v)| MIN_LABEL_SIZE + k.len() + v.len())
                    .sum::<usize>()
        })
        .sum::<usize>()
}

/// Decodes a complete batch.
///
/// # Errors
///
/// Returns [`DecodeError`] if the buffer is not exactly one well-formed batch:
/// wrong magic, truncation, impossible counts, invalid UTF-8, duplicate label
/// keys, or trailing bytes.
pub fn decode(bytes: &[u8]) -> Result<Batch, DecodeError> {
    let mut reader = Reader::new(bytes);

    let magic = reader.take(BATCH_MAGIC.len())?;
    if magic != BATCH_MAGIC {
        return Err(DecodeError::BadMagic {
            found: magic.to_vec(),
        });
    }

    let count = reader.u32()? as usize;
    reader.check_count("point", count, MIN_POINT_SIZE)?;

    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        points.push(decode_point(&mut reader)?);
    }

    if reader.remaining() > 0 {
        return Err(DecodeError::TrailingBytes {
            count: reader.remaining(),
        });
    }

    Ok(Batch { points })
}

fn decode_point(reader: &mut Reader<'_>) -> Result<Point, DecodeError> {
    let source_id = reader.string()?;
    let metric_name = reader.string()?;
    let timestamp = reader.i64()?;
    let value = f64::from_bits(reader.u64()?);

    let label_count = usize::from(reader.u16()?);
    reader.check_count("label", label_count, MIN_LABEL_SIZE)?;

    let mut labels = BTreeMap::new();
    for _ in 0..label_count {
        let key = reader.string()?;
        let value = reader.string()?;
        if labels.contains_key(&key) {
            return Err(DecodeError::DuplicateLabel { key });
        }
        labels.insert(key, value);
    }

    Ok(Point {
        source_id,
        metric_name,
        timestamp,
        value,
        labels,
    })
}

/// Writes a length-prefixed string already checked against [`MAX_STR_LEN`].
fn put_str(buf: &mut Vec<u8>, s: &str) {
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Bounds-checked cursor over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof {
                offset: self.pos,
                needed: len - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let len = usize::from(self.u16()?);
        let offset = self.pos;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8 { offset })
    }

    fn check_count(
        &self,
        what: &'static str,
        count: usize,
        min_size: usize,
    ) -> Result<(), DecodeError> {
        if count.saturating_mul(min_size) > self.remaining() {
            return Err(DecodeError::InvalidCount {
                what,
                count,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> Batch {
        Batch::new(vec![
            Point::new("app-1", "cpu", 1_000, 0.5).with_label("env", "prod"),
            Point::new("app-2", "mem", -5, f64::NAN),
            Point::new("", "", i64::MAX, -0.0)
                .with_label("a", "")
                .with_label("ünïcødé", "✓"),
        ])
    }

    #[test]
    fn test_round_trip_preserves_points() {
        let batch = sample_batch();
        let bytes = encode(&batch).unwrap();
        assert_eq!(bytes.len(), encoded_len(&batch));

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.points.len(), 3);
        assert_eq!(decoded.points[0], batch.points[0]);
        assert_eq!(decoded.points[2], batch.points[2]);
        // NaN != NaN, so compare bits
        assert_eq!(
            decoded.points[1].value.to_bits(),
            batch.points[1].value.to_bits()
        );
        assert!(decoded.points[2].value.is_sign_negative());
    }

    #[test]
    fn test_empty_batch() {
        let bytes = encode(&Batch::default()).unwrap();
        assert_eq!(bytes.len(), 8);
        assert!(decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_every_truncation_is_rejected() {
        let bytes = encode(&sample_batch()).unwrap();
        for len in 0..bytes.len() {
            assert!(decode(&bytes[..len]).is_err(), "prefix of {len} bytes decoded");
        }
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = encode(&sample_batch()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(DecodeError::BadMagic { .. })));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = encode(&sample_batch()).unwrap();
        bytes.push(0);
        assert_eq!(decode(&bytes), Err(DecodeError::TrailingBytes { count: 1 }));
    }

    #[test]
    fn test_huge_point_count_is_rejected_before_allocating() {
        let mut bytes = BATCH_MAGIC.to_vec();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::InvalidCount { what: "point", .. })
        ));
    }

    #[test]
    fn test_length_prefix_past_end() {
        let mut bytes = BATCH_MAGIC.to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&500u16.to_le_bytes());
        bytes.extend_from_slice(&[b'a'; 30]);
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut bytes = encode(&Batch::new(vec![Point::new("ab", "m", 0, 0.0)])).unwrap();
        // source_id payload starts after magic, count and its length prefix
        bytes[10] = 0xff;
        assert!(matches!(decode(&bytes), Err(DecodeError::InvalidUtf8 { offset: 10 })));
    }

    #[test]
    fn test_duplicate_label_key() {
        let mut bytes = BATCH_MAGIC.to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        put_str(&mut bytes, "s");
        put_str(&mut bytes, "m");
        bytes.extend_from_slice(&0i64.to_le_bytes());
        bytes.extend_from_slice(&1.0f64.to_bits().to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        for _ in 0..2 {
            put_str(&mut bytes, "env");
            put_str(&mut bytes, "prod");
        }
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::DuplicateLabel {
                key: "env".to_string()
            })
        );
    }

    #[test]
    fn test_garbage_never_panics() {
        let mut state = 0x2545_f491_4f6c_dd1du64;
        for len in 0..256 {
            let mut bytes = BATCH_MAGIC.to_vec();
            for _ in 0..len {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                bytes.push(state.to_le_bytes()[0]);
            }
            let _ = decode(&bytes);
        }
    }

    #[test]
    fn test_oversized_string_is_rejected_not_truncated() {
        let long = "é".repeat(40_000);
        let batch = Batch::new(vec![Point::new("app-1", "cpu", 0, 0.0).with_label("env", long)]);
        let mut buf = b"keep".to_vec();
        assert_eq!(
            encode_into(&batch, &mut buf),
            Err(EncodeError::StringTooLong {
                field: "label value",
                len: 80_000,
                max: MAX_STR_LEN,
            })
        );
        assert_eq!(buf, b"keep");
    }

    #[test]
    fn test_keys_sharing_a_long_prefix_stay_distinct() {
        let stem = "k".repeat(MAX_STR_LEN - 1);
        let point = Point::new("app-1", "cpu", 0, 0.0)
            .with_label(format!("{stem}x"), "1")
            .with_label(format!("{stem}y"), "2");
        let batch = Batch::new(vec![point]);
        assert_eq!(decode(&encode(&batch).unwrap()).unwrap(), batch);

        let too_long = Point::new("app-1", "cpu", 0, 0.0).with_label(format!("{stem}xy"), "1");
        assert!(matches!(
            check_point(&too_long),
            Err(EncodeError::StringTooLong { field: "label key", .. })
        ));
    }

    #[test]
    fn test_string_at_limit_round_trips() {
        let point = Point::new("s".repeat(MAX_STR_LEN), "cpu", 0, 0.0);
        assert!(check_point(&point).is_ok());
        let batch = Batch::new(vec![point]);
        assert_eq!(decode(&encode(&batch).unwrap()).unwrap(), batch);
    }
}
