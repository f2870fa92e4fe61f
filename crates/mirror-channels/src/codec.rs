//! Snapshot and delta encoding of back channel state.
//!
//! Channels treat encoded state as opaque bytes; only the codec knows how to
//! build or apply a delta.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::error::{ChannelError, ChannelResult};

pub trait StateCodec: Send + Sync {
    fn encode_snapshot(&self, state: &Value) -> ChannelResult<Bytes>;

    /// `None` when `previous` and `next` are byte-identical.
    fn compute_delta(&self, previous: &[u8], next: &[u8]) -> ChannelResult<Option<Bytes>>;

    fn apply_delta(&self, base: &[u8], delta: &[u8]) -> ChannelResult<Bytes>;

    fn decode(&self, encoded: &[u8]) -> ChannelResult<Value>;
}

const SPLICE_HEADER: usize = 16;

/// JSON snapshots with splice deltas.
///
/// A delta is two little-endian `u64`s (bytes kept from the front and from
/// the back of the previous snapshot) followed by the bytes inserted between
/// them.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSpliceCodec;

impl StateCodec for JsonSpliceCodec {
    fn encode_snapshot(&self, state: &Value) -> ChannelResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(state)?))
    }

    fn compute_delta(&self, previous: &[u8], next: &[u8]) -> ChannelResult<Option<Bytes>> {
        if previous == next {
            return Ok(None);
        }
        let prefix = previous
            .iter()
            .zip(next)
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = previous.len().min(next.len()) - prefix;
        let suffix = previous
            .iter()
            .rev()
            .zip(next.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();
        let insert = &next[prefix..next.len() - suffix];

        let mut delta = BytesMut::with_capacity(SPLICE_HEADER + insert.len());
        delta.put_u64_le(prefix as u64);
        delta.put_u64_le(suffix as u64);
        delta.put_slice(insert);
        Ok(Some(delta.freeze()))
    }

    fn apply_delta(&self, base: &[u8], delta: &[u8]) -> ChannelResult<Bytes> {
        if delta.len() < SPLICE_HEADER {
            return Err(ChannelError::Codec(format!(
                "delta of {} bytes is shorter than its header",
                delta.len()
            )));
        }
        let (header, insert) = delta.split_at(SPLICE_HEADER);
        let mut word = [0u8; 8];
        word.copy_from_slice(&header[..8]);
        let prefix = u64::from_le_bytes(word) as usize;
        word.copy_from_slice(&header[8..]);
        let suffix = u64::from_le_bytes(word) as usize;
        if prefix.saturating_add(suffix) > base.len() {
            return Err(ChannelError::Codec(format!(
                "delta keeps {prefix}+{suffix} bytes of a {} byte snapshot",
                base.len()
            )));
        }

        let mut next = BytesMut::with_capacity(prefix + insert.len() + suffix);
        next.put_slice(&base[..prefix]);
        next.put_slice(insert);
        next.put_slice(&base[base.len() - suffix..]);
        Ok(next.freeze())
    }

    fn decode(&self, encoded: &[u8]) -> ChannelResult<Value> {
        Ok(serde_json::from_slice(encoded)?)
    }
}
