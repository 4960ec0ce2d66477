//! Shard index computation.

use crate::value::Value;

/// Numeric form of a routing key.
///
/// Integers are used as is (negative ones by magnitude); every other value
/// is CRC32 hashed, so resharding remaps keys fully.
pub fn shard_key(key: &Value) -> u64 {
    match key {
        Value::Int(i) => i.unsigned_abs(),
        Value::Bool(b) => u64::from(*b),
        Value::Null => 0,
        Value::String(s) => u64::from(crc32fast::hash(s.as_bytes())),
        Value::Bytes(b) => u64::from(crc32fast::hash(b)),
        Value::Float(f) => u64::from(crc32fast::hash(f.to_string().as_bytes())),
    }
}

/// Shard holding `key` among `shards` shards.
pub fn shard_for(key: &Value, shards: u64) -> u64 {
    if shards <= 1 {
        0
    } else {
        shard_key(key) % shards
    }
}
