//! Identifier and storage-key helpers

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique time-ordered id then encode using bech32 under `hrp`
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Key of one step row: the request id, a separator, then the big-endian
/// order so rows of a request sort by `step_order`.
pub fn step_key(request_id: &str, step_order: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(request_id.len() + 5);
    key.extend_from_slice(request_id.as_bytes());
    key.push(b'/');
    key.extend_from_slice(&step_order.to_be_bytes());
    key
}
