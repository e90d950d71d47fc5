//! Utility functions for identifiers and hashing

use super::error::{DealError, Result};
use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String> {
    let hrp = bech32::Hrp::parse(hrp).map_err(|e| DealError::Identifier(e.to_string()))?;
    bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| DealError::Identifier(e.to_string()))
}

/// Encode a record into CBOR and return it with its sha256 digest.
pub fn cbor_with_digest<T: minicbor::Encode<()>>(value: &T) -> Result<(String, Vec<u8>)> {
    let cbor = minicbor::to_vec(value)?;
    let hash = sha256::digest(&cbor);

    Ok((hash, cbor))
}
