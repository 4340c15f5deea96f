//! Small shared helpers: randomness, constant-time comparison, hex.

use rand::{rngs::OsRng, RngCore};

use crate::error::{Error, Result};

/// Generate random bytes of the specified length
pub fn random_bytes(length: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; length];
    OsRng.fill_bytes(&mut bytes);
    Ok(bytes)
}

/// Constant-time comparison of two byte slices to avoid timing attacks
///
/// Length is compared first; unequal lengths short-circuit, which leaks
/// only the length, never the content.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}

/// Convert bytes to a hexadecimal string
pub fn to_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Convert a hexadecimal string to bytes
///
/// The `position` is the 1-based argument position reported on failure, so
/// callers can forward their own calling convention.
pub fn from_hex(s: &str, position: usize) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|_| Error::invalid_argument(position))
}
