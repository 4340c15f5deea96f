/*!
 * AES key objects and the protected-key cache
 *
 * An [`AesKey`] is the unit of configuration and key-material lifecycle:
 * it owns the secure-token generations ("current" and, during a master key
 * rotation, "old") and the cached protected key derived from them. Multiple
 * cipher engines may share one key object concurrently; the object, not the
 * engine, owns the authoritative cached protected key.
 */

mod aes_key;
mod cache;

pub use aes_key::*;
pub(crate) use cache::*;
