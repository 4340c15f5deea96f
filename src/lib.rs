/*!
 * protkey - Secure Key Tokens and Protected-Key AES-XTS
 *
 * This library manages hardware-wrapped ("secure") AES key tokens on
 * platforms with a protected-key cryptographic accelerator, and drives an
 * AES-XTS cipher engine over those keys.
 *
 * A secure key is wrapped by a hardware security module's master key and is
 * opaque outside that module except for its parseable header. Before the
 * fast in-core cipher instructions can use it, it is unwrapped into an
 * ephemeral *protected key* tied to the accelerator's current wrapping key.
 * Protected keys go stale whenever that wrapping key changes; the cipher
 * engine detects this through the instruction's own mismatch signal,
 * re-derives from the backing token, and retries transparently - exactly
 * once.
 *
 * The main pieces are:
 *
 * - [`token`] - classification and validation of CCA and EP11 secure key
 *   token layouts
 * - [`apqn`] - resolution of the adapters whose master key matches a
 *   token's verification pattern
 * - [`key`] - the [`AesKey`] object: configuration, token generations,
 *   and the cached protected key shared by all engines using the key
 * - [`xts`] - the [`AesXts`] engine: streaming AES-XTS with tweak
 *   chaining, segment hand-off, and stale-key recovery
 * - [`accel`] - the accelerator primitive boundary, including the
 *   [`SoftAccelerator`] software backend
 *
 * # Example
 *
 * ```
 * use std::sync::Arc;
 * use protkey::{AesKey, AesXts, KeyType, SoftAccelerator};
 *
 * # fn main() -> protkey::Result<()> {
 * let accel = Arc::new(SoftAccelerator::new());
 *
 * // Configure a data key and a tweak key backed by wrapped tokens
 * let mut keys = Vec::new();
 * for _ in 0..2 {
 *     let key = AesKey::new(accel.clone());
 *     key.set_type(KeyType::CcaData)?;
 *     key.set_mkvp(&accel.current_mkvp_hex())?;
 *     key.set_size(256)?;
 *     key.generate()?;
 *     keys.push(Arc::new(key));
 * }
 * let tweak_key = keys.pop().unwrap();
 * let data_key = keys.pop().unwrap();
 *
 * // Bind an engine and run a streaming encryption
 * let mut engine = AesXts::new(accel.clone());
 * engine.set_key(Some(data_key), Some(tweak_key))?;
 * engine.set_iv(&[0x2a; 16])?;
 *
 * let mut buf = *b"a sixteen byte m";
 * engine.encrypt_in_place(&mut buf)?;
 * # Ok(())
 * # }
 * ```
 */

/// Secure key token classification and validation
pub mod token;

/// Adapter (APQN) resolution by master key verification pattern
pub mod apqn;

/// Accelerator primitive boundary and the software backend
pub mod accel;

/// AES key objects and the protected-key cache
pub mod key;

/// AES-XTS cipher engine over protected keys
pub mod xts;

/// Common error types for the library
pub mod error;

/// Utilities shared across modules
pub mod utils;

// Re-export main types for convenience
pub use accel::Accelerator;
pub use accel::AdapterDirectory;
pub use accel::ProtectedKey;
pub use accel::ReencipherDirection;
pub use accel::SoftAccelerator;
pub use apqn::Apqn;
pub use apqn::MKVP_LEN;
pub use error::{Error, Result};
pub use key::AesKey;
pub use key::KeySize;
pub use key::KeyType;
pub use token::classify;
pub use token::is_session_bound;
pub use token::is_xts;
pub use token::TokenVariant;
pub use xts::AesXts;
