/*!
 * Accelerator primitive boundary
 *
 * The crate consumes the platform's protected-key machinery through the
 * traits in this module: the adapter directory query, the wrap/unwrap and
 * re-encipher services, and the AES-XTS cipher instruction itself. The
 * physical instructions are opaque; only their success/failure contract is
 * specified here. `SoftAccelerator` is the in-tree software realization
 * used to exercise the protocol end to end.
 */

mod soft;

pub use soft::SoftAccelerator;


use std::fmt;

use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::apqn::{Apqn, MKVP_LEN};
use crate::key::{KeySize, KeyType};

/// Width of the wrapping key verification pattern (WKaVP)
pub const WKVP_LEN: usize = 32;

/// Width of a platform-provisioned secret id
pub const SECRET_ID_LEN: usize = 32;

/// Failures reported by the accelerator primitives
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccelError {
    /// The protected key handed to a cipher instruction was wrapped by a
    /// wrapping key that is no longer active. Detected by the instruction,
    /// never predictable beforehand.
    #[error("wrapping key verification pattern mismatch")]
    WrappingKeyMismatch,

    /// No configured adapter holds a master key matching the token
    #[error("no adapter holds a master key matching the token")]
    NoMatchingAdapter,

    /// The byte buffer is not a recognizable secure key token
    #[error("malformed key token")]
    MalformedToken,

    /// The adapter directory query primitive failed
    #[error("adapter directory query failed: {0}")]
    QueryFailed(String),

    /// The accelerator does not serve this key type through this primitive
    #[error("key type not supported by this primitive")]
    UnsupportedKeyType,

    /// No provisioned secret exists under the given id (or its length does
    /// not match the expected key size)
    #[error("no matching provisioned secret")]
    SecretNotFound,

    /// Re-encipherment to the NEW register requires a staged master key
    #[error("no master key staged in the NEW register")]
    NoStagedMasterKey,

    /// Re-encipherment from the OLD register requires a retained master key
    #[error("no master key retained in the OLD register")]
    NoOldMasterKey,
}

/// Cipher direction for the XTS instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    Encrypt,
    Decrypt,
}

/// Direction of a token re-encipherment during master key rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReencipherDirection {
    /// Re-wrap a token from the CURRENT register to the staged NEW one
    CurrentToNew,
    /// Re-wrap a token from the retained OLD register to the CURRENT one
    OldToCurrent,
}

/// An ephemeral protected key: accelerator-local key material plus the
/// verification pattern of the wrapping key that produced it.
///
/// A protected key is usable by cipher instructions only while its WKaVP
/// matches the accelerator's active wrapping key; staleness cannot be
/// checked a priori and surfaces as an instruction failure. The material is
/// zeroized on drop.
#[derive(Clone, PartialEq, Zeroize, ZeroizeOnDrop)]
pub struct ProtectedKey {
    value: Vec<u8>,
    wkvp: [u8; WKVP_LEN],
}

impl ProtectedKey {
    pub(crate) fn new(value: Vec<u8>, wkvp: [u8; WKVP_LEN]) -> Self {
        ProtectedKey { value, wkvp }
    }

    /// The protected key material
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Verification pattern of the wrapping key this key is tied to
    pub fn wkvp(&self) -> &[u8; WKVP_LEN] {
        &self.wkvp
    }

    /// Length of the protected key material in bytes
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Whether the protected key holds no material
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl fmt::Debug for ProtectedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectedKey")
            .field("value", &"[REDACTED]")
            .field("len", &self.value.len())
            .finish()
    }
}

/// Instruction parameter block for one XTS constituent key.
///
/// Built from a protected key when an engine binds its IV; rebuilt whenever
/// the key is re-derived after a wrapping key rotation. Private to one
/// engine, never shared.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct XtsParamBlock {
    protkey: Vec<u8>,
    wkvp: [u8; WKVP_LEN],
}

impl XtsParamBlock {
    /// Build a parameter block from a derived protected key
    pub fn from_protected(pk: &ProtectedKey) -> Self {
        XtsParamBlock {
            protkey: pk.value().to_vec(),
            wkvp: *pk.wkvp(),
        }
    }

    /// Replace key material and verification pattern after a re-derivation,
    /// leaving any engine-side tweak state untouched
    pub(crate) fn rebind(&mut self, pk: &ProtectedKey) {
        self.protkey.zeroize();
        self.protkey = pk.value().to_vec();
        self.wkvp = *pk.wkvp();
    }

    pub(crate) fn protkey(&self) -> &[u8] {
        &self.protkey
    }

    pub(crate) fn wkvp(&self) -> &[u8; WKVP_LEN] {
        &self.wkvp
    }

    /// Clobber the verification pattern, simulating a stale block.
    #[cfg(test)]
    pub(crate) fn clobber_wkvp(&mut self) {
        self.wkvp = [0u8; WKVP_LEN];
    }
}

impl fmt::Debug for XtsParamBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XtsParamBlock")
            .field("protkey", &"[REDACTED]")
            .finish()
    }
}

/// The adapter directory query primitive.
///
/// Split from [`Accelerator`] so the APQN resolver can be driven against a
/// bare directory in isolation.
pub trait AdapterDirectory {
    /// Report the adapters whose current master key matches `mkvp` for the
    /// given key type.
    ///
    /// Fills at most `out.len()` entries and returns the true match count,
    /// which may exceed the buffer; a zero-length `out` is the count probe.
    fn apqns_for_key_type(
        &self,
        mkvp: &[u8; MKVP_LEN],
        key_type: KeyType,
        out: &mut [Apqn],
    ) -> Result<usize, AccelError>;
}

/// The full set of consumed accelerator primitives
pub trait Accelerator: AdapterDirectory + Send + Sync {
    /// Wrap clear key material into a fresh secure key token
    fn wrap_clear_key(
        &self,
        clear: &[u8],
        size: KeySize,
        key_type: KeyType,
        apqns: &[Apqn],
        flags: u32,
    ) -> Result<Vec<u8>, AccelError>;

    /// Generate a fresh wrapped secure key token without ever exposing the
    /// clear key
    fn generate_secure_key(
        &self,
        size: KeySize,
        key_type: KeyType,
        apqns: &[Apqn],
        flags: u32,
    ) -> Result<Vec<u8>, AccelError>;

    /// Generate a random protected key with no secure-token lineage
    fn random_protected_key(&self, size: KeySize) -> Result<ProtectedKey, AccelError>;

    /// Unwrap a secure key token into a protected key tied to the active
    /// wrapping key
    fn unwrap_token(&self, token: &[u8]) -> Result<ProtectedKey, AccelError>;

    /// Check that a provisioned secret exists with the expected size
    fn verify_provisioned_secret(
        &self,
        id: &[u8; SECRET_ID_LEN],
        size: KeySize,
    ) -> Result<(), AccelError>;

    /// Derive a protected key from a platform-provisioned secret
    fn unwrap_provisioned_secret(
        &self,
        id: &[u8; SECRET_ID_LEN],
        size: KeySize,
    ) -> Result<ProtectedKey, AccelError>;

    /// Re-wrap a secure key token under another master key register
    fn reencipher_token(
        &self,
        token: &[u8],
        direction: ReencipherDirection,
    ) -> Result<Vec<u8>, AccelError>;

    /// Compute the initial XTS tweak by enciphering the IV under the tweak
    /// key's parameter block
    fn compute_xts_tweak(
        &self,
        tweak_param: &XtsParamBlock,
        iv: &[u8; 16],
    ) -> Result<[u8; 16], AccelError>;

    /// Run the AES-XTS instruction over a whole-blocks buffer in place.
    ///
    /// Validates both parameter blocks' verification patterns against the
    /// active wrapping key before touching the buffer, and advances the
    /// running tweak by one multiplication per block processed.
    fn xts_cipher(
        &self,
        data_param: &XtsParamBlock,
        tweak_param: &XtsParamBlock,
        tweak: &mut [u8; 16],
        direction: CipherDirection,
        buf: &mut [u8],
    ) -> Result<(), AccelError>;
}
