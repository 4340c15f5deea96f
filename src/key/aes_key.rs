use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use zeroize::Zeroizing;

use crate::accel::{
    AccelError, Accelerator, ProtectedKey, ReencipherDirection, SECRET_ID_LEN,
};
use crate::apqn::{self, Apqn, MKVP_LEN};
use crate::error::{Error, Result};
use crate::token::{self, layout, TokenVariant};
use crate::utils;

use super::cache::{ProtectedKeyCache, TokenMaterial};

/// Supported AES key sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySize {
    Aes128,
    Aes192,
    Aes256,
}

impl KeySize {
    /// Key size in bits
    pub fn bits(self) -> u32 {
        match self {
            KeySize::Aes128 => 128,
            KeySize::Aes192 => 192,
            KeySize::Aes256 => 256,
        }
    }

    /// Key size in bytes
    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    /// Map a bit count to a key size
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            128 => Some(KeySize::Aes128),
            192 => Some(KeySize::Aes192),
            256 => Some(KeySize::Aes256),
            _ => None,
        }
    }

    /// Map a byte count to a key size
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            16 => Some(KeySize::Aes128),
            24 => Some(KeySize::Aes192),
            32 => Some(KeySize::Aes256),
            _ => None,
        }
    }
}

/// Secure key token families a key object can be configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// CCA AES DATA key tokens
    CcaData,
    /// CCA AES CIPHER key tokens
    CcaCipher,
    /// EP11 AES key tokens (bare or with kblob header)
    Ep11,
    /// Platform-provisioned secrets referenced by id
    Pvsecret,
}

impl KeyType {
    /// Whether a classified token variant is acceptable key material for
    /// this key type
    pub fn accepts(self, variant: TokenVariant) -> bool {
        matches!(
            (self, variant),
            (KeyType::CcaData, TokenVariant::CcaAesData)
                | (KeyType::CcaCipher, TokenVariant::CcaAesCipher)
                | (KeyType::Ep11, TokenVariant::Ep11Aes)
                | (KeyType::Ep11, TokenVariant::Ep11AesWithHeader)
        )
    }
}

struct KeyInner {
    size: Option<KeySize>,
    key_type: Option<KeyType>,
    flags: u32,
    apqns: Vec<Apqn>,
    selector_set: bool,
    cur: Option<TokenMaterial>,
    old: Option<TokenMaterial>,
    cache: ProtectedKeyCache,
    rand_protk: bool,
}

impl KeyInner {
    fn key_set(&self) -> bool {
        self.rand_protk || self.cur.is_some()
    }

    fn clear_material(&mut self) {
        self.cur = None;
        self.old = None;
        self.rand_protk = false;
        self.cache.invalidate();
    }

    fn get_or_derive_pk(&mut self, accel: &dyn Accelerator) -> Result<ProtectedKey> {
        self.cache
            .get_or_derive(self.cur.as_ref(), self.old.as_ref(), accel)
    }

    fn derive_pk(&mut self, accel: &dyn Accelerator) -> Result<ProtectedKey> {
        self.cache
            .derive(self.cur.as_ref(), self.old.as_ref(), accel)
    }
}

/// An AES key object: configuration, secure-token generations, and the
/// cached protected key derived from them.
///
/// The object is the unit shared between cipher engines; wrap it in an
/// [`Arc`] and hand clones to every engine that should use it. All state
/// sits behind one internal lock, so setters and derivations from
/// different threads serialize per object. Dropping the last reference
/// zeroizes token payloads and cached key material.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use protkey::{AesKey, KeyType, SoftAccelerator};
///
/// let accel = Arc::new(SoftAccelerator::new());
/// let key = AesKey::new(accel.clone());
/// key.set_type(KeyType::CcaData).unwrap();
/// key.set_mkvp(&accel.current_mkvp_hex()).unwrap();
/// key.set_size(256).unwrap();
/// key.generate().unwrap();
/// ```
pub struct AesKey {
    accel: Arc<dyn Accelerator>,
    inner: Mutex<KeyInner>,
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("AesKey")
            .field("size", &inner.size)
            .field("key_type", &inner.key_type)
            .field("key_set", &inner.key_set())
            .field("material", &"[REDACTED]")
            .finish()
    }
}

impl AesKey {
    /// Allocate an empty key object bound to an accelerator
    pub fn new(accel: Arc<dyn Accelerator>) -> Self {
        AesKey {
            accel,
            inner: Mutex::new(KeyInner {
                size: None,
                key_type: None,
                flags: 0,
                apqns: Vec::new(),
                selector_set: false,
                cur: None,
                old: None,
                cache: ProtectedKeyCache::new(),
                rand_protk: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, KeyInner> {
        self.inner.lock().expect("key object lock poisoned")
    }

    /// Set the key size in bits (128, 192 or 256).
    ///
    /// Re-setting to a different size discards key material imported under
    /// the previous size.
    pub fn set_size(&self, bits: u32) -> Result<()> {
        let size = KeySize::from_bits(bits).ok_or(Error::UnsupportedSize(bits))?;

        let mut inner = self.lock();
        if inner.key_set() && inner.size != Some(size) {
            log::debug!("key size changed with material present, unsetting key");
            inner.clear_material();
        }
        inner.size = Some(size);
        Ok(())
    }

    /// Set the secure key token family this object works with
    pub fn set_type(&self, key_type: KeyType) -> Result<()> {
        let mut inner = self.lock();
        inner.key_type = Some(key_type);
        Ok(())
    }

    /// Set the opaque usage flags passed through to the wrap and generate
    /// primitives
    pub fn set_flags(&self, flags: u32) -> Result<()> {
        self.lock().flags = flags;
        Ok(())
    }

    /// Select adapters by master key verification pattern.
    ///
    /// The hex pattern may be 8, 16 or 32 bytes long; shorter patterns are
    /// left-aligned into the query field. Resolution happens immediately
    /// against the adapter directory, so the key type must be set first.
    pub fn set_mkvp(&self, mkvp_hex: &str) -> Result<()> {
        let raw = utils::from_hex(mkvp_hex, 2)?;
        if !matches!(raw.len(), 8 | 16 | 32) {
            return Err(Error::invalid_argument(2));
        }
        let mut mkvp = [0u8; MKVP_LEN];
        mkvp[..raw.len()].copy_from_slice(&raw);

        let key_type = self.lock().key_type.ok_or(Error::TypeNotSet)?;
        // the directory is queried without holding the object lock
        let apqns = apqn::resolve(self.accel.as_ref(), &mkvp, key_type)?;

        let mut inner = self.lock();
        inner.apqns = apqns;
        inner.selector_set = true;
        Ok(())
    }

    /// Select adapters explicitly
    pub fn set_apqns(&self, apqns: &[Apqn]) -> Result<()> {
        if apqns.is_empty() {
            return Err(Error::invalid_argument(2));
        }
        let mut inner = self.lock();
        inner.apqns = apqns.to_vec();
        inner.selector_set = true;
        Ok(())
    }

    /// Import clear key material, wrapping it into a fresh secure token via
    /// the accelerator.
    ///
    /// The new token becomes the `current` generation and any cached
    /// protected key is invalidated.
    pub fn import_clear(&self, key: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let size = inner.size.ok_or(Error::SizeNotSet)?;
        let key_type = inner.key_type.ok_or(Error::TypeNotSet)?;
        if key_type == KeyType::Pvsecret {
            return Err(Error::UnsupportedType);
        }
        if key.len() != size.bytes() {
            return Err(Error::invalid_argument(2));
        }
        if key.iter().all(|&b| b == 0) {
            return Err(Error::WeakMaterial);
        }

        let token = self
            .accel
            .wrap_clear_key(key, size, key_type, &inner.apqns, inner.flags)
            .map_err(|e| Error::accelerator("wrap", e.to_string()))?;
        let variant = token::classify(&token).ok_or(Error::MalformedToken)?;

        inner.clear_material();
        inner.cur = Some(TokenMaterial::Secure {
            bytes: Zeroizing::new(token),
            variant,
        });
        log::debug!("clear key imported as {} token", variant);
        Ok(())
    }

    /// Import an existing secure key token.
    ///
    /// The buffer must classify as a variant acceptable for the configured
    /// type; if the token declares a key size it must agree with the
    /// configured size (an unconfigured size is adopted from the token).
    pub fn import(&self, token_bytes: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let key_type = inner.key_type.ok_or(Error::TypeNotSet)?;

        let variant = token::classify(token_bytes).ok_or(Error::MalformedToken)?;
        if !key_type.accepts(variant) {
            return Err(Error::UnsupportedType);
        }

        if let Some(bits) = declared_key_bits(token_bytes, variant) {
            let token_size = KeySize::from_bits(bits).ok_or(Error::MalformedToken)?;
            match inner.size {
                Some(size) if size != token_size => return Err(Error::SizeMismatch),
                Some(_) => {}
                None => inner.size = Some(token_size),
            }
        }

        inner.clear_material();
        inner.cur = Some(TokenMaterial::Secure {
            bytes: Zeroizing::new(token_bytes.to_vec()),
            variant,
        });
        log::debug!("{} token imported", variant);
        Ok(())
    }

    /// Export the current secure token (or provisioned-secret id).
    ///
    /// A random protected key has no token form and cannot be exported.
    pub fn export(&self) -> Result<Vec<u8>> {
        let inner = self.lock();
        if inner.rand_protk {
            return Err(Error::ProtectedKeyOnly);
        }
        match &inner.cur {
            Some(TokenMaterial::Secure { bytes, .. }) => Ok(bytes.to_vec()),
            Some(TokenMaterial::Provisioned { id, .. }) => Ok(id.to_vec()),
            None => Err(Error::KeyNotSet),
        }
    }

    /// Generate fresh key material.
    ///
    /// With an adapter selector set this produces a wrapped secure token.
    /// Without one it produces a bare random protected key: no token backs
    /// it, so it can never be re-derived once invalidated or stale.
    pub fn generate(&self) -> Result<()> {
        let mut inner = self.lock();
        let size = inner.size.ok_or(Error::SizeNotSet)?;

        if inner.selector_set {
            let key_type = inner.key_type.ok_or(Error::TypeNotSet)?;
            if key_type == KeyType::Pvsecret {
                return Err(Error::UnsupportedType);
            }
            let token = self
                .accel
                .generate_secure_key(size, key_type, &inner.apqns, inner.flags)
                .map_err(|e| Error::accelerator("generate", e.to_string()))?;
            let variant = token::classify(&token).ok_or(Error::MalformedToken)?;

            inner.clear_material();
            inner.cur = Some(TokenMaterial::Secure {
                bytes: Zeroizing::new(token),
                variant,
            });
            log::debug!("generated {} token", variant);
        } else {
            let pk = self
                .accel
                .random_protected_key(size)
                .map_err(|e| Error::accelerator("generate", e.to_string()))?;

            inner.clear_material();
            inner.cache.put(pk);
            inner.rand_protk = true;
            log::debug!("generated random protected key without token lineage");
        }
        Ok(())
    }

    /// Adopt a platform-provisioned secret as the token source.
    ///
    /// The id is verified against the platform store with the configured
    /// size before it is accepted.
    pub fn bind_to_provisioned_secret(&self, id: &[u8; SECRET_ID_LEN]) -> Result<()> {
        let mut inner = self.lock();
        let size = inner.size.ok_or(Error::SizeNotSet)?;
        match inner.key_type {
            Some(KeyType::Pvsecret) => {}
            Some(_) => return Err(Error::UnsupportedType),
            None => return Err(Error::TypeNotSet),
        }

        self.accel
            .verify_provisioned_secret(id, size)
            .map_err(|e| Error::accelerator("verify-secret", e.to_string()))?;

        inner.clear_material();
        inner.cur = Some(TokenMaterial::Provisioned { id: *id, size });
        Ok(())
    }

    /// Re-wrap the current token under another master key register.
    ///
    /// The result becomes the new `current` generation; the prior one is
    /// demoted to `old` so in-flight derivations can fall back to it while
    /// the rotation completes. The cached protected key is invalidated.
    pub fn reencipher(&self, direction: ReencipherDirection) -> Result<()> {
        let mut inner = self.lock();
        if inner.rand_protk {
            return Err(Error::ProtectedKeyOnly);
        }
        let (bytes, variant) = match &inner.cur {
            Some(TokenMaterial::Secure { bytes, variant }) => (bytes.clone(), *variant),
            Some(TokenMaterial::Provisioned { .. }) => return Err(Error::UnsupportedType),
            None => return Err(Error::KeyNotSet),
        };

        let reenciphered = self
            .accel
            .reencipher_token(&bytes, direction)
            .map_err(map_reencipher_error)?;

        inner.old = inner.cur.take();
        inner.cur = Some(TokenMaterial::Secure {
            bytes: Zeroizing::new(reenciphered),
            variant,
        });
        inner.cache.invalidate();
        log::info!("token re-enciphered ({:?}), prior generation demoted", direction);
        Ok(())
    }

    /// Drop any cached protected key, forcing the next use to re-derive
    /// from the current token generation
    pub fn invalidate_protected_key(&self) {
        self.lock().cache.invalidate();
    }

    /// Configured key size, if set
    pub fn size(&self) -> Option<KeySize> {
        self.lock().size
    }

    /// Configured key type, if set
    pub fn key_type(&self) -> Option<KeyType> {
        self.lock().key_type
    }

    /// Configured usage flags
    pub fn flags(&self) -> u32 {
        self.lock().flags
    }

    /// Resolved adapter set, if a selector has been applied
    pub fn apqns(&self) -> Vec<Apqn> {
        self.lock().apqns.clone()
    }

    /// Whether key material is present
    pub fn key_set(&self) -> bool {
        self.lock().key_set()
    }

    /// Whether a secure token (or provisioned secret) backs this key, i.e.
    /// whether its protected key can be re-derived after invalidation
    pub(crate) fn has_token_lineage(&self) -> bool {
        self.lock().cur.is_some()
    }

    /// Completeness check for engine binding: key material, size, and (for
    /// token-backed keys) type must all be configured
    pub(crate) fn check_ready(&self) -> Result<KeySize> {
        let inner = self.lock();
        if !inner.key_set() {
            return Err(Error::KeyNotSet);
        }
        let size = inner.size.ok_or(Error::SizeNotSet)?;
        if !inner.rand_protk && inner.key_type.is_none() {
            return Err(Error::TypeNotSet);
        }
        Ok(size)
    }

    /// Snapshot the protected key, deriving it if the cache slot is empty
    pub(crate) fn protected_key(&self) -> Result<ProtectedKey> {
        let mut inner = self.lock();
        if !inner.key_set() {
            return Err(Error::KeyNotSet);
        }
        inner.get_or_derive_pk(self.accel.as_ref())
    }

    /// Force a re-derivation from the token generations, replacing the
    /// cached value. Fails `ProtectedKeyOnly` for keys without lineage.
    pub(crate) fn rederive_protected_key(&self) -> Result<ProtectedKey> {
        let mut inner = self.lock();
        if !inner.key_set() {
            return Err(Error::KeyNotSet);
        }
        inner.derive_pk(self.accel.as_ref())
    }

    #[cfg(test)]
    pub(crate) fn cache_is_populated(&self) -> bool {
        self.lock().cache.is_cached()
    }
}

fn map_reencipher_error(e: AccelError) -> Error {
    match e {
        AccelError::MalformedToken => Error::MalformedToken,
        other => Error::accelerator("reencipher", other.to_string()),
    }
}

/// Declared key size in bits, for the variants that carry one
fn declared_key_bits(token: &[u8], variant: TokenVariant) -> Option<u32> {
    let u16_at = |off: usize| -> Option<u32> {
        Some(u16::from_be_bytes([*token.get(off)?, *token.get(off + 1)?]) as u32)
    };
    match variant {
        TokenVariant::CcaAesData => u16_at(layout::AESDATA_BITSIZE),
        TokenVariant::CcaAesCipher => u16_at(layout::AESCIPHER_PL),
        TokenVariant::Ep11Aes => u16_at(layout::EP11_KEYBITLEN),
        TokenVariant::Ep11AesWithHeader => {
            u16_at(layout::EP11_HDR_SIZE + layout::EP11_KEYBITLEN)
        }
        _ => None,
    }
}
