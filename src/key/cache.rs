use zeroize::Zeroizing;

use crate::accel::{AccelError, Accelerator, ProtectedKey, SECRET_ID_LEN};
use crate::error::{Error, Result};
use crate::key::KeySize;
use crate::token::TokenVariant;

/// One generation of secure key material backing a key object
#[derive(Clone)]
pub(crate) enum TokenMaterial {
    /// A wrapped secure key token
    Secure {
        bytes: Zeroizing<Vec<u8>>,
        variant: TokenVariant,
    },

    /// A platform-provisioned secret, referenced by id
    Provisioned {
        id: [u8; SECRET_ID_LEN],
        size: KeySize,
    },
}

impl TokenMaterial {
    fn unwrap_with(&self, accel: &dyn Accelerator) -> std::result::Result<ProtectedKey, AccelError> {
        match self {
            TokenMaterial::Secure { bytes, .. } => accel.unwrap_token(bytes),
            TokenMaterial::Provisioned { id, size } => {
                accel.unwrap_provisioned_secret(id, *size)
            }
        }
    }
}

/// Cache slot for the last successfully derived protected key.
///
/// State machine `Empty | Cached`; operated only under the owning key
/// object's lock, so concurrent derivations can never interleave partial
/// writes. Derivation results leave as owned snapshots, never as references
/// into the slot.
pub(crate) struct ProtectedKeyCache {
    slot: Option<ProtectedKey>,
}

impl ProtectedKeyCache {
    pub(crate) fn new() -> Self {
        ProtectedKeyCache { slot: None }
    }

    /// Force the slot back to `Empty`
    pub(crate) fn invalidate(&mut self) {
        if self.slot.take().is_some() {
            log::debug!("protected key cache invalidated");
        }
    }

    /// Install a freshly produced protected key (generation of random
    /// protected keys bypasses derivation)
    pub(crate) fn put(&mut self, pk: ProtectedKey) {
        self.slot = Some(pk);
    }

    #[cfg(test)]
    pub(crate) fn is_cached(&self) -> bool {
        self.slot.is_some()
    }

    /// Return the cached key, deriving once from the token generations if
    /// the slot is empty
    pub(crate) fn get_or_derive(
        &mut self,
        cur: Option<&TokenMaterial>,
        old: Option<&TokenMaterial>,
        accel: &dyn Accelerator,
    ) -> Result<ProtectedKey> {
        if let Some(pk) = &self.slot {
            return Ok(pk.clone());
        }
        self.derive(cur, old, accel)
    }

    /// Unconditionally re-derive from the token generations, replacing any
    /// cached value.
    ///
    /// The current generation is tried first; during a re-encipherment
    /// transition the accelerator's active master key may still be the one
    /// that wrapped the demoted generation, so `old` serves as fallback.
    /// With no token at all the cached value is the only form this key ever
    /// had, and a forced re-derivation is unrecoverable.
    pub(crate) fn derive(
        &mut self,
        cur: Option<&TokenMaterial>,
        old: Option<&TokenMaterial>,
        accel: &dyn Accelerator,
    ) -> Result<ProtectedKey> {
        let cur = match cur {
            Some(cur) => cur,
            None => return Err(Error::ProtectedKeyOnly),
        };

        let derived = match cur.unwrap_with(accel) {
            Ok(pk) => Ok(pk),
            Err(first) => match old {
                Some(old) => {
                    log::debug!(
                        "current token generation failed to unwrap ({}), trying old",
                        first
                    );
                    old.unwrap_with(accel)
                }
                None => Err(first),
            },
        };

        match derived {
            Ok(pk) => {
                self.slot = Some(pk.clone());
                Ok(pk)
            }
            Err(e) => {
                log::debug!("protected key derivation failed: {}", e);
                Err(map_unwrap_error(e))
            }
        }
    }
}

fn map_unwrap_error(e: AccelError) -> Error {
    match e {
        AccelError::MalformedToken => Error::MalformedToken,
        other => Error::accelerator("unwrap", other.to_string()),
    }
}
