use std::sync::Arc;

use crate::accel::{AccelError, Accelerator, CipherDirection, XtsParamBlock};
use crate::error::{Error, Result};
use crate::key::{AesKey, KeySize};

const BLOCK_SIZE: usize = 16;

/// Retry ladder for the transparent stale-key recovery: one re-derivation,
/// then the failure surfaces
enum RetryState {
    Fresh,
    Retried,
}

/// AES-XTS cipher engine bound to a data key and a tweak key.
///
/// The engine's state machine is `KeyUnset -> KeyBound` via [`set_key`]
/// (re-setting, including to unset, clears any bound IV) and, once bound,
/// `IvUnset -> IvBound` via [`set_iv`]. Encrypt and decrypt require a bound
/// IV and advance the running tweak, so chunked calls continue one logical
/// XTS stream; [`get_intermediate_iv`]/[`set_intermediate_iv`] checkpoint
/// that stream across engine instances.
///
/// The running tweak and instruction parameter blocks are private to the
/// engine. Only the backing [`AesKey`] objects are shared, so any number of
/// engines can work over the same keys from different threads.
///
/// [`set_key`]: AesXts::set_key
/// [`set_iv`]: AesXts::set_iv
/// [`get_intermediate_iv`]: AesXts::get_intermediate_iv
/// [`set_intermediate_iv`]: AesXts::set_intermediate_iv
pub struct AesXts {
    accel: Arc<dyn Accelerator>,
    key1: Option<Arc<AesKey>>,
    key2: Option<Arc<AesKey>>,
    param1: Option<XtsParamBlock>,
    param2: Option<XtsParamBlock>,
    iv: [u8; BLOCK_SIZE],
    tweak: [u8; BLOCK_SIZE],
    key_set: bool,
    iv_set: bool,
}

impl AesXts {
    /// Allocate an engine in the `KeyUnset` state
    pub fn new(accel: Arc<dyn Accelerator>) -> Self {
        AesXts {
            accel,
            key1: None,
            key2: None,
            param1: None,
            param2: None,
            iv: [0u8; BLOCK_SIZE],
            tweak: [0u8; BLOCK_SIZE],
            key_set: false,
            iv_set: false,
        }
    }

    /// Bind the data key and tweak key.
    ///
    /// Passing `None` for both unsets the engine, which is legal and
    /// disables ciphering; passing only one key likewise leaves the engine
    /// `KeyUnset` for cipher purposes. Any previously bound IV state is
    /// cleared.
    ///
    /// # Arguments
    ///
    /// * `key1` - The data key, enciphering the blocks themselves
    /// * `key2` - The tweak key, enciphering the IV into the initial tweak
    ///
    /// # Errors
    ///
    /// * `KeyNotSet`/`SizeNotSet`/`TypeNotSet` - a key object is not fully
    ///   configured
    /// * `SizeMismatch` - the two keys have different sizes
    /// * `UnsupportedSize` - the pair is 192-bit; the XTS instruction
    ///   defines only 128- and 256-bit function codes
    pub fn set_key(
        &mut self,
        key1: Option<Arc<AesKey>>,
        key2: Option<Arc<AesKey>>,
    ) -> Result<()> {
        let (key1, key2) = match (key1, key2) {
            (Some(k1), Some(k2)) => (k1, k2),
            _ => {
                log::debug!("xts engine key unset");
                self.reset();
                return Ok(());
            }
        };

        let size1 = key1.check_ready()?;
        let size2 = key2.check_ready()?;
        if size1 != size2 {
            return Err(Error::SizeMismatch);
        }
        if !matches!(size1, KeySize::Aes128 | KeySize::Aes256) {
            return Err(Error::UnsupportedSize(size1.bits()));
        }

        self.reset();
        self.key1 = Some(key1);
        self.key2 = Some(key2);
        self.key_set = true;
        Ok(())
    }

    /// Bind the stream IV.
    ///
    /// Pulls both protected keys through their objects' caches (deriving on
    /// first use), builds the instruction parameter blocks, and resets the
    /// running tweak to the start of the stream. Requires `KeyBound`.
    pub fn set_iv(&mut self, iv: &[u8]) -> Result<()> {
        if !self.key_set {
            return Err(Error::KeyNotSet);
        }
        if iv.len() != BLOCK_SIZE {
            return Err(Error::invalid_argument(2));
        }
        let mut iv_block = [0u8; BLOCK_SIZE];
        iv_block.copy_from_slice(iv);

        let (key1, key2) = self.bound_keys()?;
        let mut param1 = XtsParamBlock::from_protected(&key1.protected_key()?);
        let mut param2 = XtsParamBlock::from_protected(&key2.protected_key()?);

        // The initial tweak computation consumes the tweak key's parameter
        // block, so it can observe staleness like any cipher call; it gets
        // the same one-shot recovery.
        let mut state = RetryState::Fresh;
        let tweak = loop {
            match self.accel.compute_xts_tweak(&param2, &iv_block) {
                Ok(tweak) => break tweak,
                Err(AccelError::WrappingKeyMismatch) => match state {
                    RetryState::Fresh => {
                        rederive_into(key1, key2, &mut param1, &mut param2)?;
                        state = RetryState::Retried;
                    }
                    RetryState::Retried => return Err(Error::ProtectedKeyOnly),
                },
                Err(e) => return Err(map_accel_error(e)),
            }
        };

        self.param1 = Some(param1);
        self.param2 = Some(param2);
        self.iv = iv_block;
        self.tweak = tweak;
        self.iv_set = true;
        Ok(())
    }

    /// The stream IV bound by the last [`set_iv`](AesXts::set_iv) call
    pub fn iv(&self) -> Result<[u8; BLOCK_SIZE]> {
        if !self.iv_set {
            return Err(Error::IvNotSet);
        }
        Ok(self.iv)
    }

    /// Read the running tweak at the current processed-block boundary.
    ///
    /// Feeding the value into another engine's
    /// [`set_intermediate_iv`](AesXts::set_intermediate_iv) lets that
    /// engine continue this stream without replaying the processed prefix.
    pub fn get_intermediate_iv(&self) -> Result<[u8; BLOCK_SIZE]> {
        if !self.iv_set {
            return Err(Error::IvNotSet);
        }
        Ok(self.tweak)
    }

    /// Overwrite the running tweak with a checkpoint taken from another
    /// engine bound to the same keys.
    ///
    /// The receiving engine must have called
    /// [`set_iv`](AesXts::set_iv) with the original stream IV first: that
    /// call binds the protected keys; this one only repositions the tweak.
    pub fn set_intermediate_iv(&mut self, iv: &[u8]) -> Result<()> {
        if !self.key_set {
            return Err(Error::KeyNotSet);
        }
        if !self.iv_set {
            return Err(Error::IvNotSet);
        }
        if iv.len() != BLOCK_SIZE {
            return Err(Error::invalid_argument(2));
        }
        self.tweak.copy_from_slice(iv);
        Ok(())
    }

    /// Encrypt `src` into `dst`, advancing the running tweak
    pub fn encrypt(&mut self, dst: &mut [u8], src: &[u8]) -> Result<()> {
        if dst.len() != src.len() {
            return Err(Error::invalid_argument(2));
        }
        dst.copy_from_slice(src);
        self.crypt(dst, CipherDirection::Encrypt)
    }

    /// Decrypt `src` into `dst`, advancing the running tweak
    pub fn decrypt(&mut self, dst: &mut [u8], src: &[u8]) -> Result<()> {
        if dst.len() != src.len() {
            return Err(Error::invalid_argument(2));
        }
        dst.copy_from_slice(src);
        self.crypt(dst, CipherDirection::Decrypt)
    }

    /// Encrypt a buffer in place
    pub fn encrypt_in_place(&mut self, buf: &mut [u8]) -> Result<()> {
        self.crypt(buf, CipherDirection::Encrypt)
    }

    /// Decrypt a buffer in place
    pub fn decrypt_in_place(&mut self, buf: &mut [u8]) -> Result<()> {
        self.crypt(buf, CipherDirection::Decrypt)
    }

    fn reset(&mut self) {
        self.key1 = None;
        self.key2 = None;
        self.param1 = None;
        self.param2 = None;
        self.iv = [0u8; BLOCK_SIZE];
        self.tweak = [0u8; BLOCK_SIZE];
        self.key_set = false;
        self.iv_set = false;
    }

    fn bound_keys(&self) -> Result<(&Arc<AesKey>, &Arc<AesKey>)> {
        match (&self.key1, &self.key2) {
            (Some(k1), Some(k2)) => Ok((k1, k2)),
            _ => Err(Error::KeyNotSet),
        }
    }

    /// One cipher call: minimum one block, arbitrary tail via ciphertext
    /// stealing, one-shot re-derive on a stale protected key.
    ///
    /// On error the destination contents are undefined, but the running
    /// tweak is restored so a successful retry continues the chain
    /// correctly.
    fn crypt(&mut self, buf: &mut [u8], direction: CipherDirection) -> Result<()> {
        if !self.key_set {
            return Err(Error::KeyNotSet);
        }
        if !self.iv_set {
            return Err(Error::IvNotSet);
        }
        if buf.len() < BLOCK_SIZE {
            return Err(Error::InvalidMessageLength);
        }

        let mut state = RetryState::Fresh;
        loop {
            let tweak_at_entry = self.tweak;
            let result = match (&self.param1, &self.param2) {
                (Some(p1), Some(p2)) => crypt_once(
                    self.accel.as_ref(),
                    p1,
                    p2,
                    &mut self.tweak,
                    direction,
                    buf,
                ),
                _ => return Err(Error::IvNotSet),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(AccelError::WrappingKeyMismatch) => {
                    self.tweak = tweak_at_entry;
                    match state {
                        RetryState::Fresh => {
                            log::debug!(
                                "wrapping key mismatch, re-deriving both protected keys"
                            );
                            self.rederive_params()?;
                            state = RetryState::Retried;
                        }
                        RetryState::Retried => return Err(Error::ProtectedKeyOnly),
                    }
                }
                Err(e) => return Err(map_accel_error(e)),
            }
        }
    }

    /// Re-derive both protected keys and rebuild both parameter blocks.
    ///
    /// A mismatch signal does not say which constituent key went stale;
    /// both are refreshed uniformly.
    fn rederive_params(&mut self) -> Result<()> {
        let (key1, key2) = match (&self.key1, &self.key2) {
            (Some(k1), Some(k2)) => (k1, k2),
            _ => return Err(Error::KeyNotSet),
        };
        match (&mut self.param1, &mut self.param2) {
            (Some(p1), Some(p2)) => rederive_into(key1, key2, p1, p2),
            _ => Err(Error::IvNotSet),
        }
    }

    /// Zero both parameter blocks' verification patterns, making the next
    /// cipher call observe a mismatch.
    #[cfg(test)]
    pub(crate) fn clobber_param_blocks(&mut self) {
        if let Some(p) = &mut self.param1 {
            p.clobber_wkvp();
        }
        if let Some(p) = &mut self.param2 {
            p.clobber_wkvp();
        }
    }
}

/// Re-derive both keys into existing parameter blocks, failing
/// `ProtectedKeyOnly` when either key lacks a token to re-derive from
fn rederive_into(
    key1: &Arc<AesKey>,
    key2: &Arc<AesKey>,
    param1: &mut XtsParamBlock,
    param2: &mut XtsParamBlock,
) -> Result<()> {
    if !key1.has_token_lineage() || !key2.has_token_lineage() {
        return Err(Error::ProtectedKeyOnly);
    }
    param1.rebind(&key1.rederive_protected_key()?);
    param2.rebind(&key2.rederive_protected_key()?);
    Ok(())
}

fn map_accel_error(e: AccelError) -> Error {
    match e {
        AccelError::MalformedToken => Error::MalformedToken,
        other => Error::accelerator("xts", other.to_string()),
    }
}

/// Run one cipher pass over `buf` with ciphertext stealing for a partial
/// final block.
///
/// Whole-block inputs go through the instruction in one sweep. A partial
/// tail costs two extra single-block calls arranged so the stolen block
/// consumes the tweak after the last full one; the decrypt path processes
/// the last full block out of tweak order, so the tweak state is saved
/// around the swap and an extra advance block positions it.
fn crypt_once(
    accel: &dyn Accelerator,
    p1: &XtsParamBlock,
    p2: &XtsParamBlock,
    tweak: &mut [u8; BLOCK_SIZE],
    direction: CipherDirection,
    buf: &mut [u8],
) -> std::result::Result<(), AccelError> {
    let rem = buf.len() % BLOCK_SIZE;
    if rem == 0 {
        return accel.xts_cipher(p1, p2, tweak, direction, buf);
    }

    // bytes before the last full block
    let split = (buf.len() & !(BLOCK_SIZE - 1)) - BLOCK_SIZE;
    let mut tmp = [0u8; BLOCK_SIZE];

    match direction {
        CipherDirection::Encrypt => {
            // all full blocks, including the one the tail will steal from
            accel.xts_cipher(p1, p2, tweak, direction, &mut buf[..split + BLOCK_SIZE])?;

            tmp[..rem].copy_from_slice(&buf[split + BLOCK_SIZE..]);
            tmp[rem..].copy_from_slice(&buf[split + rem..split + BLOCK_SIZE]);
            let (head, tail) = buf.split_at_mut(split + BLOCK_SIZE);
            tail.copy_from_slice(&head[split..split + rem]);

            buf[split..split + BLOCK_SIZE].copy_from_slice(&tmp);
            accel.xts_cipher(
                p1,
                p2,
                tweak,
                direction,
                &mut buf[split..split + BLOCK_SIZE],
            )?;
        }
        CipherDirection::Decrypt => {
            if split > 0 {
                accel.xts_cipher(p1, p2, tweak, direction, &mut buf[..split])?;
            }

            let tweak_last = *tweak;

            // advance the tweak past the last full block's position; the
            // block itself decrypts under the following tweak
            let mut advance = [0u8; BLOCK_SIZE];
            advance.copy_from_slice(&buf[split..split + BLOCK_SIZE]);
            accel.xts_cipher(p1, p2, tweak, direction, &mut advance)?;

            accel.xts_cipher(
                p1,
                p2,
                tweak,
                direction,
                &mut buf[split..split + BLOCK_SIZE],
            )?;

            tmp[..rem].copy_from_slice(&buf[split + BLOCK_SIZE..]);
            tmp[rem..].copy_from_slice(&buf[split + rem..split + BLOCK_SIZE]);
            let (head, tail) = buf.split_at_mut(split + BLOCK_SIZE);
            tail.copy_from_slice(&head[split..split + rem]);

            *tweak = tweak_last;
            buf[split..split + BLOCK_SIZE].copy_from_slice(&tmp);
            accel.xts_cipher(
                p1,
                p2,
                tweak,
                direction,
                &mut buf[split..split + BLOCK_SIZE],
            )?;
        }
    }
    Ok(())
}
