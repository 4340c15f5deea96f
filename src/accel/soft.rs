use std::collections::HashMap;
use std::sync::RwLock;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::apqn::{Apqn, MKVP_LEN};
use crate::error::Result as PkResult;
use crate::key::{KeySize, KeyType};
use crate::token::{self, layout, TokenVariant};
use crate::utils;

use super::{
    AccelError, Accelerator, AdapterDirectory, CipherDirection, ProtectedKey,
    ReencipherDirection, XtsParamBlock, SECRET_ID_LEN, WKVP_LEN,
};

// Domain-separation labels for the keystream PRF
const LABEL_MASTER_WRAP: u8 = 0x4d;
const LABEL_PROTECT: u8 = 0x50;
const LABEL_VP: u8 = 0x56;

/// One master key register (OLD, CURRENT, or NEW)
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct MasterKey {
    key: [u8; 32],
    #[zeroize(skip)]
    vp: [u8; MKVP_LEN],
}

impl MasterKey {
    fn random() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        let vp = verification_pattern(&key);
        MasterKey { key, vp }
    }
}

/// The firmware wrapping key all protected keys are tied to
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct WrappingKey {
    key: [u8; 32],
    #[zeroize(skip)]
    vp: [u8; WKVP_LEN],
}

impl WrappingKey {
    fn random() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        let vp = verification_pattern(&key);
        WrappingKey { key, vp }
    }
}

struct SoftState {
    wrapping: WrappingKey,
    mk_current: MasterKey,
    mk_old: Option<MasterKey>,
    mk_new: Option<MasterKey>,
    apqns: Vec<Apqn>,
    secrets: HashMap<[u8; SECRET_ID_LEN], Zeroizing<Vec<u8>>>,
}

/// Software model of the protected-key accelerator.
///
/// Holds the three master key registers (OLD/CURRENT/NEW), a rotatable
/// wrapping key, an adapter directory, and a provisioned-secret store. The
/// tokens it mints are real CCA/EP11 layouts, so everything it hands out is
/// re-validated by the token classifier on the way back in. Key material is
/// protected by XOR with a key-derived AES keystream; this stands in for
/// the hardware wrapping and is not a CCA implementation. The XTS
/// instruction is real AES-XTS on the recovered key material.
///
/// The administrative surface (`rotate_wrapping_key`, `stage_master_key`,
/// `commit_master_key`, `provision_secret`, `add_apqn`) drives the
/// scenarios the client protocol has to survive: protected-key staleness
/// and master key rotation.
pub struct SoftAccelerator {
    state: RwLock<SoftState>,
}

impl SoftAccelerator {
    /// Create an accelerator with a fresh wrapping key, a fresh CURRENT
    /// master key, and a two-adapter directory
    pub fn new() -> Self {
        SoftAccelerator {
            state: RwLock::new(SoftState {
                wrapping: WrappingKey::random(),
                mk_current: MasterKey::random(),
                mk_old: None,
                mk_new: None,
                apqns: vec![Apqn::new(0x0a, 0x0004), Apqn::new(0x0b, 0x0004)],
                secrets: HashMap::new(),
            }),
        }
    }

    /// Verification pattern of the CURRENT master key register
    pub fn current_mkvp(&self) -> [u8; MKVP_LEN] {
        self.state.read().expect("accelerator lock poisoned").mk_current.vp
    }

    /// Hex form of the CURRENT master key verification pattern
    pub fn current_mkvp_hex(&self) -> String {
        utils::to_hex(&self.current_mkvp())
    }

    /// Register an additional adapter in the directory
    pub fn add_apqn(&self, apqn: Apqn) {
        let mut state = self.state.write().expect("accelerator lock poisoned");
        if !state.apqns.contains(&apqn) {
            state.apqns.push(apqn);
        }
    }

    /// Replace the wrapping key.
    ///
    /// Every previously derived protected key becomes stale: the next cipher
    /// instruction using it reports a verification pattern mismatch.
    pub fn rotate_wrapping_key(&self) {
        let mut state = self.state.write().expect("accelerator lock poisoned");
        state.wrapping = WrappingKey::random();
        log::info!("wrapping key rotated, cached protected keys are now stale");
    }

    /// Stage a fresh random master key in the NEW register
    pub fn stage_master_key(&self) {
        let mut state = self.state.write().expect("accelerator lock poisoned");
        state.mk_new = Some(MasterKey::random());
        log::info!("master key staged in NEW register");
    }

    /// Commit the staged master key: NEW becomes CURRENT, CURRENT is
    /// retained in OLD
    pub fn commit_master_key(&self) -> PkResult<()> {
        let mut state = self.state.write().expect("accelerator lock poisoned");
        let staged = state
            .mk_new
            .take()
            .ok_or(crate::error::Error::accelerator("commit", "no staged master key"))?;
        let prior = std::mem::replace(&mut state.mk_current, staged);
        state.mk_old = Some(prior);
        log::info!("master key committed, prior key retained in OLD register");
        Ok(())
    }

    /// Store a platform-provisioned secret under the given id
    pub fn provision_secret(&self, id: &[u8; SECRET_ID_LEN], clear: &[u8]) {
        let mut state = self.state.write().expect("accelerator lock poisoned");
        state
            .secrets
            .insert(*id, Zeroizing::new(clear.to_vec()));
    }

    fn protect(state: &SoftState, clear: &[u8]) -> ProtectedKey {
        let mut value = clear.to_vec();
        keystream_xor(&state.wrapping.key, LABEL_PROTECT, &mut value);
        ProtectedKey::new(value, state.wrapping.vp)
    }

    fn unprotect(state: &SoftState, param: &XtsParamBlock) -> Zeroizing<Vec<u8>> {
        let mut clear = Zeroizing::new(param.protkey().to_vec());
        keystream_xor(&state.wrapping.key, LABEL_PROTECT, &mut clear);
        clear
    }

    fn check_param(state: &SoftState, param: &XtsParamBlock) -> Result<(), AccelError> {
        if !utils::constant_time_eq(param.wkvp(), &state.wrapping.vp) {
            return Err(AccelError::WrappingKeyMismatch);
        }
        Ok(())
    }

    /// Find the register whose verification pattern matches the token's
    fn matching_master_key<'a>(
        state: &'a SoftState,
        pattern: &[u8],
    ) -> Option<&'a MasterKey> {
        let registers = [
            Some(&state.mk_current),
            state.mk_old.as_ref(),
            state.mk_new.as_ref(),
        ];
        registers
            .into_iter()
            .flatten()
            .find(|mk| utils::constant_time_eq(pattern, &mk.vp[..pattern.len()]))
    }
}

impl Default for SoftAccelerator {
    fn default() -> Self {
        SoftAccelerator::new()
    }
}

impl AdapterDirectory for SoftAccelerator {
    fn apqns_for_key_type(
        &self,
        mkvp: &[u8; MKVP_LEN],
        _key_type: KeyType,
        out: &mut [Apqn],
    ) -> Result<usize, AccelError> {
        let state = self.state.read().expect("accelerator lock poisoned");
        if !utils::constant_time_eq(mkvp, &state.mk_current.vp) {
            return Ok(0);
        }
        let n = state.apqns.len().min(out.len());
        out[..n].copy_from_slice(&state.apqns[..n]);
        Ok(state.apqns.len())
    }
}

impl Accelerator for SoftAccelerator {
    fn wrap_clear_key(
        &self,
        clear: &[u8],
        size: KeySize,
        key_type: KeyType,
        _apqns: &[Apqn],
        _flags: u32,
    ) -> Result<Vec<u8>, AccelError> {
        if clear.len() != size.bytes() {
            return Err(AccelError::MalformedToken);
        }
        let state = self.state.read().expect("accelerator lock poisoned");
        mint_token(key_type, size, clear, &state.mk_current)
    }

    fn generate_secure_key(
        &self,
        size: KeySize,
        key_type: KeyType,
        apqns: &[Apqn],
        _flags: u32,
    ) -> Result<Vec<u8>, AccelError> {
        let state = self.state.read().expect("accelerator lock poisoned");
        if !apqns.iter().any(|a| state.apqns.contains(a)) {
            return Err(AccelError::NoMatchingAdapter);
        }
        let mut clear = Zeroizing::new(vec![0u8; size.bytes()]);
        OsRng.fill_bytes(&mut clear);
        mint_token(key_type, size, &clear, &state.mk_current)
    }

    fn random_protected_key(&self, size: KeySize) -> Result<ProtectedKey, AccelError> {
        let state = self.state.read().expect("accelerator lock poisoned");
        let mut clear = Zeroizing::new(vec![0u8; size.bytes()]);
        OsRng.fill_bytes(&mut clear);
        Ok(Self::protect(&state, &clear))
    }

    fn unwrap_token(&self, token: &[u8]) -> Result<ProtectedKey, AccelError> {
        let state = self.state.read().expect("accelerator lock poisoned");
        let (pattern, wrapped) = open_token(token)?;
        let mk = Self::matching_master_key(&state, &pattern)
            .ok_or(AccelError::NoMatchingAdapter)?;

        let mut clear = Zeroizing::new(wrapped);
        keystream_xor(&mk.key, LABEL_MASTER_WRAP, &mut clear);
        Ok(Self::protect(&state, &clear))
    }

    fn verify_provisioned_secret(
        &self,
        id: &[u8; SECRET_ID_LEN],
        size: KeySize,
    ) -> Result<(), AccelError> {
        let state = self.state.read().expect("accelerator lock poisoned");
        match state.secrets.get(id) {
            Some(secret) if secret.len() == size.bytes() => Ok(()),
            _ => Err(AccelError::SecretNotFound),
        }
    }

    fn unwrap_provisioned_secret(
        &self,
        id: &[u8; SECRET_ID_LEN],
        size: KeySize,
    ) -> Result<ProtectedKey, AccelError> {
        let state = self.state.read().expect("accelerator lock poisoned");
        match state.secrets.get(id) {
            Some(secret) if secret.len() == size.bytes() => {
                let clear = Zeroizing::new(secret.to_vec());
                Ok(Self::protect(&state, &clear))
            }
            _ => Err(AccelError::SecretNotFound),
        }
    }

    fn reencipher_token(
        &self,
        token: &[u8],
        direction: ReencipherDirection,
    ) -> Result<Vec<u8>, AccelError> {
        let state = self.state.read().expect("accelerator lock poisoned");
        let variant = token::classify(token).ok_or(AccelError::MalformedToken)?;
        let (pattern, wrapped) = open_token(token)?;

        let (from, to) = match direction {
            ReencipherDirection::CurrentToNew => {
                let to = state.mk_new.as_ref().ok_or(AccelError::NoStagedMasterKey)?;
                (&state.mk_current, to)
            }
            ReencipherDirection::OldToCurrent => {
                let from = state.mk_old.as_ref().ok_or(AccelError::NoOldMasterKey)?;
                (from, &state.mk_current)
            }
        };
        if !utils::constant_time_eq(&pattern, &from.vp[..pattern.len()]) {
            return Err(AccelError::NoMatchingAdapter);
        }

        let mut clear = Zeroizing::new(wrapped);
        keystream_xor(&from.key, LABEL_MASTER_WRAP, &mut clear);

        let (key_type, size) = token_shape(variant, clear.len())?;
        mint_token(key_type, size, &clear, to)
    }

    fn compute_xts_tweak(
        &self,
        tweak_param: &XtsParamBlock,
        iv: &[u8; 16],
    ) -> Result<[u8; 16], AccelError> {
        let state = self.state.read().expect("accelerator lock poisoned");
        Self::check_param(&state, tweak_param)?;

        let clear = Self::unprotect(&state, tweak_param);
        let cipher = BlockCipher::new(&clear).ok_or(AccelError::MalformedToken)?;
        let mut tweak = *iv;
        cipher.encrypt(&mut tweak);
        Ok(tweak)
    }

    fn xts_cipher(
        &self,
        data_param: &XtsParamBlock,
        tweak_param: &XtsParamBlock,
        tweak: &mut [u8; 16],
        direction: CipherDirection,
        buf: &mut [u8],
    ) -> Result<(), AccelError> {
        debug_assert_eq!(buf.len() % 16, 0);

        let state = self.state.read().expect("accelerator lock poisoned");
        // Both constituent parameter blocks must be fresh before any block
        // is touched; the buffer is never partially written on a mismatch.
        Self::check_param(&state, data_param)?;
        Self::check_param(&state, tweak_param)?;

        let clear = Self::unprotect(&state, data_param);
        let cipher = BlockCipher::new(&clear).ok_or(AccelError::MalformedToken)?;

        for block in buf.chunks_exact_mut(16) {
            for (b, t) in block.iter_mut().zip(tweak.iter()) {
                *b ^= t;
            }
            match direction {
                CipherDirection::Encrypt => cipher.encrypt(block),
                CipherDirection::Decrypt => cipher.decrypt(block),
            }
            for (b, t) in block.iter_mut().zip(tweak.iter()) {
                *b ^= t;
            }
            gf_mul_alpha(tweak);
        }
        Ok(())
    }
}

/// AES block dispatch over the three supported key lengths
enum BlockCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl BlockCipher {
    fn new(key: &[u8]) -> Option<Self> {
        match key.len() {
            16 => Some(BlockCipher::Aes128(Aes128::new(GenericArray::from_slice(key)))),
            24 => Some(BlockCipher::Aes192(Aes192::new(GenericArray::from_slice(key)))),
            32 => Some(BlockCipher::Aes256(Aes256::new(GenericArray::from_slice(key)))),
            _ => None,
        }
    }

    fn encrypt(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            BlockCipher::Aes128(c) => c.encrypt_block(block),
            BlockCipher::Aes192(c) => c.encrypt_block(block),
            BlockCipher::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            BlockCipher::Aes128(c) => c.decrypt_block(block),
            BlockCipher::Aes192(c) => c.decrypt_block(block),
            BlockCipher::Aes256(c) => c.decrypt_block(block),
        }
    }
}

/// Multiply the 128-bit tweak by the primitive element alpha in GF(2^128),
/// little-endian byte order with the standard x^128 + x^7 + x^2 + x + 1
/// reduction
fn gf_mul_alpha(tweak: &mut [u8; 16]) {
    let mut carry = 0u8;
    for b in tweak.iter_mut() {
        let next = *b >> 7;
        *b = (*b << 1) | carry;
        carry = next;
    }
    if carry != 0 {
        tweak[0] ^= 0x87;
    }
}

/// XOR `data` with an AES-256 keystream derived from `key` under the given
/// domain-separation label
fn keystream_xor(key: &[u8; 32], label: u8, data: &mut [u8]) {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    for (i, chunk) in data.chunks_mut(16).enumerate() {
        let mut block = [0u8; 16];
        block[0] = label;
        block[8..16].copy_from_slice(&(i as u64).to_be_bytes());
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
        for (b, k) in chunk.iter_mut().zip(block.iter()) {
            *b ^= k;
        }
    }
}

/// 32-byte verification pattern of a key: the keystream it produces under
/// the VP label
fn verification_pattern(key: &[u8; 32]) -> [u8; 32] {
    let mut vp = [0u8; 32];
    keystream_xor(key, LABEL_VP, &mut vp);
    vp
}

/// Recover the token variant's key type and size from the wrapped length
fn token_shape(
    variant: TokenVariant,
    clear_len: usize,
) -> Result<(KeyType, KeySize), AccelError> {
    let key_type = match variant {
        TokenVariant::CcaAesData => KeyType::CcaData,
        TokenVariant::CcaAesCipher => KeyType::CcaCipher,
        TokenVariant::Ep11Aes | TokenVariant::Ep11AesWithHeader => KeyType::Ep11,
        _ => return Err(AccelError::UnsupportedKeyType),
    };
    let size = KeySize::from_bytes(clear_len).ok_or(AccelError::MalformedToken)?;
    Ok((key_type, size))
}

/// Mint a secure key token of the layout matching `key_type`, wrapping
/// `clear` under the given master key.
///
/// The minted bytes satisfy the token classifier for their variant; the
/// size fields the real formats already carry double as the wrap length in
/// this software model.
fn mint_token(
    key_type: KeyType,
    size: KeySize,
    clear: &[u8],
    mk: &MasterKey,
) -> Result<Vec<u8>, AccelError> {
    let mut wrapped = Zeroizing::new(clear.to_vec());
    keystream_xor(&mk.key, LABEL_MASTER_WRAP, &mut wrapped);

    let put_u16 = |buf: &mut [u8], off: usize, val: u16| {
        buf[off..off + 2].copy_from_slice(&val.to_be_bytes());
    };

    match key_type {
        KeyType::CcaData => {
            let mut t = vec![0u8; layout::AESDATA_KEY_SIZE];
            t[layout::AESDATA_TYPE] = layout::TOKEN_TYPE_CCA_INTERNAL;
            t[layout::AESDATA_VERSION] = layout::TOKEN_VERSION_AESDATA;
            t[layout::AESDATA_MKVP..layout::AESDATA_MKVP + layout::AESDATA_MKVP_LEN]
                .copy_from_slice(&mk.vp[..layout::AESDATA_MKVP_LEN]);
            t[layout::AESDATA_KEY..layout::AESDATA_KEY + wrapped.len()]
                .copy_from_slice(&wrapped);
            put_u16(&mut t, layout::AESDATA_BITSIZE, size.bits() as u16);
            put_u16(&mut t, layout::AESDATA_BYTESIZE, size.bytes() as u16);
            Ok(t)
        }
        KeyType::CcaCipher => {
            let mut t = vec![0u8; layout::AESCIPHER_KEY_SIZE];
            t[layout::AESCIPHER_TYPE] = layout::TOKEN_TYPE_CCA_INTERNAL;
            put_u16(&mut t, layout::AESCIPHER_LENGTH, layout::AESCIPHER_KEY_SIZE as u16);
            t[layout::AESCIPHER_VERSION] = layout::TOKEN_VERSION_AESCIPHER;
            t[layout::AESCIPHER_KMS] = 0x03;
            t[layout::AESCIPHER_KVPT] = 0x01;
            t[layout::AESCIPHER_KVP..layout::AESCIPHER_KVP + layout::AESCIPHER_KVP_LEN]
                .copy_from_slice(&mk.vp[..layout::AESCIPHER_KVP_LEN]);
            t[layout::AESCIPHER_KWM] = 0x02;
            t[layout::AESCIPHER_PFV] = 0x00;
            t[layout::AESCIPHER_ADV] = 0x01;
            put_u16(&mut t, layout::AESCIPHER_ADL, 26);
            put_u16(&mut t, layout::AESCIPHER_PL, size.bits() as u16);
            t[layout::AESCIPHER_AT] = 0x02;
            put_u16(&mut t, layout::AESCIPHER_KT, 0x0001);
            t[layout::AESCIPHER_KUFC] = 2;
            t[layout::AESCIPHER_KMFC] = 3;
            t[layout::AESCIPHER_PAYLOAD..layout::AESCIPHER_PAYLOAD + wrapped.len()]
                .copy_from_slice(&wrapped);
            Ok(t)
        }
        KeyType::Ep11 => {
            let mut t = vec![0u8; layout::EP11_KEY_SIZE];
            t[layout::EP11_TYPE] = layout::TOKEN_TYPE_NON_CCA;
            put_u16(&mut t, layout::EP11_LENGTH, layout::EP11_KEY_SIZE as u16);
            t[layout::EP11_VERSION] = layout::TOKVER_EP11_AES;
            put_u16(&mut t, layout::EP11_KEYBITLEN, size.bits() as u16);
            t[layout::EP11_WKVP..layout::EP11_WKVP + layout::EP11_WKVP_LEN]
                .copy_from_slice(&mk.vp[..layout::EP11_WKVP_LEN]);
            put_u16(&mut t, layout::EP11_MAGIC, layout::EP11_STRUCT_MAGIC);
            t[layout::EP11_ENC_KEY..layout::EP11_ENC_KEY + wrapped.len()]
                .copy_from_slice(&wrapped);
            Ok(t)
        }
        KeyType::Pvsecret => Err(AccelError::UnsupportedKeyType),
    }
}

/// Validate a token and extract its master key pattern and wrapped material
fn open_token(token: &[u8]) -> Result<(Vec<u8>, Vec<u8>), AccelError> {
    let variant = token::classify(token).ok_or(AccelError::MalformedToken)?;

    let u16_at = |off: usize| -> usize {
        u16::from_be_bytes([token[off], token[off + 1]]) as usize
    };

    match variant {
        TokenVariant::CcaAesData => {
            let len = u16_at(layout::AESDATA_BYTESIZE);
            if len == 0 || len > layout::AESDATA_KEY_LEN {
                return Err(AccelError::MalformedToken);
            }
            let pattern =
                token[layout::AESDATA_MKVP..layout::AESDATA_MKVP + layout::AESDATA_MKVP_LEN].to_vec();
            let wrapped = token[layout::AESDATA_KEY..layout::AESDATA_KEY + len].to_vec();
            Ok((pattern, wrapped))
        }
        TokenVariant::CcaAesCipher => {
            let len = u16_at(layout::AESCIPHER_PL) / 8;
            if len == 0 || len > layout::AESCIPHER_PAYLOAD_LEN {
                return Err(AccelError::MalformedToken);
            }
            let pattern = token
                [layout::AESCIPHER_KVP..layout::AESCIPHER_KVP + layout::AESCIPHER_KVP_LEN]
                .to_vec();
            let wrapped =
                token[layout::AESCIPHER_PAYLOAD..layout::AESCIPHER_PAYLOAD + len].to_vec();
            Ok((pattern, wrapped))
        }
        TokenVariant::Ep11Aes => {
            let len = u16_at(layout::EP11_KEYBITLEN) / 8;
            if len == 0 || len > layout::EP11_ENC_KEY_LEN {
                return Err(AccelError::MalformedToken);
            }
            let pattern =
                token[layout::EP11_WKVP..layout::EP11_WKVP + layout::EP11_WKVP_LEN].to_vec();
            let wrapped = token[layout::EP11_ENC_KEY..layout::EP11_ENC_KEY + len].to_vec();
            Ok((pattern, wrapped))
        }
        TokenVariant::Ep11AesWithHeader => {
            let body = &token[layout::EP11_HDR_SIZE..];
            let len =
                u16::from_be_bytes([body[layout::EP11_KEYBITLEN], body[layout::EP11_KEYBITLEN + 1]])
                    as usize
                    / 8;
            if len == 0 || len > layout::EP11_ENC_KEY_LEN {
                return Err(AccelError::MalformedToken);
            }
            let pattern =
                body[layout::EP11_WKVP..layout::EP11_WKVP + layout::EP11_WKVP_LEN].to_vec();
            let wrapped = body[layout::EP11_ENC_KEY..layout::EP11_ENC_KEY + len].to_vec();
            Ok((pattern, wrapped))
        }
        TokenVariant::CcaEc | TokenVariant::Ep11EcWithHeader => {
            Err(AccelError::UnsupportedKeyType)
        }
    }
}
