use std::fmt;

/// Token variants recognized by the classifier
///
/// A buffer can match at most the variant its signature bytes indicate;
/// classification is a pure function of the bytes and never mutates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenVariant {
    /// CCA internal AES DATA key token (fixed 64 bytes)
    CcaAesData,

    /// CCA internal AES CIPHER key token (version 5, variable length)
    CcaAesCipher,

    /// CCA internal ECC key token
    CcaEc,

    /// Bare EP11 AES key token (no external header)
    Ep11Aes,

    /// EP11 AES key token preceded by a 16-byte kblob header
    Ep11AesWithHeader,

    /// EP11 ECC key token preceded by a 16-byte kblob header
    Ep11EcWithHeader,
}

impl fmt::Display for TokenVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenVariant::CcaAesData => "CCA-AESDATA",
            TokenVariant::CcaAesCipher => "CCA-AESCIPHER",
            TokenVariant::CcaEc => "CCA-EC",
            TokenVariant::Ep11Aes => "EP11-AES",
            TokenVariant::Ep11AesWithHeader => "EP11-AES-WITH-HEADER",
            TokenVariant::Ep11EcWithHeader => "EP11-EC-WITH-HEADER",
        };
        f.write_str(name)
    }
}

/// Field offsets and signature constants for the recognized token layouts.
///
/// All multi-byte fields are big-endian. Offsets are relative to the start
/// of the token buffer; every read goes through the bounds-checked accessors
/// below, never through a struct overlay.
pub mod layout {
    /// Header type byte for CCA-internal tokens
    pub const TOKEN_TYPE_CCA_INTERNAL: u8 = 0x01;
    /// Header type byte for non-CCA (EP11) tokens
    pub const TOKEN_TYPE_NON_CCA: u8 = 0x00;
    /// Header type byte for CCA ECC tokens
    pub const TOKEN_TYPE_CCA_EC: u8 = 0x1f;

    /// Version byte identifying an AES DATA token
    pub const TOKEN_VERSION_AESDATA: u8 = 0x04;
    /// Version byte identifying an AES CIPHER token
    pub const TOKEN_VERSION_AESCIPHER: u8 = 0x05;
    /// Version byte identifying a bare EP11 AES token
    pub const TOKVER_EP11_AES: u8 = 0x03;
    /// Version byte identifying an EP11 AES token with kblob header
    pub const TOKVER_EP11_AES_WITH_HEADER: u8 = 0x06;
    /// Version byte identifying an EP11 ECC token with kblob header
    pub const TOKVER_EP11_ECC_WITH_HEADER: u8 = 0x07;

    /// Internal structure magic present in every EP11 token body
    pub const EP11_STRUCT_MAGIC: u16 = 0x1234;

    // --- CCA AES DATA token (fixed size) ---
    pub const AESDATA_TYPE: usize = 0;
    pub const AESDATA_VERSION: usize = 4;
    pub const AESDATA_FLAG: usize = 6;
    pub const AESDATA_MKVP: usize = 8;
    pub const AESDATA_MKVP_LEN: usize = 8;
    pub const AESDATA_KEY: usize = 16;
    pub const AESDATA_KEY_LEN: usize = 32;
    pub const AESDATA_CV: usize = 48;
    pub const AESDATA_BITSIZE: usize = 56;
    pub const AESDATA_BYTESIZE: usize = 58;
    pub const AESDATA_TVV: usize = 60;
    /// Total size of an AES DATA token
    pub const AESDATA_KEY_SIZE: usize = 64;

    // --- CCA AES CIPHER token (version 0 payload format, encrypted) ---
    pub const AESCIPHER_TYPE: usize = 0;
    pub const AESCIPHER_LENGTH: usize = 2;
    pub const AESCIPHER_VERSION: usize = 4;
    pub const AESCIPHER_KMS: usize = 8;
    pub const AESCIPHER_KVPT: usize = 9;
    pub const AESCIPHER_KVP: usize = 10;
    pub const AESCIPHER_KVP_LEN: usize = 16;
    pub const AESCIPHER_KWM: usize = 26;
    pub const AESCIPHER_KWH: usize = 27;
    pub const AESCIPHER_PFV: usize = 28;
    pub const AESCIPHER_ADV: usize = 30;
    pub const AESCIPHER_ADL: usize = 32;
    pub const AESCIPHER_KLL: usize = 34;
    pub const AESCIPHER_EADL: usize = 35;
    pub const AESCIPHER_UADL: usize = 36;
    pub const AESCIPHER_PL: usize = 38;
    pub const AESCIPHER_AT: usize = 41;
    pub const AESCIPHER_KT: usize = 42;
    pub const AESCIPHER_KUFC: usize = 44;
    pub const AESCIPHER_KMFC: usize = 49;
    pub const AESCIPHER_PAYLOAD: usize = 56;
    pub const AESCIPHER_PAYLOAD_LEN: usize = 80;
    /// Total size of a V0 encrypted AES CIPHER token
    pub const AESCIPHER_KEY_SIZE: usize = 136;

    // --- CCA ECC token ---
    pub const CCAEC_TYPE: usize = 0;
    pub const CCAEC_LENGTH: usize = 2;
    pub const CCAEC_PRIV_SECTION: usize = 8;
    pub const CCAEC_KEY_FORMAT: usize = 12;
    pub const CCAEC_CURVE_TYPE: usize = 14;
    pub const CCAEC_P_LEN: usize = 16;
    /// Minimum plausible size of a CCA ECC token
    pub const CCAEC_MIN_SIZE: usize = 72;

    /// Private key section identifier
    pub const CCAEC_SECTION_ID: u8 = 0x20;
    /// Key format byte for an encrypted internal EC key
    pub const CCAEC_FORMAT_ENCRYPTED: u8 = 0x08;

    // --- EP11 AES token body ---
    pub const EP11_TYPE: usize = 0;
    pub const EP11_LENGTH: usize = 2;
    pub const EP11_VERSION: usize = 4;
    pub const EP11_KEYBITLEN: usize = 6;
    /// Session field; its first 8 bytes are overlaid by the header above
    pub const EP11_SESSION: usize = 0;
    pub const EP11_SESSION_LEN: usize = 32;
    pub const EP11_WKVP: usize = 32;
    pub const EP11_WKVP_LEN: usize = 16;
    pub const EP11_MAGIC: usize = 64;
    pub const EP11_ENC_KEY: usize = 80;
    pub const EP11_ENC_KEY_LEN: usize = 144;
    pub const EP11_MAC: usize = 224;
    pub const EP11_MAC_LEN: usize = 32;
    /// Body size without the trailing padding
    pub const EP11_BODY_MIN_SIZE: usize = 256;
    /// Nominal token size including trailing padding
    pub const EP11_KEY_SIZE: usize = 320;

    // --- EP11 kblob header (prepended for "with header" variants) ---
    pub const EP11_HDR_TYPE: usize = 0;
    pub const EP11_HDR_HVER: usize = 1;
    pub const EP11_HDR_LENGTH: usize = 2;
    pub const EP11_HDR_VERSION: usize = 4;
    pub const EP11_HDR_BITLEN: usize = 6;
    pub const EP11_HDR_SIZE: usize = 16;

    /// Size bounds for an EP11 ECC blob (header plus body)
    pub const MIN_EC_BLOB_SIZE: usize = 272;
    pub const MAX_EC_BLOB_SIZE: usize = 1024;
}

use layout::*;

fn u8_at(buf: &[u8], off: usize) -> Option<u8> {
    buf.get(off).copied()
}

fn u16_be_at(buf: &[u8], off: usize) -> Option<u16> {
    let hi = buf.get(off)?;
    let lo = buf.get(off + 1)?;
    Some(u16::from_be_bytes([*hi, *lo]))
}

fn all_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// Check whether the buffer holds a CCA AES DATA key token.
///
/// DATA tokens are fixed-size and carry no declared-length field; the
/// signature is the type/version byte pair alone.
pub fn is_cca_aes_data_key(key: &[u8]) -> bool {
    if key.len() < AESDATA_KEY_SIZE {
        return false;
    }
    if u8_at(key, AESDATA_TYPE) != Some(TOKEN_TYPE_CCA_INTERNAL) {
        return false;
    }
    if u8_at(key, AESDATA_VERSION) != Some(TOKEN_VERSION_AESDATA) {
        return false;
    }

    true
}

/// Check whether the buffer holds a CCA AES CIPHER key token.
///
/// Beyond the signature, a CIPHER token is only accepted in the exact
/// shape the accelerator produces: wrapped by the master key with AESKW,
/// AES CIPHER key payload, the fixed 26-byte associated-data section with
/// no label or extra data, two key-usage fields and three key-management
/// fields.
pub fn is_cca_aes_cipher_key(key: &[u8]) -> bool {
    if key.len() < AESCIPHER_KEY_SIZE {
        return false;
    }
    if u8_at(key, AESCIPHER_TYPE) != Some(TOKEN_TYPE_CCA_INTERNAL) {
        return false;
    }
    if u8_at(key, AESCIPHER_VERSION) != Some(TOKEN_VERSION_AESCIPHER) {
        return false;
    }
    match u16_be_at(key, AESCIPHER_LENGTH) {
        Some(len) if (len as usize) <= key.len() => {}
        _ => return false,
    }

    if u8_at(key, AESCIPHER_KMS) != Some(0x03) {
        // key material not wrapped by the master key
        return false;
    }
    if u8_at(key, AESCIPHER_KWM) != Some(0x02) {
        // key not wrapped using AESKW
        return false;
    }
    match u8_at(key, AESCIPHER_PFV) {
        Some(0x00) | Some(0x01) => {}
        _ => return false,
    }
    if u8_at(key, AESCIPHER_ADV) != Some(0x01) {
        return false;
    }
    if u16_be_at(key, AESCIPHER_ADL) != Some(26) {
        return false;
    }
    if u8_at(key, AESCIPHER_KLL) != Some(0) {
        return false;
    }
    if u8_at(key, AESCIPHER_EADL) != Some(0) {
        return false;
    }
    if u8_at(key, AESCIPHER_UADL) != Some(0) {
        return false;
    }
    if u8_at(key, AESCIPHER_AT) != Some(0x02) {
        return false;
    }
    if u16_be_at(key, AESCIPHER_KT) != Some(0x0001) {
        return false;
    }
    if u8_at(key, AESCIPHER_KUFC) != Some(2) {
        return false;
    }
    if u8_at(key, AESCIPHER_KMFC) != Some(3) {
        return false;
    }

    true
}

/// Check whether the buffer holds a CCA ECC key token.
pub fn is_cca_ec_key(key: &[u8]) -> bool {
    if key.len() < CCAEC_MIN_SIZE {
        return false;
    }
    if u8_at(key, CCAEC_TYPE) != Some(TOKEN_TYPE_CCA_EC) {
        return false;
    }
    if u8_at(key, CCAEC_PRIV_SECTION) != Some(CCAEC_SECTION_ID) {
        return false;
    }
    if u8_at(key, CCAEC_KEY_FORMAT) != Some(CCAEC_FORMAT_ENCRYPTED) {
        return false;
    }
    match u16_be_at(key, CCAEC_LENGTH) {
        Some(len) if (len as usize) <= key.len() => {}
        _ => return false,
    }

    match u8_at(key, CCAEC_CURVE_TYPE) {
        Some(0) | Some(2) => {} // prime or edwards
        _ => return false,
    }
    match u16_be_at(key, CCAEC_P_LEN) {
        Some(255) | Some(256) | Some(384) | Some(448) | Some(521) => {}
        _ => return false,
    }

    true
}

/// Check whether the buffer holds a bare EP11 AES key token.
///
/// Bare tokens always have their session-id field overlaid by the token
/// header, so they cannot carry a valid session id: the second 16 bytes of
/// the session field must be zero, otherwise the token is considered
/// corrupted.
pub fn is_ep11_aes_key(key: &[u8]) -> bool {
    if key.len() < EP11_BODY_MIN_SIZE {
        return false;
    }
    if u8_at(key, EP11_TYPE) != Some(TOKEN_TYPE_NON_CCA) {
        return false;
    }
    if u8_at(key, EP11_VERSION) != Some(TOKVER_EP11_AES) {
        return false;
    }
    match u16_be_at(key, EP11_LENGTH) {
        Some(len) if (len as usize) <= key.len() => {}
        _ => return false,
    }

    if u16_be_at(key, EP11_MAGIC) != Some(EP11_STRUCT_MAGIC) {
        return false;
    }
    if !all_zero(&key[16..32]) {
        return false;
    }

    true
}

/// Check whether the buffer holds an EP11 AES key token with kblob header.
pub fn is_ep11_aes_key_with_header(key: &[u8]) -> bool {
    const MIN: usize = EP11_HDR_SIZE + EP11_BODY_MIN_SIZE;

    if key.len() < MIN {
        return false;
    }
    if u8_at(key, EP11_HDR_TYPE) != Some(TOKEN_TYPE_NON_CCA) {
        return false;
    }
    if u8_at(key, EP11_HDR_HVER) != Some(0x00) {
        return false;
    }
    if u8_at(key, EP11_HDR_VERSION) != Some(TOKVER_EP11_AES_WITH_HEADER) {
        return false;
    }
    match u16_be_at(key, EP11_HDR_LENGTH) {
        Some(len) if (len as usize) <= key.len() && (len as usize) >= MIN => {}
        _ => return false,
    }

    if u16_be_at(key, EP11_HDR_SIZE + EP11_MAGIC) != Some(EP11_STRUCT_MAGIC) {
        return false;
    }

    true
}

/// Check whether the buffer holds an EP11 ECC key token with kblob header.
pub fn is_ep11_ec_key_with_header(key: &[u8]) -> bool {
    if key.len() < MIN_EC_BLOB_SIZE || key.len() > MAX_EC_BLOB_SIZE {
        return false;
    }
    if u8_at(key, EP11_HDR_VERSION) != Some(TOKVER_EP11_ECC_WITH_HEADER) {
        return false;
    }
    if u16_be_at(key, EP11_HDR_SIZE + EP11_MAGIC) != Some(EP11_STRUCT_MAGIC) {
        return false;
    }

    true
}

/// Check whether an EP11 AES token with header is session bound, i.e. has a
/// non-zero session id.
///
/// This is a classification refinement, not a validity gate: a zero session
/// field is an unbound but perfectly valid token.
pub fn is_session_bound(key: &[u8]) -> bool {
    if !is_ep11_aes_key_with_header(key) {
        return false;
    }

    !all_zero(&key[EP11_HDR_SIZE..EP11_HDR_SIZE + EP11_SESSION_LEN])
}

/// Check whether the buffer holds an XTS key pair: two adjacent,
/// equal-variant, equal-size tokens.
///
/// The second half is re-validated independently rather than assumed to
/// mirror the first.
pub fn is_xts(key: &[u8]) -> bool {
    if is_cca_aes_data_key(key) {
        return key.len() == 2 * AESDATA_KEY_SIZE
            && is_cca_aes_data_key(&key[AESDATA_KEY_SIZE..]);
    }
    if is_cca_aes_cipher_key(key) {
        return key.len() == 2 * AESCIPHER_KEY_SIZE
            && is_cca_aes_cipher_key(&key[AESCIPHER_KEY_SIZE..]);
    }
    if is_ep11_aes_key(key) {
        return key.len() == 2 * EP11_KEY_SIZE && is_ep11_aes_key(&key[EP11_KEY_SIZE..]);
    }

    false
}

/// Classify a byte buffer as one of the recognized token variants.
///
/// Pure and total: malformed, truncated, or unrecognized input yields
/// `None`, never a panic or an out-of-bounds read. The per-variant checks
/// run in a fixed order: minimum length, signature bytes, declared length
/// against the buffer, then structural invariants.
pub fn classify(key: &[u8]) -> Option<TokenVariant> {
    if is_cca_aes_data_key(key) {
        Some(TokenVariant::CcaAesData)
    } else if is_cca_aes_cipher_key(key) {
        Some(TokenVariant::CcaAesCipher)
    } else if is_cca_ec_key(key) {
        Some(TokenVariant::CcaEc)
    } else if is_ep11_aes_key(key) {
        Some(TokenVariant::Ep11Aes)
    } else if is_ep11_aes_key_with_header(key) {
        Some(TokenVariant::Ep11AesWithHeader)
    } else if is_ep11_ec_key_with_header(key) {
        Some(TokenVariant::Ep11EcWithHeader)
    } else {
        None
    }
}
