use std::fmt;
use std::str::FromStr;

use crate::accel::AdapterDirectory;
use crate::error::{Error, Result};
use crate::key::KeyType;

/// Width of the master key verification pattern query field.
///
/// Shorter per-variant patterns are left-aligned and zero-filled.
pub const MKVP_LEN: usize = 32;

/// An adapter/domain pair identifying one hardware crypto unit instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Apqn {
    /// Adapter (card) number
    pub card: u16,
    /// Usage domain on the adapter
    pub domain: u16,
}

impl Apqn {
    /// Create an APQN from its card and domain numbers
    pub fn new(card: u16, domain: u16) -> Self {
        Apqn { card, domain }
    }
}

impl fmt::Display for Apqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}.{:04x}", self.card, self.domain)
    }
}

impl FromStr for Apqn {
    type Err = Error;

    /// Parse the conventional `"xx.yyyy"` hex notation
    fn from_str(s: &str) -> Result<Self> {
        let (card, domain) = s.split_once('.').ok_or(Error::invalid_argument(1))?;
        let card = u16::from_str_radix(card, 16).map_err(|_| Error::invalid_argument(1))?;
        let domain = u16::from_str_radix(domain, 16).map_err(|_| Error::invalid_argument(1))?;
        Ok(Apqn { card, domain })
    }
}

/// Resolve the APQNs whose current master key matches `mkvp` for the given
/// key type.
///
/// The directory primitive accepts a caller-sized buffer and always reports
/// the true match count. Resolution starts with a zero-capacity count probe,
/// then re-issues the query with exactly the reported capacity. Because the
/// adapter set can grow between the two calls (hot-pluggable hardware), the
/// loop keeps retrying with the newly reported count until a fetch completes
/// without truncation; a partially filled list is never returned.
///
/// # Errors
///
/// * `ApqnNotFound` - the query succeeded but no adapter matched
/// * `AdapterQueryFailed` - the directory primitive itself failed
/// * `OutOfMemory` - the result buffer could not be allocated
pub fn resolve<D: AdapterDirectory + ?Sized>(
    directory: &D,
    mkvp: &[u8; MKVP_LEN],
    key_type: KeyType,
) -> Result<Vec<Apqn>> {
    let mut capacity: usize = 0;

    loop {
        let mut entries: Vec<Apqn> = Vec::new();
        if capacity > 0 {
            entries
                .try_reserve_exact(capacity)
                .map_err(|_| Error::OutOfMemory)?;
            entries.resize(capacity, Apqn::default());
        }

        let count = directory
            .apqns_for_key_type(mkvp, key_type, &mut entries)
            .map_err(|e| {
                log::debug!("adapter directory query failed: {}", e);
                Error::AdapterQueryFailed
            })?;

        if count == 0 {
            return Err(Error::ApqnNotFound);
        }
        if count <= capacity {
            entries.truncate(count);
            return Ok(entries);
        }

        // The directory reported more matches than we offered room for;
        // either this was the count probe or the adapter set grew underneath
        // us. Retry with the reported size.
        log::debug!(
            "apqn query needs capacity {} (offered {}), retrying",
            count,
            capacity
        );
        capacity = count;
    }
}
