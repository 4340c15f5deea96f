use std::cell::RefCell;

use super::*;
use crate::accel::{AccelError, AdapterDirectory};
use crate::error::Error;
use crate::key::KeyType;

/// Scripted directory: each query pops the next entry list, regardless of
/// the pattern asked for, so the growth window between probe and fetch can
/// be forced deterministically.
struct ScriptedDirectory {
    script: RefCell<Vec<Option<Vec<Apqn>>>>,
    calls: RefCell<usize>,
}

impl ScriptedDirectory {
    fn new(script: Vec<Option<Vec<Apqn>>>) -> Self {
        ScriptedDirectory {
            script: RefCell::new(script),
            calls: RefCell::new(0),
        }
    }

    fn calls(&self) -> usize {
        *self.calls.borrow()
    }
}

impl AdapterDirectory for ScriptedDirectory {
    fn apqns_for_key_type(
        &self,
        _mkvp: &[u8; MKVP_LEN],
        _key_type: KeyType,
        out: &mut [Apqn],
    ) -> std::result::Result<usize, AccelError> {
        *self.calls.borrow_mut() += 1;
        let mut script = self.script.borrow_mut();
        assert!(!script.is_empty(), "unexpected extra query");
        match script.remove(0) {
            None => Err(AccelError::QueryFailed("scripted failure".into())),
            Some(matches) => {
                let n = matches.len().min(out.len());
                out[..n].copy_from_slice(&matches[..n]);
                Ok(matches.len())
            }
        }
    }
}

fn apqns(n: u16) -> Vec<Apqn> {
    (0..n).map(|i| Apqn::new(i, 0x0004)).collect()
}

#[test]
fn test_probe_then_fetch() {
    let set = apqns(3);
    let dir = ScriptedDirectory::new(vec![Some(set.clone()), Some(set.clone())]);

    let got = resolve(&dir, &[0u8; MKVP_LEN], KeyType::CcaData).unwrap();
    assert_eq!(got, set);
    assert_eq!(dir.calls(), 2); // count probe + one fetch
}

#[test]
fn test_grow_between_probe_and_fetch() {
    // probe sees 2 adapters, a third is hot-plugged before the fetch, so the
    // 2-entry fetch reports 3 and the resolver retries with room for 3
    let dir = ScriptedDirectory::new(vec![
        Some(apqns(2)),
        Some(apqns(3)),
        Some(apqns(3)),
    ]);

    let got = resolve(&dir, &[0u8; MKVP_LEN], KeyType::CcaData).unwrap();
    assert_eq!(got, apqns(3));
    assert_eq!(dir.calls(), 3);
}

#[test]
fn test_shrink_between_probe_and_fetch_truncates() {
    // probe sees 3, one adapter disappears, the fetch reports 2; the result
    // must hold exactly the 2 real entries, never a padded tail
    let dir = ScriptedDirectory::new(vec![Some(apqns(3)), Some(apqns(2))]);

    let got = resolve(&dir, &[0u8; MKVP_LEN], KeyType::CcaData).unwrap();
    assert_eq!(got, apqns(2));
}

#[test]
fn test_zero_matches_is_not_found() {
    let dir = ScriptedDirectory::new(vec![Some(vec![])]);
    assert_eq!(
        resolve(&dir, &[0u8; MKVP_LEN], KeyType::CcaData),
        Err(Error::ApqnNotFound)
    );
}

#[test]
fn test_query_failure_is_distinct_from_not_found() {
    let dir = ScriptedDirectory::new(vec![None]);
    assert_eq!(
        resolve(&dir, &[0u8; MKVP_LEN], KeyType::CcaData),
        Err(Error::AdapterQueryFailed)
    );

    // failure on the fetch after a successful probe propagates too
    let dir = ScriptedDirectory::new(vec![Some(apqns(2)), None]);
    assert_eq!(
        resolve(&dir, &[0u8; MKVP_LEN], KeyType::CcaData),
        Err(Error::AdapterQueryFailed)
    );
}

#[test]
fn test_apqn_parse_and_format() {
    let a: Apqn = "0a.0004".parse().unwrap();
    assert_eq!(a, Apqn::new(0x0a, 0x0004));
    assert_eq!(a.to_string(), "0a.0004");

    assert!("0a0004".parse::<Apqn>().is_err());
    assert!("zz.0004".parse::<Apqn>().is_err());
    assert!("0a.".parse::<Apqn>().is_err());
}
