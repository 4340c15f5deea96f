use std::sync::Arc;

use super::*;
use crate::accel::SoftAccelerator;
use crate::error::Error;
use crate::key::{AesKey, KeyType};
use crate::utils;

fn hexbuf(s: &str) -> Vec<u8> {
    utils::from_hex(s, 1).unwrap()
}

fn accel() -> Arc<SoftAccelerator> {
    Arc::new(SoftAccelerator::new())
}

/// Import the two halves of an XTS clear key into a pair of key objects
fn key_pair_from_clear(
    accel: &Arc<SoftAccelerator>,
    half1: &[u8],
    half2: &[u8],
) -> (Arc<AesKey>, Arc<AesKey>) {
    let mut pair = Vec::new();
    for half in [half1, half2] {
        let key = AesKey::new(accel.clone());
        key.set_type(KeyType::CcaData).unwrap();
        key.set_mkvp(&accel.current_mkvp_hex()).unwrap();
        key.set_size(half.len() as u32 * 8).unwrap();
        key.import_clear(half).unwrap();
        pair.push(Arc::new(key));
    }
    let k2 = pair.pop().unwrap();
    let k1 = pair.pop().unwrap();
    (k1, k2)
}

/// Generate a bound key pair of the given size from wrapped tokens
fn generated_key_pair(
    accel: &Arc<SoftAccelerator>,
    bits: u32,
) -> (Arc<AesKey>, Arc<AesKey>) {
    let mut pair = Vec::new();
    for _ in 0..2 {
        let key = AesKey::new(accel.clone());
        key.set_type(KeyType::CcaData).unwrap();
        key.set_mkvp(&accel.current_mkvp_hex()).unwrap();
        key.set_size(bits).unwrap();
        key.generate().unwrap();
        pair.push(Arc::new(key));
    }
    let k2 = pair.pop().unwrap();
    let k1 = pair.pop().unwrap();
    (k1, k2)
}

struct Kat {
    key: &'static str,
    iv: &'static str,
    msg: &'static str,
    ct: &'static str,
}

// 256-bit key pair, 48-byte message
const KAT_256: Kat = Kat {
    key: "88dfd7c83cb121968feb417520555b36c0f63b662570eac12ea96cbe188ad5b1\
          a44db23ac6470316cba0041cadf248f6d9a7713f454e663f3e3987585cebbf96",
    iv: "0ee84632b838dd528f1d96c76439805c",
    msg: "ec36551c70efcdf85de7a39988978263ad261e83996dad219a0058e02187384f\
          2d0754ff9cfa000bec448fafd2cfa738",
    ct: "a55d533c9c5885562b92d4582ea69db8e2ba9c0b967a9f0167700b043525a47b\
         afe7d630774eaf4a1dc9fbcf94a1fda4",
};

// 128-bit key pair, 25-byte message exercising ciphertext stealing
const KAT_128_CTS: Kat = Kat {
    key: "394c97881abd989d29c703e48a72b397a7acf51b59649eeea9b33274d8541df4",
    iv: "4b15c684a152d485fe9937d39b168c29",
    msg: "2f3b9dcfbae729583b1d1ffdd16bb6fe2757329435662a78f0",
    ct: "f3473802e38a3ffef4d4fb8e6aa266ebde553a64528a06463e",
};

// 128-bit key pair, 48-byte message
const KAT_128: Kat = Kat {
    key: "63f36e9c397c6523c99f1644ecb1a5d9bc0f2f55fbe324444c390fae752ad4d7",
    iv: "cdb1bd3486f353cc160a840beadf0329",
    msg: "9a0149888bf76160a81428bc9140eccd26ed18368e24d49b9cc512929a88ad1e\
          66c763f4f56b63bb9dd9508c5d4df465",
    ct: "0eeef28ca159b805f5c215610551678ab772f279374fb140ab550768db42cf6c\
         b73637641934195ffc08cf5a9188b82b",
};

fn kat_engine(accel: &Arc<SoftAccelerator>, kat: &Kat) -> AesXts {
    let key = hexbuf(kat.key);
    let (half1, half2) = key.split_at(key.len() / 2);
    let (k1, k2) = key_pair_from_clear(accel, half1, half2);

    let mut engine = AesXts::new(accel.clone());
    engine.set_key(Some(k1), Some(k2)).unwrap();
    engine
}

#[test]
fn test_kat_single_call() {
    let accel = accel();
    for kat in [&KAT_256, &KAT_128_CTS, &KAT_128] {
        let mut engine = kat_engine(&accel, kat);
        let iv = hexbuf(kat.iv);
        let msg = hexbuf(kat.msg);
        let ct = hexbuf(kat.ct);

        // Encrypt
        engine.set_iv(&iv).unwrap();
        let mut out = vec![0u8; msg.len()];
        engine.encrypt(&mut out, &msg).unwrap();
        assert_eq!(out, ct);

        // Decrypt
        engine.set_iv(&iv).unwrap();
        let mut back = vec![0u8; ct.len()];
        engine.decrypt(&mut back, &ct).unwrap();
        assert_eq!(back, msg);
    }
}

#[test]
fn test_kat_stream_inplace_split_at_16() {
    let accel = accel();
    // the stealing vector is excluded: its 9-byte remainder is below the
    // one-block minimum a segment must carry
    for kat in [&KAT_256, &KAT_128] {
        let mut engine = kat_engine(&accel, kat);
        let iv = hexbuf(kat.iv);
        let msg = hexbuf(kat.msg);
        let ct = hexbuf(kat.ct);

        // Encrypt in two segments, in place
        let mut buf = msg.clone();
        engine.set_iv(&iv).unwrap();
        let (head, tail) = buf.split_at_mut(16);
        engine.encrypt_in_place(head).unwrap();
        engine.encrypt_in_place(tail).unwrap();
        assert_eq!(buf, ct);

        // Decrypt in two segments, in place
        engine.set_iv(&iv).unwrap();
        let (head, tail) = buf.split_at_mut(16);
        engine.decrypt_in_place(head).unwrap();
        engine.decrypt_in_place(tail).unwrap();
        assert_eq!(buf, msg);
    }
}

#[test]
fn test_kat_handoff_to_second_engine() {
    let accel = accel();
    let kat = &KAT_256;
    let key = hexbuf(kat.key);
    let (half1, half2) = key.split_at(key.len() / 2);
    let (k1, k2) = key_pair_from_clear(&accel, half1, half2);
    let iv = hexbuf(kat.iv);
    let msg = hexbuf(kat.msg);
    let ct = hexbuf(kat.ct);

    let mut first = AesXts::new(accel.clone());
    first.set_key(Some(k1.clone()), Some(k2.clone())).unwrap();
    let mut second = AesXts::new(accel.clone());
    second.set_key(Some(k1), Some(k2)).unwrap();

    // Encrypt the first chunk with the first engine
    let mut buf = msg.clone();
    first.set_iv(&iv).unwrap();
    first.encrypt_in_place(&mut buf[..16]).unwrap();

    // Continue on the second engine from the checkpoint: bind keys with
    // the original stream IV, then reposition the running tweak
    let checkpoint = first.get_intermediate_iv().unwrap();
    second.set_iv(&iv).unwrap();
    second.set_intermediate_iv(&checkpoint).unwrap();
    second.encrypt_in_place(&mut buf[16..]).unwrap();
    assert_eq!(buf, ct);

    // Same hand-off for decryption
    first.set_iv(&iv).unwrap();
    first.decrypt_in_place(&mut buf[..16]).unwrap();
    let checkpoint = first.get_intermediate_iv().unwrap();
    second.set_iv(&iv).unwrap();
    second.set_intermediate_iv(&checkpoint).unwrap();
    second.decrypt_in_place(&mut buf[16..]).unwrap();
    assert_eq!(buf, msg);
}

#[test]
fn test_round_trip_various_lengths() {
    let accel = accel();
    let (k1, k2) = generated_key_pair(&accel, 256);
    let mut engine = AesXts::new(accel.clone());
    engine.set_key(Some(k1), Some(k2)).unwrap();
    let iv = [0x42u8; 16];

    for len in [16, 17, 25, 32, 48, 100, 256, 1000] {
        let msg: Vec<u8> = (0..len).map(|i| i as u8).collect();

        engine.set_iv(&iv).unwrap();
        let mut ct = vec![0u8; len];
        engine.encrypt(&mut ct, &msg).unwrap();
        assert_ne!(ct, msg, "length {}", len);

        engine.set_iv(&iv).unwrap();
        let mut back = vec![0u8; len];
        engine.decrypt(&mut back, &ct).unwrap();
        assert_eq!(back, msg, "length {}", len);
    }
}

#[test]
fn test_split_call_matches_single_call() {
    let accel = accel();
    let (k1, k2) = generated_key_pair(&accel, 128);
    let mut engine = AesXts::new(accel.clone());
    engine.set_key(Some(k1), Some(k2)).unwrap();
    let iv = [9u8; 16];
    let msg: Vec<u8> = (0..96).map(|i| (i * 7) as u8).collect();

    engine.set_iv(&iv).unwrap();
    let mut whole = vec![0u8; msg.len()];
    engine.encrypt(&mut whole, &msg).unwrap();

    // any full-block split point continues the same chain
    for split in [16, 32, 48, 80] {
        engine.set_iv(&iv).unwrap();
        let mut parts = msg.clone();
        let (head, tail) = parts.split_at_mut(split);
        engine.encrypt_in_place(head).unwrap();
        engine.encrypt_in_place(tail).unwrap();
        assert_eq!(parts, whole, "split at {}", split);
    }
}

#[test]
fn test_state_machine_guards() {
    let accel = accel();
    let mut engine = AesXts::new(accel.clone());
    let iv = [0u8; 16];
    let mut buf = [0u8; 32];

    // KeyUnset: nothing works
    assert_eq!(engine.set_iv(&iv), Err(Error::KeyNotSet));
    assert_eq!(engine.encrypt_in_place(&mut buf), Err(Error::KeyNotSet));
    assert_eq!(engine.set_intermediate_iv(&iv), Err(Error::KeyNotSet));

    let (k1, k2) = generated_key_pair(&accel, 256);
    engine.set_key(Some(k1.clone()), Some(k2.clone())).unwrap();

    // KeyBound but IvUnset
    assert_eq!(engine.encrypt_in_place(&mut buf), Err(Error::IvNotSet));
    assert_eq!(engine.iv(), Err(Error::IvNotSet));
    assert_eq!(engine.get_intermediate_iv(), Err(Error::IvNotSet));
    assert_eq!(engine.set_intermediate_iv(&iv), Err(Error::IvNotSet));

    engine.set_iv(&iv).unwrap();
    assert_eq!(engine.iv().unwrap(), iv);
    engine.encrypt_in_place(&mut buf).unwrap();

    // re-binding the key clears the bound IV
    engine.set_key(Some(k1.clone()), Some(k2.clone())).unwrap();
    assert_eq!(engine.encrypt_in_place(&mut buf), Err(Error::IvNotSet));

    // binding to null unsets entirely; that is legal and disables ciphering
    engine.set_iv(&iv).unwrap();
    engine.set_key(None, None).unwrap();
    assert_eq!(engine.encrypt_in_place(&mut buf), Err(Error::KeyNotSet));

    // binding only one key is legal but leaves the engine unset for
    // cipher purposes
    engine.set_key(Some(k1), None).unwrap();
    assert_eq!(engine.encrypt_in_place(&mut buf), Err(Error::KeyNotSet));
}

#[test]
fn test_argument_validation() {
    let accel = accel();
    let (k1, k2) = generated_key_pair(&accel, 256);
    let mut engine = AesXts::new(accel.clone());
    engine.set_key(Some(k1), Some(k2)).unwrap();

    assert_eq!(engine.set_iv(&[0u8; 12]), Err(Error::invalid_argument(2)));
    engine.set_iv(&[0u8; 16]).unwrap();

    assert_eq!(
        engine.set_intermediate_iv(&[0u8; 15]),
        Err(Error::invalid_argument(2))
    );

    // less than one block cannot be ciphered
    let mut short = [0u8; 15];
    assert_eq!(
        engine.encrypt_in_place(&mut short),
        Err(Error::InvalidMessageLength)
    );

    // dst/src length disagreement
    let mut dst = [0u8; 16];
    assert_eq!(
        engine.encrypt(&mut dst, &[0u8; 32]),
        Err(Error::invalid_argument(2))
    );
}

#[test]
fn test_key_pairing_constraints() {
    let accel = accel();
    let (k128, _) = generated_key_pair(&accel, 128);
    let (k256, _) = generated_key_pair(&accel, 256);
    let (k192a, k192b) = generated_key_pair(&accel, 192);

    let mut engine = AesXts::new(accel.clone());
    assert_eq!(
        engine.set_key(Some(k128.clone()), Some(k256)),
        Err(Error::SizeMismatch)
    );

    // the XTS instruction has no 192-bit function code
    assert_eq!(
        engine.set_key(Some(k192a), Some(k192b)),
        Err(Error::UnsupportedSize(192))
    );

    // an unconfigured key object cannot be bound
    let empty = Arc::new(AesKey::new(accel.clone()));
    assert_eq!(
        engine.set_key(Some(k128), Some(empty)),
        Err(Error::KeyNotSet)
    );
}

#[test]
fn test_stale_param_blocks_recover_via_rederive() {
    let accel = accel();
    let (k1, k2) = generated_key_pair(&accel, 256);
    let mut engine = AesXts::new(accel.clone());
    engine.set_key(Some(k1), Some(k2)).unwrap();
    let iv = [3u8; 16];
    let msg: Vec<u8> = (0..64).map(|i| i as u8).collect();

    // reference ciphertext with fresh parameter blocks
    engine.set_iv(&iv).unwrap();
    let mut expected = vec![0u8; msg.len()];
    engine.encrypt(&mut expected, &msg).unwrap();

    // clobbering the blocks simulates the wrapping-key mismatch; the next
    // call must re-derive from the backing tokens and produce the same
    // output
    engine.set_iv(&iv).unwrap();
    engine.clobber_param_blocks();
    let mut out = vec![0u8; msg.len()];
    engine.encrypt(&mut out, &msg).unwrap();
    assert_eq!(out, expected);

    // the same holds for a real wrapping key rotation mid-stream
    engine.set_iv(&iv).unwrap();
    let mut first = msg.clone();
    engine.encrypt_in_place(&mut first[..16]).unwrap();
    accel.rotate_wrapping_key();
    engine.encrypt_in_place(&mut first[16..]).unwrap();
    assert_eq!(first, expected);
}

#[test]
fn test_stale_random_protected_key_is_unrecoverable() {
    let accel = accel();
    // no selector: both keys are bare random protected keys
    let mut pair = Vec::new();
    for _ in 0..2 {
        let key = AesKey::new(accel.clone());
        key.set_size(256).unwrap();
        key.generate().unwrap();
        pair.push(Arc::new(key));
    }
    let (k1, k2) = (pair.remove(0), pair.remove(0));

    let mut engine = AesXts::new(accel.clone());
    engine.set_key(Some(k1), Some(k2)).unwrap();
    let iv = [7u8; 16];
    engine.set_iv(&iv).unwrap();

    // works while the protected keys are fresh
    let mut buf = [0x11u8; 32];
    engine.encrypt_in_place(&mut buf).unwrap();

    // a corrupted parameter block has no token to re-derive from: the
    // failure must surface instead of silently producing wrong output
    engine.clobber_param_blocks();
    let mut buf = [0x11u8; 32];
    assert_eq!(
        engine.encrypt_in_place(&mut buf),
        Err(Error::ProtectedKeyOnly)
    );

    // the same holds when the whole accelerator rotates its wrapping key
    engine.set_iv(&iv).unwrap();
    accel.rotate_wrapping_key();
    let mut buf = [0x11u8; 32];
    assert_eq!(
        engine.encrypt_in_place(&mut buf),
        Err(Error::ProtectedKeyOnly)
    );

    // binding a fresh IV cannot help either
    assert_eq!(engine.set_iv(&iv), Err(Error::ProtectedKeyOnly));
}

#[test]
fn test_set_iv_recovers_from_stale_cache() {
    let accel = accel();
    let (k1, k2) = generated_key_pair(&accel, 256);

    // populate both caches, then make the cached values stale
    k1.protected_key().unwrap();
    k2.protected_key().unwrap();
    accel.rotate_wrapping_key();

    // set_iv consumes the tweak key's parameter block and recovers through
    // the same one-shot re-derivation as the cipher calls
    let mut engine = AesXts::new(accel.clone());
    engine.set_key(Some(k1), Some(k2)).unwrap();
    engine.set_iv(&[1u8; 16]).unwrap();

    let mut buf = [0u8; 16];
    engine.encrypt_in_place(&mut buf).unwrap();
}

fn round_trip(
    engine: &mut AesXts,
    iv: &[u8; 16],
    msg: &[u8],
) -> crate::error::Result<Vec<u8>> {
    let mut buf = msg.to_vec();
    engine.set_iv(iv)?;
    engine.encrypt_in_place(&mut buf)?;
    engine.set_iv(iv)?;
    engine.decrypt_in_place(&mut buf)?;
    Ok(buf)
}

#[test]
fn test_concurrent_round_trips_under_invalidation() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 1000;

    let accel = accel();
    let (k1, k2) = generated_key_pair(&accel, 256);

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut workers = Vec::new();
    for t in 0..THREADS {
        let accel = accel.clone();
        let (k1, k2) = (k1.clone(), k2.clone());
        workers.push(std::thread::spawn(move || {
            let mut engine = AesXts::new(accel);
            engine.set_key(Some(k1), Some(k2)).unwrap();
            let iv = [t as u8; 16];
            let msg: Vec<u8> = (0..96).map(|i| (i ^ t) as u8).collect();

            for round in 0..ROUNDS {
                // The transparent recovery retries exactly once; a rotation
                // landing between the re-derivation and the retry surfaces
                // as ProtectedKeyOnly. That is correct behavior, so the
                // round is simply replayed. Anything else is a real bug.
                let out = loop {
                    match round_trip(&mut engine, &iv, &msg) {
                        Ok(out) => break out,
                        Err(Error::ProtectedKeyOnly) => continue,
                        Err(e) => panic!("thread {} round {}: {}", t, round, e),
                    }
                };
                assert_eq!(out, msg, "thread {} round {}", t, round);
            }
        }));
    }

    let rotator = {
        let accel = accel.clone();
        let (k1, k2) = (k1.clone(), k2.clone());
        let stop = stop.clone();
        std::thread::spawn(move || {
            use crate::accel::ReencipherDirection;
            let mut i = 0u32;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                k1.invalidate_protected_key();
                k2.invalidate_protected_key();
                accel.rotate_wrapping_key();
                if i % 16 == 0 {
                    accel.stage_master_key();
                    k1.reencipher(ReencipherDirection::CurrentToNew).unwrap();
                    k2.reencipher(ReencipherDirection::CurrentToNew).unwrap();
                    accel.commit_master_key().unwrap();
                }
                i = i.wrapping_add(1);
                std::thread::yield_now();
            }
        })
    };

    for w in workers {
        w.join().unwrap();
    }
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    rotator.join().unwrap();
}
