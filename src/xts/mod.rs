/*!
 * AES-XTS cipher engine over protected keys
 *
 * An [`AesXts`] engine binds a data key and a tweak key, owns the running
 * tweak state, and executes encrypt/decrypt as a resumable streaming
 * cipher: segments of one logical stream can be split across calls, or
 * across engine instances via the intermediate-IV checkpoint. Stale
 * protected keys (after a wrapping key rotation) are re-derived from the
 * backing key objects and the operation retried exactly once.
 */

mod engine;

pub use engine::*;

#[cfg(test)]
mod tests;
