/*!
 * Adapter resolution by master key verification pattern
 *
 * Resolves the set of crypto adapters (APQNs) whose active master key
 * matches a token's verification pattern, using the adapter directory's
 * capacity-limited query primitive with a count probe and a grow-and-retry
 * loop that tolerates adapters being hot-plugged between calls.
 */

mod resolver;

pub use resolver::*;

#[cfg(test)]
mod tests;
