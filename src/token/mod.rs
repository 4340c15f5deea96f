/*!
 * Secure key token classification
 *
 * Stateless predicates that recognize the binary layouts of secure key
 * tokens produced by the CCA and EP11 hardware security module families,
 * and reject malformed or truncated buffers without ever reading past the
 * end of the input.
 */

mod validate;

pub use validate::*;
