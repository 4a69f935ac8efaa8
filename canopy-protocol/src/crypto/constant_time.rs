//! Constant-time comparison for keys and digests.

use subtle::ConstantTimeEq;

/// Constant-time equality for 32-byte arrays (keys, digests).
#[inline(always)]
pub fn eq_32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.ct_eq(b).into()
}
