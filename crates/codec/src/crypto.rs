//! Keyed digest used to authenticate packets between channel peers.
//!
//! The digest is MD5(secret || packet-bytes-with-security-flag-pre-set),
//! truncated to nothing (MD5 already produces 16 bytes, the exact width the
//! wire format reserves for it).

use md5::{Digest, Md5};

pub const DIGEST_LEN: usize = 16;

/// Computes the 16-byte keyed digest of `bytes` under `secret`.
///
/// `bytes` must already have the security flag bit set the way it will be
/// sent or was received; this function does not interpret header layout.
///
/// # Test
///
/// ```
/// use lonip_codec::crypto::sign;
///
/// let secret = [0u8; 16];
/// let a = sign(&secret, b"hello");
/// let b = sign(&secret, b"hello");
/// let c = sign(&secret, b"hellp");
///
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// ```
pub fn sign(secret: &[u8; 16], bytes: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Md5::new();
    hasher.update(secret);
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Verifies `digest` against `bytes` under `secret`.
///
/// # Test
///
/// ```
/// use lonip_codec::crypto::{sign, verify};
///
/// let secret = [7u8; 16];
/// let digest = sign(&secret, b"packet-bytes");
///
/// assert!(verify(&secret, b"packet-bytes", &digest));
/// assert!(!verify(&secret, b"packet-byter", &digest));
/// ```
pub fn verify(secret: &[u8; 16], bytes: &[u8], digest: &[u8; DIGEST_LEN]) -> bool {
    sign(secret, bytes) == *digest
}

/// Verifies `digest` against `bytes`, also trying the digest formed with the
/// security flag bit at `flag_byte_offset` toggled.
///
/// The source toggles the flag at a different point relative to digesting
/// depending on peer generation; rather than guess which one a given peer
/// used, both variants are accepted on receive. Returns which variant (if
/// any) matched: `Some(false)` for the bytes as received, `Some(true)` for
/// the flag-toggled alternative, `None` if neither matched.
pub fn verify_either_flag_order(
    secret: &[u8; 16],
    bytes: &mut [u8],
    flag_byte_offset: usize,
    flag_bit: u8,
    digest: &[u8; DIGEST_LEN],
) -> Option<bool> {
    if verify(secret, bytes, digest) {
        return Some(false);
    }

    if flag_byte_offset >= bytes.len() {
        return None;
    }

    bytes[flag_byte_offset] ^= flag_bit;
    let matched = verify(secret, bytes, digest);
    bytes[flag_byte_offset] ^= flag_bit;

    matched.then_some(true)
}
