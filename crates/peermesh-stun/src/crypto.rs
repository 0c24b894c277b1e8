//! Digest helpers shared by the codec and the mesh datagram framing.

use hmac::{Hmac, Mac};
use sha1::Sha1;

/// Length of an HMAC-SHA-1 tag.
pub const DIGEST_LEN: usize = 20;

type HmacSha1 = Hmac<Sha1>;

/// HMAC-SHA-1 over a sequence of byte slices.
pub fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> [u8; DIGEST_LEN] {
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac-sha1 accepts keys of any length");
    for part in parts {
        mac.update(part);
    }

    mac.finalize().into_bytes().into()
}

/// Verify an HMAC-SHA-1 tag in constant time.
pub fn hmac_sha1_verify(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac-sha1 accepts keys of any length");
    for part in parts {
        mac.update(part);
    }

    mac.verify_slice(tag).is_ok()
}

/// CRC-32 fingerprint over the message bytes preceding the attribute.
pub fn fingerprint(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_own_tag() {
        let tag = hmac_sha1(b"key", &[b"hello", b"world"]);
        assert!(hmac_sha1_verify(b"key", &[b"helloworld"], &tag));
        assert!(!hmac_sha1_verify(b"other", &[b"helloworld"], &tag));
    }

    #[test]
    fn empty_key_is_usable() {
        let tag = hmac_sha1(&[], &[b"data"]);
        assert!(hmac_sha1_verify(&[], &[b"data"], &tag));
    }

    #[test]
    fn rejects_tag_differing_only_in_last_byte() {
        let mut tag = hmac_sha1(b"key", &[b"payload"]);
        tag[DIGEST_LEN - 1] ^= 0x01;
        assert!(!hmac_sha1_verify(b"key", &[b"payload"], &tag));
    }
}
