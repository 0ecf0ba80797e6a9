//! HMAC-SHA1, SHA1 and PBKDF2 helpers for the SASL handshake

use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};

type HmacSha1 = Hmac<Sha1>;

/// HMAC-SHA1 of `data` under `key`.
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// SHA1 digest of `data`.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// PBKDF2-HMAC-SHA1 key derivation.
///
/// Returns exactly `dk_len` bytes for any requested length.
pub fn pbkdf2_hmac_sha1(password: &[u8], salt: &[u8], iterations: u32, dk_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(dk_len.div_ceil(20) * 20);
    let mut block: u32 = 1;

    while out.len() < dk_len {
        let mut input = Vec::with_capacity(salt.len() + 4);
        input.extend_from_slice(salt);
        input.extend_from_slice(&block.to_be_bytes());

        let mut u = hmac_sha1(password, &input);
        let mut t = u;
        for _ in 1..iterations {
            u = hmac_sha1(password, &u);
            for (ti, ui) in t.iter_mut().zip(u.iter()) {
                *ti ^= ui;
            }
        }

        out.extend_from_slice(&t);
        block += 1;
    }

    out.truncate(dk_len);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    // RFC 2202 test case 1
    #[test]
    fn test_hmac_sha1_vector() {
        let digest = hmac_sha1(&[0x0b; 20], b"Hi There");
        assert_eq!(hex(&digest), "b617318655057264e28bc0b6fb378c8ef146be00");
    }

    #[test]
    fn test_sha1_vector() {
        assert_eq!(hex(&sha1(b"abc")), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    // RFC 6070 test vectors
    #[test]
    fn test_pbkdf2_one_iteration() {
        let dk = pbkdf2_hmac_sha1(b"password", b"salt", 1, 20);
        assert_eq!(hex(&dk), "0c60c80f961f0e71f3a9b524af6012062fe037a6");
    }

    #[test]
    fn test_pbkdf2_two_iterations() {
        let dk = pbkdf2_hmac_sha1(b"password", b"salt", 2, 20);
        assert_eq!(hex(&dk), "ea6c014dc72d6f8ccd1ed92ace1d41f0d8de8957");
    }

    #[test]
    fn test_pbkdf2_4096_iterations() {
        let dk = pbkdf2_hmac_sha1(b"password", b"salt", 4096, 20);
        assert_eq!(hex(&dk), "4b007901b765489abead49d926f721d065a429c1");
    }

    #[test]
    fn test_pbkdf2_multi_block() {
        let dk = pbkdf2_hmac_sha1(
            b"passwordPASSWORDpassword",
            b"saltSALTsaltSALTsaltSALTsaltSALTsalt",
            4096,
            25,
        );
        assert_eq!(hex(&dk), "3d2eec4fe41c849b80c8d83662c0e44a8b291a964cf2f07038");
    }

    #[test]
    fn test_pbkdf2_exact_output_lengths() {
        for dk_len in [1, 19, 20, 21, 40, 41] {
            assert_eq!(pbkdf2_hmac_sha1(b"p", b"s", 2, dk_len).len(), dk_len);
        }
    }
}
