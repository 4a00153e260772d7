//! Message digest helpers for challenge/response authentication.

/// Computes the CHAP MD5 response digest over the identifier byte,
/// the shared secret and the challenge value, as per RFC 1994 section 4.1.
pub fn chap_digest(id: u8, secret: &[u8], challenge: &[u8]) -> [u8; 16] {
    let mut input = Vec::with_capacity(1 + secret.len() + challenge.len());

    input.push(id);
    input.extend_from_slice(secret);
    input.extend_from_slice(challenge);

    md5::compute(input).0
}

/// Compares two byte slices in time independent of where they differ.
/// Digest verification must not leak the mismatch position.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }

    acc == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        let challenge = [0x13; 16];

        let a = chap_digest(7, b"sesame", &challenge);
        let b = chap_digest(7, b"sesame", &challenge);
        assert_eq!(a, b);
    }

    #[test]
    fn digest_depends_on_secret_identifier_and_challenge() {
        let challenge = [0x13; 16];
        let expected = chap_digest(7, b"sesame", &challenge);

        assert_ne!(chap_digest(7, b"Sesame", &challenge), expected);
        assert_ne!(chap_digest(8, b"sesame", &challenge), expected);
        assert_ne!(chap_digest(7, b"sesame", &[0x14; 16]), expected);
    }

    #[test]
    fn constant_time_eq_matches_plain_equality() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
