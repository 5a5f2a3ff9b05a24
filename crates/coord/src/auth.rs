//! Challenge/response authentication shared by server and client.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Computes `HMAC-SHA256(psk, nonce ‖ session_id)`.
#[must_use]
pub fn compute_auth_hmac(psk: &[u8], nonce: &[u8; 32], session_id: &str) -> [u8; 32] {
    let mut mac =
        HmacSha256::new_from_slice(psk).expect("hmac-sha256 accepts keys of any length");
    mac.update(nonce);
    mac.update(session_id.as_bytes());
    mac.finalize().into_bytes().into()
}

/// Verifies a client's proof in constant time.
#[must_use]
pub fn verify_auth_hmac(
    psk: &[u8],
    nonce: &[u8; 32],
    session_id: &str,
    provided: &[u8; 32],
) -> bool {
    let expected = compute_auth_hmac(psk, nonce, session_id);
    expected.ct_eq(provided).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_round_trips() {
        let nonce = [0x11u8; 32];
        let proof = compute_auth_hmac(b"secret", &nonce, "session-1");
        assert!(verify_auth_hmac(b"secret", &nonce, "session-1", &proof));
    }

    #[test]
    fn any_ingredient_change_breaks_the_proof() {
        let nonce = [0x11u8; 32];
        let proof = compute_auth_hmac(b"secret", &nonce, "session-1");

        assert!(!verify_auth_hmac(b"wrong", &nonce, "session-1", &proof));
        assert!(!verify_auth_hmac(b"secret", &[0x12u8; 32], "session-1", &proof));
        assert!(!verify_auth_hmac(b"secret", &nonce, "session-2", &proof));

        let mut tampered = proof;
        tampered[0] ^= 1;
        assert!(!verify_auth_hmac(b"secret", &nonce, "session-1", &tampered));
    }
}
