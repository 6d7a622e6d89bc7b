//! Secret tokens and verification codes.

use rand::Rng;

/// Length of every device token.
pub const TOKEN_LENGTH: usize = 20;

/// A fresh token of lowercase ASCII letters.
pub fn random_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LENGTH)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}

/// A six digit email verification code.
pub fn verification_code() -> String {
    rand::thread_rng().gen_range(100_000..1_000_000).to_string()
}
