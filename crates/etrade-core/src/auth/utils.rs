use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Random alphanumeric string used for `oauth_nonce`.
pub fn nonce(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
