#[cfg(test)] use std::sync::Mutex;

#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_NONCE_MUTEX: Mutex<()> = Mutex::new(());

/// Source of the per-discovery nonce that a relay has to echo in its advertisement and query
#[cfg_attr(test, mockall::automock)]
pub trait NonceSource {
    fn next_nonce() -> u32;
}

pub struct RngNonceSource {}
impl NonceSource for RngNonceSource {
    fn next_nonce() -> u32 {
        rand::random()
    }
}
