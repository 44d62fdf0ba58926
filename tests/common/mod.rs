//! Shared helpers for integration tests.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Deterministic, sortable test key.
pub fn test_key(i: usize) -> Vec<u8> {
    format!("cellardb-test-key-{:09}", i).into_bytes()
}

/// Random printable value of roughly `n` bytes.
pub fn random_value(n: usize) -> Vec<u8> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect();
    format!("cellardb-test-value-{}", suffix).into_bytes()
}
