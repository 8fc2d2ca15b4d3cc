//! Identifier generation.
//!
//! None of these identifiers are cryptographically secure, they only need to be unlikely to
//! collide within the lifetime of a process.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;

/// Returns a new segment ID: 16 lowercase hex characters.
pub fn new_id() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}

/// Returns a new trace ID in the collector's format: `1-<epoch seconds>-<96 random bits>`,
/// all in lowercase hex.
pub fn new_trace_id() -> String {
    let mut rng = rand::rng();
    let secs = chrono::Utc::now().timestamp() as u32;
    let hi: u32 = rng.random();
    let lo: u64 = rng.random();
    format!("1-{secs:08x}-{hi:08x}{lo:016x}")
}

/// Returns a short URL-safe identifier (8 characters) used for request IDs.
pub fn short_id() -> String {
    let bytes: [u8; 6] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}
