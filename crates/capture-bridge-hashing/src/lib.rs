//! Content hashing and capture-id generation.
//!
//! Four pure functions (`normalize`, `hash`, `audio_fingerprint`,
//! `email_hash`) cover spec §4.1, and [`UlidGenerator`] produces the
//! 26-character, time-sortable, monotonic-within-process capture
//! identifier spec §3.1 requires.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

/// First 4 MiB of a file are fingerprinted (spec §4.1, §8).
const FINGERPRINT_WINDOW: usize = 4 * 1024 * 1024;

/// Trim outer whitespace and fold all line endings to `\n`.
pub fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    unified.trim().to_string()
}

/// Lowercase hex SHA-256 of `text`.
pub fn hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 of the first 4 MiB of the file at `path` (the whole file if
/// shorter). Empty files hash to the SHA-256 of the empty string.
pub fn audio_fingerprint(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; FINGERPRINT_WINDOW];
    let mut total_read = 0usize;
    loop {
        let n = file.read(&mut buf[total_read..])?;
        if n == 0 {
            break;
        }
        total_read += n;
        if total_read == FINGERPRINT_WINDOW {
            break;
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(&buf[..total_read]);
    Ok(hex::encode(hasher.finalize()))
}

/// Canonical email hash: `hash("message_id:<id>\nbody:<normalize(body)>")`.
pub fn email_hash(message_id: &str, body: &str) -> String {
    hash(&format!("message_id:{message_id}\nbody:{}", normalize(body)))
}

const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

fn encode_crockford(mut value: u128, width: usize) -> String {
    let mut chars = vec![b'0'; width];
    for slot in chars.iter_mut().rev() {
        *slot = CROCKFORD_ALPHABET[(value & 0x1F) as usize];
        value >>= 5;
    }
    String::from_utf8(chars).expect("crockford alphabet is ASCII")
}

/// Returns true iff `s` matches `^[0-9A-HJKMNP-TV-Z]{26}$`.
pub fn is_valid_capture_id(s: &str) -> bool {
    if s.len() != 26 {
        return false;
    }
    s.bytes().all(|b| CROCKFORD_ALPHABET.contains(&b))
}

/// Generates monotonic, time-sortable 26-char Crockford base-32 capture
/// identifiers (ULIDs): 48 bits of millisecond timestamp followed by 80
/// bits of randomness. Within a single millisecond the randomness
/// component increments by one rather than being redrawn, so ids
/// produced back-to-back by the same generator sort strictly.
pub struct UlidGenerator {
    last_ms: u64,
    last_random: u128,
}

impl UlidGenerator {
    pub fn new() -> Self {
        Self {
            last_ms: 0,
            last_random: 0,
        }
    }

    /// Generate the next id using the given millisecond timestamp and an
    /// 80-bit random seed (supply both explicitly in tests for
    /// determinism; see spec §9's injectable-dependencies design note).
    pub fn next_with(&mut self, now_ms: u64, fresh_random: u128) -> String {
        let random = if now_ms == self.last_ms {
            self.last_random.wrapping_add(1) & ((1u128 << 80) - 1)
        } else {
            fresh_random & ((1u128 << 80) - 1)
        };
        self.last_ms = now_ms;
        self.last_random = random;

        let mut out = encode_crockford(now_ms as u128, 10);
        out.push_str(&encode_crockford(random, 16));
        out
    }

    /// Generate the next id using the wall clock and the thread-local RNG.
    pub fn next(&mut self) -> String {
        use rand::RngCore;
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_millis() as u64;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let fresh_random = u128::from_be_bytes(bytes) & ((1u128 << 80) - 1);
        self.next_with(now_ms, fresh_random)
    }
}

impl Default for UlidGenerator {
    fn default() -> Self {
        Self::new()
    }
}
