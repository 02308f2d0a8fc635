//! Cache keys
//!
//! A [`CacheKey`] fingerprints everything that can change a simulation's
//! output: the model and weather bytes, the output-affecting run options, and
//! a caller supplied salt (engine version, preprocessing chain). Labels,
//! output directories, timeouts and storage overrides are deliberately left
//! out so that differently named but physically identical jobs share an
//! entry.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::job::Job;

/// Fixed-length SHA-256 fingerprint of a job's inputs
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey([u8; 32]);

/// Error parsing a hex-encoded [`CacheKey`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid cache key '{0}': expected 64 lowercase hex characters")]
pub struct InvalidCacheKey(pub String);

impl CacheKey {
    /// Digest length in bytes
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding, used as the on-disk entry name
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for log lines
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.short())
    }
}

impl FromStr for CacheKey {
    type Err = InvalidCacheKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::LEN * 2 || s.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(InvalidCacheKey(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| InvalidCacheKey(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for CacheKey {
    type Error = InvalidCacheKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_hex()
    }
}

const KEY_VERSION: &str = "simbatch-cache/v1";

/// Computes the cache key for `job` from the content of its inputs
///
/// Pure and deterministic: the same bytes and options give the same key no
/// matter where the files live. Line endings are normalized (CRLF to LF)
/// before hashing.
pub fn compute_key(job: &Job, model: &[u8], weather: Option<&[u8]>, salt: &str) -> CacheKey {
    let options = job.options();
    let mut hasher = Sha256::new();

    feed(&mut hasher, "version", KEY_VERSION.as_bytes());
    feed(&mut hasher, "salt", salt.as_bytes());
    feed(&mut hasher, "model", &normalize_newlines(model));
    match weather {
        Some(weather) => feed(&mut hasher, "weather", &normalize_newlines(weather)),
        None => feed(&mut hasher, "weather:none", &[]),
    }

    // Field order is fixed, so the key depends only on option values.
    feed(&mut hasher, "annual", &[options.annual as u8]);
    feed(&mut hasher, "design_day", &[options.design_day as u8]);
    feed(&mut hasher, "readvars", &[options.readvars as u8]);
    feed(&mut hasher, "output_prefix", options.output_prefix.as_bytes());
    feed(&mut hasher, "output_suffix", options.output_suffix.as_flag().as_bytes());
    feed(
        &mut hasher,
        "extra_args",
        &(options.extra_args.len() as u64).to_le_bytes(),
    );
    for arg in &options.extra_args {
        feed(&mut hasher, "arg", arg.as_bytes());
    }

    CacheKey(hasher.finalize().into())
}

/// Length-prefixed so adjacent fields can never run together
fn feed(hasher: &mut Sha256, tag: &str, bytes: &[u8]) {
    hasher.update((tag.len() as u64).to_le_bytes());
    hasher.update(tag.as_bytes());
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn normalize_newlines(bytes: &[u8]) -> Cow<'_, [u8]> {
    if !bytes.windows(2).any(|pair| pair == b"\r\n") {
        return Cow::Borrowed(bytes);
    }

    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().peekable();
    while let Some(&byte) = iter.next() {
        if byte == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(byte);
    }
    Cow::Owned(out)
}
