//! Remote resource names.
//!
//! Every name handed to a platform goes through [`generate`], which keeps it a
//! valid DNS label: lowercase alphanumerics and hyphens, starting and ending
//! with an alphanumeric, at most 63 characters.

use rand::Rng;

/// Prefix used when the base name normalizes to nothing.
pub const DEFAULT_PREFIX: &str = "container-agent";

/// Suffix length for agent and pod names.
pub const AGENT_SUFFIX_LENGTH: usize = 5;

/// Suffix length for ARM deployment records.
pub const DEPLOYMENT_SUFFIX_LENGTH: usize = 8;

/// Longest generated name, including the separator and suffix.
const MAX_NAME_LENGTH: usize = 62;

/// Longest suffix that still leaves one character of base name.
const MAX_SUFFIX_LENGTH: usize = MAX_NAME_LENGTH - 2;

/// Consonants and digits only, so suffixes never spell words.
const SUFFIX_CHARSET: &[u8] = b"bcdfghjklmnpqrstvwxz0123456789";

/// Normalize a base name: spaces and underscores become hyphens, everything
/// is lowercased, and characters outside `[a-z0-9-]` are dropped.
fn normalize(base: &str) -> String {
    let normalized: String = base
        .trim()
        .to_lowercase()
        .replace([' ', '_'], "-")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    normalized.trim_start_matches('-').to_string()
}

/// Random suffix drawn from [`SUFFIX_CHARSET`].
fn random_suffix(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())]))
        .collect()
}

/// Generate `<base>-<suffix>` with a random suffix of `suffix_length`
/// characters. Suffix lengths above 60 are clamped.
#[must_use]
pub fn generate(base: &str, suffix_length: usize) -> String {
    let suffix_length = suffix_length.min(MAX_SUFFIX_LENGTH);

    let mut name = normalize(base);
    if name.is_empty() {
        name = DEFAULT_PREFIX.to_string();
    }

    if suffix_length == 0 {
        name.truncate(MAX_NAME_LENGTH);
        return name.trim_end_matches('-').to_string();
    }

    name.truncate(MAX_NAME_LENGTH - 1 - suffix_length);
    format!("{name}-{}", random_suffix(suffix_length))
}

/// Whether `name` is a valid DNS label.
#[must_use]
pub fn is_dns_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
}
