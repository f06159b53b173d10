//! Content screening and audit hashing for write paths
//!
//! Every mutation screens its free-text content against a small fixed set of
//! prompt-injection and control-token patterns before anything is stored. A
//! match rejects the whole write; the audit row records the reason. The
//! pattern table is deliberately short and static: this is a tripwire for
//! obvious injection attempts, not a content-moderation system.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Total free-text budget for one write request, across all content strings
pub const MAX_CONTENT_BYTES: usize = 64 * 1024;

/// Injection patterns with the reason recorded in the audit row on a match
static INJECTION_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"(?i)ignore\s+(?:all\s+)?(?:previous|prior)\s+instructions",
            "override phrase: ignore previous instructions",
        ),
        (
            r"(?i)disregard\s+(?:all\s+)?(?:previous|prior)\s+instructions",
            "override phrase: disregard previous instructions",
        ),
        (
            r"(?i)you\s+are\s+now\s+in\s+developer\s+mode",
            "override phrase: developer mode",
        ),
        (r"(?i)<\|im_start\|>", "chat template control token"),
        (r"(?i)<\|im_end\|>", "chat template control token"),
        (r"(?i)<\|endoftext\|>", "chat template control token"),
        (
            r"(?i)\bnew\s+system\s+prompt\b",
            "override phrase: system prompt replacement",
        ),
    ]
    .into_iter()
    .map(|(pattern, reason)| {
        (
            Regex::new(pattern).expect("static sanitizer pattern must compile"),
            reason,
        )
    })
    .collect()
});

/// Screen the content strings of one write request.
///
/// Returns `Some(reason)` when the write must be rejected: either an
/// injection pattern matched or the combined content exceeds
/// [`MAX_CONTENT_BYTES`]. Returns `None` for clean content.
pub fn screen(contents: &[&str]) -> Option<String> {
    let total: usize = contents.iter().map(|c| c.len()).sum();
    if total > MAX_CONTENT_BYTES {
        return Some(format!(
            "content size {} exceeds cap of {} bytes",
            total, MAX_CONTENT_BYTES
        ));
    }

    for content in contents {
        for (pattern, reason) in INJECTION_PATTERNS.iter() {
            if pattern.is_match(content) {
                return Some((*reason).to_string());
            }
        }
    }

    None
}

/// SHA-256 hex digest over the content strings of one write, recorded in the
/// audit row. The separator keeps `["ab","c"]` and `["a","bc"]` distinct.
pub fn content_hash(contents: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for content in contents {
        hasher.update(content.as_bytes());
        hasher.update([0x1f]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
