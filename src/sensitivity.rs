//! Sensitivity classification for observations
//!
//! Decides whether an observation is agent-internal and must be hidden from
//! callers lacking `graph:sensitive:view`. Pure function over one record,
//! fixed precedence, no database access, so it is unit-testable in
//! isolation and cheap to run inline on every export row.

use crate::types::RecordPayload;

/// Message types that always mark an observation sensitive
pub const SENSITIVE_MESSAGE_TYPES: [&str; 3] = ["system", "internal", "coordination"];

/// Content prefixes (after trimming and case-folding) that mark an
/// observation sensitive
const SENSITIVE_PREFIXES: [&str; 2] = ["[system]", "[internal]"];

/// Classify an observation payload; first matching rule wins.
///
/// 1. `message_type` ∈ {system, internal, coordination}
/// 2. record-level `sensitive: true` flag
/// 3. any `contents` entry whose trimmed, case-folded text starts with
///    `[system]` or `[internal]` — every entry is evaluated, one match marks
///    the whole observation
/// 4. otherwise non-sensitive
///
/// Non-observation payloads are never sensitive; topology visibility is
/// governed by `graph:view` alone.
pub fn classify(payload: &RecordPayload) -> bool {
    let (message_type, sensitive, contents) = match payload {
        RecordPayload::Observation {
            message_type,
            sensitive,
            contents,
            ..
        } => (message_type.as_deref(), *sensitive, contents.as_slice()),
        _ => return false,
    };

    if let Some(mt) = message_type {
        if SENSITIVE_MESSAGE_TYPES.contains(&mt) {
            return true;
        }
    }

    if sensitive == Some(true) {
        return true;
    }

    contents.iter().any(|entry| {
        let folded = entry.trim_start().to_lowercase();
        SENSITIVE_PREFIXES
            .iter()
            .any(|prefix| folded.starts_with(prefix))
    })
}
