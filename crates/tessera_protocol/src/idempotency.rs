//! Stable digests used to recognise a payload across retries.

use blake3::Hasher;

use crate::change::ChangePayload;
use crate::ChangeRequestId;

const SEP: u8 = 0x1f;

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Digest of a change payload, recorded at submission and checked before merge.
pub fn payload_digest(payload: &ChangePayload) -> String {
    // Rows are BTreeMaps, so the JSON encoding is deterministic.
    let json = serde_json::to_string(payload).unwrap_or_default();
    hash_parts(&[json.as_str()])
}

/// Human-readable label for a staging area: one per merge attempt.
pub fn staging_label(change_request_id: &ChangeRequestId, attempt: u32) -> String {
    let digest = hash_parts(&[change_request_id.as_str(), &attempt.to_string()]);
    format!("staging_{}_{}", attempt, &digest[..12])
}
