//! Minimum-viability checks on a candidate's content.

use crate::domain::{FailureKind, GeneratedItem, VerificationResult};

/// Minimum stem length, in characters.
pub const MIN_STEM_LEN: usize = 5;

/// Reject degenerate output (near-empty stem, empty answer).
pub fn check_content(item: &GeneratedItem) -> VerificationResult {
    if item.stem_text.chars().count() < MIN_STEM_LEN {
        return VerificationResult::failed(FailureKind::ContentInvalid, "Stem too short");
    }
    if item.answer_text.is_empty() {
        return VerificationResult::failed(FailureKind::ContentInvalid, "Answer empty");
    }
    VerificationResult::Passed
}
