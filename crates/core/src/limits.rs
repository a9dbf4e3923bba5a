//! Field-length limits enforced before anything is persisted.
//!
//! These mirror the column widths of the shared batch store. A value over
//! its limit must never reach a write: step names are rejected outright,
//! exit statuses are truncated deterministically.

use crate::error::{DomainError, DomainResult};

/// Maximum length, in characters, of a step name.
pub const MAX_STEP_NAME_LEN: usize = 128;

/// Maximum length, in characters, of an exit status string.
pub const MAX_EXIT_STATUS_LEN: usize = 512;

/// Validate a step name against the length limit.
///
/// Empty names are also rejected; a step with no name cannot form a
/// composite key.
pub fn validate_step_name(name: &str) -> DomainResult<()> {
    if name.is_empty() {
        return Err(DomainError::validation("step name must not be empty"));
    }
    let len = name.chars().count();
    if len > MAX_STEP_NAME_LEN {
        return Err(DomainError::validation(format!(
            "step name length {len} exceeds maximum {MAX_STEP_NAME_LEN}"
        )));
    }
    Ok(())
}

/// Truncate an exit status to the persistable limit.
///
/// Truncation is by character count, never mid-character, so the result is
/// always valid UTF-8 and deterministic for a given input.
pub fn truncate_exit_status(status: impl Into<String>) -> String {
    let status = status.into();
    if status.chars().count() <= MAX_EXIT_STATUS_LEN {
        return status;
    }
    status.chars().take(MAX_EXIT_STATUS_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_name_at_limit_is_accepted() {
        let name = "s".repeat(MAX_STEP_NAME_LEN);
        assert!(validate_step_name(&name).is_ok());
    }

    #[test]
    fn step_name_over_limit_is_rejected() {
        let name = "s".repeat(MAX_STEP_NAME_LEN + 1);
        let err = validate_step_name(&name).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn empty_step_name_is_rejected() {
        assert!(validate_step_name("").is_err());
    }

    #[test]
    fn exit_status_within_limit_is_unchanged() {
        assert_eq!(truncate_exit_status("COMPLETED"), "COMPLETED");
    }

    #[test]
    fn exit_status_over_limit_is_cut_to_512_chars() {
        let long = "e".repeat(MAX_EXIT_STATUS_LEN + 40);
        let cut = truncate_exit_status(long);
        assert_eq!(cut.chars().count(), MAX_EXIT_STATUS_LEN);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // Multibyte chars: count chars, not bytes.
        let long = "é".repeat(MAX_EXIT_STATUS_LEN + 1);
        let cut = truncate_exit_status(long);
        assert_eq!(cut.chars().count(), MAX_EXIT_STATUS_LEN);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
