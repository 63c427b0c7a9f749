//! Review workflow for distribution records.
//!
//! A record starts `Pending` and can be moved to the terminal `Reviewed`
//! state exactly once, by someone holding the shared verification code.

use std::fmt;

use subtle::ConstantTimeEq;
use tracing::debug;

use crate::types::{Review, ReviewStatus, TransactionRecord};

/// Code used by the reference deployment when nothing else is configured.
pub const DEFAULT_VERIFICATION_CODE: &str = "GOVT2024";

/// Shared secret gating the review transition.
#[derive(Clone, PartialEq, Eq)]
pub struct VerificationCode(String);

impl VerificationCode {
    pub fn new(code: impl Into<String>) -> Self {
        VerificationCode(code.into())
    }

    pub fn matches(&self, supplied: &str) -> bool {
        self.0.as_bytes().ct_eq(supplied.as_bytes()).into()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for VerificationCode {
    fn default() -> Self {
        VerificationCode::new(DEFAULT_VERIFICATION_CODE)
    }
}

// Keep the secret out of logs.
impl fmt::Debug for VerificationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VerificationCode(***)")
    }
}

/// Why a review did not apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewRejection {
    NotFound,
    AlreadyReviewed,
    InvalidCode,
}

impl fmt::Display for ReviewRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            ReviewRejection::NotFound => "Transaction not found",
            ReviewRejection::AlreadyReviewed => "Transaction already reviewed",
            ReviewRejection::InvalidCode => "Invalid verification code",
        };
        f.write_str(message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewOutcome {
    Applied(Review),
    Rejected(ReviewRejection),
}

impl ReviewOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ReviewOutcome::Applied(_))
    }
}

/// A reviewer's request to close out one record.
#[derive(Debug, Clone)]
pub struct ReviewRequest<'a> {
    pub transaction_id: &'a str,
    pub supplied_code: &'a str,
    pub reviewer_name: &'a str,
    pub note: &'a str,
}

impl ReviewRequest<'_> {
    /// Reviewer name and note are both required.
    pub fn validate(&self) -> Result<(), String> {
        if self.reviewer_name.trim().is_empty() {
            return Err("reviewerName must not be empty".to_string());
        }
        if self.note.trim().is_empty() {
            return Err("note must not be empty".to_string());
        }
        Ok(())
    }
}

/// Check the transition guard for `record` without touching it.
pub fn check_review(
    record: Option<&TransactionRecord>,
    request: &ReviewRequest<'_>,
    code: &VerificationCode,
) -> Result<(), ReviewRejection> {
    if !code.matches(request.supplied_code) {
        return Err(ReviewRejection::InvalidCode);
    }
    let record = record.ok_or(ReviewRejection::NotFound)?;
    if record.is_reviewed() {
        return Err(ReviewRejection::AlreadyReviewed);
    }
    Ok(())
}

/// Run the pending → reviewed transition on `record`.
///
/// On rejection the record is left untouched.
pub fn apply_review(
    record: Option<&mut TransactionRecord>,
    request: &ReviewRequest<'_>,
    code: &VerificationCode,
    timestamp: u64,
) -> ReviewOutcome {
    if let Err(rejection) = check_review(record.as_deref(), request, code) {
        debug!(id = request.transaction_id, %rejection, "review rejected");
        return ReviewOutcome::Rejected(rejection);
    }
    let Some(record) = record else {
        return ReviewOutcome::Rejected(ReviewRejection::NotFound);
    };

    let review = Review {
        reviewer_name: request.reviewer_name.to_string(),
        reason: request.note.to_string(),
        timestamp,
    };
    record.status = ReviewStatus::Reviewed(review.clone());
    ReviewOutcome::Applied(review)
}
