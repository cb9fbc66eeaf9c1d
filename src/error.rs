//! Error types at the console's public seams.
//!
//! Fetch failures are recovered inside the pollers (the previous snapshot
//! stays on screen). Action failures are handed back to the caller verbatim
//! and never touch local state.

/// A data source could not be read.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Backend unreachable, non-success status, I/O failure.
    #[error("{source_name} unavailable: {message}")]
    Unavailable {
        source_name: &'static str,
        message: String,
    },

    /// The payload could not be decoded at the transport level.
    #[error("{source_name} returned a malformed payload: {message}")]
    Malformed {
        source_name: &'static str,
        message: String,
    },
}

/// An approve / reject / run command failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    /// Tenant is already approved in the latest tenant-state snapshot.
    /// The backend is not contacted.
    #[error("tenant {tenant} is already approved")]
    AlreadyApproved { tenant: String },

    /// The backend does not know this tenant (e.g. rejected twice).
    #[error("tenant {tenant} not found")]
    NotFound { tenant: String },

    /// The backend refused or failed the command.
    #[error("{action} failed: {message}")]
    Backend {
        action: &'static str,
        message: String,
    },
}

impl ActionError {
    /// True when the failure means the request was already satisfied
    /// by an earlier action, so the caller can treat it as resolved.
    pub fn is_already_resolved(&self) -> bool {
        matches!(
            self,
            ActionError::NotFound { .. } | ActionError::AlreadyApproved { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let err = FetchError::Unavailable {
            source_name: "decisions",
            message: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "decisions unavailable: connection refused");
    }

    #[test]
    fn test_action_error_display_is_verbatim() {
        let err = ActionError::Backend {
            action: "approve",
            message: "Approval signing failed".to_string(),
        };
        assert_eq!(err.to_string(), "approve failed: Approval signing failed");
    }

    #[test]
    fn test_not_found_is_already_resolved() {
        let err = ActionError::NotFound {
            tenant: "alpha".to_string(),
        };
        assert!(err.is_already_resolved());

        let err = ActionError::Backend {
            action: "reject",
            message: "disk full".to_string(),
        };
        assert!(!err.is_already_resolved());
    }
}
