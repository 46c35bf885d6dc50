//! `memtree` Error System
//!
//! Error types for pool accounting, allocator capability mismatches and
//! configuration. Backend exhaustion is never an error: allocation calls
//! report it as `None` so callers can retry smaller or give up.

use thiserror::Error;

/// Result type for all fallible memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Main error type for memory operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The allocator backend cannot perform this operation at all
    #[error("{operation} is not supported for {allocator}")]
    Unsupported {
        /// Operation that was requested
        operation: &'static str,
        /// Allocator variant that rejected it
        allocator: &'static str,
    },

    /// Alignment is zero or not a power of two
    #[error("Invalid alignment: {alignment} is not a power of two")]
    InvalidAlignment {
        /// Requested alignment
        alignment: u16,
    },

    /// A direct child with the same name already exists
    #[error("Pool '{parent}' already has a child named '{name}'")]
    DuplicateChild {
        /// Parent pool name
        parent: String,
        /// Colliding child name
        name: String,
    },

    /// Aggregate usage of the pool subtree would exceed its cap
    #[error("Memory cap exceeded in pool '{pool}': requested {requested} bytes, cap {cap} bytes")]
    CapExceeded {
        /// Pool name
        pool: String,
        /// Requested bytes
        requested: u64,
        /// Pool cap in bytes
        cap: u64,
    },

    /// The pool has been capped manually and refuses new reservations
    #[error("Memory allocation manually capped in pool '{pool}'")]
    ManualCap {
        /// Pool name
        pool: String,
    },

    /// The process-wide quota of the owning manager is exhausted
    #[error("Process memory quota exceeded: requested {requested} bytes, quota {quota} bytes")]
    QuotaExceeded {
        /// Requested bytes
        requested: u64,
        /// Manager quota in bytes
        quota: u64,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Validation errors
    #[error("Validation failed for field '{field}': {reason}")]
    Validation {
        /// Field that failed validation
        field: String,
        /// Reason for validation failure
        reason: String,
    },
}

// Convenience constructors for common errors
impl MemoryError {
    /// Create unsupported operation error
    #[must_use]
    pub const fn unsupported(operation: &'static str, allocator: &'static str) -> Self {
        Self::Unsupported {
            operation,
            allocator,
        }
    }

    /// Create duplicate child error
    pub fn duplicate_child(parent: impl Into<String>, name: impl Into<String>) -> Self {
        Self::DuplicateChild {
            parent: parent.into(),
            name: name.into(),
        }
    }

    /// Create cap exceeded error
    pub fn cap_exceeded(pool: impl Into<String>, requested: u64, cap: u64) -> Self {
        Self::CapExceeded {
            pool: pool.into(),
            requested,
            cap,
        }
    }

    /// Create manual cap error
    pub fn manual_cap(pool: impl Into<String>) -> Self {
        Self::ManualCap { pool: pool.into() }
    }

    /// Create configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error is a capability mismatch rather than a budget failure
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Whether the error came from a cap or quota check
    #[must_use]
    pub const fn is_budget_exceeded(&self) -> bool {
        matches!(
            self,
            Self::CapExceeded { .. } | Self::ManualCap { .. } | Self::QuotaExceeded { .. }
        )
    }
}

impl From<config::ConfigError> for MemoryError {
    fn from(err: config::ConfigError) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::de::Error> for MemoryError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<garde::Report> for MemoryError {
    fn from(report: garde::Report) -> Self {
        let field = report
            .iter()
            .next()
            .map_or_else(|| "config".to_string(), |(path, _)| path.to_string());
        Self::validation(field, format!("Validation failed: {report}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = MemoryError::config("missing file");
        assert!(matches!(err, MemoryError::Configuration { .. }));

        let err = MemoryError::validation("root_pool_name", "must not be empty");
        assert!(matches!(err, MemoryError::Validation { .. }));
    }

    #[test]
    fn test_unsupported_message() {
        let err = MemoryError::unsupported("alloc_aligned", "MappedAllocator");
        assert!(err.is_unsupported());
        assert!(!err.is_budget_exceeded());
        assert_eq!(
            err.to_string(),
            "alloc_aligned is not supported for MappedAllocator"
        );
    }

    #[test]
    fn test_budget_classification() {
        assert!(MemoryError::cap_exceeded("p", 10, 8).is_budget_exceeded());
        assert!(MemoryError::manual_cap("p").is_budget_exceeded());
        assert!(MemoryError::QuotaExceeded {
            requested: 1,
            quota: 0
        }
        .is_budget_exceeded());
        assert!(!MemoryError::duplicate_child("p", "c").is_budget_exceeded());
    }
}
