//! Error types for autoban.

use thiserror::Error;

/// Crate-level error taxonomy.
///
/// Orchestration code mostly works with `anyhow::Result`; these variants are
/// attached where the caller needs to tell the failure classes apart (a kernel
/// query failure aborts the cycle, a kernel apply failure does not).
#[derive(Error, Debug)]
pub enum AutobanError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Kernel query failed: {0}")]
    KernelQuery(String),

    #[error("Kernel apply failed: {0}")]
    KernelApply(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Parse error: {0}")]
    Parse(#[from] RangeError),

    #[error("Backend not available: {0}")]
    BackendNotAvailable(String),
}

/// Per-token parse failures and address-model construction errors.
///
/// These are always recovered locally: the offending entry is logged and
/// dropped, the rest of the batch continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("empty entry")]
    Empty,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid CIDR block: {0}")]
    InvalidCidr(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("address family mismatch: {0}")]
    FamilyMismatch(String),

    #[error("range start is after range end: {0}")]
    Inverted(String),

    #[error("invalid address length: {0} bytes (expected 4 or 16)")]
    InvalidLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_error_converts_into_crate_error() {
        let err: AutobanError = RangeError::Empty.into();
        assert!(matches!(err, AutobanError::Parse(RangeError::Empty)));
        assert_eq!(err.to_string(), "Parse error: empty entry");
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            RangeError::InvalidLength(5).to_string(),
            "invalid address length: 5 bytes (expected 4 or 16)"
        );
        assert_eq!(
            AutobanError::KernelQuery("nft list".into()).to_string(),
            "Kernel query failed: nft list"
        );
    }
}
