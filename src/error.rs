//! Unified error type for the bloomtree library.
//!
//! This module provides a structured error type that captures all failure
//! modes in the library with appropriate context. Library code uses
//! `BloomTreeError` while CLI code continues using `anyhow::Result` for
//! convenience.
//!
//! # Error Categories
//!
//! - **Io**: File system operations (open, seek, read, write)
//! - **Format**: Invalid file format (magic bytes, version mismatch, a
//!   serialized block whose length does not match its declared size)
//! - **Validation**: Invalid parameters or data (thresholds, k-mer size)
//! - **Inconsistent**: Bloom filter parameter mismatch across a tree

use std::fmt;
use std::path::PathBuf;

/// Unified error type for the bloomtree library.
#[derive(Debug)]
pub enum BloomTreeError {
    /// I/O error with path context.
    Io {
        path: PathBuf,
        operation: &'static str,
        source: std::io::Error,
    },

    /// Invalid file format (magic bytes, version, block structure).
    Format { path: PathBuf, detail: String },

    /// Validation error (invalid parameters, data invariants).
    Validation(String),

    /// Bloom filter parameter inconsistency between tree nodes.
    Inconsistent { node: String, detail: String },
}

impl fmt::Display for BloomTreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BloomTreeError::Io {
                path,
                operation,
                source,
            } => {
                write!(
                    f,
                    "I/O error during {} on '{}': {}",
                    operation,
                    path.display(),
                    source
                )
            }
            BloomTreeError::Format { path, detail } => {
                write!(f, "Invalid format in '{}': {}", path.display(), detail)
            }
            BloomTreeError::Validation(msg) => write!(f, "Validation error: {}", msg),
            BloomTreeError::Inconsistent { node, detail } => {
                write!(f, "Inconsistent bloom filter at node '{}': {}", node, detail)
            }
        }
    }
}

impl std::error::Error for BloomTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BloomTreeError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BloomTreeError {
    fn from(err: std::io::Error) -> Self {
        BloomTreeError::Io {
            path: PathBuf::new(),
            operation: "unknown",
            source: err,
        }
    }
}

/// Convenience type alias for Results using BloomTreeError.
pub type Result<T> = std::result::Result<T, BloomTreeError>;

// ============================================================================
// Helper constructors
// ============================================================================

impl BloomTreeError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        BloomTreeError::Io {
            path: path.into(),
            operation,
            source,
        }
    }

    /// Create a format error.
    pub fn format(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        BloomTreeError::Format {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        BloomTreeError::Validation(msg.into())
    }

    /// Create an inconsistency error naming the offending node.
    pub fn inconsistent(node: impl Into<String>, detail: impl Into<String>) -> Self {
        BloomTreeError::Inconsistent {
            node: node.into(),
            detail: detail.into(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let err = BloomTreeError::io(
            "/path/to/tree.sbt",
            "read",
            std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/path/to/tree.sbt"));
        assert!(msg.contains("read"));
        assert!(msg.contains("file not found"));
    }

    #[test]
    fn test_format_error_display() {
        let err = BloomTreeError::format("/path/to/leaf.bf", "invalid magic bytes");
        let msg = err.to_string();
        assert!(msg.contains("/path/to/leaf.bf"));
        assert!(msg.contains("invalid magic bytes"));
    }

    #[test]
    fn test_validation_error_display() {
        let err = BloomTreeError::validation("threshold must be between 0 and 1");
        assert!(err.to_string().contains("threshold must be between 0 and 1"));
    }

    #[test]
    fn test_inconsistent_error_names_node() {
        let err = BloomTreeError::inconsistent("leaf7", "k-mer size 21 vs 31");
        let msg = err.to_string();
        assert!(msg.contains("leaf7"));
        assert!(msg.contains("k-mer size 21 vs 31"));
    }

    #[test]
    fn test_error_source_chain() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err = BloomTreeError::io("/path", "open", io_err);
        assert!(std::error::Error::source(&err).is_some());
    }
}
