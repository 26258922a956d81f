//! Error taxonomy shared by every adapter.
//!
//! Adapters never let a backend-native error escape: it is either recognised
//! and turned into a normal return value, or wrapped into [`StorageError::StorageFailure`]
//! together with the attempted operation and its arguments.

use thiserror::Error;

/// Boxed backend-native error kept as the cause of a [`StorageError::StorageFailure`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, StorageError>;

/// The three ways an adapter operation can fail.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The key failed a structural precondition. Raised before any backend call.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Which precondition it failed.
        reason: String,
    },

    /// The key does not exist for an operation that requires it.
    #[error("file not found: {key}")]
    FileNotFound {
        /// The missing key.
        key: String,
    },

    /// Any unexpected backend failure.
    #[error("storage failure in {operation}({}): {source}", render_args(.args))]
    StorageFailure {
        /// Adapter operation that was attempted, such as `read` or `rename`.
        operation: &'static str,
        /// Named arguments of the attempt: keys, container names, table names.
        args: Vec<(&'static str, String)>,
        /// The backend-native error.
        #[source]
        source: BoxError,
    },
}

impl StorageError {
    /// Builds an [`StorageError::InvalidKey`].
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Builds a [`StorageError::FileNotFound`].
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::FileNotFound { key: key.into() }
    }

    /// Wraps a backend-native error with the operation name and its arguments.
    pub fn failure<E>(operation: &'static str, args: &[(&'static str, &str)], source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::StorageFailure {
            operation,
            args: args
                .iter()
                .map(|(name, value)| (*name, value.to_string()))
                .collect(),
            source: source.into(),
        }
    }

    /// `true` for [`StorageError::FileNotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::FileNotFound { .. })
    }

    /// `true` for [`StorageError::InvalidKey`].
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, Self::InvalidKey { .. })
    }

    /// `true` for [`StorageError::StorageFailure`].
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::StorageFailure { .. })
    }

    /// Operation name carried by a `StorageFailure`.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            Self::StorageFailure { operation, .. } => Some(operation),
            _ => None,
        }
    }

    /// Value of a named argument carried by a `StorageFailure`.
    pub fn arg(&self, name: &str) -> Option<&str> {
        match self {
            Self::StorageFailure { args, .. } => args
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

fn render_args(args: &[(&'static str, String)]) -> String {
    args.iter()
        .map(|(name, value)| format!("{name}={value:?}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Rejects keys that no adapter can address.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StorageError::invalid_key(key, "key must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use std::io;

    #[test]
    fn failure_keeps_operation_args_and_cause() {
        let err = StorageError::failure(
            "rename",
            &[("source", "a"), ("target", "b")],
            io::Error::other("disk on fire"),
        );
        assert!(err.is_storage_failure());
        assert_eq!(err.operation(), Some("rename"));
        assert_eq!(err.arg("target"), Some("b"));
        assert_eq!(
            err.to_string(),
            r#"storage failure in rename(source="a", target="b"): disk on fire"#
        );
        assert_eq!(err.source().unwrap().to_string(), "disk on fire");
    }

    #[test]
    fn empty_key_is_invalid() {
        assert!(validate_key("").unwrap_err().is_invalid_key());
        assert!(validate_key("a").is_ok());
    }

    #[test]
    fn not_found_has_no_operation() {
        let err = StorageError::not_found("missing");
        assert!(err.is_not_found());
        assert_eq!(err.operation(), None);
        assert_eq!(err.to_string(), "file not found: missing");
    }
}
