//! Translation of blob-service failures into [`StorageError`].

use std::sync::LazyLock;

use regex::Regex;

use super::BlobAddress;
use super::client::BlobServiceError;
use crate::error::StorageError;

/// Returned when creating a container that exists.
pub const CONTAINER_ALREADY_EXISTS: &str = "ContainerAlreadyExists";
/// Returned for operations on a missing container.
pub const CONTAINER_NOT_FOUND: &str = "ContainerNotFound";
/// Returned for operations on a missing blob.
pub const BLOB_NOT_FOUND: &str = "BlobNotFound";

static CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Code>\s*([^<\s]+)\s*</Code>").expect("static regex"));

/// Extracts `<Code>` from an XML error body such as
/// `<Error><Code>BlobNotFound</Code><Message>…</Message></Error>`.
pub fn error_code_from_body(body: &str) -> Option<&str> {
    CODE.captures(body)
        .and_then(|captures| captures.get(1))
        .map(|code| code.as_str())
}

impl BlobServiceError {
    /// Service error code from the header, else from the body.
    pub fn code(&self) -> Option<&str> {
        self.error_code
            .as_deref()
            .or_else(|| error_code_from_body(&self.body))
    }
}

/// Error codes the adapter reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// [`CONTAINER_ALREADY_EXISTS`]
    ContainerAlreadyExists,
    /// [`CONTAINER_NOT_FOUND`]
    ContainerNotFound,
    /// [`BLOB_NOT_FOUND`]
    BlobNotFound,
    /// Anything else.
    Other,
}

impl ServiceErrorKind {
    /// Classifies `err` by its code.
    pub fn of(err: &BlobServiceError) -> Self {
        match err.code() {
            Some(CONTAINER_ALREADY_EXISTS) => Self::ContainerAlreadyExists,
            Some(CONTAINER_NOT_FOUND) => Self::ContainerNotFound,
            Some(BLOB_NOT_FOUND) => Self::BlobNotFound,
            _ => Self::Other,
        }
    }
}

/// Maps a failure of an operation on one blob.
///
/// A missing blob is `FileNotFound`. A missing container is too in multi-container
/// mode, where it is part of the key; with a single fixed container it is a
/// configuration problem and stays a `StorageFailure`.
pub(crate) fn translate(
    err: BlobServiceError,
    operation: &'static str,
    key: &str,
    address: &BlobAddress<'_>,
    multi_container: bool,
) -> StorageError {
    match ServiceErrorKind::of(&err) {
        ServiceErrorKind::BlobNotFound => StorageError::not_found(key),
        ServiceErrorKind::ContainerNotFound if multi_container => StorageError::not_found(key),
        _ => StorageError::failure(
            operation,
            &[
                ("key", key),
                ("container", address.container),
                ("blob", address.blob),
            ],
            err,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Error>
  <Code>ContainerAlreadyExists</Code>
  <Message>The specified container already exists.
RequestId:abc</Message>
</Error>"#;

    #[test]
    fn code_is_read_from_xml_body() {
        assert_eq!(error_code_from_body(BODY), Some(CONTAINER_ALREADY_EXISTS));
        assert_eq!(error_code_from_body("<Error></Error>"), None);
        assert_eq!(error_code_from_body("not xml at all"), None);
    }

    #[test]
    fn header_code_wins_over_body() {
        let err = BlobServiceError {
            status: 404,
            error_code: Some(BLOB_NOT_FOUND.to_string()),
            body: BODY.to_string(),
        };
        assert_eq!(ServiceErrorKind::of(&err), ServiceErrorKind::BlobNotFound);
        assert_eq!(
            ServiceErrorKind::of(&BlobServiceError::new(409, BODY)),
            ServiceErrorKind::ContainerAlreadyExists
        );
    }

    #[test]
    fn missing_container_depends_on_mode() {
        let address = BlobAddress {
            container: "c",
            blob: "b",
        };
        let err = || BlobServiceError::with_code(404, CONTAINER_NOT_FOUND);

        assert!(translate(err(), "read", "c/b", &address, true).is_not_found());

        let failure = translate(err(), "read", "b", &address, false);
        assert_eq!(failure.operation(), Some("read"));
        assert_eq!(failure.arg("container"), Some("c"));
    }

    #[test]
    fn unknown_errors_are_wrapped() {
        let address = BlobAddress {
            container: "c",
            blob: "b",
        };
        let err = translate(
            BlobServiceError::transport("connection reset"),
            "write",
            "b",
            &address,
            true,
        );
        assert!(err.is_storage_failure());
        assert!(err.to_string().contains("connection reset"));
    }
}
