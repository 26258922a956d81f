#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

//! A uniform key-addressed blob storage contract with interchangeable backends:
//! a relational table, process memory, Azure-style blob containers and a local directory.
//!
//! # Features
//! - One async base contract ([`Adapter`]) plus optional capabilities (checksum, size,
//!   metadata, prefix listing, mime type) that callers detect at runtime.
//! - Lazy chunked payloads ([`Content`]) from bytes, a file path or a borrowed reader.
//! - A single error taxonomy ([`StorageError`]): invalid key, not found, or a storage
//!   failure wrapping the backend error with the operation and its arguments.
//! - Backend clients are injected; the crate never configures a connection itself.
//!
//! # Usage
//! ```
//! use storage_adapter::{Adapter, Content, InMemoryAdapter};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> storage_adapter::Result<()> {
//!     let adapter = InMemoryAdapter::new();
//!     adapter.write("greeting", Content::from_bytes("hello")).await?;
//!     assert_eq!(adapter.read("greeting").await?, "hello");
//!
//!     // Feature-detect an optional capability.
//!     if let Some(checksums) = adapter.as_checksum_calculator() {
//!         println!("md5 = {}", checksums.checksum("greeting").await?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Delete policy
//! Deleting an absent key raises [`StorageError::FileNotFound`] on the relational,
//! Azure-style and local adapters; the in-memory adapter treats it as success.

mod backends;
mod content;
mod error;
pub mod mime;

pub use backends::azure::client::{
    BlobCommitSettings, BlobProperties, BlobService, BlobServiceConnector, BlobServiceError,
};
pub use backends::azure::errors::{
    BLOB_NOT_FOUND, CONTAINER_ALREADY_EXISTS, CONTAINER_NOT_FOUND, ServiceErrorKind,
    error_code_from_body,
};
pub use backends::azure::{
    AzureBlobAdapter, AzureConfig, BlobAddress, BlobWriteOptions, ContainerMode,
    DEFAULT_BLOCK_SIZE, tokenize_key,
};
pub use backends::common::{
    Adapter, Capabilities, ChecksumCalculator, ListKeysAware, ListedKeys, MetadataSupporter,
    MimeTypeProvider, SizeCalculator,
};
pub use backends::dbal::{DbalAdapter, DbalConfig};
pub use backends::local::{LocalAdapter, LocalConfig};
pub use backends::memory::InMemoryAdapter;
pub use content::{Content, DEFAULT_CHUNK_SIZE};
pub use error::{BoxError, Result, StorageError, validate_key};
