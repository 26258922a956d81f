//! Lazily chunked payloads handed to `Adapter::write`.

use std::io;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Chunk size used for file and reader sources unless overridden.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// A payload exposed as a sequence of byte chunks.
///
/// Literal and file sources are re-readable, so every call to [`Content::chunks`]
/// starts from the beginning. A reader source borrows a stream owned by the caller:
/// it is consumed at most once and never closed here.
pub enum Content<'a> {
    /// An in-memory buffer.
    Bytes(Bytes),
    /// A file opened afresh on every [`Content::chunks`] call.
    File {
        /// File to read.
        path: PathBuf,
        /// Bytes per chunk.
        chunk_size: usize,
    },
    /// A caller-owned stream, read from its current position.
    Reader {
        /// The borrowed stream.
        reader: &'a mut (dyn AsyncRead + Send + Unpin),
        /// Bytes per chunk.
        chunk_size: usize,
    },
}

impl<'a> Content<'a> {
    /// Wraps a literal buffer.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Content::Bytes(bytes.into())
    }

    /// Reads the file at `path` in [`DEFAULT_CHUNK_SIZE`] chunks.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Content::File {
            path: path.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Borrows an open stream. It is not closed when the content is dropped.
    pub fn from_reader<R>(reader: &'a mut R) -> Self
    where
        R: AsyncRead + Send + Unpin,
    {
        Content::Reader {
            reader,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Overrides the read chunk size of file and reader sources. Literal bytes are
    /// always yielded as a single chunk.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        let size = size.max(1);
        match &mut self {
            Content::Bytes(_) => {}
            Content::File { chunk_size, .. } | Content::Reader { chunk_size, .. } => {
                *chunk_size = size
            }
        }
        self
    }

    /// Path of a file-backed source.
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            Content::File { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Produces the lazy chunk sequence. An empty source yields no chunks.
    pub fn chunks(&mut self) -> BoxStream<'_, io::Result<Bytes>> {
        match self {
            Content::Bytes(bytes) => {
                let chunk = (!bytes.is_empty()).then(|| Ok::<_, io::Error>(bytes.clone()));
                stream::iter(chunk).boxed()
            }
            Content::File { path, chunk_size } => {
                let path = path.clone();
                let chunk_size = *chunk_size;
                stream::once(async move { tokio::fs::File::open(path).await })
                    .map_ok(move |file| read_chunks(file, chunk_size))
                    .try_flatten()
                    .boxed()
            }
            Content::Reader { reader, chunk_size } => read_chunks(&mut **reader, *chunk_size),
        }
    }

    /// Drains the chunk sequence into one buffer.
    pub async fn read_all(&mut self) -> io::Result<Bytes> {
        if let Content::Bytes(bytes) = self {
            return Ok(bytes.clone());
        }
        let mut buffer = BytesMut::new();
        let mut chunks = self.chunks();
        while let Some(chunk) = chunks.try_next().await? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }
}

impl From<Bytes> for Content<'_> {
    fn from(bytes: Bytes) -> Self {
        Content::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Content<'_> {
    fn from(bytes: Vec<u8>) -> Self {
        Content::Bytes(bytes.into())
    }
}

impl From<&'static str> for Content<'_> {
    fn from(text: &'static str) -> Self {
        Content::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

impl std::fmt::Debug for Content<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Content::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Content::File { path, chunk_size } => f
                .debug_struct("File")
                .field("path", path)
                .field("chunk_size", chunk_size)
                .finish(),
            Content::Reader { chunk_size, .. } => f
                .debug_struct("Reader")
                .field("chunk_size", chunk_size)
                .finish_non_exhaustive(),
        }
    }
}

/// Reads `chunk_size` bytes at a time; only the last chunk may be shorter.
fn read_chunks<'r, R>(reader: R, chunk_size: usize) -> BoxStream<'r, io::Result<Bytes>>
where
    R: AsyncRead + Send + Unpin + 'r,
{
    stream::try_unfold(reader, move |mut reader| async move {
        let mut buf = BytesMut::zeroed(chunk_size);
        let mut filled = 0;
        while filled < chunk_size {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some((buf.freeze(), reader)))
    })
    .boxed()
}
