//! Chunked blob storage abstraction.
//!
//! Writes are staged and become visible atomically on `finish`; an aborted or
//! dropped writer leaves nothing behind. Range bounds are checked here, not
//! by the broker.

pub mod fs;
pub mod memory;

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

use crate::types::{ByteRange, Namespace, ResourceId, StoredFile, WriteOptions};

/// Errors that can occur in blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
   #[error("resource {id} not found")]
   NotFound { id: ResourceId },

   #[error("invalid range {start}..={end} for resource of {length} bytes")]
   InvalidRange { start: u64, end: u64, length: u64 },

   #[error("corrupt resource {id}: {reason}")]
   Corrupt { id: ResourceId, reason: String },

   /// A `write_chunk` call was dropped before it completed, so the staged
   /// data no longer matches what the caller was told was written.
   #[error("write of {id} was interrupted; staged data is incomplete")]
   Interrupted { id: ResourceId },

   #[error("store unavailable: {0}")]
   Unavailable(String),

   #[error("io error: {0}")]
   Io(#[from] io::Error),

   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),
}

/// Shared blob storage, keyed by namespace and resource id.
#[async_trait]
pub trait BlobStore: Send + Sync {
   async fn open_write(
      &self,
      namespace: &Namespace,
      id: ResourceId,
      options: &WriteOptions,
   ) -> Result<Box<dyn BlobWriter>, StoreError>;

   async fn open_read(
      &self,
      namespace: &Namespace,
      id: ResourceId,
      range: Option<ByteRange>,
   ) -> Result<Box<dyn BlobReader>, StoreError>;

   /// Returns `false` when there was nothing to delete.
   async fn delete(&self, namespace: &Namespace, id: ResourceId) -> Result<bool, StoreError>;

   async fn exists(&self, namespace: &Namespace, id: ResourceId) -> Result<bool, StoreError>;

   async fn stat(
      &self,
      namespace: &Namespace,
      id: ResourceId,
   ) -> Result<Option<StoredFile>, StoreError>;
}

/// Write side of one stored resource.
#[async_trait]
pub trait BlobWriter: Send {
   async fn write_chunk(&mut self, data: &[u8]) -> Result<(), StoreError>;

   /// Publishes everything written so far and returns the stored record.
   async fn finish(self: Box<Self>) -> Result<StoredFile, StoreError>;

   /// Discards everything written so far.
   async fn abort(self: Box<Self>) -> Result<(), StoreError>;
}

/// Read side of one stored resource.
#[async_trait]
pub trait BlobReader: Send {
   fn file(&self) -> &StoredFile;

   /// Next slice of data, `None` at end of stream.
   async fn next_chunk(&mut self) -> Result<Option<Bytes>, StoreError>;
}

/// Checks an inclusive range against the stored length.
pub fn validate_range(
   range: Option<ByteRange>,
   length: u64,
) -> Result<Option<ByteRange>, StoreError> {
   let Some(range) = range else {
      return Ok(None);
   };
   if range.start > range.end || range.end >= length {
      return Err(StoreError::InvalidRange { start: range.start, end: range.end, length });
   }
   Ok(Some(range))
}

/// Indices of the chunks that hold `range` (all chunks when `None`).
pub fn chunk_span(range: Option<ByteRange>, length: u64, chunk_size: usize) -> (u64, u64) {
   let cs = chunk_size.max(1) as u64;
   let chunk_count = length.div_ceil(cs);
   match range {
      Some(r) => (r.start / cs, r.end / cs + 1),
      None => (0, chunk_count),
   }
}

/// Trims chunk `index` to the part inside `range`.
pub fn slice_chunk(index: u64, chunk: Bytes, chunk_size: usize, range: Option<ByteRange>) -> Bytes {
   let Some(range) = range else {
      return chunk;
   };
   let chunk_start = index * chunk_size as u64;
   let chunk_end = chunk_start + chunk.len() as u64;
   let from = range.start.max(chunk_start) - chunk_start;
   let to = (range.end + 1).min(chunk_end).saturating_sub(chunk_start);
   if from >= to {
      return Bytes::new();
   }
   chunk.slice(from as usize..to as usize)
}

/// Splits an incoming byte stream into fixed-size chunks while tracking
/// length and checksum.
pub(crate) struct ChunkBuffer {
   chunk_size: usize,
   pending:    BytesMut,
   hasher:     Sha256,
   length:     u64,
}

impl ChunkBuffer {
   pub(crate) fn new(chunk_size: usize) -> Self {
      Self {
         chunk_size: chunk_size.max(1),
         pending:    BytesMut::with_capacity(chunk_size.max(1)),
         hasher:     Sha256::new(),
         length:     0,
      }
   }

   /// Accepts `data` and returns every chunk that filled up.
   pub(crate) fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
      self.hasher.update(data);
      self.length += data.len() as u64;
      self.pending.extend_from_slice(data);

      let mut full = Vec::new();
      while self.pending.len() >= self.chunk_size {
         full.push(self.pending.split_to(self.chunk_size).freeze());
      }
      full
   }

   /// Returns the trailing partial chunk, total length and hex sha256.
   pub(crate) fn finish(self) -> (Option<Bytes>, u64, String) {
      let tail = (!self.pending.is_empty()).then(|| self.pending.freeze());
      (tail, self.length, hex::encode(self.hasher.finalize()))
   }

   pub(crate) fn chunk_size(&self) -> usize {
      self.chunk_size
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn chunk_buffer_splits_on_boundaries() {
      let mut buf = ChunkBuffer::new(4);
      assert!(buf.push(b"abc").is_empty());
      let full = buf.push(b"defghij");
      assert_eq!(full, vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")]);
      let (tail, len, sha) = buf.finish();
      assert_eq!(tail.unwrap(), Bytes::from_static(b"ij"));
      assert_eq!(len, 10);
      assert_eq!(sha, hex::encode(Sha256::digest(b"abcdefghij")));
   }

   #[test]
   fn range_must_fit_inside_resource() {
      assert!(validate_range(Some(ByteRange::new(0, 9)), 10).is_ok());
      assert!(validate_range(Some(ByteRange::new(0, 10)), 10).is_err());
      assert!(validate_range(Some(ByteRange::new(5, 4)), 10).is_err());
      assert!(validate_range(None, 0).unwrap().is_none());
   }

   #[test]
   fn span_and_slice_cover_inclusive_range() {
      let range = Some(ByteRange::new(5, 13));
      assert_eq!(chunk_span(range, 20, 4), (1, 4));
      assert_eq!(chunk_span(None, 20, 4), (0, 5));
      assert_eq!(chunk_span(None, 0, 4), (0, 0));

      let data: Vec<u8> = (0..20).collect();
      let mut out = Vec::new();
      for idx in 1..4u64 {
         let start = (idx * 4) as usize;
         let chunk = Bytes::copy_from_slice(&data[start..start + 4]);
         out.extend_from_slice(&slice_chunk(idx, chunk, 4, range));
      }
      assert_eq!(out, data[5..=13].to_vec());
   }
}
