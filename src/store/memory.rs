//! In-memory chunked blob store.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;

use super::{
   BlobReader, BlobStore, BlobWriter, ChunkBuffer, StoreError, chunk_span, slice_chunk,
   validate_range,
};
use crate::types::{ByteRange, Namespace, ResourceId, StoredFile, WriteOptions};

type Key = (Namespace, ResourceId);

#[derive(Debug)]
struct StoredBlob {
   file:   StoredFile,
   chunks: Vec<Bytes>,
}

type Files = Arc<Mutex<HashMap<Key, Arc<StoredBlob>>>>;

/// Blob store kept entirely in memory; cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
   files: Files,
}

impl MemoryBlobStore {
   pub fn new() -> Self {
      Self::default()
   }

   /// Number of published resources across all namespaces.
   pub fn len(&self) -> usize {
      self.files.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
   async fn open_write(
      &self,
      namespace: &Namespace,
      id: ResourceId,
      options: &WriteOptions,
   ) -> Result<Box<dyn BlobWriter>, StoreError> {
      Ok(Box::new(MemoryBlobWriter {
         files: self.files.clone(),
         key: (namespace.clone(), id),
         options: options.clone(),
         buffer: ChunkBuffer::new(options.effective_chunk_size()),
         chunks: Vec::new(),
      }))
   }

   async fn open_read(
      &self,
      namespace: &Namespace,
      id: ResourceId,
      range: Option<ByteRange>,
   ) -> Result<Box<dyn BlobReader>, StoreError> {
      let blob = self
         .files
         .lock()
         .get(&(namespace.clone(), id))
         .cloned()
         .ok_or(StoreError::NotFound { id })?;
      let range = validate_range(range, blob.file.length)?;
      let (next, end) = chunk_span(range, blob.file.length, blob.file.chunk_size);
      Ok(Box::new(MemoryBlobReader { blob, range, next, end }))
   }

   async fn delete(&self, namespace: &Namespace, id: ResourceId) -> Result<bool, StoreError> {
      Ok(self.files.lock().remove(&(namespace.clone(), id)).is_some())
   }

   async fn exists(&self, namespace: &Namespace, id: ResourceId) -> Result<bool, StoreError> {
      Ok(self.files.lock().contains_key(&(namespace.clone(), id)))
   }

   async fn stat(
      &self,
      namespace: &Namespace,
      id: ResourceId,
   ) -> Result<Option<StoredFile>, StoreError> {
      Ok(self
         .files
         .lock()
         .get(&(namespace.clone(), id))
         .map(|blob| blob.file.clone()))
   }
}

struct MemoryBlobWriter {
   files:   Files,
   key:     Key,
   options: WriteOptions,
   buffer:  ChunkBuffer,
   chunks:  Vec<Bytes>,
}

#[async_trait]
impl BlobWriter for MemoryBlobWriter {
   async fn write_chunk(&mut self, data: &[u8]) -> Result<(), StoreError> {
      let full = self.buffer.push(data);
      self.chunks.extend(full);
      Ok(())
   }

   async fn finish(self: Box<Self>) -> Result<StoredFile, StoreError> {
      let Self { files, key, options, buffer, mut chunks } = *self;
      let chunk_size = buffer.chunk_size();
      let (tail, length, sha256) = buffer.finish();
      chunks.extend(tail);

      let file = StoredFile {
         id: key.1,
         filename: options.filename,
         content_type: options.content_type,
         length,
         chunk_size,
         upload_date: Utc::now(),
         sha256,
         metadata: options.metadata,
      };
      files
         .lock()
         .insert(key, Arc::new(StoredBlob { file: file.clone(), chunks }));
      Ok(file)
   }

   async fn abort(self: Box<Self>) -> Result<(), StoreError> {
      Ok(())
   }
}

struct MemoryBlobReader {
   blob:  Arc<StoredBlob>,
   range: Option<ByteRange>,
   next:  u64,
   end:   u64,
}

#[async_trait]
impl BlobReader for MemoryBlobReader {
   fn file(&self) -> &StoredFile {
      &self.blob.file
   }

   async fn next_chunk(&mut self) -> Result<Option<Bytes>, StoreError> {
      if self.next >= self.end {
         return Ok(None);
      }
      let index = self.next;
      self.next += 1;
      let chunk = self
         .blob
         .chunks
         .get(index as usize)
         .cloned()
         .ok_or_else(|| StoreError::Corrupt {
            id:     self.blob.file.id,
            reason: format!("missing chunk {index}"),
         })?;
      Ok(Some(slice_chunk(index, chunk, self.blob.file.chunk_size, self.range)))
   }
}
