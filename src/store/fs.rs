//! Directory-backed blob store.
//!
//! Layout under the store root:
//!
//! ```text
//! <ns>/files/<id>/file.json
//! <ns>/files/<id>/chunks/00000000 ...
//! <ns>/staging/<id>.<txn>/           in-progress writes
//! ```
//!
//! A writer fills a staging directory and publishes it with a rename, so a
//! reader sees either the previous complete resource or the new one.

use std::{
   fs as stdfs,
   path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::fs;
use uuid::Uuid;

use super::{
   BlobReader, BlobStore, BlobWriter, ChunkBuffer, StoreError, chunk_span, slice_chunk,
   validate_range,
};
use crate::{
   types::{ByteRange, Namespace, ResourceId, StoredFile, WriteOptions},
   util::sync_dir,
};

const FILE_RECORD: &str = "file.json";
const CHUNKS_DIR: &str = "chunks";

fn chunk_name(index: u64) -> String {
   format!("{index:08}")
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
   root: PathBuf,
}

impl FsBlobStore {
   pub fn new(root: impl Into<PathBuf>) -> Self {
      Self { root: root.into() }
   }

   fn files_dir(&self, namespace: &Namespace) -> PathBuf {
      self.root.join(namespace.as_str()).join("files")
   }

   fn staging_dir(&self, namespace: &Namespace) -> PathBuf {
      self.root.join(namespace.as_str()).join("staging")
   }

   fn resource_dir(&self, namespace: &Namespace, id: ResourceId) -> PathBuf {
      self.files_dir(namespace).join(id.to_string())
   }

   async fn read_record(
      &self,
      namespace: &Namespace,
      id: ResourceId,
   ) -> Result<Option<StoredFile>, StoreError> {
      let path = self.resource_dir(namespace, id).join(FILE_RECORD);
      match fs::read(&path).await {
         Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
         Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
         Err(e) => Err(e.into()),
      }
   }

   /// Moves `dir` aside into staging and removes it. Returns `false` if `dir`
   /// did not exist.
   async fn retire(&self, namespace: &Namespace, dir: &Path) -> Result<bool, StoreError> {
      let staging = self.staging_dir(namespace);
      fs::create_dir_all(&staging).await?;
      let trash = staging.join(format!("retired.{}", Uuid::new_v4()));
      match fs::rename(dir, &trash).await {
         Ok(()) => {},
         Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
         Err(e) => return Err(e.into()),
      }
      if let Some(parent) = dir.parent() {
         sync_dir(parent.to_path_buf()).await?;
      }
      if let Err(e) = fs::remove_dir_all(&trash).await {
         tracing::warn!("failed to remove retired resource {}: {e}", trash.display());
      }
      Ok(true)
   }
}

#[async_trait]
impl BlobStore for FsBlobStore {
   async fn open_write(
      &self,
      namespace: &Namespace,
      id: ResourceId,
      options: &WriteOptions,
   ) -> Result<Box<dyn BlobWriter>, StoreError> {
      let staging = self
         .staging_dir(namespace)
         .join(format!("{id}.{}", Uuid::new_v4().simple()));
      fs::create_dir_all(staging.join(CHUNKS_DIR)).await?;
      tracing::debug!("staging write of {id} in {}", staging.display());

      Ok(Box::new(FsBlobWriter {
         store: self.clone(),
         namespace: namespace.clone(),
         id,
         options: options.clone(),
         buffer: Some(ChunkBuffer::new(options.effective_chunk_size())),
         staging: Some(staging),
         next_index: 0,
         in_flight: false,
      }))
   }

   async fn open_read(
      &self,
      namespace: &Namespace,
      id: ResourceId,
      range: Option<ByteRange>,
   ) -> Result<Box<dyn BlobReader>, StoreError> {
      let file = self
         .read_record(namespace, id)
         .await?
         .ok_or(StoreError::NotFound { id })?;
      let range = validate_range(range, file.length)?;
      let (next, end) = chunk_span(range, file.length, file.chunk_size);
      Ok(Box::new(FsBlobReader {
         chunks: self.resource_dir(namespace, id).join(CHUNKS_DIR),
         file,
         range,
         next,
         end,
      }))
   }

   async fn delete(&self, namespace: &Namespace, id: ResourceId) -> Result<bool, StoreError> {
      let dir = self.resource_dir(namespace, id);
      self.retire(namespace, &dir).await
   }

   async fn exists(&self, namespace: &Namespace, id: ResourceId) -> Result<bool, StoreError> {
      let path = self.resource_dir(namespace, id).join(FILE_RECORD);
      Ok(fs::try_exists(&path).await?)
   }

   async fn stat(
      &self,
      namespace: &Namespace,
      id: ResourceId,
   ) -> Result<Option<StoredFile>, StoreError> {
      self.read_record(namespace, id).await
   }
}

struct FsBlobWriter {
   store:      FsBlobStore,
   namespace:  Namespace,
   id:         ResourceId,
   options:    WriteOptions,
   buffer:     Option<ChunkBuffer>,
   /// `None` once published or discarded.
   staging:    Option<PathBuf>,
   next_index: u64,
   /// Set while a `write_chunk` is between hashing its input and landing
   /// the chunk files. Still set afterwards means that call was dropped or
   /// failed partway.
   in_flight:  bool,
}

impl FsBlobWriter {
   fn check_intact(&self) -> Result<(), StoreError> {
      if self.in_flight {
         return Err(StoreError::Interrupted { id: self.id });
      }
      Ok(())
   }

   fn staging(&self) -> Result<&Path, StoreError> {
      self
         .staging
         .as_deref()
         .ok_or_else(|| StoreError::Unavailable("writer already closed".to_string()))
   }

   async fn write_chunks(&mut self, chunks: Vec<Bytes>) -> Result<(), StoreError> {
      let dir = self.staging()?.join(CHUNKS_DIR);
      for chunk in chunks {
         fs::write(dir.join(chunk_name(self.next_index)), &chunk).await?;
         self.next_index += 1;
      }
      Ok(())
   }
}

#[async_trait]
impl BlobWriter for FsBlobWriter {
   async fn write_chunk(&mut self, data: &[u8]) -> Result<(), StoreError> {
      self.check_intact()?;
      let buffer = self
         .buffer
         .as_mut()
         .ok_or_else(|| StoreError::Unavailable("writer already closed".to_string()))?;
      let full = buffer.push(data);
      self.in_flight = true;
      self.write_chunks(full).await?;
      self.in_flight = false;
      Ok(())
   }

   async fn finish(mut self: Box<Self>) -> Result<StoredFile, StoreError> {
      self.check_intact()?;
      let buffer = self
         .buffer
         .take()
         .ok_or_else(|| StoreError::Unavailable("writer already closed".to_string()))?;
      let chunk_size = buffer.chunk_size();
      let (tail, length, sha256) = buffer.finish();
      self.write_chunks(tail.into_iter().collect()).await?;

      let file = StoredFile {
         id: self.id,
         filename: self.options.filename.clone(),
         content_type: self.options.content_type.clone(),
         length,
         chunk_size,
         upload_date: Utc::now(),
         sha256,
         metadata: self.options.metadata.clone(),
      };

      let staging = self.staging()?.to_path_buf();
      let record = serde_json::to_vec_pretty(&file)?;
      fs::write(staging.join(FILE_RECORD), record).await?;
      sync_dir(staging.join(CHUNKS_DIR)).await?;
      sync_dir(staging.clone()).await?;

      let target = self.store.resource_dir(&self.namespace, self.id);
      let files_dir = self.store.files_dir(&self.namespace);
      fs::create_dir_all(&files_dir).await?;
      self.store.retire(&self.namespace, &target).await?;
      fs::rename(&staging, &target).await?;
      sync_dir(files_dir).await?;
      self.staging = None;

      tracing::debug!("published {} ({length} bytes) to {}", self.id, target.display());
      Ok(file)
   }

   async fn abort(mut self: Box<Self>) -> Result<(), StoreError> {
      if let Some(staging) = self.staging.take() {
         fs::remove_dir_all(&staging).await?;
      }
      Ok(())
   }
}

impl Drop for FsBlobWriter {
   fn drop(&mut self) {
      if let Some(staging) = self.staging.take()
         && let Err(e) = stdfs::remove_dir_all(&staging)
      {
         tracing::warn!("failed to discard staging dir {}: {e}", staging.display());
      }
   }
}

struct FsBlobReader {
   chunks: PathBuf,
   file:   StoredFile,
   range:  Option<ByteRange>,
   next:   u64,
   end:    u64,
}

#[async_trait]
impl BlobReader for FsBlobReader {
   fn file(&self) -> &StoredFile {
      &self.file
   }

   async fn next_chunk(&mut self) -> Result<Option<Bytes>, StoreError> {
      if self.next >= self.end {
         return Ok(None);
      }
      let index = self.next;
      self.next += 1;
      let raw = match fs::read(self.chunks.join(chunk_name(index))).await {
         Ok(raw) => raw,
         Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::Corrupt {
               id:     self.file.id,
               reason: format!("missing chunk {index}"),
            });
         },
         Err(e) => return Err(e.into()),
      };
      Ok(Some(slice_chunk(index, Bytes::from(raw), self.file.chunk_size, self.range)))
   }
}
