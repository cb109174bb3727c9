use std::{
   fmt,
   str::FromStr,
   sync::{
      LazyLock,
      atomic::{AtomicU32, Ordering},
   },
};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
   Result,
   error::{ConfigError, Error},
   lease::LeaseOptions,
};

pub const DEFAULT_NAMESPACE: &str = "fs";

/// GridFS-compatible default chunk size (255 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 261_120;

/// Twelve-byte resource identifier.
///
/// Generated ids are laid out as 4 bytes of big-endian unix seconds, 5 bytes
/// unique to this process and a 3-byte big-endian counter, so ids created in
/// the same process never collide.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId([u8; 12]);

static PROCESS_UNIQUE: LazyLock<[u8; 5]> = LazyLock::new(|| {
   let seed = Uuid::new_v4();
   let mut out = [0u8; 5];
   out.copy_from_slice(&seed.as_bytes()[..5]);
   out
});

static COUNTER: LazyLock<AtomicU32> = LazyLock::new(|| {
   let seed = Uuid::new_v4();
   let b = seed.as_bytes();
   AtomicU32::new(u32::from_be_bytes([0, b[0], b[1], b[2]]))
});

impl ResourceId {
   pub fn generate() -> Self {
      let secs = Utc::now().timestamp() as u32;
      let count = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;

      let mut bytes = [0u8; 12];
      bytes[..4].copy_from_slice(&secs.to_be_bytes());
      bytes[4..9].copy_from_slice(&*PROCESS_UNIQUE);
      bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
      Self(bytes)
   }

   /// Creation time encoded in a generated id.
   pub fn timestamp(&self) -> DateTime<Utc> {
      let secs = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
      Utc
         .timestamp_opt(i64::from(secs), 0)
         .single()
         .unwrap_or_default()
   }
}

impl fmt::Display for ResourceId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&hex::encode(self.0))
   }
}

impl fmt::Debug for ResourceId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "ResourceId({self})")
   }
}

impl FromStr for ResourceId {
   type Err = Error;

   fn from_str(s: &str) -> Result<Self> {
      let mut bytes = [0u8; 12];
      hex::decode_to_slice(s.trim(), &mut bytes)
         .map_err(|_| Error::InvalidIdentifier(s.to_string()))?;
      Ok(Self(bytes))
   }
}

impl TryFrom<String> for ResourceId {
   type Error = Error;

   fn try_from(value: String) -> Result<Self> {
      value.parse()
   }
}

impl From<ResourceId> for String {
   fn from(id: ResourceId) -> Self {
      id.to_string()
   }
}

/// Logical collection of resources sharing one lease service binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
   pub fn new(name: impl Into<String>) -> Result<Self> {
      let name = name.into();
      let valid = !name.is_empty()
         && name != "."
         && name != ".."
         && !name.contains(['/', '\\', '\0']);
      if !valid {
         return Err(ConfigError::InvalidNamespace(name).into());
      }
      Ok(Self(name))
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }
}

impl Default for Namespace {
   fn default() -> Self {
      Self(DEFAULT_NAMESPACE.to_string())
   }
}

impl fmt::Display for Namespace {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

impl FromStr for Namespace {
   type Err = Error;

   fn from_str(s: &str) -> Result<Self> {
      Self::new(s)
   }
}

impl TryFrom<String> for Namespace {
   type Error = Error;

   fn try_from(value: String) -> Result<Self> {
      Self::new(value)
   }
}

impl From<Namespace> for String {
   fn from(ns: Namespace) -> Self {
      ns.0
   }
}

/// Inclusive byte range for ranged reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
   pub start: u64,
   pub end:   u64,
}

impl ByteRange {
   pub const fn new(start: u64, end: u64) -> Self {
      Self { start, end }
   }

   /// Number of bytes covered, zero when `start > end`.
   pub const fn len(&self) -> u64 {
      if self.start > self.end { 0 } else { self.end - self.start + 1 }
   }

   pub const fn is_empty(&self) -> bool {
      self.len() == 0
   }
}

/// Metadata of a stored resource, produced when a write completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFile {
   pub id:           ResourceId,
   pub filename:     Option<String>,
   pub content_type: Option<String>,
   pub length:       u64,
   pub chunk_size:   usize,
   pub upload_date:  DateTime<Utc>,
   pub sha256:       String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub metadata:     Option<serde_json::Value>,
}

/// Store-specific settings for a new write stream.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
   pub filename:     Option<String>,
   pub content_type: Option<String>,
   pub metadata:     Option<serde_json::Value>,
   pub chunk_size:   Option<usize>,
}

impl WriteOptions {
   pub fn effective_chunk_size(&self) -> usize {
      self.chunk_size.filter(|&n| n > 0).unwrap_or(DEFAULT_CHUNK_SIZE)
   }
}

/// Request to open a write session.
#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
   /// Generated when absent.
   pub id:        Option<ResourceId>,
   pub namespace: Option<Namespace>,
   pub options:   WriteOptions,
   /// Overrides the broker's lease options for this session.
   pub lease:     Option<LeaseOptions>,
}

impl WriteRequest {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn id(mut self, id: ResourceId) -> Self {
      self.id = Some(id);
      self
   }

   pub fn namespace(mut self, namespace: Namespace) -> Self {
      self.namespace = Some(namespace);
      self
   }

   pub fn filename(mut self, filename: impl Into<String>) -> Self {
      self.options.filename = Some(filename.into());
      self
   }

   pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
      self.options.content_type = Some(content_type.into());
      self
   }

   pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
      self.options.metadata = Some(metadata);
      self
   }

   pub fn chunk_size(mut self, chunk_size: usize) -> Self {
      self.options.chunk_size = Some(chunk_size);
      self
   }

   pub fn lease(mut self, lease: LeaseOptions) -> Self {
      self.lease = Some(lease);
      self
   }
}

/// Request to open a read session.
#[derive(Debug, Clone, Default)]
pub struct ReadRequest {
   pub id:        Option<ResourceId>,
   pub namespace: Option<Namespace>,
   pub range:     Option<ByteRange>,
   pub lease:     Option<LeaseOptions>,
}

impl ReadRequest {
   pub fn for_id(id: ResourceId) -> Self {
      Self { id: Some(id), ..Self::default() }
   }

   pub fn namespace(mut self, namespace: Namespace) -> Self {
      self.namespace = Some(namespace);
      self
   }

   pub fn range(mut self, start: u64, end: u64) -> Self {
      self.range = Some(ByteRange::new(start, end));
      self
   }

   pub fn lease(mut self, lease: LeaseOptions) -> Self {
      self.lease = Some(lease);
      self
   }
}

/// Request to delete a resource under an exclusive lease.
#[derive(Debug, Clone, Default)]
pub struct RemoveRequest {
   pub id:        Option<ResourceId>,
   pub namespace: Option<Namespace>,
   pub lease:     Option<LeaseOptions>,
}

impl RemoveRequest {
   pub fn for_id(id: ResourceId) -> Self {
      Self { id: Some(id), ..Self::default() }
   }

   pub fn namespace(mut self, namespace: Namespace) -> Self {
      self.namespace = Some(namespace);
      self
   }
}

/// Request for lease-free metadata lookups (`exists`, `stat`).
#[derive(Debug, Clone, Default)]
pub struct ExistsRequest {
   pub id:        Option<ResourceId>,
   pub namespace: Option<Namespace>,
}

impl ExistsRequest {
   pub fn for_id(id: ResourceId) -> Self {
      Self { id: Some(id), ..Self::default() }
   }

   pub fn namespace(mut self, namespace: Namespace) -> Self {
      self.namespace = Some(namespace);
      self
   }
}

/// Outcome of [`crate::StreamBroker::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
   Removed,
   NotFound,
   /// Another holder owns a lease on the resource.
   Busy,
}

#[cfg(test)]
mod tests {
   use std::collections::HashSet;

   use super::*;

   #[test]
   fn generated_ids_are_unique() {
      let ids: HashSet<ResourceId> = (0..10_000).map(|_| ResourceId::generate()).collect();
      assert_eq!(ids.len(), 10_000);
   }

   #[test]
   fn id_parses_its_display_form() {
      let id = ResourceId::generate();
      let parsed: ResourceId = id.to_string().parse().unwrap();
      assert_eq!(parsed, id);
      assert_eq!(id.to_string().len(), 24);
   }

   #[test]
   fn id_rejects_garbage() {
      assert!(matches!("logo.png".parse::<ResourceId>(), Err(Error::InvalidIdentifier(_))));
      assert!("abcd".parse::<ResourceId>().is_err());
   }

   #[test]
   fn id_timestamp_is_recent() {
      let id = ResourceId::generate();
      let age = Utc::now().signed_duration_since(id.timestamp());
      assert!(age.num_seconds() < 5);
   }

   #[test]
   fn namespace_rejects_paths() {
      assert!(Namespace::new("").is_err());
      assert!(Namespace::new("a/b").is_err());
      assert!(Namespace::new("..").is_err());
      assert_eq!(Namespace::new("photos").unwrap().as_str(), "photos");
      assert_eq!(Namespace::default().as_str(), DEFAULT_NAMESPACE);
   }

   #[test]
   fn inclusive_range_length() {
      assert_eq!(ByteRange::new(1000, 10_000).len(), 9001);
      assert_eq!(ByteRange::new(5, 5).len(), 1);
      assert!(ByteRange::new(6, 5).is_empty());
   }
}
