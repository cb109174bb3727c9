//! File-backed lease service (one JSON record per resource).
//!
//! Records live under `<root>/<namespace>/locks/<id>.json`. Every
//! read-modify-write happens under an OS lock on `<id>.guard`, so processes
//! sharing the directory agree on who holds what. That work is synchronous
//! file I/O and runs on the blocking pool.
//!
//! Both files outlive the leases they describe. The record carries the
//! epoch, so dropping it would let the next exclusive grant reuse an epoch
//! an earlier writer already saw. The guard cannot be unlinked while
//! another process may have it open: that process would go on locking an
//! orphaned inode while a newcomer locks a fresh file at the same path.

use std::{
   fs::{self, File, OpenOptions},
   io,
   path::{Path, PathBuf},
   sync::Arc,
   thread,
   time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs4::FileExt;
use serde::{Deserialize, Serialize};

use super::{
   LeaseBackend, LeaseError, LeaseMode, LeaseOptions, LeaseRecord, LeaseRequest, LeaseService,
   expiry_from_now, wait_for_grant,
};
use crate::{
   types::{Namespace, ResourceId},
   util::{check_dir_writable, fsync_dir},
};

pub const LEASE_SCHEMA_VERSION: u32 = 1;

const GUARD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HolderEntry {
   pub holder_id:   String,
   pub pid:         u32,
   pub hostname:    String,
   pub acquired_at: DateTime<Utc>,
   pub expires_at:  DateTime<Utc>,
}

impl HolderEntry {
   fn new(holder_id: String, expires_at: DateTime<Utc>) -> Self {
      Self {
         holder_id,
         pid: std::process::id(),
         hostname: hostname(),
         acquired_at: Utc::now(),
         expires_at,
      }
   }

   fn is_live(&self, now: DateTime<Utc>) -> bool {
      self.expires_at > now
   }
}

/// On-disk lease state of one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseFileRecord {
   pub schema_version: u32,
   pub resource:       ResourceId,
   pub epoch:          u64,
   pub writer:         Option<HolderEntry>,
   #[serde(default)]
   pub readers:        Vec<HolderEntry>,
}

impl LeaseFileRecord {
   fn empty(resource: ResourceId) -> Self {
      Self {
         schema_version: LEASE_SCHEMA_VERSION,
         resource,
         epoch: 0,
         writer: None,
         readers: Vec::new(),
      }
   }

   fn prune(&mut self, now: DateTime<Utc>) {
      if self.writer.as_ref().is_some_and(|w| !w.is_live(now)) {
         self.writer = None;
      }
      self.readers.retain(|r| r.is_live(now));
   }

   fn holder_mut(&mut self, mode: LeaseMode, holder: &str) -> Option<&mut HolderEntry> {
      match mode {
         LeaseMode::Exclusive => self.writer.as_mut().filter(|w| w.holder_id == holder),
         LeaseMode::Shared => self.readers.iter_mut().find(|r| r.holder_id == holder),
      }
   }
}

/// Lease service for one namespace directory.
#[derive(Debug, Clone)]
pub struct FileLeaseService {
   namespace: Namespace,
   lock_dir:  PathBuf,
}

impl FileLeaseService {
   fn record_path(&self, resource: &ResourceId) -> PathBuf {
      self.lock_dir.join(format!("{resource}.json"))
   }

   fn guard_path(&self, resource: &ResourceId) -> PathBuf {
      self.lock_dir.join(format!("{resource}.guard"))
   }

   /// Reads the current record, if the resource was ever leased.
   fn read_record(&self, resource: &ResourceId) -> Result<Option<LeaseFileRecord>, LeaseError> {
      match fs::read_to_string(self.record_path(resource)) {
         Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
         Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
         Err(e) => Err(e.into()),
      }
   }

   /// Runs `op` on the blocking pool while holding the resource's guard.
   async fn guarded<T, F>(&self, resource: ResourceId, op: F) -> Result<T, LeaseError>
   where
      T: Send + 'static,
      F: FnOnce(&Self) -> Result<T, LeaseError> + Send + 'static,
   {
      let service = self.clone();
      tokio::task::spawn_blocking(move || {
         let _guard = LeaseGuard::acquire(&service.guard_path(&resource), resource)?;
         op(&service)
      })
      .await
      .map_err(|e| LeaseError::Unavailable(format!("lease task failed: {e}")))?
   }

   fn try_grant(
      &self,
      request: &LeaseRequest,
      mode: LeaseMode,
   ) -> Result<Option<LeaseRecord>, LeaseError> {
      let ttl = request.options.expiration;
      let now = Utc::now();
      let mut record = self
         .read_record(&request.resource)?
         .unwrap_or_else(|| LeaseFileRecord::empty(request.resource));
      record.prune(now);

      let expires_at = expiry_from_now(ttl);
      let entry = HolderEntry::new(request.holder.clone(), expires_at);
      match mode {
         LeaseMode::Exclusive => {
            if record.writer.is_some() || !record.readers.is_empty() {
               return Ok(None);
            }
            record.epoch += 1;
            record.writer = Some(entry);
         },
         LeaseMode::Shared => {
            if record.writer.is_some() {
               return Ok(None);
            }
            record.readers.push(entry);
         },
      }
      write_record_atomic(&self.record_path(&request.resource), &record)?;

      Ok(Some(LeaseRecord {
         resource: request.resource,
         namespace: self.namespace.clone(),
         holder: request.holder.clone(),
         mode,
         expires_at,
         ttl,
         epoch: record.epoch,
      }))
   }

   async fn acquire(
      &self,
      request: &LeaseRequest,
      mode: LeaseMode,
   ) -> Result<Option<LeaseRecord>, LeaseError> {
      wait_for_grant(&request.options, || {
         let request = request.clone();
         self.guarded(request.resource, move |svc| svc.try_grant(&request, mode))
      })
      .await
   }

   fn renew_record(&self, lease: &LeaseRecord) -> Result<LeaseRecord, LeaseError> {
      let not_held = || LeaseError::NotHeld { resource: lease.resource };

      let mut record = self.read_record(&lease.resource)?.ok_or_else(not_held)?;
      let now = Utc::now();
      let holder = record
         .holder_mut(lease.mode, &lease.holder)
         .ok_or_else(not_held)?;
      if !holder.is_live(now) {
         return Err(LeaseError::Expired { resource: lease.resource });
      }
      let expires_at = expiry_from_now(lease.ttl);
      holder.expires_at = expires_at;
      write_record_atomic(&self.record_path(&lease.resource), &record)?;

      let mut renewed = lease.clone();
      renewed.expires_at = expires_at;
      Ok(renewed)
   }

   /// Drops the holder from the record. The record itself stays, see the
   /// module docs.
   fn release_record(&self, lease: &LeaseRecord) -> Result<(), LeaseError> {
      let Some(mut record) = self.read_record(&lease.resource)? else {
         return Ok(());
      };
      let before = (record.writer.is_some(), record.readers.len());
      match lease.mode {
         LeaseMode::Exclusive => {
            if record
               .writer
               .as_ref()
               .is_some_and(|w| w.holder_id == lease.holder)
            {
               record.writer = None;
            }
         },
         LeaseMode::Shared => record.readers.retain(|r| r.holder_id != lease.holder),
      }
      if before != (record.writer.is_some(), record.readers.len()) {
         write_record_atomic(&self.record_path(&lease.resource), &record)?;
      }
      Ok(())
   }
}

#[async_trait]
impl LeaseService for FileLeaseService {
   async fn acquire_exclusive(
      &self,
      request: &LeaseRequest,
   ) -> Result<Option<LeaseRecord>, LeaseError> {
      self.acquire(request, LeaseMode::Exclusive).await
   }

   async fn acquire_shared(&self, request: &LeaseRequest) -> Result<Option<LeaseRecord>, LeaseError> {
      self.acquire(request, LeaseMode::Shared).await
   }

   async fn renew(&self, lease: &LeaseRecord) -> Result<LeaseRecord, LeaseError> {
      let lease = lease.clone();
      self.guarded(lease.resource, move |svc| svc.renew_record(&lease)).await
   }

   async fn release(&self, lease: &LeaseRecord) -> Result<(), LeaseError> {
      let lease = lease.clone();
      self.guarded(lease.resource, move |svc| svc.release_record(&lease)).await
   }
}

/// Creates `<root>/<namespace>/locks` on bind.
#[derive(Debug, Clone)]
pub struct FileLeaseBackend {
   root: PathBuf,
}

impl FileLeaseBackend {
   pub fn new(root: impl Into<PathBuf>) -> Self {
      Self { root: root.into() }
   }

   pub fn lock_dir(&self, namespace: &Namespace) -> PathBuf {
      self.root.join(namespace.as_str()).join("locks")
   }
}

#[async_trait]
impl LeaseBackend for FileLeaseBackend {
   async fn bind(
      &self,
      namespace: &Namespace,
      _options: &LeaseOptions,
   ) -> Result<Arc<dyn LeaseService>, LeaseError> {
      let lock_dir = self.lock_dir(namespace);
      let dir = lock_dir.clone();
      tokio::task::spawn_blocking(move || {
         fs::create_dir_all(&dir)?;
         check_dir_writable(&dir)
      })
      .await
      .map_err(|e| LeaseError::Unavailable(format!("lease task failed: {e}")))??;
      tracing::debug!("bound file lease service at {}", lock_dir.display());
      Ok(Arc::new(FileLeaseService { namespace: namespace.clone(), lock_dir }))
   }
}

fn write_record_atomic(path: &Path, record: &LeaseFileRecord) -> Result<(), LeaseError> {
   if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
   }
   let tmp_path = path.with_extension("json.tmp");
   let data = serde_json::to_string_pretty(record)?;
   fs::write(&tmp_path, data)?;
   fs::rename(&tmp_path, path)?;
   if let Some(parent) = path.parent() {
      fsync_dir(parent)?;
   }
   Ok(())
}

/// Exclusive OS lock on a per-resource guard file. The kernel drops the lock
/// if the process dies, so no stale-guard detection is needed.
struct LeaseGuard {
   file: File,
}

impl LeaseGuard {
   fn acquire(path: &Path, resource: ResourceId) -> Result<Self, LeaseError> {
      let file = OpenOptions::new()
         .create(true)
         .read(true)
         .write(true)
         .truncate(false)
         .open(path)?;

      let start = Instant::now();
      loop {
         match file.try_lock_exclusive() {
            Ok(()) => return Ok(Self { file }),
            Err(e) => {
               if start.elapsed() >= GUARD_TIMEOUT {
                  tracing::warn!("lease guard {} still contended: {e}", path.display());
                  return Err(LeaseError::GuardTimeout { resource });
               }
               thread::sleep(Duration::from_millis(25));
            },
         }
      }
   }
}

impl Drop for LeaseGuard {
   fn drop(&mut self) {
      let _ = FileExt::unlock(&self.file);
   }
}

fn hostname() -> String {
   std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use super::*;

   async fn service(dir: &TempDir) -> Arc<dyn LeaseService> {
      FileLeaseBackend::new(dir.path())
         .bind(&Namespace::default(), &LeaseOptions::default())
         .await
         .unwrap()
   }

   fn request(id: ResourceId, ttl: Duration) -> LeaseRequest {
      LeaseRequest::new(Namespace::default(), id, LeaseOptions::default().with_expiration(ttl))
   }

   #[tokio::test]
   async fn bind_creates_lock_dir() {
      let dir = TempDir::new().unwrap();
      let _svc = service(&dir).await;
      assert!(dir.path().join("fs").join("locks").is_dir());
   }

   #[tokio::test]
   async fn exclusive_and_shared_conflict_on_disk() {
      let dir = TempDir::new().unwrap();
      let svc = service(&dir).await;
      let id = ResourceId::generate();
      let ttl = Duration::from_secs(30);

      let w = svc.acquire_exclusive(&request(id, ttl)).await.unwrap().unwrap();
      assert_eq!(w.epoch, 1);
      assert!(svc.acquire_shared(&request(id, ttl)).await.unwrap().is_none());

      svc.release(&w).await.unwrap();
      let r1 = svc.acquire_shared(&request(id, ttl)).await.unwrap().unwrap();
      let _r2 = svc.acquire_shared(&request(id, ttl)).await.unwrap().unwrap();
      assert!(svc.acquire_exclusive(&request(id, ttl)).await.unwrap().is_none());

      svc.release(&r1).await.unwrap();
      svc.release(&r1).await.unwrap();
   }

   #[tokio::test]
   async fn record_is_json_with_schema_version() {
      let dir = TempDir::new().unwrap();
      let backend = FileLeaseBackend::new(dir.path());
      let svc = backend
         .bind(&Namespace::default(), &LeaseOptions::default())
         .await
         .unwrap();
      let id = ResourceId::generate();
      svc.acquire_exclusive(&request(id, Duration::from_secs(30)))
         .await
         .unwrap()
         .unwrap();

      let path = backend.lock_dir(&Namespace::default()).join(format!("{id}.json"));
      let record: LeaseFileRecord =
         serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
      assert_eq!(record.schema_version, LEASE_SCHEMA_VERSION);
      assert_eq!(record.resource, id);
      assert_eq!(record.writer.unwrap().pid, std::process::id());
   }

   #[tokio::test]
   async fn renew_fails_after_steal() {
      let dir = TempDir::new().unwrap();
      let backend = FileLeaseBackend::new(dir.path());
      let svc = backend
         .bind(&Namespace::default(), &LeaseOptions::default())
         .await
         .unwrap();
      let id = ResourceId::generate();
      let w = svc
         .acquire_exclusive(&request(id, Duration::from_secs(30)))
         .await
         .unwrap()
         .unwrap();

      let path = backend.lock_dir(&Namespace::default()).join(format!("{id}.json"));
      let mut record: LeaseFileRecord =
         serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
      record.writer.as_mut().unwrap().holder_id = "stolen-writer".to_string();
      fs::write(&path, serde_json::to_string_pretty(&record).unwrap()).unwrap();

      let err = svc.renew(&w).await.unwrap_err();
      assert!(matches!(err, LeaseError::NotHeld { .. }));
   }

   #[tokio::test]
   async fn release_keeps_record_and_epoch() {
      let dir = TempDir::new().unwrap();
      let backend = FileLeaseBackend::new(dir.path());
      let svc = backend
         .bind(&Namespace::default(), &LeaseOptions::default())
         .await
         .unwrap();
      let id = ResourceId::generate();
      let ttl = Duration::from_secs(30);

      let first = svc.acquire_exclusive(&request(id, ttl)).await.unwrap().unwrap();
      svc.release(&first).await.unwrap();

      let path = backend.lock_dir(&Namespace::default()).join(format!("{id}.json"));
      let record: LeaseFileRecord =
         serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
      assert!(record.writer.is_none() && record.readers.is_empty());
      assert_eq!(record.epoch, 1);

      let second = svc.acquire_exclusive(&request(id, ttl)).await.unwrap().unwrap();
      assert_eq!(second.epoch, 2);
   }

   #[tokio::test]
   async fn lapsed_writer_is_pruned() {
      let dir = TempDir::new().unwrap();
      let svc = service(&dir).await;
      let id = ResourceId::generate();
      let w = svc
         .acquire_exclusive(&request(id, Duration::from_millis(20)))
         .await
         .unwrap()
         .unwrap();
      tokio::time::sleep(Duration::from_millis(40)).await;

      assert!(matches!(svc.renew(&w).await, Err(LeaseError::Expired { .. })));
      let next = svc
         .acquire_exclusive(&request(id, Duration::from_secs(5)))
         .await
         .unwrap()
         .unwrap();
      assert_eq!(next.epoch, 2);
   }
}
