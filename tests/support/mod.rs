#![allow(dead_code)]

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
   },
   time::Duration,
};

use async_trait::async_trait;
use gridlock::{
   Namespace, StreamBroker,
   lease::{
      LeaseBackend, LeaseError, LeaseOptions, LeaseRecord, LeaseRequest, LeaseService,
      MemoryLeaseBackend,
   },
   store::{BlobReader, BlobStore, BlobWriter, MemoryBlobStore, StoreError},
   types::{ByteRange, ResourceId, StoredFile, WriteOptions},
};

/// Counters shared by every lease service a [`CountingLeaseBackend`] binds.
#[derive(Debug, Default)]
pub struct LeaseStats {
   pub binds:        AtomicUsize,
   pub acquires:     AtomicUsize,
   pub renews:       AtomicUsize,
   pub releases:     AtomicUsize,
   pub fail_binds:   AtomicUsize,
   pub fail_release: AtomicBool,
   pub renew_delay:  AtomicU64,
}

impl LeaseStats {
   pub fn binds(&self) -> usize {
      self.binds.load(Ordering::SeqCst)
   }

   pub fn acquires(&self) -> usize {
      self.acquires.load(Ordering::SeqCst)
   }

   pub fn renews(&self) -> usize {
      self.renews.load(Ordering::SeqCst)
   }

   pub fn releases(&self) -> usize {
      self.releases.load(Ordering::SeqCst)
   }
}

/// Wraps the in-memory lease backend and records every call.
pub struct CountingLeaseBackend {
   inner: MemoryLeaseBackend,
   stats: Arc<LeaseStats>,
}

impl CountingLeaseBackend {
   pub fn new() -> (Arc<Self>, Arc<LeaseStats>) {
      let stats = Arc::new(LeaseStats::default());
      (Arc::new(Self { inner: MemoryLeaseBackend::new(), stats: stats.clone() }), stats)
   }
}

#[async_trait]
impl LeaseBackend for CountingLeaseBackend {
   async fn bind(
      &self,
      namespace: &Namespace,
      options: &LeaseOptions,
   ) -> Result<Arc<dyn LeaseService>, LeaseError> {
      self.stats.binds.fetch_add(1, Ordering::SeqCst);
      if self.stats.fail_binds.load(Ordering::SeqCst) > 0 {
         self.stats.fail_binds.fetch_sub(1, Ordering::SeqCst);
         return Err(LeaseError::Unavailable("lock collection unavailable".into()));
      }
      let inner = self.inner.bind(namespace, options).await?;
      Ok(Arc::new(CountingLeaseService { inner, stats: self.stats.clone() }))
   }
}

struct CountingLeaseService {
   inner: Arc<dyn LeaseService>,
   stats: Arc<LeaseStats>,
}

#[async_trait]
impl LeaseService for CountingLeaseService {
   async fn acquire_exclusive(
      &self,
      request: &LeaseRequest,
   ) -> Result<Option<LeaseRecord>, LeaseError> {
      self.stats.acquires.fetch_add(1, Ordering::SeqCst);
      self.inner.acquire_exclusive(request).await
   }

   async fn acquire_shared(&self, request: &LeaseRequest) -> Result<Option<LeaseRecord>, LeaseError> {
      self.stats.acquires.fetch_add(1, Ordering::SeqCst);
      self.inner.acquire_shared(request).await
   }

   async fn renew(&self, lease: &LeaseRecord) -> Result<LeaseRecord, LeaseError> {
      self.stats.renews.fetch_add(1, Ordering::SeqCst);
      let delay = self.stats.renew_delay.load(Ordering::SeqCst);
      if delay > 0 {
         tokio::time::sleep(Duration::from_millis(delay)).await;
      }
      self.inner.renew(lease).await
   }

   async fn release(&self, lease: &LeaseRecord) -> Result<(), LeaseError> {
      self.stats.releases.fetch_add(1, Ordering::SeqCst);
      if self.stats.fail_release.load(Ordering::SeqCst) {
         return Err(LeaseError::Unavailable("release dropped".into()));
      }
      self.inner.release(lease).await
   }
}

/// Knobs for [`FaultyBlobStore`].
#[derive(Debug, Default)]
pub struct StoreFaults {
   pub opens:        AtomicUsize,
   pub fail_open:    AtomicBool,
   pub fail_writes:  AtomicBool,
   /// Milliseconds every `write_chunk` sleeps before completing.
   pub write_delay:  AtomicU64,
   /// Milliseconds every `write_chunk` sleeps after the inner write has
   /// already landed, so cancelling it leaves the data behind.
   pub settle_delay: AtomicU64,
}

/// In-memory store with injectable failures.
#[derive(Clone)]
pub struct FaultyBlobStore {
   pub inner:  MemoryBlobStore,
   pub faults: Arc<StoreFaults>,
}

impl FaultyBlobStore {
   pub fn new() -> Self {
      Self { inner: MemoryBlobStore::new(), faults: Arc::new(StoreFaults::default()) }
   }

   fn opened(&self) -> Result<(), StoreError> {
      self.faults.opens.fetch_add(1, Ordering::SeqCst);
      if self.faults.fail_open.load(Ordering::SeqCst) {
         return Err(StoreError::Unavailable("store offline".into()));
      }
      Ok(())
   }
}

#[async_trait]
impl BlobStore for FaultyBlobStore {
   async fn open_write(
      &self,
      namespace: &Namespace,
      id: ResourceId,
      options: &WriteOptions,
   ) -> Result<Box<dyn BlobWriter>, StoreError> {
      self.opened()?;
      let inner = self.inner.open_write(namespace, id, options).await?;
      Ok(Box::new(FaultyWriter { inner, faults: self.faults.clone() }))
   }

   async fn open_read(
      &self,
      namespace: &Namespace,
      id: ResourceId,
      range: Option<ByteRange>,
   ) -> Result<Box<dyn BlobReader>, StoreError> {
      self.opened()?;
      self.inner.open_read(namespace, id, range).await
   }

   async fn delete(&self, namespace: &Namespace, id: ResourceId) -> Result<bool, StoreError> {
      self.opened()?;
      self.inner.delete(namespace, id).await
   }

   async fn exists(&self, namespace: &Namespace, id: ResourceId) -> Result<bool, StoreError> {
      self.opened()?;
      self.inner.exists(namespace, id).await
   }

   async fn stat(
      &self,
      namespace: &Namespace,
      id: ResourceId,
   ) -> Result<Option<StoredFile>, StoreError> {
      self.opened()?;
      self.inner.stat(namespace, id).await
   }
}

struct FaultyWriter {
   inner:  Box<dyn BlobWriter>,
   faults: Arc<StoreFaults>,
}

#[async_trait]
impl BlobWriter for FaultyWriter {
   async fn write_chunk(&mut self, data: &[u8]) -> Result<(), StoreError> {
      let delay = self.faults.write_delay.load(Ordering::SeqCst);
      if delay > 0 {
         tokio::time::sleep(Duration::from_millis(delay)).await;
      }
      if self.faults.fail_writes.load(Ordering::SeqCst) {
         return Err(StoreError::Unavailable("chunk insert failed".into()));
      }
      self.inner.write_chunk(data).await?;
      let settle = self.faults.settle_delay.load(Ordering::SeqCst);
      if settle > 0 {
         tokio::time::sleep(Duration::from_millis(settle)).await;
      }
      Ok(())
   }

   async fn finish(self: Box<Self>) -> Result<StoredFile, StoreError> {
      self.inner.finish().await
   }

   async fn abort(self: Box<Self>) -> Result<(), StoreError> {
      self.inner.abort().await
   }
}

/// A broker over counting/faulty collaborators.
pub struct Harness {
   pub broker: StreamBroker,
   pub leases: Arc<LeaseStats>,
   pub store:  FaultyBlobStore,
}

impl Harness {
   pub fn new(options: LeaseOptions) -> Self {
      Self::in_namespace(Namespace::default(), options)
   }

   pub fn in_namespace(namespace: Namespace, options: LeaseOptions) -> Self {
      let (backend, leases) = CountingLeaseBackend::new();
      let store = FaultyBlobStore::new();
      let broker = StreamBroker::new(namespace, backend, Arc::new(store.clone()), options);
      Self { broker, leases, store }
   }

   pub fn store_opens(&self) -> usize {
      self.store.faults.opens.load(Ordering::SeqCst)
   }
}

/// Lease options with a 2 s lease and 1 s polling interval.
pub fn short_lease() -> LeaseOptions {
   LeaseOptions::default()
      .with_expiration(Duration::from_secs(2))
      .with_polling_interval(Duration::from_secs(1))
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
   (0..len).map(|i| (i % 251) as u8).collect()
}
