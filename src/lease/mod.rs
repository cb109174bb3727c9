//! Lease service contract and the handle a session owns.
//!
//! A lease service grants time-bounded shared (read) or exclusive (write)
//! leases on resource ids within one namespace. The service alone enforces
//! "one exclusive holder or any number of shared holders"; callers never
//! assume they can bypass it.

pub mod file;
pub mod memory;

use std::{future::Future, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};
use uuid::Uuid;

pub use file::{FileLeaseBackend, FileLeaseService};
pub use memory::{MemoryLeaseBackend, MemoryLeaseService};

use crate::types::{Namespace, ResourceId};

pub const DEFAULT_LEASE_EXPIRATION: Duration = Duration::from_secs(300);
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(5);

/// Errors reported by lease services and lease handles.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
   #[error("lease service unavailable: {0}")]
   Unavailable(String),

   #[error("lease on {resource} has expired")]
   Expired { resource: ResourceId },

   #[error("lease on {resource} is not held by this holder")]
   NotHeld { resource: ResourceId },

   #[error("lease on {resource} was already released")]
   Released { resource: ResourceId },

   #[error("a renewal is already in flight")]
   RenewalInFlight,

   #[error("timed out waiting for lease guard on {resource}")]
   GuardTimeout { resource: ResourceId },

   #[error("io error: {0}")]
   Io(#[from] io::Error),

   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseMode {
   /// Read lease; any number may be held at once.
   Shared,
   /// Write lease; excludes every other holder.
   Exclusive,
}

impl LeaseMode {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Shared => "shared",
         Self::Exclusive => "exclusive",
      }
   }
}

/// Timing knobs for a lease and the session bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseOptions {
   /// Lifetime of a grant or renewal.
   pub expiration:       Duration,
   /// Tick of the expiration timer, and poll interval while waiting on a
   /// busy lease.
   pub polling_interval: Duration,
   /// Remaining time at which `ExpiresSoon` fires; defaults to the polling
   /// interval.
   pub expires_soon:     Option<Duration>,
   /// How long acquisition waits on a busy resource. Zero returns "busy"
   /// immediately.
   pub acquire_timeout:  Duration,
}

impl Default for LeaseOptions {
   fn default() -> Self {
      Self {
         expiration:       DEFAULT_LEASE_EXPIRATION,
         polling_interval: DEFAULT_POLLING_INTERVAL,
         expires_soon:     None,
         acquire_timeout:  Duration::ZERO,
      }
   }
}

impl LeaseOptions {
   pub fn with_expiration(mut self, expiration: Duration) -> Self {
      self.expiration = expiration;
      self
   }

   pub fn with_polling_interval(mut self, polling_interval: Duration) -> Self {
      self.polling_interval = polling_interval;
      self
   }

   pub fn with_expires_soon(mut self, threshold: Duration) -> Self {
      self.expires_soon = Some(threshold);
      self
   }

   pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
      self.acquire_timeout = timeout;
      self
   }

   pub fn warning_threshold(&self) -> Duration {
      self
         .expires_soon
         .unwrap_or(self.polling_interval)
         .min(self.expiration)
   }

   /// Polling interval clamped to something the timer can sleep on.
   pub fn effective_polling_interval(&self) -> Duration {
      self.polling_interval.max(Duration::from_millis(10))
   }
}

/// What a caller asks the lease service for.
#[derive(Debug, Clone)]
pub struct LeaseRequest {
   pub resource:  ResourceId,
   pub namespace: Namespace,
   pub holder:    String,
   pub options:   LeaseOptions,
}

impl LeaseRequest {
   pub fn new(namespace: Namespace, resource: ResourceId, options: LeaseOptions) -> Self {
      Self { resource, namespace, holder: Uuid::new_v4().to_string(), options }
   }
}

/// A granted lease as reported by the lease service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
   pub resource:   ResourceId,
   pub namespace:  Namespace,
   pub holder:     String,
   pub mode:       LeaseMode,
   pub expires_at: DateTime<Utc>,
   pub ttl:        Duration,
   /// Increases with every exclusive grant of the resource.
   pub epoch:      u64,
}

impl LeaseRecord {
   /// Time left before the lease lapses, zero once it has.
   pub fn remaining(&self) -> Duration {
      self
         .expires_at
         .signed_duration_since(Utc::now())
         .to_std()
         .unwrap_or(Duration::ZERO)
   }
}

pub(crate) fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
   let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
   Utc::now()
      .checked_add_signed(ttl)
      .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Per-namespace lease service.
#[async_trait]
pub trait LeaseService: Send + Sync {
   /// Grants an exclusive lease, or `None` when the resource is busy.
   async fn acquire_exclusive(
      &self,
      request: &LeaseRequest,
   ) -> Result<Option<LeaseRecord>, LeaseError>;

   /// Grants a shared lease, or `None` when an exclusive holder exists.
   async fn acquire_shared(&self, request: &LeaseRequest) -> Result<Option<LeaseRecord>, LeaseError>;

   /// Extends a held lease by its ttl.
   async fn renew(&self, lease: &LeaseRecord) -> Result<LeaseRecord, LeaseError>;

   /// Drops a lease. Releasing a lease that is already gone succeeds.
   async fn release(&self, lease: &LeaseRecord) -> Result<(), LeaseError>;
}

/// Creates the lease service for a namespace.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
   async fn bind(
      &self,
      namespace: &Namespace,
      options: &LeaseOptions,
   ) -> Result<Arc<dyn LeaseService>, LeaseError>;
}

/// Retries `attempt` at the polling interval until it grants or
/// `acquire_timeout` runs out.
pub(crate) async fn wait_for_grant<F, Fut>(
   options: &LeaseOptions,
   mut attempt: F,
) -> Result<Option<LeaseRecord>, LeaseError>
where
   F: FnMut() -> Fut,
   Fut: Future<Output = Result<Option<LeaseRecord>, LeaseError>>,
{
   let deadline = Instant::now() + options.acquire_timeout;
   loop {
      if let Some(record) = attempt().await? {
         return Ok(Some(record));
      }
      let now = Instant::now();
      if now >= deadline {
         return Ok(None);
      }
      time::sleep(options.effective_polling_interval().min(deadline - now)).await;
   }
}

/// One acquired lease. Not `Clone`: exactly one owner may renew or release.
pub struct LeaseHandle {
   service:  Arc<dyn LeaseService>,
   record:   LeaseRecord,
   released: bool,
}

impl LeaseHandle {
   pub async fn acquire(
      service: &Arc<dyn LeaseService>,
      mode: LeaseMode,
      request: &LeaseRequest,
   ) -> Result<Option<Self>, LeaseError> {
      let granted = match mode {
         LeaseMode::Exclusive => service.acquire_exclusive(request).await?,
         LeaseMode::Shared => service.acquire_shared(request).await?,
      };
      Ok(granted.map(|record| Self { service: service.clone(), record, released: false }))
   }

   pub fn record(&self) -> &LeaseRecord {
      &self.record
   }

   pub async fn renew(&mut self) -> Result<&LeaseRecord, LeaseError> {
      if self.released {
         return Err(LeaseError::Released { resource: self.record.resource });
      }
      self.record = self.service.renew(&self.record).await?;
      Ok(&self.record)
   }

   /// Issues the release call at most once; later calls are no-ops.
   pub async fn release(&mut self) -> Result<(), LeaseError> {
      if self.released {
         return Ok(());
      }
      self.released = true;
      self.service.release(&self.record).await
   }
}

impl std::fmt::Debug for LeaseHandle {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("LeaseHandle")
         .field("record", &self.record)
         .field("released", &self.released)
         .finish()
   }
}
