//! Process-local lease service.
//!
//! Deadlines are tracked on the tokio clock so paused-time tests see leases
//! lapse exactly when the runtime clock says they do. An entry lives only
//! while someone holds the resource; epochs come from a namespace-wide
//! counter, so they keep increasing across entries for the same resource.

use std::{
   collections::HashMap,
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{
   LeaseBackend, LeaseError, LeaseMode, LeaseOptions, LeaseRecord, LeaseRequest, LeaseService,
   expiry_from_now, wait_for_grant,
};
use crate::types::{Namespace, ResourceId};

#[derive(Debug, Clone)]
struct Grant {
   holder:   String,
   deadline: Instant,
}

#[derive(Debug, Default)]
struct Entry {
   writer:  Option<Grant>,
   readers: Vec<Grant>,
}

impl Entry {
   fn prune(&mut self, now: Instant) {
      if self.writer.as_ref().is_some_and(|w| w.deadline <= now) {
         self.writer = None;
      }
      self.readers.retain(|r| r.deadline > now);
   }

   fn is_free(&self) -> bool {
      self.writer.is_none() && self.readers.is_empty()
   }
}

/// In-memory lease table for one namespace.
#[derive(Debug)]
pub struct MemoryLeaseService {
   namespace: Namespace,
   table:     Mutex<HashMap<ResourceId, Entry>>,
   epoch:     AtomicU64,
}

impl MemoryLeaseService {
   pub fn new(namespace: Namespace) -> Self {
      Self { namespace, table: Mutex::new(HashMap::new()), epoch: AtomicU64::new(0) }
   }

   /// Number of live holders on a resource (writer counts as one).
   pub fn holders(&self, resource: &ResourceId) -> usize {
      let now = Instant::now();
      let mut table = self.table.lock();
      let Some(entry) = table.get_mut(resource) else {
         return 0;
      };
      entry.prune(now);
      let held = entry.readers.len() + usize::from(entry.writer.is_some());
      if held == 0 {
         table.remove(resource);
      }
      held
   }

   fn try_grant(&self, request: &LeaseRequest, mode: LeaseMode) -> Option<LeaseRecord> {
      let now = Instant::now();
      let ttl = request.options.expiration;
      let mut table = self.table.lock();
      let entry = table.entry(request.resource).or_default();
      entry.prune(now);

      let grant = Grant { holder: request.holder.clone(), deadline: now + ttl };
      let epoch = match mode {
         LeaseMode::Exclusive => {
            if !entry.is_free() {
               return None;
            }
            entry.writer = Some(grant);
            self.epoch.fetch_add(1, Ordering::Relaxed) + 1
         },
         LeaseMode::Shared => {
            if entry.writer.is_some() {
               return None;
            }
            entry.readers.push(grant);
            self.epoch.load(Ordering::Relaxed)
         },
      };

      Some(LeaseRecord {
         resource: request.resource,
         namespace: self.namespace.clone(),
         holder: request.holder.clone(),
         mode,
         expires_at: expiry_from_now(ttl),
         ttl,
         epoch,
      })
   }
}

fn find_grant<'a>(entry: &'a mut Entry, lease: &LeaseRecord) -> Option<&'a mut Grant> {
   match lease.mode {
      LeaseMode::Exclusive => entry.writer.as_mut().filter(|w| w.holder == lease.holder),
      LeaseMode::Shared => entry.readers.iter_mut().find(|r| r.holder == lease.holder),
   }
}

#[async_trait]
impl LeaseService for MemoryLeaseService {
   async fn acquire_exclusive(
      &self,
      request: &LeaseRequest,
   ) -> Result<Option<LeaseRecord>, LeaseError> {
      wait_for_grant(&request.options, || {
         let granted = self.try_grant(request, LeaseMode::Exclusive);
         async move { Ok(granted) }
      })
      .await
   }

   async fn acquire_shared(&self, request: &LeaseRequest) -> Result<Option<LeaseRecord>, LeaseError> {
      wait_for_grant(&request.options, || {
         let granted = self.try_grant(request, LeaseMode::Shared);
         async move { Ok(granted) }
      })
      .await
   }

   async fn renew(&self, lease: &LeaseRecord) -> Result<LeaseRecord, LeaseError> {
      let now = Instant::now();
      let mut table = self.table.lock();
      let entry = table
         .get_mut(&lease.resource)
         .ok_or(LeaseError::NotHeld { resource: lease.resource })?;
      let grant = find_grant(entry, lease).ok_or(LeaseError::NotHeld { resource: lease.resource })?;
      if grant.deadline <= now {
         entry.prune(now);
         if entry.is_free() {
            table.remove(&lease.resource);
         }
         return Err(LeaseError::Expired { resource: lease.resource });
      }
      grant.deadline = now + lease.ttl;

      let mut renewed = lease.clone();
      renewed.expires_at = expiry_from_now(lease.ttl);
      Ok(renewed)
   }

   /// Drops the grant, and the whole entry once nobody holds the resource.
   async fn release(&self, lease: &LeaseRecord) -> Result<(), LeaseError> {
      let mut table = self.table.lock();
      let Some(entry) = table.get_mut(&lease.resource) else {
         return Ok(());
      };
      match lease.mode {
         LeaseMode::Exclusive => {
            if entry.writer.as_ref().is_some_and(|w| w.holder == lease.holder) {
               entry.writer = None;
            }
         },
         LeaseMode::Shared => entry.readers.retain(|r| r.holder != lease.holder),
      }
      entry.prune(Instant::now());
      if entry.is_free() {
         table.remove(&lease.resource);
      }
      Ok(())
   }
}

/// Hands out one [`MemoryLeaseService`] per namespace. Brokers built on the
/// same backend share lease tables.
#[derive(Debug, Default)]
pub struct MemoryLeaseBackend {
   services: Mutex<HashMap<Namespace, Arc<MemoryLeaseService>>>,
}

impl MemoryLeaseBackend {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn service(&self, namespace: &Namespace) -> Option<Arc<MemoryLeaseService>> {
      self.services.lock().get(namespace).cloned()
   }
}

#[async_trait]
impl LeaseBackend for MemoryLeaseBackend {
   async fn bind(
      &self,
      namespace: &Namespace,
      _options: &LeaseOptions,
   ) -> Result<Arc<dyn LeaseService>, LeaseError> {
      let service = self
         .services
         .lock()
         .entry(namespace.clone())
         .or_insert_with(|| Arc::new(MemoryLeaseService::new(namespace.clone())))
         .clone();
      Ok(service)
   }
}
