//! Public entry point: opens lease-guarded streams on one namespace.

use std::sync::Arc;

use crate::{
   Result,
   catalog::ResourceCatalog,
   error::Error,
   lease::{LeaseBackend, LeaseHandle, LeaseMode, LeaseOptions, LeaseRequest},
   session::{ReadSession, WriteSession},
   store::BlobStore,
   types::{
      ExistsRequest, Namespace, ReadRequest, RemoveOutcome, RemoveRequest, ResourceId,
      StoredFile, WriteRequest,
   },
};

/// Hands out read and write sessions for resources in a single namespace.
///
/// Busy resources are reported as `Ok(None)` (or [`RemoveOutcome::Busy`]),
/// never as errors. The broker never retries acquisition on its own.
pub struct StreamBroker {
   catalog: ResourceCatalog,
   store:   Arc<dyn BlobStore>,
   options: LeaseOptions,
}

impl StreamBroker {
   pub fn new(
      namespace: Namespace,
      lease_backend: Arc<dyn LeaseBackend>,
      store: Arc<dyn BlobStore>,
      options: LeaseOptions,
   ) -> Self {
      Self { catalog: ResourceCatalog::new(namespace, lease_backend, options), store, options }
   }

   pub fn catalog(&self) -> &ResourceCatalog {
      &self.catalog
   }

   pub fn namespace(&self) -> &Namespace {
      self.catalog.namespace()
   }

   /// Opens an exclusive write session, generating an id when none is given.
   pub async fn open_for_write(&self, request: WriteRequest) -> Result<Option<WriteSession>> {
      self.catalog.check_namespace(request.namespace.as_ref())?;
      let id = request.id.unwrap_or_else(ResourceId::generate);
      let options = request.lease.unwrap_or(self.options);

      let Some(mut lease) = self.acquire(id, LeaseMode::Exclusive, options).await? else {
         tracing::debug!("write lease on {id} is busy");
         return Ok(None);
      };

      match self.store.open_write(self.namespace(), id, &request.options).await {
         Ok(writer) => Ok(Some(WriteSession::open(lease, writer, options))),
         Err(e) => {
            release_after_failure(&mut lease).await;
            Err(e.into())
         },
      }
   }

   /// Opens a shared read session on an existing resource.
   pub async fn open_for_read(&self, request: ReadRequest) -> Result<Option<ReadSession>> {
      let id = request.id.ok_or(Error::MissingIdentifier { op: "read" })?;
      self.catalog.check_namespace(request.namespace.as_ref())?;
      let options = request.lease.unwrap_or(self.options);

      let Some(mut lease) = self.acquire(id, LeaseMode::Shared, options).await? else {
         tracing::debug!("read lease on {id} is busy");
         return Ok(None);
      };

      match self.store.open_read(self.namespace(), id, request.range).await {
         Ok(reader) => Ok(Some(ReadSession::open(lease, reader, options))),
         Err(e) => {
            release_after_failure(&mut lease).await;
            Err(e.into())
         },
      }
   }

   /// Deletes a resource under an exclusive lease.
   pub async fn remove(&self, request: RemoveRequest) -> Result<RemoveOutcome> {
      let id = request.id.ok_or(Error::MissingIdentifier { op: "remove" })?;
      self.catalog.check_namespace(request.namespace.as_ref())?;
      let options = request.lease.unwrap_or(self.options);

      let Some(mut lease) = self.acquire(id, LeaseMode::Exclusive, options).await? else {
         return Ok(RemoveOutcome::Busy);
      };

      let deleted = self.store.delete(self.namespace(), id).await;
      if let Err(e) = lease.release().await {
         tracing::warn!("failed to release lease on {id} after remove: {e}");
      }
      Ok(if deleted? { RemoveOutcome::Removed } else { RemoveOutcome::NotFound })
   }

   /// Existence check without a lease.
   pub async fn exists(&self, request: ExistsRequest) -> Result<bool> {
      let id = request.id.ok_or(Error::MissingIdentifier { op: "exists" })?;
      self.catalog.check_namespace(request.namespace.as_ref())?;
      Ok(self.store.exists(self.namespace(), id).await?)
   }

   /// Stored-file record without a lease.
   pub async fn stat(&self, request: ExistsRequest) -> Result<Option<StoredFile>> {
      let id = request.id.ok_or(Error::MissingIdentifier { op: "stat" })?;
      self.catalog.check_namespace(request.namespace.as_ref())?;
      Ok(self.store.stat(self.namespace(), id).await?)
   }

   async fn acquire(
      &self,
      id: ResourceId,
      mode: LeaseMode,
      options: LeaseOptions,
   ) -> Result<Option<LeaseHandle>> {
      let service = self.catalog.ensure_binding().await?;
      let request = LeaseRequest::new(self.namespace().clone(), id, options);
      LeaseHandle::acquire(&service, mode, &request)
         .await
         .map_err(|source| Error::LeaseAcquisition { id, source })
   }
}

async fn release_after_failure(lease: &mut LeaseHandle) {
   if let Err(e) = lease.release().await {
      tracing::warn!("failed to release lease on {}: {e}", lease.record().resource);
   }
}

impl std::fmt::Debug for StreamBroker {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("StreamBroker")
         .field("catalog", &self.catalog)
         .field("options", &self.options)
         .finish()
   }
}
