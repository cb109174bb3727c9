//! Namespace to lease-service binding for one broker.

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::{
   Result,
   error::Error,
   lease::{LeaseBackend, LeaseOptions, LeaseService},
   types::Namespace,
};

/// Lazily binds a broker's namespace to its lease service.
///
/// The first `ensure_binding` creates the binding; concurrent callers wait on
/// that single creation. A failed creation leaves the catalog unbound so the
/// next call retries.
pub struct ResourceCatalog {
   namespace: Namespace,
   backend:   Arc<dyn LeaseBackend>,
   options:   LeaseOptions,
   binding:   OnceCell<Arc<dyn LeaseService>>,
}

impl ResourceCatalog {
   pub fn new(namespace: Namespace, backend: Arc<dyn LeaseBackend>, options: LeaseOptions) -> Self {
      Self { namespace, backend, options, binding: OnceCell::new() }
   }

   pub fn namespace(&self) -> &Namespace {
      &self.namespace
   }

   pub fn is_bound(&self) -> bool {
      self.binding.initialized()
   }

   /// Fails when `requested` names a namespace other than the bound one.
   pub fn check_namespace(&self, requested: Option<&Namespace>) -> Result<()> {
      match requested {
         Some(ns) if *ns != self.namespace => Err(Error::NamespaceMismatch {
            bound:     self.namespace.clone(),
            requested: ns.clone(),
         }),
         _ => Ok(()),
      }
   }

   pub async fn ensure_binding(&self) -> Result<Arc<dyn LeaseService>> {
      let service = self
         .binding
         .get_or_try_init(|| async {
            tracing::debug!("binding lease service for namespace {}", self.namespace);
            self
               .backend
               .bind(&self.namespace, &self.options)
               .await
               .map_err(|source| Error::Binding { namespace: self.namespace.clone(), source })
         })
         .await?;
      Ok(service.clone())
   }
}

impl std::fmt::Debug for ResourceCatalog {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ResourceCatalog")
         .field("namespace", &self.namespace)
         .field("bound", &self.is_bound())
         .finish()
   }
}
