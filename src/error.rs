use std::io;

use thiserror::Error;

use crate::{
   lease::LeaseError,
   session::TerminationReason,
   store::StoreError,
   types::{Namespace, ResourceId},
};

/// Main error type for gridlock.
///
/// Configuration errors (`NamespaceMismatch`, `MissingIdentifier`,
/// `InvalidIdentifier`) are raised before any collaborator is contacted.
/// Collaborator failures are wrapped without translation.
#[derive(Debug, Error)]
pub enum Error {
   /// I/O error occurred outside of a collaborator call.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// JSON serialization or deserialization error occurred.
   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),

   /// Configuration-related error occurred.
   #[error("config error: {0}")]
   Config(#[from] ConfigError),

   /// A request named a namespace other than the one the broker is bound to.
   #[error("namespace of a broker cannot be changed: {requested} !== {bound}")]
   NamespaceMismatch { bound: Namespace, requested: Namespace },

   /// Read, remove and existence checks need an explicit identifier.
   #[error("no identifier provided for {op}; filenames are not unique")]
   MissingIdentifier { op: &'static str },

   /// The identifier could not be parsed.
   #[error("invalid resource identifier: {0}")]
   InvalidIdentifier(String),

   /// The lease service for a namespace could not be initialized.
   #[error("failed to bind lease service for namespace {namespace}: {source}")]
   Binding {
      namespace: Namespace,
      #[source]
      source:    LeaseError,
   },

   /// Lease acquisition failed for a reason other than contention.
   #[error("lease acquisition failed for {id}: {source}")]
   LeaseAcquisition {
      id:     ResourceId,
      #[source]
      source: LeaseError,
   },

   /// Renewing a session's lease failed.
   #[error("lease renewal failed: {0}")]
   Renewal(#[source] LeaseError),

   /// Error occurred in the blob store.
   #[error("store error: {0}")]
   Store(#[from] StoreError),

   /// The session already reached a terminal state.
   #[error("session terminated: {reason}")]
   SessionTerminated { reason: TerminationReason },

   /// Error already reported to the user.
   #[error("{message}")]
   Reported { message: String, exit_code: i32 },
}

impl Error {
   pub fn exit_code(&self) -> i32 {
      match self {
         Self::Reported { exit_code, .. } => *exit_code,
         Self::NamespaceMismatch { .. }
         | Self::MissingIdentifier { .. }
         | Self::InvalidIdentifier(_)
         | Self::Config(_) => 2,
         Self::SessionTerminated { reason: TerminationReason::Expired } => 11,
         Self::Store(StoreError::NotFound { .. }) => 4,
         _ => 1,
      }
   }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
   /// Configuration value is out of range.
   #[error("invalid config: {0}")]
   Invalid(String),

   /// Namespace names must be non-empty and free of path separators.
   #[error("invalid namespace {0:?}")]
   InvalidNamespace(String),
}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
