//! Lease-guarded read and write streams over a shared chunked blob store.
//!
//! A [`StreamBroker`] acquires a lease from a [`lease::LeaseService`] before
//! exposing a stream, supervises the stream against the lease's expiry,
//! and releases the lease exactly once however the stream ends.

pub mod broker;
pub mod catalog;
pub mod cmd;
pub mod config;
pub mod error;
pub mod lease;
pub mod session;
pub mod store;
pub mod types;
pub mod util;

pub use broker::StreamBroker;
pub use catalog::ResourceCatalog;
pub use error::{Error, Result};
pub use session::{
   ReadSession, SessionEvent, SessionState, StreamSession, Termination, TerminationReason,
   WriteSession,
};
pub use types::{
   ByteRange, ExistsRequest, Namespace, ReadRequest, RemoveOutcome, RemoveRequest, ResourceId,
   StoredFile, WriteRequest,
};
