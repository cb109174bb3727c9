//! CLI command implementations for gridlock.
//!
//! Each subcommand opens a broker on the configured data directory using the
//! file lease backend and the filesystem blob store, so separate processes
//! coordinate through the same lease records.

pub mod get;
pub mod put;
pub mod rm;
pub mod stat;

use std::{future::Future, sync::Arc, time::Duration};

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
   Error, Result, StreamBroker,
   config,
   lease::FileLeaseBackend,
   session::{SessionEvent, StreamSession},
   store::FsBlobStore,
   types::{Namespace, ResourceId},
};

/// Exit code when the resource is leased by someone else.
pub const EXIT_BUSY: i32 = 10;
/// Exit code when the resource does not exist.
pub const EXIT_NOT_FOUND: i32 = 4;

/// Builds a broker from the global config, optionally on another namespace.
pub fn open_broker(namespace: Option<String>) -> Result<StreamBroker> {
   let cfg = config::get();
   cfg.validate()?;
   let namespace = match namespace {
      Some(ns) => Namespace::new(ns)?,
      None => cfg.namespace()?,
   };
   let root = cfg.resolved_data_dir();
   tracing::debug!("using data dir {}", root.display());

   Ok(StreamBroker::new(
      namespace,
      Arc::new(FileLeaseBackend::new(root.join("leases"))),
      Arc::new(FsBlobStore::new(root.join("blobs"))),
      cfg.lease_options(),
   ))
}

pub(crate) fn parse_id(raw: &str) -> Result<ResourceId> {
   raw.parse()
}

pub(crate) fn busy(id: ResourceId) -> Error {
   let message = format!("resource {id} is in use by another holder");
   eprintln!("{} {}", style("✗").red(), message);
   Error::Reported { message, exit_code: EXIT_BUSY }
}

pub(crate) fn not_found(id: ResourceId) -> Error {
   let message = format!("resource {id} not found");
   eprintln!("{} {}", style("✗").red(), message);
   Error::Reported { message, exit_code: EXIT_NOT_FOUND }
}

pub(crate) fn progress_bar(len: u64, visible: bool) -> ProgressBar {
   if !visible {
      return ProgressBar::hidden();
   }
   let bar = ProgressBar::new(len);
   if let Ok(progress_style) = ProgressStyle::default_bar()
      .template("{spinner:.green} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {msg}")
   {
      bar.set_style(progress_style.progress_chars("=> "));
   }
   bar.enable_steady_tick(Duration::from_millis(100));
   bar
}

/// Drives `work` while pumping the session's events: progress updates the
/// bar and every expiry warning renews the lease.
pub(crate) async fn supervise<T, F>(session: &StreamSession, bar: &ProgressBar, work: F) -> Result<T>
where
   F: Future<Output = Result<T>>,
{
   let work = async {
      let out = work.await;
      if session.state().is_live() {
         session.stop().await;
      }
      out
   };

   let Some(mut events) = session.events() else {
      return work.await;
   };
   let pump = async {
      while let Some(event) = events.recv().await {
         match event {
            SessionEvent::Progress { bytes } => bar.set_position(bytes),
            SessionEvent::ExpiresSoon { remaining } => {
               tracing::debug!("lease on {} expires in {remaining:?}, renewing", session.id());
               if let Err(e) = session.renew().await {
                  tracing::warn!("failed to renew lease on {}: {e}", session.id());
               }
            },
            SessionEvent::Closed(termination) => {
               if let Some(err) = termination.release_error {
                  bar.println(format!("{} lease release failed: {err}", style("warning:").yellow()));
               }
               break;
            },
         }
      }
   };

   let (out, ()) = tokio::join!(work, pump);
   out
}
