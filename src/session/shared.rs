//! Shared state behind a session handle and its expiration timer.

use std::{
   future::Future,
   sync::atomic::{AtomicU8, AtomicU64, Ordering},
};

use parking_lot::Mutex;
use tokio::{
   sync::{Mutex as AsyncMutex, mpsc, watch},
   time::Instant,
};
use tokio_util::sync::CancellationToken;

use super::events::{SessionEvent, SessionState, Termination, TerminationReason};
use crate::{
   Result,
   error::Error,
   lease::{LeaseError, LeaseHandle, LeaseMode, LeaseOptions, LeaseRecord},
   store::{BlobReader, BlobWriter},
   types::{Namespace, ResourceId, StoredFile},
};

pub(crate) enum Stream {
   Write(Box<dyn BlobWriter>),
   Read(Box<dyn BlobReader>),
}

pub(crate) struct SessionCore {
   pub(crate) id:        ResourceId,
   pub(crate) namespace: Namespace,
   pub(crate) mode:      LeaseMode,
   pub(crate) options:   LeaseOptions,
   state:                AtomicU8,
   reason:               Mutex<Option<TerminationReason>>,
   lease:                AsyncMutex<LeaseHandle>,
   pub(crate) stream:    AsyncMutex<Option<Stream>>,
   /// Fires on termination; interrupts caller I/O and the timer.
   pub(crate) cancel:    CancellationToken,
   pub(crate) deadline:  watch::Sender<Instant>,
   events:               Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
   termination:          watch::Sender<Option<Termination>>,
   bytes:                AtomicU64,
}

impl SessionCore {
   pub(crate) fn new(
      lease: LeaseHandle,
      stream: Stream,
      options: LeaseOptions,
      events: mpsc::UnboundedSender<SessionEvent>,
   ) -> Self {
      let record = lease.record();
      let deadline = Instant::now() + record.remaining();
      Self {
         id: record.resource,
         namespace: record.namespace.clone(),
         mode: record.mode,
         options,
         state: AtomicU8::new(SessionState::Acquiring as u8),
         reason: Mutex::new(None),
         lease: AsyncMutex::new(lease),
         stream: AsyncMutex::new(Some(stream)),
         cancel: CancellationToken::new(),
         deadline: watch::channel(deadline).0,
         events: Mutex::new(Some(events)),
         termination: watch::channel(None).0,
         bytes: AtomicU64::new(0),
      }
   }

   pub(crate) fn state(&self) -> SessionState {
      SessionState::from_u8(self.state.load(Ordering::Acquire))
   }

   fn transition(&self, from: SessionState, to: SessionState) -> Result<(), SessionState> {
      self
         .state
         .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
         .map(|_| ())
         .map_err(SessionState::from_u8)
   }

   /// `Acquiring -> Active`.
   pub(crate) fn activate(&self) -> bool {
      self.transition(SessionState::Acquiring, SessionState::Active).is_ok()
   }

   /// Claims the move into `Terminating` and interrupts in-flight I/O.
   /// Exactly one caller ever gets `true`.
   pub(crate) fn claim(&self, reason: TerminationReason) -> bool {
      let won = self.claim_quiet(reason);
      if won {
         self.interrupt();
      }
      won
   }

   /// Claims like [`Self::claim`] but lets guarded I/O that already started
   /// run to completion; new guarded calls are rejected. The winner calls
   /// [`Self::interrupt`] once it owns the stream.
   pub(crate) fn claim_quiet(&self, reason: TerminationReason) -> bool {
      // Held across the swap so nobody observes `Terminating` without a reason.
      let mut slot = self.reason.lock();
      let mut current = self.state();
      loop {
         if matches!(current, SessionState::Terminating | SessionState::Released) {
            return false;
         }
         match self.transition(current, SessionState::Terminating) {
            Ok(()) => {
               tracing::debug!("session {} terminating: {reason}", self.id);
               *slot = Some(reason);
               return true;
            },
            Err(actual) => current = actual,
         }
      }
   }

   /// Cancels guarded I/O and stops the expiration timer.
   pub(crate) fn interrupt(&self) {
      self.cancel.cancel();
   }

   pub(crate) fn reason(&self) -> Option<TerminationReason> {
      self.reason.lock().clone()
   }

   pub(crate) fn terminated_error(&self) -> Error {
      Error::SessionTerminated { reason: self.reason().unwrap_or(TerminationReason::Stopped) }
   }

   pub(crate) fn deadline(&self) -> Instant {
      *self.deadline.borrow()
   }

   pub(crate) fn bytes(&self) -> u64 {
      self.bytes.load(Ordering::Acquire)
   }

   pub(crate) fn emit(&self, event: SessionEvent) {
      if let Some(tx) = self.events.lock().as_ref() {
         let _ = tx.send(event);
      }
   }

   pub(crate) fn add_progress(&self, n: usize) {
      let total = self.bytes.fetch_add(n as u64, Ordering::AcqRel) + n as u64;
      if self.state().is_live() {
         self.emit(SessionEvent::Progress { bytes: total });
      }
   }

   /// Runs `op` unless or until termination is claimed.
   pub(crate) async fn guarded<T, F>(&self, op: F) -> Result<T>
   where
      F: Future<Output = Result<T>>,
   {
      if !self.state().is_live() {
         return Err(self.terminated_error());
      }
      tokio::select! {
         biased;
         () = self.cancel.cancelled() => Err(self.terminated_error()),
         out = op => out,
      }
   }

   pub(crate) async fn lease_record(&self) -> LeaseRecord {
      self.lease.lock().await.record().clone()
   }

   /// `Active -> Renewing -> Active`, extending the lease and the timer.
   pub(crate) async fn renew(&self) -> Result<LeaseRecord> {
      if let Err(state) = self.transition(SessionState::Active, SessionState::Renewing) {
         let err = match state {
            SessionState::Renewing => LeaseError::RenewalInFlight,
            _ => LeaseError::Released { resource: self.id },
         };
         return Err(Error::Renewal(err));
      }

      let renewed = {
         let mut lease = self.lease.lock().await;
         lease.renew().await.cloned()
      };
      let still_live = self.transition(SessionState::Renewing, SessionState::Active).is_ok();

      let record = renewed.map_err(Error::Renewal)?;
      if !still_live {
         return Err(Error::Renewal(LeaseError::Released { resource: self.id }));
      }
      self.deadline.send_replace(Instant::now() + record.remaining());
      tracing::debug!("session {} renewed until {}", self.id, record.expires_at);
      Ok(record)
   }

   /// Drops the stream without publishing anything.
   pub(crate) async fn discard_stream(&self) {
      let stream = self.stream.lock().await.take();
      if let Some(Stream::Write(writer)) = stream
         && let Err(e) = writer.abort().await
      {
         tracing::warn!("failed to abort write of {}: {e}", self.id);
      }
   }

   /// Releases the lease once and publishes the terminal notification. Only
   /// the winner of [`Self::claim`] calls this.
   pub(crate) async fn finalize(&self, file: Option<StoredFile>) -> Termination {
      let release_error = {
         let mut lease = self.lease.lock().await;
         match lease.release().await {
            Ok(()) => None,
            Err(e) => {
               tracing::warn!("failed to release {} lease on {}: {e}", self.mode.as_str(), self.id);
               Some(e.to_string())
            },
         }
      };

      self.state.store(SessionState::Released as u8, Ordering::Release);
      let termination = Termination {
         reason: self.reason().unwrap_or(TerminationReason::Stopped),
         file,
         release_error,
      };
      if let Some(tx) = self.events.lock().take() {
         let _ = tx.send(SessionEvent::Closed(termination.clone()));
      }
      self.termination.send_replace(Some(termination.clone()));
      tracing::debug!("session {} released ({})", self.id, termination.reason);
      termination
   }

   /// Claims termination with `reason`, discards the stream and releases.
   /// Returns `false` if another path already terminated the session.
   pub(crate) async fn shutdown(&self, reason: TerminationReason) -> bool {
      if !self.claim(reason) {
         return false;
      }
      self.discard_stream().await;
      self.finalize(None).await;
      true
   }

   /// Records the failure as the termination reason if this call wins.
   pub(crate) async fn fail(&self, err: &Error) {
      self.shutdown(TerminationReason::Errored(err.to_string())).await;
   }

   pub(crate) fn set_reason(&self, reason: TerminationReason) {
      *self.reason.lock() = Some(reason);
   }

   pub(crate) async fn wait_terminated(&self) -> Option<Termination> {
      let mut rx = self.termination.subscribe();
      rx.wait_for(Option::is_some).await.ok().and_then(|t| (*t).clone())
   }
}
