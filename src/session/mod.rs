//! Lease-bound stream sessions.
//!
//! A session owns one blob stream and the lease that guards it. Every exit
//! path (finish, end of stream, store error, caller stop, lease expiry)
//! funnels through a single compare-and-set into `Terminating`, so the lease
//! is released exactly once and `Closed` is the last event a caller sees.

pub mod events;
mod shared;
mod timer;

use std::{ops::Deref, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::{
   io::{AsyncRead, AsyncWrite, AsyncWriteExt},
   sync::mpsc,
   time::Instant,
};
use tokio_util::io::ReaderStream;

pub use events::{SessionEvent, SessionState, Termination, TerminationReason};

use self::shared::{SessionCore, Stream};
use crate::{
   Result,
   error::Error,
   lease::{LeaseHandle, LeaseMode, LeaseOptions, LeaseRecord},
   store::{BlobReader, BlobWriter},
   types::{Namespace, ResourceId, StoredFile},
};

/// Read size used when piping a caller's reader into a write session.
const COPY_BUFFER: usize = 64 * 1024;

/// Mode-independent half of a session.
///
/// Dropping a session that is still live stops it in the background, so the
/// lease is released even when the caller forgets to.
pub struct StreamSession {
   core:   Arc<SessionCore>,
   events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl StreamSession {
   /// Wraps an acquired lease and an open stream, moving the session to
   /// `Active` and starting its expiration timer.
   fn open(lease: LeaseHandle, stream: Stream, options: LeaseOptions) -> Self {
      let (tx, rx) = mpsc::unbounded_channel();
      let core = Arc::new(SessionCore::new(lease, stream, options, tx));
      if core.activate() {
         timer::spawn(core.clone());
      }
      tracing::debug!("opened {} session on {}/{}", core.mode.as_str(), core.namespace, core.id);
      Self { core, events: Mutex::new(Some(rx)) }
   }

   pub fn id(&self) -> ResourceId {
      self.core.id
   }

   pub fn namespace(&self) -> &Namespace {
      &self.core.namespace
   }

   pub fn mode(&self) -> LeaseMode {
      self.core.mode
   }

   pub fn state(&self) -> SessionState {
      self.core.state()
   }

   /// Bytes moved through the stream so far.
   pub fn bytes(&self) -> u64 {
      self.core.bytes()
   }

   /// Time until the expiration timer forces the session closed.
   pub fn expires_in(&self) -> Duration {
      self.core.deadline().saturating_duration_since(Instant::now())
   }

   pub fn is_held(&self) -> bool {
      self.core.state().is_live() && !self.expires_in().is_zero()
   }

   /// Snapshot of the current lease record.
   pub async fn lease(&self) -> LeaseRecord {
      self.core.lease_record().await
   }

   /// Extends the lease by its ttl and re-arms the expiration timer.
   pub async fn renew(&self) -> Result<LeaseRecord> {
      self.core.renew().await
   }

   /// Takes the event receiver. Returns `None` after the first call.
   pub fn events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
      self.events.lock().take()
   }

   /// Ends the session early, discarding unfinished writes.
   pub async fn stop(&self) -> Termination {
      self.core.shutdown(TerminationReason::Stopped).await;
      self.termination().await
   }

   /// Resolves once the lease has been released.
   pub async fn lock_released(&self) {
      self.core.wait_terminated().await;
   }

   /// Resolves with the terminal notification.
   pub async fn termination(&self) -> Termination {
      self.core.wait_terminated().await.unwrap_or(Termination {
         reason:        TerminationReason::Stopped,
         file:          None,
         release_error: None,
      })
   }
}

impl Drop for StreamSession {
   fn drop(&mut self) {
      if !self.core.state().is_live() {
         return;
      }
      let core = self.core.clone();
      match tokio::runtime::Handle::try_current() {
         Ok(handle) => {
            handle.spawn(async move {
               core.shutdown(TerminationReason::Stopped).await;
            });
         },
         Err(_) => {
            tracing::warn!("session {} dropped outside a runtime; lease left to expire", core.id);
         },
      }
   }
}

impl std::fmt::Debug for StreamSession {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("StreamSession")
         .field("id", &self.core.id)
         .field("namespace", &self.core.namespace)
         .field("mode", &self.core.mode)
         .field("state", &self.core.state())
         .finish()
   }
}

/// Exclusive-lease session over a blob writer.
#[derive(Debug)]
pub struct WriteSession {
   session: StreamSession,
}

impl WriteSession {
   pub(crate) fn open(lease: LeaseHandle, writer: Box<dyn BlobWriter>, options: LeaseOptions) -> Self {
      Self { session: StreamSession::open(lease, Stream::Write(writer), options) }
   }

   /// Appends `data` to the resource.
   pub async fn write(&self, data: &[u8]) -> Result<()> {
      let core = &self.session.core;
      let written = core
         .guarded(async {
            let mut stream = core.stream.lock().await;
            match stream.as_mut() {
               Some(Stream::Write(writer)) => writer.write_chunk(data).await.map_err(Error::from),
               _ => Err(core.terminated_error()),
            }
         })
         .await;

      match written {
         Ok(()) => {
            core.add_progress(data.len());
            Ok(())
         },
         Err(e @ Error::Store(_)) => {
            core.fail(&e).await;
            Err(e)
         },
         Err(e) => Err(e),
      }
   }

   /// Publishes the resource and releases the lease.
   ///
   /// Writes already in progress complete and are part of the published
   /// resource; writes started after this call fail with
   /// [`Error::SessionTerminated`].
   pub async fn finish(&self) -> Result<StoredFile> {
      let core = &self.session.core;
      if !core.claim_quiet(TerminationReason::Completed) {
         return Err(core.terminated_error());
      }

      // A write already holding the stream lands before the stream is taken.
      let stream = core.stream.lock().await.take();
      core.interrupt();
      let published = match stream {
         Some(Stream::Write(writer)) => writer.finish().await.map_err(Error::from),
         _ => Err(Error::SessionTerminated { reason: TerminationReason::Completed }),
      };

      match published {
         Ok(file) => {
            core.finalize(Some(file.clone())).await;
            Ok(file)
         },
         Err(e) => {
            core.set_reason(TerminationReason::Errored(e.to_string()));
            core.finalize(None).await;
            Err(e)
         },
      }
   }

   /// Streams `reader` into the resource, then finishes it.
   pub async fn copy_from<R>(&self, reader: R) -> Result<StoredFile>
   where
      R: AsyncRead + Unpin + Send,
   {
      let core = &self.session.core;
      let mut chunks = ReaderStream::with_capacity(reader, COPY_BUFFER);
      while let Some(next) = core.guarded(async { Ok(chunks.next().await) }).await? {
         match next {
            Ok(bytes) => self.write(&bytes).await?,
            Err(e) => {
               let err = Error::Io(e);
               core.fail(&err).await;
               return Err(err);
            },
         }
      }
      self.finish().await
   }
}

impl Deref for WriteSession {
   type Target = StreamSession;

   fn deref(&self) -> &StreamSession {
      &self.session
   }
}

/// Shared-lease session over a blob reader, optionally limited to a range.
#[derive(Debug)]
pub struct ReadSession {
   session: StreamSession,
   file:    StoredFile,
}

impl ReadSession {
   pub(crate) fn open(lease: LeaseHandle, reader: Box<dyn BlobReader>, options: LeaseOptions) -> Self {
      let file = reader.file().clone();
      Self { session: StreamSession::open(lease, Stream::Read(reader), options), file }
   }

   /// Record of the resource being read.
   pub fn file(&self) -> &StoredFile {
      &self.file
   }

   /// Next chunk, or `None` at end of stream. Reaching the end completes the
   /// session and releases the lease.
   pub async fn read_chunk(&self) -> Result<Option<Bytes>> {
      let core = &self.session.core;
      if core.reason() == Some(TerminationReason::Completed) {
         return Ok(None);
      }

      let read = core
         .guarded(async {
            let mut stream = core.stream.lock().await;
            match stream.as_mut() {
               Some(Stream::Read(reader)) => reader.next_chunk().await.map_err(Error::from),
               _ => Err(core.terminated_error()),
            }
         })
         .await;

      match read {
         Ok(Some(chunk)) => {
            core.add_progress(chunk.len());
            Ok(Some(chunk))
         },
         Ok(None) => {
            core.shutdown(TerminationReason::Completed).await;
            Ok(None)
         },
         Err(e @ Error::Store(_)) => {
            core.fail(&e).await;
            Err(e)
         },
         Err(e) => Err(e),
      }
   }

   pub async fn read_to_end(&self) -> Result<Vec<u8>> {
      let mut out = Vec::new();
      while let Some(chunk) = self.read_chunk().await? {
         out.extend_from_slice(&chunk);
      }
      Ok(out)
   }

   /// Copies the rest of the stream into `writer`; returns the byte count.
   pub async fn copy_to<W>(&self, writer: &mut W) -> Result<u64>
   where
      W: AsyncWrite + Unpin + Send,
   {
      let core = &self.session.core;
      let mut copied = 0u64;
      while let Some(chunk) = self.read_chunk().await? {
         if let Err(e) = writer.write_all(&chunk).await {
            let err = Error::Io(e);
            core.fail(&err).await;
            return Err(err);
         }
         copied += chunk.len() as u64;
      }
      writer.flush().await?;
      Ok(copied)
   }
}

impl Deref for ReadSession {
   type Target = StreamSession;

   fn deref(&self) -> &StreamSession {
      &self.session
   }
}
