mod support;

use std::{sync::atomic::Ordering, time::Duration};

use gridlock::{
   Error, SessionEvent, SessionState, TerminationReason, WriteRequest, lease::LeaseError,
};
use support::{Harness, short_lease};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn renewing_on_warning_keeps_session_alive() {
   let h = Harness::new(short_lease());
   let session = h.broker.open_for_write(WriteRequest::new()).await.unwrap().unwrap();
   let mut events = session.events().unwrap();
   let opened = Instant::now();

   for _ in 0..3 {
      match events.recv().await {
         Some(SessionEvent::ExpiresSoon { remaining }) => {
            assert!(remaining <= Duration::from_secs(1));
            session.renew().await.unwrap();
         },
         other => panic!("expected a warning, got {other:?}"),
      }
   }
   assert!(opened.elapsed() >= Duration::from_secs(2));
   assert_eq!(session.state(), SessionState::Active);
   assert!(session.is_held());

   session.write(b"still here").await.unwrap();
   let file = session.finish().await.unwrap();
   assert_eq!(file.length, 10);
   assert_eq!(h.leases.renews(), 3);
   assert_eq!(h.leases.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn unrenewed_lease_forces_expiry() {
   let h = Harness::new(short_lease());
   let session = h.broker.open_for_write(WriteRequest::new()).await.unwrap().unwrap();
   let opened = Instant::now();
   session.write(b"partial").await.unwrap();

   let closed = session.termination().await;
   let elapsed = opened.elapsed();
   assert_eq!(closed.reason, TerminationReason::Expired);
   assert!(closed.file.is_none());
   assert!(
      elapsed >= Duration::from_millis(1900) && elapsed <= Duration::from_millis(2010),
      "{elapsed:?}"
   );

   assert_eq!(session.state(), SessionState::Released);
   assert!(!session.is_held());
   assert!(h.store.inner.is_empty());

   let err = session.write(b"late").await.unwrap_err();
   assert!(matches!(err, Error::SessionTerminated { reason: TerminationReason::Expired }));
   assert_eq!(err.exit_code(), 11);
   assert!(session.finish().await.is_err());
   assert_eq!(h.leases.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn single_warning_then_closed() {
   let h = Harness::new(short_lease());
   let session = h.broker.open_for_write(WriteRequest::new()).await.unwrap().unwrap();
   let mut events = session.events().unwrap();

   let mut seen = Vec::new();
   while let Some(event) = events.recv().await {
      seen.push(event);
   }

   let warnings = seen.iter().filter(|e| matches!(e, SessionEvent::ExpiresSoon { .. })).count();
   assert_eq!(warnings, 1);
   assert_eq!(seen.len(), 2);
   assert!(matches!(
      seen.last(),
      Some(SessionEvent::Closed(t)) if t.reason == TerminationReason::Expired
   ));
}

#[tokio::test(start_paused = true)]
async fn explicit_warning_threshold() {
   let options = short_lease()
      .with_expiration(Duration::from_secs(10))
      .with_polling_interval(Duration::from_secs(5))
      .with_expires_soon(Duration::from_secs(3));
   let h = Harness::new(options);
   let session = h.broker.open_for_write(WriteRequest::new()).await.unwrap().unwrap();
   let mut events = session.events().unwrap();
   let opened = Instant::now();

   assert!(matches!(events.recv().await, Some(SessionEvent::ExpiresSoon { .. })));
   let elapsed = opened.elapsed();
   assert!(
      elapsed >= Duration::from_millis(6900) && elapsed <= Duration::from_millis(7010),
      "{elapsed:?}"
   );
   session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn renew_after_close_is_rejected() {
   let h = Harness::new(short_lease());
   let session = h.broker.open_for_write(WriteRequest::new()).await.unwrap().unwrap();
   session.finish().await.unwrap();

   let err = session.renew().await.unwrap_err();
   assert!(matches!(err, Error::Renewal(LeaseError::Released { .. })));
   assert_eq!(h.leases.renews(), 0);
}

#[tokio::test(start_paused = true)]
async fn overlapping_renewals_are_rejected() {
   let h = Harness::new(short_lease());
   h.leases.renew_delay.store(500, Ordering::SeqCst);
   let session = h.broker.open_for_write(WriteRequest::new()).await.unwrap().unwrap();

   let (first, second) = tokio::join!(session.renew(), session.renew());
   assert!(first.is_ok());
   assert!(matches!(second, Err(Error::Renewal(LeaseError::RenewalInFlight))));
   assert_eq!(h.leases.renews(), 1);
   assert_eq!(session.state(), SessionState::Active);
   session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn expiry_interrupts_blocked_write() {
   let h = Harness::new(short_lease());
   h.store.faults.write_delay.store(10_000, Ordering::SeqCst);
   let session = h.broker.open_for_write(WriteRequest::new()).await.unwrap().unwrap();
   let opened = Instant::now();

   let err = session.write(b"slow").await.unwrap_err();
   assert!(matches!(err, Error::SessionTerminated { reason: TerminationReason::Expired }));
   assert!(opened.elapsed() < Duration::from_secs(3));

   let closed = session.termination().await;
   assert_eq!(closed.reason, TerminationReason::Expired);
   assert_eq!(session.bytes(), 0);
   assert_eq!(h.leases.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_session_releases_in_background() {
   let h = Harness::new(short_lease());
   let session = h.broker.open_for_write(WriteRequest::new()).await.unwrap().unwrap();
   let id = session.id();
   drop(session);

   let again = h
      .broker
      .open_for_write(
         WriteRequest::new()
            .id(id)
            .lease(short_lease().with_acquire_timeout(Duration::from_millis(500))),
      )
      .await
      .unwrap();
   assert!(again.is_some());
   assert_eq!(h.leases.releases(), 1);
}
