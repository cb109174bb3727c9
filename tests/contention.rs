mod support;

use std::{sync::Arc, time::Duration};

use gridlock::{
   Namespace, ReadRequest, RemoveOutcome, RemoveRequest, ResourceId, StreamBroker, WriteRequest,
   lease::{LeaseOptions, MemoryLeaseBackend},
   store::MemoryBlobStore,
};
use support::{Harness, short_lease};
use tokio::time::Instant;

async fn stored(h: &Harness) -> ResourceId {
   let writer = h.broker.open_for_write(WriteRequest::new()).await.unwrap().unwrap();
   writer.write(b"shared bytes").await.unwrap();
   writer.finish().await.unwrap().id
}

#[tokio::test]
async fn second_writer_is_busy_until_release() {
   let h = Harness::new(LeaseOptions::default());
   let first = h.broker.open_for_write(WriteRequest::new()).await.unwrap().unwrap();
   let id = first.id();

   assert!(h.broker.open_for_write(WriteRequest::new().id(id)).await.unwrap().is_none());
   assert!(h.broker.open_for_read(ReadRequest::for_id(id)).await.unwrap().is_none());

   first.finish().await.unwrap();
   let second = h.broker.open_for_write(WriteRequest::new().id(id)).await.unwrap();
   assert!(second.is_some());
}

#[tokio::test]
async fn readers_share_and_exclude_writers() {
   let h = Harness::new(LeaseOptions::default());
   let id = stored(&h).await;

   let a = h.broker.open_for_read(ReadRequest::for_id(id)).await.unwrap().unwrap();
   let b = h.broker.open_for_read(ReadRequest::for_id(id)).await.unwrap().unwrap();
   assert!(h.broker.open_for_write(WriteRequest::new().id(id)).await.unwrap().is_none());
   assert_eq!(h.broker.remove(RemoveRequest::for_id(id)).await.unwrap(), RemoveOutcome::Busy);

   assert_eq!(a.read_to_end().await.unwrap(), b"shared bytes");
   assert!(h.broker.open_for_write(WriteRequest::new().id(id)).await.unwrap().is_none());
   assert_eq!(b.read_to_end().await.unwrap(), b"shared bytes");

   assert_eq!(h.broker.remove(RemoveRequest::for_id(id)).await.unwrap(), RemoveOutcome::Removed);
}

#[tokio::test(start_paused = true)]
async fn acquire_timeout_waits_for_holder() {
   let h = Harness::new(short_lease());
   let first = h.broker.open_for_write(WriteRequest::new()).await.unwrap().unwrap();
   let id = first.id();

   let waiting = WriteRequest::new()
      .id(id)
      .lease(short_lease().with_acquire_timeout(Duration::from_secs(5)));
   let started = Instant::now();
   let (second, _) = tokio::join!(h.broker.open_for_write(waiting), async {
      tokio::time::sleep(Duration::from_millis(1500)).await;
      first.stop().await;
   });

   assert!(second.unwrap().is_some());
   let waited = started.elapsed();
   assert!(
      waited >= Duration::from_millis(1500) && waited < Duration::from_secs(3),
      "{waited:?}"
   );
}

#[tokio::test(start_paused = true)]
async fn acquire_timeout_gives_up() {
   let h = Harness::new(LeaseOptions::default());
   let held = h.broker.open_for_write(WriteRequest::new()).await.unwrap().unwrap();
   let id = held.id();

   let started = Instant::now();
   let busy = h
      .broker
      .open_for_write(
         WriteRequest::new()
            .id(id)
            .lease(LeaseOptions::default().with_acquire_timeout(Duration::from_millis(750))),
      )
      .await
      .unwrap();
   assert!(busy.is_none());
   assert!(started.elapsed() >= Duration::from_millis(750));
}

#[tokio::test(start_paused = true)]
async fn expired_holder_no_longer_blocks() {
   let h = Harness::new(short_lease());
   let first = h.broker.open_for_write(WriteRequest::new()).await.unwrap().unwrap();
   let id = first.id();

   first.termination().await;
   assert!(h.broker.open_for_write(WriteRequest::new().id(id)).await.unwrap().is_some());
}

#[tokio::test]
async fn brokers_on_one_backend_share_leases() {
   let backend = Arc::new(MemoryLeaseBackend::new());
   let store = Arc::new(MemoryBlobStore::new());
   let ns = Namespace::new("images").unwrap();
   let left =
      StreamBroker::new(ns.clone(), backend.clone(), store.clone(), LeaseOptions::default());
   let right = StreamBroker::new(ns, backend.clone(), store, LeaseOptions::default());

   let writer = left.open_for_write(WriteRequest::new()).await.unwrap().unwrap();
   let id = writer.id();
   assert!(right.open_for_write(WriteRequest::new().id(id)).await.unwrap().is_none());
   assert_eq!(right.remove(RemoveRequest::for_id(id)).await.unwrap(), RemoveOutcome::Busy);

   let holders = backend.service(left.namespace()).unwrap().holders(&id);
   assert_eq!(holders, 1);

   writer.finish().await.unwrap();
   assert_eq!(right.remove(RemoveRequest::for_id(id)).await.unwrap(), RemoveOutcome::Removed);
}

#[tokio::test]
async fn namespaces_do_not_contend() {
   let backend = Arc::new(MemoryLeaseBackend::new());
   let store = Arc::new(MemoryBlobStore::new());
   let images = StreamBroker::new(
      Namespace::new("images").unwrap(),
      backend.clone(),
      store.clone(),
      LeaseOptions::default(),
   );
   let docs =
      StreamBroker::new(Namespace::new("docs").unwrap(), backend, store, LeaseOptions::default());

   let writer = images.open_for_write(WriteRequest::new()).await.unwrap().unwrap();
   let other = docs.open_for_write(WriteRequest::new().id(writer.id())).await.unwrap();
   assert!(other.is_some());
}
