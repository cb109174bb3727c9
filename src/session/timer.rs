//! Expiration timer: warns before the lease lapses and forces the session
//! closed when it does.

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use super::{
   shared::SessionCore,
   events::{SessionEvent, TerminationReason},
};

pub(crate) fn spawn(core: Arc<SessionCore>) {
   tokio::spawn(run(core));
}

async fn run(core: Arc<SessionCore>) {
   let poll = core.options.effective_polling_interval();
   let threshold = core.options.warning_threshold();
   let mut deadline_rx = core.deadline.subscribe();
   // One warning per lease period; a renewal re-arms it.
   let mut warned = false;

   loop {
      let deadline = *deadline_rx.borrow_and_update();
      let now = Instant::now();
      if now >= deadline {
         break;
      }
      let remaining = deadline - now;

      if !warned && remaining <= threshold {
         warned = true;
         if core.state().is_live() {
            tracing::debug!("lease on {} expires in {remaining:?}", core.id);
            core.emit(SessionEvent::ExpiresSoon { remaining });
         }
      }

      let nap = next_wake(remaining, threshold, poll, warned);
      tokio::select! {
         biased;
         () = core.cancel.cancelled() => return,
         changed = deadline_rx.changed() => {
            if changed.is_err() {
               return;
            }
            warned = false;
         },
         () = tokio::time::sleep(nap) => {},
      }
   }

   if core.shutdown(TerminationReason::Expired).await {
      tracing::debug!("session {} force-expired", core.id);
   }
}

/// Sleeps at most one polling interval, but wakes exactly at the warning
/// threshold and at the deadline.
fn next_wake(remaining: Duration, threshold: Duration, poll: Duration, warned: bool) -> Duration {
   let mut nap = poll.min(remaining);
   if !warned && remaining > threshold {
      nap = nap.min(remaining - threshold);
   }
   nap
}
