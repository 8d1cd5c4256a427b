//! Inbound message pump.
//!
//! Drains the transport queue in batches, demultiplexes frames into the
//! bridge, and drives the negotiator's probe-window deadline. Polling is
//! adaptive: a non-empty batch resets the interval to the floor; idle
//! iterations back off toward the ceiling to keep CPU down.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::bridge::BridgeInner;
use crate::lease::unix_millis;

const DRAIN_BATCH: usize = 64;
const MIN_POLL: Duration = Duration::from_micros(100);
const MAX_POLL: Duration = Duration::from_millis(1);

pub(crate) async fn run(inner: Arc<BridgeInner>) {
    debug!("dispatcher started");
    let mut poll = MIN_POLL;

    while inner.running.load(Ordering::Acquire) {
        let batch = inner.transport.recv_batch(DRAIN_BATCH).await;
        let drained = !batch.is_empty();
        for (sender, bytes) in batch {
            inner.handle_frame(sender, &bytes).await;
        }

        // Probe windows close here; the loop's bounded sleep keeps the
        // deadline check well under the window length.
        let now = Instant::now();
        let commands = inner.with_negotiator(|neg| neg.poll(now, unix_millis()));
        if !commands.is_empty() {
            inner.execute(commands).await;
        }

        poll = if drained {
            MIN_POLL
        } else {
            (poll * 2).min(MAX_POLL)
        };
        tokio::time::sleep(poll).await;
    }
    debug!("dispatcher stopped");
}
