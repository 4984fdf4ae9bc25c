//! Bounded-time telemetry push

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{TelemetryError, TelemetryPeer, TelemetrySnapshot};

/// Delivers telemetry snapshots to the peer under a wall-clock budget
pub struct TelemetryPusher<P: TelemetryPeer> {
    peer: P,
    budget: Duration,
    retry_interval: Duration,
}

impl<P: TelemetryPeer> TelemetryPusher<P> {
    pub fn new(peer: P, budget: Duration, retry_interval: Duration) -> Self {
        Self {
            peer,
            budget,
            retry_interval,
        }
    }

    /// One delivery attempt. Returns no later than the budget after the call.
    ///
    /// While no session exists, a connection attempt is started every retry
    /// interval. Once connected the push is tried exactly once; a failed push
    /// is not retried.
    pub async fn push_block(&mut self, snapshot: &TelemetrySnapshot) -> Result<(), TelemetryError> {
        let started = Instant::now();
        let deadline = started + self.budget;

        loop {
            if Instant::now() >= deadline {
                break;
            }

            if !self.peer.is_connected() {
                self.peer.connect();
                sleep_until((Instant::now() + self.retry_interval).min(deadline)).await;
                continue;
            }

            match timeout_at(deadline, self.peer.push(snapshot.start, &snapshot.values)).await {
                Ok(Ok(())) => {
                    debug!(
                        start = snapshot.start,
                        "Telemetry pushed in {:?}",
                        started.elapsed()
                    );
                    return Ok(());
                },
                Ok(Err(e)) => {
                    error!("{}", e);
                    return Err(e);
                },
                Err(_) => break,
            }
        }

        let err = TelemetryError::Timeout(self.budget);
        error!("{}", err);
        Err(err)
    }

    /// Push every snapshot received until cancelled or the sender is gone
    pub async fn run(
        mut self,
        mut snapshots: mpsc::Receiver<TelemetrySnapshot>,
        token: CancellationToken,
    ) {
        info!("Telemetry pusher started, budget {:?}", self.budget);
        loop {
            let snapshot = tokio::select! {
                _ = token.cancelled() => break,
                next = snapshots.recv() => match next {
                    Some(snapshot) => snapshot,
                    None => break,
                },
            };
            // Failures are logged inside push_block
            let _ = self.push_block(&snapshot).await;
        }
        info!("Telemetry pusher stopped");
    }
}
