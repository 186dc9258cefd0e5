//! Recurring retrieval from a broker.
//!
//! `start_poll` spawns a task that calls `get_event` on a fixed interval and
//! hands each result to a handler. Ticks run one at a time: a slow handler
//! delays the next tick instead of overlapping it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{BrokerEvent, EventBroker, GetEventOptions, Result};

/// Interval used when callers have no preference.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Handler for poll results.
///
/// Receives either the retrieved messages (possibly empty) or the error
/// `get_event` failed with. Settling messages is up to the handler.
pub trait PollHandler: Send + Sync + 'static {
    fn handle(&self, result: Result<Vec<BrokerEvent>>) -> BoxFuture<'static, ()>;
}

impl<F, Fut> PollHandler for F
where
    F: Fn(Result<Vec<BrokerEvent>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, result: Result<Vec<BrokerEvent>>) -> BoxFuture<'static, ()> {
        Box::pin(self(result))
    }
}

/// Handle to a running poll.
///
/// Dropping the handle also stops the poll.
pub struct PollHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Signal the poll task to stop. Safe to call more than once.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Whether the poll task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop and wait for the in-progress tick, if any, to finish.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Poll task ended abnormally");
        }
    }
}

/// Start polling `broker` every `interval`.
///
/// The first retrieval happens one interval after the call. A zero
/// interval means `DEFAULT_POLL_INTERVAL`.
pub fn start_poll(
    broker: Arc<dyn EventBroker>,
    options: GetEventOptions,
    handler: impl PollHandler,
    interval: Duration,
) -> PollHandle {
    let interval = if interval.is_zero() {
        DEFAULT_POLL_INTERVAL
    } else {
        interval
    };
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            broker = %broker.name(),
            interval_ms = interval.as_millis() as u64,
            "Broker poll started"
        );

        loop {
            // Cancellation wins over a tick that became ready meanwhile.
            tokio::select! {
                biased;

                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        info!(broker = %broker.name(), "Broker poll stopped");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let result = broker.get_event(options.clone()).await;
                    match &result {
                        Ok(messages) if !messages.is_empty() => {
                            debug!(broker = %broker.name(), count = messages.len(), "Poll retrieved messages");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(broker = %broker.name(), error = %e, "Poll retrieval failed"),
                    }
                    handler.handle(result).await;
                }
            }
        }
    });

    PollHandle {
        cancel: cancel_tx,
        task,
    }
}

/// Stop a poll started with `start_poll`. Idempotent.
pub fn stop_poll(handle: &PollHandle) {
    handle.stop();
}
