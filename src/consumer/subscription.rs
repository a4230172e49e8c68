//! Background polling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ConsumerError, EventConsumer};
use crate::envelope::EventPayload;

/// Handle to a consumer polling on a background task.
///
/// Dropping the handle stops the task as well.
pub struct Subscription {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop polling after the current cycle.
    pub fn unsubscribe(&self) {
        let _ = self.cancel.send(true);
    }

    /// Whether the polling task is still running and has not been asked to
    /// stop.
    pub fn is_active(&self) -> bool {
        !*self.cancel.borrow() && !self.task.is_finished()
    }

    /// Wait for the polling task to finish.
    pub async fn join(self) {
        let Subscription { cancel, task } = self;
        let _ = task.await;
        drop(cancel);
    }
}

impl<E: EventPayload> EventConsumer<E> {
    /// Poll on a background task, pausing `interval` between cycles.
    ///
    /// The task ends on `Subscription::unsubscribe`, when the handle is
    /// dropped, or once the consumer is shut down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> Subscription {
        let (cancel, mut cancel_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!(
                consumer = %self.config.consumer_name,
                group = %self.config.consumer_group,
                ?interval,
                "Subscription started"
            );

            loop {
                if *cancel_rx.borrow() {
                    break;
                }

                match self.poll_events().await {
                    Ok(report) if report.total() > 0 => {
                        debug!(?report, "Subscription poll");
                    }
                    Ok(_) => {}
                    Err(e @ (ConsumerError::ShutDown | ConsumerError::NotInitialized)) => {
                        info!(reason = %e, "Subscription ending");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Subscription poll failed");
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!(consumer = %self.config.consumer_name, "Subscription stopped");
        });

        Subscription { cancel, task }
    }
}
