//! Background message pickup
//!
//! A [`PickupWorker`] periodically asks every active mediator for queued
//! messages through the [`MediationModule`]. The deliveries come back as
//! inbound messages and are processed by whoever handles inbound traffic.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_PICKUP_INTERVAL;
use crate::mediation::MediationModule;

pub struct PickupWorker;

impl PickupWorker {
    /// Start polling every `interval`. The first round runs immediately.
    /// A zero interval falls back to [`DEFAULT_PICKUP_INTERVAL`].
    pub fn spawn(mediation: MediationModule, interval: Duration) -> PickupHandle {
        let interval = if interval.is_zero() {
            warn!("Zero pickup interval, using {:?}", DEFAULT_PICKUP_INTERVAL);
            DEFAULT_PICKUP_INTERVAL
        } else {
            interval
        };
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Pickup worker started, interval {:?}", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match mediation.pickup_all().await {
                            Ok(0) => debug!("No active mediator to pick up from"),
                            Ok(n) => debug!("Sent {} delivery requests", n),
                            Err(e) => warn!("Pickup round failed: {}", e),
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Pickup worker stopped");
        });

        PickupHandle {
            stop: stop_tx,
            task: Some(task),
        }
    }
}

/// Controls a running [`PickupWorker`]. Dropping the handle stops it.
#[derive(Debug)]
pub struct PickupHandle {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PickupHandle {
    /// Stop the worker and wait for its current round to finish.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Pickup worker ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for PickupHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::{Framework, FrameworkConfig};
    use std::sync::Arc;

    fn mediation() -> MediationModule {
        let framework = Framework::new(FrameworkConfig::default(), Arc::new(InMemoryStorage::new()));
        framework.mediation().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_keeps_polling_until_shutdown() {
        let handle = PickupWorker::spawn(mediation(), Duration::from_secs(1));

        // Rounds without mediators are no-ops
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(handle.is_running());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_does_not_kill_the_worker() {
        let handle = PickupWorker::spawn(mediation(), Duration::ZERO);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(handle.is_running());

        handle.shutdown().await;
    }

    #[test]
    fn test_shutdown_from_blocking_context() {
        tokio_test::block_on(async {
            let handle = PickupWorker::spawn(mediation(), Duration::from_millis(5));
            assert!(handle.is_running());
            handle.shutdown().await;
        });
    }
}
