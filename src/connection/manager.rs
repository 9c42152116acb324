//! Connection session with automatic reconnection

use super::feed::{ConnectionFeed, FeedSlot, FeedValue};
use super::retry::RetryPolicy;
use crate::device::DeviceHandle;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use trailer_shared::{DeviceError, ErrorClass, PeripheralAddress, SessionError};

/// Configuration for a connection session
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Passed to the device's raw connect (let the radio stack wait for the
    /// peripheral instead of failing fast)
    pub auto_retry: bool,
    /// Reconnection policy
    pub retry: RetryPolicy,
}

/// How a session pipeline ended
#[derive(Debug)]
enum SessionOutcome {
    /// Disconnect trigger fired (or the session was dropped)
    Disconnected,
    /// Fatal error, surfaced to feed subscribers
    Failed(SessionError),
}

/// One connect cycle: its disconnect trigger and the task driving it
struct Pipeline {
    trigger: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// State shared between the session and its pipeline tasks
struct Shared<C> {
    address: PeripheralAddress,
    feed_tx: watch::Sender<FeedSlot<C>>,
    generation: AtomicU64,
}

impl<C> Shared<C> {
    /// Publish on behalf of pipeline `cycle`; dropped once it is superseded
    fn publish(&self, cycle: u64, value: FeedValue<C>) {
        self.feed_tx.send_if_modified(|slot| {
            if slot.cycle != cycle {
                return false;
            }
            slot.value = value;
            true
        });
    }

    /// Record a fatal error for pipeline `cycle`
    fn fail(&self, cycle: u64, error: SessionError) {
        self.feed_tx.send_if_modified(|slot| {
            if slot.cycle != cycle {
                return false;
            }
            slot.value = FeedValue::Failed;
            slot.failure = Some((cycle, error));
            true
        });
    }
}

/// Owns the logical connection to one peripheral.
///
/// `connect` starts a pipeline that opens the physical link, republishes every
/// established connection on the feed and reconnects after transient drops.
/// `disconnect` fires the pipeline's one-shot trigger. Dropping the session
/// has the same effect as `disconnect`.
pub struct ConnectionSession<D: DeviceHandle> {
    device: Arc<D>,
    config: SessionConfig,
    shared: Arc<Shared<D::Connection>>,
    pipeline: Mutex<Option<Pipeline>>,
}

impl<D: DeviceHandle> ConnectionSession<D> {
    /// Create a session for `device`; nothing connects until [`connect`](Self::connect)
    pub fn new(device: Arc<D>, config: SessionConfig) -> Self {
        let (feed_tx, _) = watch::channel(FeedSlot::closed());
        let shared = Arc::new(Shared {
            address: device.address(),
            feed_tx,
            generation: AtomicU64::new(0),
        });

        Self {
            device,
            config,
            shared,
            pipeline: Mutex::new(None),
        }
    }

    /// Start a connection process.
    ///
    /// Any previous attempt is disposed first; the new pipeline only opens the
    /// physical link once the old one has released it. Must be called from
    /// within a tokio runtime.
    pub fn connect(&self) {
        let mut pipeline = self.pipeline.lock();

        let previous = pipeline.take().map(|mut old| {
            if let Some(trigger) = old.trigger.take() {
                debug!("[SESSION] Disposing previous connection attempt");
                let _ = trigger.send(());
            }
            old.task
        });

        let mut cycle = 0;
        self.shared.feed_tx.send_modify(|slot| {
            slot.cycle += 1;
            slot.value = FeedValue::Pending;
            cycle = slot.cycle;
        });

        let (trigger, trigger_rx) = oneshot::channel();
        let task = tokio::spawn(run_pipeline(
            self.device.clone(),
            self.config.clone(),
            self.shared.clone(),
            cycle,
            trigger_rx,
            previous,
        ));

        info!("[SESSION] Connect requested for {}", self.shared.address);
        *pipeline = Some(Pipeline {
            trigger: Some(trigger),
            task,
        });
    }

    /// Fire the disconnect trigger; a no-op when nothing is running
    pub fn disconnect(&self) {
        let trigger = self
            .pipeline
            .lock()
            .as_mut()
            .and_then(|pipeline| pipeline.trigger.take());

        match trigger {
            Some(trigger) => {
                info!("[SESSION] Disconnect requested for {}", self.shared.address);
                let _ = trigger.send(());
            }
            None => debug!("[SESSION] Disconnect with no active session, ignoring"),
        }
    }

    /// Replaying feed of the live connection
    pub fn current_connection(&self) -> ConnectionFeed<D::Connection> {
        ConnectionFeed::new(self.shared.feed_tx.subscribe())
    }

    /// True while a connection is live
    pub fn is_connected(&self) -> bool {
        matches!(self.shared.feed_tx.borrow().value, FeedValue::Live { .. })
    }

    /// Number of feeds currently attached to this session
    pub fn subscriber_count(&self) -> usize {
        self.shared.feed_tx.receiver_count()
    }

    /// Resolves once no pipeline is running: after a disconnect has released
    /// the link, or after a fatal error.
    pub async fn closed(&self) {
        let mut rx = self.shared.feed_tx.subscribe();
        let _ = rx
            .wait_for(|slot| matches!(slot.value, FeedValue::Closed | FeedValue::Failed))
            .await;
    }

    pub fn address(&self) -> PeripheralAddress {
        self.shared.address
    }

    /// The device this session connects to
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }
}

/// Drive one connect cycle until the trigger fires or a fatal error occurs
async fn run_pipeline<D: DeviceHandle>(
    device: Arc<D>,
    config: SessionConfig,
    shared: Arc<Shared<D::Connection>>,
    cycle: u64,
    trigger: oneshot::Receiver<()>,
    previous: Option<JoinHandle<()>>,
) {
    // The superseded pipeline was already triggered; wait for it to drop its link
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    let outcome = tokio::select! {
        biased;
        _ = trigger => SessionOutcome::Disconnected,
        failure = maintain_link(device.as_ref(), &config, &shared, cycle) => {
            SessionOutcome::Failed(failure)
        }
    };

    match outcome {
        SessionOutcome::Disconnected => {
            info!("[SESSION] Session to {} closed", shared.address);
            shared.publish(cycle, FeedValue::Closed);
        }
        SessionOutcome::Failed(error) => {
            error!("[SESSION] Session to {} failed: {}", shared.address, error);
            shared.fail(cycle, error);
        }
    }
}

/// Connect, publish, and reconnect after transient drops. Only returns on a
/// failure the retry policy does not absorb.
async fn maintain_link<D: DeviceHandle>(
    device: &D,
    config: &SessionConfig,
    shared: &Shared<D::Connection>,
    cycle: u64,
) -> SessionError {
    let mut backoff = config.retry.backoff();
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        debug!("[SESSION] Opening link to {} (attempt {})", shared.address, attempt);

        let mut link = device.connect(config.auto_retry);
        let error = loop {
            match link.next().await {
                Some(Ok(conn)) => {
                    let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    info!("[SESSION] Connected to {} (link #{})", shared.address, generation);
                    backoff.reset();
                    shared.publish(cycle, FeedValue::Live { generation, conn });
                }
                Some(Err(e)) => break e,
                None => break DeviceError::disconnected("connection stream ended"),
            }
        };
        drop(link);
        shared.publish(cycle, FeedValue::Pending);

        match (config.retry.classify)(&error) {
            ErrorClass::Fatal => return SessionError::Fatal(error),
            ErrorClass::TransientDisconnect => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        "[SESSION] Link to {} lost ({}), reconnecting in {:?} (retry {})",
                        shared.address,
                        error,
                        delay,
                        backoff.failures()
                    );
                    // Always suspend so the disconnect trigger gets polled
                    if delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                }
                None => {
                    return SessionError::RetriesExhausted {
                        attempts: backoff.failures(),
                        last: error,
                    }
                }
            },
        }
    }
}
