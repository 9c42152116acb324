//! Replaying multicast feed of the current connection
//!
//! The session pipeline is the single writer of a `watch` channel holding the
//! latest [`FeedSlot`]. Every [`ConnectionFeed`] is a counted receiver of that
//! channel: late subscribers see the cached connection immediately and nothing
//! re-runs the physical connect on their behalf.

use tokio::sync::watch;
use trailer_shared::{OperationError, SessionError};

/// Latest value published by the session pipeline
#[derive(Debug, Clone)]
pub(crate) enum FeedValue<C> {
    /// No session pipeline is running
    Closed,
    /// Pipeline running, no live connection (connecting or between retries)
    Pending,
    /// Live connection; `generation` grows with every new link
    Live { generation: u64, conn: C },
    /// Pipeline terminated with the error in [`FeedSlot::failure`]
    Failed,
}

/// Contents of the session's watch channel
#[derive(Debug, Clone)]
pub(crate) struct FeedSlot<C> {
    /// Connect cycle the value belongs to
    pub(crate) cycle: u64,
    pub(crate) value: FeedValue<C>,
    /// Most recent fatal error and its cycle. Outlives the next `connect` so
    /// subscribers that were not polling still receive it.
    pub(crate) failure: Option<(u64, SessionError)>,
}

impl<C> FeedSlot<C> {
    pub(crate) fn closed() -> Self {
        Self {
            cycle: 0,
            value: FeedValue::Closed,
            failure: None,
        }
    }

    fn current_failure(&self) -> Option<&SessionError> {
        match (&self.value, &self.failure) {
            (FeedValue::Failed, Some((cycle, error))) if *cycle == self.cycle => Some(error),
            _ => None,
        }
    }
}

/// Subscriber view of a session's current connection
#[derive(Clone)]
pub struct ConnectionFeed<C> {
    rx: watch::Receiver<FeedSlot<C>>,
    /// Cycle current when this feed subscribed; older failures are not ours
    first_cycle: u64,
    seen_generation: u64,
    seen_failure: Option<u64>,
}

impl<C: Clone> ConnectionFeed<C> {
    pub(crate) fn new(rx: watch::Receiver<FeedSlot<C>>) -> Self {
        let first_cycle = rx.borrow().cycle;
        Self {
            rx,
            first_cycle,
            seen_generation: 0,
            seen_failure: None,
        }
    }

    /// Wait for the next connection value.
    ///
    /// A live connection this subscriber has not seen yet is returned
    /// immediately. Reconnects show up as a new value after a gap; a fatal
    /// session error is returned once, even if the session was reconnected
    /// before this subscriber got to it. `None` means the session is closed.
    pub async fn next(&mut self) -> Option<Result<C, SessionError>> {
        loop {
            {
                let slot = self.rx.borrow_and_update();
                if let Some((cycle, error)) = &slot.failure {
                    if *cycle >= self.first_cycle && self.seen_failure < Some(*cycle) {
                        self.seen_failure = Some(*cycle);
                        return Some(Err(error.clone()));
                    }
                }
                match &slot.value {
                    FeedValue::Live { generation, conn } if *generation > self.seen_generation => {
                        self.seen_generation = *generation;
                        return Some(Ok(conn.clone()));
                    }
                    FeedValue::Failed | FeedValue::Closed => return None,
                    FeedValue::Live { .. } | FeedValue::Pending => {}
                }
            }

            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Wait until a connection is live and return it.
    ///
    /// Keeps waiting while the session is connecting, retrying or closed; only
    /// a failed session or a dropped session ends the wait with an error.
    pub async fn current(&mut self) -> Result<C, OperationError> {
        self.live_after(0).await.map(|(_, conn)| conn)
    }

    /// Like [`current`](Self::current), but skips links up to and including
    /// `generation`. Returns the connection with its link generation.
    pub(crate) async fn live_after(&mut self, generation: u64) -> Result<(u64, C), OperationError> {
        loop {
            {
                let slot = self.rx.borrow_and_update();
                if let Some(error) = slot.current_failure() {
                    return Err(OperationError::SessionFailed(error.clone()));
                }
                if let FeedValue::Live { generation: live, conn } = &slot.value {
                    if *live > generation {
                        return Ok((*live, conn.clone()));
                    }
                }
            }

            if self.rx.changed().await.is_err() {
                return Err(OperationError::SessionDropped);
            }
        }
    }

    /// The live connection, if there is one right now
    pub fn latest(&self) -> Option<C> {
        match &self.rx.borrow().value {
            FeedValue::Live { conn, .. } => Some(conn.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use trailer_shared::DeviceError;

    fn slot(cycle: u64, value: FeedValue<u64>) -> FeedSlot<u64> {
        FeedSlot {
            cycle,
            value,
            failure: None,
        }
    }

    fn live(generation: u64) -> FeedSlot<u64> {
        slot(
            1,
            FeedValue::Live {
                generation,
                conn: generation * 10,
            },
        )
    }

    fn failed(cycle: u64, error: &SessionError) -> FeedSlot<u64> {
        FeedSlot {
            cycle,
            value: FeedValue::Failed,
            failure: Some((cycle, error.clone())),
        }
    }

    fn fatal() -> SessionError {
        SessionError::Fatal(DeviceError::not_connected("x"))
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replay() {
        let (tx, _) = watch::channel(slot(1, FeedValue::Pending));
        tx.send_replace(live(1));

        let mut feed = ConnectionFeed::new(tx.subscribe());
        assert_eq!(feed.latest(), Some(10));
        assert_eq!(feed.next().await, Some(Ok(10)));

        // Same connection is not delivered twice
        assert!(timeout(Duration::from_millis(20), feed.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_gap_then_new_value() {
        let (tx, _) = watch::channel(live(1));
        let mut feed = ConnectionFeed::new(tx.subscribe());
        assert_eq!(feed.next().await, Some(Ok(10)));

        tx.send_replace(slot(1, FeedValue::Pending));
        tx.send_replace(live(2));
        assert_eq!(feed.next().await, Some(Ok(20)));
    }

    #[tokio::test]
    async fn test_failure_delivered_once() {
        let (tx, _) = watch::channel(slot(1, FeedValue::Pending));
        let mut feed = ConnectionFeed::<u64>::new(tx.subscribe());

        let error = fatal();
        tx.send_replace(failed(1, &error));

        assert_eq!(feed.next().await, Some(Err(error)));
        assert_eq!(feed.next().await, None);
    }

    #[tokio::test]
    async fn test_failure_survives_reconnect() {
        let (tx, _) = watch::channel(slot(1, FeedValue::Pending));
        let mut feed = ConnectionFeed::<u64>::new(tx.subscribe());

        let error = fatal();
        tx.send_replace(failed(1, &error));
        // Reconnected before the subscriber polled
        tx.send_modify(|slot| {
            slot.cycle = 2;
            slot.value = FeedValue::Live {
                generation: 1,
                conn: 10,
            };
        });

        assert_eq!(feed.next().await, Some(Err(error)));
        assert_eq!(feed.next().await, Some(Ok(10)));

        // Subscribers from the new cycle never see the old failure
        let mut fresh = ConnectionFeed::new(tx.subscribe());
        assert_eq!(fresh.next().await, Some(Ok(10)));
        assert_eq!(fresh.current().await, Ok(10));
    }

    #[tokio::test]
    async fn test_current_waits_through_closed() {
        let (tx, _) = watch::channel(FeedSlot::closed());
        let mut feed = ConnectionFeed::new(tx.subscribe());

        let waiter = tokio::spawn(async move { feed.current().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tx.send_replace(live(3));
        assert_eq!(waiter.await.unwrap(), Ok(30));
    }

    #[tokio::test]
    async fn test_live_after_skips_stale_link() {
        let (tx, _) = watch::channel(live(1));
        let mut feed = ConnectionFeed::new(tx.subscribe());

        let waiter = tokio::spawn(async move { feed.live_after(1).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tx.send_replace(live(2));
        assert_eq!(waiter.await.unwrap(), Ok((2, 20)));
    }

    #[tokio::test]
    async fn test_current_reports_failed_session() {
        let error = fatal();
        let (tx, rx) = watch::channel(failed(1, &error));
        let mut feed = ConnectionFeed::new(rx);
        assert_eq!(feed.current().await, Err(OperationError::SessionFailed(error)));
        drop(tx);
    }

    #[tokio::test]
    async fn test_current_reports_dropped_session() {
        let (tx, rx) = watch::channel(slot(1, FeedValue::Pending));
        let mut feed = ConnectionFeed::new(rx);
        drop(tx);
        assert_eq!(feed.current().await, Err(OperationError::SessionDropped));
    }
}
