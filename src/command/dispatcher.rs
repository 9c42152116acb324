//! Characteristic operation dispatcher
//!
//! Every call attaches to the session's connection feed, waits for a live
//! connection, performs exactly one GATT operation and lets go of the
//! connection again. No ordering is imposed between concurrent calls.

use crate::connection::ConnectionFeed;
use crate::device::GattConnection;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;
use trailer_shared::{CharacteristicId, DeviceError, DeviceErrorKind, OperationError};

/// One-shot write of a payload to a characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub characteristic: CharacteristicId,
    pub payload: Bytes,
}

impl WriteRequest {
    pub fn new(characteristic: CharacteristicId, payload: impl Into<Bytes>) -> Self {
        Self {
            characteristic,
            payload: payload.into(),
        }
    }
}

/// One-shot read of a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub characteristic: CharacteristicId,
}

/// Performs reads and writes over whatever connection is currently live
#[derive(Clone)]
pub struct CharacteristicDispatcher<C> {
    feed: ConnectionFeed<C>,
    operation_timeout: Option<Duration>,
}

impl<C: GattConnection> CharacteristicDispatcher<C> {
    /// Create a dispatcher on top of a session's connection feed
    pub fn new(feed: ConnectionFeed<C>) -> Self {
        Self {
            feed,
            operation_timeout: None,
        }
    }

    /// Bound the wait for a connection plus the operation itself
    pub fn with_timeout(mut self, operation_timeout: Option<Duration>) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }

    /// Write `payload`, resolving with the peripheral's acknowledgment
    pub async fn write(
        &self,
        characteristic: CharacteristicId,
        payload: impl Into<Bytes>,
    ) -> Result<Bytes, OperationError> {
        self.execute_write(WriteRequest::new(characteristic, payload))
            .await
    }

    /// Read the current value of a characteristic
    pub async fn read(&self, characteristic: CharacteristicId) -> Result<Bytes, OperationError> {
        self.execute_read(ReadRequest { characteristic }).await
    }

    pub async fn execute_write(&self, request: WriteRequest) -> Result<Bytes, OperationError> {
        let WriteRequest {
            characteristic,
            payload,
        } = request;

        self.on_live_connection(move |conn| {
            let payload = payload.clone();
            async move {
                debug!("[DISPATCH] write {} {:?}", characteristic, payload.as_ref());
                conn.write_characteristic(characteristic, payload).await
            }
        })
        .await
    }

    pub async fn execute_read(&self, request: ReadRequest) -> Result<Bytes, OperationError> {
        let characteristic = request.characteristic;

        self.on_live_connection(move |conn| async move {
            debug!("[DISPATCH] read {}", characteristic);
            conn.read_characteristic(characteristic).await
        })
        .await
    }

    /// Run `operation` on the live connection, waiting for one if needed.
    ///
    /// A link that went away before the operation reached it does not count
    /// as a failure: the call waits for the next link instead.
    async fn on_live_connection<T, F, Fut>(&self, operation: F) -> Result<T, OperationError>
    where
        F: Fn(C) -> Fut,
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        let attempt = async {
            let mut feed = self.feed.clone();
            let mut stale = 0;
            loop {
                let (generation, conn) = feed.live_after(stale).await?;
                match operation(conn).await {
                    Err(e) if e.kind == DeviceErrorKind::NotConnected => {
                        debug!(
                            "[DISPATCH] Link #{} went away before the operation, waiting for the next one",
                            generation
                        );
                        stale = generation;
                    }
                    result => return result.map_err(OperationError::Rejected),
                }
            }
        };

        match self.operation_timeout {
            Some(limit) => timeout(limit, attempt)
                .await
                .map_err(|_| OperationError::TimedOut(limit))?,
            None => attempt.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionSession, RetryPolicy, SessionConfig};
    use crate::device::{AttemptOutcome, SimulatedConfig, SimulatedPeripheral};
    use std::sync::Arc;
    use trailer_shared::{link, SessionError};

    const WAIT: Duration = Duration::from_secs(2);
    const SECOND: CharacteristicId = CharacteristicId::from_u128(0x2f49_0002_b8ed_495c_882f_1b15_3728_a885);

    fn device() -> Arc<SimulatedPeripheral> {
        let config = SimulatedConfig {
            connect_delay: Duration::from_millis(5),
            characteristics: vec![
                (link::TRAILER_MODE, Bytes::from_static(&[4, 0, 0])),
                (SECOND, Bytes::from_static(b"second")),
            ],
        };
        Arc::new(SimulatedPeripheral::new(link::DEFAULT_ADDRESS, config))
    }

    fn session(device: &Arc<SimulatedPeripheral>) -> ConnectionSession<SimulatedPeripheral> {
        let config = SessionConfig {
            retry: RetryPolicy::immediate(),
            ..Default::default()
        };
        ConnectionSession::new(device.clone(), config)
    }

    #[tokio::test]
    async fn test_write_waits_for_connection() {
        let device = device();
        let session = session(&device);
        let dispatcher = CharacteristicDispatcher::new(session.current_connection());

        let pending = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.write(link::TRAILER_MODE, vec![4u8, 1, 0]).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!pending.is_finished());
        assert_eq!(device.attempts(), 0);

        session.connect();
        let ack = timeout(WAIT, pending).await.unwrap().unwrap().unwrap();
        assert_eq!(ack.as_ref(), &[4, 1, 0]);
        assert_eq!(device.value(link::TRAILER_MODE).unwrap().as_ref(), &[4, 1, 0]);
        assert_eq!(device.writes().len(), 1);
        assert_eq!(device.attempts(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_reads_are_independent() {
        let device = device();
        device.set_read_delay(link::TRAILER_MODE, Duration::from_millis(60));
        let session = session(&device);
        let dispatcher = CharacteristicDispatcher::new(session.current_connection());
        session.connect();

        let (slow, fast) = tokio::join!(
            dispatcher.read(link::TRAILER_MODE),
            dispatcher.read(SECOND)
        );
        assert_eq!(slow.unwrap().as_ref(), &[4, 0, 0]);
        assert_eq!(fast.unwrap().as_ref(), b"second");
        assert_eq!(device.attempts(), 1);
    }

    #[tokio::test]
    async fn test_write_survives_link_loss() {
        let device = device();
        let session = session(&device);
        let dispatcher = CharacteristicDispatcher::new(session.current_connection());
        session.connect();
        dispatcher.read(link::TRAILER_MODE).await.unwrap();

        device.drop_link();
        let ack = timeout(WAIT, dispatcher.write(link::TRAILER_MODE, vec![4u8, 3, 0]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.as_ref(), &[4, 3, 0]);
        assert_eq!(device.attempts(), 2);
    }

    #[tokio::test]
    async fn test_rejected_write_is_local_to_the_call() {
        let device = device();
        device.reject_writes(link::TRAILER_MODE);
        let session = session(&device);
        let dispatcher = CharacteristicDispatcher::new(session.current_connection());
        session.connect();

        let err = dispatcher
            .write(link::TRAILER_MODE, vec![4u8, 1, 0])
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Rejected(ref e) if e.kind == DeviceErrorKind::Rejected));

        // The session is unaffected
        assert!(session.is_connected());
        assert!(dispatcher.read(SECOND).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_characteristic_fails() {
        let device = device();
        let session = session(&device);
        let dispatcher = CharacteristicDispatcher::new(session.current_connection());
        session.connect();

        let err = dispatcher
            .read(CharacteristicId::from_u128(7))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OperationError::Rejected(ref e) if e.kind == DeviceErrorKind::CharacteristicNotFound
        ));
    }

    #[tokio::test]
    async fn test_fatal_session_error_fails_pending_operation() {
        let device = device();
        device.push_outcome(AttemptOutcome::Fail(DeviceError::new(
            DeviceErrorKind::AdapterUnavailable,
            "adapter powered off",
        )));
        let session = session(&device);
        let dispatcher = CharacteristicDispatcher::new(session.current_connection());

        let pending = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.read(link::TRAILER_MODE).await })
        };
        session.connect();

        let err = timeout(WAIT, pending).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, OperationError::SessionFailed(SessionError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_operation_timeout() {
        let device = device();
        let session = session(&device);
        let dispatcher = CharacteristicDispatcher::new(session.current_connection())
            .with_timeout(Some(Duration::from_millis(30)));

        let err = dispatcher.read(link::TRAILER_MODE).await.unwrap_err();
        assert_eq!(err, OperationError::TimedOut(Duration::from_millis(30)));
        assert_eq!(device.attempts(), 0);
    }
}
