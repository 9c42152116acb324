//! In-memory peripheral used for development and tests
//!
//! Behaves like a trailer controller: characteristics hold byte values,
//! writes are acknowledged with the written payload, and the link can be
//! dropped on demand to exercise reconnection.

use crate::device::state_stream;
use crate::device::traits::{DeviceHandle, GattConnection};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use trailer_shared::{
    link, CharacteristicId, ConnectionState, DeviceError, DeviceErrorKind, LightCommand,
    PeripheralAddress,
};

/// Scripted result of one connection attempt
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// Connect after the configured delay
    Connect,
    /// Fail the attempt with the given error
    Fail(DeviceError),
    /// Never resolve; only dropping the attempt ends it
    Hang,
}

/// Configuration for the simulated peripheral
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Time a successful connection attempt takes
    pub connect_delay: Duration,
    /// Characteristics exposed by the peripheral and their initial values
    pub characteristics: Vec<(CharacteristicId, Bytes)>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            connect_delay: Duration::from_millis(200),
            characteristics: vec![(link::TRAILER_MODE, LightCommand::AllOff.encode())],
        }
    }
}

struct Inner {
    address: PeripheralAddress,
    connect_delay: Duration,
    script: Mutex<VecDeque<AttemptOutcome>>,
    characteristics: Mutex<HashMap<CharacteristicId, Bytes>>,
    read_delays: Mutex<HashMap<CharacteristicId, Duration>>,
    rejected_writes: Mutex<HashSet<CharacteristicId>>,
    writes: Mutex<Vec<(CharacteristicId, Bytes)>>,
    attempts: AtomicUsize,
    live_attempts: AtomicUsize,
    max_live_attempts: AtomicUsize,
    /// Bumped on every injected link loss
    link_epoch: watch::Sender<u64>,
    current_link: AtomicU64,
    next_link: AtomicU64,
    /// Last published state; held while sending so subscribers never miss one
    state: Mutex<ConnectionState>,
    state_tx: broadcast::Sender<ConnectionState>,
}

impl Inner {
    fn publish(&self, state: ConnectionState) {
        debug!("[SIM] {} state {}", self.address, state);
        let mut current = self.state.lock();
        *current = state;
        let _ = self.state_tx.send(state);
    }
}

/// In-memory peripheral
#[derive(Clone)]
pub struct SimulatedPeripheral {
    inner: Arc<Inner>,
}

impl SimulatedPeripheral {
    /// Create a new simulated peripheral
    pub fn new(address: PeripheralAddress, config: SimulatedConfig) -> Self {
        let (link_epoch, _) = watch::channel(0);
        let (state_tx, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(Inner {
                address,
                connect_delay: config.connect_delay,
                script: Mutex::new(VecDeque::new()),
                characteristics: Mutex::new(config.characteristics.into_iter().collect()),
                read_delays: Mutex::new(HashMap::new()),
                rejected_writes: Mutex::new(HashSet::new()),
                writes: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
                live_attempts: AtomicUsize::new(0),
                max_live_attempts: AtomicUsize::new(0),
                link_epoch,
                current_link: AtomicU64::new(0),
                next_link: AtomicU64::new(0),
                state: Mutex::new(ConnectionState::Disconnected),
                state_tx,
            }),
        }
    }

    /// Queue the outcome of the next unscripted connection attempt.
    /// Attempts beyond the script connect normally.
    pub fn push_outcome(&self, outcome: AttemptOutcome) {
        self.inner.script.lock().push_back(outcome);
    }

    /// Drop the current link as if the peripheral went out of range
    pub fn drop_link(&self) {
        info!("[SIM] Dropping link to {}", self.inner.address);
        self.inner.link_epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Periodically drop the link
    pub fn spawn_link_drops(&self, every: Duration) -> JoinHandle<()> {
        let device = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if device.inner.current_link.load(Ordering::SeqCst) != 0 {
                    device.drop_link();
                }
            }
        })
    }

    /// Delay reads of one characteristic
    pub fn set_read_delay(&self, id: CharacteristicId, delay: Duration) {
        self.inner.read_delays.lock().insert(id, delay);
    }

    /// Make the peripheral refuse writes to one characteristic
    pub fn reject_writes(&self, id: CharacteristicId) {
        self.inner.rejected_writes.lock().insert(id);
    }

    /// Current value of a characteristic
    pub fn value(&self, id: CharacteristicId) -> Option<Bytes> {
        self.inner.characteristics.lock().get(&id).cloned()
    }

    /// All accepted writes, oldest first
    pub fn writes(&self) -> Vec<(CharacteristicId, Bytes)> {
        self.inner.writes.lock().clone()
    }

    /// Total physical connection attempts opened so far
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Attempts currently open (connecting or connected)
    pub fn live_attempts(&self) -> usize {
        self.inner.live_attempts.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open attempts ever observed
    pub fn max_live_attempts(&self) -> usize {
        self.inner.max_live_attempts.load(Ordering::SeqCst)
    }
}

/// Accounts for one open attempt; releases the link when dropped
struct AttemptGuard {
    inner: Arc<Inner>,
    link_id: Option<u64>,
    connecting: bool,
}

impl AttemptGuard {
    fn open(inner: Arc<Inner>) -> Self {
        let live = inner.live_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_live_attempts.fetch_max(live, Ordering::SeqCst);
        Self {
            inner,
            link_id: None,
            connecting: false,
        }
    }

    fn begin(&mut self) {
        self.connecting = true;
        self.inner.publish(ConnectionState::Connecting);
    }

    fn fail(&mut self) {
        self.connecting = false;
        self.inner.publish(ConnectionState::Disconnected);
    }

    fn establish(&mut self) -> u64 {
        let id = self.inner.next_link.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.current_link.store(id, Ordering::SeqCst);
        self.link_id = Some(id);
        self.connecting = false;
        self.inner.publish(ConnectionState::Connected);
        id
    }

    /// Forget the link; `graceful` marks a local teardown rather than a loss
    fn release(&mut self, graceful: bool) {
        if let Some(id) = self.link_id.take() {
            let _ = self.inner.current_link.compare_exchange(
                id,
                0,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            if graceful {
                self.inner.publish(ConnectionState::Disconnecting);
            }
            self.inner.publish(ConnectionState::Disconnected);
        }
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if self.connecting {
            self.inner.publish(ConnectionState::Disconnected);
        }
        self.release(true);
        self.inner.live_attempts.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Phase {
    Connecting(AttemptGuard),
    Linked(AttemptGuard, watch::Receiver<u64>),
    Done(AttemptGuard),
}

impl DeviceHandle for SimulatedPeripheral {
    type Connection = SimulatedConnection;

    fn address(&self) -> PeripheralAddress {
        self.inner.address
    }

    fn connect(&self, auto_retry: bool) -> BoxStream<'static, Result<Self::Connection, DeviceError>> {
        let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            "[SIM] Connection attempt {} to {} (auto_retry={})",
            attempt, self.inner.address, auto_retry
        );

        let guard = AttemptGuard::open(self.inner.clone());
        stream::unfold(Phase::Connecting(guard), |phase| async move {
            match phase {
                Phase::Connecting(mut guard) => {
                    let inner = guard.inner.clone();
                    guard.begin();

                    let outcome = inner
                        .script
                        .lock()
                        .pop_front()
                        .unwrap_or(AttemptOutcome::Connect);

                    match outcome {
                        AttemptOutcome::Hang => futures::future::pending().await,
                        AttemptOutcome::Fail(err) => {
                            guard.fail();
                            Some((Err(err), Phase::Done(guard)))
                        }
                        AttemptOutcome::Connect => {
                            tokio::time::sleep(inner.connect_delay).await;

                            let drops = inner.link_epoch.subscribe();
                            let epoch = *drops.borrow();
                            let link_id = guard.establish();

                            let conn = SimulatedConnection {
                                inner: inner.clone(),
                                link_id,
                                epoch,
                            };
                            Some((Ok(conn), Phase::Linked(guard, drops)))
                        }
                    }
                }
                Phase::Linked(mut guard, mut drops) => {
                    let _ = drops.changed().await;
                    guard.release(false);
                    let err = DeviceError::disconnected("simulated link loss");
                    Some((Err(err), Phase::Done(guard)))
                }
                Phase::Done(_) => None,
            }
        })
        .boxed()
    }

    fn observe_state(&self) -> BoxStream<'static, ConnectionState> {
        let current = self.inner.state.lock();
        let changes = state_stream(self.inner.state_tx.subscribe());
        stream::once(futures::future::ready(*current))
            .chain(changes)
            .boxed()
    }
}

/// Connection to a [`SimulatedPeripheral`]
#[derive(Clone)]
pub struct SimulatedConnection {
    inner: Arc<Inner>,
    link_id: u64,
    epoch: u64,
}

impl fmt::Debug for SimulatedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedConnection")
            .field("address", &self.inner.address)
            .field("link_id", &self.link_id)
            .finish()
    }
}

impl SimulatedConnection {
    fn ensure_live(&self) -> Result<(), DeviceError> {
        let current = self.inner.current_link.load(Ordering::SeqCst) == self.link_id;
        let intact = *self.inner.link_epoch.borrow() == self.epoch;
        if current && intact {
            Ok(())
        } else {
            Err(DeviceError::not_connected(format!(
                "link {} is no longer active",
                self.link_id
            )))
        }
    }

    /// Identifier of the physical link this connection belongs to
    pub fn link_id(&self) -> u64 {
        self.link_id
    }
}

#[async_trait]
impl GattConnection for SimulatedConnection {
    async fn write_characteristic(
        &self,
        id: CharacteristicId,
        payload: Bytes,
    ) -> Result<Bytes, DeviceError> {
        self.ensure_live()?;

        if self.inner.rejected_writes.lock().contains(&id) {
            return Err(DeviceError::new(
                DeviceErrorKind::Rejected,
                format!("write to {} refused", id),
            ));
        }

        let mut characteristics = self.inner.characteristics.lock();
        let value = characteristics.get_mut(&id).ok_or_else(|| {
            DeviceError::new(DeviceErrorKind::CharacteristicNotFound, id.to_string())
        })?;
        *value = payload.clone();
        self.inner.writes.lock().push((id, payload.clone()));

        Ok(payload)
    }

    async fn read_characteristic(&self, id: CharacteristicId) -> Result<Bytes, DeviceError> {
        self.ensure_live()?;

        let delay = self.inner.read_delays.lock().get(&id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            self.ensure_live()?;
        }

        self.inner
            .characteristics
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| DeviceError::new(DeviceErrorKind::CharacteristicNotFound, id.to_string()))
    }
}
