//! Connection sessions.
//!
//! A [`Session`] owns one peripheral from connect to teardown. Its life is an
//! explicit state machine:
//!
//! ```text
//! Idle → Connecting → ServiceDiscovery → CharacteristicDiscovery
//!      → Subscribing → Streaming → Disconnecting → Closed
//! ```
//!
//! Any non-terminal state may fail into `Error(kind)`. Connected states may
//! short-cut to `Disconnecting`, and an `Idle` session may close directly.
//! Every other edge is rejected with [`Error::InvalidTransition`].
//!
//! Each step runs under its own timeout and the session's cancellation
//! token. Teardown always cancels the session's own subscriptions before
//! closing the connection, whichever way the session ends.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use vitalink_types::{GattProfile, RawPacket};

use crate::error::{Error, Result};
use crate::events::{
    DEFAULT_EVENT_CAPACITY, DisconnectReason, EventReceiver, SessionEvent, event_channel,
};
use crate::guard::SessionClaim;
use crate::metrics::PacketCounters;
use crate::scan::DiscoveredDevice;
use crate::transport::{PeripheralId, Transport, TransportHandle};

/// Default budget for each connection step.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a streaming session waits for the next event.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest accepted event channel capacity.
pub const MAX_EVENT_CAPACITY: usize = 4096;

/// Why a session ended in the error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A step or the idle budget ran out.
    Timeout,
    /// The link dropped unexpectedly.
    Disconnected,
    /// An operation requested a forbidden state change.
    InvalidTransition,
    /// The device lacks the expected service or characteristics.
    Discovery,
    /// The transport reported an error.
    Transport,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    ServiceDiscovery,
    CharacteristicDiscovery,
    Subscribing,
    Streaming,
    Disconnecting,
    Closed,
    Error(FailureKind),
}

impl SessionState {
    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error(_))
    }

    /// A transport connection may be open.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::ServiceDiscovery
                | Self::CharacteristicDiscovery
                | Self::Subscribing
                | Self::Streaming
                | Self::Disconnecting
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(kind) => write!(f, "Error({kind:?})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Whether `from → to` is an allowed edge.
fn allows(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;

    match (from, to) {
        (Idle, Connecting | Closed)
        | (Connecting, ServiceDiscovery)
        | (ServiceDiscovery, CharacteristicDiscovery)
        | (CharacteristicDiscovery, Subscribing)
        | (Subscribing, Streaming)
        | (Disconnecting, Closed) => true,
        (
            Connecting | ServiceDiscovery | CharacteristicDiscovery | Subscribing | Streaming,
            Disconnecting,
        ) => true,
        (from, Error(_)) => !from.is_terminal(),
        _ => false,
    }
}

/// The state of one session plus a watch channel publishing every change.
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    observer: watch::Sender<SessionState>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    /// A machine in `Idle`.
    pub fn new() -> Self {
        let (observer, _) = watch::channel(SessionState::Idle);
        Self::with_observer(observer)
    }

    /// A machine in `Idle` that publishes through `observer`.
    pub fn with_observer(observer: watch::Sender<SessionState>) -> Self {
        observer.send_replace(SessionState::Idle);
        Self {
            state: SessionState::Idle,
            observer,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Watch future state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.observer.subscribe()
    }

    /// Move to `to`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] when the edge is not allowed. The machine
    /// is then left in `Error(InvalidTransition)`, unless it was already
    /// terminal.
    pub fn advance(&mut self, to: SessionState) -> Result<SessionState> {
        let from = self.state;
        if !allows(from, to) {
            warn!(%from, %to, "Rejected session transition");
            if !from.is_terminal() {
                self.set(SessionState::Error(FailureKind::InvalidTransition));
            }
            return Err(Error::InvalidTransition { from, to });
        }
        self.set(to);
        Ok(to)
    }

    /// Enter `Error(kind)` unless already terminal.
    pub fn fail(&mut self, kind: FailureKind) -> SessionState {
        if !self.state.is_terminal() {
            self.set(SessionState::Error(kind));
        }
        self.state
    }

    fn set(&mut self, state: SessionState) {
        trace!(from = %self.state, to = %state, "Session transition");
        self.state = state;
        self.observer.send_replace(state);
    }
}

/// Time budgets and buffering for a session.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use vitalink_core::SessionConfig;
///
/// let config = SessionConfig::default()
///     .connect_timeout(Duration::from_secs(20))
///     .idle_timeout(None);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Budget for establishing the link.
    pub connect_timeout: Duration,
    /// Budget for service and characteristic discovery, each.
    pub discovery_timeout: Duration,
    /// Budget for enabling notifications and writing the transfer request.
    pub subscribe_timeout: Duration,
    /// Budget for each teardown call.
    pub disconnect_timeout: Duration,
    /// Budget for reads while streaming.
    pub operation_timeout: Duration,
    /// How long a streaming session waits for the next event. `None` waits
    /// forever.
    pub idle_timeout: Option<Duration>,
    /// Capacity of the inbound event channel.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_STEP_TIMEOUT,
            discovery_timeout: DEFAULT_STEP_TIMEOUT,
            subscribe_timeout: DEFAULT_STEP_TIMEOUT,
            disconnect_timeout: DEFAULT_STEP_TIMEOUT,
            operation_timeout: DEFAULT_STEP_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the subscribe timeout.
    #[must_use]
    pub fn subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    /// Set the teardown timeout.
    #[must_use]
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Set the read timeout used while streaming.
    #[must_use]
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set or disable the idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the event channel capacity.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validate the configuration.
    ///
    /// Returns an error if any budget is zero or the event capacity is
    /// outside `1..=MAX_EVENT_CAPACITY`.
    pub fn validate(&self) -> Result<()> {
        let budgets = [
            ("connect_timeout", self.connect_timeout),
            ("discovery_timeout", self.discovery_timeout),
            ("subscribe_timeout", self.subscribe_timeout),
            ("disconnect_timeout", self.disconnect_timeout),
            ("operation_timeout", self.operation_timeout),
        ];
        for (name, budget) in budgets {
            if budget.is_zero() {
                return Err(Error::invalid_config(format!("{name} must be > 0")));
            }
        }
        if self.idle_timeout.is_some_and(|idle| idle.is_zero()) {
            return Err(Error::invalid_config(
                "idle_timeout must be > 0 (use None to disable)",
            ));
        }
        if self.event_capacity == 0 || self.event_capacity > MAX_EVENT_CAPACITY {
            return Err(Error::invalid_config(format!(
                "event_capacity must be between 1 and {MAX_EVENT_CAPACITY}"
            )));
        }
        Ok(())
    }
}

/// Everything a session shares with its owner.
#[derive(Debug, Default)]
pub struct SessionOptions {
    /// Time budgets.
    pub config: SessionConfig,
    /// Counters the session bumps for received and dropped packets.
    pub counters: Arc<PacketCounters>,
    /// Token that cancels the session from outside.
    pub cancel: CancellationToken,
    /// Optional publisher for state changes.
    pub observer: Option<watch::Sender<SessionState>>,
}

impl SessionOptions {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Share `counters` with the session.
    #[must_use]
    pub fn counters(mut self, counters: Arc<PacketCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Cancel the session through `token`.
    #[must_use]
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Publish state changes through `observer`.
    #[must_use]
    pub fn observer(mut self, observer: watch::Sender<SessionState>) -> Self {
        self.observer = Some(observer);
        self
    }
}

/// What woke a streaming session.
enum Wake {
    Event(std::result::Result<SessionEvent, RecvError>),
    Idle(Duration),
    Cancelled,
}

/// A connection to one peripheral, from connect to teardown.
///
/// Sessions are created by [`Central::claim_session`](crate::Central::claim_session)
/// or [`Central::open_session`](crate::Central::open_session).
///
/// Dropping a session that is still connected spawns a best-effort teardown
/// on the current tokio runtime. The peripheral stays claimed until that
/// teardown has finished.
pub struct Session {
    transport: Arc<dyn Transport>,
    device: DiscoveredDevice,
    profile: GattProfile,
    machine: SessionStateMachine,
    handle: Option<Box<dyn TransportHandle>>,
    events: Option<EventReceiver>,
    subscriptions: Vec<Uuid>,
    config: SessionConfig,
    counters: Arc<PacketCounters>,
    cancel: CancellationToken,
    expect_disconnect: bool,
    /// A connect call was started but never produced a handle.
    connect_pending: bool,
    claim: Option<SessionClaim>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peripheral", &self.device.peripheral_id)
            .field("model", &self.device.descriptor.id)
            .field("state", &self.machine.state())
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        device: DiscoveredDevice,
        claim: SessionClaim,
        options: SessionOptions,
    ) -> Self {
        let machine = match options.observer {
            Some(observer) => SessionStateMachine::with_observer(observer),
            None => SessionStateMachine::new(),
        };
        Self {
            transport,
            profile: device.descriptor.profile(),
            device,
            machine,
            handle: None,
            events: None,
            subscriptions: Vec::new(),
            config: options.config,
            counters: options.counters,
            cancel: options.cancel,
            expect_disconnect: false,
            connect_pending: false,
            claim: Some(claim),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Watch state changes.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.machine.subscribe()
    }

    /// The device this session owns.
    pub fn device(&self) -> &DiscoveredDevice {
        &self.device
    }

    pub fn counters(&self) -> &Arc<PacketCounters> {
        &self.counters
    }

    /// A token that cancels this session when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Characteristics this session has notifications enabled on.
    pub fn subscriptions(&self) -> &[Uuid] {
        &self.subscriptions
    }

    /// Treat the next disconnect as the normal end of the stream.
    ///
    /// Blood-pressure cuffs drop the link once they have sent their
    /// measurements. After this call such a disconnect closes the session and
    /// [`next_packet`](Self::next_packet) returns `Ok(None)` instead of
    /// [`Error::Disconnected`].
    pub fn expect_disconnect(&mut self) {
        self.expect_disconnect = true;
    }

    pub fn is_expecting_disconnect(&self) -> bool {
        self.expect_disconnect
    }

    /// Connect, discover, subscribe, and send the transfer request.
    ///
    /// On success the session is `Streaming`. On failure every acquired
    /// resource is released before the error is returned, and the session is
    /// `Closed` (cancelled) or `Error(kind)`.
    #[tracing::instrument(level = "info", skip_all, fields(peripheral = %self.device.peripheral_id, model = %self.device.descriptor.id))]
    pub async fn connect(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.shutdown().await?;
            return Err(Error::Cancelled);
        }
        match self.establish().await {
            Ok(()) => {
                info!("Session streaming");
                Ok(())
            }
            Err(err) => Err(self.abort(err).await),
        }
    }

    async fn establish(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        let config = self.config.clone();
        let profile = self.profile;

        self.machine.advance(SessionState::Connecting)?;
        let (sender, receiver) = event_channel(config.event_capacity);
        self.events = Some(receiver);
        self.connect_pending = true;
        let connected = bounded(
            &cancel,
            SessionState::Connecting,
            config.connect_timeout,
            self.transport.connect(&self.device.peripheral_id, sender),
        )
        .await;
        // Only a connect cut short by the budget or the token leaves a link behind.
        self.connect_pending = matches!(connected, Err(Error::Timeout { .. } | Error::Cancelled));
        let handle = self.handle.insert(connected?);
        debug!("Connected");

        self.machine.advance(SessionState::ServiceDiscovery)?;
        let services = bounded(
            &cancel,
            SessionState::ServiceDiscovery,
            config.discovery_timeout,
            handle.discover_services(),
        )
        .await?;
        if !services.contains(&profile.service) {
            return Err(Error::ServiceNotFound(profile.service));
        }
        debug!(count = services.len(), "Discovered services");

        self.machine.advance(SessionState::CharacteristicDiscovery)?;
        let characteristics = bounded(
            &cancel,
            SessionState::CharacteristicDiscovery,
            config.discovery_timeout,
            handle.discover_characteristics(profile.service),
        )
        .await?;
        let required =
            std::iter::once(profile.measurement).chain(profile.control.map(|c| c.characteristic));
        for uuid in required {
            if !characteristics.contains(&uuid) {
                return Err(Error::CharacteristicNotFound {
                    uuid,
                    service_count: services.len(),
                });
            }
        }

        self.machine.advance(SessionState::Subscribing)?;
        // Recorded first so teardown unsubscribes even if enabling half-succeeded.
        self.subscriptions.push(profile.measurement);
        bounded(
            &cancel,
            SessionState::Subscribing,
            config.subscribe_timeout,
            handle.set_notify(profile.measurement, true),
        )
        .await?;
        debug!(characteristic = %profile.measurement, "Subscribed");
        if let Some(control) = profile.control {
            bounded(
                &cancel,
                SessionState::Subscribing,
                config.subscribe_timeout,
                handle.write_value(control.characteristic, control.command),
            )
            .await?;
            debug!(characteristic = %control.characteristic, "Requested transfer");
        }

        self.machine.advance(SessionState::Streaming)?;
        Ok(())
    }

    /// Wait for the next measurement packet.
    ///
    /// Returns `Ok(None)` once the session has closed normally: after an
    /// expected disconnect, or when called on a closed session. Any other end
    /// of the stream tears the session down and returns the error.
    ///
    /// Events lost to channel overflow are added to the `dropped` counter.
    pub async fn next_packet(&mut self) -> Result<Option<RawPacket>> {
        match self.machine.state() {
            SessionState::Streaming => {}
            SessionState::Closed => return Ok(None),
            state => return Err(Error::NotStreaming { state }),
        }

        let measurement = self.profile.measurement;
        loop {
            let wake = {
                let Some(events) = self.events.as_mut() else {
                    return Ok(None);
                };
                let idle = self.config.idle_timeout;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Wake::Cancelled,
                    wake = recv_within(events, idle) => wake,
                }
            };

            match wake {
                Wake::Event(Ok(SessionEvent::Notification {
                    characteristic,
                    packet,
                })) => {
                    if characteristic != measurement {
                        trace!(%characteristic, "Ignoring notification");
                        continue;
                    }
                    self.counters.record_received();
                    return Ok(Some(packet));
                }
                Wake::Event(Err(RecvError::Lagged(count))) => {
                    warn!(count, "Session fell behind, oldest events dropped");
                    self.counters.record_dropped(count);
                }
                Wake::Event(Ok(SessionEvent::Disconnected { reason })) => {
                    return self.on_disconnect(reason).await;
                }
                Wake::Event(Err(RecvError::Closed)) => {
                    return self.on_disconnect(DisconnectReason::Unknown).await;
                }
                Wake::Idle(limit) => {
                    let err = Error::timeout(SessionState::Streaming, limit);
                    return Err(self.abort(err).await);
                }
                Wake::Cancelled => return Err(self.abort(Error::Cancelled).await),
            }
        }
    }

    async fn on_disconnect(&mut self, reason: DisconnectReason) -> Result<Option<RawPacket>> {
        if self.expect_disconnect {
            info!(%reason, "Device ended the transfer");
            self.shutdown().await?;
            Ok(None)
        } else {
            Err(self.abort(Error::Disconnected { reason }).await)
        }
    }

    /// Read a characteristic while streaming.
    pub async fn read_value(&mut self, characteristic: Uuid) -> Result<Bytes> {
        let state = self.machine.state();
        let (SessionState::Streaming, Some(handle)) = (state, self.handle.as_mut()) else {
            return Err(Error::NotStreaming { state });
        };
        bounded(
            &self.cancel,
            state,
            self.config.operation_timeout,
            handle.read_value(characteristic),
        )
        .await
    }

    /// Tear the session down gracefully.
    ///
    /// Unsubscribes, disconnects, and moves to `Closed`. A session that has
    /// already ended is left as is.
    #[tracing::instrument(level = "info", skip_all, fields(peripheral = %self.device.peripheral_id))]
    pub async fn close(&mut self) -> Result<()> {
        self.shutdown().await
    }

    /// Cancel the session's token and tear down.
    ///
    /// Resources are released by the time this returns.
    pub async fn cancel(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.shutdown().await
    }

    async fn shutdown(&mut self) -> Result<()> {
        match self.machine.state() {
            state if state.is_terminal() => return Ok(()),
            SessionState::Idle => {}
            SessionState::Disconnecting => self.release().await,
            _ => {
                self.machine.advance(SessionState::Disconnecting)?;
                self.release().await;
            }
        }
        self.machine.advance(SessionState::Closed)?;
        self.claim.take();
        info!("Session closed");
        Ok(())
    }

    /// Release resources after `err` and record the failure.
    async fn abort(&mut self, err: Error) -> Error {
        if matches!(err, Error::Cancelled) {
            debug!("Session cancelled");
            if let Err(e) = self.shutdown().await {
                warn!("Teardown after cancellation failed: {}", e);
            }
            return err;
        }
        warn!(error = %err, state = %self.machine.state(), "Session failed");
        self.release().await;
        self.machine.fail(err.failure_kind());
        self.claim.take();
        err
    }

    async fn release(&mut self) {
        let subscriptions = std::mem::take(&mut self.subscriptions);
        let limit = self.config.disconnect_timeout;
        if let Some(mut handle) = self.handle.take() {
            teardown(handle.as_mut(), subscriptions, limit).await;
        } else if std::mem::take(&mut self.connect_pending) {
            cancel_connect(self.transport.as_ref(), &self.device.peripheral_id, limit).await;
        }
        self.events = None;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let handle = self.handle.take();
        let pending = std::mem::take(&mut self.connect_pending);
        if handle.is_none() && !pending {
            return;
        }
        let claim = self.claim.take();
        let subscriptions = std::mem::take(&mut self.subscriptions);
        let limit = self.config.disconnect_timeout;
        let transport = Arc::clone(&self.transport);
        let peripheral = self.device.peripheral_id.clone();
        if let Ok(runtime) = Handle::try_current() {
            runtime.spawn(async move {
                match handle {
                    Some(mut handle) => teardown(handle.as_mut(), subscriptions, limit).await,
                    None => cancel_connect(transport.as_ref(), &peripheral, limit).await,
                }
                // Only now may another session take the peripheral.
                drop(claim);
            });
        } else {
            warn!("No tokio runtime available for session teardown in drop");
        }
    }
}

/// Unsubscribe everything, then disconnect. Failures are logged, not returned.
async fn teardown(handle: &mut dyn TransportHandle, subscriptions: Vec<Uuid>, limit: Duration) {
    for characteristic in subscriptions {
        match timeout(limit, handle.set_notify(characteristic, false)).await {
            Ok(Ok(())) => debug!(%characteristic, "Unsubscribed"),
            Ok(Err(e)) => debug!(%characteristic, "Unsubscribe failed: {}", e),
            Err(_) => warn!(%characteristic, "Unsubscribe timed out after {:?}", limit),
        }
    }
    match timeout(limit, handle.disconnect()).await {
        Ok(Ok(())) => debug!(peripheral = %handle.peripheral_id(), "Disconnected"),
        Ok(Err(e)) => warn!("Disconnect failed: {}", e),
        Err(_) => warn!("Disconnect timed out after {:?}", limit),
    }
}

/// Drop whatever an abandoned connect call left on the radio.
async fn cancel_connect(transport: &dyn Transport, peripheral: &PeripheralId, limit: Duration) {
    match timeout(limit, transport.cancel_connect(peripheral)).await {
        Ok(Ok(())) => debug!(%peripheral, "Connect cancelled"),
        Ok(Err(e)) => warn!("Cancelling connect failed: {}", e),
        Err(_) => warn!("Cancelling connect timed out after {:?}", limit),
    }
}

/// Run one step under the cancellation token and a time budget.
async fn bounded<T>(
    cancel: &CancellationToken,
    state: SessionState,
    limit: Duration,
    step: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = timeout(limit, step) => result.map_err(|_| Error::timeout(state, limit))?,
    }
}

async fn recv_within(events: &mut EventReceiver, idle: Option<Duration>) -> Wake {
    match idle {
        Some(limit) => match timeout(limit, events.recv()).await {
            Ok(event) => Wake::Event(event),
            Err(_) => Wake::Idle(limit),
        },
        None => Wake::Event(events.recv().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path() {
        let mut machine = SessionStateMachine::new();
        let path = [
            SessionState::Connecting,
            SessionState::ServiceDiscovery,
            SessionState::CharacteristicDiscovery,
            SessionState::Subscribing,
            SessionState::Streaming,
            SessionState::Disconnecting,
            SessionState::Closed,
        ];
        for state in path {
            assert_eq!(machine.advance(state).unwrap(), state);
        }
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn test_skipping_a_step_is_invalid() {
        let mut machine = SessionStateMachine::new();
        machine.advance(SessionState::Connecting).unwrap();

        let err = machine.advance(SessionState::Streaming).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: SessionState::Connecting,
                to: SessionState::Streaming
            }
        ));
        assert_eq!(
            machine.state(),
            SessionState::Error(FailureKind::InvalidTransition)
        );
    }

    #[test]
    fn test_backwards_is_invalid() {
        let mut machine = SessionStateMachine::new();
        machine.advance(SessionState::Connecting).unwrap();
        machine.advance(SessionState::ServiceDiscovery).unwrap();
        assert!(machine.advance(SessionState::Connecting).is_err());
    }

    #[test]
    fn test_idle_may_close_directly() {
        let mut machine = SessionStateMachine::new();
        assert!(machine.advance(SessionState::Closed).is_ok());
    }

    #[test]
    fn test_idle_may_not_disconnect() {
        let mut machine = SessionStateMachine::new();
        assert!(machine.advance(SessionState::Disconnecting).is_err());
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let mut machine = SessionStateMachine::new();
        machine.advance(SessionState::Connecting).unwrap();
        assert_eq!(
            machine.fail(FailureKind::Timeout),
            SessionState::Error(FailureKind::Timeout)
        );
        // A later failure does not overwrite the first.
        assert_eq!(
            machine.fail(FailureKind::Transport),
            SessionState::Error(FailureKind::Timeout)
        );
        assert!(machine.advance(SessionState::Closed).is_err());
        assert_eq!(machine.state(), SessionState::Error(FailureKind::Timeout));
    }

    #[test]
    fn test_observer_sees_changes() {
        let (tx, rx) = watch::channel(SessionState::Closed);
        let mut machine = SessionStateMachine::with_observer(tx);
        assert_eq!(*rx.borrow(), SessionState::Idle);
        machine.advance(SessionState::Connecting).unwrap();
        assert_eq!(*rx.borrow(), SessionState::Connecting);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::ServiceDiscovery.to_string(), "ServiceDiscovery");
        assert_eq!(
            SessionState::Error(FailureKind::Timeout).to_string(),
            "Error(Timeout)"
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(
            SessionConfig::default()
                .connect_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            SessionConfig::default()
                .idle_timeout(Some(Duration::ZERO))
                .validate()
                .is_err()
        );
        assert!(SessionConfig::default().idle_timeout(None).validate().is_ok());
        assert!(SessionConfig::default().event_capacity(0).validate().is_err());
        assert!(
            SessionConfig::default()
                .event_capacity(MAX_EVENT_CAPACITY + 1)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn any_state() -> impl Strategy<Value = SessionState> {
        prop_oneof![
            Just(SessionState::Idle),
            Just(SessionState::Connecting),
            Just(SessionState::ServiceDiscovery),
            Just(SessionState::CharacteristicDiscovery),
            Just(SessionState::Subscribing),
            Just(SessionState::Streaming),
            Just(SessionState::Disconnecting),
            Just(SessionState::Closed),
            Just(SessionState::Error(FailureKind::Timeout)),
            Just(SessionState::Error(FailureKind::Disconnected)),
        ]
    }

    fn rank(state: SessionState) -> u8 {
        match state {
            SessionState::Idle => 0,
            SessionState::Connecting => 1,
            SessionState::ServiceDiscovery => 2,
            SessionState::CharacteristicDiscovery => 3,
            SessionState::Subscribing => 4,
            SessionState::Streaming => 5,
            SessionState::Disconnecting => 6,
            SessionState::Closed | SessionState::Error(_) => 7,
        }
    }

    proptest! {
        #[test]
        fn transitions_only_move_forward(targets in proptest::collection::vec(any_state(), 0..20)) {
            let mut machine = SessionStateMachine::new();
            for target in targets {
                let before = machine.state();
                match machine.advance(target) {
                    Ok(after) => {
                        prop_assert!(rank(after) > rank(before));
                        prop_assert_eq!(machine.state(), target);
                    }
                    Err(Error::InvalidTransition { from, to }) => {
                        prop_assert_eq!(from, before);
                        prop_assert_eq!(to, target);
                        prop_assert!(machine.state().is_terminal());
                    }
                    Err(other) => prop_assert!(false, "unexpected error {other}"),
                }
            }
        }
    }
}
