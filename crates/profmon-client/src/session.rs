//! RPC session over one persistent transport.
//!
//! A [`Session`] is a cheap, cloneable handle to an event loop task that owns
//! everything mutable: the transport, the auth flag, the outbound queue and the
//! call table. Callers never block; `call` and `subscribe` hand a [`Call`] to
//! the loop and return a [`CallHandle`] at once. Handlers run on the loop
//! task, one at a time.
//!
//! # Lifecycle
//!
//! 1. The loop opens a transport and immediately sends the reserved
//!    `authenticate_connection` call, bypassing the queue.
//! 2. Until that call succeeds every other frame waits in the outbound queue.
//! 3. Auth success resets the backoff and flushes the queue in FIFO order.
//! 4. Auth failure, connect failure, send failure or any close/error: the
//!    transport is dropped, every live call fails with the same
//!    [`CallError::Transport`], and a reconnect is scheduled after the current
//!    backoff delay. This never gives up.
//!
//! # Example
//!
//! ```no_run
//! use profmon_client::{EndpointAddress, Handlers, Session, SessionConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), profmon_client::ClientError> {
//! let session = Session::connect(EndpointAddress::default(), SessionConfig::default())?;
//!
//! let handle = session.subscribe(
//!     "plot",
//!     json!({"camera": "DEV_CAM"}),
//!     Handlers::new(|image| println!("frame: {image}"))
//!         .on_error(|err| eprintln!("stream failed: {err}")),
//! );
//!
//! // ...later
//! session.unsubscribe(&handle);
//! session.destroy();
//! # Ok(())
//! # }
//! ```

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::call::{Call, CallHandle, CallKind, CallNotifier, Handlers, SessionNotice};
use crate::connection::EndpointAddress;
use crate::error::{self, CallError, TransportError};
use crate::protocol::{self, CallId, Inbound, AUTH_API_NAME};
use crate::reconnect::{Backoff, ConnectionState, ReconnectConfig};
use crate::transport::{Connection, Connector, Transport, TransportEvent, WebSocketConnector};

/// Session settings.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Reconnect backoff policy
    pub reconnect: ReconnectConfig,
    /// Credential presented in the auth handshake (usually `None`)
    pub auth_token: Option<String>,
}

enum Command {
    Submit(Call),
    Unsubscribe(CallId),
    Destroy,
}

/// Handle to a running session.
///
/// Dropping the last clone destroys the session.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    next_call_id: Arc<AtomicU64>,
    notifier: CallNotifier,
    state: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start a session against a WebSocket endpoint.
    ///
    /// Fails with [`ClientError::InvalidConfig`](crate::ClientError) if the
    /// reconnect policy does not validate. Must be called from within a tokio
    /// runtime.
    pub fn connect(endpoint: EndpointAddress, config: SessionConfig) -> error::Result<Self> {
        Self::with_connector(WebSocketConnector::new(), endpoint, config)
    }

    /// Start a session with any [`Connector`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_connector<C: Connector>(
        connector: C,
        endpoint: EndpointAddress,
        config: SessionConfig,
    ) -> error::Result<Self> {
        config.reconnect.validate()?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let next_call_id = Arc::new(AtomicU64::new(1));
        let notifier = CallNotifier::new(notice_tx);

        let span = tracing::info_span!("session", endpoint = %endpoint);
        let actor = SessionActor::new(
            Arc::new(connector),
            endpoint,
            config,
            Arc::clone(&next_call_id),
            notifier.clone(),
            notice_rx,
            state_tx,
        );
        tokio::spawn(actor.run(command_rx).instrument(span));

        Ok(Self {
            commands: command_tx,
            next_call_id,
            notifier,
            state: state_rx,
        })
    }

    /// Issue a one-shot call.
    ///
    /// Exactly one of the handlers fires, unless the session is destroyed
    /// first, in which case the error handler gets
    /// [`CallError::SessionDestroyed`].
    pub fn call(
        &self,
        api_name: impl Into<Arc<str>>,
        api_args: Value,
        handlers: Handlers,
    ) -> CallHandle {
        self.submit(CallKind::OneShot, api_name.into(), api_args, handlers)
    }

    /// Open a subscription. The result handler fires for every non-null
    /// result until stream end, an error, or [`Session::unsubscribe`].
    pub fn subscribe(
        &self,
        api_name: impl Into<Arc<str>>,
        api_args: Value,
        handlers: Handlers,
    ) -> CallHandle {
        self.submit(CallKind::Subscription, api_name.into(), api_args, handlers)
    }

    /// Cancel a subscription. Idempotent; takes effect locally at once.
    pub fn unsubscribe(&self, handle: &CallHandle) {
        if handle.is_finished() {
            return;
        }
        let _ = self.commands.send(Command::Unsubscribe(handle.id()));
    }

    /// Tear the session down. Idempotent.
    pub fn destroy(&self) {
        let _ = self.commands.send(Command::Destroy);
    }

    /// Issue a one-shot call and wait for its outcome.
    pub async fn call_async(
        &self,
        api_name: impl Into<Arc<str>>,
        api_args: Value,
    ) -> Result<Value, CallError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let error_tx = tx.clone();
        let _handle = self.call(
            api_name,
            api_args,
            Handlers::new(move |value| {
                let _ = tx.send(Ok(value));
            })
            .on_error(move |error| {
                let _ = error_tx.send(Err(error));
            }),
        );
        rx.recv().await.unwrap_or(Err(CallError::SessionDestroyed))
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the session is authenticated.
    pub async fn wait_connected(&self) -> Result<(), CallError> {
        self.wait_for(ConnectionState::is_connected).await
    }

    /// Wait until the session has been destroyed.
    pub async fn wait_destroyed(&self) {
        let _ = self.wait_for(|_| false).await;
    }

    async fn wait_for(&self, done: impl Fn(&ConnectionState) -> bool) -> Result<(), CallError> {
        let mut state = self.state.clone();
        loop {
            {
                let current = state.borrow_and_update();
                if done(&current) {
                    return Ok(());
                }
                if current.is_destroyed() {
                    return Err(CallError::SessionDestroyed);
                }
            }
            if state.changed().await.is_err() {
                return Err(CallError::SessionDestroyed);
            }
        }
    }

    fn submit(
        &self,
        kind: CallKind,
        api_name: Arc<str>,
        api_args: Value,
        handlers: Handlers,
    ) -> CallHandle {
        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let call = Call::new(self.notifier.clone(), id, kind, api_name, api_args, handlers);
        let handle = call.handle();
        if let Err(mpsc::error::SendError(Command::Submit(mut call))) =
            self.commands.send(Command::Submit(call))
        {
            call.handle_error(CallError::SessionDestroyed);
        }
        handle
    }
}

/// Frame waiting for the auth gate to open.
#[derive(Debug)]
struct QueuedFrame {
    call_id: CallId,
    frame: Vec<u8>,
    /// UNSUBSCRIBE rather than the call's own request
    control: bool,
}

/// The event loop. Sole owner of all session state.
struct SessionActor {
    connector: Arc<dyn Connector>,
    endpoint: EndpointAddress,
    auth_token: Option<String>,
    next_call_id: Arc<AtomicU64>,
    notifier: CallNotifier,
    notices: mpsc::UnboundedReceiver<SessionNotice>,
    transport: Option<Box<dyn Transport>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    connecting: Option<BoxFuture<'static, Result<Connection, TransportError>>>,
    retry_at: Option<Instant>,
    authenticated: bool,
    auth_call: Option<CallId>,
    backoff: Backoff,
    outbound: VecDeque<QueuedFrame>,
    calls: HashMap<CallId, Call>,
    state: watch::Sender<ConnectionState>,
    destroyed: bool,
}

impl SessionActor {
    fn new(
        connector: Arc<dyn Connector>,
        endpoint: EndpointAddress,
        config: SessionConfig,
        next_call_id: Arc<AtomicU64>,
        notifier: CallNotifier,
        notices: mpsc::UnboundedReceiver<SessionNotice>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            connector,
            endpoint,
            auth_token: config.auth_token,
            next_call_id,
            notifier,
            notices,
            transport: None,
            events: None,
            connecting: None,
            retry_at: None,
            authenticated: false,
            auth_call: None,
            backoff: Backoff::new(config.reconnect),
            outbound: VecDeque::new(),
            calls: HashMap::new(),
            state,
            destroyed: false,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.retry_at = Some(Instant::now());

        while !self.destroyed {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All session handles dropped");
                        self.destroy();
                    }
                },
                result = next_connection(&mut self.connecting) => {
                    self.handle_connect_result(result);
                }
                event = next_event(&mut self.events) => self.handle_event(event),
                () = sleep_until(self.retry_at) => self.start_connect(),
            }
        }

        // Calls submitted after the destroy command never reached the table.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Submit(mut call) = command {
                call.handle_error(CallError::SessionDestroyed);
            }
        }
        debug!("Session event loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit(call) => self.submit(call),
            Command::Unsubscribe(call_id) => {
                if let Some(call) = self.live_call_mut(call_id) {
                    call.unsubscribe();
                }
            }
            Command::Destroy => self.destroy(),
        }
        self.process_notices();
    }

    fn submit(&mut self, mut call: Call) {
        if self.destroyed {
            call.handle_error(CallError::SessionDestroyed);
            return;
        }
        let frame = match call.message() {
            Ok(frame) => frame,
            Err(e) => {
                call.handle_error(CallError::Protocol(e.to_string()));
                return;
            }
        };
        let call_id = call.id();
        debug!(call_id, api_name = call.api_name(), "queued");
        self.calls.insert(call_id, call);
        self.outbound.push_back(QueuedFrame {
            call_id,
            frame,
            control: false,
        });
        self.flush();
    }

    /// Send queued frames, oldest first, once authenticated.
    fn flush(&mut self) {
        if !self.authenticated {
            return;
        }
        while let Some(queued) = self.outbound.pop_front() {
            let Some(transport) = self.transport.as_mut() else {
                self.outbound.push_front(queued);
                return;
            };
            if let Err(e) = transport.send(queued.frame) {
                self.transport_failed(format!("send failed: {e}"));
                return;
            }
            if !queued.control {
                if let Some(call) = self.calls.get_mut(&queued.call_id) {
                    call.mark_transmitted();
                }
            }
        }
    }

    fn start_connect(&mut self) {
        self.retry_at = None;
        let connector = Arc::clone(&self.connector);
        let endpoint = self.endpoint.clone();
        self.connecting = Some(Box::pin(async move { connector.connect(&endpoint).await }));
        self.set_state(ConnectionState::Connecting);
    }

    fn handle_connect_result(&mut self, result: Result<Connection, TransportError>) {
        self.connecting = None;
        match result {
            Ok(connection) => self.connection_opened(connection),
            Err(e) => self.transport_failed(e.to_string()),
        }
        self.process_notices();
    }

    fn connection_opened(&mut self, connection: Connection) {
        info!("Connected to {}, authenticating", self.endpoint);
        self.transport = Some(connection.transport);
        self.events = Some(connection.events);
        self.authenticated = false;

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let on_ok = self.notifier.clone();
        let on_rejected = self.notifier.clone();
        let mut auth = Call::new(
            self.notifier.clone(),
            call_id,
            CallKind::OneShot,
            AUTH_API_NAME,
            protocol::auth_args(self.auth_token.as_deref()),
            Handlers::new(move |_| on_ok.authenticated(call_id))
                .on_error(move |e| on_rejected.auth_rejected(call_id, e.to_string())),
        );
        self.auth_call = Some(call_id);
        self.set_state(ConnectionState::Authenticating);

        // The auth call is the one frame allowed through the closed gate.
        let sent = auth
            .message()
            .map_err(|e| format!("failed to encode auth call: {e}"))
            .and_then(|frame| match self.transport.as_mut() {
                Some(transport) => transport.send(frame).map_err(|e| e.to_string()),
                None => Err(TransportError::Closed.to_string()),
            });
        match sent {
            Ok(()) => {
                auth.mark_transmitted();
                self.calls.insert(call_id, auth);
            }
            Err(reason) => {
                self.auth_call = None;
                auth.destroy();
                self.transport_failed(reason);
            }
        }
    }

    fn auth_succeeded(&mut self) {
        info!("Authenticated to {}", self.endpoint);
        self.authenticated = true;
        self.auth_call = None;
        self.backoff.reset();
        self.set_state(ConnectionState::Connected {
            connected_at: Instant::now(),
        });
        self.flush();
    }

    fn handle_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Message(frame)) => self.handle_frame(&frame),
            Some(TransportEvent::Closed { reason, clean }) => {
                debug!(clean, "transport closed: {}", reason);
                self.transport_failed(reason);
            }
            None => self.transport_failed("transport closed".to_string()),
        }
        self.process_notices();
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let inbound = match protocol::decode_inbound(frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Discarding undecodable frame ({} bytes): {}", frame.len(), e);
                return;
            }
        };
        let call_id = inbound.call_id();
        let Some(call) = self.live_call_mut(call_id) else {
            // Normal when a reply races a local unsubscribe.
            debug!(call_id, "no live call; discarding frame");
            return;
        };
        if !call.is_transmitted() {
            warn!(call_id, "reply for a call that was never sent; discarding");
            return;
        }
        match inbound {
            Inbound::Reply {
                outcome: Ok(result),
                ..
            } => call.handle_result(result),
            Inbound::Reply {
                outcome: Err(error),
                ..
            } => call.handle_error(CallError::Api(error)),
            Inbound::UnsubscribeAck { .. } => {
                if call.is_subscription() {
                    call.handle_result(None);
                } else {
                    call.handle_error(CallError::Protocol(
                        "unsubscribe of non-subscription".to_string(),
                    ));
                }
            }
            Inbound::Invalid { reason, .. } => call.handle_error(CallError::Protocol(reason)),
        }
    }

    fn live_call_mut(&mut self, call_id: CallId) -> Option<&mut Call> {
        if self.calls.get(&call_id).is_some_and(Call::is_destroyed) {
            self.calls.remove(&call_id);
        }
        self.calls.get_mut(&call_id)
    }

    /// Apply everything calls reported since the last event.
    fn process_notices(&mut self) {
        while let Ok(notice) = self.notices.try_recv() {
            match notice {
                SessionNotice::Enqueue { call_id, frame } => {
                    if self.destroyed {
                        continue;
                    }
                    self.outbound.push_back(QueuedFrame {
                        call_id,
                        frame,
                        control: true,
                    });
                    self.flush();
                }
                SessionNotice::Destroyed(call_id) => self.forget_call(call_id),
                SessionNotice::Authenticated(call_id) => {
                    if self.auth_call == Some(call_id) {
                        self.auth_succeeded();
                    }
                }
                SessionNotice::AuthRejected { call_id, reason } => {
                    if self.auth_call == Some(call_id) {
                        self.transport_failed(format!("authentication failed: {reason}"));
                    }
                }
            }
        }
    }

    fn forget_call(&mut self, call_id: CallId) {
        self.calls.remove(&call_id);
        // A request the peer never saw needs no unsubscribe either.
        let unsent = self
            .outbound
            .iter()
            .any(|q| q.call_id == call_id && !q.control);
        if unsent {
            self.outbound.retain(|q| q.call_id != call_id);
        }
    }

    /// Drop the transport, fail every call and schedule a reconnect.
    fn transport_failed(&mut self, reason: String) {
        if self.destroyed {
            return;
        }
        self.close_transport();
        self.fail_all_calls(&CallError::Transport(reason.clone()));

        let (attempt, delay) = self.backoff.record_failure();
        let next_retry_at = Instant::now() + delay;
        self.retry_at = Some(next_retry_at);
        warn!(
            attempt,
            "Connection to {} failed: {}; reconnecting in {:.1}s",
            self.endpoint,
            reason,
            delay.as_secs_f64()
        );
        self.set_state(ConnectionState::Reconnecting {
            attempt,
            next_retry_at,
            last_error: reason,
        });
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        info!("Destroying session for {}", self.endpoint);
        self.close_transport();
        self.retry_at = None;
        self.fail_all_calls(&CallError::SessionDestroyed);
        self.destroyed = true;
        self.set_state(ConnectionState::Destroyed);
    }

    fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.events = None;
        self.connecting = None;
        self.authenticated = false;
        self.auth_call = None;
    }

    fn fail_all_calls(&mut self, error: &CallError) {
        self.outbound.clear();
        let mut calls: Vec<Call> = self.calls.drain().map(|(_, call)| call).collect();
        calls.sort_by_key(Call::id);
        for mut call in calls {
            call.handle_error(error.clone());
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

async fn next_connection(
    pending: &mut Option<BoxFuture<'static, Result<Connection, TransportError>>>,
) -> Result<Connection, TransportError> {
    match pending {
        Some(connecting) => connecting.await,
        None => std::future::pending().await,
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_request, encode_reply, MsgKind, PeerRequest};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Default)]
    struct Wire {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<AtomicBool>,
    }

    impl Wire {
        fn requests(&self) -> Vec<PeerRequest> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|f| decode_request(f).unwrap())
                .collect()
        }
    }

    struct MockTransport(Wire);

    impl Transport for MockTransport {
        fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
            if self.0.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.0.sent.lock().unwrap().push(frame);
            Ok(())
        }

        fn close(&mut self) {
            self.0.closed.store(true, Ordering::SeqCst);
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, _: &EndpointAddress) -> Result<Connection, TransportError> {
            Err(TransportError::Connect("connection refused".into()))
        }
    }

    struct Harness {
        actor: SessionActor,
        state: watch::Receiver<ConnectionState>,
        next_id: Arc<AtomicU64>,
    }

    impl Harness {
        fn new() -> Self {
            let (notice_tx, notice_rx) = mpsc::unbounded_channel();
            let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
            let next_id = Arc::new(AtomicU64::new(1));
            let actor = SessionActor::new(
                Arc::new(RefusingConnector),
                EndpointAddress::default(),
                SessionConfig::default(),
                Arc::clone(&next_id),
                CallNotifier::new(notice_tx),
                notice_rx,
                state_tx,
            );
            Self {
                actor,
                state,
                next_id,
            }
        }

        /// Open a mock transport; returns its wire and the auth call id.
        fn open(&mut self) -> (Wire, CallId) {
            let wire = Wire::default();
            let (_events_tx, events) = mpsc::unbounded_channel();
            self.actor.handle_connect_result(Ok(Connection {
                transport: Box::new(MockTransport(wire.clone())),
                events,
            }));
            let auth_id = self.actor.auth_call.expect("auth call pending");
            (wire, auth_id)
        }

        fn submit(&mut self, kind: CallKind, name: &str, log: &Log) -> CallHandle {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let results = Arc::clone(log);
            let errors = Arc::clone(log);
            let call = Call::new(
                self.actor.notifier.clone(),
                id,
                kind,
                name,
                json!({}),
                Handlers::new(move |v| results.lock().unwrap().push(format!("{id}:{v}")))
                    .on_error(move |e| errors.lock().unwrap().push(format!("{id}!{e}"))),
            );
            let handle = call.handle();
            self.actor.handle_command(Command::Submit(call));
            handle
        }

        fn reply(&mut self, call_id: CallId, outcome: Result<&Value, &str>) {
            let frame = encode_reply(call_id, outcome).unwrap();
            self.actor.handle_event(Some(TransportEvent::Message(frame)));
        }
    }

    #[test]
    fn test_auth_gate_holds_calls_until_auth_reply() {
        let mut h = Harness::new();
        let log = Log::default();
        let (wire, auth_id) = h.open();
        assert_eq!(*h.state.borrow(), ConnectionState::Authenticating);

        h.submit(CallKind::OneShot, "first", &log);
        h.submit(CallKind::OneShot, "second", &log);

        let sent = wire.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].api_name.as_deref(), Some(AUTH_API_NAME));
        assert_eq!(sent[0].api_args.as_ref().unwrap()["version"], json!(658_584_001u64));

        h.reply(auth_id, Ok(&json!({})));
        assert!(h.state.borrow().is_connected());

        let names: Vec<_> = wire
            .requests()
            .into_iter()
            .skip(1)
            .map(|r| r.api_name.unwrap())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(h.actor.outbound.is_empty());
        assert!(!h.actor.calls.contains_key(&auth_id));
    }

    #[test]
    fn test_auth_rejection_is_transport_failure() {
        let mut h = Harness::new();
        let log = Log::default();
        let (wire, auth_id) = h.open();
        h.submit(CallKind::OneShot, "echo", &log);

        h.reply(auth_id, Err("bad version"));

        assert!(wire.closed.load(Ordering::SeqCst));
        assert!(h.actor.calls.is_empty());
        assert!(h.actor.outbound.is_empty());
        let state = h.state.borrow().clone();
        assert_eq!(state.label(), "Reconnecting...");
        assert!(state.error_message().unwrap().contains("bad version"));
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(log.lock().unwrap()[0].contains("transport failure"));
    }

    #[test]
    fn test_backoff_resets_only_after_auth() {
        let mut h = Harness::new();

        h.actor.handle_connect_result(Err(TransportError::Connect("refused".into())));
        h.actor.handle_connect_result(Err(TransportError::Connect("refused".into())));
        h.actor.handle_connect_result(Err(TransportError::Connect("refused".into())));
        assert_eq!(h.actor.backoff.failures(), 3);
        assert_eq!(h.actor.backoff.current(), Duration::from_secs(4));

        // Opening alone is not enough
        let (_wire, auth_id) = h.open();
        assert_eq!(h.actor.backoff.failures(), 3);

        h.reply(auth_id, Ok(&Value::Null));
        assert_eq!(h.actor.backoff.failures(), 0);
        assert_eq!(h.actor.backoff.current(), Duration::ZERO);
    }

    #[test]
    fn test_reply_for_unknown_call_is_discarded() {
        let mut h = Harness::new();
        let log = Log::default();
        let (_wire, auth_id) = h.open();
        h.reply(auth_id, Ok(&Value::Null));

        h.reply(999, Ok(&json!("stray")));
        assert!(log.lock().unwrap().is_empty());
        assert!(h.state.borrow().is_connected());
    }

    #[test]
    fn test_reply_before_transmission_is_discarded() {
        let mut h = Harness::new();
        let log = Log::default();
        let (_wire, _auth_id) = h.open();
        let handle = h.submit(CallKind::OneShot, "echo", &log);

        h.reply(handle.id(), Ok(&json!("too early")));

        assert!(log.lock().unwrap().is_empty());
        assert!(!handle.is_finished());
    }

    #[test]
    fn test_unsubscribe_before_auth_purges_queue() {
        let mut h = Harness::new();
        let log = Log::default();
        let (wire, auth_id) = h.open();
        let handle = h.submit(CallKind::Subscription, "ticks", &log);
        assert_eq!(h.actor.outbound.len(), 1);

        h.actor.handle_command(Command::Unsubscribe(handle.id()));
        assert!(handle.is_finished());
        assert!(h.actor.outbound.is_empty());
        assert!(h.actor.calls.get(&handle.id()).is_none());

        h.reply(auth_id, Ok(&Value::Null));
        // Only the auth call ever went out
        assert_eq!(wire.requests().len(), 1);
    }

    #[test]
    fn test_unsubscribe_after_auth_sends_control_frame() {
        let mut h = Harness::new();
        let log = Log::default();
        let (wire, auth_id) = h.open();
        h.reply(auth_id, Ok(&Value::Null));
        let handle = h.submit(CallKind::Subscription, "ticks", &log);

        h.actor.handle_command(Command::Unsubscribe(handle.id()));
        h.actor.handle_command(Command::Unsubscribe(handle.id()));

        let sent = wire.requests();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].kind(), Some(MsgKind::Unsubscribe));
        assert_eq!(sent[2].call_id, handle.id());

        // The peer's late result and ack are both dropped
        h.reply(handle.id(), Ok(&json!(1)));
        let ack = crate::protocol::Outbound::Unsubscribe {
            call_id: handle.id(),
        }
        .encode()
        .unwrap();
        h.actor.handle_event(Some(TransportEvent::Message(ack)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe_ack_for_one_shot_is_protocol_error() {
        let mut h = Harness::new();
        let log = Log::default();
        let (_wire, auth_id) = h.open();
        h.reply(auth_id, Ok(&Value::Null));
        let handle = h.submit(CallKind::OneShot, "echo", &log);

        let ack = crate::protocol::Outbound::Unsubscribe {
            call_id: handle.id(),
        }
        .encode()
        .unwrap();
        h.actor.handle_event(Some(TransportEvent::Message(ack)));

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].contains("unsubscribe of non-subscription"));
        assert!(h.state.borrow().is_connected());
    }

    #[test]
    fn test_send_failure_fails_calls() {
        let mut h = Harness::new();
        let log = Log::default();
        let (wire, auth_id) = h.open();
        h.reply(auth_id, Ok(&Value::Null));

        wire.closed.store(true, Ordering::SeqCst);
        h.submit(CallKind::OneShot, "echo", &log);

        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(log.lock().unwrap()[0].contains("send failed"));
        assert!(h.actor.transport.is_none());
        assert!(h.actor.retry_at.is_some());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut h = Harness::new();
        let log = Log::default();
        let (wire, _auth_id) = h.open();
        h.submit(CallKind::OneShot, "a", &log);
        h.submit(CallKind::Subscription, "b", &log);

        h.actor.handle_command(Command::Destroy);
        h.actor.handle_command(Command::Destroy);

        assert!(wire.closed.load(Ordering::SeqCst));
        assert!(h.actor.calls.is_empty());
        assert!(h.actor.retry_at.is_none());
        assert_eq!(*h.state.borrow(), ConnectionState::Destroyed);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|l| l.ends_with("session destroyed")));

        drop(log);
        let late = Log::default();
        h.submit(CallKind::OneShot, "late", &late);
        assert!(late.lock().unwrap()[0].ends_with("session destroyed"));
    }
}
