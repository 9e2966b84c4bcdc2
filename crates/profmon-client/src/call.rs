//! Call lifecycle.
//!
//! A [`Call`] is one outstanding request or subscription. It lives in its
//! session's call table from submission until it is destroyed, which
//! happens exactly once:
//!
//! ```text
//! Pending ──result (one-shot)──────────────────────────────┐
//!    │                                                     ▼
//!    ├──result (subscription)──> ActiveSubscription ──> Destroyed
//!    │                              │  (stream end, error, unsubscribe)
//!    └──error / unsubscribe / teardown ───────────────────▲
//! ```
//!
//! The call talks back to its session only through a [`CallNotifier`]: to
//! queue a control frame and to report that it is gone.

use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{CallError, ProtocolError};
use crate::protocol::{CallId, Outbound};

/// Invoked with each result of a call.
pub type ResultHandler = Box<dyn FnMut(Value) + Send>;

/// Invoked once with the error that ended a call.
pub type ErrorHandler = Box<dyn FnOnce(CallError) + Send>;

/// Caller-supplied callbacks of a call.
///
/// ```
/// use profmon_client::Handlers;
///
/// let handlers = Handlers::new(|value| println!("frame: {value}"))
///     .on_error(|err| eprintln!("camera stream failed: {err}"));
/// # drop(handlers);
/// ```
pub struct Handlers {
    on_result: ResultHandler,
    on_error: Option<ErrorHandler>,
}

impl Handlers {
    /// Handlers with a result callback and no error callback.
    ///
    /// Errors then go to the diagnostic log.
    pub fn new<F>(on_result: F) -> Self
    where
        F: FnMut(Value) + Send + 'static,
    {
        Self {
            on_result: Box::new(on_result),
            on_error: None,
        }
    }

    /// Set the error callback.
    #[must_use]
    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: FnOnce(CallError) + Send + 'static,
    {
        self.on_error = Some(Box::new(on_error));
        self
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

/// One-shot request or streaming subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Exactly one reply expected
    OneShot,
    /// Replies until stream end, error or unsubscribe
    Subscription,
}

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Submitted, no reply yet
    Pending,
    /// Subscription that has delivered at least one result
    ActiveSubscription,
    /// Terminal
    Destroyed,
}

/// What a call (or the auth handshake) tells its session.
#[derive(Debug)]
pub(crate) enum SessionNotice {
    /// Queue a control frame on behalf of `call_id`.
    Enqueue { call_id: CallId, frame: Vec<u8> },
    /// The call terminated; drop it from the table.
    Destroyed(CallId),
    /// The auth call with this id succeeded.
    Authenticated(CallId),
    /// The auth call with this id failed.
    AuthRejected { call_id: CallId, reason: String },
}

/// Narrow channel from a call back to its session.
#[derive(Clone, Debug)]
pub(crate) struct CallNotifier {
    tx: mpsc::UnboundedSender<SessionNotice>,
}

impl CallNotifier {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionNotice>) -> Self {
        Self { tx }
    }

    // A closed channel means the session is gone; nothing left to tell it.
    fn notify(&self, notice: SessionNotice) {
        let _ = self.tx.send(notice);
    }

    fn enqueue(&self, call_id: CallId, frame: Vec<u8>) {
        self.notify(SessionNotice::Enqueue { call_id, frame });
    }

    fn destroyed(&self, call_id: CallId) {
        self.notify(SessionNotice::Destroyed(call_id));
    }

    pub(crate) fn authenticated(&self, call_id: CallId) {
        self.notify(SessionNotice::Authenticated(call_id));
    }

    pub(crate) fn auth_rejected(&self, call_id: CallId, reason: String) {
        self.notify(SessionNotice::AuthRejected { call_id, reason });
    }
}

/// Caller's reference to a submitted call.
///
/// Cheap to clone; used with [`crate::Session::unsubscribe`] and to check
/// whether the call has finished.
#[derive(Debug, Clone)]
pub struct CallHandle {
    id: CallId,
    api_name: Arc<str>,
    kind: CallKind,
    finished: Arc<AtomicBool>,
}

impl CallHandle {
    /// Correlation id.
    #[must_use]
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Remote operation name.
    #[must_use]
    pub fn api_name(&self) -> &str {
        &self.api_name
    }

    /// Returns true for subscriptions.
    #[must_use]
    pub fn is_subscription(&self) -> bool {
        self.kind == CallKind::Subscription
    }

    /// Returns true once the call has been destroyed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// One outstanding request or subscription.
pub struct Call {
    id: CallId,
    api_name: Arc<str>,
    api_args: Option<Value>,
    kind: CallKind,
    state: CallState,
    transmitted: bool,
    on_result: Option<ResultHandler>,
    on_error: Option<ErrorHandler>,
    notifier: CallNotifier,
    finished: Arc<AtomicBool>,
}

impl Call {
    pub(crate) fn new(
        notifier: CallNotifier,
        id: CallId,
        kind: CallKind,
        api_name: impl Into<Arc<str>>,
        api_args: Value,
        handlers: Handlers,
    ) -> Self {
        Self {
            id,
            api_name: api_name.into(),
            api_args: Some(api_args),
            kind,
            state: CallState::Pending,
            transmitted: false,
            on_result: Some(handlers.on_result),
            on_error: handlers.on_error,
            notifier,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle sharing this call's finished flag.
    #[must_use]
    pub fn handle(&self) -> CallHandle {
        CallHandle {
            id: self.id,
            api_name: Arc::clone(&self.api_name),
            kind: self.kind,
            finished: Arc::clone(&self.finished),
        }
    }

    /// Correlation id.
    #[must_use]
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Remote operation name.
    #[must_use]
    pub fn api_name(&self) -> &str {
        &self.api_name
    }

    /// Returns true for subscriptions.
    #[must_use]
    pub fn is_subscription(&self) -> bool {
        self.kind == CallKind::Subscription
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Returns true once destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state == CallState::Destroyed
    }

    /// Returns true once the request frame reached the transport.
    #[must_use]
    pub fn is_transmitted(&self) -> bool {
        self.transmitted
    }

    pub(crate) fn mark_transmitted(&mut self) {
        self.transmitted = true;
    }

    /// Encode the CALL or SUBSCRIBE frame.
    ///
    /// The arguments are consumed: a second invocation fails rather than
    /// resending stale state.
    pub fn message(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let api_args = self
            .api_args
            .take()
            .ok_or(ProtocolError::ArgumentsConsumed(self.id))?;
        Outbound::Request {
            call_id: self.id,
            api_name: &self.api_name,
            api_args: &api_args,
            subscribe: self.is_subscription(),
        }
        .encode()
    }

    /// Deliver a result. `None` is the null result.
    ///
    /// One-shot calls pass it on (as `Value::Null` when null) and finish.
    /// Subscriptions pass on non-null results and finish on null, the
    /// stream-end sentinel.
    pub fn handle_result(&mut self, api_result: Option<Value>) {
        if self.is_destroyed() {
            return;
        }
        match (self.kind, api_result) {
            (CallKind::OneShot, value) => {
                self.invoke_result(value.unwrap_or(Value::Null));
                self.destroy();
            }
            (CallKind::Subscription, Some(value)) => {
                self.state = CallState::ActiveSubscription;
                self.invoke_result(value);
            }
            (CallKind::Subscription, None) => {
                tracing::debug!(call_id = self.id, api_name = %self.api_name, "stream ended");
                self.destroy();
            }
        }
    }

    fn invoke_result(&mut self, value: Value) {
        if let Some(on_result) = self.on_result.as_mut() {
            on_result(value);
        }
    }

    /// Deliver an error. Always terminal.
    pub fn handle_error(&mut self, error: CallError) {
        if self.is_destroyed() {
            return;
        }
        match self.on_error.take() {
            Some(on_error) => on_error(error),
            None => tracing::error!(
                call_id = self.id,
                api_name = %self.api_name,
                %error,
                "call error"
            ),
        }
        self.destroy();
    }

    /// Cancel a subscription without waiting for the peer.
    ///
    /// Queues an UNSUBSCRIBE frame and destroys the call. On a one-shot call
    /// this is misuse and is delivered as [`CallError::NotSubscription`].
    pub fn unsubscribe(&mut self) {
        if self.is_destroyed() {
            return;
        }
        if !self.is_subscription() {
            let error = CallError::NotSubscription(self.api_name.to_string());
            self.handle_error(error);
            return;
        }
        match (Outbound::Unsubscribe { call_id: self.id }).encode() {
            Ok(frame) => self.notifier.enqueue(self.id, frame),
            Err(e) => tracing::warn!(call_id = self.id, "failed to encode unsubscribe: {}", e),
        }
        self.destroy();
    }

    /// Mark destroyed and tell the session. Idempotent.
    pub fn destroy(&mut self) {
        if self.is_destroyed() {
            return;
        }
        self.state = CallState::Destroyed;
        self.on_result = None;
        self.on_error = None;
        self.finished.store(true, Ordering::Release);
        self.notifier.destroyed(self.id);
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("api_name", &self.api_name)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("transmitted", &self.transmitted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording_handlers(log: &Log) -> Handlers {
        let results = Arc::clone(log);
        let errors = Arc::clone(log);
        Handlers::new(move |v| results.lock().unwrap().push(format!("result:{v}")))
            .on_error(move |e| errors.lock().unwrap().push(format!("error:{e}")))
    }

    fn new_call(kind: CallKind, log: &Log) -> (Call, mpsc::UnboundedReceiver<SessionNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let call = Call::new(
            CallNotifier::new(tx),
            1,
            kind,
            "echo",
            json!("hi"),
            recording_handlers(log),
        );
        (call, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionNotice>) -> Vec<SessionNotice> {
        let mut notices = Vec::new();
        while let Ok(n) = rx.try_recv() {
            notices.push(n);
        }
        notices
    }

    #[test]
    fn test_message_consumes_arguments() {
        let log = Log::default();
        let (mut call, _rx) = new_call(CallKind::OneShot, &log);

        let frame = call.message().unwrap();
        let decoded: Value = rmp_serde::from_slice(&frame).unwrap();
        assert_eq!(decoded["api_args"], json!("hi"));
        assert_eq!(decoded["msg_kind"], json!(777_501));

        assert!(matches!(
            call.message(),
            Err(ProtocolError::ArgumentsConsumed(1))
        ));
    }

    #[test]
    fn test_one_shot_result_destroys_once() {
        let log = Log::default();
        let (mut call, mut rx) = new_call(CallKind::OneShot, &log);
        let handle = call.handle();

        call.handle_result(Some(json!("hi")));
        call.handle_result(Some(json!("again")));
        call.handle_error(CallError::Api("late".into()));

        assert_eq!(*log.lock().unwrap(), vec!["result:\"hi\"".to_string()]);
        assert!(call.is_destroyed());
        assert!(handle.is_finished());
        let notices = drain(&mut rx);
        assert_eq!(notices.len(), 1);
        assert!(matches!(notices[0], SessionNotice::Destroyed(1)));
    }

    #[test]
    fn test_one_shot_null_result_is_delivered() {
        let log = Log::default();
        let (mut call, _rx) = new_call(CallKind::OneShot, &log);
        call.handle_result(None);
        assert_eq!(*log.lock().unwrap(), vec!["result:null".to_string()]);
        assert!(call.is_destroyed());
    }

    #[test]
    fn test_subscription_streams_until_sentinel() {
        let log = Log::default();
        let (mut call, mut rx) = new_call(CallKind::Subscription, &log);

        call.handle_result(Some(json!(1)));
        assert_eq!(call.state(), CallState::ActiveSubscription);
        call.handle_result(Some(json!(2)));
        call.handle_result(None);
        call.handle_result(Some(json!(3)));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["result:1".to_string(), "result:2".to_string()]
        );
        assert_eq!(call.state(), CallState::Destroyed);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_error_is_terminal_for_subscription() {
        let log = Log::default();
        let (mut call, _rx) = new_call(CallKind::Subscription, &log);

        call.handle_result(Some(json!(1)));
        call.handle_error(CallError::Api("camera offline".into()));
        call.handle_result(Some(json!(2)));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["result:1".to_string(), "error:camera offline".to_string()]
        );
    }

    #[test]
    fn test_unsubscribe_enqueues_then_destroys() {
        let log = Log::default();
        let (mut call, mut rx) = new_call(CallKind::Subscription, &log);

        call.unsubscribe();
        call.unsubscribe();

        let notices = drain(&mut rx);
        assert_eq!(notices.len(), 2);
        match &notices[0] {
            SessionNotice::Enqueue { call_id, frame } => {
                assert_eq!(*call_id, 1);
                let decoded: Value = rmp_serde::from_slice(frame).unwrap();
                assert_eq!(decoded, json!({"call_id": 1, "msg_kind": 777_504}));
            }
            other => panic!("unexpected notice {other:?}"),
        }
        assert!(matches!(notices[1], SessionNotice::Destroyed(1)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe_one_shot_reports_misuse() {
        let log = Log::default();
        let (mut call, mut rx) = new_call(CallKind::OneShot, &log);

        call.unsubscribe();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["error:call to api_name=echo is not a subscription".to_string()]
        );
        let notices = drain(&mut rx);
        assert_eq!(notices.len(), 1);
        assert!(matches!(notices[0], SessionNotice::Destroyed(1)));
    }

    #[test]
    #[traced_test]
    fn test_missing_error_handler_logs() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut call = Call::new(
            CallNotifier::new(tx),
            12,
            CallKind::OneShot,
            "set_field",
            json!({}),
            Handlers::new(|_| {}),
        );
        call.handle_error(CallError::Api("bad value".into()));

        assert!(call.is_destroyed());
        assert!(logs_contain("call error"));
        assert!(logs_contain("bad value"));
    }

    #[test]
    fn test_destroy_is_idempotent_without_session() {
        let log = Log::default();
        let (mut call, rx) = new_call(CallKind::OneShot, &log);
        drop(rx);
        call.destroy();
        call.destroy();
        assert!(call.is_destroyed());
        assert!(log.lock().unwrap().is_empty());
    }
}
