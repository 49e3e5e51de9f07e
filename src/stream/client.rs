//! Resumable stream transport.
//!
//! `StreamTransport` issues the stream-initiating HTTP request, decodes the
//! response body into events, watches liveness, and transparently resumes
//! an interrupted stream with exponential backoff.
//!
//! All transport state is mutated on a single background worker task. Each
//! physical connection is read by its own reader task which forwards decoded
//! frames to the worker; the reader is stopped through a
//! [`CancellationToken`] whenever the connection is torn down.

use std::cell::Cell;
use std::fmt;
use std::future::pending;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::{with_timeout, BackoffPolicy};
use crate::stream::codec::{Frame, FrameDecoder};
use crate::stream::listener::{Listeners, Subscription};
use crate::stream::proto::{ProtocolError, StreamEvent, StreamRequest};
use crate::stream::session::TransportSession;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Path appended to the base URL for the stream-initiating request.
pub const DEFAULT_STREAM_PATH: &str = "/api/chat/stream";

/// Default values for [`TransportConfig`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransportDefaults;

impl TransportDefaults {
    /// Silence tolerated before a connection is treated as dead.
    pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(60_000);
    /// Failed connections are resumed unless disabled.
    pub const AUTO_RECONNECT: bool = true;
    /// Reconnects allowed per failure streak.
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
    /// Delay before the first reconnect.
    pub const RECONNECT_DELAY: Duration = Duration::from_millis(1_000);
    /// Ceiling for the doubling reconnect delay.
    pub const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(10_000);
    /// Bound on opening a connection.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Liveness checks per heartbeat timeout window.
    pub const LIVENESS_CHECKS_PER_TIMEOUT: u32 = 6;
}

/// Options recognised by [`StreamTransport::new`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Endpoint root of the stream-producing service.
    pub base_url: String,
    /// Path of the stream-initiating call, joined onto `base_url`.
    pub stream_path: String,
    /// Maximum silence tolerated before the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Whether failed connections are resumed automatically.
    pub auto_reconnect: bool,
    /// Reconnect attempts allowed per failure streak.
    pub max_reconnect_attempts: u32,
    /// Base unit of the exponential backoff.
    pub reconnect_delay: Duration,
    /// Upper bound of the exponential backoff.
    pub max_reconnect_delay: Duration,
    /// Bound on establishing the connection and receiving response headers.
    pub connect_timeout: Duration,
}

impl TransportConfig {
    /// Creates a config for `base_url` with every other option at its default.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().to_string(),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            heartbeat_timeout: TransportDefaults::HEARTBEAT_TIMEOUT,
            auto_reconnect: TransportDefaults::AUTO_RECONNECT,
            max_reconnect_attempts: TransportDefaults::MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: TransportDefaults::RECONNECT_DELAY,
            max_reconnect_delay: TransportDefaults::MAX_RECONNECT_DELAY,
            connect_timeout: TransportDefaults::CONNECT_TIMEOUT,
        }
    }

    /// Sets the path of the stream-initiating request.
    pub fn with_stream_path(mut self, path: impl Into<String>) -> Self {
        self.stream_path = path.into();
        self
    }

    /// Sets the maximum silence before the connection is considered dead.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Enables or disables automatic resumption after failures.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Sets how many reconnects are tried before giving up.
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Sets the base delay of the exponential backoff.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Caps the exponential backoff delay.
    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    /// Sets the connect and response-header timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Backoff policy derived from the reconnect options.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.max_reconnect_attempts,
            self.reconnect_delay,
            self.max_reconnect_delay,
        )
    }

    /// Period of the liveness check, a fraction of the heartbeat timeout.
    pub fn liveness_check_interval(&self) -> Duration {
        let period = self.heartbeat_timeout / TransportDefaults::LIVENESS_CHECKS_PER_TIMEOUT;
        period.max(Duration::from_millis(1))
    }

    /// Resolves the full URL of the stream-initiating request.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason,
        };
        let base = Url::parse(&self.base_url).map_err(|err| invalid(err.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme `{}`", base.scheme())));
        }

        let path = format!(
            "{}/{}",
            base.path().trim_end_matches('/'),
            self.stream_path.trim_start_matches('/')
        );
        let mut endpoint = base.clone();
        endpoint.set_path(&path);
        Ok(endpoint)
    }

    fn validate(&self) -> Result<Url, ConfigError> {
        if self.heartbeat_timeout.is_zero() {
            return Err(ConfigError::ZeroHeartbeatTimeout);
        }
        self.endpoint()
    }
}

/// Errors returned when a transport cannot be constructed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid base url `{url}`: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("heartbeat timeout must be greater than zero")]
    ZeroHeartbeatTimeout,

    #[error("failed to build http client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("stream transport must be created inside a tokio runtime")]
    NoRuntime,
}

/// Coarse classification of [`TransportError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// The physical connection could not be established.
    OpenFailure,
    /// An established connection failed or went silent.
    StreamFailure,
    /// A single frame could not be decoded. Recovered locally.
    ParseFailure,
    /// The reconnect budget is spent. Terminal.
    ReconnectExhausted,
}

/// Errors produced by stream transport and protocol handling.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network failure while sending the request.
    #[error("stream request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Response headers did not arrive in time.
    #[error("stream request timed out after {timeout:?}")]
    OpenTimeout { timeout: Duration },

    /// Server answered with a non-success status.
    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Server answered without a streamable body.
    #[error("stream response has no body")]
    EmptyBody,

    /// Network failure while reading the body.
    #[error("stream read failed: {0}")]
    Read(#[source] reqwest::Error),

    /// No frame arrived within the heartbeat timeout.
    #[error("no frame received for {elapsed:?} (heartbeat timeout {timeout:?})")]
    HeartbeatTimeout { elapsed: Duration, timeout: Duration },

    /// Frame could not be decoded.
    #[error("malformed frame: {0}")]
    Parse(#[from] ProtocolError),

    /// Automatic reconnection gave up.
    #[error("reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Request(_) | Self::OpenTimeout { .. } | Self::HttpStatus { .. } | Self::EmptyBody => {
                ErrorKind::OpenFailure
            }
            Self::Read(_) | Self::HeartbeatTimeout { .. } => {
                ErrorKind::StreamFailure
            }
            Self::Parse(_) => ErrorKind::ParseFailure,
            Self::ReconnectExhausted { .. } => ErrorKind::ReconnectExhausted,
        }
    }

    /// Returns true when the transport will not recover on its own.
    pub fn is_terminal(&self) -> bool {
        self.kind() == ErrorKind::ReconnectExhausted
    }
}

/// Lifecycle of the current physical connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Nothing sent yet, or explicitly disconnected.
    Idle,
    /// Request issued, no frame received yet.
    Connecting,
    /// At least one frame received on the open connection.
    Streaming,
    /// Waiting for the reconnect timer.
    Reconnecting { attempt: u32, delay: Duration },
    /// Server finished the stream.
    ClosedClean,
    /// Connection failed and will not be resumed automatically.
    ClosedError,
}

thread_local! {
    // Set while listeners run on the worker, so transport calls made from a
    // listener do not wait on the delivery lock they are running under.
    static DELIVERING: Cell<bool> = const { Cell::new(false) };
}

struct Control {
    epoch: u64,
    active: Option<CancellationToken>,
}

/// State shared between transport handles and the worker.
struct Shared {
    session: Mutex<TransportSession>,
    control: Mutex<Control>,
    delivery: Mutex<()>,
    state: watch::Sender<ConnectionState>,
    messages: Listeners<StreamEvent>,
    errors: Listeners<TransportError>,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            session: Mutex::new(TransportSession::new()),
            control: Mutex::new(Control {
                epoch: 0,
                active: None,
            }),
            delivery: Mutex::new(()),
            state,
            messages: Listeners::new("message"),
            errors: Listeners::new("error"),
        }
    }

    fn session(&self) -> MutexGuard<'_, TransportSession> {
        lock(&self.session)
    }

    /// Starts a new epoch: cancels the active connection and invalidates
    /// anything the worker still holds for the previous one.
    fn begin_epoch(&self, state: ConnectionState) -> u64 {
        let _delivery = (!DELIVERING.with(Cell::get)).then(|| lock(&self.delivery));
        let mut control = lock(&self.control);
        control.epoch += 1;
        if let Some(token) = control.active.take() {
            token.cancel();
        }
        self.state.send_replace(state);
        control.epoch
    }

    fn is_current(&self, epoch: u64) -> bool {
        lock(&self.control).epoch == epoch
    }

    fn install_connection(&self, epoch: u64, token: CancellationToken) -> bool {
        let mut control = lock(&self.control);
        if control.epoch != epoch {
            return false;
        }
        if let Some(previous) = control.active.replace(token) {
            previous.cancel();
        }
        true
    }

    fn set_state(&self, epoch: u64, state: ConnectionState) {
        let control = lock(&self.control);
        if control.epoch == epoch {
            self.state.send_replace(state);
        }
    }

    fn deliver_message(&self, epoch: u64, event: &StreamEvent) {
        self.deliver(epoch, || {
            self.messages.emit_while(event, || self.is_current(epoch))
        });
    }

    fn deliver_error(&self, epoch: u64, error: &TransportError) {
        self.deliver(epoch, || {
            self.errors.emit_while(error, || self.is_current(epoch))
        });
    }

    fn deliver(&self, epoch: u64, emit: impl FnOnce()) {
        let _delivery = lock(&self.delivery);
        if !self.is_current(epoch) {
            return;
        }
        let previous = DELIVERING.with(|flag| flag.replace(true));
        emit();
        DELIVERING.with(|flag| flag.set(previous));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Command {
    Open { epoch: u64 },
    Disconnect { epoch: u64 },
}

/// Resumable event-stream client.
///
/// Handles are cheap to clone and share one worker. The worker stops and the
/// active connection is cancelled once every handle is dropped.
#[derive(Clone)]
pub struct StreamTransport {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl StreamTransport {
    /// Validates `config` and spawns the transport worker on the current
    /// tokio runtime.
    pub fn new(config: TransportConfig) -> Result<Self, ConfigError> {
        let endpoint = config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(ConfigError::HttpClient)?;

        let shared = Arc::new(Shared::new());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let worker = Worker::new(config, endpoint, http, Arc::clone(&shared), commands_rx);
        runtime.spawn(worker.run());

        Ok(Self {
            shared,
            commands: commands_tx,
        })
    }

    /// Starts a new logical request.
    ///
    /// Any existing connection is torn down before this returns; no event
    /// from it is delivered afterwards. Failures are reported to error
    /// listeners, never to the caller.
    pub fn send(&self, prompt: impl Into<String>) {
        self.start(prompt.into(), None);
    }

    /// Like [`StreamTransport::send`], forwarding a caller-supplied
    /// `resume_path` hint with every attempt.
    pub fn send_with_resume_path(&self, prompt: impl Into<String>, resume_path: impl Into<String>) {
        self.start(prompt.into(), Some(resume_path.into()));
    }

    fn start(&self, prompt: String, resume_path: Option<String>) {
        let epoch = self.shared.begin_epoch(ConnectionState::Connecting);
        self.shared.session().begin_send(prompt, resume_path);
        if self.commands.send(Command::Open { epoch }).is_err() {
            warn!(event = "transport_worker_stopped", command = "open");
        }
    }

    /// Terminates the connection and cancels any pending reconnect.
    ///
    /// Idempotent. No listener is invoked again until the next send.
    pub fn disconnect(&self) {
        let epoch = self.shared.begin_epoch(ConnectionState::Idle);
        let _ = self.commands.send(Command::Disconnect { epoch });
    }

    /// Registers a message listener. Heartbeats are never delivered.
    pub fn on_message<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.shared.messages.subscribe(listener)
    }

    /// Registers an error listener.
    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.shared.errors.subscribe(listener)
    }

    /// True while a connection is open and has received a frame.
    pub fn connected(&self) -> bool {
        *self.shared.state.borrow() == ConnectionState::Streaming
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver notified on every connection state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.shared.session().conversation_id().map(str::to_string)
    }

    pub fn set_conversation_id(&self, conversation_id: impl Into<String>) {
        self.shared.session().set_conversation_id(conversation_id);
    }

    /// Forgets conversation, cursor and reconnect counter.
    ///
    /// Does not disconnect; call [`StreamTransport::disconnect`] for a clean
    /// break.
    pub fn clear_conversation(&self) {
        self.shared.session().clear_conversation();
    }

    /// Snapshot of the resume state.
    pub fn session(&self) -> TransportSession {
        self.shared.session().clone()
    }
}

impl fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransport")
            .field("state", &self.state())
            .field("session", &*self.shared.session())
            .finish()
    }
}

struct Signal {
    connection: u64,
    body: SignalBody,
}

enum SignalBody {
    Frame(Result<Frame, ProtocolError>),
    Ended(Result<(), TransportError>),
}

/// Bookkeeping for the current physical connection.
struct Connection {
    id: u64,
    cancel: CancellationToken,
    last_frame_at: Instant,
    received_frame: bool,
    resume_cursor: Option<String>,
}

struct Worker {
    config: TransportConfig,
    policy: BackoffPolicy,
    endpoint: Url,
    http: Client,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    signals_tx: mpsc::UnboundedSender<Signal>,
    signals: mpsc::UnboundedReceiver<Signal>,
    epoch: u64,
    next_connection: u64,
    connection: Option<Connection>,
    liveness: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
    exhausted_reported: bool,
}

impl Worker {
    fn new(
        config: TransportConfig,
        endpoint: Url,
        http: Client,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (signals_tx, signals) = mpsc::unbounded_channel();
        Self {
            policy: config.backoff_policy(),
            config,
            endpoint,
            http,
            shared,
            commands,
            signals_tx,
            signals,
            epoch: 0,
            next_connection: 0,
            connection: None,
            liveness: None,
            reconnect: None,
            exhausted_reported: false,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(signal) = self.signals.recv() => self.handle_signal(signal),
                _ = tick(&mut self.liveness) => self.check_liveness(),
                _ = fire(&mut self.reconnect) => self.reconnect_now(),
            }
        }

        self.teardown_connection();
        debug!(event = "transport_worker_stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open { epoch } => {
                if !self.shared.is_current(epoch) {
                    debug!(event = "send_superseded", epoch);
                    return;
                }
                self.epoch = epoch;
                self.teardown_connection();
                self.reconnect = None;
                self.exhausted_reported = false;
                self.open_connection(false);
            }
            Command::Disconnect { epoch } => {
                if !self.shared.is_current(epoch) {
                    return;
                }
                self.epoch = epoch;
                self.teardown_connection();
                self.reconnect = None;
                debug!(event = "transport_disconnected");
            }
        }
    }

    fn open_connection(&mut self, resume: bool) {
        let Some(request) = self.shared.session().request(resume) else {
            return;
        };

        let cancel = CancellationToken::new();
        if !self.shared.install_connection(self.epoch, cancel.clone()) {
            return;
        }

        self.next_connection += 1;
        let id = self.next_connection;
        self.connection = Some(Connection {
            id,
            cancel: cancel.clone(),
            last_frame_at: Instant::now(),
            received_frame: false,
            resume_cursor: if resume { request.cursor.clone() } else { None },
        });
        self.liveness = Some(liveness_interval(self.config.liveness_check_interval()));
        self.shared.set_state(self.epoch, ConnectionState::Connecting);

        info!(
            event = "stream_opening",
            connection = id,
            resume,
            cursor = request.cursor.as_deref().unwrap_or("")
        );

        let reader = Reader {
            http: self.http.clone(),
            endpoint: self.endpoint.clone(),
            request,
            open_timeout: self.config.connect_timeout,
            connection: id,
            signals: self.signals_tx.clone(),
        };
        tokio::spawn(reader.run(cancel));
    }

    fn handle_signal(&mut self, signal: Signal) {
        let is_active = self
            .connection
            .as_ref()
            .is_some_and(|connection| connection.id == signal.connection);
        if !is_active || !self.shared.is_current(self.epoch) {
            return;
        }

        match signal.body {
            SignalBody::Frame(Ok(frame)) => self.handle_frame(frame),
            SignalBody::Frame(Err(err)) => {
                self.touch();
                warn!(event = "frame_dropped", error = %err);
            }
            SignalBody::Ended(Ok(())) => {
                let received = self
                    .connection
                    .as_ref()
                    .is_some_and(|connection| connection.received_frame);
                if received {
                    self.close_clean();
                } else {
                    self.fail(TransportError::EmptyBody);
                }
            }
            SignalBody::Ended(Err(err)) => self.fail(err),
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        self.touch();
        let event = match StreamEvent::from_frame(&frame) {
            Ok(event) => event,
            Err(err) => {
                warn!(event = "frame_dropped", error = %err);
                return;
            }
        };

        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        let first_frame = !connection.received_frame;
        connection.received_frame = true;
        let replayed = event.id.is_some() && event.id == connection.resume_cursor;

        if first_frame {
            self.shared.session().reset_reconnect_attempts();
            self.exhausted_reported = false;
            self.shared.set_state(self.epoch, ConnectionState::Streaming);
        }

        if replayed && !event.is_heartbeat() {
            debug!(event = "replayed_frame_skipped", id = event.id.as_deref().unwrap_or(""));
            return;
        }

        self.shared.session().observe(&event);
        if event.is_heartbeat() {
            return;
        }
        self.shared.deliver_message(self.epoch, &event);
    }

    fn touch(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            connection.last_frame_at = Instant::now();
        }
    }

    fn check_liveness(&mut self) {
        let Some(connection) = self.connection.as_ref() else {
            self.liveness = None;
            return;
        };

        let elapsed = connection.last_frame_at.elapsed();
        let timeout = self.config.heartbeat_timeout;
        if elapsed > timeout {
            warn!(
                event = "heartbeat_timeout",
                connection = connection.id,
                elapsed_ms = elapsed.as_millis() as u64
            );
            self.fail(TransportError::HeartbeatTimeout { elapsed, timeout });
        }
    }

    fn close_clean(&mut self) {
        self.teardown_connection();
        self.shared.set_state(self.epoch, ConnectionState::ClosedClean);
        debug!(event = "stream_completed");
    }

    fn fail(&mut self, error: TransportError) {
        self.teardown_connection();
        warn!(event = "stream_failed", kind = ?error.kind(), error = %error);
        let exhausted = self.schedule_reconnect();
        self.shared.deliver_error(self.epoch, &error);
        if let Some(exhausted) = exhausted {
            self.shared.deliver_error(self.epoch, &exhausted);
        }
    }

    /// Arms the reconnect timer, or settles in `ClosedError` when the stream
    /// will not be resumed. Returns the exhaustion error the first time the
    /// attempt ceiling is hit.
    fn schedule_reconnect(&mut self) -> Option<TransportError> {
        if self.reconnect.is_some() {
            debug!(event = "reconnect_already_pending");
            return None;
        }

        let attempts = {
            let session = self.shared.session();
            if !self.config.auto_reconnect || session.last_request().is_none() {
                drop(session);
                self.shared.set_state(self.epoch, ConnectionState::ClosedError);
                return None;
            }
            session.reconnect_attempts()
        };

        if self.policy.is_exhausted(attempts) {
            self.shared.set_state(self.epoch, ConnectionState::ClosedError);
            if self.exhausted_reported {
                return None;
            }
            self.exhausted_reported = true;
            warn!(event = "reconnect_exhausted", attempts);
            return Some(TransportError::ReconnectExhausted { attempts });
        }

        let delay = self.policy.delay_for_attempt(attempts);
        let attempt = self.shared.session().record_reconnect_attempt();
        self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
        self.shared
            .set_state(self.epoch, ConnectionState::Reconnecting { attempt, delay });
        info!(
            event = "reconnect_scheduled",
            attempt,
            delay_ms = delay.as_millis() as u64
        );
        None
    }

    fn reconnect_now(&mut self) {
        self.reconnect = None;
        if !self.shared.is_current(self.epoch) {
            return;
        }
        self.open_connection(true);
    }

    fn teardown_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.cancel.cancel();
        }
        self.liveness = None;
    }
}

fn liveness_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

/// Reads one physical connection and forwards what it decodes.
struct Reader {
    http: Client,
    endpoint: Url,
    request: StreamRequest,
    open_timeout: Duration,
    connection: u64,
    signals: mpsc::UnboundedSender<Signal>,
}

impl Reader {
    async fn run(self, cancel: CancellationToken) {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = self.stream() => outcome,
        };
        self.emit(SignalBody::Ended(outcome));
    }

    async fn stream(&self) -> Result<(), TransportError> {
        let send = self
            .http
            .post(self.endpoint.clone())
            .header(ACCEPT, "text/event-stream")
            .json(&self.request)
            .send();
        let response = with_timeout(self.open_timeout, send)
            .await
            .map_err(|_| TransportError::OpenTimeout {
                timeout: self.open_timeout,
            })?
            .map_err(TransportError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }
        if status == StatusCode::NO_CONTENT || response.content_length() == Some(0) {
            return Err(TransportError::EmptyBody);
        }

        let mut decoder = FrameDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(TransportError::Read)?;
            for frame in decoder.decode(&chunk) {
                self.emit(SignalBody::Frame(frame));
            }
        }
        for frame in decoder.finish() {
            self.emit(SignalBody::Frame(frame));
        }
        Ok(())
    }

    fn emit(&self, body: SignalBody) {
        let _ = self.signals.send(Signal {
            connection: self.connection,
            body,
        });
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        detail: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.detail) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::StatusCode;

    use super::{
        summarize_error_body, ConfigError, ErrorKind, StreamTransport, TransportConfig,
        TransportError, DEFAULT_STREAM_PATH,
    };
    use crate::stream::proto::ProtocolError;

    #[test]
    fn config_defaults_match_documented_values() {
        let config = TransportConfig::new("http://localhost:8000");
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(60_000));
        assert!(config.auto_reconnect);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_millis(1_000));
        assert_eq!(config.max_reconnect_delay, Duration::from_millis(10_000));
        assert_eq!(config.stream_path, DEFAULT_STREAM_PATH);
        assert_eq!(config.liveness_check_interval(), Duration::from_secs(10));
    }

    #[test]
    fn endpoint_joins_base_and_path() {
        let config = TransportConfig::new("https://chat.example/v2/").with_stream_path("/stream");
        assert_eq!(
            config.endpoint().expect("endpoint").as_str(),
            "https://chat.example/v2/stream"
        );

        let root = TransportConfig::new("  http://localhost:8000 \n");
        assert_eq!(
            root.endpoint().expect("endpoint").as_str(),
            "http://localhost:8000/api/chat/stream"
        );
    }

    #[test]
    fn endpoint_rejects_invalid_urls() {
        assert!(matches!(
            TransportConfig::new("not a url").endpoint(),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
        assert!(matches!(
            TransportConfig::new("ftp://files.example").endpoint(),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn liveness_interval_never_reaches_zero() {
        let config =
            TransportConfig::new("http://localhost").with_heartbeat_timeout(Duration::from_nanos(3));
        assert_eq!(config.liveness_check_interval(), Duration::from_millis(1));
    }

    #[test]
    fn transport_requires_runtime() {
        let result = StreamTransport::new(TransportConfig::new("http://localhost:8000"));
        assert!(matches!(result, Err(ConfigError::NoRuntime)));
    }

    #[tokio::test]
    async fn transport_rejects_zero_heartbeat_timeout() {
        let result = StreamTransport::new(
            TransportConfig::new("http://localhost:8000").with_heartbeat_timeout(Duration::ZERO),
        );
        assert!(matches!(result, Err(ConfigError::ZeroHeartbeatTimeout)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_when_never_connected() {
        let transport =
            StreamTransport::new(TransportConfig::new("http://localhost:8000")).expect("transport");
        transport.disconnect();
        transport.disconnect();
        assert!(!transport.connected());
    }

    #[tokio::test]
    async fn conversation_accessors_round_trip() {
        let transport =
            StreamTransport::new(TransportConfig::new("http://localhost:8000")).expect("transport");
        assert_eq!(transport.conversation_id(), None);
        transport.set_conversation_id("conv-9");
        assert_eq!(transport.conversation_id().as_deref(), Some("conv-9"));
        transport.clear_conversation();
        assert_eq!(transport.conversation_id(), None);
        assert!(!transport.connected());
    }

    #[test]
    fn error_kinds_follow_taxonomy() {
        let http = TransportError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            body: "upstream".to_string(),
        };
        assert_eq!(http.kind(), ErrorKind::OpenFailure);
        assert_eq!(TransportError::EmptyBody.kind(), ErrorKind::OpenFailure);
        assert_eq!(
            TransportError::HeartbeatTimeout {
                elapsed: Duration::from_secs(61),
                timeout: Duration::from_secs(60),
            }
            .kind(),
            ErrorKind::StreamFailure
        );
        assert_eq!(
            TransportError::from(ProtocolError::MissingKind).kind(),
            ErrorKind::ParseFailure
        );
        let exhausted = TransportError::ReconnectExhausted { attempts: 5 };
        assert!(exhausted.is_terminal());
        assert!(!http.is_terminal());
    }

    #[test]
    fn error_body_prefers_structured_message() {
        assert_eq!(
            summarize_error_body(r#"{"detail":"conversation not found"}"#),
            "conversation not found"
        );
        let long = "x".repeat(500);
        assert_eq!(summarize_error_body(&long).len(), 220);
    }
}
