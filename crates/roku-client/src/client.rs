//! The debugger client: connection lifecycle, request sending, and the
//! cache of the target's observable state.
//!
//! One client owns one control connection. Writes are serialized behind a
//! mutex; the read side belongs to the control listener thread spawned at
//! connect time. Request ids are allocated under a lock and strictly
//! increase for the life of the session.

use std::collections::HashMap;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use roku_protocol::{
    handshake, Command, ErrCode, ErrorData, FeatureSet, ProtocolFeature, ProtocolVersion, Request,
    RequestArgs, StacktraceResponse, ThreadsResponse, Update, UpdatePayload, UpdateType,
    VariablesResponse, WireReader, WireWriter, DEBUGGER_PORT,
};

use crate::control::{self, PendingRegistry};
use crate::error::ClientError;
use crate::io_listener::IoListener;
use crate::stack_ref::{StackRefTriplet, StackReferenceIds};

/// How to reach the target's control port.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Total time to keep retrying the initial connect; the target's
    /// debug port opens a few seconds after sideload.
    pub connect_budget: Duration,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEBUGGER_PORT,
            connect_budget: Duration::from_secs(60),
        }
    }
}

/// What the front-end callback tells the listener to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Continue,
    /// Stop listening; the session is over.
    Done,
}

/// Event delivered to the front-end callback on the listener thread.
#[derive(Debug)]
pub enum TargetEvent {
    Update(Update),
    /// The control stream died; the session is over.
    ConnectionError(ClientError),
}

/// Front-end callback. Runs on the control listener thread; cache state
/// is already consistent with the delivered update.
pub type UpdateHandler = Box<dyn FnMut(TargetEvent) -> HandlerOutcome + Send>;

/// A structured error reported by the target for a specific request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetError {
    pub err_code: ErrCode,
    pub data: ErrorData,
}

/// Cached outcome of a request: the decoded response, or the structured
/// error the target answered with. Errors are cached too so request
/// chains do not retry a lookup the target already rejected.
pub type CacheEntry<T> = Result<T, TargetError>;

#[derive(Debug, Default)]
pub(crate) struct Caches {
    threads: Option<CacheEntry<ThreadsResponse>>,
    stacktraces: HashMap<u32, CacheEntry<StacktraceResponse>>,
    /// Key: (stack_ref_id, get_child_keys).
    variables: HashMap<(u32, bool), CacheEntry<VariablesResponse>>,
}

impl Caches {
    fn clear(&mut self) {
        self.threads = None;
        self.stacktraces.clear();
        self.variables.clear();
    }
}

pub(crate) struct ClientInner {
    host: String,
    features: FeatureSet,
    control_stream: TcpStream,
    writer: Mutex<WireWriter<TcpStream>>,
    next_request_id: Mutex<u32>,
    pub(crate) pending: PendingRegistry,
    caches: Mutex<Caches>,
    stack_refs: StackReferenceIds,
    io_listener: Mutex<Option<IoListener>>,
    output_sink: Mutex<Option<Box<dyn Write + Send>>>,
    shutting_down: AtomicBool,
}

impl ClientInner {
    pub(crate) fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Open the I/O listener for the port announced by the target.
    pub(crate) fn start_io_listener(&self, io_port: u32) {
        let Some(sink) = lock(&self.output_sink).take() else {
            tracing::warn!("CONNECT_IO_PORT received twice; ignoring");
            return;
        };
        let Ok(port) = u16::try_from(io_port) else {
            tracing::error!(io_port, "bad I/O port from target");
            return;
        };
        match IoListener::start(&self.host, port, sink) {
            Ok(listener) => *lock(&self.io_listener) = Some(listener),
            Err(err) => tracing::error!(error = %err, port, "could not connect to target I/O port"),
        }
    }

    /// Fold an update into the caches. Runs on the listener thread before
    /// the front-end callback fires.
    pub(crate) fn apply_to_caches(&self, update: &Update) {
        match &update.payload {
            // Any unsolicited stop or attach invalidates everything.
            UpdatePayload::AllThreadsStopped { .. } | UpdatePayload::ThreadAttached { .. } => {
                lock(&self.caches).clear();
                return;
            }
            _ => {}
        }

        let Some(request) = &update.request else { return };
        match (&request.args, &update.payload) {
            (RequestArgs::Threads, UpdatePayload::Threads(response)) => {
                lock(&self.caches).threads = Some(Ok(response.clone()));
            }
            (RequestArgs::Threads, UpdatePayload::TargetError(data)) => {
                lock(&self.caches).threads =
                    Some(Err(TargetError { err_code: update.err_code, data: *data }));
            }
            (RequestArgs::Stacktrace { thread_index }, UpdatePayload::Stacktrace(response)) => {
                let mut caches = lock(&self.caches);
                caches.stacktraces.insert(*thread_index, Ok(response.clone()));
                // Coarse: a new stacktrace invalidates all cached variables.
                caches.variables.clear();
            }
            (RequestArgs::Stacktrace { thread_index }, UpdatePayload::TargetError(data)) => {
                let mut caches = lock(&self.caches);
                caches
                    .stacktraces
                    .insert(*thread_index, Err(TargetError { err_code: update.err_code, data: *data }));
                caches.variables.clear();
            }
            (RequestArgs::Variables(args), UpdatePayload::Variables(response)) => {
                let id = self.stack_refs.get_or_allocate(
                    args.thread_index,
                    args.frame_index,
                    &args.variable_path,
                );
                lock(&self.caches)
                    .variables
                    .insert((id, args.get_child_keys), Ok(response.clone()));
            }
            (RequestArgs::Variables(args), UpdatePayload::TargetError(data)) => {
                let id = self.stack_refs.get_or_allocate(
                    args.thread_index,
                    args.frame_index,
                    &args.variable_path,
                );
                lock(&self.caches).variables.insert(
                    (id, args.get_child_keys),
                    Err(TargetError { err_code: update.err_code, data: *data }),
                );
            }
            _ => {}
        }
    }
}

/// Client for one debug session. Cheap to clone; all clones share the
/// same connection and state.
#[derive(Clone)]
pub struct DebuggerClient {
    inner: Arc<ClientInner>,
}

impl DebuggerClient {
    /// Connect to the target's control port, perform the handshake, and
    /// start the control listener.
    ///
    /// `handler` is invoked on the listener thread for every update that
    /// is not consumed internally. `output_sink` receives the running
    /// script's stdout once the target announces its I/O port.
    pub fn connect(
        config: ClientConfig,
        handler: UpdateHandler,
        output_sink: Box<dyn Write + Send>,
    ) -> Result<Self, ClientError> {
        tracing::info!(host = %config.host, port = config.port, "connecting to debug target");
        let stream = connect_with_backoff(&config)?;
        stream.set_nodelay(true).map_err(ClientError::from_io)?;

        let mut reader =
            WireReader::new(stream.try_clone().map_err(ClientError::from_io)?);
        let mut writer =
            WireWriter::new(stream.try_clone().map_err(ClientError::from_io)?);
        let negotiated = handshake::perform(&mut reader, &mut writer)?;
        tracing::info!(
            version = %negotiated.version,
            revision = ?negotiated.version.platform_revision(),
            "connected to debug target"
        );

        let inner = Arc::new(ClientInner {
            host: config.host,
            features: negotiated.features,
            control_stream: stream,
            writer: Mutex::new(writer),
            next_request_id: Mutex::new(1), // 0 means "no request"
            pending: PendingRegistry::new(),
            caches: Mutex::new(Caches::default()),
            stack_refs: StackReferenceIds::new(),
            io_listener: Mutex::new(None),
            output_sink: Mutex::new(Some(output_sink)),
            shutting_down: AtomicBool::new(false),
        });

        let listener_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name("control-listener".into())
            .spawn(move || control::run_listener(listener_inner, reader, handler))
            .map_err(ClientError::from_io)?;

        Ok(Self { inner })
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.inner.features.version()
    }

    pub fn has_feature(&self, feature: ProtocolFeature) -> bool {
        self.inner.features.has(feature)
    }

    pub fn features(&self) -> &FeatureSet {
        &self.inner.features
    }

    /// Send a request. Assigns the next request id, registers a pending
    /// entry, then serializes onto the control socket. Returns the id.
    pub fn send(&self, request: Request) -> Result<u32, ClientError> {
        self.send_inner(request, &[])
    }

    /// Send a request that may be resolved by a stop/attach event rather
    /// than a direct response (the step command behaves this way).
    pub fn send_expecting_stop(&self, request: Request) -> Result<u32, ClientError> {
        self.send_inner(request, &[UpdateType::AllThreadsStopped, UpdateType::ThreadAttached])
    }

    fn send_inner(
        &self,
        mut request: Request,
        allowed_update_types: &[UpdateType],
    ) -> Result<u32, ClientError> {
        if request.request_id != 0 {
            return Err(ClientError::RequestAlreadySent(request.request_id));
        }

        let request_id = {
            let mut next = lock(&self.inner.next_request_id);
            let id = *next;
            *next += 1;
            id
        };
        request.request_id = request_id;
        let command = request.command();

        // Resuming execution makes every cached observation stale.
        if matches!(command, Command::Continue | Command::Step | Command::ExitChannel) {
            lock(&self.inner.caches).clear();
        }

        // Register before writing so a fast response cannot race the
        // registry. Commands that resolve via an asynchronous event get a
        // second entry: the direct acknowledgement consumes the first,
        // the eventual stop/attach update consumes the second.
        self.inner.pending.add(request.clone(), &[]);
        if !allowed_update_types.is_empty() {
            self.inner.pending.add(request.clone(), allowed_update_types);
        }

        let result = {
            let mut writer = lock(&self.inner.writer);
            request.encode(&self.inner.features, &mut writer)
        };
        match result {
            Ok(size) => {
                tracing::debug!(%command, request_id, size, "request sent");
                Ok(request_id)
            }
            Err(err) => {
                self.inner.pending.remove_by_id(request_id);
                Err(err.into())
            }
        }
    }

    pub fn has_pending_request(&self) -> bool {
        self.inner.pending.has_pending()
    }

    pub fn pending_request_count(&self) -> usize {
        self.inner.pending.count()
    }

    /// Latest THREADS outcome, if still valid.
    pub fn threads(&self) -> Option<CacheEntry<ThreadsResponse>> {
        lock(&self.inner.caches).threads.clone()
    }

    /// Latest STACKTRACE outcome for a thread, if still valid.
    pub fn stacktrace(&self, thread_index: u32) -> Option<CacheEntry<StacktraceResponse>> {
        lock(&self.inner.caches).stacktraces.get(&thread_index).cloned()
    }

    /// Latest VARIABLES outcome for a (thread, frame, path) lookup, if
    /// still valid.
    pub fn variables(
        &self,
        thread_index: u32,
        frame_index: u32,
        variable_path: &[String],
        get_child_keys: bool,
    ) -> Option<CacheEntry<VariablesResponse>> {
        let id = self.inner.stack_refs.lookup(thread_index, frame_index, variable_path)?;
        lock(&self.inner.caches).variables.get(&(id, get_child_keys)).cloned()
    }

    /// Stack reference id for a triplet, allocating on first use.
    pub fn stack_ref_id(&self, thread_index: u32, frame_index: u32, path: &[String]) -> u32 {
        self.inner.stack_refs.get_or_allocate(thread_index, frame_index, path)
    }

    /// Stack reference id for a child of an existing reference.
    pub fn child_stack_ref_id(&self, parent_id: u32, child_name: &str) -> Result<u32, ClientError> {
        self.inner.stack_refs.get_child(parent_id, child_name)
    }

    /// Resolve a stack reference id back to its triplet.
    pub fn decode_stack_ref_id(&self, id: u32) -> Result<StackRefTriplet, ClientError> {
        self.inner.stack_refs.decode(id)
    }

    /// Capture complete stdout lines from the target (test support).
    pub fn set_save_output(&self, enable: bool) {
        if let Some(listener) = lock(&self.inner.io_listener).as_ref() {
            listener.set_save_output(enable);
        }
    }

    /// Drain captured stdout lines (test support).
    pub fn take_output_lines(&self) -> Vec<String> {
        lock(&self.inner.io_listener)
            .as_ref()
            .map(IoListener::take_output_lines)
            .unwrap_or_default()
    }

    /// End the session: best-effort EXIT_CHANNEL, then close both
    /// connections. Listener threads observe EOF and exit.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("shutting down debugger client");
        if let Err(err) = self.send(Request::new(RequestArgs::ExitChannel)) {
            tracing::debug!(error = %err, "exit_channel not delivered");
        }
        let _ = self.inner.control_stream.shutdown(Shutdown::Both);
        if let Some(listener) = lock(&self.inner.io_listener).take() {
            listener.disconnect();
        }
    }
}

impl std::fmt::Debug for DebuggerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebuggerClient")
            .field("host", &self.inner.host)
            .field("version", &self.inner.features.version())
            .field("pending", &self.inner.pending.count())
            .finish()
    }
}

/// Retry the connect until the budget runs out. The target starts
/// listening a moment after the channel is sideloaded, so early refusals
/// are expected; delays grow from 100 ms by 1.1x, capped at 1 s.
fn connect_with_backoff(config: &ClientConfig) -> Result<TcpStream, ClientError> {
    let deadline = Instant::now() + config.connect_budget;
    let mut delay = Duration::from_millis(100);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ClientError::ConnectTimeout {
                host: config.host.clone(),
                port: config.port,
                budget: config.connect_budget,
            });
        }

        match TcpStream::connect((config.host.as_str(), config.port)) {
            Ok(stream) => {
                tracing::debug!(attempt, "control connection established");
                return Ok(stream);
            }
            Err(err) => {
                tracing::trace!(attempt, error = %err, "connect attempt failed");
            }
        }

        thread::sleep(delay.min(remaining));
        delay = Duration::from_millis(((delay.as_millis() as f64) * 1.1) as u64)
            .min(Duration::from_secs(1));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
