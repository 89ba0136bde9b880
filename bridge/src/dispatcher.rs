//! Command dispatcher — the caller-facing half of the bridge.
//!
//! Each logical invocation gets a fresh correlation id, is sent across the
//! transport, and is raced against a timeout. Streaming calls that carry a
//! progress sink use a heartbeat timeout: when the timer fires it looks at
//! how long ago the last progress event arrived and either times the call
//! out or rearms for the remaining time. A transport disconnect is retried
//! exactly once with a new id.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::DispatcherConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::{trim_eol, CommandRequest, CorrelationId, Failure, ProgressEvent, Reply, Request};
use crate::redact::command_line;
use crate::transport::{Transport, TransportError};

/// Largest correlation id handed out before wrapping back to 1.
pub const MAX_CORRELATION_ID: u32 = u32::MAX;

/// Receives progress text for one invocation.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, text: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Use `DispatcherConfig::timeout_seconds`.
    #[default]
    Default,
    After(Duration),
    /// Never time out.
    Disabled,
}

/// Per-call options
#[derive(Clone, Default)]
pub struct InvokeOptions {
    pub cwd: Option<String>,
    pub timeout: Timeout,
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub watch_progress: bool,
    /// Log a timeout at debug level instead of error; the call still fails.
    pub timeout_expected: bool,
}

impl InvokeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout_secs(mut self, seconds: u64) -> Self {
        self.timeout = Timeout::After(Duration::from_secs(seconds));
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = Timeout::Disabled;
        self
    }

    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn watch_progress(mut self) -> Self {
        self.watch_progress = true;
        self
    }

    pub fn timeout_expected(mut self) -> Self {
        self.timeout_expected = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Execute,
    Spawn,
    Which,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::Execute => "execute",
            Method::Spawn => "spawn",
            Method::Which => "which",
        }
    }
}

/// Everything about a logical invocation that survives a retry.
struct Invocation {
    method: Method,
    command: String,
    args: Vec<String>,
    directory: String,
    watch_progress: bool,
    timeout: Option<Duration>,
    expected: bool,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl Invocation {
    fn request(&self, id: CorrelationId) -> Request {
        let command = || CommandRequest {
            id,
            directory: self.directory.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            watch_progress: self.watch_progress,
        };
        match self.method {
            Method::Execute => Request::Execute(command()),
            Method::Spawn => Request::Spawn(command()),
            Method::Which => Request::Which {
                command: self.command.clone(),
            },
        }
    }

    /// Heartbeat policy applies to streaming calls with somewhere to send progress.
    fn heartbeat(&self) -> bool {
        self.method == Method::Spawn && self.sink.is_some()
    }

    fn line(&self) -> String {
        command_line(&self.command, &self.args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Retry,
}

enum AttemptError {
    Disconnected,
    Failed(BridgeError),
}

/// Why a call stopped waiting without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    TimedOut,
    /// `Dispatcher::kill` got there first.
    Killed,
}

enum Deadline {
    Rearm(Duration),
    Expired(Expiry),
}

/// Bookkeeping for an outstanding invocation.
struct PendingInvocation {
    sink: Option<Arc<dyn ProgressSink>>,
    settled: AtomicBool,
    /// Guards the kill-or-rearm decision as well as the timestamp.
    last_progress: Mutex<Instant>,
}

impl PendingInvocation {
    fn new(sink: Option<Arc<dyn ProgressSink>>) -> Self {
        Self {
            sink,
            settled: AtomicBool::new(false),
            last_progress: Mutex::new(Instant::now()),
        }
    }

    /// Returns true the first time only.
    fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }

    fn record_progress(&self, data: &str) -> bool {
        {
            let mut last = self.last_progress.lock().unwrap_or_else(PoisonError::into_inner);
            if self.settled.load(Ordering::SeqCst) {
                return false;
            }
            *last = Instant::now();
        }
        if let Some(sink) = &self.sink {
            sink.on_progress(trim_eol(data));
        }
        true
    }

    /// Decide, under the progress lock, whether to time out or wait longer.
    fn remaining(&self, limit: Duration) -> Deadline {
        let last = self.last_progress.lock().unwrap_or_else(PoisonError::into_inner);
        let gap = last.elapsed();
        if gap < limit && !self.settled.load(Ordering::SeqCst) {
            Deadline::Rearm(limit - gap)
        } else {
            Deadline::Expired(self.expire())
        }
    }

    fn expire(&self) -> Expiry {
        if self.settle() {
            Expiry::TimedOut
        } else {
            Expiry::Killed
        }
    }
}

type PendingTable = DashMap<CorrelationId, Arc<PendingInvocation>>;

/// Monotonic id source, wrapping to 1 after [`MAX_CORRELATION_ID`].
struct IdAllocator {
    last: Mutex<u32>,
}

impl IdAllocator {
    fn starting_after(last: u32) -> Self {
        Self {
            last: Mutex::new(last),
        }
    }

    fn next(&self, outstanding: &PendingTable) -> CorrelationId {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            *last = if *last >= MAX_CORRELATION_ID { 1 } else { *last + 1 };
            let id = CorrelationId(*last);
            if !outstanding.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Caller-facing dispatcher
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    pending: Arc<PendingTable>,
    ids: IdAllocator,
    config: DispatcherConfig,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Must be called inside a tokio runtime; starts the progress router.
    pub fn new(transport: Arc<dyn Transport>, config: DispatcherConfig) -> Self {
        let pending = Arc::new(PendingTable::new());
        let shutdown = CancellationToken::new();
        tokio::spawn(route_progress(
            transport.subscribe(),
            Arc::clone(&pending),
            shutdown.clone(),
        ));
        Self {
            transport,
            pending,
            ids: IdAllocator::starting_after(0),
            config,
            shutdown,
        }
    }

    /// Buffered mode: output is reported once the process exits.
    pub async fn execute<S: AsRef<str>>(
        &self,
        command: &str,
        args: &[S],
        options: InvokeOptions,
    ) -> Result<String> {
        let invocation = self.prepare(Method::Execute, command, args, options)?;
        self.dispatch(invocation).await
    }

    /// Streaming mode: error-stream output is forwarded as progress.
    pub async fn spawn<S: AsRef<str>>(
        &self,
        command: &str,
        args: &[S],
        options: InvokeOptions,
    ) -> Result<String> {
        let invocation = self.prepare(Method::Spawn, command, args, options)?;
        self.dispatch(invocation).await
    }

    /// Absolute path of `command` as resolved on the executor side.
    pub async fn which(&self, command: &str) -> Result<String> {
        let invocation = Invocation {
            method: Method::Which,
            command: command.to_string(),
            args: Vec::new(),
            directory: String::new(),
            watch_progress: false,
            timeout: Some(self.config.timeout()),
            expected: false,
            sink: None,
        };
        self.dispatch(invocation).await
    }

    /// Forget `id` and ask the executor to tear its process tree down.
    /// Fire-and-forget: kill failures are only logged.
    pub fn kill(&self, id: CorrelationId) {
        if let Some((_, entry)) = self.pending.remove(&id) {
            entry.settle();
        }
        self.request_kill(id);
    }

    /// Number of invocations still waiting to settle
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    fn prepare<S: AsRef<str>>(
        &self,
        method: Method,
        command: &str,
        args: &[S],
        options: InvokeOptions,
    ) -> Result<Invocation> {
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();

        let cwd = options
            .cwd
            .or_else(|| self.config.default_cwd.clone())
            .ok_or(BridgeError::MissingWorkingDirectory)?;

        let watch_progress = options.progress.is_some()
            || options.watch_progress
            || (self.config.infer_progress_from_args
                && args.iter().any(|a| *a == self.config.progress_flag));

        let timeout = match options.timeout {
            Timeout::Disabled => None,
            Timeout::After(limit) if !limit.is_zero() => Some(limit),
            _ => Some(self.config.timeout()),
        };

        Ok(Invocation {
            method,
            command: command.to_string(),
            args,
            directory: normalize_path(&cwd, self.config.windows_paths),
            watch_progress,
            timeout,
            expected: options.timeout_expected,
            sink: options.progress,
        })
    }

    async fn dispatch(&self, invocation: Invocation) -> Result<String> {
        let mut attempt = Attempt::First;
        loop {
            match self.attempt(&invocation).await {
                Ok(out) => return Ok(out),
                Err(AttemptError::Failed(err)) => return Err(err),
                Err(AttemptError::Disconnected) if attempt == Attempt::First => {
                    warn!(
                        "Transport disconnected during cmd-{}: {}, retrying once",
                        invocation.method.as_str(),
                        invocation.line()
                    );
                    attempt = Attempt::Retry;
                }
                Err(AttemptError::Disconnected) => return Err(BridgeError::Disconnected),
            }
        }
    }

    async fn attempt(&self, inv: &Invocation) -> std::result::Result<String, AttemptError> {
        let id = self.ids.next(&self.pending);
        let entry = Arc::new(PendingInvocation::new(inv.sink.clone()));
        self.pending.insert(id, Arc::clone(&entry));
        let started = Instant::now();

        if self.config.log_commands {
            debug!(
                "cmd-{}{} ({id}): {} -> {}",
                inv.method.as_str(),
                if inv.watch_progress { "-watch" } else { "" },
                inv.directory,
                inv.line()
            );
        }

        let call = self.transport.call(inv.request(id));
        let reply = match inv.timeout {
            None => Ok(call.await),
            Some(limit) => race(call, &entry, limit, inv.heartbeat()).await,
        };
        self.pending.remove(&id);

        let reply = match reply {
            Ok(reply) => reply,
            Err(Expiry::TimedOut) => {
                return Err(AttemptError::Failed(self.timed_out(id, inv, started)))
            }
            Err(Expiry::Killed) => {
                debug!("cmd-{} ({id}) was killed before it settled", inv.method.as_str());
                return Err(AttemptError::Failed(BridgeError::Killed(id)));
            }
        };
        entry.settle();
        self.finish(id, inv, started, reply)
    }

    fn finish(
        &self,
        id: CorrelationId,
        inv: &Invocation,
        started: Instant,
        reply: std::result::Result<Reply, TransportError>,
    ) -> std::result::Result<String, AttemptError> {
        let elapsed = started.elapsed().as_millis();
        match reply {
            Ok(Ok(out)) => {
                if self.config.log_commands {
                    debug!("cmd-{}-out ({elapsed}ms;ID={id})", inv.method.as_str());
                }
                Ok(trim_eol(&out).to_string())
            }
            Ok(Err(failure)) => {
                if self.config.log_commands {
                    debug!("cmd-{}-fail ({elapsed}ms;ID={id}): {:?}", inv.method.as_str(), failure.kind);
                }
                let failure = Failure {
                    message: trim_eol(&failure.message).to_string(),
                    ..failure
                };
                Err(AttemptError::Failed(BridgeError::from_failure(failure, &inv.command)))
            }
            Err(TransportError::Disconnected) => Err(AttemptError::Disconnected),
            Err(e) => Err(AttemptError::Failed(BridgeError::Transport(e.to_string()))),
        }
    }

    fn timed_out(&self, id: CorrelationId, inv: &Invocation, started: Instant) -> BridgeError {
        let err = BridgeError::Timeout {
            mode: inv.method.as_str().to_string(),
            command: inv.line(),
            expected: inv.expected,
        };
        let elapsed = started.elapsed().as_millis();
        if inv.expected {
            debug!("{err} (ID={id}, {elapsed}ms, expected)");
        } else {
            error!("{err} (ID={id}, {elapsed}ms)");
        }

        // the process is still alive; take it and its children down
        if inv.method != Method::Which {
            self.request_kill(id);
        }
        err
    }

    fn request_kill(&self, id: CorrelationId) {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            match transport.call(Request::Kill { id }).await {
                Ok(Ok(_)) => debug!("Kill requested for {id}"),
                Ok(Err(failure)) => error!("Kill of {id} failed: {}", failure.message),
                Err(e) => error!("Kill of {id} not delivered: {e}"),
            }
        });
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Wait for `call`, or give up per the timeout policy.
async fn race<F>(
    call: F,
    entry: &PendingInvocation,
    limit: Duration,
    heartbeat: bool,
) -> std::result::Result<F::Output, Expiry>
where
    F: Future,
{
    tokio::pin!(call);
    let mut deadline = Instant::now() + limit;
    loop {
        tokio::select! {
            biased;
            reply = &mut call => return Ok(reply),
            _ = tokio::time::sleep_until(deadline) => {
                if !heartbeat {
                    return Err(entry.expire());
                }
                match entry.remaining(limit) {
                    Deadline::Rearm(rest) => {
                        debug!("Progress seen {}ms ago, delaying timeout", (limit - rest).as_millis());
                        deadline = Instant::now() + rest;
                    }
                    Deadline::Expired(expiry) => return Err(expiry),
                }
            }
        }
    }
}

async fn route_progress(
    mut events: broadcast::Receiver<ProgressEvent>,
    pending: Arc<PendingTable>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => route_event(&pending, &event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Progress router lagged, {n} events dropped")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn route_event(pending: &PendingTable, event: &ProgressEvent) {
    let entry = pending
        .get(&event.correlation_id)
        .map(|entry| Arc::clone(entry.value()));
    match entry {
        Some(entry) => {
            if !entry.record_progress(&event.data) {
                debug!("Progress for settled invocation {} dropped", event.correlation_id);
            }
        }
        None => warn!(
            "Progress sent for a non-existing process ({})",
            event.correlation_id
        ),
    }
}

/// Convert `c:/foo/bar` to `c:\foo\bar` when targeting a Windows shell.
pub fn normalize_path(path: &str, windows: bool) -> String {
    if windows {
        path.replace('/', "\\")
    } else {
        path.to_string()
    }
}
