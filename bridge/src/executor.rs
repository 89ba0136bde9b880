//! Process executor — runs resolved executables in buffered or streaming
//! mode, forwards error-stream progress, and tears down process trees.
//!
//! Every spawned process is watched by one supervising loop that reads a
//! single channel of [`ProcessEvent`]s (output chunks from the pipe pumps
//! plus the exit status from the waiter). The loop ends once every sender is
//! gone, i.e. both pipes reached EOF and the exit status arrived.

use dashmap::DashMap;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{BridgeError, Result};
use crate::process_tree::ProcessInspector;
use crate::protocol::{CommandRequest, CorrelationId, Failure, Mode, ProgressEvent, Reply, Request};
use crate::redact::{command_line, redact_credentials};
use crate::resolver::PathResolver;

const PROGRESS_CHANNEL_CAPACITY: usize = 1024;
const PUMP_CHUNK_SIZE: usize = 8 * 1024;

/// Bookkeeping for a live process, keyed by correlation id
#[derive(Debug)]
struct ProcessRecord {
    pid: u32,
    command: String,
    started_at: Instant,
}

#[derive(Debug)]
enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(std::io::Result<ExitStatus>),
}

/// Executor side of the bridge
pub struct Executor {
    resolver: PathResolver,
    inspector: Arc<dyn ProcessInspector>,
    records: DashMap<CorrelationId, ProcessRecord>,
    events: broadcast::Sender<ProgressEvent>,
    max_buffer_bytes: usize,
}

impl Executor {
    pub fn new(config: &ExecutorConfig, inspector: Arc<dyn ProcessInspector>) -> Self {
        let (events, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            resolver: PathResolver::new(),
            inspector,
            records: DashMap::new(),
            events,
            max_buffer_bytes: config.max_buffer_bytes,
        }
    }

    /// Progress events for every streaming command that watches progress
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Number of processes currently tracked
    pub fn running_count(&self) -> usize {
        self.records.len()
    }

    /// Serve one request and turn the outcome into a wire reply
    pub async fn handle(&self, request: Request) -> Reply {
        let result = match request {
            Request::Execute(req) => self.execute(req).await,
            Request::Spawn(req) => self.spawn(req).await,
            Request::Which { command } => self.which(&command).map(|p| p.display().to_string()),
            Request::Kill { id } => self.kill(id).map(|()| String::new()),
        };
        result.map_err(Failure::from)
    }

    pub fn which(&self, command: &str) -> Result<PathBuf> {
        self.resolver.resolve(command)
    }

    /// Buffered mode: run through the platform shell and collect everything.
    pub async fn execute(&self, req: CommandRequest) -> Result<String> {
        let program = self.resolver.resolve(&req.command)?;
        let mut cmd = shell_command(&shell_line(&program, &req.args));
        cmd.current_dir(&req.directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = self.start(cmd, &req)?;
        self.supervise(child, &req, Mode::Buffered).await
    }

    /// Streaming mode: argument vector, no shell, stderr forwarded as progress.
    pub async fn spawn(&self, req: CommandRequest) -> Result<String> {
        let program = self.resolver.resolve(&req.command)?;
        let mut cmd = Command::new(&program);
        cmd.args(&req.args)
            .current_dir(&req.directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = self.start(cmd, &req)?;
        // many tools block forever waiting on an open stdin
        drop(child.stdin.take());
        self.supervise(child, &req, Mode::Streaming).await
    }

    /// Drop the record for `id` and tear down its process tree in the
    /// background. Returns as soon as the bookkeeping is gone.
    pub fn kill(&self, id: CorrelationId) -> Result<()> {
        let (_, record) = self
            .records
            .remove(&id)
            .ok_or(BridgeError::UnknownProcess(id))?;

        info!(
            "Killing process tree for {id}: pid {} ({}), running {}ms",
            record.pid,
            record.command,
            record.started_at.elapsed().as_millis()
        );
        let inspector = Arc::clone(&self.inspector);
        tokio::spawn(async move {
            kill_tree(inspector.as_ref(), record.pid).await;
        });
        Ok(())
    }

    /// Tear down every tracked process tree and wait for the kills to be sent.
    pub async fn kill_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self.records.iter().map(|r| *r.key()).collect();
        let mut killed = 0;
        for id in ids {
            if let Some((_, record)) = self.records.remove(&id) {
                kill_tree(self.inspector.as_ref(), record.pid).await;
                killed += 1;
            }
        }
        killed
    }

    fn start(&self, mut cmd: Command, req: &CommandRequest) -> Result<Child> {
        let child = cmd
            .spawn()
            .map_err(|e| spawn_error(&e, &req.directory))?;

        let line = command_line(&req.command, &req.args);
        match child.id() {
            Some(pid) => {
                debug!("Started {} for {} with pid {pid}", line, req.id);
                self.records.insert(
                    req.id,
                    ProcessRecord {
                        pid,
                        command: line,
                        started_at: Instant::now(),
                    },
                );
            }
            None => debug!("Process for {} exited before it could be tracked", req.id),
        }
        Ok(child)
    }

    async fn supervise(&self, mut child: Child, req: &CommandRequest, mode: Mode) -> Result<String> {
        let pid = child.id();
        let (tx, mut rx) = mpsc::channel(64);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone(), ProcessEvent::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx.clone(), ProcessEvent::Stderr));
        }
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = tx.send(ProcessEvent::Exit(status)).await;
        });

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut status = None;
        let mut overflow: Option<&'static str> = None;

        while let Some(event) = rx.recv().await {
            match event {
                ProcessEvent::Stdout(chunk) => {
                    self.capture(&mut stdout, &chunk, mode, "stdout", &mut overflow, pid)
                }
                ProcessEvent::Stderr(chunk) => {
                    // informational output lives here too; only the exit
                    // status decides success
                    if mode == Mode::Streaming && req.watch_progress {
                        let data = String::from_utf8_lossy(&chunk).into_owned();
                        let _ = self.events.send(ProgressEvent::now(req.id, data));
                    }
                    self.capture(&mut stderr, &chunk, mode, "stderr", &mut overflow, pid)
                }
                ProcessEvent::Exit(exit) => status = Some(exit),
            }
        }
        self.records.remove(&req.id);

        if let Some(stream) = overflow {
            return Err(BridgeError::Execution {
                detail: format!("{stream} maxBuffer length exceeded"),
            });
        }

        let status = match status {
            Some(Ok(status)) => status,
            Some(Err(e)) => return Err(BridgeError::Io(e)),
            None => {
                return Err(BridgeError::Execution {
                    detail: "exit status unavailable".to_string(),
                })
            }
        };
        debug!("{} ({}) finished with {status}", req.id, mode.as_str());

        if status.success() {
            return Ok(String::from_utf8_lossy(&stdout).into_owned());
        }

        let detail = String::from_utf8_lossy(&stderr).into_owned();
        let detail = if detail.trim().is_empty() {
            format!("{} exited with {status}", command_line(&req.command, &req.args))
        } else {
            detail
        };
        Err(BridgeError::Execution { detail })
    }

    fn capture(
        &self,
        buffer: &mut Vec<u8>,
        chunk: &[u8],
        mode: Mode,
        stream: &'static str,
        overflow: &mut Option<&'static str>,
        pid: Option<u32>,
    ) {
        if overflow.is_some() {
            return;
        }
        if mode == Mode::Buffered && buffer.len() + chunk.len() > self.max_buffer_bytes {
            warn!("{stream} exceeded {} bytes, killing process", self.max_buffer_bytes);
            *overflow = Some(stream);
            if let Some(pid) = pid {
                let inspector = Arc::clone(&self.inspector);
                tokio::spawn(async move {
                    kill_tree(inspector.as_ref(), pid).await;
                });
            }
            return;
        }
        buffer.extend_from_slice(chunk);
    }
}

/// Kill every descendant of `pid` (leaves first), then `pid` itself.
/// Individual failures are logged; returns the pids in the order tried.
pub async fn kill_tree(inspector: &dyn ProcessInspector, pid: u32) -> Vec<u32> {
    let mut targets = match inspector.list_children(pid).await {
        Ok(children) => children,
        Err(e) => {
            warn!("Could not list children of {pid}: {e}");
            Vec::new()
        }
    };
    targets.push(pid);

    for &target in &targets {
        match inspector.kill_one(target).await {
            Ok(true) => debug!("Killed pid {target}"),
            Ok(false) => debug!("Pid {target} already gone"),
            Err(e) => error!("Failed to kill pid {target}: {e}"),
        }
    }
    targets
}

async fn pump<R, F>(mut reader: R, tx: mpsc::Sender<ProcessEvent>, wrap: F)
where
    R: AsyncRead + Unpin,
    F: Fn(Vec<u8>) -> ProcessEvent,
{
    let mut buf = vec![0u8; PUMP_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Pipe read failed: {e}");
                break;
            }
        }
    }
}

fn spawn_error(err: &std::io::Error, directory: &str) -> BridgeError {
    let detail = if err.kind() == std::io::ErrorKind::NotFound {
        format!("{err} (cwd: {directory})")
    } else {
        err.to_string()
    };
    BridgeError::Spawn {
        detail: redact_credentials(&detail),
    }
}

/// Quoted program followed by shell-escaped arguments.
fn shell_line(program: &Path, args: &[String]) -> String {
    let program = program.to_string_lossy();
    let mut line = shell_escape::escape(Cow::Borrowed(program.as_ref())).into_owned();
    for arg in args {
        line.push(' ');
        line.push_str(&shell_escape::escape(Cow::Borrowed(arg.as_str())));
    }
    line
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").raw_arg(line);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_tree::{ProcessEntry, SystemProcessTree};
    use std::sync::Mutex;

    fn executor() -> Executor {
        Executor::new(&ExecutorConfig::default(), Arc::new(SystemProcessTree))
    }

    fn request(id: u32, command: &str, args: &[&str]) -> CommandRequest {
        CommandRequest {
            id: CorrelationId(id),
            directory: std::env::temp_dir().display().to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            watch_progress: false,
        }
    }

    /// Fixed topology; records kill order
    struct FakeTree {
        entries: Vec<ProcessEntry>,
        killed: Mutex<Vec<u32>>,
    }

    #[async_trait::async_trait]
    impl ProcessInspector for FakeTree {
        async fn list_processes(&self) -> Result<Vec<ProcessEntry>> {
            Ok(self.entries.clone())
        }

        async fn kill_one(&self, pid: u32) -> Result<bool> {
            self.killed.lock().unwrap().push(pid);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_kill_tree_order() {
        // P(100) -> C1(200) -> G1(300)
        let tree = FakeTree {
            entries: vec![
                ProcessEntry { pid: 100, parent_pid: 1 },
                ProcessEntry { pid: 200, parent_pid: 100 },
                ProcessEntry { pid: 300, parent_pid: 200 },
            ],
            killed: Mutex::new(Vec::new()),
        };
        let order = kill_tree(&tree, 100).await;
        assert_eq!(order, vec![300, 200, 100]);
        assert_eq!(*tree.killed.lock().unwrap(), vec![300, 200, 100]);
    }

    #[tokio::test]
    async fn test_kill_unknown_id() {
        let exec = executor();
        let err = exec.kill(CorrelationId(42)).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownProcess(CorrelationId(42))));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let exec = executor();
        let err = exec
            .execute(request(1, "no-such-binary-4b825dc6", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound { .. }));
        assert_eq!(exec.running_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_echo() {
        let exec = executor();
        let out = exec.execute(request(1, "echo", &["hi"])).await.unwrap();
        assert_eq!(out, "hi\n");
        assert_eq!(exec.running_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_escapes_arguments() {
        let exec = executor();
        let out = exec
            .execute(request(1, "printf", &["%s|", "a b", "it's", "$HOME"]))
            .await
            .unwrap();
        assert_eq!(out, "a b|it's|$HOME|");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_failure_has_detail() {
        let exec = executor();
        let err = exec.execute(request(1, "false", &[])).await.unwrap_err();
        match err {
            BridgeError::Execution { detail } => {
                assert!(!detail.is_empty());
                assert!(detail.contains("false"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_failure_returns_stderr() {
        let exec = executor();
        let err = exec
            .execute(request(1, "sh", &["-c", "echo out; echo broken >&2; exit 3"]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "broken\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_error_mentions_cwd() {
        let exec = executor();
        let mut req = request(1, "echo", &["hi"]);
        req.directory = "/definitely/not/a/dir".to_string();
        let err = exec.spawn(req).await.unwrap_err();
        match err {
            BridgeError::Spawn { detail } => assert!(detail.contains("/definitely/not/a/dir")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_buffered_overflow() {
        let exec = Executor::new(
            &ExecutorConfig {
                max_buffer_bytes: 16,
            },
            Arc::new(SystemProcessTree),
        );
        let err = exec
            .execute(request(1, "sh", &["-c", "head -c 1000 /dev/zero"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stdout maxBuffer"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_forwards_progress() {
        let exec = executor();
        let mut events = exec.subscribe();
        let mut req = request(9, "sh", &["-c", "echo 'Receiving objects: 50%' >&2; echo done"]);
        req.watch_progress = true;

        let out = exec.spawn(req).await.unwrap();
        assert_eq!(out, "done\n");

        let event = events.try_recv().unwrap();
        assert_eq!(event.correlation_id, CorrelationId(9));
        assert_eq!(event.data, "Receiving objects: 50%\n");
        assert!(event.timestamp > 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_stderr_is_not_failure() {
        let exec = executor();
        let mut events = exec.subscribe();
        let out = exec
            .spawn(request(2, "sh", &["-c", "echo info >&2; echo ok"]))
            .await
            .unwrap();
        assert_eq!(out, "ok\n");
        // not watching, so nothing forwarded
        assert!(events.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_closes_stdin() {
        let exec = executor();
        let out = exec.spawn(request(3, "cat", &[])).await.unwrap();
        assert_eq!(out, "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_running_process() {
        let exec = Arc::new(executor());
        let runner = {
            let exec = Arc::clone(&exec);
            tokio::spawn(async move { exec.spawn(request(5, "sleep", &["30"])).await })
        };

        while exec.running_count() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        exec.kill(CorrelationId(5)).unwrap();
        assert_eq!(exec.running_count(), 0);

        let result = tokio::time::timeout(std::time::Duration::from_secs(10), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(BridgeError::Execution { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handle_which() {
        let exec = executor();
        let reply = exec
            .handle(Request::Which {
                command: "sh".into(),
            })
            .await
            .unwrap();
        assert!(Path::new(&reply).is_absolute());

        let failure = exec
            .handle(Request::Kill {
                id: CorrelationId(77),
            })
            .await
            .unwrap_err();
        assert_eq!(failure.kind, crate::protocol::FailureKind::UnknownProcess);
    }
}
