//! Newline-delimited JSON transport over a byte stream.
//!
//! One JSON [`Frame`] per line. Calls carry a transport-level `seq` that the
//! matching reply echoes; progress events travel as their own frames. When
//! the read side hits EOF every outstanding call fails with
//! [`TransportError::Disconnected`]. A transport built with
//! [`PipeTransport::connect_child`] starts a fresh host on the next call
//! after that; one built over plain streams stays disconnected.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Transport, TransportError};
use crate::error::{BridgeError, Result};
use crate::executor::Executor;
use crate::protocol::{ProgressEvent, Reply, Request};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const FRAME_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Call { seq: u64, request: Request },
    Reply { seq: u64, reply: Reply },
    Progress { event: ProgressEvent },
}

type PendingReplies = DashMap<u64, oneshot::Sender<Reply>>;

/// One live pair of streams and the calls waiting on it.
struct Connection {
    frames: mpsc::Sender<Frame>,
    pending: Arc<PendingReplies>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Connection {
    fn open<R, W>(
        reader: R,
        writer: W,
        events: broadcast::Sender<ProgressEvent>,
        shutdown: CancellationToken,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (frames, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let pending = Arc::new(PendingReplies::new());
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(write_frames(writer, rx));
        tokio::spawn(read_replies(
            reader,
            Arc::clone(&pending),
            Arc::clone(&connected),
            events,
            shutdown.clone(),
        ));
        Self {
            frames,
            pending,
            connected,
            shutdown,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Program and arguments used to (re)start a host process.
#[derive(Debug, Clone)]
struct HostCommand {
    program: String,
    args: Vec<String>,
}

/// Dispatcher-side end of a pipe
pub struct PipeTransport {
    connection: Mutex<Arc<Connection>>,
    host: Option<HostCommand>,
    launches: AtomicUsize,
    next_seq: AtomicU64,
    events: broadcast::Sender<ProgressEvent>,
    shutdown: CancellationToken,
}

impl PipeTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let connection = Connection::open(reader, writer, events.clone(), shutdown.child_token());
        Self {
            connection: Mutex::new(Arc::new(connection)),
            host: None,
            launches: AtomicUsize::new(0),
            next_seq: AtomicU64::new(1),
            events,
            shutdown,
        }
    }

    /// Spawn a host process and talk to it over its stdin/stdout. If the
    /// host goes away, the next call starts a new one.
    pub fn connect_child(program: &str, args: &[String]) -> Result<Self> {
        let host = HostCommand {
            program: program.to_string(),
            args: args.to_vec(),
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let connection = launch(&host, &events, shutdown.child_token())?;
        Ok(Self {
            connection: Mutex::new(Arc::new(connection)),
            host: Some(host),
            launches: AtomicUsize::new(1),
            next_seq: AtomicU64::new(1),
            events,
            shutdown,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_connected()
    }

    /// How many host processes this transport has started
    pub fn host_launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn current(&self) -> Arc<Connection> {
        let connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&connection)
    }

    /// The live connection, restarting the host first if it went away.
    fn connection(&self) -> std::result::Result<Arc<Connection>, TransportError> {
        let mut connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        if connection.is_connected() {
            return Ok(Arc::clone(&connection));
        }
        let Some(host) = &self.host else {
            return Err(TransportError::Disconnected);
        };

        info!("Host {} went away, starting a new one", host.program);
        match launch(host, &self.events, self.shutdown.child_token()) {
            Ok(fresh) => {
                connection.shutdown.cancel();
                *connection = Arc::new(fresh);
                self.launches.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::clone(&connection))
            }
            Err(e) => {
                warn!("Failed to restart host {}: {e}", host.program);
                Err(TransportError::Disconnected)
            }
        }
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn call(&self, request: Request) -> std::result::Result<Reply, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let connection = self.connection()?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        connection.pending.insert(seq, tx);

        // the reader flips `connected` before draining `pending`
        if !connection.is_connected() {
            connection.pending.remove(&seq);
            return Err(TransportError::Disconnected);
        }

        if connection.frames.send(Frame::Call { seq, request }).await.is_err() {
            connection.pending.remove(&seq);
            return Err(TransportError::Disconnected);
        }
        rx.await.map_err(|_| TransportError::Disconnected)
    }

    fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }
}

fn launch(
    host: &HostCommand,
    events: &broadcast::Sender<ProgressEvent>,
    shutdown: CancellationToken,
) -> Result<Connection> {
    let mut child = Command::new(&host.program)
        .args(&host.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(BridgeError::Transport(
            "host process has no stdio pipes".to_string(),
        ));
    };
    info!("Connected to host {} (pid {:?})", host.program, child.id());

    let connection = Connection::open(stdout, stdin, events.clone(), shutdown.clone());
    tokio::spawn(watch_host(child, shutdown));
    Ok(connection)
}

/// Reap the host when it exits; kill it when its connection is shut down.
async fn watch_host(mut child: Child, shutdown: CancellationToken) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => info!("Host process exited with {status}"),
            Err(e) => warn!("Failed to wait for host process: {e}"),
        },
        _ = shutdown.cancelled() => {
            if let Err(e) = child.kill().await {
                debug!("Host process already gone: {e}");
            }
        }
    }
}

/// Whole lines only: a frame is either written completely or not at all,
/// whatever happens to the caller that queued it.
async fn write_frames<W>(mut writer: W, mut frames: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let mut line = match serde_json::to_string(&frame) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode frame: {e}");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("Pipe write failed: {e}");
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!("Pipe flush failed: {e}");
            break;
        }
    }
}

async fn read_replies<R>(
    reader: R,
    pending: Arc<PendingReplies>,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<ProgressEvent>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Pipe closed by peer");
                break;
            }
            Err(e) => {
                warn!("Pipe read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Reply { seq, reply }) => match pending.remove(&seq) {
                Some((_, tx)) => {
                    let _ = tx.send(reply);
                }
                None => debug!("Reply for unknown call {seq} dropped"),
            },
            Ok(Frame::Progress { event }) => {
                let _ = events.send(event);
            }
            Ok(Frame::Call { seq, .. }) => warn!("Unexpected call frame {seq} on dispatcher side"),
            Err(e) => warn!("Malformed frame dropped: {e}"),
        }
    }

    connected.store(false, Ordering::SeqCst);
    // dropping the senders fails every waiting call with Disconnected
    pending.clear();
}

/// Executor-side loop: answer calls read from `reader` on `writer` and
/// forward progress events, until `reader` reaches EOF. Processes still
/// running at that point are torn down.
pub async fn serve<R, W>(executor: Arc<Executor>, reader: R, writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_CAPACITY);
    let write_task = tokio::spawn(write_frames(writer, rx));

    let forward_task = {
        let mut progress = executor.subscribe();
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match progress.recv().await {
                    Ok(event) => {
                        if tx.send(Frame::Progress { event }).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Dropped {n} progress events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    let mut lines = BufReader::new(reader).lines();
    let result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Call { seq, request }) => {
                let executor = Arc::clone(&executor);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let reply = executor.handle(request).await;
                    let _ = tx.send(Frame::Reply { seq, reply }).await;
                });
            }
            Ok(other) => warn!("Unexpected frame on executor side: {other:?}"),
            Err(e) => warn!("Malformed frame dropped: {e}"),
        }
    };

    info!("Peer disconnected, stopping {} running process(es)", executor.running_count());
    executor.kill_all().await;
    forward_task.abort();
    drop(tx);
    write_task.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::process_tree::SystemProcessTree;
    use crate::protocol::{CommandRequest, CorrelationId};
    use std::time::Duration;

    fn executor() -> Arc<Executor> {
        Arc::new(Executor::new(
            &ExecutorConfig::default(),
            Arc::new(SystemProcessTree),
        ))
    }

    #[test]
    fn test_frame_shape() {
        let frame = Frame::Reply {
            seq: 4,
            reply: Ok("main".into()),
        };
        let line = serde_json::to_string(&frame).unwrap();
        assert_eq!(line, r#"{"frame":"reply","seq":4,"reply":{"Ok":"main"}}"#);
        assert_eq!(serde_json::from_str::<Frame>(&line).unwrap(), frame);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_call_through_pipe() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        tokio::spawn(serve(executor(), server_read, server_write));

        let (client_read, client_write) = tokio::io::split(client);
        let transport = PipeTransport::new(client_read, client_write);

        let reply = transport
            .call(Request::Which {
                command: "sh".into(),
            })
            .await
            .unwrap()
            .unwrap();
        assert!(reply.ends_with("sh"));

        let failure = transport
            .call(Request::Kill { id: CorrelationId(9) })
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(failure.kind, crate::protocol::FailureKind::UnknownProcess);
    }

    #[tokio::test]
    async fn test_disconnect_mid_call() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let transport = PipeTransport::new(client_read, client_write);

        // peer reads one call, then hangs up without answering
        tokio::spawn(async move {
            let (read, _write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            let _ = lines.next_line().await;
        });

        let err = transport
            .call(Request::Which {
                command: "git".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Disconnected);
        assert!(!transport.is_connected());

        let err = transport
            .call(Request::Which {
                command: "git".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Disconnected);
    }

    #[tokio::test]
    async fn test_progress_frames_reach_subscribers() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let transport = PipeTransport::new(client_read, client_write);
        let mut events = transport.subscribe();

        let (_read, mut write) = tokio::io::split(server);
        let frame = Frame::Progress {
            event: ProgressEvent {
                correlation_id: CorrelationId(3),
                timestamp: 1,
                data: "Counting objects: 5".into(),
            },
        };
        let mut line = serde_json::to_string(&frame).unwrap();
        line.push('\n');
        write.write_all(line.as_bytes()).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.correlation_id, CorrelationId(3));
        assert_eq!(event.data, "Counting objects: 5");
    }

    #[tokio::test]
    async fn test_reply_for_unknown_call_is_dropped() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let transport = PipeTransport::new(client_read, client_write);

        // answer a call nobody made before answering the real one
        let peer = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let Frame::Call { seq, .. } = serde_json::from_str::<Frame>(&line).unwrap() else {
                panic!("expected a call frame: {line}");
            };
            for frame in [
                Frame::Reply {
                    seq: seq + 100,
                    reply: Ok("stray".into()),
                },
                Frame::Reply {
                    seq,
                    reply: Ok("/usr/bin/git".into()),
                },
            ] {
                let mut out = serde_json::to_string(&frame).unwrap();
                out.push('\n');
                write.write_all(out.as_bytes()).await.unwrap();
            }
            (lines, write)
        });

        let reply = transport
            .call(Request::Which {
                command: "git".into(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, "/usr/bin/git");
        assert!(transport.is_connected());
        let _open = peer.await.unwrap();
    }

    #[cfg(unix)]
    fn process_alive(pid: i32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        if kill(Pid::from_raw(pid), None).is_err() {
            return false;
        }
        // an unreaped zombie still answers signal 0
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map_or(true, |rest| !rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[cfg(unix)]
    async fn read_pid(path: &std::path::Path) -> i32 {
        for _ in 0..250 {
            if let Ok(pid) = std::fs::read_to_string(path).unwrap_or_default().trim().parse() {
                return pid;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no pid written to {}", path.display());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_serve_kills_running_processes_on_eof() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let executor = executor();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let served = tokio::spawn(serve(Arc::clone(&executor), server_read, server_write));

        let call = Frame::Call {
            seq: 1,
            request: Request::Spawn(CommandRequest {
                id: CorrelationId(1),
                directory: dir.path().display().to_string(),
                command: "sh".into(),
                args: vec![
                    "-c".into(),
                    r#"echo $$ > "$1"; exec sleep 30"#.into(),
                    "sh".into(),
                    pid_file.display().to_string(),
                ],
                watch_progress: false,
            }),
        };
        let mut line = serde_json::to_string(&call).unwrap();
        line.push('\n');
        let (client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(line.as_bytes()).await.unwrap();

        let pid = read_pid(&pid_file).await;
        assert!(process_alive(pid));
        assert_eq!(executor.running_count(), 1);

        drop(client_write);
        drop(client_read);
        tokio::time::timeout(Duration::from_secs(10), served)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(executor.running_count(), 0);

        let mut alive = true;
        for _ in 0..100 {
            alive = process_alive(pid);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "pid {pid} survived the disconnect");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_host_is_restarted_after_disconnect() {
        // a host that reads one frame and dies without answering
        let args = vec!["-c".to_string(), "read line; exit 0".to_string()];
        let transport = PipeTransport::connect_child("sh", &args).unwrap();
        assert_eq!(transport.host_launches(), 1);

        let which = || Request::Which {
            command: "git".into(),
        };
        assert_eq!(transport.call(which()).await.unwrap_err(), TransportError::Disconnected);
        assert!(!transport.is_connected());

        assert_eq!(transport.call(which()).await.unwrap_err(), TransportError::Disconnected);
        assert_eq!(transport.host_launches(), 2);
    }
}
