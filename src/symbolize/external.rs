//! Out-of-process symbolization over pipes.
//!
//! Drives a line-oriented child symbolizer (addr2line-style): one request
//! line `"<library-path>" 0x<hex-address>` per query, one response per
//! request. Responses are either line-oriented — an address echo line, then
//! alternating `function` / `file:line:col` lines, terminated by a blank
//! line — or a single JSON object per line:
//!
//! ```text
//! {"address":"0x1345","frames":[{"function":"foo","file":"a.c","line":3}]}
//! ```
//!
//! The pipe is owned by a current-thread tokio runtime on one background
//! thread; callers enqueue a query and block on a oneshot reply. A per-query
//! timeout (default 10 s) fails only that query. An optional "unstucker"
//! periodically injects a sentinel query (IP = all-ones) and abandons the
//! child if it stops answering.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::maps::DynamicLibMapping;
use crate::symbolize::{SingleFrame, SymbolizeBackend};

/// Default per-query timeout.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Frame data as reported by the child, before it is tied to a mapping.
#[derive(Debug, Clone)]
struct RawFrame {
    function: String,
    file: Option<String>,
    line: Option<u32>,
}

enum Request {
    Query {
        path: String,
        addr: u64,
        respond: oneshot::Sender<Result<Vec<RawFrame>>>,
    },
    Shutdown,
}

pub struct ExternalBackend {
    requests: mpsc::UnboundedSender<Request>,
    worker: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
    query_timeout: Duration,
}

impl ExternalBackend {
    /// Spawn `command` and start the pipe driver with default settings.
    pub fn start(command: Vec<String>) -> Result<Self> {
        Self::start_with_options(command, DEFAULT_QUERY_TIMEOUT, None)
    }

    /// Spawn `command`; `unstuck_interval` enables the sentinel probe.
    pub fn start_with_options(
        command: Vec<String>,
        query_timeout: Duration,
        unstuck_interval: Option<Duration>,
    ) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::Backend("empty symbolizer command".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = std::thread::Builder::new()
            .name("symbolizer-pipe".into())
            .spawn(move || pipe_thread(rx, command, query_timeout, unstuck_interval))
            .map_err(|e| Error::Backend(format!("failed to spawn pipe thread: {e}")))?;
        Ok(Self {
            requests: tx,
            worker: std::sync::Mutex::new(Some(worker)),
            query_timeout,
        })
    }

    /// How long a single query may take before it fails with
    /// [`Error::BackendTimeout`].
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }
}

impl SymbolizeBackend for ExternalBackend {
    fn symbolize(&self, mapping: &DynamicLibMapping, file_vaddr: u64) -> Result<Vec<SingleFrame>> {
        // A nonexistent library would make some symbolizers hang on open;
        // poisoning the path makes them produce a fast, reliable error for
        // this entry instead.
        let path = if Path::new(&mapping.path).exists() {
            mapping.path.clone()
        } else {
            format!("/file/not/found{}", mapping.path)
        };

        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Query {
                path,
                addr: file_vaddr,
                respond: tx,
            })
            .map_err(|_| Error::Cancelled)?;
        let raw = rx.blocking_recv().map_err(|_| Error::Cancelled)??;

        let library = Some(mapping.library_label().to_string());
        Ok(raw
            .into_iter()
            .map(|f| SingleFrame {
                address: file_vaddr,
                function_name: f.function,
                function_offset: 0,
                library: library.clone(),
                vmap: Some(mapping.clone()),
                source_file: f.file,
                source_line: f.line,
            })
            .collect())
    }

    fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ExternalBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pipe_thread(
    mut rx: mpsc::UnboundedReceiver<Request>,
    command: Vec<String>,
    query_timeout: Duration,
    unstuck_interval: Option<Duration>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let reason = format!("failed to build pipe runtime: {e}");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    Request::Query { respond, .. } => {
                        let _ = respond.send(Err(Error::Backend(reason.clone())));
                    }
                    Request::Shutdown => break,
                }
            }
            return;
        }
    };
    runtime.block_on(drive_pipe(rx, command, query_timeout, unstuck_interval));
}

async fn drive_pipe(
    mut rx: mpsc::UnboundedReceiver<Request>,
    command: Vec<String>,
    query_timeout: Duration,
    unstuck_interval: Option<Duration>,
) {
    let (mut child, mut stdin, mut stdout) = match spawn_child(&command) {
        Ok(parts) => parts,
        Err(err) => {
            let reason = err.to_string();
            while let Some(req) = rx.recv().await {
                match req {
                    Request::Query { respond, .. } => {
                        let _ = respond.send(Err(Error::Backend(reason.clone())));
                    }
                    Request::Shutdown => break,
                }
            }
            return;
        }
    };

    let mut probe = unstuck_interval.map(tokio::time::interval);
    loop {
        let request = match probe.as_mut() {
            Some(interval) => {
                tokio::select! {
                    req = rx.recv() => req,
                    _ = interval.tick() => {
                        // Sentinel probe: all-ones IP against a path no
                        // symbolizer can open. A healthy child answers (with
                        // an error entry) immediately.
                        let outcome = one_query(
                            &mut stdin,
                            &mut stdout,
                            "/file/not/found/unstucker-probe",
                            u64::MAX,
                            query_timeout,
                        )
                        .await;
                        if matches!(outcome, Err(Error::BackendTimeout)) {
                            tracing::warn!("external symbolizer is wedged, abandoning it");
                            break;
                        }
                        continue;
                    }
                }
            }
            None => rx.recv().await,
        };

        match request {
            Some(Request::Query {
                path,
                addr,
                respond,
            }) => {
                let result = one_query(&mut stdin, &mut stdout, &path, addr, query_timeout).await;
                let _ = respond.send(result);
            }
            Some(Request::Shutdown) | None => break,
        }
    }

    // Close the pipe; queued queries beyond this point are dropped, which
    // their callers observe as `Cancelled`.
    drop(stdin);
    let _ = child.kill().await;
}

type PipeParts = (Child, ChildStdin, BufReader<ChildStdout>);

fn spawn_child(command: &[String]) -> Result<PipeParts> {
    let mut child = Command::new(&command[0])
        .args(&command[1..])
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Backend(format!("failed to spawn {:?}: {e}", command[0])))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Backend("child has no stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Backend("child has no stdout".to_string()))?;
    Ok((child, stdin, BufReader::new(stdout)))
}

async fn one_query(
    stdin: &mut ChildStdin,
    stdout: &mut BufReader<ChildStdout>,
    path: &str,
    addr: u64,
    query_timeout: Duration,
) -> Result<Vec<RawFrame>> {
    let request = format!("\"{path}\" 0x{addr:x}\n");
    stdin
        .write_all(request.as_bytes())
        .await
        .map_err(|e| Error::Backend(format!("pipe write failed: {e}")))?;
    stdin
        .flush()
        .await
        .map_err(|e| Error::Backend(format!("pipe flush failed: {e}")))?;

    tokio::time::timeout(query_timeout, read_response(stdout))
        .await
        .map_err(|_| Error::BackendTimeout)?
}

async fn read_response(stdout: &mut BufReader<ChildStdout>) -> Result<Vec<RawFrame>> {
    let first = read_line(stdout).await?;
    let first = first.trim();
    if first.is_empty() {
        return Ok(Vec::new());
    }
    if first.starts_with('{') {
        return parse_json_reply(first);
    }

    // Line-oriented: `first` echoes the address; then alternating
    // function / location lines until a blank line.
    let mut frames = Vec::new();
    loop {
        let function = match read_line(stdout).await {
            Ok(line) => line,
            Err(_) if !frames.is_empty() => break,
            Err(e) => return Err(e),
        };
        let function = function.trim().to_string();
        if function.is_empty() {
            break;
        }
        let location = read_line(stdout).await?;
        if function == "??" {
            continue;
        }
        let (file, line) = parse_location(location.trim());
        frames.push(RawFrame {
            function,
            file,
            line,
        });
    }
    Ok(frames)
}

async fn read_line(stdout: &mut BufReader<ChildStdout>) -> Result<String> {
    let mut line = String::new();
    let n = stdout
        .read_line(&mut line)
        .await
        .map_err(|e| Error::Backend(format!("pipe read failed: {e}")))?;
    if n == 0 {
        return Err(Error::Backend("symbolizer closed its pipe".to_string()));
    }
    Ok(line)
}

#[derive(serde::Deserialize)]
struct JsonReply {
    #[serde(default)]
    frames: Vec<JsonFrame>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(serde::Deserialize)]
struct JsonFrame {
    function: String,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: Option<u32>,
}

fn parse_json_reply(line: &str) -> Result<Vec<RawFrame>> {
    let reply: JsonReply =
        serde_json::from_str(line).map_err(|e| Error::Backend(format!("bad JSON reply: {e}")))?;
    if reply.error.is_some() {
        return Ok(Vec::new());
    }
    Ok(reply
        .frames
        .into_iter()
        .map(|f| RawFrame {
            function: f.function,
            file: f.file,
            line: f.line,
        })
        .collect())
}

/// Split a `file:line:col` (or `file:line`) location. `??` and unparsable
/// pieces degrade to `None`.
fn parse_location(location: &str) -> (Option<String>, Option<u32>) {
    if location.is_empty() || location.starts_with("??") {
        return (None, None);
    }
    let mut parts = location.split(':');
    let file = parts.next().unwrap_or_default();
    let line = parts.next().and_then(|l| l.parse().ok());
    if file.is_empty() || file == "??" {
        (None, line)
    } else {
        (Some(file.to_string()), line)
    }
}
