//! Non-blocking interactive session on tokio.
//!
//! A worker task owns the interpreter process. [`AsyncSession`] handles are
//! cheap clones that enqueue requests on a single-slot channel and await a
//! oneshot reply, so any number of callers may ask for execution while only
//! one submission is ever in flight. Waiting for output is a suspension
//! point, which keeps the session usable on a current-thread runtime.
//!
//! ```text
//!  caller ─┐                      ┌──────────── worker task ────────────┐
//!  caller ─┼─▶ mpsc(1) ─▶ Request ─▶ write payload ─▶ child stdin       │
//!  caller ─┘       ▲              │  select! { output line, deadline,   │
//!                  │              │            caller hung up }        │
//!                  └── oneshot ◀──┤  Framer ◀─ stdout/stderr readers    │
//!                                 └─────────────────────────────────────┘
//! ```

use std::{future::Future, io, path::Path, process::Stdio, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{mpsc, oneshot},
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::{SessionConfig, SessionOptions},
    error::{Result, SessionError},
    protocol::{CapturedOutput, Frame, Framer, MarkerGenerator, OutputEvent, Stream, Submission},
    session::{CHECKPOINT_TIMEOUT, SHUTDOWN_GRACE, read_script},
    state::StateBridge,
};

/// How long a terminated process is given to report its exit code.
const REAP_GRACE: Duration = Duration::from_millis(200);

/// Handle on an interpreter served by a background worker task.
///
/// Clones share the same worker and process. The worker shuts the
/// interpreter down when [`close`](Self::close) is called or when the last
/// handle is dropped.
#[derive(Debug, Clone)]
pub struct AsyncSession {
    config: Arc<SessionConfig>,
    default_timeout: Option<Duration>,
    requests: mpsc::Sender<Request>,
}

impl AsyncSession {
    /// Launches the interpreter, runs bootstrap and checkpoint restore, then
    /// spawns the worker task on the current runtime.
    pub async fn start(config: impl Into<Arc<SessionConfig>>, options: SessionOptions) -> Result<Self> {
        let config = config.into();
        let default_timeout = options.default_timeout;
        let mut worker = Worker::new(Arc::clone(&config), options);
        worker.open().await?;

        let (requests, inbox) = mpsc::channel(1);
        tokio::spawn(worker.serve(inbox));
        Ok(Self {
            config,
            default_timeout,
            requests,
        })
    }

    /// The config shared by every handle on this session.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// True once the worker has stopped (closed or the interpreter died).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    /// Runs `code` and returns its output, waiting up to the default timeout.
    ///
    /// Dropping the returned future before the request is dequeued withdraws
    /// it. Dropping it while it runs restarts the interpreter, which loses
    /// all interpreter state.
    pub async fn run(&self, code: &str) -> Result<CapturedOutput> {
        self.ensure_open()?;
        let prepared = self.config.prepare(code)?;
        self.submit(prepared, self.default_timeout).await
    }

    /// Runs `code`, failing with [`SessionError::Timeout`] after `timeout`.
    ///
    /// A timed-out submission is drained by the worker before the next
    /// request runs, so its late output never leaks into another result.
    pub async fn run_with_timeout(&self, code: &str, timeout: Duration) -> Result<CapturedOutput> {
        self.ensure_open()?;
        let prepared = self.config.prepare(code)?;
        self.submit(prepared, Some(timeout)).await
    }

    /// Runs a script file whose extension is listed in the config.
    pub async fn run_file(&self, path: impl AsRef<Path>) -> Result<CapturedOutput> {
        let code = read_script(&self.config, path.as_ref())?;
        self.run(&code).await
    }

    /// Asks the interpreter to serialize its bindings to `path`.
    pub async fn save_state(&self, path: impl AsRef<Path>) -> Result<CapturedOutput> {
        let code = StateBridge::new(&self.config).save_command(path.as_ref())?;
        self.submit(code, self.default_timeout).await
    }

    /// Asks the interpreter to merge bindings previously saved to `path`.
    pub async fn load_state(&self, path: impl AsRef<Path>) -> Result<CapturedOutput> {
        let code = StateBridge::new(&self.config).load_command(path.as_ref())?;
        self.submit(code, self.default_timeout).await
    }

    /// Saves the checkpoint if configured, then terminates the interpreter.
    ///
    /// Requests queued behind the close are dropped. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        if self.requests.send(Request::Close { reply }).await.is_err() {
            return Ok(());
        }
        response.await.unwrap_or(Ok(()))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::InvalidState("session is closed".to_owned()));
        }
        Ok(())
    }

    async fn submit(&self, code: String, timeout: Option<Duration>) -> Result<CapturedOutput> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Run { code, timeout, reply })
            .await
            .map_err(|_| SessionError::InvalidState("session is closed".to_owned()))?;
        response
            .await
            .map_err(|_| SessionError::InvalidState("session stopped before replying".to_owned()))?
    }
}

enum Request {
    Run {
        code: String,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<CapturedOutput>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Outcome of waiting for a marker.
enum Waited {
    Complete(CapturedOutput),
    TimedOut { partial: String, waited: Duration },
    Closed(String),
    /// The caller hung up while its submission was in flight.
    Cancelled,
}

struct Worker {
    config: Arc<SessionConfig>,
    options: SessionOptions,
    process: Option<AsyncProcess>,
    markers: MarkerGenerator,
    outstanding: Option<Framer>,
}

impl Worker {
    fn new(config: Arc<SessionConfig>, options: SessionOptions) -> Self {
        Self {
            config,
            options,
            process: None,
            markers: MarkerGenerator::new(),
            outstanding: None,
        }
    }

    /// Spawns the process and runs bootstrap and checkpoint restore.
    async fn open(&mut self) -> Result<()> {
        let process = AsyncProcess::spawn(&self.config, &self.options)?;
        info!(pid = process.child.id(), "async session opened");
        self.process = Some(process);
        self.outstanding = None;

        let bootstrap = self.config.bootstrap_code().map(str::to_owned);
        if let Some(bootstrap) = bootstrap {
            let discarded = self.exchange_uncancellable(bootstrap, self.options.default_timeout).await?;
            debug!(lines = discarded.line_count(), "bootstrap output discarded");
        }
        if let Some(checkpoint) = self.options.checkpoint.clone()
            && checkpoint.exists()
        {
            debug!(path = %checkpoint.display(), "restoring checkpoint");
            let code = StateBridge::new(&self.config).load_command(&checkpoint)?;
            self.exchange_uncancellable(code, self.options.default_timeout).await?;
        }
        Ok(())
    }

    async fn serve(mut self, mut inbox: mpsc::Receiver<Request>) {
        while let Some(request) = inbox.recv().await {
            match request {
                Request::Run {
                    code,
                    timeout,
                    mut reply,
                } => {
                    if reply.is_closed() {
                        debug!("request withdrawn before it was dequeued");
                        continue;
                    }
                    let result = self.handle_run(code, timeout, &mut reply).await;
                    let stop = self.process.is_none();
                    let _ = reply.send(result);
                    if stop {
                        break;
                    }
                }
                Request::Close { reply } => {
                    inbox.close();
                    let _ = reply.send(self.shutdown().await);
                    return;
                }
            }
        }
        if let Err(e) = self.shutdown().await {
            warn!(error = %e, "error while shutting down session");
        }
    }

    async fn handle_run(
        &mut self,
        code: String,
        timeout: Option<Duration>,
        reply: &mut oneshot::Sender<Result<CapturedOutput>>,
    ) -> Result<CapturedOutput> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);

        // settle a submission left behind by an earlier timeout
        if let Some(mut framer) = self.outstanding.take() {
            let process = self.process_mut()?;
            match await_marker(&mut process.events, &mut framer, deadline, reply.closed()).await {
                Waited::Complete(stale) => {
                    debug!(lines = stale.line_count(), "discarded output of a timed-out submission");
                }
                Waited::TimedOut { waited, .. } => {
                    self.outstanding = Some(framer);
                    return Err(SessionError::Timeout {
                        partial: String::new(),
                        waited,
                    });
                }
                other => return self.settle(other).await,
            }
        }

        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let waited = self.exchange(code, remaining, reply.closed()).await?;
        self.settle(waited).await
    }

    /// Writes one submission and waits for its marker.
    ///
    /// On timeout the framer is kept as the outstanding submission.
    async fn exchange(
        &mut self,
        code: String,
        timeout: Option<Duration>,
        cancelled: impl Future<Output = ()>,
    ) -> Result<Waited> {
        let submission = Submission::new(code, self.markers.next_marker(), &self.config);
        let process = self.process_mut()?;
        debug!(marker = submission.marker(), bytes = submission.payload().len(), "submitting");
        if let Err(e) = process.write(submission.payload()).await {
            if e.kind() == io::ErrorKind::BrokenPipe {
                return Ok(Waited::Closed(String::new()));
            }
            return Err(e.into());
        }

        let mut framer = Framer::new(submission.marker());
        let deadline = timeout.map(|t| Instant::now() + t);
        let waited = await_marker(&mut process.events, &mut framer, deadline, cancelled).await;
        if matches!(waited, Waited::TimedOut { .. }) {
            self.outstanding = Some(framer);
        }
        Ok(waited)
    }

    /// Exchange used for bootstrap, checkpoint restore and checkpoint save.
    async fn exchange_uncancellable(&mut self, code: String, timeout: Option<Duration>) -> Result<CapturedOutput> {
        match self.exchange(code, timeout, std::future::pending()).await? {
            Waited::Complete(output) => Ok(output),
            Waited::TimedOut { partial, waited } => Err(SessionError::Timeout { partial, waited }),
            Waited::Closed(partial) => Err(self.terminated(partial).await),
            Waited::Cancelled => Err(SessionError::InvalidState("internal submission cancelled".to_owned())),
        }
    }

    async fn settle(&mut self, waited: Waited) -> Result<CapturedOutput> {
        match waited {
            Waited::Complete(output) => Ok(output),
            Waited::TimedOut { partial, waited } => Err(SessionError::Timeout { partial, waited }),
            Waited::Closed(partial) => Err(self.terminated(partial).await),
            Waited::Cancelled => {
                self.restart().await;
                Err(SessionError::InvalidState(
                    "request cancelled while in flight; interpreter restarted".to_owned(),
                ))
            }
        }
    }

    /// Replaces the process after an in-flight cancellation. Interpreter state is lost.
    async fn restart(&mut self) {
        warn!("in-flight request cancelled, restarting interpreter");
        if let Some(mut process) = self.process.take() {
            process.kill().await;
        }
        if let Err(e) = self.open().await {
            error!(error = %e, "failed to restart interpreter, session closed");
            if let Some(mut process) = self.process.take() {
                process.kill().await;
            }
        }
    }

    async fn terminated(&mut self, partial: String) -> SessionError {
        let status = match self.process.take() {
            Some(mut process) => process.reap(REAP_GRACE).await,
            None => None,
        };
        self.outstanding = None;
        warn!(?status, "interpreter terminated unexpectedly");
        SessionError::Terminated { partial, status }
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.process.is_none() {
            return Ok(());
        }
        let mut checkpoint_result = Ok(());
        if let Some(checkpoint) = self.options.checkpoint.clone() {
            if self.outstanding.is_some() {
                warn!(path = %checkpoint.display(), "submission outstanding, checkpoint not saved");
            } else {
                checkpoint_result = match StateBridge::new(&self.config).save_command(&checkpoint) {
                    Ok(code) => self
                        .exchange_uncancellable(code, Some(CHECKPOINT_TIMEOUT))
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                };
            }
        }
        if let Some(mut process) = self.process.take() {
            process.terminate(SHUTDOWN_GRACE).await;
        }
        self.outstanding = None;
        info!(submissions = self.markers.issued(), "async session closed");
        checkpoint_result
    }

    fn process_mut(&mut self) -> Result<&mut AsyncProcess> {
        self.process
            .as_mut()
            .ok_or_else(|| SessionError::InvalidState("session is closed".to_owned()))
    }
}

/// Feeds output into `framer` until its marker, end of stream, `deadline`,
/// or `cancelled` resolves. Each wait yields to the runtime.
async fn await_marker(
    events: &mut mpsc::UnboundedReceiver<OutputEvent>,
    framer: &mut Framer,
    deadline: Option<Instant>,
    cancelled: impl Future<Output = ()>,
) -> Waited {
    let started = Instant::now();
    let expiry = async move {
        match deadline {
            Some(deadline) => time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expiry);
    tokio::pin!(cancelled);

    loop {
        tokio::select! {
            biased;
            event = events.recv() => {
                let Some(event) = event else {
                    return Waited::Closed(framer.partial().to_owned());
                };
                match framer.feed(event) {
                    Frame::Pending => {}
                    Frame::Complete(mut output) => {
                        // stderr is a separate pipe; keep whatever it already delivered
                        while let Ok(late) = events.try_recv() {
                            match late {
                                OutputEvent::Line { stream: Stream::Stderr, text } => output.push_line(&text),
                                OutputEvent::Line { stream: Stream::Stdout, text } => {
                                    warn!(line = %text, "dropping stdout line received after marker");
                                }
                                OutputEvent::Eof(_) => {}
                            }
                        }
                        return Waited::Complete(output);
                    }
                    Frame::Closed(partial) => return Waited::Closed(partial.into_string()),
                }
            }
            () = &mut cancelled => return Waited::Cancelled,
            () = &mut expiry => {
                return Waited::TimedOut {
                    partial: framer.partial().to_owned(),
                    waited: started.elapsed(),
                };
            }
        }
    }
}

#[derive(Debug)]
struct AsyncProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    events: mpsc::UnboundedReceiver<OutputEvent>,
}

impl AsyncProcess {
    fn spawn(config: &SessionConfig, options: &SessionOptions) -> Result<Self> {
        let (program, args) = config
            .launch_command()
            .split_first()
            .ok_or_else(|| SessionError::InvalidConfig("launch command must not be empty".to_owned()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.work_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| SessionError::Spawn(format!("{program}: {e}")))?;
        let stdin = child.stdin.take();
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(SessionError::Spawn(format!("{program}: output pipes were not captured")));
        };

        let (tx, events) = mpsc::unbounded_channel();
        tokio::spawn(forward_lines(Stream::Stdout, stdout, tx.clone()));
        tokio::spawn(forward_lines(Stream::Stderr, stderr, tx));
        debug!(pid = child.id(), program = %program, "spawned interpreter");
        Ok(Self { child, stdin, events })
    }

    async fn write(&mut self, payload: &str) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin already closed"))?;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.flush().await
    }

    async fn reap(&mut self, grace: Duration) -> Option<i32> {
        match time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => None,
        }
    }

    /// Closes stdin, then kills the interpreter if it outlives `grace`.
    async fn terminate(&mut self, grace: Duration) {
        drop(self.stdin.take());
        match time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "interpreter exited"),
            _ => {
                warn!(grace_ms = grace.as_millis(), "interpreter ignored EOF, killing");
                self.kill().await;
            }
        }
    }

    async fn kill(&mut self) {
        drop(self.stdin.take());
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill interpreter");
        }
    }
}

async fn forward_lines<R>(stream: Stream, pipe: R, tx: mpsc::UnboundedSender<OutputEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(OutputEvent::from_raw(stream, &line)).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(?stream, error = %e, "pipe read failed");
                break;
            }
        }
    }
    let _ = tx.send(OutputEvent::Eof(stream));
}
