//! Blocking interactive session.
//!
//! `InteractiveSession` owns one interpreter process and runs submissions on
//! the calling thread: write the framed code, then block until the marker
//! line shows up on stdout.

use std::{
    fs,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    config::{SessionConfig, SessionOptions},
    error::{Result, SessionError},
    process::{ChildProcess, Received},
    protocol::{CapturedOutput, Frame, Framer, MarkerGenerator, OutputEvent, Stream, Submission},
    state::StateBridge,
};

/// How long `close` waits for the interpreter to exit after stdin is closed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Upper bound for the checkpoint save performed by `close`.
pub const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a terminated process is given to report its exit code.
const REAP_GRACE: Duration = Duration::from_millis(200);

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Constructed; no process yet.
    Unstarted,
    /// The interpreter is running and accepts submissions.
    Running,
    /// The process is gone. A new session must be opened.
    Closed,
}

/// A long-lived interpreter driven synchronously.
///
/// Only one submission may be outstanding. After a [`SessionError::Timeout`]
/// the submission stays outstanding: call [`wait`](Self::wait) to keep
/// waiting, or [`close`](Self::close) to give up on the session.
#[derive(Debug)]
pub struct InteractiveSession {
    config: Arc<SessionConfig>,
    options: SessionOptions,
    state: SessionState,
    process: Option<ChildProcess>,
    markers: MarkerGenerator,
    outstanding: Option<Framer>,
}

impl InteractiveSession {
    /// Creates an `Unstarted` session. The process is launched by
    /// [`open`](Self::open) or by the first submission.
    pub fn new(config: impl Into<Arc<SessionConfig>>, options: SessionOptions) -> Self {
        Self {
            config: config.into(),
            options,
            state: SessionState::Unstarted,
            process: None,
            markers: MarkerGenerator::new(),
            outstanding: None,
        }
    }

    /// Creates and opens a session.
    pub fn start(config: impl Into<Arc<SessionConfig>>, options: SessionOptions) -> Result<Self> {
        let mut session = Self::new(config, options);
        session.open()?;
        Ok(session)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The interpreter description this session was created with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Working directory, checkpoint and timeout settings.
    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Number of submissions sent so far, bootstrap included.
    #[must_use]
    pub fn submissions(&self) -> u64 {
        self.markers.issued()
    }

    /// Whether a timed-out submission is still waiting for its marker.
    #[must_use]
    pub fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    /// OS process id of the interpreter while running.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ChildProcess::id)
    }

    /// Launches the interpreter, runs the bootstrap code, and restores the
    /// checkpoint when one exists. Opening a running session is a no-op.
    pub fn open(&mut self) -> Result<()> {
        match self.state {
            SessionState::Running => return Ok(()),
            SessionState::Closed => return Err(SessionError::InvalidState("session is closed".to_owned())),
            SessionState::Unstarted => {}
        }

        self.process = Some(ChildProcess::spawn(&self.config, &self.options)?);
        self.state = SessionState::Running;
        info!(pid = self.pid(), "session opened");

        let bootstrap = self.config.bootstrap_code().map(str::to_owned);
        if let Some(bootstrap) = bootstrap {
            let discarded = self.execute(bootstrap, self.options.default_timeout)?;
            debug!(lines = discarded.line_count(), "bootstrap output discarded");
        }
        if let Some(checkpoint) = self.options.checkpoint.clone()
            && checkpoint.exists()
        {
            debug!(path = %checkpoint.display(), "restoring checkpoint");
            self.load_state(&checkpoint)?;
        }
        Ok(())
    }

    /// Runs `code` and returns its output, waiting up to the default timeout.
    pub fn run(&mut self, code: &str) -> Result<CapturedOutput> {
        self.run_inner(code, self.options.default_timeout)
    }

    /// Runs `code` and returns its output, waiting at most `timeout`.
    pub fn run_with_timeout(&mut self, code: &str, timeout: Duration) -> Result<CapturedOutput> {
        self.run_inner(code, Some(timeout))
    }

    /// Keeps waiting for a submission that previously timed out.
    ///
    /// Output collected during earlier waits is included in the result.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<CapturedOutput> {
        self.ensure_running()?;
        if self.outstanding.is_none() {
            return Err(SessionError::InvalidState("no submission is outstanding".to_owned()));
        }
        self.await_marker(timeout)
    }

    /// Runs a script file whose extension is listed in the config.
    pub fn run_file(&mut self, path: impl AsRef<Path>) -> Result<CapturedOutput> {
        let code = read_script(&self.config, path.as_ref())?;
        self.run(&code)
    }

    /// Asks the interpreter to serialize its bindings to `path`.
    pub fn save_state(&mut self, path: impl AsRef<Path>) -> Result<CapturedOutput> {
        let code = StateBridge::new(&self.config).save_command(path.as_ref())?;
        self.execute(code, self.options.default_timeout)
    }

    /// Asks the interpreter to merge bindings previously saved to `path`.
    pub fn load_state(&mut self, path: impl AsRef<Path>) -> Result<CapturedOutput> {
        let code = StateBridge::new(&self.config).load_command(path.as_ref())?;
        self.execute(code, self.options.default_timeout)
    }

    /// Saves the checkpoint (if configured and idle), then terminates the
    /// interpreter: stdin is closed, and the process is killed if it has not
    /// exited after [`SHUTDOWN_GRACE`]. Idempotent.
    ///
    /// The process is terminated even when the checkpoint save fails; that
    /// failure is returned afterwards.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            SessionState::Closed => return Ok(()),
            SessionState::Unstarted => {
                self.state = SessionState::Closed;
                return Ok(());
            }
            SessionState::Running => {}
        }

        let mut checkpoint_result = Ok(());
        if let Some(checkpoint) = self.options.checkpoint.clone() {
            if self.outstanding.is_some() {
                warn!(path = %checkpoint.display(), "submission outstanding, checkpoint not saved");
            } else {
                let command = StateBridge::new(&self.config).save_command(&checkpoint);
                checkpoint_result = command
                    .and_then(|code| self.execute(code, Some(CHECKPOINT_TIMEOUT)))
                    .map(|_| ());
            }
        }

        if let Some(mut process) = self.process.take() {
            process.terminate(SHUTDOWN_GRACE);
        }
        self.outstanding = None;
        self.state = SessionState::Closed;
        info!(submissions = self.markers.issued(), "session closed");
        checkpoint_result
    }

    fn run_inner(&mut self, code: &str, timeout: Option<Duration>) -> Result<CapturedOutput> {
        if self.state == SessionState::Closed {
            return Err(SessionError::InvalidState("session is closed".to_owned()));
        }
        if self.outstanding.is_some() {
            return Err(outstanding_error());
        }
        // rewrite before launching so a syntax error never spawns a process
        let prepared = self.config.prepare(code)?;
        if self.state == SessionState::Unstarted {
            self.open()?;
        }
        self.execute(prepared, timeout)
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state {
            SessionState::Running => Ok(()),
            SessionState::Unstarted => Err(SessionError::InvalidState("session has not been opened".to_owned())),
            SessionState::Closed => Err(SessionError::InvalidState("session is closed".to_owned())),
        }
    }

    /// Sends already-prepared code and waits for its marker.
    fn execute(&mut self, code: String, timeout: Option<Duration>) -> Result<CapturedOutput> {
        self.ensure_running()?;
        if self.outstanding.is_some() {
            return Err(outstanding_error());
        }

        let submission = Submission::new(code, self.markers.next_marker(), &self.config);
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| SessionError::InvalidState("session has no process".to_owned()))?;
        debug!(marker = submission.marker(), bytes = submission.payload().len(), "submitting");
        if let Err(e) = process.write(submission.payload()) {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                return Err(self.terminated(String::new()));
            }
            return Err(e.into());
        }
        self.outstanding = Some(Framer::new(submission.marker()));
        self.await_marker(timeout)
    }

    fn await_marker(&mut self, timeout: Option<Duration>) -> Result<CapturedOutput> {
        let started = Instant::now();
        let (Some(process), Some(framer)) = (self.process.as_mut(), self.outstanding.as_mut()) else {
            return Err(SessionError::InvalidState("no submission is outstanding".to_owned()));
        };

        match pump(process, framer, timeout.map(|t| started + t)) {
            Pumped::Complete(output) => {
                debug!(marker = framer.marker(), lines = output.line_count(), "marker observed");
                self.outstanding = None;
                Ok(output)
            }
            Pumped::TimedOut => Err(SessionError::Timeout {
                partial: framer.partial().to_owned(),
                waited: started.elapsed(),
            }),
            Pumped::Closed(partial) => Err(self.terminated(partial)),
        }
    }

    /// Records an unexpected exit and moves the session to `Closed`.
    fn terminated(&mut self, partial: String) -> SessionError {
        let status = self.process.as_mut().and_then(|p| p.reap(REAP_GRACE));
        if let Some(mut process) = self.process.take() {
            process.terminate(Duration::ZERO);
        }
        self.outstanding = None;
        self.state = SessionState::Closed;
        warn!(?status, "interpreter terminated unexpectedly");
        SessionError::Terminated { partial, status }
    }
}

impl Drop for InteractiveSession {
    fn drop(&mut self) {
        if self.state == SessionState::Running
            && let Err(e) = self.close()
        {
            warn!(error = %e, "error while closing session on drop");
        }
    }
}

enum Pumped {
    Complete(CapturedOutput),
    TimedOut,
    Closed(String),
}

/// Feeds events into `framer` until its marker, end of stream, or `deadline`.
fn pump(process: &ChildProcess, framer: &mut Framer, deadline: Option<Instant>) -> Pumped {
    loop {
        let event = match process.recv(deadline) {
            Received::Event(event) => event,
            Received::TimedOut => return Pumped::TimedOut,
            Received::Disconnected => return Pumped::Closed(framer.partial().to_owned()),
        };
        match framer.feed(event) {
            Frame::Pending => {}
            Frame::Complete(mut output) => {
                // stderr is a separate pipe; keep whatever it already delivered
                while let Some(late) = process.try_recv() {
                    match late {
                        OutputEvent::Line {
                            stream: Stream::Stderr,
                            text,
                        } => output.push_line(&text),
                        OutputEvent::Line {
                            stream: Stream::Stdout,
                            text,
                        } => warn!(line = %text, "dropping stdout line received after marker"),
                        OutputEvent::Eof(_) => {}
                    }
                }
                return Pumped::Complete(output);
            }
            Frame::Closed(partial) => return Pumped::Closed(partial.into_string()),
        }
    }
}

fn outstanding_error() -> SessionError {
    SessionError::InvalidState("a submission is still outstanding; call wait() or close()".to_owned())
}

/// Reads a script after checking its extension against the config.
pub(crate) fn read_script(config: &SessionConfig, path: &Path) -> Result<String> {
    let name = path.to_string_lossy();
    let accepted = config.script_extensions().iter().any(|ext| name.ends_with(ext.as_str()));
    if !accepted {
        return Err(SessionError::InvalidArgument(format!(
            "{name} does not have an accepted script extension ({})",
            config.script_extensions().join(", ")
        )));
    }
    fs::read_to_string(path).map_err(|e| SessionError::Io(format!("{name}: {e}")))
}
