//! Blocking handle on a child interpreter process.
//!
//! One reader thread per output pipe decodes lines into [`OutputEvent`]s and
//! forwards them over a single channel, so the session can wait on both
//! streams with one `recv_timeout`.

use std::{
    io::{self, BufRead, BufReader, Read, Write},
    process::{Child, ChildStdin, Command, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    config::{SessionConfig, SessionOptions},
    error::{Result, SessionError},
    protocol::{OutputEvent, Stream},
};

/// Interval between exit checks while waiting for a graceful shutdown.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Outcome of waiting for the next output event.
pub(crate) enum Received {
    Event(OutputEvent),
    TimedOut,
    /// Both readers are gone; the process has closed its pipes.
    Disconnected,
}

#[derive(Debug)]
pub(crate) struct ChildProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    events: Receiver<OutputEvent>,
}

impl ChildProcess {
    /// Launches `config.launch_command()` with all three stdio streams piped.
    pub(crate) fn spawn(config: &SessionConfig, options: &SessionOptions) -> Result<Self> {
        let (program, args) = config
            .launch_command()
            .split_first()
            .ok_or_else(|| SessionError::InvalidConfig("launch command must not be empty".to_owned()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &options.work_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| SessionError::Spawn(format!("{program}: {e}")))?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            let _ = child.kill();
            return Err(SessionError::Spawn(format!("{program}: output pipes were not captured")));
        };

        let (tx, events) = mpsc::channel();
        let readers =
            spawn_reader(Stream::Stdout, stdout, tx.clone()).and_then(|()| spawn_reader(Stream::Stderr, stderr, tx));
        if let Err(e) = readers {
            let _ = child.kill();
            return Err(SessionError::Spawn(format!("cannot start pipe reader: {e}")));
        }

        debug!(pid = child.id(), program = %program, "spawned interpreter");
        Ok(Self { child, stdin, events })
    }

    pub(crate) fn id(&self) -> u32 {
        self.child.id()
    }

    /// Writes `payload` to stdin and flushes immediately.
    pub(crate) fn write(&mut self, payload: &str) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin already closed"))?;
        stdin.write_all(payload.as_bytes())?;
        stdin.flush()
    }

    /// Blocks until the next event, or until `deadline` passes.
    pub(crate) fn recv(&self, deadline: Option<Instant>) -> Received {
        let Some(deadline) = deadline else {
            return match self.events.recv() {
                Ok(event) => Received::Event(event),
                Err(_) => Received::Disconnected,
            };
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.events.recv_timeout(remaining) {
            Ok(event) => Received::Event(event),
            Err(RecvTimeoutError::Timeout) => Received::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Received::Disconnected,
        }
    }

    /// Returns an already-delivered event without blocking.
    pub(crate) fn try_recv(&self) -> Option<OutputEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Waits up to `grace` for the process to exit and returns its exit code.
    pub(crate) fn reap(&mut self, grace: Duration) -> Option<i32> {
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return status.code(),
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Closes stdin so the interpreter exits on EOF, then kills it if it is
    /// still alive after `grace`.
    pub(crate) fn terminate(&mut self, grace: Duration) {
        drop(self.stdin.take());
        if let Some(code) = self.reap(grace) {
            debug!(pid = self.child.id(), code, "interpreter exited");
            return;
        }
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        warn!(pid = self.child.id(), grace_ms = grace.as_millis(), "interpreter ignored EOF, killing");
        if let Err(e) = self.child.kill() {
            warn!(pid = self.child.id(), error = %e, "failed to kill interpreter");
        }
        let _ = self.child.wait();
    }
}

/// Starts a detached thread forwarding lines from `pipe`.
///
/// The thread is never joined: a background job spawned by the interpreter
/// may inherit the pipe and keep it open after the interpreter is gone.
fn spawn_reader<R>(stream: Stream, pipe: R, tx: Sender<OutputEvent>) -> io::Result<()>
where
    R: Read + Send + 'static,
{
    let name = match stream {
        Stream::Stdout => "resident-stdout",
        Stream::Stderr => "resident-stderr",
    };
    thread::Builder::new().name(name.to_owned()).spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
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
    })?;
    Ok(())
}
