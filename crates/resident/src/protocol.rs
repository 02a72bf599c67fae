//! Marker-based framing shared by the blocking and non-blocking drivers.
//!
//! A submission is the (possibly rewritten) code followed by a statement that
//! prints a fresh marker. The driver feeds every line the child produces into
//! a [`Framer`]; the submission is complete once a stdout line ends with its
//! marker. Nothing here performs I/O, so both drivers share one state machine
//! and differ only in how they wait for the next line.

use std::fmt;

use uuid::Uuid;

use crate::config::SessionConfig;

/// Prefix shared by every marker. Callers grepping raw transcripts can use it.
pub const MARKER_PREFIX: &str = "RESIDENT_DONE";

/// The child stream a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One event produced by a pipe reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// A complete line with its terminator removed.
    Line { stream: Stream, text: String },
    /// The stream reached end of file.
    Eof(Stream),
}

impl OutputEvent {
    /// Decodes a raw line read up to and including `\n`.
    #[must_use]
    pub fn from_raw(stream: Stream, raw: &[u8]) -> Self {
        let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        Self::Line {
            stream,
            text: String::from_utf8_lossy(raw).into_owned(),
        }
    }
}

/// Generates markers that are unique within a session and unpredictable
/// across sessions.
///
/// The sequence number guarantees no reuse while the session is open; the
/// random token makes collision with real program output implausible.
#[derive(Debug)]
pub struct MarkerGenerator {
    token: String,
    next_seq: u64,
}

impl MarkerGenerator {
    /// Starts a generator with a fresh random token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: Uuid::new_v4().simple().to_string(),
            next_seq: 0,
        }
    }

    /// Returns a marker never returned before by this generator.
    pub fn next_marker(&mut self) -> String {
        let seq = self.next_seq;
        self.next_seq += 1;
        format!("{MARKER_PREFIX}_{seq}_{}", self.token)
    }

    /// Number of markers handed out so far.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.next_seq
    }
}

impl Default for MarkerGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit of work: code ready to send plus the marker that terminates its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    code: String,
    marker: String,
    payload: String,
}

impl Submission {
    /// Frames `code` for the interpreter described by `config`.
    ///
    /// A blank line separates the code from the marker statement so that a
    /// trailing compound statement is closed under interactive evaluation.
    #[must_use]
    pub fn new(code: String, marker: String, config: &SessionConfig) -> Self {
        let mut payload = String::with_capacity(code.len() + marker.len() + 16);
        if !code.trim().is_empty() {
            payload.push_str(&code);
            if !code.ends_with('\n') {
                payload.push('\n');
            }
            payload.push('\n');
        }
        payload.push_str(&config.marker_template().render(&marker));
        payload.push('\n');
        Self { code, marker, payload }
    }

    /// The code as handed in, before framing.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The marker that terminates this submission's output.
    #[must_use]
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// The exact text written to the child's stdin.
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// Output produced by one submission, with the marker line removed.
///
/// Lines are joined with `\n`; the newline that preceded the marker belongs
/// to the marker line and is not part of the output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    text: String,
    line_count: usize,
}

impl CapturedOutput {
    /// The captured text without a trailing newline.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Consumes the capture, returning its text.
    #[must_use]
    pub fn into_string(self) -> String {
        self.text
    }

    /// True when no line was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.line_count == 0
    }

    /// Number of lines captured, blank lines included.
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.line_count
    }

    /// Iterates over the captured lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }

    pub(crate) fn push_line(&mut self, line: &str) {
        if self.line_count > 0 {
            self.text.push('\n');
        }
        self.text.push_str(line);
        self.line_count += 1;
    }
}

impl fmt::Display for CapturedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl AsRef<str> for CapturedOutput {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

impl From<CapturedOutput> for String {
    fn from(output: CapturedOutput) -> Self {
        output.text
    }
}

impl PartialEq<str> for CapturedOutput {
    fn eq(&self, other: &str) -> bool {
        self.text == other
    }
}

impl PartialEq<&str> for CapturedOutput {
    fn eq(&self, other: &&str) -> bool {
        self.text == *other
    }
}

/// Result of feeding one event to a [`Framer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The marker has not been seen yet.
    Pending,
    /// The marker was seen; the submission's output is complete.
    Complete(CapturedOutput),
    /// Stdout closed before the marker appeared.
    Closed(CapturedOutput),
}

/// Accumulates output for one submission until its marker line appears.
#[derive(Debug)]
pub struct Framer {
    marker: String,
    output: CapturedOutput,
}

impl Framer {
    /// Starts framing output that ends with `marker`.
    #[must_use]
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            output: CapturedOutput::default(),
        }
    }

    /// The marker that terminates this submission's output.
    #[must_use]
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Number of output lines collected so far.
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.output.line_count()
    }

    /// Feeds one event.
    ///
    /// Once `Complete` or `Closed` has been returned the framer is spent;
    /// further events are the caller's responsibility.
    pub fn feed(&mut self, event: OutputEvent) -> Frame {
        match event {
            OutputEvent::Line {
                stream: Stream::Stdout,
                text,
            } => {
                if let Some(prefix) = text.strip_suffix(self.marker.as_str()) {
                    // text printed without a newline right before the marker
                    if !prefix.is_empty() {
                        self.push(prefix);
                    }
                    return Frame::Complete(std::mem::take(&mut self.output));
                }
                self.push(&text);
                Frame::Pending
            }
            OutputEvent::Line {
                stream: Stream::Stderr,
                text,
            } => {
                self.push(&text);
                Frame::Pending
            }
            OutputEvent::Eof(Stream::Stdout) => Frame::Closed(std::mem::take(&mut self.output)),
            OutputEvent::Eof(Stream::Stderr) => Frame::Pending,
        }
    }

    /// Output collected so far, for timeout and termination reports.
    #[must_use]
    pub fn partial(&self) -> &str {
        self.output.as_str()
    }

    fn push(&mut self, line: &str) {
        self.output.push_line(line);
    }
}
