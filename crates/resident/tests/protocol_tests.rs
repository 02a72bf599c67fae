//! Tests for marker generation, payload framing and output accumulation.
//!
//! Everything here is pure: no interpreter is launched.

use std::collections::HashSet;

use pretty_assertions::assert_eq;
use resident::{
    CapturedOutput, Frame, Framer, MARKER_PREFIX, MarkerGenerator, OutputEvent, SessionConfig, Stream, Submission,
};

fn stdout(text: &str) -> OutputEvent {
    OutputEvent::Line {
        stream: Stream::Stdout,
        text: text.to_owned(),
    }
}

fn stderr(text: &str) -> OutputEvent {
    OutputEvent::Line {
        stream: Stream::Stderr,
        text: text.to_owned(),
    }
}

/// Feeds `events` and returns the first non-pending frame.
fn feed_all(framer: &mut Framer, events: impl IntoIterator<Item = OutputEvent>) -> Frame {
    for event in events {
        let frame = framer.feed(event);
        if frame != Frame::Pending {
            return frame;
        }
    }
    Frame::Pending
}

fn complete(frame: Frame) -> CapturedOutput {
    match frame {
        Frame::Complete(output) => output,
        other => panic!("expected a complete frame, got {other:?}"),
    }
}

// ============================================================================
// Markers
// ============================================================================

#[test]
fn markers_are_never_reused() {
    let mut markers = MarkerGenerator::new();
    let issued: HashSet<String> = (0..1_000).map(|_| markers.next_marker()).collect();
    assert_eq!(issued.len(), 1_000);
    assert_eq!(markers.issued(), 1_000);
}

#[test]
fn markers_carry_prefix_and_sequence() {
    let mut markers = MarkerGenerator::new();
    let first = markers.next_marker();
    let second = markers.next_marker();
    assert!(first.starts_with(&format!("{MARKER_PREFIX}_0_")), "{first}");
    assert!(second.starts_with(&format!("{MARKER_PREFIX}_1_")), "{second}");
}

#[test]
fn separate_generators_use_different_tokens() {
    let a = MarkerGenerator::new().next_marker();
    let b = MarkerGenerator::default().next_marker();
    assert_ne!(a, b, "two sessions must not share markers");
}

// ============================================================================
// Submission payloads
// ============================================================================

#[test]
fn payload_is_code_blank_line_then_marker_statement() {
    let submission = Submission::new("x = 1".to_owned(), "M".to_owned(), &SessionConfig::python());
    assert_eq!(submission.payload(), "x = 1\n\nprint(\"M\")\n");
    assert_eq!(submission.code(), "x = 1");
    assert_eq!(submission.marker(), "M");
}

#[test]
fn payload_keeps_existing_trailing_newline() {
    let submission = Submission::new("echo hi\n".to_owned(), "M".to_owned(), &SessionConfig::bash());
    assert_eq!(submission.payload(), "echo hi\n\necho M\n");
}

#[test]
fn blank_code_sends_only_the_marker() {
    let submission = Submission::new("  \n".to_owned(), "M".to_owned(), &SessionConfig::bash());
    assert_eq!(submission.payload(), "echo M\n");
}

// ============================================================================
// Framer
// ============================================================================

#[test]
fn marker_line_completes_submission() {
    let mut framer = Framer::new("M1");
    let output = complete(feed_all(&mut framer, [stdout("a"), stdout("b"), stdout("M1")]));
    assert_eq!(output.as_str(), "a\nb");
    assert_eq!(output.line_count(), 2);
    assert_eq!(output.lines().collect::<Vec<_>>(), ["a", "b"]);
}

#[test]
fn no_output_yields_empty_capture() {
    let mut framer = Framer::new("M1");
    let output = complete(framer.feed(stdout("M1")));
    assert!(output.is_empty());
    assert_eq!(output, "");
}

#[test]
fn text_before_marker_on_same_line_is_kept() {
    let mut framer = Framer::new("M1");
    let output = complete(feed_all(&mut framer, [stdout("first"), stdout("partialM1")]));
    assert_eq!(output.as_str(), "first\npartial");
}

#[test]
fn blank_lines_are_preserved() {
    let mut framer = Framer::new("M1");
    let output = complete(feed_all(&mut framer, [stdout(""), stdout("x"), stdout(""), stdout("M1")]));
    assert_eq!(output.as_str(), "\nx\n");
    assert_eq!(output.line_count(), 3);
}

#[test]
fn stderr_lines_are_captured_in_arrival_order() {
    let mut framer = Framer::new("M1");
    let output = complete(feed_all(
        &mut framer,
        [stdout("out"), stderr("err"), stdout("more"), stdout("M1")],
    ));
    assert_eq!(output.as_str(), "out\nerr\nmore");
}

#[test]
fn marker_on_stderr_does_not_complete() {
    let mut framer = Framer::new("M1");
    assert_eq!(framer.feed(stderr("M1")), Frame::Pending);
    assert_eq!(framer.partial(), "M1");
}

#[test]
fn stale_marker_is_ordinary_output() {
    let mut markers = MarkerGenerator::new();
    let stale = markers.next_marker();
    let current = markers.next_marker();

    let mut framer = Framer::new(current.clone());
    assert_eq!(framer.feed(stdout(&stale)), Frame::Pending);
    let output = complete(framer.feed(stdout(&current)));
    assert_eq!(output.as_str(), stale);
}

#[test]
fn stdout_eof_closes_with_partial_output() {
    let mut framer = Framer::new("M1");
    let frame = feed_all(&mut framer, [stdout("before exit"), OutputEvent::Eof(Stream::Stdout)]);
    match frame {
        Frame::Closed(partial) => assert_eq!(partial.as_str(), "before exit"),
        other => panic!("expected a closed frame, got {other:?}"),
    }
}

#[test]
fn stderr_eof_keeps_waiting() {
    let mut framer = Framer::new("M1");
    assert_eq!(framer.feed(OutputEvent::Eof(Stream::Stderr)), Frame::Pending);
    assert_eq!(framer.line_count(), 0);
}

#[test]
fn partial_reflects_collected_lines() {
    let mut framer = Framer::new("M1");
    framer.feed(stdout("one"));
    framer.feed(stdout("two"));
    assert_eq!(framer.partial(), "one\ntwo");
    assert_eq!(framer.line_count(), 2);
    assert_eq!(framer.marker(), "M1");
}

// ============================================================================
// Output events
// ============================================================================

#[test]
fn raw_lines_lose_their_terminators() {
    assert_eq!(OutputEvent::from_raw(Stream::Stdout, b"hello\n"), stdout("hello"));
    assert_eq!(OutputEvent::from_raw(Stream::Stdout, b"crlf\r\n"), stdout("crlf"));
    assert_eq!(OutputEvent::from_raw(Stream::Stderr, b"no newline"), stderr("no newline"));
}

#[test]
fn invalid_utf8_is_replaced() {
    let event = OutputEvent::from_raw(Stream::Stdout, b"bad \xff byte\n");
    assert_eq!(event, stdout("bad \u{fffd} byte"));
}

#[test]
fn captured_output_converts_to_string() {
    let mut framer = Framer::new("M1");
    let output = complete(feed_all(&mut framer, [stdout("value"), stdout("M1")]));
    assert_eq!(output.to_string(), "value");
    assert_eq!(output.as_ref(), "value");
    assert_eq!(String::from(output), "value");
}
