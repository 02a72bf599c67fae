//! Helpers shared by the integration tests that launch real interpreters.
//!
//! Tests that need `python3` or `bash` skip themselves (with a note on stderr)
//! when the program is not on `PATH`, so the suite stays green on minimal
//! build hosts.

use std::process::{Command, Stdio};

/// Whether `program --version` runs successfully.
pub fn have(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// Returns from the calling test when `$program` is unavailable.
macro_rules! require {
    ($program:expr) => {
        if !common::have($program) {
            eprintln!("skipping: {} not found on PATH", $program);
            return;
        }
    };
}
