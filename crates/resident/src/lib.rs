#![doc = include_str!("../../../README.md")]

mod async_session;
mod config;
mod error;
mod process;
mod protocol;
pub mod rewrite;
mod session;
mod state;

pub use crate::{
    async_session::AsyncSession,
    config::{SessionConfig, SessionConfigBuilder, SessionOptions, TEMPLATE_SLOT, Template},
    error::{Result, SessionError},
    protocol::{
        CapturedOutput, Frame, Framer, MARKER_PREFIX, MarkerGenerator, OutputEvent, Stream, Submission,
    },
    rewrite::{DIAGNOSTIC_PREFIX, ErrorPolicy, GUARD_EXCEPTION_NAME, RewriteError, SourceRewriter},
    session::{CHECKPOINT_TIMEOUT, InteractiveSession, SHUTDOWN_GRACE, SessionState},
    state::StateBridge,
};
