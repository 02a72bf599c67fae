//! Launch and protocol configuration for interpreter sessions.

use std::{fmt, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SessionError},
    rewrite::{ErrorPolicy, SourceRewriter},
};

/// The substitution slot used by every [`Template`].
pub const TEMPLATE_SLOT: &str = "{}";

/// Interpreter bootstrap for the python preset.
///
/// Sent once over stdin right after launch. Merges stderr into stdout so that
/// tracebacks stay ordered with printed output, and defines the save/load
/// helpers the state templates call. Compound statements end with a blank
/// line because the interpreter evaluates stdin in interactive mode.
const PYTHON_BOOTSTRAP: &str = "\
import sys
import pickle
import types
sys.stderr = sys.stdout
def save_object(filename):
    snapshot = {}
    for name, value in list(globals().items()):
        if name.startswith('__') or isinstance(value, types.ModuleType):
            continue
        try:
            pickle.dumps(value)
        except Exception:
            continue
        snapshot[name] = value
    with open(filename, 'wb') as f:
        pickle.dump(snapshot, f)

def load_object(filename):
    with open(filename, 'rb') as f:
        globals().update(pickle.load(f))

";

/// A command string with exactly one `{}` slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Template(String);

impl Template {
    /// Validates that `template` contains exactly one `{}` slot.
    pub fn parse(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        match template.matches(TEMPLATE_SLOT).count() {
            1 => Ok(Self(template)),
            n => Err(SessionError::InvalidConfig(format!(
                "template {template:?} must contain exactly one {TEMPLATE_SLOT} slot, found {n}"
            ))),
        }
    }

    /// Substitutes `value` into the slot.
    #[must_use]
    pub fn render(&self, value: &str) -> String {
        self.0.replacen(TEMPLATE_SLOT, value, 1)
    }

    /// The template text, slot included.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Template {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<Template> for String {
    fn from(template: Template) -> Self {
        template.0
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable description of how to launch and talk to an interpreter.
///
/// Build one with [`SessionConfig::builder`], a preset such as
/// [`SessionConfig::python`], or [`SessionConfig::from_json`]. Sessions keep
/// the config behind an `Arc`; nothing mutates it after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    launch_command: Vec<String>,
    marker_template: Template,
    #[serde(default)]
    save_state_template: Option<Template>,
    #[serde(default)]
    load_state_template: Option<Template>,
    #[serde(default)]
    bootstrap_code: Option<String>,
    /// `None` sends code verbatim (shells); `Some` guards Python code.
    #[serde(default)]
    error_policy: Option<ErrorPolicy>,
    /// File extensions accepted by `run_file`, including the dot.
    #[serde(default)]
    script_extensions: Vec<String>,
}

impl SessionConfig {
    /// Starts a builder for the given launch command.
    pub fn builder<I, S>(launch_command: I) -> SessionConfigBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SessionConfigBuilder {
            launch_command: launch_command.into_iter().map(Into::into).collect(),
            marker_template: None,
            save_state_template: None,
            load_state_template: None,
            bootstrap_code: None,
            error_policy: None,
            script_extensions: Vec::new(),
        }
    }

    /// `python3` in forced interactive mode with unbuffered output.
    ///
    /// Prompts are cleared from the command line so they never reach the
    /// captured output; submissions are guarded with
    /// [`ErrorPolicy::PrintWithVariables`]; state is pickled through the
    /// helpers defined in the bootstrap.
    #[must_use]
    pub fn python() -> Self {
        Self {
            launch_command: ["python3", "-i", "-q", "-u", "-c", "import sys; sys.ps1 = sys.ps2 = ''"]
                .into_iter()
                .map(String::from)
                .collect(),
            marker_template: Template("print(\"{}\")".to_owned()),
            save_state_template: Some(Template("save_object('{}')".to_owned())),
            load_state_template: Some(Template("load_object('{}')".to_owned())),
            bootstrap_code: Some(PYTHON_BOOTSTRAP.to_owned()),
            error_policy: Some(ErrorPolicy::PrintWithVariables),
            script_extensions: vec![".py".to_owned()],
        }
    }

    /// Non-interactive `bash` reading commands from stdin.
    ///
    /// Code is sent verbatim. State snapshots go through `declare -p`;
    /// read-only variables cannot be restored and their errors are discarded.
    #[must_use]
    pub fn bash() -> Self {
        Self {
            launch_command: ["bash", "--norc", "--noprofile"].into_iter().map(String::from).collect(),
            marker_template: Template("echo {}".to_owned()),
            save_state_template: Some(Template("declare -p > '{}' 2>/dev/null".to_owned())),
            load_state_template: Some(Template("source '{}' 2>/dev/null".to_owned())),
            bootstrap_code: Some("exec 2>&1\n".to_owned()),
            error_policy: None,
            script_extensions: vec![".sh".to_owned()],
        }
    }

    /// Parses and validates a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the config to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<()> {
        match self.launch_command.first() {
            None => Err(SessionError::InvalidConfig("launch command must not be empty".to_owned())),
            Some(program) if program.trim().is_empty() => {
                Err(SessionError::InvalidConfig("launch program must not be blank".to_owned()))
            }
            Some(_) => Ok(()),
        }
    }

    /// Program and arguments used to start the interpreter.
    #[must_use]
    pub fn launch_command(&self) -> &[String] {
        &self.launch_command
    }

    /// Statement that prints the end-of-submission marker.
    #[must_use]
    pub fn marker_template(&self) -> &Template {
        &self.marker_template
    }

    /// Statement that saves bindings to a path, if state saving is supported.
    #[must_use]
    pub fn save_state_template(&self) -> Option<&Template> {
        self.save_state_template.as_ref()
    }

    /// Statement that loads bindings from a path, if state loading is supported.
    #[must_use]
    pub fn load_state_template(&self) -> Option<&Template> {
        self.load_state_template.as_ref()
    }

    /// Code sent once after launch, before any submission.
    #[must_use]
    pub fn bootstrap_code(&self) -> Option<&str> {
        self.bootstrap_code.as_deref()
    }

    /// Guard policy for submissions; `None` sends code verbatim.
    #[must_use]
    pub fn error_policy(&self) -> Option<ErrorPolicy> {
        self.error_policy
    }

    /// The rewriter applied to submissions, if the config guards code.
    #[must_use]
    pub fn rewriter(&self) -> Option<SourceRewriter> {
        self.error_policy.map(SourceRewriter::new)
    }

    /// File extensions `run_file` accepts, including the dot.
    #[must_use]
    pub fn script_extensions(&self) -> &[String] {
        &self.script_extensions
    }

    /// Applies the configured rewriter, or returns the code unchanged.
    pub(crate) fn prepare(&self, code: &str) -> Result<String> {
        match self.rewriter() {
            Some(rewriter) => Ok(rewriter.wrap(code)?),
            None => Ok(code.to_owned()),
        }
    }
}

/// Builder for [`SessionConfig`]. Validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    launch_command: Vec<String>,
    marker_template: Option<String>,
    save_state_template: Option<String>,
    load_state_template: Option<String>,
    bootstrap_code: Option<String>,
    error_policy: Option<ErrorPolicy>,
    script_extensions: Vec<String>,
}

impl SessionConfigBuilder {
    /// Sets the statement that prints the marker, e.g. `print("{}")`. Required.
    #[must_use]
    pub fn marker_template(mut self, template: impl Into<String>) -> Self {
        self.marker_template = Some(template.into());
        self
    }

    /// Sets the statement that saves interpreter state to the path in the slot.
    #[must_use]
    pub fn save_state_template(mut self, template: impl Into<String>) -> Self {
        self.save_state_template = Some(template.into());
        self
    }

    /// Sets the statement that loads interpreter state from the path in the slot.
    #[must_use]
    pub fn load_state_template(mut self, template: impl Into<String>) -> Self {
        self.load_state_template = Some(template.into());
        self
    }

    /// Sets code sent once right after the interpreter starts.
    ///
    /// Stdout and stderr are read from separate pipes, and a submission ends
    /// when its marker shows up on stdout. Stderr written just before the
    /// marker may therefore arrive late and be attributed to the next
    /// submission. Bootstrap code that merges stderr into stdout (as the
    /// presets do with `sys.stderr = sys.stdout` and `exec 2>&1`) keeps
    /// output ordered and attributed to the right submission.
    #[must_use]
    pub fn bootstrap_code(mut self, code: impl Into<String>) -> Self {
        self.bootstrap_code = Some(code.into());
        self
    }

    /// Guards every submission with the given policy (Python interpreters only).
    #[must_use]
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = Some(policy);
        self
    }

    /// Adds a file extension accepted by `run_file`, e.g. `.py`.
    #[must_use]
    pub fn script_extension(mut self, extension: impl Into<String>) -> Self {
        self.script_extensions.push(extension.into());
        self
    }

    /// Validates the templates and launch command.
    pub fn build(self) -> Result<SessionConfig> {
        let marker_template = self
            .marker_template
            .ok_or_else(|| SessionError::InvalidConfig("marker template is required".to_owned()))?;
        let config = SessionConfig {
            launch_command: self.launch_command,
            marker_template: Template::parse(marker_template)?,
            save_state_template: self.save_state_template.map(Template::parse).transpose()?,
            load_state_template: self.load_state_template.map(Template::parse).transpose()?,
            bootstrap_code: self.bootstrap_code,
            error_policy: self.error_policy,
            script_extensions: self.script_extensions,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Per-session settings that are not part of the interpreter description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Working directory of the child process.
    pub work_dir: Option<PathBuf>,
    /// State file loaded after bootstrap (when it exists) and saved on close.
    pub checkpoint: Option<PathBuf>,
    /// Maximum wait applied by `run` when no explicit timeout is given.
    pub default_timeout: Option<Duration>,
}

impl SessionOptions {
    /// Options with no working directory, checkpoint or timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the interpreter in `dir`.
    #[must_use]
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Loads state from `path` at open and saves it there at close.
    #[must_use]
    pub fn checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    /// Caps how long `run` waits for a marker.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}
