//! Save/restore of interpreter bindings through configured command templates.
//!
//! The interpreter side (how bindings are serialized) is an external
//! collaborator; this module only turns a path into the code string that asks
//! the interpreter to do it. The result is submitted like any other code.

use std::path::Path;

use crate::{
    config::{SessionConfig, Template},
    error::{Result, SessionError},
};

/// Characters that would break out of the quoted slot in the preset templates.
const FORBIDDEN_PATH_CHARS: &[char] = &['\'', '"', '\n', '\r'];

/// Formats save/load commands for one config.
#[derive(Debug, Clone, Copy)]
pub struct StateBridge<'a> {
    save: Option<&'a Template>,
    load: Option<&'a Template>,
}

impl<'a> StateBridge<'a> {
    /// Reads the save/load templates from `config`.
    #[must_use]
    pub fn new(config: &'a SessionConfig) -> Self {
        Self {
            save: config.save_state_template(),
            load: config.load_state_template(),
        }
    }

    /// Whether a save template is configured.
    #[must_use]
    pub fn can_save(&self) -> bool {
        self.save.is_some()
    }

    /// Whether a load template is configured.
    #[must_use]
    pub fn can_load(&self) -> bool {
        self.load.is_some()
    }

    /// Code that serializes the interpreter's bindings to `path`.
    pub fn save_command(&self, path: &Path) -> Result<String> {
        let template = self
            .save
            .ok_or_else(|| SessionError::Unsupported("no save-state template configured".to_owned()))?;
        Ok(template.render(&slot_path(path)?))
    }

    /// Code that deserializes bindings from `path` and merges them in.
    pub fn load_command(&self, path: &Path) -> Result<String> {
        let template = self
            .load
            .ok_or_else(|| SessionError::Unsupported("no load-state template configured".to_owned()))?;
        Ok(template.render(&slot_path(path)?))
    }
}

fn slot_path(path: &Path) -> Result<String> {
    let path = path
        .to_str()
        .ok_or_else(|| SessionError::InvalidArgument(format!("state path {} is not UTF-8", path.display())))?;
    if path.contains(FORBIDDEN_PATH_CHARS) {
        return Err(SessionError::InvalidArgument(format!(
            "state path {path:?} contains quote or newline characters"
        )));
    }
    Ok(path.to_owned())
}
