//! Projects and brains

use serde::{Deserialize, Serialize};

use crate::{Result, TutorError};

/// Tenant and API boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Project identifier
    pub project_id: String,
    /// Human readable name
    pub name: String,
    /// Key clients present; validated outside the core
    pub api_key: String,
    /// Creation time in microseconds
    pub created_micros: u64,
}

/// A trainable policy definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Brain {
    /// Brain identifier
    pub brain_id: String,
    /// Human readable name
    pub name: String,
    /// Creation time in microseconds
    pub created_micros: u64,
    /// Observation/action spec, opaque to the coordinator
    pub brain_spec: serde_json::Value,
    /// Set when the first session starts; the brain spec is immutable afterwards
    #[serde(default)]
    pub spec_frozen: bool,
}

impl Brain {
    /// Replace the brain spec while no session has started
    pub fn replace_spec(&mut self, brain_spec: serde_json::Value) -> Result<()> {
        if self.spec_frozen {
            return Err(TutorError::InvalidState(format!(
                "brain {} spec is frozen once a session has started",
                self.brain_id
            )));
        }
        self.brain_spec = brain_spec;
        Ok(())
    }
}
