use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{PolicyErr, Result};

const REQUIRED_KEYS: [&str; 2] = ["graph_scope", "use_recurrent"];
const RECURRENT_KEYS: [&str; 2] = ["memory_size", "sequence_length"];

/// The trainer parameters a policy reads.
///
/// Trainer configuration files carry keys for other components as well, those are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerParameters {
    pub graph_scope: String,
    pub use_recurrent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_length: Option<usize>,
    #[serde(default = "default_hidden_units")]
    pub hidden_units: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
}

fn default_hidden_units() -> usize {
    128
}

fn default_num_layers() -> usize {
    2
}

fn default_learning_rate() -> f32 {
    3e-4
}

/// The validated recurrent settings of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recurrence {
    pub memory_size: usize,
    pub sequence_length: usize,
}

impl TrainerParameters {
    /// Creates the parameters of a non recurrent trainer with default hyperparameters.
    pub fn new(graph_scope: impl Into<String>) -> Self {
        Self {
            graph_scope: graph_scope.into(),
            use_recurrent: false,
            memory_size: None,
            sequence_length: None,
            hidden_units: default_hidden_units(),
            num_layers: default_num_layers(),
            learning_rate: default_learning_rate(),
        }
    }

    /// Turns recurrence on with the given memory size and sequence length.
    pub fn recurrent(mut self, memory_size: usize, sequence_length: usize) -> Self {
        self.use_recurrent = true;
        self.memory_size = Some(memory_size);
        self.sequence_length = Some(sequence_length);
        self
    }

    /// Parses the parameters from a json document.
    ///
    /// # Arguments
    /// * `json` - The json document, it must be an object.
    ///
    /// # Returns
    /// The parsed parameters or an error if a required key is missing or has the wrong type.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Parses the parameters from an already decoded json value.
    ///
    /// # Arguments
    /// * `value` - The configuration mapping.
    ///
    /// # Returns
    /// The parsed parameters or an error if a required key is missing or has the wrong type.
    /// The recurrent keys are only read when `use_recurrent` is true, otherwise they're dropped
    /// whatever they hold.
    pub fn from_value(mut value: Value) -> Result<Self> {
        let Some(map) = value.as_object_mut() else {
            return Err(PolicyErr::InvalidParameter {
                key: "trainer_parameters",
                reason: "expected a mapping".into(),
            });
        };

        if let Some(key) = REQUIRED_KEYS.into_iter().find(|k| !map.contains_key(*k)) {
            return Err(PolicyErr::MissingParameter { key });
        }

        if map.get("use_recurrent") == Some(&Value::Bool(false)) {
            for key in RECURRENT_KEYS {
                if map.remove(key).is_some() {
                    warn!("ignoring {key} since use_recurrent is false");
                }
            }
        }

        serde_json::from_value(value).map_err(|e| PolicyErr::InvalidParameter {
            key: "trainer_parameters",
            reason: e.to_string(),
        })
    }

    /// Resolves the recurrent settings of the trainer for a given brain.
    ///
    /// # Arguments
    /// * `brain_name` - The name of the brain, used in error messages.
    ///
    /// # Returns
    /// `None` when the trainer isn't recurrent, whatever memory size the parameters hold.
    /// An error when it is recurrent and the memory size is zero or not divisible by 4.
    pub fn recurrence(&self, brain_name: &str) -> Result<Option<Recurrence>> {
        if !self.use_recurrent {
            if self.memory_size.is_some() {
                warn!("brain {brain_name}: ignoring memory_size since use_recurrent is false");
            }
            return Ok(None);
        }

        let memory_size = self.memory_size.ok_or(PolicyErr::MissingParameter {
            key: "memory_size",
        })?;

        let sequence_length = self.sequence_length.ok_or(PolicyErr::MissingParameter {
            key: "sequence_length",
        })?;

        if memory_size == 0 {
            return Err(PolicyErr::ZeroMemorySize {
                brain: brain_name.to_string(),
            });
        }

        if memory_size % 4 != 0 {
            return Err(PolicyErr::MemorySizeNotDivisible {
                brain: brain_name.to_string(),
                memory_size,
            });
        }

        Ok(Some(Recurrence {
            memory_size,
            sequence_length,
        }))
    }
}
