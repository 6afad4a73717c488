use ndarray::{Array2, Array4};
use serde::{Deserialize, Serialize};

use crate::{PolicyErr, Result};

/// The kind of action space a brain exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SpaceType {
    Continuous,
    Discrete,
}

impl From<&str> for SpaceType {
    /// Only `"continuous"` maps to `Continuous`, every other string is treated as discrete.
    fn from(value: &str) -> Self {
        match value {
            "continuous" => SpaceType::Continuous,
            _ => SpaceType::Discrete,
        }
    }
}

impl From<String> for SpaceType {
    fn from(value: String) -> Self {
        SpaceType::from(value.as_str())
    }
}

impl From<SpaceType> for String {
    fn from(value: SpaceType) -> Self {
        match value {
            SpaceType::Continuous => "continuous".into(),
            SpaceType::Discrete => "discrete".into(),
        }
    }
}

/// The resolution of one of the brain's cameras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraResolution {
    pub width: usize,
    pub height: usize,
    #[serde(default)]
    pub black_and_white: bool,
}

impl CameraResolution {
    pub fn channels(&self) -> usize {
        if self.black_and_white {
            1
        } else {
            3
        }
    }

    /// Returns the amount of values in one flattened frame of this camera.
    pub fn frame_size(&self) -> usize {
        self.width * self.height * self.channels()
    }
}

/// The specification of an agent's observation and action spaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrainParameters {
    pub brain_name: String,
    pub vector_observation_space_size: usize,
    #[serde(default = "default_stacked")]
    pub num_stacked_vector_observations: usize,
    #[serde(default)]
    pub camera_resolutions: Vec<CameraResolution>,
    pub vector_action_space_size: Vec<usize>,
    #[serde(default)]
    pub vector_action_descriptions: Vec<String>,
    pub vector_action_space_type: SpaceType,
}

fn default_stacked() -> usize {
    1
}

impl BrainParameters {
    /// Parses a brain from its json representation.
    ///
    /// # Arguments
    /// * `json` - The json document.
    ///
    /// # Returns
    /// The parsed brain or a `PolicyErr::Json` error.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn number_visual_observations(&self) -> usize {
        self.camera_resolutions.len()
    }

    /// Returns the width of the vector observation once the stacked frames are concatenated.
    pub fn vector_observation_size(&self) -> usize {
        self.vector_observation_space_size * self.num_stacked_vector_observations
    }

    /// Returns the amount of action values an agent emits: one per branch when discrete, the
    /// action vector's length when continuous.
    pub fn action_size(&self) -> usize {
        match self.vector_action_space_type {
            SpaceType::Continuous => self.vector_action_space_size.first().copied().unwrap_or(0),
            SpaceType::Discrete => self.vector_action_space_size.len(),
        }
    }
}

/// The observations collected from the agents of one brain at one step.
#[derive(Debug, Clone)]
pub struct BrainInfo {
    agents: Vec<u64>,
    vector_observations: Array2<f32>,
    visual_observations: Vec<Array4<f32>>,
    memories: Array2<f32>,
}

impl BrainInfo {
    /// Creates a new `BrainInfo`.
    ///
    /// # Arguments
    /// * `agents` - The ids of the agents, one row of every array belongs to each of them.
    /// * `vector_observations` - A `[agents, obs]` array.
    /// * `visual_observations` - One `[agents, height, width, channels]` array per camera.
    /// * `memories` - A `[agents, memory]` array, it may have zero columns.
    ///
    /// # Returns
    /// An error if any of the arrays doesn't have one row per agent.
    pub fn new(
        agents: Vec<u64>,
        vector_observations: Array2<f32>,
        visual_observations: Vec<Array4<f32>>,
        memories: Array2<f32>,
    ) -> Result<Self> {
        let n = agents.len();
        let rows = [
            ("vector observations", vector_observations.nrows()),
            ("memories", memories.nrows()),
        ];

        for (what, got) in rows {
            if got != n {
                return Err(PolicyErr::ShapeMismatch {
                    what,
                    got,
                    expected: n,
                });
            }
        }

        if let Some(visual) = visual_observations.iter().find(|v| v.dim().0 != n) {
            return Err(PolicyErr::ShapeMismatch {
                what: "visual observations",
                got: visual.dim().0,
                expected: n,
            });
        }

        Ok(Self {
            agents,
            vector_observations,
            visual_observations,
            memories,
        })
    }

    pub fn agents(&self) -> &[u64] {
        &self.agents
    }

    pub fn vector_observations(&self) -> &Array2<f32> {
        &self.vector_observations
    }

    pub fn visual_observations(&self) -> &[Array4<f32>] {
        &self.visual_observations
    }

    pub fn memories(&self) -> &Array2<f32> {
        &self.memories
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_continuous_is_continuous() {
        assert_eq!(SpaceType::from("continuous"), SpaceType::Continuous);
        assert_eq!(SpaceType::from("discrete"), SpaceType::Discrete);
        assert_eq!(SpaceType::from("Continuous"), SpaceType::Discrete);
        assert_eq!(SpaceType::from(""), SpaceType::Discrete);
    }

    #[test]
    fn parses_brain_json() {
        let json = r#"{
            "brain_name": "Ball3DBrain",
            "vector_observation_space_size": 8,
            "num_stacked_vector_observations": 3,
            "camera_resolutions": [{"width": 84, "height": 84, "black_and_white": true}],
            "vector_action_space_size": [2],
            "vector_action_space_type": "continuous"
        }"#;

        let brain = BrainParameters::from_json_str(json).unwrap();
        assert_eq!(brain.brain_name, "Ball3DBrain");
        assert_eq!(brain.vector_observation_size(), 24);
        assert_eq!(brain.number_visual_observations(), 1);
        assert_eq!(brain.camera_resolutions[0].frame_size(), 84 * 84);
        assert_eq!(brain.action_size(), 2);
        assert!(brain.vector_action_descriptions.is_empty());
    }

    #[test]
    fn discrete_action_size_counts_branches() {
        let json = r#"{
            "brain_name": "GridBrain",
            "vector_observation_space_size": 0,
            "vector_action_space_size": [3, 2, 5],
            "vector_action_space_type": "discrete"
        }"#;

        let brain = BrainParameters::from_json_str(json).unwrap();
        assert_eq!(brain.num_stacked_vector_observations, 1);
        assert_eq!(brain.action_size(), 3);
    }

    #[test]
    fn brain_info_rejects_mismatched_rows() {
        let res = BrainInfo::new(
            vec![0, 1],
            Array2::zeros((3, 4)),
            vec![],
            Array2::zeros((2, 0)),
        );

        assert!(matches!(
            res,
            Err(PolicyErr::ShapeMismatch {
                what: "vector observations",
                got: 3,
                expected: 2
            })
        ));
    }

    #[test]
    fn brain_info_rejects_mismatched_cameras() {
        let res = BrainInfo::new(
            vec![0],
            Array2::zeros((1, 4)),
            vec![Array4::zeros((2, 8, 8, 1))],
            Array2::zeros((1, 0)),
        );

        assert!(matches!(
            res,
            Err(PolicyErr::ShapeMismatch {
                what: "visual observations",
                ..
            })
        ));
    }
}
