mod bc;

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use ndarray::Array2;

pub use bc::BcPolicy;

use crate::{
    brain::{BrainInfo, BrainParameters, SpaceType},
    buffer::Batch,
    config::{Recurrence, TrainerParameters},
    model::Model,
    session::{Feeds, OpHandle, Session, Tensor},
    PolicyErr, Result,
};

/// The tensors produced by a policy run, keyed by the name they were registered with.
pub type Outputs = BTreeMap<String, Tensor>;

/// The configuration every policy shares: the capability flags derived from the brain, the
/// validated recurrent settings and the operations registered for inference and update.
#[derive(Debug, Clone)]
pub struct PolicyBase {
    seed: u64,
    brain_name: String,
    variable_scope: String,
    use_recurrent: bool,
    use_continuous_act: bool,
    use_visual_obs: bool,
    use_vector_obs: bool,
    m_size: Option<usize>,
    sequence_length: usize,
    inference_dict: OpDict,
    update_dict: OpDict,
}

impl PolicyBase {
    /// Creates a new `PolicyBase`.
    ///
    /// # Arguments
    /// * `seed` - The seed for everything random in the policy.
    /// * `brain` - The brain the policy acts for.
    /// * `trainer` - The trainer parameters.
    ///
    /// # Returns
    /// A configuration error if the recurrent settings are missing or invalid.
    pub fn new(seed: u64, brain: &BrainParameters, trainer: &TrainerParameters) -> Result<Self> {
        let recurrence = trainer.recurrence(&brain.brain_name)?;

        let base = Self {
            seed,
            brain_name: brain.brain_name.clone(),
            variable_scope: trainer.graph_scope.clone(),
            use_recurrent: recurrence.is_some(),
            use_continuous_act: brain.vector_action_space_type == SpaceType::Continuous,
            use_visual_obs: brain.number_visual_observations() > 0,
            use_vector_obs: brain.vector_observation_space_size > 0,
            m_size: recurrence.map(|r| r.memory_size),
            sequence_length: recurrence.map_or(1, |r| r.sequence_length),
            inference_dict: OpDict::default(),
            update_dict: OpDict::default(),
        };

        debug!(
            "{}: policy for brain {} (recurrent: {}, continuous: {}, visual: {}, vector: {})",
            base.variable_scope,
            base.brain_name,
            base.use_recurrent,
            base.use_continuous_act,
            base.use_visual_obs,
            base.use_vector_obs
        );

        Ok(base)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn brain_name(&self) -> &str {
        &self.brain_name
    }

    /// The prefix of every session node this policy defines.
    pub fn graph_scope(&self) -> &str {
        &self.variable_scope
    }

    pub fn use_recurrent(&self) -> bool {
        self.use_recurrent
    }

    pub fn use_continuous_act(&self) -> bool {
        self.use_continuous_act
    }

    pub fn use_visual_obs(&self) -> bool {
        self.use_visual_obs
    }

    pub fn use_vector_obs(&self) -> bool {
        self.use_vector_obs
    }

    /// The recurrent memory width, `None` unless the policy is recurrent.
    pub fn m_size(&self) -> Option<usize> {
        self.m_size
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    /// The validated recurrent settings, `None` unless the policy is recurrent.
    pub fn recurrence(&self) -> Option<Recurrence> {
        self.m_size.map(|memory_size| Recurrence {
            memory_size,
            sequence_length: self.sequence_length,
        })
    }

    /// Registers an operation to run on every inference, replacing any with the same name.
    pub fn register_inference(&mut self, name: impl Into<String>, handle: OpHandle) {
        self.inference_dict.insert(name.into(), handle);
    }

    /// Registers an operation to run on every update, replacing any with the same name.
    pub fn register_update(&mut self, name: impl Into<String>, handle: OpHandle) {
        self.update_dict.insert(name.into(), handle);
    }

    pub fn inference_dict(&self) -> &OpDict {
        &self.inference_dict
    }

    pub fn update_dict(&self) -> &OpDict {
        &self.update_dict
    }

    pub fn inference_vars(&self) -> BTreeSet<String> {
        self.inference_dict.names().map(str::to_string).collect()
    }

    pub fn update_vars(&self) -> BTreeSet<String> {
        self.update_dict.names().map(str::to_string).collect()
    }

    /// Returns a zeroed `[n_agents, m_size]` memory, with no columns if the policy isn't
    /// recurrent.
    pub fn make_empty_memory(&self, n_agents: usize) -> Array2<f32> {
        Array2::zeros((n_agents, self.m_size.unwrap_or(0)))
    }
}

/// Named operations kept in the order they were registered.
#[derive(Debug, Clone, Default)]
pub struct OpDict {
    entries: Vec<(String, OpHandle)>,
}

impl OpDict {
    /// Registers an operation. A name registered again keeps its position and gets the new
    /// handle.
    pub fn insert(&mut self, name: impl Into<String>, handle: OpHandle) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, h)) => *h = handle,
            None => self.entries.push((name, handle)),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn handles(&self) -> impl Iterator<Item = &OpHandle> {
        self.entries.iter().map(|(_, h)| h)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Runs every operation of `dict` in a single session run.
///
/// Operations run in registration order, so one that reads the parameters sees them as they
/// were before any operation registered after it writes them.
///
/// # Returns
/// The value of every operation keyed by its registered name.
pub fn run_named(sess: &mut dyn Session, dict: &OpDict, feeds: &Feeds) -> Result<Outputs> {
    let fetches: Vec<&OpHandle> = dict.handles().collect();
    let values = sess.run(&fetches, feeds)?;
    Ok(dict.names().map(str::to_string).zip(values).collect())
}

/// A decision making and learning unit: a trainable model living in a session plus the
/// operations that select actions with it and train it.
///
/// The session is shared by every policy of a run, so it's passed to each call instead of being
/// owned.
pub trait Policy {
    fn base(&self) -> &PolicyBase;

    fn model(&self) -> &dyn Model;

    /// Selects actions for the agents in `info` without changing the model's parameters.
    ///
    /// # Returns
    /// The value of every operation in the inference dict, keyed by name.
    fn inference(&mut self, sess: &mut dyn Session, info: &BrainInfo) -> Result<Outputs>;

    /// Runs one optimization step over a slice of `batch`.
    ///
    /// # Arguments
    /// * `sess` - The session the model lives in.
    /// * `batch` - The experience to learn from.
    /// * `n_sequences` - The amount of sequences in each mini batch.
    /// * `batch_index` - Which mini batch of `batch` to use.
    ///
    /// # Returns
    /// The value of every operation in the update dict, keyed by name.
    fn update(
        &mut self,
        sess: &mut dyn Session,
        batch: &Batch,
        n_sequences: usize,
        batch_index: usize,
    ) -> Result<Outputs>;

    fn graph_scope(&self) -> &str {
        self.base().graph_scope()
    }

    /// Reads the model's step counter from the session.
    fn get_current_step(&self, sess: &mut dyn Session) -> Result<i64> {
        let global_step = self.model().global_step();
        let out = sess.run(&[global_step], &Feeds::new())?;
        scalar(&out, global_step)
    }

    /// Advances the model's step counter by one.
    ///
    /// # Returns
    /// The new value of the counter.
    fn increment_step(&self, sess: &mut dyn Session) -> Result<i64> {
        let increment = self.model().increment_step();
        let out = sess.run(&[increment], &Feeds::new())?;
        scalar(&out, increment)
    }

    fn get_inference_vars(&self) -> BTreeSet<String> {
        self.base().inference_vars()
    }

    fn get_update_vars(&self) -> BTreeSet<String> {
        self.base().update_vars()
    }
}

fn scalar(out: &[Tensor], handle: &OpHandle) -> Result<i64> {
    match out.first() {
        Some(tensor) => tensor.to_scalar_i64(handle.name()),
        None => Err(PolicyErr::UnknownNode {
            name: handle.name().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{brain::CameraResolution, model::StepCounter, session::LocalSession};

    struct Steps(StepCounter);

    impl Model for Steps {
        fn global_step(&self) -> &OpHandle {
            self.0.global_step()
        }

        fn increment_step(&self) -> &OpHandle {
            self.0.increment_step()
        }
    }

    struct StepPolicy {
        base: PolicyBase,
        model: Steps,
    }

    impl Policy for StepPolicy {
        fn base(&self) -> &PolicyBase {
            &self.base
        }

        fn model(&self) -> &dyn Model {
            &self.model
        }

        fn inference(&mut self, _: &mut dyn Session, _: &BrainInfo) -> Result<Outputs> {
            Ok(Outputs::new())
        }

        fn update(&mut self, _: &mut dyn Session, _: &Batch, _: usize, _: usize) -> Result<Outputs> {
            Ok(Outputs::new())
        }
    }

    fn brain(kind: &str, vector: usize, cameras: usize) -> BrainParameters {
        BrainParameters {
            brain_name: "Ball3DBrain".into(),
            vector_observation_space_size: vector,
            num_stacked_vector_observations: 1,
            camera_resolutions: vec![
                CameraResolution {
                    width: 8,
                    height: 8,
                    black_and_white: false,
                };
                cameras
            ],
            vector_action_space_size: vec![2],
            vector_action_descriptions: vec![],
            vector_action_space_type: SpaceType::from(kind),
        }
    }

    #[test]
    fn recurrent_settings_are_kept() {
        for memory in [4, 8, 128] {
            let trainer = TrainerParameters::new("ppo").recurrent(memory, 16);
            let base = PolicyBase::new(0, &brain("continuous", 10, 0), &trainer).unwrap();
            assert!(base.use_recurrent());
            assert_eq!(base.m_size(), Some(memory));
            assert_eq!(base.sequence_length(), 16);
            assert_eq!(base.make_empty_memory(3).dim(), (3, memory));
        }
    }

    #[test]
    fn invalid_memory_sizes_are_rejected() {
        let trainer = TrainerParameters::new("ppo").recurrent(0, 16);
        assert!(matches!(
            PolicyBase::new(0, &brain("continuous", 10, 0), &trainer),
            Err(PolicyErr::ZeroMemorySize { brain }) if brain == "Ball3DBrain"
        ));

        for memory in [5, 6, 7, 9] {
            let trainer = TrainerParameters::new("ppo").recurrent(memory, 16);
            assert!(matches!(
                PolicyBase::new(0, &brain("continuous", 10, 0), &trainer),
                Err(PolicyErr::MemorySizeNotDivisible { memory_size, .. }) if memory_size == memory
            ));
        }
    }

    #[test]
    fn feed_forward_ignores_memory_size() {
        let mut trainer = TrainerParameters::new("ppo");
        trainer.memory_size = Some(6);
        trainer.sequence_length = Some(32);

        let base = PolicyBase::new(0, &brain("continuous", 10, 0), &trainer).unwrap();
        assert!(!base.use_recurrent());
        assert_eq!(base.m_size(), None);
        assert_eq!(base.sequence_length(), 1);
        assert!(base.recurrence().is_none());
        assert_eq!(base.make_empty_memory(2).dim(), (2, 0));
    }

    #[test]
    fn flags_follow_the_brain() {
        let trainer = TrainerParameters::new("bc");

        let base = PolicyBase::new(7, &brain("discrete", 0, 2), &trainer).unwrap();
        assert!(!base.use_continuous_act());
        assert!(base.use_visual_obs());
        assert!(!base.use_vector_obs());
        assert_eq!(base.seed(), 7);

        let base = PolicyBase::new(7, &brain("continuous", 3, 0), &trainer).unwrap();
        assert!(base.use_continuous_act());
        assert!(!base.use_visual_obs());
        assert!(base.use_vector_obs());
        assert_eq!(base.graph_scope(), "bc");
    }

    #[test]
    fn registered_names_are_reported() {
        let trainer = TrainerParameters::new("bc");
        let mut base = PolicyBase::new(0, &brain("continuous", 3, 0), &trainer).unwrap();
        assert!(base.inference_vars().is_empty());
        assert!(base.update_vars().is_empty());

        base.register_inference("action", OpHandle::scoped("bc", "action"));
        base.register_inference("action", OpHandle::scoped("bc", "action"));
        base.register_update("policy_loss", OpHandle::scoped("bc", "policy_loss"));

        let inference: Vec<_> = base.inference_vars().into_iter().collect();
        let update: Vec<_> = base.update_vars().into_iter().collect();
        assert_eq!(inference, vec!["action"]);
        assert_eq!(update, vec!["policy_loss"]);
    }

    #[test]
    fn run_named_keys_outputs_by_registered_name() {
        let mut sess = LocalSession::new();
        let step = StepCounter::define(&mut sess, "bc").unwrap();

        let mut dict = OpDict::default();
        dict.insert("step", step.global_step().clone());
        dict.insert("next", step.increment_step().clone());
        assert_eq!(dict.len(), 2);

        // the read is registered first, so it runs before the increment
        let out = run_named(&mut sess, &dict, &Feeds::new()).unwrap();
        assert_eq!(out["step"].to_scalar_i64("step").unwrap(), 0);
        assert_eq!(out["next"].to_scalar_i64("next").unwrap(), 1);

        dict.insert("step", step.increment_step().clone());
        dict.insert("next", step.global_step().clone());
        assert_eq!(dict.names().collect::<Vec<_>>(), vec!["step", "next"]);

        let out = run_named(&mut sess, &dict, &Feeds::new()).unwrap();
        assert_eq!(out["step"].to_scalar_i64("step").unwrap(), 2);
        assert_eq!(out["next"].to_scalar_i64("next").unwrap(), 2);
    }

    #[test]
    fn step_counter_round_trips() {
        let mut sess = LocalSession::new();
        let trainer = TrainerParameters::new("ppo");
        let policy = StepPolicy {
            base: PolicyBase::new(0, &brain("continuous", 3, 0), &trainer).unwrap(),
            model: Steps(StepCounter::define(&mut sess, "ppo").unwrap()),
        };

        assert_eq!(policy.get_current_step(&mut sess).unwrap(), 0);
        assert_eq!(policy.increment_step(&mut sess).unwrap(), 1);
        assert_eq!(policy.increment_step(&mut sess).unwrap(), 2);
        assert_eq!(policy.get_current_step(&mut sess).unwrap(), 2);
        assert_eq!(policy.graph_scope(), "ppo");
    }
}
