use log::{debug, info};
use ndarray::Array2;

use super::{run_named, Outputs, Policy, PolicyBase};
use crate::{
    brain::{BrainInfo, BrainParameters},
    buffer::{visual_obs_key, Batch, ACTIONS, VECTOR_OBS},
    config::TrainerParameters,
    model::{BcModel, Model},
    session::{Feeds, Session, Tensor},
    PolicyErr, Result,
};

/// A policy that learns to imitate the actions of an expert.
pub struct BcPolicy {
    base: PolicyBase,
    model: BcModel,
}

impl BcPolicy {
    /// Creates a new `BcPolicy`, defining its model in the session under the trainer's graph
    /// scope.
    ///
    /// # Arguments
    /// * `seed` - The seed for the parameter initialization and the action sampling.
    /// * `brain` - The brain the policy acts for.
    /// * `trainer` - The trainer parameters.
    /// * `sess` - The session the model will live in.
    ///
    /// # Returns
    /// A configuration error if the recurrent settings are invalid, or a session error if the
    /// graph scope is already taken.
    pub fn new(
        seed: u64,
        brain: &BrainParameters,
        trainer: &TrainerParameters,
        sess: &mut dyn Session,
    ) -> Result<Self> {
        let mut base = PolicyBase::new(seed, brain, trainer)?;
        let model = BcModel::new(sess, brain, trainer, base.recurrence(), seed)?;

        base.register_inference("action", model.action().clone());
        if let Some(memory_out) = model.memory_out() {
            base.register_inference("memory_out", memory_out.clone());
        }
        if let Some(probs) = model.action_probs() {
            base.register_inference("action_probs", probs.clone());
        }

        // the loss runs first so it reports the parameters before the step
        base.register_update("policy_loss", model.loss().clone());
        base.register_update("update_batch", model.update().clone());

        info!(
            "{}: behavioral cloning policy ready for brain {}",
            base.graph_scope(),
            base.brain_name()
        );

        Ok(Self { base, model })
    }

    pub fn bc_model(&self) -> &BcModel {
        &self.model
    }

    fn visual_feeds<I>(&self, feeds: &mut Feeds, frames: I) -> Result<()>
    where
        I: ExactSizeIterator<Item = Result<Array2<f32>>>,
    {
        let expected = self.model.visual_in().len();
        if frames.len() != expected {
            return Err(PolicyErr::ShapeMismatch {
                what: "visual observations",
                got: frames.len(),
                expected,
            });
        }

        for (handle, frame) in self.model.visual_in().iter().zip(frames) {
            feeds.insert(handle, frame?);
        }

        Ok(())
    }
}

impl Policy for BcPolicy {
    fn base(&self) -> &PolicyBase {
        &self.base
    }

    fn model(&self) -> &dyn Model {
        &self.model
    }

    fn inference(&mut self, sess: &mut dyn Session, info: &BrainInfo) -> Result<Outputs> {
        let n_agents = info.agents().len();
        let mut feeds = Feeds::new();

        if let Some(vector_in) = self.model.vector_in() {
            feeds.insert(vector_in, info.vector_observations().clone());
        }

        let frames = info.visual_observations().iter().map(|v| {
            let (n, h, w, c) = v.dim();
            v.to_shape((n, h * w * c))
                .map(|f| f.into_owned())
                .map_err(|_| PolicyErr::ShapeMismatch {
                    what: "visual observation layout",
                    got: v.len(),
                    expected: n * h * w * c,
                })
        });
        self.visual_feeds(&mut feeds, frames)?;

        if let Some(memory_in) = self.model.memory_in() {
            let memories = info.memories();
            let memories = if memories.ncols() == 0 {
                self.base.make_empty_memory(n_agents)
            } else {
                memories.clone()
            };
            feeds.insert(memory_in, memories);
        }

        run_named(sess, self.base.inference_dict(), &feeds)
    }

    fn update(
        &mut self,
        sess: &mut dyn Session,
        batch: &Batch,
        n_sequences: usize,
        batch_index: usize,
    ) -> Result<Outputs> {
        let seq_len = self.base.sequence_length();
        let range = n_sequences.checked_mul(seq_len).and_then(|rows| {
            let start = batch_index.checked_mul(rows)?;
            Some((start, start.checked_add(rows)?))
        });
        let (start, end) = range.ok_or(PolicyErr::ShapeMismatch {
            what: "batch slice end",
            got: usize::MAX,
            expected: batch.len(),
        })?;
        let mini = batch.slice(start, end)?;

        debug!(
            "{}: updating on rows {start}..{end} of {}",
            self.base.graph_scope(),
            batch.len()
        );

        let mut feeds = Feeds::new();
        if let Some(vector_in) = self.model.vector_in() {
            feeds.insert(vector_in, mini.get(VECTOR_OBS)?.clone());
        }

        let n_visual = self.model.visual_in().len();
        let frames = (0..n_visual).map(|i| mini.get(&visual_obs_key(i)).cloned());
        self.visual_feeds(&mut feeds, frames)?;

        feeds.insert(self.model.expert_action(), mini.get(ACTIONS)?.clone());
        feeds.insert(
            self.model.sequence_length(),
            Tensor::scalar_i64(seq_len as i64),
        );

        run_named(sess, self.base.update_dict(), &feeds)
    }
}
