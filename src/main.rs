use std::{env, fs};

use anyhow::{bail, Context};
use log::info;
use ndarray::{Array2, Array4};

use brain_policy::{
    BcPolicy, BrainInfo, BrainParameters, LocalSession, Policy, TrainerParameters,
};

const DEFAULT_SEED: u64 = 0;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let [_, brain_path, trainer_path] = args.as_slice() else {
        bail!("usage: brain_policy <brain.json> <trainer.json>");
    };

    let brain = fs::read_to_string(brain_path).with_context(|| format!("reading {brain_path}"))?;
    let brain = BrainParameters::from_json_str(&brain)?;

    let trainer =
        fs::read_to_string(trainer_path).with_context(|| format!("reading {trainer_path}"))?;
    let trainer = TrainerParameters::from_json_str(&trainer)?;

    let seed = match env::var("SEED") {
        Ok(seed) => seed.parse().context("parsing SEED")?,
        Err(_) => DEFAULT_SEED,
    };

    let mut sess = LocalSession::new();
    let mut policy = BcPolicy::new(seed, &brain, &trainer, &mut sess)?;

    let visual = brain
        .camera_resolutions
        .iter()
        .map(|c| Array4::zeros((1, c.height, c.width, c.channels())))
        .collect();

    let info = BrainInfo::new(
        vec![0],
        Array2::zeros((1, brain.vector_observation_size())),
        visual,
        policy.base().make_empty_memory(1),
    )?;

    for (name, value) in policy.inference(&mut sess, &info)? {
        info!("{name}: {value:?}");
    }

    let step = policy.increment_step(&mut sess)?;
    info!("{} is at step {step}", policy.graph_scope());

    Ok(())
}
