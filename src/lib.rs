pub mod brain;
pub mod buffer;
pub mod config;
pub mod error;
pub mod model;
pub mod policy;
pub mod session;

pub use brain::{BrainInfo, BrainParameters, SpaceType};
pub use buffer::Batch;
pub use config::TrainerParameters;
pub use error::{PolicyErr, Result};
pub use policy::{BcPolicy, OpDict, Outputs, Policy, PolicyBase};
pub use session::{LocalSession, Session};
