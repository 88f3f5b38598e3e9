#[macro_use]
extern crate lazy_static;

pub mod constants;
pub mod error;
pub mod gibbs;
pub mod model;
pub mod pulsar;
pub mod simulate;
pub mod utils;

pub use error::{GibbsError, Result};
pub use gibbs::{GibbsConfig, PulsarBlockGibbs, SampleMethod};
pub use model::{model_general, ModelConfig, PulsarModel};
pub use pulsar::Pulsar;
