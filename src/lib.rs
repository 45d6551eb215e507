pub mod config;
pub mod error;
pub mod db;
pub mod experiment;
pub mod factory;
pub mod features;
pub mod judgments;
pub mod queries;
pub mod reports;
pub mod runner;
pub mod scorers;
pub mod search;
pub mod stats;

pub use config::Settings;
pub use error::{QuerytuneError, Result};
pub use experiment::{Experiment, ExperimentSet};
pub use factory::ExperimentFactory;
pub use judgments::JudgmentList;
