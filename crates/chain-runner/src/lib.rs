//! Runs several chains of a compiled sampler program as separate processes
//! and checks that their result files agree before they are merged.
//!
//! ```no_run
//! use chain_runner::{Method, Model, RunSet, SamplerArgs, Session};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::new()?;
//! let model = Model::new("bernoulli.stan", None, Some("bernoulli".into()))?;
//! let args = SamplerArgs::new(model, session.output_base("bernoulli"), Method::default());
//! let mut runset = RunSet::new(4, 2, args, session.transcript_base("bernoulli"))?;
//! runset.run();
//! if runset.is_success() && runset.validate() {
//!     println!("{:?}", runset.output_files());
//! }
//! # Ok(())
//! # }
//! ```

pub mod args;
pub mod command;
pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod runset;
pub mod session;
pub mod stan_csv;

pub use args::{
    Method, OptimizeAlgorithm, OptimizeArgs, SampleArgs, SamplerArgs, VariationalAlgorithm,
    VariationalArgs,
};
pub use command::{ChainCommand, CommandBuilder};
pub use config::{RunConfig, RunPlan};
pub use data::{write_json_data, write_rdump, DataMap};
pub use error::{ConfigError, DataError, ParseError, ValidationError};
pub use model::Model;
pub use runset::{CancelToken, ChainStatus, RunSet};
pub use session::Session;
pub use stan_csv::{check_chain_files, scan_stan_csv, ValidationRecord, PER_CHAIN_KEYS};
