//! Flattened sampler configuration and its per-chain command rendering.

use std::fmt::{self, Display};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::command::{ChainCommand, CommandBuilder};
use crate::error::ConfigError;
use crate::model::Model;

/// Range a generated seed is drawn from when none is supplied.
const GENERATED_SEED_RANGE: std::ops::RangeInclusive<u32> = 1..=99_999;

/// Full configuration of one sampling request.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerArgs {
    pub model: Model,
    /// Shared verbatim by every chain; the chain id keeps streams apart.
    pub seed: Option<u32>,
    pub data_file: Option<PathBuf>,
    pub init_file: Option<PathBuf>,
    /// Base path for per-chain result files, without extension.
    pub output_file: Option<PathBuf>,
    pub refresh: Option<u32>,
    pub method: Method,
}

/// Inference method and the options that only make sense for it.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    Sample(SampleArgs),
    Optimize(OptimizeArgs),
    Variational(VariationalArgs),
}

impl Default for Method {
    fn default() -> Self {
        Method::Sample(SampleArgs::default())
    }
}

/// NUTS/HMC sampler options.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleArgs {
    pub post_warmup_draws: Option<u32>,
    pub warmup_draws: Option<u32>,
    pub save_warmup: bool,
    pub thin: Option<u32>,
    pub do_adaptation: bool,
    pub adapt_gamma: Option<f64>,
    pub adapt_delta: Option<f64>,
    pub adapt_kappa: Option<f64>,
    pub adapt_t0: Option<f64>,
    pub nuts_max_depth: Option<u32>,
    pub hmc_metric_file: Option<PathBuf>,
    pub hmc_stepsize: Option<f64>,
}

impl Default for SampleArgs {
    fn default() -> Self {
        Self {
            post_warmup_draws: None,
            warmup_draws: None,
            save_warmup: false,
            thin: None,
            do_adaptation: true,
            adapt_gamma: None,
            adapt_delta: None,
            adapt_kappa: None,
            adapt_t0: None,
            nuts_max_depth: None,
            hmc_metric_file: None,
            hmc_stepsize: None,
        }
    }
}

impl SampleArgs {
    fn has_tuning(&self) -> bool {
        self.adapt_gamma.is_some()
            || self.adapt_delta.is_some()
            || self.adapt_kappa.is_some()
            || self.adapt_t0.is_some()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.hmc_metric_file {
            require_file("metric file", path)?;
        }
        if self.thin == Some(0) {
            return Err(ConfigError::out_of_range("thin", "a positive integer", 0));
        }
        if self.nuts_max_depth == Some(0) {
            return Err(ConfigError::out_of_range(
                "nuts_max_depth",
                "a positive integer",
                0,
            ));
        }
        if let Some(delta) = self.adapt_delta {
            if !(delta > 0.0 && delta < 1.0) {
                return Err(ConfigError::out_of_range(
                    "adapt_delta",
                    "a value in (0, 1)",
                    delta,
                ));
            }
        }
        require_positive("adapt_gamma", self.adapt_gamma)?;
        require_positive("adapt_kappa", self.adapt_kappa)?;
        require_positive("adapt_t0", self.adapt_t0)?;
        require_positive("hmc_stepsize", self.hmc_stepsize)?;
        if !self.do_adaptation && self.has_tuning() {
            return Err(ConfigError::AdaptationDisabled);
        }
        Ok(())
    }

    fn render(&self, cmd: CommandBuilder) -> CommandBuilder {
        cmd.marker("method=sample")
            .pair("num_samples", self.post_warmup_draws)
            .pair("num_warmup", self.warmup_draws)
            .marker_if(self.save_warmup, "save_warmup=1")
            .pair("thin", self.thin)
            .marker("algorithm=hmc")
            .nested("engine=nuts", "max_depth", self.nuts_max_depth)
            .marker_if(self.do_adaptation && self.has_tuning(), "adapt")
            .pair("gamma", self.adapt_gamma)
            .pair("delta", self.adapt_delta)
            .pair("kappa", self.adapt_kappa)
            .pair("t0", self.adapt_t0)
            .quoted_pair(
                "metric_file",
                self.hmc_metric_file.as_ref().map(|p| p.display()),
            )
            .pair("stepsize", self.hmc_stepsize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizeAlgorithm {
    Lbfgs,
    Bfgs,
    Newton,
}

impl Display for OptimizeAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OptimizeAlgorithm::Lbfgs => "lbfgs",
            OptimizeAlgorithm::Bfgs => "bfgs",
            OptimizeAlgorithm::Newton => "newton",
        })
    }
}

/// Posterior mode finding options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizeArgs {
    pub algorithm: Option<OptimizeAlgorithm>,
    pub iter: Option<u32>,
    pub save_iterations: bool,
}

impl OptimizeArgs {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.iter == Some(0) {
            return Err(ConfigError::out_of_range("iter", "a positive integer", 0));
        }
        Ok(())
    }

    fn render(&self, cmd: CommandBuilder) -> CommandBuilder {
        cmd.marker("method=optimize")
            .pair("algorithm", self.algorithm)
            .pair("iter", self.iter)
            .marker_if(self.save_iterations, "save_iterations=1")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariationalAlgorithm {
    Meanfield,
    Fullrank,
}

impl Display for VariationalAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VariationalAlgorithm::Meanfield => "meanfield",
            VariationalAlgorithm::Fullrank => "fullrank",
        })
    }
}

/// ADVI options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariationalArgs {
    pub algorithm: Option<VariationalAlgorithm>,
    pub iter: Option<u32>,
    pub grad_samples: Option<u32>,
    pub elbo_samples: Option<u32>,
    pub eta: Option<f64>,
    pub output_samples: Option<u32>,
}

impl VariationalArgs {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("iter", self.iter),
            ("grad_samples", self.grad_samples),
            ("elbo_samples", self.elbo_samples),
            ("output_samples", self.output_samples),
        ] {
            if value == Some(0) {
                return Err(ConfigError::out_of_range(field, "a positive integer", 0));
            }
        }
        require_positive("eta", self.eta)
    }

    fn render(&self, cmd: CommandBuilder) -> CommandBuilder {
        cmd.marker("method=variational")
            .pair("algorithm", self.algorithm)
            .pair("iter", self.iter)
            .pair("grad_samples", self.grad_samples)
            .pair("elbo_samples", self.elbo_samples)
            .pair("eta", self.eta)
            .pair("output_samples", self.output_samples)
    }
}

impl SamplerArgs {
    pub fn new(model: Model, output_file: impl Into<PathBuf>, method: Method) -> Self {
        Self {
            model,
            seed: None,
            data_file: None,
            init_file: None,
            output_file: Some(output_file.into()),
            refresh: None,
            method,
        }
    }

    /// Checks the configuration against the filesystem. Strips a trailing
    /// `.csv` from the output base and fills in a random seed if none was
    /// given; running it again on the result changes nothing.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.model.executable()?;
        let output = self.output_file.as_ref().ok_or(ConfigError::NoOutputFile)?;
        if output.as_os_str().is_empty() {
            return Err(ConfigError::NoOutputFile);
        }
        let output = if output.extension().is_some_and(|ext| ext == "csv") {
            output.with_extension("")
        } else {
            output.clone()
        };
        probe_writable(&output).map_err(|source| ConfigError::OutputNotWritable {
            path: output.clone(),
            source,
        })?;
        self.output_file = Some(output);

        if self.seed.is_none() {
            let seed = rand::thread_rng().gen_range(GENERATED_SEED_RANGE);
            tracing::debug!(seed, "no seed supplied, generated one");
            self.seed = Some(seed);
        }
        if let Some(path) = &self.data_file {
            require_file("data file", path)?;
        }
        if let Some(path) = &self.init_file {
            require_file("init file", path)?;
        }
        if self.refresh == Some(0) {
            return Err(ConfigError::out_of_range("refresh", "a positive integer", 0));
        }
        match &self.method {
            Method::Sample(sample) => sample.validate(),
            Method::Optimize(optimize) => optimize.validate(),
            Method::Variational(variational) => variational.validate(),
        }
    }

    /// Result file written by chain `chain_id`.
    pub fn chain_output_file(&self, chain_id: usize) -> PathBuf {
        let base = self.output_file.as_deref().unwrap_or(Path::new(""));
        PathBuf::from(format!("{}-{}.csv", base.display(), chain_id))
    }

    /// Renders the invocation for one chain. Optional settings that are unset
    /// are left out entirely so the sampler applies its own defaults.
    pub fn compose_command(&self, chain_id: usize) -> ChainCommand {
        let program = self.model.exe_file.clone().unwrap_or_default();
        let output = self.chain_output_file(chain_id);
        let cmd = CommandBuilder::new(program)
            .pair("id", Some(chain_id))
            .nested("random", "seed", self.seed)
            .nested("data", "file", self.data_file.as_ref().map(|p| p.display()))
            .pair("init", self.init_file.as_ref().map(|p| p.display()))
            .nested("output", "file", Some(output.display()))
            .pair("refresh", self.refresh);
        let cmd = match &self.method {
            Method::Sample(sample) => sample.render(cmd),
            Method::Optimize(optimize) => optimize.render(cmd),
            Method::Variational(variational) => variational.render(cmd),
        };
        cmd.build()
    }
}

fn require_file(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        Ok(())
    } else {
        Err(ConfigError::MissingFile {
            what,
            path: path.to_path_buf(),
        })
    }
}

fn require_positive(field: &'static str, value: Option<f64>) -> Result<(), ConfigError> {
    match value {
        Some(v) if !(v > 0.0 && v.is_finite()) => Err(ConfigError::out_of_range(
            field,
            "a positive number",
            v,
        )),
        _ => Ok(()),
    }
}

/// Exclusive-create test open. A file that already exists is opened for
/// append instead so its contents survive; a probe file we created is removed.
fn probe_writable(path: &Path) -> std::io::Result<()> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => {
            drop(file);
            fs::remove_file(path)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            OpenOptions::new().append(true).open(path).map(|_| ())
        }
        Err(e) => Err(e),
    }
}
