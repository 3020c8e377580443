//! YAML run configuration.
//!
//! Integers are read signed so that a negative draw count or an out-of-range
//! seed is reported as a configuration error naming the field instead of a
//! deserializer type error. Relative paths resolve against the directory that
//! holds the config file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::args::{
    Method, OptimizeAlgorithm, OptimizeArgs, SampleArgs, SamplerArgs, VariationalAlgorithm,
    VariationalArgs,
};
use crate::error::ConfigError;
use crate::model::Model;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub model: ModelConfig,
    #[serde(default = "default_chains")]
    pub chains: i64,
    #[serde(default = "default_cores")]
    pub cores: i64,
    #[serde(default)]
    pub transcript_base: Option<PathBuf>,
    #[serde(default)]
    pub output_file: Option<PathBuf>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub data_file: Option<PathBuf>,
    #[serde(default)]
    pub init_file: Option<PathBuf>,
    #[serde(default)]
    pub refresh: Option<i64>,
    #[serde(default)]
    pub method: MethodConfig,
    #[serde(skip)]
    base_dir: PathBuf,
}

fn default_chains() -> i64 {
    4
}

fn default_cores() -> i64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub stan_file: PathBuf,
    #[serde(default)]
    pub exe_file: Option<PathBuf>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MethodConfig {
    Sample(SampleConfig),
    Optimize(OptimizeConfig),
    Variational(VariationalConfig),
}

impl Default for MethodConfig {
    fn default() -> Self {
        MethodConfig::Sample(SampleConfig::default())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SampleConfig {
    #[serde(default)]
    pub post_warmup_draws: Option<i64>,
    #[serde(default)]
    pub warmup_draws: Option<i64>,
    #[serde(default)]
    pub save_warmup: bool,
    #[serde(default)]
    pub thin: Option<i64>,
    #[serde(default = "default_do_adaptation")]
    pub do_adaptation: bool,
    #[serde(default)]
    pub adapt_gamma: Option<f64>,
    #[serde(default)]
    pub adapt_delta: Option<f64>,
    #[serde(default)]
    pub adapt_kappa: Option<f64>,
    #[serde(default)]
    pub adapt_t0: Option<f64>,
    #[serde(default)]
    pub nuts_max_depth: Option<i64>,
    #[serde(default)]
    pub hmc_metric_file: Option<PathBuf>,
    #[serde(default)]
    pub hmc_stepsize: Option<f64>,
}

fn default_do_adaptation() -> bool {
    true
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            post_warmup_draws: None,
            warmup_draws: None,
            save_warmup: false,
            thin: None,
            do_adaptation: default_do_adaptation(),
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

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizeConfig {
    #[serde(default)]
    pub algorithm: Option<OptimizeAlgorithm>,
    #[serde(default)]
    pub iter: Option<i64>,
    #[serde(default)]
    pub save_iterations: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariationalConfig {
    #[serde(default)]
    pub algorithm: Option<VariationalAlgorithm>,
    #[serde(default)]
    pub iter: Option<i64>,
    #[serde(default)]
    pub grad_samples: Option<i64>,
    #[serde(default)]
    pub elbo_samples: Option<i64>,
    #[serde(default)]
    pub eta: Option<f64>,
    #[serde(default)]
    pub output_samples: Option<i64>,
}

/// A checked configuration, ready to become a `RunSet`.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub chains: usize,
    pub cores: usize,
    pub transcript_base: Option<PathBuf>,
    pub args: SamplerArgs,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        Self::from_yaml(&raw, base_dir).map_err(|source| ConfigError::ConfigSyntax {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(raw: &str, base_dir: impl Into<PathBuf>) -> Result<Self, serde_yaml::Error> {
        let mut config: RunConfig = serde_yaml::from_str(raw)?;
        config.base_dir = base_dir.into();
        Ok(config)
    }

    /// Range-checks every integer and resolves paths. Filesystem checks are
    /// left to `SamplerArgs::validate`.
    pub fn into_plan(self) -> Result<RunPlan, ConfigError> {
        let base = self.base_dir;
        let resolve = |p: PathBuf| if p.is_absolute() { p } else { base.join(p) };

        let chains = to_usize("chains", self.chains)?;
        let cores = to_usize("cores", self.cores)?;
        let seed = self
            .seed
            .map(|v| {
                u32::try_from(v).map_err(|_| {
                    ConfigError::out_of_range("seed", "an integer between 0 and 2**32-1", v)
                })
            })
            .transpose()?;

        let model = Model::new(
            resolve(self.model.stan_file),
            self.model.name,
            self.model.exe_file.map(resolve),
        )?;
        let method = match self.method {
            MethodConfig::Sample(s) => Method::Sample(SampleArgs {
                post_warmup_draws: non_negative("post_warmup_draws", s.post_warmup_draws)?,
                warmup_draws: non_negative("warmup_draws", s.warmup_draws)?,
                save_warmup: s.save_warmup,
                thin: non_negative("thin", s.thin)?,
                do_adaptation: s.do_adaptation,
                adapt_gamma: s.adapt_gamma,
                adapt_delta: s.adapt_delta,
                adapt_kappa: s.adapt_kappa,
                adapt_t0: s.adapt_t0,
                nuts_max_depth: non_negative("nuts_max_depth", s.nuts_max_depth)?,
                hmc_metric_file: s.hmc_metric_file.map(resolve),
                hmc_stepsize: s.hmc_stepsize,
            }),
            MethodConfig::Optimize(o) => Method::Optimize(OptimizeArgs {
                algorithm: o.algorithm,
                iter: non_negative("iter", o.iter)?,
                save_iterations: o.save_iterations,
            }),
            MethodConfig::Variational(v) => Method::Variational(VariationalArgs {
                algorithm: v.algorithm,
                iter: non_negative("iter", v.iter)?,
                grad_samples: non_negative("grad_samples", v.grad_samples)?,
                elbo_samples: non_negative("elbo_samples", v.elbo_samples)?,
                eta: v.eta,
                output_samples: non_negative("output_samples", v.output_samples)?,
            }),
        };

        let args = SamplerArgs {
            model,
            seed,
            data_file: self.data_file.map(resolve),
            init_file: self.init_file.map(resolve),
            output_file: self.output_file.map(resolve),
            refresh: non_negative("refresh", self.refresh)?,
            method,
        };
        Ok(RunPlan {
            chains,
            cores,
            transcript_base: self.transcript_base.map(resolve),
            args,
        })
    }
}

fn non_negative(field: &'static str, value: Option<i64>) -> Result<Option<u32>, ConfigError> {
    value
        .map(|v| {
            u32::try_from(v)
                .map_err(|_| ConfigError::out_of_range(field, "a non-negative integer", v))
        })
        .transpose()
}

fn to_usize(field: &'static str, value: i64) -> Result<usize, ConfigError> {
    usize::try_from(value).map_err(|_| ConfigError::out_of_range(field, "a positive integer", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("bern.stan"), "").expect("src");
        fs::write(dir.path().join("bern"), "").expect("exe");
        dir
    }

    #[test]
    fn loads_sample_config_with_relative_paths() {
        let dir = project();
        let path = dir.path().join("run.yaml");
        fs::write(
            &path,
            "\
model:
  stan_file: bern.stan
  exe_file: bern
chains: 2
cores: 2
seed: 4294967295
output_file: out/draws.csv
method:
  type: sample
  post_warmup_draws: 500
  thin: 2
  adapt_delta: 0.9
",
        )
        .expect("write");
        let plan = RunConfig::load(&path)
            .expect("load")
            .into_plan()
            .expect("plan");
        assert_eq!(plan.chains, 2);
        assert_eq!(plan.cores, 2);
        assert_eq!(plan.args.seed, Some(u32::MAX));
        assert_eq!(plan.args.model.name, "bern");
        assert_eq!(plan.args.model.exe_file, Some(dir.path().join("bern")));
        assert_eq!(
            plan.args.output_file,
            Some(dir.path().join("out").join("draws.csv"))
        );
        match plan.args.method {
            Method::Sample(s) => {
                assert_eq!(s.post_warmup_draws, Some(500));
                assert_eq!(s.thin, Some(2));
                assert!(s.do_adaptation);
                assert_eq!(s.adapt_delta, Some(0.9));
            }
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[test]
    fn defaults_to_four_chains_sampling() {
        let dir = project();
        let plan = RunConfig::from_yaml("model: { stan_file: bern.stan }\n", dir.path())
            .expect("parse")
            .into_plan()
            .expect("plan");
        assert_eq!(plan.chains, 4);
        assert_eq!(plan.cores, 1);
        assert_eq!(plan.args.method, Method::default());
        assert!(plan.args.model.exe_file.is_none());
    }

    #[test]
    fn rejects_out_of_range_integers() {
        let dir = project();
        let cases = [
            ("seed: -1\n", "seed"),
            ("seed: 4294967296\n", "seed"),
            ("method: { type: sample, warmup_draws: -5 }\n", "warmup_draws"),
            ("method: { type: sample, post_warmup_draws: -1 }\n", "post_warmup_draws"),
            ("method: { type: variational, output_samples: -2 }\n", "output_samples"),
            ("chains: -3\n", "chains"),
        ];
        for (extra, field) in cases {
            let yaml = format!("model: {{ stan_file: bern.stan }}\n{}", extra);
            let err = RunConfig::from_yaml(&yaml, dir.path())
                .expect("parse")
                .into_plan()
                .expect_err(extra);
            match err {
                ConfigError::OutOfRange { field: f, .. } => assert_eq!(f, field),
                other => panic!("{}: unexpected {:?}", extra, other),
            }
        }
    }

    #[test]
    fn optimize_method_and_unknown_fields() {
        let dir = project();
        let plan = RunConfig::from_yaml(
            "model: { stan_file: bern.stan }\nmethod: { type: optimize, algorithm: bfgs, iter: 10 }\n",
            dir.path(),
        )
        .expect("parse")
        .into_plan()
        .expect("plan");
        assert_eq!(
            plan.args.method,
            Method::Optimize(OptimizeArgs {
                algorithm: Some(OptimizeAlgorithm::Bfgs),
                iter: Some(10),
                save_iterations: false,
            })
        );

        assert!(RunConfig::from_yaml(
            "model: { stan_file: bern.stan }\nmethod: { type: laplace }\n",
            dir.path()
        )
        .is_err());
        assert!(RunConfig::from_yaml(
            "model: { stan_file: bern.stan }\nchain: 2\n",
            dir.path()
        )
        .is_err());
    }

    #[test]
    fn missing_model_source_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = RunConfig::from_yaml("model: { stan_file: gone.stan }\n", dir.path())
            .expect("parse")
            .into_plan()
            .expect_err("missing source");
        assert!(matches!(err, ConfigError::MissingFile { what: "stan_file", .. }));
    }
}
