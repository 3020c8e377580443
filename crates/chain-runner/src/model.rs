use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::ConfigError;

/// A sampler program: its source file and, once compiled, its executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Model {
    pub stan_file: PathBuf,
    pub name: String,
    pub exe_file: Option<PathBuf>,
}

impl Model {
    /// The display name defaults to the source file stem.
    pub fn new(
        stan_file: impl Into<PathBuf>,
        name: Option<String>,
        exe_file: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let stan_file = stan_file.into();
        if !stan_file.exists() {
            return Err(ConfigError::MissingFile {
                what: "stan_file",
                path: stan_file,
            });
        }
        let name = name.unwrap_or_else(|| default_name(&stan_file));
        Ok(Self {
            stan_file,
            name,
            exe_file,
        })
    }

    /// Program source text, `None` if the file has become unreadable.
    pub fn code(&self) -> Option<String> {
        match fs::read_to_string(&self.stan_file) {
            Ok(code) => Some(code),
            Err(err) => {
                tracing::warn!(path = %self.stan_file.display(), %err, "cannot read model source");
                None
            }
        }
    }

    /// The executable, checked to exist on disk.
    pub fn executable(&self) -> Result<&Path, ConfigError> {
        let exe = self
            .exe_file
            .as_deref()
            .ok_or_else(|| ConfigError::NotCompiled {
                stan_file: self.stan_file.clone(),
            })?;
        if !exe.exists() {
            return Err(ConfigError::MissingFile {
                what: "model executable",
                path: exe.to_path_buf(),
            });
        }
        Ok(exe)
    }
}

fn default_name(stan_file: &Path) -> String {
    stan_file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "model".to_string())
}
