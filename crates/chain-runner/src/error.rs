use std::path::PathBuf;

use thiserror::Error;

/// Raised before any process is launched when the sampler configuration is
/// unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no model executable specified; compile \"{}\" first", stan_file.display())]
    NotCompiled { stan_file: PathBuf },
    #[error("cannot access {what} \"{}\"", path.display())]
    MissingFile { what: &'static str, path: PathBuf },
    #[error("no output file specified")]
    NoOutputFile,
    #[error("invalid path for output csv files \"{}\": {source}", path.display())]
    OutputNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{field} must be {expected}, found {found}")]
    OutOfRange {
        field: &'static str,
        expected: &'static str,
        found: String,
    },
    #[error("adaptation tuning parameters are set but adaptation is disabled")]
    AdaptationDisabled,
    #[error("cannot read run config \"{}\": {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed run config \"{}\": {source}", path.display())]
    ConfigSyntax {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("cannot create session directory: {0}")]
    Session(#[source] std::io::Error),
}

impl ConfigError {
    pub(crate) fn out_of_range(
        field: &'static str,
        expected: &'static str,
        found: impl ToString,
    ) -> Self {
        ConfigError::OutOfRange {
            field,
            expected,
            found: found.to_string(),
        }
    }
}

/// A chain result file that does not follow the result-file grammar.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read \"{}\": {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("\"{}\" is empty", path.display())]
    Empty { path: PathBuf },
    #[error("\"{}\" has no column header line", path.display())]
    MissingHeader { path: PathBuf },
    #[error("\"{}\" line {line}: empty column name in header", path.display())]
    EmptyColumn { path: PathBuf, line: usize },
    #[error("\"{}\" line {line}: expected {expected} fields, found {found}", path.display())]
    RowWidth {
        path: PathBuf,
        line: usize,
        expected: usize,
        found: usize,
    },
}

/// Cross-chain consistency failure between result files of one run.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("chain {chain}: {source}")]
    Parse {
        chain: usize,
        #[source]
        source: ParseError,
    },
    #[error("chain {chain} disagrees with chain 1 on `{key}`: {reference:?} vs {found:?}")]
    Mismatch {
        chain: usize,
        key: String,
        reference: Option<String>,
        found: Option<String>,
    },
}

/// Failure writing a sampler data or inits file.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("cannot write \"{}\": {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("variable `{name}`: {reason}")]
    Unsupported { name: String, reason: String },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
