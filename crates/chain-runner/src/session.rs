use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::ConfigError;

/// Scratch directory for one sampling session. Removed when the session is
/// dropped or closed.
#[derive(Debug)]
pub struct Session {
    dir: TempDir,
}

impl Session {
    pub fn new() -> Result<Self, ConfigError> {
        let dir = tempfile::Builder::new()
            .prefix("chain-runner-")
            .tempdir()
            .map_err(ConfigError::Session)?;
        tracing::debug!(path = %dir.path().display(), "created session directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Base path for per-chain transcripts of the run called `name`.
    pub fn transcript_base(&self, name: &str) -> PathBuf {
        self.dir.path().join(format!("{}-stdout", name))
    }

    /// Base path for per-chain result files of the run called `name`.
    pub fn output_base(&self, name: &str) -> PathBuf {
        self.dir.path().join(format!("{}-output", name))
    }

    /// Deletes the directory now, reporting failures that drop would swallow.
    pub fn close(self) -> std::io::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        tracing::debug!(path = %path.display(), "deleted session directory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_lives_exactly_as_long_as_the_session() {
        let session = Session::new().expect("session");
        let path = session.path().to_path_buf();
        assert!(path.is_dir());
        std::fs::write(session.transcript_base("bern").with_extension("txt"), "x").expect("write");
        drop(session);
        assert!(!path.exists());

        let session = Session::new().expect("session");
        let path = session.path().to_path_buf();
        assert!(session.output_base("bern").starts_with(&path));
        session.close().expect("close");
        assert!(!path.exists());
    }
}
