use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::args::SamplerArgs;
use crate::command::ChainCommand;
use crate::error::{ConfigError, ValidationError};
use crate::stan_csv::check_chain_files;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Completion state of one chain. Leaves `NotRun` at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus {
    NotRun,
    Cancelled,
    Exited(i32),
    /// The process never started: spawn error or unwritable transcript.
    LaunchFailed(String),
}

impl ChainStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ChainStatus::Exited(0))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::NotRun => "not_run",
            ChainStatus::Cancelled => "cancelled",
            ChainStatus::Exited(0) => "success",
            ChainStatus::Exited(_) => "failed",
            ChainStatus::LaunchFailed(_) => "launch_failed",
        }
    }
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// All chains of one sampling request: their commands, files and outcomes.
#[derive(Debug)]
pub struct RunSet {
    chains: usize,
    cores: usize,
    args: SamplerArgs,
    transcript_file: PathBuf,
    cmds: Vec<ChainCommand>,
    output_files: Vec<PathBuf>,
    transcript_files: Vec<PathBuf>,
    statuses: Vec<ChainStatus>,
}

impl RunSet {
    /// Validates `args` (idempotent) and derives every per-chain command and
    /// path up front. Chain ids are 1-based; internal indices are 0-based.
    pub fn new(
        chains: usize,
        cores: usize,
        mut args: SamplerArgs,
        transcript_file: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        if chains < 1 {
            return Err(ConfigError::out_of_range(
                "chains",
                "a positive integer",
                chains,
            ));
        }
        if cores < 1 {
            return Err(ConfigError::out_of_range("cores", "a positive integer", cores));
        }
        args.validate()?;
        let transcript_file = transcript_file.into();

        let cmds = (1..=chains).map(|id| args.compose_command(id)).collect();
        let output_files = (1..=chains).map(|id| args.chain_output_file(id)).collect();
        let transcript_files = (1..=chains)
            .map(|id| PathBuf::from(format!("{}-{}.txt", transcript_file.display(), id)))
            .collect();

        Ok(Self {
            chains,
            cores,
            args,
            transcript_file,
            cmds,
            output_files,
            transcript_files,
            statuses: vec![ChainStatus::NotRun; chains],
        })
    }

    pub fn chains(&self) -> usize {
        self.chains
    }

    pub fn cores(&self) -> usize {
        self.cores
    }

    pub fn args(&self) -> &SamplerArgs {
        &self.args
    }

    pub fn transcript_file(&self) -> &Path {
        &self.transcript_file
    }

    pub fn cmds(&self) -> &[ChainCommand] {
        &self.cmds
    }

    pub fn output_files(&self) -> &[PathBuf] {
        &self.output_files
    }

    pub fn transcript_files(&self) -> &[PathBuf] {
        &self.transcript_files
    }

    pub fn statuses(&self) -> &[ChainStatus] {
        &self.statuses
    }

    /// Status of the chain at 0-based `idx`; `None` past the last chain.
    pub fn status(&self, idx: usize) -> Option<&ChainStatus> {
        self.statuses.get(idx)
    }

    /// Exit code of chain `idx`, if it ran to completion.
    pub fn retcode(&self, idx: usize) -> Option<i32> {
        match self.statuses.get(idx)? {
            ChainStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// True iff every chain exited with code 0.
    pub fn is_success(&self) -> bool {
        self.statuses.iter().all(ChainStatus::is_success)
    }

    /// 1-based ids of chains that did not exit cleanly.
    pub fn failed_chains(&self) -> Vec<usize> {
        self.statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_success())
            .map(|(idx, _)| idx + 1)
            .collect()
    }

    pub fn run(&mut self) {
        self.run_with_cancel(&CancelToken::new());
    }

    /// Runs every chain that has not run yet, at most `cores` at a time, and
    /// returns once all of them have exited. A failing chain never stops its
    /// siblings. When `cancel` fires, running chains are killed and they and
    /// any chain not yet started are marked `Cancelled`.
    pub fn run_with_cancel(&mut self, cancel: &CancelToken) {
        let mut pending: VecDeque<usize> = (0..self.chains)
            .filter(|&idx| self.statuses[idx] == ChainStatus::NotRun)
            .collect();
        let mut running: Vec<(usize, Child)> = Vec::new();
        tracing::info!(
            chains = pending.len(),
            cores = self.cores,
            "starting chains"
        );

        loop {
            if cancel.is_cancelled() {
                self.cancel_all(running, pending);
                return;
            }
            while running.len() < self.cores {
                let Some(idx) = pending.pop_front() else {
                    break;
                };
                match self.launch(idx) {
                    Ok(child) => running.push((idx, child)),
                    Err(reason) => self.record(idx, ChainStatus::LaunchFailed(reason)),
                }
            }
            if running.is_empty() && pending.is_empty() {
                return;
            }

            let before = running.len();
            let mut still_running = Vec::with_capacity(before);
            for (idx, mut child) in running.drain(..) {
                match child.try_wait() {
                    Ok(Some(status)) => self.record(idx, exit_code(status)),
                    Ok(None) => still_running.push((idx, child)),
                    Err(err) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        self.record(idx, ChainStatus::LaunchFailed(format!("wait failed: {}", err)));
                    }
                }
            }
            running = still_running;
            if running.len() == before {
                thread::sleep(POLL_INTERVAL);
            }
        }
    }

    fn launch(&self, idx: usize) -> Result<Child, String> {
        let transcript_path = &self.transcript_files[idx];
        let stdout = File::create(transcript_path).map_err(|e| {
            format!(
                "cannot create transcript {}: {}",
                transcript_path.display(),
                e
            )
        })?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| format!("cannot share transcript handle: {}", e))?;
        let mut cmd = self.cmds[idx].to_process();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        tracing::info!(chain = idx + 1, command = %self.cmds[idx], "launching chain");
        cmd.spawn().map_err(|e| {
            format!(
                "cannot spawn {}: {}",
                self.cmds[idx].program().display(),
                e
            )
        })
    }

    fn cancel_all(&mut self, running: Vec<(usize, Child)>, pending: VecDeque<usize>) {
        tracing::warn!(
            running = running.len(),
            pending = pending.len(),
            "run cancelled"
        );
        for (idx, mut child) in running {
            if let Ok(Some(status)) = child.try_wait() {
                self.record(idx, exit_code(status));
                continue;
            }
            let _ = child.kill();
            let _ = child.wait();
            self.record(idx, ChainStatus::Cancelled);
        }
        for idx in pending {
            self.record(idx, ChainStatus::Cancelled);
        }
    }

    fn record(&mut self, idx: usize, status: ChainStatus) {
        debug_assert_eq!(
            self.statuses[idx],
            ChainStatus::NotRun,
            "chain {} recorded twice",
            idx + 1
        );
        match &status {
            ChainStatus::Exited(0) => tracing::info!(chain = idx + 1, "chain finished"),
            ChainStatus::Exited(code) => {
                tracing::warn!(chain = idx + 1, code, transcript = %self.transcript_files[idx].display(), "chain failed")
            }
            ChainStatus::LaunchFailed(reason) => {
                tracing::error!(chain = idx + 1, %reason, "chain could not be launched")
            }
            ChainStatus::Cancelled | ChainStatus::NotRun => {
                tracing::debug!(chain = idx + 1, status = status.as_str(), "chain stopped")
            }
        }
        self.statuses[idx] = status;
    }

    /// Checks every chain's result file against chain 1's. Call only after
    /// [`RunSet::is_success`]; unfinished files surface as parse errors.
    pub fn check_consistency(&self) -> Result<(), ValidationError> {
        check_chain_files(&self.output_files)
    }

    /// Boolean form of [`RunSet::check_consistency`].
    pub fn validate(&self) -> bool {
        match self.check_consistency() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "chain outputs are not consistent");
                false
            }
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> ChainStatus {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => ChainStatus::Exited(code),
        (None, Some(signal)) => ChainStatus::Exited(128 + signal),
        (None, None) => ChainStatus::Exited(-1),
    }
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> ChainStatus {
    ChainStatus::Exited(status.code().unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Method;
    use crate::model::Model;
    use std::fs;

    fn valid_args(dir: &Path) -> SamplerArgs {
        let src = dir.join("bern.stan");
        fs::write(&src, "").expect("src");
        fs::write(dir.join("bern"), "").expect("exe");
        let model = Model::new(&src, None, Some(dir.join("bern"))).expect("model");
        let mut args = SamplerArgs::new(model, dir.join("out.csv"), Method::default());
        args.seed = Some(1234);
        args
    }

    fn chain_csv(id: usize, theta_dim: usize) -> String {
        let mut header = vec!["lp__".to_string(), "accept_stat__".to_string()];
        header.extend((1..=theta_dim).map(|i| format!("theta.{}", i)));
        let row = vec!["0.5"; header.len()].join(",");
        format!(
            "# model = bern_model\n# method = sample (Default)\n#   sample\n#     num_samples = 2\n\
             # id = {id}\n# output\n#   file = out-{id}.csv\n{}\n{row}\n{row}\n",
            header.join(",")
        )
    }

    #[test]
    fn zero_chains_is_a_configuration_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = RunSet::new(0, 1, valid_args(dir.path()), dir.path().join("t"))
            .expect_err("zero chains");
        assert!(matches!(err, ConfigError::OutOfRange { field: "chains", .. }));
        let err = RunSet::new(2, 0, valid_args(dir.path()), dir.path().join("t"))
            .expect_err("zero cores");
        assert!(matches!(err, ConfigError::OutOfRange { field: "cores", .. }));
    }

    #[test]
    fn invalid_args_fail_before_anything_is_derived() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut args = valid_args(dir.path());
        args.data_file = Some(dir.path().join("absent.json"));
        assert!(matches!(
            RunSet::new(2, 1, args, dir.path().join("t")),
            Err(ConfigError::MissingFile { .. })
        ));
    }

    #[test]
    fn derived_collections_are_index_aligned() {
        let dir = tempfile::tempdir().expect("tempdir");
        for n in 1..=5 {
            let runset =
                RunSet::new(n, 2, valid_args(dir.path()), dir.path().join("bern-stdout"))
                    .expect("runset");
            assert_eq!(runset.cmds().len(), n);
            assert_eq!(runset.output_files().len(), n);
            assert_eq!(runset.transcript_files().len(), n);
            assert_eq!(runset.statuses().len(), n);
            for idx in 0..n {
                let id = idx + 1;
                let out = dir.path().join(format!("out-{}.csv", id));
                assert_eq!(runset.output_files()[idx], out);
                assert_eq!(
                    runset.transcript_files()[idx],
                    dir.path().join(format!("bern-stdout-{}.txt", id))
                );
                let argv = runset.cmds()[idx].argv();
                assert_eq!(argv[0], format!("id={}", id));
                assert!(argv.contains(&format!("file={}", out.display())));
                assert_eq!(runset.status(idx), Some(&ChainStatus::NotRun));
                assert_eq!(runset.retcode(idx), None);
            }
            assert_eq!(runset.status(n), None);
            assert_eq!(runset.retcode(n), None);
        }
    }

    #[test]
    fn same_args_give_identical_commands() {
        let dir = tempfile::tempdir().expect("tempdir");
        let args = valid_args(dir.path());
        let a = RunSet::new(4, 1, args.clone(), dir.path().join("t")).expect("a");
        let b = RunSet::new(4, 1, args, dir.path().join("t")).expect("b");
        assert_eq!(a.cmds(), b.cmds());
        assert!(a.cmds()[0].to_string().contains("random seed=1234"));
        assert!(a.cmds()[3].to_string().contains("random seed=1234"));
    }

    #[test]
    fn success_requires_every_chain_to_exit_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut runset =
            RunSet::new(3, 3, valid_args(dir.path()), dir.path().join("t")).expect("runset");
        assert!(!runset.is_success());
        runset.record(0, ChainStatus::Exited(0));
        runset.record(1, ChainStatus::Exited(0));
        assert!(!runset.is_success(), "chain 3 has not run");
        assert_eq!(runset.failed_chains(), vec![3]);
        runset.record(2, ChainStatus::Exited(0));
        assert!(runset.is_success());
        assert_eq!(runset.retcode(2), Some(0));

        let mut cancelled =
            RunSet::new(2, 1, valid_args(dir.path()), dir.path().join("t")).expect("runset");
        cancelled.record(0, ChainStatus::Exited(0));
        cancelled.record(1, ChainStatus::Cancelled);
        assert!(!cancelled.is_success());
        assert_eq!(cancelled.retcode(1), None);
        assert_eq!(cancelled.failed_chains(), vec![2]);
    }

    #[test]
    fn validate_ignores_chain_ids_but_not_dimensions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runset =
            RunSet::new(3, 1, valid_args(dir.path()), dir.path().join("t")).expect("runset");
        for (idx, path) in runset.output_files().iter().enumerate() {
            fs::write(path, chain_csv(idx + 1, 2)).expect("write");
        }
        assert!(runset.validate());

        fs::write(&runset.output_files()[2], chain_csv(3, 3)).expect("write");
        assert!(!runset.validate());
        match runset.check_consistency() {
            Err(ValidationError::Mismatch { chain, key, .. }) => {
                assert_eq!(chain, 3);
                assert_eq!(key, "column_names");
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn validate_reports_unparseable_output_as_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runset =
            RunSet::new(2, 1, valid_args(dir.path()), dir.path().join("t")).expect("runset");
        fs::write(&runset.output_files()[0], chain_csv(1, 1)).expect("write");
        assert!(!runset.validate());
        assert!(matches!(
            runset.check_consistency(),
            Err(ValidationError::Parse { chain: 2, .. })
        ));
    }

    #[test]
    fn single_chain_validates_against_itself() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runset =
            RunSet::new(1, 1, valid_args(dir.path()), dir.path().join("t")).expect("runset");
        assert_eq!(runset.cmds().len(), 1);
        fs::write(&runset.output_files()[0], chain_csv(1, 4)).expect("write");
        assert!(runset.validate());
    }

    #[test]
    fn cancel_token_clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
