use anyhow::{Context, Result};
use chain_runner::{
    check_chain_files, scan_stan_csv, write_json_data, write_rdump, ChainStatus, DataMap,
    RunConfig, RunPlan, RunSet, Session, ValidationError, ValidationRecord,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const TRANSCRIPT_TAIL_LINES: usize = 20;

#[derive(Parser)]
#[command(name = "chains", version, about = "Run and check multi-chain sampler jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every chain described by a run config and check the results.
    Sample {
        config: PathBuf,
        #[arg(long)]
        chains: Option<i64>,
        #[arg(long)]
        cores: Option<i64>,
        #[arg(long)]
        seed: Option<i64>,
        #[arg(long)]
        json: bool,
    },
    /// Print the per-chain commands without launching anything.
    Command {
        config: PathBuf,
        #[arg(long)]
        chain_id: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Print the validation record of one result file.
    Scan {
        csv: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Cross-check result files that were produced by one run.
    Check {
        #[arg(required = true)]
        csv: Vec<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Convert a JSON object of numeric variables into a sampler data file.
    WriteData {
        input: PathBuf,
        out: PathBuf,
        #[arg(long)]
        rdump: bool,
        #[arg(long)]
        json: bool,
    },
}

/// A failure that carries structured details for the JSON envelope.
#[derive(Debug)]
struct Reported {
    code: &'static str,
    message: String,
    details: Value,
}

impl fmt::Display for Reported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Reported {}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let payload = match err.downcast_ref::<Reported>() {
                    Some(r) => json_error(r.code, r.message.clone(), r.details.clone()),
                    None => json_error("command_failed", format!("{:#}", err), json!({})),
                };
                emit_json(&payload);
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Sample {
            config,
            chains,
            cores,
            seed,
            json,
        } => {
            let plan = load_plan(&config, chains, cores, seed)?;
            let session = Session::new()?;
            let name = plan.args.model.name.clone();
            let transcript_base = plan
                .transcript_base
                .clone()
                .unwrap_or_else(|| session.transcript_base(&name));

            let mut runset = RunSet::new(plan.chains, plan.cores, plan.args, transcript_base)?;
            let started_at = Utc::now();
            runset.run();
            let finished_at = Utc::now();

            if !runset.is_success() {
                if !json {
                    print_failed_transcripts(&runset);
                }
                return Err(Reported {
                    code: "chains_failed",
                    message: format!("chains failed: {:?}", runset.failed_chains()),
                    details: runset_to_json(&runset, started_at, finished_at),
                }
                .into());
            }
            if let Err(err) = runset.check_consistency() {
                return Err(Reported {
                    code: "inconsistent_outputs",
                    message: err.to_string(),
                    details: json!({
                        "run": runset_to_json(&runset, started_at, finished_at),
                        "mismatch": validation_error_to_json(&err),
                    }),
                }
                .into());
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sample",
                    "run": runset_to_json(&runset, started_at, finished_at),
                })));
            }
            print_runset(&runset, started_at, finished_at);
        }
        Commands::Command {
            config,
            chain_id,
            json,
        } => {
            let plan = load_plan(&config, None, None, None)?;
            let mut args = plan.args;
            args.validate()?;
            let ids: Vec<usize> = match chain_id {
                Some(id) if id == 0 || id > plan.chains => {
                    anyhow::bail!("chain id {} is outside 1..={}", id, plan.chains)
                }
                Some(id) => vec![id],
                None => (1..=plan.chains).collect(),
            };
            let commands: Vec<Value> = ids
                .iter()
                .map(|&id| {
                    let cmd = args.compose_command(id);
                    json!({
                        "chain": id,
                        "command": cmd.to_string(),
                        "argv": cmd.argv(),
                    })
                })
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "command",
                    "chains": commands,
                })));
            }
            for id in ids {
                println!("{}", args.compose_command(id));
            }
        }
        Commands::Scan { csv, json } => {
            let record = scan_stan_csv(&csv)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "scan",
                    "file": csv.display().to_string(),
                    "record": record,
                })));
            }
            print_record(&record);
        }
        Commands::Check { csv, json } => {
            if let Err(err) = check_chain_files(&csv) {
                return Err(Reported {
                    code: "inconsistent_outputs",
                    message: err.to_string(),
                    details: validation_error_to_json(&err),
                }
                .into());
            }
            let files: Vec<String> = csv.iter().map(|p| p.display().to_string()).collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "check",
                    "files": files,
                    "consistent": true,
                })));
            }
            println!("consistent: {} files", csv.len());
        }
        Commands::WriteData {
            input,
            out,
            rdump,
            json,
        } => {
            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let data: DataMap = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a JSON object", input.display()))?;
            if rdump {
                write_rdump(&out, &data)?;
            } else {
                write_json_data(&out, &data)?;
            }
            let format = if rdump { "rdump" } else { "json" };
            let variables: Vec<&String> = data.keys().collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "write-data",
                    "out": out.display().to_string(),
                    "format": format,
                    "variables": variables,
                })));
            }
            println!("wrote {} variables ({}): {}", data.len(), format, out.display());
        }
    }
    Ok(None)
}

/// Loads the run config, applies command-line overrides and defaults the
/// output base to `<name>-output` in the working directory.
fn load_plan(
    path: &Path,
    chains: Option<i64>,
    cores: Option<i64>,
    seed: Option<i64>,
) -> Result<RunPlan> {
    let mut config = RunConfig::load(path)?;
    tracing::debug!(path = %path.display(), chains = config.chains, "loaded run config");
    if let Some(chains) = chains {
        config.chains = chains;
    }
    if let Some(cores) = cores {
        config.cores = cores;
    }
    if seed.is_some() {
        config.seed = seed;
    }
    let mut plan = config.into_plan()?;
    if plan.args.output_file.is_none() {
        let cwd = std::env::current_dir().context("failed to resolve working directory")?;
        plan.args.output_file = Some(cwd.join(format!("{}-output", plan.args.model.name)));
    }
    Ok(plan)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Sample { json, .. }
        | Commands::Command { json, .. }
        | Commands::Scan { json, .. }
        | Commands::Check { json, .. }
        | Commands::WriteData { json, .. } => *json,
    }
}

/// Per-chain report. Failed chains carry the tail of their transcript
/// because a session-owned transcript is gone once the command returns.
fn runset_to_json(
    runset: &RunSet,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> Value {
    let chains: Vec<Value> = runset
        .statuses()
        .iter()
        .enumerate()
        .map(|(idx, status)| {
            let reason = match status {
                ChainStatus::LaunchFailed(reason) => Some(reason.as_str()),
                _ => None,
            };
            let transcript = &runset.transcript_files()[idx];
            let tail = (!status.is_success()).then(|| transcript_tail(transcript));
            json!({
                "chain": idx + 1,
                "status": status.as_str(),
                "exit_code": runset.retcode(idx),
                "reason": reason,
                "command": runset.cmds()[idx].to_string(),
                "output_file": runset.output_files()[idx].display().to_string(),
                "transcript_file": transcript.display().to_string(),
                "transcript_tail": tail,
            })
        })
        .collect();
    json!({
        "chains": runset.chains(),
        "cores": runset.cores(),
        "model": runset.args().model.name,
        "seed": runset.args().seed,
        "success": runset.is_success(),
        "failed_chains": runset.failed_chains(),
        "started_at": started_at.to_rfc3339(),
        "finished_at": finished_at.to_rfc3339(),
        "elapsed_ms": (finished_at - started_at).num_milliseconds(),
        "chain_results": chains,
    })
}

/// Last `TRANSCRIPT_TAIL_LINES` lines of a transcript; empty if unreadable.
fn transcript_tail(path: &Path) -> Vec<String> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(TRANSCRIPT_TAIL_LINES);
    lines[start..].iter().map(|l| l.to_string()).collect()
}

fn validation_error_to_json(err: &ValidationError) -> Value {
    match err {
        ValidationError::Parse { chain, source } => json!({
            "chain": chain,
            "parse_error": source.to_string(),
        }),
        ValidationError::Mismatch {
            chain,
            key,
            reference,
            found,
        } => json!({
            "chain": chain,
            "key": key,
            "reference": reference,
            "found": found,
        }),
    }
}

fn print_runset(runset: &RunSet, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) {
    println!("model: {}", runset.args().model.name);
    println!("chains: {} (cores: {})", runset.chains(), runset.cores());
    if let Some(seed) = runset.args().seed {
        println!("seed: {}", seed);
    }
    println!("started_at: {}", started_at.to_rfc3339());
    println!(
        "elapsed: {:.3}s",
        (finished_at - started_at).num_milliseconds() as f64 / 1000.0
    );
    for (idx, (status, output)) in runset
        .statuses()
        .iter()
        .zip(runset.output_files())
        .enumerate()
    {
        println!("chain {}: {} -> {}", idx + 1, status.as_str(), output.display());
    }
}

fn print_failed_transcripts(runset: &RunSet) {
    for (idx, status) in runset.statuses().iter().enumerate() {
        if status.is_success() {
            continue;
        }
        let detail = match status {
            ChainStatus::Exited(code) => format!("exit code {}", code),
            ChainStatus::LaunchFailed(reason) => reason.clone(),
            other => other.as_str().to_string(),
        };
        eprintln!("chain {} failed: {}", idx + 1, detail);
        for line in transcript_tail(&runset.transcript_files()[idx]) {
            eprintln!("  | {}", line);
        }
    }
}

fn print_record(record: &ValidationRecord) {
    for (key, value) in record.iter() {
        println!("{} = {}", key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommands_parse_with_kebab_case_flags() {
        let cli = Cli::try_parse_from(["chains", "command", "run.yaml", "--chain-id", "3"])
            .expect("parse");
        match cli.command {
            Commands::Command {
                config,
                chain_id,
                json,
            } => {
                assert_eq!(config, PathBuf::from("run.yaml"));
                assert_eq!(chain_id, Some(3));
                assert!(!json);
            }
            _ => panic!("wrong subcommand"),
        }

        let cli = Cli::try_parse_from(["chains", "write-data", "in.json", "out.R", "--rdump"])
            .expect("parse");
        assert!(matches!(cli.command, Commands::WriteData { rdump: true, .. }));
    }

    #[test]
    fn check_requires_at_least_one_file() {
        assert!(Cli::try_parse_from(["chains", "check"]).is_err());
        let cli = Cli::try_parse_from(["chains", "check", "a.csv", "b.csv", "--json"])
            .expect("parse");
        assert!(command_json_mode(&cli.command));
    }

    #[test]
    fn negative_seed_override_reaches_the_range_check() {
        let cli = Cli::try_parse_from(["chains", "sample", "run.yaml", "--seed=-1"])
            .expect("parse");
        assert!(matches!(cli.command, Commands::Sample { seed: Some(-1), .. }));
    }

    #[test]
    fn mismatch_details_name_chain_and_key() {
        let err = ValidationError::Mismatch {
            chain: 2,
            key: "dims.theta".to_string(),
            reference: Some("3".to_string()),
            found: None,
        };
        assert_eq!(
            validation_error_to_json(&err),
            json!({"chain": 2, "key": "dims.theta", "reference": "3", "found": null})
        );
        let payload = json_error("inconsistent_outputs", err.to_string(), json!({}));
        assert_eq!(payload["ok"], json!(false));
        assert_eq!(payload["error"]["code"], json!("inconsistent_outputs"));
    }

    #[cfg(unix)]
    #[test]
    fn failed_chain_report_keeps_transcript_tail_after_session_ends() {
        use chain_runner::{Method, Model, SamplerArgs};
        use std::os::unix::fs::PermissionsExt;

        let session = Session::new().expect("session");
        let dir = session.path().to_path_buf();
        let exe = dir.join("broken");
        std::fs::write(
            &exe,
            "#!/bin/sh\necho \"loading data\"\necho \"fatal: bad dimension\" >&2\nexit 2\n",
        )
        .expect("write script");
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        std::fs::write(dir.join("broken.stan"), "").expect("write src");
        let model = Model::new(dir.join("broken.stan"), None, Some(exe)).expect("model");
        let mut args = SamplerArgs::new(model, dir.join("draws"), Method::default());
        args.seed = Some(7);

        let mut runset =
            RunSet::new(1, 1, args, session.transcript_base("broken")).expect("runset");
        let started_at = Utc::now();
        runset.run();
        let report = runset_to_json(&runset, started_at, Utc::now());
        let transcript = runset.transcript_files()[0].clone();
        drop(session);
        assert!(!transcript.exists());

        let chain = &report["chain_results"][0];
        assert_eq!(chain["status"], json!("failed"));
        assert_eq!(chain["exit_code"], json!(2));
        let tail = chain["transcript_tail"].as_array().expect("tail");
        assert!(tail.contains(&json!("loading data")), "{:?}", tail);
        assert!(tail.contains(&json!("fatal: bad dimension")), "{:?}", tail);
    }

    #[test]
    fn transcript_tail_keeps_only_the_last_lines() {
        let session = Session::new().expect("session");
        let path = session.path().join("t.txt");
        let body: String = (1..=30).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(&path, body).expect("write");
        let tail = transcript_tail(&path);
        assert_eq!(tail.len(), TRANSCRIPT_TAIL_LINES);
        assert_eq!(tail.first().map(String::as_str), Some("line 11"));
        assert_eq!(tail.last().map(String::as_str), Some("line 30"));
        assert!(transcript_tail(&session.path().join("missing.txt")).is_empty());
    }
}
