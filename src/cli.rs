use crate::artifact::objects::{FsObjectStore, ObjectStore};
use crate::artifact::{ArtifactFile, SubmissionArtifact};
use crate::config::loader::EvalboxConfig;
use crate::config::types::{JobId, SubmissionId};
use crate::kernel::signal::SignalHandler;
use crate::sandbox::backends::{CgroupBackend, ContainerBackend, RootlessBackend};
use crate::sandbox::boundary::{BackendKind, IsolationBackend};
use crate::service::EvaluationService;
use crate::store::{DurableStore, SqliteStore};
use crate::worker::job::{EvaluationRequest, JobOutcome, JobReport, JobSpec};
use crate::worker::pool::WorkerPool;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about = "Sandboxed evaluation and leaderboard engine", long_about = None)]
struct Cli {
    /// JSON config file (falls back to $EVALBOX_CONFIG, then defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Append structured audit events to this file
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,
    /// Override the configured isolation backend
    #[arg(long, global = true)]
    backend: Option<BackendKind>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate local files as one submission and print the result
    Run {
        /// Target environment id passed to the entry
        #[arg(long = "env")]
        environment_id: String,
        #[arg(long)]
        submitter: String,
        #[arg(long, default_value = "")]
        algorithm: String,
        /// Reuse a job id (redelivering a finished job does not re-run it)
        #[arg(long)]
        job_id: Option<String>,
        /// Entry file name; defaults to the single file given
        #[arg(long)]
        entry: Option<String>,
        /// Submission files, staged under their base names
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Evaluate every job in a JSONL file ('-' for stdin) on the worker pool
    Batch { jobs: PathBuf },
    /// Print the stored result of a job
    Result { job_id: String },
    /// Print the ranking of an environment
    Leaderboard {
        environment_id: String,
        #[arg(long)]
        limit: Option<usize>,
        /// Read straight from durable storage
        #[arg(long)]
        no_cache: bool,
    },
    /// Report which isolation backends and runtimes this host supports
    CheckDeps {
        #[arg(long)]
        verbose: bool,
    },
}

pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Some(path) = &cli.audit_log {
        crate::observability::audit::init_audit_file(path)?;
    }

    let mut config = EvalboxConfig::load(cli.config.as_deref())?;
    if let Some(backend) = cli.backend {
        config.sandbox.backend = backend;
    }

    match cli.command {
        Commands::Run {
            environment_id,
            submitter,
            algorithm,
            job_id,
            entry,
            files,
        } => {
            let service = EvaluationService::from_config(&config)?;
            let artifact = upload_files(
                service.objects().as_ref(),
                &files,
                entry,
                environment_id,
                algorithm,
                submitter,
            )?;
            let request = match job_id {
                Some(id) => EvaluationRequest::with_job_id(JobId::from(id), artifact),
                None => EvaluationRequest::new(artifact),
            };

            let result = service.evaluate(&request)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "job_id": request.job_id,
                    "submission_id": request.artifact.id(),
                    "result": result,
                }))?
            );
            if !result.is_succeeded() {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Batch { jobs } => run_batch(&config, &jobs),
        Commands::Result { job_id } => {
            let service = open_read_side(&config)?;
            let job_id = JobId::from(job_id);
            let state = service.job_state(&job_id)?;
            match service.get_evaluation_result(&job_id)? {
                Some(result) => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&json!({
                            "job_id": job_id,
                            "state": state.map(|s| s.as_str()),
                            "result": result,
                        }))?
                    );
                    Ok(())
                }
                None => {
                    eprintln!(
                        "No result for job {} (state: {})",
                        job_id,
                        state.map(|s| s.as_str()).unwrap_or("unknown")
                    );
                    std::process::exit(1);
                }
            }
        }
        Commands::Leaderboard {
            environment_id,
            limit,
            no_cache,
        } => {
            let service = open_read_side(&config)?;
            let entries = if no_cache {
                service
                    .leaderboard()
                    .query_durable(&environment_id, limit)?
            } else {
                service.query_leaderboard(&environment_id, limit)?
            };
            for (rank, entry) in entries.iter().enumerate() {
                println!(
                    "{}",
                    json!({
                        "rank": rank + 1,
                        "submitter_id": entry.submitter_id,
                        "score": entry.score,
                        "algorithm": entry.algorithm,
                        "achieved_at": entry.achieved_at,
                        "submission_id": entry.submission_id,
                        "job_id": entry.job_id,
                    })
                );
            }
            Ok(())
        }
        Commands::CheckDeps { verbose } => check_dependencies(&config, verbose),
    }
}

/// Read-only commands must work on hosts with no usable sandbox, so they
/// skip backend selection and use a backend that is never probed.
fn open_read_side(config: &EvalboxConfig) -> Result<EvaluationService> {
    crate::config::validator::validate_config(config)?;
    let runtime = config.runtime_envelope()?;
    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::open(&config.storage.object_root)?);
    let durable: Arc<dyn DurableStore> = Arc::new(SqliteStore::open(&config.storage.database_path)?);
    let backend: Arc<dyn IsolationBackend> = Arc::new(RootlessBackend::new());
    Ok(EvaluationService::assemble(
        config, runtime, backend, objects, durable,
    ))
}

fn upload_files(
    objects: &dyn ObjectStore,
    paths: &[PathBuf],
    entry: Option<String>,
    environment_id: String,
    algorithm: String,
    submitter: String,
) -> Result<SubmissionArtifact> {
    let mut files = Vec::with_capacity(paths.len());
    let mut seen = HashSet::new();
    for path in paths {
        let name = base_name(path)?;
        if !seen.insert(name.clone()) {
            anyhow::bail!("two files share the name '{}'", name);
        }
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let size = bytes.len() as u64;
        let content_hash = objects.put(&bytes)?;
        files.push(ArtifactFile {
            name,
            content_hash,
            size,
        });
    }

    let id = SubmissionId::new();
    let artifact = match (entry, files.len()) {
        (None, 1) => {
            let file = files.remove(0);
            SubmissionArtifact::single(id, file, environment_id, algorithm, submitter)
        }
        (None, _) => anyhow::bail!("--entry is required when submitting more than one file"),
        (Some(entry), _) => {
            SubmissionArtifact::bundle(id, files, entry, environment_id, algorithm, submitter)
        }
    };
    Ok(artifact)
}

fn base_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("{} has no usable file name", path.display()))
}

fn run_batch(config: &EvalboxConfig, jobs_path: &Path) -> Result<()> {
    let signals = SignalHandler::init().map_err(|e| anyhow::anyhow!(e))?;
    let service = EvaluationService::from_config(config)?;

    let reader: Box<dyn BufRead> = if jobs_path == Path::new("-") {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        Box::new(BufReader::new(
            std::fs::File::open(jobs_path)
                .with_context(|| format!("opening {}", jobs_path.display()))?,
        ))
    };

    let mut requests = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let spec: JobSpec = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid job", jobs_path.display(), lineno + 1))?;
        requests.push(spec.into_request());
    }

    let mut pool = service.start_pool();
    let expected = requests.len();
    log::info!("Submitting {} jobs to {} worker slots", expected, pool.slots());

    // The queue is bounded; enqueue from a second thread while reports drain here
    let (summary, all_enqueued) = std::thread::scope(|scope| {
        let pool_ref = &pool;
        let feeder = scope.spawn(move || {
            for request in requests {
                if let Err(e) = pool_ref.submit(request) {
                    log::error!("Failed to enqueue job: {}", e);
                    return false;
                }
            }
            true
        });
        let summary = collect_reports(pool_ref, expected, &signals);
        (summary, feeder.join().unwrap_or(false))
    });
    pool.shutdown();

    let summary = summary?;
    log::info!(
        "Batch done: {} succeeded, {} failed, {} dead-lettered",
        summary.succeeded,
        summary.failed,
        summary.dead_lettered
    );
    if !all_enqueued || summary.dead_lettered > 0 || summary.finished < expected {
        std::process::exit(2);
    }
    Ok(())
}

#[derive(Default)]
struct BatchSummary {
    finished: usize,
    succeeded: usize,
    failed: usize,
    dead_lettered: usize,
}

fn collect_reports(
    pool: &WorkerPool,
    expected: usize,
    signals: &SignalHandler,
) -> Result<BatchSummary> {
    let mut summary = BatchSummary::default();
    while summary.finished < expected {
        if signals.shutdown_requested() {
            log::warn!(
                "Signal {} received, stopping after in-flight jobs",
                signals.received_signal()
            );
            break;
        }
        let report = match pool.reports().recv_timeout(Duration::from_millis(200)) {
            Ok(report) => report,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };
        print_report(&report)?;
        if !report.is_final() {
            continue;
        }
        summary.finished += 1;
        match &report.outcome {
            JobOutcome::Completed(result) if result.is_succeeded() => summary.succeeded += 1,
            JobOutcome::Completed(_) => summary.failed += 1,
            JobOutcome::DeadLettered { .. } => summary.dead_lettered += 1,
            JobOutcome::Requeued { .. } => {}
        }
    }
    Ok(summary)
}

fn print_report(report: &JobReport) -> Result<()> {
    let outcome = match &report.outcome {
        JobOutcome::Completed(result) => json!({ "completed": result }),
        JobOutcome::Requeued { error, class } => {
            json!({ "requeued": { "error": error, "class": class } })
        }
        JobOutcome::DeadLettered { error, class } => {
            json!({ "dead_lettered": { "error": error, "class": class } })
        }
    };
    println!(
        "{}",
        serde_json::to_string(&json!({
            "job_id": report.job_id,
            "submission_id": report.submission_id,
            "attempt": report.attempt,
            "outcome": outcome,
        }))?
    );
    Ok(())
}

fn check_dependencies(config: &EvalboxConfig, verbose: bool) -> Result<()> {
    println!("Checking evalbox host dependencies...");
    println!();

    let runtime = config.runtime_envelope()?;
    let interpreter_ok = Path::new(&runtime.interpreter).is_file();
    println!(
        "{} runtime {} ({})",
        if interpreter_ok { "OK     " } else { "MISSING" },
        runtime.id,
        runtime.interpreter
    );

    let section = &config.sandbox;
    let backends: Vec<(BackendKind, Box<dyn IsolationBackend>)> = vec![
        (
            BackendKind::Cgroup,
            Box::new(CgroupBackend::new(
                section.cgroup_root.clone(),
                section.sandbox_uid,
                section.sandbox_gid,
            )),
        ),
        (BackendKind::Rootless, Box::new(RootlessBackend::new())),
        (
            BackendKind::Container,
            Box::new(ContainerBackend::new(
                section.container_image.clone(),
                section.sandbox_uid,
                section.sandbox_gid,
            )),
        ),
    ];

    let mut usable = Vec::new();
    for (kind, backend) in &backends {
        match backend.probe(&runtime) {
            Ok(()) => {
                println!("OK      backend {}", kind);
                usable.push(*kind);
            }
            Err(e) => {
                println!("MISSING backend {}", kind);
                if verbose {
                    println!("        {}", e);
                }
            }
        }
    }

    if verbose {
        println!();
        println!(
            "namespaces supported: {}",
            crate::kernel::namespace::namespaces_supported()
        );
        if let Some(blocker) = crate::kernel::namespace::unprivileged_userns_blocker() {
            println!("unprivileged user namespaces blocked: {}", blocker);
        }
        println!("configured backend: {}", section.backend);
    }

    println!();
    let configured_ok = match section.backend {
        BackendKind::Auto => usable
            .iter()
            .any(|k| matches!(k, BackendKind::Cgroup | BackendKind::Rootless)),
        kind => usable.contains(&kind),
    };
    if configured_ok {
        println!("evalbox is ready to evaluate submissions");
        Ok(())
    } else {
        println!("The configured backend '{}' is not usable on this host", section.backend);
        std::process::exit(1);
    }
}
