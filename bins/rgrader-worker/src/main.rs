use anyhow::{Context, Result};
use rgrader_common::config::GraderConfig;
use rgrader_common::types::{GradingJob, GradingOutcome};
use rgrader_worker::Grader;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("rgrader worker booting...");

    let config = GraderConfig::load_default()
        .and_then(GraderConfig::apply_env_overrides)
        .map_err(|e| {
            error!("Failed to load grader configuration: {:#}", e);
            e
        })?;

    info!(
        interpreter = %config.interpreter,
        time_limit_secs = config.time_limit_secs,
        max_concurrency = config.max_concurrency,
        temp_root = %config.temp_root().display(),
        "Configuration loaded"
    );

    let input: Box<dyn AsyncRead + Unpin + Send> = match std::env::args().nth(1) {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open job file {}", path))?;
            info!(path = %path, "Reading jobs from file");
            Box::new(file)
        }
        None => {
            info!("Reading jobs from stdin");
            Box::new(tokio::io::stdin())
        }
    };

    let grader = Arc::new(Grader::from_config(&config));
    let graded = run(input, grader, config.max_concurrency).await?;

    info!(jobs = graded, "Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    // stdout carries result records, so logs always go to stderr
    if std::env::var("RGRADER_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Grade every job line from `input`, writing one outcome line per job to stdout
async fn run(
    input: Box<dyn AsyncRead + Unpin + Send>,
    grader: Arc<Grader>,
    max_concurrency: usize,
) -> Result<usize> {
    let (tx, mut rx) = mpsc::channel::<GradingOutcome>(max_concurrency * 2);

    // Single writer keeps output lines whole
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut written = 0usize;
        while let Some(outcome) = rx.recv().await {
            match serde_json::to_string(&outcome) {
                Ok(mut line) => {
                    line.push('\n');
                    if let Err(e) = stdout.write_all(line.as_bytes()).await {
                        error!(job_id = %outcome.job_id, error = %e, "Failed to write outcome");
                        continue;
                    }
                    let _ = stdout.flush().await;
                    written += 1;
                }
                Err(e) => error!(job_id = %outcome.job_id, error = %e, "Failed to serialize outcome"),
            }
        }
        written
    });

    let semaphore = Arc::new(Semaphore::new(max_concurrency));
    let mut tasks = JoinSet::new();
    let mut lines = BufReader::new(input).lines();
    let mut line_no = 0usize;

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to read job input");
                        break;
                    }
                };
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }

                let job: GradingJob = match serde_json::from_str(&line) {
                    Ok(job) => job,
                    Err(e) => {
                        warn!(line = line_no, error = %e, "Skipping malformed job");
                        continue;
                    }
                };

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .context("Job semaphore closed")?;
                let grader = grader.clone();
                let tx = tx.clone();
                tasks.spawn(async move {
                    let outcome = grade_job(&grader, job).await;
                    drop(permit);
                    if tx.send(outcome).await.is_err() {
                        error!("Outcome writer stopped");
                    }
                });
            }
            _ = &mut shutdown => {
                warn!(in_flight = tasks.len(), "Received shutdown signal, draining in-flight jobs...");
                break;
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Grading task failed");
        }
    }

    drop(tx);
    writer.await.context("Outcome writer task failed")
}

#[instrument(skip_all, fields(job_id = %job.id))]
async fn grade_job(grader: &Grader, job: GradingJob) -> GradingOutcome {
    info!(
        question_id = ?job.question.id,
        question_type = %job.question.question_type,
        answer_size = job.answer_text.len(),
        "Received job"
    );

    let start = Instant::now();
    let report = grader.grade_with_report(&job.answer_text, &job.question).await;
    let outcome = GradingOutcome::from_report(&job, report, start.elapsed());

    debug!(
        points_earned = outcome.points_earned,
        duration_ms = outcome.duration_ms,
        "Job finished"
    );
    outcome
}
