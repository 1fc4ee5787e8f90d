use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use reelforge_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use reelforge_core::downloads::{DownloadStatus, StartOutcome};
use reelforge_core::jobs::JobStatus;
use reelforge_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, RuntimeLogMode, DEFAULT_LOG_FILTER,
};
use reelforge_core::params::GenerationRequest;
use reelforge_core::server::{app_router, AppState};
use reelforge_core::services::Services;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const PROGRESS_BAR_WIDTH: usize = 30;

#[derive(Parser)]
#[command(name = "reelforge", about = "Prompt-to-video generation service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate one video in-process and wait for it.
    Generate(GenerateArgs),
    /// Download a model snapshot into the models directory.
    Download(DownloadArgs),
}

#[derive(Args)]
struct GenerateArgs {
    prompt: String,
    #[arg(long, default_value_t = 24)]
    frames: i64,
    #[arg(long, default_value_t = 8)]
    fps: i64,
    #[arg(long, default_value_t = 512)]
    width: i64,
    #[arg(long, default_value_t = 512)]
    height: i64,
    #[arg(long, allow_negative_numbers = true)]
    seed: Option<i64>,
    #[arg(long)]
    negative_prompt: Option<String>,
    #[arg(long, default_value_t = 50)]
    steps: i64,
    #[arg(long, default_value_t = 7.5)]
    guidance_scale: f32,
    #[arg(long, value_name = "KEY_OR_REPO", help = "Local model key or model id")]
    local_model: Option<String>,
    #[arg(long, help = "Allow the Hugging Face Inference API")]
    cloud: bool,
    #[arg(long, value_name = "REPO")]
    model_repo: Option<String>,
    #[arg(long, env = "REELFORGE_HF_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl GenerateArgs {
    fn into_request(self) -> GenerationRequest {
        GenerationRequest {
            prompt: self.prompt,
            num_frames: self.frames,
            fps: self.fps,
            width: self.width,
            height: self.height,
            use_cloud: self.cloud,
            token: self.token,
            model_repo: self.model_repo,
            local_model: self.local_model,
            negative_prompt: self.negative_prompt,
            num_inference_steps: self.steps,
            guidance_scale: self.guidance_scale,
            seed: self.seed,
        }
    }
}

#[derive(Args)]
struct DownloadArgs {
    model_id: String,
    #[arg(long, env = "REELFORGE_HF_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    reelforge_core::runtime::setup_runtime_libs();
    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    reelforge_core::runtime::log_runtime_lib_status();
    log_startup_metadata(mode, &resolved_data_dir);

    match cli.command {
        Some(Commands::Generate(args)) => run_generate(args, resolved_data_dir).await,
        Some(Commands::Download(args)) => run_download(args, resolved_data_dir).await,
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let init_options = LoggingInitOptions {
        mode,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(logging::redacting_make_writer(std::io::stderr))
                        .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::redacting_make_writer(appender))
                        .with_filter(parse_env_filter_with_fallback(&file_filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(logging::redacting_make_writer(std::io::stderr))
                    .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn runtime_mode_name(mode: RuntimeLogMode) -> &'static str {
    match mode {
        RuntimeLogMode::Cli => "cli",
        RuntimeLogMode::Server => "server",
    }
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = runtime_mode_name(mode),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %format!("{e:#}"), "Failed to initialize data directory");
    }
    AppConfig::load_or_default(&config_path(data_dir))
}

async fn build_services(config: AppConfig, data_dir: PathBuf) -> Result<Services> {
    tokio::task::spawn_blocking(move || Services::from_config(&config, &data_dir))
        .await
        .context("service initialization task failed")?
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir);
    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let services = build_services(config, data_dir).await?;
    let app = app_router(AppState::new(services));

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting reelforge server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_generate(args: GenerateArgs, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);
    let services = build_services(config, data_dir).await?;
    let request = args.into_request();
    if let Some(problem) = services.jobs.credential_problem(&request) {
        bail!("{problem}");
    }

    let jobs = services.jobs.clone();
    let submitted = tokio::task::spawn_blocking(move || jobs.submit(request))
        .await
        .context("job submission task failed")?;
    info!(job_id = %submitted.job_id, video_id = ?submitted.video_id, "Job submitted");

    let started = Instant::now();
    let job = loop {
        let Some(job) = services.jobs.get_status(&submitted.job_id) else {
            bail!("job {} disappeared", submitted.job_id);
        };
        print_progress(job.progress, &job.message, started.elapsed().as_secs_f64());
        if job.status.is_terminal() {
            break job;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };
    eprintln!();

    match job.status {
        JobStatus::Completed => {
            let video_id = job.video_id.unwrap_or_default();
            let dir = services.videos.video_dir(&video_id);
            info!(
                video_id = %video_id,
                elapsed = %format_duration(job.elapsed_seconds.unwrap_or_default()),
                "Generation completed"
            );
            println!("{}", dir.display());
            Ok(())
        }
        _ => bail!(
            "generation failed: {}",
            job.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

async fn run_download(args: DownloadArgs, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);
    let services = build_services(config, data_dir).await?;
    let token = args.token.filter(|token| !token.trim().is_empty());

    let download_id = match services.downloads.start(&args.model_id, token)? {
        StartOutcome::AlreadyDownloaded { model_id, path } => {
            info!(model_id = %model_id, "Model already downloaded");
            println!("{}", path.display());
            return Ok(());
        }
        StartOutcome::Started { download_id } => download_id,
    };

    let started = Instant::now();
    let task = loop {
        let Some(task) = services.downloads.get(&download_id) else {
            bail!("download {download_id} disappeared");
        };
        print_progress(task.progress, &task.message, started.elapsed().as_secs_f64());
        if task.status != DownloadStatus::Downloading {
            break task;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };
    eprintln!();

    match task.status {
        DownloadStatus::Completed => {
            info!(
                model_id = %task.model_id,
                files = task.file_count,
                bytes = task.downloaded_bytes,
                "Download completed"
            );
            println!("{}", services.models.model_dir(&task.model_id).display());
            Ok(())
        }
        _ => bail!(
            "download failed: {}",
            task.error.unwrap_or_else(|| task.message.clone())
        ),
    }
}

fn progress_line(progress: u8, message: &str, elapsed: f64) -> String {
    let fraction = f64::from(progress.min(100)) / 100.0;
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);
    format!(
        "[{bar}] {:3}% | {message} | Elapsed: {}",
        progress.min(100),
        format_duration(elapsed)
    )
}

fn print_progress(progress: u8, message: &str, elapsed: f64) {
    eprint!("\r{}    ", progress_line(progress, message, elapsed));
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}


#[cfg(test)]
mod log_filter_tests {
    use super::*;
    use reelforge_core::logging::DEFAULT_NOISE_FILTER;

    fn select_log_filter(rust_log_env: Option<&str>, verbose: u8, cli_log_filter: Option<&str>) -> String {
        let options = LoggingInitOptions {
            verbose,
            cli_log_filter: cli_log_filter.map(ToString::to_string),
            rust_log_env: rust_log_env.map(ToString::to_string),
            ..Default::default()
        };
        logging::compose_logging_filters(&options).console_filter
    }

    #[test]
    fn test_uses_noise_and_default_info_without_overrides() {
        let selected = select_log_filter(None, 0, None);
        assert_eq!(selected, format!("{DEFAULT_NOISE_FILTER},info"));
    }

    #[test]
    fn test_uses_noise_with_rust_log_when_no_cli_overrides() {
        let selected = select_log_filter(Some("debug"), 0, None);
        assert_eq!(selected, format!("{DEFAULT_NOISE_FILTER},debug"));
    }

    #[test]
    fn test_verbose_flag_overrides_rust_log() {
        assert_eq!(select_log_filter(Some("info"), 1, None), "debug");
    }

    #[test]
    fn test_double_verbose_enables_trace() {
        assert_eq!(select_log_filter(Some("info"), 2, None), "trace");
    }

    #[test]
    fn test_explicit_log_filter_has_highest_precedence() {
        let selected = select_log_filter(Some("warn"), 2, Some("reelforge_core=trace"));
        assert_eq!(selected, "reelforge_core=trace");
    }
}
