use std::env;
use std::io::Write;
use std::time::Duration;

use vidgrab::core::models::{AppError, DownloadJob, JobState, VideoInfo};
use vidgrab::core::progress_tracker::{human_duration, human_size};
use vidgrab::utils::logging::init_tracing;
use vidgrab::{AppConfig, AppState};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: vidgrab-cli <url> [format]");
        std::process::exit(1);
    }

    let url = args[1].clone();
    let format = args.get(2).cloned();

    if let Err(error) = run(&url, format).await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run(url: &str, format: Option<String>) -> anyhow::Result<()> {
    let config = AppConfig::load(None)?;
    init_tracing("vidgrab=warn");
    let state = AppState::new(config)?;
    let orchestrator = state.orchestrator;

    let info = orchestrator.probe(url).await?;
    print_formats(&info);

    let selector = match format {
        Some(selector) => selector,
        None => info
            .preferred_720p_or_nearest()
            .map(|f| f.format_id.clone())
            .ok_or_else(|| anyhow::anyhow!("no formats offered"))?,
    };

    let job_id = orchestrator.start(url, &selector).await?;
    println!("Started job {job_id} ({selector})");

    let job = loop {
        let job = orchestrator.get_status(&job_id)?;
        print_progress(&job);
        if job.state.is_terminal() {
            break job;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };
    println!();

    match job.state {
        JobState::Completed => {
            if let Some(path) = job.output_path {
                println!("Saved to {}", path.display());
            }
            Ok(())
        }
        _ => match job.error {
            Some(error) => Err(AppError::from(error).into()),
            None => anyhow::bail!("download ended as {:?}", job.state),
        },
    }
}

fn print_formats(info: &VideoInfo) {
    println!("Title: {}", info.title);
    if let Some(duration) = info.duration {
        println!("Duration: {}", human_duration(duration));
    }
    println!("Formats:");

    for format in &info.available_formats {
        println!("  {:>8}  {}", format.format_id, format.label);
    }
}

fn print_progress(job: &DownloadJob) {
    print!(
        "\r{:?} attempt {} {:>5.1}% {}/s ETA {}      ",
        job.state,
        job.attempt,
        job.progress.percent,
        human_size(job.progress.speed_bytes_per_sec),
        human_duration(job.progress.eta_seconds),
    );
    let _ = std::io::stdout().flush();
}
