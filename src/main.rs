use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use dotenvy::dotenv;
use tracing::{info, warn};

mod catalog;
mod config;
mod diagnostics;
mod job;
mod pipeline;
mod prompt;
mod runtime;
#[cfg(test)]
mod test_support;
mod utils;
mod worker;

use config::CONFIG;
use pipeline::RemoteBackend;
use runtime::{run_job_loop, run_local, JobEndpoints, LocalInput, DEFAULT_TEST_INPUT_FILE};
use utils::logging::init_logging;
use worker::{Worker, WorkerSettings};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Serve,
    TestInput(LocalInput),
}

fn usage() -> &'static str {
    "Usage: zimage_worker [run] | zimage_worker test-input [--file <path> | --json <job json>]"
}

fn parse_args(args: &[String]) -> anyhow::Result<Mode> {
    match args.get(1).map(|value| value.as_str()) {
        None | Some("run") => return Ok(Mode::Serve),
        Some("test-input") => {}
        Some("--help") | Some("-h") => return Err(anyhow!(usage())),
        Some(other) => return Err(anyhow!("Unknown command: {other}\n{}", usage())),
    }

    let mut input = LocalInput::File(PathBuf::from(DEFAULT_TEST_INPUT_FILE));
    let mut index = 2;
    while index < args.len() {
        match args[index].as_str() {
            "--file" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("Missing value for --file"))?;
                input = LocalInput::File(PathBuf::from(value));
            }
            "--json" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("Missing value for --json"))?;
                input = LocalInput::Inline(value.clone());
            }
            other => {
                return Err(anyhow!(
                    "Unknown test-input argument: {other}\n{}",
                    usage()
                ));
            }
        }
        index += 1;
    }
    Ok(Mode::TestInput(input))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let _guards = init_logging();

    let args: Vec<String> = std::env::args().collect();
    let mode = parse_args(&args)?;

    let backend = RemoteBackend::new(
        &CONFIG.diffusion_backend_url,
        Duration::from_secs(CONFIG.diffusion_load_timeout_secs),
        Duration::from_secs(CONFIG.diffusion_generate_timeout_secs),
    );
    let worker = Arc::new(Worker::new(backend, WorkerSettings::from_config(&CONFIG)));
    info!(
        "Z-Image Turbo worker starting (network volume {}); pipeline loads on first request",
        if CONFIG.storage.network_volume_mounted {
            "mounted"
        } else {
            "not mounted"
        }
    );

    match mode {
        Mode::Serve => {
            let endpoints = JobEndpoints::from_config(&CONFIG)?;
            run_job_loop(worker, endpoints, shutdown_signal()).await?;
        }
        Mode::TestInput(input) => {
            let output = run_local(&worker, input).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        std::iter::once("zimage_worker")
            .chain(values.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn no_command_serves_jobs() {
        assert_eq!(parse_args(&args(&[])).unwrap(), Mode::Serve);
        assert_eq!(parse_args(&args(&["run"])).unwrap(), Mode::Serve);
    }

    #[test]
    fn test_input_defaults_to_local_file() {
        assert_eq!(
            parse_args(&args(&["test-input"])).unwrap(),
            Mode::TestInput(LocalInput::File(PathBuf::from("test_input.json")))
        );
        assert_eq!(
            parse_args(&args(&["test-input", "--json", "{}"])).unwrap(),
            Mode::TestInput(LocalInput::Inline("{}".to_string()))
        );
    }

    #[test]
    fn bad_arguments_are_rejected() {
        assert!(parse_args(&args(&["serve-forever"])).is_err());
        assert!(parse_args(&args(&["test-input", "--file"])).is_err());
        assert!(parse_args(&args(&["test-input", "--verbose"])).is_err());
    }
}
