use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::CONFIG;
use crate::utils::timing::TIMING_TARGET;

const LOG_DIR: &str = "logs";
const NOISY_TARGETS: [&str; 4] = [
    "hyper",
    "hyper_util",
    "hyper_util::client::legacy::pool",
    "reqwest",
];

/// Flushes the non-blocking writers when dropped; hold it for the life of `main`.
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

fn parse_log_level(value: &str) -> LevelFilter {
    match value.trim().to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Everything except timing events, with HTTP client chatter capped at WARN.
fn general_filter(level: LevelFilter) -> Targets {
    NOISY_TARGETS.iter().fold(
        Targets::new()
            .with_default(level)
            .with_target(TIMING_TARGET, LevelFilter::OFF),
        |targets, target| targets.with_target(*target, LevelFilter::WARN),
    )
}

fn timing_filter() -> Targets {
    Targets::new()
        .with_default(LevelFilter::OFF)
        .with_target(TIMING_TARGET, LevelFilter::INFO)
}

fn daily_writer(dir: &Path, file_name: &str, guards: &mut Vec<WorkerGuard>) -> NonBlocking {
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));
    guards.push(guard);
    writer
}

/// Job and pipeline logs go to stdout (collected by the serverless host) and
/// to daily `worker.log`/`worker.jsonl`; timing events go only to
/// `timing.log`/`timing.jsonl`.
pub fn init_logging() -> LoggingGuards {
    let logs_dir = Path::new(LOG_DIR);
    if let Err(err) = fs::create_dir_all(logs_dir) {
        eprintln!("Failed to create logs directory: {err}");
    }

    let mut guards = Vec::with_capacity(4);
    let worker_log = daily_writer(logs_dir, "worker.log", &mut guards);
    let worker_json = daily_writer(logs_dir, "worker.jsonl", &mut guards);
    let timing_log = daily_writer(logs_dir, "timing.log", &mut guards);
    let timing_json = daily_writer(logs_dir, "timing.jsonl", &mut guards);

    let general = general_filter(parse_log_level(&CONFIG.log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(general.clone()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(worker_log)
                .with_ansi(false)
                .with_filter(general.clone()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(worker_json)
                .with_filter(general),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(timing_log)
                .with_ansi(false)
                .with_filter(timing_filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(timing_json)
                .with_filter(timing_filter()),
        )
        .init();

    LoggingGuards { _guards: guards }
}

#[cfg(test)]
mod tests {
    use tracing::Level;

    use super::*;

    #[test]
    fn log_levels_parse_leniently() {
        assert_eq!(parse_log_level(" DEBUG "), LevelFilter::DEBUG);
        assert_eq!(parse_log_level("warning"), LevelFilter::WARN);
        assert_eq!(parse_log_level("chatty"), LevelFilter::INFO);
    }

    #[test]
    fn timing_events_are_split_from_general_logs() {
        let general = general_filter(LevelFilter::INFO);
        assert!(general.would_enable("zimage_worker::worker", &Level::INFO));
        assert!(!general.would_enable(TIMING_TARGET, &Level::INFO));
        assert!(!general.would_enable("reqwest::connect", &Level::INFO));
        assert!(general.would_enable("reqwest::connect", &Level::WARN));

        let timing = timing_filter();
        assert!(timing.would_enable(TIMING_TARGET, &Level::INFO));
        assert!(!timing.would_enable("zimage_worker::worker", &Level::ERROR));
    }
}
