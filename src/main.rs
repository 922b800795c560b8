use std::{
    io::{IsTerminal, Write, stderr, stdout},
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::Parser;
use config::{Config, Verbosity};
use entry::Event;
use eyre::{Context, eyre};
use recorder::Recorder;
use report::Reporter;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod entry;
mod geo;
mod prerequisites;
mod recorder;
mod report;

#[derive(clap::Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct CliOptions {
    /// Check for the optional capture tools and exit
    #[arg(long)]
    check: bool,

    /// Log two sample requests
    #[arg(long)]
    demo: bool,

    /// Analyze the collected request log
    #[arg(long)]
    analyze: bool,

    /// Log one request, given as a JSON object or a path to a file containing one
    #[arg(long, value_name = "EVENT")]
    log: Option<String>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log verbosity [default: from the configuration file]
    #[arg(short, long, alias = "log-level", value_enum)]
    verbosity: Option<Verbosity>,

    /// File to print logs to in addition to the console
    #[arg(short = 'o', long)]
    log_file: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = CliOptions::parse();

    let config = match Config::load(cli.config.as_deref()).await {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    // Set up logging
    let verbosity = cli.verbosity.unwrap_or(config.logging.verbosity);
    let log_file = cli.log_file.as_deref().or(config.logging.log_file.as_deref());
    // Must stay alive for the file writer to flush
    let _log_guard = match init_logging(verbosity.into(), log_file) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Error: failed to initialize logger: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(&cli, &config, &mut stdout().lock()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Perform the actions requested on the command line, writing user-facing output to `out`.
///
/// `--check` runs alone. Otherwise the demo, the analysis and the single event run in that
/// order. An unreadable `--log` event is reported on `out` and is not an error.
///
/// # Errors
///
/// Returns an `Err` if the log cannot be written or read, or if `out` fails.
async fn run<W: Write>(cli: &CliOptions, config: &Config, out: &mut W) -> eyre::Result<()> {
    if cli.check {
        writeln!(out, "[*] Checking system prerequisites...")?;
        write!(out, "{}", prerequisites::check())?;
        return Ok(());
    }

    if !cli.demo && !cli.analyze && cli.log.is_none() {
        warn!("Nothing to do. See --help for the available actions.");
    }

    if cli.demo {
        demo(config, out).await.wrap_err("Demo failed")?;
    }

    if cli.analyze {
        analyze_logs(config, out).await.wrap_err("Analysis failed")?;
    }

    if let Some(arg) = &cli.log {
        match read_event(arg).await {
            Ok(event) => {
                let recorder = Recorder::open(config).await.wrap_err("Failed to log event")?;
                log_request(&recorder, event, out)
                    .await
                    .wrap_err("Failed to log event")?;
            }
            // Bad input is reported, not fatal
            Err(err) => writeln!(out, "Error logging event: {err:#}")?,
        }
    }

    Ok(())
}

/// Install the console logger, plus a file logger if `log_file` is given.
///
/// Returns the guard of the file writer, which flushes it on drop.
fn init_logging(verbosity: LevelFilter, log_file: Option<&Path>) -> eyre::Result<Option<WorkerGuard>> {
    let console = fmt::layer()
        .with_writer(stderr)
        .with_ansi(stderr().is_terminal());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file_name = path
                .file_name()
                .ok_or_else(|| eyre!("{} is not a file path", path.display()))?;
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(file_name.to_string_lossy())
                .build(dir)
                .wrap_err_with(|| format!("Failed to open {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(verbosity)
        .with(console)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

/// Parse an event given on the command line, either inline JSON or the path of a JSON file.
async fn read_event(arg: &str) -> eyre::Result<Event> {
    let is_file = tokio::fs::metadata(arg)
        .await
        .is_ok_and(|meta| meta.is_file());
    if is_file {
        let contents = tokio::fs::read_to_string(arg)
            .await
            .wrap_err_with(|| format!("Failed to read {arg}"))?;
        Event::from_json(&contents).wrap_err_with(|| format!("{arg} is not a valid event"))
    } else {
        Event::from_json(arg).wrap_err("Argument is neither a file nor a valid JSON event")
    }
}

/// Record one event and echo the stored entry.
async fn log_request<W: Write>(recorder: &Recorder, event: Event, out: &mut W) -> eyre::Result<()> {
    let entry = recorder.record(event).await?;
    writeln!(out, "{}", serde_json::to_string_pretty(&entry)?)?;
    Ok(())
}

/// Print the report over the whole request log.
async fn analyze_logs<W: Write>(config: &Config, out: &mut W) -> eyre::Result<()> {
    writeln!(out, "\n[*] Analyzing collected logs:")?;
    match Reporter::new(config).analyze().await? {
        Some(report) => write!(out, "{report}")?,
        None => writeln!(out, "No logs found.")?,
    }
    Ok(())
}

/// Requests logged by `--demo`.
fn sample_events() -> [Event; 2] {
    [
        Event {
            client_ip: Some("2.196.16.26".to_owned()),
            method: Some("GET".to_owned()),
            host: Some("example.com".to_owned()),
            url: Some("/dashboard".to_owned()),
            user_agent: Some(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
                 Chrome/138.0.0.0 Safari/537.36 Edg/138.0.0.0"
                    .to_owned(),
            ),
        },
        Event {
            client_ip: Some("185.199.111.153".to_owned()),
            method: Some("POST".to_owned()),
            host: Some("github.com".to_owned()),
            url: Some("/login".to_owned()),
            user_agent: Some("curl/7.88.1".to_owned()),
        },
    ]
}

/// Log [`sample_events`], echoing each stored entry.
async fn demo<W: Write>(config: &Config, out: &mut W) -> eyre::Result<()> {
    writeln!(
        out,
        "\n[*] Demo logging. Feed events from a proxy or web server to log real traffic."
    )?;
    let recorder = Recorder::open(config).await?;
    info!("Logging sample events to {}", recorder.path().display());
    for event in sample_events() {
        log_request(&recorder, event, out).await?;
    }
    writeln!(out, "\n[*] Demo logging finished.")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::iter::once;

    use clap::Parser;
    use pretty_assertions::assert_eq;
    use reqwest::Url;
    use tempfile::TempDir;

    use super::{CliOptions, demo, read_event, run, sample_events};
    use crate::{config::Config, entry::Event, report::Reporter};

    /// A configuration logging under `dir`, with no reachable lookup service.
    fn offline_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.log_dir = dir.path().join("logs");
        config.geolocation.endpoint = Url::parse("http://127.0.0.1:9/json").unwrap();
        config
    }

    /// Run with the given flags, returning the result and everything written to the output.
    async fn run_with(args: &[&str], config: &Config) -> (eyre::Result<()>, String) {
        let cli = CliOptions::parse_from(once("webtracker").chain(args.iter().copied()));
        let mut out = Vec::new();
        let res = run(&cli, config, &mut out).await;
        (res, String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn event_from_literal_or_file() {
        let event = read_event(r#"{"client_ip": "1.2.3.4", "method": "GET"}"#)
            .await
            .unwrap();
        assert_eq!(event.client_ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(event.host, None);

        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("event.json");
        tokio::fs::write(&path, r#"{"host": "example.com", "user_agent": "Wget/1.21"}"#)
            .await
            .unwrap();
        let event = read_event(path.to_str().unwrap()).await.unwrap();
        assert_eq!(
            event,
            Event {
                host: Some("example.com".to_owned()),
                user_agent: Some("Wget/1.21".to_owned()),
                ..Event::default()
            }
        );
    }

    #[tokio::test]
    async fn malformed_event_is_an_error() {
        assert!(read_event("not json").await.is_err());
        assert!(read_event(r#"["1.2.3.4"]"#).await.is_err());
        assert!(read_event(r#"["1.2.3.4", "GET", "evil.example"]"#).await.is_err());
        assert!(read_event(r#"{"client_ip": 1234}"#).await.is_err());

        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("event.json");
        tokio::fs::write(&path, "{ truncated").await.unwrap();
        assert!(read_event(path.to_str().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn demo_logs_both_samples() {
        let tmpdir = TempDir::new().unwrap();
        let config = offline_config(&tmpdir);

        demo(&config, &mut Vec::new()).await.unwrap();

        let report = Reporter::new(&config).analyze().await.unwrap().unwrap();
        assert_eq!(report.entries, sample_events().len());
        assert_eq!(
            report.hosts,
            vec![("example.com".to_owned(), 1), ("github.com".to_owned(), 1)]
        );
        // Without a lookup service every country is unknown
        assert!(report.suspicious.is_empty());
    }

    #[tokio::test]
    async fn check_runs_alone() {
        let tmpdir = TempDir::new().unwrap();
        let config = offline_config(&tmpdir);

        let (res, out) = run_with(
            &["--demo", "--analyze", "--log", r#"{"host": "a.example"}"#, "--check"],
            &config,
        )
        .await;

        res.unwrap();
        assert!(out.starts_with("[*] Checking system prerequisites...\n"), "{out}");
        assert!(!out.contains("Demo logging"), "{out}");
        assert!(!out.contains("Analyzing"), "{out}");
        assert!(!config.storage.log_dir.exists());
    }

    #[tokio::test]
    async fn actions_run_in_fixed_order() {
        let tmpdir = TempDir::new().unwrap();
        let config = offline_config(&tmpdir);

        // Flag order on the command line does not matter
        let (res, out) = run_with(
            &["--log", r#"{"host": "late.example"}"#, "--analyze", "--demo"],
            &config,
        )
        .await;
        res.unwrap();

        let demo_done = out.find("[*] Demo logging finished.").unwrap();
        let analysis = out.find("[*] Analyzing collected logs:").unwrap();
        let logged = out.find("late.example").unwrap();
        assert!(demo_done < analysis && analysis < logged, "{out}");
        // The analysis ran before the single event was appended
        assert!(out.contains("Entries analyzed: 2\n"), "{out}");

        let log = tokio::fs::read_to_string(config.storage.log_path())
            .await
            .unwrap();
        let lines = log.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains(r#""host":"late.example""#));
    }

    #[tokio::test]
    async fn bad_event_is_reported_and_not_fatal() {
        let tmpdir = TempDir::new().unwrap();
        let config = offline_config(&tmpdir);

        let (res, out) = run_with(&["--log", r#"["1.2.3.4", "GET", "evil.example"]"#], &config).await;

        res.unwrap();
        assert!(out.starts_with("Error logging event: "), "{out}");
        assert!(!config.storage.log_path().exists());
    }

    #[tokio::test]
    async fn unwritable_log_is_fatal() {
        let tmpdir = TempDir::new().unwrap();
        let mut config = offline_config(&tmpdir);
        // A regular file where the log directory should be
        tokio::fs::write(&config.storage.log_dir, b"").await.unwrap();

        let (res, out) = run_with(&["--log", r#"{"host": "a.example"}"#], &config).await;

        assert!(res.is_err());
        assert!(!out.contains("Error logging event"), "{out}");

        config.storage.log_dir = tmpdir.path().join("other");
        let (res, out) = run_with(&["--analyze"], &config).await;
        res.unwrap();
        assert!(out.contains("No logs found."), "{out}");
    }

    #[test]
    fn flags_are_independent() {
        let cli = CliOptions::parse_from(["webtracker", "--analyze", "--log", "{}", "-v", "warn"]);
        assert!(cli.analyze);
        assert!(!cli.demo);
        assert_eq!(cli.log.as_deref(), Some("{}"));
        assert_eq!(cli.verbosity, Some(crate::config::Verbosity::Warn));
    }
}
