//! beetlelog - a terminal client for beetle field observations.
//!
//! Logs in against the beetlelog API, keeps the session in the configured
//! token store and runs one command per invocation. An expired access token
//! is refreshed transparently; a dead session asks for `beetlelog login`.

use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use beetlelog_core::models::{ListParams, SummaryFilters};
use beetlelog_core::{ApiClient, Config};

// ============================================================================
// Constants
// ============================================================================

const LOG_FILE: &str = "beetlelog.log";

/// Password source for non-interactive logins
const ENV_PASSWORD: &str = "BEETLELOG_PASSWORD";

/// Species shown in the summary
const SUMMARY_TOP_SPECIES: usize = 5;

const USAGE: &str = "\
Usage: beetlelog <command> [args]

Commands:
  login [username]               Log in and keep the session
  logout                         Forget the session
  status                         Show session and configuration
  list [search]                  List observations
  show <id>                      Show one observation as JSON
  classify <id>                  Run the species classifier on an observation
  validate <inference-id> <yes|no>
                                 Mark a prediction right or wrong
  summary [from] [to]            Observation summary (dates as YYYY-MM-DD)
  export-csv <file> [from] [to]  Save the CSV export
  export-pdf <file> [from] [to]  Save the PDF report
  delete <id>                    Delete an observation";

#[derive(Debug, PartialEq)]
enum Command {
    Login { username: Option<String> },
    Logout,
    Status,
    List { search: Option<String> },
    Show { id: i64 },
    Classify { id: i64 },
    Validate { inference_id: i64, is_correct: bool },
    Summary { filters: SummaryFilters },
    ExportCsv { file: String, filters: SummaryFilters },
    ExportPdf { file: String, filters: SummaryFilters },
    Delete { id: i64 },
    Help,
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        let mut args = args.iter().map(String::as_str);
        let name = args.next().unwrap_or("help");
        let rest: Vec<&str> = args.collect();

        let command = match name {
            "login" => Command::Login {
                username: rest.first().map(|s| s.to_string()),
            },
            "logout" => Command::Logout,
            "status" => Command::Status,
            "list" => Command::List {
                search: (!rest.is_empty()).then(|| rest.join(" ")),
            },
            "show" => Command::Show { id: parse_id(rest.first())? },
            "classify" => Command::Classify { id: parse_id(rest.first())? },
            "validate" => Command::Validate {
                inference_id: parse_id(rest.first())?,
                is_correct: parse_verdict(rest.get(1).copied())?,
            },
            "summary" => Command::Summary {
                filters: parse_filters(rest.first().copied(), rest.get(1).copied())?,
            },
            "export-csv" | "export-pdf" => {
                let file = rest
                    .first()
                    .map(|s| s.to_string())
                    .ok_or_else(|| anyhow::anyhow!("{} needs an output file", name))?;
                let filters = parse_filters(rest.get(1).copied(), rest.get(2).copied())?;
                if name == "export-csv" {
                    Command::ExportCsv { file, filters }
                } else {
                    Command::ExportPdf { file, filters }
                }
            }
            "delete" => Command::Delete { id: parse_id(rest.first())? },
            "help" | "--help" | "-h" => Command::Help,
            other => bail!("Unknown command: {}\n\n{}", other, USAGE),
        };
        Ok(command)
    }
}

fn parse_id(arg: Option<&&str>) -> Result<i64> {
    let arg = arg.ok_or_else(|| anyhow::anyhow!("Missing id"))?;
    arg.parse().with_context(|| format!("Invalid id: {}", arg))
}

fn parse_verdict(arg: Option<&str>) -> Result<bool> {
    match arg.map(str::to_ascii_lowercase).as_deref() {
        Some("yes" | "y" | "true") => Ok(true),
        Some("no" | "n" | "false") => Ok(false),
        _ => bail!("Expected yes or no"),
    }
}

fn parse_date(arg: Option<&str>) -> Result<Option<NaiveDate>> {
    arg.map(|s| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("Invalid date: {}", s))
    })
    .transpose()
}

fn parse_filters(from: Option<&str>, to: Option<&str>) -> Result<SummaryFilters> {
    Ok(SummaryFilters::between(parse_date(from)?, parse_date(to)?))
}

/// Initialize the tracing subscriber, writing to a log file in the cache dir.
/// The returned guard must stay alive until exit so buffered lines are flushed.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let log_dir = match config.cache_dir() {
        Ok(dir) if std::fs::create_dir_all(&dir).is_ok() => dir,
        _ => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            return None;
        }
    };

    let appender = tracing_appender::rolling::never(&log_dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
    Some(guard)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = Config::load()?;
    let _guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = Command::parse(&args)?;
    if command == Command::Help {
        println!("{}", USAGE);
        return Ok(ExitCode::SUCCESS);
    }

    let client = ApiClient::from_config(&config)?;
    let result = run(&client, &mut config, command).await;
    Ok(ExitCode::from(exit_status(
        &result,
        client.session().is_authenticated(),
        &mut io::stderr(),
    )))
}

/// Report a failed command and pick the process exit status
fn exit_status(result: &Result<()>, authenticated: bool, out: &mut impl Write) -> u8 {
    let Err(e) = result else {
        return 0;
    };
    let _ = writeln!(out, "Error: {:#}", e);
    if !authenticated {
        let _ = writeln!(out, "Not logged in. Run `beetlelog login`.");
    }
    1
}

async fn run(client: &ApiClient, config: &mut Config, command: Command) -> Result<()> {
    match command {
        Command::Login { username } => login(client, config, username).await,
        Command::Logout => {
            client.session().logout();
            println!("Logged out.");
            Ok(())
        }
        Command::Status => {
            let session = client.session().snapshot();
            let state = if session.is_authenticated() {
                "logged in"
            } else if session.refresh_token.is_some() {
                "session expired, will refresh on next request"
            } else {
                "not logged in"
            };
            println!("Session:  {}", state);
            if let Some(username) = &config.last_username {
                println!("User:     {}", username);
            }
            println!("API:      {}", config.api_base_url);
            println!("Storage:  {:?}", config.storage);
            Ok(())
        }
        Command::List { search } => {
            let params = ListParams {
                search,
                ordering: Some("-date".to_string()),
                page: None,
            };
            let observations = client.list_observations(&params).await?;
            if observations.is_empty() {
                println!("No observations.");
            }
            for obs in &observations {
                println!(
                    "{:>6}  {}  {:<32}  {}",
                    obs.id,
                    obs.date,
                    obs.place_display(),
                    obs.predicted_label().unwrap_or("-")
                );
            }
            Ok(())
        }
        Command::Show { id } => {
            let observation = client.get_observation(id).await?;
            println!("{}", serde_json::to_string_pretty(&observation)?);
            Ok(())
        }
        Command::Classify { id } => {
            let inference = client.classify_observation(id).await?;
            println!(
                "{} ({:.1}%) - inference {}",
                inference.predicted_label, inference.confidence, inference.id
            );
            Ok(())
        }
        Command::Validate { inference_id, is_correct } => {
            if client.validate_inference(inference_id, is_correct).await? {
                println!("Feedback recorded.");
            } else {
                warn!(inference_id, "Server did not acknowledge validation");
                println!("Feedback was not accepted.");
            }
            Ok(())
        }
        Command::Summary { filters } => {
            let summary = client.observation_summary(&filters).await?;
            println!("Observations:      {}", summary.total_observations);
            println!("Distinct species:  {}", summary.distinct_species_count);
            if let Some(day) = summary.busiest_day() {
                println!("Busiest day:       {} ({})", day.date, day.count);
            }
            let top = summary.top_species(SUMMARY_TOP_SPECIES);
            if !top.is_empty() {
                println!();
                for species in top {
                    println!("{:>5}  {}", species.count, species.label);
                }
            }
            Ok(())
        }
        Command::ExportCsv { file, filters } => {
            let bytes = client.export_csv(&filters).await?;
            save_export(&file, &bytes)
        }
        Command::ExportPdf { file, filters } => {
            let bytes = client.export_pdf(&filters).await?;
            save_export(&file, &bytes)
        }
        Command::Delete { id } => {
            client.delete_observation(id).await?;
            println!("Deleted observation {}.", id);
            Ok(())
        }
        Command::Help => Ok(()),
    }
}

async fn login(client: &ApiClient, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(username) => username,
        None => prompt("Username: ")?,
    };
    if username.is_empty() {
        bail!("Username is required");
    }

    let password = match std::env::var(ENV_PASSWORD) {
        Ok(password) => password,
        Err(_) => rpassword::prompt_password(format!("Password for {}: ", username))
            .context("Failed to read password")?,
    };

    if let Err(e) = client.session().try_login(&username, &password).await {
        bail!("Login failed: {}", e.user_message());
    }
    info!(username = %username, "Logged in");

    config.last_username = Some(username.clone());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
    println!("Logged in as {}.", username);
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn save_export(file: &str, bytes: &[u8]) -> Result<()> {
    let path = Path::new(file);
    std::fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {} bytes to {}.", bytes.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse(&[]).unwrap(), Command::Help);
        assert_eq!(
            Command::parse(&args("login alice")).unwrap(),
            Command::Login { username: Some("alice".to_string()) }
        );
        assert_eq!(
            Command::parse(&args("list carabus auratus")).unwrap(),
            Command::List { search: Some("carabus auratus".to_string()) }
        );
        assert_eq!(
            Command::parse(&args("validate 17 no")).unwrap(),
            Command::Validate { inference_id: 17, is_correct: false }
        );
    }

    #[test]
    fn test_parse_export_with_range() {
        let command = Command::parse(&args("export-pdf out.pdf 2025-01-01")).unwrap();
        assert_eq!(
            command,
            Command::ExportPdf {
                file: "out.pdf".to_string(),
                filters: SummaryFilters::between(NaiveDate::from_ymd_opt(2025, 1, 1), None),
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Command::parse(&args("show abc")).is_err());
        assert!(Command::parse(&args("validate 3 maybe")).is_err());
        assert!(Command::parse(&args("summary 2025-13-01")).is_err());
        assert!(Command::parse(&args("export-csv")).is_err());
        assert!(Command::parse(&args("frobnicate")).is_err());
    }

    #[test]
    fn test_exit_status_reports_failures() {
        let mut out = Vec::new();
        assert_eq!(exit_status(&Ok(()), false, &mut out), 0);
        assert!(out.is_empty());

        let failed: Result<()> = Err(anyhow::anyhow!("Request failed: GET observations/"));
        assert_eq!(exit_status(&failed, false, &mut out), 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Error: Request failed: GET observations/"));
        assert!(text.contains("beetlelog login"));
    }
}
