mod actions;
mod config;
mod dispatch;
mod error;
mod gateway_server;
mod lifecycle;
mod registry;
mod roster;
mod runtime;
mod security;
mod transport;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use registry::{ConnectionRegistry, RegistryStore};
use security::KeyCache;
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(
    author,
    version,
    about = "Real-time notification fan-out for event staffing control rooms"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "STAFFING_RT_CONFIG",
        default_value = "staffing-realtime.toml"
    )]
    config: PathBuf,

    /// Override the websocket bind address.
    #[arg(long, global = true, env = "STAFFING_RT_BIND")]
    bind: Option<String>,

    /// Override the control HTTP bind address. Empty disables it.
    #[arg(long = "http-bind", global = true, env = "STAFFING_RT_HTTP_BIND")]
    http_bind: Option<String>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "STAFFING_RT_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the realtime gateway.
    Run,
    /// Check config, key source and registry without serving traffic.
    Doctor(DoctorArgs),
    /// List the usable verification keys currently published.
    Keys(OutputArgs),
    /// List registered connections for one channel.
    Connections(ConnectionsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct OutputArgs {
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct ConnectionsArgs {
    /// Channel to list.
    #[arg(long)]
    channel: String,
    /// Only list connections scoped to this subject.
    #[arg(long)]
    subject: Option<String>,
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Run);
    match command {
        CliCommand::Run => run_runtime(&cli).await,
        CliCommand::Doctor(args) => run_doctor(&cli.config, args).await,
        CliCommand::Keys(args) => run_keys_command(&cli, args).await,
        CliCommand::Connections(args) => run_connections_command(&cli, args).await,
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.bind.as_deref(), cli.http_bind.as_deref());
    Ok(cfg)
}

async fn run_runtime(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli)?;
    runtime::StaffingRuntime::new(cfg).run().await
}

async fn run_doctor(config_path: &Path, args: DoctorArgs) -> Result<()> {
    let config_result = Config::load(config_path).map_err(|err| format!("{err:#}"));
    let key_probe = match config_result.as_ref() {
        Ok(cfg) => Some(probe_key_source(cfg).await),
        Err(_) => None,
    };
    let report = build_doctor_report(config_result, config_path, key_probe);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

async fn probe_key_source(cfg: &Config) -> std::result::Result<usize, String> {
    let cache = KeyCache::from_config(&cfg.auth).map_err(|err| format!("{err:#}"))?;
    cache
        .refresh()
        .await
        .map(|keys| keys.len())
        .map_err(|err| err.to_string())
}

async fn run_keys_command(cli: &Cli, args: OutputArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let cache = KeyCache::from_config(&cfg.auth)?;
    let key_set = cache.refresh().await?;
    let mut keys: Vec<Value> = key_set
        .iter()
        .map(|(kid, entry)| {
            json!({
                "kid": kid,
                "kty": entry.raw.kty,
                "alg": entry.key.algorithm(),
                "crv": entry.raw.crv,
            })
        })
        .collect();
    keys.sort_by(|a, b| a["kid"].as_str().cmp(&b["kid"].as_str()));
    if args.json {
        print_json_value(&json!({
            "source": cfg.auth.jwks_url,
            "count": keys.len(),
            "keys": keys
        }));
    } else {
        println!("usable keys from {}: {}", cfg.auth.jwks_url, keys.len());
        for key in &keys {
            println!(
                "{} kty={} alg={}",
                key["kid"].as_str().unwrap_or("-"),
                key["kty"].as_str().unwrap_or("-"),
                key["alg"].as_str().unwrap_or("-")
            );
        }
    }
    Ok(())
}

async fn run_connections_command(cli: &Cli, args: ConnectionsArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let store = RegistryStore::open(cfg.registry.path.clone()).await?;
    let entries = store
        .list_by_channel(&args.channel, args.subject.as_deref())
        .await?;
    if args.json {
        print_json_value(&json!({
            "channel": args.channel,
            "count": entries.len(),
            "connections": entries
        }));
    } else {
        println!(
            "connections on {}: count={} backend={}",
            args.channel,
            entries.len(),
            store.backend_name()
        );
        for entry in entries {
            println!(
                "{} subject={}",
                entry.connection_handle,
                entry.subject_id.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

fn print_json_value(value: &Value) {
    let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    println!("{rendered}");
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
    key_probe: Option<std::result::Result<usize, String>>,
) -> DoctorReport {
    let mut checks = Vec::new();
    let mut config = None;

    match config_result {
        Ok(cfg) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message: format!("loaded {}", config_path.display()),
                detail: None,
            });
            config = Some(cfg);
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}", config_path.display()),
                detail: Some(err),
            });
        }
    }

    if let Some(cfg) = config.as_ref() {
        let key_check = match key_probe {
            Some(Ok(0)) => DoctorCheck {
                id: "auth.key_source".to_owned(),
                status: "warn".to_owned(),
                message: "key source returned no usable keys".to_owned(),
                detail: Some(cfg.auth.jwks_url.clone()),
            },
            Some(Ok(count)) => DoctorCheck {
                id: "auth.key_source".to_owned(),
                status: "pass".to_owned(),
                message: format!("{count} usable key(s)"),
                detail: Some(cfg.auth.jwks_url.clone()),
            },
            Some(Err(err)) => DoctorCheck {
                id: "auth.key_source".to_owned(),
                status: "fail".to_owned(),
                message: format!("key source {} unavailable", cfg.auth.jwks_url),
                detail: Some(err),
            },
            None => DoctorCheck {
                id: "auth.key_source".to_owned(),
                status: "warn".to_owned(),
                message: "key source not probed".to_owned(),
                detail: None,
            },
        };
        checks.push(key_check);

        let registry_path = cfg.registry.path.to_string_lossy().to_ascii_lowercase();
        let sqlite_selected = registry_path.ends_with(".db")
            || registry_path.ends_with(".sqlite")
            || registry_path.ends_with(".sqlite3");
        let sqlite_enabled = cfg!(feature = "sqlite-registry");
        checks.push(DoctorCheck {
            id: "registry.backend".to_owned(),
            status: if sqlite_selected && !sqlite_enabled {
                "fail"
            } else {
                "pass"
            }
            .to_owned(),
            message: if sqlite_selected {
                "sqlite-backed connection registry requested".to_owned()
            } else {
                format!("registry path {}", cfg.registry.path.display())
            },
            detail: Some(format!("feature sqlite-registry enabled={sqlite_enabled}")),
        });

        checks.push(DoctorCheck {
            id: "actions.bindings".to_owned(),
            status: if cfg.actions.is_empty() { "warn" } else { "pass" }.to_owned(),
            message: format!("{} action(s) configured", cfg.actions.len()),
            detail: None,
        });
    }

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_run_without_subcommand() {
        let cli = Cli::parse_from(["staffing-realtime"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log, "info");
    }

    #[test]
    fn cli_parses_doctor_command_and_json_flag() {
        let cli = Cli::parse_from(["staffing-realtime", "doctor", "--json"]);
        match cli.command {
            Some(CliCommand::Doctor(args)) => assert!(args.json),
            _ => panic!("expected doctor command"),
        }
    }

    #[test]
    fn cli_parses_connections_command_with_global_overrides() {
        let cli = Cli::parse_from([
            "staffing-realtime",
            "connections",
            "--channel",
            "venue-status",
            "--subject",
            "E1",
            "--bind",
            "127.0.0.1:9000",
        ]);
        assert_eq!(cli.bind.as_deref(), Some("127.0.0.1:9000"));
        match cli.command {
            Some(CliCommand::Connections(args)) => {
                assert_eq!(args.channel, "venue-status");
                assert_eq!(args.subject.as_deref(), Some("E1"));
                assert!(!args.json);
            }
            _ => panic!("expected connections command"),
        }
    }

    #[test]
    fn doctor_report_marks_config_load_failure_as_blocking() {
        let report = build_doctor_report(
            Err("invalid config".to_owned()),
            Path::new("staffing-realtime.toml"),
            None,
        );
        assert!(!report.ok);
        assert!(report
            .checks
            .iter()
            .any(|check| check.id == "config.load" && check.status == "fail"));
    }

    #[test]
    fn doctor_report_fails_when_key_source_is_down() {
        let report = build_doctor_report(
            Ok(Config::default()),
            Path::new("staffing-realtime.toml"),
            Some(Err("key source unavailable: connection refused".to_owned())),
        );
        assert!(!report.ok);
        assert!(report
            .checks
            .iter()
            .any(|check| check.id == "auth.key_source" && check.status == "fail"));
    }

    #[test]
    fn doctor_report_warns_on_empty_key_set() {
        let report = build_doctor_report(
            Ok(Config::default()),
            Path::new("staffing-realtime.toml"),
            Some(Ok(0)),
        );
        assert!(report.ok);
        assert!(report
            .checks
            .iter()
            .any(|check| check.id == "auth.key_source" && check.status == "warn"));
    }
}
