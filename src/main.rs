//! Thin CLI façade over the engine (spec.md §1: interactive UI and
//! argument parsing depth are out of scope; this binary exists only
//! to expose the engine's operations and translate its errors into
//! exit codes).

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use deployer::config::EngineConfig;
use deployer::connection::known_hosts::KnownHosts;
use deployer::connection::{Connection, HostConfig};
use deployer::error::{Error, ErrorKind};
use deployer::model::{InvocationMode, Server, Site};
use deployer::playbook::DirPlaybookSource;
use deployer::progress::{Progress, Stream};
use futures::future::join_all;
use tokio::sync::Semaphore;

#[derive(Parser)]
#[command(name = "deployer", version, about = "Remote execution and deployment engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to an optional TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory containing playbooks and helpers.sh.
    #[arg(long, global = true, default_value = "playbooks")]
    playbooks_dir: PathBuf,

    /// Path to the known_hosts file used for the `accept-new` policy.
    #[arg(long, global = true)]
    known_hosts: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Perform an atomic release-based deployment for one or more
    /// sites. Repeat `--server`/`--site` to fan out across several
    /// host/site pairs (matched pairwise by position), bounded by
    /// `max_forks` concurrent hosts at a time.
    Deploy {
        #[arg(long, required = true)]
        server: Vec<PathBuf>,
        #[arg(long, required = true)]
        site: Vec<PathBuf>,
        #[arg(long, default_value = "/usr/bin/php")]
        php_path: String,
    },
    /// Run a single playbook against one or more servers (repeat
    /// `--server` to fan out, bounded by `max_forks`).
    RunPlaybook {
        #[arg(long, required = true)]
        server: Vec<PathBuf>,
        #[arg(long)]
        playbook: String,
        #[arg(long)]
        distro: String,
        #[arg(long)]
        perms: String,
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,
        /// Stream output lines as they arrive instead of reporting only
        /// the final result.
        #[arg(long)]
        stream: bool,
    },
    /// Gather and print server info for one or more servers (repeat
    /// `--server` to fan out, bounded by `max_forks`).
    ServerInfo {
        #[arg(long, required = true)]
        server: Vec<PathBuf>,
        #[arg(long, default_value = "ubuntu")]
        distro: String,
        #[arg(long, default_value = "sudo")]
        perms: String,
    },
    /// Reconcile one or more sites' crontabs with their declared crons
    /// (repeat `--server`/`--site` to fan out, bounded by `max_forks`).
    SyncCrons {
        #[arg(long, required = true)]
        server: Vec<PathBuf>,
        #[arg(long, required = true)]
        site: Vec<PathBuf>,
    },
    /// Reconcile one or more sites' supervisor fragments with their
    /// declared programs (repeat `--server`/`--site` to fan out,
    /// bounded by `max_forks`).
    SyncSupervisors {
        #[arg(long, required = true)]
        server: Vec<PathBuf>,
        #[arg(long, required = true)]
        site: Vec<PathBuf>,
    },
}

/// Zips `server` and `site` positionally, failing validation if the
/// counts don't match.
fn pair_servers_and_sites(
    server: Vec<PathBuf>,
    site: Vec<PathBuf>,
) -> Result<Vec<(PathBuf, PathBuf)>, CliError> {
    if server.len() != site.len() {
        return Err(CliError::Validation(format!(
            "--server and --site must be given the same number of times ({} vs {})",
            server.len(),
            site.len()
        )));
    }
    Ok(server.into_iter().zip(site).collect())
}

/// Runs `task` once per `(label, item)` pair, holding at most
/// `max_forks` in flight at a time (spec.md §9: "remote fan-out is
/// explicit task spawning with a bounded pool; results are collected
/// into an ordered result list keyed by server"), the way the
/// teacher's `Executor::run_free` bounds per-host workers with a
/// semaphore. `join_all` preserves the input order of `items` in its
/// output, so failures are reported in the same order hosts were
/// given. Every host's failure is collected rather than the run
/// stopping at the first one, so one bad host doesn't hide the rest.
async fn fan_out<T, F, Fut>(items: Vec<(String, T)>, max_forks: usize, task: F) -> Result<(), CliError>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CliError>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_forks.max(1)));
    let task = Arc::new(task);
    let handles: Vec<_> = items
        .into_iter()
        .map(|(label, item)| {
            let semaphore = Arc::clone(&semaphore);
            let task = Arc::clone(&task);
            tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                (label, (*task)(item).await)
            })
        })
        .collect();

    let mut failed = 0usize;
    let mut last_engine_message: Option<String> = None;
    let mut last_validation_message: Option<String> = None;
    for joined in join_all(handles).await {
        let (label, result) = joined.unwrap_or_else(|join_err| {
            (
                "<unknown host>".to_string(),
                Err(CliError::Engine(Error::Other(format!(
                    "host task panicked: {join_err}"
                )))),
            )
        });
        if let Err(e) = result {
            failed += 1;
            match e {
                CliError::Engine(err) => {
                    tracing::error!(host = %label, "{err}");
                    last_engine_message = Some(err.to_string());
                }
                CliError::Validation(msg) => {
                    tracing::error!(host = %label, "{msg}");
                    last_validation_message = Some(msg);
                }
            }
        }
    }

    if failed == 0 {
        return Ok(());
    }
    if let Some(message) = last_engine_message {
        Err(CliError::Engine(Error::Other(format!(
            "{failed} host(s) failed (last error: {message})"
        ))))
    } else {
        Err(CliError::Validation(format!(
            "{failed} host(s) failed validation (last: {})",
            last_validation_message.unwrap_or_default()
        )))
    }
}

/// Pairs each item with a display label for [`fan_out`]'s ordered,
/// keyed-by-server result reporting.
fn label_paths<T, I: Fn(&T) -> &std::path::Path>(items: Vec<T>, path_of: I) -> Vec<(String, T)> {
    items
        .into_iter()
        .map(|item| {
            let label = path_of(&item).display().to_string();
            (label, item)
        })
        .collect()
}

/// The CLI's own [`Progress`] implementation: host lifecycle and
/// warnings go through `tracing`, streamed playbook output goes
/// straight to stdout/stderr so it behaves like running the command
/// locally.
struct CliProgress;

impl Progress for CliProgress {
    fn host_started(&self, host: &str) {
        tracing::info!(host, "starting");
    }

    fn host_finished(&self, host: &str, succeeded: bool) {
        tracing::info!(host, succeeded, "finished");
    }

    fn line(&self, host: &str, stream: Stream, line: &str) {
        match stream {
            Stream::Stdout => println!("[{host}] {line}"),
            Stream::Stderr => eprintln!("[{host}] {line}"),
        }
    }

    fn warning(&self, host: &str, message: &str) {
        tracing::warn!(host, "{message}");
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) => Ok((k.to_string(), v.to_string())),
        None => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let exit_code = tokio::select! {
        result = run(cli) => {
            match result {
                Ok(()) => 0,
                Err(CliError::Validation(msg)) => {
                    tracing::error!("{msg}");
                    2
                }
                Err(CliError::Engine(e)) => {
                    tracing::error!("{e}");
                    1
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("cancelled");
            130
        }
    };
    std::process::exit(exit_code);
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "deployer=info",
        1 => "deployer=debug",
        _ => "deployer=trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

enum CliError {
    Validation(String),
    Engine(Error),
}

impl From<Error> for CliError {
    fn from(e: Error) -> Self {
        match e.kind() {
            ErrorKind::Invocation => CliError::Validation(e.to_string()),
            _ => CliError::Engine(e),
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = Arc::new(
        EngineConfig::load(cli.config.as_deref())
            .map_err(|e| CliError::Validation(format!("failed to load config: {e}")))?,
    );
    let max_forks = config.max_forks;
    let known_hosts = cli.known_hosts.clone();
    let playbooks_dir = cli.playbooks_dir.clone();

    match cli.command {
        Command::Deploy { server, site, php_path } => {
            let pairs = label_paths(pair_servers_and_sites(server, site)?, |(s, _)| s.as_path());
            let php_path = Arc::new(php_path);
            fan_out(pairs, max_forks, move |(server_path, site_path)| {
                let config = Arc::clone(&config);
                let known_hosts = known_hosts.clone();
                let php_path = Arc::clone(&php_path);
                async move {
                    let server = load_json::<Server>(&server_path)?;
                    let site = load_json::<Site>(&site_path)?;
                    let connection = connect(&server, &config, known_hosts.as_deref()).await?;
                    let options = deployer::deploy::DeployOptions {
                        php_path: (*php_path).clone(),
                        timeout: config.connection.playbook_timeout,
                    };
                    let result = deployer::deploy::deploy(
                        connection.as_ref(),
                        &site,
                        &options,
                        &CliProgress,
                    )
                    .await?;
                    for warning in &result.warnings {
                        tracing::warn!(server = %server_path.display(), "{warning}");
                    }
                    println!(
                        "server={} status=success domain={} branch={} releaseName={} releasePath={} currentPath={} keepReleases={}",
                        server_path.display(),
                        result.domain,
                        result.branch,
                        result.release_name,
                        result.release_path,
                        result.current_path,
                        result.keep_releases,
                    );
                    Ok(())
                }
            })
            .await
        }
        Command::RunPlaybook { server, playbook, distro, perms, env, stream } => {
            let playbook = Arc::new(playbook);
            let distro = Arc::new(distro);
            let perms = Arc::new(perms);
            let env = Arc::new(env);
            let mode = if stream {
                InvocationMode::Streaming
            } else {
                InvocationMode::Silent
            };
            let server = label_paths(server, |s| s.as_path());
            fan_out(server, max_forks, move |server_path| {
                let config = Arc::clone(&config);
                let known_hosts = known_hosts.clone();
                let playbooks_dir = playbooks_dir.clone();
                let playbook = Arc::clone(&playbook);
                let distro = Arc::clone(&distro);
                let perms = Arc::clone(&perms);
                let env = Arc::clone(&env);
                async move {
                    let server = load_json::<Server>(&server_path)?;
                    let connection = connect(&server, &config, known_hosts.as_deref()).await?;
                    let source = DirPlaybookSource::new(playbooks_dir);
                    let mut invocation_env: HashMap<String, String> = (*env).clone().into_iter().collect();
                    invocation_env.insert("DEPLOYER_DISTRO".to_string(), (*distro).clone());
                    invocation_env.insert("DEPLOYER_PERMS".to_string(), (*perms).clone());
                    let report = deployer::exec::run_playbook(
                        connection.as_ref(),
                        &source,
                        &playbook,
                        &invocation_env,
                        config.connection.playbook_timeout,
                        mode,
                        &CliProgress,
                    )
                    .await?;
                    println!(
                        "server={} exitCode={} status={:?}",
                        server_path.display(),
                        report.remote_exit_code,
                        report.output.status
                    );
                    Ok(())
                }
            })
            .await
        }
        Command::ServerInfo { server, distro, perms } => {
            let distro = Arc::new(distro);
            let perms = Arc::new(perms);
            let server = label_paths(server, |s| s.as_path());
            fan_out(server, max_forks, move |server_path| {
                let config = Arc::clone(&config);
                let known_hosts = known_hosts.clone();
                let playbooks_dir = playbooks_dir.clone();
                let distro = Arc::clone(&distro);
                let perms = Arc::clone(&perms);
                async move {
                    let server = load_json::<Server>(&server_path)?;
                    let connection = connect(&server, &config, known_hosts.as_deref()).await?;
                    let source = DirPlaybookSource::new(playbooks_dir);
                    let info = deployer::serverinfo::gather(
                        connection.as_ref(),
                        &source,
                        &distro,
                        &perms,
                        config.connection.playbook_timeout,
                    )
                    .await?;
                    println!("server={}\n{info:#?}", server_path.display());
                    Ok(())
                }
            })
            .await
        }
        Command::SyncCrons { server, site } => {
            let pairs = label_paths(pair_servers_and_sites(server, site)?, |(s, _)| s.as_path());
            fan_out(pairs, max_forks, move |(server_path, site_path)| {
                let config = Arc::clone(&config);
                let known_hosts = known_hosts.clone();
                async move {
                    let server = load_json::<Server>(&server_path)?;
                    let site = load_json::<Site>(&site_path)?;
                    let connection = connect(&server, &config, known_hosts.as_deref()).await?;
                    let warnings = deployer::sync::cron::sync(
                        connection.as_ref(),
                        &site,
                        config.connection.command_timeout,
                        &CliProgress,
                    )
                    .await?;
                    for warning in &warnings {
                        tracing::warn!(server = %server_path.display(), "{warning}");
                    }
                    Ok(())
                }
            })
            .await
        }
        Command::SyncSupervisors { server, site } => {
            let pairs = label_paths(pair_servers_and_sites(server, site)?, |(s, _)| s.as_path());
            fan_out(pairs, max_forks, move |(server_path, site_path)| {
                let config = Arc::clone(&config);
                let known_hosts = known_hosts.clone();
                async move {
                    let server = load_json::<Server>(&server_path)?;
                    let site = load_json::<Site>(&site_path)?;
                    let connection = connect(&server, &config, known_hosts.as_deref()).await?;
                    let warnings = deployer::sync::supervisor::sync(
                        connection.as_ref(),
                        &site,
                        config.connection.command_timeout,
                        &CliProgress,
                    )
                    .await?;
                    for warning in &warnings {
                        tracing::warn!(server = %server_path.display(), "{warning}");
                    }
                    Ok(())
                }
            })
            .await
        }
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Result<T, CliError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CliError::Validation(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| CliError::Validation(format!("failed to parse {}: {e}", path.display())))
}

#[cfg(feature = "russh")]
async fn connect(
    server: &Server,
    config: &EngineConfig,
    known_hosts_path: Option<&std::path::Path>,
) -> Result<Arc<dyn Connection>, CliError> {
    let host_config = HostConfig::from_server(server, &config.connection);
    let default_path = dirs_home().join(".ssh/known_hosts");
    let known_hosts_path = known_hosts_path.unwrap_or(&default_path);
    let known_hosts = Arc::new(KnownHosts::new(Some(known_hosts_path.to_path_buf())));
    let connection = deployer::connection::russh::RusshConnection::connect(&host_config, known_hosts)
        .await?;
    Ok(Arc::new(connection))
}

#[cfg(not(feature = "russh"))]
async fn connect(
    _server: &Server,
    _config: &EngineConfig,
    _known_hosts_path: Option<&std::path::Path>,
) -> Result<Arc<dyn Connection>, CliError> {
    Err(CliError::Validation(
        "this binary was built without the 'russh' transport feature".to_string(),
    ))
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
}
