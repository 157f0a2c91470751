//! herd - group daemon and client
//!
//! Usage:
//!   herd daemon
//!   herd run -n 2 alpha beta -- hello world
//!   herd status alpha beta
//!   herd --config herd.toml reset
//!   herd --port 9000 config

use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use herd::{workload, Client, Daemon};
use herd_config::{read_host_file, HerdConfig};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "herd")]
#[command(about = "Assemble daemons into a group and run workloads on it")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port daemons listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Write log lines to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a daemon on the configured port
    Daemon {
        /// Name announced to peers instead of the host name
        #[arg(long)]
        name: Option<String>,
    },

    /// Enslave hosts, run ARGV on the group and print its output
    Run {
        /// Data channels between every pair of daemons
        #[arg(short = 'n', long)]
        channels: Option<usize>,

        /// File with one host per line
        #[arg(short = 'f', long)]
        host_file: Option<PathBuf>,

        /// Initial data segment handed to every worker; repeatable
        #[arg(short = 'd', long = "init-data")]
        init_data: Vec<String>,

        /// Daemons to enslave, as host or host:port
        hosts: Vec<String>,

        /// Workload name and its arguments
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },

    /// Print each daemon's status
    Status { hosts: Vec<String> },

    /// Ask free daemons to exit
    Shutdown { hosts: Vec<String> },

    /// Make daemons exit regardless of state
    ForceShutdown { hosts: Vec<String> },

    /// Force daemons back to free
    Reset { hosts: Vec<String> },

    /// Print the effective configuration as TOML
    Config,
}

fn main() {
    let args = Args::parse();
    let code = match execute(args) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("herd: {:#}", e);
            1
        }
    };
    process::exit(code);
}

fn execute(args: Args) -> Result<i32> {
    let mut config = HerdConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(file) = args.log_file {
        config.log.file = Some(file);
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    herd::logging::init(&config.log)?;

    match args.command {
        Command::Daemon { name } => {
            if name.is_some() {
                config.name = name;
            }
            run_daemon(&config)
        }
        Command::Run {
            channels,
            host_file,
            init_data,
            hosts,
            argv,
        } => {
            if let Some(channels) = channels {
                config.channels = channels;
                config.validate()?;
            }
            let mut hosts = hosts_or_configured(hosts, &config)?;
            if let Some(file) = host_file {
                hosts.extend(read_host_file(&file)?);
            }
            let init_data = init_data.into_iter().map(String::into_bytes).collect::<Vec<_>>();
            run_group(&config, &hosts, argv, &init_data)
        }
        Command::Status { hosts } => {
            let client = Client::from_config(&config);
            each_host(hosts_or_configured(hosts, &config)?, |host| {
                let status = client.status(host)?;
                println!("{:<24} {}", host, status);
                Ok(true)
            })
        }
        Command::Shutdown { hosts } => {
            let client = Client::from_config(&config);
            each_host(hosts_or_configured(hosts, &config)?, |host| {
                let accepted = client.shutdown(host)?;
                if !accepted {
                    warn!(%host, "Daemon is busy and refused to shut down");
                }
                Ok(accepted)
            })
        }
        Command::ForceShutdown { hosts } => {
            let client = Client::from_config(&config);
            each_host(hosts_or_configured(hosts, &config)?, |host| {
                client.force_shutdown(host)?;
                Ok(true)
            })
        }
        Command::Reset { hosts } => {
            let client = Client::from_config(&config);
            each_host(hosts_or_configured(hosts, &config)?, |host| {
                Ok(client.force_reset(host)?)
            })
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(0)
        }
    }
}

fn run_daemon(config: &HerdConfig) -> Result<i32> {
    info!("Starting herd daemon");
    let mut daemon = Daemon::new(config, Box::new(workload::main))
        .with_context(|| format!("Failed to start daemon on port {}", config.port))?;
    Ok(daemon.run())
}

fn run_group(
    config: &HerdConfig,
    hosts: &[String],
    argv: Vec<String>,
    init_data: &[Vec<u8>],
) -> Result<i32> {
    if hosts.is_empty() {
        bail!("no hosts given and none configured");
    }

    let mut client = Client::from_config(config);
    for host in hosts {
        let added = client
            .add(host)
            .with_context(|| format!("Failed to enslave {}", host))?;
        if !added {
            // Release whoever already answered before giving up.
            if let Err(e) = client.remove_all() {
                warn!(error = %e, "Releasing enslaved daemons failed");
            }
            bail!("{} refused to join the group", host);
        }
    }

    let argv: Vec<String> = std::iter::once("herd".to_string()).chain(argv).collect();
    let codes = client.run(&argv, init_data)?;
    info!(?codes, "Run complete");
    Ok(codes.into_iter().find(|&code| code != 0).unwrap_or(0))
}

fn hosts_or_configured(hosts: Vec<String>, config: &HerdConfig) -> Result<Vec<String>> {
    if hosts.is_empty() {
        config.resolved_hosts()
    } else {
        Ok(hosts)
    }
}

/// Apply `command` to every host; exit code 1 if any host failed or declined
fn each_host(hosts: Vec<String>, mut command: impl FnMut(&str) -> Result<bool>) -> Result<i32> {
    if hosts.is_empty() {
        bail!("no hosts given and none configured");
    }

    let mut code = 0;
    for host in &hosts {
        match command(host) {
            Ok(true) => {}
            Ok(false) => code = 1,
            Err(e) => {
                eprintln!("{}: {:#}", host, e);
                code = 1;
            }
        }
    }
    Ok(code)
}
