// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;
use wock::{
    ca, client, daemon, etchosts, get_trust_store, hosts, Error, HostRegistry, InstallOutcome,
    Paths, Request, Response, Result, StartOutcome, UninstallOutcome,
};

// ============================================================================
// CLI definitions
// ============================================================================

#[derive(Parser)]
#[command(name = "wock")]
#[command(about = "mock web hosts")]
#[command(version)]
#[command(long_about = "\
wock - mock the web

wock is a tool for mocking a host/domain and serving all traffic
for that host locally over HTTPS, signed by a local certificate
authority your machine trusts.")]
#[command(after_help = "\
EXAMPLES:
    wock install                   # Install the local CA
    sudo wock start                # Start the daemon
    wock nytimes.com ./html        # Serve ./html as https://nytimes.com
    wock status                    # Show mocked hosts
    wock rm nytimes.com            # Stop mocking a host")]
struct Cli {
    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Show detailed output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    /// Hostname to mock
    #[arg(value_name = "HOSTNAME", requires = "directory")]
    host: Option<String>,

    /// Directory served for the hostname
    #[arg(value_name = "DIRECTORY")]
    directory: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install wock's local certificate authority
    Install,

    /// Uninstall wock's local certificate authority
    Uninstall,

    /// Start the wock daemon
    Start,

    /// Stop the wock daemon
    Stop,

    /// Check the current status of the wock daemon
    Status,

    /// Remove a currently mocked host
    Rm {
        /// Hostname to stop mocking
        hostname: String,
    },

    /// Clear all mocked hosts
    Clear,

    /// Print the daemon's logs to stdout
    Logs,

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },

    /// Daemon internals
    #[command(hide = true)]
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Run the daemon in the foreground
    Run,
}

/// Output helper respecting --quiet/--verbose
struct Output {
    quiet: bool,
    verbose: bool,
}

impl Output {
    fn new(quiet: bool, verbose: bool) -> Self {
        Self { quiet, verbose }
    }

    /// Print a message (suppressed with --quiet)
    fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    /// Print a verbose message (only shown with --verbose)
    fn verbose(&self, msg: &str) {
        if self.verbose {
            println!("{}", msg);
        }
    }
}

fn main() {
    // Reset SIGPIPE to default behavior (exit) instead of panic
    // This prevents "broken pipe" panics when output is piped to tools like grep/head
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let paths = Paths::new()?;
    let out = Output::new(cli.quiet, cli.verbose);

    match cli.command {
        Some(Commands::Install) => cmd_install(&paths, &out),
        Some(Commands::Uninstall) => cmd_uninstall(&paths, &out),
        Some(Commands::Start) => cmd_start(&paths, &out),
        Some(Commands::Stop) => cmd_stop(&paths, &out),
        Some(Commands::Status) => cmd_status(&paths),
        Some(Commands::Rm { hostname }) => cmd_rm(&paths, &hostname, &out),
        Some(Commands::Clear) => cmd_clear(&paths, &out),
        Some(Commands::Logs) => cmd_logs(&paths),
        Some(Commands::Completions { shell }) => {
            generate(shell, &mut Cli::command(), "wock", &mut std::io::stdout());
            Ok(())
        }
        Some(Commands::Daemon {
            command: DaemonCommands::Run,
        }) => daemon::run(&paths),
        None => match (cli.host, cli.directory) {
            (Some(host), Some(directory)) => cmd_mock(&paths, &host, &directory, &out),
            _ => {
                Cli::command()
                    .print_help()
                    .map_err(|e| Error::Config(format!("failed to print help: {}", e)))?;
                Ok(())
            }
        },
    }
}

// ============================================================================
// Command handlers
// ============================================================================

fn cmd_install(paths: &Paths, out: &Output) -> Result<()> {
    let store = get_trust_store();
    match ca::install(paths, store.as_ref())? {
        InstallOutcome::AlreadyInstalled => out.info("Local CA is already installed"),
        InstallOutcome::Installed => {
            out.verbose(&format!("Trust store: {}", store.name()));
            out.verbose(&format!("Root certificate: {}", paths.ca_cert.display()));
            out.info("Successfully installed/verified local CA");
        }
    }
    Ok(())
}

fn cmd_uninstall(paths: &Paths, out: &Output) -> Result<()> {
    let store = get_trust_store();
    match ca::uninstall(paths, store.as_ref())? {
        UninstallOutcome::NotInstalled => {
            // Uninstalling nothing is a no-op success, not a failure
            out.info("Local CA was not installed");
            return Ok(());
        }
        UninstallOutcome::Uninstalled => {}
    }

    // Host mappings depend on the CA: purge them everywhere
    if client::is_daemon_online(paths) {
        if let Err(e) = client::send_expect_ok(paths, &Request::Clear) {
            eprintln!("Warning: unable to clear hosts on the running daemon: {}", e);
        }
    } else if let Err(e) = etchosts::clear() {
        eprintln!("Warning: unable to clean the hosts file: {}", e);
    }
    HostRegistry::purge(paths)?;

    out.info("Successfully uninstalled local CA");
    Ok(())
}

fn cmd_start(paths: &Paths, out: &Output) -> Result<()> {
    match daemon::start(paths)? {
        StartOutcome::AlreadyOnline => out.info("Daemon is already online"),
        StartOutcome::Started => {
            out.verbose(&format!("Logs: {}", paths.log_path().display()));
            out.info("Successfully started daemon");
        }
    }
    Ok(())
}

fn cmd_stop(paths: &Paths, out: &Output) -> Result<()> {
    match client::send(paths, &Request::Stop) {
        Ok(Response::Ok) => {
            out.info("Successfully stopped daemon");
            Ok(())
        }
        Ok(Response::Err { kind, message }) => Err(Response::into_error(kind, message)),
        Ok(Response::Hosts { .. }) => Err(Error::Control("unexpected response kind".into())),
        Err(Error::DaemonOffline) => {
            out.info("Daemon is already offline");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn cmd_status(paths: &Paths) -> Result<()> {
    match client::status(paths)? {
        None => {
            println!();
            println!("wock daemon [offline]");
        }
        Some(mappings) => {
            println!();
            println!("wock daemon [online]");
            if !mappings.is_empty() {
                println!();
                let width = mappings
                    .iter()
                    .map(|m| m.host.len())
                    .max()
                    .unwrap_or(0)
                    .max("MOCKED HOST".len());
                println!("  {:<width$}   {}", "MOCKED HOST", "DIRECTORY SERVED");
                for mapping in &mappings {
                    println!(
                        "  {:<width$}   {}",
                        mapping.host,
                        mapping.directory.display()
                    );
                }
            }
        }
    }
    Ok(())
}

fn cmd_mock(paths: &Paths, host: &str, directory: &std::path::Path, out: &Output) -> Result<()> {
    // Validation failures never reach the daemon
    let host = hosts::normalize_hostname(host);
    if !hosts::is_valid_hostname(&host) {
        return Err(Error::InvalidHostname(host));
    }
    let directory = hosts::validate_directory(directory)?;

    let store = get_trust_store();
    if !ca::is_installed(paths, store.as_ref())? {
        return Err(Error::CaNotInstalled);
    }

    if !client::is_daemon_online(paths) {
        return Err(Error::DaemonOffline);
    }

    client::send_expect_ok(
        paths,
        &Request::Mock {
            host: host.clone(),
            directory: directory.clone(),
        },
    )?;

    out.info(&format!("mocking host {}", host));
    out.verbose(&format!("serving {}", directory.display()));
    Ok(())
}

fn cmd_rm(paths: &Paths, hostname: &str, out: &Output) -> Result<()> {
    let host = hosts::normalize_hostname(hostname);

    match client::send(paths, &Request::Unmock { host }) {
        Ok(Response::Ok) => Ok(()),
        Ok(Response::Err { kind, message }) => Err(Response::into_error(kind, message)),
        Ok(Response::Hosts { .. }) => Err(Error::Control("unexpected response kind".into())),
        Err(Error::DaemonOffline) => {
            out.info("Daemon is offline, no hosts to remove");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn cmd_clear(paths: &Paths, out: &Output) -> Result<()> {
    let store = get_trust_store();
    if !ca::is_installed(paths, store.as_ref())? {
        return Err(Error::CaNotInstalled);
    }

    match client::send(paths, &Request::Clear) {
        Ok(Response::Ok) => {
            out.info("Successfully cleared all hosts");
            Ok(())
        }
        Ok(Response::Err { kind, message }) => Err(Response::into_error(kind, message)),
        Ok(Response::Hosts { .. }) => Err(Error::Control("unexpected response kind".into())),
        Err(Error::DaemonOffline) => {
            out.info("Daemon is offline, no hosts to clear");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn cmd_logs(paths: &Paths) -> Result<()> {
    let log_path = paths.log_path();
    let contents = std::fs::read_to_string(&log_path).map_err(|e| Error::ReadFile {
        path: log_path,
        source: e,
    })?;
    print!("{}", contents);
    Ok(())
}
