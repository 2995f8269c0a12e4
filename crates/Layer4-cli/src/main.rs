//! labterm CLI - Main entry point

mod cli;

use clap::{Parser, Subcommand};
use labterm_foundation::{EngineKind, SessionMode};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// labterm - ephemeral containerized terminal sessions
#[derive(Parser, Debug)]
#[command(name = "labterm")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Extra config file, applied after the global and project files
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket/HTTP server
    Serve {
        /// Override `server.bind`
        #[arg(long)]
        bind: Option<String>,

        /// Container engine: docker or host
        #[arg(long, value_parser = parse_engine)]
        engine: Option<EngineKind>,
    },
    /// Run one command in a transient container and print its output
    Exec {
        command: String,

        /// Owner the transient container is labelled with
        #[arg(long, default_value = "cli")]
        owner: String,

        #[arg(long, default_value = "isolated-readonly")]
        mode: SessionMode,

        /// Seconds before the command is killed
        #[arg(long)]
        timeout: Option<u64>,

        #[arg(long, value_parser = parse_engine)]
        engine: Option<EngineKind>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a command against the policy without running it
    Check {
        command: String,

        #[arg(long, default_value = "isolated-readonly")]
        mode: SessionMode,
    },
    /// One reaper sweep. With no server attached every managed container is orphaned.
    Reap {
        /// Only list managed containers
        #[arg(long)]
        dry_run: bool,

        #[arg(long, value_parser = parse_engine)]
        engine: Option<EngineKind>,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn parse_engine(s: &str) -> Result<EngineKind, String> {
    match s {
        "docker" => Ok(EngineKind::Docker),
        "host" => Ok(EngineKind::Host),
        other => Err(format!("unknown engine '{}' (docker or host)", other)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = cli::load_config(args.config.as_deref())?;

    match args.command {
        Command::Serve { bind, engine } => cli::serve(config, bind, engine).await,
        Command::Exec {
            command,
            owner,
            mode,
            timeout,
            engine,
            json,
        } => {
            let code = cli::exec(config, engine, &owner, &command, mode, timeout, json).await?;
            std::process::exit(code);
        }
        Command::Check { command, mode } => {
            if !cli::check(&config, &command, mode)? {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Reap { dry_run, engine } => cli::reap(config, engine, dry_run).await,
        Command::Config => cli::print_config(&config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exec() {
        let args = Args::try_parse_from([
            "labterm", "exec", "echo hi", "--mode", "privileged", "--timeout", "5", "--engine", "host",
        ])
        .unwrap();
        match args.command {
            Command::Exec {
                command,
                mode,
                timeout,
                engine,
                owner,
                ..
            } => {
                assert_eq!(command, "echo hi");
                assert_eq!(mode, SessionMode::Privileged);
                assert_eq!(timeout, Some(5));
                assert_eq!(engine, Some(EngineKind::Host));
                assert_eq!(owner, "cli");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from(["labterm", "config", "--log-level", "debug"]).unwrap();
        assert_eq!(args.log_level, "debug");
        assert!(matches!(args.command, Command::Config));
    }

    #[test]
    fn test_unknown_engine_rejected() {
        assert!(Args::try_parse_from(["labterm", "serve", "--engine", "podman"]).is_err());
    }
}
