//! Drover - local process supervisor.
//!
//! `drover daemon` runs the supervisor in the foreground. Every other
//! subcommand is a client of its control socket; all of them except `alive`
//! and `exit` start a detached daemon first when none is running.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drover_core::{
    ControlClient, ControlCommand, ControlServer, DroverError, LaunchSpec, StatePaths, Supervisor,
    SupervisorOptions,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(about = "Local process supervisor")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Supervisor state directory (defaults to $DROVER_HOME or ~/.drover)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor in the foreground
    Daemon,
    /// Start the program in a directory
    Start { dir: PathBuf },
    /// Stop a running program
    Stop { dir: PathBuf },
    /// Replace every worker of a program
    Restart { dir: PathBuf },
    /// Same as restart, counted separately
    Reload { dir: PathBuf },
    /// Show running programs (all when no directory is given)
    Status { dirs: Vec<PathBuf> },
    /// Check whether the supervisor is running
    Alive,
    /// Shut the supervisor down, keeping the program table for next boot
    Exit,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.debug);

    let paths = match args.home {
        Some(home) => StatePaths::new(absolute(&home)?),
        None => StatePaths::default_location()?,
    };

    let (command, launch) = match args.command {
        Command::Daemon => {
            run_daemon(paths).await?;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Start { dir } => (ControlCommand::Start(absolute(&dir)?), true),
        Command::Stop { dir } => (ControlCommand::Stop(absolute(&dir)?), true),
        Command::Restart { dir } => (ControlCommand::Restart(absolute(&dir)?), true),
        Command::Reload { dir } => (ControlCommand::Reload(absolute(&dir)?), true),
        Command::Status { dirs } => {
            let dirs = dirs
                .iter()
                .map(|dir| absolute(dir))
                .collect::<Result<Vec<_>>>()?;
            (ControlCommand::Status(dirs), true)
        }
        Command::Alive => (ControlCommand::Alive, false),
        Command::Exit => (ControlCommand::Exit, false),
    };

    run_client(&paths, command, launch).await
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Could not determine the current directory")?;
    Ok(cwd.join(path))
}

async fn run_client(paths: &StatePaths, command: ControlCommand, launch: bool) -> Result<ExitCode> {
    let client = ControlClient::new(paths.socket());
    let response = if launch {
        client
            .send_or_launch(&command, &LaunchSpec::daemon(paths)?)
            .await
    } else {
        client.send(&command).await
    };

    let response = match response {
        Ok(response) => response,
        Err(e @ DroverError::SupervisorUnavailable { .. }) => {
            eprintln!("{}", e);
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    };

    if response.is_ok() {
        println!("{}", serde_json::to_string_pretty(&response.msg)?);
        Ok(ExitCode::SUCCESS)
    } else {
        let message = response
            .msg
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| response.msg.to_string());
        eprintln!("Error ({}): {}", response.code, message);
        Ok(ExitCode::FAILURE)
    }
}

async fn run_daemon(paths: StatePaths) -> Result<()> {
    std::fs::create_dir_all(paths.root())
        .with_context(|| format!("Could not create {}", paths.root().display()))?;
    info!("Starting supervisor in {}", paths.root().display());

    let mut supervisor = Supervisor::new(SupervisorOptions::new(paths.clone()));
    let handle = supervisor.handle();

    // Fails while another supervisor owns the socket, before anything is replayed.
    let server = ControlServer::start(paths.socket(), Arc::new(handle.clone())).await?;
    std::fs::write(paths.pid_file(), std::process::id().to_string())
        .with_context(|| format!("Could not write {}", paths.pid_file().display()))?;

    let resumed = supervisor.resume_jobs();
    if resumed > 0 {
        info!("Resumed {} programs", resumed);
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut run = tokio::spawn(supervisor.run());
    let finished = tokio::select! {
        result = &mut run => {
            result?;
            true
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            false
        }
        _ = sigterm.recv() => {
            info!("Terminated, shutting down");
            false
        }
    };
    if !finished {
        if let Err(e) = handle.shutdown() {
            warn!("Supervisor already stopped: {}", e);
        }
        run.await?;
    }

    server.drain().await;
    if let Err(e) = std::fs::remove_file(paths.pid_file()) {
        warn!("Could not remove {}: {}", paths.pid_file().display(), e);
    }
    info!("Supervisor exited");
    Ok(())
}
