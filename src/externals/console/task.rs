use std::{io::BufRead, str::FromStr};

use thiserror::Error;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    internals::core::{dispatcher::ControlDispatcher, supervisor::SupervisorHandle},
    models::{device::InterfaceHint, status_event::StatusEvent},
};

const USAGE: &str = "Commands: + (up), - (down), r (read), i <iface> (interface), q (quit)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Up,
    Down,
    Read,
    Interface(InterfaceHint),
    Help,
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("Unknown command `{0}`.")]
    Unknown(String),
    #[error("Missing interface name, e.g. `i en0`.")]
    MissingInterface,
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = match words.next() {
            Some(command) => command.to_lowercase(),
            None => return Ok(ConsoleCommand::Read),
        };
        match command.as_str() {
            "+" | "up" => Ok(ConsoleCommand::Up),
            "-" | "down" => Ok(ConsoleCommand::Down),
            "r" | "read" => Ok(ConsoleCommand::Read),
            "i" | "interface" => words
                .next()
                .map(|name| ConsoleCommand::Interface(InterfaceHint::new(name)))
                .ok_or(ConsoleError::MissingInterface),
            "h" | "help" | "?" => Ok(ConsoleCommand::Help),
            "q" | "quit" | "exit" => Ok(ConsoleCommand::Quit),
            _ => Err(ConsoleError::Unknown(command)),
        }
    }
}

/// Forward stdin lines on a plain thread. Blocking reads would otherwise keep
/// the runtime from shutting down.
pub fn spawn_stdin_reader(tx_lines: mpsc::Sender<String>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx_lines.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from stdin. Error: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

/// Task: print status events and run commands typed by the user. Quitting,
/// or closing stdin, cancels `token`.
#[instrument(skip_all)]
pub async fn task_console(
    token: CancellationToken,
    supervisor: SupervisorHandle,
    dispatcher: ControlDispatcher,
    mut rx_status: broadcast::Receiver<StatusEvent>,
    mut rx_lines: mpsc::Receiver<String>,
) {
    info!("Started.");
    println!("{}", USAGE);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                warn!("Cancelled.");
                break;
            },
            status = rx_status.recv() => match status {
                Ok(event) => {
                    for line in describe(&event, &supervisor, &dispatcher).await {
                        println!("{}", line);
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("Missed {} status events.", missed),
                Err(RecvError::Closed) => {
                    debug!("Status channel closed.");
                    break;
                }
            },
            line = rx_lines.recv() => {
                let command = match line {
                    Some(line) => line.parse::<ConsoleCommand>(),
                    None => Ok(ConsoleCommand::Quit),
                };
                match command {
                    Ok(ConsoleCommand::Quit) => {
                        info!("Quit requested.");
                        token.cancel();
                        break;
                    }
                    Ok(command) => println!("{}", execute(command, &supervisor, &dispatcher).await),
                    Err(e) => println!("{} {}", e, USAGE),
                }
            }
        };
    }
}

/// Lines to show for a status event. A newly connected group also shows its
/// current level.
async fn describe(
    event: &StatusEvent,
    supervisor: &SupervisorHandle,
    dispatcher: &ControlDispatcher,
) -> Vec<String> {
    let mut lines = vec![event.to_string()];
    if event.is_ready() {
        lines.push(execute(ConsoleCommand::Read, supervisor, dispatcher).await);
    }
    lines
}

/// Run one command and describe the outcome for the user.
async fn execute(
    command: ConsoleCommand,
    supervisor: &SupervisorHandle,
    dispatcher: &ControlDispatcher,
) -> String {
    let outcome = match command {
        ConsoleCommand::Up => dispatcher.step_up().await,
        ConsoleCommand::Down => dispatcher.step_down().await,
        ConsoleCommand::Read => dispatcher.read().await,
        ConsoleCommand::Interface(interface) => {
            return match supervisor.change_interface(interface.clone()) {
                true => format!("Switching to {}.", interface),
                false => "Not running.".to_string(),
            };
        }
        ConsoleCommand::Help | ConsoleCommand::Quit => return USAGE.to_string(),
    };
    match outcome {
        Ok(level) => format!("Level: {}", level),
        Err(e) => {
            debug!("Command failed. Error: {}", e);
            format!("Error: {}", e)
        }
    }
}
