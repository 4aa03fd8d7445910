//! Line-oriented operator console for the orchestrator.

use super::Orchestrator;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

pub const HELP: &str = "commands: start <name|all>, stop <name|all>, restart <name>, status, help, quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Service(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start(Target),
    Stop(Target),
    Restart(String),
    Status,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or_default().to_ascii_lowercase();
        let arg = parts.next();
        if parts.next().is_some() {
            return Err(format!("too many arguments in '{}'", line.trim()));
        }
        let target = |arg: Option<&str>| match arg {
            Some("all") => Ok(Target::All),
            Some(name) => Ok(Target::Service(name.to_string())),
            None => Err(format!("'{}' needs a service name or 'all'", verb)),
        };
        match verb.as_str() {
            "start" => Ok(ConsoleCommand::Start(target(arg)?)),
            "stop" => Ok(ConsoleCommand::Stop(target(arg)?)),
            "restart" => match arg {
                Some(name) if name != "all" => Ok(ConsoleCommand::Restart(name.to_string())),
                _ => Err("'restart' needs a single service name".to_string()),
            },
            "status" | "ps" => Ok(ConsoleCommand::Status),
            "help" | "?" => Ok(ConsoleCommand::Help),
            "quit" | "exit" => Ok(ConsoleCommand::Quit),
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

pub fn render_status(orchestrator: &Orchestrator) -> String {
    let mut out = String::new();
    for status in orchestrator.status() {
        out.push_str(&format!(
            "{:<16} {:<9} pid={:<8} port={}\n",
            status.name,
            status.state.to_string(),
            status.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            status.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
        ));
    }
    out
}

/// Execute one command. Returns `false` when the console should exit.
pub async fn execute(orchestrator: &mut Orchestrator, command: ConsoleCommand) -> bool {
    let errors = match command {
        ConsoleCommand::Start(Target::All) => orchestrator.start_all().await,
        ConsoleCommand::Start(Target::Service(name)) => {
            orchestrator.start(&name).await.err().into_iter().collect()
        }
        ConsoleCommand::Stop(Target::All) => orchestrator.stop_all().await,
        ConsoleCommand::Stop(Target::Service(name)) => {
            orchestrator.stop(&name).await.err().into_iter().collect()
        }
        ConsoleCommand::Restart(name) => {
            orchestrator.restart(&name).await.err().into_iter().collect()
        }
        ConsoleCommand::Status => {
            orchestrator.refresh();
            print!("{}", render_status(orchestrator));
            Vec::new()
        }
        ConsoleCommand::Help => {
            println!("{}", HELP);
            Vec::new()
        }
        ConsoleCommand::Quit => return false,
    };
    for e in errors {
        log::error!("{}", e);
    }
    true
}

/// Read commands until `quit` or end of input.
pub async fn run<R: AsyncBufRead + Unpin>(orchestrator: &mut Orchestrator, input: R) {
    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Console input failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<ConsoleCommand>() {
            Ok(command) => {
                if !execute(orchestrator, command).await {
                    break;
                }
            }
            Err(msg) => println!("{}\n{}", msg, HELP),
        }
    }
}
