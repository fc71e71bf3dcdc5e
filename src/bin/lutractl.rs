use std::{path::PathBuf, process};

use chrono::DateTime;
use clap::{Parser, Subcommand};
use nix::unistd::Uid;

use lutrainit::{
    constants::CONTROL_SOCKET_PATH,
    ipc::{self, ControlRequest, ControlResponse},
};

/// Control client for the lutra init daemon.
#[derive(Parser)]
#[command(name = "lutractl", version, author)]
#[command(about = "lutra init control client", long_about = None)]
struct Cli {
    /// Control socket of the init daemon.
    #[arg(long, value_name = "PATH", default_value = CONTROL_SOCKET_PATH, global = true)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the init daemon version.
    Version,

    /// Show init daemon runtime statistics.
    Stats,

    /// Show the status of one service, or of every known service.
    Status {
        /// Service to show. All services when omitted.
        name: Option<String>,
    },

    /// Start a service.
    Start {
        /// Service to start.
        name: String,
    },

    /// Stop a service.
    Stop {
        /// Service to stop.
        name: String,
    },

    /// Stop then start a service.
    Restart {
        /// Service to restart.
        name: String,
    },

    /// Reload the init daemon configuration.
    Reload,

    /// Re-exec the init daemon image, keeping services running.
    Reexec,

    /// Power off the machine.
    #[command(alias = "halt")]
    Shutdown,

    /// Reboot the machine.
    Reboot,
}

fn main() {
    let cli = Cli::parse();
    process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let destructive = !matches!(
        cli.command,
        Commands::Version | Commands::Stats | Commands::Status { .. }
    );
    if destructive && !Uid::effective().is_root() {
        eprintln!("only root can do that");
        return 1;
    }

    match cli.command {
        Commands::Version => match send(&cli.socket, &ControlRequest::Version)
        {
            Ok(ControlResponse::Version(info)) => {
                println!("server version: {}", info.version);
                println!("build time:     {}", info.build_time);
                println!("build commit:   {}", info.build_commit);
                println!("protocol:       {}", info.protocol);
                0
            }
            Ok(other) => unexpected(other),
            Err(code) => code,
        },
        Commands::Stats => match send(&cli.socket, &ControlRequest::Stats) {
            Ok(ControlResponse::Stats(stats)) => {
                println!("uptime:            {}", stats.uptime);
                println!("threads:           {}", stats.threads);
                println!("memory (resident): {}", stats.mem_resident);
                println!("memory (virtual):  {}", stats.mem_virtual);
                println!("system memory:     {}", stats.sys_mem_total);
                println!("system available:  {}", stats.sys_mem_available);
                println!("load average:      {}", stats.load_average);
                0
            }
            Ok(other) => unexpected(other),
            Err(code) => code,
        },
        Commands::Status { name } => {
            let request = ControlRequest::Status {
                name: name.clone(),
                all: name.is_none(),
            };
            match send(&cli.socket, &request) {
                Ok(ControlResponse::Status(services)) => {
                    if services.is_empty() {
                        if let Some(name) = name {
                            eprintln!("unknown service: {name}");
                            return 1;
                        }
                        println!("no services loaded");
                        return 0;
                    }
                    print_status(services);
                    0
                }
                Ok(other) => unexpected(other),
                Err(code) => code,
            }
        }
        Commands::Start { name } => action(&cli.socket, start_request(&name)),
        Commands::Stop { name } => action(&cli.socket, stop_request(&name)),
        Commands::Restart { name } => {
            // Client-side restart: a failed stop is reported but does not
            // block the start of a service that was already down.
            let stop_code = action(&cli.socket, stop_request(&name));
            if stop_code != 0 {
                eprintln!("continuing to start '{name}' despite failed stop");
            }
            action(&cli.socket, start_request(&name))
        }
        Commands::Reload => match send(&cli.socket, &ControlRequest::Reload) {
            Ok(ControlResponse::Reload(reply)) => {
                if reply.err {
                    eprintln!("reload failed: {}", reply.err_str);
                    1
                } else {
                    println!("configuration reloaded");
                    0
                }
            }
            Ok(other) => unexpected(other),
            Err(code) => code,
        },
        Commands::Reexec => acknowledge(&cli.socket, &ControlRequest::Reexec),
        Commands::Shutdown => {
            acknowledge(&cli.socket, &ControlRequest::Shutdown { reboot: false })
        }
        Commands::Reboot => {
            acknowledge(&cli.socket, &ControlRequest::Shutdown { reboot: true })
        }
    }
}

fn start_request(name: &str) -> ControlRequest {
    ControlRequest::Start {
        name: name.to_string(),
    }
}

fn stop_request(name: &str) -> ControlRequest {
    ControlRequest::Stop {
        name: name.to_string(),
    }
}

/// Sends a request, mapping transport errors to an exit code.
fn send(
    socket: &PathBuf,
    request: &ControlRequest,
) -> Result<ControlResponse, i32> {
    ipc::send_request(socket, request).map_err(|err| {
        eprintln!("{err}");
        1
    })
}

/// Runs a start/stop request and reports the structured outcome.
fn action(socket: &PathBuf, request: ControlRequest) -> i32 {
    match send(socket, &request) {
        Ok(ControlResponse::Action(reply)) => {
            if reply.err {
                eprintln!("{} of '{}' failed: {}", reply.action, reply.name, reply.err_str);
                1
            } else {
                println!("{}: {} done", reply.name, reply.action);
                0
            }
        }
        Ok(other) => unexpected(other),
        Err(code) => code,
    }
}

/// Sends a request whose only success reply is a bare acknowledgement.
fn acknowledge(socket: &PathBuf, request: &ControlRequest) -> i32 {
    match send(socket, request) {
        Ok(ControlResponse::Ok) => {
            println!("request accepted");
            0
        }
        Ok(other) => unexpected(other),
        Err(code) => code,
    }
}

fn unexpected(response: ControlResponse) -> i32 {
    eprintln!("unexpected reply from the init daemon: {response:?}");
    1
}

fn print_status(services: std::collections::HashMap<String, ipc::ServiceView>) {
    let mut names: Vec<&String> = services.keys().collect();
    names.sort();

    println!(
        "{:<30} {:<8} {:<12} {:<8} {:<12} {:<20} {}",
        "NAME", "TYPE", "STATE", "PID", "LAST ACTION", "WHEN", "MESSAGE"
    );
    for name in names {
        let view = &services[name];
        let display_name = if view.deleted {
            format!("{} (deleted)", view.name)
        } else {
            view.name.clone()
        };
        println!(
            "{:<30} {:<8} {:<12} {:<8} {:<12} {:<20} {}",
            display_name,
            view.kind,
            view.state,
            view.last_known_pid,
            view.last_action,
            format_timestamp(view.last_action_at),
            view.last_message
        );
    }
}

fn format_timestamp(seconds: i64) -> String {
    DateTime::from_timestamp(seconds, 0)
        .map(|when| when.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}
