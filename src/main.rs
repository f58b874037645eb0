use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{ArgAction, Parser, Subcommand};

use pipex::config::{self, Config};
use pipex::exec::{Executor, Pipeline, PipelineError};
use pipex::{logging, probe};

#[derive(Debug, Parser)]
#[command(name = "pipex", version, about = "Run process pipelines without a shell")]
struct Cli {
    /// Config file [default: ./.pipexrc when present]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Pipeline deadline in seconds; 0 disables it
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Print the full execution result as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Remove newlines and surrounding whitespace from the output
    #[arg(long, global = true)]
    tidy: bool,

    /// More log output (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run stages given as one command line per argument
    Run {
        #[arg(required = true)]
        stages: Vec<String>,
    },
    /// Run a pipeline defined in the config file
    Named { name: String },
    /// Print the address of a network interface
    Ip {
        #[arg(long)]
        interface: Option<String>,
    },
    /// Print the pid of the first process with this command name
    Pid { name: String },
    /// Send SIGTERM to the first process with this command name
    Kill { name: String },
    /// Report whether a program is on PATH
    Installed { program: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => ExitCode::from(report_error(&e)),
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = load_config(cli.config.as_deref())?;
    let mut executor = cfg.executor();
    if let Some(secs) = cli.timeout {
        executor = executor.timeout((secs > 0).then(|| Duration::from_secs(secs)));
    }
    forward_interrupts(&executor);
    let output = OutputMode {
        json: cli.json,
        tidy: cli.tidy,
    };

    match cli.command {
        Cmd::Run { stages } => {
            let pipeline = Pipeline::parse(&stages)?;
            output.run(&executor, &pipeline)
        }
        Cmd::Named { name } => {
            let Some(pipeline) = cfg.pipeline(&name)? else {
                bail!("no pipeline named `{name}` in config");
            };
            output.run(&executor, &pipeline)
        }
        Cmd::Ip { interface } => {
            let interface = interface.unwrap_or_else(|| cfg.interface.clone());
            match probe::current_ip(&executor, &interface)? {
                Some(ip) => found(&ip),
                None => missing(&format!("no address on {interface}")),
            }
        }
        Cmd::Pid { name } => match probe::find_process(&executor, &name)? {
            Some(pid) => found(&pid.to_string()),
            None => missing(&format!("no process named {name}")),
        },
        Cmd::Kill { name } => {
            if probe::kill_process(&executor, &name)? {
                Ok(ExitCode::SUCCESS)
            } else {
                missing(&format!("no process named {name}"))
            }
        }
        Cmd::Installed { program } => {
            if probe::is_installed(&executor, &program)? {
                found("yes")
            } else {
                println!("no");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

/// Turn SIGINT, SIGTERM and SIGHUP into cancellation, so the running stages
/// are stopped and reaped before `pipex` exits. The stages live in their own
/// process group and never see the terminal's Ctrl-C themselves.
fn forward_interrupts(executor: &Executor) {
    let cancel = executor.cancel_handle();
    if let Err(err) = ctrlc::set_handler(move || cancel.cancel()) {
        tracing::warn!(error = %err, "failed to install signal handler");
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_file(path),
        None => config::load(&std::env::current_dir()?),
    }
}

fn found(value: &str) -> Result<ExitCode> {
    println!("{value}");
    Ok(ExitCode::SUCCESS)
}

fn missing(message: &str) -> Result<ExitCode> {
    eprintln!("pipex: {message}");
    Ok(ExitCode::FAILURE)
}

/// Print an error, including whatever the stages wrote to stderr, and pick
/// the process exit code.
fn report_error(e: &anyhow::Error) -> u8 {
    let Some(err) = e.downcast_ref::<PipelineError>() else {
        eprintln!("pipex: {e:#}");
        return 2;
    };
    if let Some(stderr) = err.stderr() {
        let _ = io::stderr().write_all(stderr);
    }
    eprintln!("pipex: {err}");
    u8::try_from(err.exit_code()).unwrap_or(1)
}

struct OutputMode {
    json: bool,
    tidy: bool,
}

impl OutputMode {
    fn run(&self, executor: &Executor, pipeline: &Pipeline) -> Result<ExitCode> {
        let result = if self.json || self.tidy {
            executor.run(pipeline)?
        } else {
            let mut stdout = io::stdout();
            let result = executor.run_into(pipeline, &mut stdout)?;
            stdout.flush()?;
            result
        };

        if self.json {
            let mut stdout = io::stdout().lock();
            serde_json::to_writer_pretty(&mut stdout, &result)?;
            writeln!(stdout)?;
            let code = result.check().map_or_else(|e| e.exit_code(), |_| 0);
            return Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)));
        }
        if self.tidy {
            println!("{}", probe::tidy_output(&result.stdout));
        }
        result.check()?;
        Ok(ExitCode::SUCCESS)
    }
}
