//! jobward — entry point.
//!
//! `run` drives one job through an in-process engine and exits with the
//! job's exit code. `check` inspects the configured cgroup base. The hidden
//! `_init` subcommand is the second stage of every launch and is never
//! invoked by hand.

use std::io::Write;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use jobward::cgroup::CgroupController;
use jobward::config::Config;
use jobward::error::Error;
use jobward::job::{JobLimits, JobSpec, JobStatus};
use jobward::schema::{CheckData, ErrorResponse, JobView, Response, RunData};
use jobward::service::{JobService, Role};

#[derive(Debug, Parser)]
#[command(name = "jobward")]
#[command(about = "Isolated job execution engine", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one command as a supervised job and exit with its exit code.
    Run {
        /// Path to the config file.
        #[arg(long)]
        config: Option<String>,

        /// CPU limit in percent of one core (0 = configured default).
        #[arg(long, default_value = "0")]
        cpu: i32,

        /// Memory limit in MiB (0 = configured default).
        #[arg(long, default_value = "0")]
        memory: i32,

        /// IO limit in bytes per second (0 = configured default).
        #[arg(long, default_value = "0")]
        io: i64,

        /// Disable namespace isolation (for unprivileged use).
        #[arg(long)]
        no_namespaces: bool,

        /// Emit a JSON summary instead of the raw output stream.
        #[arg(long)]
        json: bool,

        /// Command and arguments to run.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Report whether the configured cgroup base is usable.
    Check {
        /// Path to the config file.
        #[arg(long)]
        config: Option<String>,
    },

    /// [Internal] Init-mode second stage of a launch — not for direct use.
    #[command(name = "_init", hide = true)]
    InitMode,
}

fn main() {
    let cli = Cli::parse();

    // Init mode replaces this process image; it must not touch stdout or
    // stderr (both belong to the job) and needs no subscriber.
    if matches!(cli.command, Command::InitMode) {
        jobward::init::execute();
    }

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // Logs always go to stderr so stdout stays available for job output and
    // JSON.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let json_mode = matches!(
        cli.command,
        Command::Run { json: true, .. } | Command::Check { .. }
    );
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            if json_mode {
                match e.downcast_ref::<Error>() {
                    Some(err) => ErrorResponse::from_error(err).print(),
                    None => ErrorResponse::from_error(&Error::internal(format!("{e:#}"))).print(),
                }
            } else {
                eprintln!("jobward: {e:#}");
            }
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            config,
            cpu,
            memory,
            io,
            no_namespaces,
            json,
            command,
        } => {
            let mut cfg = Config::load(config.as_deref())?;
            if no_namespaces {
                cfg.isolation.namespaces = false;
            }
            run_job(cfg, cpu, memory, io, json, command)
        }

        Command::Check { config } => {
            let cfg = Config::load(config.as_deref())?;
            let controller = CgroupController::new(&cfg.cgroup);
            let probe = controller.probe();
            Response::new(
                "check",
                CheckData { cgroups: probe },
            )
            .print();
            Ok(0)
        }

        Command::InitMode => unreachable!("handled before logging setup"),
    }
}

fn run_job(
    config: Config,
    cpu: i32,
    memory: i32,
    io: i64,
    json: bool,
    command: Vec<String>,
) -> Result<i32> {
    let mut parts = command.into_iter();
    let program = parts.next().unwrap_or_default();
    let spec = JobSpec {
        command: program,
        args: parts.collect(),
        limits: JobLimits {
            cpu_percent: cpu,
            memory_mb: memory,
            io_bytes_per_sec: io,
        },
    };

    let service = JobService::new(config);
    let job = service.create_job(Role::Admin, spec)?;
    info!(job_id = %job.id, "job created");

    let stream = service.stream_output(Role::Admin, &job.id)?;
    let mut total: u64 = 0;
    {
        let mut out = std::io::stdout().lock();
        for chunk in stream {
            total += chunk.len() as u64;
            if !json {
                out.write_all(&chunk)?;
                out.flush()?;
            }
        }
    }

    // The stream closes on the terminal update; give the store a moment in
    // the rare case the record itself is still being finalized.
    let final_job = loop {
        let j = service.get_job(Role::Admin, &job.id)?;
        if j.status.is_terminal() {
            break j;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    };

    if json {
        Response::new(
            "run",
            RunData {
                job: JobView::from_job(&final_job),
                output_bytes: total,
            },
        )
        .print();
    }

    let code = match final_job.status {
        JobStatus::Completed => 0,
        _ => final_job.exit_code.unwrap_or(1),
    };
    Ok(code)
}
