//! Command line entry point.
//!
//! `start` creates the sentinel and reports one transaction spanning its
//! lifetime; `stop` removes the sentinel, letting a running `start` finish.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sentinel_hook::flag::WatchBackend;
use sentinel_hook::hook::{HookRunner, JobContext, StartOptions, TracingReporter, UnknownStatus};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

#[derive(Parser, Debug)]
#[command(name = "sentinel-hook", version, about = "Sentinel file lifecycle hook")]
struct Cli {
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    debug: bool,

    /// Flag file whose creation and removal bound the transaction.
    #[arg(short, long, global = true, default_value = "./sentinel-hook.flag")]
    flag: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the flag and report a transaction until it is removed.
    Start(StartArgs),
    /// Remove the flag, ending a running `start`.
    Stop,
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Repository (`owner/name`).
    #[arg(short, long, env = "GITHUB_REPOSITORY")]
    repo: String,

    /// Workflow name.
    #[arg(short, long, env = "GITHUB_WORKFLOW")]
    workflow: String,

    /// Job id.
    #[arg(short, long, env = "GITHUB_JOB")]
    job: String,

    /// Head branch.
    #[arg(short, long, env = "GITHUB_HEAD_REF")]
    branch: String,

    #[arg(long, env = "RUNNER_NAME", default_value = "", hide = true)]
    runner: String,

    #[arg(long, env = "GITHUB_ACTOR", default_value = "", hide = true)]
    actor: String,

    #[arg(long, env = "GITHUB_TRIGGERING_ACTOR", default_value = "", hide = true)]
    triggering_actor: String,

    #[arg(long, env = "GITHUB_RUN_NUMBER", default_value = "", hide = true)]
    run_number: String,

    #[arg(long, env = "GITHUB_RUN_ID", default_value = "", hide = true)]
    run_id: String,

    /// Milliseconds between reconciliation checks of the flag.
    #[arg(long, default_value_t = 200, value_parser = clap::value_parser!(u64).range(1..))]
    reconcile_ms: u64,

    /// Poll the directory every N milliseconds instead of using native
    /// notifications.
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Seconds allowed for flushing the transaction before exit.
    #[arg(long, default_value_t = 60)]
    shutdown_timeout_secs: u64,
}

impl StartArgs {
    fn into_options(self, flag: PathBuf) -> StartOptions {
        let context = JobContext {
            repo: self.repo,
            workflow: self.workflow,
            job: self.job,
            branch: self.branch,
            runner: self.runner,
            actor: self.actor,
            triggering_actor: self.triggering_actor,
            run_number: self.run_number,
            run_id: self.run_id,
        };

        let mut options = StartOptions::new(flag, context);
        options.reconcile_interval = Duration::from_millis(self.reconcile_ms);
        options.shutdown_timeout = Duration::from_secs(self.shutdown_timeout_secs);
        if let Some(poll_ms) = self.poll_ms {
            options.backend = WatchBackend::Poll(Duration::from_millis(poll_ms));
        }
        options
    }
}

fn init_tracing(debug: bool) -> Result<()> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    if debug {
        filter = filter.add_directive("sentinel_hook=debug".parse()?);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug)?;
    tracing::debug!("Running {:?}", cli.command);

    let runner = HookRunner::new(TracingReporter::new(), UnknownStatus);

    match cli.command {
        Command::Start(args) => {
            let options = args.into_options(cli.flag.clone());
            let status = runner
                .run_start(options)
                .await
                .with_context(|| format!("hook on {} failed", cli.flag.display()))?;
            tracing::info!("Done ({})", status);
        }
        Command::Stop => {
            runner
                .run_stop(&cli.flag)
                .with_context(|| format!("could not remove {}", cli.flag.display()))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: [&str; 9] = [
        "sentinel-hook",
        "start",
        "--repo",
        "acme/widgets",
        "--workflow",
        "CI",
        "--job",
        "build",
        "--branch=main",
    ];

    #[test]
    fn test_start_defaults() {
        let cli = Cli::try_parse_from(JOB).unwrap();
        let Command::Start(args) = cli.command else {
            panic!("expected start");
        };
        let options = args.into_options(cli.flag);
        assert_eq!(options.reconcile_interval, Duration::from_millis(200));
        assert_eq!(options.backend, WatchBackend::Native);
        assert_eq!(options.context.transaction_name(), "CI / build");
    }

    #[test]
    fn test_zero_reconcile_interval_rejected() {
        let args = JOB.iter().copied().chain(["--reconcile-ms", "0"]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn test_stop_takes_global_flag() {
        let cli = Cli::try_parse_from(["sentinel-hook", "stop", "--flag", "/tmp/x.flag"]).unwrap();
        assert!(matches!(cli.command, Command::Stop));
        assert_eq!(cli.flag, PathBuf::from("/tmp/x.flag"));
    }
}
