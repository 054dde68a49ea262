use clap::Parser;
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

use hn_watch::clock::{Clock, SystemClock};
use hn_watch::config::Cli;
use hn_watch::memory::{open_backend, Memory};
use hn_watch::sink::{deliver_with_retry, EventSink, RetryPolicy, StdoutSink};
use hn_watch::{HackerNewsClient, ItemSource, UpdateEngine};

fn init_logging(verbose: u8) {
    let default = if verbose > 0 { "hn_watch=debug" } else { "hn_watch=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// One poll: detect, deliver everything, and only then commit.
fn poll_once<S: ItemSource>(
    engine: &mut UpdateEngine<S>,
    sink: &mut dyn EventSink,
    policy: &RetryPolicy,
) {
    let mut cycle = match engine.run_cycle() {
        Ok(cycle) => cycle,
        Err(e) => {
            tracing::error!(error = %e, "poll failed, will retry");
            return;
        }
    };

    for update in cycle.by_ref() {
        if let Err(e) = deliver_with_retry(sink, &update, policy, thread::sleep) {
            // Leave the cycle uncommitted so these updates are found again next time.
            tracing::error!(error = %e, id = update.record.id, "giving up on delivery");
            return;
        }
    }

    let report = cycle.commit();
    tracing::debug!(?report, "cycle committed");
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let data_dir = cli.resolve_data_dir()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let memory = Memory::open(
        open_backend(cli.backend, &data_dir),
        clock.clone(),
        cli.memory_config(),
    );
    let client = HackerNewsClient::with_options(&cli.api_base, cli.request_timeout())?;
    let mut engine = UpdateEngine::new(client, memory, clock, cli.engine_config());

    let mut sink = StdoutSink;
    let policy = cli.retry_policy();

    tracing::info!(
        data_dir = %data_dir.display(),
        backend = ?cli.backend,
        interval = ?cli.interval(),
        "hn_watch started"
    );

    loop {
        poll_once(&mut engine, &mut sink, &policy);
        if cli.once {
            return Ok(());
        }
        thread::sleep(cli.interval());
    }
}
