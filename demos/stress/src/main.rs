use anyhow::{Context, Result};
use argh::FromArgs;
use casq_stress::Config;

#[derive(Debug, FromArgs)]
/// Stress a lock-free queue with concurrent producers and consumers
#[argh(help_triggers("--help"))]
struct Args {
    /// number of producer threads
    #[argh(option, default = "2", arg_name = "int")]
    producers: usize,
    /// number of consumer threads
    #[argh(option, default = "2", arg_name = "int")]
    consumers: usize,
    /// number of items moved through the queue per round
    #[argh(option, default = "2048", arg_name = "int")]
    max_count: usize,
    /// number of rounds to run
    #[argh(option, default = "1", arg_name = "int")]
    rounds: usize,
    /// randomly yield between queue operations
    #[argh(switch)]
    jitter: bool,
}

pub fn main() -> Result<()> {
    let args = argh::from_env::<Args>();
    tracing_subscriber::fmt()
        .with_thread_names(true)
        .without_time()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config {
        producers: args.producers,
        consumers: args.consumers,
        max_count: args.max_count,
        jitter: args.jitter,
    };
    config.validate()?;

    for round in 0..args.rounds {
        let report = casq_stress::run(&config).with_context(|| format!("round {round} failed"))?;
        report
            .verify(config.max_count)
            .with_context(|| format!("round {round} is inconsistent"))?;
        tracing::info!(
            "passed round {round}, fetched={}, retries={}, elapsed={:?}",
            report.removed(),
            report.empty_retries,
            report.elapsed
        );
    }
    println!("ok");

    Ok(())
}
