use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use clap::ArgMatches;
use clap::parser::ValueSource;
use tally_config::{Config, OverridableConfig};
use tally_metrics::{ChannelSink, Engine, IngestStats, VecSink};

use crate::cliapp::make_app;
use crate::{ingest, setup};

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = make_app();
    let matches = app.get_matches();

    if let Some(("config", sub)) = matches.subcommand()
        && let Some(("init", init)) = sub.subcommand()
    {
        return init_config(&matches, init);
    }

    let mut config = load_config(&matches)?;
    config.apply_override(extract_overrides(&matches))?;
    tally_log::init(config.logging());

    match matches.subcommand() {
        Some(("run", sub)) => run(config, sub.get_flag("once")),
        Some(("config", sub)) => manage_config(&config, sub),
        _ => unreachable!(),
    }
}

/// Loads the config from the folder given on the command line.
///
/// If the folder was not given explicitly and does not exist, the defaults are used.
fn load_config(matches: &ArgMatches) -> Result<Config> {
    let path = config_path(matches)?;
    let defaulted = matches.value_source("config") == Some(ValueSource::DefaultValue);

    if defaulted && !path.exists() {
        return Ok(Config::default_in(path));
    }

    Config::from_path(path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}

fn config_path(matches: &ArgMatches) -> Result<&Path> {
    matches
        .get_one::<String>("config")
        .map(Path::new)
        .ok_or_else(|| anyhow!("no config folder given"))
}

fn extract_overrides(matches: &ArgMatches) -> OverridableConfig {
    OverridableConfig {
        log_level: matches.get_one::<String>("log_level").cloned(),
        period_ms: matches.get_one::<String>("period_ms").cloned(),
        statsd: matches.get_one::<String>("statsd").cloned(),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Runs the aggregator on standard input until it is closed.
pub fn run(config: Config, once: bool) -> Result<()> {
    setup::dump_spawn_infos(&config);
    setup::init_metrics(&config)?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let engine = Engine::new(config.engine(), Arc::new(ChannelSink::new(tx)))
        .context("invalid engine configuration")?;
    let writer = ingest::spawn_writer(rx, io::stdout()).context("failed to spawn output thread")?;

    let (mut engine, stats) = if once {
        let stats = ingest::ingest_stream(io::stdin().lock(), &engine.ingester());
        (engine, stats)
    } else {
        let handle = engine.start().context("failed to start engine threads")?;
        let stats = ingest::ingest_stream(io::stdin().lock(), &handle.ingester());
        tally_log::info!("input closed, shutting down");
        (handle.shutdown(), stats)
    };

    // Report everything still pending before the output is closed.
    engine.tick(now_ms());
    drop(engine);

    let IngestStats { accepted, rejected } = stats.context("failed to read input")?;
    tally_log::info!(accepted, rejected, "ingestion finished");

    writer
        .join()
        .map_err(|_| anyhow!("output thread panicked"))?
        .context("failed to write output")?;

    Ok(())
}

fn init_config(matches: &ArgMatches, init: &ArgMatches) -> Result<()> {
    let path = config_path(matches)?;
    if path.join("config.yml").exists() && !init.get_flag("overwrite") {
        bail!(
            "a config already exists in {}, pass --overwrite to replace it",
            path.display()
        );
    }

    let mut config = Config::default_in(path);
    config.apply_override(extract_overrides(matches))?;
    config.save()?;

    tally_log::init(config.logging());
    tally_log::info!("wrote config to {}", path.display());
    Ok(())
}

#[allow(clippy::print_stdout)]
fn manage_config(config: &Config, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("show", sub)) => {
            match sub.get_one::<String>("format").map(String::as_str) {
                Some("debug") => println!("{config:#?}"),
                Some("yaml") => print!("{}", config.to_yaml_string()?),
                _ => unreachable!(),
            }
            Ok(())
        }
        Some(("check", sub)) => {
            let engine = Engine::new(config.engine(), Arc::new(VecSink::new()))
                .context("invalid engine configuration")?;

            if !sub.get_flag("quiet") {
                println!(
                    "config at {} is valid ({} synthetics)",
                    config.path().display(),
                    engine.synth_count()
                );
            }
            Ok(())
        }
        _ => unreachable!(),
    }
}
