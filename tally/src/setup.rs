use anyhow::Result;
use tally_config::Config;
use tally_metrics::MetricKind;
use tally_statsd::MetricsConfig;

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    tally_log::info!(
        "launching tally from config folder {}",
        config.path().display()
    );

    let engine = config.engine();
    tally_log::info!("  log level: {}", config.logging().level);
    tally_log::info!("  period: {}ms", engine.period_ms);
    tally_log::info!("  dialect: {:?}", engine.dialect);

    for kind in MetricKind::ALL {
        let settings = engine.type_settings(kind);
        if settings.enable {
            tally_log::info!(
                "  {kind}: {} threads, {} buckets",
                settings.threads,
                settings.hash_size
            );
        } else {
            tally_log::info!("  {kind}: disabled");
        }
    }

    let synths = engine.synths.iter().filter(|s| s.enable).count();
    if synths > 0 {
        tally_log::info!("  synthetics: {synths}");
    }
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) -> Result<()> {
    let Some(host) = config.statsd_addr() else {
        return Ok(());
    };

    let mut default_tags = config.metrics_default_tags().clone();
    if let Some(hostname_tag) = config.metrics_hostname_tag()
        && let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok())
    {
        default_tags.insert(hostname_tag.to_owned(), hostname);
    }
    tally_statsd::init(MetricsConfig {
        prefix: config.metrics_prefix().to_owned(),
        host: host.to_owned(),
        buffer_size: None,
        default_tags,
    })?;

    Ok(())
}
