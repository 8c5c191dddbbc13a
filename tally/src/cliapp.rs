//! This module implements the definition of the command line app.

use clap::builder::PossibleValuesParser;
use clap::{Arg, ArgAction, Command};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "Tally aggregates statsd and graphite style metrics.";

pub fn make_app() -> Command {
    Command::new("tally")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .long("config")
                .short('c')
                .global(true)
                .env("TALLY_CONFIG")
                .default_value(".tally")
                .help("The path to the config folder."),
        )
        .arg(
            Arg::new("log_level")
                .value_name("LEVEL")
                .long("log-level")
                .global(true)
                .env("TALLY_LOG_LEVEL")
                .help("The log level, one of error, warn, info, debug and trace."),
        )
        .arg(
            Arg::new("period_ms")
                .value_name("MILLIS")
                .long("period-ms")
                .global(true)
                .env("TALLY_PERIOD_MS")
                .help("The aggregation period in milliseconds."),
        )
        .arg(
            Arg::new("statsd")
                .value_name("HOST:PORT")
                .long("statsd")
                .global(true)
                .env("TALLY_STATSD")
                .help("Report tally's own metrics to this statsd server."),
        )
        .subcommand(
            Command::new("run")
                .about("Run the aggregator")
                .after_help(
                    "This reads statsd lines from standard input until it is closed and \
                     writes aggregated values to standard output once per period.  Points \
                     still pending when the input closes are reported in a final tick.",
                )
                .arg(
                    Arg::new("once")
                        .long("once")
                        .action(ArgAction::SetTrue)
                        .help("Read all input, report a single tick and exit"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Manage the tally config")
                .after_help(
                    "This command provides basic config management.  It can be used to \
                     initialize a new config folder, to print out the effective config \
                     and to validate it.",
                )
                .subcommand_required(true)
                .subcommand(
                    Command::new("init")
                        .about("Initialize a new tally config")
                        .after_help(
                            "This writes the default configuration into the config folder, \
                             including the overrides given on the command line.",
                        )
                        .arg(
                            Arg::new("overwrite")
                                .long("overwrite")
                                .action(ArgAction::SetTrue)
                                .help("Overwrite an existing config file instead of failing"),
                        ),
                )
                .subcommand(
                    Command::new("show")
                        .about("Show the entire config out for debugging purposes")
                        .after_help(
                            "This dumps out the entire config including the values which \
                             are not in the config file but filled in from defaults.  The \
                             default output format is YAML but a debug format can also be \
                             specified.",
                        )
                        .arg(
                            Arg::new("format")
                                .short('f')
                                .long("format")
                                .value_parser(PossibleValuesParser::new(["debug", "yaml"]))
                                .default_value("yaml")
                                .help("The output format"),
                        ),
                )
                .subcommand(
                    Command::new("check")
                        .about("Validate the config")
                        .after_help(
                            "This builds the aggregation engine from the config without \
                             starting it, which compiles all path patterns and resolves \
                             synthetic definitions.",
                        )
                        .arg(
                            Arg::new("quiet")
                                .short('q')
                                .long("quiet")
                                .action(ArgAction::SetTrue)
                                .help("Do not print anything on success"),
                        ),
                ),
        )
}
