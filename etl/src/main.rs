use clap::{Arg, ArgAction, ArgMatches, Command};
use etl::{DEFAULT_CONFIG_PATH, EtlCommand, init_logging, json_logs_from_env, run_command};
use std::process;
use tracing::error;

fn cli() -> Command {
    let rebuild = Arg::new("rebuild")
        .long("rebuild")
        .action(ArgAction::SetTrue)
        .help("Rewrite partitions that already exist");

    Command::new("cabi-etl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Builds the Capital Bikeshare master trip table, station dimension and aggregates")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .default_value(DEFAULT_CONFIG_PATH)
                .help("Sets a custom config file"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("ingest")
                .about("Add new raw files to the master table")
                .arg(rebuild.clone())
                .arg(
                    Arg::new("refresh-stations")
                        .long("refresh-stations")
                        .action(ArgAction::SetTrue)
                        .help("Rebuild the station dimension even if nothing changed"),
                ),
        )
        .subcommand(Command::new("stations").about("Rebuild the station dimension"))
        .subcommand(Command::new("summaries").about("Rebuild the aggregate tables"))
        .subcommand(
            Command::new("run")
                .about("Ingest, then rebuild the aggregate tables")
                .arg(rebuild),
        )
}

fn parse_command(matches: &ArgMatches) -> Option<EtlCommand> {
    match matches.subcommand()? {
        ("ingest", sub) => Some(EtlCommand::Ingest {
            rebuild: sub.get_flag("rebuild"),
            refresh_stations: sub.get_flag("refresh-stations"),
        }),
        ("stations", _) => Some(EtlCommand::Stations),
        ("summaries", _) => Some(EtlCommand::Summaries),
        ("run", sub) => Some(EtlCommand::Run {
            rebuild: sub.get_flag("rebuild"),
        }),
        _ => None,
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let matches = cli().get_matches();

    init_logging(matches.get_flag("json-logs") || json_logs_from_env());

    let Some(command) = parse_command(&matches) else {
        eprintln!("Please specify a valid subcommand");
        process::exit(1);
    };
    let config_path = matches
        .get_one::<String>("config")
        .map(|s| s.as_str())
        .unwrap_or(DEFAULT_CONFIG_PATH);

    if let Err(e) = run_command(config_path, command).await {
        error!("Pipeline failed: {:#}", e);
        eprintln!("ETL pipeline error: {:#}", e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        cli().debug_assert();
    }

    #[test]
    fn test_parse_ingest_flags() {
        let matches = cli()
            .try_get_matches_from(["cabi-etl", "ingest", "--rebuild", "--config", "etl.toml"])
            .unwrap();
        assert_eq!(
            parse_command(&matches),
            Some(EtlCommand::Ingest {
                rebuild: true,
                refresh_stations: false
            })
        );
        assert_eq!(matches.get_one::<String>("config").unwrap(), "etl.toml");
    }

    #[test]
    fn test_default_config_path() {
        let matches = cli().try_get_matches_from(["cabi-etl", "summaries"]).unwrap();
        assert_eq!(parse_command(&matches), Some(EtlCommand::Summaries));
        assert_eq!(
            matches.get_one::<String>("config").map(String::as_str),
            Some(DEFAULT_CONFIG_PATH)
        );
        assert!(!matches.get_flag("json-logs"));
    }
}
