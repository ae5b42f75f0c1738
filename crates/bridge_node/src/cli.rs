//! Command-line interface for the bridge node.

use clap::{Arg, Command};
use std::path::PathBuf;

use crate::config::AppConfig;

/// Command line arguments. Everything except the config path overrides a
/// value from the configuration file.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub store_host: Option<String>,
    pub store_port: Option<u16>,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

impl CliArgs {
    /// Parses `std::env::args`, exiting with usage on bad input.
    pub fn parse() -> Self {
        Self::from_matches(Self::command().get_matches())
    }

    fn command() -> Command {
        Command::new("Presence Bridge Node")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Joins a proxy cluster's shared presence registry and reports on it")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("bridge.toml"),
            )
            .arg(
                Arg::new("host")
                    .short('H')
                    .long("host")
                    .value_name("HOSTNAME")
                    .help("Store hostname"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .help("Store port")
                    .value_parser(clap::value_parser!(u16)),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
    }

    fn from_matches(matches: clap::ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("bridge.toml")),
            store_host: matches.get_one::<String>("host").cloned(),
            store_port: matches.get_one::<u16>("port").copied(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }

    /// Writes every flag that was given over the loaded file's value.
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(host) = &self.store_host {
            config.store.hostname = host.clone();
        }
        if let Some(port) = self.store_port {
            config.store.port = port;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json_format = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::from_matches(CliArgs::command().get_matches_from(args))
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["bridge_node"]);
        assert_eq!(args.config_path, PathBuf::from("bridge.toml"));
        assert!(args.store_host.is_none());
        assert!(!args.json_logs);
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let args = parse(&[
            "bridge_node",
            "-c",
            "/etc/bridge.toml",
            "--host",
            "redis.internal",
            "--port",
            "6380",
            "--log-level",
            "debug",
            "--json-logs",
        ]);
        let mut config = AppConfig::default();
        args.apply_overrides(&mut config);

        assert_eq!(args.config_path, PathBuf::from("/etc/bridge.toml"));
        assert_eq!(config.store.hostname, "redis.internal");
        assert_eq!(config.store.port, 6380);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
    }
}
