use crate::config::Config;
use clap::Parser;
use std::path::PathBuf;

/// Used when neither `--config` nor `CONFIG_PATH` is given
pub const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

/// Run the coin-rewards payment engine
#[derive(Parser, Debug)]
#[command(name = "coin-rewards-engine")]
#[command(about = "Run the coin-rewards payment engine behind a JSON RPC listener", long_about = None)]
pub struct CliArgs {
    /// Path of the YAML configuration file
    #[arg(
        long = "config",
        env = "CONFIG_PATH",
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_PATH,
        help = "Path to the YAML config file (env: CONFIG_PATH)"
    )]
    pub config: PathBuf,

    /// Port override for the RPC listener
    #[arg(
        long = "port",
        value_name = "PORT",
        help = "Listen on this port instead of server.port from the config"
    )]
    pub port: Option<u16>,
}

impl CliArgs {
    /// Apply command-line overrides on top of a loaded config.
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::explicit(&["program", "--config", "/etc/coins.yaml"], "/etc/coins.yaml")]
    #[case::relative(&["program", "--config", "dev.yaml"], "dev.yaml")]
    fn test_config_path_parsing(#[case] args: &[&str], #[case] expected: &str) {
        let parsed = CliArgs::try_parse_from(args).unwrap();
        assert_eq!(parsed.config, PathBuf::from(expected));
    }

    #[rstest]
    #[case::no_override(&["program", "--config", "c.yaml"], 8080)]
    #[case::override_port(&["program", "--config", "c.yaml", "--port", "9000"], 9000)]
    fn test_port_override(#[case] args: &[&str], #[case] expected: u16) {
        let parsed = CliArgs::try_parse_from(args).unwrap();
        let config = parsed.apply(Config::default());
        assert_eq!(config.server.port, expected);
    }

    #[rstest]
    #[case::bad_port(&["program", "--port", "http"])]
    #[case::port_out_of_range(&["program", "--port", "70000"])]
    #[case::unknown_flag(&["program", "--strategy", "sync"])]
    fn test_parsing_errors(#[case] args: &[&str]) {
        let result = CliArgs::try_parse_from(args);
        assert!(result.is_err());
    }
}
