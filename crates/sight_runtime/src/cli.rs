//! Command-line interface for sight-launch

use crate::config::{ConfigValue, FieldAdaptor};
use argh::FromArgs;

/// Run a Sight application configuration
#[derive(FromArgs, Debug)]
pub struct LaunchArgs {
    /// path to the application configuration file
    #[argh(positional)]
    pub config_file: String,

    /// configuration to run (default: the first one in the file)
    #[argh(option, short = 'c')]
    pub config: Option<String>,

    /// template parameter values (format: key:=value)
    #[argh(option, short = 'p', from_str_fn(parse_arg_override))]
    pub param: Vec<(String, String)>,

    /// list the configurations of the file by group and exit
    #[argh(switch)]
    pub list: bool,

    /// validate every configuration of the file and exit
    #[argh(switch)]
    pub validate: bool,

    /// print the adapted configuration without running it
    #[argh(switch)]
    pub dry_run: bool,

    /// print --list and --dry-run output as JSON
    #[argh(switch)]
    pub json: bool,

    /// keep the identifiers of the configuration as written
    #[argh(switch)]
    pub no_prefix: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse a parameter override in format "key:=value"
fn parse_arg_override(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, ":=").collect();
    if parts.len() != 2 || parts[0].is_empty() {
        return Err(format!(
            "Invalid parameter format '{}'. Expected 'key:=value'",
            s
        ));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

impl LaunchArgs {
    /// Parameter overrides as field adaptors, values typed the way YAML would
    pub fn fields(&self) -> FieldAdaptor {
        self.param
            .iter()
            .map(|(k, v)| (k.clone(), ConfigValue::parse(v)))
            .collect()
    }

    /// Log filter, falling back to `info` for unknown levels
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "info" => "info",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }
}
