use crate::config::RunnerOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;

pub const USAGE: &str = "Usage: script_runner <main.js> [--config <path>] [--ticks <n>] [--dt <seconds>] \
[--search-path <dir>]... [--stacktrace on|off]";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunnerOptions {
    pub main: Option<String>,
    pub config: Option<PathBuf>,
    pub help: bool,
    search_paths: Vec<String>,
    stacktrace: Option<bool>,
    ticks: Option<u32>,
    tick_seconds: Option<f64>,
}

impl RunnerOptions {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = RunnerOptions::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_arg) = iter.next() {
            let arg = raw_arg.as_ref();
            if arg == "--help" || arg == "-h" {
                options.help = true;
                continue;
            }
            if !arg.starts_with("--") {
                if let Some(previous) = &options.main {
                    bail!("Unexpected argument '{arg}'. Main module already set to '{previous}'.");
                }
                options.main = Some(arg.to_string());
                continue;
            }
            let key = &arg[2..];
            let value = iter.next().ok_or_else(|| anyhow!("Expected a value after '{arg}'"))?.as_ref().to_string();
            match key {
                "config" => options.config = Some(PathBuf::from(value)),
                "ticks" => {
                    options.ticks = Some(value.parse::<u32>().with_context(|| format!("Invalid ticks '{value}'"))?);
                }
                "dt" => {
                    let seconds = value.parse::<f64>().with_context(|| format!("Invalid dt '{value}'"))?;
                    if !seconds.is_finite() || seconds < 0.0 {
                        bail!("Invalid dt '{value}'. Use a non-negative number of seconds.");
                    }
                    options.tick_seconds = Some(seconds);
                }
                "search-path" => options.search_paths.push(value),
                "stacktrace" => options.stacktrace = Some(parse_bool_flag("stacktrace", &value)?),
                _ => bail!(
                    "Unknown flag '{arg}'. Supported flags: --config, --ticks, --dt, --search-path, --stacktrace."
                ),
            }
        }
        Ok(options)
    }

    pub fn config_overrides(&self) -> RunnerOverrides {
        RunnerOverrides {
            search_paths: self.search_paths.clone(),
            stacktrace: self.stacktrace,
            ticks: self.ticks,
            tick_seconds: self.tick_seconds,
        }
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}
