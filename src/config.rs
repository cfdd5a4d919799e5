use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "RunnerConfig::default_ticks")]
    pub ticks: u32,
    #[serde(default = "RunnerConfig::default_tick_seconds")]
    pub tick_seconds: f64,
}

impl RunnerConfig {
    const fn default_ticks() -> u32 {
        60
    }

    const fn default_tick_seconds() -> f64 {
        1.0 / 60.0
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { ticks: Self::default_ticks(), tick_seconds: Self::default_tick_seconds() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "RuntimeConfig::default_search_paths")]
    pub search_paths: Vec<String>,
    #[serde(default)]
    pub stacktrace: bool,
    #[serde(default)]
    pub memory_limit: Option<usize>,
    #[serde(default = "RuntimeConfig::default_max_stack_size")]
    pub max_stack_size: Option<usize>,
    #[serde(default = "RuntimeConfig::default_buffer_pool_size")]
    pub buffer_pool_size: usize,
    #[serde(default)]
    pub runner: RunnerConfig,
}

impl RuntimeConfig {
    fn default_search_paths() -> Vec<String> {
        vec![".".to_string()]
    }

    const fn default_max_stack_size() -> Option<usize> {
        Some(1024 * 1024)
    }

    const fn default_buffer_pool_size() -> usize {
        32
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            search_paths: Self::default_search_paths(),
            stacktrace: false,
            memory_limit: None,
            max_stack_size: Self::default_max_stack_size(),
            buffer_pool_size: Self::default_buffer_pool_size(),
            runner: RunnerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunnerOverrides {
    pub search_paths: Vec<String>,
    pub stacktrace: Option<bool>,
    pub ticks: Option<u32>,
    pub tick_seconds: Option<f64>,
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    /// Search paths from the command line are tried before the configured ones.
    pub fn apply_overrides(&mut self, overrides: &RunnerOverrides) {
        if !overrides.search_paths.is_empty() {
            let mut paths = overrides.search_paths.clone();
            paths.extend(self.search_paths.drain(..).filter(|path| !overrides.search_paths.contains(path)));
            self.search_paths = paths;
        }
        if let Some(stacktrace) = overrides.stacktrace {
            self.stacktrace = stacktrace;
        }
        if let Some(ticks) = overrides.ticks {
            self.runner.ticks = ticks;
        }
        if let Some(tick_seconds) = overrides.tick_seconds {
            self.runner.tick_seconds = tick_seconds;
        }
    }
}

impl RunnerOverrides {
    pub fn is_empty(&self) -> bool {
        self.search_paths.is_empty() && self.stacktrace.is_none() && self.ticks.is_none() && self.tick_seconds.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if !self.search_paths.is_empty() {
            fields.push("search_paths");
        }
        if self.stacktrace.is_some() {
            fields.push("stacktrace");
        }
        if self.ticks.is_some() {
            fields.push("ticks");
        }
        if self.tick_seconds.is_some() {
            fields.push("tick_seconds");
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let mut file = NamedTempFile::new().expect("temp config");
        write!(file, r#"{{ "stacktrace": true, "runner": {{ "ticks": 5 }} }}"#).expect("write config");
        let cfg = RuntimeConfig::load(file.path()).expect("load config");
        assert!(cfg.stacktrace);
        assert_eq!(cfg.search_paths, vec![".".to_string()]);
        assert_eq!(cfg.runner.ticks, 5);
        assert_eq!(cfg.runner.tick_seconds, RunnerConfig::default_tick_seconds());
        assert_eq!(cfg.max_stack_size, Some(1024 * 1024));
        assert_eq!(cfg.buffer_pool_size, 32);
    }

    #[test]
    fn unreadable_config_uses_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cfg = RuntimeConfig::load_or_default(dir.path().join("missing.json"));
        assert_eq!(cfg.runner.ticks, RunnerConfig::default_ticks());
        assert!(!cfg.stacktrace);
    }

    #[test]
    fn overrides_prepend_search_paths() {
        let mut cfg = RuntimeConfig::default();
        cfg.search_paths = vec!["lib".to_string(), "scripts".to_string()];
        let overrides = RunnerOverrides {
            search_paths: vec!["scripts".to_string(), "mods".to_string()],
            stacktrace: Some(true),
            ticks: None,
            tick_seconds: Some(0.5),
        };
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.search_paths, vec!["scripts", "mods", "lib"]);
        assert!(cfg.stacktrace);
        assert_eq!(cfg.runner.ticks, 60);
        assert_eq!(cfg.runner.tick_seconds, 0.5);
        assert_eq!(overrides.applied_fields(), vec!["search_paths", "stacktrace", "tick_seconds"]);
        assert!(RunnerOverrides::default().is_empty());
    }
}
