use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use kestrel_script::cli::{RunnerOptions, USAGE};
use kestrel_script::logger::{LogLevel, ScriptLogger};
use kestrel_script::{DefaultFileSystem, RuntimeConfig, ScriptRuntime, StderrLogger};

fn main() {
    if let Err(err) = run_cli() {
        eprintln!("[script-runner] error: {err:?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let options = RunnerOptions::parse_from_env()?;
    if options.help {
        println!("{USAGE}");
        return Ok(());
    }
    let main = options.main.clone().ok_or_else(|| anyhow!("a main module is required\n{USAGE}"))?;

    let mut config = match &options.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    let overrides = options.config_overrides();
    if !overrides.is_empty() {
        println!("[script-runner] overrides: {}", overrides.applied_fields().join(", "));
    }
    config.apply_overrides(&overrides);

    let logger: Arc<dyn ScriptLogger> = Arc::new(StderrLogger);
    let file_system = Box::new(DefaultFileSystem::new(logger.clone()));
    let mut runtime = ScriptRuntime::new(&config, file_system, logger.clone()).context("creating script runtime")?;
    runtime.eval_main(&main).with_context(|| format!("running main module '{main}'"))?;

    let dt = Duration::from_secs_f64(config.runner.tick_seconds);
    for _ in 0..config.runner.ticks {
        runtime.update(dt);
    }

    let pending = runtime.main_context().map(|context| context.pending_waits()).unwrap_or(0);
    let stats = runtime.destroy();
    logger.write(
        LogLevel::Log,
        &format!(
            "ran {} tick(s); cancelled {} wait(s) ({} pending at exit), released {} handle(s)",
            config.runner.ticks, stats.cancelled_waits, pending, stats.released_handles
        ),
    );
    Ok(())
}
