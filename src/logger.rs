use std::fmt;
use std::sync::OnceLock;

use parking_lot::Mutex;
use regex::Regex;

/// Severity tag shared by `print`, the `console.*` family and host-side reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Log,
    Warn,
    Error,
    Assert,
}

impl LogLevel {
    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Log => "log",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Assert => "assert",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Sink for everything the bridge reports. Implementations must tolerate calls from any thread.
pub trait ScriptLogger: Send + Sync {
    /// Messages produced by the bridge itself (load failures, uncaught exceptions, misuse).
    fn write(&self, level: LogLevel, message: &str);

    /// Messages produced by scripts through `print` and `console.*`.
    fn script_write(&self, level: LogLevel, message: &str) {
        self.write(level, message);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StderrLogger;

impl ScriptLogger for StderrLogger {
    fn write(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Log => println!("[script-bridge] {message}"),
            other => eprintln!("[script-bridge:{other}] {message}"),
        }
    }

    fn script_write(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Log => println!("[script] {message}"),
            other => eprintln!("[script:{other}] {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub from_script: bool,
    pub message: String,
}

/// Collects entries in memory; used by tooling and tests to assert on script output.
#[derive(Debug, Default)]
pub struct BufferedLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl BufferedLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_logs(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn script_messages(&self) -> Vec<String> {
        self.entries.lock().iter().filter(|entry| entry.from_script).map(|entry| entry.message.clone()).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries.lock().iter().any(|entry| entry.message.contains(needle))
    }

    pub fn count(&self, level: LogLevel) -> usize {
        self.entries.lock().iter().filter(|entry| entry.level == level).count()
    }
}

impl ScriptLogger for BufferedLogger {
    fn write(&self, level: LogLevel, message: &str) {
        self.entries.lock().push(LogEntry { level, from_script: false, message: message.to_string() });
    }

    fn script_write(&self, level: LogLevel, message: &str) {
        self.entries.lock().push(LogEntry { level, from_script: true, message: message.to_string() });
    }
}

/// Maps `(function, file, line)` of a stack frame to the text that replaces it, e.g. through a source map.
pub type SourcePositionFn = dyn Fn(&str, &str, u32) -> String;

fn frame_pattern() -> &'static Regex {
    static FRAME: OnceLock<Regex> = OnceLock::new();
    FRAME.get_or_init(|| {
        Regex::new(r"^\s+at\s(.+)\s\((.+\.js):(\d+)(?::\d+)?\)(.*)$").expect("stack frame pattern is valid")
    })
}

/// Rewrites every `at fn (file.js:line)` frame of an engine stack through `translate`.
/// Frames that do not match (native frames, anonymous evals) are kept verbatim.
pub fn format_stack(stack: &str, translate: Option<&SourcePositionFn>) -> String {
    let pattern = frame_pattern();
    let mut out = String::with_capacity(stack.len());
    for line in stack.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        let Some(captures) = pattern.captures(line) else {
            out.push_str(line);
            continue;
        };
        let function = &captures[1];
        let file = &captures[2];
        let line_number = captures[3].parse::<u32>().unwrap_or(0);
        let rest = &captures[4];
        let position = match translate {
            Some(translate) => translate(function, file, line_number),
            None => format!("{function} ({file}:{line_number})"),
        };
        out.push_str("    at ");
        out.push_str(&position);
        out.push_str(rest);
    }
    out
}
