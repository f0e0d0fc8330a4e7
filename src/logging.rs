use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use chrono::SecondsFormat;

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Log to `path` (truncated) and mirror to stdout.
pub fn init_log_file(path: &Path) -> Result<()> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let logger = Logger::new(Some(path), true)?;
    let _ = LOGGER.set(logger);
    Ok(())
}

/// Log to stdout only.
pub fn init_stdout() {
    if LOGGER.get().is_some() {
        return;
    }
    if let Ok(logger) = Logger::new(None, true) {
        let _ = LOGGER.set(logger);
    }
}

pub fn debug_enabled() -> bool {
    std::env::var("MAYADROP_DEBUG").ok().as_deref() == Some("1")
}

pub fn info(msg: impl AsRef<str>) {
    log_kv("INFO", msg.as_ref(), &[]);
}

pub fn warn(msg: impl AsRef<str>) {
    log_kv("WARN", msg.as_ref(), &[]);
}

pub fn error(msg: impl AsRef<str>) {
    log_kv("ERROR", msg.as_ref(), &[]);
}

pub fn debug(msg: impl AsRef<str>) {
    if debug_enabled() {
        log_kv("DEBUG", msg.as_ref(), &[]);
    }
}

pub fn info_kv(msg: &str, kv: &[(&str, &str)]) {
    log_kv("INFO", msg, kv);
}

pub fn warn_kv(msg: &str, kv: &[(&str, &str)]) {
    log_kv("WARN", msg, kv);
}

pub fn error_kv(msg: &str, kv: &[(&str, &str)]) {
    log_kv("ERROR", msg, kv);
}

fn log_kv(level: &str, msg: &str, kv: &[(&str, &str)]) {
    if let Some(logger) = LOGGER.get() {
        logger.write_kv(level, msg, kv);
    }
}

struct Logger {
    file: Option<Mutex<File>>,
    mirror_to_stdout: bool,
}

impl Logger {
    fn new(path: Option<&Path>, mirror_to_stdout: bool) -> Result<Self> {
        let file = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create {}", parent.display()))?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .write(true)
                    .open(path)
                    .with_context(|| format!("open {}", path.display()))?;
                Some(Mutex::new(file))
            }
            None => None,
        };
        Ok(Self {
            file,
            mirror_to_stdout,
        })
    }

    fn write_kv(&self, level: &str, msg: &str, kv: &[(&str, &str)]) {
        let ts = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Some(file) = &self.file {
            let mut slog_line =
                format!("time={ts} level={level} msg=\"{}\"", escape_slog_value(msg));
            for (k, v) in kv {
                slog_line.push(' ');
                slog_line.push_str(k);
                slog_line.push('=');
                slog_line.push_str(&quote_if_needed(v));
            }
            slog_line.push('\n');
            if let Ok(mut f) = file.lock() {
                let _ = f.write_all(slog_line.as_bytes());
                let _ = f.flush();
            }
        }
        if self.mirror_to_stdout {
            let mut pretty_line = format!("{ts} {level} {msg}");
            for (k, v) in kv {
                pretty_line.push(' ');
                pretty_line.push_str(k);
                pretty_line.push('=');
                pretty_line.push_str(v);
            }
            pretty_line.push('\n');
            let mut out = std::io::stdout();
            let _ = out.write_all(pretty_line.as_bytes());
            let _ = out.flush();
        }
    }
}

fn quote_if_needed(v: &str) -> String {
    if v.is_empty() || v.contains([' ', '"', '=', '\n']) {
        format!("\"{}\"", escape_slog_value(v))
    } else {
        v.to_string()
    }
}

fn escape_slog_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}
