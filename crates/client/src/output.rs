//! User-facing output.
//!
//! Everything the user is meant to read goes through an [`OutputSink`];
//! diagnostics go through `tracing`. The console sink clears the line the
//! prompt sits on before printing and re-draws the prompt afterwards, so
//! server feeds arriving mid-typing do not garble the input line.

use std::io::{self, Write};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use crossterm::cursor::MoveToColumn;
use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};
use crossterm::terminal::{Clear, ClearType};
use crossterm::QueueableCommand;

/// Severity of a user-facing line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLevel {
    Log,
    Warn,
    Error,
    Debug,
}

/// Destination for user-facing text.
pub trait OutputSink: Send + Sync {
    fn log(&self, message: &str);

    fn warn(&self, message: &str);

    fn error(&self, message: &str);

    /// Dropped unless debug output is enabled.
    fn debug(&self, message: &str);

    /// `key: value` dump.
    fn dir(&self, entries: &[(String, String)]);

    fn set_prompt(&self, prompt: &str);
}

/// Terminal sink writing to stdout.
pub struct ConsoleOutput {
    debug: bool,
    timestamps: bool,
    prompt: Mutex<String>,
}

impl ConsoleOutput {
    pub fn new(debug: bool, timestamps: bool) -> Self {
        Self {
            debug,
            timestamps,
            prompt: Mutex::new(String::new()),
        }
    }

    fn prompt(&self) -> String {
        self.prompt.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn print(&self, level: OutputLevel, message: &str) {
        let (color, label) = match level {
            OutputLevel::Log => (None, ""),
            OutputLevel::Warn => (Some(Color::Yellow), "WARN: "),
            OutputLevel::Error => (Some(Color::Red), "ERROR: "),
            OutputLevel::Debug => (Some(Color::DarkGrey), "DEBUG: "),
        };

        let mut line = String::new();
        if self.timestamps {
            line.push_str(&utc_timestamp());
            line.push(' ');
        }
        line.push_str(label);
        line.push_str(message);

        let result = self.write_lines(|out| {
            if let Some(color) = color {
                out.queue(SetForegroundColor(color))?;
            }
            out.queue(Print(&line))?.queue(ResetColor)?.queue(Print("\n"))?;
            Ok(())
        });
        if let Err(e) = result {
            tracing::debug!(error = %e, "console write failed");
        }
    }

    /// Clears the prompt line, runs `body`, then re-draws the prompt.
    fn write_lines<F>(&self, body: F) -> io::Result<()>
    where
        F: FnOnce(&mut io::StdoutLock<'_>) -> io::Result<()>,
    {
        let prompt = self.prompt();
        let mut out = io::stdout().lock();
        out.queue(Clear(ClearType::CurrentLine))?
            .queue(MoveToColumn(0))?;
        body(&mut out)?;
        out.queue(Print(prompt))?;
        out.flush()
    }
}

impl OutputSink for ConsoleOutput {
    fn log(&self, message: &str) {
        self.print(OutputLevel::Log, message);
    }

    fn warn(&self, message: &str) {
        self.print(OutputLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.print(OutputLevel::Error, message);
    }

    fn debug(&self, message: &str) {
        if self.debug {
            self.print(OutputLevel::Debug, message);
        }
    }

    fn dir(&self, entries: &[(String, String)]) {
        let result = self.write_lines(|out| {
            for (key, value) in entries {
                out.queue(SetAttribute(Attribute::Dim))?
                    .queue(Print(format!("{key}: ")))?
                    .queue(SetAttribute(Attribute::Reset))?
                    .queue(SetAttribute(Attribute::Bold))?
                    .queue(Print(value))?
                    .queue(SetAttribute(Attribute::Reset))?
                    .queue(Print("\n"))?;
            }
            Ok(())
        });
        if let Err(e) = result {
            tracing::debug!(error = %e, "console write failed");
        }
    }

    fn set_prompt(&self, prompt: &str) {
        if let Ok(mut current) = self.prompt.lock() {
            if *current == prompt {
                return;
            }
            *current = prompt.to_string();
        }
        let result = self.write_lines(|_| Ok(()));
        if let Err(e) = result {
            tracing::debug!(error = %e, "console write failed");
        }
    }
}

/// ISO 8601 with milliseconds, e.g. `2024-03-05T07:08:09.123Z`.
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn utc_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryOutput {
    lines: Mutex<Vec<(OutputLevel, String)>>,
    prompt: Mutex<String>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(OutputLevel, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// True when any line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|(_, line)| line.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.lines()
            .iter()
            .filter(|(_, line)| line.contains(needle))
            .count()
    }

    pub fn prompt(&self) -> String {
        self.prompt.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn push(&self, level: OutputLevel, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, message.to_string()));
        }
    }
}

impl OutputSink for MemoryOutput {
    fn log(&self, message: &str) {
        self.push(OutputLevel::Log, message);
    }

    fn warn(&self, message: &str) {
        self.push(OutputLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.push(OutputLevel::Error, message);
    }

    fn debug(&self, message: &str) {
        self.push(OutputLevel::Debug, message);
    }

    fn dir(&self, entries: &[(String, String)]) {
        for (key, value) in entries {
            self.push(OutputLevel::Log, &format!("{key}: {value}"));
        }
    }

    fn set_prompt(&self, prompt: &str) {
        if let Ok(mut current) = self.prompt.lock() {
            *current = prompt.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_output_records_levels() {
        let out = MemoryOutput::new();
        out.log("hello");
        out.warn("careful");
        out.dir(&[("pos".into(), "1".into())]);
        out.set_prompt("[global *] > ");

        let lines = out.lines();
        assert_eq!(lines[0], (OutputLevel::Log, "hello".to_string()));
        assert_eq!(lines[1], (OutputLevel::Warn, "careful".to_string()));
        assert!(out.contains("pos: 1"));
        assert_eq!(out.prompt(), "[global *] > ");
    }

    #[test]
    fn test_timestamp_keeps_date() {
        let at = DateTime::parse_from_rfc3339("2024-03-05T07:08:09.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(at), "2024-03-05T07:08:09.123Z");

        let now = utc_timestamp();
        assert_eq!(now.len(), 24);
        assert!(now.ends_with('Z'));
    }
}
