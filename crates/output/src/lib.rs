//! Kval output sinks.
//!
//! A sink receives results in sweep order through `put` and is flushed exactly once
//! at the end. `stdout` writes as it goes; `json` and `tap` buffer until `flush`.

#![forbid(unsafe_code)]

use std::io::Write;

use kval_core::ValidationResult;
use nu_ansi_term::Color;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("writing output: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding output: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait OutputSink {
    fn put(&mut self, result: &ValidationResult) -> Result<(), SinkError>;
    fn flush(&mut self) -> Result<(), SinkError>;
}

impl<T: OutputSink + ?Sized> OutputSink for Box<T> {
    fn put(&mut self, result: &ValidationResult) -> Result<(), SinkError> {
        (**self).put(result)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Stdout,
    Json,
    Tap,
}

/// `color` only affects the line-oriented `stdout` format.
pub fn sink_for<W: Write + Send + 'static>(format: OutputFormat, writer: W, color: bool) -> Box<dyn OutputSink + Send> {
    match format {
        OutputFormat::Stdout => Box::new(StdoutSink::new(writer).with_color(color)),
        OutputFormat::Json => Box::new(JsonSink::new(writer)),
        OutputFormat::Tap => Box::new(TapSink::new(writer)),
    }
}

/// Human-readable lines, written immediately.
pub struct StdoutSink<W> {
    out: W,
    color: bool,
}

impl<W: Write> StdoutSink<W> {
    pub fn new(out: W) -> Self {
        Self { out, color: false }
    }

    /// PASS lines green, WARN yellow, ERR red.
    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    fn line(&mut self, color: Color, text: String) -> Result<(), SinkError> {
        if self.color {
            writeln!(self.out, "{}", color.paint(text))?;
        } else {
            writeln!(self.out, "{}", text)?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> OutputSink for StdoutSink<W> {
    fn put(&mut self, r: &ValidationResult) -> Result<(), SinkError> {
        if r.has_errors() {
            for e in r.errors() {
                self.line(Color::Red, format!("ERR  - {}: {}", r.identity, e))?;
            }
        } else if !r.validated_against_schema {
            let text = format!("WARN - {} containing a {} was not validated against a schema", r.identity, r.kind);
            self.line(Color::Yellow, text)?;
        } else {
            self.line(Color::Green, format!("PASS - {} contains a valid {}", r.identity, r.kind))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.out.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Status {
    Valid,
    Invalid,
    Skipped,
}

fn status(r: &ValidationResult) -> Status {
    if r.has_errors() {
        Status::Invalid
    } else if !r.validated_against_schema {
        Status::Skipped
    } else {
        Status::Valid
    }
}

#[derive(Debug, Serialize)]
struct JsonRow {
    filename: String,
    kind: String,
    status: Status,
    errors: Vec<String>,
}

/// One JSON array, written on flush.
pub struct JsonSink<W> {
    out: W,
    rows: Vec<JsonRow>,
}

impl<W: Write> JsonSink<W> {
    pub fn new(out: W) -> Self {
        Self { out, rows: Vec::new() }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> OutputSink for JsonSink<W> {
    fn put(&mut self, r: &ValidationResult) -> Result<(), SinkError> {
        self.rows.push(JsonRow {
            filename: r.identity.clone(),
            kind: r.kind.clone(),
            status: status(r),
            errors: r.errors().iter().map(|e| e.to_string()).collect(),
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        serde_json::to_writer_pretty(&mut self.out, &self.rows)?;
        writeln!(self.out)?;
        self.out.flush()?;
        self.rows.clear();
        Ok(())
    }
}

/// Test Anything Protocol; one test point per error, or one per result without errors.
pub struct TapSink<W> {
    out: W,
    results: Vec<ValidationResult>,
}

impl<W: Write> TapSink<W> {
    pub fn new(out: W) -> Self {
        Self { out, results: Vec::new() }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> OutputSink for TapSink<W> {
    fn put(&mut self, r: &ValidationResult) -> Result<(), SinkError> {
        self.results.push(r.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        let total: usize = self.results.iter().map(|r| r.errors().len().max(1)).sum();
        writeln!(self.out, "1..{}", total)?;
        let mut n = 0;
        for r in &self.results {
            match status(r) {
                Status::Invalid => {
                    for e in r.errors() {
                        n += 1;
                        writeln!(self.out, "not ok {} - {} ({}) - problem: {}", n, r.identity, r.kind, e)?;
                    }
                }
                Status::Skipped => {
                    n += 1;
                    writeln!(self.out, "ok {} - {} ({}) # SKIP", n, r.identity, r.kind)?;
                }
                Status::Valid => {
                    n += 1;
                    writeln!(self.out, "ok {} - {} ({})", n, r.identity, r.kind)?;
                }
            }
        }
        self.out.flush()?;
        self.results.clear();
        Ok(())
    }
}
