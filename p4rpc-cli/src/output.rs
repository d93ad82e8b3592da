//! Terminal output sinks.

use colored::Colorize;
use p4rpc_client::{OutputSink, Severity};
use p4rpc_protocol::Symbols;
use serde_json::{Map, Value};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Human-readable output. Diagnostics are coloured by severity and
/// error-class ones go to stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorSink;

impl OutputSink for ColorSink {
    fn on_message(&self, severity: Severity, text: &str) {
        if severity >= Severity::FAILED {
            eprintln!("{}", text.red());
        } else if severity.is_error() {
            eprintln!("{}", text.yellow());
        } else {
            println!("{}", text);
        }
    }

    fn on_fstat(&self, record: &Symbols) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for (tag, value) in record {
            let _ = writeln!(
                out,
                "... {} {}",
                String::from_utf8_lossy(tag).cyan(),
                String::from_utf8_lossy(value)
            );
        }
        let _ = writeln!(out);
    }
}

/// One JSON object per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSink;

impl OutputSink for JsonSink {
    fn on_message(&self, severity: Severity, text: &str) {
        let line = message_to_json(severity, text);
        if severity.is_error() {
            eprintln!("{}", line);
        } else {
            println!("{}", line);
        }
    }

    fn on_fstat(&self, record: &Symbols) {
        println!("{}", record_to_json(record));
    }
}

/// Wraps a sink and counts the error-class diagnostics passing through.
pub struct Counted {
    inner: Box<dyn OutputSink>,
    errors: AtomicUsize,
}

impl Counted {
    pub fn new(inner: impl OutputSink + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            errors: AtomicUsize::new(0),
        }
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }
}

impl OutputSink for Counted {
    fn on_message(&self, severity: Severity, text: &str) {
        if severity.is_error() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.on_message(severity, text);
    }

    fn on_fstat(&self, record: &Symbols) {
        self.inner.on_fstat(record);
    }
}

/// Converts a metadata record to a JSON object.
pub fn record_to_json(record: &Symbols) -> Value {
    let map: Map<String, Value> = record
        .iter()
        .map(|(tag, value)| {
            (
                String::from_utf8_lossy(tag).into_owned(),
                Value::String(String::from_utf8_lossy(value).into_owned()),
            )
        })
        .collect();
    Value::Object(map)
}

pub fn message_to_json(severity: Severity, text: &str) -> Value {
    serde_json::json!({
        "severity": severity.name(),
        "message": text,
    })
}
