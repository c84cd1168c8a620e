//! Terminal rendering of merged log lines

use std::io::{self, Write};
use std::sync::Arc;

use crossterm::style::{Attribute, Color, Stylize};
use serde::Deserialize;
use unicode_width::UnicodeWidthStr;

use kubetap_logs::{LineFilter, LineKind, LineRecord};

/// How records are written to stdout
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Colored source label, then the line
    #[default]
    Pretty,
    /// Line text only
    Raw,
    /// One JSON object per record
    Json,
}

/// Writes records as they arrive from the coordinator
pub struct OutputSink<W> {
    out: W,
    format: OutputFormat,
    color: bool,
    timestamps: bool,
    filter: Arc<LineFilter>,
    /// Widest label seen so far, for column alignment
    label_width: usize,
}

impl<W: Write> OutputSink<W> {
    pub fn new(out: W, format: OutputFormat, color: bool, filter: Arc<LineFilter>) -> Self {
        Self {
            out,
            format,
            color,
            timestamps: false,
            filter,
            label_width: 0,
        }
    }

    pub fn with_timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }

    pub fn write(&mut self, record: &LineRecord) -> io::Result<()> {
        match self.format {
            OutputFormat::Raw => {
                // Control lines only make sense next to a label
                if record.kind != LineKind::Control {
                    writeln!(self.out, "{}", record.text)?;
                }
            }
            OutputFormat::Json => {
                let json = serde_json::to_string(record).map_err(io::Error::other)?;
                writeln!(self.out, "{}", json)?;
            }
            OutputFormat::Pretty => self.write_pretty(record)?,
        }
        self.out.flush()
    }

    fn write_pretty(&mut self, record: &LineRecord) -> io::Result<()> {
        let label = record.label();
        self.label_width = self.label_width.max(label.width());
        let padding = " ".repeat(self.label_width - label.width());

        if self.timestamps {
            let ts = record.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
            if self.color {
                write!(self.out, "{} ", ts.dark_grey())?;
            } else {
                write!(self.out, "{} ", ts)?;
            }
        }

        if self.color {
            write!(self.out, "{}{} ", label.with(record.color.color()), padding)?;
        } else {
            write!(self.out, "{}{} ", label, padding)?;
        }

        let text = match (record.kind, self.color) {
            (_, false) => record.text.clone(),
            (LineKind::Stdout, true) => self.highlight(&record.text),
            (LineKind::Stderr, true) => record.text.as_str().red().to_string(),
            (LineKind::Control, true) => record.text.as_str().dark_grey().italic().to_string(),
        };
        writeln!(self.out, "{}", text)
    }

    /// Emphasize include matches within a line
    fn highlight(&self, text: &str) -> String {
        let matches = self.filter.find_matches(text);
        if matches.is_empty() {
            return text.to_string();
        }

        let mut result = String::with_capacity(text.len() + matches.len() * 16);
        let mut pos = 0;
        for (start, end) in matches {
            result.push_str(&text[pos..start]);
            let hit = text[start..end]
                .with(Color::Black)
                .on(Color::Yellow)
                .attribute(Attribute::Bold);
            result.push_str(&hit.to_string());
            pos = end;
        }
        result.push_str(&text[pos..]);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubetap_logs::ColorToken;
    use kubetap_types::EndpointIdentity;

    fn record(name: &str, kind: LineKind, text: &str) -> LineRecord {
        LineRecord::new(
            EndpointIdentity::pod("ops", name),
            Some("app".to_string()),
            kind,
            ColorToken::for_stream(0),
            text,
        )
    }

    fn render(sink: &mut OutputSink<Vec<u8>>, records: &[LineRecord]) -> String {
        for r in records {
            sink.write(r).unwrap();
        }
        String::from_utf8(std::mem::take(&mut sink.out)).unwrap()
    }

    #[test]
    fn test_pretty_aligns_labels() {
        let mut sink = OutputSink::new(
            Vec::new(),
            OutputFormat::Pretty,
            false,
            Arc::new(LineFilter::default()),
        );
        let out = render(
            &mut sink,
            &[
                record("worker-10", LineKind::Stdout, "first"),
                record("api", LineKind::Stdout, "second"),
            ],
        );
        assert_eq!(
            out,
            "ops/worker-10 app first\nops/api app       second\n"
        );
    }

    #[test]
    fn test_raw_skips_control_lines() {
        let mut sink = OutputSink::new(
            Vec::new(),
            OutputFormat::Raw,
            false,
            Arc::new(LineFilter::default()),
        );
        let out = render(
            &mut sink,
            &[
                record("api", LineKind::Control, "+ stream opened"),
                record("api", LineKind::Stdout, "INFO ready"),
            ],
        );
        assert_eq!(out, "INFO ready\n");
    }

    #[test]
    fn test_json_record_fields() {
        let mut sink = OutputSink::new(
            Vec::new(),
            OutputFormat::Json,
            false,
            Arc::new(LineFilter::default()),
        );
        let out = render(&mut sink, &[record("api", LineKind::Stderr, "boom")]);
        let value: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(value["source"]["namespace"], "ops");
        assert_eq!(value["source"]["name"], "api");
        assert_eq!(value["container"], "app");
        assert_eq!(value["kind"], "stderr");
        assert_eq!(value["text"], "boom");
    }

    #[test]
    fn test_color_highlights_include_matches() {
        let filter = LineFilter::new(["ready"], Vec::<String>::new()).unwrap();
        let mut sink = OutputSink::new(Vec::new(), OutputFormat::Pretty, true, Arc::new(filter));
        let out = render(&mut sink, &[record("api", LineKind::Stdout, "INFO ready now")]);
        assert!(out.contains('\u{1b}'));
        assert!(out.contains("INFO "));
        assert!(out.ends_with(" now\n"));
    }
}
