//! Append-only CSV trade journal

use crate::models::Instrument;
use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const JOURNAL_HEADER: &str = "ts,symbol,action,price,qty,realized_pnl,equity,note";

/// One trade event as written to the journal
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub ts: DateTime<Utc>,
    pub instrument: Instrument,
    /// `enter`, `partial`, `exit` or `stop`
    pub action: String,
    pub price: f64,
    pub qty: f64,
    pub realized_pnl: f64,
    pub equity: f64,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct TradeJournal {
    path: PathBuf,
    dry_run: bool,
}

impl TradeJournal {
    pub fn new(path: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self {
            path: path.into(),
            dry_run,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `enter` becomes `enter_sim` in dry run, `enter_live` otherwise
    pub fn action_label(&self, action: &str) -> String {
        let mode = if self.dry_run { "sim" } else { "live" };
        format!("{}_{}", action, mode)
    }

    /// Append one row; the header is written only when the file is new or empty
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let needs_header = fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if needs_header {
            writeln!(file, "{}", JOURNAL_HEADER)?;
        }
        writeln!(file, "{}", self.format_row(entry))?;
        file.flush()?;

        Ok(())
    }

    /// Log and swallow write failures; the journal never affects trading
    pub fn record(&self, entry: &JournalEntry) {
        if let Err(e) = self.append(entry) {
            tracing::error!(
                path = %self.path.display(),
                error = %e,
                "Failed to append trade journal row"
            );
        }
    }

    fn format_row(&self, entry: &JournalEntry) -> String {
        [
            entry.ts.to_rfc3339_opts(SecondsFormat::Secs, true),
            escape_field(&entry.instrument.symbol()),
            escape_field(&self.action_label(&entry.action)),
            format!("{:.8}", entry.price),
            format!("{:.8}", entry.qty),
            format!("{:.2}", entry.realized_pnl),
            format!("{:.2}", entry.equity),
            escape_field(&entry.note),
        ]
        .join(",")
    }
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(action: &str, note: &str) -> JournalEntry {
        JournalEntry {
            ts: Utc.with_ymd_and_hms(2024, 3, 5, 14, 0, 0).unwrap(),
            instrument: Instrument::new("BTC", "USDT"),
            action: action.to_string(),
            price: 100.0,
            qty: 50.0,
            realized_pnl: 0.0,
            equity: 10_000.0,
            note: note.to_string(),
        }
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.csv");
        let journal = TradeJournal::new(&path, true);

        journal.append(&entry("enter", "breakout")).unwrap();
        journal.append(&entry("stop", "")).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], JOURNAL_HEADER);
        assert_eq!(
            lines[1],
            "2024-03-05T14:00:00Z,BTC/USDT,enter_sim,100.00000000,50.00000000,0.00,10000.00,breakout"
        );
        assert!(lines[2].contains(",stop_sim,"));
    }

    #[test]
    fn test_existing_rows_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.csv");
        fs::write(&path, format!("{}\nold,row\n", JOURNAL_HEADER)).unwrap();

        TradeJournal::new(&path, false)
            .append(&entry("partial", "tp"))
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with(&format!("{}\nold,row\n", JOURNAL_HEADER)));
        assert_eq!(contents.matches(JOURNAL_HEADER).count(), 1);
        assert!(contents.contains(",partial_live,"));
    }

    #[test]
    fn test_note_quoting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("trades.csv");
        let journal = TradeJournal::new(&path, true);

        journal
            .append(&entry("exit", "R=1.0, said \"done\""))
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.trim_end().ends_with(r#","R=1.0, said ""done""""#));
    }

    #[test]
    fn test_record_swallows_errors() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for append
        let journal = TradeJournal::new(dir.path(), true);
        journal.record(&entry("enter", ""));
        assert!(journal.append(&entry("enter", "")).is_err());
    }
}
