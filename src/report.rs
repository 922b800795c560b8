//! Frequency reports over the request log

use std::{fmt, io::ErrorKind, path::PathBuf};

use eyre::Context;
use indexmap::{IndexMap, IndexSet};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};
use tracing::{debug, info, instrument};

use crate::{config::Config, entry::LogEntry};

/// Country recorded for entries without a known location.
pub const UNKNOWN_COUNTRY: &str = "N/A";

/// Occurrence counts, in the order values were first seen.
type Tally = IndexMap<String, usize>;

/// Scans the request log and summarizes it.
#[derive(Clone, Debug)]
pub struct Reporter {
    /// Path of the request log
    path: PathBuf,
    /// Countries whose accesses are never flagged
    allowed_countries: IndexSet<String>,
    /// Length of each frequency table
    top: usize,
    /// How many suspicious entries a report shows in full
    examples: usize,
}

/// Summary of every readable entry in the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    /// Number of entries that were read successfully
    pub entries: usize,
    /// Number of lines that could not be read as an entry
    pub skipped: usize,
    /// Most frequent user agents with their counts
    pub user_agents: Vec<(String, usize)>,
    /// Most frequent countries with their counts
    pub countries: Vec<(String, usize)>,
    /// Most frequent hosts with their counts
    pub hosts: Vec<(String, usize)>,
    /// Entries from a known country outside the allow-list, in log order
    pub suspicious: Vec<LogEntry>,
    /// How many suspicious entries to show when displayed
    examples: usize,
}

impl Reporter {
    /// Create a reporter over the log and report settings in `config`.
    pub fn new(config: &Config) -> Self {
        Reporter {
            path: config.storage.log_path(),
            allowed_countries: config.report.allowed_countries.iter().cloned().collect(),
            top: config.report.top,
            examples: config.report.examples,
        }
    }

    /// Whether an access from `country` is outside the allow-list.
    ///
    /// Unknown locations are never suspicious.
    pub fn is_suspicious(&self, country: Option<&str>) -> bool {
        match country {
            None | Some(UNKNOWN_COUNTRY) => false,
            Some(country) => !self.allowed_countries.contains(country),
        }
    }

    /// Read the whole log and tally it.
    ///
    /// Returns `None` if there is no log yet. Lines that are not valid UTF-8 or not a valid entry
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the log exists but cannot be read.
    #[instrument(name = "report.analyze", skip(self), fields(path = %self.path.display()))]
    pub async fn analyze(&self) -> eyre::Result<Option<Report>> {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("No request log yet");
                return Ok(None);
            }
            Err(err) => {
                return Err(err).wrap_err_with(|| format!("Failed to open {}", self.path.display()));
            }
        };

        let mut user_agents = Tally::new();
        let mut countries = Tally::new();
        let mut hosts = Tally::new();
        let mut suspicious = Vec::new();
        let mut entries = 0;
        let mut skipped = 0;

        let mut reader = BufReader::new(file);
        let mut buffer = Vec::with_capacity(1024);
        let mut line_num = 0;
        loop {
            buffer.clear();
            let bytes_read = reader
                .read_until(b'\n', &mut buffer)
                .await
                .wrap_err_with(|| format!("Failed to read {}", self.path.display()))?;
            if bytes_read == 0 {
                break;
            }
            line_num += 1;

            if buffer.ends_with(b"\n") {
                buffer.pop();
                if buffer.ends_with(b"\r") {
                    buffer.pop();
                }
            }
            if buffer.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let entry = match std::str::from_utf8(&buffer) {
                Ok(line) => match LogEntry::from_line(line) {
                    Ok(entry) => entry,
                    Err(err) => {
                        debug!("Skipping line {line_num}: {err}");
                        skipped += 1;
                        continue;
                    }
                },
                Err(err) => {
                    debug!("Skipping line {line_num}: invalid UTF-8: {err}");
                    skipped += 1;
                    continue;
                }
            };

            entries += 1;
            count(&mut user_agents, entry.user_agent.as_deref().unwrap_or(""));
            count(
                &mut countries,
                entry.geo.country.as_deref().unwrap_or(UNKNOWN_COUNTRY),
            );
            count(&mut hosts, entry.host.as_deref().unwrap_or(""));
            if self.is_suspicious(entry.geo.country.as_deref()) {
                suspicious.push(entry);
            }
        }

        info!(entries, skipped, suspicious = suspicious.len(), "Scanned request log");

        Ok(Some(Report {
            entries,
            skipped,
            user_agents: most_common(user_agents, self.top),
            countries: most_common(countries, self.top),
            hosts: most_common(hosts, self.top),
            suspicious,
            examples: self.examples,
        }))
    }
}

/// Increment the count for `value`.
fn count(tally: &mut Tally, value: &str) {
    match tally.get_mut(value) {
        Some(n) => *n += 1,
        None => {
            tally.insert(value.to_owned(), 1);
        }
    }
}

/// The `n` most frequent values, highest count first. Equal counts keep first-seen order.
fn most_common(tally: Tally, n: usize) -> Vec<(String, usize)> {
    let mut counts = tally.into_iter().collect::<Vec<_>>();
    counts.sort_by(|(_, a), (_, b)| b.cmp(a));
    counts.truncate(n);
    counts
}

/// Write one frequency table.
fn write_table(f: &mut fmt::Formatter<'_>, title: &str, rows: &[(String, usize)]) -> fmt::Result {
    writeln!(f, "\n{title}:")?;
    if rows.is_empty() {
        return writeln!(f, "  (none)");
    }
    for (value, count) in rows {
        writeln!(f, "  {count:>6}  {value:?}")?;
    }
    Ok(())
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entries analyzed: {}", self.entries)?;
        if self.skipped > 0 {
            write!(f, " ({} unreadable lines skipped)", self.skipped)?;
        }
        writeln!(f)?;

        write_table(f, "Top user agents", &self.user_agents)?;
        write_table(f, "Top countries", &self.countries)?;
        write_table(f, "Top requested hosts", &self.hosts)?;

        if self.suspicious.is_empty() {
            return writeln!(f, "\nNo suspicious access detected.");
        }
        writeln!(
            f,
            "\n[!] Accesses from countries outside the allow-list (possible anomalies): {}",
            self.suspicious.len()
        )?;
        for entry in self.suspicious.iter().take(self.examples) {
            let pretty = serde_json::to_string_pretty(entry).map_err(|_| fmt::Error)?;
            writeln!(f, "{pretty}")?;
        }
        Ok(())
    }
}
