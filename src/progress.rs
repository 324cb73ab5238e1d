//! Indexing progress on stderr.
//!
//! `cqa index` can take minutes on a large claims folder with a local
//! embedding model. Progress lines go to **stderr** so the stdout summary
//! stays parseable, and only when stderr is a terminal.

use std::io::Write;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexProgressEvent {
    /// Documents parsed and enriched, about to be stored.
    Loaded { documents: u64 },
    /// `n` of `total` documents stored and embedded.
    Indexing { n: u64, total: u64 },
}

pub trait IndexProgressReporter: Send + Sync {
    fn report(&self, event: IndexProgressEvent);
}

/// "index  1,234 / 5,000 documents"
pub struct StderrProgress;

impl IndexProgressReporter for StderrProgress {
    fn report(&self, event: IndexProgressEvent) {
        let line = match event {
            IndexProgressEvent::Loaded { documents } => {
                format!("index  loaded {} documents\n", format_number(documents))
            }
            IndexProgressEvent::Indexing { n, total } => format!(
                "index  {} / {} documents\n",
                format_number(n),
                format_number(total)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

pub struct NoProgress;

impl IndexProgressReporter for NoProgress {
    fn report(&self, _event: IndexProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IndexProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
        }
    }
}

/// Emit an `Indexing` event roughly every 1% of `total`, plus the last one.
pub fn should_report(n: u64, total: u64) -> bool {
    let step = (total / 100).max(1);
    n == total || n % step == 0
}
