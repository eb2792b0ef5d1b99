//! Progress sink for the pipeline loop, decoupled from any particular
//! surface (CLI today, conceivably a TUI or log sink later).

/// Three severities, no return value — a reporter is a sink, not a
/// result-bearing capability.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Writes `[info]`/`[warn]`/`[error]`-prefixed lines to stderr.
pub struct StderrReporter;

impl Reporter for StderrReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}
