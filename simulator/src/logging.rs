use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tracing_subscriber::fmt::writer::MakeWriter;

/// Tees formatted log lines to stdout and, optionally, a file.
#[derive(Clone)]
pub(crate) struct LogWriter {
    file: Option<Arc<Mutex<File>>>,
}

impl LogWriter {
    pub(crate) fn new(path: Option<PathBuf>) -> io::Result<Self> {
        let file = path
            .map(|path| File::create(path).map(|f| Arc::new(Mutex::new(f))))
            .transpose()?;
        Ok(Self { file })
    }
}

pub(crate) struct LogWriterGuard {
    file: Option<Arc<Mutex<File>>>,
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriterGuard {
            file: self.file.clone(),
        }
    }
}

impl Write for LogWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        if let Some(file) = &self.file {
            file.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        if let Some(file) = &self.file {
            file.lock().unwrap_or_else(PoisonError::into_inner).flush()?;
        }
        Ok(())
    }
}

/// Keeps the first `head` and the last `tail` step lines so a failure can be replayed by eye
/// without logging every step.
pub(crate) struct EventLog {
    head: Vec<String>,
    head_limit: usize,
    tail: VecDeque<String>,
    tail_limit: usize,
    skipped: u64,
}

impl EventLog {
    pub(crate) fn new(head_limit: usize, tail_limit: usize) -> Self {
        Self {
            head: Vec::with_capacity(head_limit),
            head_limit,
            tail: VecDeque::with_capacity(tail_limit),
            tail_limit,
            skipped: 0,
        }
    }

    pub(crate) fn record(&mut self, line: String) {
        if self.head.len() < self.head_limit {
            self.head.push(line);
            return;
        }
        if self.tail_limit == 0 {
            self.skipped += 1;
            return;
        }
        if self.tail.len() == self.tail_limit {
            self.tail.pop_front();
            self.skipped += 1;
        }
        self.tail.push_back(line);
    }

    pub(crate) fn dump_failure(&self, reason: &str) {
        tracing::error!("invariant violated: {reason}");
        for line in &self.head {
            tracing::error!("  {line}");
        }
        if self.skipped > 0 {
            tracing::error!("  ... {} steps omitted ...", self.skipped);
        }
        for line in &self.tail {
            tracing::error!("  {line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_head_and_tail() {
        let mut log = EventLog::new(2, 2);
        for i in 0..7 {
            log.record(format!("step {i}"));
        }
        assert_eq!(log.head, vec!["step 0", "step 1"]);
        assert_eq!(log.tail, vec!["step 5", "step 6"]);
        assert_eq!(log.skipped, 3);
    }
}
