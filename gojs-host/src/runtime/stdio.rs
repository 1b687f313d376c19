//! Guest output, split into lines per file descriptor.
//!
//! Bytes written by the guest are buffered until a newline so that a line
//! produced by several `write` calls reaches the sink in one piece.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    io::Write,
    rc::Rc,
};

pub trait OutputSink {
    fn line(&mut self, fd: i64, line: &str);
}

/// Forwards guest output to the `log` facade: stdout at info, anything else
/// at warn.
#[derive(Default)]
pub struct LogSink;

impl OutputSink for LogSink {
    fn line(&mut self, fd: i64, line: &str) {
        match fd {
            1 => log::info!(target: "guest", "{line}"),
            _ => log::warn!(target: "guest", "[fd {fd}] {line}"),
        }
    }
}

/// Writes guest output to the process's own stdout and stderr.
#[derive(Default)]
pub struct ProcessSink;

impl OutputSink for ProcessSink {
    fn line(&mut self, fd: i64, line: &str) {
        let res = match fd {
            1 => writeln!(std::io::stdout().lock(), "{line}"),
            _ => writeln!(std::io::stderr().lock(), "{line}"),
        };
        if let Err(e) = res {
            log::warn!("failed to forward guest output on fd {fd}: {e}");
        }
    }
}

/// Collects lines in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct CaptureSink {
    lines: Rc<RefCell<Vec<(i64, String)>>>,
}

impl CaptureSink {
    pub fn lines(&self) -> Vec<(i64, String)> {
        self.lines.borrow().clone()
    }
    /// Every line written to `fd`, each followed by a newline.
    pub fn text(&self, fd: i64) -> String {
        self.lines
            .borrow()
            .iter()
            .filter(|(f, _)| *f == fd)
            .fold(String::new(), |mut acc, (_, l)| {
                acc.push_str(l);
                acc.push('\n');
                acc
            })
    }
}

impl OutputSink for CaptureSink {
    fn line(&mut self, fd: i64, line: &str) {
        self.lines.borrow_mut().push((fd, line.to_string()));
    }
}

/// Bytes a file descriptor may buffer without seeing a newline.
pub const MAX_PENDING_LINE: usize = 64 * 1024;

pub struct Stdio {
    pending: BTreeMap<i64, Vec<u8>>,
    sink: Box<dyn OutputSink>,
}

impl Default for Stdio {
    fn default() -> Self {
        Self::new(LogSink)
    }
}

impl Stdio {
    pub fn new(sink: impl OutputSink + 'static) -> Self {
        Self {
            pending: BTreeMap::new(),
            sink: Box::new(sink),
        }
    }

    /// Append raw bytes for `fd`, emitting every completed line. A partial
    /// line longer than [`MAX_PENDING_LINE`] is emitted as it stands.
    pub fn write(&mut self, fd: i64, bytes: &[u8]) {
        let buf = self.pending.entry(fd).or_default();
        buf.extend_from_slice(bytes);
        if let Some(last_nl) = buf.iter().rposition(|b| *b == b'\n') {
            let rest = buf.split_off(last_nl + 1);
            let done = std::mem::replace(buf, rest);
            let text = String::from_utf8_lossy(&done[..last_nl]);
            for line in text.split('\n') {
                self.sink.line(fd, line);
            }
        }
        let buf = self.pending.entry(fd).or_default();
        if buf.len() >= MAX_PENDING_LINE {
            // hold back a truncated trailing char
            let keep = match std::str::from_utf8(buf) {
                Err(e) if e.error_len().is_none() => buf.len() - e.valid_up_to(),
                _ => 0,
            };
            let rest = buf.split_off(buf.len() - keep);
            let done = std::mem::replace(buf, rest);
            self.sink.line(fd, &String::from_utf8_lossy(&done));
        }
    }

    /// Emit a complete line, after whatever is pending on `fd`.
    pub fn write_line(&mut self, fd: i64, line: &str) {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.write(fd, &bytes);
    }

    /// Emit partial lines still buffered.
    pub fn flush(&mut self) {
        for (fd, buf) in std::mem::take(&mut self.pending) {
            if !buf.is_empty() {
                self.sink.line(fd, &String::from_utf8_lossy(&buf));
            }
        }
    }
}
