use std::{collections::VecDeque, path::Path};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{
    fs::File,
    io::{self, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    sync::mpsc,
};
use tracing::debug;

const READ_CHUNK: usize = 4096;

/// Splits a byte stream into lines.
/// LF and CR both terminate a line, CR LF counts once.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
    after_cr: bool,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            match byte {
                b'\n' if self.after_cr => self.after_cr = false,
                b'\n' | b'\r' => {
                    lines.push(self.take());
                    self.after_cr = byte == b'\r';
                }
                _ => {
                    self.after_cr = false;
                    self.partial.push(byte);
                }
            }
        }
        lines
    }

    /// unterminated rest of the stream, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        line
    }
}

/// continuously reads a process output stream and sends it line by line
/// read errors end the stream, a pty master reports EIO once the child is gone
pub async fn read_lines<A: AsyncRead + std::marker::Unpin>(
    mut stream: A,
    lines_sender: mpsc::UnboundedSender<String>,
) {
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.feed(&buf[..n]) {
                    if lines_sender.send(line).is_err() {
                        return;
                    }
                }
            }
            Err(io_error) if io_error.kind() == io::ErrorKind::Interrupted => continue,
            Err(io_error) => {
                debug!("output stream closed: {}", io_error);
                break;
            }
        }
    }
    if let Some(rest) = splitter.finish() {
        let _ = lines_sender.send(rest);
    }
}

/// last `limit` lines of a persisted job log, empty if the file is missing
pub async fn read_log_tail(path: &Path, limit: usize) -> Vec<String> {
    if limit == 0 {
        return Vec::new();
    }
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(io_error) => {
            debug!("no log file at {}: {}", path.display(), io_error);
            return Vec::new();
        }
    };
    let mut tail = VecDeque::with_capacity(limit.min(READ_CHUNK));
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                if tail.len() == limit {
                    tail.pop_front();
                }
                tail.push_back(line.trim_end_matches(['\n', '\r']).to_string());
            }
            Err(io_error) => {
                debug!("stopped reading {}: {}", path.display(), io_error);
                break;
            }
        }
    }
    tail.into()
}

/// ask a process to terminate
pub fn terminate_pid(pid: u32) -> nix::Result<()> {
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_lf_and_cr() {
        let mut splitter = LineSplitter::new();
        assert_eq!(vec!["one", "two"], splitter.feed(b"one\ntwo\nthr"));
        assert_eq!(vec!["three", "10%", "20%"], splitter.feed(b"ee\n10%\r20%\r"));
        assert_eq!(None, splitter.finish());
    }

    // pty output ends lines with CR LF
    #[test]
    fn test_split_crlf_once() {
        let mut splitter = LineSplitter::new();
        assert_eq!(vec!["a", "b"], splitter.feed(b"a\r\nb\r"));
        assert_eq!(vec!["", "c"], splitter.feed(b"\n\nc\n"));
    }

    #[test]
    fn test_split_partial_flush() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.feed(b"no newline").is_empty());
        assert_eq!(Some("no newline".to_string()), splitter.finish());
        assert_eq!(None, splitter.finish());
    }

    #[test]
    fn test_split_multibyte_across_chunks() {
        let mut splitter = LineSplitter::new();
        let bytes = "temp 21°C\n".as_bytes();
        assert!(splitter.feed(&bytes[..7]).is_empty());
        assert_eq!(vec!["temp 21°C"], splitter.feed(&bytes[7..]));
    }
}
