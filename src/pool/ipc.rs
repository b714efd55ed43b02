//! Line-oriented JSON messaging over pipes.
//!
//! Messages are serialized as one JSON document per line. Reads and writes retry on
//! EINTR, which matters here: the controller installs a SIGINT handler while a pool is
//! alive, so blocking pipe calls are routinely interrupted.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Buffer size for pipe I/O (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// An owned pipe end with EINTR-safe `Read`/`Write`.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: impl Into<OwnedFd>) -> Self {
        Self { fd: fd.into() }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads newline-delimited messages.
pub struct MessageReader {
    reader: BufReader<PipeFd>,
    line: String,
}

impl MessageReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(BUFFER_SIZE, fd),
            line: String::with_capacity(4096),
        }
    }

    /// Read one line without its terminator. `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }
        if self.line.ends_with('\n') {
            self.line.pop();
        }
        if self.line.ends_with('\r') {
            self.line.pop();
        }
        Ok(Some(&self.line))
    }

    /// Read and decode one message. `None` on EOF; blank lines are skipped.
    pub fn read_message<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        loop {
            match self.read_line()? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    return serde_json::from_str(line)
                        .map(Some)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
                }
            }
        }
    }
}

/// Writes newline-delimited messages, flushing after each.
pub struct MessageWriter {
    writer: BufWriter<PipeFd>,
}

impl MessageWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(BUFFER_SIZE, fd),
        }
    }

    /// Write a line (appending the newline if missing) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }

    /// Encode and send one message.
    pub fn write_message<T: Serialize>(&mut self, message: &T) -> io::Result<()> {
        let line = serde_json::to_string(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.write_line(&line)
    }
}
