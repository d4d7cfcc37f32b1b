//! Newline-delimited pipe I/O between the controller and its workers.
//!
//! Reads and writes retry on EINTR. A reader can also wait for readiness with
//! a timeout, so a supervisor polls for a reply instead of blocking on a peer
//! that may already be dead.

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::time::Duration;

/// Pipe buffer capacity on both sides.
const PIPE_BUFFER: usize = 64 * 1024;

/// Run a syscall until it is not interrupted.
fn retry_eintr<T>(mut call: impl FnMut() -> nix::Result<T>) -> io::Result<T> {
    loop {
        match call() {
            Err(Errno::EINTR) => continue,
            other => return other.map_err(io::Error::from),
        }
    }
}

/// One end of a pipe.
pub struct PipeFd(OwnedFd);

/// Create a pipe, returning `(read_end, write_end)`.
pub fn pipe() -> nix::Result<(PipeFd, PipeFd)> {
    let (read_end, write_end) = nix::unistd::pipe()?;
    Ok((PipeFd(read_end), PipeFd(write_end)))
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        retry_eintr(|| nix::unistd::read(&self.0, buf))
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        retry_eintr(|| nix::unistd::write(&self.0, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads one message line at a time.
pub struct LineReader {
    reader: BufReader<PipeFd>,
    line: String,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(PIPE_BUFFER, fd),
            line: String::new(),
        }
    }

    /// Next line without its terminator, or `None` at EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }
        let len = self.line.trim_end_matches(['\n', '\r']).len();
        self.line.truncate(len);
        Ok(Some(&self.line))
    }

    /// Wait until a read would not block: buffered data, new data, or EOF.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        if !self.reader.buffer().is_empty() {
            return Ok(true);
        }
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let ready = retry_eintr(|| {
            let mut fds = [PollFd::new(self.reader.get_ref().as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, PollTimeout::from(millis))
        })?;
        Ok(ready > 0)
    }
}

impl AsFd for LineReader {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.get_ref().as_fd()
    }
}

/// Writes one message line at a time, flushing after each.
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(PIPE_BUFFER, fd),
        }
    }

    /// Write `line` plus a newline if it lacks one, then flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }
}

impl AsFd for LineWriter {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.writer.get_ref().as_fd()
    }
}
