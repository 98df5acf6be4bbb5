//! The framed command/data channel between a worker and the orchestrator.
//!
//! The command stream is line oriented text; a request is everything up to
//! a line containing exactly `ENDOFMESSAGE`. The data stream carries raw
//! bytes whose length is announced on the command stream. The one-shot
//! variant multiplexes both over a single text stream by base64-wrapping
//! data blocks.

use std::io::{self, BufRead, Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::debug;

/// Largest single read from the data stream.
pub const BUF_SIZE: usize = 32768;

pub const END_OF_MESSAGE: &str = "ENDOFMESSAGE";
const DATA_BEGIN: &str = "---BEGIN DATA BASE64---";
const DATA_END: &str = "---END DATA---";

/// Duplex byte stream, either a plain socket or a TLS-wrapped one.
pub trait Channel: Read + Write + Send {}
impl<T: Read + Write + Send> Channel for T {}

pub trait Connector {
    /// Reads one message, without the terminator. A closed peer surfaces
    /// as an error so the worker loop can exit cleanly.
    fn read_message(&mut self) -> io::Result<String>;

    /// Writes `message` plus a newline and flushes.
    fn write_message(&mut self, message: &str) -> io::Result<()>;

    /// Reads up to `min(maxlen, BUF_SIZE)` bytes from the data stream.
    fn read_data(&mut self, maxlen: usize) -> io::Result<Vec<u8>>;

    /// Writes all of `data` to the data stream and flushes.
    fn write_data(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Shuts the channel down at end of connection.
    fn close(&mut self) -> io::Result<()>;

    fn ok(&mut self, message: Option<&str>) -> io::Result<()> {
        match message {
            Some(m) => self.write_message(&format!("TSI_OK\n{m}")),
            None => self.write_message("TSI_OK"),
        }
    }

    /// Reports a failure as a single line on the command stream.
    fn failed(&mut self, message: &str) -> io::Result<()> {
        let msg = format!("TSI_FAILED: {}", message.replace('\n', ":"));
        self.write_message(&msg)
    }
}

/// Connector over a dedicated command socket and data socket.
pub struct SocketConnector {
    command: Box<dyn Channel>,
    data: Box<dyn Channel>,
    // unconsumed bytes already read from the command stream
    pending: Vec<u8>,
}

impl SocketConnector {
    pub fn new(command: Box<dyn Channel>, data: Box<dyn Channel>) -> Self {
        Self {
            command,
            data,
            pending: Vec::new(),
        }
    }

    fn read_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let rest = self.pending.split_off(pos + 1);
                let mut line = std::mem::replace(&mut self.pending, rest);
                line.pop();
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            let mut chunk = [0u8; 4096];
            let n = self.command.read(&mut chunk)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "socket closed",
                ));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }
}

impl Connector for SocketConnector {
    fn read_message(&mut self) -> io::Result<String> {
        let mut message = String::new();
        loop {
            let line = self.read_line()?;
            if line == END_OF_MESSAGE {
                break;
            }
            message.push_str(&line);
            message.push('\n');
        }
        Ok(message)
    }

    fn write_message(&mut self, message: &str) -> io::Result<()> {
        self.command.write_all(message.as_bytes())?;
        self.command.write_all(b"\n")?;
        self.command.flush()
    }

    fn read_data(&mut self, maxlen: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; maxlen.min(BUF_SIZE)];
        let n = self.data.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write_data(&mut self, data: &[u8]) -> io::Result<usize> {
        self.data.write_all(data)?;
        self.data.flush()?;
        Ok(data.len())
    }

    fn close(&mut self) -> io::Result<()> {
        let _ = self.command.flush();
        let _ = self.data.flush();
        // dropping the streams closes the sockets
        self.command = Box::new(io::empty());
        self.data = Box::new(io::empty());
        Ok(())
    }
}

/// Connector over a single text stream pair (stdin/stdout in the one-shot
/// runner). Data blocks travel base64 encoded between framing lines.
pub struct StreamConnector<R: BufRead, W: Write> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> StreamConnector<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn read_until(&mut self, terminator: &str) -> io::Result<String> {
        let mut message = String::new();
        loop {
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "input stream closed",
                ));
            }
            debug!("{}", line.trim_end());
            if line.trim_end() == terminator {
                break;
            }
            message.push_str(&line);
        }
        Ok(message)
    }
}

impl<R: BufRead, W: Write> Connector for StreamConnector<R, W> {
    fn read_message(&mut self) -> io::Result<String> {
        self.read_until(END_OF_MESSAGE)
    }

    fn write_message(&mut self, message: &str) -> io::Result<()> {
        self.output.write_all(message.as_bytes())?;
        self.output.write_all(b"\n")?;
        self.output.flush()
    }

    fn read_data(&mut self, _maxlen: usize) -> io::Result<Vec<u8>> {
        let block = self.read_until(DATA_END)?;
        let Some((header, body)) = block.split_once('\n') else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expected base64 encoded data chunk",
            ));
        };
        if !header.starts_with("---BEGIN DATA BASE64") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expected base64 encoded data chunk",
            ));
        }
        let compact: String = body.split_whitespace().collect();
        BASE64
            .decode(compact.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn write_data(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_message(DATA_BEGIN)?;
        self.write_message(&BASE64.encode(data))?;
        self.write_message(DATA_END)?;
        Ok(data.len())
    }

    fn close(&mut self) -> io::Result<()> {
        // the process owns stdin/stdout, flushing is all there is to do
        self.output.flush()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// In-memory connector recording everything written, for handler
    /// tests.
    #[derive(Default)]
    pub struct MockConnector {
        pub control_out: String,
        pub data_out: Vec<u8>,
        pub control_in: Vec<String>,
        pub data_in: Vec<u8>,
        pub closed: bool,
    }

    impl MockConnector {
        pub fn with_data(data: &[u8]) -> Self {
            Self {
                data_in: data.to_vec(),
                ..Default::default()
            }
        }
    }

    impl Connector for MockConnector {
        fn read_message(&mut self) -> io::Result<String> {
            if self.control_in.is_empty() {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "closed"));
            }
            Ok(self.control_in.remove(0))
        }

        fn write_message(&mut self, message: &str) -> io::Result<()> {
            self.control_out.push_str(message);
            self.control_out.push('\n');
            Ok(())
        }

        fn read_data(&mut self, maxlen: usize) -> io::Result<Vec<u8>> {
            let n = maxlen.min(BUF_SIZE).min(self.data_in.len());
            let rest = self.data_in.split_off(n);
            Ok(std::mem::replace(&mut self.data_in, rest))
        }

        fn write_data(&mut self, data: &[u8]) -> io::Result<usize> {
            self.data_out.extend_from_slice(data);
            Ok(data.len())
        }

        fn close(&mut self) -> io::Result<()> {
            self.closed = true;
            Ok(())
        }
    }
}
