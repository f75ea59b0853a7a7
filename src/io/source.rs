//! Raw sensor line sources
//!
//! A doorway reads newline-terminated text from one of:
//! - a serial port (microcontroller at 9600 baud by default)
//! - this process's stdin
//! - the stdout of a spawned command (e.g. the sensor simulator)
//!
//! Bytes are decoded lossily so a burst of line noise yields one unparseable
//! line instead of ending the stream.

use crate::infra::config::SourceConfig;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

/// Longest line kept; anything longer is truncated before parsing
const MAX_LINE_BYTES: usize = 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

pub struct LineSource {
    reader: BufReader<BoxedReader>,
    buf: Vec<u8>,
    // Held so the child is killed when the source is dropped
    _child: Option<Child>,
    label: String,
}

impl LineSource {
    /// Wrap any async reader
    pub fn from_reader<R>(reader: R, label: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            reader: BufReader::new(Box::new(reader) as BoxedReader),
            buf: Vec::with_capacity(MAX_LINE_BYTES),
            _child: None,
            label: label.into(),
        }
    }

    /// Open the configured source
    pub fn open(config: &SourceConfig) -> io::Result<Self> {
        match config {
            SourceConfig::Serial { device, baud, .. } => {
                let port = tokio_serial::new(device, *baud)
                    .timeout(Duration::from_millis(100))
                    .open_native_async()
                    .map_err(io::Error::from)?;
                info!(device = %device, baud = %baud, "source_serial_opened");
                Ok(Self::from_reader(port, format!("serial:{device}")))
            }
            SourceConfig::Stdin => {
                info!("source_stdin_opened");
                Ok(Self::from_reader(tokio::io::stdin(), "stdin"))
            }
            SourceConfig::Command { program, args } => {
                let mut child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "child stdout not captured")
                })?;
                info!(program = %program, args = ?args, pid = ?child.id(), "source_command_spawned");
                let mut source = Self::from_reader(stdout, format!("command:{program}"));
                source._child = Some(child);
                Ok(source)
            }
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Next line without its terminator, `None` at end of stream
    ///
    /// At most `MAX_LINE_BYTES` of a line are kept; the rest is skipped up to
    /// the next newline. Cancel safe: bytes are consumed from the reader only
    /// after they are copied into `buf`, which survives to the next call.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            let room = MAX_LINE_BYTES - self.buf.len();
            self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);

            let used = chunk.len() + usize::from(newline.is_some());
            self.reader.consume(used);
            if newline.is_some() {
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> String {
        let mut end = self.buf.len();
        while end > 0 && self.buf[end - 1] == b'\r' {
            end -= 1;
        }
        let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.clear();
        line
    }
}

/// Whether a source should be reopened after it ends
pub fn reconnect_delay(config: &SourceConfig) -> Option<Duration> {
    match config {
        SourceConfig::Serial { reconnect_delay_ms, .. } => {
            Some(Duration::from_millis(*reconnect_delay_ms))
        }
        SourceConfig::Stdin | SourceConfig::Command { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_lines_are_split_and_trimmed() {
        let data: &[u8] = b"A:1;B:0\r\nM:1;S:50;C:700\nA:0;B:1";
        let mut source = LineSource::from_reader(data, "test");

        assert_eq!(source.next_line().await.unwrap().as_deref(), Some("A:1;B:0"));
        assert_eq!(source.next_line().await.unwrap().as_deref(), Some("M:1;S:50;C:700"));
        // Final line without terminator still counts
        assert_eq!(source.next_line().await.unwrap().as_deref(), Some("A:0;B:1"));
        assert_eq!(source.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_end_stream() {
        let data: &[u8] = b"\xff\xfe\n A:1;B:1\n";
        let mut source = LineSource::from_reader(data, "test");

        let garbage = source.next_line().await.unwrap().unwrap();
        assert!(garbage.contains('\u{FFFD}'));
        assert_eq!(source.next_line().await.unwrap().as_deref(), Some(" A:1;B:1"));
    }

    #[tokio::test]
    async fn test_blank_lines_are_returned_empty() {
        let data: &[u8] = b"\n\nA:1;B:0\n";
        let mut source = LineSource::from_reader(data, "test");
        assert_eq!(source.next_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(source.next_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(source.next_line().await.unwrap().as_deref(), Some("A:1;B:0"));
    }

    #[tokio::test]
    async fn test_oversized_line_is_truncated_without_growing_buffer() {
        let mut data = vec![b'x'; 1536 * 1024];
        data.extend_from_slice(b"\r\nA:1;B:0\n");
        let mut source = LineSource::from_reader(std::io::Cursor::new(data), "test");

        let long = source.next_line().await.unwrap().unwrap();
        assert_eq!(long.len(), MAX_LINE_BYTES);
        assert!(source.buf.capacity() <= MAX_LINE_BYTES);

        assert_eq!(source.next_line().await.unwrap().as_deref(), Some("A:1;B:0"));
        assert_eq!(source.next_line().await.unwrap(), None);
        assert!(source.buf.capacity() <= MAX_LINE_BYTES);
    }

    #[tokio::test]
    async fn test_partial_line_survives_cancelled_read() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut source = LineSource::from_reader(rx, "test");

        tx.write_all(b"A:1;").await.unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(20), source.next_line()).await;
        assert!(pending.is_err());

        tx.write_all(b"B:0\n").await.unwrap();
        assert_eq!(source.next_line().await.unwrap().as_deref(), Some("A:1;B:0"));
    }

    #[test]
    fn test_only_serial_reconnects() {
        let serial = SourceConfig::Serial {
            device: "/dev/ttyUSB0".to_string(),
            baud: 9600,
            reconnect_delay_ms: 1500,
        };
        assert_eq!(reconnect_delay(&serial), Some(Duration::from_millis(1500)));
        assert_eq!(reconnect_delay(&SourceConfig::Stdin), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_source_reads_child_stdout() {
        let config = SourceConfig::Command {
            program: "printf".to_string(),
            args: vec!["A:1;B:0\\nA:0;B:1\\n".to_string()],
        };
        let mut source = LineSource::open(&config).unwrap();
        assert_eq!(source.label(), "command:printf");
        assert_eq!(source.next_line().await.unwrap().as_deref(), Some("A:1;B:0"));
        assert_eq!(source.next_line().await.unwrap().as_deref(), Some("A:0;B:1"));
        assert_eq!(source.next_line().await.unwrap(), None);
    }
}
