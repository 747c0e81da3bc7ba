//! Byte sources feeding the read loop.
//!
//! The client never opens anything itself; it pulls from a [`ByteSource`].
//! Adapters are provided for any blocking reader with a read timeout (serial
//! ports, RFCOMM sockets, capture files) and for bytes pushed from another
//! thread over a channel.

use std::io::{ErrorKind, Read};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use log::debug;
use serialport::SerialPort;

use crate::errors::Result;

/// Baud rate of the MindWave Mobile serial profile.
pub const BAUD_RATE: u32 = 57_600;

/// Outcome of one read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` bytes were written to the front of the buffer.
    Data(usize),
    /// Nothing arrived within the source's own read timeout.
    Idle,
    /// The peer closed the link; no more data will come.
    Closed,
}

/// Supplier of raw bytes from the headset link.
///
/// `read_bytes` should block for at most a short timeout before returning
/// [`ReadStatus::Idle`], so the read loop can notice stop requests. An `Err`
/// is terminal for the session.
pub trait ByteSource: Send {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<ReadStatus>;

    /// Release the underlying link. Called once when the read loop exits.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl ByteSource for Box<dyn ByteSource> {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<ReadStatus> {
        (**self).read_bytes(buf)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Adapter for any [`Read`] implementation.
///
/// `Ok(0)` means the link closed; `WouldBlock`, `TimedOut` and `Interrupted`
/// mean no data yet. Closing drops the reader, which closes file descriptors.
pub struct IoSource<R> {
    inner: Option<R>,
}

impl<R: Read + Send> IoSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: Some(reader),
        }
    }
}

impl<R: Read + Send> ByteSource for IoSource<R> {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<ReadStatus> {
        let Some(reader) = self.inner.as_mut() else {
            return Ok(ReadStatus::Closed);
        };
        match reader.read(buf) {
            Ok(0) => Ok(ReadStatus::Closed),
            Ok(n) => Ok(ReadStatus::Data(n)),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(ReadStatus::Idle)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.inner = None;
        Ok(())
    }
}

/// Open a serial device such as `/dev/rfcomm0` or a USB dongle port.
///
/// `timeout` bounds each read; see [`ByteSource`].
pub fn open_serial(path: &str, timeout: Duration) -> Result<IoSource<Box<dyn SerialPort>>> {
    debug!("opening serial port: path={}, baud={}", path, BAUD_RATE);
    let port = serialport::new(path, BAUD_RATE).timeout(timeout).open()?;
    Ok(IoSource::new(port))
}

/// Source fed with byte chunks from another thread or runtime.
///
/// Dropping every [`Sender`] closes the source once buffered chunks are read.
pub struct ChannelSource {
    rx: Receiver<Vec<u8>>,
    poll: Duration,
    pending: Vec<u8>,
    closed: bool,
}

impl ChannelSource {
    /// Create a source and its feeding end. `poll` bounds each read.
    pub fn channel(poll: Duration) -> (Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel();
        let source = Self {
            rx,
            poll,
            pending: Vec::new(),
            closed: false,
        };
        (tx, source)
    }
}

impl ByteSource for ChannelSource {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<ReadStatus> {
        if self.pending.is_empty() {
            if self.closed {
                return Ok(ReadStatus::Closed);
            }
            match self.rx.recv_timeout(self.poll) {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Timeout) => return Ok(ReadStatus::Idle),
                Err(RecvTimeoutError::Disconnected) => {
                    self.closed = true;
                    return Ok(ReadStatus::Closed);
                }
            }
        }

        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(ReadStatus::Data(n))
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    struct Stalling;

    impl Read for Stalling {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(ErrorKind::TimedOut, "no data"))
        }
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(ErrorKind::ConnectionReset, "link lost"))
        }
    }

    #[test]
    fn test_io_source_reports_data_then_closed() {
        let mut source = IoSource::new(Cursor::new(vec![1u8, 2, 3]));
        let mut buf = [0u8; 2];
        assert_eq!(source.read_bytes(&mut buf).unwrap(), ReadStatus::Data(2));
        assert_eq!(source.read_bytes(&mut buf).unwrap(), ReadStatus::Data(1));
        assert_eq!(source.read_bytes(&mut buf).unwrap(), ReadStatus::Closed);
    }

    #[test]
    fn test_io_source_maps_timeouts_and_errors() {
        let mut buf = [0u8; 4];
        assert_eq!(
            IoSource::new(Stalling).read_bytes(&mut buf).unwrap(),
            ReadStatus::Idle
        );
        assert!(IoSource::new(Broken).read_bytes(&mut buf).is_err());

        let mut closed = IoSource::new(Stalling);
        closed.close().unwrap();
        assert_eq!(closed.read_bytes(&mut buf).unwrap(), ReadStatus::Closed);
    }

    #[test]
    fn test_channel_source_splits_chunks_and_closes() {
        let (tx, mut source) = ChannelSource::channel(Duration::from_millis(5));
        let mut buf = [0u8; 3];

        assert_eq!(source.read_bytes(&mut buf).unwrap(), ReadStatus::Idle);

        tx.send(vec![1, 2, 3, 4, 5]).unwrap();
        drop(tx);
        assert_eq!(source.read_bytes(&mut buf).unwrap(), ReadStatus::Data(3));
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(source.read_bytes(&mut buf).unwrap(), ReadStatus::Data(2));
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(source.read_bytes(&mut buf).unwrap(), ReadStatus::Closed);
    }
}
