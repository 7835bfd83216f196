//! Serial and TCP transport for bootloader links.
//!
//! A bootloader is reached either through a character device (a USB serial
//! adapter, already configured for the link's baud rate) or through a TCP
//! socket bridged to a device or emulator UART.
//!
//! Character devices have no readiness notification usable by the runtime,
//! so [`SerialDevice`] splits the descriptor: a reader thread blocks in
//! `read` and forwards bytes over a channel, and a writer thread performs
//! writes. A response read that times out leaves nothing in flight, so the
//! next write goes out immediately.

use crate::error::{AbortReason, TransferError};
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::thread;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Bytes buffered between the reader thread and the session
const READ_QUEUE_DEPTH: usize = 64;

/// Serial character device driven by dedicated reader and writer threads
pub struct SerialDevice {
    incoming: mpsc::Receiver<io::Result<Bytes>>,
    pending: Bytes,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    written: mpsc::UnboundedReceiver<io::Result<()>>,
    in_flight: usize,
}

impl SerialDevice {
    /// Open a character device for reading and writing
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        debug!("Opened serial device {}", path.as_ref().display());
        Self::from_file(file)
    }

    /// Drive an already open descriptor
    ///
    /// The reader thread stays parked in `read` until the peer sends data or
    /// the descriptor reports EOF or an error.
    pub fn from_file(file: File) -> io::Result<Self> {
        let mut reader = file.try_clone()?;
        let mut writer = file;

        let (in_tx, incoming) = mpsc::channel(READ_QUEUE_DEPTH);
        thread::Builder::new()
            .name("fwup-serial-rx".to_string())
            .spawn(move || {
                let mut buf = [0u8; 256];
                loop {
                    let item = match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => Ok(Bytes::copy_from_slice(&buf[..n])),
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => Err(e),
                    };
                    let failed = item.is_err();
                    if in_tx.blocking_send(item).is_err() || failed {
                        break;
                    }
                }
            })?;

        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (done_tx, written) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name("fwup-serial-tx".to_string())
            .spawn(move || {
                while let Some(data) = out_rx.blocking_recv() {
                    let result = writer.write_all(&data).and_then(|_| writer.flush());
                    if done_tx.send(result).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            incoming,
            pending: Bytes::new(),
            outgoing,
            written,
            in_flight: 0,
        })
    }
}

impl AsyncRead for SerialDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pending.is_empty() {
            match ready!(this.incoming.poll_recv(cx)) {
                Some(Ok(data)) => this.pending = data,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                // Reader thread gone: EOF
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = std::cmp::min(buf.remaining(), this.pending.len());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for SerialDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.outgoing.send(buf.to_vec()).is_err() {
            return Poll::Ready(Err(ErrorKind::BrokenPipe.into()));
        }
        this.in_flight += 1;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.in_flight > 0 {
            match ready!(this.written.poll_recv(cx)) {
                Some(result) => {
                    this.in_flight -= 1;
                    result?;
                }
                None => return Poll::Ready(Err(ErrorKind::BrokenPipe.into())),
            }
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

/// Unified stream type for the supported links
pub enum IoStream {
    /// TCP bridge to a device or emulator
    Tcp(TcpStream),
    /// Serial character device
    Device(SerialDevice),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Device(dev) => Pin::new(dev).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Device(dev) => Pin::new(dev).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Device(dev) => Pin::new(dev).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Device(dev) => Pin::new(dev).poll_shutdown(cx),
        }
    }
}

/// Open a serial character device for reading and writing
pub async fn open_device<P: AsRef<Path>>(path: P) -> tokio::io::Result<IoStream> {
    let path = path.as_ref().to_path_buf();
    let device = tokio::task::spawn_blocking(move || SerialDevice::open(path))
        .await
        .map_err(|e| io::Error::new(ErrorKind::Other, e))??;
    Ok(IoStream::Device(device))
}

/// Connect to a TCP bridge
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<IoStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(IoStream::Tcp(stream))
}

fn classify(err: io::Error) -> TransferError {
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted => TransferError::Aborted(AbortReason::TransportClosed),
        _ => TransferError::Io(err),
    }
}

/// Half-duplex request/response wrapper around a byte stream
pub struct AckChannel<S> {
    stream: S,
    bytes_written: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AckChannel<S> {
    /// Wrap a stream
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            bytes_written: 0,
        }
    }

    /// Write a whole unit and flush it to the link
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        self.stream.write_all(bytes).await.map_err(classify)?;
        self.stream.flush().await.map_err(classify)?;
        self.bytes_written += bytes.len() as u64;
        trace!("Wrote {} bytes", bytes.len());
        Ok(())
    }

    /// Read one response byte; `None` when nothing arrives within `wait`
    pub async fn read_byte(&mut self, wait: Duration) -> Result<Option<u8>, TransferError> {
        match tokio::time::timeout(wait, self.stream.read_u8()).await {
            Ok(Ok(byte)) => {
                trace!("Read response {:#04x}", byte);
                Ok(Some(byte))
            }
            Ok(Err(e)) => Err(classify(e)),
            Err(_) => Ok(None),
        }
    }

    /// Total bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Release the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}
