//! Transfer session driving a bundle to a bootloader.
//!
//! One session owns the link and every counter of a single transfer. The
//! protocol is strictly half-duplex: each write is followed by a blocking
//! read of exactly one response byte before anything else is written.
//!
//! ```text
//! Idle -> Handshaking -> SendingChunk(i) -> SendingFrame(i, j) -> ... -> Done
//!                     \_____________________ any failure ______________/-> Aborted
//! ```

use crate::error::{Phase, TransferError};
use crate::handshake::handshake;
use crate::retry::{RejectBudget, DEFAULT_MAX_CONSECUTIVE_REJECTS};
use crate::transport::AckChannel;
use bytes::Bytes;
use fwup_bundle::{BundleLayout, EncryptedChunk};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Response accepting metadata or a frame
pub const ACK_OK: u8 = 0x00;

/// Response rejecting a frame
pub const ACK_REJECT: u8 = 0x01;

/// Maximum ciphertext bytes per wire frame
pub const FRAME_SIZE: usize = 16;

/// Zero-length terminator telling the bootloader to finish its page
pub const FINALIZE_FRAME: [u8; 2] = 0u16.to_le_bytes();

/// Classified response byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// `0x00`
    Accept,
    /// `0x01`
    Reject,
    /// Anything else
    Other(u8),
}

impl From<u8> for Ack {
    fn from(value: u8) -> Self {
        match value {
            ACK_OK => Ack::Accept,
            ACK_REJECT => Ack::Reject,
            other => Ack::Other(other),
        }
    }
}

/// Configuration for a transfer session
#[derive(Clone, Debug)]
pub struct TransferConfig {
    /// Wait for each response byte
    pub read_timeout: Duration,
    /// Interval between handshake sentinels
    pub handshake_poll: Duration,
    /// Give up on the handshake after this long
    pub handshake_timeout: Duration,
    /// Consecutive frame rejects tolerated before aborting
    pub max_consecutive_rejects: u32,
    /// Ciphertext bytes per wire frame
    pub frame_size: usize,
    /// Repeat the handshake before every record's metadata
    pub handshake_every_record: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(2),
            handshake_poll: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(60),
            max_consecutive_rejects: DEFAULT_MAX_CONSECUTIVE_REJECTS,
            frame_size: FRAME_SIZE,
            handshake_every_record: false,
        }
    }
}

/// Protocol state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Nothing sent yet
    Idle,
    /// Waiting for the sentinel echo
    Handshaking,
    /// Metadata of a chunk in flight
    SendingChunk {
        /// Chunk being sent
        chunk_index: i16,
    },
    /// A frame of a chunk in flight
    SendingFrame {
        /// Chunk being sent
        chunk_index: i16,
        /// Frame within the chunk
        frame_index: usize,
    },
    /// Terminator written
    Done,
    /// Transfer failed; restart from the handshake
    Aborted,
}

/// Statistics for a transfer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Records whose metadata and frames were all accepted
    pub chunks_sent: u32,
    /// Frames accepted by the bootloader
    pub frames_sent: u32,
    /// Frame rejects over the whole transfer
    pub frames_rejected: u32,
    /// Bytes written to the link, including resends
    pub bytes_sent: u64,
}

/// A single transfer of one bundle over one link
pub struct TransferSession<S> {
    config: TransferConfig,
    channel: AckChannel<S>,
    state: TransferState,
    budget: RejectBudget,
    stats: TransferStats,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TransferSession<S> {
    /// Create a session over an open link
    pub fn new(config: TransferConfig, stream: S) -> Self {
        let budget = RejectBudget::new(config.max_consecutive_rejects);
        Self {
            config,
            channel: AckChannel::new(stream),
            state: TransferState::Idle,
            budget,
            stats: TransferStats::default(),
        }
    }

    /// Current protocol state
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Statistics of the current or last transfer
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// Reject budget of the current or last transfer
    pub fn budget(&self) -> &RejectBudget {
        &self.budget
    }

    /// Release the underlying link
    pub fn into_inner(self) -> S {
        self.channel.into_inner()
    }

    /// Stream a bundle to the bootloader from the handshake onwards
    pub async fn run(&mut self, bundle: &Bytes) -> Result<TransferStats, TransferError> {
        self.budget.reset();
        self.stats = TransferStats::default();
        self.state = TransferState::Idle;
        let base_bytes = self.channel.bytes_written();

        let result = self.run_inner(bundle).await;
        self.stats.bytes_sent = self.channel.bytes_written() - base_bytes;

        match result {
            Ok(()) => Ok(self.stats.clone()),
            Err(e) => {
                warn!("Transfer failed in state {:?}: {}", self.state, e);
                self.transition(TransferState::Aborted);
                Err(e)
            }
        }
    }

    async fn run_inner(&mut self, bundle: &Bytes) -> Result<(), TransferError> {
        let layout = BundleLayout::from_bundle(bundle)?;
        info!(
            version = layout.version,
            size = layout.total_plain_size,
            chunks = layout.num_chunks(),
            "Starting transfer"
        );

        self.enter_update_mode().await?;
        for (i, record) in layout.records().enumerate() {
            if i > 0 && self.config.handshake_every_record {
                self.enter_update_mode().await?;
            }
            self.send_chunk(record).await?;
        }

        self.channel.send(&FINALIZE_FRAME).await?;
        self.transition(TransferState::Done);
        info!(
            frames = self.stats.frames_sent,
            rejects = self.stats.frames_rejected,
            "Done writing firmware"
        );
        Ok(())
    }

    async fn enter_update_mode(&mut self) -> Result<(), TransferError> {
        self.transition(TransferState::Handshaking);
        let attempts = handshake(
            &mut self.channel,
            self.config.handshake_poll,
            self.config.handshake_timeout,
        )
        .await?;
        debug!(attempts, "Bootloader in update mode");
        Ok(())
    }

    async fn send_chunk(&mut self, record: &EncryptedChunk) -> Result<(), TransferError> {
        let chunk_index = record.header.chunk_index;
        self.transition(TransferState::SendingChunk { chunk_index });

        self.channel.send(&record.metadata()).await?;
        match self.channel.read_byte(self.config.read_timeout).await? {
            None => {
                return Err(TransferError::Timeout {
                    phase: Phase::Metadata,
                    chunk_index: Some(chunk_index),
                })
            }
            Some(byte) if Ack::from(byte) != Ack::Accept => {
                return Err(TransferError::ProtocolViolation {
                    chunk_index,
                    frame_index: None,
                    byte,
                })
            }
            Some(_) => {}
        }

        for (frame_index, frame) in record
            .ciphertext
            .chunks(self.config.frame_size.max(1))
            .enumerate()
        {
            self.send_frame(chunk_index, frame_index, frame).await?;
        }

        self.stats.chunks_sent += 1;
        if record.header.is_release_message() {
            info!("Release message accepted");
        } else {
            info!(chunk = chunk_index, "Chunk accepted");
        }
        Ok(())
    }

    async fn send_frame(
        &mut self,
        chunk_index: i16,
        frame_index: usize,
        frame: &[u8],
    ) -> Result<(), TransferError> {
        self.transition(TransferState::SendingFrame {
            chunk_index,
            frame_index,
        });

        loop {
            match self.try_frame(chunk_index, frame_index, frame).await {
                Ok(()) => {
                    self.budget.record_accept();
                    self.stats.frames_sent += 1;
                    return Ok(());
                }
                Err(TransferError::FrameRejected { .. }) => {
                    self.stats.frames_rejected += 1;
                    self.budget.record_reject(chunk_index, frame_index)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_frame(
        &mut self,
        chunk_index: i16,
        frame_index: usize,
        frame: &[u8],
    ) -> Result<(), TransferError> {
        self.channel.send(frame).await?;
        let response = self.channel.read_byte(self.config.read_timeout).await?;
        debug!(
            chunk = chunk_index,
            frame = frame_index,
            len = frame.len(),
            ack = ?response.map(Ack::from),
            "Frame written"
        );

        match response {
            None => Err(TransferError::Timeout {
                phase: Phase::Frame,
                chunk_index: Some(chunk_index),
            }),
            Some(byte) => match Ack::from(byte) {
                Ack::Accept => Ok(()),
                Ack::Reject => Err(TransferError::FrameRejected {
                    chunk_index,
                    frame_index,
                }),
                Ack::Other(byte) => Err(TransferError::ProtocolViolation {
                    chunk_index,
                    frame_index: Some(frame_index),
                    byte,
                }),
            },
        }
    }

    fn transition(&mut self, next: TransferState) {
        debug!("Transfer state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AbortReason;
    use crate::handshake::HANDSHAKE_BYTE;
    use fwup_bundle::{encode, BundleKey, ChunkHeader, CHUNK_HEADER_SIZE, RECORD_PREFIX_SIZE};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    /// What the simulated bootloader saw on the line
    #[derive(Debug, Default)]
    struct DeviceLog {
        handshakes: usize,
        headers: Vec<ChunkHeader>,
        frame_writes: usize,
        ciphertexts: Vec<Vec<u8>>,
        terminated: bool,
    }

    /// Simulated bootloader: echoes the handshake, answers metadata with
    /// `meta_ack` and each frame with the next byte from `frame_acks`
    /// (accepting once the script runs out).
    fn spawn_device(
        io: DuplexStream,
        meta_ack: u8,
        frame_acks: Vec<u8>,
    ) -> JoinHandle<DeviceLog> {
        spawn_device_with(io, meta_ack, frame_acks, false)
    }

    /// Like [`spawn_device`]; with `handshake_each_record` the device also
    /// expects a sentinel before every record after the first.
    fn spawn_device_with(
        mut io: DuplexStream,
        meta_ack: u8,
        frame_acks: Vec<u8>,
        handshake_each_record: bool,
    ) -> JoinHandle<DeviceLog> {
        tokio::spawn(async move {
            let mut log = DeviceLog::default();
            let mut script = frame_acks.into_iter();

            'transfer: loop {
                let mut first_record = true;
                loop {
                    if first_record || handshake_each_record {
                        loop {
                            match io.read_u8().await {
                                Ok(HANDSHAKE_BYTE) => break,
                                Ok(_) => continue,
                                Err(_) => return log,
                            }
                        }
                        if io.write_u8(HANDSHAKE_BYTE).await.is_err() {
                            return log;
                        }
                        log.handshakes += 1;
                        first_record = false;
                    }

                    let mut meta = [0u8; RECORD_PREFIX_SIZE];
                    if io.read_exact(&mut meta).await.is_err() {
                        return log;
                    }
                    let header = ChunkHeader::decode(&meta[..CHUNK_HEADER_SIZE]).unwrap();
                    log.headers.push(header);
                    if io.write_u8(meta_ack).await.is_err() || meta_ack != ACK_OK {
                        return log;
                    }

                    let mut ciphertext = Vec::new();
                    while ciphertext.len() < header.ciphertext_len() {
                        let len =
                            std::cmp::min(FRAME_SIZE, header.ciphertext_len() - ciphertext.len());
                        let mut frame = vec![0u8; len];
                        if io.read_exact(&mut frame).await.is_err() {
                            return log;
                        }
                        log.frame_writes += 1;

                        let ack = script.next().unwrap_or(ACK_OK);
                        if io.write_u8(ack).await.is_err() {
                            return log;
                        }
                        if ack == ACK_OK {
                            ciphertext.extend_from_slice(&frame);
                        }
                    }
                    log.ciphertexts.push(ciphertext);

                    if header.is_release_message() {
                        let mut term = [0xFFu8; 2];
                        if io.read_exact(&mut term).await.is_err() {
                            return log;
                        }
                        log.terminated = term == FINALIZE_FRAME;
                        continue 'transfer;
                    }
                }
            }
        })
    }

    fn message_only_bundle() -> Bytes {
        encode(&Bytes::new(), 1, "", &BundleKey::new([7u8; 16])).unwrap()
    }

    fn example_bundle() -> Bytes {
        encode(
            &Bytes::from(b"AB".repeat(600)),
            7,
            "hello",
            &BundleKey::new([7u8; 16]),
        )
        .unwrap()
    }

    #[test]
    fn test_ack_classification() {
        assert_eq!(Ack::from(0x00), Ack::Accept);
        assert_eq!(Ack::from(0x01), Ack::Reject);
        assert_eq!(Ack::from(0x7F), Ack::Other(0x7F));
    }

    #[tokio::test]
    async fn test_full_transfer() {
        let bundle = example_bundle();
        let (client, device) = duplex(4096);
        let device = spawn_device(device, ACK_OK, vec![]);

        let mut session = TransferSession::new(TransferConfig::default(), client);
        let stats = session.run(&bundle).await.unwrap();
        assert_eq!(session.state(), TransferState::Done);

        // 1008 / 16 + 208 / 16 + 16 / 16
        assert_eq!(stats.frames_sent, 63 + 13 + 1);
        assert_eq!(stats.chunks_sent, 3);
        assert_eq!(stats.frames_rejected, 0);
        assert_eq!(stats.bytes_sent, 1 + bundle.len() as u64 + 2);

        drop(session);
        let log = device.await.unwrap();
        let indices: Vec<i16> = log.headers.iter().map(|h| h.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, -1]);
        assert_eq!(log.handshakes, 1);
        assert!(log.terminated);

        let layout = BundleLayout::from_bundle(&bundle).unwrap();
        let expected: Vec<Vec<u8>> = layout.records().map(|r| r.ciphertext.to_vec()).collect();
        assert_eq!(log.ciphertexts, expected);
    }

    #[tokio::test]
    async fn test_frame_resent_after_rejects() {
        let bundle = message_only_bundle();
        let (client, device) = duplex(4096);
        let device = spawn_device(device, ACK_OK, vec![ACK_REJECT; 3]);

        let mut session = TransferSession::new(TransferConfig::default(), client);
        let stats = session.run(&bundle).await.unwrap();

        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.frames_rejected, 3);
        assert_eq!(session.budget().total(), 3);
        assert_eq!(session.budget().consecutive(), 0);

        drop(session);
        let log = device.await.unwrap();
        assert_eq!(log.frame_writes, 4);
        assert!(log.terminated);
    }

    #[tokio::test]
    async fn test_abort_after_eleventh_reject() {
        let bundle = message_only_bundle();
        let (client, device) = duplex(4096);
        let device = spawn_device(device, ACK_OK, vec![ACK_REJECT; 64]);

        let mut session = TransferSession::new(TransferConfig::default(), client);
        let err = session.run(&bundle).await.unwrap_err();

        assert!(matches!(
            err,
            TransferError::Aborted(AbortReason::RejectBudgetExhausted {
                chunk_index: -1,
                frame_index: 0,
                rejects: 11,
            })
        ));
        assert!(err.requires_restart());
        assert_eq!(session.state(), TransferState::Aborted);
        assert_eq!(session.stats().frames_rejected, 11);

        drop(session);
        let log = device.await.unwrap();
        assert_eq!(log.frame_writes, 11);
        assert!(!log.terminated);
    }

    #[tokio::test]
    async fn test_counters_reset_between_runs() {
        let bundle = message_only_bundle();
        let (client, device) = duplex(4096);
        let device = spawn_device(device, ACK_OK, vec![ACK_REJECT, ACK_REJECT, ACK_OK, ACK_REJECT]);

        let mut session = TransferSession::new(TransferConfig::default(), client);
        let first = session.run(&bundle).await.unwrap();
        assert_eq!(first.frames_rejected, 2);

        let second = session.run(&bundle).await.unwrap();
        assert_eq!(second.frames_rejected, 1);
        assert_eq!(session.budget().total(), 1);
        assert_eq!(second.bytes_sent, first.bytes_sent - 16);

        drop(session);
        let log = device.await.unwrap();
        assert_eq!(log.headers.len(), 2);
        assert_eq!(log.frame_writes, 5);
    }

    #[tokio::test]
    async fn test_metadata_rejected_is_fatal() {
        let bundle = example_bundle();
        let (client, device) = duplex(4096);
        let device = spawn_device(device, 0x01, vec![]);

        let mut session = TransferSession::new(TransferConfig::default(), client);
        let err = session.run(&bundle).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::ProtocolViolation {
                chunk_index: 0,
                frame_index: None,
                byte: 0x01,
            }
        ));
        assert_eq!(session.stats().frames_sent, 0);

        drop(session);
        assert_eq!(device.await.unwrap().headers.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_frame_ack_is_violation() {
        let bundle = message_only_bundle();
        let (client, device) = duplex(4096);
        let _device = spawn_device(device, ACK_OK, vec![0x42]);

        let mut session = TransferSession::new(TransferConfig::default(), client);
        let err = session.run(&bundle).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::ProtocolViolation {
                frame_index: Some(0),
                byte: 0x42,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out_on_metadata() {
        let bundle = example_bundle();
        let (client, mut device) = duplex(4096);
        let device = tokio::spawn(async move {
            assert_eq!(device.read_u8().await.unwrap(), HANDSHAKE_BYTE);
            device.write_u8(HANDSHAKE_BYTE).await.unwrap();
            let mut sink = [0u8; 64];
            while let Ok(n) = device.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        });

        let mut session = TransferSession::new(TransferConfig::default(), client);
        let err = session.run(&bundle).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Timeout {
                phase: Phase::Metadata,
                chunk_index: Some(0),
            }
        ));

        drop(session);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_before_every_record() {
        let bundle = example_bundle();
        let (client, device) = duplex(4096);
        let device = spawn_device_with(device, ACK_OK, vec![], true);

        let config = TransferConfig {
            handshake_every_record: true,
            ..TransferConfig::default()
        };
        let mut session = TransferSession::new(config, client);
        let stats = session.run(&bundle).await.unwrap();
        assert_eq!(stats.chunks_sent, 3);
        // three records plus one sentinel each
        assert_eq!(stats.bytes_sent, 3 + bundle.len() as u64 + 2);

        drop(session);
        let log = device.await.unwrap();
        assert_eq!(log.handshakes, 3);
        assert!(log.terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out_on_frame() {
        let bundle = example_bundle();
        let (client, mut device) = duplex(4096);
        let device = tokio::spawn(async move {
            assert_eq!(device.read_u8().await.unwrap(), HANDSHAKE_BYTE);
            device.write_u8(HANDSHAKE_BYTE).await.unwrap();
            let mut meta = [0u8; RECORD_PREFIX_SIZE];
            device.read_exact(&mut meta).await.unwrap();
            device.write_u8(ACK_OK).await.unwrap();

            let mut frame = [0u8; FRAME_SIZE];
            device.read_exact(&mut frame).await.unwrap();
            // Never answer; count anything sent afterwards
            let mut rest = Vec::new();
            device.read_to_end(&mut rest).await.unwrap();
            rest.len()
        });

        let mut session = TransferSession::new(TransferConfig::default(), client);
        let err = session.run(&bundle).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Timeout {
                phase: Phase::Frame,
                chunk_index: Some(0),
            }
        ));
        assert_eq!(session.stats().frames_rejected, 0);
        assert_eq!(session.stats().frames_sent, 0);
        assert_eq!(session.budget().total(), 0);

        drop(session);
        assert_eq!(device.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_link_aborts() {
        let bundle = example_bundle();
        let (client, mut device) = duplex(4096);
        tokio::spawn(async move {
            assert_eq!(device.read_u8().await.unwrap(), HANDSHAKE_BYTE);
            device.write_u8(HANDSHAKE_BYTE).await.unwrap();
            let mut meta = [0u8; RECORD_PREFIX_SIZE];
            device.read_exact(&mut meta).await.unwrap();
            device.write_u8(ACK_OK).await.unwrap();
            // Hang up mid-chunk
        });

        let mut session = TransferSession::new(TransferConfig::default(), client);
        let err = session.run(&bundle).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Aborted(AbortReason::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_bundle_sends_nothing() {
        let bundle = example_bundle();
        let truncated = bundle.slice(..bundle.len() - 56);
        let (client, mut device) = duplex(4096);

        let mut session = TransferSession::new(TransferConfig::default(), client);
        let err = session.run(&truncated).await.unwrap_err();
        assert!(matches!(err, TransferError::Bundle(_)));
        assert!(!err.requires_restart());

        drop(session);
        let mut rest = Vec::new();
        device.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
