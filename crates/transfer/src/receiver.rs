//! The receiving half of the transfer state machine.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use transport::channel::ReliableChannel;
use wire::{
    CompletePayload, DataHeader, FileAccept, FileMetadata, Packet, PacketType,
};

use crate::latch::Latch;
use crate::{
    Checkpoint, ProgressFn, TransferError, TransferSummary, CHECKPOINT_INTERVAL, OFFER_WAIT,
    RECEIVE_WAIT,
};

/// A successfully received and verified file.
#[derive(Debug)]
pub struct ReceivedFile {
    /// Where the file landed.
    pub path: PathBuf,
    /// Transfer figures.
    pub summary: TransferSummary,
}

/// Disk-side state shared with the data callback on the router thread.
struct Writer {
    /// Guards both data writes and checkpoint rewrites.
    file: Mutex<File>,
    output: PathBuf,
    metadata: FileMetadata,
    bytes_written: AtomicU64,
    last_checkpoint: Mutex<Instant>,
    io_error: Mutex<Option<io::Error>>,
}

impl Writer {
    /// Applies one delivered chunk at its absolute offset.
    fn apply(&self, header: DataHeader, chunk: &[u8]) {
        let end = header.byte_offset + chunk.len() as u64;
        if end > self.metadata.file_size {
            warn!(
                offset = header.byte_offset,
                len = chunk.len(),
                file_size = self.metadata.file_size,
                "chunk exceeds the offered size, dropping"
            );
            return;
        }

        let mut file = self.file.lock().expect("writer lock");
        let result = file
            .seek(SeekFrom::Start(header.byte_offset))
            .and_then(|_| file.write_all(chunk));
        if let Err(err) = result {
            warn!(%err, "write failed");
            let mut io_error = self.io_error.lock().expect("io error lock");
            if io_error.is_none() {
                *io_error = Some(err);
            }
            return;
        }

        self.bytes_written.fetch_max(end, Ordering::AcqRel);

        // Periodic checkpoint, serialized against data writes by the file
        // lock we are still holding.
        let mut last = self.last_checkpoint.lock().expect("checkpoint lock");
        if last.elapsed() >= CHECKPOINT_INTERVAL {
            *last = Instant::now();
            let checkpoint = Checkpoint::for_offer(
                &self.metadata,
                self.bytes_written.load(Ordering::Acquire),
            );
            if let Err(err) = checkpoint.store(&self.output) {
                warn!(%err, "checkpoint rewrite failed");
            }
        }
    }

    fn persist_checkpoint(&self) {
        let checkpoint = Checkpoint::for_offer(
            &self.metadata,
            self.bytes_written.load(Ordering::Acquire),
        );
        if let Err(err) = checkpoint.store(&self.output) {
            warn!(%err, "failed to persist checkpoint");
        }
    }

    fn take_io_error(&self) -> Option<io::Error> {
        self.io_error.lock().expect("io error lock").take()
    }
}

/// Receives one offered file into an output directory.
pub struct FileReceiver {
    channel: ReliableChannel,
    output_dir: PathBuf,
    progress: Option<Arc<ProgressFn>>,
    offer_info: Option<Box<dyn Fn(&FileMetadata) + Send>>,
}

impl FileReceiver {
    /// Creates a receiver over an established channel.
    #[must_use]
    pub fn new(channel: ReliableChannel, output_dir: PathBuf) -> Self {
        Self {
            channel,
            output_dir,
            progress: None,
            offer_info: None,
        }
    }

    /// Installs a progress hook called as `(bytes_done, bytes_total)`.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Installs a hook that observes the offer metadata on arrival.
    #[must_use]
    pub fn with_offer_info<F>(mut self, hook: F) -> Self
    where
        F: Fn(&FileMetadata) + Send + 'static,
    {
        self.offer_info = Some(Box::new(hook));
        self
    }

    /// Waits for an offer, streams the file in, verifies the digest.
    pub fn receive(&self) -> Result<ReceivedFile, TransferError> {
        let started = Instant::now();

        let offer: Arc<Latch<FileMetadata>> = Arc::new(Latch::new());
        let complete: Arc<Latch<[u8; 32]>> = Arc::new(Latch::new());
        let cancelled: Arc<Latch<()>> = Arc::new(Latch::new());
        self.install_control_hook(&offer, &complete, &cancelled);

        let Some(metadata) = wait_or_cancelled(&offer, &cancelled, OFFER_WAIT)? else {
            return Err(TransferError::Timeout { step: "file offer" });
        };
        info!(
            file = %metadata.filename,
            size = metadata.file_size,
            "offer received"
        );
        if let Some(hook) = &self.offer_info {
            hook(&metadata);
        }

        let filename = match crate::sanitize_filename(&metadata.filename) {
            Ok(filename) => filename.to_owned(),
            Err(err) => {
                // Tell the sender we are bailing instead of letting its
                // accept wait run out.
                let cancel =
                    Packet::header_only(PacketType::Cancel, self.channel.connection_id());
                let _ = self.channel.send_control(&cancel);
                return Err(err);
            }
        };
        let output = self.output_dir.join(&filename);

        // A matching checkpoint lets the sender skip what we already hold.
        // A stale one is ignored but left on disk: this attempt may fail
        // too, and overwriting happens naturally once we checkpoint again.
        let resume_offset = match Checkpoint::load(&output) {
            Ok(Some(checkpoint)) if checkpoint.matches(&metadata) => {
                let resume = checkpoint.bytes_written.min(metadata.file_size);
                info!(resume, "resuming from checkpoint");
                resume
            }
            Ok(Some(_)) => {
                debug!("checkpoint does not match this offer, starting over");
                0
            }
            Ok(None) => 0,
            Err(err) => {
                debug!(%err, "unreadable checkpoint, starting over");
                0
            }
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&output)?;
        file.set_len(metadata.file_size)?;

        let writer = Arc::new(Writer {
            file: Mutex::new(file),
            output: output.clone(),
            metadata: metadata.clone(),
            bytes_written: AtomicU64::new(resume_offset),
            last_checkpoint: Mutex::new(Instant::now()),
            io_error: Mutex::new(None),
        });
        self.install_data_hook(&writer);

        let accept = Packet::control(
            PacketType::FileAccept,
            self.channel.connection_id(),
            FileAccept {
                transfer_id: metadata.transfer_id,
                resume_offset,
            }
            .encode(),
        );
        self.channel.send_control(&accept)?;
        debug!(resume_offset, "accept sent");

        let offered_digest = match wait_or_cancelled(&complete, &cancelled, RECEIVE_WAIT) {
            Ok(Some(digest)) => digest,
            Ok(None) => {
                writer.persist_checkpoint();
                return Err(TransferError::Timeout {
                    step: "transfer completion",
                });
            }
            Err(err) => {
                writer.persist_checkpoint();
                return Err(err);
            }
        };

        if let Some(err) = writer.take_io_error() {
            writer.persist_checkpoint();
            return Err(err.into());
        }

        // The COMPLETE digest and the offered digest describe the same
        // source; verify against the offer, which we committed to first.
        if offered_digest != metadata.sha256 {
            warn!("complete digest disagrees with the offer");
        }

        let actual = hash_file(&output)?;
        let matches: bool = actual.ct_eq(&metadata.sha256).into();
        if !matches {
            writer.persist_checkpoint();
            warn!(file = %filename, "digest mismatch, keeping checkpoint and output");
            return Err(TransferError::DigestMismatch);
        }

        let verified = Packet::header_only(PacketType::Verified, self.channel.connection_id());
        self.channel.send_control(&verified)?;
        Checkpoint::remove(&output)?;

        let stats = self.channel.stats();
        info!(
            file = %filename,
            bytes = stats.bytes_received,
            "file received and verified"
        );
        Ok(ReceivedFile {
            path: output,
            summary: TransferSummary {
                bytes: stats.bytes_received,
                packets: stats.packets_received,
                retransmissions: stats.retransmissions,
                duration: started.elapsed(),
            },
        })
    }

    fn install_control_hook(
        &self,
        offer: &Arc<Latch<FileMetadata>>,
        complete: &Arc<Latch<[u8; 32]>>,
        cancelled: &Arc<Latch<()>>,
    ) {
        let offer = Arc::clone(offer);
        let complete = Arc::clone(complete);
        let cancelled = Arc::clone(cancelled);

        self.channel.on_control_packet(move |packet| {
            match packet.packet_type {
                PacketType::FileOffer => match FileMetadata::decode(&packet.payload) {
                    Ok(metadata) => offer.set(metadata),
                    Err(err) => warn!(%err, "undecodable file offer"),
                },
                PacketType::Complete => match CompletePayload::decode(&packet.payload) {
                    Ok(payload) => complete.set(payload.sha256),
                    Err(err) => warn!(%err, "undecodable complete"),
                },
                PacketType::Cancel => cancelled.set(()),
                other => debug!(?other, "ignoring control packet at receiver"),
            }
        });
    }

    fn install_data_hook(&self, writer: &Arc<Writer>) {
        let writer = Arc::clone(writer);
        let progress = self.progress.clone();
        let total = writer.metadata.file_size;
        let last_progress = Mutex::new(Instant::now());

        self.channel.on_data_received(move |payload| {
            let (header, chunk) = match DataHeader::decode(payload) {
                Ok(parts) => parts,
                Err(err) => {
                    warn!(%err, "undecodable data payload");
                    return;
                }
            };
            writer.apply(header, chunk);

            if let Some(progress) = &progress {
                let done = writer.bytes_written.load(Ordering::Acquire);
                let mut last = last_progress.lock().expect("progress lock");
                // Throttled, except the final report which always fires.
                if done >= total || last.elapsed() >= std::time::Duration::from_millis(100) {
                    *last = Instant::now();
                    progress(done, total);
                }
            }
        });
    }
}

/// Waits on `latch` while watching for a peer CANCEL.
fn wait_or_cancelled<T>(
    latch: &Latch<T>,
    cancelled: &Latch<()>,
    timeout: std::time::Duration,
) -> Result<Option<T>, TransferError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = latch.wait(std::time::Duration::from_millis(200)) {
            return Ok(Some(value));
        }
        if cancelled.is_set() {
            return Err(TransferError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
    }
}

/// Streams the whole file through SHA-256.
fn hash_file(path: &Path) -> Result<[u8; 32], TransferError> {
    let mut hasher = Sha256::new();
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize().into())
}
