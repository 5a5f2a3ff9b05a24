//! The sending half of the transfer state machine.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use transport::channel::ReliableChannel;
use wire::{CompletePayload, FileAccept, FileMetadata, Packet, PacketType};

use crate::latch::Latch;
use crate::{ProgressFn, TransferError, TransferSummary, CONTROL_WAIT, RECEIVE_WAIT};

enum OfferOutcome {
    Accepted(FileAccept),
    Rejected,
    Cancelled,
}

/// Streams one file to the connected peer.
pub struct FileSender {
    channel: ReliableChannel,
    progress: Option<ProgressFn>,
    offer_info: Option<Box<dyn Fn(&FileMetadata) + Send>>,
}

impl FileSender {
    /// Creates a sender over an established channel.
    #[must_use]
    pub fn new(channel: ReliableChannel) -> Self {
        Self {
            channel,
            progress: None,
            offer_info: None,
        }
    }

    /// Installs a progress hook called as `(bytes_done, bytes_total)`.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Installs a hook that observes the offer metadata before it is sent.
    #[must_use]
    pub fn with_offer_info<F>(mut self, hook: F) -> Self
    where
        F: Fn(&FileMetadata) + Send + 'static,
    {
        self.offer_info = Some(Box::new(hook));
        self
    }

    /// Offers, streams and verifies `path`; blocks until the receiver
    /// confirmed the digest or the transfer failed.
    pub fn send_file(&self, path: &Path) -> Result<TransferSummary, TransferError> {
        let started = Instant::now();
        let metadata = self.describe(path)?;
        info!(
            file = %metadata.filename,
            size = metadata.file_size,
            "offering file"
        );
        if let Some(hook) = &self.offer_info {
            hook(&metadata);
        }

        let offer_outcome: Arc<Latch<OfferOutcome>> = Arc::new(Latch::new());
        let verified: Arc<Latch<()>> = Arc::new(Latch::new());
        let cancelled: Arc<Latch<()>> = Arc::new(Latch::new());
        self.install_control_hook(&metadata, &offer_outcome, &verified, &cancelled);

        let offer = Packet::control(
            PacketType::FileOffer,
            self.channel.connection_id(),
            metadata.encode(),
        );
        self.channel.send_control(&offer)?;

        let accept = match offer_outcome.wait(CONTROL_WAIT) {
            Some(OfferOutcome::Accepted(accept)) => accept,
            Some(OfferOutcome::Rejected) => return Err(TransferError::Rejected),
            Some(OfferOutcome::Cancelled) => return Err(TransferError::Cancelled),
            None => return Err(TransferError::Timeout {
                step: "file accept",
            }),
        };

        let resume_offset = accept.resume_offset.min(metadata.file_size);
        if resume_offset > 0 {
            info!(resume_offset, "receiver requested resume");
        }
        self.pump_data(path, &metadata, resume_offset, &cancelled)?;

        if !self.channel.wait_all_acked(RECEIVE_WAIT) {
            if cancelled.is_set() {
                return Err(TransferError::Cancelled);
            }
            return Err(TransferError::Timeout {
                step: "acknowledgment drain",
            });
        }

        let complete = Packet::control(
            PacketType::Complete,
            self.channel.connection_id(),
            CompletePayload {
                sha256: metadata.sha256,
            }
            .encode(),
        );
        self.channel.send_control(&complete)?;
        debug!("complete sent, awaiting verification");

        if verified.wait(CONTROL_WAIT).is_none() {
            if cancelled.is_set() {
                return Err(TransferError::Cancelled);
            }
            return Err(TransferError::Timeout {
                step: "verification",
            });
        }

        let stats = self.channel.stats();
        info!(
            bytes = stats.bytes_sent,
            packets = stats.packets_sent,
            retransmissions = stats.retransmissions,
            "transfer verified by receiver"
        );
        Ok(TransferSummary {
            bytes: stats.bytes_sent,
            packets: stats.packets_sent,
            retransmissions: stats.retransmissions,
            duration: started.elapsed(),
        })
    }

    /// Reads the file once to produce the offer metadata.
    fn describe(&self, path: &Path) -> Result<FileMetadata, TransferError> {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .ok_or(TransferError::UnsafeFilename {
                reason: "source path has no filename",
            })?;

        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        let mut hasher = Sha256::new();
        let mut reader = BufReader::new(file);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }

        let mut transfer_id = [0u8; 16];
        OsRng.fill_bytes(&mut transfer_id);

        Ok(FileMetadata {
            transfer_id,
            file_size,
            sha256: hasher.finalize().into(),
            filename,
        })
    }

    fn install_control_hook(
        &self,
        metadata: &FileMetadata,
        offer_outcome: &Arc<Latch<OfferOutcome>>,
        verified: &Arc<Latch<()>>,
        cancelled: &Arc<Latch<()>>,
    ) {
        let transfer_id = metadata.transfer_id;
        let offer_outcome = Arc::clone(offer_outcome);
        let verified = Arc::clone(verified);
        let cancelled = Arc::clone(cancelled);

        self.channel.on_control_packet(move |packet| {
            match packet.packet_type {
                PacketType::FileAccept => match FileAccept::decode(&packet.payload) {
                    Ok(accept) if accept.transfer_id == transfer_id => {
                        offer_outcome.set(OfferOutcome::Accepted(accept));
                    }
                    Ok(_) => warn!("accept for an unknown transfer id"),
                    Err(err) => warn!(%err, "undecodable file accept"),
                },
                PacketType::FileReject => offer_outcome.set(OfferOutcome::Rejected),
                PacketType::Verified => verified.set(()),
                PacketType::Cancel => {
                    cancelled.set(());
                    offer_outcome.set(OfferOutcome::Cancelled);
                }
                other => debug!(?other, "ignoring control packet at sender"),
            }
        });
    }

    /// Streams chunks from `resume_offset` to the end of the file.
    fn pump_data(
        &self,
        path: &Path,
        metadata: &FileMetadata,
        resume_offset: u64,
        cancelled: &Latch<()>,
    ) -> Result<(), TransferError> {
        let chunk_size = self.channel.max_chunk_data();
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(resume_offset))?;

        let mut chunk_index = (resume_offset / chunk_size as u64) as u32;
        let mut offset = resume_offset;
        let mut buf = vec![0u8; chunk_size];

        loop {
            if cancelled.is_set() {
                return Err(TransferError::Cancelled);
            }
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            self.channel.send_data(chunk_index, offset, &buf[..read])?;
            offset += read as u64;
            chunk_index = chunk_index.wrapping_add(1);
            if let Some(progress) = &self.progress {
                progress(offset, metadata.file_size);
            }
        }

        debug!(
            sent = offset - resume_offset,
            total = metadata.file_size,
            "all chunks enqueued"
        );
        Ok(())
    }
}
