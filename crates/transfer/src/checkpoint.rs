//! The partial-transfer checkpoint sidecar.
//!
//! While receiving, progress is persisted beside the output file so a later
//! attempt against the same source can resume instead of starting over. The
//! sidecar is rewritten via a temporary file and an atomic rename, so a
//! crash mid-write leaves the previous checkpoint intact.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use wire::FileMetadata;

use crate::TransferError;

/// Magic prefix `P2PR`.
const CHECKPOINT_MAGIC: u32 = 0x5032_5052;
/// Sidecar format version.
const CHECKPOINT_VERSION: u32 = 1;
/// Suffix appended to the output filename.
const CHECKPOINT_SUFFIX: &str = ".p2p-partial";

/// On-disk record of a partially received file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    /// Size of the complete source file.
    pub file_size: u64,
    /// SHA-256 of the complete source file.
    pub sha256: [u8; 32],
    /// Contiguous bytes already written to the output.
    pub bytes_written: u64,
    /// Output filename the checkpoint belongs to.
    pub filename: String,
}

/// Sidecar path for a given output path.
#[must_use]
pub fn checkpoint_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map_or_else(String::new, |name| name.to_string_lossy().into_owned());
    name.push_str(CHECKPOINT_SUFFIX);
    output.with_file_name(name)
}

impl Checkpoint {
    /// Builds a checkpoint for the offered file at the given progress mark.
    #[must_use]
    pub fn for_offer(metadata: &FileMetadata, bytes_written: u64) -> Self {
        Self {
            file_size: metadata.file_size,
            sha256: metadata.sha256,
            bytes_written,
            filename: metadata.filename.clone(),
        }
    }

    /// Whether this checkpoint describes the same source as `metadata`.
    ///
    /// A stale checkpoint (different name, size or digest) must be ignored,
    /// not resumed: the bytes on disk belong to some other file.
    #[must_use]
    pub fn matches(&self, metadata: &FileMetadata) -> bool {
        self.filename == metadata.filename
            && self.file_size == metadata.file_size
            && self.sha256 == metadata.sha256
    }

    /// Serialises the sidecar body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 4 + 8 + 32 + 8 + 2 + self.filename.len());
        buf.extend_from_slice(&CHECKPOINT_MAGIC.to_be_bytes());
        buf.extend_from_slice(&CHECKPOINT_VERSION.to_be_bytes());
        buf.extend_from_slice(&self.file_size.to_be_bytes());
        buf.extend_from_slice(&self.sha256);
        buf.extend_from_slice(&self.bytes_written.to_be_bytes());
        buf.extend_from_slice(&(self.filename.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.filename.as_bytes());
        buf
    }

    /// Parses a sidecar body.
    pub fn decode(data: &[u8]) -> Result<Self, TransferError> {
        let bad = |reason: &'static str| TransferError::Wire(wire::WireError::MalformedPacket {
            reason,
        });
        if data.len() < 4 + 4 + 8 + 32 + 8 + 2 {
            return Err(bad("short checkpoint"));
        }
        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if magic != CHECKPOINT_MAGIC {
            return Err(bad("bad checkpoint magic"));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != CHECKPOINT_VERSION {
            return Err(bad("unsupported checkpoint version"));
        }

        let mut file_size = [0u8; 8];
        file_size.copy_from_slice(&data[8..16]);
        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(&data[16..48]);
        let mut bytes_written = [0u8; 8];
        bytes_written.copy_from_slice(&data[48..56]);
        let name_len = u16::from_be_bytes([data[56], data[57]]) as usize;
        if data.len() != 58 + name_len {
            return Err(bad("checkpoint length mismatch"));
        }
        let filename = std::str::from_utf8(&data[58..])
            .map_err(|_| bad("checkpoint filename not utf-8"))?
            .to_owned();

        Ok(Self {
            file_size: u64::from_be_bytes(file_size),
            sha256,
            bytes_written: u64::from_be_bytes(bytes_written),
            filename,
        })
    }

    /// Loads the sidecar for `output`, if one exists and parses.
    pub fn load(output: &Path) -> Result<Option<Self>, TransferError> {
        let path = checkpoint_path(output);
        match fs::read(&path) {
            Ok(data) => Ok(Some(Self::decode(&data)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically (re)writes the sidecar for `output`.
    pub fn store(&self, output: &Path) -> Result<(), TransferError> {
        let path = checkpoint_path(output);
        let mut tmp = path.clone();
        tmp.set_extension("p2p-partial.tmp");

        let mut file = fs::File::create(&tmp)?;
        file.write_all(&self.encode())?;
        file.sync_data()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Removes the sidecar for `output`; missing is fine.
    pub fn remove(output: &Path) -> Result<(), TransferError> {
        match fs::remove_file(checkpoint_path(output)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        Checkpoint {
            file_size: 100_000,
            sha256: [0xAB; 32],
            bytes_written: 50_000,
            filename: "dataset.bin".into(),
        }
    }

    #[test]
    fn sidecar_path_appends_the_suffix() {
        let path = checkpoint_path(Path::new("/out/dataset.bin"));
        assert_eq!(path, Path::new("/out/dataset.bin.p2p-partial"));
    }

    #[test]
    fn codec_round_trips() {
        let checkpoint = sample();
        assert_eq!(Checkpoint::decode(&checkpoint.encode()).unwrap(), checkpoint);
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let mut data = sample().encode();
        data[0] ^= 0xFF;
        assert!(Checkpoint::decode(&data).is_err());

        let mut data = sample().encode();
        data[7] = 9;
        assert!(Checkpoint::decode(&data).is_err());

        let data = sample().encode();
        assert!(Checkpoint::decode(&data[..40]).is_err());
    }

    #[test]
    fn matches_compares_all_three_identifiers() {
        let checkpoint = sample();
        let mut metadata = FileMetadata {
            transfer_id: [0u8; 16],
            file_size: 100_000,
            sha256: [0xAB; 32],
            filename: "dataset.bin".into(),
        };
        assert!(checkpoint.matches(&metadata));

        metadata.file_size = 1;
        assert!(!checkpoint.matches(&metadata));
        metadata.file_size = 100_000;
        metadata.sha256 = [0xAC; 32];
        assert!(!checkpoint.matches(&metadata));
        metadata.sha256 = [0xAB; 32];
        metadata.filename = "other.bin".into();
        assert!(!checkpoint.matches(&metadata));
    }

    #[test]
    fn store_load_remove_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("dataset.bin");
        let checkpoint = sample();

        assert!(Checkpoint::load(&output).unwrap().is_none());
        checkpoint.store(&output).unwrap();
        assert_eq!(Checkpoint::load(&output).unwrap(), Some(checkpoint.clone()));

        // Rewrite with more progress; the rename replaces the old sidecar.
        let mut updated = checkpoint;
        updated.bytes_written = 75_000;
        updated.store(&output).unwrap();
        assert_eq!(
            Checkpoint::load(&output).unwrap().unwrap().bytes_written,
            75_000
        );

        Checkpoint::remove(&output).unwrap();
        assert!(Checkpoint::load(&output).unwrap().is_none());
        Checkpoint::remove(&output).unwrap(); // second remove is fine
    }
}
