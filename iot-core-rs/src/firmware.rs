//! Firmware slots
//!
//! Two image slots, A and B. The device runs from one slot and updates are
//! written to the other. The boot pointer moves only after a staged image
//! passed its integrity check.
//!
//! Image layout:
//!
//! ```text
//! +-------+----------------+----------------+-------------+-----------+
//! | IOTF  | version (32 B) | sha256 (32 B)  | len u32 LE  | payload   |
//! +-------+----------------+----------------+-------------+-----------+
//! ```
//!
//! A slot switched to by `set_boot` is on trial for one boot. If the next
//! boot does not confirm it with `mark_running_valid`, [`FileSlots::open`]
//! rolls back and records its version as the last invalid one.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const IMAGE_MAGIC: &[u8; 4] = b"IOTF";
pub const VERSION_LEN: usize = 32;
pub const DIGEST_LEN: usize = 32;
pub const HEADER_LEN: usize = 4 + VERSION_LEN + DIGEST_LEN + 4;

/// Firmware slot identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    fn index(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::A => write!(f, "A"),
            Slot::B => write!(f, "B"),
        }
    }
}

/// Slot layer errors
#[derive(Error, Debug)]
pub enum SlotError {
    #[error("Slot {0} is running and cannot be written")]
    RunningSlot(Slot),

    #[error("A write session is already open on slot {0}")]
    SessionActive(Slot),

    #[error("No write session open")]
    NoSession,

    #[error("Image header too short: {0} bytes")]
    HeaderTooShort(usize),

    #[error("Bad image magic")]
    BadMagic,

    #[error("Invalid version string")]
    BadVersion,

    #[error("Payload length mismatch: header says {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Slot {0} holds no verified image")]
    NotVerified(Slot),

    #[error("Slot write failed: {0}")]
    WriteFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Boot record error: {0}")]
    Record(#[from] serde_json::Error),
}

// ============================================================================
// Image header
// ============================================================================

/// Fixed header at the start of every image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub version: String,
    pub digest: [u8; DIGEST_LEN],
    pub payload_len: u32,
}

impl ImageHeader {
    /// Header describing `payload`
    pub fn for_payload(version: &str, payload: &[u8]) -> Self {
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&Sha256::digest(payload));
        Self {
            version: version.to_string(),
            digest,
            payload_len: payload.len() as u32,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, SlotError> {
        if bytes.len() < HEADER_LEN {
            return Err(SlotError::HeaderTooShort(bytes.len()));
        }
        if bytes[..4] != IMAGE_MAGIC[..] {
            return Err(SlotError::BadMagic);
        }

        let raw_version = &bytes[4..4 + VERSION_LEN];
        let end = raw_version
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(VERSION_LEN);
        let version = std::str::from_utf8(&raw_version[..end])
            .map_err(|_| SlotError::BadVersion)?
            .to_string();
        if version.is_empty() {
            return Err(SlotError::BadVersion);
        }

        let digest_start = 4 + VERSION_LEN;
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes[digest_start..digest_start + DIGEST_LEN]);

        let len_start = digest_start + DIGEST_LEN;
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[len_start..len_start + 4]);

        Ok(Self {
            version,
            digest,
            payload_len: u32::from_le_bytes(len),
        })
    }

    /// Encode; versions longer than the field are truncated
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(IMAGE_MAGIC);
        let version = self.version.as_bytes();
        let n = version.len().min(VERSION_LEN);
        out[4..4 + n].copy_from_slice(&version[..n]);
        let digest_start = 4 + VERSION_LEN;
        out[digest_start..digest_start + DIGEST_LEN].copy_from_slice(&self.digest);
        out[digest_start + DIGEST_LEN..].copy_from_slice(&self.payload_len.to_le_bytes());
        out
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// Total image size, header included
    pub fn image_len(&self) -> usize {
        HEADER_LEN + self.payload_len as usize
    }
}

/// Build a complete image from a version and payload
pub fn build_image(version: &str, payload: &[u8]) -> Vec<u8> {
    let header = ImageHeader::for_payload(version, payload);
    let mut image = Vec::with_capacity(header.image_len());
    image.extend_from_slice(&header.encode());
    image.extend_from_slice(payload);
    image
}

/// Check a complete image against its own header
pub fn verify_image(image: &[u8]) -> Result<ImageHeader, SlotError> {
    let header = ImageHeader::parse(image)?;
    let payload = &image[HEADER_LEN..];
    if payload.len() != header.payload_len as usize {
        return Err(SlotError::LengthMismatch {
            expected: header.payload_len as usize,
            actual: payload.len(),
        });
    }
    let actual = Sha256::digest(payload);
    if actual.as_slice() != header.digest.as_slice() {
        return Err(SlotError::DigestMismatch {
            expected: header.digest_hex(),
            actual: hex::encode(actual),
        });
    }
    Ok(header)
}

// ============================================================================
// Slot layer
// ============================================================================

/// Boot and partition layer used by the update pipeline
pub trait FirmwareSlots: Send {
    fn running_slot(&self) -> Slot;
    fn boot_slot(&self) -> Slot;
    fn running_version(&self) -> String;

    /// Version of the last image that failed its trial boot
    fn last_invalid_version(&self) -> Option<String>;

    /// Running image booted on trial and is not confirmed yet
    fn pending_verify(&self) -> bool;
    fn mark_running_valid(&mut self) -> Result<(), SlotError>;

    /// Open a write session; any previous content of `slot` is discarded
    fn begin(&mut self, slot: Slot) -> Result<(), SlotError>;
    fn write(&mut self, bytes: &[u8]) -> Result<(), SlotError>;
    /// Drop the open session and everything written to it
    fn abort(&mut self);
    /// Close the session and check image integrity
    fn finish(&mut self) -> Result<ImageHeader, SlotError>;
    /// Point the next boot at `slot`, which must hold a verified image
    fn set_boot(&mut self, slot: Slot) -> Result<(), SlotError>;
}

#[derive(Debug, Default)]
struct SlotTable {
    running: Option<Slot>,
    boot: Option<Slot>,
    versions: [Option<String>; 2],
    staging: Option<(Slot, Vec<u8>)>,
    last_invalid: Option<String>,
    pending_verify: bool,
    fail_after: Option<usize>,
    boot_switches: u32,
    aborts: u32,
}

/// In-memory slots for tests and the host simulator.
///
/// Clones share the same table, so a test can keep a handle after giving
/// one to the pipeline.
#[derive(Debug, Clone)]
pub struct MemorySlots {
    table: Arc<Mutex<SlotTable>>,
}

impl MemorySlots {
    /// Running from slot A with `version`
    pub fn new(version: &str) -> Self {
        let mut table = SlotTable {
            running: Some(Slot::A),
            boot: Some(Slot::A),
            ..SlotTable::default()
        };
        table.versions[Slot::A.index()] = Some(version.to_string());
        Self {
            table: Arc::new(Mutex::new(table)),
        }
    }

    pub fn with_last_invalid(self, version: &str) -> Self {
        self.table.lock().last_invalid = Some(version.to_string());
        self
    }

    /// Running image is on its trial boot
    pub fn pending_verification(self) -> Self {
        self.table.lock().pending_verify = true;
        self
    }

    /// Fail any write that would take the session past `bytes`
    pub fn fail_after(&self, bytes: usize) {
        self.table.lock().fail_after = Some(bytes);
    }

    /// Number of times the boot pointer moved
    pub fn boot_switches(&self) -> u32 {
        self.table.lock().boot_switches
    }

    pub fn aborts(&self) -> u32 {
        self.table.lock().aborts
    }

    pub fn version_in(&self, slot: Slot) -> Option<String> {
        self.table.lock().versions[slot.index()].clone()
    }

    pub fn is_staging(&self) -> bool {
        self.table.lock().staging.is_some()
    }
}

impl FirmwareSlots for MemorySlots {
    fn running_slot(&self) -> Slot {
        self.table.lock().running.unwrap_or(Slot::A)
    }

    fn boot_slot(&self) -> Slot {
        self.table.lock().boot.unwrap_or(Slot::A)
    }

    fn running_version(&self) -> String {
        let table = self.table.lock();
        let running = table.running.unwrap_or(Slot::A);
        table.versions[running.index()].clone().unwrap_or_default()
    }

    fn last_invalid_version(&self) -> Option<String> {
        self.table.lock().last_invalid.clone()
    }

    fn pending_verify(&self) -> bool {
        self.table.lock().pending_verify
    }

    fn mark_running_valid(&mut self) -> Result<(), SlotError> {
        self.table.lock().pending_verify = false;
        Ok(())
    }

    fn begin(&mut self, slot: Slot) -> Result<(), SlotError> {
        let mut table = self.table.lock();
        if table.running == Some(slot) {
            return Err(SlotError::RunningSlot(slot));
        }
        if let Some((open, _)) = &table.staging {
            return Err(SlotError::SessionActive(*open));
        }
        table.versions[slot.index()] = None;
        table.staging = Some((slot, Vec::new()));
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), SlotError> {
        let mut table = self.table.lock();
        let fail_after = table.fail_after;
        let (_, buf) = table.staging.as_mut().ok_or(SlotError::NoSession)?;
        if let Some(limit) = fail_after {
            if buf.len() + bytes.len() > limit {
                return Err(SlotError::WriteFailed(format!("flash error at offset {}", buf.len())));
            }
        }
        buf.extend_from_slice(bytes);
        Ok(())
    }

    fn abort(&mut self) {
        let mut table = self.table.lock();
        if table.staging.take().is_some() {
            table.aborts += 1;
        }
    }

    fn finish(&mut self) -> Result<ImageHeader, SlotError> {
        let mut table = self.table.lock();
        let (slot, image) = table.staging.take().ok_or(SlotError::NoSession)?;
        let header = verify_image(&image)?;
        table.versions[slot.index()] = Some(header.version.clone());
        Ok(header)
    }

    fn set_boot(&mut self, slot: Slot) -> Result<(), SlotError> {
        let mut table = self.table.lock();
        if table.versions[slot.index()].is_none() {
            return Err(SlotError::NotVerified(slot));
        }
        if table.boot != Some(slot) {
            table.boot = Some(slot);
            table.boot_switches += 1;
        }
        Ok(())
    }
}

/// Persisted boot pointer and slot metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BootRecord {
    boot: Slot,
    version_a: Option<String>,
    version_b: Option<String>,
    #[serde(default)]
    pending_verify: bool,
    /// The pending slot has been booted once already
    #[serde(default)]
    trial_started: bool,
    #[serde(default)]
    last_invalid: Option<String>,
}

impl BootRecord {
    fn version(&self, slot: Slot) -> Option<&String> {
        match slot {
            Slot::A => self.version_a.as_ref(),
            Slot::B => self.version_b.as_ref(),
        }
    }

    fn set_version(&mut self, slot: Slot, version: Option<String>) {
        match slot {
            Slot::A => self.version_a = version,
            Slot::B => self.version_b = version,
        }
    }
}

const BOOT_RECORD: &str = "boot.json";

/// Directory backed slots: `slot_a.bin`, `slot_b.bin` and `boot.json`
pub struct FileSlots {
    dir: PathBuf,
    record: BootRecord,
    running: Slot,
    staging: Option<(Slot, File)>,
}

impl FileSlots {
    /// Open the slot directory, as the bootloader would on power-up.
    ///
    /// A fresh directory starts in slot A with `factory_version`. A slot
    /// that was already booted on trial without confirmation is rolled back.
    pub fn open(dir: impl AsRef<Path>, factory_version: &str) -> Result<Self, SlotError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut record = match fs::read(dir.join(BOOT_RECORD)) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BootRecord {
                boot: Slot::A,
                version_a: Some(factory_version.to_string()),
                version_b: None,
                pending_verify: false,
                trial_started: false,
                last_invalid: None,
            },
            Err(e) => return Err(e.into()),
        };

        if record.pending_verify {
            if record.trial_started {
                let bad = record.version(record.boot).cloned();
                warn!(
                    "Firmware: Slot {} ({:?}) never confirmed, rolling back",
                    record.boot, bad
                );
                record.last_invalid = bad;
                record.boot = record.boot.other();
                record.pending_verify = false;
                record.trial_started = false;
            } else {
                info!("Firmware: Trial boot of slot {}", record.boot);
                record.trial_started = true;
            }
        }

        let slots = Self {
            dir,
            running: record.boot,
            record,
            staging: None,
        };
        slots.save_record()?;
        Ok(slots)
    }

    fn slot_path(&self, slot: Slot) -> PathBuf {
        self.dir.join(format!("slot_{}.bin", slot.to_string().to_lowercase()))
    }

    fn staging_path(&self, slot: Slot) -> PathBuf {
        self.dir
            .join(format!("slot_{}.bin.part", slot.to_string().to_lowercase()))
    }

    fn save_record(&self) -> Result<(), SlotError> {
        let path = self.dir.join(BOOT_RECORD);
        let temp_path = self.dir.join(format!("{}.tmp", BOOT_RECORD));
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&serde_json::to_vec_pretty(&self.record)?)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &path)?;
        Ok(())
    }
}

impl FirmwareSlots for FileSlots {
    fn running_slot(&self) -> Slot {
        self.running
    }

    fn boot_slot(&self) -> Slot {
        self.record.boot
    }

    fn running_version(&self) -> String {
        self.record
            .version(self.running)
            .cloned()
            .unwrap_or_default()
    }

    fn last_invalid_version(&self) -> Option<String> {
        self.record.last_invalid.clone()
    }

    fn pending_verify(&self) -> bool {
        self.record.pending_verify && self.record.boot == self.running
    }

    fn mark_running_valid(&mut self) -> Result<(), SlotError> {
        if self.pending_verify() {
            info!("Firmware: Slot {} confirmed", self.running);
            self.record.pending_verify = false;
            self.record.trial_started = false;
            self.save_record()?;
        }
        Ok(())
    }

    fn begin(&mut self, slot: Slot) -> Result<(), SlotError> {
        if slot == self.running {
            return Err(SlotError::RunningSlot(slot));
        }
        if let Some((open, _)) = &self.staging {
            return Err(SlotError::SessionActive(*open));
        }
        self.record.set_version(slot, None);
        self.save_record()?;
        let file = File::create(self.staging_path(slot))?;
        debug!("Firmware: Write session opened on slot {}", slot);
        self.staging = Some((slot, file));
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), SlotError> {
        let (_, file) = self.staging.as_mut().ok_or(SlotError::NoSession)?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn abort(&mut self) {
        if let Some((slot, file)) = self.staging.take() {
            drop(file);
            if let Err(e) = fs::remove_file(self.staging_path(slot)) {
                warn!("Firmware: Could not discard slot {} data: {}", slot, e);
            }
            info!("Firmware: Write session on slot {} aborted", slot);
        }
    }

    fn finish(&mut self) -> Result<ImageHeader, SlotError> {
        let (slot, file) = self.staging.take().ok_or(SlotError::NoSession)?;
        file.sync_all()?;
        drop(file);

        let staging = self.staging_path(slot);
        let header = match fs::read(&staging).map_err(SlotError::from).and_then(|image| verify_image(&image)) {
            Ok(header) => header,
            Err(e) => {
                let _ = fs::remove_file(&staging);
                return Err(e);
            }
        };

        fs::rename(&staging, self.slot_path(slot))?;
        self.record.set_version(slot, Some(header.version.clone()));
        self.save_record()?;
        info!(
            "Firmware: Slot {} holds {} (sha256 {})",
            slot,
            header.version,
            header.digest_hex()
        );
        Ok(header)
    }

    fn set_boot(&mut self, slot: Slot) -> Result<(), SlotError> {
        if self.record.version(slot).is_none() {
            return Err(SlotError::NotVerified(slot));
        }
        self.record.boot = slot;
        self.record.pending_verify = slot != self.running;
        self.record.trial_started = false;
        self.save_record()?;
        info!("Firmware: Next boot from slot {}", slot);
        Ok(())
    }
}
