//! Byte-addressable non-volatile storage shared by the counter and the reset flag.
//!
//! Slot map of the 8-byte image:
//!
//! | slot | owner                                   |
//! |------|-----------------------------------------|
//! | 0    | legacy counter (low-order byte only)    |
//! | 1    | reset flag                              |
//! | 2    | wide counter, high-order byte           |
//! | 3    | wide counter, low-order byte            |
//! | 4..8 | reserved                                |
//!
//! Every implementation in this crate and in the device front-ends reports a
//! slot that was never written as `0x00`: NVS has no key for it and the host
//! image file is zero-filled. Raw EEPROM emulation on flash erases to `0xFF`
//! instead, which the wide counter would decode as 65535; a backend over raw
//! flash has to zero the image on first use to keep the "first read is zero"
//! guarantee.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use crate::error::NvramError;

pub const NVRAM_CAPACITY: usize = 8;

pub trait ByteStore: Send {
    /// Reads one slot. Unwritten slots read as zero; there is no failure path.
    fn read_byte(&self, slot: usize) -> u8;
    fn write_byte(&mut self, slot: usize, value: u8) -> Result<(), NvramError>;
    /// Makes every preceding write durable before returning.
    fn commit(&mut self) -> Result<(), NvramError>;
}

/// Cloneable handle to the single byte store of the device.
pub struct NvBytes<B> {
    inner: Arc<Mutex<B>>,
}

impl<B> Clone for NvBytes<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: ByteStore> NvBytes<B> {
    pub fn new(store: B) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Holds the store for a multi-step read-modify-write sequence.
    pub fn lock(&self) -> MutexGuard<'_, B> {
        // A panicked writer leaves at most a half-written pair, which the
        // counter already tolerates.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn read_byte(&self, slot: usize) -> u8 {
        self.lock().read_byte(slot)
    }
}

/// Host byte image persisted as a small file, rewritten whole on commit.
#[derive(Debug)]
pub struct FileByteStore {
    path: PathBuf,
    image: [u8; NVRAM_CAPACITY],
}

impl FileByteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NvramError> {
        let path = path.as_ref().to_path_buf();
        let mut image = [0_u8; NVRAM_CAPACITY];

        match fs::read(&path) {
            Ok(raw) => {
                let len = raw.len().min(NVRAM_CAPACITY);
                image[..len].copy_from_slice(&raw[..len]);
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        Ok(Self { path, image })
    }
}

impl ByteStore for FileByteStore {
    fn read_byte(&self, slot: usize) -> u8 {
        self.image.get(slot).copied().unwrap_or(0)
    }

    fn write_byte(&mut self, slot: usize, value: u8) -> Result<(), NvramError> {
        let byte = self
            .image
            .get_mut(slot)
            .ok_or(NvramError::SlotOutOfRange {
                slot,
                capacity: NVRAM_CAPACITY,
            })?;
        *byte = value;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), NvramError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, self.image)?;
        Ok(())
    }
}
