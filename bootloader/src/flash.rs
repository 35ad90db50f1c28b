// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bounds-checked access to the on-chip flash.
//!
//! Every offset is relative to [`consts::FLASH_ORIGIN`]. Reads may touch any
//! byte of the flash; erases work on whole sectors of [`consts::SECTORS`] and
//! programming is only possible through a [`WriteGuard`], which keeps the
//! flash unlocked for exactly as long as it lives.

use consts::{validate_layout, FlashRegion, LayoutError, FLASH_TOTAL_LEN, SECTORS};
use core::ops::RangeInclusive;
use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind, ReadNorFlash};
use fwheader::{Sha256, Sha256Hasher};

/// Size of a programmable flash word.
pub const WORD_SIZE: u32 = 4;

/// Bytes read from flash at once when streaming a region.
const READ_BLOCK: usize = 256;

/// Raw flash driver.
///
/// The driver implements the hardware unlock sequence and the erase and
/// program timing. Programming can only clear bits; only an erase sets them.
pub trait FlashDriver: ReadNorFlash {
    /// Allow erase and program operations.
    fn unlock(&mut self);

    /// Forbid erase and program operations.
    fn lock(&mut self);

    /// Erase sector `sector` of [`consts::SECTORS`].
    fn erase_sector(&mut self, sector: u8) -> Result<(), Self::Error>;

    /// Program one little-endian word at the word-aligned `offset`.
    fn program_word(&mut self, offset: u32, word: u32) -> Result<(), Self::Error>;
}

/// Driver failure, reduced to what the bootloader acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverError {
    NotAligned,
    OutOfBounds,
    Other,
}

impl From<NorFlashErrorKind> for DriverError {
    fn from(kind: NorFlashErrorKind) -> Self {
        match kind {
            NorFlashErrorKind::NotAligned => Self::NotAligned,
            NorFlashErrorKind::OutOfBounds => Self::OutOfBounds,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// The driver reported a failure.
    Driver(DriverError),
    /// The static flash layout is inconsistent.
    Layout(LayoutError),
    /// The driver exposes less flash than the layout needs.
    TooSmall { capacity: usize },
    /// An access falls outside the region it was checked against.
    OutOfBounds { offset: u32, len: u32 },
    /// A write does not start on a word boundary.
    NotAligned { offset: u32 },
    /// A sector id past the end of the sector table.
    NoSuchSector(u8),
    /// Storage does not read back as erased after an erase.
    StorageNotErased,
}

impl core::fmt::Display for FlashError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Driver(e) => write!(f, "flash driver error: {e:?}"),
            Self::Layout(e) => write!(f, "invalid flash layout: {e}"),
            Self::TooSmall { capacity } => {
                write!(f, "flash holds {capacity} bytes, {FLASH_TOTAL_LEN} required")
            }
            Self::OutOfBounds { offset, len } => {
                write!(f, "access of {len} bytes at {offset:#x} is out of bounds")
            }
            Self::NotAligned { offset } => write!(f, "write at {offset:#x} is not word aligned"),
            Self::NoSuchSector(sector) => write!(f, "no flash sector {sector}"),
            Self::StorageNotErased => write!(f, "storage is not erased after erasing it"),
        }
    }
}

fn driver_error<E: NorFlashError>(e: E) -> FlashError {
    FlashError::Driver(e.kind().into())
}

/// The on-chip flash.
pub struct Flash<D> {
    driver: D,
}

impl<D: FlashDriver> Flash<D> {
    /// Wrap `driver`, checking the static layout against it once.
    pub fn new(driver: D) -> Result<Self, FlashError> {
        validate_layout().map_err(FlashError::Layout)?;
        let capacity = driver.capacity();
        if capacity < FLASH_TOTAL_LEN as usize {
            return Err(FlashError::TooSmall { capacity });
        }
        Ok(Self { driver })
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Read `buf.len()` bytes at `offset`, which must lie inside `region`.
    pub fn read(&mut self, region: FlashRegion, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        check_bounds(region, offset, buf.len())?;
        self.driver.read(offset, buf).map_err(driver_error)
    }

    /// Stream `region` through `f` in small blocks. `region` must lie inside
    /// the flash.
    pub fn read_blocks(
        &mut self,
        region: FlashRegion,
        mut f: impl FnMut(&[u8]),
    ) -> Result<(), FlashError> {
        check_bounds(WHOLE_FLASH, region.start, region.len as usize)?;
        let mut block = [0; READ_BLOCK];
        let mut offset = region.start;
        while offset < region.end() {
            let len = (region.end() - offset).min(READ_BLOCK as u32);
            let block = &mut block[..len as usize];
            self.driver.read(offset, block).map_err(driver_error)?;
            f(block);
            offset += len;
        }
        Ok(())
    }

    /// SHA-256 of the contents of `region`.
    pub fn hash(&mut self, region: FlashRegion, sha: &impl Sha256) -> Result<[u8; 32], FlashError> {
        let mut hasher = sha.hasher();
        self.read_blocks(region, |block| hasher.update(block))?;
        Ok(hasher.finalize())
    }

    /// Unlock the flash for writing until the returned guard is dropped.
    pub fn unlock(&mut self) -> WriteGuard<'_, D> {
        debug!("flash unlocked");
        self.driver.unlock();
        WriteGuard {
            driver: &mut self.driver,
        }
    }
}

/// Unlocked flash. Locks the flash again when dropped.
pub struct WriteGuard<'a, D: FlashDriver> {
    driver: &'a mut D,
}

impl<D: FlashDriver> WriteGuard<'_, D> {
    pub fn erase_sector(&mut self, sector: u8) -> Result<(), FlashError> {
        if usize::from(sector) >= SECTORS.len() {
            return Err(FlashError::NoSuchSector(sector));
        }
        debug!("erasing sector {}", sector);
        self.driver.erase_sector(sector).map_err(driver_error)
    }

    /// Erase every sector in `sectors`, calling `progress` after each one with
    /// the number of sectors erased so far.
    pub fn erase_sectors(
        &mut self,
        sectors: RangeInclusive<u8>,
        mut progress: impl FnMut(u32),
    ) -> Result<(), FlashError> {
        for (done, sector) in sectors.enumerate() {
            self.erase_sector(sector)?;
            progress(done as u32 + 1);
        }
        Ok(())
    }

    /// Program `bytes` at the word-aligned `offset`, which must lie inside
    /// `region`. A partial final word is completed with erased bytes.
    pub fn program(&mut self, region: FlashRegion, offset: u32, bytes: &[u8]) -> Result<(), FlashError> {
        check_bounds(region, offset, bytes.len().next_multiple_of(WORD_SIZE as usize))?;
        if offset % WORD_SIZE != 0 {
            return Err(FlashError::NotAligned { offset });
        }
        let mut at = offset;
        for word in bytes.chunks(WORD_SIZE as usize) {
            let mut padded = [consts::ERASED_BYTE; WORD_SIZE as usize];
            padded[..word.len()].copy_from_slice(word);
            self.driver
                .program_word(at, u32::from_le_bytes(padded))
                .map_err(driver_error)?;
            at += WORD_SIZE;
        }
        Ok(())
    }
}

impl<D: FlashDriver> Drop for WriteGuard<'_, D> {
    fn drop(&mut self) {
        self.driver.lock();
        debug!("flash locked");
    }
}

const WHOLE_FLASH: FlashRegion = FlashRegion::new(0, FLASH_TOTAL_LEN);

fn check_bounds(region: FlashRegion, offset: u32, len: usize) -> Result<(), FlashError> {
    let len = u32::try_from(len).map_err(|_| FlashError::OutOfBounds {
        offset,
        len: u32::MAX,
    })?;
    if !region.contains(offset, len) {
        return Err(FlashError::OutOfBounds { offset, len });
    }
    Ok(())
}
