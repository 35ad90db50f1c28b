// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Flash layout and protocol constants shared by the bootloader, the firmware
//! header model and the host tooling.
//!
//! All offsets are relative to [`FLASH_ORIGIN`]. The flash driver works with
//! offsets, never with raw addresses.

#![no_std]

use core::ops::RangeInclusive;
use hex_literal::hex;
use static_assertions::const_assert_eq;


/// Address at which the on-chip flash is mapped.
pub const FLASH_ORIGIN: u32 = 0x0800_0000;

/// Total size of the on-chip flash (1 MiB).
pub const FLASH_TOTAL_LEN: u32 = 1024 * 1024;

/// A contiguous range of flash, expressed as an offset from [`FLASH_ORIGIN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashRegion {
    pub start: u32,
    pub len: u32,
}

impl FlashRegion {
    pub const fn new(start: u32, len: u32) -> Self {
        Self { start, len }
    }

    /// First offset past the end of the region.
    pub const fn end(&self) -> u32 {
        self.start + self.len
    }

    /// Absolute bus address of the start of the region.
    pub const fn address(&self) -> u32 {
        FLASH_ORIGIN + self.start
    }

    /// Whether `len` bytes starting at `offset` lie entirely inside the region.
    pub const fn contains(&self, offset: u32, len: u32) -> bool {
        match offset.checked_add(len) {
            Some(end) => offset >= self.start && end <= self.end(),
            None => false,
        }
    }

    pub const fn overlaps(&self, other: &FlashRegion) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Hardware erase granules. Sectors are not uniform: four 16 KiB sectors, one
/// 64 KiB sector and seven 128 KiB sectors.
pub const SECTORS: [FlashRegion; 12] = [
    FlashRegion::new(0x0000_0000, 0x4000),
    FlashRegion::new(0x0000_4000, 0x4000),
    FlashRegion::new(0x0000_8000, 0x4000),
    FlashRegion::new(0x0000_C000, 0x4000),
    FlashRegion::new(0x0001_0000, 0x1_0000),
    FlashRegion::new(0x0002_0000, 0x2_0000),
    FlashRegion::new(0x0004_0000, 0x2_0000),
    FlashRegion::new(0x0006_0000, 0x2_0000),
    FlashRegion::new(0x0008_0000, 0x2_0000),
    FlashRegion::new(0x000A_0000, 0x2_0000),
    FlashRegion::new(0x000C_0000, 0x2_0000),
    FlashRegion::new(0x000E_0000, 0x2_0000),
];

/// Bootloader code.
pub const BOOTLOADER: FlashRegion = FlashRegion::new(0x0000_0000, 0x8000);
pub const BOOTLOADER_SECTORS: RangeInclusive<u8> = 0..=1;

/// Persisted storage (seed, PIN, settings). Wiped whenever the trust chain of
/// the installed firmware is broken.
pub const STORAGE: FlashRegion = FlashRegion::new(0x0000_8000, 0x8000);
pub const STORAGE_SECTORS: RangeInclusive<u8> = 2..=3;

/// Firmware header. Its first four bytes double as the "firmware present" flag.
pub const FIRMWARE_HEADER: FlashRegion = FlashRegion::new(0x0001_0000, FLASH_FWHEADER_LEN);

/// Application code, immediately after the header.
pub const APPLICATION: FlashRegion = FlashRegion::new(
    FIRMWARE_HEADER.end(),
    FLASH_TOTAL_LEN - FIRMWARE_HEADER.end(),
);

/// Header and application together. This is the span the chunk hashes cover
/// and the span erased before an upload.
pub const CODE: FlashRegion = FlashRegion::new(FIRMWARE_HEADER.start, FLASH_TOTAL_LEN - FIRMWARE_HEADER.start);
pub const CODE_SECTORS: RangeInclusive<u8> = 4..=11;

/// Size of the firmware header in bytes.
pub const FLASH_FWHEADER_LEN: u32 = 0x400;

/// Maximum size of the application code.
pub const FLASH_APP_LEN: u32 = APPLICATION.len;

/// Size of one hashed firmware chunk.
pub const FW_CHUNK_SIZE: u32 = 64 * 1024;

/// Number of chunk hash slots in the firmware header.
pub const FW_CHUNK_COUNT: usize = 16;

/// Smallest code length of an image considered installed.
pub const MIN_CODE_LEN: u32 = 4096;

/// Byte value of erased flash.
pub const ERASED_BYTE: u8 = 0xFF;

/// Magic of a firmware image with the chunk-hashed header ("TRZF").
pub const FIRMWARE_MAGIC_NEW: [u8; 4] = *b"TRZF";

/// Magic of a legacy firmware image, found at the start of the application
/// region ("TRZR").
pub const FIRMWARE_MAGIC_OLD: [u8; 4] = *b"TRZR";

/// SHA-256 of a fully erased [`STORAGE`] region.
pub const ERASED_STORAGE_SHA256: [u8; 32] =
    hex!("2d864c0b789a43214eee8524d3182075125e5ca2cd527f3582ec87ffd94076bc");

/// Number of public keys in a key set.
pub const PUBKEYS: usize = 5;

/// Number of signatures a firmware header must carry. Fixed by the protocol.
pub const SIGNATURES: usize = 3;

/// Compressed secp256k1 public key.
pub type PublicKey = [u8; 33];

/// Firmware signing keys of the vendor, indexed 1-based by the header's
/// signature indices.
pub const VENDOR_KEYS: [PublicKey; PUBKEYS] = [
    hex!("02d571b7f148c5e4232c3814f777d8faeaf1a84216c78d569b71041ffc768a5b2d"),
    hex!("0363279c0c0866e50c05c799d32bd6bab0188b6de06536d1109d2ed9ce76cb335c"),
    hex!("0243aedbb6f7e71c563f8ed2ef64ec9981482519e7ef4f4aa98b27854e8c49126d"),
    hex!("02877c39fd7c62237e038235e9c075dab261630f78eeb8edb92487159fffedfdf6"),
    hex!("037384c51ae81add0a523adbb186c91b906ffb64c2c765802bf26dbd13bdf12c31"),
];

/// Alternate generation of vendor signing keys. Firmware signed with either
/// generation is trusted.
pub const VENDOR_KEYS_ALT: [PublicKey; PUBKEYS] = [
    hex!("03131349f29ea56b1191f3ee73c9908ce8a51fed3ebd8e7112b5176e556cfe9502"),
    hex!("02e3637b99bd0cb0ab6843b8d26eff8064f9c38ee01f27d471a557c65b76149dd7"),
    hex!("0292ff52a67f65e50cb9d90531edb58ebbe2ca1529a5a3dbebe67f72873307d0f0"),
    hex!("02ae7ae25a3aa272573dc1b095b1119be20f3d7f48c01f518fd1d6a0525dc23fad"),
    hex!("03402139199d4754445c7d1dbee04b58490ea2c5b1540977dbd545e606196d7916"),
];

const_assert_eq!(FLASH_FWHEADER_LEN, 1024);
const_assert_eq!(FW_CHUNK_SIZE % 4, 0);
const_assert_eq!(CODE.end(), FLASH_TOTAL_LEN);
const_assert_eq!(FLASH_FWHEADER_LEN + FLASH_APP_LEN, CODE.len);

/// Every region of the layout, in address order.
pub const LAYOUT: [(&str, FlashRegion, RangeInclusive<u8>); 3] = [
    ("bootloader", BOOTLOADER, BOOTLOADER_SECTORS),
    ("storage", STORAGE, STORAGE_SECTORS),
    ("code", CODE, CODE_SECTORS),
];

/// Layout inconsistency found by [`validate_layout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LayoutError {
    /// The sector table is not contiguous from offset zero.
    SectorGap { sector: u8 },
    /// The sector table does not cover the whole flash.
    SectorsIncomplete,
    /// A region does not match the span of its sectors.
    RegionNotSectorAligned { region: &'static str },
    /// Two regions share bytes.
    RegionsOverlap { first: &'static str, second: &'static str },
    /// The header is not where the code region starts.
    HeaderMisplaced,
    /// Chunks do not cover the largest possible image.
    ChunksTooFew,
}

impl core::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::SectorGap { sector } => write!(f, "sector {sector} does not follow its predecessor"),
            Self::SectorsIncomplete => write!(f, "sector table does not cover the flash"),
            Self::RegionNotSectorAligned { region } => {
                write!(f, "region {region} is not aligned to its sectors")
            }
            Self::RegionsOverlap { first, second } => write!(f, "regions {first} and {second} overlap"),
            Self::HeaderMisplaced => write!(f, "firmware header is not at the start of the code region"),
            Self::ChunksTooFew => write!(f, "chunk hash slots do not cover the code region"),
        }
    }
}

/// Span covered by an inclusive range of sectors.
pub fn sector_span(sectors: &RangeInclusive<u8>) -> Option<FlashRegion> {
    let first = SECTORS.get(usize::from(*sectors.start()))?;
    let last = SECTORS.get(usize::from(*sectors.end()))?;
    Some(FlashRegion::new(first.start, last.end().checked_sub(first.start)?))
}

/// Check the static layout once at startup: sectors are contiguous and cover
/// the flash, every erasable region spans whole sectors, no two regions
/// overlap, and the chunk table covers the code region.
pub fn validate_layout() -> Result<(), LayoutError> {
    let mut expected = 0;
    for (i, sector) in SECTORS.iter().enumerate() {
        if sector.start != expected {
            return Err(LayoutError::SectorGap { sector: i as u8 });
        }
        expected = sector.end();
    }
    if expected != FLASH_TOTAL_LEN {
        return Err(LayoutError::SectorsIncomplete);
    }

    for (name, region, sectors) in LAYOUT.iter() {
        if sector_span(sectors) != Some(*region) {
            return Err(LayoutError::RegionNotSectorAligned { region: name });
        }
    }

    for (i, (first, a, _)) in LAYOUT.iter().enumerate() {
        for (second, b, _) in LAYOUT.iter().skip(i + 1) {
            if a.overlaps(b) {
                return Err(LayoutError::RegionsOverlap { first, second });
            }
        }
    }

    if FIRMWARE_HEADER.start != CODE.start || APPLICATION.start != FIRMWARE_HEADER.end() {
        return Err(LayoutError::HeaderMisplaced);
    }
    if (FW_CHUNK_COUNT as u32) * FW_CHUNK_SIZE < CODE.len {
        return Err(LayoutError::ChunksTooFew);
    }
    Ok(())
}
