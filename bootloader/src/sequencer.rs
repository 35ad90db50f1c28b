// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Ordered erase and program sequences.
//!
//! Each sequence unlocks the flash right before its first write and locks it
//! right after its last one. The firmware header is always the last thing
//! written during an update, so an interrupted update never leaves a
//! header describing code that is not fully in place.

use crate::{
    chunk::verify_flashed_image,
    flash::{Flash, FlashDriver, FlashError},
    platform::Display,
};
use consts::{
    APPLICATION, BOOTLOADER, BOOTLOADER_SECTORS, CODE, CODE_SECTORS,
    ERASED_STORAGE_SHA256, FIRMWARE_HEADER, STORAGE, STORAGE_SECTORS,
};
use fwheader::{
    chunk_code_capacity, FirmwareHeader, KeySet, Secp256k1Verify, Sha256, VerificationResult,
    CHUNK_SIZE,
};

fn sector_count(sectors: &core::ops::RangeInclusive<u8>) -> u32 {
    u32::from(sectors.end() - sectors.start()) + 1
}

fn percent(done: u32, total: u32) -> u8 {
    (done * 100 / total.max(1)).min(100) as u8
}

/// Erase the header and application sectors, reporting progress per sector.
pub fn erase_code_region<D: FlashDriver>(
    flash: &mut Flash<D>,
    display: &mut impl Display,
) -> Result<(), FlashError> {
    info!("erasing code region");
    let total = sector_count(&CODE_SECTORS);
    display.show_progress(0);
    let mut guard = flash.unlock();
    guard.erase_sectors(CODE_SECTORS, |done| display.show_progress(percent(done, total)))
}

/// Erase storage and code, reporting progress per sector.
pub fn wipe<D: FlashDriver>(flash: &mut Flash<D>, display: &mut impl Display) -> Result<(), FlashError> {
    info!("wiping storage and code");
    let total = sector_count(&STORAGE_SECTORS) + sector_count(&CODE_SECTORS);
    let storage = sector_count(&STORAGE_SECTORS);
    display.show_progress(0);
    let mut guard = flash.unlock();
    guard.erase_sectors(STORAGE_SECTORS, |done| display.show_progress(percent(done, total)))?;
    guard.erase_sectors(CODE_SECTORS, |done| {
        display.show_progress(percent(storage + done, total))
    })
}

/// Erase storage, then check that it reads back as erased.
pub fn erase_storage_verified<D: FlashDriver>(
    flash: &mut Flash<D>,
    sha: &impl Sha256,
) -> Result<(), FlashError> {
    warn!("erasing storage");
    flash.unlock().erase_sectors(STORAGE_SECTORS, |_| {})?;
    if flash.hash(STORAGE, sha)? != ERASED_STORAGE_SHA256 {
        error!("storage not erased");
        return Err(FlashError::StorageNotErased);
    }
    Ok(())
}

/// Program the code bytes of chunk `index`. The flash must have been erased
/// by [`erase_code_region`].
pub fn write_chunk<D: FlashDriver>(
    flash: &mut Flash<D>,
    index: usize,
    code: &[u8],
) -> Result<(), FlashError> {
    let skip = CHUNK_SIZE - chunk_code_capacity(index);
    let offset = CODE.start + (index * CHUNK_SIZE + skip) as u32;
    debug!("writing chunk {} ({} bytes) at {}", index, code.len(), offset);
    flash.unlock().program(APPLICATION, offset, code)
}

/// Program the header. A header the user did not confirm is written with a
/// zeroed magic, so the image is never booted.
pub fn write_header<D: FlashDriver>(
    flash: &mut Flash<D>,
    header: &FirmwareHeader,
    confirmed: bool,
) -> Result<(), FlashError> {
    let mut bytes = header.to_bytes();
    if !confirmed {
        bytes[..4].fill(0);
    }
    info!("writing header, confirmed: {}", confirmed);
    flash
        .unlock()
        .program(FIRMWARE_HEADER, FIRMWARE_HEADER.start, &bytes)
}

/// Finish an update whose chunks are all written.
///
/// Storage is wiped unless the previous firmware was signed and the new one
/// is signed with every chunk intact in flash. The header is written last.
pub fn commit<D: FlashDriver>(
    flash: &mut Flash<D>,
    header: &FirmwareHeader,
    confirmed: bool,
    old_was_signed: bool,
    key_sets: &[KeySet],
    sha: &impl Sha256,
    secp: &impl Secp256k1Verify,
) -> Result<(), FlashError> {
    let signed = header.verify_signatures(key_sets, sha, secp) == VerificationResult::Valid;
    let intact = verify_flashed_image(flash, header, sha)?;
    info!(
        "committing: old signed {}, new signed {}, chunks intact {}",
        old_was_signed, signed, intact
    );
    if !old_was_signed || !signed || !intact {
        erase_storage_verified(flash, sha)?;
    }
    write_header(flash, header, confirmed)
}

/// Replace the bootloader with `image`. The rest of the region is left erased.
pub fn program_bootloader<D: FlashDriver>(flash: &mut Flash<D>, image: &[u8]) -> Result<(), FlashError> {
    warn!("overwriting bootloader with {} bytes", image.len());
    let mut guard = flash.unlock();
    guard.erase_sectors(BOOTLOADER_SECTORS, |_| {})?;
    guard.program(BOOTLOADER, BOOTLOADER.start, image)
}
