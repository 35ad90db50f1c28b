// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chunk hash checks, on received chunks and on installed firmware.

use crate::flash::{Flash, FlashDriver, FlashError};
use consts::{FlashRegion, APPLICATION, CODE, FIRMWARE_HEADER, FIRMWARE_MAGIC_OLD};
use fwheader::{
    chunk_code_capacity, ChunkHasher, FirmwareHeader, KeySet, Secp256k1Verify, Sha256,
    VerificationResult, CHUNK_SIZE, HEADER_LEN,
};

/// Whether `code`, the code bytes of chunk `chunk_index`, matches the hash
/// recorded in `header`. For chunk 0 `code` starts right after the header.
pub fn verify_chunk(
    chunk_index: usize,
    code: &[u8],
    header: &FirmwareHeader,
    sha: &impl Sha256,
) -> bool {
    match header.chunk_hash(chunk_index) {
        Some(expected) => fwheader::chunk_digest(chunk_index, code, sha) == *expected,
        None => false,
    }
}

/// Flash span holding the code of chunk `index`.
fn chunk_region(index: usize) -> FlashRegion {
    let skip = CHUNK_SIZE - chunk_code_capacity(index);
    FlashRegion::new(
        CODE.start + (index * CHUNK_SIZE + skip) as u32,
        chunk_code_capacity(index) as u32,
    )
}

/// Re-hash every chunk `header` uses from flash and check that the unused
/// hash slots are empty.
pub fn verify_flashed_image<D: FlashDriver>(
    flash: &mut Flash<D>,
    header: &FirmwareHeader,
    sha: &impl Sha256,
) -> Result<bool, FlashError> {
    for index in 0..header.used_chunks() {
        let mut hasher = ChunkHasher::new(index, sha);
        flash.read_blocks(chunk_region(index), |block| hasher.update(block))?;
        if Some(&hasher.finalize()) != header.chunk_hash(index) {
            debug!("installed chunk {} does not match", index);
            return Ok(false);
        }
    }
    Ok(header.unused_hashes_zero())
}

/// Header of the installed firmware, whatever it holds.
pub fn installed_header<D: FlashDriver>(flash: &mut Flash<D>) -> Result<FirmwareHeader, FlashError> {
    let mut bytes = [0; HEADER_LEN];
    flash.read(FIRMWARE_HEADER, FIRMWARE_HEADER.start, &mut bytes)?;
    Ok(FirmwareHeader::from_bytes(&bytes))
}

/// Whether any firmware is installed, in the chunk-hashed or the legacy format.
pub fn firmware_present<D: FlashDriver>(flash: &mut Flash<D>) -> Result<bool, FlashError> {
    if installed_header(flash)?.is_present() {
        return Ok(true);
    }
    let mut magic = [0; 4];
    flash.read(APPLICATION, APPLICATION.start, &mut magic)?;
    Ok(magic == FIRMWARE_MAGIC_OLD)
}

/// Whether the installed firmware carries valid signatures and its code
/// matches its chunk hashes.
///
/// Legacy images are never trusted: their signatures are not checked, so
/// replacing one always wipes storage.
pub fn installed_firmware_signed<D: FlashDriver>(
    flash: &mut Flash<D>,
    key_sets: &[KeySet],
    sha: &impl Sha256,
    secp: &impl Secp256k1Verify,
) -> Result<bool, FlashError> {
    let header = installed_header(flash)?;
    if !header.is_present() {
        return Ok(false);
    }
    if header.verify_signatures(key_sets, sha, secp) != VerificationResult::Valid {
        return Ok(false);
    }
    verify_flashed_image(flash, &header, sha)
}
