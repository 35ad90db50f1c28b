// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Firmware image header.
//!
//! The header occupies the first [`HEADER_LEN`] bytes of an image and of the
//! code region in flash. All integers are little-endian.
//!
//! | offset | size   | field                               |
//! |--------|--------|-------------------------------------|
//! | 0      | 4      | magic (`TRZF`)                      |
//! | 4      | 4      | header length                       |
//! | 8      | 4      | expiry                              |
//! | 12     | 4      | code length                         |
//! | 16     | 4      | version (major, minor, patch, build)|
//! | 20     | 4      | fix version                         |
//! | 24     | 8      | reserved                            |
//! | 32     | 16x32  | chunk hashes                        |
//! | 544    | 3x64   | signatures                          |
//! | 736    | 3      | signature key indices (1-based)     |
//! | 739    | 220    | reserved                            |
//! | 959    | 1      | signature mask                      |
//! | 960    | 64     | signature                           |
//!
//! The last two fields belong to a later signing scheme. They are carried
//! unchanged and are part of the fingerprint.

#![no_std]

use consts::{
    PublicKey, ERASED_BYTE, FIRMWARE_MAGIC_NEW, FLASH_APP_LEN, FLASH_FWHEADER_LEN, FW_CHUNK_COUNT,
    FW_CHUNK_SIZE, MIN_CODE_LEN, PUBKEYS, SIGNATURES,
};


/// Size of the header in bytes.
pub const HEADER_LEN: usize = FLASH_FWHEADER_LEN as usize;

/// Size of one hashed chunk of `header ‖ code`.
pub const CHUNK_SIZE: usize = FW_CHUNK_SIZE as usize;

/// One generation of signing keys, indexed 1-based by the signature indices.
pub type KeySet = [PublicKey; PUBKEYS];

const OFFSET_HEADER_LEN: usize = 4;
const OFFSET_EXPIRY: usize = 8;
const OFFSET_CODE_LEN: usize = 12;
const OFFSET_VERSION: usize = 16;
const OFFSET_FIX_VERSION: usize = 20;
const OFFSET_RESERVED1: usize = 24;
const OFFSET_HASHES: usize = 32;
const OFFSET_SIGNATURES: usize = OFFSET_HASHES + FW_CHUNK_COUNT * 32;
const OFFSET_SIG_INDICES: usize = OFFSET_SIGNATURES + SIGNATURES * 64;
const OFFSET_RESERVED2: usize = OFFSET_SIG_INDICES + SIGNATURES;
const OFFSET_SIGMASK: usize = 959;
const OFFSET_SIG: usize = 960;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareHeader {
    magic: [u8; 4],
    header_len: [u8; 4],
    expiry: [u8; 4],
    code_len: [u8; 4],
    version: [u8; 4],
    fix_version: [u8; 4],
    reserved1: [u8; 8],
    hashes: [[u8; 32]; FW_CHUNK_COUNT],
    signatures: [[u8; 64]; SIGNATURES],
    sig_indices: [u8; SIGNATURES],
    reserved2: [u8; OFFSET_SIGMASK - OFFSET_RESERVED2],
    sigmask: u8,
    sig: [u8; 64],
}

/// Firmware version as stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub build: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
            build: 0,
        }
    }

    pub const fn from_bytes(b: [u8; 4]) -> Self {
        Self {
            major: b[0],
            minor: b[1],
            patch: b[2],
            build: b[3],
        }
    }

    pub const fn to_bytes(self) -> [u8; 4] {
        [self.major, self.minor, self.patch, self.build]
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.build != 0 {
            write!(f, "+{}", self.build)?;
        }
        Ok(())
    }
}

/// SHA-256 hash function.
pub trait Sha256 {
    type Hasher: Sha256Hasher;

    /// Start an incremental hash.
    fn hasher(&self) -> Self::Hasher;

    fn hash(&self, data: &[u8]) -> [u8; 32] {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }
}

/// Incremental SHA-256 state.
pub trait Sha256Hasher {
    fn update(&mut self, data: &[u8]);
    fn finalize(self) -> [u8; 32];
}

/// SHA-256 backed by the `sha2` crate.
#[cfg(feature = "sha2")]
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha2;

#[cfg(feature = "sha2")]
impl Sha256 for Sha2 {
    type Hasher = sha2::Sha256;

    fn hasher(&self) -> sha2::Sha256 {
        <sha2::Sha256 as sha2::Digest>::new()
    }
}

#[cfg(feature = "sha2")]
impl Sha256Hasher for sha2::Sha256 {
    fn update(&mut self, data: &[u8]) {
        sha2::Digest::update(self, data);
    }

    fn finalize(self) -> [u8; 32] {
        sha2::Digest::finalize(self).into()
    }
}

/// ECDSA secp256k1 signing.
pub trait Secp256k1Sign {
    /// Sign a message on the secp256k1 curve.
    fn sign_ecdsa(&self, msg: [u8; 32]) -> [u8; 64];

    /// Get the public key used for signing.
    fn pubkey(&self) -> PublicKey;
}

/// ECDSA secp256k1 verification.
pub trait Secp256k1Verify {
    /// Verify an ECDSA signature against the given public key.
    fn verify_ecdsa(&self, msg: [u8; 32], signature: [u8; 64], pubkey: PublicKey)
        -> VerificationResult;
}

/// Verification result.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum VerificationResult {
    // The values are arbitrary, but chosen to be different by more than one bit to make glitching
    // attacks more difficult.
    Valid = 0xcafebabe,
    Invalid = 0xdeadbeef,
}

impl FirmwareHeader {
    /// Read the header fields without validating them.
    pub fn from_bytes(data: &[u8; HEADER_LEN]) -> Self {
        let mut header = Self::empty();
        header.magic.copy_from_slice(&data[..OFFSET_HEADER_LEN]);
        header.header_len.copy_from_slice(&data[OFFSET_HEADER_LEN..OFFSET_EXPIRY]);
        header.expiry.copy_from_slice(&data[OFFSET_EXPIRY..OFFSET_CODE_LEN]);
        header.code_len.copy_from_slice(&data[OFFSET_CODE_LEN..OFFSET_VERSION]);
        header.version.copy_from_slice(&data[OFFSET_VERSION..OFFSET_FIX_VERSION]);
        header.fix_version.copy_from_slice(&data[OFFSET_FIX_VERSION..OFFSET_RESERVED1]);
        header.reserved1.copy_from_slice(&data[OFFSET_RESERVED1..OFFSET_HASHES]);
        for (i, hash) in header.hashes.iter_mut().enumerate() {
            let at = OFFSET_HASHES + i * 32;
            hash.copy_from_slice(&data[at..at + 32]);
        }
        for (i, signature) in header.signatures.iter_mut().enumerate() {
            let at = OFFSET_SIGNATURES + i * 64;
            signature.copy_from_slice(&data[at..at + 64]);
        }
        header.sig_indices.copy_from_slice(&data[OFFSET_SIG_INDICES..OFFSET_RESERVED2]);
        header.reserved2.copy_from_slice(&data[OFFSET_RESERVED2..OFFSET_SIGMASK]);
        header.sigmask = data[OFFSET_SIGMASK];
        header.sig.copy_from_slice(&data[OFFSET_SIG..]);
        header
    }

    /// Parse and validate the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let bytes = data
            .get(..HEADER_LEN)
            .and_then(|b| <&[u8; HEADER_LEN]>::try_from(b).ok())
            .ok_or(Error::HeaderTooShort)?;
        let header = Self::from_bytes(bytes);
        header.validate()?;
        Ok(header)
    }

    /// Check the fields the bootloader relies on before accepting any code.
    pub fn validate(&self) -> Result<(), Error> {
        if self.magic != FIRMWARE_MAGIC_NEW {
            return Err(Error::WrongMagic);
        }
        if self.header_len() != FLASH_FWHEADER_LEN {
            return Err(Error::InvalidHeaderLen(self.header_len()));
        }
        if self.code_len() > FLASH_APP_LEN {
            return Err(Error::CodeTooLong {
                len: self.code_len() as usize,
            });
        }
        Ok(())
    }

    /// Serialize the header. The result is exactly [`HEADER_LEN`] bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0; HEADER_LEN];
        buf[..OFFSET_HEADER_LEN].copy_from_slice(&self.magic);
        buf[OFFSET_HEADER_LEN..OFFSET_EXPIRY].copy_from_slice(&self.header_len);
        buf[OFFSET_EXPIRY..OFFSET_CODE_LEN].copy_from_slice(&self.expiry);
        buf[OFFSET_CODE_LEN..OFFSET_VERSION].copy_from_slice(&self.code_len);
        buf[OFFSET_VERSION..OFFSET_FIX_VERSION].copy_from_slice(&self.version);
        buf[OFFSET_FIX_VERSION..OFFSET_RESERVED1].copy_from_slice(&self.fix_version);
        buf[OFFSET_RESERVED1..OFFSET_HASHES].copy_from_slice(&self.reserved1);
        for (i, hash) in self.hashes.iter().enumerate() {
            let at = OFFSET_HASHES + i * 32;
            buf[at..at + 32].copy_from_slice(hash);
        }
        for (i, signature) in self.signatures.iter().enumerate() {
            let at = OFFSET_SIGNATURES + i * 64;
            buf[at..at + 64].copy_from_slice(signature);
        }
        buf[OFFSET_SIG_INDICES..OFFSET_RESERVED2].copy_from_slice(&self.sig_indices);
        buf[OFFSET_RESERVED2..OFFSET_SIGMASK].copy_from_slice(&self.reserved2);
        buf[OFFSET_SIGMASK] = self.sigmask;
        buf[OFFSET_SIG..].copy_from_slice(&self.sig);
        buf
    }

    /// Build an unsigned header for `code`, computing every chunk hash.
    pub fn build(
        code: &[u8],
        version: Version,
        fix_version: Version,
        sha: &impl Sha256,
    ) -> Result<Self, Error> {
        if code.len() > FLASH_APP_LEN as usize {
            return Err(Error::CodeTooLong { len: code.len() });
        }
        if code.len() < MIN_CODE_LEN as usize {
            return Err(Error::CodeTooShort { len: code.len() });
        }

        let mut header = Self::empty();
        header.magic = FIRMWARE_MAGIC_NEW;
        header.header_len = FLASH_FWHEADER_LEN.to_le_bytes();
        header.code_len = (code.len() as u32).to_le_bytes();
        header.version = version.to_bytes();
        header.fix_version = fix_version.to_bytes();

        let mut rest = code;
        for (index, slot) in header.hashes.iter_mut().enumerate() {
            if rest.is_empty() {
                break;
            }
            let (chunk, tail) = rest.split_at(rest.len().min(chunk_code_capacity(index)));
            *slot = chunk_digest(index, chunk, sha);
            rest = tail;
        }
        Ok(header)
    }

    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    pub fn header_len(&self) -> u32 {
        u32::from_le_bytes(self.header_len)
    }

    pub fn expiry(&self) -> u32 {
        u32::from_le_bytes(self.expiry)
    }

    /// Length of the code following the header.
    pub fn code_len(&self) -> u32 {
        u32::from_le_bytes(self.code_len)
    }

    pub fn version(&self) -> Version {
        Version::from_bytes(self.version)
    }

    pub fn fix_version(&self) -> Version {
        Version::from_bytes(self.fix_version)
    }

    /// Recorded hash of chunk `index`.
    pub fn chunk_hash(&self, index: usize) -> Option<&[u8; 32]> {
        self.hashes.get(index)
    }

    /// Signature in `slot` (1-based).
    pub fn signature(&self, slot: u8) -> Option<&[u8; 64]> {
        self.signatures.get(usize::from(slot).checked_sub(1)?)
    }

    /// Key index of the signature in `slot` (both 1-based).
    pub fn sig_index(&self, slot: u8) -> Option<u8> {
        self.sig_indices.get(usize::from(slot).checked_sub(1)?).copied()
    }

    /// Number of chunks `header ‖ code` spans.
    pub fn used_chunks(&self) -> usize {
        (HEADER_LEN + self.code_len() as usize)
            .div_ceil(CHUNK_SIZE)
            .min(FW_CHUNK_COUNT)
    }

    /// Whether every hash slot past the used chunks is all-zero.
    pub fn unused_hashes_zero(&self) -> bool {
        self.hashes[self.used_chunks()..]
            .iter()
            .all(|hash| hash.iter().all(|&b| b == 0))
    }

    /// Whether a header with these fields marks installed firmware.
    pub fn is_present(&self) -> bool {
        self.magic == FIRMWARE_MAGIC_NEW
            && self.header_len() == FLASH_FWHEADER_LEN
            && (MIN_CODE_LEN..=FLASH_APP_LEN).contains(&self.code_len())
    }

    /// SHA-256 of the header with the signatures and their indices zeroed.
    ///
    /// This is the message every signature signs, and the value shown to the
    /// user when confirming unsigned firmware.
    pub fn fingerprint(&self, sha: &impl Sha256) -> [u8; 32] {
        let mut unsigned = self.clone();
        unsigned.clear_signatures();
        sha.hash(&unsigned.to_bytes())
    }

    /// Verify the three signatures of the header.
    ///
    /// The key indices must be in `1..=PUBKEYS` and pairwise distinct. Each
    /// signature must verify against the key at its index in any of the
    /// `key_sets`.
    pub fn verify_signatures(
        &self,
        key_sets: &[KeySet],
        sha: &impl Sha256,
        secp: &impl Secp256k1Verify,
    ) -> VerificationResult {
        for (i, &index) in self.sig_indices.iter().enumerate() {
            if index == 0 || usize::from(index) > PUBKEYS {
                return VerificationResult::Invalid;
            }
            if self.sig_indices[i + 1..].contains(&index) {
                return VerificationResult::Invalid;
            }
        }

        let fingerprint = self.fingerprint(sha);
        for (signature, &index) in self.signatures.iter().zip(self.sig_indices.iter()) {
            let key = usize::from(index) - 1;
            let verified = key_sets.iter().any(|set| {
                secp.verify_ecdsa(fingerprint, *signature, set[key]) == VerificationResult::Valid
            });
            if !verified {
                return VerificationResult::Invalid;
            }
        }
        VerificationResult::Valid
    }

    /// Sign the fingerprint into `slot` (1-based) with the key at `index`
    /// (1-based) of the key table.
    pub fn sign(
        &mut self,
        slot: u8,
        index: u8,
        sha: &impl Sha256,
        secp: &impl Secp256k1Sign,
    ) -> Result<(), Error> {
        if !(1..=SIGNATURES as u8).contains(&slot) {
            return Err(Error::InvalidSlot(slot));
        }
        if !(1..=PUBKEYS as u8).contains(&index) {
            return Err(Error::InvalidIndex(index));
        }
        let slot = usize::from(slot - 1);
        let used_elsewhere = self
            .sig_indices
            .iter()
            .enumerate()
            .any(|(i, &other)| i != slot && other == index);
        if used_elsewhere {
            return Err(Error::IndexAlreadyUsed(index));
        }

        let fingerprint = self.fingerprint(sha);
        self.signatures[slot] = secp.sign_ecdsa(fingerprint);
        self.sig_indices[slot] = index;
        Ok(())
    }

    /// Remove all signatures and their indices.
    pub fn clear_signatures(&mut self) {
        self.signatures = [[0; 64]; SIGNATURES];
        self.sig_indices = [0; SIGNATURES];
    }

    fn empty() -> Self {
        Self {
            magic: [0; 4],
            header_len: [0; 4],
            expiry: [0; 4],
            code_len: [0; 4],
            version: [0; 4],
            fix_version: [0; 4],
            reserved1: [0; 8],
            hashes: [[0; 32]; FW_CHUNK_COUNT],
            signatures: [[0; 64]; SIGNATURES],
            sig_indices: [0; SIGNATURES],
            reserved2: [0; OFFSET_SIGMASK - OFFSET_RESERVED2],
            sigmask: 0,
            sig: [0; 64],
        }
    }
}

/// Number of code bytes chunk `index` holds. Chunk 0 shares its space with
/// the header.
pub const fn chunk_code_capacity(index: usize) -> usize {
    if index == 0 {
        CHUNK_SIZE - HEADER_LEN
    } else {
        CHUNK_SIZE
    }
}

/// Incremental digest of one chunk.
///
/// Feed the code bytes of the chunk in order. For chunk 0 this is the code
/// right after the header; the header itself is never part of a chunk hash.
/// A short chunk is hashed as if padded with erased flash bytes, so the digest
/// is the same whether it is taken from RAM or read back from freshly
/// programmed flash.
pub struct ChunkHasher<H> {
    hasher: H,
    pos: usize,
}

impl<H: Sha256Hasher> ChunkHasher<H> {
    pub fn new(index: usize, sha: &impl Sha256<Hasher = H>) -> Self {
        Self {
            hasher: sha.hasher(),
            pos: CHUNK_SIZE - chunk_code_capacity(index),
        }
    }

    /// Hash more of the chunk. Bytes past the end of the chunk are ignored.
    pub fn update(&mut self, data: &[u8]) {
        let take = data.len().min(CHUNK_SIZE - self.pos);
        self.hasher.update(&data[..take]);
        self.pos += take;
    }

    pub fn finalize(mut self) -> [u8; 32] {
        let padding = [ERASED_BYTE; 256];
        while self.pos < CHUNK_SIZE {
            let take = padding.len().min(CHUNK_SIZE - self.pos);
            self.hasher.update(&padding[..take]);
            self.pos += take;
        }
        self.hasher.finalize()
    }
}

/// Digest of chunk `index` holding the code bytes `chunk`.
pub fn chunk_digest(index: usize, chunk: &[u8], sha: &impl Sha256) -> [u8; 32] {
    let mut hasher = ChunkHasher::new(index, sha);
    hasher.update(chunk);
    hasher.finalize()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    HeaderTooShort,
    WrongMagic,
    InvalidHeaderLen(u32),
    CodeTooLong { len: usize },
    CodeTooShort { len: usize },
    InvalidSlot(u8),
    InvalidIndex(u8),
    IndexAlreadyUsed(u8),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::HeaderTooShort => write!(f, "header too short"),
            Self::WrongMagic => write!(f, "wrong magic in header"),
            Self::InvalidHeaderLen(len) => write!(f, "invalid header length {len} in header"),
            Self::CodeTooLong { len } => {
                write!(f, "code too long: {len} bytes, at most {FLASH_APP_LEN} allowed")
            }
            Self::CodeTooShort { len } => {
                write!(f, "code too short: {len} bytes, at least {MIN_CODE_LEN} required")
            }
            Self::InvalidSlot(slot) => {
                write!(f, "invalid signature slot {slot}, must be 1 to {SIGNATURES}")
            }
            Self::InvalidIndex(index) => {
                write!(f, "invalid key index {index}, must be 1 to {PUBKEYS}")
            }
            Self::IndexAlreadyUsed(index) => {
                write!(f, "key index {index} already used by another signature")
            }
        }
    }
}
