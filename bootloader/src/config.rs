// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

use fwheader::KeySet;

/// Build-time configuration of the update engine.
#[derive(Debug, Clone, Copy)]
pub struct Config<'a> {
    /// Trusted signing key generations. A signature counts if it verifies
    /// against its key index in any of them.
    pub key_sets: &'a [KeySet],
    pub vendor: &'a str,
    pub model: &'a str,
    pub major_version: u32,
    pub minor_version: u32,
    pub patch_version: u32,
    /// Packets received between two progress bar updates while flashing.
    pub progress_interval: u32,
}

impl Config<'static> {
    pub const DEFAULT: Self = Self {
        key_sets: &[consts::VENDOR_KEYS, consts::VENDOR_KEYS_ALT],
        vendor: "foundation.xyz",
        model: "1",
        major_version: 1,
        minor_version: 8,
        patch_version: 0,
        progress_interval: 32,
    };
}

impl Default for Config<'static> {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Bootloader images the self-check knows about.
#[derive(Debug, Clone, Copy)]
pub struct SelfCheckConfig<'a> {
    /// Double SHA-256 of every bootloader ever released, the target included.
    pub known_hashes: &'a [[u8; 32]],
    /// Double SHA-256 of the bootloader region holding `image`.
    pub target_hash: [u8; 32],
    /// The bootloader to install over a known older one.
    pub image: &'a [u8],
    /// Reflash attempts before giving up.
    pub attempts: u8,
}
