// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Protobuf base-128 varints limited to 32-bit values.
//!
//! Seven value bits per byte, least significant group first, bit 7 set on
//! every byte but the last.

/// Longest encoding of a `u32`.
pub const MAX_VARINT_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VarintError {
    /// The input ended before the terminating byte.
    Truncated,
    /// No terminating byte within five bytes, or the value exceeds 32 bits.
    Overflow,
}

impl core::fmt::Display for VarintError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Truncated => write!(f, "varint truncated"),
            Self::Overflow => write!(f, "varint does not fit in 32 bits"),
        }
    }
}

/// Read a varint from the start of `bytes`, returning the value and the number
/// of bytes consumed.
pub fn read_varint(bytes: &[u8]) -> Result<(u32, usize), VarintError> {
    let mut value = 0u32;
    for (i, &byte) in bytes.iter().take(MAX_VARINT_LEN).enumerate() {
        let group = u32::from(byte & 0x7F);
        if i == MAX_VARINT_LEN - 1 && (byte & 0x80 != 0 || group > 0x0F) {
            return Err(VarintError::Overflow);
        }
        value |= group << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(VarintError::Truncated)
}

/// Encode `value` into `buf`, returning the number of bytes written.
pub fn write_varint(mut value: u32, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut len = 0;
    loop {
        let group = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf[len] = group;
            return len + 1;
        }
        buf[len] = group | 0x80;
        len += 1;
    }
}

/// Number of bytes [`write_varint`] produces for `value`.
pub const fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0xFFF_FFFF => 4,
        _ => 5,
    }
}
