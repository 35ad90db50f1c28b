// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

use fwheader::{FirmwareHeader, CHUNK_SIZE, HEADER_LEN};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Protocol state of an update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Waiting for `Initialize`.
    Ready,
    /// Host connected, waiting for `FirmwareErase`.
    Open,
    /// Code erased, waiting for `FirmwareUpload`.
    FlashStart,
    /// Receiving image bytes.
    Flashing,
    /// Image received, waiting for the user to check an unsigned image.
    Check,
    /// Session over. Every packet is ignored.
    End,
}

/// Everything one update session accumulates.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct UpdateSession {
    #[zeroize(skip)]
    pub(crate) state: State,
    /// Image bytes received so far.
    pub(crate) bytes_received: u32,
    /// Image length declared by the upload.
    pub(crate) total_len: u32,
    /// Chunk currently being filled.
    pub(crate) chunk_index: u32,
    /// Continuation packets received.
    pub(crate) packets: u32,
    /// Whether the firmware installed before the upload was signed and intact.
    pub(crate) old_firmware_was_signed: bool,
    pub(crate) header: [u8; HEADER_LEN],
    pub(crate) chunk: [u8; CHUNK_SIZE],
}

impl UpdateSession {
    pub const fn new() -> Self {
        Self {
            state: State::Ready,
            bytes_received: 0,
            total_len: 0,
            chunk_index: 0,
            packets: 0,
            old_firmware_was_signed: false,
            header: [0; HEADER_LEN],
            chunk: [0; CHUNK_SIZE],
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Header as received so far.
    pub fn header(&self) -> FirmwareHeader {
        FirmwareHeader::from_bytes(&self.header)
    }

    /// Clear the buffers for an upload of `total_len` bytes. Keeps what was
    /// learned about the installed firmware.
    pub(crate) fn start_upload(&mut self, total_len: u32) {
        self.header.zeroize();
        self.chunk.zeroize();
        self.bytes_received = 0;
        self.chunk_index = 0;
        self.packets = 0;
        self.total_len = total_len;
    }

    /// Zero everything and end the session.
    pub(crate) fn end(&mut self) {
        self.zeroize();
        self.state = State::End;
    }
}

impl Default for UpdateSession {
    fn default() -> Self {
        Self::new()
    }
}
