// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::{
    varint::{write_varint, MAX_VARINT_LEN},
    write_header, MessageType, Packet, CONTINUATION_MARKER, FIRMWARE_UPLOAD_TAG, HEADER_LEN,
    PACKET_LEN,
};
use heapless::Vec;

/// Splits one message into wire packets, as the host sends them.
///
/// The payload is `prefix ‖ body`. The prefix holds the few bytes of protobuf
/// framing that precede a large body, so the body never has to be copied.
#[derive(Debug, Clone)]
pub struct Packets<'a> {
    msg_type: MessageType,
    prefix: Vec<u8, 8>,
    body: &'a [u8],
    pos: usize,
    started: bool,
}

impl<'a> Packets<'a> {
    pub fn new(msg_type: MessageType, body: &'a [u8]) -> Self {
        Self {
            msg_type,
            prefix: Vec::new(),
            body,
            pos: 0,
            started: false,
        }
    }

    /// Packets of a `FirmwareUpload` message carrying `image`.
    pub fn firmware_upload(image: &'a [u8]) -> Self {
        let mut varint = [0; MAX_VARINT_LEN];
        let len = write_varint(image.len() as u32, &mut varint);
        let mut prefix = Vec::new();
        // Tag plus at most five varint bytes always fits.
        let _ = prefix.push(FIRMWARE_UPLOAD_TAG);
        let _ = prefix.extend_from_slice(&varint[..len]);
        Self {
            prefix,
            ..Self::new(MessageType::FirmwareUpload, image)
        }
    }

    /// Total payload length, as declared in the message header.
    pub fn payload_len(&self) -> usize {
        self.prefix.len() + self.body.len()
    }

    fn byte(&self, index: usize) -> u8 {
        match index.checked_sub(self.prefix.len()) {
            None => self.prefix[index],
            Some(i) => self.body[i],
        }
    }

    fn fill(&mut self, out: &mut [u8]) {
        let end = self.payload_len();
        for slot in out.iter_mut() {
            if self.pos == end {
                break;
            }
            *slot = self.byte(self.pos);
            self.pos += 1;
        }
    }
}

impl Iterator for Packets<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        let mut packet = [0; PACKET_LEN];
        if !self.started {
            self.started = true;
            write_header(&mut packet, self.msg_type, self.payload_len() as u32);
            self.fill(&mut packet[HEADER_LEN..]);
            return Some(packet);
        }
        if self.pos == self.payload_len() {
            return None;
        }
        packet[0] = CONTINUATION_MARKER;
        self.fill(&mut packet[1..]);
        Some(packet)
    }
}
