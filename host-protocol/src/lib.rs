// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host to bootloader communication protocol.
//! The host sends fixed 64-byte USB HID packets. The first packet of a message
//! carries a 9-byte header, every following packet a single `?` marker.
//! Defines message types, response encoding and the packet framing.

#![no_std]

mod packets;
mod response;
pub mod varint;


pub use packets::Packets;
pub use response::{DecodeError, EncodeError, Features, Response};
pub use varint::VarintError;

/// Size of every packet on the wire.
pub const PACKET_LEN: usize = 64;

/// Size of the header at the start of a message's first packet.
pub const HEADER_LEN: usize = 9;

/// Payload bytes carried by a header packet.
pub const HEADER_PAYLOAD_LEN: usize = PACKET_LEN - HEADER_LEN;

/// Payload bytes carried by a continuation packet.
pub const CONTINUATION_PAYLOAD_LEN: usize = PACKET_LEN - 1;

/// Marker at the start of a header packet.
pub const MAGIC: [u8; 3] = *b"?##";

/// Marker at the start of a continuation packet.
pub const CONTINUATION_MARKER: u8 = b'?';

/// Protobuf tag of the length-delimited image field of `FirmwareUpload`.
pub const FIRMWARE_UPLOAD_TAG: u8 = 0x0a;

pub type Packet = [u8; PACKET_LEN];

/// Message identifiers understood by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageType {
    Initialize,
    Ping,
    Success,
    Failure,
    WipeDevice,
    FirmwareErase,
    FirmwareUpload,
    Features,
    ButtonRequest,
    ButtonAck,
    GetFeatures,
    /// Any identifier the bootloader has no handler for.
    Other(u16),
}

impl MessageType {
    pub const fn from_id(id: u16) -> Self {
        match id {
            0 => Self::Initialize,
            1 => Self::Ping,
            2 => Self::Success,
            3 => Self::Failure,
            5 => Self::WipeDevice,
            6 => Self::FirmwareErase,
            7 => Self::FirmwareUpload,
            17 => Self::Features,
            26 => Self::ButtonRequest,
            27 => Self::ButtonAck,
            55 => Self::GetFeatures,
            id => Self::Other(id),
        }
    }

    pub const fn id(&self) -> u16 {
        match self {
            Self::Initialize => 0,
            Self::Ping => 1,
            Self::Success => 2,
            Self::Failure => 3,
            Self::WipeDevice => 5,
            Self::FirmwareErase => 6,
            Self::FirmwareUpload => 7,
            Self::Features => 17,
            Self::ButtonRequest => 26,
            Self::ButtonAck => 27,
            Self::GetFeatures => 55,
            Self::Other(id) => *id,
        }
    }
}

/// Failure codes sent in the `Failure` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum FailureType {
    UnexpectedMessage = 1,
    ActionCancelled = 4,
    ProcessError = 9,
    FirmwareError = 99,
}

impl FailureType {
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::UnexpectedMessage),
            4 => Some(Self::ActionCancelled),
            9 => Some(Self::ProcessError),
            99 => Some(Self::FirmwareError),
            _ => None,
        }
    }
}

/// Reasons the device asks the host to acknowledge a button interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum ButtonRequestType {
    FirmwareCheck = 9,
}

/// What the receiver expects the next packet to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Expect {
    /// The start of a new message.
    Header,
    /// More payload of the message being received.
    Continuation,
}

/// A decoded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    /// First packet of a message. `declared_len` is the length claimed by the
    /// sender and is only a hint.
    Header {
        msg_type: MessageType,
        declared_len: u32,
        payload: &'a [u8],
    },
    /// Payload of a continuation packet.
    Continuation(&'a [u8]),
    /// Not a packet of the expected kind.
    Invalid,
}

impl<'a> Frame<'a> {
    pub fn decode(packet: &'a Packet, expect: Expect) -> Self {
        match expect {
            Expect::Header => {
                if packet[..3] != MAGIC {
                    return Frame::Invalid;
                }
                let msg_type = MessageType::from_id(u16::from_be_bytes([packet[3], packet[4]]));
                let declared_len = u32::from_be_bytes([packet[5], packet[6], packet[7], packet[8]]);
                Frame::Header {
                    msg_type,
                    declared_len,
                    payload: &packet[HEADER_LEN..],
                }
            }
            Expect::Continuation => {
                if packet[0] != CONTINUATION_MARKER {
                    return Frame::Invalid;
                }
                Frame::Continuation(&packet[1..])
            }
        }
    }
}

/// Write the 9-byte message header into the start of `packet`.
pub fn write_header(packet: &mut Packet, msg_type: MessageType, len: u32) {
    packet[..3].copy_from_slice(&MAGIC);
    packet[3..5].copy_from_slice(&msg_type.id().to_be_bytes());
    packet[5..9].copy_from_slice(&len.to_be_bytes());
}
