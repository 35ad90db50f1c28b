// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device to host responses. Every response fits in a single packet.

use crate::{
    varint::{read_varint, write_varint, MAX_VARINT_LEN},
    write_header, ButtonRequestType, Expect, FailureType, Frame, MessageType, Packet,
    HEADER_LEN, HEADER_PAYLOAD_LEN, PACKET_LEN,
};
use heapless::Vec;

const WIRE_VARINT: u32 = 0;
const WIRE_LEN: u32 = 2;

const FEATURES_VENDOR: u32 = 1;
const FEATURES_MAJOR_VERSION: u32 = 2;
const FEATURES_MINOR_VERSION: u32 = 3;
const FEATURES_PATCH_VERSION: u32 = 4;
const FEATURES_BOOTLOADER_MODE: u32 = 5;
const FEATURES_FIRMWARE_PRESENT: u32 = 18;
const FEATURES_MODEL: u32 = 21;

/// Device description sent in reply to `Initialize` and `GetFeatures`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Features<'a> {
    pub vendor: &'a str,
    pub major_version: u32,
    pub minor_version: u32,
    pub patch_version: u32,
    pub bootloader_mode: bool,
    pub firmware_present: bool,
    pub model: &'a str,
}

/// Responses the bootloader sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Response<'a> {
    Success,
    Failure(FailureType),
    Features(Features<'a>),
    ButtonRequest(ButtonRequestType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EncodeError {
    /// The payload does not fit in one packet.
    TooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    BadMagic,
    UnknownMessage(u16),
    UnknownCode(u32),
    Malformed,
}

impl core::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TooLong => write!(f, "response does not fit in a packet"),
        }
    }
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BadMagic => write!(f, "packet does not start with a message header"),
            Self::UnknownMessage(id) => write!(f, "unknown response message {id}"),
            Self::UnknownCode(code) => write!(f, "unknown response code {code}"),
            Self::Malformed => write!(f, "malformed response payload"),
        }
    }
}

type Payload = Vec<u8, HEADER_PAYLOAD_LEN>;

fn put_varint(buf: &mut Payload, value: u32) -> Result<(), EncodeError> {
    let mut bytes = [0; MAX_VARINT_LEN];
    let len = write_varint(value, &mut bytes);
    buf.extend_from_slice(&bytes[..len]).map_err(|_| EncodeError::TooLong)
}

fn put_key(buf: &mut Payload, field: u32, wire: u32) -> Result<(), EncodeError> {
    put_varint(buf, (field << 3) | wire)
}

fn put_uint(buf: &mut Payload, field: u32, value: u32) -> Result<(), EncodeError> {
    put_key(buf, field, WIRE_VARINT)?;
    put_varint(buf, value)
}

fn put_str(buf: &mut Payload, field: u32, value: &str) -> Result<(), EncodeError> {
    put_key(buf, field, WIRE_LEN)?;
    put_varint(buf, u32::try_from(value.len()).map_err(|_| EncodeError::TooLong)?)?;
    buf.extend_from_slice(value.as_bytes()).map_err(|_| EncodeError::TooLong)
}

impl<'a> Response<'a> {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Success => MessageType::Success,
            Self::Failure(_) => MessageType::Failure,
            Self::Features(_) => MessageType::Features,
            Self::ButtonRequest(_) => MessageType::ButtonRequest,
        }
    }

    /// Encode the response into a zero-padded packet.
    pub fn encode(&self) -> Result<Packet, EncodeError> {
        let mut payload = Payload::new();
        match self {
            Self::Success => {}
            Self::Failure(code) => put_uint(&mut payload, 1, *code as u32)?,
            Self::ButtonRequest(code) => put_uint(&mut payload, 1, *code as u32)?,
            Self::Features(features) => {
                put_str(&mut payload, FEATURES_VENDOR, features.vendor)?;
                put_uint(&mut payload, FEATURES_MAJOR_VERSION, features.major_version)?;
                put_uint(&mut payload, FEATURES_MINOR_VERSION, features.minor_version)?;
                put_uint(&mut payload, FEATURES_PATCH_VERSION, features.patch_version)?;
                put_uint(&mut payload, FEATURES_BOOTLOADER_MODE, features.bootloader_mode.into())?;
                put_uint(&mut payload, FEATURES_FIRMWARE_PRESENT, features.firmware_present.into())?;
                put_str(&mut payload, FEATURES_MODEL, features.model)?;
            }
        }
        let mut packet = [0; PACKET_LEN];
        write_header(&mut packet, self.message_type(), payload.len() as u32);
        packet[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(&payload);
        Ok(packet)
    }

    /// Packet of a `Failure` response. Cannot fail, unlike [`Response::encode`].
    pub fn failure_packet(code: FailureType) -> Packet {
        let mut packet = [0; PACKET_LEN];
        write_header(&mut packet, MessageType::Failure, 2);
        packet[HEADER_LEN] = 0x08;
        packet[HEADER_LEN + 1] = code as u8;
        packet
    }

    /// Decode a response packet, as the host does.
    pub fn decode(packet: &'a Packet) -> Result<Self, DecodeError> {
        let Frame::Header {
            msg_type,
            declared_len,
            payload,
        } = Frame::decode(packet, Expect::Header)
        else {
            return Err(DecodeError::BadMagic);
        };
        let len = usize::try_from(declared_len).map_err(|_| DecodeError::Malformed)?;
        let payload = payload.get(..len).ok_or(DecodeError::Malformed)?;

        match msg_type {
            MessageType::Success => Ok(Self::Success),
            MessageType::Failure => {
                let code = single_code(payload)?;
                FailureType::from_code(code)
                    .map(Self::Failure)
                    .ok_or(DecodeError::UnknownCode(code))
            }
            MessageType::ButtonRequest => match single_code(payload)? {
                9 => Ok(Self::ButtonRequest(ButtonRequestType::FirmwareCheck)),
                code => Err(DecodeError::UnknownCode(code)),
            },
            MessageType::Features => decode_features(payload).map(Self::Features),
            other => Err(DecodeError::UnknownMessage(other.id())),
        }
    }
}

enum Field<'a> {
    Varint(u32),
    Bytes(&'a [u8]),
}

struct Fields<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Fields<'a> {
    type Item = Result<(u32, Field<'a>), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        Some(self.field())
    }
}

impl<'a> Fields<'a> {
    fn varint(&mut self) -> Result<u32, DecodeError> {
        let (value, used) = read_varint(self.rest).map_err(|_| DecodeError::Malformed)?;
        self.rest = &self.rest[used..];
        Ok(value)
    }

    fn field(&mut self) -> Result<(u32, Field<'a>), DecodeError> {
        let key = self.varint()?;
        match key & 0x7 {
            WIRE_VARINT => Ok((key >> 3, Field::Varint(self.varint()?))),
            WIRE_LEN => {
                let len = self.varint()? as usize;
                if len > self.rest.len() {
                    return Err(DecodeError::Malformed);
                }
                let (bytes, rest) = self.rest.split_at(len);
                self.rest = rest;
                Ok((key >> 3, Field::Bytes(bytes)))
            }
            _ => Err(DecodeError::Malformed),
        }
    }
}

fn single_code(payload: &[u8]) -> Result<u32, DecodeError> {
    for field in (Fields { rest: payload }) {
        if let (1, Field::Varint(code)) = field? {
            return Ok(code);
        }
    }
    Err(DecodeError::Malformed)
}

fn decode_features(payload: &[u8]) -> Result<Features<'_>, DecodeError> {
    let mut features = Features {
        vendor: "",
        major_version: 0,
        minor_version: 0,
        patch_version: 0,
        bootloader_mode: false,
        firmware_present: false,
        model: "",
    };
    for field in (Fields { rest: payload }) {
        match field? {
            (FEATURES_VENDOR, Field::Bytes(b)) => {
                features.vendor = core::str::from_utf8(b).map_err(|_| DecodeError::Malformed)?
            }
            (FEATURES_MODEL, Field::Bytes(b)) => {
                features.model = core::str::from_utf8(b).map_err(|_| DecodeError::Malformed)?
            }
            (FEATURES_MAJOR_VERSION, Field::Varint(v)) => features.major_version = v,
            (FEATURES_MINOR_VERSION, Field::Varint(v)) => features.minor_version = v,
            (FEATURES_PATCH_VERSION, Field::Varint(v)) => features.patch_version = v,
            (FEATURES_BOOTLOADER_MODE, Field::Varint(v)) => features.bootloader_mode = v != 0,
            (FEATURES_FIRMWARE_PRESENT, Field::Varint(v)) => features.firmware_present = v != 0,
            _ => {}
        }
    }
    Ok(features)
}
