// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Firmware update protocol.
//!
//! The host drives the update with 64-byte packets:
//!
//! ```text
//! READY      --Initialize-->        OPEN
//! OPEN       --FirmwareErase-->     FLASHSTART   code erased after the user confirms
//! FLASHSTART --FirmwareUpload-->    FLASHING     image length and magic checked
//! FLASHING   --continuations-->     FLASHING     every chunk verified then written
//! FLASHING   --last byte-->         CHECK        committed right away when signed
//! CHECK      --ButtonAck-->         END          user checks the fingerprint
//! ```
//!
//! `Ping`, `GetFeatures` and `WipeDevice` are served in READY and OPEN. Any
//! other message is answered with `UnexpectedMessage` and changes nothing.
//! END ignores everything until the device restarts.

use crate::{
    chunk::{firmware_present, installed_firmware_signed, verify_chunk},
    config::Config,
    flash::{Flash, FlashDriver, FlashError},
    platform::{Buttons, Confirmation, Display, Icon},
    sequencer,
    session::{State, UpdateSession},
};
use consts::{FIRMWARE_MAGIC_NEW, FLASH_APP_LEN, FLASH_FWHEADER_LEN};
use fwheader::{
    chunk_code_capacity, Secp256k1Verify, Sha256, VerificationResult, CHUNK_SIZE, HEADER_LEN,
};
use host_protocol::{
    varint::{read_varint, MAX_VARINT_LEN},
    ButtonRequestType, Expect, FailureType, Features, Frame, MessageType, Packet, Response,
    VarintError, FIRMWARE_UPLOAD_TAG,
};
use zeroize::Zeroize;

const ERROR_INSTALLING: &[&str] = &["Error installing", "firmware.", "", "Unplug your device", "and try again."];
const TOO_SMALL: &[&str] = &["Firmware is", "too small.", "", "Get official firmware."];
const TOO_BIG: &[&str] = &["Firmware is", "too big.", "", "Get official firmware."];
const WRONG_HEADER: &[&str] = &["Wrong firmware", "header.", "", "Get official firmware."];
const CONFIRM_INSTALL: &[&str] = &["Install new", "firmware?", "", "Never do this without", "your recovery card!"];
const INSTALL_ABORTED: &[&str] = &["Firmware installation", "aborted.", "", "You may now", "unplug your device."];
const INSTALLED: &[&str] = &["New firmware", "successfully installed.", "", "Your device", "will now restart."];
const REJECTED: &[&str] = &[
    "Firmware installation",
    "aborted.",
    "",
    "You need to repeat",
    "the procedure with",
    "the correct firmware.",
];
const CONFIRM_WIPE: &[&str] = &["Do you really want to", "wipe the device?", "", "All data will be lost."];
const WIPED: &[&str] = &["Device", "successfully wiped.", "", "You may now", "unplug your device."];
const WIPE_ABORTED: &[&str] = &["Device wipe", "aborted.", "", "You may now", "unplug your device."];

/// Largest `FirmwareUpload` payload: tag, varint length and the largest image.
const MAX_UPLOAD_PAYLOAD: u32 = 1 + MAX_VARINT_LEN as u32 + FLASH_FWHEADER_LEN + FLASH_APP_LEN;

/// What the device must do once a packet has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Directive {
    /// Keep servicing USB.
    Continue,
    /// Restart into the new firmware.
    Reset,
    /// Stop servicing USB. The user has to unplug the device.
    Halt,
}

/// Result of processing one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step<'a> {
    pub response: Option<Response<'a>>,
    pub directive: Directive,
}

impl<'a> Step<'a> {
    fn none() -> Self {
        Self {
            response: None,
            directive: Directive::Continue,
        }
    }

    fn reply(response: Response<'a>) -> Self {
        Self {
            response: Some(response),
            directive: Directive::Continue,
        }
    }

    /// The response as a wire packet. A response that does not fit in one
    /// packet is replaced with a `FirmwareError` failure.
    pub fn packet(&self) -> Option<Packet> {
        self.response.map(|response| {
            response
                .encode()
                .unwrap_or_else(|_| Response::failure_packet(FailureType::FirmwareError))
        })
    }
}

/// Handler a header packet is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Route {
    Initialize,
    Features,
    Ping,
    Wipe,
    Erase,
    Upload,
    Confirm,
    /// Not a message: payload of the upload in progress.
    Data,
    Unexpected,
    Ignore,
}

/// Transition table: the handler for message `msg` received in `state`.
pub fn route(state: State, msg: MessageType) -> Route {
    use MessageType as M;
    match (state, msg) {
        (State::End, _) => Route::Ignore,
        (State::Flashing, _) => Route::Data,
        (State::Ready | State::Open, M::Initialize) => Route::Initialize,
        (State::Ready | State::Open, M::GetFeatures) => Route::Features,
        (State::Ready | State::Open, M::Ping) => Route::Ping,
        (State::Ready | State::Open, M::WipeDevice) => Route::Wipe,
        (State::Open, M::FirmwareErase) => Route::Erase,
        (State::FlashStart, M::FirmwareUpload) => Route::Upload,
        (State::Check, M::ButtonAck) => Route::Confirm,
        _ => Route::Unexpected,
    }
}

/// The update engine. Owns the flash, the session and the user interface for
/// the lifetime of one USB connection.
pub struct Updater<'c, F, D, B, S, V> {
    config: &'c Config<'c>,
    flash: Flash<F>,
    display: D,
    buttons: B,
    sha: S,
    secp: V,
    session: UpdateSession,
    firmware_present: bool,
}

impl<'c, F, D, B, S, V> Updater<'c, F, D, B, S, V>
where
    F: FlashDriver,
    D: Display,
    B: Buttons,
    S: Sha256,
    V: Secp256k1Verify,
{
    pub fn new(
        config: &'c Config<'c>,
        mut flash: Flash<F>,
        display: D,
        buttons: B,
        sha: S,
        secp: V,
    ) -> Result<Self, FlashError> {
        let firmware_present = firmware_present(&mut flash)?;
        info!("firmware present: {}", firmware_present);
        Ok(Self {
            config,
            flash,
            display,
            buttons,
            sha,
            secp,
            session: UpdateSession::new(),
            firmware_present,
        })
    }

    pub fn state(&self) -> State {
        self.session.state()
    }

    pub fn flash(&self) -> &Flash<F> {
        &self.flash
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    /// Handle one packet received from the host.
    pub fn process(&mut self, packet: &Packet) -> Step<'c> {
        let state = self.session.state();
        match state {
            State::End => return Step::none(),
            State::Flashing => return self.receive(packet),
            _ => {}
        }

        let Frame::Header {
            msg_type,
            declared_len,
            payload,
        } = Frame::decode(packet, Expect::Header)
        else {
            debug!("discarding packet without header in {:?}", state);
            return Step::none();
        };

        match route(state, msg_type) {
            Route::Initialize => {
                self.enter(State::Open);
                Step::reply(self.features())
            }
            Route::Features => Step::reply(self.features()),
            Route::Ping => Step::reply(Response::Success),
            Route::Wipe => self.wipe(),
            Route::Erase => self.erase(),
            Route::Upload => self.upload(declared_len, payload),
            Route::Confirm => self.confirm(),
            Route::Data | Route::Ignore => Step::none(),
            Route::Unexpected => {
                warn!("unexpected message {} in {:?}", msg_type.id(), state);
                Step::reply(Response::Failure(FailureType::UnexpectedMessage))
            }
        }
    }

    fn enter(&mut self, state: State) {
        info!("{:?} -> {:?}", self.session.state, state);
        if state == State::End {
            self.session.end();
        } else {
            self.session.state = state;
        }
    }

    fn features(&self) -> Response<'c> {
        Response::Features(Features {
            vendor: self.config.vendor,
            major_version: self.config.major_version,
            minor_version: self.config.minor_version,
            patch_version: self.config.patch_version,
            bootloader_mode: true,
            firmware_present: self.firmware_present,
            model: self.config.model,
        })
    }

    /// End the session over a protocol or format error.
    fn abort(&mut self, code: FailureType, message: &[&str]) -> Step<'c> {
        warn!("aborting update: {:?}", code);
        self.enter(State::End);
        self.display.show_message(Icon::Error, message);
        Step::reply(Response::Failure(code))
    }

    /// The received image does not match its header. Nothing of the old
    /// firmware's secrets may survive next to a partial new image.
    fn tampered(&mut self) -> Step<'c> {
        error!("firmware does not match its header");
        if let Err(e) = sequencer::erase_storage_verified(&mut self.flash, &self.sha) {
            error!("storage wipe failed: {:?}", e);
        }
        self.enter(State::End);
        self.display.show_message(Icon::Error, ERROR_INSTALLING);
        Step {
            response: Some(Response::Failure(FailureType::ProcessError)),
            directive: Directive::Halt,
        }
    }

    /// Flash misbehaved. Its state can no longer be trusted, so nothing is
    /// reported to the host.
    fn hardware_fault(&mut self, e: FlashError) -> Step<'c> {
        error!("flash failure: {:?}", e);
        self.enter(State::End);
        self.display.show_message(Icon::Error, ERROR_INSTALLING);
        Step {
            response: None,
            directive: Directive::Halt,
        }
    }

    fn wipe(&mut self) -> Step<'c> {
        self.display.show_message(Icon::Question, CONFIRM_WIPE);
        if self.buttons.wait_for_confirmation() == Confirmation::Rejected {
            self.enter(State::End);
            self.display.show_message(Icon::Warning, WIPE_ABORTED);
            return Step::reply(Response::Failure(FailureType::ActionCancelled));
        }
        if let Err(e) = sequencer::wipe(&mut self.flash, &mut self.display) {
            return self.hardware_fault(e);
        }
        self.enter(State::End);
        self.display.show_message(Icon::Ok, WIPED);
        Step::reply(Response::Success)
    }

    fn erase(&mut self) -> Step<'c> {
        self.display.show_message(Icon::Question, CONFIRM_INSTALL);
        if self.buttons.wait_for_confirmation() == Confirmation::Rejected {
            self.enter(State::End);
            self.display.show_message(Icon::Warning, INSTALL_ABORTED);
            return Step::reply(Response::Failure(FailureType::ActionCancelled));
        }

        let old_was_signed = match installed_firmware_signed(
            &mut self.flash,
            self.config.key_sets,
            &self.sha,
            &self.secp,
        ) {
            Ok(signed) => signed,
            Err(e) => return self.hardware_fault(e),
        };
        info!("installed firmware signed: {}", old_was_signed);
        if let Err(e) = sequencer::erase_code_region(&mut self.flash, &mut self.display) {
            return self.hardware_fault(e);
        }
        self.session.old_firmware_was_signed = old_was_signed;
        self.enter(State::FlashStart);
        Step::reply(Response::Success)
    }

    fn upload(&mut self, declared_len: u32, payload: &[u8]) -> Step<'c> {
        let Some((&tag, rest)) = payload.split_first() else {
            return self.abort(FailureType::ProcessError, ERROR_INSTALLING);
        };
        if tag != FIRMWARE_UPLOAD_TAG {
            return self.abort(FailureType::ProcessError, ERROR_INSTALLING);
        }
        let (total_len, used) = match read_varint(rest) {
            Ok(value) => value,
            Err(VarintError::Overflow) => return self.abort(FailureType::ProcessError, TOO_BIG),
            Err(VarintError::Truncated) => {
                return self.abort(FailureType::ProcessError, ERROR_INSTALLING)
            }
        };
        info!("upload of {} bytes", total_len);
        if total_len <= FLASH_FWHEADER_LEN {
            return self.abort(FailureType::ProcessError, TOO_SMALL);
        }
        if total_len > FLASH_FWHEADER_LEN + FLASH_APP_LEN || declared_len > MAX_UPLOAD_PAYLOAD {
            return self.abort(FailureType::ProcessError, TOO_BIG);
        }
        let image = &rest[used..];
        if !image.starts_with(&FIRMWARE_MAGIC_NEW) {
            return self.abort(FailureType::ProcessError, WRONG_HEADER);
        }

        self.session.start_upload(total_len);
        self.enter(State::Flashing);
        self.display.show_progress(0);
        self.absorb(image)
    }

    /// Continuation packet of the upload in progress.
    fn receive(&mut self, packet: &Packet) -> Step<'c> {
        let Frame::Continuation(data) = Frame::decode(packet, Expect::Continuation) else {
            warn!("packet without continuation marker while flashing");
            return self.abort(FailureType::ProcessError, ERROR_INSTALLING);
        };
        let session = &mut self.session;
        if session.packets.checked_rem(self.config.progress_interval) == Some(0) {
            let percent = u64::from(session.bytes_received) * 100 / u64::from(session.total_len);
            self.display.show_progress(percent as u8);
        }
        session.packets = session.packets.wrapping_add(1);
        self.absorb(data)
    }

    /// Take image bytes: the header first, then code chunk by chunk. Bytes
    /// past the declared length are dropped.
    fn absorb(&mut self, data: &[u8]) -> Step<'c> {
        let remaining = (self.session.total_len - self.session.bytes_received) as usize;
        let mut data = &data[..data.len().min(remaining)];

        while !data.is_empty() {
            let pos = self.session.bytes_received as usize;
            if pos < HEADER_LEN {
                let take = data.len().min(HEADER_LEN - pos);
                self.session.header[pos..pos + take].copy_from_slice(&data[..take]);
                self.session.bytes_received += take as u32;
                data = &data[take..];
                if pos + take == HEADER_LEN {
                    if let Err(step) = self.check_header() {
                        return step;
                    }
                }
            } else {
                let at = pos % CHUNK_SIZE;
                let take = data.len().min(CHUNK_SIZE - at);
                self.session.chunk[at..at + take].copy_from_slice(&data[..take]);
                self.session.bytes_received += take as u32;
                data = &data[take..];
                if at + take == CHUNK_SIZE {
                    if let Err(step) = self.flush_chunk(CHUNK_SIZE) {
                        return step;
                    }
                }
            }
        }

        if self.session.bytes_received == self.session.total_len {
            return self.finish_upload();
        }
        Step::none()
    }

    fn check_header(&mut self) -> Result<(), Step<'c>> {
        let header = self.session.header();
        let code_len = self.session.total_len - FLASH_FWHEADER_LEN;
        if let Err(e) = header.validate() {
            warn!("received header invalid: {:?}", e);
            return Err(self.abort(FailureType::ProcessError, WRONG_HEADER));
        }
        if header.code_len() != code_len {
            warn!("header code length {} but {} uploaded", header.code_len(), code_len);
            return Err(self.abort(FailureType::ProcessError, WRONG_HEADER));
        }
        let version = header.version();
        info!(
            "receiving firmware {}.{}.{}",
            version.major, version.minor, version.patch
        );
        Ok(())
    }

    /// Verify the chunk being filled, `filled` bytes of it, and write it.
    fn flush_chunk(&mut self, filled: usize) -> Result<(), Step<'c>> {
        let index = self.session.chunk_index as usize;
        let start = CHUNK_SIZE - chunk_code_capacity(index);
        let header = self.session.header();
        let code = &self.session.chunk[start..filled];
        if !verify_chunk(index, code, &header, &self.sha) {
            error!("chunk {} hash mismatch", index);
            return Err(self.tampered());
        }
        debug!("chunk {} verified", index);
        if let Err(e) = sequencer::write_chunk(&mut self.flash, index, code) {
            return Err(self.hardware_fault(e));
        }
        self.session.chunk.zeroize();
        self.session.chunk_index += 1;
        Ok(())
    }

    fn finish_upload(&mut self) -> Step<'c> {
        let filled = self.session.total_len as usize % CHUNK_SIZE;
        if filled != 0 {
            if let Err(step) = self.flush_chunk(filled) {
                return step;
            }
        }
        let header = self.session.header();
        if !header.unused_hashes_zero() {
            warn!("hashes recorded for chunks past the image");
            return self.tampered();
        }

        self.enter(State::Check);
        if header.verify_signatures(self.config.key_sets, &self.sha, &self.secp)
            == VerificationResult::Valid
        {
            warn!("firmware signed, installing without fingerprint check");
            return self.commit(true);
        }
        info!("firmware not signed, asking for fingerprint check");
        Step::reply(Response::ButtonRequest(ButtonRequestType::FirmwareCheck))
    }

    /// `ButtonAck` for the fingerprint check of an unsigned image.
    fn confirm(&mut self) -> Step<'c> {
        let fingerprint = self.session.header().fingerprint(&self.sha);
        self.display.show_fingerprint(&fingerprint);
        let confirmed = self.buttons.wait_for_confirmation() == Confirmation::Confirmed;
        self.commit(confirmed)
    }

    fn commit(&mut self, confirmed: bool) -> Step<'c> {
        self.display.show_progress(100);
        let header = self.session.header();
        let result = sequencer::commit(
            &mut self.flash,
            &header,
            confirmed,
            self.session.old_firmware_was_signed,
            self.config.key_sets,
            &self.sha,
            &self.secp,
        );
        match result {
            Ok(()) if confirmed => {
                self.enter(State::End);
                self.display.show_message(Icon::Ok, INSTALLED);
                Step {
                    response: Some(Response::Success),
                    directive: Directive::Reset,
                }
            }
            Ok(()) => {
                self.enter(State::End);
                self.display.show_message(Icon::Warning, REJECTED);
                Step {
                    response: Some(Response::Failure(FailureType::ProcessError)),
                    directive: Directive::Halt,
                }
            }
            Err(FlashError::StorageNotErased) => {
                self.enter(State::End);
                self.display.show_message(Icon::Error, ERROR_INSTALLING);
                Step {
                    response: Some(Response::Failure(FailureType::ProcessError)),
                    directive: Directive::Halt,
                }
            }
            Err(e) => self.hardware_fault(e),
        }
    }
}
