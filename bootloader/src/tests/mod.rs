extern crate std;


use crate::{
    config::Config,
    flash::{Flash, FlashDriver},
    platform::{ButtonState, Buttons, Confirmation, Display, Icon},
    updater::{Step, Updater},
};
use consts::{FlashRegion, PublicKey, CODE, SECTORS, STORAGE};
use embedded_storage::nor_flash::{ErrorType, NorFlashErrorKind, ReadNorFlash};
use fwheader::{FirmwareHeader, KeySet, Secp256k1Sign, Secp256k1Verify, Sha2, VerificationResult, Version};
use host_protocol::{MessageType, Packets, Response};
use secp256k1::{ecdsa::Signature, All, Message, Secp256k1, SecretKey};
use std::{
    collections::VecDeque,
    string::{String, ToString},
    vec,
    vec::Vec,
};

/// Flash held in RAM. Programming can only clear bits, like real NOR flash.
pub struct RamFlash {
    pub mem: Vec<u8>,
    pub locked: bool,
    /// Sectors erased, in order.
    pub erased: Vec<u8>,
    /// A byte that reads back as this value whatever is written to it.
    pub stuck: Option<(u32, u8)>,
    /// Fail every program operation.
    pub broken: bool,
}

impl RamFlash {
    pub fn new() -> Self {
        Self {
            mem: vec![0xFF; consts::FLASH_TOTAL_LEN as usize],
            locked: true,
            erased: Vec::new(),
            stuck: None,
            broken: false,
        }
    }

    /// Flash with `image` already installed in the code region.
    pub fn with_firmware(image: &[u8]) -> Self {
        let mut flash = Self::new();
        flash.put(CODE.start, image);
        flash
    }

    pub fn put(&mut self, offset: u32, bytes: &[u8]) {
        let offset = offset as usize;
        self.mem[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn fill(&mut self, region: FlashRegion, value: u8) {
        self.region_mut(region).fill(value);
    }

    pub fn region(&self, region: FlashRegion) -> &[u8] {
        &self.mem[region.start as usize..region.end() as usize]
    }

    fn region_mut(&mut self, region: FlashRegion) -> &mut [u8] {
        &mut self.mem[region.start as usize..region.end() as usize]
    }

    fn apply_stuck(&mut self) {
        if let Some((offset, value)) = self.stuck {
            self.mem[offset as usize] = value;
        }
    }
}

impl ErrorType for RamFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for RamFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let src = self
            .mem
            .get(start..start + bytes.len())
            .ok_or(NorFlashErrorKind::OutOfBounds)?;
        bytes.copy_from_slice(src);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}

impl FlashDriver for RamFlash {
    fn unlock(&mut self) {
        self.locked = false;
    }

    fn lock(&mut self) {
        self.locked = true;
    }

    fn erase_sector(&mut self, sector: u8) -> Result<(), Self::Error> {
        if self.locked {
            return Err(NorFlashErrorKind::Other);
        }
        let region = SECTORS[usize::from(sector)];
        self.fill(region, 0xFF);
        self.apply_stuck();
        self.erased.push(sector);
        Ok(())
    }

    fn program_word(&mut self, offset: u32, word: u32) -> Result<(), Self::Error> {
        if self.locked || self.broken {
            return Err(NorFlashErrorKind::Other);
        }
        if offset % 4 != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let start = offset as usize;
        let dst = self
            .mem
            .get_mut(start..start + 4)
            .ok_or(NorFlashErrorKind::OutOfBounds)?;
        for (byte, new) in dst.iter_mut().zip(word.to_le_bytes()) {
            *byte &= new;
        }
        self.apply_stuck();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shown {
    Message(Icon, Vec<String>),
    Progress(u8),
    Fingerprint([u8; 32]),
}

/// Display that remembers everything it was asked to show.
#[derive(Debug, Default)]
pub struct RecordingDisplay {
    pub shown: Vec<Shown>,
}

impl RecordingDisplay {
    pub fn last_message(&self) -> Option<(Icon, Vec<String>)> {
        self.shown.iter().rev().find_map(|shown| match shown {
            Shown::Message(icon, lines) => Some((*icon, lines.clone())),
            _ => None,
        })
    }

    /// Whether the last message contains `text` on one of its lines.
    pub fn last_message_has(&self, text: &str) -> bool {
        self.last_message()
            .is_some_and(|(_, lines)| lines.iter().any(|line| line.contains(text)))
    }

    pub fn progress(&self) -> Vec<u8> {
        self.shown
            .iter()
            .filter_map(|shown| match shown {
                Shown::Progress(percent) => Some(*percent),
                _ => None,
            })
            .collect()
    }

    pub fn fingerprints(&self) -> Vec<[u8; 32]> {
        self.shown
            .iter()
            .filter_map(|shown| match shown {
                Shown::Fingerprint(fingerprint) => Some(*fingerprint),
                _ => None,
            })
            .collect()
    }
}

impl Display for RecordingDisplay {
    fn show_message(&mut self, icon: Icon, lines: &[&str]) {
        assert!(lines.len() <= 6, "too many lines: {lines:?}");
        self.shown
            .push(Shown::Message(icon, lines.iter().map(|line| line.to_string()).collect()));
    }

    fn show_progress(&mut self, percent: u8) {
        assert!(percent <= 100);
        self.shown.push(Shown::Progress(percent));
    }

    fn show_fingerprint(&mut self, fingerprint: &[u8; 32]) {
        self.shown.push(Shown::Fingerprint(*fingerprint));
    }
}

/// Buttons answering prompts from a script. Panics on a prompt nobody
/// expected.
pub struct ScriptedButtons {
    answers: VecDeque<Confirmation>,
}

impl ScriptedButtons {
    pub fn new(answers: &[Confirmation]) -> Self {
        Self {
            answers: answers.iter().copied().collect(),
        }
    }
}

impl Buttons for ScriptedButtons {
    fn poll(&mut self) -> ButtonState {
        match self.answers.pop_front() {
            Some(Confirmation::Confirmed) => ButtonState { yes: true, no: false },
            Some(Confirmation::Rejected) => ButtonState { yes: false, no: true },
            None => panic!("unexpected prompt"),
        }
    }
}

pub struct Signer {
    secp: Secp256k1<All>,
    key: SecretKey,
}

impl Signer {
    pub fn new(seed: u8) -> Self {
        Self {
            secp: Secp256k1::new(),
            key: SecretKey::from_slice(&[seed; 32]).unwrap(),
        }
    }
}

impl Secp256k1Sign for Signer {
    fn sign_ecdsa(&self, msg: [u8; 32]) -> [u8; 64] {
        self.secp
            .sign_ecdsa(&Message::from_digest(msg), &self.key)
            .serialize_compact()
    }

    fn pubkey(&self) -> PublicKey {
        self.key.public_key(&self.secp).serialize()
    }
}

pub struct Verifier(Secp256k1<All>);

impl Secp256k1Verify for Verifier {
    fn verify_ecdsa(&self, msg: [u8; 32], signature: [u8; 64], pubkey: PublicKey) -> VerificationResult {
        let Ok(pubkey) = secp256k1::PublicKey::from_slice(&pubkey) else {
            return VerificationResult::Invalid;
        };
        let Ok(signature) = Signature::from_compact(&signature) else {
            return VerificationResult::Invalid;
        };
        match self.0.verify_ecdsa(&Message::from_digest(msg), &signature, &pubkey) {
            Ok(()) => VerificationResult::Valid,
            Err(_) => VerificationResult::Invalid,
        }
    }
}

pub fn verifier() -> Verifier {
    Verifier(Secp256k1::new())
}

/// Key set made from the secret keys `[seed; 32]` for five consecutive seeds.
pub fn key_set(first_seed: u8) -> KeySet {
    core::array::from_fn(|i| Signer::new(first_seed + i as u8).pubkey())
}

/// Engine configuration trusting `key_sets`.
pub fn config(key_sets: &[KeySet]) -> Config<'_> {
    Config {
        key_sets,
        ..Config::DEFAULT
    }
}

pub fn code(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn header(code: &[u8]) -> FirmwareHeader {
    FirmwareHeader::build(code, Version::new(1, 8, 3), Version::new(1, 8, 0), &Sha2).unwrap()
}

/// Sign slots 1 to 3 with the keys at `indices` of the key set starting at
/// `first_seed`.
pub fn sign(header: &mut FirmwareHeader, first_seed: u8, indices: [u8; 3]) {
    for (slot, index) in (1..=3).zip(indices) {
        header
            .sign(slot, index, &Sha2, &Signer::new(first_seed + index - 1))
            .unwrap();
    }
}

pub fn image(header: &FirmwareHeader, code: &[u8]) -> Vec<u8> {
    let mut image = header.to_bytes().to_vec();
    image.extend_from_slice(code);
    image
}

/// Image of `len` code bytes signed by keys 1 to 3 of the key set starting at
/// `first_seed`.
pub fn signed_image(len: usize, first_seed: u8) -> Vec<u8> {
    let code = code(len);
    let mut header = header(&code);
    sign(&mut header, first_seed, [1, 2, 3]);
    image(&header, &code)
}

pub fn unsigned_image(len: usize) -> Vec<u8> {
    let code = code(len);
    image(&header(&code), &code)
}

pub type TestUpdater<'c> = Updater<'c, RamFlash, RecordingDisplay, ScriptedButtons, Sha2, Verifier>;

pub fn new_updater<'c>(config: &'c Config<'c>, flash: RamFlash, answers: &[Confirmation]) -> TestUpdater<'c> {
    Updater::new(
        config,
        Flash::new(flash).unwrap(),
        RecordingDisplay::default(),
        ScriptedButtons::new(answers),
        Sha2,
        verifier(),
    )
    .unwrap()
}

/// Send one message, returning the step of every packet.
pub fn send<'c>(updater: &mut TestUpdater<'c>, msg_type: MessageType, body: &[u8]) -> Vec<Step<'c>> {
    Packets::new(msg_type, body)
        .map(|packet| updater.process(&packet))
        .collect()
}

pub fn upload<'c>(updater: &mut TestUpdater<'c>, image: &[u8]) -> Vec<Step<'c>> {
    Packets::firmware_upload(image)
        .map(|packet| updater.process(&packet))
        .collect()
}

pub fn responses<'c>(steps: &[Step<'c>]) -> Vec<Response<'c>> {
    steps.iter().filter_map(|step| step.response).collect()
}

/// `Initialize` then a confirmed `FirmwareErase`.
pub fn open_and_erase(updater: &mut TestUpdater<'_>) {
    send(updater, MessageType::Initialize, &[]);
    let steps = send(updater, MessageType::FirmwareErase, &[]);
    assert_eq!(responses(&steps), [Response::Success]);
}

pub fn storage(updater: &TestUpdater<'_>) -> Vec<u8> {
    updater.flash().driver().region(STORAGE).to_vec()
}

pub fn storage_erased(updater: &TestUpdater<'_>) -> bool {
    storage(updater).iter().all(|&b| b == 0xFF)
}
