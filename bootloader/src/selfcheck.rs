// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Boot-time check of the bootloader's own flash region.

use crate::{
    config::SelfCheckConfig,
    flash::{Flash, FlashDriver, FlashError},
    platform::{Display, Icon},
    sequencer,
    updater::Directive,
};
use consts::{BOOTLOADER, ERASED_BYTE};
use fwheader::{Sha256, Sha256Hasher};

/// Outcome of [`check_bootloader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SelfCheck {
    /// The installed bootloader is the target one.
    Current,
    /// A known older bootloader was replaced with the target one.
    Updated,
    /// The installed bootloader is not a known release. Nothing was touched.
    Unknown,
    /// Replacing an older bootloader failed on every attempt.
    Broken,
}

impl SelfCheck {
    pub fn directive(&self) -> Directive {
        match self {
            Self::Current | Self::Updated => Directive::Continue,
            Self::Unknown | Self::Broken => Directive::Halt,
        }
    }
}

/// Double SHA-256 of the bootloader region.
pub fn bootloader_hash<D: FlashDriver>(
    flash: &mut Flash<D>,
    sha: &impl Sha256,
) -> Result<[u8; 32], FlashError> {
    let digest = flash.hash(BOOTLOADER, sha)?;
    Ok(sha.hash(&digest))
}

/// Double SHA-256 the bootloader region has once `image` is installed.
pub fn image_hash(image: &[u8], sha: &impl Sha256) -> [u8; 32] {
    let mut hasher = sha.hasher();
    hasher.update(image);
    let padding = [ERASED_BYTE; 256];
    let mut len = image.len();
    while len < BOOTLOADER.len as usize {
        let take = padding.len().min(BOOTLOADER.len as usize - len);
        hasher.update(&padding[..take]);
        len += take;
    }
    sha.hash(&hasher.finalize())
}

/// Compare the installed bootloader against the known releases and replace
/// a known older one with the target image.
///
/// Running the check again right after it returns gives [`SelfCheck::Current`]
/// for an updated bootloader and the same outcome otherwise.
pub fn check_bootloader<D: FlashDriver>(
    flash: &mut Flash<D>,
    display: &mut impl Display,
    sha: &impl Sha256,
    config: &SelfCheckConfig<'_>,
) -> Result<SelfCheck, FlashError> {
    let hash = bootloader_hash(flash, sha)?;
    if hash == config.target_hash {
        debug!("bootloader is current");
        return Ok(SelfCheck::Current);
    }
    if !config.known_hashes.contains(&hash) {
        error!("unknown bootloader");
        display.show_message(Icon::Error, &["Unknown bootloader", "detected."]);
        return Ok(SelfCheck::Unknown);
    }

    display.show_message(Icon::Warning, &["Overwriting bootloader"]);
    for attempt in 1..=config.attempts {
        sequencer::program_bootloader(flash, config.image)?;
        if bootloader_hash(flash, sha)? == config.target_hash {
            info!("bootloader updated after {} attempts", attempt);
            display.show_message(Icon::Ok, &["Update finished", "successfully."]);
            return Ok(SelfCheck::Updated);
        }
        warn!("bootloader attempt {} does not verify", attempt);
    }
    error!("bootloader update broken");
    display.show_message(Icon::Error, &["Bootloader update", "broken.", "", "Unplug your device."]);
    Ok(SelfCheck::Broken)
}
