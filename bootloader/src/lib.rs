// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Firmware update engine of the bootloader.
//!
//! Receives a firmware image over the host protocol, checks every chunk
//! against the hashes in the image header before it reaches flash, decides
//! between automatic install of signed firmware and a fingerprint check by
//! the user, and protects the storage sector whenever the chain of trust of
//! the installed firmware is broken. Also checks the bootloader's own flash
//! region at boot.
//!
//! The engine is hardware independent: flash, display and buttons come in
//! through the [`flash::FlashDriver`], [`platform::Display`] and
//! [`platform::Buttons`] traits.

#![no_std]

#[macro_use]
mod fmt;

pub mod chunk;
pub mod config;
pub mod flash;
pub mod platform;
pub mod selfcheck;
pub mod sequencer;
pub mod session;
pub mod updater;

#[cfg(test)]
mod tests;

pub use config::{Config, SelfCheckConfig};
pub use flash::{Flash, FlashDriver, FlashError};
pub use platform::{Buttons, Confirmation, Display, Icon};
pub use selfcheck::{check_bootloader, SelfCheck};
pub use session::{State, UpdateSession};
pub use updater::{route, Directive, Route, Step, Updater};
