// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Display and buttons, as the update engine sees them.

/// Icon drawn next to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Icon {
    Question,
    Ok,
    Warning,
    Error,
}

pub trait Display {
    /// Show a dialog with up to six lines of text.
    fn show_message(&mut self, icon: Icon, lines: &[&str]);

    /// Show a progress bar, `percent` in `0..=100`.
    fn show_progress(&mut self, percent: u8);

    /// Show the fingerprint of firmware the user is asked to trust.
    fn show_fingerprint(&mut self, fingerprint: &[u8; 32]);
}

/// Buttons released since the last poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ButtonState {
    pub yes: bool,
    pub no: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Confirmation {
    Confirmed,
    Rejected,
}

pub trait Buttons {
    fn poll(&mut self) -> ButtonState;

    /// Block until the user answers the dialog on screen. USB is not serviced
    /// while waiting. No is checked first, so pressing both rejects.
    fn wait_for_confirmation(&mut self) -> Confirmation {
        loop {
            let state = self.poll();
            if state.no {
                return Confirmation::Rejected;
            }
            if state.yes {
                return Confirmation::Confirmed;
            }
        }
    }
}
