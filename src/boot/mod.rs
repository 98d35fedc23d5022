// Copyright (C) 2025 Paul Hampson
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License version 3 as  published by the
// Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program.  If not, see <https://www.gnu.org/licenses/>.

//! Post-reboot half of an update: confirm the new image or give it up.

pub mod loader;

use log::{debug, info, trace, warn};

use crate::error::OtaError;
use crate::flash::{BootState, FlashPartitionDriver};

/// What the application owes the boot-state machine after start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootObligation {
    None,
    /// The running image is on probation. Call
    /// [`BootStateController::commit_current`] once the application is happy
    /// with itself; [`BootStateController::poll`] commits at `deadline_ms`.
    CommitPending { deadline_ms: u64 },
}

#[derive(Debug)]
pub struct BootStateController {
    commit_delay_ms: u64,
    pending_since: Option<u64>,
}

impl Default for BootStateController {
    fn default() -> Self {
        Self::new(Self::DEFAULT_COMMIT_DELAY_MS)
    }
}

impl BootStateController {
    pub const DEFAULT_COMMIT_DELAY_MS: u64 = 30_000;

    pub fn new(commit_delay_ms: u64) -> Self {
        Self {
            commit_delay_ms,
            pending_since: None,
        }
    }

    pub fn on_boot<F: FlashPartitionDriver>(&mut self, flash: &F, now_ms: u64) -> BootObligation {
        let state = flash.running_slot_state();
        match state {
            BootState::PendingVerify => {
                self.pending_since = Some(now_ms);
                info!(
                    "Slot {} runs a new image, committing in {} ms unless rejected",
                    flash.running_slot(),
                    self.commit_delay_ms
                );
                self.obligation()
            }
            _ => {
                self.pending_since = None;
                debug!("Slot {} boot state {:?}", flash.running_slot(), state);
                BootObligation::None
            }
        }
    }

    pub fn obligation(&self) -> BootObligation {
        match self.pending_since {
            Some(since) => BootObligation::CommitPending {
                deadline_ms: since.saturating_add(self.commit_delay_ms),
            },
            None => BootObligation::None,
        }
    }

    /// Confirms a `PendingVerify` image. Already confirmed images are left alone.
    pub fn commit_current<F: FlashPartitionDriver>(&mut self, flash: &mut F) -> Result<(), OtaError> {
        match flash.running_slot_state() {
            BootState::PendingVerify => {
                flash.mark_valid()?;
                self.pending_since = None;
                info!("Image in slot {} committed", flash.running_slot());
                Ok(())
            }
            BootState::Valid | BootState::Undefined => {
                self.pending_since = None;
                Ok(())
            }
            state => {
                warn!("Cannot commit image in state {:?}", state);
                Err(OtaError::InvalidState)
            }
        }
    }

    /// Commits the pending image once the commit delay has passed. Returns
    /// whether it committed.
    pub fn poll<F: FlashPartitionDriver>(&mut self, flash: &mut F, now_ms: u64) -> Result<bool, OtaError> {
        match self.obligation() {
            BootObligation::CommitPending { deadline_ms } if now_ms >= deadline_ms => {
                info!("No rejection within {} ms", self.commit_delay_ms);
                self.commit_current(flash)?;
                Ok(true)
            }
            _ => {
                trace!("Nothing to commit at {}", now_ms);
                Ok(false)
            }
        }
    }

    /// Abandons a confirmed image and reboots into the other slot.
    ///
    /// A `PendingVerify` image is refused; the bootloader falls back on its own
    /// if the image never confirms itself.
    pub fn rollback<F: FlashPartitionDriver>(&mut self, flash: &mut F) -> Result<(), OtaError> {
        match flash.running_slot_state() {
            BootState::Valid | BootState::Undefined => {
                warn!("Rolling back from slot {}", flash.running_slot());
                flash.mark_invalid_and_reboot()
            }
            state => {
                warn!("Rollback refused in state {:?}", state);
                Err(OtaError::InvalidState)
            }
        }
    }

    /// Self-test failure path: rejects the pending image and reboots into the
    /// previous one.
    pub fn reject_current<F: FlashPartitionDriver>(&mut self, flash: &mut F) -> Result<(), OtaError> {
        match flash.running_slot_state() {
            BootState::PendingVerify => {
                warn!("New image in slot {} rejected", flash.running_slot());
                self.pending_since = None;
                flash.mark_invalid_and_reboot()
            }
            state => {
                warn!("Nothing to reject in state {:?}", state);
                Err(OtaError::InvalidState)
            }
        }
    }
}
