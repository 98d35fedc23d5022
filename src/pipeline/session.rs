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

use log::{debug, warn};

use crate::error::OtaError;
use crate::flash::{FlashPartitionDriver, ImageCheck, SizeHint, Slot, SlotHandle};

/// An open slot write that is discarded unless explicitly committed.
///
/// Dropping the session without [`SlotSession::commit`] ends it with
/// `commit = false`, which covers every early return of the pipeline.
pub(crate) struct SlotSession<'f, F: FlashPartitionDriver> {
    flash: &'f mut F,
    slot: Slot,
    handle: Option<SlotHandle>,
}

impl<'f, F: FlashPartitionDriver> SlotSession<'f, F> {
    pub fn begin(flash: &'f mut F, size_hint: SizeHint, check: ImageCheck) -> Result<Self, OtaError> {
        let handle = flash.begin(size_hint, check)?;
        Ok(Self {
            flash,
            slot: handle.slot,
            handle: Some(handle),
        })
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn written(&self) -> u32 {
        self.handle.as_ref().map_or(0, |h| h.offset)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), OtaError> {
        let handle = self.handle.as_mut().ok_or(OtaError::InvalidState)?;
        let written = self.flash.write(handle, data)?;
        if written != data.len() {
            handle.failed = true;
            return Err(OtaError::FlashWrite(-1));
        }
        Ok(())
    }

    /// The commit point of the whole update.
    pub fn commit(mut self) -> Result<(Slot, u32), OtaError> {
        let handle = self.handle.take().ok_or(OtaError::InvalidState)?;
        let result = (handle.slot, handle.offset);
        self.flash.end(handle, true)?;
        Ok(result)
    }
}

impl<F: FlashPartitionDriver> Drop for SlotSession<'_, F> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Discarding update of slot {}", handle.slot);
            if let Err(e) = self.flash.end(handle, false) {
                warn!("Failed to discard update: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::BootState;
    use crate::test_support::blank_device;

    #[test]
    fn dropping_discards_the_slot() {
        let mut device = blank_device();
        {
            let mut session = SlotSession::begin(&mut device, SizeHint::Unknown, ImageCheck::Disabled).unwrap();
            session.write(b"partial").unwrap();
            assert_eq!(session.written(), 7);
        }
        assert_eq!(device.slot_state(Slot::B), BootState::Empty);
        assert_eq!(device.boot_slot(), Slot::A);
        // The driver accepts a new session, so the old one was ended.
        assert!(device.begin(SizeHint::Unknown, ImageCheck::Disabled).is_ok());
    }

    #[test]
    fn commit_hands_over_to_the_driver() {
        let mut device = blank_device();
        let mut session = SlotSession::begin(&mut device, SizeHint::Unknown, ImageCheck::Disabled).unwrap();
        session.write(b"image").unwrap();
        assert_eq!(session.commit(), Ok((Slot::B, 5)));
        assert_eq!(device.slot_state(Slot::B), BootState::PendingVerify);
    }
}
