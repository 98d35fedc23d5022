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

use crc::Digest;
use embedded_storage::nor_flash::{MultiwriteNorFlash, NorFlash, NorFlashError};
use log::{debug, error, info, trace, warn};

use crate::error::OtaError;
use crate::flash::state_record::{BootRecord, SlotRecord};
use crate::flash::{
    BootState, CRC32, FlashPartitionDriver, ImageCheck, PartitionLayout, Reboot, SizeHint, Slot,
    SlotHandle,
};

/// Largest flash write unit supported; sub-unit tails are staged in RAM.
const MAX_WRITE_SIZE: usize = 32;

/// Two firmware slots and a boot record on a NOR flash.
///
/// The boot record is read once at mount and cached; every change to it is
/// written through before the call returns.
pub struct NorFlashSlots<F: MultiwriteNorFlash, R: Reboot> {
    flash: F,
    layout: PartitionLayout,
    running: Slot,
    reboot: R,
    record: BootRecord,
    session: Option<WriteSession>,
}

struct WriteSession {
    slot: Slot,
    check: ImageCheck,
    /// Slot-relative end of the erased area
    erased_to: u32,
    /// Slot-relative end of the programmed area
    flushed: u32,
    staged: heapless::Vec<u8, MAX_WRITE_SIZE>,
    crc: Digest<'static, u32>,
}

impl WriteSession {
    fn new(slot: Slot, check: ImageCheck) -> Self {
        Self {
            slot,
            check,
            erased_to: 0,
            flushed: 0,
            staged: heapless::Vec::new(),
            crc: CRC32.digest(),
        }
    }

    fn program<F: NorFlash>(&mut self, flash: &mut F, base: u32, data: &[u8]) -> Result<(), OtaError> {
        self.crc.update(data);

        let mut data = data;
        if !self.staged.is_empty() {
            let take = (F::WRITE_SIZE - self.staged.len()).min(data.len());
            self.staged
                .extend_from_slice(&data[..take])
                .map_err(|_| OtaError::Overflow)?;
            data = &data[take..];
            if self.staged.len() == F::WRITE_SIZE {
                let unit = self.staged.clone();
                self.staged.clear();
                self.program_aligned(flash, base, &unit)?;
            }
        }

        let aligned = data.len() - data.len() % F::WRITE_SIZE;
        if aligned > 0 {
            self.program_aligned(flash, base, &data[..aligned])?;
        }
        self.staged
            .extend_from_slice(&data[aligned..])
            .map_err(|_| OtaError::Overflow)
    }

    fn program_aligned<F: NorFlash>(&mut self, flash: &mut F, base: u32, bytes: &[u8]) -> Result<(), OtaError> {
        let end = self.flushed + bytes.len() as u32;
        while self.erased_to < end {
            let from = base + self.erased_to;
            trace!("Erasing 0x{:x}..0x{:x}", from, from + F::ERASE_SIZE as u32);
            flash
                .erase(from, from + F::ERASE_SIZE as u32)
                .map_err(|e| OtaError::from(e.kind()))?;
            self.erased_to += F::ERASE_SIZE as u32;
        }
        flash
            .write(base + self.flushed, bytes)
            .map_err(|e| OtaError::from(e.kind()))?;
        self.flushed = end;
        Ok(())
    }

    /// Flushes the staged tail (padded with erased bytes) and returns the image CRC.
    fn finish<F: NorFlash>(mut self, flash: &mut F, base: u32) -> Result<u32, OtaError> {
        if !self.staged.is_empty() {
            let mut unit = [0xFFu8; MAX_WRITE_SIZE];
            unit[..self.staged.len()].copy_from_slice(&self.staged);
            self.staged.clear();
            self.program_aligned(flash, base, &unit[..F::WRITE_SIZE])?;
        }
        Ok(self.crc.finalize())
    }
}

impl<F: MultiwriteNorFlash, R: Reboot> NorFlashSlots<F, R> {
    /// Takes over the flash, `running` being the slot the bootloader started.
    pub fn mount(mut flash: F, layout: PartitionLayout, running: Slot, reboot: R) -> Result<Self, OtaError> {
        layout.validate(F::ERASE_SIZE, flash.capacity())?;
        if F::WRITE_SIZE > MAX_WRITE_SIZE || MAX_WRITE_SIZE % F::WRITE_SIZE != 0 {
            error!("Unsupported flash write size {}", F::WRITE_SIZE);
            return Err(OtaError::InvalidArg);
        }

        let record = BootRecord::load(&mut flash, &layout)?;
        info!(
            "Slots mounted: running {} ({:?}), other {:?}, next boot {}",
            running,
            record.slot(running).state,
            record.slot(running.other()).state,
            record.boot_slot
        );

        Ok(Self {
            flash,
            layout,
            running,
            reboot,
            record,
            session: None,
        })
    }

    pub fn record(&self) -> &BootRecord {
        &self.record
    }

    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    /// Reads back bytes of a slot.
    pub fn read_slot(&mut self, slot: Slot, offset: u32, buf: &mut [u8]) -> Result<(), OtaError> {
        let range = self.layout.slot(slot);
        if offset as u64 + buf.len() as u64 > (range.end - range.start) as u64 {
            return Err(OtaError::InvalidArg);
        }
        self.flash
            .read(range.start + offset, buf)
            .map_err(|e| OtaError::from(e.kind()))
    }

    pub fn into_flash(self) -> F {
        self.flash
    }

    pub fn into_parts(self) -> (F, R) {
        (self.flash, self.reboot)
    }

    /// Applies `change` to a copy of the record and writes it if it differs.
    fn update_record(&mut self, change: impl FnOnce(&mut BootRecord)) -> Result<(), OtaError> {
        let mut next = self.record;
        change(&mut next);
        if next == self.record {
            return Ok(());
        }
        next.store(&mut self.flash, &self.layout)?;
        self.record = next;
        Ok(())
    }
}

impl<F: MultiwriteNorFlash, R: Reboot> FlashPartitionDriver for NorFlashSlots<F, R> {
    fn running_slot(&self) -> Slot {
        self.running
    }

    fn slot_state(&self, slot: Slot) -> BootState {
        self.record.slot(slot).state
    }

    fn boot_slot(&self) -> Slot {
        self.record.boot_slot
    }

    fn slot_capacity(&self) -> u32 {
        self.layout.slot_size()
    }

    fn image_len(&self, slot: Slot) -> Option<u32> {
        match self.record.slot(slot).state {
            BootState::Empty | BootState::Undefined => None,
            _ => Some(self.record.slot(slot).image_len),
        }
    }

    fn begin(&mut self, size_hint: SizeHint, check: ImageCheck) -> Result<SlotHandle, OtaError> {
        if self.session.is_some() {
            warn!("An update session is already open");
            return Err(OtaError::InvalidState);
        }
        if self.running_slot_state() == BootState::PendingVerify {
            warn!("Running image in slot {} is not confirmed yet", self.running);
            return Err(OtaError::InvalidState);
        }
        if let SizeHint::Bytes(len) = size_hint {
            if len > self.slot_capacity() {
                warn!("Image of {} bytes does not fit slot of {} bytes", len, self.slot_capacity());
                return Err(OtaError::Overflow);
            }
        }

        let running = self.running;
        let target = running.other();
        // The target is about to be erased, so nothing may point at it anymore.
        self.update_record(|r| {
            if r.slot(target).state != BootState::Empty {
                *r.slot_mut(target) = SlotRecord::new(BootState::Empty);
            }
            if r.boot_slot == target {
                r.boot_slot = running;
            }
        })?;

        self.session = Some(WriteSession::new(target, check));
        info!("Writing slot {} ({:?}, check {:?})", target, size_hint, check);
        Ok(SlotHandle::new(target, size_hint))
    }

    fn write(&mut self, handle: &mut SlotHandle, data: &[u8]) -> Result<usize, OtaError> {
        if handle.failed {
            return Err(OtaError::InvalidState);
        }
        let capacity = self.slot_capacity();
        let base = self.layout.slot(handle.slot).start;
        let Some(session) = self.session.as_mut().filter(|s| s.slot == handle.slot) else {
            warn!("Write to slot {} without an open session", handle.slot);
            return Err(OtaError::InvalidState);
        };

        let limit = match handle.size_hint {
            SizeHint::Bytes(len) => len.min(capacity),
            SizeHint::Unknown => capacity,
        };
        let end = handle.offset as u64 + data.len() as u64;
        if end > limit as u64 {
            warn!("Write of {} bytes at {} exceeds limit {}", data.len(), handle.offset, limit);
            handle.failed = true;
            return Err(OtaError::Overflow);
        }

        if let Err(e) = session.program(&mut self.flash, base, data) {
            error!("Flash write to slot {} failed at {}: {}", handle.slot, handle.offset, e);
            handle.failed = true;
            return Err(e);
        }
        handle.offset = end as u32;
        Ok(data.len())
    }

    fn end(&mut self, handle: SlotHandle, commit: bool) -> Result<(), OtaError> {
        let session = match self.session.take() {
            Some(session) if session.slot == handle.slot => session,
            other => {
                self.session = other;
                return Err(OtaError::InvalidState);
            }
        };

        if !commit {
            info!("Update of slot {} discarded after {} bytes", handle.slot, handle.offset);
            return Ok(());
        }
        if handle.failed {
            warn!("Refusing to commit slot {} after a failed write", handle.slot);
            return Err(OtaError::InvalidState);
        }

        let target = handle.slot;
        let check = session.check;
        let crc = session.finish(&mut self.flash, self.layout.slot(target).start)?;
        self.update_record(|r| {
            *r.slot_mut(target) = SlotRecord {
                state: BootState::PendingVerify,
                attempted: false,
                check,
                image_len: handle.offset,
                image_crc: if check == ImageCheck::Crc32 { crc } else { 0 },
            };
            let other = r.slot_mut(target.other());
            if other.state == BootState::PendingVerify {
                other.state = BootState::Aborted;
            }
            r.boot_slot = target;
        })?;

        info!("Slot {} committed with {} bytes, next boot attempts it", target, handle.offset);
        Ok(())
    }

    fn set_active(&mut self, slot: Slot) -> Result<(), OtaError> {
        let state = self.slot_state(slot);
        if !matches!(
            state,
            BootState::Valid | BootState::PendingVerify | BootState::Undefined
        ) {
            warn!("Slot {} is {:?} and cannot be booted", slot, state);
            return Err(OtaError::InvalidState);
        }
        debug!("Next boot set to slot {}", slot);
        self.update_record(|r| r.boot_slot = slot)
    }

    fn mark_valid(&mut self) -> Result<(), OtaError> {
        let running = self.running;
        match self.running_slot_state() {
            BootState::Valid => Ok(()),
            BootState::PendingVerify | BootState::Undefined => {
                self.update_record(|r| {
                    r.slot_mut(running).state = BootState::Valid;
                    r.boot_slot = running;
                })?;
                info!("Image in slot {} marked valid", running);
                Ok(())
            }
            state => {
                warn!("Cannot mark slot {} valid from {:?}", running, state);
                Err(OtaError::InvalidState)
            }
        }
    }

    fn mark_invalid_and_reboot(&mut self) -> Result<(), OtaError> {
        let running = self.running;
        let fallback = running.other();
        if self.session.is_some() {
            warn!("Cannot roll back while an update session is open");
            return Err(OtaError::InvalidState);
        }
        if !self.slot_state(fallback).is_fallback() {
            warn!(
                "No image to fall back to, slot {} is {:?}",
                fallback,
                self.slot_state(fallback)
            );
            return Err(OtaError::InvalidState);
        }

        self.update_record(|r| {
            r.slot_mut(running).state = BootState::Invalid;
            r.boot_slot = fallback;
        })?;
        warn!("Slot {} marked invalid, rebooting into slot {}", running, fallback);
        self.reboot.reboot();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::RamFlash;
    use crate::test_support::{RebootLog, TestFlash, test_layout};

    fn mount_blank() -> NorFlashSlots<TestFlash, RebootLog> {
        let flash = TestFlash::new(test_layout().slots[1].end as usize);
        NorFlashSlots::mount(flash, test_layout(), Slot::A, RebootLog::default()).unwrap()
    }

    fn remount(slots: NorFlashSlots<TestFlash, RebootLog>, running: Slot) -> NorFlashSlots<TestFlash, RebootLog> {
        let (flash, reboot) = slots.into_parts();
        NorFlashSlots::mount(flash, test_layout(), running, reboot).unwrap()
    }

    fn write_image(slots: &mut NorFlashSlots<TestFlash, RebootLog>, image: &[u8]) {
        let mut handle = slots.begin(SizeHint::Unknown, ImageCheck::Disabled).unwrap();
        assert_eq!(slots.write(&mut handle, image), Ok(image.len()));
        slots.end(handle, true).unwrap();
    }

    #[test]
    fn commit_marks_other_slot_pending_and_boots_it() {
        let mut slots = mount_blank();
        assert_eq!(slots.running_slot_state(), BootState::Undefined);

        write_image(&mut slots, b"new firmware");

        assert_eq!(slots.slot_state(Slot::B), BootState::PendingVerify);
        assert_eq!(slots.slot_state(Slot::A), BootState::Undefined);
        assert_eq!(slots.boot_slot(), Slot::B);
        assert_eq!(slots.image_len(Slot::B), Some(12));

        let mut buf = [0u8; 12];
        slots.read_slot(Slot::B, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"new firmware");
    }

    #[test]
    fn begin_never_selects_running_slot() {
        let slots = mount_blank();
        let mut slots = remount(slots, Slot::B);
        let handle = slots.begin(SizeHint::Unknown, ImageCheck::Disabled).unwrap();
        assert_eq!(handle.slot, Slot::A);
        slots.end(handle, false).unwrap();
    }

    #[test]
    fn begin_refused_while_running_image_unconfirmed() {
        let mut slots = mount_blank();
        write_image(&mut slots, b"image");
        let mut slots = remount(slots, Slot::B);
        assert_eq!(slots.running_slot_state(), BootState::PendingVerify);
        assert_eq!(
            slots.begin(SizeHint::Unknown, ImageCheck::Disabled).err(),
            Some(OtaError::InvalidState)
        );
    }

    #[test]
    fn only_one_session_at_a_time() {
        let mut slots = mount_blank();
        let handle = slots.begin(SizeHint::Unknown, ImageCheck::Disabled).unwrap();
        assert_eq!(
            slots.begin(SizeHint::Unknown, ImageCheck::Disabled).err(),
            Some(OtaError::InvalidState)
        );
        slots.end(handle, false).unwrap();
        assert!(slots.begin(SizeHint::Unknown, ImageCheck::Disabled).is_ok());
    }

    #[test]
    fn oversized_images_overflow() {
        let mut slots = mount_blank();
        let capacity = slots.slot_capacity();
        assert_eq!(
            slots.begin(SizeHint::Bytes(capacity + 1), ImageCheck::Disabled).err(),
            Some(OtaError::Overflow)
        );

        let mut handle = slots.begin(SizeHint::Bytes(8), ImageCheck::Disabled).unwrap();
        assert_eq!(slots.write(&mut handle, &[0; 8]), Ok(8));
        assert_eq!(slots.write(&mut handle, &[0; 1]), Err(OtaError::Overflow));
        // The failure is sticky.
        assert_eq!(slots.write(&mut handle, &[]), Err(OtaError::InvalidState));
        assert_eq!(slots.end(handle, true), Err(OtaError::InvalidState));
        assert_eq!(slots.slot_state(Slot::B), BootState::Empty);
    }

    #[test]
    fn unknown_size_is_bounded_by_slot() {
        let mut slots = mount_blank();
        let capacity = slots.slot_capacity() as usize;
        let mut handle = slots.begin(SizeHint::Unknown, ImageCheck::Disabled).unwrap();
        let chunk = alloc::vec![0xA5u8; capacity];
        assert_eq!(slots.write(&mut handle, &chunk), Ok(capacity));
        assert_eq!(slots.write(&mut handle, &[0]), Err(OtaError::Overflow));
        slots.end(handle, false).unwrap();
    }

    #[test]
    fn flash_failure_aborts_without_touching_boot_state() {
        let mut flash = TestFlash::new(test_layout().slots[1].end as usize);
        flash.fail_after_writes(0);
        let mut slots = NorFlashSlots::mount(flash, test_layout(), Slot::A, RebootLog::default()).unwrap();
        let before = *slots.record();

        let mut handle = slots.begin(SizeHint::Unknown, ImageCheck::Disabled).unwrap();
        assert_eq!(slots.write(&mut handle, &[1; 64]), Err(OtaError::FlashWrite(3)));
        assert!(handle.failed);
        slots.end(handle, false).unwrap();
        assert_eq!(slots.record(), &before);
    }

    #[test]
    fn abort_leaves_boot_pointer_alone() {
        let mut slots = mount_blank();
        let mut handle = slots.begin(SizeHint::Bytes(64), ImageCheck::Disabled).unwrap();
        slots.write(&mut handle, &[7; 32]).unwrap();
        slots.end(handle, false).unwrap();

        assert_eq!(slots.boot_slot(), Slot::A);
        assert_eq!(slots.slot_state(Slot::B), BootState::Empty);
        assert_eq!(slots.slot_state(Slot::A), BootState::Undefined);
    }

    #[test]
    fn unaligned_writes_are_staged() {
        let mut slots = mount_blank();
        let mut handle = slots.begin(SizeHint::Unknown, ImageCheck::Disabled).unwrap();
        for piece in [&b"abc"[..], b"defgh", b"i", b"jklmnopqrs"] {
            slots.write(&mut handle, piece).unwrap();
        }
        slots.end(handle, true).unwrap();

        let mut buf = [0u8; 24];
        slots.read_slot(Slot::B, 0, &mut buf).unwrap();
        assert_eq!(&buf[..19], b"abcdefghijklmnopqrs");
        assert_eq!(&buf[19..], &[0xFF; 5]);
        assert_eq!(slots.image_len(Slot::B), Some(19));
    }

    #[test]
    fn erase_follows_the_write_position() {
        let layout = test_layout();
        let mut flash = TestFlash::new(layout.slots[1].end as usize);
        // Pretend an old image fills slot B.
        flash.as_mut_bytes()[layout.slots[1].start as usize..].fill(0x00);
        let mut slots = NorFlashSlots::mount(flash, layout.clone(), Slot::A, RebootLog::default()).unwrap();

        write_image(&mut slots, &[0x11; 100]);

        let bytes = slots.into_flash().into_bytes();
        let b = layout.slots[1].start as usize;
        assert!(bytes[b..b + 100].iter().all(|&x| x == 0x11));
        assert!(bytes[b + 100..b + 4096].iter().all(|&x| x == 0xFF));
        assert!(bytes[b + 4096..].iter().all(|&x| x == 0x00));
    }

    #[test]
    fn crc_check_is_recorded_when_enabled() {
        let mut slots = mount_blank();
        let mut handle = slots.begin(SizeHint::Unknown, ImageCheck::Crc32).unwrap();
        slots.write(&mut handle, b"1234").unwrap();
        slots.write(&mut handle, b"56789").unwrap();
        slots.end(handle, true).unwrap();

        let record = slots.record().slot(Slot::B);
        assert_eq!(record.check, ImageCheck::Crc32);
        // CRC-32/ISO-HDLC check value
        assert_eq!(record.image_crc, 0xCBF4_3926);
    }

    #[test]
    fn stale_bootable_target_is_retired_before_erase() {
        let mut slots = mount_blank();
        write_image(&mut slots, b"first");
        // Boot B and confirm it: A still holds the factory image.
        let mut slots = remount(slots, Slot::B);
        slots.mark_valid().unwrap();
        assert_eq!(slots.slot_state(Slot::A), BootState::Undefined);

        let handle = slots.begin(SizeHint::Unknown, ImageCheck::Disabled).unwrap();
        assert_eq!(handle.slot, Slot::A);
        assert_eq!(slots.slot_state(Slot::A), BootState::Empty);
        assert_eq!(slots.slot_state(Slot::B), BootState::Valid);
        assert_eq!(slots.boot_slot(), Slot::B);
        slots.end(handle, false).unwrap();
    }

    #[test]
    fn second_update_before_reboot_replaces_pending_image() {
        let mut slots = mount_blank();
        write_image(&mut slots, b"first");
        assert_eq!(slots.boot_slot(), Slot::B);

        let handle = slots.begin(SizeHint::Unknown, ImageCheck::Disabled).unwrap();
        assert_eq!(slots.boot_slot(), Slot::A);
        assert_eq!(slots.slot_state(Slot::B), BootState::Empty);
        slots.end(handle, false).unwrap();

        let reloaded = remount(slots, Slot::A);
        assert_eq!(reloaded.boot_slot(), Slot::A);
    }

    #[test]
    fn mark_valid_confirms_pending_image() {
        let mut slots = mount_blank();
        write_image(&mut slots, b"image");
        let mut slots = remount(slots, Slot::B);
        slots.mark_valid().unwrap();
        assert_eq!(slots.running_slot_state(), BootState::Valid);
        // Idempotent
        slots.mark_valid().unwrap();

        let slots = remount(slots, Slot::B);
        assert_eq!(slots.running_slot_state(), BootState::Valid);
    }

    #[test]
    fn set_active_requires_bootable_slot() {
        let mut slots = mount_blank();
        assert_eq!(slots.set_active(Slot::B), Err(OtaError::InvalidState));
        write_image(&mut slots, b"image");
        slots.set_active(Slot::A).unwrap();
        assert_eq!(slots.boot_slot(), Slot::A);
        slots.set_active(Slot::B).unwrap();
        assert_eq!(slots.boot_slot(), Slot::B);
    }

    #[test]
    fn invalidate_and_reboot_into_other_slot() {
        let mut slots = mount_blank();
        write_image(&mut slots, b"image");
        let mut slots = remount(slots, Slot::B);
        slots.mark_valid().unwrap();

        slots.mark_invalid_and_reboot().unwrap();
        assert_eq!(slots.slot_state(Slot::B), BootState::Invalid);
        assert_eq!(slots.boot_slot(), Slot::A);
        let (_, reboot) = slots.into_parts();
        assert_eq!(reboot.count(), 1);
    }

    #[test]
    fn invalidate_needs_a_fallback() {
        let mut slots = mount_blank();
        assert_eq!(slots.mark_invalid_and_reboot(), Err(OtaError::InvalidState));
        assert_eq!(slots.running_slot_state(), BootState::Undefined);
    }

    #[test]
    fn mount_rejects_bad_layout() {
        let flash = RamFlash::<4, 4096>::new(4096);
        assert!(
            NorFlashSlots::mount(flash, test_layout(), Slot::A, RebootLog::default()).is_err()
        );
    }
}
