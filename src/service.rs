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

//! Device-facing entry points: start-up, update, commit and rollback.

use embedded_hal::delay::DelayNs;
use log::info;

use crate::boot::{BootObligation, BootStateController};
use crate::crypto::Aes256Key;
use crate::crypto::signature::install_public_key;
use crate::error::OtaError;
use crate::flash::{BootState, FlashPartitionDriver, Slot};
use crate::pipeline::{CancelFlag, OtaPipeline, PipelineSettings, SessionReport};
use crate::time::Clock;
use crate::transport::{Transport, TransportOpener};

#[derive(Debug, Clone)]
pub struct OtaConfig {
    /// Version compiled into the running image
    pub firmware_version: u32,
    /// DER `SubjectPublicKeyInfo` of the image signing key
    pub public_key_der: &'static [u8],
    /// Probation time of a new image before it is committed automatically
    pub commit_delay_ms: u64,
    pub pipeline: PipelineSettings,
}

impl OtaConfig {
    pub fn new(public_key_der: &'static [u8]) -> Self {
        Self {
            firmware_version: 1,
            public_key_der,
            commit_delay_ms: BootStateController::DEFAULT_COMMIT_DELAY_MS,
            pipeline: PipelineSettings::default(),
        }
    }
}

/// What is running right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningImage {
    pub slot: Slot,
    pub state: BootState,
    pub image_len: Option<u32>,
    pub version: u32,
}

pub struct OtaService<F, C, D>
where
    F: FlashPartitionDriver,
    C: Clock,
    D: DelayNs,
{
    flash: F,
    clock: C,
    delay: D,
    config: OtaConfig,
    controller: BootStateController,
    cancel: CancelFlag,
}

impl<F, C, D> OtaService<F, C, D>
where
    F: FlashPartitionDriver,
    C: Clock,
    D: DelayNs,
{
    /// Installs the verification key and looks at the running slot. A
    /// [`BootObligation::CommitPending`] means the application has to call
    /// [`OtaService::commit_current`] (or keep calling [`OtaService::poll`]).
    pub fn init(flash: F, clock: C, delay: D, config: OtaConfig) -> Result<(Self, BootObligation), OtaError> {
        install_public_key(config.public_key_der)?;

        let mut controller = BootStateController::new(config.commit_delay_ms);
        let obligation = controller.on_boot(&flash, clock.now_ms());
        info!(
            "OTA ready: firmware v{} in slot {}",
            config.firmware_version,
            flash.running_slot()
        );

        Ok((
            Self {
                flash,
                clock,
                delay,
                config,
                controller,
                cancel: CancelFlag::new(),
            },
            obligation,
        ))
    }

    /// A pipeline bound to this device, for callers that want to attach a
    /// progress callback.
    pub fn pipeline(&mut self) -> OtaPipeline<'_, F, C, D> {
        self.cancel.reset();
        OtaPipeline::new(&mut self.flash, &self.clock, &mut self.delay, self.config.pipeline)
            .with_cancel(&self.cancel)
    }

    pub fn update_from_url<O: TransportOpener>(
        &mut self,
        opener: &mut O,
        url: &str,
        key: &Aes256Key,
        signature_url: &str,
    ) -> Result<SessionReport, OtaError> {
        self.pipeline().update_from_url(opener, url, key, signature_url)
    }

    pub fn update_from_stream<T: Transport>(
        &mut self,
        source: &mut T,
        key: &Aes256Key,
        signature: &[u8],
    ) -> Result<SessionReport, OtaError> {
        self.pipeline().update_from_stream(source, key, signature)
    }

    pub fn update_from_slice(
        &mut self,
        wire_image: &[u8],
        key: &Aes256Key,
        signature: &[u8],
    ) -> Result<SessionReport, OtaError> {
        self.pipeline().update_from_slice(wire_image, key, signature)
    }

    pub fn commit_current(&mut self) -> Result<(), OtaError> {
        self.controller.commit_current(&mut self.flash)
    }

    /// Drives the automatic commit of a new image. Returns whether it
    /// committed on this call.
    pub fn poll(&mut self) -> Result<bool, OtaError> {
        let now = self.clock.now_ms();
        self.controller.poll(&mut self.flash, now)
    }

    pub fn obligation(&self) -> BootObligation {
        self.controller.obligation()
    }

    pub fn rollback(&mut self) -> Result<(), OtaError> {
        self.controller.rollback(&mut self.flash)
    }

    /// Gives up a new image that failed its self-test.
    pub fn reject_current(&mut self) -> Result<(), OtaError> {
        self.controller.reject_current(&mut self.flash)
    }

    pub fn current_version(&self) -> u32 {
        self.config.firmware_version
    }

    pub fn running_image(&self) -> RunningImage {
        let slot = self.flash.running_slot();
        RunningImage {
            slot,
            state: self.flash.slot_state(slot),
            image_len: self.flash.image_len(slot),
            version: self.config.firmware_version,
        }
    }

    /// Flag that cancels a running update at the next chunk boundary.
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn into_flash(self) -> F {
        self.flash
    }
}
