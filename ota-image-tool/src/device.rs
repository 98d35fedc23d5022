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

//! A simulated device backed by a flash image file.
//!
//! The file holds the raw flash: two state sectors followed by slot A and
//! slot B. The slot the simulated CPU is executing from lives next to it in
//! `<file>.running` and only changes when `device boot` runs the bootloader.

use anyhow::{Context, Result, anyhow, bail};
use clap::Subcommand;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use secure_ota::boot::loader::select_boot_slot;
use secure_ota::flash::{FlashPartitionDriver, NorFlashSlots, RamFlash, Reboot};
use secure_ota::{BootObligation, BootStateController, OtaConfig, OtaService, PartitionLayout, Progress, Slot};
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use crate::keys;
use crate::net::{StdClock, StdDelay, StdOpener};
use crate::util::{read_binary_file, with_suffix, write_binary_file};

const SECTOR_SIZE: u32 = 4096;
const STATE_SIZE: u32 = 2 * SECTOR_SIZE;

type DeviceFlash = RamFlash<4, 4096>;
type DeviceSlots = NorFlashSlots<DeviceFlash, RebootRequest>;

#[derive(Subcommand, Debug)]
pub(crate) enum DeviceAction {
    /// Create a blank device, optionally with a factory image in slot A
    Init {
        /// Size of each slot in KiB
        #[arg(long, default_value_t = 256)]
        slot_size_kib: u32,
        /// Plaintext firmware to place in slot A
        #[arg(long)]
        factory: Option<PathBuf>,
    },
    /// Show the boot record
    Status,
    /// Run the bootloader and start the selected slot
    Boot,
    /// Download, decrypt, verify and stage an update into the inactive slot
    Apply {
        /// URL or path of the encrypted image
        url: String,
        /// URL or path of the detached signature
        signature_url: String,
        /// AES-256 image key
        #[arg(long)]
        key: PathBuf,
        /// Signing public key (DER or PEM)
        #[arg(long)]
        public_key: PathBuf,
        /// Give up when no data arrives for this many seconds
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Confirm the running image
    Commit,
    /// Mark the running image invalid and fall back to the other slot
    Rollback,
    /// Mark a running image that is still on probation invalid
    Reject,
}

/// Reboot requests from the flash driver; the simulator stops after the
/// command and the next `device boot` plays the reset.
#[derive(Clone, Default)]
struct RebootRequest(Rc<Cell<bool>>);

impl Reboot for RebootRequest {
    fn reboot(&mut self) {
        self.0.set(true);
    }
}

struct DeviceFile {
    path: PathBuf,
}

impl DeviceFile {
    fn running_path(&self) -> PathBuf {
        with_suffix(&self.path, ".running")
    }

    fn layout_for(len: usize) -> Result<PartitionLayout> {
        let len = u32::try_from(len).context("Device image too large")?;
        let slot_size = len.checked_sub(STATE_SIZE).map(|rest| rest / 2).unwrap_or(0);
        if slot_size == 0 || slot_size % SECTOR_SIZE != 0 {
            bail!("Device image of {} bytes does not hold two whole slots", len);
        }
        Ok(PartitionLayout::contiguous(0, SECTOR_SIZE, slot_size))
    }

    fn load_flash(&self) -> Result<(DeviceFlash, PartitionLayout)> {
        let bytes = read_binary_file(&self.path)?;
        let layout = Self::layout_for(bytes.len())?;
        Ok((DeviceFlash::from_bytes(bytes), layout))
    }

    fn running(&self) -> Result<Slot> {
        let path = self.running_path();
        let text = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        match text.trim() {
            "A" => Ok(Slot::A),
            "B" => Ok(Slot::B),
            other => bail!("{} names unknown slot {:?}", path.display(), other),
        }
    }

    fn mount(&self, reboot: RebootRequest) -> Result<DeviceSlots> {
        let (flash, layout) = self.load_flash()?;
        let running = self.running()?;
        NorFlashSlots::mount(flash, layout, running, reboot).context("Failed to mount device flash")
    }

    fn save(&self, flash: DeviceFlash, running: Slot) -> Result<()> {
        write_binary_file(&self.path, flash.as_bytes())?;
        write_binary_file(&self.running_path(), running.to_string().as_bytes())
    }
}

pub(crate) fn run(image: &Path, action: DeviceAction) -> Result<()> {
    let device = DeviceFile {
        path: image.to_path_buf(),
    };

    match action {
        DeviceAction::Init { slot_size_kib, factory } => init(&device, slot_size_kib, factory.as_deref()),
        DeviceAction::Status => status(&device),
        DeviceAction::Boot => boot(&device),
        DeviceAction::Apply {
            url,
            signature_url,
            key,
            public_key,
            timeout_secs,
        } => apply(&device, &url, &signature_url, &key, &public_key, timeout_secs),
        DeviceAction::Commit => controller_action(&device, "commit", |controller, slots| {
            controller.commit_current(slots)
        }),
        DeviceAction::Rollback => controller_action(&device, "rollback", |controller, slots| {
            controller.rollback(slots)
        }),
        DeviceAction::Reject => controller_action(&device, "reject", |controller, slots| {
            controller.reject_current(slots)
        }),
    }
}

fn init(device: &DeviceFile, slot_size_kib: u32, factory: Option<&Path>) -> Result<()> {
    let slot_size = slot_size_kib
        .checked_mul(1024)
        .filter(|size| *size > 0 && size % SECTOR_SIZE == 0)
        .ok_or_else(|| anyhow!("Slot size must be a non-zero multiple of {} KiB", SECTOR_SIZE / 1024))?;
    let layout = PartitionLayout::contiguous(0, SECTOR_SIZE, slot_size);
    let mut flash = DeviceFlash::new((STATE_SIZE + 2 * slot_size) as usize);

    if let Some(path) = factory {
        let firmware = read_binary_file(path)?;
        if firmware.len() > slot_size as usize {
            bail!("Factory image is {} bytes, slot holds {}", firmware.len(), slot_size);
        }
        let start = layout.slot(Slot::A).start as usize;
        flash.as_mut_bytes()[start..start + firmware.len()].copy_from_slice(&firmware);
        info!("Factory image of {} bytes placed in slot A", firmware.len());
    }

    device.save(flash, Slot::A)?;
    info!(
        "Created {} with two {} KiB slots",
        device.path.display(),
        slot_size_kib
    );
    Ok(())
}

fn status(device: &DeviceFile) -> Result<()> {
    let slots = device.mount(RebootRequest::default())?;
    let record = slots.record();
    println!("Record sequence: {}", record.seq);
    println!("Running slot:    {}", slots.running_slot());
    println!("Boot slot:       {}", record.boot_slot);
    for slot in [Slot::A, Slot::B] {
        let entry = record.slot(slot);
        println!(
            "Slot {}: {:?}, {} bytes, attempted: {}, check: {:?}",
            slot, entry.state, entry.image_len, entry.attempted, entry.check
        );
    }
    Ok(())
}

fn boot(device: &DeviceFile) -> Result<()> {
    let (mut flash, layout) = device.load_flash()?;
    let selected = select_boot_slot(&mut flash, &layout).context("Bootloader found no bootable slot")?;
    info!("Bootloader starts slot {}", selected);

    let slots = NorFlashSlots::mount(flash, layout, selected, RebootRequest::default())
        .context("Failed to mount device flash")?;
    match BootStateController::default().on_boot(&slots, 0) {
        BootObligation::CommitPending { .. } => {
            warn!("Slot {} is on probation; run `device commit` to keep it", selected)
        }
        BootObligation::None => info!("Slot {} is confirmed", selected),
    }
    device.save(slots.into_flash(), selected)
}

fn apply(
    device: &DeviceFile,
    url: &str,
    signature_url: &str,
    key_path: &Path,
    public_key: &Path,
    timeout_secs: u64,
) -> Result<()> {
    let key = keys::load_aes_key(key_path, false)?;
    // Installed once per process and kept for its lifetime.
    let public_key_der: &'static [u8] = Vec::leak(keys::load_public_key_der(public_key)?);

    let slots = device.mount(RebootRequest::default())?;
    let running = slots.running_slot();
    let mut config = OtaConfig::new(public_key_der);
    config.pipeline.idle_timeout_ms = timeout_secs.saturating_mul(1000);

    let (mut service, obligation) =
        OtaService::init(slots, StdClock::new(), StdDelay, config).context("Failed to start OTA service")?;
    if let BootObligation::CommitPending { .. } = obligation {
        bail!("Slot {} is still on probation; commit or reject it first", running);
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec})")?
            .progress_chars("=> "),
    );
    let mut on_progress = |progress: &Progress| {
        if let Some(total) = progress.total_ciphertext {
            bar.set_length(total);
        }
        bar.set_position(progress.ciphertext_bytes);
    };

    let mut opener = StdOpener::new(Duration::from_secs(timeout_secs));
    let result = service
        .pipeline()
        .with_progress(&mut on_progress)
        .update_from_url(&mut opener, url, &key, signature_url);

    let outcome = match result {
        Ok(report) => {
            bar.finish_with_message("done");
            info!(
                "Staged {} bytes into slot {} (SHA-256 {}) in {} ms",
                report.image_len,
                report.slot,
                hex::encode(report.digest),
                report.elapsed_ms
            );
            info!("Run `device boot` to start it");
            Ok(())
        }
        Err(e) => {
            bar.abandon_with_message("failed");
            Err(anyhow::Error::new(e).context("Update failed"))
        }
    };

    device.save(service.into_flash().into_flash(), running)?;
    outcome
}

fn controller_action<A>(device: &DeviceFile, name: &str, action: A) -> Result<()>
where
    A: FnOnce(&mut BootStateController, &mut DeviceSlots) -> Result<(), secure_ota::OtaError>,
{
    let reboot = RebootRequest::default();
    let mut slots = device.mount(reboot.clone())?;
    let running = slots.running_slot();

    let mut controller = BootStateController::default();
    controller.on_boot(&slots, 0);
    let result = action(&mut controller, &mut slots);
    device.save(slots.into_flash(), running)?;
    result.with_context(|| format!("Cannot {} slot {}", name, running))?;

    if reboot.0.get() {
        warn!("Device requested a reboot; run `device boot`");
    } else {
        info!("{} of slot {} done", name, running);
    }
    Ok(())
}
