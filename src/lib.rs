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

//! Encrypted, signed over-the-air firmware replacement for two-slot devices.
//!
//! An update streams `IV || AES-256-CBC(image)` from a transport, decrypts it
//! block by block, hashes the recovered plaintext, writes it into the inactive
//! slot and only commits the slot once the RSA PKCS#1 v1.5 signature over the
//! plaintext digest checks out. After the reboot the new image stays
//! `PendingVerify` until the application confirms it, otherwise the bootloader
//! falls back to the previous slot.
//!
//! The crate is `no_std` but needs `alloc` (RSA big integers).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod boot;
pub mod crypto;
pub mod error;
pub mod flash;
pub mod image;
pub mod pipeline;
pub mod service;
pub mod time;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use boot::{BootObligation, BootStateController};
pub use error::OtaError;
pub use flash::{BootState, FlashPartitionDriver, PartitionLayout, Slot};
pub use pipeline::{CancelFlag, OtaPipeline, PipelineSettings, Progress, SessionReport};
pub use service::{OtaConfig, OtaService, RunningImage};
