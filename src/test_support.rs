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

//! Fixtures and fakes shared by the unit tests.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::Cell;

use embedded_hal::delay::DelayNs;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::Sha256;

use crate::boot::loader::select_boot_slot;
use crate::crypto::{Aes256Key, Digest256, Iv, SignatureVerifier, sha256};
use crate::crypto::signature::install_public_key;
use crate::error::OtaError;
use crate::flash::{NorFlashSlots, PartitionLayout, RamFlash, Reboot, Slot};
use crate::image;
use crate::time::Clock;
use crate::transport::{Transport, TransportOpener};

pub const PUBLIC_KEY_DER: &[u8] = include_bytes!("../test-data/signing_key.pub.der");
pub const NOT_RSA_PUBLIC_KEY_DER: &[u8] = include_bytes!("../test-data/not_rsa.pub.der");
const PRIVATE_KEY_DER: &[u8] = include_bytes!("../test-data/signing_key.pk8.der");

pub const KEY: Aes256Key = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
    0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f,
];
pub const IV: Iv = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
];

pub type TestFlash = RamFlash<4, 4096>;

pub fn sign_digest(digest: &Digest256) -> Vec<u8> {
    let key = RsaPrivateKey::from_pkcs8_der(PRIVATE_KEY_DER).unwrap();
    key.sign(Pkcs1v15Sign::new::<Sha256>(), digest).unwrap()
}

pub fn verifier() -> &'static SignatureVerifier {
    install_public_key(PUBLIC_KEY_DER).unwrap()
}

/// Wire image and detached signature for `plaintext`.
pub fn signed_image(plaintext: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let wire = image::seal(&KEY, &IV, plaintext).unwrap();
    let signature = sign_digest(&sha256(plaintext));
    (wire, signature)
}

/// Two state sectors and two 8-sector slots.
pub fn test_layout() -> PartitionLayout {
    PartitionLayout::contiguous(0, 4096, 8 * 4096)
}

pub fn blank_device() -> NorFlashSlots<TestFlash, RebootLog> {
    let flash = TestFlash::new(test_layout().slots[1].end as usize);
    NorFlashSlots::mount(flash, test_layout(), Slot::A, RebootLog::default()).unwrap()
}

/// Runs the boot-slot selector and remounts on the slot it picked.
pub fn power_cycle(slots: NorFlashSlots<TestFlash, RebootLog>) -> NorFlashSlots<TestFlash, RebootLog> {
    let (mut flash, reboot) = slots.into_parts();
    let layout = test_layout();
    let slot = select_boot_slot(&mut flash, &layout).unwrap();
    NorFlashSlots::mount(flash, layout, slot, reboot).unwrap()
}

/// Counts reboot requests; clones share the count.
#[derive(Debug, Clone, Default)]
pub struct RebootLog(Rc<Cell<u32>>);

impl RebootLog {
    pub fn count(&self) -> u32 {
        self.0.get()
    }
}

impl Reboot for RebootLog {
    fn reboot(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

/// Manual clock advanced by [`FakeDelay`].
#[derive(Debug, Clone, Default)]
pub struct FakeClock(Rc<Cell<u64>>);

impl FakeClock {
    pub fn delay(&self) -> FakeDelay {
        FakeDelay(self.0.clone())
    }

    pub fn advance_ms(&self, ms: u64) {
        self.0.set(self.0.get() + ms * 1_000_000);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.0.get() / 1_000_000
    }
}

pub struct FakeDelay(Rc<Cell<u64>>);

impl DelayNs for FakeDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.0.set(self.0.get() + ns as u64);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.0.set(self.0.get() + ms as u64 * 1_000_000);
    }
}

/// In-memory stream that can deliver data in small pieces, stall or fail.
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    data: Vec<u8>,
    pos: usize,
    content_length: Option<u64>,
    max_read: usize,
    stall_at: Option<usize>,
    fail_at: Option<(usize, i32)>,
    keep_alive: bool,
    closed: bool,
}

impl ScriptedTransport {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            content_length: Some(data.len() as u64),
            data,
            pos: 0,
            max_read: usize::MAX,
            stall_at: None,
            fail_at: None,
            keep_alive: false,
            closed: false,
        }
    }

    pub fn without_length(mut self) -> Self {
        self.content_length = None;
        self
    }

    pub fn with_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    pub fn max_read(mut self, max_read: usize) -> Self {
        self.max_read = max_read;
        self
    }

    /// Stops delivering data after `offset` bytes but stays connected.
    pub fn stall_at(mut self, offset: usize) -> Self {
        self.stall_at = Some(offset);
        self
    }

    pub fn fail_at(mut self, offset: usize, code: i32) -> Self {
        self.fail_at = Some((offset, code));
        self
    }

    /// Stays connected after the last byte until closed, like an HTTP
    /// keep-alive connection.
    pub fn keep_alive(mut self) -> Self {
        self.keep_alive = true;
        self
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Transport for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, OtaError> {
        if self.closed {
            return Ok(0);
        }
        let mut end = self.data.len();
        if let Some((offset, code)) = self.fail_at {
            if self.pos >= offset {
                return Err(OtaError::Transport(code));
            }
            end = end.min(offset);
        }
        if let Some(offset) = self.stall_at {
            end = end.min(offset);
        }
        let n = buf.len().min(self.max_read).min(end.saturating_sub(self.pos));
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn connected(&self) -> bool {
        !self.closed && (self.keep_alive || self.pos < self.data.len())
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Serves fixed bodies by URL.
#[derive(Debug, Default)]
pub struct UrlMap {
    entries: Vec<(&'static str, ScriptedTransport)>,
    pub opened: Vec<&'static str>,
}

impl UrlMap {
    pub fn with(mut self, url: &'static str, transport: ScriptedTransport) -> Self {
        self.entries.push((url, transport));
        self
    }
}

impl TransportOpener for UrlMap {
    type Transport = ScriptedTransport;

    fn open(&mut self, url: &str) -> Result<ScriptedTransport, OtaError> {
        let (name, transport) = self
            .entries
            .iter()
            .find(|(name, _)| *name == url)
            .ok_or(OtaError::Transport(404))?;
        self.opened.push(*name);
        Ok(transport.clone())
    }
}
