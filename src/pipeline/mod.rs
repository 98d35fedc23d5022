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

//! The update session: transport → CBC decryption → SHA-256 → slot writer →
//! signature gate → commit.
//!
//! The body is decrypted in chunks of `CHUNK` bytes (a multiple of the AES
//! block size) through a single CBC context. The last decrypted block of every
//! chunk is held back until the next chunk arrives, so when the stream ends the
//! held block is the one carrying the PKCS#7 padding, whether or not the total
//! length was announced. Every plaintext byte goes to the hasher and to flash
//! in the same order, so the verified digest is the digest of what was written.

mod reader;
mod session;

use embedded_hal::delay::DelayNs;
use heapless::Vec;
use log::{debug, info, warn};
use portable_atomic::{AtomicBool, Ordering};

use crate::crypto::{
    Aes256Key, BLOCK_SIZE, CbcDecryptor, Digest256, IV_SIZE, ImageHasher, SignatureVerifier,
    padding, signature,
};
use crate::error::OtaError;
use crate::flash::{FlashPartitionDriver, ImageCheck, SizeHint, Slot};
use crate::image;
use crate::time::Clock;
use crate::transport::{ReadTransport, Transport, TransportOpener};

use reader::IdleReader;
use session::SlotSession;

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Largest detached signature accepted (RSA-4096).
pub const MAX_SIGNATURE_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Longest gap between two received bytes before the session fails
    pub idle_timeout_ms: u64,
    /// Yield between polls of a transport that has no data yet
    pub poll_interval_ms: u32,
    /// Ciphertext bytes between two progress log lines
    pub progress_log_interval: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 10_000,
            poll_interval_ms: 1,
            progress_log_interval: 50 * 1024,
        }
    }
}

/// Cooperative cancellation, observed between chunks.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Wire bytes consumed so far, IV included
    pub ciphertext_bytes: u64,
    pub total_ciphertext: Option<u64>,
    pub plaintext_written: u64,
}

impl Progress {
    pub fn percent(&self) -> Option<u8> {
        self.total_ciphertext
            .filter(|&total| total > 0)
            .map(|total| (self.ciphertext_bytes.min(total) * 100 / total) as u8)
    }
}

/// Outcome of a committed update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub slot: Slot,
    pub image_len: u32,
    pub digest: Digest256,
    /// Wire bytes consumed, IV included
    pub ciphertext_len: u64,
    pub elapsed_ms: u64,
}

pub struct OtaPipeline<'a, F, C, D, const CHUNK: usize = DEFAULT_CHUNK_SIZE>
where
    F: FlashPartitionDriver,
    C: Clock,
    D: DelayNs,
{
    flash: &'a mut F,
    clock: &'a C,
    delay: &'a mut D,
    settings: PipelineSettings,
    cancel: Option<&'a CancelFlag>,
    progress: Option<&'a mut dyn FnMut(&Progress)>,
    verifier: Option<&'a SignatureVerifier>,
}

impl<'a, F, C, D> OtaPipeline<'a, F, C, D>
where
    F: FlashPartitionDriver,
    C: Clock,
    D: DelayNs,
{
    pub fn new(flash: &'a mut F, clock: &'a C, delay: &'a mut D, settings: PipelineSettings) -> Self {
        Self {
            flash,
            clock,
            delay,
            settings,
            cancel: None,
            progress: None,
            verifier: None,
        }
    }
}

impl<'a, F, C, D, const CHUNK: usize> OtaPipeline<'a, F, C, D, CHUNK>
where
    F: FlashPartitionDriver,
    C: Clock,
    D: DelayNs,
{
    /// Switches to a different working chunk size (a non-zero multiple of 16).
    pub fn with_chunk_size<const N: usize>(self) -> OtaPipeline<'a, F, C, D, N> {
        OtaPipeline {
            flash: self.flash,
            clock: self.clock,
            delay: self.delay,
            settings: self.settings,
            cancel: self.cancel,
            progress: self.progress,
            verifier: self.verifier,
        }
    }

    pub fn with_cancel(mut self, cancel: &'a CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_progress(mut self, progress: &'a mut dyn FnMut(&Progress)) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Verifies against `verifier` instead of the installed process-wide key.
    pub fn with_verifier(mut self, verifier: &'a SignatureVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Runs a full session over an already opened stream.
    pub fn update_from_stream<T: Transport>(
        &mut self,
        source: &mut T,
        key: &Aes256Key,
        signature: &[u8],
    ) -> Result<SessionReport, OtaError> {
        let result = self.run_session(source, key, signature);
        if let Err(e) = &result {
            warn!("Update failed: {}", e);
        }
        result
    }

    /// Fetches the detached signature from `signature_url`, then streams the
    /// image from `url`.
    pub fn update_from_url<O: TransportOpener>(
        &mut self,
        opener: &mut O,
        url: &str,
        key: &Aes256Key,
        signature_url: &str,
    ) -> Result<SessionReport, OtaError> {
        info!("Fetching signature from {}", signature_url);
        let signature = self.fetch_signature(opener, signature_url)?;

        info!("Fetching firmware from {}", url);
        let mut stream = opener.open(url)?;
        let result = self.update_from_stream(&mut stream, key, &signature);
        stream.close();
        result
    }

    /// Runs a session over a wire image already held in memory.
    pub fn update_from_slice(
        &mut self,
        wire_image: &[u8],
        key: &Aes256Key,
        signature: &[u8],
    ) -> Result<SessionReport, OtaError> {
        let mut source = ReadTransport::new(wire_image, Some(wire_image.len() as u64));
        self.update_from_stream(&mut source, key, signature)
    }

    fn fetch_signature<O: TransportOpener>(
        &mut self,
        opener: &mut O,
        url: &str,
    ) -> Result<Vec<u8, MAX_SIGNATURE_LEN>, OtaError> {
        let mut stream = opener.open(url)?;
        let mut buf = [0u8; MAX_SIGNATURE_LEN + 1];
        let announced = stream.content_length();
        let fetched = match announced {
            Some(len) if len > MAX_SIGNATURE_LEN as u64 => {
                warn!("Signature of {} bytes announced, at most {} accepted", len, MAX_SIGNATURE_LEN);
                Err(OtaError::SignatureInvalid)
            }
            _ => {
                let mut reader = IdleReader::new(
                    &mut stream,
                    self.clock,
                    &mut *self.delay,
                    self.settings.idle_timeout_ms,
                    self.settings.poll_interval_ms,
                );
                // A kept-alive connection stays up after the body, so a known
                // length is read exactly rather than until the peer goes away.
                match announced {
                    Some(len) => {
                        let len = len as usize;
                        reader.read_exact(&mut buf[..len]).map(|()| len)
                    }
                    None => reader.fill(&mut buf),
                }
            }
        };
        stream.close();

        let len = fetched?;
        debug!("Signature is {} bytes", len);
        Vec::from_slice(&buf[..len]).map_err(|_| {
            warn!("Signature longer than {} bytes", MAX_SIGNATURE_LEN);
            OtaError::SignatureInvalid
        })
    }

    fn run_session<T: Transport>(
        &mut self,
        source: &mut T,
        key: &Aes256Key,
        signature: &[u8],
    ) -> Result<SessionReport, OtaError> {
        const { assert!(CHUNK > 0 && CHUNK % BLOCK_SIZE == 0, "chunk size must be a non-zero multiple of 16") };

        let Self {
            flash,
            clock,
            delay,
            settings,
            cancel,
            progress,
            verifier,
        } = self;
        let started_ms = clock.now_ms();

        let total = source.content_length();
        let body_len = total.map(image::check_wire_len).transpose()?;
        let size_hint = match body_len {
            Some(len) => SizeHint::Bytes(u32::try_from(len).map_err(|_| OtaError::Overflow)?),
            None => SizeHint::Unknown,
        };

        let verifier = match verifier {
            Some(verifier) => *verifier,
            None => signature::public_key()?,
        };
        if signature.len() != verifier.modulus_len() {
            warn!(
                "Signature is {} bytes, key needs {}",
                signature.len(),
                verifier.modulus_len()
            );
            return Err(OtaError::SignatureInvalid);
        }

        let mut reader = IdleReader::new(
            source,
            *clock,
            &mut **delay,
            settings.idle_timeout_ms,
            settings.poll_interval_ms,
        );

        let mut iv = [0u8; IV_SIZE];
        reader.read_exact(&mut iv)?;

        let mut decryptor = CbcDecryptor::new(key, &iv);
        let mut hasher = ImageHasher::new();
        let mut slot = SlotSession::begin(&mut **flash, size_hint, ImageCheck::Disabled)?;
        match total {
            Some(total) => info!("Writing {} byte image into slot {}", total, slot.slot()),
            None => info!("Writing image of unknown length into slot {}", slot.slot()),
        }

        let mut ciphertext = [0u8; CHUNK];
        let mut plaintext = [0u8; CHUNK];
        let mut held = [0u8; BLOCK_SIZE];
        let mut holding = false;
        let mut remaining = body_len;
        let mut consumed = IV_SIZE as u64;
        let mut next_log = settings.progress_log_interval;

        loop {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                info!("Update cancelled after {} bytes", consumed);
                return Err(OtaError::Cancelled);
            }

            let len = match remaining {
                Some(0) => break,
                Some(left) => {
                    let want = left.min(CHUNK as u64) as usize;
                    reader.read_exact(&mut ciphertext[..want])?;
                    want
                }
                None => {
                    let got = reader.fill(&mut ciphertext)?;
                    if got % BLOCK_SIZE != 0 {
                        warn!("Stream ended inside a cipher block");
                        return Err(OtaError::Truncated);
                    }
                    if got == 0 {
                        break;
                    }
                    got
                }
            };

            decryptor.update(&ciphertext[..len], &mut plaintext[..len])?;

            if holding {
                hasher.update(&held);
                slot.write(&held)?;
            }
            let keep = len - BLOCK_SIZE;
            if keep > 0 {
                hasher.update(&plaintext[..keep]);
                slot.write(&plaintext[..keep])?;
            }
            held.copy_from_slice(&plaintext[keep..len]);
            holding = true;

            if let Some(left) = remaining.as_mut() {
                *left -= len as u64;
            }
            consumed += len as u64;

            let current = Progress {
                ciphertext_bytes: consumed,
                total_ciphertext: total,
                plaintext_written: slot.written() as u64,
            };
            if let Some(report) = progress.as_deref_mut() {
                report(&current);
            }
            if settings.progress_log_interval > 0 && consumed >= next_log {
                match current.percent() {
                    Some(pct) => info!("Progress: {} KiB ({}%)", consumed / 1024, pct),
                    None => info!("Progress: {} KiB", consumed / 1024),
                }
                while next_log <= consumed {
                    next_log += settings.progress_log_interval;
                }
            }
        }

        if !holding {
            warn!("Image has no cipher blocks");
            return Err(OtaError::Truncated);
        }
        // Padding is only authenticated by the signature.
        let tail = padding::unpad(&held).map_err(|_| {
            warn!("Final block padding is malformed");
            OtaError::SignatureInvalid
        })?;
        hasher.update(tail);
        slot.write(tail)?;

        let digest = hasher.finish();
        verifier.verify(&digest, signature)?;
        debug!("Signature verified");

        let (slot, image_len) = slot.commit()?;
        let elapsed_ms = clock.now_ms().saturating_sub(started_ms);
        info!(
            "Update complete: {} bytes into slot {} in {} ms ({} KiB/s)",
            image_len,
            slot,
            elapsed_ms,
            consumed * 1000 / 1024 / elapsed_ms.max(1)
        );

        Ok(SessionReport {
            slot,
            image_len,
            digest,
            ciphertext_len: consumed,
            elapsed_ms,
        })
    }
}
