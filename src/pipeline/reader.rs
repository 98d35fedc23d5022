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

use embedded_hal::delay::DelayNs;
use log::{debug, warn};

use crate::error::OtaError;
use crate::time::Clock;
use crate::transport::Transport;

/// Blocking reads with an idle timeout on top of a polling [`Transport`].
///
/// While the transport is connected but has nothing to deliver, the reader
/// yields for `poll_interval_ms` and gives up with [`OtaError::Timeout`] once no
/// byte has arrived for `idle_timeout_ms`.
pub(crate) struct IdleReader<'r, T: Transport, C: Clock, D: DelayNs> {
    source: &'r mut T,
    clock: &'r C,
    delay: &'r mut D,
    idle_timeout_ms: u64,
    poll_interval_ms: u32,
}

impl<'r, T: Transport, C: Clock, D: DelayNs> IdleReader<'r, T, C, D> {
    pub fn new(
        source: &'r mut T,
        clock: &'r C,
        delay: &'r mut D,
        idle_timeout_ms: u64,
        poll_interval_ms: u32,
    ) -> Self {
        Self {
            source,
            clock,
            delay,
            idle_timeout_ms,
            poll_interval_ms,
        }
    }

    /// Fills `buf` completely, or fails with `Truncated` if the stream ends first.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), OtaError> {
        let filled = self.fill(buf)?;
        if filled < buf.len() {
            warn!("Stream ended after {} of {} bytes", filled, buf.len());
            return Err(OtaError::Truncated);
        }
        Ok(())
    }

    /// Reads until `buf` is full or the stream ends. Returns the byte count.
    pub fn fill(&mut self, buf: &mut [u8]) -> Result<usize, OtaError> {
        let mut filled = 0;
        let mut last_data_ms = self.clock.now_ms();
        while filled < buf.len() {
            let n = self.source.read(&mut buf[filled..])?;
            if n > 0 {
                filled += n;
                last_data_ms = self.clock.now_ms();
                continue;
            }
            if !self.source.connected() {
                debug!("Stream closed by peer");
                break;
            }
            let idle_ms = self.clock.now_ms().saturating_sub(last_data_ms);
            if idle_ms >= self.idle_timeout_ms {
                warn!("No data for {} ms, giving up", idle_ms);
                return Err(OtaError::Timeout);
            }
            self.delay.delay_ms(self.poll_interval_ms);
        }
        Ok(filled)
    }
}
