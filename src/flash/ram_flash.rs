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

use alloc::vec;
use alloc::vec::Vec;

use embedded_storage::nor_flash::{
    ErrorType, MultiwriteNorFlash, NorFlash, NorFlashErrorKind, ReadNorFlash, check_erase, check_read,
    check_write,
};
use log::warn;

/// RAM-backed NOR flash.
///
/// Behaves like the real part: erasing sets bytes to `0xFF` and programming can
/// only clear bits. Writes can be made to fail after a number of successful
/// calls to simulate a driver fault or a power cut mid-update.
#[derive(Debug, Clone)]
pub struct RamFlash<const WRITE_SIZE: usize = 4, const ERASE_SIZE: usize = 4096> {
    memory: Vec<u8>,
    writes_left: Option<usize>,
    write_calls: usize,
    erase_calls: usize,
}

impl<const WRITE_SIZE: usize, const ERASE_SIZE: usize> RamFlash<WRITE_SIZE, ERASE_SIZE> {
    /// Creates an erased flash of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self::from_bytes(vec![0xFF; capacity])
    }

    pub fn from_bytes(memory: Vec<u8>) -> Self {
        Self {
            memory,
            writes_left: None,
            write_calls: 0,
            erase_calls: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.memory
    }

    /// Raw access that bypasses the NOR rules, for corrupting contents.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.memory
    }

    /// Lets `count` more writes succeed, then fails every write after that.
    pub fn fail_after_writes(&mut self, count: usize) {
        self.writes_left = Some(count);
    }

    pub fn clear_failure(&mut self) {
        self.writes_left = None;
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls
    }

    pub fn erase_calls(&self) -> usize {
        self.erase_calls
    }
}

impl<const WRITE_SIZE: usize, const ERASE_SIZE: usize> ErrorType for RamFlash<WRITE_SIZE, ERASE_SIZE> {
    type Error = NorFlashErrorKind;
}

impl<const WRITE_SIZE: usize, const ERASE_SIZE: usize> ReadNorFlash
    for RamFlash<WRITE_SIZE, ERASE_SIZE>
{
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(self, offset, bytes.len())?;
        let start = offset as usize;
        bytes.copy_from_slice(&self.memory[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.memory.len()
    }
}

impl<const WRITE_SIZE: usize, const ERASE_SIZE: usize> NorFlash for RamFlash<WRITE_SIZE, ERASE_SIZE> {
    const WRITE_SIZE: usize = WRITE_SIZE;
    const ERASE_SIZE: usize = ERASE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        check_erase(self, from, to)?;
        self.erase_calls += 1;
        self.memory[from as usize..to as usize].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_write(self, offset, bytes.len())?;
        if let Some(left) = self.writes_left.as_mut() {
            if *left == 0 {
                warn!("Injected flash write failure at 0x{:x}", offset);
                return Err(NorFlashErrorKind::Other);
            }
            *left -= 1;
        }
        self.write_calls += 1;
        let start = offset as usize;
        for (cell, byte) in self.memory[start..start + bytes.len()].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        Ok(())
    }
}

// Writes AND into the cells, so a word may be programmed again as long as
// it only clears bits.
impl<const WRITE_SIZE: usize, const ERASE_SIZE: usize> MultiwriteNorFlash for RamFlash<WRITE_SIZE, ERASE_SIZE> {}
