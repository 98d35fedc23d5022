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

//! The byte source side of an update: anything that can hand over the wire
//! image piecewise.

use embedded_io::{Error as _, ErrorKind, Read};
use log::{debug, trace};

use crate::error::OtaError;

/// A readable network (or file) stream.
///
/// `read` may return `Ok(0)` while the peer is still connected but has no data
/// yet; the stream has ended once `read` returns `Ok(0)` and `connected()` is
/// false.
pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, OtaError>;
    fn connected(&self) -> bool;
    /// Total length announced by the peer, if any.
    fn content_length(&self) -> Option<u64>;
    fn close(&mut self);
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, OtaError> {
        (**self).read(buf)
    }

    fn connected(&self) -> bool {
        (**self).connected()
    }

    fn content_length(&self) -> Option<u64> {
        (**self).content_length()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Opens transports by URL, e.g. an HTTP client.
pub trait TransportOpener {
    type Transport: Transport;

    fn open(&mut self, url: &str) -> Result<Self::Transport, OtaError>;
}

/// Adapts a blocking [`embedded_io::Read`] into a [`Transport`].
///
/// `Ok(0)` from the reader marks the end of the stream. Timed out or
/// interrupted reads are reported as "no data yet" so the pipeline's idle
/// timer decides when to give up.
pub struct ReadTransport<R: Read> {
    reader: R,
    content_length: Option<u64>,
    ended: bool,
}

impl<R: Read> ReadTransport<R> {
    pub fn new(reader: R, content_length: Option<u64>) -> Self {
        Self {
            reader,
            content_length,
            ended: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Transport for ReadTransport<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, OtaError> {
        if self.ended || buf.is_empty() {
            return Ok(0);
        }
        match self.reader.read(buf) {
            Ok(0) => {
                debug!("Stream reached end of data");
                self.ended = true;
                Ok(0)
            }
            Ok(n) => {
                trace!("Read {} bytes from stream", n);
                Ok(n)
            }
            Err(e) => match e.kind() {
                ErrorKind::TimedOut | ErrorKind::Interrupted => Ok(0),
                kind => {
                    debug!("Stream read failed: {:?}", kind);
                    Err(OtaError::Transport(io_error_code(kind)))
                }
            },
        }
    }

    fn connected(&self) -> bool {
        !self.ended
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn close(&mut self) {
        self.ended = true;
    }
}

fn io_error_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::NotFound => -2,
        ErrorKind::PermissionDenied => -3,
        ErrorKind::ConnectionRefused => -4,
        ErrorKind::ConnectionReset => -5,
        ErrorKind::ConnectionAborted => -6,
        ErrorKind::NotConnected => -7,
        ErrorKind::BrokenPipe => -8,
        ErrorKind::InvalidData => -9,
        ErrorKind::OutOfMemory => -10,
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_reader_ends_after_data() {
        let data = [1u8, 2, 3, 4, 5];
        let mut transport = ReadTransport::new(&data[..], Some(5));
        let mut buf = [0u8; 4];

        assert_eq!(transport.content_length(), Some(5));
        assert_eq!(transport.read(&mut buf), Ok(4));
        assert!(transport.connected());
        assert_eq!(transport.read(&mut buf), Ok(1));
        assert_eq!(transport.read(&mut buf), Ok(0));
        assert!(!transport.connected());
    }

    #[test]
    fn close_ends_the_stream() {
        let data = [0u8; 8];
        let mut transport = ReadTransport::new(&data[..], None);
        transport.close();
        let mut buf = [0u8; 4];
        assert_eq!(transport.read(&mut buf), Ok(0));
        assert!(!transport.connected());
    }
}
