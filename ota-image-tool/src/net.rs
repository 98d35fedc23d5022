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

//! Std implementations of the device-side seams: HTTP/file transport, clock
//! and delay.

use embedded_hal::delay::DelayNs;
use log::{debug, error};
use secure_ota::OtaError;
use secure_ota::time::Clock;
use secure_ota::transport::{Transport, TransportOpener};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

/// Blocking stream over an HTTP body or a local file.
pub(crate) struct StdTransport {
    reader: Box<dyn Read + Send + Sync>,
    content_length: Option<u64>,
    ended: bool,
}

impl StdTransport {
    pub(crate) fn new(reader: Box<dyn Read + Send + Sync>, content_length: Option<u64>) -> Self {
        Self {
            reader,
            content_length,
            ended: false,
        }
    }
}

impl Transport for StdTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, OtaError> {
        if self.ended {
            return Ok(0);
        }
        match self.reader.read(buf) {
            Ok(0) => {
                self.ended = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(0)
            }
            Err(e) => {
                error!("Stream read failed: {}", e);
                self.ended = true;
                Err(OtaError::Transport(e.raw_os_error().unwrap_or(-1)))
            }
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

/// Opens `http://` and `https://` URLs with ureq; anything else is a file path
/// (an optional `file://` prefix is stripped).
pub(crate) struct StdOpener {
    agent: ureq::Agent,
}

impl StdOpener {
    pub(crate) fn new(read_timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout_read(read_timeout).build(),
        }
    }

    fn open_http(&self, url: &str) -> Result<StdTransport, OtaError> {
        match self.agent.get(url).call() {
            Ok(response) => {
                let length = response
                    .header("Content-Length")
                    .and_then(|v| v.trim().parse::<u64>().ok());
                debug!("GET {}: HTTP {}, length {:?}", url, response.status(), length);
                Ok(StdTransport::new(response.into_reader(), length))
            }
            Err(ureq::Error::Status(code, _)) => {
                error!("GET {} failed with HTTP {}", url, code);
                Err(OtaError::Transport(i32::from(code)))
            }
            Err(e) => {
                error!("GET {} failed: {}", url, e);
                Err(OtaError::Transport(-1))
            }
        }
    }

    fn open_file(path: &str) -> Result<StdTransport, OtaError> {
        let file = File::open(path).map_err(|e| {
            error!("Cannot open {}: {}", path, e);
            OtaError::Transport(e.raw_os_error().unwrap_or(-1))
        })?;
        let length = file.metadata().ok().map(|m| m.len());
        debug!("Opened {}, length {:?}", path, length);
        Ok(StdTransport::new(Box::new(file), length))
    }
}

impl TransportOpener for StdOpener {
    type Transport = StdTransport;

    fn open(&mut self, url: &str) -> Result<StdTransport, OtaError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.open_http(url)
        } else {
            Self::open_file(url.strip_prefix("file://").unwrap_or(url))
        }
    }
}

pub(crate) struct StdClock(Instant);

impl StdClock {
    pub(crate) fn new() -> Self {
        Self(Instant::now())
    }
}

impl Clock for StdClock {
    fn now_ms(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }
}

pub(crate) struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(u64::from(ns)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    struct Flaky {
        calls: usize,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.calls += 1;
            match self.calls {
                1 => Err(io::Error::from(ErrorKind::TimedOut)),
                2 => {
                    buf[0] = 7;
                    Ok(1)
                }
                _ => Err(io::Error::from(ErrorKind::ConnectionReset)),
            }
        }
    }

    #[test]
    fn stream_ends_on_eof() {
        let mut transport = StdTransport::new(Box::new(Cursor::new(vec![1u8, 2, 3])), Some(3));
        let mut buf = [0u8; 8];
        assert_eq!(transport.content_length(), Some(3));
        assert_eq!(transport.read(&mut buf), Ok(3));
        assert!(transport.connected());
        assert_eq!(transport.read(&mut buf), Ok(0));
        assert!(!transport.connected());
    }

    #[test]
    fn timeouts_are_idle_reads_and_other_errors_fail() {
        let mut transport = StdTransport::new(Box::new(Flaky { calls: 0 }), None);
        let mut buf = [0u8; 4];
        assert_eq!(transport.read(&mut buf), Ok(0));
        assert!(transport.connected());
        assert_eq!(transport.read(&mut buf), Ok(1));
        assert_eq!(buf[0], 7);
        assert_eq!(transport.read(&mut buf), Err(OtaError::Transport(-1)));
        assert!(!transport.connected());
    }

    #[test]
    fn missing_file_is_a_transport_error() {
        let mut opener = StdOpener::new(Duration::from_secs(1));
        let result = opener.open("file:///definitely/not/here/fw.bin");
        assert!(matches!(result, Err(OtaError::Transport(_))));
    }

    #[test]
    fn file_urls_report_their_length() {
        let path = std::env::temp_dir().join(format!("ota-net-test-{}.bin", std::process::id()));
        std::fs::write(&path, [0u8; 48]).unwrap();
        let mut opener = StdOpener::new(Duration::from_secs(1));
        let transport = opener.open(path.to_str().unwrap()).unwrap();
        assert_eq!(transport.content_length(), Some(48));
        std::fs::remove_file(&path).unwrap();
    }
}
