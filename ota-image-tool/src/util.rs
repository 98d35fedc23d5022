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

use anyhow::{Context, Result};
use log::LevelFilter;
use std::fs;
use std::path::{Path, PathBuf};

/// Maps a `--log-level` value to a filter. Unknown levels fall back to INFO.
pub(crate) fn parse_log_level(level: &str) -> LevelFilter {
    match level.to_uppercase().as_str() {
        "OFF" => LevelFilter::Off,
        "ERROR" => LevelFilter::Error,
        "WARN" => LevelFilter::Warn,
        "INFO" => LevelFilter::Info,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        _ => {
            eprintln!("Unknown log level: {}. Using INFO", level);
            LevelFilter::Info
        }
    }
}

pub(crate) fn read_binary_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

pub(crate) fn write_binary_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))
}

/// `path` with `suffix` appended to the file name, e.g. `fw.bin` -> `fw.bin.sig`.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_are_case_insensitive() {
        assert_eq!(parse_log_level("debug"), LevelFilter::Debug);
        assert_eq!(parse_log_level("Trace"), LevelFilter::Trace);
        assert_eq!(parse_log_level("OFF"), LevelFilter::Off);
        assert_eq!(parse_log_level("loud"), LevelFilter::Info);
    }

    #[test]
    fn suffix_is_appended_to_file_name() {
        assert_eq!(
            with_suffix(Path::new("out/fw.bin"), ".sig"),
            PathBuf::from("out/fw.bin.sig")
        );
    }
}
