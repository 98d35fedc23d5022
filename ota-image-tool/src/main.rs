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

mod device;
mod keys;
mod net;
mod package;
mod util;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::device::DeviceAction;
use crate::util::{parse_log_level, with_suffix};

#[derive(Parser, Debug)]
#[command(author, version, about = "Build, sign and apply encrypted OTA firmware images")]
struct Cli {
    /// OFF, ERROR, WARN, INFO, DEBUG or TRACE
    #[arg(long, global = true, default_value = "INFO")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an RSA signing key pair
    Keygen {
        #[arg(long, default_value = "keys")]
        out_dir: PathBuf,
        #[arg(long, default_value_t = 2048)]
        bits: usize,
    },
    /// Encrypt firmware into the wire format (a missing key file is created)
    Encrypt {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        key: PathBuf,
    },
    /// Decrypt a wire image back into firmware
    Decrypt {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        key: PathBuf,
    },
    /// Sign the SHA-256 digest of the firmware
    Sign {
        input: PathBuf,
        /// PKCS#8 private key (PEM or DER)
        #[arg(long)]
        key: PathBuf,
        /// Defaults to `<input>.sig`
        #[arg(long)]
        output: Option<PathBuf>,
        /// Treat the input as a wire image encrypted with this key
        #[arg(long)]
        aes_key: Option<PathBuf>,
    },
    /// Check a detached signature the way the device does
    Verify {
        input: PathBuf,
        signature: PathBuf,
        #[arg(long)]
        public_key: PathBuf,
        /// Treat the input as a wire image encrypted with this key
        #[arg(long)]
        aes_key: Option<PathBuf>,
    },
    /// Drive a simulated device stored in a flash image file
    Device {
        #[arg(long, default_value = "device.bin")]
        image: PathBuf,
        #[command(subcommand)]
        action: DeviceAction,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(parse_log_level(&cli.log_level))
        .format_timestamp_millis()
        .init();

    match cli.command {
        Command::Keygen { out_dir, bits } => keys::generate_signing_keys(&out_dir, bits),
        Command::Encrypt { input, output, key } => package::encrypt(&input, &output, &key),
        Command::Decrypt { input, output, key } => package::decrypt(&input, &output, &key),
        Command::Sign {
            input,
            key,
            output,
            aes_key,
        } => {
            let output = output.unwrap_or_else(|| with_suffix(&input, ".sig"));
            package::sign(&input, &key, &output, aes_key.as_deref())
        }
        Command::Verify {
            input,
            signature,
            public_key,
            aes_key,
        } => package::verify(&input, &signature, &public_key, aes_key.as_deref()),
        Command::Device { image, action } => device::run(&image, action),
    }
}
