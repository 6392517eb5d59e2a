/*
Copyright 2025 The Siglift Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use clap::{Parser, Subcommand, ValueEnum};

/// Removes the SecureROM signature checks on a pwned-DFU t8015 device.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct CliArgs {
    /// Serial number of the device to use when several are attached.
    #[arg(short, long, global = true)]
    pub serial: Option<String>,

    /// Log verbosity when SIGLIFT_LOG is unset.
    #[arg(short, long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List attached DFU devices and whether they are pwned.
    Devices,
    /// Print the remote operations a patch run would issue, without a
    /// device attached.
    Plan,
    /// Run the full remap-and-patch sequence.
    Patch,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}
