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

use thiserror::Error;

use crate::plan::Phase;

/// The error type for siglift operations
#[derive(Error, Debug)]
pub enum SigliftError {
    /// A collaborator returned a malformed or unexpected response
    #[error("Unexpected response from device: {0}")]
    BadResponse(String),

    /// No DFU device was found on the bus
    #[error("No DFU device found")]
    DeviceNotFound,

    /// A remote operation failed at or after table activation. The new
    /// level-2 entry may already be live, so the device cannot be assumed
    /// to be in any particular state; re-run checkm8 before retrying.
    #[error("Device left in unknown state during {phase}: {source}")]
    DeviceStateUnknown {
        /// The phase that was executing when the failure occurred
        phase: Phase,
        /// The underlying transport failure
        #[source]
        source: Box<SigliftError>,
    },

    /// A chip profile was internally inconsistent
    #[error("Invalid chip profile: {0}")]
    InvalidProfile(String),

    /// No attached device matched the requested serial number
    #[error("Failed to find device '{0}'")]
    MissingDevice(String),

    /// The device is in stock DFU mode, not pwned DFU
    #[error("Device must be in pwned DFU mode. Run checkm8 and try again.")]
    NotPwned,

    /// More than one candidate device and no serial number to choose by
    #[error(
        "Found {0} DFU devices. Specify the desired device's serial number with '--serial'."
    )]
    TooManyDevices(usize),

    /// A USB transfer moved fewer bytes than requested
    #[error("Short USB transfer: expected {expected} bytes, got {got}")]
    TransportShort {
        /// Bytes requested
        expected: usize,
        /// Bytes actually transferred
        got: usize,
    },

    /// The connected chip is not the one this tool supports
    #[error("Unsupported chip (serial: {0}). Only t8015 is supported.")]
    UnsupportedChip(String),

    /// rusb error
    #[error("USB error {0:?}")]
    Usb(#[from] rusb::Error),
}

impl SigliftError {
    /// Whether this failure may have left the device half-patched.
    ///
    /// Everything before the level-2 repoint is inert: the staged table,
    /// the scratch copies and the patched instructions are unreferenced
    /// data, and a failed run can simply be retried. Once the repoint has
    /// been issued the device's active translation is unknown and only a
    /// fresh re-exploit gets it back to a known state.
    pub fn device_state_unknown(&self) -> bool {
        matches!(self, SigliftError::DeviceStateUnknown { .. })
    }
}

/// A [`std::result::Result`] with a [`SigliftError`] error type
pub type Result<T> = std::result::Result<T, SigliftError>;
