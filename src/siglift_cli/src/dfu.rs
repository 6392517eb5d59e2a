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

//! rusb-backed DFU control channel for Apple boot-processor devices.

use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext};
use siglift_core::error::{Result, SigliftError};
use siglift_core::transport::DeviceControl;
use tracing::debug;

/// Apple's USB vendor ID.
pub const APPLE_VID: u16 = 0x05ac;
/// Product ID of a boot processor in DFU mode.
pub const DFU_PID: u16 = 0x1227;

/// Marker checkm8 leaves in the serial string of a pwned device.
const PWND_MARKER: &str = "PWND:[";

const REENUMERATION_DELAY: Duration = Duration::from_secs(1);

/// Serial string and pwned state of one attached DFU device.
#[derive(Clone, Debug)]
pub struct DfuInfo {
    pub serial: String,
    pub pwned: bool,
}

/// Lists all attached DFU devices.
pub fn list_devices() -> Result<Vec<DfuInfo>> {
    let mut found = Vec::new();
    for device in rusb::devices()?.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if descriptor.vendor_id() != APPLE_VID || descriptor.product_id() != DFU_PID {
            continue;
        }
        let serial = match device
            .open()
            .and_then(|handle| handle.read_serial_number_string_ascii(&descriptor))
        {
            Ok(serial) => serial,
            Err(err) => {
                debug!(?err, "skipping unreadable DFU device");
                continue;
            }
        };
        let pwned = serial.contains(PWND_MARKER);
        found.push(DfuInfo { serial, pwned });
    }
    Ok(found)
}

struct DfuSession {
    handle: DeviceHandle<GlobalContext>,
    serial: String,
}

/// One attached DFU device, opened lazily via [`DeviceControl::acquire`].
pub struct DfuDevice {
    wanted_serial: Option<String>,
    session: Option<DfuSession>,
}

impl DfuDevice {
    /// Creates an unopened device. `wanted_serial` narrows the choice when
    /// several devices are attached.
    pub fn new(wanted_serial: Option<String>) -> Self {
        DfuDevice {
            wanted_serial,
            session: None,
        }
    }

    fn open_session(wanted: Option<&str>) -> Result<DfuSession> {
        let mut sessions = Vec::new();
        for device in rusb::devices()?.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if descriptor.vendor_id() != APPLE_VID || descriptor.product_id() != DFU_PID {
                continue;
            }
            let handle = match device.open() {
                Ok(handle) => handle,
                Err(err) => {
                    debug!(?err, "failed to open DFU device");
                    continue;
                }
            };
            let serial = handle.read_serial_number_string_ascii(&descriptor)?;
            sessions.push(DfuSession { handle, serial });
        }

        let mut session = match wanted {
            Some(wanted) => sessions
                .into_iter()
                .find(|s| s.serial.contains(wanted))
                .ok_or_else(|| SigliftError::MissingDevice(wanted.to_string()))?,
            None => match sessions.len() {
                0 => return Err(SigliftError::DeviceNotFound),
                1 => sessions.remove(0),
                n => return Err(SigliftError::TooManyDevices(n)),
            },
        };
        session.handle.claim_interface(0)?;
        Ok(session)
    }

    fn session(&mut self) -> Result<&mut DfuSession> {
        match self.session {
            Some(ref mut session) => Ok(session),
            None => Err(SigliftError::BadResponse(
                "control channel used before acquire".to_string(),
            )),
        }
    }
}

impl Drop for DfuDevice {
    fn drop(&mut self) {
        self.release();
    }
}

impl DeviceControl for DfuDevice {
    fn acquire(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        // USB re-enumeration after a reset can take a moment; the lone
        // retry covers re-acquisition right after the patch phases.
        let wanted = self.wanted_serial.as_deref();
        let session = match Self::open_session(wanted) {
            Ok(session) => session,
            Err(SigliftError::DeviceNotFound) | Err(SigliftError::MissingDevice(_)) => {
                std::thread::sleep(REENUMERATION_DELAY);
                Self::open_session(wanted)?
            }
            Err(err) => return Err(err),
        };
        debug!(serial = %session.serial, "acquired DFU device");
        self.session = Some(session);
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.handle.release_interface(0) {
                debug!(?err, "failed to release DFU interface");
            }
        }
    }

    fn is_pwned(&mut self) -> Result<bool> {
        Ok(self.session()?.serial.contains(PWND_MARKER))
    }

    fn serial(&mut self) -> Result<String> {
        Ok(self.session()?.serial.clone())
    }

    fn ctrl_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        let session = self.session()?;
        Ok(session
            .handle
            .write_control(request_type, request, value, index, data, timeout)?)
    }

    fn ctrl_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let session = self.session()?;
        Ok(session
            .handle
            .read_control(request_type, request, value, index, buf, timeout)?)
    }

    fn usb_reset(&mut self) -> Result<()> {
        Ok(self.session()?.handle.reset()?)
    }
}
