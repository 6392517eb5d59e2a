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

//! Collaborator contracts the patch sequence depends on.
//!
//! The orchestrator only ever issues requests through these traits and
//! trusts the results; it never inspects session internals. The rusb
//! implementations live in `siglift-cli`, the test doubles next to the
//! orchestrator's tests.

use std::time::Duration;

use crate::error::Result;
use crate::pagetable::Pte;

/// `bmRequestType` for host-to-device class interface requests.
pub const HOST2DEVICE: u8 = 0x21;
/// `bmRequestType` for device-to-host class interface requests.
pub const DEVICE2HOST: u8 = 0xa1;
/// DFU_DNLOAD request.
pub const DFU_DNLOAD: u8 = 1;
/// DFU_UPLOAD request.
pub const DFU_UPLOAD: u8 = 2;
/// DFU_ABORT request.
pub const DFU_ABORT: u8 = 4;

/// The DFU control channel of one attached device.
///
/// The channel is an exclusively-owned resource per phase: the patch
/// sequence acquires it for the precondition checks, releases it for the
/// remote-execution phases, and re-acquires it for the final abort/reset.
pub trait DeviceControl {
    /// Opens the device and claims its DFU interface.
    fn acquire(&mut self) -> Result<()>;

    /// Releases the interface and closes the device. Idempotent.
    fn release(&mut self);

    /// Whether the device is in the post-exploitation unsigned-execution
    /// state (pwned DFU), as opposed to stock DFU.
    fn is_pwned(&mut self) -> Result<bool>;

    /// The device's DFU serial string, which carries the chip
    /// identification fields.
    fn serial(&mut self) -> Result<String>;

    /// Raw host-to-device control transfer.
    fn ctrl_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Raw device-to-host control transfer.
    fn ctrl_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Performs a USB port reset.
    fn usb_reset(&mut self) -> Result<()>;
}

/// The remote read/write/execute channel into the already-running exploit
/// payload on the device.
///
/// Every operation must complete before the next is issued; later steps
/// of the patch sequence depend on device state produced by earlier ones.
pub trait RemoteExec {
    /// Writes a sequence of 64-bit table entries to physical memory in one
    /// batched transfer.
    fn write_entries(&mut self, paddr: u64, entries: &[Pte]) -> Result<()>;

    /// Writes a single 32-bit value to physical memory.
    fn write_u32(&mut self, paddr: u64, value: u32) -> Result<()>;

    /// Writes a single 64-bit value to physical memory.
    fn write_u64(&mut self, paddr: u64, value: u64) -> Result<()>;

    /// Copies `len` bytes of device memory from `src` to `dst`.
    fn copy(&mut self, dst: u64, src: u64, len: u64) -> Result<()>;

    /// Calls the device function at `function` with the given arguments,
    /// discarding any result.
    fn call(&mut self, function: u64, args: &[u64]) -> Result<()>;
}
