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

//! Remote-execution channel over pwned DFU.
//!
//! Commands go to the resident exploit payload as DFU_DNLOAD transfers:
//! an 8-byte magic selecting the operation, little-endian u64 fields, and
//! for inline writes the payload bytes. The payload acknowledges each
//! command with a `donedone` upload. Serialization is kept in pure
//! helpers so it can be unit-tested without a device.

use std::time::Duration;

use siglift_core::error::{Result, SigliftError};
use siglift_core::pagetable::Pte;
use siglift_core::transport::{
    DEVICE2HOST, DFU_DNLOAD, DFU_UPLOAD, DeviceControl, HOST2DEVICE, RemoteExec,
};
use tracing::trace;

use crate::dfu::DfuDevice;

const EXEC_MAGIC: &[u8; 8] = b"execexec";
const COPY_MAGIC: &[u8; 8] = b"memcmemc";
const WRITE_MAGIC: &[u8; 8] = b"wrtewrte";
const DONE_MAGIC: &[u8; 8] = b"donedone";

const CMD_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest single DFU_DNLOAD transfer the ROM accepts.
const MAX_TRANSFER: usize = 0x800;
/// Inline-write payload room per transfer, after the command header.
const WRITE_CHUNK: usize = MAX_TRANSFER - WRITE_MAGIC.len() - 16;

fn encode_write(paddr: u64, data: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(WRITE_MAGIC.len() + 16 + data.len());
    request.extend_from_slice(WRITE_MAGIC);
    request.extend_from_slice(&paddr.to_le_bytes());
    request.extend_from_slice(&(data.len() as u64).to_le_bytes());
    request.extend_from_slice(data);
    request
}

fn encode_copy(dst: u64, src: u64, len: u64) -> Vec<u8> {
    let mut request = Vec::with_capacity(COPY_MAGIC.len() + 24);
    request.extend_from_slice(COPY_MAGIC);
    request.extend_from_slice(&dst.to_le_bytes());
    request.extend_from_slice(&src.to_le_bytes());
    request.extend_from_slice(&len.to_le_bytes());
    request
}

fn encode_call(function: u64, args: &[u64]) -> Vec<u8> {
    let mut request = Vec::with_capacity(EXEC_MAGIC.len() + 8 + args.len() * 8);
    request.extend_from_slice(EXEC_MAGIC);
    request.extend_from_slice(&function.to_le_bytes());
    for arg in args {
        request.extend_from_slice(&arg.to_le_bytes());
    }
    request
}

/// [`RemoteExec`] implementation speaking the resident payload's command
/// protocol over a [`DfuDevice`].
pub struct UsbExec {
    device: DfuDevice,
}

impl UsbExec {
    /// Wraps an unopened control channel; the device is acquired on the
    /// first command.
    pub fn new(device: DfuDevice) -> Self {
        UsbExec { device }
    }

    fn command(&mut self, request: &[u8]) -> Result<()> {
        self.device.acquire()?;
        trace!(len = request.len(), "sending payload command");
        let sent =
            self.device
                .ctrl_out(HOST2DEVICE, DFU_DNLOAD, 0, 0, request, CMD_TIMEOUT)?;
        if sent != request.len() {
            return Err(SigliftError::TransportShort {
                expected: request.len(),
                got: sent,
            });
        }

        let mut ack = [0u8; 8];
        let got = self
            .device
            .ctrl_in(DEVICE2HOST, DFU_UPLOAD, 0, 0, &mut ack, CMD_TIMEOUT)?;
        if got != ack.len() || &ack != DONE_MAGIC {
            return Err(SigliftError::BadResponse(format!(
                "payload ack {:02x?}",
                &ack[..got]
            )));
        }
        Ok(())
    }

    fn write_mem(&mut self, paddr: u64, data: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        for chunk in data.chunks(WRITE_CHUNK) {
            self.command(&encode_write(paddr + offset as u64, chunk))?;
            offset += chunk.len();
        }
        Ok(())
    }
}

impl RemoteExec for UsbExec {
    fn write_entries(&mut self, paddr: u64, entries: &[Pte]) -> Result<()> {
        let mut bytes = Vec::with_capacity(entries.len() * 8);
        for entry in entries {
            bytes.extend_from_slice(&entry.bits().to_le_bytes());
        }
        self.write_mem(paddr, &bytes)
    }

    fn write_u32(&mut self, paddr: u64, value: u32) -> Result<()> {
        self.write_mem(paddr, &value.to_le_bytes())
    }

    fn write_u64(&mut self, paddr: u64, value: u64) -> Result<()> {
        self.write_mem(paddr, &value.to_le_bytes())
    }

    fn copy(&mut self, dst: u64, src: u64, len: u64) -> Result<()> {
        self.command(&encode_copy(dst, src, len))
    }

    fn call(&mut self, function: u64, args: &[u64]) -> Result<()> {
        self.command(&encode_call(function, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_request_layout() {
        let request = encode_write(0x1_801f_9b98, &0xd65f_03c0u32.to_le_bytes());
        assert_eq!(&request[..8], b"wrtewrte");
        assert_eq!(&request[8..16], &0x1_801f_9b98u64.to_le_bytes());
        assert_eq!(&request[16..24], &4u64.to_le_bytes());
        assert_eq!(&request[24..], &[0xc0, 0x03, 0x5f, 0xd6]);
    }

    #[test]
    fn copy_request_layout() {
        let request = encode_copy(0x1_801f_8000, 0x1_0000_c000, 0x4000);
        assert_eq!(&request[..8], b"memcmemc");
        assert_eq!(&request[8..16], &0x1_801f_8000u64.to_le_bytes());
        assert_eq!(&request[16..24], &0x1_0000_c000u64.to_le_bytes());
        assert_eq!(&request[24..32], &0x4000u64.to_le_bytes());
        assert_eq!(request.len(), 32);
    }

    #[test]
    fn call_request_layout() {
        let request = encode_call(0x1_0000_04f0, &[0x1_0000_04f0]);
        assert_eq!(&request[..8], b"execexec");
        assert_eq!(&request[8..16], &0x1_0000_04f0u64.to_le_bytes());
        assert_eq!(&request[16..24], &0x1_0000_04f0u64.to_le_bytes());
    }
}
