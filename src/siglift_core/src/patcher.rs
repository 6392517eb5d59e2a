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

//! The patch orchestrator: one linear, synchronous run of the full
//! remap-and-patch sequence against one connected, already-exploited
//! device.
//!
//! There are no retries and no rollback. A failure before the activation
//! write leaves the device unmodified (everything staged up to that point
//! is unreferenced data); a failure at or after it surfaces as
//! [`SigliftError::DeviceStateUnknown`], since only a fresh re-exploit
//! returns the device to a known state.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SigliftError};
use crate::plan::{PatchPlan, Phase, RemoteOp};
use crate::profile::ChipProfile;
use crate::transport::{DFU_ABORT, DeviceControl, HOST2DEVICE, RemoteExec};

const CTRL_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives the full patch sequence over a control channel and a
/// remote-execution channel.
pub struct Patcher<'p, C, X> {
    profile: &'p ChipProfile,
    control: C,
    remote: X,
}

impl<'p, C: DeviceControl, X: RemoteExec> Patcher<'p, C, X> {
    /// Creates a patcher for one device. Neither channel needs to be open
    /// yet; they are acquired phase by phase.
    pub fn new(profile: &'p ChipProfile, control: C, remote: X) -> Self {
        Patcher {
            profile,
            control,
            remote,
        }
    }

    /// Runs the whole sequence: precondition gate, staged remote
    /// operations, then abort/reset back to normal DFU operation.
    #[instrument(skip_all, fields(chip = self.profile.name))]
    pub fn run(mut self) -> Result<()> {
        self.precheck()?;
        let plan = PatchPlan::build(self.profile)?;
        self.execute(&plan)?;
        // The remote channel's session must be gone before the control
        // channel re-acquires the device for the abort/reset.
        let Patcher {
            mut control, remote, ..
        } = self;
        drop(remote);
        Self::recover(&mut control)?;
        info!("device will now accept unsigned images");
        Ok(())
    }

    /// Hard prerequisite gate: device present, pwned, and the supported
    /// chip. Aborts with no device state modified on any failure.
    fn precheck(&mut self) -> Result<()> {
        self.control.acquire()?;
        let checked = (|| {
            if !self.control.is_pwned()? {
                return Err(SigliftError::NotPwned);
            }
            let serial = self.control.serial()?;
            if !self.profile.matches_serial(&serial) {
                return Err(SigliftError::UnsupportedChip(serial));
            }
            info!(%serial, "found pwned {} device", self.profile.name);
            Ok(())
        })();
        // The control channel must not stay open across the
        // remote-execution phases.
        self.control.release();
        checked
    }

    /// Issues the planned operations strictly in order, one at a time.
    fn execute(&mut self, plan: &PatchPlan) -> Result<()> {
        let mut current = Phase::BuildTable;
        for (index, planned) in plan.ops().iter().enumerate() {
            if planned.phase != current {
                debug!(phase = %planned.phase, "entering phase");
                current = planned.phase;
            }
            debug!(op = %planned.op, "issuing remote op");
            if let Err(source) = self.dispatch(&planned.op) {
                if index >= plan.activation_index() {
                    warn!(phase = %planned.phase, "failure after table activation");
                    return Err(SigliftError::DeviceStateUnknown {
                        phase: planned.phase,
                        source: Box::new(source),
                    });
                }
                return Err(source);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, op: &RemoteOp) -> Result<()> {
        match op {
            RemoteOp::WriteEntries { paddr, entries } => {
                self.remote.write_entries(*paddr, entries)
            }
            RemoteOp::Write32 { paddr, value } => self.remote.write_u32(*paddr, *value),
            RemoteOp::Write64 { paddr, value } => self.remote.write_u64(*paddr, *value),
            RemoteOp::Copy { dst, src, len } => self.remote.copy(*dst, *src, *len),
            RemoteOp::Call { function, args } => self.remote.call(*function, args),
        }
    }

    /// Returns the device to normal operation: abort the current download,
    /// reset the port, release the channel.
    fn recover(control: &mut C) -> Result<()> {
        debug!(phase = %Phase::Recover, "entering phase");
        // The abort/reset happens after synchronization, so a failure here
        // is also a post-activation failure.
        Self::abort_and_reset(control).map_err(|source| SigliftError::DeviceStateUnknown {
            phase: Phase::Recover,
            source: Box::new(source),
        })
    }

    fn abort_and_reset(control: &mut C) -> Result<()> {
        control.acquire()?;
        let finished = (|| {
            control.ctrl_out(HOST2DEVICE, DFU_ABORT, 0, 0, &[], CTRL_TIMEOUT)?;
            control.usb_reset()
        })();
        control.release();
        finished
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::pagetable::Pte;
    use crate::profile::T8015;

    const PWNED_SERIAL: &str = "CPID:8015 CPRV:11 BDID:0E PWND:[checkm8]";

    /// Everything both channels did, in issue order.
    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Event {
        Acquire,
        Release,
        CtrlOut { request: u8 },
        Reset,
        WriteEntries { paddr: u64, entries: Vec<Pte> },
        Write32 { paddr: u64, value: u32 },
        Write64 { paddr: u64, value: u64 },
        Copy { dst: u64, src: u64, len: u64 },
        Call { function: u64, args: Vec<u64> },
    }

    type Trace = Rc<RefCell<Vec<Event>>>;

    struct FakeControl {
        trace: Trace,
        pwned: bool,
        serial: String,
        present: bool,
    }

    impl FakeControl {
        fn new(trace: Trace) -> Self {
            FakeControl {
                trace,
                pwned: true,
                serial: PWNED_SERIAL.to_string(),
                present: true,
            }
        }
    }

    impl DeviceControl for FakeControl {
        fn acquire(&mut self) -> Result<()> {
            if !self.present {
                return Err(SigliftError::DeviceNotFound);
            }
            self.trace.borrow_mut().push(Event::Acquire);
            Ok(())
        }

        fn release(&mut self) {
            self.trace.borrow_mut().push(Event::Release);
        }

        fn is_pwned(&mut self) -> Result<bool> {
            Ok(self.pwned)
        }

        fn serial(&mut self) -> Result<String> {
            Ok(self.serial.clone())
        }

        fn ctrl_out(
            &mut self,
            _request_type: u8,
            request: u8,
            _value: u16,
            _index: u16,
            _data: &[u8],
            _timeout: Duration,
        ) -> Result<usize> {
            self.trace.borrow_mut().push(Event::CtrlOut { request });
            Ok(0)
        }

        fn ctrl_in(
            &mut self,
            _request_type: u8,
            _request: u8,
            _value: u16,
            _index: u16,
            _buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize> {
            Ok(0)
        }

        fn usb_reset(&mut self) -> Result<()> {
            self.trace.borrow_mut().push(Event::Reset);
            Ok(())
        }
    }

    struct FakeRemote {
        trace: Trace,
        /// Fail the nth remote op (0-based) with a pipe error.
        fail_at: Option<usize>,
        issued: usize,
    }

    impl FakeRemote {
        fn new(trace: Trace) -> Self {
            FakeRemote {
                trace,
                fail_at: None,
                issued: 0,
            }
        }

        fn step(&mut self, event: Event) -> Result<()> {
            if self.fail_at == Some(self.issued) {
                self.issued += 1;
                return Err(SigliftError::Usb(rusb::Error::Pipe));
            }
            self.issued += 1;
            self.trace.borrow_mut().push(event);
            Ok(())
        }
    }

    impl RemoteExec for FakeRemote {
        fn write_entries(&mut self, paddr: u64, entries: &[Pte]) -> Result<()> {
            self.step(Event::WriteEntries {
                paddr,
                entries: entries.to_vec(),
            })
        }

        fn write_u32(&mut self, paddr: u64, value: u32) -> Result<()> {
            self.step(Event::Write32 { paddr, value })
        }

        fn write_u64(&mut self, paddr: u64, value: u64) -> Result<()> {
            self.step(Event::Write64 { paddr, value })
        }

        fn copy(&mut self, dst: u64, src: u64, len: u64) -> Result<()> {
            self.step(Event::Copy { dst, src, len })
        }

        fn call(&mut self, function: u64, args: &[u64]) -> Result<()> {
            self.step(Event::Call {
                function,
                args: args.to_vec(),
            })
        }
    }

    fn run_with(
        setup: impl FnOnce(&mut FakeControl, &mut FakeRemote),
    ) -> (Result<()>, Vec<Event>) {
        let trace: Trace = Rc::new(RefCell::new(Vec::new()));
        let mut control = FakeControl::new(Rc::clone(&trace));
        let mut remote = FakeRemote::new(Rc::clone(&trace));
        setup(&mut control, &mut remote);
        let result = Patcher::new(&T8015, control, remote).run();
        let events = trace.borrow().clone();
        (result, events)
    }

    #[test]
    fn full_run_issues_expected_trace() {
        let (result, events) = run_with(|_, _| {});
        result.unwrap();

        let expected = vec![
            Event::Acquire,
            Event::Release,
            Event::WriteEntries {
                paddr: 0x1_8001_4000,
                entries: crate::pagetable::build_level3_table(&T8015),
            },
            Event::Copy {
                dst: 0x1_801f_8000,
                src: 0x1_0000_c000,
                len: 0x4000,
            },
            Event::Copy {
                dst: 0x1_801f_4000,
                src: 0x1_0000_4000,
                len: 0x4000,
            },
            Event::Write32 {
                paddr: 0x1_801f_9b98,
                value: 0xd65f_03c0,
            },
            Event::Write32 {
                paddr: 0x1_801f_624c,
                value: 0xd280_0000,
            },
            Event::Write64 {
                paddr: 0x1_8000_c400,
                value: Pte::table(0x1_8001_4000).bits(),
            },
            Event::Call {
                function: 0x1_0000_04f0,
                args: vec![0x1_0000_04f0],
            },
            Event::Call {
                function: 0x1_0000_04ac,
                args: vec![0x1_0000_04ac],
            },
            Event::Acquire,
            Event::CtrlOut { request: DFU_ABORT },
            Event::Reset,
            Event::Release,
        ];
        assert_eq!(events, expected);
    }

    #[test]
    fn missing_device_aborts_without_side_effects() {
        let (result, events) = run_with(|control, _| control.present = false);
        assert!(matches!(result, Err(SigliftError::DeviceNotFound)));
        assert!(events.is_empty());
    }

    #[test]
    fn unpwned_device_aborts_without_remote_ops() {
        let (result, events) = run_with(|control, _| control.pwned = false);
        assert!(matches!(result, Err(SigliftError::NotPwned)));
        assert_eq!(events, vec![Event::Acquire, Event::Release]);
    }

    #[test]
    fn wrong_chip_aborts_without_remote_ops() {
        let (result, events) = run_with(|control, _| {
            control.serial = "CPID:8010 PWND:[checkm8]".to_string();
        });
        assert!(matches!(result, Err(SigliftError::UnsupportedChip(_))));
        assert_eq!(events, vec![Event::Acquire, Event::Release]);
    }

    #[test]
    fn failure_before_activation_propagates_plainly() {
        // Op 1 is the first page copy, well before the level-2 repoint.
        let (result, events) = run_with(|_, remote| remote.fail_at = Some(1));
        let err = result.unwrap_err();
        assert!(matches!(err, SigliftError::Usb(_)));
        assert!(!err.device_state_unknown());
        // No abort/reset was attempted after the failure.
        assert_eq!(
            events.last(),
            Some(&Event::WriteEntries {
                paddr: 0x1_8001_4000,
                entries: crate::pagetable::build_level3_table(&T8015),
            })
        );
    }

    #[test]
    fn failure_at_activation_is_state_unknown() {
        let plan = PatchPlan::build(&T8015).unwrap();
        let (result, _) =
            run_with(|_, remote| remote.fail_at = Some(plan.activation_index()));
        let err = result.unwrap_err();
        assert!(err.device_state_unknown());
        match err {
            SigliftError::DeviceStateUnknown { phase, .. } => {
                assert_eq!(phase, Phase::ActivateTable);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn failure_during_synchronize_is_state_unknown() {
        let plan = PatchPlan::build(&T8015).unwrap();
        let (result, _) =
            run_with(|_, remote| remote.fail_at = Some(plan.activation_index() + 1));
        match result.unwrap_err() {
            SigliftError::DeviceStateUnknown { phase, .. } => {
                assert_eq!(phase, Phase::Synchronize);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
