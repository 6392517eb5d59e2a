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

mod args;
mod dfu;
mod usbexec;

use std::process::ExitCode;

use clap::Parser;
use siglift_core::{PatchPlan, Patcher, Result, profile};
use tracing_subscriber::EnvFilter;

use crate::args::{CliArgs, Command};
use crate::dfu::DfuDevice;
use crate::usbexec::UsbExec;

fn main() -> ExitCode {
    let args = CliArgs::parse();

    match EnvFilter::builder()
        .with_env_var("SIGLIFT_LOG")
        .try_from_env()
    {
        Ok(filter) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_max_level(
                    args.log_level
                        .map(tracing::Level::from)
                        .unwrap_or(tracing::Level::INFO),
                )
                .init();
        }
    }

    if let Err(why) = run(args) {
        eprintln!("{why}");
        if why.device_state_unknown() {
            eprintln!("The device may be half-patched; re-run checkm8 before retrying.");
        }
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Devices => {
            let devices = dfu::list_devices()?;
            println!("Found {} DFU device(s):", devices.len());
            for device in devices {
                let state = if device.pwned { "pwned" } else { "stock" };
                println!("  [{state}] {}", device.serial);
            }
        }
        Command::Plan => {
            let profile = &profile::T8015;
            let plan = PatchPlan::build(profile)?;
            println!("Patch plan for {} ({} remote ops):", profile.name, plan.ops().len());
            for planned in plan.ops() {
                println!("  {:<18} {}", planned.phase.to_string(), planned.op);
            }
        }
        Command::Patch => {
            let profile = &profile::T8015;
            let control = DfuDevice::new(args.serial.clone());
            let remote = UsbExec::new(DfuDevice::new(args.serial));
            Patcher::new(profile, control, remote).run()?;
            println!("Done. The device is now ready to accept unsigned images.");
        }
    }
    Ok(())
}
