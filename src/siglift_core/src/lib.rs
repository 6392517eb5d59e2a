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

//! Core logic for removing the SecureROM signature checks on a t8015
//! device sitting in pwned DFU mode.
//!
//! The device's MMU identity-maps the ROM through a 16 KiB-granule page
//! table. This crate rebuilds the level-3 table covering the ROM's 1 MiB
//! window so that the page holding the heap-integrity check and the page
//! holding the image-signature check resolve into writable SRAM instead,
//! copies the original page contents there, patches one instruction in
//! each copy, and repoints the live level-2 entry at the rebuilt table.
//! Once the translation caches are flushed, the ROM runs the patched
//! copies and accepts unsigned images.
//!
//! The actual USB plumbing lives behind the [`transport`] traits; the
//! `siglift-cli` crate provides the rusb-backed implementations.

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

pub mod error;
pub mod pagetable;
pub mod patcher;
pub mod plan;
pub mod profile;
pub mod transport;

pub use error::{Result, SigliftError};
pub use patcher::Patcher;
pub use plan::{PatchPlan, Phase};
pub use profile::ChipProfile;
