// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core functionality for [fast-fstests](https://crates.io/crates/fast-fstests).
//!
//! fast-fstests drives an [xfstests](https://git.kernel.org/pub/scm/fs/xfs/xfstests-dev.git)
//! run across a pool of disposable virtual machines, collecting per-test
//! results and artifacts into a persistent on-disk store. The runner itself is
//! generic: it dispatches [`TestCase`](test_case::TestCase)s onto
//! [`Supervisor`](supervisor::Supervisor)s and knows nothing about file
//! systems, VMs, or SSH. The fstests backend and the mkosi/custom-VM
//! supervisors live in [`fstests`] and [`supervisors`].

pub mod compare;
pub mod config;
pub mod errors;
pub mod fstests;
pub mod record;
pub mod reporter;
pub mod runner;
pub mod schedule;
pub mod signal;
pub mod store;
pub mod supervisor;
pub mod supervisors;
pub mod test_case;
pub mod test_output;
