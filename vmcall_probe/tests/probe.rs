// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Probe tests. These never assume whether the machine they run on is a
//! guest or a host; they check the properties that hold either way.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]
#![expect(unsafe_code)]

use std::sync::Mutex;
use std::sync::MutexGuard;
use vmcall_probe::DEFAULT_SENTINEL;
use vmcall_probe::HypercallInstruction;
use vmcall_probe::Outcome;
use vmcall_probe::detect;
use vmcall_probe::detect_with;

// Signal dispositions are process-global, so tests that install or inspect
// them must not interleave.
fn lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|err| err.into_inner())
}

#[test]
fn probe_is_idempotent() {
    let _lock = lock();
    let first = detect().unwrap();
    let second = detect().unwrap();
    assert_eq!(first, second);
}

#[test]
fn fault_outcome_names_a_probe_signal() {
    let _lock = lock();
    match detect().unwrap() {
        Outcome::Guest | Outcome::HostMismatch { .. } => {}
        Outcome::HostFault(fault) => {
            assert!(matches!(fault.signal(), libc::SIGILL | libc::SIGSEGV));
        }
    }
}

#[test]
fn vmmcall_probe_completes() {
    let _lock = lock();
    // On a VT-x machine this traps with #UD rather than #GP, but either way
    // the probe must classify and return normally.
    detect_with(HypercallInstruction::Vmmcall, DEFAULT_SENTINEL).unwrap();
}

#[test]
fn custom_sentinel_probe_completes() {
    let _lock = lock();
    let outcome = detect_with(HypercallInstruction::Vmcall, 7).unwrap();
    if let Outcome::HostMismatch { returned } = outcome {
        assert_ne!(returned, 7);
    }
}

#[test]
fn previous_dispositions_are_restored() {
    let _lock = lock();

    unsafe extern "C" fn marker(_signo: i32) {}

    // SAFETY: installing and restoring dispositions for this process with
    // valid sigaction structures.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = marker as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        let mut old: libc::sigaction = std::mem::zeroed();
        assert_eq!(libc::sigaction(libc::SIGILL, &sa, &mut old), 0);

        detect().unwrap();

        let mut after: libc::sigaction = std::mem::zeroed();
        assert_eq!(libc::sigaction(libc::SIGILL, std::ptr::null(), &mut after), 0);
        // Put the original disposition back before asserting.
        assert_eq!(libc::sigaction(libc::SIGILL, &old, std::ptr::null_mut()), 0);
        assert_eq!(after.sa_sigaction, marker as usize);
    }
}
