// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scoped SIGILL/SIGSEGV interception for the probe instruction.

use crate::Fault;
use std::ffi::c_void;
use std::io;
use std::mem::zeroed;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

// Signal number and si_code of the last probe-site fault, written by the
// handler and consumed by `take_fault`. Zero signal number means no fault.
static FAULT_SIGNO: AtomicI32 = AtomicI32::new(0);
static FAULT_CODE: AtomicI32 = AtomicI32::new(0);

pub(crate) fn clear_fault() {
    FAULT_SIGNO.store(0, Ordering::SeqCst);
}

pub(crate) fn take_fault() -> Option<(Fault, i32)> {
    let fault = match FAULT_SIGNO.swap(0, Ordering::SeqCst) {
        0 => return None,
        libc::SIGILL => Fault::IllegalInstruction,
        libc::SIGSEGV => Fault::ProtectionFault,
        signo => unreachable!("handler installed only for SIGILL/SIGSEGV, got {signo}"),
    };
    Some((fault, FAULT_CODE.load(Ordering::SeqCst)))
}

unsafe extern "C" fn on_probe_fault(signo: i32, info: *mut libc::siginfo_t, context: *mut c_void) {
    // SAFETY: the kernel passes a valid ucontext_t to SA_SIGINFO handlers.
    let uc = unsafe { &mut *context.cast::<libc::ucontext_t>() };
    let rip = uc.uc_mcontext.gregs[libc::REG_RIP as usize] as usize;
    let Some(landing) = crate::x86_64::fixup_rip(rip) else {
        // Not the probe instruction. Re-raise with the default disposition;
        // the signal is blocked until this handler returns, so it is
        // delivered (and terminates the process) on return.
        // SAFETY: signal() and raise() are async-signal-safe.
        unsafe {
            libc::signal(signo, libc::SIG_DFL);
            libc::raise(signo);
        }
        return;
    };
    // SAFETY: info points to a valid siginfo_t for SA_SIGINFO handlers.
    let si_code = unsafe { (*info).si_code };
    FAULT_CODE.store(si_code, Ordering::SeqCst);
    FAULT_SIGNO.store(signo, Ordering::SeqCst);
    // Resume past the faulted instruction.
    uc.uc_mcontext.gregs[libc::REG_RIP as usize] = landing as libc::greg_t;
}

const PROBE_SIGNALS: [i32; 2] = [libc::SIGILL, libc::SIGSEGV];

/// Interceptors for the two fault classes a failed probe raises, installed
/// for the lifetime of this object. Dropping it restores the dispositions
/// that were in place before, on every exit path.
pub(crate) struct FaultScope {
    saved: [libc::sigaction; 2],
}

impl FaultScope {
    pub fn install() -> io::Result<Self> {
        // SAFETY: zero is a valid representation for sigaction, and
        // sigemptyset initializes the zeroed mask.
        let mut sa: libc::sigaction = unsafe { zeroed() };
        sa.sa_sigaction = on_probe_fault as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        // SAFETY: sa_mask is a valid sigset_t.
        unsafe {
            libc::sigemptyset(&mut sa.sa_mask);
        }

        // SAFETY: see above.
        let mut saved: [libc::sigaction; 2] = unsafe { zeroed() };
        for (i, &signo) in PROBE_SIGNALS.iter().enumerate() {
            // SAFETY: calling as documented with valid sigaction pointers.
            if unsafe { libc::sigaction(signo, &sa, &mut saved[i]) } != 0 {
                let err = io::Error::last_os_error();
                for (signo, old) in PROBE_SIGNALS.iter().zip(&saved).take(i) {
                    // SAFETY: restoring a disposition saved just above.
                    unsafe {
                        libc::sigaction(*signo, old, std::ptr::null_mut());
                    }
                }
                return Err(err);
            }
        }
        Ok(Self { saved })
    }
}

impl Drop for FaultScope {
    fn drop(&mut self) {
        for (signo, old) in PROBE_SIGNALS.iter().zip(&self.saved) {
            // SAFETY: restoring the dispositions saved at installation.
            let ret = unsafe { libc::sigaction(*signo, old, std::ptr::null_mut()) };
            assert_eq!(ret, 0, "sigaction restore should not fail");
        }
    }
}
