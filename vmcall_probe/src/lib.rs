// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest/host detection by hypercall probe.
//!
//! Issues a hypercall instruction (`vmcall` or `vmmcall`) from user mode with
//! a sentinel value in rax. A cooperating hypervisor intercepts the
//! instruction and echoes the sentinel back; on bare metal (or under a
//! hypervisor that does not cooperate) the instruction either traps with
//! \#UD/\#GP or returns something else. The three cases classify the
//! execution environment as [`Outcome::Guest`], [`Outcome::HostFault`], or
//! [`Outcome::HostMismatch`].
//!
//! The trap is the expected signal for "not a guest", not an error: the
//! probe installs scoped SIGILL/SIGSEGV interceptors around the instruction,
//! recovers from the fault, and restores the previous signal dispositions on
//! every exit path.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]
// UNSAFETY: Issuing a privileged CPU instruction and fixing up the
// interrupted context from a signal handler.
#![expect(unsafe_code)]

mod unix;
mod x86_64;

use std::io;
use std::sync::Mutex;
use thiserror::Error;

/// The sentinel value the original probe convention uses. Arbitrary by
/// convention, but it must match between the call and the success check and
/// be distinguishable from plausible accidental register contents.
pub const DEFAULT_SENTINEL: u64 = 2333;

/// The hypercall-class instruction to issue.
///
/// Which one a cooperating hypervisor intercepts depends on the virtualization
/// extension it runs on: `vmcall` for Intel VT-x, `vmmcall` for AMD SVM. The
/// wrong one for the current CPU raises \#UD even inside a guest.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HypercallInstruction {
    /// The VT-x hypercall instruction.
    Vmcall,
    /// The SVM hypercall instruction.
    Vmmcall,
}

impl HypercallInstruction {
    /// Returns the instruction mnemonic.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            HypercallInstruction::Vmcall => "vmcall",
            HypercallInstruction::Vmmcall => "vmmcall",
        }
    }
}

/// The fault class raised when the probe instruction traps instead of
/// completing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// \#UD, delivered as SIGILL. The instruction is undefined in this
    /// context, e.g. `vmcall` outside VMX operation.
    IllegalInstruction,
    /// \#GP, delivered as SIGSEGV. The instruction is defined but privileged.
    ProtectionFault,
}

impl Fault {
    /// Returns the signal number that delivered the fault.
    pub fn signal(&self) -> i32 {
        match self {
            Fault::IllegalInstruction => libc::SIGILL,
            Fault::ProtectionFault => libc::SIGSEGV,
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::IllegalInstruction => write!(f, "illegal instruction (SIGILL)"),
            Fault::ProtectionFault => write!(f, "protection fault (SIGSEGV)"),
        }
    }
}

/// The classification of the execution environment.
///
/// All three variants are valid, expected results of a probe; none represent
/// a defect. A single probe is conclusive for a given environment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The instruction completed and returned the sentinel: a cooperating
    /// hypervisor intercepted it.
    Guest,
    /// The instruction completed without trapping but returned something
    /// other than the sentinel.
    HostMismatch {
        /// The value the instruction left in the return register.
        returned: u64,
    },
    /// The instruction trapped before completing.
    HostFault(Fault),
}

impl Outcome {
    /// Returns true if the probe concluded the process runs as a guest.
    pub fn is_guest(&self) -> bool {
        matches!(self, Outcome::Guest)
    }
}

/// A failure of the probe machinery itself, as opposed to a Host
/// classification.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The fault interceptors could not be installed.
    #[error("failed to install fault interceptors")]
    InstallHandlers(#[source] io::Error),
}

// The interceptors and their fault bookkeeping are process-wide, so probes
// from multiple threads must not overlap.
static PROBE_GUARD: Mutex<()> = Mutex::new(());

/// Probes with `vmcall` and the default sentinel.
///
/// Equivalent to `detect_with(HypercallInstruction::Vmcall, DEFAULT_SENTINEL)`.
pub fn detect() -> Result<Outcome, ProbeError> {
    detect_with(HypercallInstruction::Vmcall, DEFAULT_SENTINEL)
}

/// Classifies the execution environment by issuing `instruction` with
/// `sentinel` in rax.
///
/// Fault interceptors for SIGILL and SIGSEGV are installed strictly before
/// the instruction executes and removed before this returns, whether the
/// instruction completes or traps. A fault at the probe instruction is
/// recovered and reported as [`Outcome::HostFault`]; faults anywhere else
/// are re-raised with the default disposition.
pub fn detect_with(
    instruction: HypercallInstruction,
    sentinel: u64,
) -> Result<Outcome, ProbeError> {
    let _guard = PROBE_GUARD.lock().unwrap_or_else(|err| err.into_inner());
    let _scope = unix::FaultScope::install().map_err(ProbeError::InstallHandlers)?;
    tracing::debug!(instruction = instruction.mnemonic(), sentinel, "issuing hypercall probe");
    let outcome = match x86_64::issue(instruction, sentinel) {
        Ok(returned) if returned == sentinel => Outcome::Guest,
        Ok(returned) => {
            tracing::debug!(returned, "hypercall completed without echoing the sentinel");
            Outcome::HostMismatch { returned }
        }
        Err((fault, si_code)) => {
            tracing::debug!(signal = fault.signal(), si_code, "hypercall trapped");
            Outcome::HostFault(fault)
        }
    };
    Ok(outcome)
}
