// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Inline asm implementation of the hypercall probe routines.
//!
//! Each routine moves the sentinel into rax, issues the hypercall
//! instruction at an exported label, and returns rax. If the instruction
//! traps, the signal handler in [`crate::unix`] recognizes the faulting rip
//! as one of the probe sites and resumes execution at the landing pad
//! immediately after it, so the routine still returns (with the fault
//! recorded out of band).

use crate::Fault;
use crate::HypercallInstruction;
use crate::unix;

core::arch::global_asm! {
    ".globl vmcall_probe_vmcall",
    ".globl vmcall_probe_vmcall_site",
    ".globl vmcall_probe_vmcall_landing",
    ".globl vmcall_probe_vmmcall",
    ".globl vmcall_probe_vmmcall_site",
    ".globl vmcall_probe_vmmcall_landing",
    ".p2align 4",
    "vmcall_probe_vmcall:",
    "mov rax, rdi",
    "vmcall_probe_vmcall_site:",
    "vmcall",
    "vmcall_probe_vmcall_landing:",
    "ret",
    ".p2align 4",
    "vmcall_probe_vmmcall:",
    "mov rax, rdi",
    "vmcall_probe_vmmcall_site:",
    "vmmcall",
    "vmcall_probe_vmmcall_landing:",
    "ret",
}

unsafe extern "C" {
    fn vmcall_probe_vmcall(sentinel: u64) -> u64;
    fn vmcall_probe_vmmcall(sentinel: u64) -> u64;
    static vmcall_probe_vmcall_site: u8;
    static vmcall_probe_vmcall_landing: u8;
    static vmcall_probe_vmmcall_site: u8;
    static vmcall_probe_vmmcall_landing: u8;
}

/// If `rip` is one of the probe instruction sites, returns the landing pad to
/// resume at. Called from the signal handler; must stay async-signal-safe.
pub(crate) fn fixup_rip(rip: usize) -> Option<usize> {
    // SAFETY: taking the addresses of asm labels, never dereferencing them.
    unsafe {
        if rip == &raw const vmcall_probe_vmcall_site as usize {
            Some(&raw const vmcall_probe_vmcall_landing as usize)
        } else if rip == &raw const vmcall_probe_vmmcall_site as usize {
            Some(&raw const vmcall_probe_vmmcall_landing as usize)
        } else {
            None
        }
    }
}

/// Issues the probe instruction with `sentinel` in rax.
///
/// The caller must have a [`unix::FaultScope`] installed; a trap at the probe
/// site is then reported as `Err` with the fault class and si_code.
pub(crate) fn issue(
    instruction: HypercallInstruction,
    sentinel: u64,
) -> Result<u64, (Fault, i32)> {
    unix::clear_fault();
    // SAFETY: the routines clobber only rax and either complete or trap at
    // their probe site, where the installed interceptor resumes them at the
    // landing pad.
    let returned = unsafe {
        match instruction {
            HypercallInstruction::Vmcall => vmcall_probe_vmcall(sentinel),
            HypercallInstruction::Vmmcall => vmcall_probe_vmmcall(sentinel),
        }
    };
    match unix::take_fault() {
        None => Ok(returned),
        Some(fault) => Err(fault),
    }
}
