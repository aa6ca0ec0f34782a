// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command line probe reporting whether the current process runs as a
//! virtual machine guest or on the host.
//!
//! Exit code 0 means a cooperating hypervisor intercepted the probe (guest);
//! exit code 1 means any host outcome. Diagnostics go to stderr via
//! `tracing`, keeping stdout limited to the report lines.

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vmcall_probe::HypercallInstruction;
use vmcall_probe::Outcome;

/// Probe whether this process runs as a virtual machine guest.
#[derive(Parser)]
struct Options {
    /// Sentinel value to pass to the hypercall. A cooperating hypervisor
    /// echoes it back; any other result means host.
    #[clap(long, default_value_t = vmcall_probe::DEFAULT_SENTINEL)]
    sentinel: u64,

    /// Hypercall instruction to issue.
    #[clap(long, value_enum, default_value_t = Instruction::Vmcall)]
    instruction: Instruction,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Instruction {
    Vmcall,
    Vmmcall,
}

impl From<Instruction> for HypercallInstruction {
    fn from(instruction: Instruction) -> Self {
        match instruction {
            Instruction::Vmcall => HypercallInstruction::Vmcall,
            Instruction::Vmmcall => HypercallInstruction::Vmmcall,
        }
    }
}

fn report(outcome: &Outcome, instruction: HypercallInstruction) -> String {
    let mnemonic = instruction.mnemonic().to_uppercase();
    match outcome {
        Outcome::Guest => {
            format!("Execute {mnemonic} OK.\nYou are in the Guest mode.\n")
        }
        Outcome::HostMismatch { .. } => {
            format!("Execute {mnemonic} failed.\nYou are in the Host mode.\n")
        }
        Outcome::HostFault(fault) => {
            format!(
                "Caught signal {}\nExecute {mnemonic} failed.\nYou are in the Host mode.\n",
                fault.signal()
            )
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let options = Options::parse();
    let instruction = options.instruction.into();
    match vmcall_probe::detect_with(instruction, options.sentinel) {
        Ok(outcome) => {
            print!("{}", report(&outcome, instruction));
            if outcome.is_guest() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            eprintln!("vmdetect: {:#}", anyhow::Error::from(err));
            ExitCode::FAILURE
        }
    }
}
