// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Event messages flowing up from the hypervisor boundary.
//!
//! Raw events are vmexit-shaped notifications pushed by the hypervisor
//! boundary onto a per-domain queue; the hook manager normalizes them into
//! [`VmiEvent`]s before they reach sessions. Per-VCPU ordering is preserved
//! by the queue; cross-VCPU ordering is not guaranteed.

use crate::x86::BreakpointType;
use crate::BreakpointId;
use crate::BreakpointKind;
use crate::HookId;

/// A raw notification from the hypervisor, prior to normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawVmiEvent {
    pub vp: u32,
    pub kind: RawEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEventKind {
    /// A trap instruction executed. `address` is the guest virtual address
    /// of the patched instruction.
    SoftwareTrap { address: u64 },
    /// A debug-register breakpoint or watchpoint fired in slot `slot`.
    HardwareTrap {
        address: u64,
        slot: usize,
        ty: BreakpointType,
    },
    /// The VP completed a single instruction with the trap flag armed.
    SingleStepComplete,
    /// The guest read an intercepted MSR.
    MsrRead { msr: u32 },
    /// The guest wrote an intercepted MSR.
    MsrWrite { msr: u32, value: u64 },
    /// The guest executed CPUID.
    CpuidAccess { leaf: u32, subleaf: u32 },
    /// The guest faulted on a monitored page.
    PageFault { gva: u64, error_code: u64 },
    /// The domain powered off.
    PowerOff,
    /// The VP triple faulted.
    TripleFault,
}

/// A normalized event delivered to a session's pending-event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmiEvent {
    BreakpointHit {
        vp: u32,
        id: BreakpointId,
        address: u64,
        kind: BreakpointKind,
    },
    WatchpointHit {
        vp: u32,
        id: BreakpointId,
        address: u64,
        kind: BreakpointKind,
    },
    MsrAccess {
        vp: u32,
        hook: HookId,
        msr: u32,
        /// The written value, or `None` for a read.
        value: Option<u64>,
    },
    CpuidAccess {
        vp: u32,
        hook: HookId,
        leaf: u32,
        subleaf: u32,
    },
    PageFault {
        vp: u32,
        hook: HookId,
        gva: u64,
        error_code: u64,
    },
    StepComplete { vp: u32 },
}
