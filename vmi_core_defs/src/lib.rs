// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Client definitions for functionality in the `vmi_core` crate.
//!
//! These are the types that cross the introspection engine's boundaries: the
//! control-plane API consumed by the domain manager and scripting layers, the
//! debug stub workers, and the hypervisor backend seam.

#![forbid(unsafe_code)]

pub mod error;
pub mod event;
pub mod x86;

use std::fmt;

/// Identifies a guest domain.
///
/// The domain itself is created and destroyed by the external domain manager;
/// the engine only ever holds this non-owning identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub u32);

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dom{}", self.0)
    }
}

/// Identifies a breakpoint record within a domain's breakpoint table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub u64);

/// Identifies an event hook subscription within a domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(pub u64);

/// Identifies a debugger session attached to a domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// Identifies a captured snapshot held by the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(pub u64);

/// The execution state of a domain, as tracked by the introspection engine.
///
/// `Terminated` is absorbing: once a domain reaches it, every operation fails
/// immediately.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Paused,
    SingleStepping,
    Terminated,
}

/// An address within the guest.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GuestAddress {
    /// Guest virtual address, translated through `vp`'s page tables.
    Gva { vp: u32, gva: u64 },
    /// Guest physical address.
    Gpa(u64),
}

/// The kind of a breakpoint, part of its identity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BreakpointKind {
    /// A trap instruction patched into guest code.
    Software,
    /// A debug-register execute breakpoint.
    Hardware,
    /// A debug-register read watchpoint.
    ///
    /// x86 debug registers cannot watch reads without also watching writes;
    /// this is programmed as a read/write watch and filtered on report.
    WatchRead,
    /// A debug-register write watchpoint.
    WatchWrite,
    /// A debug-register read/write watchpoint.
    WatchAccess,
}

impl BreakpointKind {
    /// Whether this kind occupies a per-VCPU debug-register slot.
    pub fn is_hardware(&self) -> bool {
        !matches!(self, BreakpointKind::Software)
    }
}

/// Which VCPUs a breakpoint applies to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VcpuScope {
    /// All VCPUs of the domain.
    Any,
    /// A single VCPU.
    Vcpu(u32),
}

/// The identity of a breakpoint: at most one record exists per key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BreakpointKey {
    pub address: u64,
    pub scope: VcpuScope,
    pub kind: BreakpointKind,
}

/// Why a domain stopped, as reported to debugger sessions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A requested break has been acknowledged.
    Break,
    /// The domain has powered off.
    PowerOff,
    /// `vp` encountered a triple fault.
    TripleFault { vp: u32 },
    /// `vp` completed a single step.
    SingleStep { vp: u32 },
    /// `vp` hit a breakpoint or watchpoint.
    Breakpoint {
        vp: u32,
        id: BreakpointId,
        address: u64,
        kind: BreakpointKind,
    },
}

/// Permissions of a guest physical memory region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PagePermissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl PagePermissions {
    pub const RWX: Self = Self {
        read: true,
        write: true,
        execute: true,
    };
}

/// Backing status of a guest physical page or region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageBacking {
    /// Backed by host memory and accessible.
    Resident,
    /// Swapped out by the toolstack; accessible again once brought back in.
    Swapped,
    /// No backing at all.
    Unmapped,
}

/// A guest physical address range with permissions and backing status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    pub len: u64,
    pub perms: PagePermissions,
    pub backing: PageBacking,
}

impl MemoryRegion {
    pub fn contains(&self, gpa: u64) -> bool {
        gpa >= self.start && gpa - self.start < self.len
    }
}

/// Event classes a session can subscribe to via the hook manager.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HookClass {
    /// Guest reads or writes of a model-specific register. Backed by a
    /// capacity-limited hardware intercept slot.
    MsrAccess,
    /// Guest CPUID execution.
    CpuidAccess,
    /// Guest page faults.
    PageFault,
}

/// Restricts which events a hook matches.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HookFilter {
    /// Match every event of the hook's class.
    All,
    /// Match only the given register index (MSR hooks).
    Register(u32),
    /// Match only faults on the given guest virtual address (page-fault
    /// hooks).
    Address(u64),
}

/// Who receives a hook's events.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Only the session that registered the hook.
    OwnerOnly,
    /// The owning session plus any attached observers.
    Broadcast,
}
