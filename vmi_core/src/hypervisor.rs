// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The hypervisor boundary.
//!
//! The engine never creates or destroys domains; it receives a
//! [`HypervisorBackend`] handle from the external domain manager and performs
//! every privileged operation through it. A revoked handle surfaces as
//! [`HypervisorError::DomainGone`], after which the domain is terminal.

use std::sync::Arc;
use vmi_core_defs::error::HypervisorError;
use vmi_core_defs::event::RawVmiEvent;
use vmi_core_defs::x86::DebugState;
use vmi_core_defs::x86::VcpuState;
use vmi_core_defs::DomainId;
use vmi_core_defs::HookClass;
use vmi_core_defs::HookFilter;
use vmi_core_defs::MemoryRegion;
use vmi_core_defs::PageBacking;

/// Callback the engine registers to receive raw hypervisor events.
///
/// The hypervisor delivers events asynchronously; the sink only enqueues them
/// onto the domain's ordered queue, so it is safe to invoke from any context,
/// including from within a backend call.
pub type EventSink = Arc<dyn Fn(RawVmiEvent) + Send + Sync>;

/// Guest physical memory access, the subset of the backend needed by the
/// page-table walker.
pub trait PhysicalMemory {
    /// Reads guest physical memory at `gpa`.
    fn read_physical(&self, gpa: u64, buf: &mut [u8]) -> Result<(), HypervisorError>;

    /// Writes guest physical memory at `gpa`.
    fn write_physical(&self, gpa: u64, buf: &[u8]) -> Result<(), HypervisorError>;

    /// Reports the backing status of the page containing `gpa`.
    fn page_backing(&self, gpa: u64) -> PageBacking;
}

/// Trait with the minimal methods the engine needs to control a domain.
pub trait HypervisorBackend: PhysicalMemory + Send + Sync {
    /// The domain this backend controls.
    fn domain_id(&self) -> DomainId;

    /// Number of virtual CPUs in the domain.
    fn vp_count(&self) -> u32;

    /// Pauses the domain, returning once the hypervisor acknowledges that no
    /// VCPU is executing. Bounded internally; a missed deadline surfaces as
    /// [`HypervisorError::Timeout`] and may be retried.
    fn pause(&self) -> Result<(), HypervisorError>;

    /// Resumes execution of all VCPUs.
    fn unpause(&self) -> Result<(), HypervisorError>;

    /// Fetches the register file of `vp`. Only meaningful while paused.
    fn vp_state(&self, vp: u32) -> Result<Box<VcpuState>, HypervisorError>;

    /// Replaces the register file of `vp`. Only valid while paused.
    fn set_vp_state(&self, vp: u32, state: &VcpuState) -> Result<(), HypervisorError>;

    /// Programs `vp`'s debug registers and trap flag for the next resume.
    fn set_debug_state(&self, vp: u32, state: &DebugState) -> Result<(), HypervisorError>;

    /// Lists the domain's guest physical memory regions.
    fn memory_regions(&self) -> Vec<MemoryRegion>;

    /// Number of MSR intercept slots the hypervisor exposes for this domain.
    fn msr_intercept_slots(&self) -> usize;

    /// Arms an event intercept matching `class`/`filter`.
    fn arm_monitor(&self, class: HookClass, filter: HookFilter) -> Result<(), HypervisorError>;

    /// Disarms a previously armed intercept.
    fn disarm_monitor(&self, class: HookClass, filter: HookFilter) -> Result<(), HypervisorError>;

    /// Registers the callback raw events are pushed through. Called once,
    /// when the engine takes ownership of the domain handle.
    fn set_event_sink(&self, sink: EventSink);
}
