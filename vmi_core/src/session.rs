// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Debugger sessions and the per-domain session table.
//!
//! A domain admits at most one exclusive (writing) session at a time, plus
//! any number of read-only observers. The [`Session`] handle is the only
//! public mutation surface; it forwards everything to the domain debugger,
//! which enforces the access mode under the domain lock.

use crate::engine::DomainDebugger;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use vmi_core_defs::error::VmiError;
use vmi_core_defs::event::VmiEvent;
use vmi_core_defs::x86::BreakpointSize;
use vmi_core_defs::x86::VcpuState;
use vmi_core_defs::BreakpointId;
use vmi_core_defs::BreakpointKey;
use vmi_core_defs::DeliveryPolicy;
use vmi_core_defs::GuestAddress;
use vmi_core_defs::HookClass;
use vmi_core_defs::HookFilter;
use vmi_core_defs::HookId;
use vmi_core_defs::SessionId;
use vmi_core_defs::SnapshotId;
use vmi_core_defs::StopReason;

/// How a session may interact with its domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessMode {
    /// Full control. At most one per domain.
    Exclusive,
    /// Read-only. Receives stop reasons and broadcast events, cannot mutate.
    Observer,
}

/// Delivery state shared between a [`Session`] handle and the domain's event
/// router. The router pushes under the domain lock; the handle drains without
/// taking it.
pub(crate) struct SessionShared {
    state: Mutex<SharedState>,
}

#[derive(Default)]
struct SharedState {
    events: VecDeque<VmiEvent>,
    stop: Option<StopReason>,
}

impl SessionShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SharedState::default()),
        })
    }

    pub(crate) fn push_event(&self, event: VmiEvent) {
        self.state.lock().events.push_back(event);
    }

    /// Records a stop reason. A newer stop overwrites an unconsumed older
    /// one; the domain is paused either way.
    pub(crate) fn set_stop(&self, stop: StopReason) {
        self.state.lock().stop = Some(stop);
    }

    pub(crate) fn take_stop(&self) -> Option<StopReason> {
        self.state.lock().stop.take()
    }

    pub(crate) fn pop_event(&self) -> Option<VmiEvent> {
        self.state.lock().events.pop_front()
    }
}

pub(crate) struct SessionEntry {
    pub mode: AccessMode,
    pub shared: Arc<SessionShared>,
}

/// The sessions attached to one domain.
pub(crate) struct SessionTable {
    sessions: BTreeMap<SessionId, SessionEntry>,
    writer: Option<SessionId>,
    next_id: u64,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            writer: None,
            next_id: 1,
        }
    }

    pub(crate) fn attach(
        &mut self,
        mode: AccessMode,
    ) -> Result<(SessionId, Arc<SessionShared>), VmiError> {
        if mode == AccessMode::Exclusive && self.writer.is_some() {
            return Err(VmiError::Concurrency(
                "domain already has an exclusive session",
            ));
        }
        let id = SessionId(self.next_id);
        self.next_id += 1;
        let shared = SessionShared::new();
        self.sessions.insert(
            id,
            SessionEntry {
                mode,
                shared: shared.clone(),
            },
        );
        if mode == AccessMode::Exclusive {
            self.writer = Some(id);
        }
        Ok((id, shared))
    }

    pub(crate) fn remove(&mut self, id: SessionId) -> Option<SessionEntry> {
        let entry = self.sessions.remove(&id)?;
        if self.writer == Some(id) {
            self.writer = None;
        }
        Some(entry)
    }

    pub(crate) fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub(crate) fn is_writer(&self, id: SessionId) -> bool {
        self.writer == Some(id)
    }

    pub(crate) fn writer(&self) -> Option<SessionId> {
        self.writer
    }

    /// Delivers a normalized event to its owning session, plus to observers
    /// if the registration asked for broadcast. A missing owner means the
    /// session detached with the event in flight; the event is dropped.
    pub(crate) fn route_event(&self, owner: SessionId, event: VmiEvent, delivery: DeliveryPolicy) {
        if let Some(entry) = self.sessions.get(&owner) {
            entry.shared.push_event(event.clone());
        }
        if delivery == DeliveryPolicy::Broadcast {
            for (&id, entry) in &self.sessions {
                if id != owner && entry.mode == AccessMode::Observer {
                    entry.shared.push_event(event.clone());
                }
            }
        }
    }

    /// Records a stop reason for every attached session.
    pub(crate) fn route_stop(&self, stop: StopReason) {
        for entry in self.sessions.values() {
            entry.shared.set_stop(stop);
        }
    }
}

/// A handle to a debugger session attached to one domain.
///
/// Dropping the handle detaches it, removing the breakpoints and hooks it
/// installed (unless marked shared).
pub struct Session {
    id: SessionId,
    mode: AccessMode,
    domain: Arc<DomainDebugger>,
    shared: Arc<SessionShared>,
    detached: bool,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        mode: AccessMode,
        domain: Arc<DomainDebugger>,
        shared: Arc<SessionShared>,
    ) -> Self {
        Self {
            id,
            mode,
            domain,
            shared,
            detached: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn domain(&self) -> &Arc<DomainDebugger> {
        &self.domain
    }

    pub fn vp_count(&self) -> u32 {
        self.domain.vp_count()
    }

    /// Pauses the domain. Idempotent while already paused.
    pub fn pause(&self) -> Result<(), VmiError> {
        self.domain.pause(self.id)
    }

    /// Resumes all VCPUs.
    pub fn resume(&self) -> Result<(), VmiError> {
        self.domain.resume_with_steps(self.id, &[])
    }

    /// Resumes all VCPUs, arming the trap flag on the listed ones.
    pub fn resume_with_steps(&self, step_vps: &[u32]) -> Result<(), VmiError> {
        self.domain.resume_with_steps(self.id, step_vps)
    }

    /// Executes `count` single instructions on `vp`, returning with the
    /// domain paused again.
    pub fn step(&self, vp: u32, count: u32) -> Result<(), VmiError> {
        self.domain.step(self.id, vp, count)
    }

    pub fn read_registers(&self, vp: u32) -> Result<Box<VcpuState>, VmiError> {
        self.domain.read_registers(self.id, vp)
    }

    pub fn write_registers(&self, vp: u32, state: &VcpuState) -> Result<(), VmiError> {
        self.domain.write_registers(self.id, vp, state)
    }

    pub fn read_memory(&self, addr: GuestAddress, buf: &mut [u8]) -> Result<(), VmiError> {
        self.domain.read_memory(self.id, addr, buf)
    }

    pub fn write_memory(&self, addr: GuestAddress, buf: &[u8]) -> Result<(), VmiError> {
        self.domain.write_memory(self.id, addr, buf)
    }

    /// Installs a breakpoint or watchpoint. Re-requesting an identical key
    /// returns the existing id. `shared` breakpoints survive this session's
    /// detach.
    pub fn set_breakpoint(
        &self,
        key: BreakpointKey,
        size: BreakpointSize,
        shared: bool,
    ) -> Result<BreakpointId, VmiError> {
        self.domain.set_breakpoint(self.id, key, size, shared)
    }

    pub fn clear_breakpoint(&self, id: BreakpointId) -> Result<(), VmiError> {
        self.domain.clear_breakpoint(self.id, id)
    }

    /// Clears the breakpoint with the given identity, if one exists. Returns
    /// whether one did.
    pub fn clear_breakpoint_at(&self, key: &BreakpointKey) -> Result<bool, VmiError> {
        self.domain.clear_breakpoint_at(self.id, key)
    }

    pub fn register_hook(
        &self,
        class: HookClass,
        filter: HookFilter,
        delivery: DeliveryPolicy,
    ) -> Result<HookId, VmiError> {
        self.domain.register_hook(self.id, class, filter, delivery)
    }

    pub fn unregister_hook(&self, id: HookId) -> Result<(), VmiError> {
        self.domain.unregister_hook(self.id, id)
    }

    pub fn capture_snapshot(&self) -> Result<SnapshotId, VmiError> {
        self.domain.capture_snapshot(self.id)
    }

    pub fn restore_snapshot(&self, id: SnapshotId) -> Result<(), VmiError> {
        self.domain.restore_snapshot(self.id, id)
    }

    /// Waits for the domain to stop, pumping pending hypervisor events.
    /// Returns `None` on timeout with the domain still running.
    pub fn wait_for_stop(&self, timeout: Duration) -> Result<Option<StopReason>, VmiError> {
        self.domain.wait_stop(&self.shared, timeout)
    }

    /// Takes the next pending normalized event, if any.
    pub fn poll_event(&self) -> Option<VmiEvent> {
        self.shared.pop_event()
    }

    /// Detaches from the domain, removing this session's non-shared
    /// breakpoints and hooks.
    pub fn detach(mut self) -> Result<(), VmiError> {
        self.detached = true;
        self.domain.detach_session(self.id)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.detached {
            if let Err(err) = self.domain.detach_session(self.id) {
                tracing::error!(
                    session = self.id.0,
                    error = &err as &dyn std::error::Error,
                    "failed to detach session on drop"
                );
            }
        }
    }
}
