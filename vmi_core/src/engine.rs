// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The introspection engine and its per-domain coordinator.
//!
//! [`VmiEngine`] is the registry of attached domains. [`DomainDebugger`] owns
//! everything per-domain: the hypervisor backend handle, the breakpoint and
//! hook tables, attached sessions, captured snapshots, and the raw event
//! queue. All control-plane state lives behind one domain lock; raw events go
//! through a separate queue so the hypervisor's event sink never contends
//! with a control operation in progress.

use crate::breakpoints::BreakpointManager;
use crate::breakpoints::TRAP_INSTRUCTION;
use crate::hooks::HookManager;
use crate::hypervisor::HypervisorBackend;
use crate::semantics::SemanticContext;
use crate::semantics::SymbolEntry;
use crate::session::AccessMode;
use crate::session::Session;
use crate::session::SessionShared;
use crate::session::SessionTable;
use crate::snapshot;
use crate::snapshot::Snapshot;
use crate::translate::translate_gva_to_gpa;
use crate::translate::TranslateFlags;
use crate::translate::TranslationRegisters;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;
use vmi_core_defs::error::HypervisorError;
use vmi_core_defs::error::VmiError;
use vmi_core_defs::event::RawEventKind;
use vmi_core_defs::event::RawVmiEvent;
use vmi_core_defs::event::VmiEvent;
use vmi_core_defs::x86::BreakpointSize;
use vmi_core_defs::x86::BreakpointType;
use vmi_core_defs::x86::VcpuState;
use vmi_core_defs::BreakpointId;
use vmi_core_defs::BreakpointKey;
use vmi_core_defs::BreakpointKind;
use vmi_core_defs::DeliveryPolicy;
use vmi_core_defs::DomainId;
use vmi_core_defs::DomainState;
use vmi_core_defs::GuestAddress;
use vmi_core_defs::HookClass;
use vmi_core_defs::HookFilter;
use vmi_core_defs::HookId;
use vmi_core_defs::SessionId;
use vmi_core_defs::SnapshotId;
use vmi_core_defs::StopReason;
use vmi_core_defs::VcpuScope;

/// How long a single step may take before the engine gives up waiting for
/// the step-complete event.
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// The registry of domains under introspection.
pub struct VmiEngine {
    domains: Mutex<HashMap<DomainId, Arc<DomainDebugger>>>,
}

impl VmiEngine {
    pub fn new() -> Self {
        Self {
            domains: Mutex::new(HashMap::new()),
        }
    }

    /// Takes ownership of a domain handle from the external domain manager
    /// and starts tracking the domain.
    pub fn attach_domain(&self, backend: Arc<dyn HypervisorBackend>) -> Arc<DomainDebugger> {
        let debugger = DomainDebugger::new(backend);
        tracing::info!(domain = %debugger.id(), "domain attached");
        self.domains.lock().insert(debugger.id(), debugger.clone());
        debugger
    }

    pub fn domain(&self, id: DomainId) -> Option<Arc<DomainDebugger>> {
        self.domains.lock().get(&id).cloned()
    }

    /// Stops tracking a domain. Outstanding [`DomainDebugger`] handles remain
    /// valid until dropped.
    pub fn detach_domain(&self, id: DomainId) -> Option<Arc<DomainDebugger>> {
        let removed = self.domains.lock().remove(&id);
        if removed.is_some() {
            tracing::info!(domain = %id, "domain detached");
        }
        removed
    }

    pub fn domain_ids(&self) -> Vec<DomainId> {
        self.domains.lock().keys().copied().collect()
    }
}

impl Default for VmiEngine {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct DomainInner {
    pub state: DomainState,
    pub breakpoints: BreakpointManager,
    pub hooks: HookManager,
    pub sessions: SessionTable,
    pub semantics: SemanticContext,
    pub snapshots: HashMap<SnapshotId, Snapshot>,
    pub next_snapshot_id: u64,
}

/// Per-domain debugging coordinator.
pub struct DomainDebugger {
    domain_id: DomainId,
    backend: Arc<dyn HypervisorBackend>,
    inner: Mutex<DomainInner>,
    /// Raw hypervisor events in arrival order. Pushed by the event sink from
    /// any context; drained by whichever session thread is waiting, under the
    /// domain lock one event at a time.
    event_queue: Mutex<VecDeque<RawVmiEvent>>,
    event_ready: Condvar,
    /// Serializes draining. Held across each pop-and-process pair; without it
    /// two pumping threads could pop events in order but process them out of
    /// order.
    pump: Mutex<()>,
}

impl DomainDebugger {
    fn new(backend: Arc<dyn HypervisorBackend>) -> Arc<Self> {
        let domain_id = backend.domain_id();
        let vp_count = backend.vp_count();
        let msr_slots = backend.msr_intercept_slots();
        Arc::new_cyclic(|weak: &Weak<DomainDebugger>| {
            let sink = weak.clone();
            backend.set_event_sink(Arc::new(move |event| {
                if let Some(debugger) = sink.upgrade() {
                    debugger.deliver_event(event);
                }
            }));
            DomainDebugger {
                domain_id,
                backend: backend.clone(),
                inner: Mutex::new(DomainInner {
                    state: DomainState::Running,
                    breakpoints: BreakpointManager::new(vp_count),
                    hooks: HookManager::new(msr_slots),
                    sessions: SessionTable::new(),
                    semantics: SemanticContext::new(),
                    snapshots: HashMap::new(),
                    next_snapshot_id: 1,
                }),
                event_queue: Mutex::new(VecDeque::new()),
                event_ready: Condvar::new(),
                pump: Mutex::new(()),
            }
        })
    }

    pub fn id(&self) -> DomainId {
        self.domain_id
    }

    pub fn vp_count(&self) -> u32 {
        self.backend.vp_count()
    }

    pub fn state(&self) -> DomainState {
        self.inner.lock().state
    }

    /// Attaches a new session. At most one [`AccessMode::Exclusive`] session
    /// may be attached at a time.
    pub fn attach_session(self: &Arc<Self>, mode: AccessMode) -> Result<Session, VmiError> {
        let mut guard = self.inner.lock();
        if guard.state == DomainState::Terminated {
            return Err(state_error(DomainState::Running, DomainState::Terminated));
        }
        let (id, shared) = guard.sessions.attach(mode)?;
        drop(guard);
        tracing::info!(domain = %self.domain_id, session = id.0, ?mode, "session attached");
        Ok(Session::new(id, mode, self.clone(), shared))
    }

    /// Enqueues a raw hypervisor event. Only enqueues; processing happens on
    /// the next [`process_pending_events`](Self::process_pending_events), so
    /// this is safe to call from any context.
    pub fn deliver_event(&self, event: RawVmiEvent) {
        self.event_queue.lock().push_back(event);
        self.event_ready.notify_all();
    }

    /// Drains the raw event queue, updating domain state and routing
    /// normalized events and stop reasons to sessions. Returns the number of
    /// events consumed.
    pub fn process_pending_events(&self) -> Result<usize, VmiError> {
        let _drain = self.pump.lock();
        let mut consumed = 0;
        loop {
            let Some(event) = self.event_queue.lock().pop_front() else {
                return Ok(consumed);
            };
            consumed += 1;
            let mut guard = self.inner.lock();
            let result = self.process_raw(&mut guard, event);
            drop(guard);
            // Wake threads waiting for a routed stop or a state change.
            self.event_ready.notify_all();
            result?;
        }
    }

    fn process_raw(&self, guard: &mut DomainInner, raw: RawVmiEvent) -> Result<(), VmiError> {
        let inner = &mut *guard;
        if inner.state == DomainState::Terminated {
            tracing::debug!(domain = %self.domain_id, ?raw, "dropping event for terminated domain");
            return Ok(());
        }
        match raw.kind {
            RawEventKind::SoftwareTrap { address } => {
                inner.state = DomainState::Paused;
                let Some(record) = inner.breakpoints.resolve_software(raw.vp, address) else {
                    tracing::error!(
                        domain = %self.domain_id,
                        vp = raw.vp,
                        address,
                        "trap instruction with no matching breakpoint"
                    );
                    return Err(VmiError::Consistency(format!(
                        "trap instruction at {address:#x} on vp {} with no matching breakpoint",
                        raw.vp
                    )));
                };
                let (id, kind, owner) = (record.id, record.key.kind, record.owner);
                inner.sessions.route_event(
                    owner,
                    VmiEvent::BreakpointHit {
                        vp: raw.vp,
                        id,
                        address,
                        kind,
                    },
                    DeliveryPolicy::Broadcast,
                );
                inner.sessions.route_stop(StopReason::Breakpoint {
                    vp: raw.vp,
                    id,
                    address,
                    kind,
                });
            }
            RawEventKind::HardwareTrap { address, slot, ty } => {
                let prior = inner.state;
                inner.state = DomainState::Paused;
                let Some(record) = inner.breakpoints.resolve_hardware(raw.vp, slot) else {
                    tracing::error!(
                        domain = %self.domain_id,
                        vp = raw.vp,
                        slot,
                        "debug register trap with no matching breakpoint"
                    );
                    return Err(VmiError::Consistency(format!(
                        "debug register trap in slot {slot} on vp {} with no matching breakpoint",
                        raw.vp
                    )));
                };
                if record.hw.map(|hw| hw.address) != Some(address) {
                    return Err(VmiError::Consistency(format!(
                        "debug register trap at {address:#x} does not match slot {slot}"
                    )));
                }
                let (id, kind, owner) = (record.id, record.key.kind, record.owner);
                if kind == BreakpointKind::WatchRead && ty == BreakpointType::Write {
                    // The slot is programmed read/write because x86 has no
                    // read-only watch; a pure write on a read watchpoint is
                    // not reported. Resume transparently.
                    for vp in 0..self.backend.vp_count() {
                        let ds = inner.breakpoints.debug_state(vp, false);
                        if let Err(err) = self.backend.set_debug_state(vp, &ds) {
                            tracing::error!(
                                domain = %self.domain_id,
                                vp,
                                error = &err as &dyn std::error::Error,
                                "failed to rearm debug state"
                            );
                        }
                    }
                    self.backend
                        .unpause()
                        .map_err(|err| self.backend_error(inner, err))?;
                    inner.state = if prior == DomainState::Paused {
                        DomainState::Running
                    } else {
                        prior
                    };
                    return Ok(());
                }
                let event = if kind == BreakpointKind::Hardware {
                    VmiEvent::BreakpointHit {
                        vp: raw.vp,
                        id,
                        address,
                        kind,
                    }
                } else {
                    VmiEvent::WatchpointHit {
                        vp: raw.vp,
                        id,
                        address,
                        kind,
                    }
                };
                inner
                    .sessions
                    .route_event(owner, event, DeliveryPolicy::Broadcast);
                inner.sessions.route_stop(StopReason::Breakpoint {
                    vp: raw.vp,
                    id,
                    address,
                    kind,
                });
            }
            RawEventKind::SingleStepComplete => {
                inner.state = DomainState::Paused;
                if let Some(writer) = inner.sessions.writer() {
                    inner.sessions.route_event(
                        writer,
                        VmiEvent::StepComplete { vp: raw.vp },
                        DeliveryPolicy::Broadcast,
                    );
                }
                inner
                    .sessions
                    .route_stop(StopReason::SingleStep { vp: raw.vp });
            }
            RawEventKind::MsrRead { msr } => {
                for hook in inner.hooks.matches(&raw.kind) {
                    inner.sessions.route_event(
                        hook.owner,
                        VmiEvent::MsrAccess {
                            vp: raw.vp,
                            hook: hook.id,
                            msr,
                            value: None,
                        },
                        hook.delivery,
                    );
                }
            }
            RawEventKind::MsrWrite { msr, value } => {
                for hook in inner.hooks.matches(&raw.kind) {
                    inner.sessions.route_event(
                        hook.owner,
                        VmiEvent::MsrAccess {
                            vp: raw.vp,
                            hook: hook.id,
                            msr,
                            value: Some(value),
                        },
                        hook.delivery,
                    );
                }
            }
            RawEventKind::CpuidAccess { leaf, subleaf } => {
                for hook in inner.hooks.matches(&raw.kind) {
                    inner.sessions.route_event(
                        hook.owner,
                        VmiEvent::CpuidAccess {
                            vp: raw.vp,
                            hook: hook.id,
                            leaf,
                            subleaf,
                        },
                        hook.delivery,
                    );
                }
            }
            RawEventKind::PageFault { gva, error_code } => {
                for hook in inner.hooks.matches(&raw.kind) {
                    inner.sessions.route_event(
                        hook.owner,
                        VmiEvent::PageFault {
                            vp: raw.vp,
                            hook: hook.id,
                            gva,
                            error_code,
                        },
                        hook.delivery,
                    );
                }
            }
            RawEventKind::PowerOff => {
                tracing::info!(domain = %self.domain_id, "domain powered off");
                inner.state = DomainState::Terminated;
                inner.sessions.route_stop(StopReason::PowerOff);
            }
            RawEventKind::TripleFault => {
                tracing::warn!(domain = %self.domain_id, vp = raw.vp, "triple fault");
                inner.state = DomainState::Paused;
                inner
                    .sessions
                    .route_stop(StopReason::TripleFault { vp: raw.vp });
            }
        }
        Ok(())
    }

    /// Maps a hypervisor failure, marking the domain terminated if the
    /// handle was revoked.
    fn backend_error(&self, inner: &mut DomainInner, err: HypervisorError) -> VmiError {
        if err.is_terminal() {
            tracing::error!(
                domain = %self.domain_id,
                error = &err as &dyn std::error::Error,
                "domain handle revoked"
            );
            inner.state = DomainState::Terminated;
            inner.sessions.route_stop(StopReason::PowerOff);
        }
        err.into()
    }

    fn check_vp(&self, vp: u32) -> Result<(), VmiError> {
        if vp >= self.backend.vp_count() {
            return Err(VmiError::Protocol(format!("vp {vp} out of range")));
        }
        Ok(())
    }

    /// Pauses the domain. Idempotent while paused; a pause timeout leaves
    /// the domain running and may be retried.
    pub(crate) fn pause(&self, id: SessionId) -> Result<(), VmiError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        ensure_writer(inner, id)?;
        match inner.state {
            DomainState::Terminated => {
                Err(state_error(DomainState::Running, DomainState::Terminated))
            }
            DomainState::Paused => Ok(()),
            DomainState::Running | DomainState::SingleStepping => {
                self.backend
                    .pause()
                    .map_err(|err| self.backend_error(inner, err))?;
                inner.state = DomainState::Paused;
                inner.sessions.route_stop(StopReason::Break);
                drop(guard);
                self.event_ready.notify_all();
                Ok(())
            }
        }
    }

    /// Resumes the domain, arming the single-step trap flag on `step_vps`.
    pub(crate) fn resume_with_steps(&self, id: SessionId, step_vps: &[u32]) -> Result<(), VmiError> {
        for &vp in step_vps {
            self.check_vp(vp)?;
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        ensure_writer(inner, id)?;
        require_paused(inner)?;
        // Push the accumulated debug register programming before releasing
        // the VCPUs.
        for vp in 0..self.backend.vp_count() {
            let ds = inner.breakpoints.debug_state(vp, step_vps.contains(&vp));
            self.backend
                .set_debug_state(vp, &ds)
                .map_err(|err| self.backend_error(inner, err))?;
        }
        self.backend
            .unpause()
            .map_err(|err| self.backend_error(inner, err))?;
        inner.state = if step_vps.is_empty() {
            DomainState::Running
        } else {
            DomainState::SingleStepping
        };
        Ok(())
    }

    /// Executes `count` instructions on `vp`, one at a time, returning with
    /// the domain paused.
    pub(crate) fn step(&self, id: SessionId, vp: u32, count: u32) -> Result<(), VmiError> {
        self.check_vp(vp)?;
        for _ in 0..count {
            self.resume_with_steps(id, &[vp])?;
            self.wait_until_paused(STEP_TIMEOUT)?;
        }
        Ok(())
    }

    fn wait_until_paused(&self, timeout: Duration) -> Result<(), VmiError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.process_pending_events()?;
            match self.inner.lock().state {
                DomainState::Paused => return Ok(()),
                DomainState::Terminated => {
                    return Err(state_error(DomainState::Paused, DomainState::Terminated))
                }
                DomainState::Running | DomainState::SingleStepping => {}
            }
            let mut queue = self.event_queue.lock();
            if queue.is_empty()
                && self
                    .event_ready
                    .wait_until(&mut queue, deadline)
                    .timed_out()
            {
                return Err(HypervisorError::Timeout.into());
            }
        }
    }

    /// Waits for a stop reason to be routed to `shared`, pumping raw events
    /// while waiting. `Ok(None)` means the timeout elapsed with the domain
    /// still running.
    pub(crate) fn wait_stop(
        &self,
        shared: &SessionShared,
        timeout: Duration,
    ) -> Result<Option<StopReason>, VmiError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.process_pending_events()?;
            if let Some(stop) = shared.take_stop() {
                return Ok(Some(stop));
            }
            if self.inner.lock().state == DomainState::Terminated {
                return Ok(Some(StopReason::PowerOff));
            }
            let mut queue = self.event_queue.lock();
            if queue.is_empty()
                && self
                    .event_ready
                    .wait_until(&mut queue, deadline)
                    .timed_out()
            {
                return Ok(None);
            }
        }
    }

    pub(crate) fn read_registers(
        &self,
        id: SessionId,
        vp: u32,
    ) -> Result<Box<VcpuState>, VmiError> {
        self.check_vp(vp)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        ensure_session(inner, id)?;
        require_paused(inner)?;
        self.backend
            .vp_state(vp)
            .map_err(|err| self.backend_error(inner, err))
    }

    pub(crate) fn write_registers(
        &self,
        id: SessionId,
        vp: u32,
        state: &VcpuState,
    ) -> Result<(), VmiError> {
        self.check_vp(vp)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        ensure_writer(inner, id)?;
        require_paused(inner)?;
        self.backend
            .set_vp_state(vp, state)
            .map_err(|err| self.backend_error(inner, err))
    }

    pub(crate) fn read_memory(
        &self,
        id: SessionId,
        addr: GuestAddress,
        buf: &mut [u8],
    ) -> Result<(), VmiError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        ensure_session(inner, id)?;
        require_paused(inner)?;
        match addr {
            GuestAddress::Gpa(gpa) => self
                .backend
                .read_physical(gpa, buf)
                .map_err(|err| self.backend_error(inner, err)),
            GuestAddress::Gva { vp, gva } => {
                self.check_vp(vp)?;
                let state = self
                    .backend
                    .vp_state(vp)
                    .map_err(|err| self.backend_error(inner, err))?;
                let registers = TranslationRegisters::from_vcpu(&state);
                let mut offset = 0;
                while offset < buf.len() {
                    let result = translate_gva_to_gpa(
                        &*self.backend,
                        gva.wrapping_add(offset as u64),
                        &registers,
                        TranslateFlags::default(),
                    )?;
                    let this_len =
                        (buf.len() - offset).min(4096 - (result.gpa & 0xfff) as usize);
                    self.backend
                        .read_physical(result.gpa, &mut buf[offset..offset + this_len])
                        .map_err(|err| self.backend_error(inner, err))?;
                    offset += this_len;
                }
                Ok(())
            }
        }
    }

    pub(crate) fn write_memory(
        &self,
        id: SessionId,
        addr: GuestAddress,
        buf: &[u8],
    ) -> Result<(), VmiError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        ensure_writer(inner, id)?;
        require_paused(inner)?;
        match addr {
            GuestAddress::Gpa(gpa) => self
                .backend
                .write_physical(gpa, buf)
                .map_err(|err| self.backend_error(inner, err)),
            GuestAddress::Gva { vp, gva } => {
                self.check_vp(vp)?;
                let state = self
                    .backend
                    .vp_state(vp)
                    .map_err(|err| self.backend_error(inner, err))?;
                let registers = TranslationRegisters::from_vcpu(&state);
                let mut offset = 0;
                while offset < buf.len() {
                    let result = translate_gva_to_gpa(
                        &*self.backend,
                        gva.wrapping_add(offset as u64),
                        &registers,
                        TranslateFlags::default(),
                    )?;
                    let this_len =
                        (buf.len() - offset).min(4096 - (result.gpa & 0xfff) as usize);
                    self.backend
                        .write_physical(result.gpa, &buf[offset..offset + this_len])
                        .map_err(|err| self.backend_error(inner, err))?;
                    offset += this_len;
                }
                Ok(())
            }
        }
    }

    /// Installs a breakpoint while paused. An identical key returns the
    /// existing record's id rather than installing a second trap.
    pub(crate) fn set_breakpoint(
        &self,
        id: SessionId,
        key: BreakpointKey,
        size: BreakpointSize,
        shared: bool,
    ) -> Result<BreakpointId, VmiError> {
        if let VcpuScope::Vcpu(vp) = key.scope {
            self.check_vp(vp)?;
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        ensure_writer(inner, id)?;
        require_paused(inner)?;
        if let Some(existing) = inner.breakpoints.lookup(&key) {
            return Ok(existing);
        }
        match key.kind {
            BreakpointKind::Software => {
                let vp = match key.scope {
                    VcpuScope::Vcpu(vp) => vp,
                    VcpuScope::Any => 0,
                };
                let state = self
                    .backend
                    .vp_state(vp)
                    .map_err(|err| self.backend_error(inner, err))?;
                let registers = TranslationRegisters::from_vcpu(&state);
                let gpa = translate_gva_to_gpa(
                    &*self.backend,
                    key.address,
                    &registers,
                    TranslateFlags::default(),
                )?
                .gpa;
                let mut original = [0u8; 1];
                self.backend
                    .read_physical(gpa, &mut original)
                    .map_err(|err| self.backend_error(inner, err))?;
                self.backend
                    .write_physical(gpa, &[TRAP_INSTRUCTION])
                    .map_err(|err| self.backend_error(inner, err))?;
                tracing::debug!(
                    domain = %self.domain_id,
                    address = key.address,
                    gpa,
                    "software breakpoint installed"
                );
                Ok(inner
                    .breakpoints
                    .insert_software(id, key, original[0], gpa, shared))
            }
            _ => {
                let bp = inner.breakpoints.insert_hardware(id, key, size, shared)?;
                tracing::debug!(
                    domain = %self.domain_id,
                    address = key.address,
                    kind = ?key.kind,
                    "hardware breakpoint installed"
                );
                Ok(bp)
            }
        }
    }

    /// Removes a breakpoint, restoring the original instruction byte for
    /// software breakpoints.
    pub(crate) fn clear_breakpoint(&self, id: SessionId, bp: BreakpointId) -> Result<(), VmiError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        ensure_writer(inner, id)?;
        require_paused(inner)?;
        self.remove_breakpoint(inner, bp)
    }

    /// Removes the breakpoint with the given identity, if one exists. The
    /// lookup and removal happen under one hold of the domain lock, so a
    /// concurrent identical request sees `Ok(false)` rather than a stale id.
    pub(crate) fn clear_breakpoint_at(
        &self,
        id: SessionId,
        key: &BreakpointKey,
    ) -> Result<bool, VmiError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        ensure_writer(inner, id)?;
        let Some(bp) = inner.breakpoints.lookup(key) else {
            return Ok(false);
        };
        require_paused(inner)?;
        self.remove_breakpoint(inner, bp)?;
        Ok(true)
    }

    fn remove_breakpoint(&self, inner: &mut DomainInner, bp: BreakpointId) -> Result<(), VmiError> {
        let record = inner
            .breakpoints
            .get(bp)
            .ok_or_else(|| VmiError::Consistency(format!("clear of unknown breakpoint {bp:?}")))?;
        if let (Some(gpa), Some(byte)) = (record.patch_gpa, record.saved_byte) {
            self.backend
                .write_physical(gpa, &[byte])
                .map_err(|err| self.backend_error(inner, err))?;
        }
        inner.breakpoints.remove(bp);
        Ok(())
    }

    pub(crate) fn register_hook(
        &self,
        id: SessionId,
        class: HookClass,
        filter: HookFilter,
        delivery: DeliveryPolicy,
    ) -> Result<HookId, VmiError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        ensure_writer(inner, id)?;
        if inner.state == DomainState::Terminated {
            return Err(state_error(DomainState::Running, DomainState::Terminated));
        }
        inner.hooks.register(&*self.backend, id, class, filter, delivery)
    }

    pub(crate) fn unregister_hook(&self, id: SessionId, hook: HookId) -> Result<(), VmiError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        ensure_writer(inner, id)?;
        inner.hooks.unregister(&*self.backend, hook)
    }

    /// Captures registers, resident memory, and the breakpoint and hook
    /// tables while paused.
    pub(crate) fn capture_snapshot(&self, id: SessionId) -> Result<SnapshotId, VmiError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        ensure_writer(inner, id)?;
        require_paused(inner)?;
        let snap = snapshot::capture(inner, &*self.backend, self.domain_id)?;
        let sid = SnapshotId(inner.next_snapshot_id);
        inner.next_snapshot_id += 1;
        tracing::info!(domain = %self.domain_id, snapshot = sid.0, "snapshot captured");
        inner.snapshots.insert(sid, snap);
        Ok(sid)
    }

    /// Restores a previously captured snapshot while paused. Breakpoints are
    /// re-applied against the restored memory image, never carried over from
    /// the pre-restore table.
    pub(crate) fn restore_snapshot(&self, id: SessionId, sid: SnapshotId) -> Result<(), VmiError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        ensure_writer(inner, id)?;
        require_paused(inner)?;
        let snap = inner
            .snapshots
            .remove(&sid)
            .ok_or_else(|| VmiError::Protocol(format!("unknown snapshot {}", sid.0)))?;
        let result = snapshot::restore(inner, &*self.backend, &snap, id);
        inner.snapshots.insert(sid, snap);
        if result.is_ok() {
            tracing::info!(domain = %self.domain_id, snapshot = sid.0, "snapshot restored");
        }
        result
    }

    /// Serializes a captured snapshot for offline storage.
    pub fn export_snapshot(&self, sid: SnapshotId) -> Result<Vec<u8>, VmiError> {
        let guard = self.inner.lock();
        let snap = guard
            .snapshots
            .get(&sid)
            .ok_or_else(|| VmiError::Protocol(format!("unknown snapshot {}", sid.0)))?;
        Ok(snap.to_bytes())
    }

    /// Parses a serialized snapshot and adds it to the domain's snapshot set.
    pub fn import_snapshot(&self, bytes: &[u8]) -> Result<SnapshotId, VmiError> {
        let snap = Snapshot::from_bytes(bytes)?;
        if snap.domain_id != self.domain_id {
            return Err(VmiError::Protocol(format!(
                "snapshot was captured from {}, not {}",
                snap.domain_id, self.domain_id
            )));
        }
        let mut guard = self.inner.lock();
        let sid = SnapshotId(guard.next_snapshot_id);
        guard.next_snapshot_id += 1;
        guard.snapshots.insert(sid, snap);
        Ok(sid)
    }

    /// Merges symbol mappings produced by the symbol-resolution collaborator.
    pub fn load_symbols(&self, symbols: impl IntoIterator<Item = (u64, SymbolEntry)>) {
        let mut guard = self.inner.lock();
        for (address, entry) in symbols {
            guard.semantics.insert(address, entry);
        }
    }

    pub fn clear_symbols(&self) {
        self.inner.lock().semantics.clear();
    }

    /// Resolves an address to the nearest symbol at or below it.
    pub fn symbolize(&self, address: u64) -> Option<(u64, SymbolEntry)> {
        self.inner
            .lock()
            .semantics
            .resolve(address)
            .map(|(base, entry)| (base, entry.clone()))
    }

    /// Detaches a session, removing the breakpoints and hooks it installed
    /// unless marked shared. Cleanup failures are logged; the detach itself
    /// only fails for an unknown session id.
    pub(crate) fn detach_session(&self, id: SessionId) -> Result<(), VmiError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.sessions.contains(id) {
            return Err(VmiError::UnknownSession(id));
        }
        if inner.state == DomainState::Terminated {
            inner.sessions.remove(id);
            return Ok(());
        }

        let owned = inner.breakpoints.owned_by(id);
        // Unpatching guest code and disarming debug registers both need the
        // domain stopped.
        let pause_for_cleanup = !owned.is_empty() && inner.state != DomainState::Paused;
        if pause_for_cleanup {
            self.backend
                .pause()
                .map_err(|err| self.backend_error(inner, err))?;
        }
        for bp in owned {
            if let Some(record) = inner.breakpoints.get(bp) {
                if let (Some(gpa), Some(byte)) = (record.patch_gpa, record.saved_byte) {
                    if let Err(err) = self.backend.write_physical(gpa, &[byte]) {
                        tracing::error!(
                            domain = %self.domain_id,
                            gpa,
                            error = &err as &dyn std::error::Error,
                            "failed to unpatch breakpoint during detach"
                        );
                    }
                }
            }
            inner.breakpoints.remove(bp);
        }
        for hook in inner.hooks.owned_by(id) {
            if let Err(err) = inner.hooks.unregister(&*self.backend, hook) {
                tracing::error!(
                    domain = %self.domain_id,
                    hook = hook.0,
                    error = &err as &dyn std::error::Error,
                    "failed to unregister hook during detach"
                );
            }
        }
        if pause_for_cleanup {
            for vp in 0..self.backend.vp_count() {
                let ds = inner.breakpoints.debug_state(vp, false);
                if let Err(err) = self.backend.set_debug_state(vp, &ds) {
                    tracing::error!(
                        domain = %self.domain_id,
                        vp,
                        error = &err as &dyn std::error::Error,
                        "failed to refresh debug state during detach"
                    );
                }
            }
            if let Err(err) = self.backend.unpause() {
                tracing::error!(
                    domain = %self.domain_id,
                    error = &err as &dyn std::error::Error,
                    "failed to resume after detach cleanup"
                );
            }
        }
        inner.sessions.remove(id);
        tracing::info!(domain = %self.domain_id, session = id.0, "session detached");
        Ok(())
    }
}

fn ensure_session(inner: &DomainInner, id: SessionId) -> Result<(), VmiError> {
    if !inner.sessions.contains(id) {
        return Err(VmiError::UnknownSession(id));
    }
    Ok(())
}

fn ensure_writer(inner: &DomainInner, id: SessionId) -> Result<(), VmiError> {
    ensure_session(inner, id)?;
    if !inner.sessions.is_writer(id) {
        return Err(VmiError::Concurrency("session is read-only"));
    }
    Ok(())
}

fn require_paused(inner: &DomainInner) -> Result<(), VmiError> {
    if inner.state != DomainState::Paused {
        return Err(state_error(DomainState::Paused, inner.state));
    }
    Ok(())
}

fn state_error(required: DomainState, actual: DomainState) -> VmiError {
    VmiError::State { required, actual }
}
