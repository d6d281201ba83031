// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-domain breakpoint table.
//!
//! Records live in an arena keyed by [`BreakpointId`]; sessions hold only the
//! ids they created, and event delivery follows the owner id stored alongside
//! each record as a non-owning back-reference. All mutation goes through the
//! introspection engine under the domain lock.

use std::collections::BTreeMap;
use vmi_core_defs::error::VmiError;
use vmi_core_defs::x86::BreakpointSize;
use vmi_core_defs::x86::BreakpointType;
use vmi_core_defs::x86::DebugState;
use vmi_core_defs::x86::HardwareBreakpoint;
use vmi_core_defs::x86::HW_BREAKPOINT_SLOTS;
use vmi_core_defs::BreakpointId;
use vmi_core_defs::BreakpointKey;
use vmi_core_defs::BreakpointKind;
use vmi_core_defs::SessionId;
use vmi_core_defs::VcpuScope;

/// The trap instruction patched over guest code for software breakpoints
/// (int3).
pub const TRAP_INSTRUCTION: u8 = 0xcc;

#[derive(Debug, Clone)]
pub(crate) struct BreakpointRecord {
    pub id: BreakpointId,
    pub key: BreakpointKey,
    pub owner: SessionId,
    /// Survives the owning session's detach.
    pub shared: bool,
    pub enabled: bool,
    /// The original byte under the trap instruction (software only).
    pub saved_byte: Option<u8>,
    /// Where the trap instruction was written (software only).
    pub patch_gpa: Option<u64>,
    /// Debug-register programming (hardware kinds only).
    pub hw: Option<HardwareBreakpoint>,
}

/// Breakpoint table plus per-VCPU debug-register slot accounting.
pub struct BreakpointManager {
    records: BTreeMap<BreakpointId, BreakpointRecord>,
    by_key: BTreeMap<BreakpointKey, BreakpointId>,
    slots: Vec<[Option<BreakpointId>; HW_BREAKPOINT_SLOTS]>,
    next_id: u64,
}

impl BreakpointManager {
    pub(crate) fn new(vp_count: u32) -> Self {
        Self {
            records: BTreeMap::new(),
            by_key: BTreeMap::new(),
            slots: vec![[None; HW_BREAKPOINT_SLOTS]; vp_count as usize],
            next_id: 1,
        }
    }

    pub(crate) fn lookup(&self, key: &BreakpointKey) -> Option<BreakpointId> {
        self.by_key.get(key).copied()
    }

    pub(crate) fn get(&self, id: BreakpointId) -> Option<&BreakpointRecord> {
        self.records.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: BreakpointId) -> Option<&mut BreakpointRecord> {
        self.records.get_mut(&id)
    }

    fn alloc_id(&mut self) -> BreakpointId {
        let id = BreakpointId(self.next_id);
        self.next_id += 1;
        id
    }

    fn target_vps(&self, scope: VcpuScope) -> Vec<u32> {
        match scope {
            VcpuScope::Any => (0..self.slots.len() as u32).collect(),
            VcpuScope::Vcpu(vp) => vec![vp],
        }
    }

    /// Inserts a software breakpoint record. The engine has already read the
    /// original byte and written the trap instruction under the pause
    /// guarantee.
    pub(crate) fn insert_software(
        &mut self,
        owner: SessionId,
        key: BreakpointKey,
        saved_byte: u8,
        patch_gpa: u64,
        shared: bool,
    ) -> BreakpointId {
        debug_assert_eq!(key.kind, BreakpointKind::Software);
        let id = self.alloc_id();
        self.records.insert(
            id,
            BreakpointRecord {
                id,
                key,
                owner,
                shared,
                enabled: true,
                saved_byte: Some(saved_byte),
                patch_gpa: Some(patch_gpa),
                hw: None,
            },
        );
        self.by_key.insert(key, id);
        id
    }

    /// Allocates debug-register slots on every VCPU in scope and inserts a
    /// hardware breakpoint or watchpoint record. Fails with
    /// [`VmiError::ResourceExhausted`] if any in-scope VCPU has no free slot;
    /// no slot is taken in that case.
    pub(crate) fn insert_hardware(
        &mut self,
        owner: SessionId,
        key: BreakpointKey,
        size: BreakpointSize,
        shared: bool,
    ) -> Result<BreakpointId, VmiError> {
        debug_assert!(key.kind.is_hardware());
        let vps = self.target_vps(key.scope);
        let mut chosen = Vec::with_capacity(vps.len());
        for &vp in &vps {
            match self.slots[vp as usize].iter().position(|s| s.is_none()) {
                Some(slot) => chosen.push((vp, slot)),
                None => {
                    return Err(VmiError::ResourceExhausted {
                        resource: "hardware breakpoint",
                    })
                }
            }
        }

        let id = self.alloc_id();
        for (vp, slot) in chosen {
            self.slots[vp as usize][slot] = Some(id);
        }
        self.records.insert(
            id,
            BreakpointRecord {
                id,
                key,
                owner,
                shared,
                enabled: true,
                saved_byte: None,
                patch_gpa: None,
                hw: Some(HardwareBreakpoint {
                    address: key.address,
                    ty: hw_type(key.kind),
                    size,
                }),
            },
        );
        self.by_key.insert(key, id);
        Ok(id)
    }

    /// Removes a record, freeing any debug-register slots it held. The engine
    /// restores the original byte of software breakpoints before calling
    /// this.
    pub(crate) fn remove(&mut self, id: BreakpointId) -> Option<BreakpointRecord> {
        let record = self.records.remove(&id)?;
        self.by_key.remove(&record.key);
        for slots in &mut self.slots {
            for slot in slots.iter_mut() {
                if *slot == Some(id) {
                    *slot = None;
                }
            }
        }
        Some(record)
    }

    /// Resolves a software trap against the table: a per-VCPU record wins
    /// over a domain-wide one. Returns `None` when no enabled record matches,
    /// which the engine treats as a fatal consistency error (a stale trap
    /// left in guest code).
    pub(crate) fn resolve_software(&self, vp: u32, address: u64) -> Option<&BreakpointRecord> {
        [VcpuScope::Vcpu(vp), VcpuScope::Any]
            .iter()
            .filter_map(|&scope| {
                self.lookup(&BreakpointKey {
                    address,
                    scope,
                    kind: BreakpointKind::Software,
                })
            })
            .filter_map(|id| self.records.get(&id))
            .find(|r| r.enabled)
    }

    /// Resolves a debug-register trap by its slot index.
    pub(crate) fn resolve_hardware(&self, vp: u32, slot: usize) -> Option<&BreakpointRecord> {
        let id = *self.slots.get(vp as usize)?.get(slot)?;
        self.records.get(&id?).filter(|r| r.enabled)
    }

    /// Builds the debug state to push to `vp` before a resume.
    pub(crate) fn debug_state(&self, vp: u32, single_step: bool) -> DebugState {
        let mut breakpoints = [None; HW_BREAKPOINT_SLOTS];
        for (i, slot) in self.slots[vp as usize].iter().enumerate() {
            breakpoints[i] = slot
                .and_then(|id| self.records.get(&id))
                .filter(|r| r.enabled)
                .and_then(|r| r.hw);
        }
        DebugState {
            single_step,
            breakpoints,
        }
    }

    /// Ids of the breakpoints `owner` installed that are not marked shared.
    pub(crate) fn owned_by(&self, owner: SessionId) -> Vec<BreakpointId> {
        self.records
            .values()
            .filter(|r| r.owner == owner && !r.shared)
            .map(|r| r.id)
            .collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &BreakpointRecord> {
        self.records.values()
    }

    /// Empties the table and every slot. Used by snapshot restore's rollback
    /// path; the records' patches are assumed already gone from guest memory.
    pub(crate) fn clear(&mut self) {
        self.records.clear();
        self.by_key.clear();
        for slots in &mut self.slots {
            *slots = [None; HW_BREAKPOINT_SLOTS];
        }
    }
}

/// Debug-register type for a hardware breakpoint kind. x86 has no read-only
/// watch; read watchpoints are programmed as read/write and filtered on
/// report.
fn hw_type(kind: BreakpointKind) -> BreakpointType {
    match kind {
        BreakpointKind::Hardware => BreakpointType::Execute,
        BreakpointKind::WatchWrite => BreakpointType::Write,
        BreakpointKind::WatchRead | BreakpointKind::WatchAccess => BreakpointType::ReadOrWrite,
        BreakpointKind::Software => unreachable!(),
    }
}
