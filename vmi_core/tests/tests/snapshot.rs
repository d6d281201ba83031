// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Snapshot capture, restore, serialization, and restore rollback.

use crate::common::attach_paused;
use crate::common::standard_domain;
use crate::common::MockBackend;
use crate::common::CODE_GPA;
use crate::common::CODE_GVA;
use crate::common::DATA_GPA;
use std::sync::Arc;
use vmi_core::breakpoints::TRAP_INSTRUCTION;
use vmi_core::hypervisor::PhysicalMemory;
use vmi_core::AccessMode;
use vmi_core::VmiEngine;
use vmi_core_defs::error::HypervisorError;
use vmi_core_defs::error::VmiError;
use vmi_core_defs::x86::BreakpointSize;
use vmi_core_defs::BreakpointKey;
use vmi_core_defs::BreakpointKind;
use vmi_core_defs::DeliveryPolicy;
use vmi_core_defs::DomainId;
use vmi_core_defs::GuestAddress;
use vmi_core_defs::HookClass;
use vmi_core_defs::HookFilter;
use vmi_core_defs::SnapshotId;
use vmi_core_defs::VcpuScope;

fn sw_key(address: u64) -> BreakpointKey {
    BreakpointKey {
        address,
        scope: VcpuScope::Any,
        kind: BreakpointKind::Software,
    }
}

#[test]
fn test_capture_requires_paused() {
    let backend = Arc::new(MockBackend::new(1));
    let engine = VmiEngine::new();
    let domain = engine.attach_domain(backend);
    let session = domain.attach_session(AccessMode::Exclusive).unwrap();
    assert!(matches!(
        session.capture_snapshot(),
        Err(VmiError::State { .. })
    ));
}

#[test]
fn test_restore_round_trip() {
    let (backend, _, session) = standard_domain();
    backend.write_physical(CODE_GPA, &[0x90]).unwrap();
    session
        .write_memory(GuestAddress::Gpa(DATA_GPA), b"checkpoint")
        .unwrap();
    let mut state = session.read_registers(0).unwrap();
    state.rip = CODE_GVA;
    state.gp[0] = 0xaaaa;
    session.write_registers(0, &state).unwrap();
    let id = session
        .set_breakpoint(sw_key(CODE_GVA), BreakpointSize::Byte, false)
        .unwrap();

    let snap = session.capture_snapshot().unwrap();

    // Diverge: clear the breakpoint, scribble over memory and registers.
    session.clear_breakpoint(id).unwrap();
    session
        .write_memory(GuestAddress::Gpa(DATA_GPA), b"divergence")
        .unwrap();
    state.gp[0] = 0xbbbb;
    state.rip = 0;
    session.write_registers(0, &state).unwrap();

    session.restore_snapshot(snap).unwrap();

    let mut buf = [0; 10];
    session
        .read_memory(GuestAddress::Gpa(DATA_GPA), &mut buf)
        .unwrap();
    assert_eq!(&buf, b"checkpoint");
    let restored = session.read_registers(0).unwrap();
    assert_eq!(restored.gp[0], 0xaaaa);
    assert_eq!(restored.rip, CODE_GVA);

    // The breakpoint was re-applied against the restored image.
    let mut byte = [0];
    backend.read_physical(CODE_GPA, &mut byte).unwrap();
    assert_eq!(byte[0], TRAP_INSTRUCTION);

    // The original instruction, not the trap byte, was in the image.
    assert!(session.clear_breakpoint_at(&sw_key(CODE_GVA)).unwrap());
    backend.read_physical(CODE_GPA, &mut byte).unwrap();
    assert_eq!(byte[0], 0x90);
}

#[test]
fn test_restore_is_repeatable() {
    let (_, _, session) = standard_domain();
    session
        .write_memory(GuestAddress::Gpa(DATA_GPA), &[7])
        .unwrap();
    let snap = session.capture_snapshot().unwrap();

    for round in 0..2u8 {
        session
            .write_memory(GuestAddress::Gpa(DATA_GPA), &[round + 10])
            .unwrap();
        session.restore_snapshot(snap).unwrap();
        let mut byte = [0];
        session
            .read_memory(GuestAddress::Gpa(DATA_GPA), &mut byte)
            .unwrap();
        assert_eq!(byte[0], 7);
    }
}

#[test]
fn test_restore_unknown_snapshot() {
    let (_, _, session) = standard_domain();
    assert!(matches!(
        session.restore_snapshot(SnapshotId(99)),
        Err(VmiError::Protocol(_))
    ));
}

#[test]
fn test_restore_reapplies_hooks() {
    let (backend, _, session) = standard_domain();
    session
        .register_hook(
            HookClass::MsrAccess,
            HookFilter::Register(0x1b),
            DeliveryPolicy::OwnerOnly,
        )
        .unwrap();
    let snap = session.capture_snapshot().unwrap();

    session.restore_snapshot(snap).unwrap();
    // The old registration was disarmed and the snapshot's re-armed.
    assert_eq!(
        backend.armed(),
        vec![(HookClass::MsrAccess, HookFilter::Register(0x1b))]
    );
}

#[test]
fn test_export_import_round_trip() {
    let (_, domain, session) = standard_domain();
    session
        .write_memory(GuestAddress::Gpa(DATA_GPA), b"exported")
        .unwrap();
    let snap = session.capture_snapshot().unwrap();
    let bytes = domain.export_snapshot(snap).unwrap();

    session
        .write_memory(GuestAddress::Gpa(DATA_GPA), b"mutated!")
        .unwrap();

    let imported = domain.import_snapshot(&bytes).unwrap();
    assert_ne!(imported, snap);
    session.restore_snapshot(imported).unwrap();

    let mut buf = [0; 8];
    session
        .read_memory(GuestAddress::Gpa(DATA_GPA), &mut buf)
        .unwrap();
    assert_eq!(&buf, b"exported");
}

#[test]
fn test_import_rejects_foreign_domain() {
    let (_, domain, session) = standard_domain();
    let snap = session.capture_snapshot().unwrap();
    let bytes = domain.export_snapshot(snap).unwrap();

    let other = Arc::new(MockBackend::with_id(DomainId(9), 2));
    let engine = VmiEngine::new();
    let other_domain = engine.attach_domain(other);
    assert!(matches!(
        other_domain.import_snapshot(&bytes),
        Err(VmiError::Protocol(_))
    ));
}

#[test]
fn test_import_rejects_garbage() {
    let (_, domain, _session) = standard_domain();
    assert!(matches!(
        domain.import_snapshot(b"not a snapshot"),
        Err(VmiError::Protocol(_))
    ));
}

#[test]
fn test_export_unknown_snapshot() {
    let (_, domain, _session) = standard_domain();
    assert!(matches!(
        domain.export_snapshot(SnapshotId(3)),
        Err(VmiError::Protocol(_))
    ));
}

#[test]
fn test_failed_restore_rolls_back_breakpoint_table() {
    let (backend, _, session) = standard_domain();
    backend.write_physical(CODE_GPA, &[0x90]).unwrap();
    session
        .set_breakpoint(sw_key(CODE_GVA), BreakpointSize::Byte, false)
        .unwrap();
    let snap = session.capture_snapshot().unwrap();

    // Re-applying the snapshot's breakpoint patch will fail.
    backend.fail_byte_write_at(Some(CODE_GPA));
    assert!(matches!(
        session.restore_snapshot(snap),
        Err(VmiError::Hypervisor(HypervisorError::Call { .. }))
    ));
    backend.fail_byte_write_at(None);

    // No stale record survives a failed restore.
    assert!(!session.clear_breakpoint_at(&sw_key(CODE_GVA)).unwrap());
    // Guest memory holds the clean image, not a half-applied patch.
    let mut byte = [0];
    backend.read_physical(CODE_GPA, &mut byte).unwrap();
    assert_eq!(byte[0], 0x90);

    // The snapshot itself is still retained and restorable.
    session.restore_snapshot(snap).unwrap();
    backend.read_physical(CODE_GPA, &mut byte).unwrap();
    assert_eq!(byte[0], TRAP_INSTRUCTION);
}

#[test]
fn test_snapshot_round_trip_after_detach_reattach() {
    let backend = Arc::new(MockBackend::new(1));
    let (domain, session) = attach_paused(backend);
    let snap = session.capture_snapshot().unwrap();
    session.detach().unwrap();

    let session = domain.attach_session(AccessMode::Exclusive).unwrap();
    session.pause().unwrap();
    session.restore_snapshot(snap).unwrap();
}
