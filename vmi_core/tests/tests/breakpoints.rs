// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Software and hardware breakpoints, watchpoints, and detach cleanup.

use crate::common::standard_domain;
use crate::common::CODE_GPA;
use crate::common::CODE_GVA;
use crate::common::DATA_GVA;
use std::time::Duration;
use vmi_core::breakpoints::TRAP_INSTRUCTION;
use vmi_core::hypervisor::PhysicalMemory;
use vmi_core::AccessMode;
use vmi_core_defs::error::VmiError;
use vmi_core_defs::event::RawEventKind;
use vmi_core_defs::event::VmiEvent;
use vmi_core_defs::x86::BreakpointSize;
use vmi_core_defs::x86::BreakpointType;
use vmi_core_defs::x86::HardwareBreakpoint;
use vmi_core_defs::x86::X64_EMPTY_DR7;
use vmi_core_defs::BreakpointKey;
use vmi_core_defs::BreakpointKind;
use vmi_core_defs::DomainState;
use vmi_core_defs::StopReason;
use vmi_core_defs::VcpuScope;

const WAIT: Duration = Duration::from_secs(5);

fn sw_key(address: u64) -> BreakpointKey {
    BreakpointKey {
        address,
        scope: VcpuScope::Any,
        kind: BreakpointKind::Software,
    }
}

#[test]
fn test_software_breakpoint_hit_and_clear() {
    let (backend, _, session) = standard_domain();
    // A nop at the breakpoint target.
    backend.write_physical(CODE_GPA, &[0x90]).unwrap();

    let id = session
        .set_breakpoint(sw_key(CODE_GVA), BreakpointSize::Byte, false)
        .unwrap();

    let mut byte = [0];
    backend.read_physical(CODE_GPA, &mut byte).unwrap();
    assert_eq!(byte[0], TRAP_INSTRUCTION);

    session.resume().unwrap();
    backend.send(0, RawEventKind::SoftwareTrap { address: CODE_GVA });

    assert_eq!(
        session.wait_for_stop(WAIT).unwrap(),
        Some(StopReason::Breakpoint {
            vp: 0,
            id,
            address: CODE_GVA,
            kind: BreakpointKind::Software,
        })
    );
    assert_eq!(
        session.poll_event(),
        Some(VmiEvent::BreakpointHit {
            vp: 0,
            id,
            address: CODE_GVA,
            kind: BreakpointKind::Software,
        })
    );

    session.clear_breakpoint(id).unwrap();
    backend.read_physical(CODE_GPA, &mut byte).unwrap();
    assert_eq!(byte[0], 0x90);
}

#[test]
fn test_duplicate_key_returns_existing_id() {
    let (_, _, session) = standard_domain();
    let first = session
        .set_breakpoint(sw_key(CODE_GVA), BreakpointSize::Byte, false)
        .unwrap();
    let second = session
        .set_breakpoint(sw_key(CODE_GVA), BreakpointSize::Byte, false)
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_clear_breakpoint_at() {
    let (_, _, session) = standard_domain();
    session
        .set_breakpoint(sw_key(CODE_GVA), BreakpointSize::Byte, false)
        .unwrap();
    assert!(session.clear_breakpoint_at(&sw_key(CODE_GVA)).unwrap());
    assert!(!session.clear_breakpoint_at(&sw_key(CODE_GVA)).unwrap());
}

#[test]
fn test_concurrent_clear_by_key() {
    let (_, _, session) = standard_domain();
    let key = sw_key(CODE_GVA);
    for _ in 0..16 {
        session
            .set_breakpoint(key, BreakpointSize::Byte, false)
            .unwrap();
        let results = std::thread::scope(|s| {
            let first = s.spawn(|| session.clear_breakpoint_at(&key));
            let second = s.spawn(|| session.clear_breakpoint_at(&key));
            [first.join().unwrap(), second.join().unwrap()]
        });
        // One request removes the breakpoint; the other sees it already
        // gone, never an error.
        assert_eq!(
            results.iter().filter(|r| **r == Ok(true)).count(),
            1,
            "{results:?}"
        );
        assert!(results.contains(&Ok(false)), "{results:?}");
    }
}

#[test]
fn test_clear_unknown_breakpoint() {
    let (_, _, session) = standard_domain();
    assert!(matches!(
        session.clear_breakpoint(vmi_core_defs::BreakpointId(42)),
        Err(VmiError::Consistency(_))
    ));
}

#[test]
fn test_hardware_slot_exhaustion() {
    let (_, _, session) = standard_domain();
    for i in 0..4 {
        session
            .set_breakpoint(
                BreakpointKey {
                    address: DATA_GVA + i * 8,
                    scope: VcpuScope::Any,
                    kind: BreakpointKind::WatchWrite,
                },
                BreakpointSize::QWord,
                false,
            )
            .unwrap();
    }
    assert!(matches!(
        session.set_breakpoint(
            BreakpointKey {
                address: DATA_GVA + 0x100,
                scope: VcpuScope::Any,
                kind: BreakpointKind::WatchWrite,
            },
            BreakpointSize::QWord,
            false,
        ),
        Err(VmiError::ResourceExhausted {
            resource: "hardware breakpoint"
        })
    ));
}

#[test]
fn test_hardware_breakpoint_programs_debug_registers() {
    let (backend, _, session) = standard_domain();
    session
        .set_breakpoint(
            BreakpointKey {
                address: CODE_GVA,
                scope: VcpuScope::Any,
                kind: BreakpointKind::Hardware,
            },
            BreakpointSize::Byte,
            false,
        )
        .unwrap();
    session.resume().unwrap();

    for vp in 0..2 {
        let armed = backend.debug_state(vp).breakpoints[0].unwrap();
        assert_eq!(armed.address, CODE_GVA);
        assert_eq!(armed.ty, BreakpointType::Execute);

        // The DR7 the backend programmed decodes back to the same
        // breakpoint, with slot 0's enable bit set.
        let dr7 = backend.dr7(vp);
        assert_ne!(dr7, X64_EMPTY_DR7);
        assert_ne!(dr7 & (1 << 1), 0);
        assert_eq!(HardwareBreakpoint::from_dr7(dr7, armed.address, 0), armed);
    }
}

#[test]
fn test_vcpu_scoped_record_wins() {
    let (backend, _, session) = standard_domain();
    let any_id = session
        .set_breakpoint(sw_key(CODE_GVA), BreakpointSize::Byte, false)
        .unwrap();
    let vp1_id = session
        .set_breakpoint(
            BreakpointKey {
                address: CODE_GVA,
                scope: VcpuScope::Vcpu(1),
                kind: BreakpointKind::Software,
            },
            BreakpointSize::Byte,
            false,
        )
        .unwrap();
    assert_ne!(any_id, vp1_id);

    session.resume().unwrap();
    backend.send(1, RawEventKind::SoftwareTrap { address: CODE_GVA });
    assert!(matches!(
        session.wait_for_stop(WAIT).unwrap(),
        Some(StopReason::Breakpoint { vp: 1, id, .. }) if id == vp1_id
    ));

    backend.send(0, RawEventKind::SoftwareTrap { address: CODE_GVA });
    assert!(matches!(
        session.wait_for_stop(WAIT).unwrap(),
        Some(StopReason::Breakpoint { vp: 0, id, .. }) if id == any_id
    ));
}

#[test]
fn test_read_watchpoint_suppresses_write_trap() {
    let (backend, domain, session) = standard_domain();
    let id = session
        .set_breakpoint(
            BreakpointKey {
                address: DATA_GVA,
                scope: VcpuScope::Any,
                kind: BreakpointKind::WatchRead,
            },
            BreakpointSize::QWord,
            false,
        )
        .unwrap();
    session.resume().unwrap();
    let resumes = backend.unpause_calls();

    // x86 can only watch read/write together; a pure write must not stop a
    // read watchpoint.
    backend.send(
        0,
        RawEventKind::HardwareTrap {
            address: DATA_GVA,
            slot: 0,
            ty: BreakpointType::Write,
        },
    );
    assert_eq!(
        session.wait_for_stop(Duration::from_millis(20)).unwrap(),
        None
    );
    assert_eq!(domain.state(), DomainState::Running);
    assert_eq!(backend.unpause_calls(), resumes + 1);

    backend.send(
        0,
        RawEventKind::HardwareTrap {
            address: DATA_GVA,
            slot: 0,
            ty: BreakpointType::ReadOrWrite,
        },
    );
    assert_eq!(
        session.wait_for_stop(WAIT).unwrap(),
        Some(StopReason::Breakpoint {
            vp: 0,
            id,
            address: DATA_GVA,
            kind: BreakpointKind::WatchRead,
        })
    );
    assert_eq!(
        session.poll_event(),
        Some(VmiEvent::WatchpointHit {
            vp: 0,
            id,
            address: DATA_GVA,
            kind: BreakpointKind::WatchRead,
        })
    );
}

#[test]
fn test_mismatched_hardware_trap_is_consistency_error() {
    let (backend, _, session) = standard_domain();
    session
        .set_breakpoint(
            BreakpointKey {
                address: DATA_GVA,
                scope: VcpuScope::Any,
                kind: BreakpointKind::WatchWrite,
            },
            BreakpointSize::QWord,
            false,
        )
        .unwrap();
    session.resume().unwrap();

    backend.send(
        0,
        RawEventKind::HardwareTrap {
            address: DATA_GVA + 0x800,
            slot: 0,
            ty: BreakpointType::Write,
        },
    );
    assert!(matches!(
        session.wait_for_stop(WAIT),
        Err(VmiError::Consistency(_))
    ));
}

#[test]
fn test_detach_removes_owned_breakpoints() {
    let (backend, domain, session) = standard_domain();
    backend.write_physical(CODE_GPA, &[0x90]).unwrap();
    backend.write_physical(CODE_GPA + 8, &[0x48]).unwrap();

    session
        .set_breakpoint(sw_key(CODE_GVA), BreakpointSize::Byte, false)
        .unwrap();
    session
        .set_breakpoint(sw_key(CODE_GVA + 8), BreakpointSize::Byte, true)
        .unwrap();
    session.detach().unwrap();

    // The private breakpoint was unpatched; the shared one survives.
    let mut byte = [0];
    backend.read_physical(CODE_GPA, &mut byte).unwrap();
    assert_eq!(byte[0], 0x90);
    backend.read_physical(CODE_GPA + 8, &mut byte).unwrap();
    assert_eq!(byte[0], TRAP_INSTRUCTION);

    // A new session can adopt and clear the shared breakpoint.
    let session = domain.attach_session(AccessMode::Exclusive).unwrap();
    session.pause().unwrap();
    assert!(session.clear_breakpoint_at(&sw_key(CODE_GVA + 8)).unwrap());
    backend.read_physical(CODE_GPA + 8, &mut byte).unwrap();
    assert_eq!(byte[0], 0x48);
}

#[test]
fn test_detach_while_running_pauses_for_cleanup() {
    let (backend, domain, session) = standard_domain();
    backend.write_physical(CODE_GPA, &[0x90]).unwrap();
    session
        .set_breakpoint(sw_key(CODE_GVA), BreakpointSize::Byte, false)
        .unwrap();
    session.resume().unwrap();

    let pauses = backend.pause_calls();
    let resumes = backend.unpause_calls();
    session.detach().unwrap();

    assert_eq!(backend.pause_calls(), pauses + 1);
    assert_eq!(backend.unpause_calls(), resumes + 1);
    assert_eq!(domain.state(), DomainState::Running);
    let mut byte = [0];
    backend.read_physical(CODE_GPA, &mut byte).unwrap();
    assert_eq!(byte[0], 0x90);
}
