// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Session multiplexing: exclusive ownership, observers, and handoff.

use crate::common::attach_paused;
use crate::common::standard_domain;
use crate::common::MockBackend;
use std::sync::Arc;
use std::time::Duration;
use vmi_core::AccessMode;
use vmi_core::VmiEngine;
use vmi_core_defs::error::VmiError;
use vmi_core_defs::GuestAddress;
use vmi_core_defs::StopReason;

#[test]
fn test_single_exclusive_session() {
    let (_, domain, session) = standard_domain();
    assert!(matches!(
        domain.attach_session(AccessMode::Exclusive),
        Err(VmiError::Concurrency(_))
    ));

    // Observers may still attach.
    let _observer = domain.attach_session(AccessMode::Observer).unwrap();

    // Detaching the writer frees the slot.
    session.detach().unwrap();
    domain.attach_session(AccessMode::Exclusive).unwrap();
}

#[test]
fn test_observer_reads_but_cannot_mutate() {
    let (_, domain, _session) = standard_domain();
    let observer = domain.attach_session(AccessMode::Observer).unwrap();

    // Reads are allowed while the domain is paused.
    observer.read_registers(0).unwrap();
    let mut buf = [0; 4];
    observer
        .read_memory(GuestAddress::Gpa(0x1000), &mut buf)
        .unwrap();

    assert!(matches!(
        observer.pause(),
        Err(VmiError::Concurrency("session is read-only"))
    ));
    assert!(matches!(
        observer.write_memory(GuestAddress::Gpa(0x1000), &buf),
        Err(VmiError::Concurrency(_))
    ));
    assert!(matches!(observer.resume(), Err(VmiError::Concurrency(_))));
}

#[test]
fn test_observer_receives_stop_reasons() {
    let backend = Arc::new(MockBackend::new(1));
    let engine = VmiEngine::new();
    let domain = engine.attach_domain(backend);
    let observer = domain.attach_session(AccessMode::Observer).unwrap();
    let writer = domain.attach_session(AccessMode::Exclusive).unwrap();
    writer.pause().unwrap();

    assert_eq!(
        observer.wait_for_stop(Duration::ZERO).unwrap(),
        Some(StopReason::Break)
    );
    assert_eq!(
        writer.wait_for_stop(Duration::ZERO).unwrap(),
        Some(StopReason::Break)
    );
    // Stops are consumed per session, not globally.
    assert_eq!(observer.wait_for_stop(Duration::ZERO).unwrap(), None);
}

#[test]
fn test_session_drop_detaches() {
    let (_, domain, session) = standard_domain();
    drop(session);
    domain.attach_session(AccessMode::Exclusive).unwrap();
}

#[test]
fn test_writer_handoff_preserves_pause() {
    let backend = Arc::new(MockBackend::new(1));
    let (domain, session) = attach_paused(backend);
    session.detach().unwrap();

    // The next writer finds the domain still paused and can operate at once.
    let session = domain.attach_session(AccessMode::Exclusive).unwrap();
    session.read_registers(0).unwrap();
    session.resume().unwrap();
}
