// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Event hook registration, filtering, routing, and MSR slot capacity.

use crate::common::standard_domain;
use crate::common::CODE_GVA;
use vmi_core::AccessMode;
use vmi_core_defs::error::HypervisorError;
use vmi_core_defs::error::VmiError;
use vmi_core_defs::event::RawEventKind;
use vmi_core_defs::event::VmiEvent;
use vmi_core_defs::DeliveryPolicy;
use vmi_core_defs::HookClass;
use vmi_core_defs::HookFilter;

const EFER_MSR: u32 = 0xc000_0080;

#[test]
fn test_msr_hook_filtering() {
    let (backend, domain, session) = standard_domain();
    let hook = session
        .register_hook(
            HookClass::MsrAccess,
            HookFilter::Register(EFER_MSR),
            DeliveryPolicy::OwnerOnly,
        )
        .unwrap();

    backend.send(0, RawEventKind::MsrWrite { msr: EFER_MSR, value: 0xd01 });
    backend.send(0, RawEventKind::MsrWrite { msr: 0x1b, value: 0 });
    backend.send(1, RawEventKind::MsrRead { msr: EFER_MSR });
    domain.process_pending_events().unwrap();

    assert_eq!(
        session.poll_event(),
        Some(VmiEvent::MsrAccess {
            vp: 0,
            hook,
            msr: EFER_MSR,
            value: Some(0xd01),
        })
    );
    // The filtered-out write never surfaces; the read follows with no value.
    assert_eq!(
        session.poll_event(),
        Some(VmiEvent::MsrAccess {
            vp: 1,
            hook,
            msr: EFER_MSR,
            value: None,
        })
    );
    assert_eq!(session.poll_event(), None);
}

#[test]
fn test_msr_slot_capacity() {
    let (_, _, session) = standard_domain();
    let mut hooks = Vec::new();
    for msr in 0..4u32 {
        hooks.push(
            session
                .register_hook(
                    HookClass::MsrAccess,
                    HookFilter::Register(msr),
                    DeliveryPolicy::OwnerOnly,
                )
                .unwrap(),
        );
    }
    assert!(matches!(
        session.register_hook(
            HookClass::MsrAccess,
            HookFilter::Register(5),
            DeliveryPolicy::OwnerOnly
        ),
        Err(VmiError::ResourceExhausted {
            resource: "MSR intercept"
        })
    ));

    // Other classes are not slot-limited.
    session
        .register_hook(HookClass::CpuidAccess, HookFilter::All, DeliveryPolicy::OwnerOnly)
        .unwrap();

    // Freeing a slot makes room again.
    session.unregister_hook(hooks[0]).unwrap();
    session
        .register_hook(
            HookClass::MsrAccess,
            HookFilter::Register(5),
            DeliveryPolicy::OwnerOnly,
        )
        .unwrap();
}

#[test]
fn test_hook_arms_and_disarms_intercepts() {
    let (backend, _, session) = standard_domain();
    let hook = session
        .register_hook(
            HookClass::PageFault,
            HookFilter::Address(CODE_GVA),
            DeliveryPolicy::OwnerOnly,
        )
        .unwrap();
    assert_eq!(
        backend.armed(),
        vec![(HookClass::PageFault, HookFilter::Address(CODE_GVA))]
    );
    session.unregister_hook(hook).unwrap();
    assert!(backend.armed().is_empty());

    assert!(matches!(
        session.unregister_hook(hook),
        Err(VmiError::Consistency(_))
    ));
}

#[test]
fn test_page_fault_filter_is_page_granular() {
    let (backend, domain, session) = standard_domain();
    let hook = session
        .register_hook(
            HookClass::PageFault,
            HookFilter::Address(CODE_GVA + 0x80),
            DeliveryPolicy::OwnerOnly,
        )
        .unwrap();

    backend.send(0, RawEventKind::PageFault { gva: CODE_GVA + 0xff0, error_code: 2 });
    backend.send(0, RawEventKind::PageFault { gva: CODE_GVA + 0x1000, error_code: 2 });
    domain.process_pending_events().unwrap();

    assert_eq!(
        session.poll_event(),
        Some(VmiEvent::PageFault {
            vp: 0,
            hook,
            gva: CODE_GVA + 0xff0,
            error_code: 2,
        })
    );
    assert_eq!(session.poll_event(), None);
}

#[test]
fn test_cpuid_hook() {
    let (backend, domain, session) = standard_domain();
    let hook = session
        .register_hook(HookClass::CpuidAccess, HookFilter::All, DeliveryPolicy::OwnerOnly)
        .unwrap();

    backend.send(1, RawEventKind::CpuidAccess { leaf: 0x4000_0000, subleaf: 0 });
    domain.process_pending_events().unwrap();

    assert_eq!(
        session.poll_event(),
        Some(VmiEvent::CpuidAccess {
            vp: 1,
            hook,
            leaf: 0x4000_0000,
            subleaf: 0,
        })
    );
}

#[test]
fn test_delivery_policy_broadcast() {
    let (backend, domain, session) = standard_domain();
    let observer = domain.attach_session(AccessMode::Observer).unwrap();

    let broadcast = session
        .register_hook(
            HookClass::MsrAccess,
            HookFilter::Register(EFER_MSR),
            DeliveryPolicy::Broadcast,
        )
        .unwrap();
    let private = session
        .register_hook(HookClass::CpuidAccess, HookFilter::All, DeliveryPolicy::OwnerOnly)
        .unwrap();

    backend.send(0, RawEventKind::MsrRead { msr: EFER_MSR });
    backend.send(0, RawEventKind::CpuidAccess { leaf: 1, subleaf: 0 });
    domain.process_pending_events().unwrap();

    assert!(matches!(
        observer.poll_event(),
        Some(VmiEvent::MsrAccess { hook, .. }) if hook == broadcast
    ));
    assert_eq!(observer.poll_event(), None);

    // The owner receives both regardless of policy.
    assert!(matches!(
        session.poll_event(),
        Some(VmiEvent::MsrAccess { .. })
    ));
    assert!(matches!(
        session.poll_event(),
        Some(VmiEvent::CpuidAccess { hook, .. }) if hook == private
    ));
}

#[test]
fn test_per_vcpu_ordering_preserved() {
    let (backend, domain, session) = standard_domain();
    session
        .register_hook(HookClass::MsrAccess, HookFilter::All, DeliveryPolicy::OwnerOnly)
        .unwrap();

    for value in 0..4 {
        backend.send(0, RawEventKind::MsrWrite { msr: EFER_MSR, value });
    }
    domain.process_pending_events().unwrap();

    for value in 0..4 {
        assert!(matches!(
            session.poll_event(),
            Some(VmiEvent::MsrAccess { value: Some(v), .. }) if v == value
        ));
    }
}

#[test]
fn test_concurrent_pumping_preserves_order() {
    let (backend, domain, session) = standard_domain();
    session
        .register_hook(HookClass::MsrAccess, HookFilter::All, DeliveryPolicy::OwnerOnly)
        .unwrap();

    // Two threads draining at once must still deliver one VCPU's events in
    // arrival order.
    for _ in 0..16 {
        for value in 0..64 {
            backend.send(0, RawEventKind::MsrWrite { msr: EFER_MSR, value });
        }
        let pumps: Vec<_> = (0..2)
            .map(|_| {
                let domain = domain.clone();
                std::thread::spawn(move || domain.process_pending_events().unwrap())
            })
            .collect();
        for pump in pumps {
            pump.join().unwrap();
        }

        let mut values = Vec::new();
        while let Some(event) = session.poll_event() {
            match event {
                VmiEvent::MsrAccess { value: Some(v), .. } => values.push(v),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(values, (0..64).collect::<Vec<u64>>());
    }
}

#[test]
fn test_failed_disarm_keeps_hook_registered() {
    let (backend, domain, session) = standard_domain();
    let mut hooks = Vec::new();
    for msr in 0..4u32 {
        hooks.push(
            session
                .register_hook(
                    HookClass::MsrAccess,
                    HookFilter::Register(msr),
                    DeliveryPolicy::OwnerOnly,
                )
                .unwrap(),
        );
    }

    backend.fail_next_disarm(HypervisorError::Call {
        op: "disarm_monitor",
    });
    assert!(matches!(
        session.unregister_hook(hooks[0]),
        Err(VmiError::Hypervisor(_))
    ));

    // The intercept is still armed, so its slot must still count as used.
    assert!(matches!(
        session.register_hook(
            HookClass::MsrAccess,
            HookFilter::Register(9),
            DeliveryPolicy::OwnerOnly
        ),
        Err(VmiError::ResourceExhausted {
            resource: "MSR intercept"
        })
    ));

    // And its events keep routing to the surviving registration.
    backend.send(0, RawEventKind::MsrWrite { msr: 0, value: 7 });
    domain.process_pending_events().unwrap();
    assert!(matches!(
        session.poll_event(),
        Some(VmiEvent::MsrAccess { msr: 0, .. })
    ));

    // A retried unregister frees the slot.
    session.unregister_hook(hooks[0]).unwrap();
    session
        .register_hook(
            HookClass::MsrAccess,
            HookFilter::Register(9),
            DeliveryPolicy::OwnerOnly,
        )
        .unwrap();
}

#[test]
fn test_observer_cannot_register_hooks() {
    let (_, domain, _session) = standard_domain();
    let observer = domain.attach_session(AccessMode::Observer).unwrap();
    assert!(matches!(
        observer.register_hook(HookClass::CpuidAccess, HookFilter::All, DeliveryPolicy::OwnerOnly),
        Err(VmiError::Concurrency(_))
    ));
}
