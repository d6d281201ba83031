// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-domain event hook registry.
//!
//! Hooks are typed subscriptions to hypervisor event classes. MSR hooks are
//! backed by capacity-limited hardware intercept slots; registration beyond
//! capacity fails with `ResourceExhausted` rather than silently falling back
//! to software emulation. All mutation goes through the introspection engine
//! under the domain lock.

use crate::hypervisor::HypervisorBackend;
use std::collections::BTreeMap;
use vmi_core_defs::error::VmiError;
use vmi_core_defs::event::RawEventKind;
use vmi_core_defs::DeliveryPolicy;
use vmi_core_defs::HookClass;
use vmi_core_defs::HookFilter;
use vmi_core_defs::HookId;
use vmi_core_defs::SessionId;

#[derive(Debug, Clone)]
pub(crate) struct HookRecord {
    pub id: HookId,
    pub class: HookClass,
    pub filter: HookFilter,
    pub delivery: DeliveryPolicy,
    pub owner: SessionId,
}

pub struct HookManager {
    hooks: BTreeMap<HookId, HookRecord>,
    msr_capacity: usize,
    msr_in_use: usize,
    next_id: u64,
}

impl HookManager {
    pub(crate) fn new(msr_capacity: usize) -> Self {
        Self {
            hooks: BTreeMap::new(),
            msr_capacity,
            msr_in_use: 0,
            next_id: 1,
        }
    }

    /// Registers a hook and arms the matching hypervisor intercept.
    pub(crate) fn register(
        &mut self,
        backend: &dyn HypervisorBackend,
        owner: SessionId,
        class: HookClass,
        filter: HookFilter,
        delivery: DeliveryPolicy,
    ) -> Result<HookId, VmiError> {
        if class == HookClass::MsrAccess && self.msr_in_use == self.msr_capacity {
            return Err(VmiError::ResourceExhausted {
                resource: "MSR intercept",
            });
        }

        backend.arm_monitor(class, filter)?;
        if class == HookClass::MsrAccess {
            self.msr_in_use += 1;
        }

        let id = HookId(self.next_id);
        self.next_id += 1;
        self.hooks.insert(
            id,
            HookRecord {
                id,
                class,
                filter,
                delivery,
                owner,
            },
        );
        Ok(id)
    }

    /// Unregisters a hook and disarms its intercept. The record and its slot
    /// accounting are only dropped once the disarm lands; a failed disarm
    /// leaves the registration intact for a retry.
    pub(crate) fn unregister(
        &mut self,
        backend: &dyn HypervisorBackend,
        id: HookId,
    ) -> Result<(), VmiError> {
        let (class, filter) = {
            let record = self.hooks.get(&id).ok_or_else(|| {
                VmiError::Consistency(format!("unregister of unknown hook {id:?}"))
            })?;
            (record.class, record.filter)
        };
        backend.disarm_monitor(class, filter)?;
        self.hooks.remove(&id);
        if class == HookClass::MsrAccess {
            self.msr_in_use -= 1;
        }
        Ok(())
    }

    /// Hooks matching a raw event, in registration order.
    pub(crate) fn matches(&self, kind: &RawEventKind) -> Vec<&HookRecord> {
        self.hooks
            .values()
            .filter(|record| match (record.class, kind) {
                (HookClass::MsrAccess, RawEventKind::MsrRead { msr })
                | (HookClass::MsrAccess, RawEventKind::MsrWrite { msr, .. }) => {
                    match record.filter {
                        HookFilter::All => true,
                        HookFilter::Register(want) => want == *msr,
                        HookFilter::Address(_) => false,
                    }
                }
                (HookClass::CpuidAccess, RawEventKind::CpuidAccess { .. }) => {
                    matches!(record.filter, HookFilter::All)
                }
                (HookClass::PageFault, RawEventKind::PageFault { gva, .. }) => {
                    match record.filter {
                        HookFilter::All => true,
                        HookFilter::Address(want) => want >> 12 == gva >> 12,
                        HookFilter::Register(_) => false,
                    }
                }
                _ => false,
            })
            .collect()
    }

    /// Ids of the hooks `owner` registered.
    pub(crate) fn owned_by(&self, owner: SessionId) -> Vec<HookId> {
        self.hooks
            .values()
            .filter(|r| r.owner == owner)
            .map(|r| r.id)
            .collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &HookRecord> {
        self.hooks.values()
    }
}
