// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Snapshot capture, restore, and the serialized snapshot format.
//!
//! A snapshot holds every VCPU register file, the contents of resident
//! guest memory regions, and the breakpoint and hook tables, captured while
//! the domain is paused. The memory image is clean: software breakpoint
//! patch sites hold the original instruction bytes, never the trap byte.
//! On restore the tables are re-applied against the restored image; stale
//! patch bookkeeping is never carried across a restore.
//!
//! The wire format is little-endian, fixed-layout structs via zerocopy. The
//! register layout is versioned; a mismatched version is rejected before any
//! guest state is touched.

use crate::breakpoints::TRAP_INSTRUCTION;
use crate::engine::DomainInner;
use crate::hypervisor::HypervisorBackend;
use crate::translate::translate_gva_to_gpa;
use crate::translate::TranslateFlags;
use crate::translate::TranslationRegisters;
use std::mem::size_of;
use vmi_core_defs::error::VmiError;
use vmi_core_defs::x86::BreakpointSize;
use vmi_core_defs::x86::SegmentAttributes;
use vmi_core_defs::x86::SegmentRegister;
use vmi_core_defs::x86::VcpuState;
use vmi_core_defs::BreakpointKey;
use vmi_core_defs::BreakpointKind;
use vmi_core_defs::DeliveryPolicy;
use vmi_core_defs::DomainId;
use vmi_core_defs::HookClass;
use vmi_core_defs::HookFilter;
use vmi_core_defs::HookId;
use vmi_core_defs::MemoryRegion;
use vmi_core_defs::PageBacking;
use vmi_core_defs::PagePermissions;
use vmi_core_defs::SessionId;
use vmi_core_defs::VcpuScope;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// "XVMISNAP", little endian.
const SNAPSHOT_MAGIC: u64 = 0x50414e53494d5658;

/// Version of the serialized [`VcpuState`] layout.
const REGISTER_LAYOUT_VERSION: u32 = 1;

/// A breakpoint's identity and policy, as carried by a snapshot. Enough to
/// re-apply the breakpoint against a restored memory image.
#[derive(Debug, Copy, Clone)]
pub(crate) struct BreakpointSpec {
    pub key: BreakpointKey,
    pub size: BreakpointSize,
    pub enabled: bool,
    pub shared: bool,
}

/// A hook registration, as carried by a snapshot.
#[derive(Debug, Copy, Clone)]
pub(crate) struct HookSpec {
    pub class: HookClass,
    pub filter: HookFilter,
    pub delivery: DeliveryPolicy,
}

/// A captured domain snapshot.
pub(crate) struct Snapshot {
    pub domain_id: DomainId,
    pub timestamp: u64,
    pub vcpus: Vec<VcpuState>,
    /// Region descriptors with their contents. Non-resident regions carry no
    /// contents.
    pub regions: Vec<(MemoryRegion, Vec<u8>)>,
    pub breakpoints: Vec<BreakpointSpec>,
    pub hooks: Vec<HookSpec>,
}

/// Captures the paused domain's registers, resident memory, and tables.
pub(crate) fn capture(
    inner: &DomainInner,
    backend: &dyn HypervisorBackend,
    domain_id: DomainId,
) -> Result<Snapshot, VmiError> {
    let vp_count = backend.vp_count();
    let mut vcpus = Vec::with_capacity(vp_count as usize);
    for vp in 0..vp_count {
        vcpus.push(*backend.vp_state(vp)?);
    }

    let mut regions = Vec::new();
    for region in backend.memory_regions() {
        let contents = if region.backing == PageBacking::Resident {
            let mut buf = vec![0; region.len as usize];
            backend.read_physical(region.start, &mut buf)?;
            buf
        } else {
            Vec::new()
        };
        regions.push((region, contents));
    }

    // The captured image must hold the guest's own instructions, not the
    // engine's trap bytes. Substitute the saved original at each patch site.
    for record in inner.breakpoints.iter() {
        if let (Some(gpa), Some(byte)) = (record.patch_gpa, record.saved_byte) {
            for (region, contents) in &mut regions {
                if region.contains(gpa) && !contents.is_empty() {
                    contents[(gpa - region.start) as usize] = byte;
                }
            }
        }
    }

    let breakpoints = inner
        .breakpoints
        .iter()
        .map(|r| BreakpointSpec {
            key: r.key,
            size: r.hw.map(|hw| hw.size).unwrap_or(BreakpointSize::Byte),
            enabled: r.enabled,
            shared: r.shared,
        })
        .collect();
    let hooks = inner
        .hooks
        .iter()
        .map(|h| HookSpec {
            class: h.class,
            filter: h.filter,
            delivery: h.delivery,
        })
        .collect();

    Ok(Snapshot {
        domain_id,
        timestamp: unix_now(),
        vcpus,
        regions,
        breakpoints,
        hooks,
    })
}

/// Restores `snap` into the paused domain, re-applying its breakpoints and
/// hooks against the restored memory. On failure the breakpoint table is
/// rolled back to empty with all partial patches reverted; guest registers
/// and memory may already reflect the snapshot.
pub(crate) fn restore(
    inner: &mut DomainInner,
    backend: &dyn HypervisorBackend,
    snap: &Snapshot,
    owner: SessionId,
) -> Result<(), VmiError> {
    if snap.vcpus.len() != backend.vp_count() as usize {
        return Err(VmiError::Protocol(format!(
            "snapshot has {} vcpus, domain has {}",
            snap.vcpus.len(),
            backend.vp_count()
        )));
    }

    for (vp, state) in snap.vcpus.iter().enumerate() {
        backend.set_vp_state(vp as u32, state)?;
    }
    for (region, contents) in &snap.regions {
        if !contents.is_empty() {
            backend.write_physical(region.start, contents)?;
        }
    }

    // The old tables describe patches and intercepts that no longer match
    // the replaced state. Drop the hook registrations properly; the
    // breakpoint records are dropped without unpatching, since their patch
    // sites were just overwritten.
    let old_hooks: Vec<HookId> = inner.hooks.iter().map(|h| h.id).collect();
    for hook in old_hooks {
        if let Err(err) = inner.hooks.unregister(backend, hook) {
            tracing::error!(
                hook = hook.0,
                error = &err as &dyn std::error::Error,
                "failed to disarm hook during restore"
            );
        }
    }
    inner.breakpoints.clear();

    let mut applied_patches: Vec<(u64, u8)> = Vec::new();
    let mut applied_hooks: Vec<HookId> = Vec::new();
    let result = (|| -> Result<(), VmiError> {
        for spec in &snap.breakpoints {
            match spec.key.kind {
                BreakpointKind::Software => {
                    let vp = match spec.key.scope {
                        VcpuScope::Vcpu(vp) => vp,
                        VcpuScope::Any => 0,
                    };
                    let state = snap.vcpus.get(vp as usize).ok_or_else(|| {
                        VmiError::Protocol("snapshot breakpoint scope out of range".into())
                    })?;
                    let registers = TranslationRegisters::from_vcpu(state);
                    let gpa = translate_gva_to_gpa(
                        backend,
                        spec.key.address,
                        &registers,
                        TranslateFlags::default(),
                    )?
                    .gpa;
                    let mut original = [0u8; 1];
                    backend.read_physical(gpa, &mut original)?;
                    if spec.enabled {
                        backend.write_physical(gpa, &[TRAP_INSTRUCTION])?;
                        applied_patches.push((gpa, original[0]));
                    }
                    let id = inner
                        .breakpoints
                        .insert_software(owner, spec.key, original[0], gpa, spec.shared);
                    if !spec.enabled {
                        if let Some(record) = inner.breakpoints.get_mut(id) {
                            record.enabled = false;
                        }
                    }
                }
                _ => {
                    let id =
                        inner
                            .breakpoints
                            .insert_hardware(owner, spec.key, spec.size, spec.shared)?;
                    if !spec.enabled {
                        if let Some(record) = inner.breakpoints.get_mut(id) {
                            record.enabled = false;
                        }
                    }
                }
            }
        }
        for spec in &snap.hooks {
            let id = inner
                .hooks
                .register(backend, owner, spec.class, spec.filter, spec.delivery)?;
            applied_hooks.push(id);
        }
        Ok(())
    })();

    if let Err(err) = result {
        tracing::error!(
            error = &err as &dyn std::error::Error,
            "snapshot restore failed, rolling back tables"
        );
        for &(gpa, byte) in &applied_patches {
            if let Err(revert_err) = backend.write_physical(gpa, &[byte]) {
                tracing::error!(
                    gpa,
                    error = &revert_err as &dyn std::error::Error,
                    "failed to revert patch during rollback"
                );
            }
        }
        inner.breakpoints.clear();
        for hook in applied_hooks {
            if let Err(revert_err) = inner.hooks.unregister(backend, hook) {
                tracing::error!(
                    hook = hook.0,
                    error = &revert_err as &dyn std::error::Error,
                    "failed to disarm hook during rollback"
                );
            }
        }
        return Err(err);
    }

    // Refresh the debug registers from the rebuilt table so the next resume
    // runs with the snapshot's hardware breakpoints.
    for vp in 0..backend.vp_count() {
        let ds = inner.breakpoints.debug_state(vp, false);
        if let Err(err) = backend.set_debug_state(vp, &ds) {
            tracing::error!(
                vp,
                error = &err as &dyn std::error::Error,
                "failed to refresh debug state after restore"
            );
        }
    }
    Ok(())
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn truncated() -> VmiError {
    VmiError::Protocol("truncated snapshot".into())
}

/// Rejects a wire count that could not possibly fit in the remaining input.
fn checked_count<T>(count: u32, remaining: &[u8]) -> Result<usize, VmiError> {
    let count = count as usize;
    if count > remaining.len() / size_of::<T>() {
        return Err(truncated());
    }
    Ok(count)
}

#[repr(C)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
struct SnapshotHeader {
    magic: u64,
    version: u32,
    domain_id: u32,
    timestamp: u64,
    vp_count: u32,
    region_count: u32,
    breakpoint_count: u32,
    hook_count: u32,
}

#[repr(C)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
struct SegBlob {
    base: u64,
    limit: u32,
    selector: u16,
    attributes: u16,
}

impl SegBlob {
    fn from_reg(reg: &SegmentRegister) -> Self {
        Self {
            base: reg.base,
            limit: reg.limit,
            selector: reg.selector,
            attributes: reg.attributes.as_bits(),
        }
    }

    fn to_reg(&self) -> SegmentRegister {
        SegmentRegister {
            base: self.base,
            limit: self.limit,
            selector: self.selector,
            attributes: SegmentAttributes::from(self.attributes),
        }
    }
}

#[repr(C)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
struct VcpuBlob {
    xmm: [u128; 16],
    gp: [u64; 16],
    rip: u64,
    rflags: u64,
    cr0: u64,
    cr2: u64,
    cr3: u64,
    cr4: u64,
    cr8: u64,
    efer: u64,
    kernel_gs_base: u64,
    segs: [SegBlob; 6],
    mxcsr: u32,
    _pad: u32,
}

impl VcpuBlob {
    fn from_state(state: &VcpuState) -> Self {
        Self {
            xmm: state.xmm,
            gp: state.gp,
            rip: state.rip,
            rflags: state.rflags,
            cr0: state.cr0,
            cr2: state.cr2,
            cr3: state.cr3,
            cr4: state.cr4,
            cr8: state.cr8,
            efer: state.efer,
            kernel_gs_base: state.kernel_gs_base,
            segs: [
                SegBlob::from_reg(&state.es),
                SegBlob::from_reg(&state.cs),
                SegBlob::from_reg(&state.ss),
                SegBlob::from_reg(&state.ds),
                SegBlob::from_reg(&state.fs),
                SegBlob::from_reg(&state.gs),
            ],
            mxcsr: state.mxcsr,
            _pad: 0,
        }
    }

    fn to_state(&self) -> VcpuState {
        VcpuState {
            gp: self.gp,
            rip: self.rip,
            rflags: self.rflags,
            cr0: self.cr0,
            cr2: self.cr2,
            cr3: self.cr3,
            cr4: self.cr4,
            cr8: self.cr8,
            efer: self.efer,
            kernel_gs_base: self.kernel_gs_base,
            es: self.segs[0].to_reg(),
            cs: self.segs[1].to_reg(),
            ss: self.segs[2].to_reg(),
            ds: self.segs[3].to_reg(),
            fs: self.segs[4].to_reg(),
            gs: self.segs[5].to_reg(),
            xmm: self.xmm,
            mxcsr: self.mxcsr,
        }
    }
}

#[repr(C)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
struct RegionBlob {
    start: u64,
    len: u64,
    content_len: u64,
    read: u8,
    write: u8,
    execute: u8,
    backing: u8,
    _pad: [u8; 4],
}

impl RegionBlob {
    fn from_region(region: &MemoryRegion, content_len: u64) -> Self {
        Self {
            start: region.start,
            len: region.len,
            content_len,
            read: region.perms.read as u8,
            write: region.perms.write as u8,
            execute: region.perms.execute as u8,
            backing: match region.backing {
                PageBacking::Resident => 0,
                PageBacking::Swapped => 1,
                PageBacking::Unmapped => 2,
            },
            _pad: [0; 4],
        }
    }

    fn to_region(&self) -> Result<MemoryRegion, VmiError> {
        Ok(MemoryRegion {
            start: self.start,
            len: self.len,
            perms: PagePermissions {
                read: self.read != 0,
                write: self.write != 0,
                execute: self.execute != 0,
            },
            backing: match self.backing {
                0 => PageBacking::Resident,
                1 => PageBacking::Swapped,
                2 => PageBacking::Unmapped,
                other => {
                    return Err(VmiError::Protocol(format!(
                        "unknown region backing {other}"
                    )))
                }
            },
        })
    }
}

#[repr(C)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
struct BreakpointBlob {
    address: u64,
    scope_vp: u32,
    scope_any: u8,
    kind: u8,
    size: u8,
    enabled: u8,
    shared: u8,
    _pad: [u8; 7],
}

impl BreakpointBlob {
    fn from_spec(spec: &BreakpointSpec) -> Self {
        let (scope_any, scope_vp) = match spec.key.scope {
            VcpuScope::Any => (1, 0),
            VcpuScope::Vcpu(vp) => (0, vp),
        };
        Self {
            address: spec.key.address,
            scope_vp,
            scope_any,
            kind: match spec.key.kind {
                BreakpointKind::Software => 0,
                BreakpointKind::Hardware => 1,
                BreakpointKind::WatchRead => 2,
                BreakpointKind::WatchWrite => 3,
                BreakpointKind::WatchAccess => 4,
            },
            size: match spec.size {
                BreakpointSize::Byte => 1,
                BreakpointSize::Word => 2,
                BreakpointSize::DWord => 4,
                BreakpointSize::QWord => 8,
            },
            enabled: spec.enabled as u8,
            shared: spec.shared as u8,
            _pad: [0; 7],
        }
    }

    fn to_spec(&self) -> Result<BreakpointSpec, VmiError> {
        let kind = match self.kind {
            0 => BreakpointKind::Software,
            1 => BreakpointKind::Hardware,
            2 => BreakpointKind::WatchRead,
            3 => BreakpointKind::WatchWrite,
            4 => BreakpointKind::WatchAccess,
            other => {
                return Err(VmiError::Protocol(format!(
                    "unknown breakpoint kind {other}"
                )))
            }
        };
        let size = BreakpointSize::try_from(self.size as usize)
            .map_err(|_| VmiError::Protocol(format!("unknown breakpoint size {}", self.size)))?;
        Ok(BreakpointSpec {
            key: BreakpointKey {
                address: self.address,
                scope: if self.scope_any != 0 {
                    VcpuScope::Any
                } else {
                    VcpuScope::Vcpu(self.scope_vp)
                },
                kind,
            },
            size,
            enabled: self.enabled != 0,
            shared: self.shared != 0,
        })
    }
}

#[repr(C)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
struct HookBlob {
    filter_value: u64,
    class: u8,
    filter_kind: u8,
    delivery: u8,
    _pad: [u8; 5],
}

impl HookBlob {
    fn from_spec(spec: &HookSpec) -> Self {
        let (filter_kind, filter_value) = match spec.filter {
            HookFilter::All => (0, 0),
            HookFilter::Register(msr) => (1, msr as u64),
            HookFilter::Address(gva) => (2, gva),
        };
        Self {
            filter_value,
            class: match spec.class {
                HookClass::MsrAccess => 0,
                HookClass::CpuidAccess => 1,
                HookClass::PageFault => 2,
            },
            filter_kind,
            delivery: match spec.delivery {
                DeliveryPolicy::OwnerOnly => 0,
                DeliveryPolicy::Broadcast => 1,
            },
            _pad: [0; 5],
        }
    }

    fn to_spec(&self) -> Result<HookSpec, VmiError> {
        Ok(HookSpec {
            class: match self.class {
                0 => HookClass::MsrAccess,
                1 => HookClass::CpuidAccess,
                2 => HookClass::PageFault,
                other => return Err(VmiError::Protocol(format!("unknown hook class {other}"))),
            },
            filter: match self.filter_kind {
                0 => HookFilter::All,
                1 => HookFilter::Register(self.filter_value as u32),
                2 => HookFilter::Address(self.filter_value),
                other => {
                    return Err(VmiError::Protocol(format!("unknown hook filter {other}")))
                }
            },
            delivery: match self.delivery {
                0 => DeliveryPolicy::OwnerOnly,
                1 => DeliveryPolicy::Broadcast,
                other => {
                    return Err(VmiError::Protocol(format!(
                        "unknown delivery policy {other}"
                    )))
                }
            },
        })
    }
}

impl Snapshot {
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let header = SnapshotHeader {
            magic: SNAPSHOT_MAGIC,
            version: REGISTER_LAYOUT_VERSION,
            domain_id: self.domain_id.0,
            timestamp: self.timestamp,
            vp_count: self.vcpus.len() as u32,
            region_count: self.regions.len() as u32,
            breakpoint_count: self.breakpoints.len() as u32,
            hook_count: self.hooks.len() as u32,
        };
        let mut bytes = Vec::new();
        bytes.extend_from_slice(header.as_bytes());
        for vcpu in &self.vcpus {
            bytes.extend_from_slice(VcpuBlob::from_state(vcpu).as_bytes());
        }
        for (region, contents) in &self.regions {
            bytes.extend_from_slice(
                RegionBlob::from_region(region, contents.len() as u64).as_bytes(),
            );
            bytes.extend_from_slice(contents);
        }
        for spec in &self.breakpoints {
            bytes.extend_from_slice(BreakpointBlob::from_spec(spec).as_bytes());
        }
        for spec in &self.hooks {
            bytes.extend_from_slice(HookBlob::from_spec(spec).as_bytes());
        }
        bytes
    }

    pub(crate) fn from_bytes(mut bytes: &[u8]) -> Result<Self, VmiError> {
        let (header, rest) = SnapshotHeader::read_from_prefix(bytes).map_err(|_| truncated())?;
        bytes = rest;
        if header.magic != SNAPSHOT_MAGIC {
            return Err(VmiError::Protocol("bad snapshot magic".into()));
        }
        if header.version != REGISTER_LAYOUT_VERSION {
            return Err(VmiError::Protocol(format!(
                "unsupported snapshot version {}",
                header.version
            )));
        }

        // The counts come off the wire. Each must fit in the bytes actually
        // present before an allocation is sized from it.
        let vp_count = checked_count::<VcpuBlob>(header.vp_count, bytes)?;
        let mut vcpus = Vec::with_capacity(vp_count);
        for _ in 0..header.vp_count {
            let (blob, rest) = VcpuBlob::read_from_prefix(bytes).map_err(|_| truncated())?;
            bytes = rest;
            vcpus.push(blob.to_state());
        }

        let region_count = checked_count::<RegionBlob>(header.region_count, bytes)?;
        let mut regions = Vec::with_capacity(region_count);
        for _ in 0..header.region_count {
            let (blob, rest) = RegionBlob::read_from_prefix(bytes).map_err(|_| truncated())?;
            bytes = rest;
            let content_len = blob.content_len as usize;
            if bytes.len() < content_len {
                return Err(truncated());
            }
            let (contents, rest) = bytes.split_at(content_len);
            bytes = rest;
            regions.push((blob.to_region()?, contents.to_vec()));
        }

        let breakpoint_count = checked_count::<BreakpointBlob>(header.breakpoint_count, bytes)?;
        let mut breakpoints = Vec::with_capacity(breakpoint_count);
        for _ in 0..header.breakpoint_count {
            let (blob, rest) = BreakpointBlob::read_from_prefix(bytes).map_err(|_| truncated())?;
            bytes = rest;
            breakpoints.push(blob.to_spec()?);
        }

        let hook_count = checked_count::<HookBlob>(header.hook_count, bytes)?;
        let mut hooks = Vec::with_capacity(hook_count);
        for _ in 0..header.hook_count {
            let (blob, rest) = HookBlob::read_from_prefix(bytes).map_err(|_| truncated())?;
            bytes = rest;
            hooks.push(blob.to_spec()?);
        }

        Ok(Snapshot {
            domain_id: DomainId(header.domain_id),
            timestamp: header.timestamp,
            vcpus,
            regions,
            breakpoints,
            hooks,
        })
    }
}
