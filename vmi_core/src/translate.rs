// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! x86-64 page table walking.

use crate::hypervisor::PhysicalMemory;
use vmi_core_defs::error::TranslationError;
use vmi_core_defs::x86::Pte;
use vmi_core_defs::x86::VcpuState;
use vmi_core_defs::x86::X64_CR0_PG;
use vmi_core_defs::x86::X64_CR4_LA57;
use vmi_core_defs::x86::X64_CR4_PAE;
use vmi_core_defs::x86::X64_CR4_PSE;
use vmi_core_defs::x86::X64_EFER_LMA;
use vmi_core_defs::x86::X64_EFER_NXE;
use vmi_core_defs::PageBacking;
use vmi_core_defs::PagePermissions;

/// Registers needed to walk the page table.
#[derive(Debug, Clone)]
pub struct TranslationRegisters {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

impl TranslationRegisters {
    pub fn from_vcpu(state: &VcpuState) -> Self {
        Self {
            cr0: state.cr0,
            cr3: state.cr3,
            cr4: state.cr4,
            efer: state.efer,
        }
    }
}

/// Flags to control the page table walk.
#[derive(Debug, Clone, Default)]
pub struct TranslateFlags {
    /// Fail unless the page is readable.
    pub validate_read: bool,
    /// Fail unless the page is writable.
    pub validate_write: bool,
    /// Fail unless the page is executable.
    pub validate_execute: bool,
}

/// Result of translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateResult {
    /// The translated GPA.
    pub gpa: u64,
    /// Effective permissions accumulated across the walk.
    pub perms: PagePermissions,
}

/// Translate a GVA by walking the VP's page tables.
///
/// Failures carry the reason the caller needs for retry decisions: a
/// non-present entry whose swap bookkeeping the backing store confirms is
/// [`TranslationError::NotResident`] (the guest can bring the page back in),
/// a zero or otherwise unbacked entry or a non-canonical address is
/// [`TranslationError::NotMapped`], and an unreadable page-table page is
/// [`TranslationError::PageTableWalkFault`].
pub fn translate_gva_to_gpa<M: PhysicalMemory + ?Sized>(
    mem: &M,
    gva: u64,
    registers: &TranslationRegisters,
    mut flags: TranslateFlags,
) -> Result<TranslateResult, TranslationError> {
    tracing::trace!(gva, ?registers, ?flags, "translating gva");

    let long_mode = registers.efer & X64_EFER_LMA != 0;
    // Truncate the address if operating in 32-bit mode.
    let gva = if long_mode { gva } else { gva as u32 as u64 };

    // If paging is disabled, the GVA is the GPA.
    if registers.cr0 & X64_CR0_PG == 0 {
        return Ok(TranslateResult {
            gpa: gva,
            perms: PagePermissions::RWX,
        });
    }

    let address_bits;
    let large_pte;
    if long_mode {
        large_pte = true;
        address_bits = if registers.cr4 & X64_CR4_LA57 != 0 {
            57
        } else {
            48
        };

        if !is_canonical_address(gva, address_bits) {
            return Err(TranslationError::NotMapped);
        }
    } else if registers.cr4 & X64_CR4_PAE != 0 {
        large_pte = true;
        // Only 32 bits are used from the input address; higher bits are
        // zeroed above. Bits 30..32 index the PDP table on x86, but for
        // simplicity the code below uses the full 9-bit range 30..39.
        address_bits = 39;
    } else {
        large_pte = false;
        address_bits = 32;
    }

    if registers.efer & X64_EFER_NXE == 0 {
        flags.validate_execute = false;
    }

    let mut perms = PagePermissions::RWX;
    let mut gpa_base = registers.cr3 & !0xfff;
    let mut remaining_bits: u32 = address_bits;
    loop {
        // Compute the PTE address.
        let pte_address = if large_pte {
            // Consume the next 9 bits as an index into the table.
            remaining_bits -= 9;
            gpa_base + (((gva >> remaining_bits) & 0x1ff) * 8)
        } else {
            // Consume the next 10 bits as an index into the table.
            remaining_bits -= 10;
            gpa_base + (((gva >> remaining_bits) & 0x3ff) * 4)
        };

        let pte = read_pte(mem, pte_address, large_pte)
            .map_err(|_| TranslationError::PageTableWalkFault)?;
        gpa_base = pte.pfn() << 12;

        if !pte.present() {
            tracing::trace!(pte_address, ?pte, "page not present");
            // A non-present entry with leftover bits is the paging
            // structure's swap bookkeeping; a zero entry is no mapping at
            // all.
            return if u64::from(pte) != 0
                && mem.page_backing(pte.address()) == PageBacking::Swapped
            {
                Err(TranslationError::NotResident)
            } else {
                Err(TranslationError::NotMapped)
            };
        }

        if !pte.read_write() {
            perms.write = false;
        }
        if pte.no_execute() && registers.efer & X64_EFER_NXE != 0 {
            perms.execute = false;
        }

        if (flags.validate_read && !perms.read)
            || (flags.validate_write && !perms.write)
            || (flags.validate_execute && !perms.execute)
        {
            return Err(TranslationError::NotMapped);
        }

        // Determine whether this is the terminal PTE: either the last level,
        // or a directory entry with the page-size bit set.
        let done =
            remaining_bits == 12 || (registers.cr4 & (X64_CR4_PAE | X64_CR4_PSE) != 0 && pte.pat());

        if done {
            break;
        }
    }

    // The bits that didn't get used for page table indexes form the offset
    // into the page (of whatever size).
    let address_mask = !0 << remaining_bits;
    Ok(TranslateResult {
        gpa: (gpa_base & address_mask) | (gva & !address_mask),
        perms,
    })
}

fn read_pte<M: PhysicalMemory + ?Sized>(
    mem: &M,
    pte_address: u64,
    large_pte: bool,
) -> Result<Pte, vmi_core_defs::error::HypervisorError> {
    if large_pte {
        let mut buf = [0; 8];
        mem.read_physical(pte_address, &mut buf)?;
        Ok(Pte::from(u64::from_le_bytes(buf)))
    } else {
        let mut buf = [0; 4];
        mem.read_physical(pte_address, &mut buf)?;
        Ok(Pte::from(u32::from_le_bytes(buf) as u64))
    }
}

/// Returns whether a virtual address is canonical. On x86-64, this means that
/// the N top unused bits are equal to the top used bit, where N is 64 minus
/// the number of effective address bits (48 or 57).
fn is_canonical_address(gva: u64, address_bits: u32) -> bool {
    // Shift out the address bits that aren't part of the check, sign
    // extending. This makes the subsequent check an easy comparison.
    let high_bits = (gva as i64) >> (address_bits - 1);
    high_bits == 0 || high_bits == -1
}
