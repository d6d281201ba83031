// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Page table walks against the mock backend's long-mode tables.

use crate::common::MockBackend;
use crate::common::CODE_GPA;
use crate::common::CODE_GVA;
use crate::common::PAGE_TABLE_BASE;
use vmi_core::translate::translate_gva_to_gpa;
use vmi_core::translate::TranslateFlags;
use vmi_core::translate::TranslationRegisters;
use vmi_core_defs::error::TranslationError;
use vmi_core_defs::x86::X64_CR0_PE;
use vmi_core_defs::x86::X64_CR0_PG;
use vmi_core_defs::x86::X64_CR4_PAE;
use vmi_core_defs::x86::X64_EFER_LMA;
use vmi_core_defs::x86::X64_EFER_NXE;

fn long_mode() -> TranslationRegisters {
    TranslationRegisters {
        cr0: X64_CR0_PE | X64_CR0_PG,
        cr3: PAGE_TABLE_BASE,
        cr4: X64_CR4_PAE,
        efer: X64_EFER_LMA,
    }
}

#[test]
fn test_mapped_page() {
    let backend = MockBackend::new(1);
    backend.map_page(CODE_GVA, CODE_GPA);

    let result =
        translate_gva_to_gpa(&backend, CODE_GVA + 0x123, &long_mode(), TranslateFlags::default())
            .unwrap();
    assert_eq!(result.gpa, CODE_GPA + 0x123);
    assert!(result.perms.write);
    assert!(result.perms.execute);
}

#[test]
fn test_paging_disabled_is_identity() {
    let backend = MockBackend::new(1);
    let registers = TranslationRegisters {
        cr0: X64_CR0_PE,
        cr3: 0,
        cr4: 0,
        efer: 0,
    };
    let result =
        translate_gva_to_gpa(&backend, 0x1234_5678, &registers, TranslateFlags::default())
            .unwrap();
    assert_eq!(result.gpa, 0x1234_5678);
}

#[test]
fn test_unmapped_address() {
    let backend = MockBackend::new(1);
    backend.map_page(CODE_GVA, CODE_GPA);

    assert_eq!(
        translate_gva_to_gpa(&backend, 0x7000_0000, &long_mode(), TranslateFlags::default()),
        Err(TranslationError::NotMapped)
    );
}

#[test]
fn test_non_canonical_address() {
    let backend = MockBackend::new(1);
    assert_eq!(
        translate_gva_to_gpa(
            &backend,
            0x0000_9000_0000_0000,
            &long_mode(),
            TranslateFlags::default()
        ),
        Err(TranslationError::NotMapped)
    );
}

#[test]
fn test_swapped_page_is_not_resident() {
    let backend = MockBackend::new(1);
    backend.map_swapped(CODE_GVA);

    assert_eq!(
        translate_gva_to_gpa(&backend, CODE_GVA, &long_mode(), TranslateFlags::default()),
        Err(TranslationError::NotResident)
    );
}

#[test]
fn test_read_only_page() {
    let backend = MockBackend::new(1);
    backend.map_page_flags(CODE_GVA, CODE_GPA, false, false);

    let result =
        translate_gva_to_gpa(&backend, CODE_GVA, &long_mode(), TranslateFlags::default()).unwrap();
    assert!(!result.perms.write);

    let flags = TranslateFlags {
        validate_write: true,
        ..TranslateFlags::default()
    };
    assert_eq!(
        translate_gva_to_gpa(&backend, CODE_GVA, &long_mode(), flags),
        Err(TranslationError::NotMapped)
    );
}

#[test]
fn test_no_execute_page() {
    let backend = MockBackend::new(1);
    backend.map_page_flags(CODE_GVA, CODE_GPA, true, true);

    let mut registers = long_mode();
    registers.efer |= X64_EFER_NXE;

    let result =
        translate_gva_to_gpa(&backend, CODE_GVA, &registers, TranslateFlags::default()).unwrap();
    assert!(!result.perms.execute);

    let flags = TranslateFlags {
        validate_execute: true,
        ..TranslateFlags::default()
    };
    assert_eq!(
        translate_gva_to_gpa(&backend, CODE_GVA, &registers, flags),
        Err(TranslationError::NotMapped)
    );

    // Without NXE the bit is architecturally ignored.
    assert!(
        translate_gva_to_gpa(&backend, CODE_GVA, &long_mode(), TranslateFlags::default())
            .unwrap()
            .perms
            .execute
    );
}

#[test]
fn test_walk_fault_on_unreadable_table() {
    let backend = MockBackend::new(1);
    let registers = TranslationRegisters {
        // CR3 pointing outside the memory image fails the first table read.
        cr3: 0x4000_0000,
        ..long_mode()
    };
    assert_eq!(
        translate_gva_to_gpa(&backend, CODE_GVA, &registers, TranslateFlags::default()),
        Err(TranslationError::PageTableWalkFault)
    );
}
