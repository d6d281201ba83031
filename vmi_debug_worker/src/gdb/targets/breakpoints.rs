// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::TargetArch;
use super::VmTarget;
use crate::gdb::targets::ToTargetResult;
use gdbstub::target;
use gdbstub::target::ext::breakpoints::WatchKind;
use gdbstub::target::TargetError;
use gdbstub::target::TargetResult;
use vmi_core_defs::x86::BreakpointSize;
use vmi_core_defs::BreakpointKey;
use vmi_core_defs::BreakpointKind;
use vmi_core_defs::VcpuScope;

impl<T: TargetArch> target::ext::breakpoints::Breakpoints for VmTarget<'_, T> {
    #[inline(always)]
    fn support_sw_breakpoint(
        &mut self,
    ) -> Option<target::ext::breakpoints::SwBreakpointOps<'_, Self>> {
        Some(self)
    }

    #[inline(always)]
    fn support_hw_breakpoint(
        &mut self,
    ) -> Option<target::ext::breakpoints::HwBreakpointOps<'_, Self>> {
        Some(self)
    }

    #[inline(always)]
    fn support_hw_watchpoint(
        &mut self,
    ) -> Option<target::ext::breakpoints::HwWatchpointOps<'_, Self>> {
        Some(self)
    }
}

fn key(address: u64, kind: BreakpointKind) -> BreakpointKey {
    // GDB breakpoints apply to every thread.
    BreakpointKey {
        address,
        scope: VcpuScope::Any,
        kind,
    }
}

impl<T: TargetArch> target::ext::breakpoints::SwBreakpoint for VmTarget<'_, T> {
    fn add_sw_breakpoint(&mut self, addr: T::Usize, _instr_len: usize) -> TargetResult<bool, Self> {
        self.0
            .session()
            .set_breakpoint(
                key(addr.into(), BreakpointKind::Software),
                BreakpointSize::Byte,
                false,
            )
            .nonfatal()?;
        Ok(true)
    }

    fn remove_sw_breakpoint(
        &mut self,
        addr: T::Usize,
        _instr_len: usize,
    ) -> TargetResult<bool, Self> {
        Ok(self
            .0
            .session()
            .clear_breakpoint_at(&key(addr.into(), BreakpointKind::Software))
            .nonfatal()?)
    }
}

impl<T: TargetArch> target::ext::breakpoints::HwBreakpoint for VmTarget<'_, T> {
    fn add_hw_breakpoint(
        &mut self,
        addr: T::Usize,
        _kind: T::BreakpointKind,
    ) -> TargetResult<bool, Self> {
        self.0
            .session()
            .set_breakpoint(
                key(addr.into(), BreakpointKind::Hardware),
                BreakpointSize::Byte,
                false,
            )
            .nonfatal()?;
        Ok(true)
    }

    fn remove_hw_breakpoint(
        &mut self,
        addr: T::Usize,
        _kind: T::BreakpointKind,
    ) -> TargetResult<bool, Self> {
        Ok(self
            .0
            .session()
            .clear_breakpoint_at(&key(addr.into(), BreakpointKind::Hardware))
            .nonfatal()?)
    }
}

impl<T: TargetArch> target::ext::breakpoints::HwWatchpoint for VmTarget<'_, T> {
    fn add_hw_watchpoint(
        &mut self,
        addr: T::Usize,
        len: T::Usize,
        kind: WatchKind,
    ) -> TargetResult<bool, Self> {
        let size: BreakpointSize = (len.into() as usize)
            .try_into()
            .map_err(|_| TargetError::NonFatal)?;
        self.0
            .session()
            .set_breakpoint(key(addr.into(), kind_from_watch_kind(kind)), size, false)
            .nonfatal()?;
        Ok(true)
    }

    fn remove_hw_watchpoint(
        &mut self,
        addr: T::Usize,
        _len: T::Usize,
        kind: WatchKind,
    ) -> TargetResult<bool, Self> {
        Ok(self
            .0
            .session()
            .clear_breakpoint_at(&key(addr.into(), kind_from_watch_kind(kind)))
            .nonfatal()?)
    }
}

fn kind_from_watch_kind(kind: WatchKind) -> BreakpointKind {
    match kind {
        WatchKind::Write => BreakpointKind::WatchWrite,
        WatchKind::Read => BreakpointKind::WatchRead,
        WatchKind::ReadWrite => BreakpointKind::WatchAccess,
    }
}
