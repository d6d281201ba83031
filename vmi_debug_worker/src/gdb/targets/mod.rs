// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::SessionProxy;
use gdbstub::target::Target;
use gdbstub::target::TargetError;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ops::DerefMut;
use vmi_core_defs::x86::VcpuState;

mod base;
mod breakpoints;
mod target_x86_64;

pub trait ToTargetResult<T, E> {
    fn fatal(self) -> Result<T, TargetError<E>>;
    fn nonfatal(self) -> Result<T, TargetError<E>>;
}

impl<T, E> ToTargetResult<T, anyhow::Error> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn fatal(self) -> Result<T, TargetError<anyhow::Error>> {
        self.map_err(|err| {
            let err: anyhow::Error = err.into();
            tracing::error!(
                error = err.as_ref() as &dyn std::error::Error,
                "gdb fatal error"
            );
            TargetError::Fatal(err)
        })
    }

    fn nonfatal(self) -> Result<T, TargetError<anyhow::Error>> {
        self.map_err(|err| {
            let err = err.into();
            tracing::warn!(
                error = err.as_ref() as &dyn std::error::Error,
                "gdb nonfatal error"
            );
            TargetError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
        })
    }
}

pub struct ArchError;

impl<E> From<ArchError> for TargetError<E> {
    fn from(_: ArchError) -> Self {
        TargetError::NonFatal
    }
}

/// Architecture-specific handling.
pub trait TargetArch:
    gdbstub::arch::Arch<Usize = Self::Address, BreakpointKind = usize> + Sized
{
    type Address: Copy + Into<u64> + TryFrom<u64>;

    /// Extract a single register.
    fn register(state: &VcpuState, reg_id: Self::RegId, buf: &mut [u8]) -> Result<usize, ArchError>;

    /// Extract the register file.
    fn registers(state: &VcpuState, regs: &mut Self::Registers) -> Result<(), ArchError>;

    /// Update the register state from the register file.
    fn update_registers(state: &mut VcpuState, regs: &Self::Registers) -> Result<(), ArchError>;

    /// Update a single register.
    fn update_register(
        state: &mut VcpuState,
        reg_id: Self::RegId,
        val: &[u8],
    ) -> Result<(), ArchError>;
}

/// A [`SessionProxy`] associated with a specific architecture `T`.
pub struct VmTarget<'a, T>(pub(crate) &'a mut SessionProxy, PhantomData<T>);

impl<'a, T: TargetArch> VmTarget<'a, T> {
    pub fn new(proxy: &'a mut SessionProxy) -> Self {
        Self(proxy, PhantomData)
    }
}

impl<T> Deref for VmTarget<'_, T> {
    type Target = SessionProxy;

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

impl<T> DerefMut for VmTarget<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0
    }
}

impl<T: TargetArch> Target for VmTarget<'_, T> {
    type Arch = T;
    type Error = anyhow::Error;

    // ExdiGdbSrv (WinDbg's GDB client) doesn't support RLE
    fn use_rle(&self) -> bool {
        false
    }

    #[inline(always)]
    fn base_ops(&mut self) -> gdbstub::target::ext::base::BaseOps<'_, Self::Arch, Self::Error> {
        gdbstub::target::ext::base::BaseOps::MultiThread(self)
    }

    #[inline(always)]
    fn support_breakpoints(
        &mut self,
    ) -> Option<gdbstub::target::ext::breakpoints::BreakpointsOps<'_, Self>> {
        Some(self)
    }
}
