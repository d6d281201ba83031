// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Target implementation for the stock gdbstub x86-64 (with SSE) register
//! file.

use super::ArchError;
use super::TargetArch;
use gdbstub_arch::x86::reg::id::X86SegmentRegId;
use gdbstub_arch::x86::reg::id::X86_64CoreRegId;
use gdbstub_arch::x86::reg::X86SegmentRegs;
use gdbstub_arch::x86::reg::X86_64CoreRegs;
use vmi_core_defs::x86::SegmentRegister;
use vmi_core_defs::x86::VcpuState;

/// Maps a GDB GP register index (rax, rbx, rcx, rdx, rsi, rdi, rbp, rsp,
/// r8-r15) to its index in the hypervisor context layout (rax, rcx, rdx,
/// rbx, rsp, rbp, rsi, rdi, r8-r15).
const GDB_TO_STATE: [usize; 16] = [0, 3, 1, 2, 6, 7, 5, 4, 8, 9, 10, 11, 12, 13, 14, 15];

fn segment(state: &VcpuState, id: X86SegmentRegId) -> Option<&SegmentRegister> {
    match id {
        X86SegmentRegId::CS => Some(&state.cs),
        X86SegmentRegId::SS => Some(&state.ss),
        X86SegmentRegId::DS => Some(&state.ds),
        X86SegmentRegId::ES => Some(&state.es),
        X86SegmentRegId::FS => Some(&state.fs),
        X86SegmentRegId::GS => Some(&state.gs),
        _ => None,
    }
}

impl TargetArch for gdbstub_arch::x86::X86_64_SSE {
    type Address = u64;

    fn register(
        state: &VcpuState,
        reg_id: Self::RegId,
        buf: &mut [u8],
    ) -> Result<usize, ArchError> {
        match reg_id {
            X86_64CoreRegId::Gpr(idx) => {
                let idx = GDB_TO_STATE.get(idx as usize).copied().ok_or(ArchError)?;
                buf[..8].copy_from_slice(&state.gp[idx].to_le_bytes());
                Ok(8)
            }
            X86_64CoreRegId::Rip => {
                buf[..8].copy_from_slice(&state.rip.to_le_bytes());
                Ok(8)
            }
            X86_64CoreRegId::Eflags => {
                buf[..4].copy_from_slice(&(state.rflags as u32).to_le_bytes());
                Ok(4)
            }
            X86_64CoreRegId::Segment(seg) => {
                let selector = segment(state, seg).ok_or(ArchError)?.selector;
                buf[..4].copy_from_slice(&(selector as u32).to_le_bytes());
                Ok(4)
            }
            X86_64CoreRegId::Xmm(idx) => {
                let value = state.xmm.get(idx as usize).ok_or(ArchError)?;
                buf[..16].copy_from_slice(&value.to_le_bytes());
                Ok(16)
            }
            X86_64CoreRegId::Mxcsr => {
                buf[..4].copy_from_slice(&state.mxcsr.to_le_bytes());
                Ok(4)
            }
            _ => Err(ArchError),
        }
    }

    fn registers(state: &VcpuState, regs: &mut Self::Registers) -> Result<(), ArchError> {
        let gp_regs = {
            let [rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15] =
                state.gp;
            [
                rax, rbx, rcx, rdx, rsi, rdi, rbp, rsp, r8, r9, r10, r11, r12, r13, r14, r15,
            ]
        };

        *regs = X86_64CoreRegs {
            regs: gp_regs,
            eflags: state.rflags as u32,
            rip: state.rip,
            segments: X86SegmentRegs {
                cs: state.cs.selector.into(),
                ss: state.ss.selector.into(),
                ds: state.ds.selector.into(),
                es: state.es.selector.into(),
                fs: state.fs.selector.into(),
                gs: state.gs.selector.into(),
            },

            // x87 state is not exposed by the vcpu register file.
            st: Default::default(),
            fpu: Default::default(),
            xmm: state.xmm,
            mxcsr: state.mxcsr,
        };

        Ok(())
    }

    fn update_registers(state: &mut VcpuState, regs: &Self::Registers) -> Result<(), ArchError> {
        state.gp = {
            let [rax, rbx, rcx, rdx, rsi, rdi, rbp, rsp, r8, r9, r10, r11, r12, r13, r14, r15] =
                regs.regs;
            [
                rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
            ]
        };
        state.rflags = regs.eflags.into();
        state.rip = regs.rip;
        state.xmm = regs.xmm;
        state.mxcsr = regs.mxcsr;
        // Segment selector writes are not applied; loading a selector has
        // side effects the engine does not emulate.
        Ok(())
    }

    fn update_register(
        state: &mut VcpuState,
        reg_id: Self::RegId,
        val: &[u8],
    ) -> Result<(), ArchError> {
        fn to_u64_le(val: &[u8]) -> u64 {
            let mut buf = [0; 8];
            buf[..val.len().min(8)].copy_from_slice(&val[..val.len().min(8)]);
            u64::from_le_bytes(buf)
        }

        fn to_u128_le(val: &[u8]) -> u128 {
            let mut buf = [0; 16];
            buf[..val.len().min(16)].copy_from_slice(&val[..val.len().min(16)]);
            u128::from_le_bytes(buf)
        }

        match reg_id {
            X86_64CoreRegId::Gpr(idx) => {
                let idx = GDB_TO_STATE.get(idx as usize).copied().ok_or(ArchError)?;
                state.gp[idx] = to_u64_le(val);
            }
            X86_64CoreRegId::Rip => state.rip = to_u64_le(val),
            X86_64CoreRegId::Eflags => state.rflags = to_u64_le(val),
            X86_64CoreRegId::Xmm(idx) => {
                *state.xmm.get_mut(idx as usize).ok_or(ArchError)? = to_u128_le(val);
            }
            X86_64CoreRegId::Mxcsr => state.mxcsr = to_u64_le(val) as u32,
            _ => {
                // WinDbg bulk updates registers; unsupported ones are skipped
                // rather than failing the whole update.
                tracing::error!(?reg_id, "write_register does not support this register");
            }
        }

        Ok(())
    }
}
