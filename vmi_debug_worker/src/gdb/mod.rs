// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Context;
use gdbstub::common::Tid;
use std::num::NonZeroUsize;
use vmi_core::Session;
use vmi_core_defs::GuestAddress;

pub mod targets;

#[derive(Debug, Default, Clone)]
pub struct Vp {
    pub single_step: bool,
}

/// An attached debugger session plus the per-VP resume actions accumulated
/// between a `vCont` request and the resume that carries them out.
pub struct SessionProxy {
    session: Session,
    pub vps: Box<[Vp]>,
}

impl SessionProxy {
    pub fn new(session: Session) -> Self {
        let vp_count = session.vp_count();
        Self {
            session,
            vps: vec![Vp::default(); vp_count as usize].into(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    pub fn tid_to_vp(&self, tid: Tid) -> anyhow::Result<u32> {
        let index = tid.get() - 1;
        if index >= self.vps.len() {
            Err(anyhow::anyhow!("Tid {} doesn't correspond to a vp", tid))
        } else {
            Ok(index as u32)
        }
    }

    pub fn vp_to_tid(&self, vp: u32) -> Tid {
        NonZeroUsize::new(vp as usize + 1).unwrap()
    }

    /// Reads guest VP `vp`'s virtual address `gva` into `data`.
    pub(crate) fn read_guest_virtual_memory(
        &self,
        vp: u32,
        gva: u64,
        data: &mut [u8],
    ) -> anyhow::Result<()> {
        self.session
            .read_memory(GuestAddress::Gva { vp, gva }, data)
            .context("failed to read memory")
    }

    /// Writes `data` to guest VP `vp`'s virtual address `gva`.
    pub(crate) fn write_guest_virtual_memory(
        &self,
        vp: u32,
        gva: u64,
        data: &[u8],
    ) -> anyhow::Result<()> {
        self.session
            .write_memory(GuestAddress::Gva { vp, gva }, data)
            .context("failed to write memory")
    }
}
