// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The introspection and debugging engine.
//!
//! This crate owns guest pause/resume semantics, register and memory access,
//! breakpoint and event-hook management, and session multiplexing for one or
//! more guest domains. It sits between the hypervisor boundary (the
//! [`HypervisorBackend`] trait, implemented by the external domain manager)
//! and the debug stub workers that speak debugger wire protocols.
//!
//! [`HypervisorBackend`]: hypervisor::HypervisorBackend

#![forbid(unsafe_code)]

pub mod breakpoints;
pub mod engine;
pub mod hooks;
pub mod hypervisor;
pub mod semantics;
pub mod session;
pub(crate) mod snapshot;
pub mod translate;

pub use engine::DomainDebugger;
pub use engine::VmiEngine;
pub use session::AccessMode;
pub use session::Session;
