// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The error taxonomy shared by every layer of the engine.
//!
//! All failures are typed results propagated up to the protocol adapter or
//! the control-plane caller; nothing here ever terminates the host process on
//! a guest-induced condition.

use crate::DomainId;
use crate::DomainState;
use crate::SessionId;
use thiserror::Error;

/// Guest virtual address resolution failure.
///
/// Callers need to distinguish "retry once the guest brings the page in"
/// from "the address is invalid", so translation failures are never collapsed
/// into a generic I/O error.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum TranslationError {
    /// The page is swapped out. Retryable once the guest touches it.
    #[error("page not resident")]
    NotResident,
    /// The address has no mapping.
    #[error("address not mapped")]
    NotMapped,
    /// A page-table page itself could not be read.
    #[error("fault while walking page tables")]
    PageTableWalkFault,
}

/// A failure at the hypervisor boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HypervisorError {
    /// The hypervisor did not acknowledge the call within the bounded
    /// timeout. Transient; callers may retry.
    #[error("hypervisor call timed out")]
    Timeout,
    /// The domain handle was revoked externally. Terminal for the domain.
    #[error("{0} is gone")]
    DomainGone(DomainId),
    /// The hypervisor rejected the call.
    #[error("hypervisor call failed: {op}")]
    Call { op: &'static str },
}

impl HypervisorError {
    /// Whether the affected domain is unusable from now on.
    pub fn is_terminal(&self) -> bool {
        matches!(self, HypervisorError::DomainGone(_))
    }
}

/// Any error surfaced by the introspection engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmiError {
    /// The operation is invalid for the domain's current state. Recoverable
    /// by retrying after the required transition (usually a pause).
    #[error("operation requires domain state {required:?}, but domain is {actual:?}")]
    State {
        required: DomainState,
        actual: DomainState,
    },
    /// Address resolution failed.
    #[error(transparent)]
    Translation(#[from] TranslationError),
    /// No hardware slot is available. The caller must free a slot or fall
    /// back to a software mechanism explicitly.
    #[error("no free {resource} slot")]
    ResourceExhausted { resource: &'static str },
    /// A malformed or unsupported wire packet. Handled by the protocol
    /// adapter, never propagated as a process-level failure.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The domain is held by another exclusive operation or session.
    #[error("{0}")]
    Concurrency(&'static str),
    /// The underlying hypervisor boundary call failed.
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
    /// An internal invariant was violated. Fatal for the affected domain's
    /// session; logged, never silently swallowed.
    #[error("consistency violation: {0}")]
    Consistency(String),
    /// The session id is not attached to this domain.
    #[error("unknown session {0:?}")]
    UnknownSession(SessionId),
}
