// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::domain::DomainId;
use thiserror::Error;

/// Failure kinds surfaced by the governor core.
///
/// Lifecycle misuse (`AlreadyAttached`, `NotAttached`, `Started`,
/// `NotStarted`) is reported distinctly from capacity exhaustion
/// (`NoCapacity`) and from tunable-input problems (`InvalidTunable`,
/// `Busy`) so callers can tell a programming error from a resource or
/// input one.
#[derive(Debug, Error)]
pub enum GovError {
    /// Malformed tunable input. Nothing was mutated.
    #[error("invalid tunable value: {0}")]
    InvalidTunable(String),

    /// Tunable access raced with the tunable set losing its last user.
    #[error("tunable set has no remaining users")]
    Busy,

    /// The domain names a CPU the sample table has no slot for.
    #[error("cpu {cpu} out of range, sample table holds {nr_cpu_ids} slots")]
    NoCapacity { cpu: usize, nr_cpu_ids: usize },

    /// The domain carries no CPUs at all.
    #[error("domain {0} has an empty cpu set")]
    EmptyDomain(DomainId),

    #[error("domain {0} is already attached")]
    AlreadyAttached(DomainId),

    #[error("domain {0} is not attached")]
    NotAttached(DomainId),

    #[error("domain {0} is still started")]
    Started(DomainId),

    #[error("domain {0} is not started")]
    NotStarted(DomainId),

    /// Start requires the domain to report its current frequency.
    #[error("domain {0} reports no current frequency")]
    NoCurrentFrequency(DomainId),

    /// The governor variant's init hook failed while creating a tunable
    /// set. The attach was rolled back.
    #[error("governor init failed")]
    Init(#[source] anyhow::Error),

    /// The sampling worker thread could not be spawned.
    #[error("failed to spawn sampling worker")]
    Worker(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GovError>;
