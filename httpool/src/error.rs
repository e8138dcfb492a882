//! Error types.
//!
//! The pool distinguishes four failure classes:
//!
//! - [`SubmitError`]: a request could not be handed to the transport engine,
//! - [`DriveError`]: the engine failed while processing a readiness or timer
//!   event; only the affected handles fail,
//! - [`RegistrationError`]: the backend refused an interest change; the
//!   reactor and the engine can no longer be trusted to agree,
//! - [`TransferError`]: a completed request did not succeed. This one is
//!   data carried by the handle, never returned by the pool.

use crate::handle::HandleId;

use std::io;
use std::os::fd::RawFd;

/// The backend operation that failed while registering interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOp {
    Add,
    Modify,
    Remove,
    ArmTimer,
    DisarmTimer,
}

impl std::fmt::Display for RegistrationOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            RegistrationOp::Add => "add",
            RegistrationOp::Modify => "modify",
            RegistrationOp::Remove => "remove",
            RegistrationOp::ArmTimer => "arm timer",
            RegistrationOp::DisarmTimer => "disarm timer",
        };
        f.write_str(op)
    }
}

/// Errors returned by [`Pool::submit`](crate::Pool::submit).
#[derive(thiserror::Error, Debug)]
pub enum SubmitError {
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: &'static str },

    #[error("transport engine rejected the request: {0}")]
    Rejected(String),

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// The engine's state machine failed while being driven.
#[derive(thiserror::Error, Debug)]
#[error("transport engine action failed: {reason}")]
pub struct DriveError {
    /// Human readable engine error.
    pub reason: String,

    /// Handles the engine knows to be broken by this failure.
    pub affected: Vec<HandleId>,
}

impl DriveError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            affected: Vec::new(),
        }
    }

    pub fn affecting(mut self, handles: impl IntoIterator<Item = HandleId>) -> Self {
        self.affected.extend(handles);
        self
    }
}

/// A backend failed to add, modify or remove a registration.
#[derive(thiserror::Error, Debug)]
#[error("failed to {op} registration for fd {fd}: {source}")]
pub struct RegistrationError {
    pub fd: RawFd,
    pub op: RegistrationOp,
    #[source]
    pub source: io::Error,
}

impl RegistrationError {
    pub(crate) fn new(fd: RawFd, op: RegistrationOp, source: io::Error) -> Self {
        Self { fd, op, source }
    }
}

/// Errors returned by [`Pool::run_once`](crate::Pool::run_once).
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("event loop wait failed: {0}")]
    Wait(#[source] io::Error),

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Why a completed request did not succeed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("request aborted before completion: {0}")]
    Aborted(String),

    #[error("HTTP status {0}")]
    Status(i64),
}

/// Umbrella error for callers that do not care about the failure class.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("failed to create event loop: {0}")]
    EventLoop(#[source] io::Error),

    #[error("failed to create transport engine: {0}")]
    Engine(String),
}
