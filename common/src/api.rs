// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the upgrade orchestrator's interfaces
//!
//! Every external collaborator (node registry, change store, coordination
//! store, job pipeline) and every operator-facing call reports failure using
//! [`Error`].  Planner-internal failures have their own error types and are
//! converted at the boundary.

use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;

/// An error that can be generated by an external interface or operator call
///
/// These may be generated while handling an operator request or as part of a
/// control loop.  Control loops never propagate these to end users: they log
/// them, record them in the task's status, and try again next cycle.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// An object needed as part of this operation was not found.
    #[error("Object (of type {type_name}) not found: {lookup}")]
    ObjectNotFound { type_name: ResourceType, lookup: String },
    /// The request was well-formed, but the operation cannot be completed
    /// given the current state of the system (e.g., it would violate a
    /// policy invariant).
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },
    /// A conditional write found a different generation than expected.
    #[error("Conflict: {message}")]
    Conflict { message: String },
    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
    /// The system (or part of it) is unavailable.
    #[error("Service Unavailable: {internal_message}")]
    ServiceUnavailable { internal_message: String },
}

/// Kinds of objects that can be named in an [`Error::ObjectNotFound`]
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    PartialEq,
    Eq,
    Serialize,
    strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum ResourceType {
    Instance,
    Node,
    Zone,
    Version,
    OsTarget,
    Lock,
}

impl Error {
    /// Returns whether the error is likely transient and could reasonably be
    /// retried on the next cycle
    pub fn retryable(&self) -> bool {
        match self {
            Error::ServiceUnavailable { .. } | Error::Conflict { .. } => true,

            Error::ObjectNotFound { .. }
            | Error::InvalidRequest { .. }
            | Error::InternalError { .. } => false,
        }
    }

    /// Generates an [`Error::ObjectNotFound`] error for the given object.
    pub fn not_found(type_name: ResourceType, lookup: impl Display) -> Error {
        Error::ObjectNotFound { type_name, lookup: lookup.to_string() }
    }

    /// Generates an [`Error::InvalidRequest`] error with the specific message
    ///
    /// This should be used for failures due to policy violations: the caller
    /// asked for something that the system refuses to do, and nothing was
    /// changed.
    pub fn invalid_request(message: impl Into<String>) -> Error {
        Error::InvalidRequest { message: message.into() }
    }

    /// Generates an [`Error::Conflict`] error with the specific message
    ///
    /// This should be used when a conditional write loses a race with another
    /// writer.
    pub fn conflict(message: impl Into<String>) -> Error {
        Error::Conflict { message: message.into() }
    }

    /// Generates an [`Error::InternalError`] error with the specific message
    ///
    /// InternalError should be used for operational conditions that should
    /// not happen but that we cannot reasonably handle at runtime (e.g.,
    /// finding a malformed record in the coordination store).
    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    /// Generates an [`Error::ServiceUnavailable`] error with the specific
    /// message
    pub fn unavail(message: &str) -> Error {
        Error::ServiceUnavailable { internal_message: message.to_owned() }
    }
}
