//! Error types surfaced by call-site dispatch.
//!
//! Guard failures and redundant resolutions are routine control flow and
//! never show up here. Only genuine resolution, ambiguity and access
//! failures, plus exceptions raised by the invoked members themselves,
//! become a [`DispatchError`].

use thiserror::Error;

use crate::model::Value;

/// Result type used throughout the dispatch core.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Which kind of member a failed lookup was looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Method,
    Constructor,
    Property,
}

impl std::fmt::Display for MemberKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberKind::Method => write!(f, "method"),
            MemberKind::Constructor => write!(f, "constructor"),
            MemberKind::Property => write!(f, "property"),
        }
    }
}

/// Errors raised while dispatching a call.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("No signature of {kind} {class}.{name}() is applicable for argument types ({arguments})")]
    MissingMember {
        kind: MemberKind,
        class: String,
        name: String,
        arguments: String,
    },

    #[error("Ambiguous method overloading for {class}.{name}({arguments}): {candidates}")]
    Ambiguity {
        class: String,
        name: String,
        arguments: String,
        candidates: String,
    },

    #[error("Internal consistency error: {0}")]
    InternalConsistency(String),

    #[error("Cannot convert {found} to {expected} for argument {position}")]
    WrongArgumentType {
        position: usize,
        expected: String,
        found: String,
    },

    /// An exception raised by the invoked member itself.
    #[error("{message}")]
    Thrown {
        message: String,
        value: Option<Value>,
    },

    /// The runtime's internal exception wrapper. Handles built by the
    /// dispatch core unwrap exactly one level of it before returning.
    #[error("Runtime wrapper: {0}")]
    Wrapped(Box<DispatchError>),
}

impl DispatchError {
    pub fn missing_member(
        kind: MemberKind,
        class: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::MissingMember {
            kind,
            class: class.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    pub fn ambiguity(
        class: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
        candidates: impl Into<String>,
    ) -> Self {
        Self::Ambiguity {
            class: class.into(),
            name: name.into(),
            arguments: arguments.into(),
            candidates: candidates.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalConsistency(message.into())
    }

    pub fn wrong_argument_type(
        position: usize,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::WrongArgumentType {
            position,
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn thrown(message: impl Into<String>) -> Self {
        Self::Thrown {
            message: message.into(),
            value: None,
        }
    }

    pub fn thrown_value(message: impl Into<String>, value: Value) -> Self {
        Self::Thrown {
            message: message.into(),
            value: Some(value),
        }
    }

    /// Wrap an error in the internal runtime wrapper.
    pub fn wrapped(inner: DispatchError) -> Self {
        Self::Wrapped(Box::new(inner))
    }

    /// Remove one level of internal wrapping, if present.
    pub fn unwrap_runtime(self) -> Self {
        match self {
            Self::Wrapped(inner) => *inner,
            other => other,
        }
    }

    pub fn is_missing_member(&self) -> bool {
        matches!(self, Self::MissingMember { .. })
    }

    pub fn is_ambiguity(&self) -> bool {
        matches!(self, Self::Ambiguity { .. })
    }
}
