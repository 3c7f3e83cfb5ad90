use thiserror::Error;

pub mod environment;
pub mod quota;

pub use environment::{EnvironmentKind, EnvironmentRecord, EnvironmentState, EnvironmentType, Template};
pub use quota::QuotaTier;

/// Which lookup table a rejected key was checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    EnvironmentType,
    Template,
    QuotaTier,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind:?} '{value}'")]
pub struct ParseKeyError {
    pub kind: KeyKind,
    pub value: String,
}

impl ParseKeyError {
    pub(crate) fn new(kind: KeyKind, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
