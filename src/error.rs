//! Errors raised while compiling descriptors and predicates.
//!
//! Parse errors live next to the parser (`parser::ParseError`); everything
//! downstream of the parsed tree reports through [`CompileError`]. All
//! variants are local to one compilation and never poison the schema cache.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    /// A descriptor predicate needs context keys the caller did not supply.
    /// Collected across the whole forest before compilation starts.
    MissingContext { keys: Vec<String> },
    /// Two descriptors share an output alias but are not structurally
    /// similar, so neither can silently win.
    DescriptorConflict {
        alias: String,
        first: String,
        second: String,
    },
    UnknownEntity { entity: String },
    UnknownRelation { entity: String, relation: String },
    UnknownField { entity: String, field: String },
    /// The value cannot be cast to the field's type for an ordered lookup.
    InvalidValue {
        field: String,
        value: String,
        expected: &'static str,
    },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::MissingContext { keys } => {
                write!(f, "missing context keys: {}", keys.join(", "))
            }
            CompileError::DescriptorConflict {
                alias,
                first,
                second,
            } => write!(
                f,
                "descriptors '{first}' and '{second}' both produce '{alias}' but are not mergeable"
            ),
            CompileError::UnknownEntity { entity } => {
                write!(f, "unknown entity '{entity}'")
            }
            CompileError::UnknownRelation { entity, relation } => {
                write!(f, "entity '{entity}' has no relation '{relation}'")
            }
            CompileError::UnknownField { entity, field } => {
                write!(f, "entity '{entity}' has no field '{field}'")
            }
            CompileError::InvalidValue {
                field,
                value,
                expected,
            } => write!(
                f,
                "value '{value}' for field '{field}' is not a valid {expected}"
            ),
        }
    }
}

impl std::error::Error for CompileError {}
