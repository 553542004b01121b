//! The user-facing error surface.
//!
//! Every error carries enough context to be reported directly to the user;
//! messages that concern a specific program point are prefixed with its
//! [`SrcInfo`](crate::symbol::SrcInfo) at the raise site. Internal invariant
//! violations (a pass reaching a case it cannot handle) are bugs and panic
//! instead of returning one of these.

use thiserror::Error;

use crate::config::ConfigError;
use crate::memory::MemGenError;
use crate::symbol::SrcInfo;

/// Errors raised by IR construction, call-graph closure, and the C emitter.
#[derive(Debug, Error)]
pub enum Error {
  /// An identifier failed lexical validation.
  #[error("invalid identifier: {0}")]
  InvalidIdentifier(String),
  /// An operator token is not one of the recognized binary operators.
  #[error("invalid operator: {0}")]
  InvalidOperator(String),
  /// A tensor was constructed with a tensor or window element type.
  #[error("tensor element type must be a scalar")]
  NestedTensor,
  /// The call graph contains a cycle among non-instruction procedures.
  #[error("found call cycle involving {0}")]
  CallCycle(String),
  /// Two procedures in the closure share a name.
  #[error("multiple procs named {0}")]
  DuplicateProc(String),
  /// Two configs in the context share a name.
  #[error("multiple configs named {0}")]
  DuplicateConfig(String),
  /// An abstract `R` type survived to code generation.
  #[error("{0}: abstract type R must be resolved before code generation")]
  UnresolvedPrecision(SrcInfo),
  /// A memory class could not produce code.
  #[error(transparent)]
  Mem(#[from] MemGenError),
  /// A config was read or written without permission.
  #[error(transparent)]
  Config(#[from] ConfigError),
}

/// Result alias for compiler operations.
pub type Result<T> = std::result::Result<T, Error>;
