//! Symbols, source locations, and validated identifiers.
//!
//! A [`Sym`] is an opaque identifier: a printable name plus a globally unique
//! id drawn from a process-wide atomic counter. Two symbols with the same
//! name are distinct unless they share an id, so binder passes can
//! distinguish shadowed variables without consulting any context.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use regex::Regex;

use crate::error::Error;

static SYM_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_sym_id() -> u64 { SYM_COUNTER.fetch_add(1, Ordering::Relaxed) }

/// A named symbol with a globally unique id.
///
/// Equality, ordering, and hashing are by id only; the name is for printing.
#[derive(Clone)]
pub struct Sym {
  name: Arc<str>,
  id: u64,
}

impl Sym {
  /// Create a symbol with a fresh id.
  pub fn fresh(name: impl Into<Arc<str>>) -> Sym {
    Sym { name: name.into(), id: next_sym_id() }
  }

  /// A fresh symbol sharing this one's printable name.
  #[must_use] pub fn copy(&self) -> Sym {
    Sym { name: self.name.clone(), id: next_sym_id() }
  }

  /// The printable name.
  #[must_use] pub fn name(&self) -> &str { &self.name }

  /// The globally unique id.
  #[must_use] pub fn id(&self) -> u64 { self.id }
}

impl PartialEq for Sym {
  fn eq(&self, other: &Sym) -> bool { self.id == other.id }
}
impl Eq for Sym {}

impl PartialOrd for Sym {
  fn partial_cmp(&self, other: &Sym) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}
impl Ord for Sym {
  fn cmp(&self, other: &Sym) -> std::cmp::Ordering { self.id.cmp(&other.id) }
}

impl Hash for Sym {
  fn hash<H: Hasher>(&self, state: &mut H) { self.id.hash(state) }
}

impl fmt::Display for Sym {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.name) }
}

impl fmt::Debug for Sym {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.name, self.id)
  }
}

/// A source location carried on every IR node for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SrcInfo {
  file: Option<Arc<str>>,
  line: u32,
  col: u32,
}

impl SrcInfo {
  /// A location inside a named file.
  pub fn new(file: impl Into<Arc<str>>, line: u32, col: u32) -> SrcInfo {
    SrcInfo { file: Some(file.into()), line, col }
  }

  /// The unknown location, used when no front-end position is available.
  #[must_use] pub fn unknown() -> SrcInfo { SrcInfo::default() }
}

impl fmt::Display for SrcInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.file {
      Some(file) => write!(f, "{file}:{}:{}", self.line, self.col),
      None => f.write_str("<unknown>"),
    }
  }
}

static IDENT_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^(?:_\w|[a-zA-Z])\w*$").expect("identifier pattern"));

/// A validated identifier: procedure and field names must match
/// `(_[A-Za-z0-9_]|[A-Za-z])\w*`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ident(Box<str>);

impl Ident {
  /// Validate and wrap an identifier string.
  pub fn new(name: &str) -> Result<Ident, Error> {
    if IDENT_RE.is_match(name) {
      Ok(Ident(name.into()))
    } else {
      Err(Error::InvalidIdentifier(name.to_string()))
    }
  }

  /// The identifier text.
  #[must_use] pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Ident {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl std::ops::Deref for Ident {
  type Target = str;
  fn deref(&self) -> &str { &self.0 }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fresh_symbols_are_distinct() {
    let a = Sym::fresh("x");
    let b = Sym::fresh("x");
    assert_ne!(a, b);
    assert_eq!(a.name(), b.name());
  }

  #[test]
  fn copy_shares_name_not_identity() {
    let a = Sym::fresh("buf");
    let b = a.copy();
    assert_eq!(a.name(), b.name());
    assert_ne!(a, b);
    assert_ne!(a.id(), b.id());
  }

  #[test]
  fn identifier_validation() {
    assert!(Ident::new("x").is_ok());
    assert!(Ident::new("_x1").is_ok());
    assert!(Ident::new("gemm_kernel").is_ok());
    assert!(Ident::new("1x").is_err());
    assert!(Ident::new("").is_err());
    assert!(Ident::new("a-b").is_err());
    assert!(Ident::new("_").is_err());
  }

  #[test]
  fn srcinfo_display() {
    assert_eq!(SrcInfo::unknown().to_string(), "<unknown>");
    assert_eq!(SrcInfo::new("k.py", 3, 7).to_string(), "k.py:3:7");
  }
}
