//! Process-wide configuration structs accessible from kernels.
//!
//! A config is a named struct of fields that generated code reads and writes
//! through the library context argument (`ctxt-><config>.<field>`). Configs
//! marked non-rw are visible to analyses but are never materialized, and any
//! kernel access to them is a user-facing error.

use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use thiserror::Error;

use crate::types::ir::Type;

/// Raised when a kernel reads or writes a config that does not allow it.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

/// A named configuration struct.
pub trait Config {
  /// The config name; doubles as the context field name.
  fn name(&self) -> &str;

  /// Whether kernels may read and write this config's fields.
  fn is_allow_rw(&self) -> bool;

  /// Look up a field: its declared name and type.
  fn lookup(&self, field: &str) -> Option<(String, Type)>;

  /// C lines declaring this config's sub-struct inside the context struct.
  fn c_struct_def(&self) -> Vec<String>;
}

/// Shared handle to a config. Equality is by identity.
#[derive(Clone)]
pub struct Cfg(
  /// The shared config object.
  pub Rc<dyn Config>,
);

impl Cfg {
  /// Wrap a config implementation.
  pub fn new(c: impl Config + 'static) -> Cfg { Cfg(Rc::new(c)) }
}

impl Deref for Cfg {
  type Target = dyn Config;
  fn deref(&self) -> &(dyn Config + 'static) { &*self.0 }
}

impl PartialEq for Cfg {
  fn eq(&self, other: &Cfg) -> bool { Rc::ptr_eq(&self.0, &other.0) }
}

impl fmt::Debug for Cfg {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Cfg({})", self.name())
  }
}

/// A field-list config, sufficient for tests and simple libraries.
pub struct BasicConfig {
  name: String,
  fields: Vec<(String, Type)>,
  allow_rw: bool,
}

impl BasicConfig {
  /// Build a config from a field list.
  pub fn new(name: &str, fields: Vec<(String, Type)>, allow_rw: bool) -> Cfg {
    Cfg::new(BasicConfig { name: name.to_string(), fields, allow_rw })
  }
}

impl Config for BasicConfig {
  fn name(&self) -> &str { &self.name }

  fn is_allow_rw(&self) -> bool { self.allow_rw }

  fn lookup(&self, field: &str) -> Option<(String, Type)> {
    self.fields.iter().find(|(f, _)| f == field).cloned()
  }

  fn c_struct_def(&self) -> Vec<String> {
    let mut lines = vec!["struct {".to_string()];
    for (f, t) in &self.fields {
      lines.push(format!("    {} {f};", t.ctype()));
    }
    lines.push(format!("}} {};", self.name));
    lines
  }
}
