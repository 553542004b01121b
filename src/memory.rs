//! Memory classes: abstract allocators and accessors for named storage.
//!
//! A memory class describes one kind of storage a buffer can live in (plain
//! DRAM, a SIMD register file, an accelerator scratchpad) and supplies the C
//! snippets the emitter splices in for allocation, deallocation, stores,
//! reductions, and window formation. Classes are capability objects: they
//! are referenced from the IR but are not part of it, and must outlive every
//! node that mentions them.

use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use itertools::Itertools;
use thiserror::Error;

use crate::symbol::SrcInfo;
use crate::types::ir::{Stmt, Type};

/// Raised when a memory class cannot produce code for a request, including
/// reads from a class whose [`Memory::can_read`] is false.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct MemGenError(pub String);

/// An abstract storage class.
///
/// The `alloc`/`free`/`write`/`reduce` hooks return complete C statements;
/// `window` returns the lvalue a window borrows its data pointer from.
pub trait Memory {
  /// The class name used in diagnostics and for deterministic ordering.
  fn name(&self) -> &'static str;

  /// Global C code emitted once into the source when this class is used.
  fn global_code(&self) -> String { String::new() }

  /// Whether buffers in this memory may appear in scalar read position.
  fn can_read(&self) -> bool { true }

  /// Declare (and allocate) a buffer. `shape` holds the rendered extents;
  /// an empty shape is a scalar.
  fn alloc(&self, name: &str, ctype: &str, shape: &[String], srcinfo: &SrcInfo)
    -> Result<String, MemGenError>;

  /// Release a buffer declared by [`Memory::alloc`].
  fn free(&self, name: &str, ctype: &str, shape: &[String], srcinfo: &SrcInfo)
    -> Result<String, MemGenError>;

  /// A full C statement storing `rhs` into `lhs`.
  fn write(&self, _s: &Stmt, lhs: &str, rhs: &str) -> String {
    format!("{lhs} = {rhs};")
  }

  /// A full C statement accumulating `rhs` into `lhs`.
  fn reduce(&self, _s: &Stmt, lhs: &str, rhs: &str) -> String {
    format!("{lhs} += {rhs};")
  }

  /// The element lvalue at the window's base offset. `lo_idxs` and `strides`
  /// are the rendered per-dimension low indices and strides of the source
  /// buffer.
  fn window(&self, basetyp: &Type, base: &str, lo_idxs: &[String], strides: &[String],
    _srcinfo: &SrcInfo) -> Result<String, MemGenError> {
    let offset = lo_idxs.iter().zip(strides).map(|(i, s)| format!("({i}) * ({s})")).join(" + ");
    Ok(if basetyp.is_win() {
      format!("{base}.data[{offset}]")
    } else {
      format!("{base}[{offset}]")
    })
  }
}

/// Shared handle to a memory class. Equality is by identity.
#[derive(Clone)]
pub struct Mem(
  /// The shared class object.
  pub Rc<dyn Memory>,
);

impl Mem {
  /// Wrap a memory class implementation.
  pub fn new(m: impl Memory + 'static) -> Mem { Mem(Rc::new(m)) }
}

impl Deref for Mem {
  type Target = dyn Memory;
  fn deref(&self) -> &(dyn Memory + 'static) { &*self.0 }
}

impl PartialEq for Mem {
  fn eq(&self, other: &Mem) -> bool { Rc::ptr_eq(&self.0, &other.0) }
}

impl fmt::Debug for Mem {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Mem({})", self.name())
  }
}

/// The default memory class: heap-allocated buffers in main memory, used
/// whenever a buffer carries no annotation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dram;

impl Memory for Dram {
  fn name(&self) -> &'static str { "DRAM" }

  fn global_code(&self) -> String {
    "#include <stdio.h>\n#include <stdlib.h>\n".to_string()
  }

  fn alloc(&self, name: &str, ctype: &str, shape: &[String], _srcinfo: &SrcInfo)
    -> Result<String, MemGenError> {
    Ok(if shape.is_empty() {
      format!("{ctype} {name};")
    } else {
      let size = shape.join(" * ");
      format!("{ctype} *{name} = ({ctype}*) malloc({size} * sizeof(*{name}));")
    })
  }

  fn free(&self, name: &str, _ctype: &str, shape: &[String], _srcinfo: &SrcInfo)
    -> Result<String, MemGenError> {
    Ok(if shape.is_empty() { String::new() } else { format!("free({name});") })
  }
}

/// The shared [`Dram`] instance substituted for absent annotations.
#[must_use] pub fn dram() -> Mem {
  thread_local! {
    static DRAM: Mem = Mem::new(Dram);
  }
  DRAM.with(Clone::clone)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dram_alloc_and_free() {
    let si = SrcInfo::unknown();
    let m = dram();
    assert_eq!(m.alloc("x", "float", &[], &si).unwrap(), "float x;");
    let shape = vec!["n".to_string(), "m".to_string()];
    assert_eq!(
      m.alloc("buf", "double", &shape, &si).unwrap(),
      "double *buf = (double*) malloc(n * m * sizeof(*buf));"
    );
    assert_eq!(m.free("buf", "double", &shape, &si).unwrap(), "free(buf);");
    assert_eq!(m.free("x", "float", &[], &si).unwrap(), "");
  }

  #[test]
  fn dram_identity_is_shared() {
    assert_eq!(dram(), dram());
  }
}
