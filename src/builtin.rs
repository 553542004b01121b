//! Builtin functions callable from kernel expressions.

use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

/// An externally provided scalar function. The emitter renders the call by
/// handing the already-compiled argument strings to [`Builtin::compile`].
pub trait Builtin {
  /// The surface name of the builtin.
  fn name(&self) -> &'static str;

  /// Global C code emitted once into the source when this builtin is used.
  fn globl(&self) -> String { String::new() }

  /// Compile a call given rendered argument expressions.
  fn compile(&self, args: &[String]) -> String;
}

/// Shared handle to a builtin. Equality is by identity.
#[derive(Clone)]
pub struct Bif(
  /// The shared builtin object.
  pub Rc<dyn Builtin>,
);

impl Bif {
  /// Wrap a builtin implementation.
  pub fn new(b: impl Builtin + 'static) -> Bif { Bif(Rc::new(b)) }
}

impl Deref for Bif {
  type Target = dyn Builtin;
  fn deref(&self) -> &(dyn Builtin + 'static) { &*self.0 }
}

impl PartialEq for Bif {
  fn eq(&self, other: &Bif) -> bool { Rc::ptr_eq(&self.0, &other.0) }
}

impl fmt::Debug for Bif {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Bif({})", self.name())
  }
}

/// `sin(x)` via libm.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sin;

impl Builtin for Sin {
  fn name(&self) -> &'static str { "sin" }
  fn globl(&self) -> String { "#include <math.h>\n".to_string() }
  fn compile(&self, args: &[String]) -> String { format!("sin({})", args[0]) }
}

/// `relu(x)`: `x` clamped below at zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

impl Builtin for Relu {
  fn name(&self) -> &'static str { "relu" }

  fn globl(&self) -> String {
    "static double _relu_(double x) {\n    if (x > 0.0) return x;\n    else return 0.0;\n}\n"
      .to_string()
  }

  fn compile(&self, args: &[String]) -> String { format!("_relu_({})", args[0]) }
}

/// `select(x, v, b, c)`: `b` when `x < v`, else `c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Select;

impl Builtin for Select {
  fn name(&self) -> &'static str { "select" }

  fn compile(&self, args: &[String]) -> String {
    format!("(({}) < ({}) ? ({}) : ({}))", args[0], args[1], args[2], args[3])
  }
}
