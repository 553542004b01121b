//! The typed Loop IR: types, expressions, statements, and procedures.
//!
//! Nodes are immutable. Child nodes are held behind [`Rc`] so that a rewrite
//! which leaves a subtree untouched shares it with the input by reference;
//! the traversal framework in [`crate::rewrite`] relies on this to
//! reconstruct a node only when one of its children actually changed.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::rc::Rc;
use std::str::FromStr;

use itertools::Itertools;

use crate::builtin::Bif;
use crate::config::Cfg;
use crate::error::Error;
use crate::memory::Mem;
use crate::symbol::{Ident, SrcInfo, Sym};
use crate::types::effect::Effect;

/// The binary operators recognized by the IR: exactly
/// `+ - * / % < > <= >= == and or`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
  /// `+`
  Add,
  /// `-`
  Sub,
  /// `*`
  Mul,
  /// `/`; semantics of integer division depend on the operand type.
  Div,
  /// `%`
  Mod,
  /// `<`
  Lt,
  /// `>`
  Gt,
  /// `<=`
  Le,
  /// `>=`
  Ge,
  /// `==`
  Eq,
  /// `and`
  And,
  /// `or`
  Or,
}

impl BinOp {
  /// The surface token for this operator.
  #[must_use] pub fn as_str(self) -> &'static str {
    match self {
      BinOp::Add => "+",
      BinOp::Sub => "-",
      BinOp::Mul => "*",
      BinOp::Div => "/",
      BinOp::Mod => "%",
      BinOp::Lt => "<",
      BinOp::Gt => ">",
      BinOp::Le => "<=",
      BinOp::Ge => ">=",
      BinOp::Eq => "==",
      BinOp::And => "and",
      BinOp::Or => "or",
    }
  }
}

impl FromStr for BinOp {
  type Err = Error;
  fn from_str(s: &str) -> Result<BinOp, Error> {
    Ok(match s {
      "+" => BinOp::Add,
      "-" => BinOp::Sub,
      "*" => BinOp::Mul,
      "/" => BinOp::Div,
      "%" => BinOp::Mod,
      "<" => BinOp::Lt,
      ">" => BinOp::Gt,
      "<=" => BinOp::Le,
      ">=" => BinOp::Ge,
      "==" => BinOp::Eq,
      "and" => BinOp::And,
      "or" => BinOp::Or,
      _ => return Err(Error::InvalidOperator(s.to_string())),
    })
  }
}

impl fmt::Display for BinOp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A literal constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Const {
  /// A boolean, rendered `true`/`false`.
  Bool(bool),
  /// An integer.
  Int(i64),
  /// A floating-point number, always rendered with a decimal point.
  Float(f64),
}

impl Const {
  /// Whether this constant is trivially true as a predicate.
  #[must_use] pub fn is_truthy(self) -> bool {
    match self {
      Const::Bool(b) => b,
      Const::Int(n) => n != 0,
      Const::Float(x) => x != 0.0,
    }
  }
}

impl fmt::Display for Const {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match *self {
      Const::Bool(b) => f.write_str(if b { "true" } else { "false" }),
      Const::Int(n) => write!(f, "{n}"),
      Const::Float(x) if x.fract() == 0.0 && x.is_finite() => write!(f, "{x:.1}"),
      Const::Float(x) => write!(f, "{x}"),
    }
  }
}

/// A Loop IR type.
///
/// The nullary constructors are unit variants, so each has exactly one
/// canonical value; `Tensor` and `Window` share their payloads behind `Rc`.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
  /// Abstract real number `R`; must be resolved to a concrete precision
  /// before code generation.
  Num,
  /// 32-bit float.
  F32,
  /// 64-bit float.
  F64,
  /// 8-bit signed integer.
  Int8,
  /// 32-bit signed integer.
  Int32,
  /// Boolean.
  Bool,
  /// Plain integer control value.
  Int,
  /// Loop index.
  Index,
  /// Non-negative extent.
  Size,
  /// Buffer stride.
  Stride,
  /// Error placeholder produced by a failed front-end.
  Error,
  /// Rectangular array over a scalar element type.
  Tensor(Rc<TensorType>),
  /// A window: a view into a backing tensor.
  Window(Rc<WindowType>),
}

/// Payload of [`Type::Tensor`].
#[derive(Debug, Clone, PartialEq)]
pub struct TensorType {
  /// Per-dimension extents.
  pub hi: Box<[Rc<Expr>]>,
  /// Whether this tensor is itself a windowed view.
  pub is_window: bool,
  /// The scalar element type; never a tensor or window.
  pub elem: Type,
}

/// Payload of [`Type::Window`].
#[derive(Debug, Clone, PartialEq)]
pub struct WindowType {
  /// Type of the tensor the window was taken from.
  pub src_type: Type,
  /// The effective tensor type after the window is taken.
  pub as_tensor: Type,
  /// The backing buffer.
  pub src_buf: Sym,
  /// Per-dimension accessors into the source.
  pub idx: Box<[WAccess]>,
}

impl Type {
  /// Construct a tensor type, validating that the element is scalar.
  pub fn tensor(hi: Vec<Rc<Expr>>, is_window: bool, elem: Type) -> Result<Type, Error> {
    if elem.is_tensor_or_window() {
      return Err(Error::NestedTensor);
    }
    Ok(Type::Tensor(Rc::new(TensorType { hi: hi.into(), is_window, elem })))
  }

  /// Construct a window type.
  #[must_use] pub fn window(src_type: Type, as_tensor: Type, src_buf: Sym, idx: Vec<WAccess>)
    -> Type {
    Type::Window(Rc::new(WindowType { src_type, as_tensor, src_buf, idx: idx.into() }))
  }

  /// Real scalar kinds: `R`, `f32`, `f64`, `i8`, `i32`.
  #[must_use] pub fn is_real_scalar(&self) -> bool {
    matches!(self, Type::Num | Type::F32 | Type::F64 | Type::Int8 | Type::Int32)
  }

  /// Tensor or window.
  #[must_use] pub fn is_tensor_or_window(&self) -> bool {
    matches!(self, Type::Tensor(_) | Type::Window(_))
  }

  /// Whether values of this type are windowed views.
  #[must_use] pub fn is_win(&self) -> bool {
    match self {
      Type::Tensor(t) => t.is_window,
      Type::Window(_) => true,
      _ => false,
    }
  }

  /// Scalar, tensor, or window over real scalars.
  #[must_use] pub fn is_numeric(&self) -> bool {
    self.is_real_scalar() || self.is_tensor_or_window()
  }

  /// Boolean.
  #[must_use] pub fn is_bool(&self) -> bool { matches!(self, Type::Bool) }

  /// Usable as a loop bound or access index: `int`, `index`, `size`.
  #[must_use] pub fn is_indexable(&self) -> bool {
    matches!(self, Type::Int | Type::Index | Type::Size)
  }

  /// Usable in stride arithmetic: `int`, `stride`.
  #[must_use] pub fn is_stridable(&self) -> bool {
    matches!(self, Type::Int | Type::Stride)
  }

  /// Extent list: empty for scalars, the extents for tensors, the effective
  /// extents for windows.
  #[must_use] pub fn shape(&self) -> &[Rc<Expr>] {
    match self {
      Type::Window(w) => w.as_tensor.shape(),
      Type::Tensor(t) => {
        debug_assert!(!t.elem.is_tensor_or_window(), "expect no nesting");
        &t.hi
      }
      _ => &[],
    }
  }

  /// The underlying scalar type.
  #[must_use] pub fn basetype(&self) -> &Type {
    match self {
      Type::Window(w) => w.as_tensor.basetype(),
      Type::Tensor(t) => {
        debug_assert!(!t.elem.is_tensor_or_window(), "expect no nesting");
        &t.elem
      }
      t => t,
    }
  }

  /// The C spelling of a concrete scalar type.
  ///
  /// Panics on `R` (abstract precision is a programmer error here; the
  /// precision analysis reports user-visible occurrences first) and on
  /// non-scalar types.
  #[must_use] pub fn ctype(&self) -> &'static str {
    match self {
      Type::F32 => "float",
      Type::F64 => "double",
      Type::Int8 => "int8_t",
      Type::Int32 => "int32_t",
      Type::Bool => "bool",
      Type::Int | Type::Index | Type::Size | Type::Stride => "int_fast32_t",
      Type::Num => panic!("don't ask for the ctype of R"),
      t => panic!("no C type for {t}"),
    }
  }
}

impl fmt::Display for Type {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Type::Num => f.write_str("R"),
      Type::F32 => f.write_str("f32"),
      Type::F64 => f.write_str("f64"),
      Type::Int8 => f.write_str("i8"),
      Type::Int32 => f.write_str("i32"),
      Type::Bool => f.write_str("bool"),
      Type::Int => f.write_str("int"),
      Type::Index => f.write_str("index"),
      Type::Size => f.write_str("size"),
      Type::Stride => f.write_str("stride"),
      Type::Error => f.write_str("err"),
      Type::Tensor(t) => {
        write!(f, "{}[{}]", t.elem, t.hi.iter().map(|e| e.to_string()).join(", "))
      }
      Type::Window(w) => write!(f, "{}", w.as_tensor),
    }
  }
}

/// One dimension of a window access.
#[derive(Debug, Clone, PartialEq)]
pub enum WAccess {
  /// Keeps the dimension, restricted to `[lo, hi)`.
  Interval {
    /// Low bound (inclusive).
    lo: Rc<Expr>,
    /// High bound (exclusive).
    hi: Rc<Expr>,
    /// Source location.
    srcinfo: SrcInfo,
  },
  /// Drops the dimension at a single point.
  Point {
    /// The fixed index.
    pt: Rc<Expr>,
    /// Source location.
    srcinfo: SrcInfo,
  },
}

/// An expression together with its type and provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
  /// The expression proper.
  pub kind: ExprKind,
  /// The type of the value this expression produces.
  pub ty: Type,
  /// Source location.
  pub srcinfo: SrcInfo,
}

impl Expr {
  /// Wrap an expression node for sharing.
  pub fn new(kind: ExprKind, ty: Type, srcinfo: SrcInfo) -> Rc<Expr> {
    Rc::new(Expr { kind, ty, srcinfo })
  }
}

/// The expression variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
  /// Read of a scalar (`idx` empty) or of a tensor element.
  Read {
    /// The buffer or variable read.
    name: Sym,
    /// Access indices, one per dimension.
    idx: Box<[Rc<Expr>]>,
  },
  /// A literal.
  Const(Const),
  /// Unary negation.
  USub(Rc<Expr>),
  /// A binary operation.
  BinOp {
    /// The operator.
    op: BinOp,
    /// Left operand.
    lhs: Rc<Expr>,
    /// Right operand.
    rhs: Rc<Expr>,
  },
  /// A call to a builtin function.
  BuiltIn {
    /// The builtin.
    f: Bif,
    /// Argument expressions.
    args: Box<[Rc<Expr>]>,
  },
  /// Taking a window of a tensor.
  WindowExpr {
    /// The source buffer.
    name: Sym,
    /// Per-dimension accessors.
    idx: Box<[WAccess]>,
  },
  /// The stride of buffer `name` along dimension `dim`.
  StrideExpr {
    /// The buffer.
    name: Sym,
    /// The dimension.
    dim: usize,
  },
  /// Read of a config field.
  ReadConfig {
    /// The config.
    config: Cfg,
    /// The field name.
    field: Box<str>,
  },
}

impl fmt::Display for Expr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fn operand(f: &mut fmt::Formatter<'_>, e: &Expr) -> fmt::Result {
      if matches!(e.kind, ExprKind::BinOp { .. }) {
        write!(f, "({e})")
      } else {
        write!(f, "{e}")
      }
    }
    match &self.kind {
      ExprKind::Read { name, idx } if idx.is_empty() => write!(f, "{name}"),
      ExprKind::Read { name, idx } => {
        write!(f, "{name}[{}]", idx.iter().map(|e| e.to_string()).join(", "))
      }
      ExprKind::Const(c) => write!(f, "{c}"),
      ExprKind::USub(arg) => {
        f.write_str("-")?;
        operand(f, arg)
      }
      ExprKind::BinOp { op, lhs, rhs } => {
        operand(f, lhs)?;
        write!(f, " {op} ")?;
        operand(f, rhs)
      }
      ExprKind::BuiltIn { f: bf, args } => {
        write!(f, "{}({})", bf.name(), args.iter().map(|e| e.to_string()).join(", "))
      }
      ExprKind::WindowExpr { name, idx } => {
        let accs = idx.iter().map(|w| match w {
          WAccess::Interval { lo, hi, .. } => format!("{lo}:{hi}"),
          WAccess::Point { pt, .. } => pt.to_string(),
        });
        write!(f, "{name}[{}]", accs.format(", "))
      }
      ExprKind::StrideExpr { name, dim } => write!(f, "stride({name}, {dim})"),
      ExprKind::ReadConfig { config, field } => write!(f, "{}.{field}", config.name()),
    }
  }
}

/// A statement together with its effect summary and provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
  /// The statement proper.
  pub kind: StmtKind,
  /// Effect summary, when the front-end attached one.
  pub eff: Option<Rc<Effect>>,
  /// Source location.
  pub srcinfo: SrcInfo,
}

impl Stmt {
  /// Wrap a statement node for sharing.
  pub fn new(kind: StmtKind, eff: Option<Rc<Effect>>, srcinfo: SrcInfo) -> Rc<Stmt> {
    Rc::new(Stmt { kind, eff, srcinfo })
  }
}

/// The statement variants.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
  /// `name[idx] = rhs`
  Assign {
    /// Target buffer or scalar.
    name: Sym,
    /// Type of the assigned element.
    ty: Type,
    /// Optional front-end cast annotation.
    cast: Option<Box<str>>,
    /// Access indices.
    idx: Box<[Rc<Expr>]>,
    /// Value stored.
    rhs: Rc<Expr>,
  },
  /// `name[idx] += rhs`
  Reduce {
    /// Target buffer or scalar.
    name: Sym,
    /// Type of the reduced element.
    ty: Type,
    /// Optional front-end cast annotation.
    cast: Option<Box<str>>,
    /// Access indices.
    idx: Box<[Rc<Expr>]>,
    /// Value accumulated.
    rhs: Rc<Expr>,
  },
  /// Write of a config field.
  WriteConfig {
    /// The config.
    config: Cfg,
    /// The field name.
    field: Box<str>,
    /// Value stored.
    rhs: Rc<Expr>,
  },
  /// No-op.
  Pass,
  /// Two-way conditional.
  If {
    /// The condition.
    cond: Rc<Expr>,
    /// Taken branch.
    body: Box<[Rc<Stmt>]>,
    /// Fallback branch; may be empty.
    orelse: Box<[Rc<Stmt>]>,
  },
  /// Counted loop `for iter in [0, hi)`.
  Seq {
    /// The loop index, scoped to `body`.
    iter: Sym,
    /// Exclusive upper bound.
    hi: Rc<Expr>,
    /// Loop body.
    body: Box<[Rc<Stmt>]>,
  },
  /// Introduce a buffer that lives until the enclosing block ends.
  Alloc {
    /// The buffer.
    name: Sym,
    /// Its type.
    ty: Type,
    /// Memory class; `None` means the default class.
    mem: Option<Mem>,
  },
  /// Release a buffer introduced by `Alloc`.
  Free {
    /// The buffer.
    name: Sym,
    /// Its type.
    ty: Type,
    /// Memory class; `None` means the default class.
    mem: Option<Mem>,
  },
  /// Call a procedure.
  Call {
    /// The callee.
    f: ProcRef,
    /// Actual arguments, one per formal.
    args: Box<[Rc<Expr>]>,
  },
  /// Bind `lhs` to a window expression; scoped like an `Alloc`.
  WindowStmt {
    /// The bound window name.
    lhs: Sym,
    /// The window expression.
    rhs: Rc<Expr>,
  },
}

/// A formal procedure argument.
#[derive(Debug, Clone, PartialEq)]
pub struct FnArg {
  /// The argument symbol.
  pub name: Sym,
  /// Its type.
  pub ty: Type,
  /// Memory class for numeric arguments; `None` means the default class.
  pub mem: Option<Mem>,
  /// Source location.
  pub srcinfo: SrcInfo,
}

/// A procedure: a named, typed kernel with formal arguments, preconditions,
/// and a body.
#[derive(Debug, Clone, PartialEq)]
pub struct Proc {
  /// The procedure name.
  pub name: Ident,
  /// Formal arguments in declaration order.
  pub args: Box<[FnArg]>,
  /// Precondition expressions, asserted at entry.
  pub preds: Box<[Rc<Expr>]>,
  /// The body.
  pub body: Box<[Rc<Stmt>]>,
  /// C template for instruction procedures; when present the body is opaque
  /// and calls expand the template instead of emitting a C call.
  pub instr: Option<Box<str>>,
  /// Effect summary for the whole body.
  pub eff: Option<Rc<Effect>>,
  /// Source location.
  pub srcinfo: SrcInfo,
}

/// Shared handle to a procedure.
///
/// Equality and hashing are by reference: two procedures with identical
/// fields are distinct values. This is what call-graph deduplication keys on.
#[derive(Debug, Clone)]
pub struct ProcRef(
  /// The shared procedure.
  pub Rc<Proc>,
);

impl ProcRef {
  /// Wrap a procedure for sharing.
  pub fn new(p: Proc) -> ProcRef { ProcRef(Rc::new(p)) }
}

impl Deref for ProcRef {
  type Target = Proc;
  fn deref(&self) -> &Proc { &self.0 }
}

impl PartialEq for ProcRef {
  fn eq(&self, other: &ProcRef) -> bool { Rc::ptr_eq(&self.0, &other.0) }
}
impl Eq for ProcRef {}

impl Hash for ProcRef {
  fn hash<H: Hasher>(&self, state: &mut H) {
    (Rc::as_ptr(&self.0) as usize).hash(state);
  }
}
