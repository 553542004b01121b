//! Effect summaries and the effect expression sublanguage.
//!
//! Effects describe what a statement or procedure reads, writes, and reduces
//! on each buffer, plus its config accesses. The expression grammar here is
//! a strict subset of the IR expression grammar, kept as a separate variant
//! family so the binder-pass algebra stays clean.

use std::rc::Rc;

use crate::config::Cfg;
use crate::symbol::{SrcInfo, Sym};
use crate::types::ir::{BinOp, Const, Expr, ExprKind, Type};

/// The effect summary of a statement or procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct Effect {
  /// Buffers read.
  pub reads: Box<[Rc<EffSet>]>,
  /// Buffers written.
  pub writes: Box<[Rc<EffSet>]>,
  /// Buffers reduced into.
  pub reduces: Box<[Rc<EffSet>]>,
  /// Config fields read.
  pub config_reads: Box<[Rc<ConfigEff>]>,
  /// Config fields written.
  pub config_writes: Box<[Rc<ConfigEff>]>,
  /// Source location.
  pub srcinfo: SrcInfo,
}

impl Effect {
  /// An effect summary with no accesses.
  pub fn empty(srcinfo: SrcInfo) -> Rc<Effect> {
    Rc::new(Effect {
      reads: Box::new([]),
      writes: Box::new([]),
      reduces: Box::new([]),
      config_reads: Box::new([]),
      config_writes: Box::new([]),
      srcinfo,
    })
  }
}

/// One buffer's access set: the locations touched, existentially bound index
/// names, and an optional guard predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct EffSet {
  /// The buffer accessed.
  pub buffer: Sym,
  /// The access location tuple, e.g. `(i + 1, j)`.
  pub loc: Box<[Rc<EffExpr>]>,
  /// Existentially bound index names scoped to `loc` and `pred`.
  pub names: Box<[Sym]>,
  /// Guard predicate; the access happens only where it holds.
  pub pred: Option<Rc<EffExpr>>,
  /// Source location.
  pub srcinfo: SrcInfo,
}

/// A config field access.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEff {
  /// The config.
  pub config: Cfg,
  /// The field name.
  pub field: Box<str>,
  /// The value written; not supplied for reads.
  pub value: Option<Rc<EffExpr>>,
  /// Guard predicate.
  pub pred: Option<Rc<EffExpr>>,
  /// Source location.
  pub srcinfo: SrcInfo,
}

/// An effect expression together with its type and provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct EffExpr {
  /// The expression proper.
  pub kind: EffExprKind,
  /// Its type.
  pub ty: Type,
  /// Source location.
  pub srcinfo: SrcInfo,
}

/// The effect expression variants.
#[derive(Debug, Clone, PartialEq)]
pub enum EffExprKind {
  /// A variable.
  Var(Sym),
  /// Logical negation.
  Not(Rc<EffExpr>),
  /// A literal.
  Const(Const),
  /// A binary operation.
  BinOp {
    /// The operator.
    op: BinOp,
    /// Left operand.
    lhs: Rc<EffExpr>,
    /// Right operand.
    rhs: Rc<EffExpr>,
  },
  /// The stride of buffer `name` along dimension `dim`.
  Stride {
    /// The buffer.
    name: Sym,
    /// The dimension.
    dim: usize,
  },
  /// `tcase` where `cond` holds, `fcase` otherwise.
  Select {
    /// The condition.
    cond: Rc<EffExpr>,
    /// Value when true.
    tcase: Rc<EffExpr>,
    /// Value when false.
    fcase: Rc<EffExpr>,
  },
  /// A config field value.
  ConfigField {
    /// The config.
    config: Cfg,
    /// The field name.
    field: Box<str>,
  },
}

/// Lift a restricted Loop IR expression into the effect sublanguage.
///
/// Accepts `Read` with no indices, `Const`, `BinOp`, `USub` (lifted as
/// `0 - x`), `StrideExpr`, and `ReadConfig` (lifted to a `ConfigField` with
/// the looked-up field type). Anything else is an internal invariant
/// violation.
pub fn lift_to_eff_expr(e: &Expr) -> Rc<EffExpr> {
  let kind = match &e.kind {
    ExprKind::Read { name, idx } => {
      assert!(idx.is_empty(), "cannot lift an indexed read into the effect language");
      EffExprKind::Var(name.clone())
    }
    ExprKind::Const(v) => EffExprKind::Const(*v),
    ExprKind::BinOp { op, lhs, rhs } => EffExprKind::BinOp {
      op: *op,
      lhs: lift_to_eff_expr(lhs),
      rhs: lift_to_eff_expr(rhs),
    },
    ExprKind::USub(arg) => {
      let zero = Rc::new(EffExpr {
        kind: EffExprKind::Const(Const::Int(0)),
        ty: e.ty.clone(),
        srcinfo: e.srcinfo.clone(),
      });
      EffExprKind::BinOp { op: BinOp::Sub, lhs: zero, rhs: lift_to_eff_expr(arg) }
    }
    ExprKind::StrideExpr { name, dim } => EffExprKind::Stride { name: name.clone(), dim: *dim },
    ExprKind::ReadConfig { config, field } => {
      let (_, fty) = config
        .lookup(field)
        .unwrap_or_else(|| panic!("config '{}' has no field '{field}'", config.name()));
      return Rc::new(EffExpr {
        kind: EffExprKind::ConfigField { config: config.clone(), field: field.clone() },
        ty: fty,
        srcinfo: e.srcinfo.clone(),
      });
    }
    k => panic!("cannot lift {k:?} into the effect language"),
  };
  Rc::new(EffExpr { kind, ty: e.ty.clone(), srcinfo: e.srcinfo.clone() })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::symbol::Sym;

  fn si() -> SrcInfo { SrcInfo::unknown() }

  #[test]
  fn usub_lifts_to_zero_minus() {
    let x = Sym::fresh("x");
    let read = Expr::new(ExprKind::Read { name: x.clone(), idx: Box::new([]) }, Type::Index, si());
    let neg = Expr::new(ExprKind::USub(read), Type::Index, si());
    let lifted = lift_to_eff_expr(&neg);
    let EffExprKind::BinOp { op, lhs, rhs } = &lifted.kind else {
      panic!("expected a binop, got {:?}", lifted.kind)
    };
    assert_eq!(*op, BinOp::Sub);
    assert!(matches!(lhs.kind, EffExprKind::Const(Const::Int(0))));
    assert!(matches!(&rhs.kind, EffExprKind::Var(v) if *v == x));
  }

  #[test]
  #[should_panic(expected = "indexed read")]
  fn indexed_reads_do_not_lift() {
    let x = Sym::fresh("x");
    let i = Expr::new(ExprKind::Const(Const::Int(0)), Type::Int, si());
    let read = Expr::new(ExprKind::Read { name: x, idx: Box::new([i]) }, Type::F32, si());
    let _ = lift_to_eff_expr(&read);
  }
}
