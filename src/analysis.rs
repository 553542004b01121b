//! The per-procedure analysis pipeline run before code generation.
//!
//! The emitter applies [`PrecisionAnalysis`], [`WindowAnalysis`], and
//! [`MemoryAnalysis`] in that order to every non-instruction procedure. The
//! trait seam lets a scheduling layer substitute richer implementations.

use std::rc::Rc;

use hashbrown::HashSet;

use crate::error::{Error, Result};
use crate::rewrite::{Rewrite, Visit, map_stmt_list};
use crate::symbol::{SrcInfo, Sym};
use crate::types::ir::{Expr, ProcRef, Stmt, StmtKind, Type};

/// A proc-to-proc pass. Passes never mutate their input; an unchanged
/// procedure is returned as the same reference.
pub trait Analysis {
  /// The pass name, for tracing.
  fn name(&self) -> &'static str;

  /// Run the pass.
  fn run(&self, p: &ProcRef) -> Result<ProcRef>;
}

/// Verifies that no abstract `R` type survives to code generation.
pub struct PrecisionAnalysis;

impl Analysis for PrecisionAnalysis {
  fn name(&self) -> &'static str { "precision" }

  fn run(&self, p: &ProcRef) -> Result<ProcRef> {
    struct FindNum {
      at: Option<SrcInfo>,
    }
    impl FindNum {
      fn check(&mut self, t: &Type, srcinfo: &SrcInfo) {
        if self.at.is_none() && matches!(t.basetype(), Type::Num) {
          self.at = Some(srcinfo.clone());
        }
      }
    }
    impl Visit for FindNum {
      fn visit_e(&mut self, e: &Expr) {
        self.check(&e.ty, &e.srcinfo);
        self.super_e(e);
      }
      fn visit_s(&mut self, s: &Stmt) {
        match &s.kind {
          StmtKind::Assign { ty, .. }
          | StmtKind::Reduce { ty, .. }
          | StmtKind::Alloc { ty, .. }
          | StmtKind::Free { ty, .. } => self.check(ty, &s.srcinfo),
          _ => {}
        }
        self.super_s(s);
      }
    }

    let mut pass = FindNum { at: None };
    for a in &p.args {
      pass.check(&a.ty, &a.srcinfo);
    }
    pass.visit_proc(p);
    match pass.at {
      Some(si) => Err(Error::UnresolvedPrecision(si)),
      None => Ok(p.clone()),
    }
  }
}

/// Hook point for window lowering. Window types arrive fully resolved in
/// this crate's input contract, so the default is the identity.
pub struct WindowAnalysis;

impl Analysis for WindowAnalysis {
  fn name(&self) -> &'static str { "window" }

  fn run(&self, p: &ProcRef) -> Result<ProcRef> { Ok(p.clone()) }
}

/// Pairs every `Alloc` with a `Free` at the end of the allocating block.
///
/// Idempotent: a block that already frees a buffer is left alone, and a
/// procedure needing no insertions is returned unchanged by reference.
pub struct MemoryAnalysis;

impl Analysis for MemoryAnalysis {
  fn name(&self) -> &'static str { "memory" }

  fn run(&self, p: &ProcRef) -> Result<ProcRef> {
    struct InsertFrees;

    impl Rewrite for InsertFrees {
      fn map_stmts(&mut self, ss: &[Rc<Stmt>]) -> Option<Vec<Rc<Stmt>>> {
        let mapped = map_stmt_list(ss, |s| self.map_s(s));
        let block: &[Rc<Stmt>] = mapped.as_deref().unwrap_or(ss);
        let freed: HashSet<Sym> = block
          .iter()
          .filter_map(|s| match &s.kind {
            StmtKind::Free { name, .. } => Some(name.clone()),
            _ => None,
          })
          .collect();
        let missing: Vec<Rc<Stmt>> = block
          .iter()
          .filter_map(|s| match &s.kind {
            StmtKind::Alloc { name, ty, mem } if !freed.contains(name) => Some(Rc::new(Stmt {
              kind: StmtKind::Free { name: name.clone(), ty: ty.clone(), mem: mem.clone() },
              eff: None,
              srcinfo: s.srcinfo.clone(),
            })),
            _ => None,
          })
          .rev()
          .collect();
        if missing.is_empty() {
          return mapped;
        }
        let mut out = block.to_vec();
        out.extend(missing);
        Some(out)
      }
    }

    match InsertFrees.map_proc(p) {
      Some(q) => Ok(ProcRef::new(q)),
      None => Ok(p.clone()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::symbol::{Ident, Sym};
  use crate::types::ir::{Const, ExprKind, FnArg, Proc};

  fn si() -> SrcInfo { SrcInfo::unknown() }

  fn proc_with_body(body: Vec<Rc<Stmt>>, args: Vec<FnArg>) -> ProcRef {
    ProcRef::new(Proc {
      name: Ident::new("p").unwrap(),
      args: args.into(),
      preds: Box::new([]),
      body: body.into(),
      instr: None,
      eff: None,
      srcinfo: si(),
    })
  }

  fn alloc(name: &Sym) -> Rc<Stmt> {
    Stmt::new(StmtKind::Alloc { name: name.clone(), ty: Type::F32, mem: None }, None, si())
  }

  fn free(name: &Sym) -> Rc<Stmt> {
    Stmt::new(StmtKind::Free { name: name.clone(), ty: Type::F32, mem: None }, None, si())
  }

  #[test]
  fn memory_analysis_pairs_allocs_in_reverse_order() {
    let a = Sym::fresh("a");
    let b = Sym::fresh("b");
    let p = proc_with_body(vec![alloc(&a), alloc(&b)], vec![]);
    let q = MemoryAnalysis.run(&p).unwrap();
    let kinds: Vec<_> = q.body.iter().map(|s| s.kind.clone()).collect();
    assert_eq!(q.body.len(), 4);
    assert!(matches!(&kinds[2], StmtKind::Free { name, .. } if *name == b));
    assert!(matches!(&kinds[3], StmtKind::Free { name, .. } if *name == a));
  }

  #[test]
  fn memory_analysis_is_idempotent() {
    let a = Sym::fresh("a");
    let p = proc_with_body(vec![alloc(&a), free(&a)], vec![]);
    let q = MemoryAnalysis.run(&p).unwrap();
    assert_eq!(p, q, "explicitly freed blocks are untouched");
    let r = MemoryAnalysis.run(&MemoryAnalysis.run(&p).unwrap()).unwrap();
    assert_eq!(q.body.len(), r.body.len());
  }

  #[test]
  fn precision_analysis_rejects_abstract_num() {
    let x = Sym::fresh("x");
    let st = Stmt::new(
      StmtKind::Assign {
        name: x.clone(),
        ty: Type::Num,
        cast: None,
        idx: Box::new([]),
        rhs: Expr::new(ExprKind::Const(Const::Float(0.0)), Type::Num, si()),
      },
      None,
      si(),
    );
    let p = proc_with_body(
      vec![st],
      vec![FnArg { name: x, ty: Type::Num, mem: None, srcinfo: si() }],
    );
    assert!(matches!(PrecisionAnalysis.run(&p), Err(Error::UnresolvedPrecision(_))));

    let ok = proc_with_body(vec![], vec![]);
    let out = PrecisionAnalysis.run(&ok).unwrap();
    assert_eq!(ok, out);
  }
}
