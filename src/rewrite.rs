//! Uniform traversals over the Loop IR.
//!
//! [`Rewrite`] is a structural map: every `map_*` method returns `None` to
//! mean "no change", and a node is reconstructed only when one of its
//! children actually changed, so unchanged subtrees are shared with the
//! input by reference. `map_s` may return several statements, letting a
//! rewrite replace one statement with a sequence. [`Visit`] is the fold
//! dual: it walks every child without producing output, for analyses that
//! accumulate state.
//!
//! Both traits pair each `map_*`/`visit_*` entry point with a `super_*`
//! method holding the default structural traversal; an overriding pass calls
//! `self.super_*` to fall back to it. The canonical visitation order is:
//! for a statement, indices, then right-hand side, then type, then effect;
//! for an expression, children left to right, then type; for a window
//! access, lo then hi (or pt).

use std::rc::Rc;

use crate::types::effect::{ConfigEff, EffExpr, EffExprKind, EffSet, Effect};
use crate::types::ir::{
  ExprKind, FnArg, Proc, Stmt, StmtKind, TensorType, Type, WAccess, WindowType,
};
use crate::types::ir::Expr;

/// Apply `f` across a slice, returning `None` iff `f` returned `None` for
/// every element.
pub fn map_list<T: Clone>(xs: &[T], mut f: impl FnMut(&T) -> Option<T>) -> Option<Vec<T>> {
  let mut out = Vec::with_capacity(xs.len());
  let mut changed = false;
  for x in xs {
    match f(x) {
      Some(y) => {
        changed = true;
        out.push(y);
      }
      None => out.push(x.clone()),
    }
  }
  changed.then_some(out)
}

/// Statement variant of [`map_list`]: an element may rewrite to several
/// statements, which are spliced in place.
pub fn map_stmt_list(
  xs: &[Rc<Stmt>],
  mut f: impl FnMut(&Rc<Stmt>) -> Option<Vec<Rc<Stmt>>>,
) -> Option<Vec<Rc<Stmt>>> {
  let mut out = Vec::with_capacity(xs.len());
  let mut changed = false;
  for x in xs {
    match f(x) {
      Some(ys) => {
        changed = true;
        out.extend(ys);
      }
      None => out.push(x.clone()),
    }
  }
  changed.then_some(out)
}

/// Structural map over the IR. `None` means unchanged.
pub trait Rewrite {
  /// Rewrite a procedure.
  fn map_proc(&mut self, p: &Proc) -> Option<Proc> { self.super_proc(p) }

  /// Default procedure traversal. Whenever the procedure is reconstructed,
  /// trivially-true constant predicates are dropped from `preds`.
  fn super_proc(&mut self, p: &Proc) -> Option<Proc> {
    let args = map_list(&p.args, |a| self.map_fnarg(a));
    let preds = self.map_exprs(&p.preds);
    let body = self.map_stmts(&p.body);
    let eff = self.map_eff(p.eff.as_ref());
    if args.is_none() && preds.is_none() && body.is_none() && eff.is_none() {
      return None;
    }
    let preds: Box<[Rc<Expr>]> = preds
      .unwrap_or_else(|| p.preds.to_vec())
      .into_iter()
      .filter(|e| !matches!(&e.kind, ExprKind::Const(c) if c.is_truthy()))
      .collect();
    Some(Proc {
      name: p.name.clone(),
      args: args.map_or_else(|| p.args.clone(), Into::into),
      preds,
      body: body.map_or_else(|| p.body.clone(), Into::into),
      instr: p.instr.clone(),
      eff: eff.or_else(|| p.eff.clone()),
      srcinfo: p.srcinfo.clone(),
    })
  }

  /// Rewrite a formal argument.
  fn map_fnarg(&mut self, a: &FnArg) -> Option<FnArg> { self.super_fnarg(a) }

  /// Default formal-argument traversal.
  fn super_fnarg(&mut self, a: &FnArg) -> Option<FnArg> {
    self.map_t(&a.ty).map(|ty| FnArg { ty, ..a.clone() })
  }

  /// Rewrite a statement list.
  fn map_stmts(&mut self, ss: &[Rc<Stmt>]) -> Option<Vec<Rc<Stmt>>> {
    map_stmt_list(ss, |s| self.map_s(s))
  }

  /// Rewrite an expression list.
  fn map_exprs(&mut self, es: &[Rc<Expr>]) -> Option<Vec<Rc<Expr>>> {
    map_list(es, |e| self.map_e(e))
  }

  /// Rewrite one statement, possibly into several.
  fn map_s(&mut self, s: &Rc<Stmt>) -> Option<Vec<Rc<Stmt>>> { self.super_s(s) }

  /// Default statement traversal.
  fn super_s(&mut self, s: &Rc<Stmt>) -> Option<Vec<Rc<Stmt>>> {
    if matches!(s.kind, StmtKind::Pass) {
      return None;
    }
    let kind = match &s.kind {
      StmtKind::Assign { name, ty, cast, idx, rhs }
      | StmtKind::Reduce { name, ty, cast, idx, rhs } => {
        let nidx = self.map_exprs(idx);
        let nrhs = self.map_e(rhs);
        let nty = self.map_t(ty);
        (nidx.is_some() || nrhs.is_some() || nty.is_some()).then(|| {
          let name = name.clone();
          let ty = nty.unwrap_or_else(|| ty.clone());
          let cast = cast.clone();
          let idx = nidx.map_or_else(|| idx.clone(), Into::into);
          let rhs = nrhs.unwrap_or_else(|| rhs.clone());
          if matches!(s.kind, StmtKind::Assign { .. }) {
            StmtKind::Assign { name, ty, cast, idx, rhs }
          } else {
            StmtKind::Reduce { name, ty, cast, idx, rhs }
          }
        })
      }
      StmtKind::WriteConfig { config, field, rhs } => self.map_e(rhs).map(|rhs| {
        StmtKind::WriteConfig { config: config.clone(), field: field.clone(), rhs }
      }),
      StmtKind::WindowStmt { lhs, rhs } => {
        self.map_e(rhs).map(|rhs| StmtKind::WindowStmt { lhs: lhs.clone(), rhs })
      }
      StmtKind::If { cond, body, orelse } => {
        let ncond = self.map_e(cond);
        let nbody = self.map_stmts(body);
        let norelse = self.map_stmts(orelse);
        (ncond.is_some() || nbody.is_some() || norelse.is_some()).then(|| StmtKind::If {
          cond: ncond.unwrap_or_else(|| cond.clone()),
          body: nbody.map_or_else(|| body.clone(), Into::into),
          orelse: norelse.map_or_else(|| orelse.clone(), Into::into),
        })
      }
      StmtKind::Seq { iter, hi, body } => {
        let nhi = self.map_e(hi);
        let nbody = self.map_stmts(body);
        (nhi.is_some() || nbody.is_some()).then(|| StmtKind::Seq {
          iter: iter.clone(),
          hi: nhi.unwrap_or_else(|| hi.clone()),
          body: nbody.map_or_else(|| body.clone(), Into::into),
        })
      }
      StmtKind::Call { f, args } => self.map_exprs(args).map(|args| StmtKind::Call {
        f: f.clone(),
        args: args.into(),
      }),
      StmtKind::Alloc { name, ty, mem } => self.map_t(ty).map(|ty| StmtKind::Alloc {
        name: name.clone(),
        ty,
        mem: mem.clone(),
      }),
      StmtKind::Free { name, ty, mem } => self.map_t(ty).map(|ty| StmtKind::Free {
        name: name.clone(),
        ty,
        mem: mem.clone(),
      }),
      StmtKind::Pass => unreachable!(),
    };
    let eff = self.map_eff(s.eff.as_ref());
    if kind.is_none() && eff.is_none() {
      return None;
    }
    Some(vec![Rc::new(Stmt {
      kind: kind.unwrap_or_else(|| s.kind.clone()),
      eff: eff.or_else(|| s.eff.clone()),
      srcinfo: s.srcinfo.clone(),
    })])
  }

  /// Rewrite one expression.
  fn map_e(&mut self, e: &Rc<Expr>) -> Option<Rc<Expr>> { self.super_e(e) }

  /// Default expression traversal.
  fn super_e(&mut self, e: &Rc<Expr>) -> Option<Rc<Expr>> {
    let kind = match &e.kind {
      ExprKind::Read { name, idx } => self.map_exprs(idx).map(|idx| ExprKind::Read {
        name: name.clone(),
        idx: idx.into(),
      }),
      ExprKind::BinOp { op, lhs, rhs } => {
        let nl = self.map_e(lhs);
        let nr = self.map_e(rhs);
        (nl.is_some() || nr.is_some()).then(|| ExprKind::BinOp {
          op: *op,
          lhs: nl.unwrap_or_else(|| lhs.clone()),
          rhs: nr.unwrap_or_else(|| rhs.clone()),
        })
      }
      ExprKind::BuiltIn { f, args } => self.map_exprs(args).map(|args| ExprKind::BuiltIn {
        f: f.clone(),
        args: args.into(),
      }),
      ExprKind::USub(arg) => self.map_e(arg).map(ExprKind::USub),
      ExprKind::WindowExpr { name, idx } => {
        map_list(idx, |w| self.map_w_access(w)).map(|idx| ExprKind::WindowExpr {
          name: name.clone(),
          idx: idx.into(),
        })
      }
      ExprKind::Const(_) | ExprKind::StrideExpr { .. } | ExprKind::ReadConfig { .. } => None,
    };
    let ty = self.map_t(&e.ty);
    if kind.is_none() && ty.is_none() {
      return None;
    }
    Some(Rc::new(Expr {
      kind: kind.unwrap_or_else(|| e.kind.clone()),
      ty: ty.unwrap_or_else(|| e.ty.clone()),
      srcinfo: e.srcinfo.clone(),
    }))
  }

  /// Rewrite a window access.
  fn map_w_access(&mut self, w: &WAccess) -> Option<WAccess> { self.super_w_access(w) }

  /// Default window-access traversal.
  fn super_w_access(&mut self, w: &WAccess) -> Option<WAccess> {
    match w {
      WAccess::Interval { lo, hi, srcinfo } => {
        let nlo = self.map_e(lo);
        let nhi = self.map_e(hi);
        (nlo.is_some() || nhi.is_some()).then(|| WAccess::Interval {
          lo: nlo.unwrap_or_else(|| lo.clone()),
          hi: nhi.unwrap_or_else(|| hi.clone()),
          srcinfo: srcinfo.clone(),
        })
      }
      WAccess::Point { pt, srcinfo } => self.map_e(pt).map(|pt| WAccess::Point {
        pt,
        srcinfo: srcinfo.clone(),
      }),
    }
  }

  /// Rewrite a type.
  fn map_t(&mut self, t: &Type) -> Option<Type> { self.super_t(t) }

  /// Default type traversal.
  fn super_t(&mut self, t: &Type) -> Option<Type> {
    match t {
      Type::Tensor(tt) => {
        let hi = self.map_exprs(&tt.hi);
        let elem = self.map_t(&tt.elem);
        (hi.is_some() || elem.is_some()).then(|| {
          Type::Tensor(Rc::new(TensorType {
            hi: hi.map_or_else(|| tt.hi.clone(), Into::into),
            is_window: tt.is_window,
            elem: elem.unwrap_or_else(|| tt.elem.clone()),
          }))
        })
      }
      Type::Window(w) => {
        let src_type = self.map_t(&w.src_type);
        let as_tensor = self.map_t(&w.as_tensor);
        let idx = map_list(&w.idx, |wa| self.map_w_access(wa));
        (src_type.is_some() || as_tensor.is_some() || idx.is_some()).then(|| {
          Type::Window(Rc::new(WindowType {
            src_type: src_type.unwrap_or_else(|| w.src_type.clone()),
            as_tensor: as_tensor.unwrap_or_else(|| w.as_tensor.clone()),
            src_buf: w.src_buf.clone(),
            idx: idx.map_or_else(|| w.idx.clone(), Into::into),
          }))
        })
      }
      _ => None,
    }
  }

  /// Rewrite an optional effect summary. An absent effect is unchanged.
  fn map_eff(&mut self, eff: Option<&Rc<Effect>>) -> Option<Rc<Effect>> { self.super_eff(eff) }

  /// Default effect traversal.
  fn super_eff(&mut self, eff: Option<&Rc<Effect>>) -> Option<Rc<Effect>> {
    let eff = eff?;
    let reads = map_list(&eff.reads, |es| self.map_eff_es(es));
    let writes = map_list(&eff.writes, |es| self.map_eff_es(es));
    let reduces = map_list(&eff.reduces, |es| self.map_eff_es(es));
    let config_reads = map_list(&eff.config_reads, |ce| self.map_eff_ce(ce));
    let config_writes = map_list(&eff.config_writes, |ce| self.map_eff_ce(ce));
    if reads.is_none()
      && writes.is_none()
      && reduces.is_none()
      && config_reads.is_none()
      && config_writes.is_none()
    {
      return None;
    }
    Some(Rc::new(Effect {
      reads: reads.map_or_else(|| eff.reads.clone(), Into::into),
      writes: writes.map_or_else(|| eff.writes.clone(), Into::into),
      reduces: reduces.map_or_else(|| eff.reduces.clone(), Into::into),
      config_reads: config_reads.map_or_else(|| eff.config_reads.clone(), Into::into),
      config_writes: config_writes.map_or_else(|| eff.config_writes.clone(), Into::into),
      srcinfo: eff.srcinfo.clone(),
    }))
  }

  /// Rewrite one buffer access set.
  fn map_eff_es(&mut self, es: &Rc<EffSet>) -> Option<Rc<EffSet>> { self.super_eff_es(es) }

  /// Default access-set traversal.
  fn super_eff_es(&mut self, es: &Rc<EffSet>) -> Option<Rc<EffSet>> {
    let loc = map_list(&es.loc, |e| self.map_eff_e(e));
    let pred = es.pred.as_ref().and_then(|p| self.map_eff_e(p));
    if loc.is_none() && pred.is_none() {
      return None;
    }
    Some(Rc::new(EffSet {
      buffer: es.buffer.clone(),
      loc: loc.map_or_else(|| es.loc.clone(), Into::into),
      names: es.names.clone(),
      pred: pred.or_else(|| es.pred.clone()),
      srcinfo: es.srcinfo.clone(),
    }))
  }

  /// Rewrite one config access.
  fn map_eff_ce(&mut self, ce: &Rc<ConfigEff>) -> Option<Rc<ConfigEff>> { self.super_eff_ce(ce) }

  /// Default config-access traversal.
  fn super_eff_ce(&mut self, ce: &Rc<ConfigEff>) -> Option<Rc<ConfigEff>> {
    let value = ce.value.as_ref().and_then(|v| self.map_eff_e(v));
    let pred = ce.pred.as_ref().and_then(|p| self.map_eff_e(p));
    if value.is_none() && pred.is_none() {
      return None;
    }
    Some(Rc::new(ConfigEff {
      config: ce.config.clone(),
      field: ce.field.clone(),
      value: value.or_else(|| ce.value.clone()),
      pred: pred.or_else(|| ce.pred.clone()),
      srcinfo: ce.srcinfo.clone(),
    }))
  }

  /// Rewrite one effect expression.
  fn map_eff_e(&mut self, e: &Rc<EffExpr>) -> Option<Rc<EffExpr>> { self.super_eff_e(e) }

  /// Default effect-expression traversal.
  fn super_eff_e(&mut self, e: &Rc<EffExpr>) -> Option<Rc<EffExpr>> {
    let kind = match &e.kind {
      EffExprKind::BinOp { op, lhs, rhs } => {
        let nl = self.map_eff_e(lhs);
        let nr = self.map_eff_e(rhs);
        (nl.is_some() || nr.is_some()).then(|| EffExprKind::BinOp {
          op: *op,
          lhs: nl.unwrap_or_else(|| lhs.clone()),
          rhs: nr.unwrap_or_else(|| rhs.clone()),
        })
      }
      EffExprKind::Not(arg) => self.map_eff_e(arg).map(EffExprKind::Not),
      EffExprKind::Select { cond, tcase, fcase } => {
        let nc = self.map_eff_e(cond);
        let nt = self.map_eff_e(tcase);
        let nf = self.map_eff_e(fcase);
        (nc.is_some() || nt.is_some() || nf.is_some()).then(|| EffExprKind::Select {
          cond: nc.unwrap_or_else(|| cond.clone()),
          tcase: nt.unwrap_or_else(|| tcase.clone()),
          fcase: nf.unwrap_or_else(|| fcase.clone()),
        })
      }
      _ => None,
    };
    kind.map(|kind| Rc::new(EffExpr { kind, ty: e.ty.clone(), srcinfo: e.srcinfo.clone() }))
  }

  /// The rewritten procedure, or a clone of the input when unchanged.
  fn apply_proc(&mut self, p: &Proc) -> Proc {
    self.map_proc(p).unwrap_or_else(|| p.clone())
  }

  /// The rewritten statement(s), or the original when unchanged.
  fn apply_s(&mut self, s: &Rc<Stmt>) -> Vec<Rc<Stmt>> {
    self.map_s(s).unwrap_or_else(|| vec![s.clone()])
  }

  /// The rewritten statement list, or the original when unchanged.
  fn apply_stmts(&mut self, ss: &[Rc<Stmt>]) -> Vec<Rc<Stmt>> {
    self.map_stmts(ss).unwrap_or_else(|| ss.to_vec())
  }

  /// The rewritten expression, or the original when unchanged.
  fn apply_e(&mut self, e: &Rc<Expr>) -> Rc<Expr> {
    self.map_e(e).unwrap_or_else(|| e.clone())
  }

  /// The rewritten effect, or the original when unchanged.
  fn apply_eff(&mut self, eff: Option<&Rc<Effect>>) -> Option<Rc<Effect>> {
    self.map_eff(eff).or_else(|| eff.cloned())
  }
}

/// Structural fold over the IR: visits every child without rewriting.
pub trait Visit {
  /// Visit a procedure: argument types, preconditions, then the body.
  fn visit_proc(&mut self, p: &Proc) {
    for a in &p.args {
      self.visit_t(&a.ty);
    }
    for e in &p.preds {
      self.visit_e(e);
    }
    self.visit_stmts(&p.body);
  }

  /// Visit a statement list.
  fn visit_stmts(&mut self, ss: &[Rc<Stmt>]) {
    for s in ss {
      self.visit_s(s);
    }
  }

  /// Visit one statement.
  fn visit_s(&mut self, s: &Stmt) { self.super_s(s) }

  /// Default statement traversal.
  fn super_s(&mut self, s: &Stmt) {
    match &s.kind {
      StmtKind::Assign { ty, idx, rhs, .. } | StmtKind::Reduce { ty, idx, rhs, .. } => {
        for e in idx.iter() {
          self.visit_e(e);
        }
        self.visit_e(rhs);
        self.visit_t(ty);
      }
      StmtKind::WriteConfig { rhs, .. } | StmtKind::WindowStmt { rhs, .. } => self.visit_e(rhs),
      StmtKind::If { cond, body, orelse } => {
        self.visit_e(cond);
        self.visit_stmts(body);
        self.visit_stmts(orelse);
      }
      StmtKind::Seq { hi, body, .. } => {
        self.visit_e(hi);
        self.visit_stmts(body);
      }
      StmtKind::Call { args, .. } => {
        for e in args.iter() {
          self.visit_e(e);
        }
      }
      StmtKind::Alloc { ty, .. } | StmtKind::Free { ty, .. } => self.visit_t(ty),
      StmtKind::Pass => {}
    }
    self.visit_eff(s.eff.as_ref());
  }

  /// Visit one expression.
  fn visit_e(&mut self, e: &Expr) { self.super_e(e) }

  /// Default expression traversal.
  fn super_e(&mut self, e: &Expr) {
    match &e.kind {
      ExprKind::Read { idx, .. } => {
        for i in idx.iter() {
          self.visit_e(i);
        }
      }
      ExprKind::BinOp { lhs, rhs, .. } => {
        self.visit_e(lhs);
        self.visit_e(rhs);
      }
      ExprKind::BuiltIn { args, .. } => {
        for a in args.iter() {
          self.visit_e(a);
        }
      }
      ExprKind::USub(arg) => self.visit_e(arg),
      ExprKind::WindowExpr { idx, .. } => {
        for w in idx.iter() {
          self.visit_w_access(w);
        }
      }
      ExprKind::Const(_) | ExprKind::StrideExpr { .. } | ExprKind::ReadConfig { .. } => {}
    }
    self.visit_t(&e.ty);
  }

  /// Visit a window access.
  fn visit_w_access(&mut self, w: &WAccess) { self.super_w_access(w) }

  /// Default window-access traversal.
  fn super_w_access(&mut self, w: &WAccess) {
    match w {
      WAccess::Interval { lo, hi, .. } => {
        self.visit_e(lo);
        self.visit_e(hi);
      }
      WAccess::Point { pt, .. } => self.visit_e(pt),
    }
  }

  /// Visit a type.
  fn visit_t(&mut self, t: &Type) { self.super_t(t) }

  /// Default type traversal.
  fn super_t(&mut self, t: &Type) {
    match t {
      Type::Tensor(tt) => {
        for e in tt.hi.iter() {
          self.visit_e(e);
        }
      }
      Type::Window(w) => {
        self.visit_t(&w.src_type);
        self.visit_t(&w.as_tensor);
        for wa in w.idx.iter() {
          self.visit_w_access(wa);
        }
      }
      _ => {}
    }
  }

  /// Visit an optional effect summary.
  fn visit_eff(&mut self, eff: Option<&Rc<Effect>>) {
    if let Some(eff) = eff {
      self.super_eff(eff);
    }
  }

  /// Default effect traversal.
  fn super_eff(&mut self, eff: &Effect) {
    for es in eff.reads.iter().chain(eff.writes.iter()).chain(eff.reduces.iter()) {
      self.visit_eff_es(es);
    }
  }

  /// Visit one buffer access set.
  fn visit_eff_es(&mut self, es: &EffSet) { self.super_eff_es(es) }

  /// Default access-set traversal.
  fn super_eff_es(&mut self, es: &EffSet) {
    for e in es.loc.iter() {
      self.visit_eff_e(e);
    }
    if let Some(p) = &es.pred {
      self.visit_eff_e(p);
    }
  }

  /// Visit one effect expression.
  fn visit_eff_e(&mut self, e: &EffExpr) { self.super_eff_e(e) }

  /// Default effect-expression traversal.
  fn super_eff_e(&mut self, e: &EffExpr) {
    match &e.kind {
      EffExprKind::BinOp { lhs, rhs, .. } => {
        self.visit_eff_e(lhs);
        self.visit_eff_e(rhs);
      }
      EffExprKind::Not(arg) => self.visit_eff_e(arg),
      EffExprKind::Select { cond, tcase, fcase } => {
        self.visit_eff_e(cond);
        self.visit_eff_e(tcase);
        self.visit_eff_e(fcase);
      }
      _ => {}
    }
  }
}
