//! Binder passes: free-variable collection, alpha-renaming, and argument
//! substitution.
//!
//! These three passes define the scoping discipline of the IR. Binding
//! sites are procedure formals, `Alloc` names, `WindowStmt` left-hand
//! sides, `Seq` iteration variables, and the existential names of an effect
//! set. Reference sites are `Read`/`WindowExpr`/`StrideExpr` names,
//! `Assign`/`Reduce` targets, effect-set buffers, effect variables, and the
//! backing buffer of a window type.

use std::rc::Rc;

use hashbrown::{HashMap, HashSet};
use if_chain::if_chain;

use crate::rewrite::{Rewrite, Visit};
use crate::scope::ScopedMap;
use crate::symbol::Sym;
use crate::types::effect::{EffExpr, EffExprKind, EffSet, Effect, lift_to_eff_expr};
use crate::types::ir::{Expr, ExprKind, FnArg, Proc, Stmt, StmtKind, Type, WindowType};

/// A node accepted by the heterogeneous entry points.
#[derive(Clone, Copy)]
pub enum NodeRef<'a> {
  /// A statement.
  Stmt(&'a Rc<Stmt>),
  /// An expression.
  Expr(&'a Rc<Expr>),
  /// An effect summary.
  Eff(&'a Rc<Effect>),
}

// ------------------------------------------------------------------------ //
// Free variables

/// Fold that collects symbols referenced but not bound in the visited nodes.
///
/// `If` branches share a single scope: a binding in `body` is considered
/// seen by the free-variable check of `orelse`.
#[derive(Default)]
struct FreeVars {
  env: ScopedMap<Sym, ()>,
  fv: HashSet<Sym>,
}

impl FreeVars {
  fn bind(&mut self, s: &Sym) { self.env.insert(s.clone(), ()) }

  fn mention(&mut self, s: &Sym) {
    if !self.env.contains(s) {
      self.fv.insert(s.clone());
    }
  }
}

impl Visit for FreeVars {
  fn visit_s(&mut self, s: &Stmt) {
    match &s.kind {
      StmtKind::Assign { name, .. } | StmtKind::Reduce { name, .. } => self.mention(name),
      StmtKind::WindowStmt { lhs, .. } => self.bind(lhs),
      StmtKind::If { cond, body, orelse } => {
        self.visit_e(cond);
        self.env.push();
        self.visit_stmts(body);
        self.visit_stmts(orelse);
        self.env.pop();
        self.visit_eff(s.eff.as_ref());
        return;
      }
      StmtKind::Seq { iter, hi, body } => {
        self.visit_e(hi);
        self.env.push();
        self.bind(iter);
        self.visit_stmts(body);
        self.env.pop();
        self.visit_eff(s.eff.as_ref());
        return;
      }
      StmtKind::Alloc { name, .. } => self.bind(name),
      _ => {}
    }
    self.super_s(s);
  }

  fn visit_e(&mut self, e: &Expr) {
    match &e.kind {
      ExprKind::Read { name, .. }
      | ExprKind::WindowExpr { name, .. }
      | ExprKind::StrideExpr { name, .. } => self.mention(name),
      _ => {}
    }
    self.super_e(e);
  }

  fn visit_t(&mut self, t: &Type) {
    if let Type::Window(w) = t {
      self.mention(&w.src_buf);
    }
    self.super_t(t);
  }

  fn visit_eff_es(&mut self, es: &EffSet) {
    self.mention(&es.buffer);
    self.env.push();
    for n in es.names.iter() {
      self.bind(n);
    }
    self.super_eff_es(es);
    self.env.pop();
  }

  fn visit_eff_e(&mut self, e: &EffExpr) {
    if let EffExprKind::Var(name) = &e.kind {
      self.mention(name);
    }
    self.super_eff_e(e);
  }
}

/// Free symbols of a heterogeneous node list.
#[must_use] pub fn free_vars(nodes: &[NodeRef<'_>]) -> HashSet<Sym> {
  let mut pass = FreeVars::default();
  for n in nodes {
    match *n {
      NodeRef::Stmt(s) => pass.visit_s(s),
      NodeRef::Expr(e) => pass.visit_e(e),
      NodeRef::Eff(eff) => pass.visit_eff(Some(eff)),
    }
  }
  pass.fv
}

/// Free symbols of a statement list.
#[must_use] pub fn free_vars_stmts(ss: &[Rc<Stmt>]) -> HashSet<Sym> {
  let refs: Vec<NodeRef<'_>> = ss.iter().map(NodeRef::Stmt).collect();
  free_vars(&refs)
}

/// Free symbols of an expression list.
#[must_use] pub fn free_vars_exprs(es: &[Rc<Expr>]) -> HashSet<Sym> {
  let refs: Vec<NodeRef<'_>> = es.iter().map(NodeRef::Expr).collect();
  free_vars(&refs)
}

// ------------------------------------------------------------------------ //
// Alpha renaming

/// Rewrite that fresh-copies every binding symbol and redirects references
/// through a scoped map. The output is structurally identical modulo symbol
/// identity, every bound symbol in it is unique, and free symbols are
/// preserved.
///
/// Unlike [`free_vars`], the two `If` branches are renamed in independent
/// scopes, so an `Alloc` in one branch can never capture a reference in the
/// other.
#[derive(Default)]
struct AlphaRename {
  env: ScopedMap<Sym, Sym>,
}

impl AlphaRename {
  fn rebind(&mut self, s: &Sym) -> Sym {
    let fresh = s.copy();
    self.env.insert(s.clone(), fresh.clone());
    fresh
  }

  fn rename(&self, s: &Sym) -> Option<Sym> { self.env.get(s).cloned() }
}

fn with_target(mut st: Stmt, new: Sym) -> Stmt {
  match &mut st.kind {
    StmtKind::Assign { name, .. }
    | StmtKind::Reduce { name, .. }
    | StmtKind::Alloc { name, .. } => *name = new,
    k => panic!("statement has no bindable target: {k:?}"),
  }
  st
}

fn first_stmt(rewritten: Option<Vec<Rc<Stmt>>>, orig: &Rc<Stmt>) -> Stmt {
  match rewritten {
    Some(v) => v[0].as_ref().clone(),
    None => orig.as_ref().clone(),
  }
}

impl Rewrite for AlphaRename {
  fn map_fnarg(&mut self, a: &FnArg) -> Option<FnArg> {
    let name = self.rebind(&a.name);
    let ty = self.map_t(&a.ty).unwrap_or_else(|| a.ty.clone());
    Some(FnArg { name, ty, mem: a.mem.clone(), srcinfo: a.srcinfo.clone() })
  }

  fn map_s(&mut self, s: &Rc<Stmt>) -> Option<Vec<Rc<Stmt>>> {
    match &s.kind {
      StmtKind::Assign { name, .. } | StmtKind::Reduce { name, .. } => {
        let s2 = self.super_s(s);
        match self.rename(name) {
          Some(new) => Some(vec![Rc::new(with_target(first_stmt(s2, s), new))]),
          None => s2,
        }
      }
      StmtKind::Alloc { name, .. } => {
        let s2 = self.super_s(s);
        debug_assert!(self.env.get(name).is_none(), "allocation shadows a live binding");
        let new = self.rebind(name);
        Some(vec![Rc::new(with_target(first_stmt(s2, s), new))])
      }
      StmtKind::WindowStmt { lhs, rhs } => {
        let rhs = self.apply_e(rhs);
        let lhs = self.rebind(lhs);
        let eff = self.apply_eff(s.eff.as_ref());
        Some(vec![Rc::new(Stmt {
          kind: StmtKind::WindowStmt { lhs, rhs },
          eff,
          srcinfo: s.srcinfo.clone(),
        })])
      }
      StmtKind::If { cond, body, orelse } => {
        let ncond = self.map_e(cond);
        self.env.push();
        let nbody = self.map_stmts(body);
        self.env.pop();
        self.env.push();
        let norelse = self.map_stmts(orelse);
        self.env.pop();
        let neff = self.map_eff(s.eff.as_ref());
        if ncond.is_none() && nbody.is_none() && norelse.is_none() && neff.is_none() {
          return None;
        }
        Some(vec![Rc::new(Stmt {
          kind: StmtKind::If {
            cond: ncond.unwrap_or_else(|| cond.clone()),
            body: nbody.map_or_else(|| body.clone(), Into::into),
            orelse: norelse.map_or_else(|| orelse.clone(), Into::into),
          },
          eff: neff.or_else(|| s.eff.clone()),
          srcinfo: s.srcinfo.clone(),
        })])
      }
      StmtKind::Seq { iter, hi, body } => {
        let hi = self.apply_e(hi);
        let eff = self.apply_eff(s.eff.as_ref());
        self.env.push();
        let iter = self.rebind(iter);
        let body = self.map_stmts(body).map_or_else(|| body.clone(), Into::into);
        self.env.pop();
        Some(vec![Rc::new(Stmt {
          kind: StmtKind::Seq { iter, hi, body },
          eff,
          srcinfo: s.srcinfo.clone(),
        })])
      }
      _ => self.super_s(s),
    }
  }

  fn map_e(&mut self, e: &Rc<Expr>) -> Option<Rc<Expr>> {
    match &e.kind {
      ExprKind::Read { name, .. }
      | ExprKind::WindowExpr { name, .. }
      | ExprKind::StrideExpr { name, .. } => {
        let e2 = self.super_e(e);
        match self.rename(name) {
          Some(new) => {
            let mut out = e2.map_or_else(|| e.as_ref().clone(), |r| r.as_ref().clone());
            match &mut out.kind {
              ExprKind::Read { name, .. }
              | ExprKind::WindowExpr { name, .. }
              | ExprKind::StrideExpr { name, .. } => *name = new,
              _ => unreachable!(),
            }
            Some(Rc::new(out))
          }
          None => e2,
        }
      }
      _ => self.super_e(e),
    }
  }

  fn map_eff_es(&mut self, es: &Rc<EffSet>) -> Option<Rc<EffSet>> {
    self.env.push();
    let names: Box<[Sym]> = es.names.iter().map(|n| self.rebind(n)).collect();
    let mut out = self
      .super_eff_es(es)
      .map_or_else(|| es.as_ref().clone(), |r| r.as_ref().clone());
    out.buffer = self.rename(&es.buffer).unwrap_or_else(|| es.buffer.clone());
    out.names = names;
    self.env.pop();
    Some(Rc::new(out))
  }

  fn map_eff_e(&mut self, e: &Rc<EffExpr>) -> Option<Rc<EffExpr>> {
    if let EffExprKind::Var(name) = &e.kind {
      let new = self.rename(name).unwrap_or_else(|| name.clone());
      return Some(Rc::new(EffExpr {
        kind: EffExprKind::Var(new),
        ty: e.ty.clone(),
        srcinfo: e.srcinfo.clone(),
      }));
    }
    self.super_eff_e(e)
  }

  fn map_t(&mut self, t: &Type) -> Option<Type> {
    let t2 = self.super_t(t);
    if_chain! {
      if let Type::Window(w) = t;
      if let Some(src_buf) = self.rename(&w.src_buf);
      then {
        let base = match &t2 {
          Some(Type::Window(w2)) => w2.as_ref().clone(),
          None => w.as_ref().clone(),
          _ => unreachable!(),
        };
        return Some(Type::Window(Rc::new(WindowType { src_buf, ..base })));
      }
    }
    t2
  }
}

/// Alpha-rename a whole procedure, formals included.
#[must_use] pub fn alpha_rename_proc(p: &Proc) -> Proc {
  AlphaRename::default().apply_proc(p)
}

/// Alpha-rename a statement list.
#[must_use] pub fn alpha_rename_stmts(ss: &[Rc<Stmt>]) -> Vec<Rc<Stmt>> {
  AlphaRename::default().apply_stmts(ss)
}

/// Alpha-rename an expression list.
#[must_use] pub fn alpha_rename_exprs(es: &[Rc<Expr>]) -> Vec<Rc<Expr>> {
  let mut pass = AlphaRename::default();
  es.iter().map(|e| pass.apply_e(e)).collect()
}

// ------------------------------------------------------------------------ //
// Argument substitution

/// Rewrite that replaces every reference to a bound symbol with its
/// replacement expression.
///
/// Replacement values may be any expression except a `WindowExpr`; a symbol
/// that occurs in buffer position (indexed read, window, stride, assignment
/// target, effect buffer, window backing buffer) must be bound to an
/// unindexed `Read`, whose name is adopted.
struct SubstArgs<'a> {
  binding: &'a HashMap<Sym, Rc<Expr>>,
}

impl<'a> SubstArgs<'a> {
  fn new(binding: &'a HashMap<Sym, Rc<Expr>>) -> SubstArgs<'a> {
    assert!(
      !binding.values().any(|e| matches!(e.kind, ExprKind::WindowExpr { .. })),
      "cannot substitute a window expression for an argument"
    );
    SubstArgs { binding }
  }

  /// The replacement name for a symbol in buffer position.
  fn target_name(&self, s: &Sym) -> Option<Sym> {
    let sub = self.binding.get(s)?;
    match &sub.kind {
      ExprKind::Read { name, idx } if idx.is_empty() => Some(name.clone()),
      k => panic!("buffer substitution requires an unindexed read, got {k:?}"),
    }
  }
}

impl Rewrite for SubstArgs<'_> {
  fn map_s(&mut self, s: &Rc<Stmt>) -> Option<Vec<Rc<Stmt>>> {
    let s2 = self.super_s(s);
    if let StmtKind::Assign { name, .. } | StmtKind::Reduce { name, .. } = &s.kind {
      if let Some(new) = self.target_name(name) {
        return Some(vec![Rc::new(with_target(first_stmt(s2, s), new))]);
      }
    }
    s2
  }

  fn map_e(&mut self, e: &Rc<Expr>) -> Option<Rc<Expr>> {
    match &e.kind {
      ExprKind::Read { name, idx } => {
        if let Some(sub) = self.binding.get(name) {
          if idx.is_empty() {
            return Some(sub.clone());
          }
          let new = match &sub.kind {
            ExprKind::Read { name, idx } if idx.is_empty() => name.clone(),
            k => panic!("indexed read substitution requires an unindexed read, got {k:?}"),
          };
          let idx = self.map_exprs(idx).map_or_else(|| idx.clone(), Into::into);
          return Some(Rc::new(Expr {
            kind: ExprKind::Read { name: new, idx },
            ty: e.ty.clone(),
            srcinfo: e.srcinfo.clone(),
          }));
        }
        self.super_e(e)
      }
      ExprKind::WindowExpr { name, .. } => {
        if let Some(new) = self.target_name(name) {
          let mut out = self
            .super_e(e)
            .map_or_else(|| e.as_ref().clone(), |r| r.as_ref().clone());
          let ExprKind::WindowExpr { name, .. } = &mut out.kind else { unreachable!() };
          *name = new;
          return Some(Rc::new(out));
        }
        self.super_e(e)
      }
      ExprKind::StrideExpr { name, dim } => {
        if let Some(new) = self.target_name(name) {
          return Some(Rc::new(Expr {
            kind: ExprKind::StrideExpr { name: new, dim: *dim },
            ty: e.ty.clone(),
            srcinfo: e.srcinfo.clone(),
          }));
        }
        self.super_e(e)
      }
      _ => self.super_e(e),
    }
  }

  fn map_eff_es(&mut self, es: &Rc<EffSet>) -> Option<Rc<EffSet>> {
    if let Some(new) = self.target_name(&es.buffer) {
      let mut out = self
        .super_eff_es(es)
        .map_or_else(|| es.as_ref().clone(), |r| r.as_ref().clone());
      out.buffer = new;
      return Some(Rc::new(out));
    }
    self.super_eff_es(es)
  }

  fn map_eff_e(&mut self, e: &Rc<EffExpr>) -> Option<Rc<EffExpr>> {
    if let EffExprKind::Var(name) = &e.kind {
      if let Some(sub) = self.binding.get(name) {
        // An indexable variable must stay indexable after substitution.
        debug_assert!(!e.ty.is_indexable() || sub.ty.is_indexable());
        return Some(lift_to_eff_expr(sub));
      }
    }
    self.super_eff_e(e)
  }

  fn map_t(&mut self, t: &Type) -> Option<Type> {
    let t2 = self.super_t(t);
    if_chain! {
      if let Type::Window(w) = t;
      if let Some(src_buf) = self.target_name(&w.src_buf);
      then {
        let base = match &t2 {
          Some(Type::Window(w2)) => w2.as_ref().clone(),
          None => w.as_ref().clone(),
          _ => unreachable!(),
        };
        return Some(Type::Window(Rc::new(WindowType { src_buf, ..base })));
      }
    }
    t2
  }
}

/// Substitute bound symbols throughout a statement list.
#[must_use] pub fn subst_args_stmts(
  ss: &[Rc<Stmt>],
  binding: &HashMap<Sym, Rc<Expr>>,
) -> Vec<Rc<Stmt>> {
  SubstArgs::new(binding).apply_stmts(ss)
}

/// Substitute bound symbols throughout an expression list.
#[must_use] pub fn subst_args_exprs(
  es: &[Rc<Expr>],
  binding: &HashMap<Sym, Rc<Expr>>,
) -> Vec<Rc<Expr>> {
  let mut pass = SubstArgs::new(binding);
  es.iter().map(|e| pass.apply_e(e)).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::symbol::SrcInfo;
  use crate::types::ir::Const;

  fn si() -> SrcInfo { SrcInfo::unknown() }

  fn read(s: &Sym, ty: Type) -> Rc<Expr> {
    Expr::new(ExprKind::Read { name: s.clone(), idx: Box::new([]) }, ty, si())
  }

  fn read_at(s: &Sym, i: &Sym, ty: Type) -> Rc<Expr> {
    Expr::new(
      ExprKind::Read { name: s.clone(), idx: Box::new([read(i, Type::Index)]) },
      ty,
      si(),
    )
  }

  fn assign_at(name: &Sym, i: &Sym, rhs: Rc<Expr>) -> Rc<Stmt> {
    Stmt::new(
      StmtKind::Assign {
        name: name.clone(),
        ty: Type::F32,
        cast: None,
        idx: Box::new([read(i, Type::Index)]),
        rhs,
      },
      None,
      si(),
    )
  }

  /// `for i in 0..n { dst[i] = src[i] }` plus a scalar alloc in the loop.
  fn copy_loop(n: &Sym, dst: &Sym, src: &Sym) -> Vec<Rc<Stmt>> {
    let i = Sym::fresh("i");
    let tmp = Sym::fresh("tmp");
    vec![Stmt::new(
      StmtKind::Seq {
        iter: i.clone(),
        hi: read(n, Type::Size),
        body: Box::new([
          Stmt::new(
            StmtKind::Alloc { name: tmp.clone(), ty: Type::F32, mem: None },
            None,
            si(),
          ),
          assign_at(dst, &i, read_at(src, &i, Type::F32)),
        ]),
      },
      None,
      si(),
    )]
  }

  #[test]
  fn seq_binds_its_iterator() {
    let (n, dst, src) = (Sym::fresh("n"), Sym::fresh("dst"), Sym::fresh("src"));
    let body = copy_loop(&n, &dst, &src);
    let fv = free_vars_stmts(&body);
    assert_eq!(
      fv,
      [n, dst, src].into_iter().collect::<HashSet<_>>(),
      "iterator and alloc must not be free"
    );
  }

  #[test]
  fn if_branches_share_a_scope_for_free_vars() {
    let x = Sym::fresh("x");
    let cond = Expr::new(ExprKind::Const(Const::Bool(true)), Type::Bool, si());
    let alloc = Stmt::new(StmtKind::Alloc { name: x.clone(), ty: Type::F32, mem: None }, None, si());
    let use_x = Stmt::new(
      StmtKind::Assign {
        name: x.clone(),
        ty: Type::F32,
        cast: None,
        idx: Box::new([]),
        rhs: Expr::new(ExprKind::Const(Const::Float(0.0)), Type::F32, si()),
      },
      None,
      si(),
    );
    let iff = Stmt::new(
      StmtKind::If { cond, body: Box::new([alloc]), orelse: Box::new([use_x]) },
      None,
      si(),
    );
    assert!(free_vars_stmts(&[iff]).is_empty());
  }

  #[test]
  fn alpha_rename_preserves_free_vars_and_freshens_binders() {
    let (n, dst, src) = (Sym::fresh("n"), Sym::fresh("dst"), Sym::fresh("src"));
    let body = copy_loop(&n, &dst, &src);
    let renamed = alpha_rename_stmts(&body);

    assert_eq!(free_vars_stmts(&body), free_vars_stmts(&renamed));

    let StmtKind::Seq { iter, body: inner, .. } = &renamed[0].kind else { panic!("expected loop") };
    let StmtKind::Seq { iter: orig_iter, body: orig_inner, .. } = &body[0].kind else {
      panic!("expected loop")
    };
    assert_ne!(iter, orig_iter);
    assert_eq!(iter.name(), orig_iter.name());
    let StmtKind::Alloc { name: tmp2, .. } = &inner[0].kind else { panic!("expected alloc") };
    let StmtKind::Alloc { name: tmp, .. } = &orig_inner[0].kind else { panic!("expected alloc") };
    assert_ne!(tmp2, tmp);
    // The untouched use sites still point at the free symbols.
    let StmtKind::Assign { name, rhs, .. } = &inner[1].kind else { panic!("expected assign") };
    assert_eq!(*name, dst);
    let ExprKind::Read { name: rname, .. } = &rhs.kind else { panic!("expected read") };
    assert_eq!(*rname, src);
  }

  #[test]
  fn alpha_rename_binders_are_unique() {
    let (n, dst, src) = (Sym::fresh("n"), Sym::fresh("dst"), Sym::fresh("src"));
    let mut body = copy_loop(&n, &dst, &src);
    body.extend(copy_loop(&n, &dst, &src));
    let renamed = alpha_rename_stmts(&body);

    fn collect_binders(ss: &[Rc<Stmt>], out: &mut Vec<Sym>) {
      for s in ss {
        match &s.kind {
          StmtKind::Seq { iter, body, .. } => {
            out.push(iter.clone());
            collect_binders(body, out);
          }
          StmtKind::Alloc { name, .. } => out.push(name.clone()),
          StmtKind::WindowStmt { lhs, .. } => out.push(lhs.clone()),
          StmtKind::If { body, orelse, .. } => {
            collect_binders(body, out);
            collect_binders(orelse, out);
          }
          _ => {}
        }
      }
    }
    let mut binders = Vec::new();
    collect_binders(&renamed, &mut binders);
    let unique: HashSet<Sym> = binders.iter().cloned().collect();
    assert_eq!(binders.len(), unique.len(), "every binder must be distinct");
  }

  #[test]
  fn subst_with_empty_binding_is_identity() {
    let (n, dst, src) = (Sym::fresh("n"), Sym::fresh("dst"), Sym::fresh("src"));
    let body = copy_loop(&n, &dst, &src);
    let out = subst_args_stmts(&body, &HashMap::new());
    assert_eq!(out.len(), body.len());
    for (a, b) in body.iter().zip(&out) {
      assert!(Rc::ptr_eq(a, b), "empty substitution must reuse nodes");
    }
  }

  #[test]
  fn subst_renames_free_references() {
    let (n, dst, src) = (Sym::fresh("n"), Sym::fresh("dst"), Sym::fresh("src"));
    let src2 = Sym::fresh("src2");
    let body = copy_loop(&n, &dst, &src);

    let mut binding = HashMap::new();
    binding.insert(src.clone(), read(&src2, Type::F32));
    let out = subst_args_stmts(&body, &binding);

    let mut expect: HashSet<Sym> = free_vars_stmts(&body);
    expect.remove(&src);
    expect.insert(src2.clone());
    assert_eq!(free_vars_stmts(&out), expect);
  }

  #[test]
  fn subst_replaces_scalar_reads_outright() {
    let x = Sym::fresh("x");
    let seven = Expr::new(ExprKind::Const(Const::Int(7)), Type::Int, si());
    let mut binding = HashMap::new();
    binding.insert(x.clone(), seven.clone());
    let out = subst_args_exprs(&[read(&x, Type::Int)], &binding);
    assert!(Rc::ptr_eq(&out[0], &seven));
  }

  #[test]
  #[should_panic(expected = "window expression")]
  fn subst_rejects_window_values() {
    let x = Sym::fresh("x");
    let w = Expr::new(
      ExprKind::WindowExpr { name: Sym::fresh("b"), idx: Box::new([]) },
      Type::F32,
      si(),
    );
    let mut binding = HashMap::new();
    binding.insert(x, w);
    let _ = subst_args_stmts(&[], &binding);
  }
}
