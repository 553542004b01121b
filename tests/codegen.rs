//! End-to-end scenarios for the C emitter: whole procedures in, header and
//! source text out.

use std::rc::Rc;

use pretty_assertions::assert_eq;

use loopcc::codegen::{compile, find_all_subprocs};
use loopcc::config::BasicConfig;
use loopcc::error::Error;
use loopcc::memory::{Mem, MemGenError, Memory};
use loopcc::symbol::{Ident, SrcInfo, Sym};
use loopcc::types::effect::{EffSet, Effect};
use loopcc::types::ir::{
  BinOp, Const, Expr, ExprKind, FnArg, Proc, ProcRef, Stmt, StmtKind, Type, WAccess,
};

fn si() -> SrcInfo {
  SrcInfo::unknown()
}

fn read(s: &Sym, ty: Type) -> Rc<Expr> {
  Expr::new(ExprKind::Read { name: s.clone(), idx: Box::new([]) }, ty, si())
}

fn read_at(s: &Sym, idx: Vec<Rc<Expr>>, ty: Type) -> Rc<Expr> {
  Expr::new(ExprKind::Read { name: s.clone(), idx: idx.into() }, ty, si())
}

fn int(n: i64) -> Rc<Expr> {
  Expr::new(ExprKind::Const(Const::Int(n)), Type::Int, si())
}

fn binop(op: BinOp, lhs: Rc<Expr>, rhs: Rc<Expr>, ty: Type) -> Rc<Expr> {
  Expr::new(ExprKind::BinOp { op, lhs, rhs }, ty, si())
}

fn f32_tensor(extents: Vec<Rc<Expr>>) -> Type {
  Type::tensor(extents, false, Type::F32).unwrap()
}

fn fnarg(s: &Sym, ty: Type) -> FnArg {
  FnArg { name: s.clone(), ty, mem: None, srcinfo: si() }
}

fn write_eff(bufs: &[&Sym]) -> Option<Rc<Effect>> {
  let writes: Box<[Rc<EffSet>]> = bufs
    .iter()
    .map(|b| {
      Rc::new(EffSet {
        buffer: (*b).clone(),
        loc: Box::new([]),
        names: Box::new([]),
        pred: None,
        srcinfo: si(),
      })
    })
    .collect();
  Some(Rc::new(Effect {
    reads: Box::new([]),
    writes,
    reduces: Box::new([]),
    config_reads: Box::new([]),
    config_writes: Box::new([]),
    srcinfo: si(),
  }))
}

fn make_proc(
  name: &str,
  args: Vec<FnArg>,
  preds: Vec<Rc<Expr>>,
  body: Vec<Rc<Stmt>>,
  eff: Option<Rc<Effect>>,
) -> ProcRef {
  ProcRef::new(Proc {
    name: Ident::new(name).unwrap(),
    args: args.into(),
    preds: preds.into(),
    body: body.into(),
    instr: None,
    eff,
    srcinfo: si(),
  })
}

/// `copy(n: size, A: f32[n], B: f32[n]) { for i in 0..n: B[i] = A[i] }`
fn copy_proc() -> ProcRef {
  let n = Sym::fresh("n");
  let a = Sym::fresh("A");
  let b = Sym::fresh("B");
  let i = Sym::fresh("i");
  let body = vec![Stmt::new(
    StmtKind::Seq {
      iter: i.clone(),
      hi: read(&n, Type::Size),
      body: Box::new([Stmt::new(
        StmtKind::Assign {
          name: b.clone(),
          ty: Type::F32,
          cast: None,
          idx: Box::new([read(&i, Type::Index)]),
          rhs: read_at(&a, vec![read(&i, Type::Index)], Type::F32),
        },
        None,
        si(),
      )]),
    },
    None,
    si(),
  )];
  make_proc(
    "copy",
    vec![
      fnarg(&n, Type::Size),
      fnarg(&a, f32_tensor(vec![read(&n, Type::Size)])),
      fnarg(&b, f32_tensor(vec![read(&n, Type::Size)])),
    ],
    vec![],
    body,
    write_eff(&[&b]),
  )
}

#[test]
fn s1_copy_kernel() {
  let (header, source) = compile("test_case", &[copy_proc()]).unwrap();

  assert!(header.contains("void copy( void *ctxt, int_fast32_t n, const float* A, float* B );"));
  assert!(header.contains("#ifndef TEST_CASE_H"));
  assert!(header.contains("extern \"C\""));
  assert!(header.contains("EXO_ASSUME"));

  assert!(source.starts_with("#include \"test_case.h\""));
  assert_eq!(source.matches("for (").count(), 1);
  assert!(source.contains("for (int i = 0; i < n; i++) {"));
  assert!(source.contains("B[(i) * (1)] = A[(i) * (1)];"));
  // The written buffer is mutable, the read one is const.
  assert!(source.contains("const float* A"));
  assert!(source.contains(", float* B"));
}

#[test]
fn s2_preconditions() {
  let n = Sym::fresh("n");
  let x = Sym::fresh("x");
  let body = vec![Stmt::new(
    StmtKind::Assign {
      name: x.clone(),
      ty: Type::F32,
      cast: None,
      idx: Box::new([]),
      rhs: Expr::new(ExprKind::Const(Const::Float(0.0)), Type::F32, si()),
    },
    None,
    si(),
  )];
  let p = make_proc(
    "init",
    vec![fnarg(&n, Type::Size), fnarg(&x, Type::F32)],
    vec![
      Expr::new(ExprKind::Const(Const::Bool(true)), Type::Bool, si()),
      binop(BinOp::Lt, int(0), read(&n, Type::Size), Type::Bool),
    ],
    body,
    write_eff(&[&x]),
  );
  let (_, source) = compile("pre", &[p]).unwrap();
  assert!(source.contains("EXO_ASSUME(0 < n);"));
  assert_eq!(source.matches("EXO_ASSUME(").count(), 1, "constant predicates never assert");
}

#[test]
fn s3_shared_callee_declared_once() {
  let callee = copy_proc();
  let mk_caller = |name: &str| {
    let n = Sym::fresh("n");
    let a = Sym::fresh("A");
    let b = Sym::fresh("B");
    let body = vec![Stmt::new(
      StmtKind::Call {
        f: callee.clone(),
        args: Box::new([
          read(&n, Type::Size),
          read(&a, f32_tensor(vec![read(&n, Type::Size)])),
          read(&b, f32_tensor(vec![read(&n, Type::Size)])),
        ]),
      },
      None,
      si(),
    )];
    make_proc(
      name,
      vec![
        fnarg(&n, Type::Size),
        fnarg(&a, f32_tensor(vec![read(&n, Type::Size)])),
        fnarg(&b, f32_tensor(vec![read(&n, Type::Size)])),
      ],
      vec![],
      body,
      write_eff(&[&b]),
    )
  };
  let caller1 = mk_caller("caller_one");
  let caller2 = mk_caller("caller_two");
  let (header, source) = compile("shared", &[caller1, caller2]).unwrap();

  // One static declaration and one definition for the private callee.
  assert_eq!(source.matches("static void copy( ").count(), 2);
  assert!(!header.contains("void copy( "));
  assert!(source.contains("copy(ctxt,n,A,B);"));
}

#[test]
fn closure_orders_callees_before_callers() {
  let leaf = copy_proc();
  let n = Sym::fresh("n");
  let a = Sym::fresh("A");
  let b = Sym::fresh("B");
  let call = |f: &ProcRef| {
    Stmt::new(
      StmtKind::Call {
        f: f.clone(),
        args: Box::new([
          read(&n, Type::Size),
          read(&a, f32_tensor(vec![read(&n, Type::Size)])),
          read(&b, f32_tensor(vec![read(&n, Type::Size)])),
        ]),
      },
      None,
      si(),
    )
  };
  let args = || {
    vec![
      fnarg(&n, Type::Size),
      fnarg(&a, f32_tensor(vec![read(&n, Type::Size)])),
      fnarg(&b, f32_tensor(vec![read(&n, Type::Size)])),
    ]
  };
  let mid = make_proc("mid", args(), vec![], vec![call(&leaf)], write_eff(&[&b]));
  let top = make_proc("top", args(), vec![], vec![call(&mid)], write_eff(&[&b]));
  let also_top = make_proc("also_top", args(), vec![], vec![call(&leaf)], write_eff(&[&b]));

  let order = find_all_subprocs(&[top.clone(), also_top.clone()]).unwrap();
  let pos = |p: &ProcRef| order.iter().position(|q| q == p).unwrap();
  assert!(pos(&leaf) < pos(&mid));
  assert!(pos(&mid) < pos(&top));
  assert!(pos(&leaf) < pos(&also_top));
  assert_eq!(order.len(), 4);
}

#[test]
fn s4_int32_to_int8_clamps() {
  let n = Sym::fresh("n");
  let dst = Sym::fresh("dst");
  let x = Sym::fresh("x");
  let i = Sym::fresh("i");
  let dst_ty = Type::tensor(vec![read(&n, Type::Size)], false, Type::Int8).unwrap();
  let body = vec![Stmt::new(
    StmtKind::Seq {
      iter: i.clone(),
      hi: read(&n, Type::Size),
      body: Box::new([Stmt::new(
        StmtKind::Assign {
          name: dst.clone(),
          ty: Type::Int8,
          cast: None,
          idx: Box::new([read(&i, Type::Index)]),
          rhs: read(&x, Type::Int32),
        },
        None,
        si(),
      )]),
    },
    None,
    si(),
  )];
  let p = make_proc(
    "quantize",
    vec![fnarg(&n, Type::Size), fnarg(&dst, dst_ty), fnarg(&x, Type::Int32)],
    vec![],
    body,
    write_eff(&[&dst]),
  );
  let (_, source) = compile("quant", &[p]).unwrap();
  assert!(source.contains("dst[(i) * (1)] = exo_clamp_32to8(*x);"));
  assert_eq!(source.matches("static int8_t exo_clamp_32to8(int32_t x)").count(), 1);
  assert!(!source.contains("exo_floor_div(int num"), "unused helpers stay out");
}

#[test]
fn s5_window_with_point_drops_a_dimension() {
  let n = Sym::fresh("n");
  let m = Sym::fresh("m");
  let a = Sym::fresh("A");
  let y = Sym::fresh("y");
  let src_ty = f32_tensor(vec![read(&n, Type::Size), read(&m, Type::Size)]);
  let as_tensor = Type::tensor(vec![read(&n, Type::Size)], true, Type::F32).unwrap();
  let idx = vec![
    WAccess::Interval { lo: int(0), hi: read(&n, Type::Size), srcinfo: si() },
    WAccess::Point { pt: int(2), srcinfo: si() },
  ];
  let win_ty = Type::window(src_ty.clone(), as_tensor, a.clone(), idx.clone());
  let win = Expr::new(ExprKind::WindowExpr { name: a.clone(), idx: idx.into() }, win_ty, si());
  let body = vec![Stmt::new(StmtKind::WindowStmt { lhs: y.clone(), rhs: win }, None, si())];
  let p = make_proc(
    "take_col",
    vec![fnarg(&n, Type::Size), fnarg(&m, Type::Size), fnarg(&a, src_ty)],
    vec![],
    body,
    write_eff(&[]),
  );
  let (header, source) = compile("win", &[p]).unwrap();

  // One-dimensional const struct, struct literal with exactly one stride.
  assert_eq!(header.matches("struct exo_win_1f32c{").count(), 1);
  assert!(source.contains(
    "struct exo_win_1f32c y = (struct exo_win_1f32c){ &A[(0) * (m) + (2) * (1)], { m } };"
  ));
}

#[test]
fn s6_division_semantics() {
  let n = Sym::fresh("n");
  let i = Sym::fresh("i");
  let b = Sym::fresh("b");
  let x = Sym::fresh("x");
  let y = Sym::fresh("y");
  let j = Sym::fresh("j");

  // (i + 3) / 4 with i : index floors through the helper.
  let idx_div = binop(
    BinOp::Div,
    binop(BinOp::Add, read(&i, Type::Index), int(3), Type::Index),
    int(4),
    Type::Index,
  );
  // The same shape with size operands uses plain C division.
  let size_four = Expr::new(ExprKind::Const(Const::Int(4)), Type::Size, si());
  let size_div = binop(
    BinOp::Div,
    binop(BinOp::Add, read(&n, Type::Size), size_four.clone(), Type::Size),
    size_four,
    Type::Size,
  );
  let assign = |rhs: Rc<Expr>| {
    Stmt::new(
      StmtKind::Assign {
        name: b.clone(),
        ty: Type::F32,
        cast: None,
        idx: Box::new([int(0)]),
        rhs,
      },
      None,
      si(),
    )
  };
  let body = vec![
    Stmt::new(
      StmtKind::Seq {
        iter: j.clone(),
        hi: idx_div,
        body: Box::new([assign(binop(
          BinOp::Div,
          read(&x, Type::F32),
          read(&y, Type::F32),
          Type::F32,
        ))]),
      },
      None,
      si(),
    ),
    Stmt::new(
      StmtKind::Seq { iter: j.copy(), hi: size_div, body: Box::new([Stmt::new(StmtKind::Pass, None, si())]) },
      None,
      si(),
    ),
  ];
  let p = make_proc(
    "div_kinds",
    vec![
      fnarg(&n, Type::Size),
      fnarg(&i, Type::Index),
      fnarg(&b, f32_tensor(vec![read(&n, Type::Size)])),
      fnarg(&x, Type::F32),
      fnarg(&y, Type::F32),
    ],
    vec![],
    body,
    write_eff(&[&b]),
  );
  let (_, source) = compile("division", &[p]).unwrap();

  assert!(source.contains("exo_floor_div((i + 3),4)"));
  assert!(source.contains("(((n + 4)) / (4))"));
  assert!(source.contains("*x / *y"));
  assert_eq!(source.matches("static int exo_floor_div(int num, int quot)").count(), 1);
}

#[test]
fn compile_is_deterministic() {
  let procs = [copy_proc()];
  let first = compile("det", &procs).unwrap();
  let second = compile("det", &procs).unwrap();
  assert_eq!(first, second);
}

#[test]
fn duplicate_proc_names_are_rejected() {
  let p1 = copy_proc();
  let p2 = copy_proc();
  match compile("dup", &[p1, p2]) {
    Err(Error::DuplicateProc(name)) => assert_eq!(name, "copy"),
    other => panic!("expected a duplicate-proc error, got {other:?}"),
  }
}

#[test]
fn nested_loops_rename_colliding_iterators() {
  let n = Sym::fresh("n");
  let b = Sym::fresh("B");
  let outer = Sym::fresh("i");
  let inner = Sym::fresh("i");
  let body = vec![Stmt::new(
    StmtKind::Seq {
      iter: outer.clone(),
      hi: read(&n, Type::Size),
      body: Box::new([Stmt::new(
        StmtKind::Seq {
          iter: inner.clone(),
          hi: read(&n, Type::Size),
          body: Box::new([Stmt::new(
            StmtKind::Assign {
              name: b.clone(),
              ty: Type::F32,
              cast: None,
              idx: Box::new([read(&inner, Type::Index)]),
              rhs: read_at(&b, vec![read(&outer, Type::Index)], Type::F32),
            },
            None,
            si(),
          )]),
        },
        None,
        si(),
      )]),
    },
    None,
    si(),
  )];
  let p = make_proc(
    "shadowed",
    vec![fnarg(&n, Type::Size), fnarg(&b, f32_tensor(vec![read(&n, Type::Size)]))],
    vec![],
    body,
    write_eff(&[&b]),
  );
  let (_, source) = compile("shadow", &[p]).unwrap();
  assert!(source.contains("for (int i = 0; i < n; i++) {"));
  assert!(source.contains("for (int i_1 = 0; i_1 < n; i_1++) {"));
  assert!(source.contains("B[(i_1) * (1)] = B[(i) * (1)];"));
}

#[test]
fn instruction_calls_expand_their_template() {
  let dst = Sym::fresh("dst");
  let src = Sym::fresh("src");
  let instr = ProcRef::new(Proc {
    name: Ident::new("vld1q_copy").unwrap(),
    args: Box::new([
      fnarg(&dst, Type::tensor(vec![int(4)], true, Type::F32).unwrap()),
      fnarg(&src, f32_tensor(vec![int(4)])),
    ]),
    preds: Box::new([]),
    body: Box::new([]),
    instr: Some("vld1q_copy_f32(&{dst_data}, {dst_int}, {src_data});".into()),
    eff: write_eff(&[&dst]),
    srcinfo: si(),
  });

  let a = Sym::fresh("A");
  let b = Sym::fresh("B");
  let a_ty = f32_tensor(vec![int(4)]);
  let idx = vec![WAccess::Interval { lo: int(0), hi: int(4), srcinfo: si() }];
  let win_ty = Type::window(
    a_ty.clone(),
    Type::tensor(vec![int(4)], true, Type::F32).unwrap(),
    a.clone(),
    idx.clone(),
  );
  let win = Expr::new(ExprKind::WindowExpr { name: a.clone(), idx: idx.into() }, win_ty, si());
  let body = vec![Stmt::new(
    StmtKind::Call { f: instr.clone(), args: Box::new([win, read(&b, f32_tensor(vec![int(4)]))]) },
    None,
    si(),
  )];
  let p = make_proc(
    "use_instr",
    vec![fnarg(&a, a_ty), fnarg(&b, f32_tensor(vec![int(4)]))],
    vec![],
    body,
    write_eff(&[&a]),
  );
  let (_, source) = compile("instr", &[p]).unwrap();

  assert!(source.contains("vld1q_copy_f32(&A[(0) * (1)], A, (B));"));
  assert!(source.contains("/* relying on the following instruction..."));
  assert!(!source.contains("vld1q_copy( "), "instruction procs never become C functions");
}

#[test]
fn configs_materialize_in_the_context() {
  let cfg = BasicConfig::new("tile", vec![("rows".to_string(), Type::Int32)], true);
  let n = Sym::fresh("n");
  let body = vec![Stmt::new(
    StmtKind::WriteConfig {
      config: cfg.clone(),
      field: "rows".into(),
      rhs: Expr::new(ExprKind::Const(Const::Int(8)), Type::Int32, si()),
    },
    None,
    si(),
  )];
  let p = make_proc("set_tile", vec![fnarg(&n, Type::Size)], vec![], body, write_eff(&[]));
  let (header, source) = compile("ctx", &[p]).unwrap();

  assert!(header.contains("typedef struct ctx_Context { "));
  assert!(header.contains("int32_t rows;"));
  assert!(header.contains("} ctx_Context;"));
  assert!(header.contains("void set_tile( ctx_Context *ctxt, int_fast32_t n );"));
  assert!(source.contains("ctxt->tile.rows = 8;"));
}

#[test]
fn non_rw_configs_reject_reads() {
  let cfg = BasicConfig::new("secret", vec![("v".to_string(), Type::Int32)], false);
  let n = Sym::fresh("n");
  let x = Sym::fresh("x");
  let body = vec![Stmt::new(
    StmtKind::Assign {
      name: x.clone(),
      ty: Type::Int32,
      cast: None,
      idx: Box::new([]),
      rhs: Expr::new(ExprKind::ReadConfig { config: cfg.clone(), field: "v".into() }, Type::Int32, si()),
    },
    None,
    si(),
  )];
  let p = make_proc(
    "leak",
    vec![fnarg(&n, Type::Size), fnarg(&x, Type::Int32)],
    vec![],
    body,
    write_eff(&[&x]),
  );
  match compile("cfg_err", &[p]) {
    Err(Error::Config(e)) => assert!(e.to_string().contains("cannot read from config 'secret'")),
    other => panic!("expected a config error, got {other:?}"),
  }
}

/// A write-only register-file memory, for exercising `can_read`.
#[derive(Debug, Clone, Copy)]
struct WriteOnly;

impl Memory for WriteOnly {
  fn name(&self) -> &'static str { "WriteOnly" }
  fn can_read(&self) -> bool { false }
  fn alloc(&self, name: &str, ctype: &str, _shape: &[String], _srcinfo: &SrcInfo)
    -> Result<String, MemGenError> {
    Ok(format!("{ctype} {name}[4];"))
  }
  fn free(&self, _name: &str, _ctype: &str, _shape: &[String], _srcinfo: &SrcInfo)
    -> Result<String, MemGenError> {
    Ok(String::new())
  }
}

#[test]
fn unreadable_memories_reject_reads() {
  let n = Sym::fresh("n");
  let dst = Sym::fresh("dst");
  let src = Sym::fresh("src");
  let i = Sym::fresh("i");
  let body = vec![Stmt::new(
    StmtKind::Seq {
      iter: i.clone(),
      hi: read(&n, Type::Size),
      body: Box::new([Stmt::new(
        StmtKind::Assign {
          name: dst.clone(),
          ty: Type::F32,
          cast: None,
          idx: Box::new([read(&i, Type::Index)]),
          rhs: read_at(&src, vec![read(&i, Type::Index)], Type::F32),
        },
        None,
        si(),
      )]),
    },
    None,
    si(),
  )];
  let src_arg = FnArg {
    name: src.clone(),
    ty: f32_tensor(vec![read(&n, Type::Size)]),
    mem: Some(Mem::new(WriteOnly)),
    srcinfo: si(),
  };
  let p = make_proc(
    "read_regs",
    vec![
      fnarg(&n, Type::Size),
      fnarg(&dst, f32_tensor(vec![read(&n, Type::Size)])),
      src_arg,
    ],
    vec![],
    body,
    write_eff(&[&dst]),
  );
  match compile("mem_err", &[p]) {
    Err(Error::Mem(e)) => {
      let msg = e.to_string();
      assert!(msg.contains("cannot read from buffer 'src'"));
      assert!(msg.contains("in memory 'WriteOnly'"));
    }
    other => panic!("expected a memory error, got {other:?}"),
  }
}

#[test]
fn allocations_pair_with_frees() {
  let n = Sym::fresh("n");
  let b = Sym::fresh("B");
  let tmp = Sym::fresh("tmp");
  let body = vec![
    Stmt::new(
      StmtKind::Alloc {
        name: tmp.clone(),
        ty: Type::tensor(vec![read(&n, Type::Size)], false, Type::F32).unwrap(),
        mem: None,
      },
      None,
      si(),
    ),
    Stmt::new(
      StmtKind::Assign {
        name: b.clone(),
        ty: Type::F32,
        cast: None,
        idx: Box::new([int(0)]),
        rhs: read_at(&tmp, vec![int(0)], Type::F32),
      },
      None,
      si(),
    ),
  ];
  let p = make_proc(
    "scratch",
    vec![fnarg(&n, Type::Size), fnarg(&b, f32_tensor(vec![read(&n, Type::Size)]))],
    vec![],
    body,
    write_eff(&[&b]),
  );
  let (_, source) = compile("scratch", &[p]).unwrap();
  assert!(source.contains("float *tmp = (float*) malloc(n * sizeof(*tmp));"));
  assert!(source.contains("free(tmp);"));
}
