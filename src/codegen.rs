//! Call-graph closure, resource discovery, and the C emitter.
//!
//! [`compile`] turns a seed list of procedures into a self-contained
//! header/source pair. The closure of the call graph is computed here;
//! each procedure is run through the analysis pipeline and handed to the
//! per-procedure [`Compiler`], which renders statements line by line with
//! precedence-aware expression printing and memory-class dispatch. All
//! listings (window structs, configs, memories, builtins, procedures) are
//! ordered by name so identical inputs produce byte-identical output.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::sync::LazyLock;

use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use regex::Regex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::analysis::{Analysis, MemoryAnalysis, PrecisionAnalysis, WindowAnalysis};
use crate::builtin::Bif;
use crate::config::{Cfg, ConfigError};
use crate::error::{Error, Result};
use crate::memory::{Mem, MemGenError, dram};
use crate::rewrite::Visit;
use crate::scope::ScopedMap;
use crate::symbol::Sym;
use crate::types::effect::Effect;
use crate::types::ir::{
  BinOp, Expr, ExprKind, ProcRef, Stmt, StmtKind, Type, WAccess, WindowType,
};

type Strs = SmallVec<[String; 4]>;

fn op_prec(op: BinOp) -> u32 {
  match op {
    BinOp::Or => 10,
    BinOp::And => 20,
    BinOp::Eq => 30,
    BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => 40,
    BinOp::Add | BinOp::Sub => 50,
    BinOp::Mul | BinOp::Div | BinOp::Mod => 60,
  }
}

const UNARY_PREC: u32 = 70;

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\W").expect("word pattern"));
static NAME_SUFFIX: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^(.*)_(\d+)$").expect("suffix pattern"));

fn sanitize_str(s: &str) -> String {
  NON_WORD.replace_all(s, "_").into_owned()
}

// ------------------------------------------------------------------------ //
// Call-graph closure and resource discovery

struct SubProcs {
  found: Vec<ProcRef>,
}

impl Visit for SubProcs {
  fn visit_e(&mut self, _e: &Expr) {}

  fn visit_s(&mut self, s: &Stmt) {
    if let StmtKind::Call { f, .. } = &s.kind {
      if !self.found.contains(f) {
        self.found.push(f.clone());
      }
    } else {
      self.super_s(s);
    }
  }
}

fn direct_subprocs(p: &ProcRef) -> Vec<ProcRef> {
  let mut pass = SubProcs { found: Vec::new() };
  if p.instr.is_none() {
    pass.visit_proc(p);
  }
  pass.found
}

/// The transitive closure of the call graph, callees before callers.
///
/// Procedures carrying an `instr` template are leaves: their bodies are
/// opaque. A cycle among non-instruction procedures is an error naming one
/// participant.
pub fn find_all_subprocs(procs: &[ProcRef]) -> Result<Vec<ProcRef>> {
  fn walk(
    p: &ProcRef,
    visiting: &mut Vec<ProcRef>,
    seen: &mut HashSet<ProcRef>,
    out: &mut Vec<ProcRef>,
  ) -> Result<()> {
    if seen.contains(p) {
      return Ok(());
    }
    visiting.push(p.clone());
    for sp in direct_subprocs(p) {
      if visiting.contains(&sp) {
        return Err(Error::CallCycle(sp.name.to_string()));
      }
      walk(&sp, visiting, seen, out)?;
    }
    visiting.pop();
    seen.insert(p.clone());
    out.push(p.clone());
    Ok(())
  }

  let mut out = Vec::new();
  let mut seen = HashSet::new();
  for p in procs {
    walk(p, &mut Vec::new(), &mut seen, &mut out)?;
  }
  Ok(out)
}

struct FindMems<'a> {
  mems: &'a mut BTreeMap<String, Mem>,
}

impl Visit for FindMems<'_> {
  fn visit_e(&mut self, _e: &Expr) {}
  fn visit_t(&mut self, _t: &Type) {}
  fn visit_eff(&mut self, _eff: Option<&Rc<Effect>>) {}

  fn visit_s(&mut self, s: &Stmt) {
    if let StmtKind::Alloc { mem: Some(m), .. } = &s.kind {
      self.mems.entry(m.name().to_string()).or_insert_with(|| m.clone());
    } else {
      self.super_s(s);
    }
  }
}

fn find_all_mems(procs: &[ProcRef]) -> Vec<Mem> {
  let mut mems = BTreeMap::new();
  for p in procs {
    for a in &p.args {
      if let Some(m) = &a.mem {
        mems.entry(m.name().to_string()).or_insert_with(|| m.clone());
      }
    }
    FindMems { mems: &mut mems }.visit_proc(p);
  }
  mems.into_values().collect()
}

struct FindBuiltins<'a> {
  builtins: &'a mut BTreeMap<&'static str, Bif>,
}

impl Visit for FindBuiltins<'_> {
  fn visit_t(&mut self, _t: &Type) {}
  fn visit_eff(&mut self, _eff: Option<&Rc<Effect>>) {}

  fn visit_e(&mut self, e: &Expr) {
    if let ExprKind::BuiltIn { f, .. } = &e.kind {
      self.builtins.entry(f.name()).or_insert_with(|| f.clone());
    }
    self.super_e(e);
  }
}

fn find_all_builtins(procs: &[ProcRef]) -> Vec<Bif> {
  let mut builtins = BTreeMap::new();
  for p in procs {
    FindBuiltins { builtins: &mut builtins }.visit_proc(p);
  }
  builtins.into_values().collect()
}

struct FindConfigs<'a> {
  configs: &'a mut Vec<Cfg>,
}

impl FindConfigs<'_> {
  fn add(&mut self, c: &Cfg) {
    if !self.configs.iter().any(|x| x == c) {
      self.configs.push(c.clone());
    }
  }
}

impl Visit for FindConfigs<'_> {
  fn visit_t(&mut self, _t: &Type) {}
  fn visit_eff(&mut self, _eff: Option<&Rc<Effect>>) {}

  fn visit_e(&mut self, e: &Expr) {
    if let ExprKind::ReadConfig { config, .. } = &e.kind {
      let c = config.clone();
      self.add(&c);
    }
    self.super_e(e);
  }

  fn visit_s(&mut self, s: &Stmt) {
    if let StmtKind::WriteConfig { config, .. } = &s.kind {
      let c = config.clone();
      self.add(&c);
    }
    self.super_s(s);
  }
}

fn find_all_configs(procs: &[ProcRef]) -> Vec<Cfg> {
  let mut configs = Vec::new();
  for p in procs {
    FindConfigs { configs: &mut configs }.visit_proc(p);
  }
  // Stable sort: same-name configs (an error reported later) keep their
  // discovery order.
  configs.sort_by(|a, b| a.name().cmp(b.name()));
  configs
}

// ------------------------------------------------------------------------ //
// Window structs and static helpers

/// A generated window struct, unique per `(basetype, n_dims, is_const)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct WindowStruct {
  name: String,
  definition: String,
}

fn window_struct(base: &Type, n_dims: usize, is_const: bool) -> WindowStruct {
  debug_assert!(n_dims >= 1);
  let tag = match base {
    Type::F32 => "f32",
    Type::F64 => "f64",
    Type::Int8 => "i8",
    Type::Int32 => "i32",
    t => panic!("no window struct for element type {t}"),
  };
  let const_kwd = if is_const { "const " } else { "" };
  let const_suffix = if is_const { "c" } else { "" };
  let name = format!("exo_win_{n_dims}{tag}{const_suffix}");
  let definition = format!(
    "struct {name}{{\n    {const_kwd}{ctype} * const data;\n    const int_fast32_t strides[{n_dims}];\n}};",
    ctype = base.ctype()
  );
  WindowStruct { name, definition }
}

fn static_helper(name: &str) -> &'static str {
  match name {
    "exo_floor_div" => {
      "\nstatic int exo_floor_div(int num, int quot) {\n  int off = (num>=0)? 0 : quot-1;\n  return (num-off)/quot;\n}\n"
    }
    "exo_clamp_32to8" => {
      "\nstatic int8_t exo_clamp_32to8(int32_t x) {\n  return (x < -128)? -128 : ((x > 127)? 127 : x);\n}\n"
    }
    _ => panic!("unknown static helper {name}"),
  }
}

// ------------------------------------------------------------------------ //
// Entry points

fn compile_context_struct(configs: &[Cfg], lib_name: &str) -> Result<(String, Vec<String>)> {
  if configs.is_empty() {
    return Ok(("void".to_string(), Vec::new()));
  }
  let ctxt_name = format!("{lib_name}_Context");
  let mut lines = vec![format!("typedef struct {ctxt_name} {{ "), String::new()];
  let mut seen = HashSet::new();
  for c in configs {
    if !seen.insert(c.name().to_string()) {
      return Err(Error::DuplicateConfig(c.name().to_string()));
    }
    if c.is_allow_rw() {
      for l in c.c_struct_def() {
        lines.push(format!("    {l}"));
      }
    } else {
      lines.push(format!("// config '{}' not materialized", c.name()));
    }
    lines.push(String::new());
  }
  lines.push(format!("}} {ctxt_name};"));
  Ok((ctxt_name, lines))
}

fn compile_memories(mems: &[Mem]) -> Vec<String> {
  mems.iter().map(|m| m.global_code()).collect()
}

fn compile_builtins(builtins: &[Bif]) -> Vec<String> {
  builtins
    .iter()
    .filter_map(|b| {
      let g = b.globl();
      (!g.is_empty()).then_some(g)
    })
    .collect()
}

/// Compile the seed procedures and everything they call into the header
/// fragment (context struct, window structs, public declarations) and the
/// body fragment (helpers, globals, private declarations, bodies).
pub fn compile_to_strings(lib_name: &str, procs: &[ProcRef]) -> Result<(String, String)> {
  let originals: HashSet<ProcRef> = procs.iter().cloned().collect();
  let mut closure = find_all_subprocs(procs)?;
  closure.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
  debug!(lib = lib_name, procs = closure.len(), "compiling call-graph closure");

  let (ctxt_name, ctxt_def) = compile_context_struct(&find_all_configs(&closure), lib_name)?;
  let memory_code = compile_memories(&find_all_mems(&closure));
  let builtin_code = compile_builtins(&find_all_builtins(&closure));

  let mut struct_defns: BTreeSet<WindowStruct> = BTreeSet::new();
  let mut needed_helpers: BTreeSet<String> = BTreeSet::new();
  let mut public_fwd_decls = Vec::new();
  let mut private_fwd_decls = Vec::new();
  let mut proc_bodies = Vec::new();

  let analyses: [&dyn Analysis; 3] = [&PrecisionAnalysis, &WindowAnalysis, &MemoryAnalysis];

  let mut seen_names = HashSet::new();
  for p in &closure {
    if !seen_names.insert(p.name.as_str().to_string()) {
      return Err(Error::DuplicateProc(p.name.to_string()));
    }

    if let Some(instr) = &p.instr {
      // Instruction procedures are not compiled; leave a note for readers.
      let argstr = p.args.iter().map(|a| a.name.name()).join(",");
      proc_bodies.push(format!(
        "\n/* relying on the following instruction...\n{}({argstr})\n{instr}\n*/",
        p.name
      ));
      continue;
    }

    let is_public = originals.contains(p);
    let mut proc = p.clone();
    for a in analyses {
      proc = a.run(&proc)?;
      trace!(proc = %proc.name, pass = a.name(), "analysis pass done");
    }

    let compiled = Compiler::run(&proc, &ctxt_name, is_public)?;
    struct_defns.extend(compiled.window_defns);
    needed_helpers.extend(compiled.needed_helpers);
    if is_public {
      public_fwd_decls.push(compiled.decl);
    } else {
      private_fwd_decls.push(compiled.decl);
    }
    proc_bodies.push(compiled.def);
  }

  let struct_defns: Vec<String> = struct_defns.into_iter().map(|w| w.definition).collect();
  let header_contents = format!(
    "\n#include <stdint.h>\n#include <stdbool.h>\n\n\
     // Compiler feature macros adapted from Hedley (public domain)\n\
     // https://github.com/nemequ/hedley\n\n\
     #if defined(__has_builtin)\n\
     #  define EXO_HAS_BUILTIN(builtin) __has_builtin(builtin)\n\
     #else\n\
     #  define EXO_HAS_BUILTIN(builtin) (0)\n\
     #endif\n\n\
     #if EXO_HAS_BUILTIN(__builtin_assume)\n\
     #  define EXO_ASSUME(expr) __builtin_assume(expr)\n\
     #elif EXO_HAS_BUILTIN(__builtin_unreachable)\n\
     #  define EXO_ASSUME(expr) \\\n      ((void)((expr) ? 1 : (__builtin_unreachable(), 1)))\n\
     #else\n\
     #  define EXO_ASSUME(expr) ((void)(expr))\n\
     #endif\n\n\
     {}\n{}\n{}\n",
    ctxt_def.join("\n"),
    struct_defns.join("\n"),
    public_fwd_decls.join("\n"),
  );

  let helper_code: Vec<&'static str> = needed_helpers.iter().map(|h| static_helper(h)).collect();
  let body_contents = format!(
    "\n{}\n{}\n{}\n{}\n{}\n",
    helper_code.join("\n"),
    memory_code.join("\n"),
    builtin_code.join("\n"),
    private_fwd_decls.join("\n"),
    proc_bodies.join("\n"),
  );

  Ok((header_contents, body_contents))
}

/// Compile the seed procedures into a complete header/source pair for
/// `<lib>.h` and `<lib>.c`. The header carries an include guard and an
/// `extern "C"` wrapper; the source includes the header.
pub fn compile(lib_name: &str, procs: &[ProcRef]) -> Result<(String, String)> {
  let lib = sanitize_str(lib_name);
  let (fwd_decls, body) = compile_to_strings(&lib, procs)?;

  let guard = format!("{}_H", lib.to_uppercase());
  let header = format!(
    "#pragma once\n#ifndef {guard}\n#define {guard}\n\n\
     #ifdef __cplusplus\nextern \"C\" {{\n#endif\n\
     {fwd_decls}\n\
     #ifdef __cplusplus\n}}\n#endif\n#endif  // {guard}\n"
  );
  let source = format!("#include \"{lib}.h\"\n\n{body}");
  Ok((header, source))
}

// ------------------------------------------------------------------------ //
// Per-procedure compiler

/// Output of compiling one procedure.
struct Compiled {
  decl: String,
  def: String,
  window_defns: BTreeSet<WindowStruct>,
  needed_helpers: BTreeSet<String>,
}

struct Compiler {
  env: ScopedMap<Sym, String>,
  names: ScopedMap<String, String>,
  envtyp: HashMap<Sym, Type>,
  mems: HashMap<Sym, Mem>,
  tab: String,
  lines: Vec<String>,
  scalar_refs: HashSet<Sym>,
  non_const: HashSet<Sym>,
  needed_helpers: BTreeSet<String>,
  window_defns: BTreeSet<WindowStruct>,
}

impl Compiler {
  fn run(proc: &ProcRef, ctxt_name: &str, is_public: bool) -> Result<Compiled> {
    let mut c = Compiler {
      env: ScopedMap::new(),
      names: ScopedMap::new(),
      envtyp: HashMap::new(),
      mems: HashMap::new(),
      tab: String::new(),
      lines: Vec::new(),
      scalar_refs: HashSet::new(),
      non_const: HashSet::new(),
      needed_helpers: BTreeSet::new(),
      window_defns: BTreeSet::new(),
    };

    if let Some(eff) = &proc.eff {
      for es in eff.writes.iter().chain(eff.reduces.iter()) {
        c.non_const.insert(es.buffer.clone());
      }
    }

    // The context pointer owns the first C name in every procedure.
    c.new_varname(&Sym::fresh("ctxt"), None, None);
    let mut arg_strs = vec![format!("{ctxt_name} *ctxt")];
    let mut typ_comments = Vec::new();

    for a in &proc.args {
      let mem = if a.ty.is_numeric() { a.mem.clone() } else { None };
      let name_arg = c.new_varname(&a.name, Some(a.ty.clone()), mem);
      if matches!(a.ty, Type::Size | Type::Index | Type::Bool | Type::Stride) {
        arg_strs.push(format!("{} {name_arg}", a.ty.ctype()));
        typ_comments.push(format!("{name_arg} : {}", a.ty));
      } else {
        assert!(a.ty.is_numeric(), "argument {name_arg} has type {}", a.ty);
        debug_assert!(!matches!(a.ty.basetype(), Type::Num));
        if a.ty.is_real_scalar() {
          c.scalar_refs.insert(a.name.clone());
        }
        if a.ty.is_win() {
          let is_const = !c.non_const.contains(&a.name);
          let base = a.ty.basetype().clone();
          let wintyp = c.add_window_struct(&base, a.ty.shape().len(), is_const);
          arg_strs.push(format!("struct {wintyp} {name_arg}"));
        } else {
          let const_kwd = if c.non_const.contains(&a.name) { "" } else { "const " };
          let ctyp = a.ty.basetype().ctype();
          arg_strs.push(format!("{const_kwd}{ctyp}* {name_arg}"));
        }
        let mem_note = a.mem.as_ref().map_or_else(String::new, |m| format!(" @{}", m.name()));
        typ_comments.push(format!("{name_arg} : {}{mem_note}", a.ty));
      }
    }

    for pred in proc.preds.iter() {
      if !matches!(pred.kind, ExprKind::Const(_)) {
        let cond = c.comp_e(pred, 0)?;
        c.add_line(&format!("EXO_ASSUME({cond});"));
      }
    }

    c.comp_stmts(&proc.body)?;

    let static_kwd = if is_public { "" } else { "static " };
    let comment = format!(
      "// {}(\n{}\n// )\n",
      proc.name,
      typ_comments.iter().map(|s| format!("//     {s}")).join(",\n"),
    );
    let sig = arg_strs.join(", ");
    let decl = format!("{comment}{static_kwd}void {}( {sig} );\n", proc.name);
    let def = format!(
      "{comment}{static_kwd}void {}( {sig} ) {{\n{}\n}}\n",
      proc.name,
      c.lines.join("\n"),
    );

    Ok(Compiled { decl, def, window_defns: c.window_defns, needed_helpers: c.needed_helpers })
  }

  fn add_line(&mut self, line: &str) {
    if !line.is_empty() {
      self.lines.push(format!("{}{line}", self.tab));
    }
  }

  fn push_scope(&mut self) {
    self.env.push();
    self.names.push();
    self.tab.push_str("  ");
  }

  fn push_env(&mut self) {
    self.env.push();
    self.names.push();
  }

  fn push_tab(&mut self) {
    self.tab.push_str("  ");
  }

  fn pop_scope(&mut self) {
    self.env.pop();
    self.names.pop();
    let len = self.tab.len();
    self.tab.truncate(len.saturating_sub(2));
  }

  /// Allocate a fresh C identifier for `sym`, appending `_1, _2, ...` on
  /// collision with any live name (or bumping an existing numeric suffix).
  fn new_varname(&mut self, sym: &Sym, typ: Option<Type>, mem: Option<Mem>) -> String {
    let mut strnm = sym.name().to_string();
    if let Some(prev) = self.names.get(&strnm) {
      let mut s = prev.clone();
      while self.names.contains(&s) {
        s = match NAME_SUFFIX.captures(&s) {
          Some(cap) => {
            let n: u64 = cap[2].parse().expect("numeric suffix");
            format!("{}_{}", &cap[1], n + 1)
          }
          None => format!("{s}_1"),
        };
      }
      self.names.insert(strnm, s.clone());
      strnm = s;
    }
    self.names.insert(strnm.clone(), strnm.clone());
    self.env.insert(sym.clone(), strnm.clone());
    if let Some(t) = typ {
      self.envtyp.insert(sym.clone(), t);
    }
    self.mems.insert(sym.clone(), mem.unwrap_or_else(dram));
    strnm
  }

  fn c_name(&self, sym: &Sym) -> String {
    self.env.get(sym).unwrap_or_else(|| panic!("unbound symbol {sym:?}")).clone()
  }

  fn sym_type(&self, sym: &Sym) -> Type {
    self.envtyp.get(sym).unwrap_or_else(|| panic!("untyped symbol {sym:?}")).clone()
  }

  fn sym_mem(&self, sym: &Sym) -> Mem {
    self.mems.get(sym).unwrap_or_else(|| panic!("memoryless symbol {sym:?}")).clone()
  }

  // ---------------------------------------------------------------------- //
  // Address arithmetic

  fn shape_strs(&mut self, shape: &[Rc<Expr>], prec: u32) -> Result<Strs> {
    shape.iter().map(|s| self.comp_e(s, prec)).collect()
  }

  fn tensor_strides(&mut self, shape: &[Rc<Expr>], prec: u32) -> Result<Strs> {
    let szs = self.shape_strs(shape, prec.max(61))?;
    debug_assert!(!szs.is_empty());
    let mut strides: Vec<String> = vec!["1".to_string()];
    let mut acc = szs[szs.len() - 1].clone();
    for sz in szs[..szs.len() - 1].iter().rev() {
      strides.push(acc.clone());
      acc = format!("{sz} * {acc}");
    }
    strides.reverse();
    Ok(strides.into_iter().collect())
  }

  /// Per-dimension stride strings for any tensor or window. Concrete
  /// tensors compute strides right-to-left from their extents; windows read
  /// them from the struct.
  fn get_strides(&mut self, name: &str, typ: &Type, prec: u32) -> Result<Strs> {
    if typ.is_win() {
      Ok((0..typ.shape().len()).map(|i| format!("{name}.strides[{i}]")).collect())
    } else {
      let shape = typ.shape().to_vec();
      self.tensor_strides(&shape, prec)
    }
  }

  fn idx_offset(idx: &[String], strides: &[String]) -> String {
    debug_assert_eq!(idx.len(), strides.len());
    idx.iter().zip(strides).map(|(i, s)| format!("({i}) * ({s})")).join(" + ")
  }

  fn access_str(&mut self, name: &Sym, idx: &[Rc<Expr>]) -> Result<String> {
    let buf = self.c_name(name);
    let typ = self.sym_type(name);
    let idxs: Strs = idx.iter().map(|i| self.comp_e(i, 0)).collect::<Result<_>>()?;
    let strides = self.get_strides(&buf, &typ, 61)?;
    let offset = Self::idx_offset(&idxs, &strides);
    Ok(if typ.is_win() {
      format!("{buf}.data[{offset}]")
    } else {
      format!("{buf}[{offset}]")
    })
  }

  // ---------------------------------------------------------------------- //
  // Window structs

  fn add_window_struct(&mut self, base: &Type, n_dims: usize, is_const: bool) -> String {
    let ws = window_struct(base, n_dims, is_const);
    let name = ws.name.clone();
    self.window_defns.insert(ws);
    name
  }

  fn window_type(&mut self, wt: &WindowType, is_const: Option<bool>) -> String {
    let base = wt.as_tensor.basetype().clone();
    let n_dims = wt.as_tensor.shape().len();
    let is_const = is_const.unwrap_or_else(|| !self.non_const.contains(&wt.src_buf));
    self.add_window_struct(&base, n_dims, is_const)
  }

  /// The data lvalue and kept-stride list of a window expression. Strides
  /// are kept only for `Interval` dimensions; `Point`s drop theirs.
  fn window_struct_fields(&mut self, e: &Expr) -> Result<(String, String)> {
    let ExprKind::WindowExpr { name, idx } = &e.kind else {
      panic!("expected a window expression, got {:?}", e.kind)
    };
    let base = self.c_name(name);
    let basetyp = self.sym_type(name);
    let mem = self.sym_mem(name);

    let mut lo_idxs = Vec::with_capacity(idx.len());
    for w in idx.iter() {
      let lo = match w {
        WAccess::Interval { lo, .. } => lo,
        WAccess::Point { pt, .. } => pt,
      };
      lo_idxs.push(self.comp_e(lo, 0)?);
    }
    let all_strides = self.get_strides(&base, &basetyp, 0)?;
    debug_assert!(!all_strides.is_empty());
    debug_assert_eq!(all_strides.len(), idx.len());
    let data = mem.window(&basetyp, &base, &lo_idxs, &all_strides, &e.srcinfo)?;
    let strides = all_strides
      .iter()
      .zip(idx.iter())
      .filter(|(_, w)| matches!(w, WAccess::Interval { .. }))
      .map(|(s, _)| s)
      .join(", ");
    Ok((data, strides))
  }

  // ---------------------------------------------------------------------- //
  // Statements

  fn comp_stmts(&mut self, stmts: &[Rc<Stmt>]) -> Result<()> {
    for s in stmts {
      self.comp_s(s)?;
    }
    Ok(())
  }

  fn comp_s(&mut self, s: &Rc<Stmt>) -> Result<()> {
    match &s.kind {
      StmtKind::Pass => self.add_line("; // NO-OP"),
      StmtKind::Assign { name, ty, idx, rhs, .. }
      | StmtKind::Reduce { name, ty, idx, rhs, .. } => {
        let lhs = if self.scalar_refs.contains(name) {
          format!("*{}", self.c_name(name))
        } else if self.sym_type(name).is_real_scalar() {
          self.c_name(name)
        } else {
          self.access_str(name, idx)?
        };
        let rhs_s = self.comp_e(rhs, 0)?;
        let rhs_s = self.cast_mismatch(ty.basetype(), rhs.ty.basetype(), rhs_s);
        let mem = self.sym_mem(name);
        let line = if matches!(s.kind, StmtKind::Assign { .. }) {
          mem.write(s, &lhs, &rhs_s)
        } else {
          mem.reduce(s, &lhs, &rhs_s)
        };
        self.add_line(&line);
      }
      StmtKind::WriteConfig { config, field, rhs } => {
        if !config.is_allow_rw() {
          return Err(
            ConfigError(format!("{}: cannot write to config '{}'", s.srcinfo, config.name()))
              .into(),
          );
        }
        let rhs_s = self.comp_e(rhs, 0)?;
        let (_, ltyp) = config
          .lookup(field)
          .unwrap_or_else(|| panic!("config '{}' has no field '{field}'", config.name()));
        let rhs_s = if ltyp != rhs.ty && !ltyp.is_indexable() {
          self.cast_mismatch(&ltyp, rhs.ty.basetype(), rhs_s)
        } else {
          rhs_s
        };
        self.add_line(&format!("ctxt->{}.{field} = {rhs_s};", config.name()));
      }
      StmtKind::WindowStmt { lhs, rhs } => {
        let ExprKind::WindowExpr { name: src, .. } = &rhs.kind else {
          panic!("window statement rhs must be a window expression, got {:?}", rhs.kind)
        };
        let Type::Window(wt) = rhs.ty.clone() else {
          panic!("window expression with non-window type {}", rhs.ty)
        };
        let win_struct = self.window_type(&wt, None);
        let rhs_s = self.comp_e(rhs, 0)?;
        let mem = self.sym_mem(src);
        let lhs_s = self.new_varname(lhs, Some(rhs.ty.clone()), Some(mem));
        self.add_line(&format!("struct {win_struct} {lhs_s} = {rhs_s};"));
      }
      StmtKind::If { cond, body, orelse } => {
        let cond_s = self.comp_e(cond, 0)?;
        self.add_line(&format!("if ({cond_s}) {{"));
        self.push_scope();
        self.comp_stmts(body)?;
        self.pop_scope();
        if !orelse.is_empty() {
          self.add_line("} else {");
          self.push_scope();
          self.comp_stmts(orelse)?;
          self.pop_scope();
        }
        self.add_line("}");
      }
      StmtKind::Seq { iter, hi, body } => {
        let hi_s = self.comp_e(hi, 0)?;
        self.push_env();
        let itr = self.new_varname(iter, Some(Type::Index), None);
        self.add_line(&format!("for (int {itr} = 0; {itr} < {hi_s}; {itr}++) {{"));
        self.push_tab();
        self.comp_stmts(body)?;
        self.pop_scope();
        self.add_line("}");
      }
      StmtKind::Alloc { name, ty, mem } => {
        let nm = self.new_varname(name, Some(ty.clone()), mem.clone());
        debug_assert!(ty.basetype().is_real_scalar());
        debug_assert!(!matches!(ty.basetype(), Type::Num));
        let ctype = ty.basetype().ctype();
        let shape = ty.shape().to_vec();
        let shape_strs = self.shape_strs(&shape, 100)?;
        let m = mem.clone().unwrap_or_else(dram);
        let line = m.alloc(&nm, ctype, &shape_strs, &s.srcinfo)?;
        self.add_line(&line);
      }
      StmtKind::Free { name, ty, mem } => {
        let nm = self.c_name(name);
        debug_assert!(ty.basetype().is_real_scalar());
        let ctype = ty.basetype().ctype();
        let shape = ty.shape().to_vec();
        let shape_strs = self.shape_strs(&shape, 100)?;
        let m = mem.clone().unwrap_or_else(dram);
        let line = m.free(&nm, ctype, &shape_strs, &s.srcinfo)?;
        self.add_line(&line);
      }
      StmtKind::Call { f, args } => {
        debug_assert!(
          args.iter().zip(f.args.iter()).all(|(a, fa)| a.ty.is_win() == fa.ty.is_win()),
          "window-ness of call arguments must match the callee"
        );
        let mut arg_strs = Vec::with_capacity(args.len());
        for (i, e) in args.iter().enumerate() {
          arg_strs.push(self.comp_fnarg(e, f, i)?);
        }
        if let Some(instr) = &f.instr {
          let mut text = instr.to_string();
          for (i, fa) in f.args.iter().enumerate() {
            let arg_name = fa.name.name();
            if args[i].ty.is_win() {
              let ExprKind::WindowExpr { name, .. } = &args[i].kind else {
                panic!("window argument to an instruction must be a window expression")
              };
              let (data, _) = self.window_struct_fields(&args[i])?;
              text = text.replace(&format!("{{{arg_name}_data}}"), &data);
              text = text.replace(&format!("{{{arg_name}_int}}"), &self.c_name(name));
            } else {
              text = text.replace(&format!("{{{arg_name}_data}}"), &format!("({})", arg_strs[i]));
            }
            text = text.replace(&format!("{{{arg_name}}}"), &format!("({})", arg_strs[i]));
          }
          self.add_line(&text);
        } else {
          let all = std::iter::once("ctxt".to_string()).chain(arg_strs).join(",");
          self.add_line(&format!("{}({all});", f.name));
        }
      }
    }
    Ok(())
  }

  /// Insert a scalar cast when target and source basetypes differ. `i32`
  /// into `i8` clamps through a helper; every other mismatch is a C cast.
  fn cast_mismatch(&mut self, lbtyp: &Type, rbtyp: &Type, rhs: String) -> String {
    if lbtyp == rbtyp {
      return rhs;
    }
    debug_assert!(lbtyp.is_real_scalar() && rbtyp.is_real_scalar());
    if *lbtyp == Type::Int8 && *rbtyp == Type::Int32 {
      self.call_static_helper("exo_clamp_32to8", &[rhs])
    } else {
      format!("({})({rhs})", lbtyp.ctype())
    }
  }

  // ---------------------------------------------------------------------- //
  // Expressions

  /// Render a call argument. Bare reads pass index-likes and buffers by
  /// name and real scalars by address; window expressions become struct
  /// literals with the callee's constness.
  fn comp_fnarg(&mut self, e: &Rc<Expr>, f: &ProcRef, i: usize) -> Result<String> {
    match &e.kind {
      ExprKind::Read { name, idx } => {
        debug_assert!(idx.is_empty(), "call arguments read whole objects");
        Ok(self.read_arg_str(name))
      }
      ExprKind::WindowExpr { .. } => {
        let callee_buf = &f.args[i].name;
        let is_const = f.eff.as_ref().is_none_or(|eff| {
          !eff.writes.iter().chain(eff.reduces.iter()).any(|es| es.buffer == *callee_buf)
        });
        let Type::Window(wt) = e.ty.clone() else {
          panic!("window expression with non-window type {}", e.ty)
        };
        let win_struct = self.window_type(&wt, Some(is_const));
        let (data, strides) = self.window_struct_fields(e)?;
        Ok(format!("(struct {win_struct}){{ &{data}, {{ {strides} }} }}"))
      }
      _ => self.comp_e(e, 0),
    }
  }

  fn read_arg_str(&mut self, name: &Sym) -> String {
    let rtyp = self.sym_type(name);
    if rtyp.is_indexable()
      || rtyp == Type::Bool
      || rtyp == Type::Stride
      || self.scalar_refs.contains(name)
      || rtyp.is_tensor_or_window()
    {
      self.c_name(name)
    } else {
      debug_assert!(rtyp.is_real_scalar());
      format!("&{}", self.c_name(name))
    }
  }

  fn comp_builtin_arg(&mut self, e: &Rc<Expr>, fname: &str) -> Result<String> {
    match &e.kind {
      ExprKind::WindowExpr { .. } => panic!("cannot pass a window to builtin '{fname}'"),
      ExprKind::Read { name, idx } if idx.is_empty() => Ok(self.read_arg_str(name)),
      _ => self.comp_e(e, 0),
    }
  }

  /// Render an expression, parenthesizing iff its own precedence is below
  /// `prec`.
  fn comp_e(&mut self, e: &Expr, prec: u32) -> Result<String> {
    match &e.kind {
      ExprKind::Read { name, idx } => {
        let rtyp = self.sym_type(name);
        if rtyp.is_indexable() || rtyp == Type::Bool || rtyp == Type::Stride {
          return Ok(self.c_name(name));
        }
        let mem = self.sym_mem(name);
        if !mem.can_read() {
          return Err(
            MemGenError(format!(
              "{}: cannot read from buffer '{name}' in memory '{}'",
              e.srcinfo,
              mem.name()
            ))
            .into(),
          );
        }
        if self.scalar_refs.contains(name) {
          Ok(format!("*{}", self.c_name(name)))
        } else if !rtyp.is_tensor_or_window() {
          Ok(self.c_name(name))
        } else {
          self.access_str(name, idx)
        }
      }
      ExprKind::WindowExpr { .. } => {
        let Type::Window(wt) = e.ty.clone() else {
          panic!("window expression with non-window type {}", e.ty)
        };
        let win_struct = self.window_type(&wt, None);
        let (data, strides) = self.window_struct_fields(e)?;
        Ok(format!("(struct {win_struct}){{ &{data}, {{ {strides} }} }}"))
      }
      ExprKind::Const(c) => Ok(c.to_string()),
      ExprKind::BinOp { op, lhs, rhs } => {
        let local_prec = op_prec(*op);
        let int_div = *op == BinOp::Div && !e.ty.is_numeric();
        let op_str = match op {
          BinOp::And => "&&",
          BinOp::Or => "||",
          _ => op.as_str(),
        };
        let lhs_s = self.comp_e(lhs, local_prec)?;
        let rhs_s = self.comp_e(rhs, local_prec + 1)?;
        if int_div {
          // Size operands are non-negative by construction, so plain C
          // division already floors for them.
          if lhs.ty == Type::Size && rhs.ty == Type::Size {
            return Ok(format!("(({lhs_s}) / ({rhs_s}))"));
          }
          return Ok(self.call_static_helper("exo_floor_div", &[lhs_s, rhs_s]));
        }
        let out = format!("{lhs_s} {op_str} {rhs_s}");
        Ok(if local_prec < prec { format!("({out})") } else { out })
      }
      ExprKind::USub(arg) => Ok(format!("-{}", self.comp_e(arg, UNARY_PREC)?)),
      ExprKind::BuiltIn { f, args } => {
        let mut arg_strs = Vec::with_capacity(args.len());
        for a in args.iter() {
          arg_strs.push(self.comp_builtin_arg(a, f.name())?);
        }
        Ok(f.compile(&arg_strs))
      }
      ExprKind::StrideExpr { name, dim } => {
        let typ = self.sym_type(name);
        let nm = self.c_name(name);
        let strides = self.get_strides(&nm, &typ, 100)?;
        Ok(strides[*dim].clone())
      }
      ExprKind::ReadConfig { config, field } => {
        if !config.is_allow_rw() {
          return Err(
            ConfigError(format!("{}: cannot read from config '{}'", e.srcinfo, config.name()))
              .into(),
          );
        }
        Ok(format!("ctxt->{}.{field}", config.name()))
      }
    }
  }

  fn call_static_helper(&mut self, helper: &str, args: &[String]) -> String {
    self.needed_helpers.insert(helper.to_string());
    format!("{helper}({})", args.iter().join(","))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sanitize_library_names() {
    assert_eq!(sanitize_str("my-lib.v2"), "my_lib_v2");
    assert_eq!(sanitize_str("plain"), "plain");
  }

  #[test]
  fn operator_precedence_table() {
    assert!(op_prec(BinOp::Or) < op_prec(BinOp::And));
    assert!(op_prec(BinOp::And) < op_prec(BinOp::Eq));
    assert!(op_prec(BinOp::Eq) < op_prec(BinOp::Lt));
    assert!(op_prec(BinOp::Lt) < op_prec(BinOp::Add));
    assert!(op_prec(BinOp::Add) < op_prec(BinOp::Mul));
    assert!(op_prec(BinOp::Mul) < UNARY_PREC);
    assert_eq!(op_prec(BinOp::Sub), op_prec(BinOp::Add));
    assert_eq!(op_prec(BinOp::Div), op_prec(BinOp::Mod));
  }

  #[test]
  fn window_struct_naming() {
    let w = window_struct(&Type::F32, 2, true);
    assert_eq!(w.name, "exo_win_2f32c");
    assert!(w.definition.contains("const float * const data;"));
    assert!(w.definition.contains("const int_fast32_t strides[2];"));
    let w = window_struct(&Type::Int8, 1, false);
    assert_eq!(w.name, "exo_win_1i8");
    assert!(w.definition.contains("int8_t * const data;"));
    assert!(!w.definition.contains("const int8_t"));
  }
}
