//! AST to bytecode compiler
//!
//! A single-pass, recursive-descent-over-the-AST compiler: expressions
//! leave exactly one value on the stack, statements leave none. Locals are
//! tracked by stack slot (`Local`, capped at 256 per function per spec.md
//! §4.2), closures capture by building a deduplicated upvalue descriptor
//! list per function the way `original_source/src/Codegen/compiler.cpp`
//! does, and module-level globals are disambiguated by prefixing their
//! name with the declaring module's numeric index — identifiers can never
//! start with a digit (see [`crate::token::TokenKind::keyword`]'s sibling
//! invariant in the lexer), so `"{module_index}_{name}"` can never collide
//! with a real source identifier.
//!
//! Grounded on the teacher's `Compiler` (`Local`/`LoopContext`/
//! `UpvalueCapture` shape, kept and renamed) generalized to this
//! language's full statement/expression surface; the teacher's optimizer
//! passes and generics monomorphizer are dropped (no optimization passes,
//! no generics — see spec.md's Non-goals).

use crate::ast::*;
use crate::bytecode::{Chunk, Opcode};
use crate::diagnostic::{error_codes, Diagnostic};
use crate::heap::object::{ObjFunction, ObjHeader, ObjType};
use crate::heap::{Heap, ObjRef};
use crate::interner::Interner;
use crate::span::Span;
use crate::value::Value;
use std::collections::{HashMap, HashSet};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Native functions the VM seeds into the flat global table under their
/// bare (unprefixed) name before any module runs, the way `clock` works in
/// the teacher's language. A bare reference to one of these names resolves
/// even though no module declares it — every other bare global must be a
/// name the current module itself declares (see `resolve_global_name`).
const BUILTIN_GLOBALS: &[&str] = &["len", "str", "clock", "type_of"];

#[derive(Debug, Clone)]
struct Local {
    name: String,
    depth: usize,
    initialized: bool,
    /// Set once some nested function resolves this local as an upvalue —
    /// scope exit then emits `CloseUpvalue` instead of a bare `Pop` so the
    /// heap-side upvalue detaches from the stack slot instead of dangling.
    captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    is_local: bool,
    index: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Constructor,
}

struct LoopCtx {
    loop_start: usize,
    break_jumps: Vec<usize>,
    scope_depth: usize,
}

struct SwitchCtx {
    break_jumps: Vec<usize>,
    advance_jumps: Vec<usize>,
}

enum Enclosing {
    Loop(LoopCtx),
    Switch(SwitchCtx),
}

struct FunctionState {
    chunk: Chunk,
    locals: Vec<Local>,
    scope_depth: usize,
    upvalues: Vec<UpvalueDesc>,
    enclosing: Vec<Enclosing>,
    name: String,
    arity: u8,
    kind: FunctionKind,
}

impl FunctionState {
    fn new(name: String, kind: FunctionKind) -> Self {
        let receiver_name = match kind {
            FunctionKind::Method | FunctionKind::Constructor => "this",
            _ => "",
        };
        Self {
            chunk: Chunk::new(),
            locals: vec![Local {
                name: receiver_name.to_string(),
                depth: 0,
                initialized: true,
                captured: false,
            }],
            scope_depth: 0,
            upvalues: Vec::new(),
            enclosing: Vec::new(),
            name,
            arity: 0,
            kind,
        }
    }
}

pub struct Compiler<'h> {
    heap: &'h mut Heap,
    interner: &'h mut Interner,
    diagnostics: Vec<Diagnostic>,
    module_index: u32,
    imports: HashMap<String, u32>,
    ambient: HashMap<String, Vec<u32>>,
    declared_globals: HashSet<String>,
    funcs: Vec<FunctionState>,
}

/// Compile one module's top-level declarations into a script function.
///
/// `imports` maps each *aliased* import declared in `module` to the numeric
/// index of the module it resolves to, for the `alias::name` access form.
/// `ambient` maps each name exported by one of `module`'s *unaliased*
/// imports to the list of module indices that export it — a bare reference
/// to such a name resolves only when exactly one module exports it (spec
/// §4.2's "module symbol resolution" rule); more than one is an ambiguity
/// error, computed by the module loader from the dependency graph.
pub fn compile_module(
    module: &Module,
    module_index: u32,
    imports: HashMap<String, u32>,
    ambient: HashMap<String, Vec<u32>>,
    heap: &mut Heap,
    interner: &mut Interner,
) -> Result<ObjRef, Vec<Diagnostic>> {
    let mut declared_globals = HashSet::new();
    for decl in &module.items {
        if let Some(name) = top_level_name(decl) {
            declared_globals.insert(name.to_string());
        }
    }

    let mut compiler = Compiler {
        heap,
        interner,
        diagnostics: Vec::new(),
        module_index,
        imports,
        ambient,
        declared_globals,
        funcs: vec![FunctionState::new(module.name.clone(), FunctionKind::Script)],
    };

    for decl in &module.items {
        compiler.compile_decl(decl);
    }
    compiler.emit(Opcode::Nil, Span::dummy());
    compiler.emit(Opcode::Return, Span::dummy());

    if !compiler.diagnostics.is_empty() {
        return Err(compiler.diagnostics);
    }

    let top = compiler.funcs.pop().unwrap();
    let name_ref = compiler.interner.intern(compiler.heap, &top.name);
    let func = compiler.heap.alloc(ObjFunction {
        header: ObjHeader::new(ObjType::Function, std::mem::size_of::<ObjFunction>()),
        name: Some(name_ref),
        arity: top.arity,
        upvalue_count: top.upvalues.len(),
        chunk: top.chunk,
        module_index,
    });
    Ok(func)
}

/// Exposed to [`crate::module_loader`], which needs the same
/// decl-to-declared-name mapping to build each module's export list.
pub(crate) fn top_level_name(decl: &Decl) -> Option<&str> {
    match &decl.kind {
        DeclKind::Export(inner) => top_level_name(inner),
        DeclKind::Var { name, .. } => Some(name),
        DeclKind::Func(f) => Some(&f.name),
        DeclKind::Class(c) => Some(&c.name),
        DeclKind::Struct(s) => Some(&s.name),
        DeclKind::Stmt(_) => None,
    }
}

impl<'h> Compiler<'h> {
    fn current(&mut self) -> &mut FunctionState {
        self.funcs.last_mut().unwrap()
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.current().chunk
    }

    fn emit(&mut self, op: Opcode, span: Span) -> usize {
        self.chunk().emit(op, span)
    }

    fn emit_u8(&mut self, b: u8) {
        self.chunk().emit_u8(b);
    }

    fn emit_u16(&mut self, v: u16) {
        self.chunk().emit_u16(v);
    }

    fn error(&mut self, code: &str, message: impl Into<String>, span: Span) {
        self.diagnostics.push(Diagnostic::error_with_code(code, message, span));
    }

    fn module_global_name(&self, name: &str) -> String {
        format!("{}_{}", self.module_index, name)
    }

    fn string_constant(&mut self, s: &str, span: Span) -> u16 {
        let obj = self.interner.intern(self.heap, s);
        self.add_constant(Value::Obj(obj), span)
    }

    /// Intern a constant, reporting `TOO_MANY_CONSTANTS` instead of silently
    /// miscompiling a wrong index when the pool is full (spec.md §8).
    fn add_constant(&mut self, value: Value, span: Span) -> u16 {
        match self.chunk().add_constant(value) {
            Ok(idx) => idx,
            Err(()) => {
                self.error(error_codes::TOO_MANY_CONSTANTS, "too many constants in one chunk", span);
                0
            }
        }
    }

    /// Patch a forward jump, reporting `JUMP_TOO_LARGE` instead of silently
    /// leaving a wrong offset when the span exceeds `u16::MAX` (spec.md §8).
    fn patch_jump(&mut self, jump: usize, span: Span) {
        if self.chunk().patch_jump(jump).is_err() {
            self.error(error_codes::JUMP_TOO_LARGE, "jump distance too large", span);
        }
    }

    fn emit_global_name_operand(&mut self, name: &str, span: Span) {
        let idx = self.string_constant(name, span);
        self.emit_u16(idx);
    }

    // ---- scopes & locals -------------------------------------------------

    fn begin_scope(&mut self) {
        self.current().scope_depth += 1;
    }

    /// Pops every local declared since the matching `begin_scope`. A local
    /// some nested closure captured gets `CloseUpvalue` instead of `Pop` so
    /// the heap-side upvalue detaches from its stack slot instead of being
    /// left dangling once the slot is reused (spec.md §4.2).
    fn end_scope(&mut self, span: Span) {
        self.current().scope_depth -= 1;
        let new_depth = self.current().scope_depth;
        while let Some(local) = self.current().locals.last() {
            if local.depth > new_depth {
                let op = if local.captured { Opcode::CloseUpvalue } else { Opcode::Pop };
                self.emit(op, span);
                self.current().locals.pop();
            } else {
                break;
            }
        }
    }

    fn declare_local(&mut self, name: &str, span: Span) -> Option<u8> {
        let depth = self.current().scope_depth;
        for local in self.current().locals.iter().rev() {
            if local.depth < depth {
                break;
            }
            if local.name == name {
                self.error(
                    error_codes::UNEXPECTED_TOKEN,
                    format!("variable '{name}' already declared in this scope"),
                    span,
                );
                return None;
            }
        }
        if self.current().locals.len() >= MAX_LOCALS {
            self.error(error_codes::TOO_MANY_LOCALS, "too many local variables in function", span);
            return None;
        }
        self.current().locals.push(Local {
            name: name.to_string(),
            depth,
            initialized: false,
            captured: false,
        });
        Some((self.current().locals.len() - 1) as u8)
    }

    fn mark_initialized(&mut self) {
        if let Some(local) = self.current().locals.last_mut() {
            local.initialized = true;
        }
    }

    fn resolve_local(func: &FunctionState, name: &str) -> Option<u8> {
        for (i, local) in func.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some(i as u8);
            }
        }
        None
    }

    fn add_upvalue(func: &mut FunctionState, is_local: bool, index: u8) -> Option<u8> {
        for (i, uv) in func.upvalues.iter().enumerate() {
            if uv.is_local == is_local && uv.index == index {
                return Some(i as u8);
            }
        }
        if func.upvalues.len() >= MAX_UPVALUES {
            return None;
        }
        func.upvalues.push(UpvalueDesc { is_local, index });
        Some((func.upvalues.len() - 1) as u8)
    }

    /// Resolve `name` as an upvalue of `self.funcs[level]`, recursing
    /// outward through enclosing functions as needed.
    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        if let Some(slot) = Self::resolve_local(&self.funcs[level - 1], name) {
            self.funcs[level - 1].locals[slot as usize].captured = true;
            return Self::add_upvalue(&mut self.funcs[level], true, slot);
        }
        if let Some(upvalue) = self.resolve_upvalue(level - 1, name) {
            return Self::add_upvalue(&mut self.funcs[level], false, upvalue);
        }
        None
    }

    // ---- declarations ------------------------------------------------

    fn compile_decl(&mut self, decl: &Decl) {
        match &decl.kind {
            DeclKind::Export(inner) => self.compile_decl(inner),
            DeclKind::Var { name, initializer } => self.compile_var_decl(name, initializer, decl.span),
            DeclKind::Func(f) => self.compile_func_decl(f),
            DeclKind::Class(c) => self.compile_class_decl(c),
            DeclKind::Struct(s) => self.compile_struct_decl(s, decl.span),
            DeclKind::Stmt(s) => self.compile_stmt(s),
        }
    }

    fn compile_var_decl(&mut self, name: &str, initializer: &Option<Expr>, span: Span) {
        match initializer {
            Some(e) => self.compile_expr(e),
            None => {
                self.emit(Opcode::Nil, span);
            }
        }
        self.define_variable(name, span);
    }

    fn define_variable(&mut self, name: &str, span: Span) {
        if self.current().scope_depth == 0 {
            let global_name = if self.funcs.len() == 1 {
                self.module_global_name(name)
            } else {
                name.to_string()
            };
            self.emit(Opcode::DefineGlobal, span);
            self.emit_global_name_operand(&global_name, span);
        } else {
            self.declare_local(name, span);
            self.mark_initialized();
        }
    }

    fn compile_func_decl(&mut self, f: &FuncDecl) {
        let is_top_level = self.current().scope_depth == 0;
        if !is_top_level {
            // Declare and mark the local initialized before compiling the
            // body so the function can call itself by name recursively.
            self.declare_local(&f.name, f.span);
            self.mark_initialized();
        }
        self.compile_function(f, FunctionKind::Function);
        if is_top_level {
            // `define_variable` would re-declare a local that's already
            // bound above, so it's only reached for the global path here.
            self.define_variable(&f.name, f.span);
        }
    }

    /// Compile `f` as a standalone function value, leaving the resulting
    /// closure on the stack.
    fn compile_function(&mut self, f: &FuncDecl, kind: FunctionKind) {
        let mut state = FunctionState::new(f.name.clone(), kind);
        state.arity = f.params.len() as u8;
        self.funcs.push(state);
        self.begin_scope();
        for param in &f.params {
            self.declare_local(param, f.span);
            self.mark_initialized();
        }
        for decl in &f.body {
            self.compile_decl(decl);
        }
        self.emit(Opcode::Nil, f.span);
        self.emit(Opcode::Return, f.span);

        let compiled = self.funcs.pop().unwrap();
        let name_ref = self.interner.intern(self.heap, &compiled.name);
        let upvalues = compiled.upvalues.clone();
        let func_obj = self.heap.alloc(ObjFunction {
            header: ObjHeader::new(ObjType::Function, std::mem::size_of::<ObjFunction>()),
            name: Some(name_ref),
            arity: compiled.arity,
            upvalue_count: upvalues.len(),
            chunk: compiled.chunk,
            module_index: self.module_index,
        });

        let const_idx = self.add_constant(Value::Obj(func_obj), f.span);
        self.emit(Opcode::Closure, f.span);
        self.emit_u16(const_idx);
        self.emit_u8(upvalues.len() as u8);
        for uv in &upvalues {
            self.emit_u8(if uv.is_local { 1 } else { 0 });
            self.emit_u8(uv.index);
        }
    }

    /// A class declaration's class value is bound to its name immediately
    /// after `Class` is emitted — before the superclass/method bodies
    /// compile — so methods can reference the class by its own name and a
    /// later `named_variable_load` of it (for `Inherit`, for attaching
    /// methods) reads back a fully-defined binding rather than a global
    /// slot that doesn't exist yet.
    fn compile_class_decl(&mut self, c: &ClassDecl) {
        let is_top_level = self.current().scope_depth == 0;
        if !is_top_level {
            self.declare_local(&c.name, c.span);
            self.mark_initialized();
        }

        let name_idx = self.string_constant(&c.name, c.span);
        self.emit(Opcode::Class, c.span);
        self.emit_u16(name_idx);
        if is_top_level {
            // For a local class, the declare above already bound and
            // initialized it; `define_variable` would re-declare the same
            // name in the same scope and trip its duplicate-local check.
            self.define_variable(&c.name, c.span);
        }

        let has_superclass = c.superclass.is_some();
        if let Some((super_name, super_span)) = &c.superclass {
            self.named_variable_load(super_name, *super_span);
            self.begin_scope();
            self.declare_local("super", *super_span);
            self.mark_initialized();
            self.named_variable_load(&c.name, *super_span);
            self.emit(Opcode::Inherit, *super_span);
        }

        self.named_variable_load(&c.name, c.span);
        for method in &c.methods {
            let kind = if method.name == c.name {
                FunctionKind::Constructor
            } else {
                FunctionKind::Method
            };
            self.compile_function(method, kind);
            let name_idx = self.string_constant(&method.name, method.span);
            self.emit(Opcode::Method, method.span);
            self.emit_u16(name_idx);
        }
        self.emit(Opcode::Pop, c.span); // pop the class value pushed for method attachment

        if has_superclass {
            self.end_scope(c.span);
        }
    }

    fn named_variable_load(&mut self, name: &str, span: Span) {
        let level = self.funcs.len() - 1;
        if let Some(slot) = Self::resolve_local(&self.funcs[level], name) {
            self.emit(Opcode::GetLocal, span);
            self.emit_u8(slot);
        } else if let Some(upvalue) = self.resolve_upvalue(level, name) {
            self.emit(Opcode::GetUpvalue, span);
            self.emit_u8(upvalue);
        } else {
            let global_name = self.resolve_global_name(name, span);
            self.emit(Opcode::GetGlobal, span);
            self.emit_global_name_operand(&global_name, span);
        }
    }

    /// named_variable_load reads; see resolve_assign_global_name for the
    /// stricter rule assignment follows. A bare name with no local/upvalue
    /// binding resolves, in order: a
    /// builtin, this module's own top-level declarations, then the exports
    /// of its unaliased imports (spec.md §4.2's ambient-import rule) — two
    /// unaliased dependencies exporting the same name is an ambiguity
    /// error. Aliased imports never contribute to this namespace; they're
    /// reached only through `alias::name` (`compile_module_access`).
    fn resolve_global_name(&mut self, name: &str, span: Span) -> String {
        if BUILTIN_GLOBALS.contains(&name) {
            return name.to_string();
        }
        if self.declared_globals.contains(name) {
            return self.module_global_name(name);
        }
        match self.ambient.get(name).map(Vec::as_slice) {
            Some([only]) => format!("{only}_{name}"),
            Some(many) if many.len() > 1 => {
                self.error(
                    error_codes::AMBIGUOUS_IMPORT,
                    format!(
                        "'{name}' is ambiguous: exported by modules {}",
                        many.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", ")
                    ),
                    span,
                );
                self.module_global_name(name)
            }
            _ => {
                self.error(
                    error_codes::UNDEFINED_VARIABLE,
                    format!("undefined variable '{name}'"),
                    span,
                );
                self.module_global_name(name)
            }
        }
    }

    /// Assignment never falls back to ambient imports or builtins (spec.md
    /// §4.2: "assignment to a name not declared in the current module is a
    /// compile error") — only this module's own top-level declarations.
    fn resolve_assign_global_name(&mut self, name: &str, span: Span) -> String {
        if self.declared_globals.contains(name) {
            self.module_global_name(name)
        } else {
            self.error(
                error_codes::ASSIGN_UNDECLARED,
                format!("cannot assign to undeclared variable '{name}'"),
                span,
            );
            self.module_global_name(name)
        }
    }

    /// A struct declaration is sugar for a classless literal constructor:
    /// `struct Point { x, y }` binds `Point` to a function that takes its
    /// fields positionally and builds the same instance a `Point { x: 1, y:
    /// 2 }` literal would.
    fn compile_struct_decl(&mut self, s: &StructDecl, span: Span) {
        let is_top_level = self.current().scope_depth == 0;
        if !is_top_level {
            self.declare_local(&s.name, span);
            self.mark_initialized();
        }

        let mut state = FunctionState::new(s.name.clone(), FunctionKind::Function);
        state.arity = s.fields.len() as u8;
        self.funcs.push(state);
        self.begin_scope();
        for field in &s.fields {
            self.declare_local(field, span);
            self.mark_initialized();
        }
        for field in &s.fields {
            let slot = Self::resolve_local(self.funcs.last().unwrap(), field).unwrap();
            self.emit(Opcode::GetLocal, span);
            self.emit_u8(slot);
        }
        self.emit(Opcode::Struct, span);
        self.emit_u16(s.fields.len() as u16);
        for field in s.fields.iter().rev() {
            let idx = self.string_constant(field, span);
            self.emit_u16(idx);
        }
        self.emit(Opcode::Return, span);

        let compiled = self.funcs.pop().unwrap();
        let name_ref = self.interner.intern(self.heap, &compiled.name);
        let upvalues = compiled.upvalues.clone();
        let func_obj = self.heap.alloc(ObjFunction {
            header: ObjHeader::new(ObjType::Function, std::mem::size_of::<ObjFunction>()),
            name: Some(name_ref),
            arity: compiled.arity,
            upvalue_count: upvalues.len(),
            chunk: compiled.chunk,
            module_index: self.module_index,
        });

        let const_idx = self.add_constant(Value::Obj(func_obj), span);
        self.emit(Opcode::Closure, span);
        self.emit_u16(const_idx);
        self.emit_u8(upvalues.len() as u8);
        for uv in &upvalues {
            self.emit_u8(if uv.is_local { 1 } else { 0 });
            self.emit_u8(uv.index);
        }

        if is_top_level {
            self.define_variable(&s.name, span);
        }
    }

    // ---- statements --------------------------------------------------

    fn compile_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expr(e) => {
                self.compile_expr(e);
                self.emit(Opcode::Pop, stmt.span);
            }
            StmtKind::Print(e) => {
                self.compile_expr(e);
                self.emit(Opcode::Print, stmt.span);
            }
            StmtKind::Block(decls) => {
                self.begin_scope();
                for d in decls {
                    self.compile_decl(d);
                }
                self.end_scope(stmt.span);
            }
            StmtKind::If { cond, then_branch, else_branch } => {
                self.compile_expr(cond);
                let then_jump = self.emit(Opcode::JumpIfFalse, stmt.span);
                self.emit_u16(0);
                self.emit(Opcode::Pop, stmt.span);
                self.compile_decl(then_branch);
                let else_jump = self.emit(Opcode::Jump, stmt.span);
                self.emit_u16(0);
                self.patch_jump(then_jump + 1, stmt.span);
                self.emit(Opcode::Pop, stmt.span);
                if let Some(else_branch) = else_branch {
                    self.compile_decl(else_branch);
                }
                self.patch_jump(else_jump + 1, stmt.span);
            }
            StmtKind::While { cond, body } => self.compile_while(cond, body, stmt.span),
            StmtKind::For { init, cond, post, body } => {
                self.compile_for(init, cond, post, body, stmt.span)
            }
            StmtKind::Switch { scrutinee, cases, default } => {
                self.compile_switch(scrutinee, cases, default, stmt.span)
            }
            StmtKind::Return(value) => {
                if self.current().kind == FunctionKind::Constructor && value.is_some() {
                    self.error(
                        error_codes::RETURN_VALUE_IN_CONSTRUCTOR,
                        "can't return a value from an initializer",
                        stmt.span,
                    );
                }
                match value {
                    Some(e) => self.compile_expr(e),
                    None => {
                        if self.current().kind == FunctionKind::Constructor {
                            self.emit(Opcode::GetLocal, stmt.span);
                            self.emit_u8(0);
                        } else {
                            self.emit(Opcode::Nil, stmt.span);
                        }
                    }
                }
                self.emit(Opcode::Return, stmt.span);
            }
            StmtKind::Break => self.compile_break(stmt.span),
            StmtKind::Continue => self.compile_continue(stmt.span),
            StmtKind::Advance => self.compile_advance(stmt.span),
        }
    }

    fn compile_while(&mut self, cond: &Expr, body: &Decl, span: Span) {
        let loop_start = self.chunk().current_offset();
        self.compile_expr(cond);
        let exit_jump = self.emit(Opcode::JumpIfFalse, span);
        self.emit_u16(0);
        self.emit(Opcode::Pop, span);

        self.current().enclosing.push(Enclosing::Loop(LoopCtx {
            loop_start,
            break_jumps: Vec::new(),
            scope_depth: self.current().scope_depth,
        }));
        self.compile_decl(body);
        self.emit_loop(loop_start, span);

        self.patch_jump(exit_jump + 1, span);
        self.emit(Opcode::Pop, span);
        self.pop_loop_ctx(span);
    }

    fn compile_for(
        &mut self,
        init: &Option<Box<Decl>>,
        cond: &Option<Expr>,
        post: &Option<Expr>,
        body: &Decl,
        span: Span,
    ) {
        self.begin_scope();
        if let Some(init) = init {
            self.compile_decl(init);
        }
        let loop_start = self.chunk().current_offset();
        let exit_jump = cond.as_ref().map(|cond| {
            self.compile_expr(cond);
            let jump = self.emit(Opcode::JumpIfFalse, span);
            self.emit_u16(0);
            self.emit(Opcode::Pop, span);
            jump
        });

        self.current().enclosing.push(Enclosing::Loop(LoopCtx {
            loop_start,
            break_jumps: Vec::new(),
            scope_depth: self.current().scope_depth,
        }));
        self.compile_decl(body);

        if let Some(post) = post {
            self.compile_expr(post);
            self.emit(Opcode::Pop, span);
        }
        self.emit_loop(loop_start, span);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump + 1, span);
            self.emit(Opcode::Pop, span);
        }
        self.pop_loop_ctx(span);
        self.end_scope(span);
    }

    fn emit_loop(&mut self, loop_start: usize, span: Span) {
        self.emit(Opcode::Loop, span);
        let offset = self.chunk().current_offset() - loop_start + 2;
        self.emit_u16(offset as u16);
    }

    fn pop_loop_ctx(&mut self, span: Span) {
        if let Some(Enclosing::Loop(ctx)) = self.current().enclosing.pop() {
            for jump in ctx.break_jumps {
                self.patch_jump(jump + 1, span);
            }
        }
    }

    fn compile_switch(
        &mut self,
        scrutinee: &Expr,
        cases: &[SwitchCase],
        default: &Option<Vec<Decl>>,
        span: Span,
    ) {
        self.compile_expr(scrutinee);
        self.begin_scope();
        self.declare_local("@switch", span);
        self.mark_initialized();

        self.current().enclosing.push(Enclosing::Switch(SwitchCtx {
            break_jumps: Vec::new(),
            advance_jumps: Vec::new(),
        }));

        let switch_slot = (self.current().locals.len() - 1) as u8;
        let mut next_test_jump: Option<usize> = None;

        for case in cases {
            if let Some(jump) = next_test_jump.take() {
                self.patch_jump(jump + 1, span);
                self.emit(Opcode::Pop, span);
            }

            self.emit(Opcode::GetLocal, span);
            self.emit_u8(switch_slot);
            self.compile_expr(&case.value);
            self.emit(Opcode::Equal, span);
            let test_jump = self.emit(Opcode::JumpIfFalse, span);
            self.emit_u16(0);
            self.emit(Opcode::Pop, span);

            // Reached either by matching this case's own test or by falling
            // through from the previous case's body; both land here, past
            // this case's test, which is why advance jumps are flushed now
            // rather than before the test is emitted.
            self.flush_advance_jumps(span);

            for decl in &case.body {
                self.compile_decl(decl);
            }
            // Fallthrough is the default: a case body that runs to
            // completion falls into the next case's body exactly like an
            // explicit `advance`, skipping that case's test entirely.
            let fall_jump = self.emit(Opcode::Jump, span);
            self.emit_u16(0);
            self.push_advance_jump(fall_jump);

            next_test_jump = Some(test_jump);
        }
        if let Some(jump) = next_test_jump {
            self.patch_jump(jump + 1, span);
            self.emit(Opcode::Pop, span);
        }
        self.flush_advance_jumps(span);
        if let Some(default_body) = default {
            for decl in default_body {
                self.compile_decl(decl);
            }
        }

        if let Some(Enclosing::Switch(ctx)) = self.current().enclosing.pop() {
            for jump in ctx.break_jumps.into_iter().chain(ctx.advance_jumps) {
                self.patch_jump(jump + 1, span);
            }
        }
        self.end_scope(span);
    }

    /// Patch every pending `advance`/fallthrough jump to land here.
    fn flush_advance_jumps(&mut self, span: Span) {
        let jumps = if let Some(Enclosing::Switch(ctx)) = self.current().enclosing.last_mut() {
            std::mem::take(&mut ctx.advance_jumps)
        } else {
            Vec::new()
        };
        for jump in jumps {
            self.patch_jump(jump + 1, span);
        }
    }

    fn push_break_jump(&mut self, jump: usize) {
        for e in self.current().enclosing.iter_mut().rev() {
            match e {
                Enclosing::Loop(l) => {
                    l.break_jumps.push(jump);
                    return;
                }
                Enclosing::Switch(s) => {
                    s.break_jumps.push(jump);
                    return;
                }
            }
        }
    }

    fn push_advance_jump(&mut self, jump: usize) {
        for e in self.current().enclosing.iter_mut().rev() {
            if let Enclosing::Switch(s) = e {
                s.advance_jumps.push(jump);
                return;
            }
        }
    }

    fn compile_break(&mut self, span: Span) {
        let has_enclosing = !self.current().enclosing.is_empty();
        if !has_enclosing {
            self.error(error_codes::INVALID_BREAK, "'break' outside loop or switch", span);
            return;
        }
        let jump = self.emit(Opcode::Jump, span);
        self.emit_u16(0);
        self.push_break_jump(jump);
    }

    fn compile_continue(&mut self, span: Span) {
        let loop_start = self
            .current()
            .enclosing
            .iter()
            .rev()
            .find_map(|e| match e {
                Enclosing::Loop(l) => Some(l.loop_start),
                Enclosing::Switch(_) => None,
            });
        match loop_start {
            Some(start) => self.emit_loop(start, span),
            None => self.error(error_codes::INVALID_CONTINUE, "'continue' outside loop", span),
        }
    }

    fn compile_advance(&mut self, span: Span) {
        let in_switch = self
            .current()
            .enclosing
            .iter()
            .rev()
            .find_map(|e| match e {
                Enclosing::Switch(_) => Some(()),
                Enclosing::Loop(_) => None,
            });
        if in_switch.is_none() {
            self.error(error_codes::INVALID_ADVANCE, "'advance' outside switch", span);
            return;
        }
        let jump = self.emit(Opcode::Jump, span);
        self.emit_u16(0);
        self.push_advance_jump(jump);
    }

    // ---- expressions ---------------------------------------------------

    fn compile_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Number(n) => self.emit_constant(Value::Number(*n), expr.span),
            ExprKind::String(s) => {
                let obj = self.interner.intern(self.heap, s);
                self.emit_constant(Value::Obj(obj), expr.span);
            }
            ExprKind::Bool(true) => {
                self.emit(Opcode::True, expr.span);
            }
            ExprKind::Bool(false) => {
                self.emit(Opcode::False, expr.span);
            }
            ExprKind::Nil => {
                self.emit(Opcode::Nil, expr.span);
            }
            ExprKind::Ident(name) => self.named_variable_load(name, expr.span),
            ExprKind::ModuleAccess { alias, name } => self.compile_module_access(alias, name, expr.span),
            ExprKind::This => self.named_variable_load("this", expr.span),
            ExprKind::Super(name) => self.compile_super_get(name, expr.span),
            ExprKind::Unary { op, expr: inner } => self.compile_unary(*op, inner, expr.span),
            ExprKind::Binary { op, left, right } => self.compile_binary(*op, left, right, expr.span),
            ExprKind::Logical { op, left, right } => self.compile_logical(*op, left, right, expr.span),
            ExprKind::Conditional { cond, then_expr, else_expr } => {
                self.compile_conditional(cond, then_expr, else_expr, expr.span)
            }
            ExprKind::Assign { target, value } => self.compile_assign(target, value, expr.span),
            ExprKind::Call { callee, args } => self.compile_call(callee, args, expr.span),
            ExprKind::MethodCall { receiver, name, args, .. } => {
                self.compile_invoke(receiver, name, args, expr.span)
            }
            ExprKind::SuperCall { name, args } => self.compile_super_invoke(name, args, expr.span),
            ExprKind::Index { target, index } => {
                self.compile_expr(target);
                self.compile_expr(index);
                self.emit(Opcode::GetIndex, expr.span);
            }
            ExprKind::Field { target, name } => {
                self.compile_expr(target);
                let idx = self.string_constant(name, expr.span);
                self.emit(Opcode::GetProperty, expr.span);
                self.emit_u16(idx);
            }
            ExprKind::Array(elements) => self.compile_array(elements, expr.span),
            ExprKind::Struct(fields) => self.compile_struct_literal(fields, expr.span),
            ExprKind::FuncExpr(f) => self.compile_function(f, FunctionKind::Function),
            ExprKind::LaunchAsync { callee, args } => {
                for a in args {
                    self.compile_expr(a);
                }
                self.compile_expr(callee);
                self.emit(Opcode::LaunchAsync, expr.span);
                self.emit_u8(args.len() as u8);
            }
            ExprKind::Await(inner) => {
                self.compile_expr(inner);
                self.emit(Opcode::Await, expr.span);
            }
        }
    }

    fn emit_constant(&mut self, value: Value, span: Span) {
        let idx = self.add_constant(value, span);
        self.emit(Opcode::Constant, span);
        self.emit_u16(idx);
    }

    fn compile_module_access(&mut self, alias: &str, name: &str, span: Span) {
        match self.imports.get(alias).copied() {
            Some(target_module) => {
                let global_name = format!("{target_module}_{name}");
                self.emit(Opcode::GetGlobal, span);
                self.emit_global_name_operand(&global_name, span);
            }
            None => {
                self.error(
                    error_codes::AMBIGUOUS_IMPORT,
                    format!("unknown module alias '{alias}'"),
                    span,
                );
            }
        }
    }

    fn compile_unary(&mut self, op: UnaryOp, inner: &Expr, span: Span) {
        self.compile_expr(inner);
        match op {
            UnaryOp::Neg => self.emit(Opcode::Negate, span),
            UnaryOp::Not => self.emit(Opcode::Not, span),
            UnaryOp::BitNot => self.emit(Opcode::BitNot, span),
        };
    }

    fn compile_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr, span: Span) {
        self.compile_expr(left);
        self.compile_expr(right);
        let opcode = match op {
            BinaryOp::Add => Opcode::Add,
            BinaryOp::Sub => Opcode::Subtract,
            BinaryOp::Mul => Opcode::Multiply,
            BinaryOp::Div => Opcode::Divide,
            BinaryOp::Mod => Opcode::Modulo,
            BinaryOp::Shl => Opcode::Shl,
            BinaryOp::Shr => Opcode::Shr,
            BinaryOp::BitAnd => Opcode::BitAnd,
            BinaryOp::BitOr => Opcode::BitOr,
            BinaryOp::BitXor => Opcode::BitXor,
            BinaryOp::Eq => Opcode::Equal,
            BinaryOp::Ne => Opcode::NotEqual,
            BinaryOp::Gt => Opcode::Greater,
            BinaryOp::Ge => Opcode::GreaterEqual,
            BinaryOp::Lt => Opcode::Less,
            BinaryOp::Le => Opcode::LessEqual,
        };
        self.emit(opcode, span);
    }

    fn compile_logical(&mut self, op: LogicalOp, left: &Expr, right: &Expr, span: Span) {
        self.compile_expr(left);
        match op {
            LogicalOp::And => {
                let jump = self.emit(Opcode::JumpIfFalse, span);
                self.emit_u16(0);
                self.emit(Opcode::Pop, span);
                self.compile_expr(right);
                self.patch_jump(jump + 1, span);
            }
            LogicalOp::Or => {
                let jump = self.emit(Opcode::JumpIfTrue, span);
                self.emit_u16(0);
                self.emit(Opcode::Pop, span);
                self.compile_expr(right);
                self.patch_jump(jump + 1, span);
            }
        }
    }

    fn compile_conditional(&mut self, cond: &Expr, then_expr: &Expr, else_expr: &Expr, span: Span) {
        self.compile_expr(cond);
        let then_jump = self.emit(Opcode::JumpIfFalse, span);
        self.emit_u16(0);
        self.emit(Opcode::Pop, span);
        self.compile_expr(then_expr);
        let else_jump = self.emit(Opcode::Jump, span);
        self.emit_u16(0);
        self.patch_jump(then_jump + 1, span);
        self.emit(Opcode::Pop, span);
        self.compile_expr(else_expr);
        self.patch_jump(else_jump + 1, span);
    }

    fn compile_assign(&mut self, target: &Expr, value: &Expr, span: Span) {
        match &target.kind {
            ExprKind::Ident(name) => {
                self.compile_expr(value);
                let level = self.funcs.len() - 1;
                if let Some(slot) = Self::resolve_local(&self.funcs[level], name) {
                    self.emit(Opcode::SetLocal, span);
                    self.emit_u8(slot);
                } else if let Some(upvalue) = self.resolve_upvalue(level, name) {
                    self.emit(Opcode::SetUpvalue, span);
                    self.emit_u8(upvalue);
                } else {
                    let global_name = self.resolve_assign_global_name(name, span);
                    self.emit(Opcode::SetGlobal, span);
                    self.emit_global_name_operand(&global_name, span);
                }
            }
            ExprKind::Index { target: base, index } => {
                self.compile_expr(base);
                self.compile_expr(index);
                self.compile_expr(value);
                self.emit(Opcode::SetIndex, span);
            }
            ExprKind::Field { target: base, name } => {
                self.compile_expr(base);
                self.compile_expr(value);
                let idx = self.string_constant(name, span);
                self.emit(Opcode::SetProperty, span);
                self.emit_u16(idx);
            }
            _ => self.error(error_codes::UNEXPECTED_TOKEN, "invalid assignment target", span),
        }
    }

    fn compile_call(&mut self, callee: &Expr, args: &[Expr], span: Span) {
        self.compile_expr(callee);
        for a in args {
            self.compile_expr(a);
        }
        self.emit(Opcode::Call, span);
        self.emit_u8(args.len() as u8);
    }

    fn compile_invoke(&mut self, receiver: &Expr, name: &str, args: &[Expr], span: Span) {
        self.compile_expr(receiver);
        for a in args {
            self.compile_expr(a);
        }
        let idx = self.string_constant(name, span);
        self.emit(Opcode::Invoke, span);
        self.emit_u8(args.len() as u8);
        self.emit_u16(idx);
    }

    fn compile_super_get(&mut self, name: &str, span: Span) {
        self.named_variable_load("this", span);
        self.named_variable_load("super", span);
        let idx = self.string_constant(name, span);
        self.emit(Opcode::GetSuper, span);
        self.emit_u16(idx);
    }

    fn compile_super_invoke(&mut self, name: &str, args: &[Expr], span: Span) {
        self.named_variable_load("this", span);
        for a in args {
            self.compile_expr(a);
        }
        self.named_variable_load("super", span);
        let idx = self.string_constant(name, span);
        self.emit(Opcode::SuperInvoke, span);
        self.emit_u8(args.len() as u8);
        self.emit_u16(idx);
    }

    fn compile_array(&mut self, elements: &[Expr], span: Span) {
        for e in elements {
            self.compile_expr(e);
        }
        self.emit(Opcode::Array, span);
        self.emit_u16(elements.len() as u16);
    }

    /// Struct/array literal fields are evaluated in reverse source order so
    /// the `Struct`/`Array` opcode can pop them off the stack in forward
    /// order with a single `pop_n`-style read (spec.md §4.2).
    fn compile_struct_literal(&mut self, fields: &[(String, Expr)], span: Span) {
        for (_, value) in fields {
            self.compile_expr(value);
        }
        self.emit(Opcode::Struct, span);
        self.emit_u16(fields.len() as u16);
        // VM pops values in reverse of push order, so the name operands
        // trailing the count are emitted in reverse field order to match.
        for (name, _) in fields.iter().rev() {
            let idx = self.string_constant(name, span);
            self.emit_u16(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn compile_src(src: &str) -> Result<ObjRef, Vec<Diagnostic>> {
        let tokens = Lexer::new(src).tokenize().unwrap();
        let decls = Parser::new(tokens).parse().unwrap();
        let module = Module {
            name: "main".into(),
            path: "main.tln".into(),
            imports: Vec::new(),
            exports: Vec::new(),
            items: decls,
        };
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        compile_module(&module, 0, HashMap::new(), HashMap::new(), &mut heap, &mut interner)
    }

    #[test]
    fn test_compile_arithmetic() {
        let result = compile_src("var x = 1 + 2 * 3;");
        assert!(result.is_ok());
    }

    #[test]
    fn test_compile_function_and_call() {
        let result = compile_src("func add(a, b) { return a + b; } print add(1, 2);");
        assert!(result.is_ok());
    }

    #[test]
    fn test_compile_closure_capture() {
        let result = compile_src(
            "func counter() { var i = 0; func inc() { i = i + 1; return i; } return inc; }",
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_compile_class_with_super() {
        let result = compile_src(
            "class A { greet() { return \"hi\"; } } class B : A { greet() { return super.greet(); } }",
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_undefined_variable_is_diagnostic() {
        let result = compile_src("print undefined_name;");
        assert!(result.is_err());
    }

    #[test]
    fn test_break_outside_loop_is_diagnostic() {
        let result = compile_src("break;");
        assert!(result.is_err());
    }
}
