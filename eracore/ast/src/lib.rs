//! AST for the ERA dialect — declarations, functions, statements, and the
//! operator-precedence expression tree shared by parser and runtime.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

#[derive(Debug, Clone)]
pub enum Expr {
    Int(i64),
    Str(String),
    Var(VarRef),
    Unary { op: String, expr: Box<Expr> },
    Binary { op: String, left: Box<Expr>, right: Box<Expr> },
    Ternary { cond: Box<Expr>, on_true: Box<Expr>, on_false: Box<Expr> },
    Call { name: String, args: Vec<Expr> },
    IncDec { target: VarRef, op: String, post: bool },
    // Placeholder for an omitted call argument / empty assignment RHS.
    Empty,
}

#[derive(Debug, Clone, Default)]
pub struct VarRef {
    pub name: String,
    pub index: Vec<Expr>,
}

impl VarRef {
    pub fn scalar(name: impl Into<String>) -> Self {
        Self { name: name.into(), index: Vec::new() }
    }
}

#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: String,
    pub is_string: bool,
    pub dims: Vec<usize>,
    pub scope: DeclScope,
    pub is_ref: bool,
    pub is_dynamic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclScope {
    Global,
    Local,
}

#[derive(Debug, Clone)]
pub enum Statement {
    Print { expr: Expr, newline: bool },
    Assign { target: VarRef, op: String, expr: Expr },
    // `'=` assignment: raw right-hand side expanded through the template engine.
    AssignForm { target: VarRef, raw: String },
    IncDec { target: VarRef, op: String },
    If { branches: Vec<IfBranch>, else_body: Thunk },
    While { cond: Expr, body: Thunk },
    DoWhile { body: Thunk, cond: Expr },
    Repeat { count: Expr, body: Thunk },
    For { target: VarRef, init: Expr, limit: Expr, step: Expr, body: Thunk },
    SelectCase { target: Expr, branches: Vec<CaseBranch>, else_body: Thunk },
    Goto { label: String },
    Call { name: String, args: Vec<Expr> },
    Return { values: Vec<Expr> },
    Begin { keyword: String },
    Quit,
    Break,
    Continue,
    PrintData { command: String, items: Vec<DataItem> },
    StrData { target: VarRef, items: Vec<DataItem> },
    Command { name: String, arg: String },
}

#[derive(Debug, Clone)]
pub struct IfBranch {
    pub cond: Expr,
    pub body: Thunk,
}

#[derive(Debug, Clone)]
pub struct CaseBranch {
    pub conditions: Vec<CaseCondition>,
    pub body: Thunk,
}

#[derive(Debug, Clone)]
pub enum CaseCondition {
    Equal(Expr),
    Range { from: Expr, to: Expr },
    Compare { op: String, expr: Expr },
}

#[derive(Debug, Clone)]
pub struct DataItem {
    pub is_form: bool,
    pub raw: String,
}

/// A parsed body of statements plus a label index. The `id` is unique per
/// Program and keys the runtime's precomputed flow maps.
#[derive(Debug, Clone, Default)]
pub struct Thunk {
    pub id: u32,
    pub statements: Vec<Statement>,
    pub labels: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct Arg {
    pub name: String,
    pub target: VarRef,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub args: Vec<Arg>,
    pub body: Thunk,
    pub var_decls: Vec<VarDecl>,
    pub priority: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub defines: HashMap<String, Expr>,
    pub functions: HashMap<String, Rc<Function>>,
    pub order: Vec<String>,
    // Event-named functions, one list per event name, sorted by priority.
    pub events: HashMap<String, Vec<Rc<Function>>>,
    pub csv_files: HashMap<String, String>,
    pub string_vars: HashSet<String>,
    pub var_decls: Vec<VarDecl>,
}

impl Statement {
    /// Child thunks, used by the flow-index builder.
    pub fn child_thunks(&self) -> Vec<&Thunk> {
        match self {
            Statement::If { branches, else_body } => {
                let mut out: Vec<&Thunk> = branches.iter().map(|b| &b.body).collect();
                out.push(else_body);
                out
            }
            Statement::SelectCase { branches, else_body, .. } => {
                let mut out: Vec<&Thunk> = branches.iter().map(|b| &b.body).collect();
                out.push(else_body);
                out
            }
            Statement::While { body, .. }
            | Statement::DoWhile { body, .. }
            | Statement::Repeat { body, .. }
            | Statement::For { body, .. } => vec![body],
            _ => Vec::new(),
        }
    }

    pub fn child_thunks_mut(&mut self) -> Vec<&mut Thunk> {
        match self {
            Statement::If { branches, else_body } => {
                let mut out: Vec<&mut Thunk> = branches.iter_mut().map(|b| &mut b.body).collect();
                out.push(else_body);
                out
            }
            Statement::SelectCase { branches, else_body, .. } => {
                let mut out: Vec<&mut Thunk> = branches.iter_mut().map(|b| &mut b.body).collect();
                out.push(else_body);
                out
            }
            Statement::While { body, .. }
            | Statement::DoWhile { body, .. }
            | Statement::Repeat { body, .. }
            | Statement::For { body, .. } => vec![body],
            _ => Vec::new(),
        }
    }
}
