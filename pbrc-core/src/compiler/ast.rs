//! Abstract Syntax Tree
//!
//! Node types produced by the parser and consumed by the linter and the code
//! generator. The tree is a plain owned structure; statements carry the
//! 1-based source line they started on so the linter can point diagnostics
//! at the right place.

use crate::compiler::instruction::{Mnemonic, ValueType};

/// A typed scalar variable reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub ty: ValueType,
}

/// A constant-index element of a stack array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayRef {
    pub name: String,
    pub elem_ty: ValueType,
    pub index: u32,
}

/// What a `&name` expression points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    Function,
    Array,
    Variable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    pub target: String,
    pub kind: PointerKind,
}

/// `(int) x` / `(float) x`. The operand is always a plain variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cast {
    pub var: String,
    pub to: ValueType,
}

/// Binary operators of the expression grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mask,
    Insert,
    Mod,
    Lshift,
    Rshift,
}

impl BinOp {
    /// Precedence level, tightest first: shifts/mod/mask/insert bind before
    /// multiplication, which binds before addition.
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Lshift | BinOp::Rshift | BinOp::Mod | BinOp::Mask | BinOp::Insert => 1,
            BinOp::Mul | BinOp::Div => 2,
            BinOp::Add | BinOp::Sub => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mask => "mask",
            BinOp::Insert => "insert",
            BinOp::Mod => "mod",
            BinOp::Lshift => "lshift",
            BinOp::Rshift => "rshift",
        }
    }

    /// Only the four arithmetic operators exist for floats.
    pub fn valid_on_float(self) -> bool {
        matches!(self, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div)
    }
}

/// An `Operation` node; both operands share its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub op: BinOp,
    pub left: Expr,
    pub right: Expr,
    pub ty: ValueType,
}

/// Expression-position nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Number(u32),
    Variable(Variable),
    Array(ArrayRef),
    Pointer(Pointer),
    Cast(Cast),
    Operation(Box<Operation>),
    Call(Call),
}

impl Expr {
    /// Result type of the expression. Literals are always integers; the
    /// language has no float literals.
    pub fn value_type(&self) -> ValueType {
        match self {
            Expr::Number(_) => ValueType::Int,
            Expr::Variable(v) => v.ty,
            Expr::Array(a) => a.elem_ty,
            Expr::Pointer(_) => ValueType::Int,
            Expr::Cast(c) => c.to,
            Expr::Operation(o) => o.ty,
            Expr::Call(_) => ValueType::Int,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    /// The comparator selecting the opposite branch sense.
    pub fn inverse(self) -> Comparator {
        match self {
            Comparator::Eq => Comparator::Ne,
            Comparator::Ne => Comparator::Eq,
            Comparator::Gt => Comparator::Le,
            Comparator::Ge => Comparator::Lt,
            Comparator::Lt => Comparator::Ge,
            Comparator::Le => Comparator::Gt,
        }
    }

    /// The conditional-branch mnemonic taken when the comparison holds.
    pub fn branch(self) -> Mnemonic {
        match self {
            Comparator::Eq => Mnemonic::Beq,
            Comparator::Ne => Mnemonic::Bne,
            Comparator::Lt => Mnemonic::Blt,
            Comparator::Le => Mnemonic::Ble,
            Comparator::Gt => Mnemonic::Bgt,
            Comparator::Ge => Mnemonic::Bge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connective {
    And,
    Or,
}

/// A single comparison; type taken from its left operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub cmp: Comparator,
    pub left: Expr,
    pub right: Expr,
    pub ty: ValueType,
}

/// Condition of an `if`/`while`: one comparison, or exactly two joined by a
/// connective (the grammar does not chain further).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Single(Comparison),
    Compound {
        connective: Connective,
        left: Comparison,
        right: Comparison,
    },
}

/// Target of a `set`/`fset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetTarget {
    Var(Variable),
    Element(ArrayRef),
}

/// `for v in range(...)` bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForRange {
    Count(u32),
    Var(Variable),
}

/// Offset operand of an explicit load/store statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LsOffset {
    Imm(u32),
    Var(Variable),
}

/// A function call, direct or through an `int` variable holding an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub function: String,
    pub args: Vec<Expr>,
    pub through_pointer: bool,
    pub line: u32,
}

/// One `case`/`default` block of a `switch`; `cases` is empty for the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseBlock {
    pub cases: Vec<u32>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stmt {
    pub line: u32,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StmtKind {
    Set {
        ty: ValueType,
        target: SetTarget,
        expr: Expr,
    },
    Alloc {
        name: String,
        elem_ty: ValueType,
        size: u32,
    },
    LoadStore {
        op: Mnemonic,
        var: Variable,
        base: Variable,
        offset: LsOffset,
    },
    Call(Call),
    If {
        /// `(condition, body)` arms; a `None` condition is the `else` arm.
        arms: Vec<(Option<Condition>, Vec<Stmt>)>,
    },
    For {
        var: Variable,
        range: ForRange,
        body: Vec<Stmt>,
    },
    While {
        cond: Condition,
        body: Vec<Stmt>,
    },
    Switch {
        var: Variable,
        blocks: Vec<CaseBlock>,
    },
    Break,
    Continue,
}

/// A top-level function definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub params: Vec<Variable>,
    pub body: Vec<Stmt>,
    pub ret: Option<Variable>,
    pub line: u32,
}

/// One parsed source file.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: std::path::PathBuf,
    pub region: crate::compiler::regions::Region,
    /// `(path, line)` of each import statement, in order.
    pub imports: Vec<(String, u32)>,
    pub functions: Vec<Function>,
}
