//! Script Parser
//!
//! Recursive-descent parser from the token stream to the AST. The parser owns
//! the per-function symbol table because expression nodes carry their types:
//! a bare name resolves against declarations seen so far, `name[i]` needs the
//! element type of the `alloc` that introduced the array, and `&name` needs
//! to know whether it points at a function, an array, or a scalar.
//!
//! Structural diagnostics (malformed tags, unclosed blocks, statements in the
//! wrong place) are reported here; semantic rules live in the linter.
//!
//! Expression grammar, tightest first: `lshift rshift mod mask insert`,
//! then `* /`, then `+ -`, all left-associative. Prefix `&` and `(type)`
//! casts, postfix `[index]` on arrays.

use crate::compiler::ast::*;
use crate::compiler::error::CompileError;
use crate::compiler::instruction::{Mnemonic, ValueType};
use crate::compiler::lexer::{lex, Reserved, Token, TokenKind};
use crate::compiler::regions::Region;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// What a name is bound to inside the current function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Scalar(ValueType),
    Array { elem: ValueType, size: u32 },
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    path: PathBuf,
    variables: HashMap<String, Binding>,
}

impl Parser {
    pub fn from_source(path: &Path, source: &str) -> Result<Self, CompileError> {
        Ok(Parser {
            tokens: lex(source)?,
            pos: 0,
            path: path.to_path_buf(),
            variables: HashMap::new(),
        })
    }

    /// Parse a whole file: region tag(s), imports, then function definitions.
    pub fn parse(mut self) -> Result<SourceFile, CompileError> {
        let mut region: Option<Region> = None;
        let mut imports: Vec<(String, u32)> = Vec::new();
        let mut functions: Vec<Function> = Vec::new();
        // 0 = tags, 1 = imports, 2 = defs; tags and imports may not reappear
        // once a later phase has started
        let mut phase: u8 = 0;

        while let Some(token) = self.peek().cloned() {
            let line = token.line;
            match token.kind {
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Special('<') => {
                    if phase > 0 {
                        return Err(self.err(line, "Tags must appear at the start of the file"));
                    }
                    self.advance();
                    let value = self.parse_region_tag(line)?;
                    if region.is_some() {
                        return Err(
                            self.err(line, "A script file cannot have multiple region tags")
                        );
                    }
                    region = Some(value);
                }
                TokenKind::Reserved(Reserved::Import) => {
                    if phase > 1 {
                        return Err(
                            self.err(line, "Imports must appear before function definitions")
                        );
                    }
                    phase = 1;
                    self.advance();
                    let path = match self.next_kind(line)? {
                        TokenKind::Str(s) => s,
                        _ => return Err(self.err(line, "Invalid import statement")),
                    };
                    self.expect_newline(line, "Invalid import statement")?;
                    imports.push((path, line));
                }
                TokenKind::Reserved(Reserved::Def) => {
                    phase = 2;
                    self.advance();
                    functions.push(self.parse_def(line)?);
                }
                _ => {
                    return Err(
                        self.err(line, "Statements cannot appear outside of function bodies")
                    );
                }
            }
        }

        let region = region.ok_or_else(|| self.err(1, "Missing region tag"))?;
        Ok(SourceFile {
            path: self.path,
            region,
            imports,
            functions,
        })
    }

    fn parse_region_tag(&mut self, line: u32) -> Result<Region, CompileError> {
        match self.next_kind(line)? {
            TokenKind::Variable(tag) if tag == "region" => {}
            _ => return Err(self.err(line, "Invalid tag type")),
        }
        self.expect_special('=', line, "Invalid tag; missing '='")?;
        let value = match self.next_kind(line)? {
            TokenKind::Str(s) => s,
            _ => return Err(self.err(line, "Invalid tag value")),
        };
        let region: Region = value
            .parse()
            .map_err(|message: String| self.err(line, &message))?;
        self.expect_special('>', line, "Unclosed tag")?;
        self.expect_newline(line, "Tags must be on their own line")?;
        Ok(region)
    }

    fn parse_def(&mut self, line: u32) -> Result<Function, CompileError> {
        self.variables.clear();
        let name = match self.next_kind(line)? {
            TokenKind::FunctionName(n) => n,
            TokenKind::Variable(n) => {
                return Err(self.err(
                    line,
                    &format!(
                        "Invalid function name '{}' - function names must start with a capital letter",
                        n
                    ),
                ));
            }
            _ => return Err(self.err(line, "Invalid function definition")),
        };
        self.expect_special('(', line, "Invalid function definition; missing '('")?;

        let mut params: Vec<Variable> = Vec::new();
        while !self.peek_is_special(')') {
            let ty = match self.next_kind(line)? {
                TokenKind::Type(ty) => ty,
                _ => return Err(self.err(line, "Invalid function definition")),
            };
            let pname = match self.next_kind(line)? {
                TokenKind::Variable(n) => n,
                _ => return Err(self.err(line, "Invalid function definition")),
            };
            self.variables.insert(pname.clone(), Binding::Scalar(ty));
            params.push(Variable { name: pname, ty });
            if self.peek_is_special(',') {
                self.advance();
            } else if !self.peek_is_special(')') {
                return Err(self.err(line, "Invalid function definition"));
            }
        }
        self.advance(); // ')'

        let (body, _) = self.parse_block(&[Reserved::Return], line)?;

        // optional return value on the same line as `return`
        let ret = if let Some(Token {
            kind: TokenKind::Variable(_),
            line: rline,
        }) = self.peek().cloned()
        {
            Some(self.parse_variable(rline)?)
        } else {
            None
        };

        Ok(Function {
            name,
            params,
            body,
            ret,
            line,
        })
    }

    /// Parse `: \n statements...` until one of `stop`; consumes the stop
    /// keyword and reports which one ended the block.
    fn parse_block(
        &mut self,
        stop: &[Reserved],
        line: u32,
    ) -> Result<(Vec<Stmt>, Reserved), CompileError> {
        self.expect_special(':', line, "Invalid block; missing ':'")?;
        self.expect_newline(line, "Invalid block")?;
        let mut body: Vec<Stmt> = Vec::new();
        loop {
            let token = match self.peek() {
                Some(t) => t.clone(),
                None => return Err(self.err(line, "Unclosed block")),
            };
            match token.kind {
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Reserved(word) if stop.contains(&word) => {
                    self.advance();
                    return Ok((body, word));
                }
                _ => body.push(self.parse_stmt()?),
            }
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        let token = self.peek().cloned().expect("caller checked");
        let line = token.line;
        let kind = match token.kind {
            TokenKind::Reserved(Reserved::Set) => {
                self.advance();
                let stmt = self.parse_set(ValueType::Int, line)?;
                self.expect_newline(line, "Invalid 'set' statement")?;
                stmt
            }
            TokenKind::Reserved(Reserved::Fset) => {
                self.advance();
                let stmt = self.parse_set(ValueType::Float, line)?;
                self.expect_newline(line, "Invalid 'fset' statement")?;
                stmt
            }
            TokenKind::Reserved(Reserved::Alloc) => {
                self.advance();
                let stmt = self.parse_alloc(line)?;
                self.expect_newline(line, "Invalid 'alloc' statement")?;
                stmt
            }
            TokenKind::Reserved(Reserved::Call) => {
                self.advance();
                let call = self.parse_call(line)?;
                self.expect_newline(line, "Invalid 'call' statement")?;
                StmtKind::Call(call)
            }
            TokenKind::Reserved(Reserved::If) => {
                self.advance();
                let stmt = self.parse_if(line)?;
                self.expect_newline(line, "Invalid 'if' statement")?;
                stmt
            }
            TokenKind::Reserved(Reserved::For) => {
                self.advance();
                let stmt = self.parse_for(line)?;
                self.expect_newline(line, "Invalid 'for' statement")?;
                stmt
            }
            TokenKind::Reserved(Reserved::While) => {
                self.advance();
                let stmt = self.parse_while(line)?;
                self.expect_newline(line, "Invalid 'while' statement")?;
                stmt
            }
            TokenKind::Reserved(Reserved::Switch) => {
                self.advance();
                let stmt = self.parse_switch(line)?;
                self.expect_newline(line, "Invalid 'switch' statement")?;
                stmt
            }
            TokenKind::Reserved(Reserved::Break) => {
                self.advance();
                self.expect_newline(line, "Invalid 'break' statement")?;
                StmtKind::Break
            }
            TokenKind::Reserved(Reserved::Continue) => {
                self.advance();
                self.expect_newline(line, "Invalid 'continue' statement")?;
                StmtKind::Continue
            }
            TokenKind::LoadStore(m) => {
                self.advance();
                let stmt = self.parse_loadstore(m, line)?;
                self.expect_newline(line, "Invalid load/store statement")?;
                stmt
            }
            TokenKind::Reserved(Reserved::Def) => {
                return Err(self.err(line, "Cannot define a function within a function"));
            }
            _ => return Err(self.err(line, "Invalid statement")),
        };
        Ok(Stmt { line, kind })
    }

    fn parse_set(&mut self, ty: ValueType, line: u32) -> Result<StmtKind, CompileError> {
        let name = match self.next_kind(line)? {
            TokenKind::Variable(n) => n,
            other => {
                return Err(self.err(
                    line,
                    &format!("Invalid statement; cannot assign to '{:?}'", other),
                ));
            }
        };
        let target = if self.peek_is_special('[') {
            SetTarget::Element(self.parse_array_index(&name, line)?)
        } else {
            if !self.variables.contains_key(&name) {
                self.variables.insert(name.clone(), Binding::Scalar(ty));
            }
            let bound_ty = match self.variables[&name] {
                Binding::Scalar(t) => t,
                Binding::Array { .. } => {
                    return Err(self.err(line, &format!("Cannot assign to array '{}'", name)));
                }
            };
            SetTarget::Var(Variable {
                name,
                ty: bound_ty,
            })
        };
        self.expect_special('=', line, "Invalid statement; missing '='")?;
        let expr = self.parse_expression(line)?;
        Ok(StmtKind::Set { ty, target, expr })
    }

    fn parse_alloc(&mut self, line: u32) -> Result<StmtKind, CompileError> {
        let name = match self.next_kind(line)? {
            TokenKind::Variable(n) => n,
            _ => return Err(self.err(line, "Invalid 'alloc' statement")),
        };
        if self.variables.contains_key(&name) {
            return Err(self.err(line, &format!("Duplicate array name '{}'", name)));
        }
        self.expect_special('=', line, "Invalid 'alloc' statement; missing '='")?;
        let elem_ty = match self.next_kind(line)? {
            TokenKind::Type(ty) => ty,
            _ => return Err(self.err(line, "Invalid 'alloc' statement")),
        };
        self.expect_special('[', line, "Invalid 'alloc' statement; missing '['")?;
        let size = match self.next_kind(line)? {
            TokenKind::Number(n) => n,
            _ => return Err(self.err(line, "Invalid 'alloc' statement")),
        };
        self.expect_special(']', line, "Invalid 'alloc' statement; missing ']'")?;
        if size == 0 {
            return Err(self.err(line, "Array size cannot be zero"));
        }
        self.variables
            .insert(name.clone(), Binding::Array { elem: elem_ty, size });
        Ok(StmtKind::Alloc {
            name,
            elem_ty,
            size,
        })
    }

    fn parse_call(&mut self, line: u32) -> Result<Call, CompileError> {
        let (function, through_pointer) = match self.next_kind(line)? {
            TokenKind::FunctionName(n) => (n, false),
            TokenKind::Special('&') => match self.next_kind(line)? {
                TokenKind::Variable(n) => (n, true),
                _ => return Err(self.err(line, "Invalid pointer for function call")),
            },
            _ => return Err(self.err(line, "Invalid call statement")),
        };
        self.expect_special('(', line, "Invalid function call; missing '('")?;
        let mut args: Vec<Expr> = Vec::new();
        while !self.peek_is_special(')') {
            args.push(self.parse_expression(line)?);
            if self.peek_is_special(',') {
                self.advance();
            } else if !self.peek_is_special(')') {
                return Err(self.err(line, "Invalid function call"));
            }
        }
        self.advance(); // ')'
        Ok(Call {
            function,
            args,
            through_pointer,
            line,
        })
    }

    fn parse_if(&mut self, line: u32) -> Result<StmtKind, CompileError> {
        let mut arms: Vec<(Option<Condition>, Vec<Stmt>)> = Vec::new();
        let cond = self.parse_condition(line)?;
        let (body, mut stop) =
            self.parse_block(&[Reserved::Elif, Reserved::Else, Reserved::End], line)?;
        arms.push((Some(cond), body));
        while stop == Reserved::Elif {
            let cond = self.parse_condition(line)?;
            let (body, next_stop) =
                self.parse_block(&[Reserved::Elif, Reserved::Else, Reserved::End], line)?;
            arms.push((Some(cond), body));
            stop = next_stop;
        }
        if stop == Reserved::Else {
            let (body, _) = self.parse_block(&[Reserved::End], line)?;
            arms.push((None, body));
        }
        Ok(StmtKind::If { arms })
    }

    fn parse_for(&mut self, line: u32) -> Result<StmtKind, CompileError> {
        let name = match self.next_kind(line)? {
            TokenKind::Variable(n) => n,
            _ => return Err(self.err(line, "Invalid 'for' statement")),
        };
        // the loop variable is always an int
        self.variables
            .insert(name.clone(), Binding::Scalar(ValueType::Int));
        let var = Variable {
            name,
            ty: ValueType::Int,
        };
        match self.next_kind(line)? {
            TokenKind::Reserved(Reserved::In) => {}
            _ => return Err(self.err(line, "Invalid 'for' statement; missing 'in'")),
        }
        match self.next_kind(line)? {
            TokenKind::Reserved(Reserved::Range) => {}
            _ => return Err(self.err(line, "Invalid 'for' statement; expected 'range'")),
        }
        self.expect_special('(', line, "Invalid 'range' statement; missing '('")?;
        let range = match self.next_kind(line)? {
            TokenKind::Number(n) => ForRange::Count(n),
            TokenKind::Variable(n) => ForRange::Var(self.lookup_scalar(&n, line)?),
            _ => return Err(self.err(line, "Invalid argument for 'range'")),
        };
        self.expect_special(')', line, "Invalid 'range' statement; missing ')'")?;
        let (body, _) = self.parse_block(&[Reserved::End], line)?;
        Ok(StmtKind::For { var, range, body })
    }

    fn parse_while(&mut self, line: u32) -> Result<StmtKind, CompileError> {
        let cond = self.parse_condition(line)?;
        let (body, _) = self.parse_block(&[Reserved::End], line)?;
        Ok(StmtKind::While { cond, body })
    }

    fn parse_switch(&mut self, line: u32) -> Result<StmtKind, CompileError> {
        let var = match self.next_kind(line)? {
            TokenKind::Variable(n) => self.lookup_scalar(&n, line)?,
            other => {
                return Err(self.err(line, &format!("Cannot switch on '{:?}'", other)));
            }
        };
        self.expect_special(':', line, "Invalid 'switch' statement; missing ':'")?;
        self.expect_newline(line, "Invalid 'switch' statement")?;

        let mut blocks: Vec<CaseBlock> = Vec::new();
        let mut pending_cases: Vec<u32> = Vec::new();
        let mut num_cases: u32 = 0;
        let mut saw_default = false;
        loop {
            let token = match self.peek() {
                Some(t) => t.clone(),
                None => return Err(self.err(line, "Unclosed block")),
            };
            match token.kind {
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Reserved(Reserved::Case) => {
                    if saw_default {
                        return Err(self.err(
                            token.line,
                            "Additional cases cannot appear after a 'default' block",
                        ));
                    }
                    self.advance();
                    let value = match self.next_kind(token.line)? {
                        TokenKind::Number(n) => n,
                        _ => {
                            return Err(
                                self.err(token.line, "Invalid 'case' statement; missing case value")
                            );
                        }
                    };
                    pending_cases.push(value);
                    num_cases += 1;
                    let (body, stop) =
                        self.parse_block(&[Reserved::Case, Reserved::Break], token.line)?;
                    match stop {
                        Reserved::Break => {
                            blocks.push(CaseBlock {
                                cases: std::mem::take(&mut pending_cases),
                                body,
                            });
                        }
                        _ => {
                            // fall-through is only legal for empty case bodies
                            if !body.is_empty() {
                                return Err(self.err(
                                    token.line,
                                    "Invalid case block; missing 'break' statement",
                                ));
                            }
                            // un-consume nothing: the stop token was `case`,
                            // loop back around by rewinding one token
                            self.pos -= 1;
                        }
                    }
                }
                TokenKind::Reserved(Reserved::Default) => {
                    if saw_default {
                        return Err(self.err(
                            token.line,
                            "Switches cannot contain multiple 'default' blocks",
                        ));
                    }
                    saw_default = true;
                    self.advance();
                    let (body, _) = self.parse_block(&[Reserved::Break], token.line)?;
                    if !body.is_empty() {
                        blocks.push(CaseBlock {
                            cases: Vec::new(),
                            body,
                        });
                    }
                }
                TokenKind::Reserved(Reserved::End) => {
                    if num_cases == 0 {
                        return Err(self.err(
                            token.line,
                            "Cannot have a switch statement without any 'case' blocks",
                        ));
                    }
                    self.advance();
                    break;
                }
                _ => {
                    return Err(self.err(
                        token.line,
                        "Statements cannot appear outside of 'case'/'default' blocks in switches",
                    ));
                }
            }
        }
        Ok(StmtKind::Switch { var, blocks })
    }

    fn parse_loadstore(&mut self, op: Mnemonic, line: u32) -> Result<StmtKind, CompileError> {
        let is_load = matches!(op, Mnemonic::Load(_));
        let is_float = match op {
            Mnemonic::Load(l) => l.width.is_float(),
            Mnemonic::Store(s) => s.width.is_float(),
            _ => false,
        };
        let var = match self.next_kind(line)? {
            TokenKind::Variable(n) => {
                if is_load {
                    // a load (re)defines its destination variable
                    let ty = if is_float {
                        ValueType::Float
                    } else {
                        ValueType::Int
                    };
                    self.variables.insert(n.clone(), Binding::Scalar(ty));
                    Variable { name: n, ty }
                } else {
                    self.lookup_scalar(&n, line)?
                }
            }
            _ => return Err(self.err(line, "Invalid load/store statement")),
        };
        self.expect_special(',', line, "Invalid load/store statement; missing ','")?;
        let offset = match self.next_kind(line)? {
            TokenKind::Number(n) => LsOffset::Imm(n),
            TokenKind::Variable(n) => LsOffset::Var(self.lookup_scalar(&n, line)?),
            _ => return Err(self.err(line, "Invalid load/store offset")),
        };
        self.expect_special('(', line, "Invalid load/store statement; missing '('")?;
        let base = match self.next_kind(line)? {
            TokenKind::Variable(n) => self.lookup_scalar(&n, line)?,
            _ => return Err(self.err(line, "Invalid load/store base")),
        };
        self.expect_special(')', line, "Invalid load/store statement; missing ')'")?;

        // a variable offset selects the indexed (`x`) form
        let op = match (op, &offset) {
            (Mnemonic::Load(mut l), LsOffset::Var(_)) => {
                l.indexed = true;
                Mnemonic::Load(l)
            }
            (Mnemonic::Store(mut s), LsOffset::Var(_)) => {
                s.indexed = true;
                Mnemonic::Store(s)
            }
            (m, _) => m,
        };
        Ok(StmtKind::LoadStore {
            op,
            var,
            base,
            offset,
        })
    }

    // --- Expressions ---

    fn parse_condition(&mut self, line: u32) -> Result<Condition, CompileError> {
        let left = self.parse_comparison(line)?;
        if let Some(Token {
            kind: TokenKind::Connective(conn),
            ..
        }) = self.peek()
        {
            let connective = *conn;
            self.advance();
            let right = self.parse_comparison(line)?;
            Ok(Condition::Compound {
                connective,
                left,
                right,
            })
        } else {
            Ok(Condition::Single(left))
        }
    }

    fn parse_comparison(&mut self, line: u32) -> Result<Comparison, CompileError> {
        let left = self.parse_expression(line)?;
        let cmp = match self.next_kind(line)? {
            TokenKind::Comparator(c) => c,
            _ => return Err(self.err(line, "Invalid comparison")),
        };
        let right = self.parse_expression(line)?;
        let ty = left.value_type();
        Ok(Comparison {
            cmp,
            left,
            right,
            ty,
        })
    }

    fn parse_expression(&mut self, line: u32) -> Result<Expr, CompileError> {
        self.parse_binary(3, line)
    }

    /// Precedence climbing; level 0 is a primary expression.
    fn parse_binary(&mut self, prec: u8, line: u32) -> Result<Expr, CompileError> {
        if prec == 0 {
            return self.parse_primary(line);
        }
        let mut left = self.parse_binary(prec - 1, line)?;
        while let Some(Token {
            kind: TokenKind::Operator(op),
            ..
        }) = self.peek()
        {
            let op = *op;
            if op.precedence() != prec {
                break;
            }
            self.advance();
            let right = self.parse_binary(prec - 1, line)?;
            let ty = left.value_type();
            left = Expr::Operation(Box::new(Operation {
                op,
                left,
                right,
                ty,
            }));
        }
        Ok(left)
    }

    fn parse_primary(&mut self, line: u32) -> Result<Expr, CompileError> {
        let token = match self.peek() {
            Some(t) => t.clone(),
            None => return Err(self.err(line, "Unexpected end of file in expression")),
        };
        match token.kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            TokenKind::Variable(_) => {
                let var_line = token.line;
                let name = match self.next_kind(var_line)? {
                    TokenKind::Variable(n) => n,
                    _ => unreachable!(),
                };
                if self.peek_is_special('[') {
                    Ok(Expr::Array(self.parse_array_index(&name, var_line)?))
                } else {
                    match self.variables.get(&name) {
                        Some(Binding::Scalar(ty)) => Ok(Expr::Variable(Variable {
                            name,
                            ty: *ty,
                        })),
                        Some(Binding::Array { .. }) => Err(self.err(
                            var_line,
                            &format!("Invalid use of array '{}' (did you mean '&{}'?)", name, name),
                        )),
                        None => Err(self.err(
                            var_line,
                            &format!("Use of uninitialized variable '{}'", name),
                        )),
                    }
                }
            }
            TokenKind::Special('&') => {
                self.advance();
                match self.next_kind(token.line)? {
                    TokenKind::FunctionName(n) => Ok(Expr::Pointer(Pointer {
                        target: n,
                        kind: PointerKind::Function,
                    })),
                    TokenKind::Variable(n) => {
                        let kind = match self.variables.get(&n) {
                            Some(Binding::Array { .. }) => PointerKind::Array,
                            Some(Binding::Scalar(_)) => PointerKind::Variable,
                            None => {
                                return Err(self.err(
                                    token.line,
                                    &format!("Use of uninitialized variable '{}'", n),
                                ));
                            }
                        };
                        Ok(Expr::Pointer(Pointer { target: n, kind }))
                    }
                    _ => Err(self.err(token.line, "Cannot point to this expression")),
                }
            }
            TokenKind::Special('(') => {
                // the only parenthesized form is a cast
                self.advance();
                let to = match self.next_kind(token.line)? {
                    TokenKind::Type(ty) => ty,
                    _ => return Err(self.err(token.line, "Invalid cast operation")),
                };
                self.expect_special(')', token.line, "Invalid cast operation")?;
                let var = match self.next_kind(token.line)? {
                    TokenKind::Variable(n) => n,
                    _ => return Err(self.err(token.line, "Cannot cast this expression")),
                };
                if !self.variables.contains_key(&var) {
                    return Err(self.err(
                        token.line,
                        &format!("Use of uninitialized variable '{}'", var),
                    ));
                }
                Ok(Expr::Cast(Cast { var, to }))
            }
            TokenKind::Reserved(Reserved::Call) => {
                self.advance();
                Ok(Expr::Call(self.parse_call(token.line)?))
            }
            TokenKind::FunctionName(n) => {
                self.advance();
                // bare function names only appear behind `&` or `call`
                Err(self.err(
                    token.line,
                    &format!("Invalid use of function name '{}'", n),
                ))
            }
            _ => Err(self.err(token.line, "Invalid expression")),
        }
    }

    fn parse_array_index(&mut self, name: &str, line: u32) -> Result<ArrayRef, CompileError> {
        let (elem_ty, size) = match self.variables.get(name) {
            Some(Binding::Array { elem, size }) => (*elem, *size),
            Some(Binding::Scalar(_)) => {
                return Err(self.err(line, &format!("'{}' is not an array", name)));
            }
            None => {
                return Err(self.err(
                    line,
                    &format!("Use of uninitialized variable '{}'", name),
                ));
            }
        };
        self.advance(); // '['
        let index = match self.next_kind(line)? {
            TokenKind::Number(n) => n,
            other => {
                return Err(self.err(
                    line,
                    &format!("Array indices cannot be of type '{:?}'", other),
                ));
            }
        };
        self.expect_special(']', line, "Invalid array; missing ']'")?;
        if index >= size {
            return Err(self.err(
                line,
                &format!("Array index out of bounds for array of size {}", size),
            ));
        }
        Ok(ArrayRef {
            name: name.to_string(),
            elem_ty,
            index,
        })
    }

    fn parse_variable(&mut self, line: u32) -> Result<Variable, CompileError> {
        match self.next_kind(line)? {
            TokenKind::Variable(n) => self.lookup_scalar(&n, line),
            _ => Err(self.err(line, "Expected a variable")),
        }
    }

    fn lookup_scalar(&self, name: &str, line: u32) -> Result<Variable, CompileError> {
        match self.variables.get(name) {
            Some(Binding::Scalar(ty)) => Ok(Variable {
                name: name.to_string(),
                ty: *ty,
            }),
            Some(Binding::Array { .. }) => {
                Err(self.err(line, &format!("Invalid use of array '{}'", name)))
            }
            None => Err(self.err(
                line,
                &format!("Use of uninitialized variable '{}'", name),
            )),
        }
    }

    // --- Token helpers ---

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_is_special(&self, c: char) -> bool {
        matches!(self.peek(), Some(Token { kind: TokenKind::Special(s), .. }) if *s == c)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn next_kind(&mut self, line: u32) -> Result<TokenKind, CompileError> {
        match self.tokens.get(self.pos) {
            Some(token) => {
                let kind = token.kind.clone();
                self.pos += 1;
                Ok(kind)
            }
            None => Err(self.err(line, "Unexpected end of file")),
        }
    }

    fn expect_special(&mut self, c: char, line: u32, message: &str) -> Result<(), CompileError> {
        if self.peek_is_special(c) {
            self.advance();
            Ok(())
        } else {
            Err(self.err(line, message))
        }
    }

    fn expect_newline(&mut self, line: u32, message: &str) -> Result<(), CompileError> {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Newline,
                ..
            }) => {
                self.advance();
                Ok(())
            }
            None => Ok(()), // end of file closes the last line
            _ => Err(self.err(line, message)),
        }
    }

    fn err(&self, line: u32, message: &str) -> CompileError {
        CompileError::Parse {
            message: message.to_string(),
            line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn parse(src: &str) -> Result<SourceFile, CompileError> {
        Parser::from_source(Path::new("test.pbr"), src)?.parse()
    }

    const HEADER: &str = "<region=\"ntsc-u\">\n";

    #[test]
    fn test_minimal_function() {
        let file = parse(&format!("{}def F(int x):\nreturn x\n", HEADER)).unwrap();
        assert_eq!(file.region, Region::NtscU);
        assert_eq!(file.functions.len(), 1);
        let f = &file.functions[0];
        assert_eq!(f.name, "F");
        assert_eq!(f.params.len(), 1);
        assert_eq!(f.ret.as_ref().unwrap().name, "x");
    }

    #[test]
    fn test_precedence_mul_binds_before_add() {
        let src = format!("{}def F(int a, int b, int c):\nset d = a + b * c\nreturn d\n", HEADER);
        let file = parse(&src).unwrap();
        let StmtKind::Set { expr, .. } = &file.functions[0].body[0].kind else {
            panic!("expected set");
        };
        let Expr::Operation(outer) = expr else {
            panic!("expected operation");
        };
        assert_eq!(outer.op, BinOp::Add);
        let Expr::Operation(inner) = &outer.right else {
            panic!("expected a + (b * c)");
        };
        assert_eq!(inner.op, BinOp::Mul);
    }

    #[test]
    fn test_precedence_shift_binds_before_mul() {
        let src = format!("{}def F(int a, int b):\nset d = a * b lshift 0x2\nreturn d\n", HEADER);
        let file = parse(&src).unwrap();
        let StmtKind::Set { expr, .. } = &file.functions[0].body[0].kind else {
            panic!("expected set");
        };
        let Expr::Operation(outer) = expr else {
            panic!("expected operation");
        };
        assert_eq!(outer.op, BinOp::Mul);
        let Expr::Operation(inner) = &outer.right else {
            panic!("expected a * (b lshift 2)");
        };
        assert_eq!(inner.op, BinOp::Lshift);
    }

    #[test]
    fn test_same_precedence_is_left_associative() {
        let src = format!("{}def F(int a, int b, int c):\nset d = a - b + c\nreturn d\n", HEADER);
        let file = parse(&src).unwrap();
        let StmtKind::Set { expr, .. } = &file.functions[0].body[0].kind else {
            panic!("expected set");
        };
        let Expr::Operation(outer) = expr else {
            panic!("expected operation");
        };
        assert_eq!(outer.op, BinOp::Add);
        assert!(matches!(&outer.left, Expr::Operation(o) if o.op == BinOp::Sub));
    }

    #[test]
    fn test_switch_fallthrough_cases_accumulate() {
        let src = format!(
            "{}def F(int x):\nswitch x:\ncase 0x0:\ncase 0x1:\nset x = 0x5\nbreak\ndefault:\nset x = 0x6\nbreak\nend\nreturn x\n",
            HEADER
        );
        let file = parse(&src).unwrap();
        let StmtKind::Switch { blocks, .. } = &file.functions[0].body[0].kind else {
            panic!("expected switch");
        };
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].cases, vec![0, 1]);
        assert!(blocks[1].cases.is_empty());
    }

    #[test]
    fn test_missing_region_tag() {
        assert!(matches!(
            parse("def F(int x):\nreturn x\n"),
            Err(CompileError::Parse { .. })
        ));
    }

    #[test]
    fn test_variable_offset_selects_indexed_form() {
        let src = format!("{}def F(int p, int i):\nlwz v, i ( p )\nreturn v\n", HEADER);
        let file = parse(&src).unwrap();
        let StmtKind::LoadStore { op, .. } = &file.functions[0].body[0].kind else {
            panic!("expected loadstore");
        };
        assert!(matches!(op, Mnemonic::Load(l) if l.indexed));
    }

    #[test]
    fn test_alloc_and_pointer_kinds() {
        let src = format!(
            "{}def F(int x):\nalloc buf = int[0x4]\nset y = buf[0x2]\ncall COPY_RANGE(&buf, x)\nreturn y\n",
            HEADER
        );
        let file = parse(&src).unwrap();
        let StmtKind::Call(call) = &file.functions[0].body[2].kind else {
            panic!("expected call");
        };
        assert!(matches!(
            &call.args[0],
            Expr::Pointer(Pointer { kind: PointerKind::Array, .. })
        ));
    }
}
