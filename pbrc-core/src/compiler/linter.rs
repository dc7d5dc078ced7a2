//! Script Linter
//!
//! Semantic validation of parsed source files. The parser guarantees shape;
//! this pass guarantees the rules the code generator relies on: type
//! discipline, operand shapes the lowerer can express, call arity, loop and
//! switch nesting limits, and resolvable function references.
//!
//! The pass runs over the whole compilation unit (main file plus imports) so
//! duplicate function names and forward references across files are checked
//! in one place. All diagnostics are fatal.

use crate::compiler::ast::*;
use crate::compiler::error::CompileError;
use crate::compiler::instruction::{Mnemonic, ValueType};
use crate::compiler::regions::{self, Region};
use std::collections::HashSet;

/// Where a name reference was seen, for the deferred resolution check.
#[derive(Debug, Clone)]
struct FunctionUse {
    name: String,
    line: u32,
}

pub struct Linter {
    region: Region,
    functions: HashSet<String>,
    uses: Vec<FunctionUse>,
}

/// Per-function lint state: loop/switch nesting flags.
struct FnScope {
    in_loop: bool,
    in_switch: bool,
}

impl Linter {
    pub fn new(region: Region) -> Self {
        Linter {
            region,
            functions: HashSet::new(),
            uses: Vec::new(),
        }
    }

    /// Validate one source file, accumulating definitions and references.
    pub fn check_file(&mut self, file: &SourceFile) -> Result<(), CompileError> {
        for function in &file.functions {
            self.check_function(function)?;
        }
        Ok(())
    }

    /// Resolve every collected function reference. Called once after all
    /// files of the unit have been checked.
    pub fn finish(&self) -> Result<(), CompileError> {
        for use_ in &self.uses {
            if use_.name.starts_with("FUN_") {
                continue; // validated at collection time
            }
            if !self.functions.contains(&use_.name)
                && regions::lookup(self.region, &use_.name).is_none()
            {
                return Err(CompileError::Lint {
                    message: format!("Function '{}' is not defined", use_.name),
                    line: use_.line,
                });
            }
        }
        Ok(())
    }

    fn check_function(&mut self, function: &Function) -> Result<(), CompileError> {
        if function.name.starts_with("FUN_") {
            return Err(err(
                function.line,
                format!(
                    "Invalid function name '{}'; the prefix 'FUN_' is reserved for global function references",
                    function.name
                ),
            ));
        }
        if !self.functions.insert(function.name.clone()) {
            return Err(err(
                function.line,
                format!("Duplicate function name '{}'", function.name),
            ));
        }
        if regions::lookup(self.region, &function.name).is_some() {
            log::warn!(
                "function '{}' will hide the global function of the same name",
                function.name
            );
        }

        let mut scope = FnScope {
            in_loop: false,
            in_switch: false,
        };
        self.check_body(&function.body, &mut scope)?;
        Ok(())
    }

    fn check_body(&mut self, body: &[Stmt], scope: &mut FnScope) -> Result<(), CompileError> {
        for stmt in body {
            self.check_stmt(stmt, scope)?;
        }
        Ok(())
    }

    fn check_stmt(&mut self, stmt: &Stmt, scope: &mut FnScope) -> Result<(), CompileError> {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Set { ty, target, expr } => {
                self.check_set(*ty, target, expr, line)?;
            }
            StmtKind::Alloc { .. } => {}
            StmtKind::LoadStore {
                op,
                var,
                base,
                offset,
            } => {
                self.check_loadstore(*op, var, base, offset, line)?;
            }
            StmtKind::Call(call) => self.check_call(call)?,
            StmtKind::If { arms } => {
                for (cond, body) in arms {
                    if let Some(cond) = cond {
                        self.check_condition(cond, line)?;
                    }
                    self.check_body(body, scope)?;
                }
            }
            StmtKind::For { var, range, body } => {
                if scope.in_loop {
                    return Err(err(line, "Nested loops are not supported".into()));
                }
                if let ForRange::Var(range_var) = range {
                    if range_var.name == var.name {
                        return Err(err(
                            line,
                            format!(
                                "Cannot use '{}' as both iterator and range argument",
                                var.name
                            ),
                        ));
                    }
                    if range_var.ty != ValueType::Int {
                        return Err(err(
                            line,
                            "Cannot use 'float' variable as argument for 'range'".into(),
                        ));
                    }
                }
                scope.in_loop = true;
                self.check_body(body, scope)?;
                scope.in_loop = false;
            }
            StmtKind::While { cond, body } => {
                if scope.in_loop {
                    return Err(err(line, "Nested loops are not supported".into()));
                }
                self.check_condition(cond, line)?;
                scope.in_loop = true;
                self.check_body(body, scope)?;
                scope.in_loop = false;
            }
            StmtKind::Switch { var, blocks } => {
                if scope.in_switch {
                    return Err(err(line, "Nested 'switch' statements are not supported".into()));
                }
                if var.ty != ValueType::Int {
                    return Err(err(line, "Cannot switch on a 'float' variable".into()));
                }
                scope.in_switch = true;
                for block in blocks {
                    self.check_body(&block.body, scope)?;
                }
                scope.in_switch = false;
            }
            StmtKind::Break | StmtKind::Continue => {
                if !scope.in_loop {
                    return Err(err(line, "Cannot use 'break' or 'continue' outside of a loop".into()));
                }
            }
        }
        Ok(())
    }

    fn check_set(
        &mut self,
        ty: ValueType,
        target: &SetTarget,
        expr: &Expr,
        line: u32,
    ) -> Result<(), CompileError> {
        let form = match ty {
            ValueType::Int => "set",
            ValueType::Float => "fset",
        };
        match target {
            SetTarget::Var(var) => {
                if var.ty != ty {
                    return Err(err(
                        line,
                        format!(
                            "Invalid '{}' statement; cannot assign to '{}' variable '{}'",
                            form,
                            type_name(var.ty),
                            var.name
                        ),
                    ));
                }
            }
            SetTarget::Element(array) => {
                if array.elem_ty != ty {
                    return Err(err(
                        line,
                        format!(
                            "Invalid '{}' statement; cannot assign to '{}' array '{}'",
                            form,
                            type_name(array.elem_ty),
                            array.name
                        ),
                    ));
                }
            }
        }

        // value shape rules differ per form
        match ty {
            ValueType::Int => self.check_int_expr(expr, line)?,
            ValueType::Float => self.check_float_expr(expr, line)?,
        }

        // pointer and call values skip the operand-type check (their result
        // type is the register they land in, not an expression type)
        match expr {
            Expr::Call(call) => self.check_call(call)?,
            Expr::Pointer(_) => {}
            _ => {
                if expr.value_type() != ty {
                    return Err(err(
                        line,
                        format!("Invalid '{}' statement; value not of type '{}'", form, type_name(ty)),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Rules for values of `set`: casts must target int, pointers must be to
    /// functions, `insert` must follow a literal `mask`.
    fn check_int_expr(&mut self, expr: &Expr, line: u32) -> Result<(), CompileError> {
        match expr {
            Expr::Cast(cast) => {
                if cast.to != ValueType::Int {
                    return Err(err(
                        line,
                        "Cannot cast to type 'float' in 'set' statement".into(),
                    ));
                }
            }
            Expr::Pointer(ptr) => {
                if ptr.kind != PointerKind::Function {
                    let kind = match ptr.kind {
                        PointerKind::Array => "array",
                        _ => "variable",
                    };
                    return Err(err(
                        line,
                        format!("Cannot assign '{}' pointer to variable", kind),
                    ));
                }
                self.record_use(&ptr.target, line)?;
            }
            Expr::Operation(op) => {
                self.check_operation(op, line)?;
                if op.op == BinOp::Insert {
                    match &op.left {
                        Expr::Operation(mask_op) if mask_op.op == BinOp::Mask => {
                            if !matches!(mask_op.right, Expr::Number(_)) {
                                return Err(err(
                                    line,
                                    "Insert mask must be a number literal".into(),
                                ));
                            }
                        }
                        _ => {
                            return Err(err(
                                line,
                                "Cannot use 'insert' except after a 'mask' operation".into(),
                            ));
                        }
                    }
                }
                self.check_int_expr(&op.left, line)?;
                self.check_int_expr(&op.right, line)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Rules for values of `fset`: no literals anywhere, only the four
    /// arithmetic operators, casts must target float.
    fn check_float_expr(&mut self, expr: &Expr, line: u32) -> Result<(), CompileError> {
        match expr {
            Expr::Number(_) => {
                return Err(err(line, "Float literals are not supported".into()));
            }
            Expr::Cast(cast) => {
                if cast.to != ValueType::Float {
                    return Err(err(
                        line,
                        "Cannot cast to type 'int' in 'fset' statement".into(),
                    ));
                }
            }
            Expr::Pointer(_) => {
                return Err(err(line, "Cannot assign a pointer with 'fset'".into()));
            }
            Expr::Operation(op) => {
                if !op.op.valid_on_float() {
                    return Err(err(
                        line,
                        format!("'{}' is not a valid float operation", op.op.name()),
                    ));
                }
                self.check_operation(op, line)?;
                self.check_float_expr(&op.left, line)?;
                self.check_float_expr(&op.right, line)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn check_operation(&mut self, op: &Operation, line: u32) -> Result<(), CompileError> {
        if matches!(op.left, Expr::Number(_)) && matches!(op.right, Expr::Number(_)) {
            return Err(err(
                line,
                "Operations between two literals are not supported".into(),
            ));
        }
        for side in [&op.left, &op.right] {
            match side {
                Expr::Pointer(_) | Expr::Call(_) => {
                    return Err(err(line, "Cannot operate on this expression".into()));
                }
                _ => {}
            }
        }
        // literals carry an int identity, so mixing them into float math
        // trips this check as well
        if op.left.value_type() != op.right.value_type() {
            return Err(err(line, "Type mismatch in operation".into()));
        }
        Ok(())
    }

    fn check_condition(&mut self, cond: &Condition, line: u32) -> Result<(), CompileError> {
        match cond {
            Condition::Single(cmp) => self.check_comparison(cmp, line),
            Condition::Compound { left, right, .. } => {
                self.check_comparison(left, line)?;
                self.check_comparison(right, line)
            }
        }
    }

    fn check_comparison(&mut self, cmp: &Comparison, line: u32) -> Result<(), CompileError> {
        match &cmp.left {
            Expr::Variable(_) => {}
            Expr::Operation(op) => {
                // only one operation may be in-lined in a comparison
                if matches!(op.left, Expr::Operation(_)) || matches!(op.right, Expr::Operation(_)) {
                    return Err(err(
                        line,
                        "Cannot in-line more than one operation in a comparison".into(),
                    ));
                }
                self.check_operation(op, line)?;
            }
            other => {
                return Err(err(
                    line,
                    format!(
                        "Type '{}' cannot appear on the left of a comparison",
                        expr_kind_name(other)
                    ),
                ));
            }
        }
        match &cmp.right {
            Expr::Number(_) | Expr::Variable(_) => {}
            other => {
                return Err(err(
                    line,
                    format!(
                        "Type '{}' cannot appear on the right of a comparison",
                        expr_kind_name(other)
                    ),
                ));
            }
        }
        // literals are ints, so this also rejects float-vs-literal compares
        if cmp.left.value_type() != cmp.right.value_type() {
            return Err(err(line, "Type mismatch in comparison".into()));
        }
        Ok(())
    }

    fn check_call(&mut self, call: &Call) -> Result<(), CompileError> {
        if call.args.len() > 8 {
            return Err(err(
                call.line,
                "Cannot pass more than 8 parameters in a function call".into(),
            ));
        }
        if !call.through_pointer {
            self.record_use(&call.function, call.line)?;
        }
        for arg in &call.args {
            match arg {
                Expr::Number(_) | Expr::Variable(_) => {}
                Expr::Pointer(ptr) => match ptr.kind {
                    PointerKind::Function => self.record_use(&ptr.target, call.line)?,
                    PointerKind::Array => {}
                    PointerKind::Variable => {
                        return Err(err(
                            call.line,
                            format!(
                                "Cannot use '{}' pointer as function argument",
                                ptr.target
                            ),
                        ));
                    }
                },
                other => {
                    return Err(err(
                        call.line,
                        format!(
                            "Invalid function argument of type '{}'",
                            expr_kind_name(other)
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_loadstore(
        &mut self,
        op: Mnemonic,
        var: &Variable,
        base: &Variable,
        offset: &LsOffset,
        line: u32,
    ) -> Result<(), CompileError> {
        let is_float = match op {
            Mnemonic::Load(l) => l.width.is_float(),
            Mnemonic::Store(s) => s.width.is_float(),
            _ => false,
        };
        if matches!(op, Mnemonic::Store(_)) {
            let expected = if is_float {
                ValueType::Float
            } else {
                ValueType::Int
            };
            if var.ty != expected {
                return Err(err(
                    line,
                    format!("Cannot store '{}' variable here", type_name(var.ty)),
                ));
            }
        }
        if let LsOffset::Var(v) = offset {
            if v.ty != ValueType::Int {
                return Err(err(line, "Cannot use 'float' variable as offset".into()));
            }
        }
        if base.ty != ValueType::Int {
            return Err(err(line, "Cannot use 'float' variable as base".into()));
        }
        Ok(())
    }

    /// Record a function reference for the deferred check; `FUN_` literals
    /// are validated immediately (hex shape, 0x80000000..=0x8FFFFFFF).
    fn record_use(&mut self, name: &str, line: u32) -> Result<(), CompileError> {
        if let Some(hex) = name.strip_prefix("FUN_") {
            match u32::from_str_radix(hex, 16) {
                Ok(addr) if (0x8000_0000..=0x8fff_ffff).contains(&addr) => {}
                Ok(_) => {
                    return Err(err(line, "Global function reference out of bounds".into()));
                }
                Err(_) => {
                    return Err(err(
                        line,
                        format!("Invalid global function reference '{}'", name),
                    ));
                }
            }
        }
        self.uses.push(FunctionUse {
            name: name.to_string(),
            line,
        });
        Ok(())
    }
}

fn type_name(ty: ValueType) -> &'static str {
    match ty {
        ValueType::Int => "int",
        ValueType::Float => "float",
    }
}

fn expr_kind_name(expr: &Expr) -> &'static str {
    match expr {
        Expr::Number(_) => "number",
        Expr::Variable(_) => "variable",
        Expr::Array(_) => "array",
        Expr::Pointer(_) => "pointer",
        Expr::Cast(_) => "cast",
        Expr::Operation(_) => "operation",
        Expr::Call(_) => "call",
    }
}

fn err(line: u32, message: String) -> CompileError {
    CompileError::Lint { message, line }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::Parser;
    use std::path::Path;

    fn lint(src: &str) -> Result<(), CompileError> {
        let file = Parser::from_source(Path::new("test.pbr"), src)?.parse()?;
        let mut linter = Linter::new(file.region);
        linter.check_file(&file)?;
        linter.finish()
    }

    const HEADER: &str = "<region=\"ntsc-u\">\n";

    #[test]
    fn test_valid_program_passes() {
        let src = format!(
            "{}def F(int a, int b):\nset c = a + b\nreturn c\n",
            HEADER
        );
        assert!(lint(&src).is_ok());
    }

    #[test]
    fn test_two_literal_operation_rejected() {
        let src = format!("{}def F(int a):\nset c = 0x1 + 0x2\nreturn c\n", HEADER);
        assert!(matches!(lint(&src), Err(CompileError::Lint { .. })));
    }

    #[test]
    fn test_float_literal_rejected() {
        let src = format!("{}def F(float a):\nfset b = a + 0x1\nreturn b\n", HEADER);
        assert!(matches!(lint(&src), Err(CompileError::Lint { .. })));
    }

    #[test]
    fn test_float_mask_rejected() {
        let src = format!("{}def F(float a, float b):\nfset c = a mask b\nreturn c\n", HEADER);
        assert!(matches!(lint(&src), Err(CompileError::Lint { .. })));
    }

    #[test]
    fn test_nested_loops_rejected() {
        let src = format!(
            "{}def F(int n):\nfor i in range(n):\nfor j in range(n):\nset x = j\nend\nend\nreturn x\n",
            HEADER
        );
        assert!(matches!(lint(&src), Err(CompileError::Lint { .. })));
    }

    #[test]
    fn test_break_outside_loop_rejected() {
        let src = format!("{}def F(int n):\nif n gt 0x0:\nbreak\nend\nreturn n\n", HEADER);
        assert!(matches!(lint(&src), Err(CompileError::Lint { .. })));
    }

    #[test]
    fn test_call_arity_limit() {
        let src = format!(
            "{}def F(int a):\ncall COPY_RANGE(a, a, a, a, a, a, a, a, a)\nreturn a\n",
            HEADER
        );
        assert!(matches!(lint(&src), Err(CompileError::Lint { .. })));
    }

    #[test]
    fn test_undefined_function_rejected() {
        let src = format!("{}def F(int a):\ncall Missing(a)\nreturn a\n", HEADER);
        let result = lint(&src);
        assert!(matches!(result, Err(CompileError::Lint { .. })));
    }

    #[test]
    fn test_forward_reference_within_unit_allowed() {
        let src = format!(
            "{}def F(int a):\nset b = call G(a)\nreturn b\ndef G(int x):\nreturn x\n",
            HEADER
        );
        assert!(lint(&src).is_ok());
    }

    #[test]
    fn test_fun_literal_bounds() {
        let ok = format!("{}def F(int a):\ncall FUN_80012340(a)\nreturn a\n", HEADER);
        assert!(lint(&ok).is_ok());
        let bad = format!("{}def F(int a):\ncall FUN_90012340(a)\nreturn a\n", HEADER);
        assert!(matches!(lint(&bad), Err(CompileError::Lint { .. })));
    }

    #[test]
    fn test_float_compared_with_literal_rejected() {
        let src = format!("{}def F(float a):\nif a gt 0x0:\nset b = 0x1\nend\nreturn b\n", HEADER);
        assert!(matches!(lint(&src), Err(CompileError::Lint { .. })));
    }

    #[test]
    fn test_insert_requires_mask() {
        let src = format!("{}def F(int a, int b):\nset c = a insert b\nreturn c\n", HEADER);
        assert!(matches!(lint(&src), Err(CompileError::Lint { .. })));
    }

    #[test]
    fn test_insert_after_mask_allowed() {
        let src = format!(
            "{}def F(int a, int b):\nset c = a mask 0xff insert b\nreturn c\n",
            HEADER
        );
        assert!(lint(&src).is_ok());
    }
}
