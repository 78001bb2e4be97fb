use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::ast::*;

use super::code::{Code, CompiledProgram, Opcode, Operand};
use super::CompileError;

type CompileResult<T> = Result<T, CompileError>;

// ── Stack compiler ───────────────────────────────────────────────────

/// Walks the syntax tree and emits a flat instruction stream.
///
/// Locals are resolved at compile time to slots. Each block saves the
/// next free slot on entry and restores it on exit, so sibling blocks
/// share slots while `frame_size` tracks the high-water mark.
pub struct Compiler {
    code: Vec<Code>,
    functions: HashMap<String, usize>,
    scopes: Vec<HashMap<String, usize>>,
    offsets: Vec<usize>,
    frame_size: usize,
    breaks: Vec<Vec<usize>>,
    continues: Vec<Vec<usize>>,
}

impl Default for Compiler {
    fn default() -> Self {
        Compiler::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Compiler {
            code: Vec::new(),
            functions: HashMap::new(),
            scopes: Vec::new(),
            offsets: Vec::new(),
            frame_size: 0,
            breaks: Vec::new(),
            continues: Vec::new(),
        }
    }

    pub fn compile_program(mut self, program: &Program) -> CompileResult<CompiledProgram> {
        self.emit(Opcode::GetGlobal, Operand::Text("main".to_string()));
        self.emit(Opcode::Call, Operand::Index(0));
        self.emit_bare(Opcode::Exit);

        for function in &program.functions {
            if self.functions.contains_key(&function.name) {
                return Err(CompileError::DuplicateFunction { name: function.name.clone() });
            }
            self.compile_function(function)?;
        }

        Ok(CompiledProgram { code: self.code, functions: self.functions })
    }

    fn compile_function(&mut self, function: &Function) -> CompileResult<()> {
        let entry = self.code.len();
        self.functions.insert(function.name.clone(), entry);
        let alloca = self.emit_bare(Opcode::Alloca);

        self.enter_function();
        for param in &function.params {
            self.declare_local(param);
        }
        for stmt in &function.body {
            self.compile_stmt(stmt)?;
        }
        self.exit_block();

        self.patch(alloca, self.frame_size);
        self.emit_bare(Opcode::Return);
        debug!(function = %function.name, entry, frame_size = self.frame_size, "compiled function");
        Ok(())
    }

    // ── Emission ─────────────────────────────────────────────────────

    fn emit(&mut self, op: Opcode, operand: Operand) -> usize {
        let address = self.code.len();
        self.code.push(Code::new(op, operand));
        address
    }

    fn emit_bare(&mut self, op: Opcode) -> usize {
        let address = self.code.len();
        self.code.push(Code::bare(op));
        address
    }

    /// Emit a jump whose target is filled in later by [`Compiler::patch`].
    fn emit_placeholder(&mut self, op: Opcode) -> usize {
        self.emit_bare(op)
    }

    fn patch(&mut self, address: usize, value: usize) {
        self.code[address].operand = Operand::Index(value);
    }

    fn patch_to_here(&mut self, address: usize) {
        self.patch(address, self.code.len());
    }

    // ── Scopes ───────────────────────────────────────────────────────

    fn enter_function(&mut self) {
        self.frame_size = 0;
        self.scopes = vec![HashMap::new()];
        self.offsets = vec![0];
    }

    fn enter_block(&mut self) {
        let offset = self.offsets.last().copied().unwrap_or(0);
        self.scopes.push(HashMap::new());
        self.offsets.push(offset);
    }

    fn exit_block(&mut self) {
        self.scopes.pop();
        self.offsets.pop();
    }

    fn declare_local(&mut self, name: &str) -> usize {
        let slot = self.offsets.last().copied().unwrap_or(0);
        if let Some(offset) = self.offsets.last_mut() {
            *offset = slot + 1;
        }
        self.frame_size = self.frame_size.max(slot + 1);
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), slot);
        }
        slot
    }

    /// Innermost binding wins; `None` means the name is global.
    fn resolve(&self, name: &str) -> Option<usize> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name).copied())
    }

    fn compile_block(&mut self, body: &[Stmt]) -> CompileResult<()> {
        self.enter_block();
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        self.exit_block();
        Ok(())
    }

    // ── Statements ───────────────────────────────────────────────────

    fn compile_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match stmt {
            Stmt::Function(function) => {
                return Err(CompileError::NestedFunction { name: function.name.clone() });
            }
            Stmt::Return(value) => {
                if let Some(value) = value {
                    self.compile_expr(value)?;
                }
                self.emit_bare(Opcode::Return);
            }
            Stmt::Var(decl) => self.compile_var_decl(decl)?,
            Stmt::For { init, condition, increment, body } => {
                let missing = |clause| CompileError::MissingClause { statement: "for", clause };
                let init = init.as_ref().ok_or_else(|| missing("initializer"))?;
                let condition = condition.as_ref().ok_or_else(|| missing("condition"))?;
                let increment = increment.as_ref().ok_or_else(|| missing("increment"))?;
                self.compile_for(init, condition, increment, body)?;
            }
            Stmt::If { branches, else_body } => {
                if branches.is_empty() {
                    return Err(CompileError::MissingClause { statement: "if", clause: "condition" });
                }
                let mut end_jumps = Vec::new();
                for branch in branches {
                    self.compile_expr(&branch.condition)?;
                    let skip = self.emit_placeholder(Opcode::ConditionJump);
                    self.compile_block(&branch.body)?;
                    end_jumps.push(self.emit_placeholder(Opcode::Jump));
                    self.patch_to_here(skip);
                }
                if let Some(else_body) = else_body {
                    self.compile_block(else_body)?;
                }
                for jump in end_jumps {
                    self.patch_to_here(jump);
                }
            }
            Stmt::Break => {
                if self.breaks.is_empty() {
                    return Err(CompileError::BreakOutsideLoop);
                }
                let jump = self.emit_placeholder(Opcode::Jump);
                if let Some(pending) = self.breaks.last_mut() {
                    pending.push(jump);
                }
            }
            Stmt::Continue => {
                if self.continues.is_empty() {
                    return Err(CompileError::ContinueOutsideLoop);
                }
                let jump = self.emit_placeholder(Opcode::Jump);
                if let Some(pending) = self.continues.last_mut() {
                    pending.push(jump);
                }
            }
            Stmt::Print { newline, args } => {
                for arg in args.iter().rev() {
                    self.compile_expr(arg)?;
                }
                self.emit(Opcode::Print, Operand::Index(args.len()));
                if *newline {
                    self.emit_bare(Opcode::PrintLine);
                }
            }
            Stmt::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit_bare(Opcode::PopOperand);
            }
        }
        Ok(())
    }

    fn compile_var_decl(&mut self, decl: &VarDecl) -> CompileResult<()> {
        let slot = self.declare_local(&decl.name);
        self.compile_expr(&decl.value)?;
        self.emit(Opcode::SetLocal, Operand::Index(slot));
        self.emit_bare(Opcode::PopOperand);
        Ok(())
    }

    fn compile_for(&mut self, init: &VarDecl, condition: &Expr, increment: &Expr, body: &[Stmt]) -> CompileResult<()> {
        self.breaks.push(Vec::new());
        self.continues.push(Vec::new());
        self.enter_block();

        self.compile_var_decl(init)?;
        let loop_top = self.code.len();
        self.compile_expr(condition)?;
        let exit = self.emit_placeholder(Opcode::ConditionJump);

        self.compile_block(body)?;

        let continue_target = self.code.len();
        self.compile_expr(increment)?;
        self.emit_bare(Opcode::PopOperand);
        self.emit(Opcode::Jump, Operand::Index(loop_top));
        self.patch_to_here(exit);

        self.exit_block();
        let end = self.code.len();
        for jump in self.breaks.pop().unwrap_or_default() {
            self.patch(jump, end);
        }
        for jump in self.continues.pop().unwrap_or_default() {
            self.patch(jump, continue_target);
        }
        Ok(())
    }

    // ── Expressions ──────────────────────────────────────────────────

    fn compile_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        match expr {
            Expr::Literal(literal) => self.compile_literal(literal)?,
            Expr::Identifier(name) => match self.resolve(name) {
                Some(slot) => {
                    self.emit(Opcode::GetLocal, Operand::Index(slot));
                }
                None => {
                    self.emit(Opcode::GetGlobal, Operand::Text(name.clone()));
                }
            },
            Expr::Assign { name, value } => {
                self.compile_expr(value)?;
                match self.resolve(name) {
                    Some(slot) => self.emit(Opcode::SetLocal, Operand::Index(slot)),
                    None => self.emit(Opcode::SetGlobal, Operand::Text(name.clone())),
                };
            }
            Expr::Or { left, right } => self.compile_binary(Opcode::LogicalOr, left, right)?,
            Expr::And { left, right } => self.compile_binary(Opcode::LogicalAnd, left, right)?,
            Expr::Relational { op, left, right } => {
                let opcode = match op {
                    RelOp::Equal => Opcode::Equal,
                    RelOp::NotEqual => Opcode::NotEqual,
                    RelOp::LessThan => Opcode::LessThan,
                    RelOp::GreaterThan => Opcode::GreaterThan,
                    RelOp::LessOrEqual => Opcode::LessOrEqual,
                    RelOp::GreaterOrEqual => Opcode::GreaterOrEqual,
                };
                self.compile_binary(opcode, left, right)?;
            }
            Expr::Arithmetic { op, left, right } => {
                let opcode = match op {
                    ArithOp::Add => Opcode::Add,
                    ArithOp::Subtract => Opcode::Subtract,
                    ArithOp::Multiply => Opcode::Multiply,
                    ArithOp::Divide => Opcode::Divide,
                    ArithOp::Modulo => Opcode::Modulo,
                };
                self.compile_binary(opcode, left, right)?;
            }
            Expr::Unary { op, operand } => {
                self.compile_expr(operand)?;
                let opcode = match op {
                    UnaryOp::Absolute => Opcode::Absolute,
                    UnaryOp::Negate => Opcode::ReverseSign,
                };
                self.emit_bare(opcode);
            }
            Expr::Call { callee, args } => {
                for arg in args.iter().rev() {
                    self.compile_expr(arg)?;
                }
                self.compile_expr(callee)?;
                self.emit(Opcode::Call, Operand::Index(args.len()));
            }
            Expr::Index { collection, index } => {
                self.compile_expr(collection)?;
                self.compile_expr(index)?;
                self.emit_bare(Opcode::GetElement);
            }
            Expr::IndexAssign { collection, index, value } => {
                self.compile_expr(value)?;
                self.compile_expr(collection)?;
                self.compile_expr(index)?;
                self.emit_bare(Opcode::SetElement);
            }
            Expr::Array(elements) => {
                for element in elements.iter().rev() {
                    self.compile_expr(element)?;
                }
                self.emit(Opcode::PushArray, Operand::Index(elements.len()));
            }
            Expr::Map(pairs) => {
                let mut seen = HashSet::new();
                for (key, value) in pairs {
                    if !seen.insert(key.as_str()) {
                        return Err(CompileError::DuplicateKey { key: key.clone() });
                    }
                    self.emit(Opcode::PushString, Operand::Text(key.clone()));
                    self.compile_expr(value)?;
                }
                self.emit(Opcode::PushMap, Operand::Index(pairs.len()));
            }
        }
        Ok(())
    }

    fn compile_binary(&mut self, op: Opcode, left: &Expr, right: &Expr) -> CompileResult<()> {
        self.compile_expr(left)?;
        self.compile_expr(right)?;
        self.emit_bare(op);
        Ok(())
    }

    fn compile_literal(&mut self, literal: &Literal) -> CompileResult<()> {
        match literal {
            Literal::Null => self.emit_bare(Opcode::PushNull),
            Literal::Bool(b) => self.emit(Opcode::PushBoolean, Operand::Boolean(*b)),
            Literal::Number(n) if !n.is_finite() => {
                return Err(CompileError::MalformedLiteral { message: format!("number {} is not finite", n) });
            }
            Literal::Number(n) => self.emit(Opcode::PushNumber, Operand::Number(*n)),
            Literal::Text(s) => self.emit(Opcode::PushString, Operand::Text(s.clone())),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use crate::parser::parse;

    fn compile_src(source: &str) -> CompiledProgram {
        let program = parse(lex(source).unwrap()).unwrap();
        Compiler::new().compile_program(&program).unwrap()
    }

    fn compile_err(source: &str) -> CompileError {
        let program = parse(lex(source).unwrap()).unwrap();
        Compiler::new().compile_program(&program).unwrap_err()
    }

    fn frame_size(program: &CompiledProgram, name: &str) -> usize {
        let entry = program.functions[name];
        assert_eq!(program.code[entry].op, Opcode::Alloca);
        match program.code[entry].operand {
            Operand::Index(size) => size,
            ref other => panic!("unpatched alloca: {:?}", other),
        }
    }

    fn at(program: &CompiledProgram, address: usize) -> (Opcode, Operand) {
        let code = &program.code[address];
        (code.op, code.operand.clone())
    }

    #[test]
    fn bootstrap_calls_main_then_exits() {
        let program = compile_src("function main() {}");
        assert_eq!(at(&program, 0), (Opcode::GetGlobal, Operand::Text("main".into())));
        assert_eq!(at(&program, 1), (Opcode::Call, Operand::Index(0)));
        assert_eq!(at(&program, 2), (Opcode::Exit, Operand::None));
        assert_eq!(program.functions["main"], 3);
        assert_eq!(at(&program, 4), (Opcode::Return, Operand::None));
    }

    #[test]
    fn functions_are_laid_out_in_order() {
        let program = compile_src("function a() {} function b(x) { return x; }");
        assert_eq!(program.functions["a"], 3);
        assert_eq!(program.functions["b"], 5);
        assert_eq!(at(&program, 6), (Opcode::GetLocal, Operand::Index(0)));
        assert_eq!(at(&program, 7), (Opcode::Return, Operand::None));
        assert_eq!(at(&program, 8), (Opcode::Return, Operand::None));
    }

    #[test]
    fn params_take_the_first_slots() {
        let program = compile_src("function f(a, b) { var c = 0; }");
        assert_eq!(frame_size(&program, "f"), 3);
        assert_eq!(at(&program, 5), (Opcode::SetLocal, Operand::Index(2)));
    }

    #[test]
    fn sibling_blocks_reuse_slots() {
        let program = compile_src(
            "function main() { if true { var a = 1; var b = 2; } else { var c = 3; } var d = 4; }",
        );
        assert_eq!(frame_size(&program, "main"), 2);
        let set_locals: Vec<Operand> = program
            .code
            .iter()
            .filter(|c| c.op == Opcode::SetLocal)
            .map(|c| c.operand.clone())
            .collect();
        assert_eq!(
            set_locals,
            vec![Operand::Index(0), Operand::Index(1), Operand::Index(0), Operand::Index(0)]
        );
    }

    #[test]
    fn nested_blocks_accumulate_slots() {
        let program = compile_src(
            "function main() { var a = 1; if a { var b = 2; if b { var c = 3; } } var d = 1; }",
        );
        assert_eq!(frame_size(&program, "main"), 3);
    }

    #[test]
    fn inner_scope_shadows_outer() {
        let program = compile_src("function main() { var x = 1; if x { var x = 2; x; } x; }");
        let get_locals: Vec<Operand> = program
            .code
            .iter()
            .filter(|c| c.op == Opcode::GetLocal)
            .map(|c| c.operand.clone())
            .collect();
        // condition, shadowed read, outer read
        assert_eq!(get_locals, vec![Operand::Index(0), Operand::Index(1), Operand::Index(0)]);
    }

    #[test]
    fn unknown_names_are_globals() {
        let program = compile_src("function main() { total = 1; total; }");
        assert_eq!(at(&program, 5), (Opcode::SetGlobal, Operand::Text("total".into())));
        assert_eq!(at(&program, 7), (Opcode::GetGlobal, Operand::Text("total".into())));
    }

    #[test]
    fn if_else_patch_addresses() {
        let program = compile_src("function main() { if x { print 1; } else { print 2; } }");
        assert_eq!(at(&program, 4), (Opcode::GetGlobal, Operand::Text("x".into())));
        assert_eq!(at(&program, 5), (Opcode::ConditionJump, Operand::Index(9)));
        assert_eq!(at(&program, 8), (Opcode::Jump, Operand::Index(11)));
        assert_eq!(at(&program, 9), (Opcode::PushNumber, Operand::Number(2.0)));
        assert_eq!(at(&program, 11), (Opcode::Return, Operand::None));
    }

    #[test]
    fn elif_chain_falls_through_to_next_test() {
        let program = compile_src("function main() { if a { print 1; } elif b { print 2; } }");
        // a: 4 test, 5 cj, 6-7 body, 8 jump end
        assert_eq!(at(&program, 5), (Opcode::ConditionJump, Operand::Index(9)));
        assert_eq!(at(&program, 9), (Opcode::GetGlobal, Operand::Text("b".into())));
        // b: 9 test, 10 cj, 11-12 body, 13 jump end; end = 14
        assert_eq!(at(&program, 10), (Opcode::ConditionJump, Operand::Index(14)));
        assert_eq!(at(&program, 8), (Opcode::Jump, Operand::Index(14)));
        assert_eq!(at(&program, 13), (Opcode::Jump, Operand::Index(14)));
    }

    #[test]
    fn for_loop_patch_addresses() {
        let program = compile_src(
            "function main() { for var i = 0, i < 3, i = i + 1 { if i == 1 { continue; } break; } }",
        );
        assert_eq!(frame_size(&program, "main"), 1);
        // init 4..=6, loop top 7
        assert_eq!(at(&program, 7), (Opcode::GetLocal, Operand::Index(0)));
        assert_eq!(at(&program, 10), (Opcode::ConditionJump, Operand::Index(24)));
        // continue jumps to the increment
        assert_eq!(at(&program, 15), (Opcode::Jump, Operand::Index(18)));
        assert_eq!(at(&program, 14), (Opcode::ConditionJump, Operand::Index(17)));
        // break jumps past the loop
        assert_eq!(at(&program, 17), (Opcode::Jump, Operand::Index(24)));
        assert_eq!(at(&program, 23), (Opcode::Jump, Operand::Index(7)));
        assert_eq!(at(&program, 24), (Opcode::Return, Operand::None));
    }

    #[test]
    fn nested_loops_patch_their_own_breaks() {
        let program = compile_src(
            "function main() { for i = 0, 1, 0 { for j = 0, 1, 0 { break; } break; } }",
        );
        let jumps: Vec<(usize, Operand)> = program
            .code
            .iter()
            .enumerate()
            .filter(|(_, c)| c.op == Opcode::Jump)
            .map(|(i, c)| (i, c.operand.clone()))
            .collect();
        // outer: 4-6 init, 7 cond, 8 cj
        // inner: 9-11 init, 12 cond, 13 cj, 14 break, 15-16 incr, 17 jump 12, end 18
        // outer body: 18 break, 19-20 incr, 21 jump 7, end 22
        assert_eq!(
            jumps,
            vec![
                (14, Operand::Index(18)),
                (17, Operand::Index(12)),
                (18, Operand::Index(22)),
                (21, Operand::Index(7)),
            ]
        );
    }

    #[test]
    fn array_elements_are_emitted_in_reverse() {
        let program = compile_src("function main() { [1, 2, 3]; }");
        assert_eq!(at(&program, 4), (Opcode::PushNumber, Operand::Number(3.0)));
        assert_eq!(at(&program, 6), (Opcode::PushNumber, Operand::Number(1.0)));
        assert_eq!(at(&program, 7), (Opcode::PushArray, Operand::Index(3)));
    }

    #[test]
    fn map_pairs_push_key_then_value() {
        let program = compile_src(r#"function main() { {"a": 1, b: 2}; }"#);
        assert_eq!(at(&program, 4), (Opcode::PushString, Operand::Text("a".into())));
        assert_eq!(at(&program, 5), (Opcode::PushNumber, Operand::Number(1.0)));
        assert_eq!(at(&program, 6), (Opcode::PushString, Operand::Text("b".into())));
        assert_eq!(at(&program, 8), (Opcode::PushMap, Operand::Index(2)));
    }

    #[test]
    fn call_pushes_args_reversed_then_callee() {
        let program = compile_src("function main() { f(1, 2); }");
        assert_eq!(at(&program, 4), (Opcode::PushNumber, Operand::Number(2.0)));
        assert_eq!(at(&program, 5), (Opcode::PushNumber, Operand::Number(1.0)));
        assert_eq!(at(&program, 6), (Opcode::GetGlobal, Operand::Text("f".into())));
        assert_eq!(at(&program, 7), (Opcode::Call, Operand::Index(2)));
        assert_eq!(at(&program, 8), (Opcode::PopOperand, Operand::None));
    }

    #[test]
    fn index_assign_order() {
        let program = compile_src("function main() { var a = 0; a[1] = 2; }");
        let ops: Vec<Opcode> = program.code[7..11].iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![Opcode::PushNumber, Opcode::GetLocal, Opcode::PushNumber, Opcode::SetElement]);
        assert_eq!(at(&program, 7), (Opcode::PushNumber, Operand::Number(2.0)));
    }

    #[test]
    fn print_line_emits_both_ops() {
        let program = compile_src("function main() { printLine 1, 2; }");
        assert_eq!(at(&program, 4), (Opcode::PushNumber, Operand::Number(2.0)));
        assert_eq!(at(&program, 6), (Opcode::Print, Operand::Index(2)));
        assert_eq!(at(&program, 7), (Opcode::PrintLine, Operand::None));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        assert!(matches!(compile_err("function main() { break; }"), CompileError::BreakOutsideLoop));
        assert!(matches!(compile_err("function main() { continue; }"), CompileError::ContinueOutsideLoop));
    }

    #[test]
    fn duplicate_function_is_rejected() {
        let err = compile_err("function f() {} function f() {}");
        assert!(matches!(err, CompileError::DuplicateFunction { name } if name == "f"));
    }

    #[test]
    fn nested_function_is_rejected() {
        let err = compile_err("function main() { function inner() {} }");
        assert!(matches!(err, CompileError::NestedFunction { name } if name == "inner"));
    }

    #[test]
    fn duplicate_map_key_is_rejected() {
        let err = compile_err(r#"function main() { var m = {a: 1, "a": 2}; }"#);
        assert!(matches!(err, CompileError::DuplicateKey { key } if key == "a"));
    }

    #[test]
    fn missing_clauses_are_rejected() {
        let program = Program {
            functions: vec![Function {
                name: "main".into(),
                params: vec![],
                body: vec![Stmt::For { init: None, condition: None, increment: None, body: vec![] }],
                span: Span::UNKNOWN,
            }],
            source: None,
        };
        let err = Compiler::new().compile_program(&program).unwrap_err();
        assert!(matches!(err, CompileError::MissingClause { statement: "for", clause: "initializer" }));

        let program = Program {
            functions: vec![Function {
                name: "main".into(),
                params: vec![],
                body: vec![Stmt::If { branches: vec![], else_body: None }],
                span: Span::UNKNOWN,
            }],
            source: None,
        };
        let err = Compiler::new().compile_program(&program).unwrap_err();
        assert!(matches!(err, CompileError::MissingClause { statement: "if", .. }));
    }

    #[test]
    fn non_finite_number_is_rejected() {
        let program = Program {
            functions: vec![Function {
                name: "main".into(),
                params: vec![],
                body: vec![Stmt::Expr(Expr::Literal(Literal::Number(f64::NAN)))],
                span: Span::UNKNOWN,
            }],
            source: None,
        };
        let err = Compiler::new().compile_program(&program).unwrap_err();
        assert!(matches!(err, CompileError::MalformedLiteral { .. }));
    }
}
