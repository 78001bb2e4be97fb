use crate::ast::*;
use crate::lexer::Token;

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("Parse error at token {position}: {message}")]
pub struct ParseError {
    pub code: &'static str,
    pub position: usize,
    pub span: Span,
    pub message: String,
}

type Result<T> = std::result::Result<T, ParseError>;

/// Parse a token stream into a program. Stops at the first error.
pub fn parse(tokens: Vec<(Token, Span)>) -> Result<Program> {
    Parser::new(tokens).parse_program()
}

impl Parser {
    pub fn new(tokens: Vec<(Token, Span)>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, s)| *s)
            .unwrap_or(Span::UNKNOWN)
    }

    fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|(_, s)| *s)
            .unwrap_or(Span::UNKNOWN)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    /// Consume `expected` if it is next; report whether it was.
    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span> {
        match self.peek() {
            Some(tok) if tok == expected => {
                let span = self.peek_span();
                self.advance();
                Ok(span)
            }
            Some(tok) => Err(self.error("QL-P002", format!("expected {:?}, got {:?}", expected, tok))),
            None => Err(self.error("QL-P003", format!("expected {:?}, got EOF", expected))),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.advance();
                Ok(name)
            }
            Some(tok) => Err(self.error("QL-P004", format!("expected identifier, got {:?}", tok))),
            None => Err(self.error("QL-P003", "expected identifier, got EOF".into())),
        }
    }

    fn error(&self, code: &'static str, message: String) -> ParseError {
        ParseError {
            code,
            position: self.pos,
            span: self.peek_span(),
            message,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // ---- Top-level parsing ----

    pub fn parse_program(&mut self) -> Result<Program> {
        let mut functions = Vec::new();
        while !self.at_end() {
            match self.peek() {
                Some(Token::Function) => functions.push(self.parse_function()?),
                Some(tok) => {
                    return Err(self.error(
                        "QL-P001",
                        format!("expected 'function' at top level, got {:?}", tok),
                    ));
                }
                None => break,
            }
        }
        Ok(Program { functions, source: None })
    }

    /// `function name(a, b) { ... }`
    fn parse_function(&mut self) -> Result<Function> {
        let start = self.expect(&Token::Function)?;
        let name = self.expect_ident()?;
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                params.push(self.expect_ident()?);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(&Token::Comma)?;
            }
        }
        let body = self.parse_block()?;
        Ok(Function { name, params, body, span: start.merge(self.prev_span()) })
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>> {
        self.expect(&Token::LBrace)?;
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                Some(Token::RBrace) => {
                    self.advance();
                    return Ok(stmts);
                }
                None => return Err(self.error("QL-P003", "unclosed block, got EOF".into())),
                Some(_) => stmts.push(self.parse_stmt()?),
            }
        }
    }

    // ---- Statements ----

    fn parse_stmt(&mut self) -> Result<Stmt> {
        match self.peek() {
            Some(Token::Function) => Ok(Stmt::Function(self.parse_function()?)),
            Some(Token::Return) => {
                self.advance();
                if self.eat(&Token::Semi) {
                    return Ok(Stmt::Return(None));
                }
                let value = self.parse_expr()?;
                self.expect(&Token::Semi)?;
                Ok(Stmt::Return(Some(value)))
            }
            Some(Token::Var) => {
                let decl = self.parse_var_decl()?;
                self.expect(&Token::Semi)?;
                Ok(Stmt::Var(decl))
            }
            Some(Token::For) => self.parse_for(),
            Some(Token::If) => self.parse_if(),
            Some(Token::Break) => {
                self.advance();
                self.expect(&Token::Semi)?;
                Ok(Stmt::Break)
            }
            Some(Token::Continue) => {
                self.advance();
                self.expect(&Token::Semi)?;
                Ok(Stmt::Continue)
            }
            Some(Token::Print) | Some(Token::PrintLine) => {
                let newline = self.advance() == Some(&Token::PrintLine);
                let mut args = Vec::new();
                if !self.eat(&Token::Semi) {
                    args.push(self.parse_expr()?);
                    while self.eat(&Token::Comma) {
                        args.push(self.parse_expr()?);
                    }
                    self.expect(&Token::Semi)?;
                }
                Ok(Stmt::Print { newline, args })
            }
            _ => {
                let expr = self.parse_expr()?;
                self.expect(&Token::Semi)?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    /// `[var] name = expr`; the keyword is mandatory outside `for` headers.
    fn parse_var_decl(&mut self) -> Result<VarDecl> {
        self.eat(&Token::Var);
        let name = self.expect_ident()?;
        self.expect(&Token::Assign)?;
        let value = self.parse_expr()?;
        Ok(VarDecl { name, value })
    }

    /// `for [var] i = 0, cond, step { body }`
    fn parse_for(&mut self) -> Result<Stmt> {
        self.expect(&Token::For)?;
        let init = self.parse_var_decl()?;
        self.expect(&Token::Comma)?;
        let condition = self.parse_expr()?;
        self.expect(&Token::Comma)?;
        let increment = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(Stmt::For {
            init: Some(init),
            condition: Some(condition),
            increment: Some(increment),
            body,
        })
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        self.expect(&Token::If)?;
        let mut branches = Vec::new();
        let condition = self.parse_expr()?;
        let body = self.parse_block()?;
        branches.push(Branch { condition, body });

        while self.eat(&Token::Elif) {
            let condition = self.parse_expr()?;
            let body = self.parse_block()?;
            branches.push(Branch { condition, body });
        }

        let else_body = if self.eat(&Token::Else) { Some(self.parse_block()?) } else { None };
        Ok(Stmt::If { branches, else_body })
    }

    // ---- Expressions ----

    pub fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr> {
        let target_pos = self.pos;
        let target_span = self.peek_span();
        let target = self.parse_or()?;
        if !self.eat(&Token::Assign) {
            return Ok(target);
        }
        let value = Box::new(self.parse_assignment()?);
        match target {
            Expr::Identifier(name) => Ok(Expr::Assign { name, value }),
            Expr::Index { collection, index } => Ok(Expr::IndexAssign { collection, index, value }),
            _ => Err(ParseError {
                code: "QL-P006",
                position: target_pos,
                span: target_span,
                message: "invalid assignment target; expected a variable or an index expression".into(),
            }),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or { left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_relational()?;
        while self.eat(&Token::And) {
            let right = self.parse_relational()?;
            left = Expr::And { left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => RelOp::Equal,
                Some(Token::NotEq) => RelOp::NotEqual,
                Some(Token::Less) => RelOp::LessThan,
                Some(Token::Greater) => RelOp::GreaterThan,
                Some(Token::LessEq) => RelOp::LessOrEqual,
                Some(Token::GreaterEq) => RelOp::GreaterOrEqual,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Relational { op, left: Box::new(left), right: Box::new(right) };
        }
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Subtract,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Arithmetic { op, left: Box::new(left), right: Box::new(right) };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithOp::Multiply,
                Some(Token::Slash) => ArithOp::Divide,
                Some(Token::Percent) => ArithOp::Modulo,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Arithmetic { op, left: Box::new(left), right: Box::new(right) };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Some(Token::Plus) => UnaryOp::Absolute,
            Some(Token::Minus) => UnaryOp::Negate,
            _ => return self.parse_postfix(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Expr::Unary { op, operand: Box::new(operand) })
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::LParen) {
                let args = self.parse_list(&Token::RParen)?;
                expr = Expr::Call { callee: Box::new(expr), args };
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_expr()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index { collection: Box::new(expr), index: Box::new(index) };
            } else {
                return Ok(expr);
            }
        }
    }

    /// Comma-separated expressions up to and including `close`.
    fn parse_list(&mut self, close: &Token) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_expr()?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(&Token::Comma)?;
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let tok = match self.peek().cloned() {
            Some(tok) => tok,
            None => return Err(self.error("QL-P003", "expected expression, got EOF".into())),
        };
        match tok {
            Token::Null => {
                self.advance();
                Ok(Expr::Literal(Literal::Null))
            }
            Token::True => {
                self.advance();
                Ok(Expr::Literal(Literal::Bool(true)))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Literal(Literal::Bool(false)))
            }
            Token::Number(n) => {
                self.advance();
                Ok(Expr::Literal(Literal::Number(n)))
            }
            Token::Text(s) => {
                self.advance();
                Ok(Expr::Literal(Literal::Text(s)))
            }
            Token::Ident(name) => {
                self.advance();
                Ok(Expr::Identifier(name))
            }
            Token::LBracket => {
                self.advance();
                Ok(Expr::Array(self.parse_list(&Token::RBracket)?))
            }
            Token::LBrace => {
                self.advance();
                self.parse_map_literal()
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            other => Err(self.error("QL-P005", format!("expected expression, got {:?}", other))),
        }
    }

    /// `{ key: value, ... }` after the opening brace.
    fn parse_map_literal(&mut self) -> Result<Expr> {
        let mut pairs = Vec::new();
        if self.eat(&Token::RBrace) {
            return Ok(Expr::Map(pairs));
        }
        loop {
            let key = match self.peek().cloned() {
                Some(Token::Text(key)) | Some(Token::Ident(key)) => {
                    self.advance();
                    key
                }
                Some(tok) => {
                    return Err(self.error("QL-P007", format!("expected a string or name as map key, got {:?}", tok)));
                }
                None => return Err(self.error("QL-P003", "expected map key, got EOF".into())),
            };
            self.expect(&Token::Colon)?;
            pairs.push((key, self.parse_expr()?));
            if self.eat(&Token::RBrace) {
                return Ok(Expr::Map(pairs));
            }
            self.expect(&Token::Comma)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn parse_str(source: &str) -> Program {
        parse(lex(source).unwrap()).unwrap()
    }

    fn parse_err(source: &str) -> ParseError {
        parse(lex(source).unwrap()).unwrap_err()
    }

    fn main_body(source: &str) -> Vec<Stmt> {
        let mut prog = parse_str(source);
        prog.functions.remove(0).body
    }

    fn num(n: f64) -> Expr {
        Expr::Literal(Literal::Number(n))
    }

    fn ident(name: &str) -> Expr {
        Expr::Identifier(name.to_string())
    }

    #[test]
    fn parse_function_with_params() {
        let prog = parse_str("function add(a, b) { return a + b; }");
        assert_eq!(prog.functions.len(), 1);
        let f = &prog.functions[0];
        assert_eq!(f.name, "add");
        assert_eq!(f.params, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(f.body.len(), 1);
        assert_eq!(f.span, Span { start: 0, end: 36 });
    }

    #[test]
    fn parse_precedence() {
        let body = main_body("function main() { printLine 1 + 2 * 3; }");
        let expected = Stmt::Print {
            newline: true,
            args: vec![Expr::Arithmetic {
                op: ArithOp::Add,
                left: Box::new(num(1.0)),
                right: Box::new(Expr::Arithmetic {
                    op: ArithOp::Multiply,
                    left: Box::new(num(2.0)),
                    right: Box::new(num(3.0)),
                }),
            }],
        };
        assert_eq!(body, vec![expected]);
    }

    #[test]
    fn parse_and_binds_tighter_than_or() {
        let body = main_body("function main() { a or b and c; }");
        match &body[0] {
            Stmt::Expr(Expr::Or { right, .. }) => assert!(matches!(**right, Expr::And { .. })),
            other => panic!("expected or, got {:?}", other),
        }
    }

    #[test]
    fn parse_assignment_is_right_associative() {
        let body = main_body("function main() { a = b = 1; }");
        let expected = Stmt::Expr(Expr::Assign {
            name: "a".into(),
            value: Box::new(Expr::Assign { name: "b".into(), value: Box::new(num(1.0)) }),
        });
        assert_eq!(body, vec![expected]);
    }

    #[test]
    fn parse_index_assign() {
        let body = main_body("function main() { a[0] = 9; }");
        assert_eq!(
            body,
            vec![Stmt::Expr(Expr::IndexAssign {
                collection: Box::new(ident("a")),
                index: Box::new(num(0.0)),
                value: Box::new(num(9.0)),
            })]
        );
    }

    #[test]
    fn parse_for_without_var_keyword() {
        let body = main_body("function main() { for i=0, i<5, i=i+1 { break; } }");
        match &body[0] {
            Stmt::For { init: Some(init), condition: Some(_), increment: Some(_), body } => {
                assert_eq!(init.name, "i");
                assert_eq!(body, &vec![Stmt::Break]);
            }
            other => panic!("expected for, got {:?}", other),
        }
    }

    #[test]
    fn parse_if_elif_else() {
        let body = main_body("function main() { if a { print 1; } elif b { print 2; } else { print 3; } }");
        match &body[0] {
            Stmt::If { branches, else_body } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(branches[1].condition, ident("b"));
                assert!(else_body.is_some());
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn parse_parenthesised_condition() {
        let body = main_body("function main() { if (n < 2) { return 1; } }");
        assert!(matches!(&body[0], Stmt::If { branches, else_body: None } if branches.len() == 1));
    }

    #[test]
    fn parse_unary_operators() {
        let body = main_body("function main() { -x; +y; }");
        assert_eq!(
            body,
            vec![
                Stmt::Expr(Expr::Unary { op: UnaryOp::Negate, operand: Box::new(ident("x")) }),
                Stmt::Expr(Expr::Unary { op: UnaryOp::Absolute, operand: Box::new(ident("y")) }),
            ]
        );
    }

    #[test]
    fn parse_call_and_index_chain() {
        let body = main_body("function main() { f(1, 2)[0]; }");
        match &body[0] {
            Stmt::Expr(Expr::Index { collection, .. }) => match &**collection {
                Expr::Call { args, .. } => assert_eq!(args.len(), 2),
                other => panic!("expected call, got {:?}", other),
            },
            other => panic!("expected index, got {:?}", other),
        }
    }

    #[test]
    fn parse_literals() {
        let body = main_body(r#"function main() { var m = {"a": [1, 2], b: null}; }"#);
        let expected = Stmt::Var(VarDecl {
            name: "m".into(),
            value: Expr::Map(vec![
                ("a".into(), Expr::Array(vec![num(1.0), num(2.0)])),
                ("b".into(), Expr::Literal(Literal::Null)),
            ]),
        });
        assert_eq!(body, vec![expected]);
    }

    #[test]
    fn parse_bare_return_and_print() {
        let body = main_body("function main() { print; return; }");
        assert_eq!(body, vec![Stmt::Print { newline: false, args: vec![] }, Stmt::Return(None)]);
    }

    #[test]
    fn parse_nested_function_is_a_statement() {
        let body = main_body("function main() { function inner() {} }");
        assert!(matches!(&body[0], Stmt::Function(f) if f.name == "inner"));
    }

    #[test]
    fn error_on_top_level_statement() {
        let err = parse_err("var a = 1;");
        assert_eq!(err.code, "QL-P001");
        assert_eq!(err.position, 0);
    }

    #[test]
    fn error_on_missing_semicolon() {
        let err = parse_err("function main() { print 1 }");
        assert_eq!(err.code, "QL-P002");
    }

    #[test]
    fn error_on_eof() {
        let err = parse_err("function main() {");
        assert_eq!(err.code, "QL-P003");
    }

    #[test]
    fn error_on_invalid_assignment_target() {
        let err = parse_err("function main() { 1 + 2 = 3; }");
        assert_eq!(err.code, "QL-P006");
        assert_eq!(err.position, 5);
    }

    #[test]
    fn error_on_bad_map_key() {
        let err = parse_err("function main() { var m = {1: 2}; }");
        assert_eq!(err.code, "QL-P007");
    }
}
