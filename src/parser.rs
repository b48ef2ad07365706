//! Parsing (tokens to AST)
//!
//! Recursive-descent for statements/declarations, precedence-climbing for
//! expressions. Grounded on the structure of
//! `original_source/src/Parsing/parser.cpp` (the "what" — precedence
//! table, statement grammar) rendered in the teacher's idiom: a `Parser`
//! struct holding a token cursor, `Result`-returning rules, and
//! diagnostic-accumulating panic-mode recovery at statement boundaries
//! instead of propagating the first error.

use crate::ast::*;
use crate::diagnostic::{error_codes, Diagnostic};
use crate::span::Span;
use crate::token::{Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    diagnostics: Vec<Diagnostic>,
}

type PResult<T> = Result<T, Diagnostic>;

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            current: 0,
            diagnostics: Vec::new(),
        }
    }

    /// Parse a full module body (a sequence of top-level declarations).
    pub fn parse(&mut self) -> Result<Vec<Decl>, Vec<Diagnostic>> {
        let mut decls = Vec::new();
        while !self.is_at_end() {
            match self.declaration() {
                Ok(decl) => decls.push(decl),
                Err(diag) => {
                    self.diagnostics.push(diag);
                    self.synchronize();
                }
            }
        }
        if self.diagnostics.is_empty() {
            Ok(decls)
        } else {
            Err(std::mem::take(&mut self.diagnostics))
        }
    }

    // ---- declarations ----------------------------------------------------

    fn declaration(&mut self) -> PResult<Decl> {
        let start = self.peek().span;
        if self.check(&TokenKind::Export) {
            self.advance();
            let inner = self.declaration()?;
            return Ok(Decl {
                span: start.merge(inner.span),
                kind: DeclKind::Export(Box::new(inner)),
            });
        }
        if self.check(&TokenKind::Var) {
            return self.var_decl();
        }
        if self.check(&TokenKind::Func) {
            self.advance();
            let f = self.func_body(true)?;
            return Ok(Decl {
                span: start.merge(f.span),
                kind: DeclKind::Func(f),
            });
        }
        if self.check(&TokenKind::Class) {
            return self.class_decl();
        }
        if self.check(&TokenKind::Struct) {
            return self.struct_decl();
        }
        if self.check(&TokenKind::Import) {
            return self.import_decl();
        }
        let stmt = self.statement()?;
        Ok(Decl {
            span: stmt.span,
            kind: DeclKind::Stmt(stmt),
        })
    }

    fn var_decl(&mut self) -> PResult<Decl> {
        let start = self.advance().span; // `var`
        let name = self.consume_ident("expected variable name")?;
        let initializer = if self.matches(&TokenKind::Equal) {
            Some(self.expression()?)
        } else {
            None
        };
        let end = self.consume(&TokenKind::Semicolon, "expected ';' after variable declaration")?;
        Ok(Decl {
            span: start.merge(end),
            kind: DeclKind::Var { name, initializer },
        })
    }

    fn import_decl(&mut self) -> PResult<Decl> {
        let start = self.advance().span; // `import`
        let path = self.consume_string("expected module path string")?;
        let alias = if self.matches(&TokenKind::As) {
            Some(self.consume_ident("expected alias name")?)
        } else {
            None
        };
        let end = self.consume(&TokenKind::Semicolon, "expected ';' after import")?;
        // Represented as a statement-level marker so the module loader
        // (which runs before the compiler proper) can pull these out by
        // scanning top-level decls without a separate AST pass.
        Ok(Decl {
            span: start.merge(end),
            kind: DeclKind::Stmt(Stmt {
                span: start.merge(end),
                kind: StmtKind::Expr(Expr {
                    span: start.merge(end),
                    kind: ExprKind::ModuleAccess {
                        alias: alias.unwrap_or_default(),
                        name: path,
                    },
                }),
            }),
        })
    }

    fn func_body(&mut self, named: bool) -> PResult<FuncDecl> {
        let start = self.previous().span;
        let name = if named {
            self.consume_ident("expected function name")?
        } else {
            String::new()
        };
        self.consume(&TokenKind::LeftParen, "expected '(' after function name")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                if params.len() >= 255 {
                    return Err(Diagnostic::error_with_code(
                        error_codes::TOO_MANY_LOCALS,
                        "can't have more than 255 parameters",
                        self.peek().span,
                    ));
                }
                params.push(self.consume_ident("expected parameter name")?);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "expected ')' after parameters")?;
        self.consume(&TokenKind::LeftBrace, "expected '{' before function body")?;
        let body = self.block_contents()?;
        let end = self.previous().span;
        Ok(FuncDecl {
            name,
            params,
            body,
            span: start.merge(end),
        })
    }

    fn class_decl(&mut self) -> PResult<Decl> {
        let start = self.advance().span; // `class`
        let name = self.consume_ident("expected class name")?;
        let superclass = if self.matches(&TokenKind::Colon) {
            let super_span = self.peek().span;
            let super_name = self.consume_ident("expected superclass name")?;
            if super_name == name {
                return Err(Diagnostic::error_with_code(
                    error_codes::SELF_INHERITANCE,
                    format!("class '{name}' can't inherit from itself"),
                    super_span,
                ));
            }
            Some((super_name, super_span))
        } else {
            None
        };
        self.consume(&TokenKind::LeftBrace, "expected '{' before class body")?;
        let mut methods = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            self.previous(); // keep span bookkeeping simple; method starts at ident
            methods.push(self.func_body(true)?);
        }
        let end = self.consume(&TokenKind::RightBrace, "expected '}' after class body")?;
        Ok(Decl {
            span: start.merge(end),
            kind: DeclKind::Class(ClassDecl {
                name,
                superclass,
                methods,
                span: start.merge(end),
            }),
        })
    }

    fn struct_decl(&mut self) -> PResult<Decl> {
        let start = self.advance().span; // `struct`
        let name = self.consume_ident("expected struct name")?;
        self.consume(&TokenKind::LeftBrace, "expected '{' before struct body")?;
        let mut fields = Vec::new();
        if !self.check(&TokenKind::RightBrace) {
            loop {
                fields.push(self.consume_ident("expected field name")?);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        let end = self.consume(&TokenKind::RightBrace, "expected '}' after struct body")?;
        Ok(Decl {
            span: start.merge(end),
            kind: DeclKind::Struct(StructDecl {
                name,
                fields,
                span: start.merge(end),
            }),
        })
    }

    // ---- statements --------------------------------------------------

    fn statement(&mut self) -> PResult<Stmt> {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::Print => {
                self.advance();
                let value = self.expression()?;
                let end = self.consume(&TokenKind::Semicolon, "expected ';' after value")?;
                Ok(Stmt {
                    span: tok.span.merge(end),
                    kind: StmtKind::Print(value),
                })
            }
            TokenKind::LeftBrace => {
                self.advance();
                let decls = self.block_contents()?;
                let end = self.previous().span;
                Ok(Stmt {
                    span: tok.span.merge(end),
                    kind: StmtKind::Block(decls),
                })
            }
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Switch => self.switch_statement(),
            TokenKind::Return => {
                self.advance();
                let value = if self.check(&TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.expression()?)
                };
                let end = self.consume(&TokenKind::Semicolon, "expected ';' after return value")?;
                Ok(Stmt {
                    span: tok.span.merge(end),
                    kind: StmtKind::Return(value),
                })
            }
            TokenKind::Break => {
                self.advance();
                let end = self.consume(&TokenKind::Semicolon, "expected ';' after 'break'")?;
                Ok(Stmt {
                    span: tok.span.merge(end),
                    kind: StmtKind::Break,
                })
            }
            TokenKind::Continue => {
                self.advance();
                let end = self.consume(&TokenKind::Semicolon, "expected ';' after 'continue'")?;
                Ok(Stmt {
                    span: tok.span.merge(end),
                    kind: StmtKind::Continue,
                })
            }
            TokenKind::Advance => {
                self.advance();
                let end = self.consume(&TokenKind::Semicolon, "expected ';' after 'advance'")?;
                Ok(Stmt {
                    span: tok.span.merge(end),
                    kind: StmtKind::Advance,
                })
            }
            _ => {
                let expr = self.expression()?;
                let end = self.consume(&TokenKind::Semicolon, "expected ';' after expression")?;
                Ok(Stmt {
                    span: tok.span.merge(end),
                    kind: StmtKind::Expr(expr),
                })
            }
        }
    }

    fn block_contents(&mut self) -> PResult<Vec<Decl>> {
        let mut decls = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            decls.push(self.declaration()?);
        }
        self.consume(&TokenKind::RightBrace, "expected '}' to close block")?;
        Ok(decls)
    }

    fn if_statement(&mut self) -> PResult<Stmt> {
        let start = self.advance().span; // `if`
        self.consume(&TokenKind::LeftParen, "expected '(' after 'if'")?;
        let cond = self.expression()?;
        self.consume(&TokenKind::RightParen, "expected ')' after condition")?;
        let then_branch = Box::new(self.decl_statement()?);
        let else_branch = if self.matches(&TokenKind::Else) {
            Some(Box::new(self.decl_statement()?))
        } else {
            None
        };
        let end = else_branch
            .as_ref()
            .map(|b| b.span)
            .unwrap_or(then_branch.span);
        Ok(Stmt {
            span: start.merge(end),
            kind: StmtKind::If {
                cond,
                then_branch,
                else_branch,
            },
        })
    }

    fn while_statement(&mut self) -> PResult<Stmt> {
        let start = self.advance().span; // `while`
        self.consume(&TokenKind::LeftParen, "expected '(' after 'while'")?;
        let cond = self.expression()?;
        self.consume(&TokenKind::RightParen, "expected ')' after condition")?;
        let body = Box::new(self.decl_statement()?);
        let end = body.span;
        Ok(Stmt {
            span: start.merge(end),
            kind: StmtKind::While { cond, body },
        })
    }

    fn for_statement(&mut self) -> PResult<Stmt> {
        let start = self.advance().span; // `for`
        self.consume(&TokenKind::LeftParen, "expected '(' after 'for'")?;
        let init = if self.matches(&TokenKind::Semicolon) {
            None
        } else if self.check(&TokenKind::Var) {
            Some(Box::new(self.var_decl()?))
        } else {
            let expr = self.expression()?;
            let span = self.consume(&TokenKind::Semicolon, "expected ';' after loop initializer")?;
            Some(Box::new(Decl {
                span: expr.span.merge(span),
                kind: DeclKind::Stmt(Stmt {
                    span: expr.span,
                    kind: StmtKind::Expr(expr),
                }),
            }))
        };
        let cond = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume(&TokenKind::Semicolon, "expected ';' after loop condition")?;
        let post = if self.check(&TokenKind::RightParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume(&TokenKind::RightParen, "expected ')' after for clauses")?;
        let body = Box::new(self.decl_statement()?);
        let end = body.span;
        Ok(Stmt {
            span: start.merge(end),
            kind: StmtKind::For {
                init,
                cond,
                post,
                body,
            },
        })
    }

    fn switch_statement(&mut self) -> PResult<Stmt> {
        let start = self.advance().span; // `switch`
        self.consume(&TokenKind::LeftParen, "expected '(' after 'switch'")?;
        let scrutinee = self.expression()?;
        self.consume(&TokenKind::RightParen, "expected ')' after switch scrutinee")?;
        self.consume(&TokenKind::LeftBrace, "expected '{' before switch body")?;

        let mut cases = Vec::new();
        let mut default = None;
        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            if self.matches(&TokenKind::Case) {
                let value = self.expression()?;
                self.consume(&TokenKind::Colon, "expected ':' after case value")?;
                let body = self.case_body()?;
                cases.push(SwitchCase { value, body });
            } else if self.matches(&TokenKind::Default) {
                if default.is_some() {
                    return Err(Diagnostic::error_with_code(
                        error_codes::DUPLICATE_DEFAULT,
                        "switch statement already has a default case",
                        self.previous().span,
                    ));
                }
                self.consume(&TokenKind::Colon, "expected ':' after 'default'")?;
                default = Some(self.case_body()?);
            } else {
                return Err(Diagnostic::error_with_code(
                    error_codes::UNEXPECTED_TOKEN,
                    "expected 'case' or 'default' in switch body",
                    self.peek().span,
                ));
            }
        }
        let end = self.consume(&TokenKind::RightBrace, "expected '}' after switch body")?;
        Ok(Stmt {
            span: start.merge(end),
            kind: StmtKind::Switch {
                scrutinee,
                cases,
                default,
            },
        })
    }

    fn case_body(&mut self) -> PResult<Vec<Decl>> {
        let mut decls = Vec::new();
        while !self.check(&TokenKind::Case)
            && !self.check(&TokenKind::Default)
            && !self.check(&TokenKind::RightBrace)
            && !self.is_at_end()
        {
            decls.push(self.declaration()?);
        }
        Ok(decls)
    }

    /// A statement position that also accepts a bare declaration (used for
    /// loop/if bodies, mirroring the source grammar's single-statement-or-
    /// block shorthand).
    fn decl_statement(&mut self) -> PResult<Decl> {
        self.declaration()
    }

    // ---- expressions ---------------------------------------------------

    pub fn parse_expression(&mut self) -> Result<Expr, Vec<Diagnostic>> {
        self.expression().map_err(|d| vec![d])
    }

    fn expression(&mut self) -> PResult<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> PResult<Expr> {
        let expr = self.conditional()?;
        if self.matches(&TokenKind::Equal) {
            let value = self.assignment()?;
            let span = expr.span.merge(value.span);
            return match &expr.kind {
                ExprKind::Ident(_) | ExprKind::Index { .. } | ExprKind::Field { .. } => Ok(Expr {
                    span,
                    kind: ExprKind::Assign {
                        target: Box::new(expr),
                        value: Box::new(value),
                    },
                }),
                _ => Err(Diagnostic::error_with_code(
                    error_codes::UNEXPECTED_TOKEN,
                    "invalid assignment target",
                    expr.span,
                )),
            };
        }
        Ok(expr)
    }

    fn conditional(&mut self) -> PResult<Expr> {
        let cond = self.or_expr()?;
        if self.matches(&TokenKind::Question) {
            let then_expr = self.expression()?;
            self.consume(&TokenKind::Colon, "expected ':' in conditional expression")?;
            let else_expr = self.conditional()?;
            let span = cond.span.merge(else_expr.span);
            return Ok(Expr {
                span,
                kind: ExprKind::Conditional {
                    cond: Box::new(cond),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(else_expr),
                },
            });
        }
        Ok(cond)
    }

    fn or_expr(&mut self) -> PResult<Expr> {
        let mut expr = self.and_expr()?;
        while self.matches(&TokenKind::PipePipe) {
            let right = self.and_expr()?;
            let span = expr.span.merge(right.span);
            expr = Expr {
                span,
                kind: ExprKind::Logical {
                    op: LogicalOp::Or,
                    left: Box::new(expr),
                    right: Box::new(right),
                },
            };
        }
        Ok(expr)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        let mut expr = self.equality()?;
        while self.matches(&TokenKind::AmpAmp) {
            let right = self.equality()?;
            let span = expr.span.merge(right.span);
            expr = Expr {
                span,
                kind: ExprKind::Logical {
                    op: LogicalOp::And,
                    left: Box::new(expr),
                    right: Box::new(right),
                },
            };
        }
        Ok(expr)
    }

    fn equality(&mut self) -> PResult<Expr> {
        self.binary_level(
            &[
                (TokenKind::EqualEqual, BinaryOp::Eq),
                (TokenKind::BangEqual, BinaryOp::Ne),
            ],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> PResult<Expr> {
        self.binary_level(
            &[
                (TokenKind::Greater, BinaryOp::Gt),
                (TokenKind::GreaterEqual, BinaryOp::Ge),
                (TokenKind::Less, BinaryOp::Lt),
                (TokenKind::LessEqual, BinaryOp::Le),
            ],
            Self::bitor,
        )
    }

    fn bitor(&mut self) -> PResult<Expr> {
        self.binary_level(&[(TokenKind::Pipe, BinaryOp::BitOr)], Self::bitxor)
    }

    fn bitxor(&mut self) -> PResult<Expr> {
        self.binary_level(&[(TokenKind::Caret, BinaryOp::BitXor)], Self::bitand)
    }

    fn bitand(&mut self) -> PResult<Expr> {
        self.binary_level(&[(TokenKind::Amp, BinaryOp::BitAnd)], Self::shift)
    }

    fn shift(&mut self) -> PResult<Expr> {
        self.binary_level(
            &[
                (TokenKind::Shl, BinaryOp::Shl),
                (TokenKind::Shr, BinaryOp::Shr),
            ],
            Self::term,
        )
    }

    fn term(&mut self) -> PResult<Expr> {
        self.binary_level(
            &[
                (TokenKind::Plus, BinaryOp::Add),
                (TokenKind::Minus, BinaryOp::Sub),
            ],
            Self::factor,
        )
    }

    fn factor(&mut self) -> PResult<Expr> {
        self.binary_level(
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Mod),
            ],
            Self::unary,
        )
    }

    fn binary_level(
        &mut self,
        ops: &[(TokenKind, BinaryOp)],
        mut next: impl FnMut(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let mut expr = next(self)?;
        'outer: loop {
            for (tok, op) in ops {
                if self.check(tok) {
                    self.advance();
                    let right = next(self)?;
                    let span = expr.span.merge(right.span);
                    expr = Expr {
                        span,
                        kind: ExprKind::Binary {
                            op: *op,
                            left: Box::new(expr),
                            right: Box::new(right),
                        },
                    };
                    continue 'outer;
                }
            }
            break;
        }
        Ok(expr)
    }

    fn unary(&mut self) -> PResult<Expr> {
        let tok = self.peek().clone();
        let op = match tok.kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let expr = self.unary()?;
            let span = tok.span.merge(expr.span);
            return Ok(Expr {
                span,
                kind: ExprKind::Unary {
                    op,
                    expr: Box::new(expr),
                },
            });
        }
        if self.check(&TokenKind::Await) {
            self.advance();
            let expr = self.unary()?;
            let span = tok.span.merge(expr.span);
            return Ok(Expr {
                span,
                kind: ExprKind::Await(Box::new(expr)),
            });
        }
        self.call_postfix()
    }

    fn call_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.matches(&TokenKind::LeftParen) {
                let args = self.arguments()?;
                let end = self.previous().span;
                let span = expr.span.merge(end);
                expr = match expr.kind {
                    ExprKind::Field { target, name } => Expr {
                        span,
                        kind: ExprKind::MethodCall {
                            receiver: target,
                            name,
                            args,
                            span_name: span,
                        },
                    },
                    ExprKind::Super(name) => Expr {
                        span,
                        kind: ExprKind::SuperCall { name, args },
                    },
                    other => Expr {
                        span,
                        kind: ExprKind::Call {
                            callee: Box::new(Expr {
                                span: expr.span,
                                kind: other,
                            }),
                            args,
                        },
                    },
                };
            } else if self.matches(&TokenKind::Dot) {
                let name = self.consume_ident("expected property name after '.'")?;
                let end = self.previous().span;
                let span = expr.span.merge(end);
                expr = Expr {
                    span,
                    kind: ExprKind::Field {
                        target: Box::new(expr),
                        name,
                    },
                };
            } else if self.matches(&TokenKind::LeftBracket) {
                let index = self.expression()?;
                let end = self.consume(&TokenKind::RightBracket, "expected ']' after index")?;
                let span = expr.span.merge(end);
                expr = Expr {
                    span,
                    kind: ExprKind::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    },
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn arguments(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                if args.len() >= 255 {
                    return Err(Diagnostic::error_with_code(
                        error_codes::TOO_MANY_LOCALS,
                        "can't have more than 255 arguments",
                        self.peek().span,
                    ));
                }
                args.push(self.expression()?);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "expected ')' after arguments")?;
        Ok(args)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let tok = self.peek().clone();
        let expr = match tok.kind.clone() {
            TokenKind::Number(n) => {
                self.advance();
                Expr {
                    span: tok.span,
                    kind: ExprKind::Number(n),
                }
            }
            TokenKind::String(s) => {
                self.advance();
                Expr {
                    span: tok.span,
                    kind: ExprKind::String(s),
                }
            }
            TokenKind::True => {
                self.advance();
                Expr {
                    span: tok.span,
                    kind: ExprKind::Bool(true),
                }
            }
            TokenKind::False => {
                self.advance();
                Expr {
                    span: tok.span,
                    kind: ExprKind::Bool(false),
                }
            }
            TokenKind::Nil => {
                self.advance();
                Expr {
                    span: tok.span,
                    kind: ExprKind::Nil,
                }
            }
            TokenKind::This => {
                self.advance();
                Expr {
                    span: tok.span,
                    kind: ExprKind::This,
                }
            }
            TokenKind::Super => {
                self.advance();
                self.consume(&TokenKind::Dot, "expected '.' after 'super'")?;
                let name = self.consume_ident("expected superclass method name")?;
                Expr {
                    span: tok.span,
                    kind: ExprKind::Super(name),
                }
            }
            TokenKind::Async => {
                self.advance();
                let callee = self.call_postfix()?;
                let (callee, args) = match callee.kind {
                    ExprKind::Call { callee, args } => (callee, args),
                    other => (
                        Box::new(Expr {
                            span: callee.span,
                            kind: other,
                        }),
                        Vec::new(),
                    ),
                };
                Expr {
                    span: tok.span,
                    kind: ExprKind::LaunchAsync { callee, args },
                }
            }
            TokenKind::Func => {
                self.advance();
                let f = self.func_body(false)?;
                Expr {
                    span: tok.span.merge(f.span),
                    kind: ExprKind::FuncExpr(f),
                }
            }
            TokenKind::Ident(name) => {
                self.advance();
                if self.matches(&TokenKind::ColonColon) {
                    let member = self.consume_ident("expected name after '::'")?;
                    Expr {
                        span: tok.span,
                        kind: ExprKind::ModuleAccess { alias: name, name: member },
                    }
                } else {
                    Expr {
                        span: tok.span,
                        kind: ExprKind::Ident(name),
                    }
                }
            }
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.expression()?;
                self.consume(&TokenKind::RightParen, "expected ')' after expression")?;
                expr
            }
            TokenKind::LeftBracket => {
                self.advance();
                let mut elements = Vec::new();
                if !self.check(&TokenKind::RightBracket) {
                    loop {
                        elements.push(self.expression()?);
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                let end = self.consume(&TokenKind::RightBracket, "expected ']' after array literal")?;
                Expr {
                    span: tok.span.merge(end),
                    kind: ExprKind::Array(elements),
                }
            }
            TokenKind::LeftBrace => {
                self.advance();
                let mut fields = Vec::new();
                if !self.check(&TokenKind::RightBrace) {
                    loop {
                        let name = self.consume_ident("expected field name")?;
                        self.consume(&TokenKind::Colon, "expected ':' after field name")?;
                        let value = self.expression()?;
                        fields.push((name, value));
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                let end = self.consume(&TokenKind::RightBrace, "expected '}' after struct literal")?;
                Expr {
                    span: tok.span.merge(end),
                    kind: ExprKind::Struct(fields),
                }
            }
            _ => {
                return Err(Diagnostic::error_with_code(
                    error_codes::UNEXPECTED_TOKEN,
                    format!("unexpected token '{}'", tok.kind),
                    tok.span,
                ))
            }
        };
        Ok(expr)
    }

    // ---- token cursor helpers -----------------------------------------

    fn is_at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current - 1]
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        &self.tokens[self.current - 1]
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) -> PResult<Span> {
        if self.check(kind) {
            Ok(self.advance().span)
        } else {
            Err(Diagnostic::error_with_code(
                error_codes::UNEXPECTED_TOKEN,
                message,
                self.peek().span,
            ))
        }
    }

    fn consume_ident(&mut self, message: &str) -> PResult<String> {
        if let TokenKind::Ident(name) = self.peek().kind.clone() {
            self.advance();
            Ok(name)
        } else {
            Err(Diagnostic::error_with_code(
                error_codes::UNEXPECTED_TOKEN,
                message,
                self.peek().span,
            ))
        }
    }

    fn consume_string(&mut self, message: &str) -> PResult<String> {
        if let TokenKind::String(s) = self.peek().kind.clone() {
            self.advance();
            Ok(s)
        } else {
            Err(Diagnostic::error_with_code(
                error_codes::UNEXPECTED_TOKEN,
                message,
                self.peek().span,
            ))
        }
    }

    /// Panic-mode recovery: skip to the next statement boundary so a single
    /// parse can surface more than one syntax error (spec.md §4.2).
    fn synchronize(&mut self) {
        while !self.is_at_end() {
            if matches!(self.previous().kind, TokenKind::Semicolon) {
                return;
            }
            if matches!(
                self.peek().kind,
                TokenKind::Class
                    | TokenKind::Func
                    | TokenKind::Var
                    | TokenKind::For
                    | TokenKind::If
                    | TokenKind::While
                    | TokenKind::Print
                    | TokenKind::Return
                    | TokenKind::Switch
            ) {
                return;
            }
            self.advance();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn parse(src: &str) -> Vec<Decl> {
        let tokens = Lexer::new(src).tokenize().unwrap();
        Parser::new(tokens).parse().unwrap()
    }

    #[test]
    fn test_var_and_expr() {
        let decls = parse("var x = 1 + 2;");
        assert_eq!(decls.len(), 1);
        assert!(matches!(decls[0].kind, DeclKind::Var { .. }));
    }

    #[test]
    fn test_function_and_closure_capture() {
        let decls = parse(
            "func mk(){ var i = 0; func inc(){ i = i + 1; return i; } return inc; }",
        );
        assert_eq!(decls.len(), 1);
        match &decls[0].kind {
            DeclKind::Func(f) => assert_eq!(f.body.len(), 3),
            _ => panic!("expected func decl"),
        }
    }

    #[test]
    fn test_class_with_inheritance() {
        let decls = parse("class A { f(){ return 1; } } class B : A { f(){ return super.f() + 10; } }");
        assert_eq!(decls.len(), 2);
        match &decls[1].kind {
            DeclKind::Class(c) => assert_eq!(c.superclass.as_ref().unwrap().0, "A"),
            _ => panic!("expected class decl"),
        }
    }

    #[test]
    fn test_switch_with_advance() {
        let decls = parse(
            r#"switch(2){ case 1: print "a"; advance; case 2: print "b"; advance; case 3: print "c"; default: print "d"; }"#,
        );
        assert_eq!(decls.len(), 1);
    }

    #[test]
    fn test_array_literal_and_index_assignment() {
        let decls = parse("var a = [1,2,3]; a[1] = 99;");
        assert_eq!(decls.len(), 2);
    }

    #[test]
    fn test_module_qualified_access() {
        let decls = parse("var y = m::x;");
        match &decls[0].kind {
            DeclKind::Var { initializer: Some(e), .. } => {
                assert!(matches!(e.kind, ExprKind::ModuleAccess { .. }));
            }
            _ => panic!("expected var decl with initializer"),
        }
    }

    #[test]
    fn test_invalid_assignment_target_is_diagnostic() {
        let tokens = Lexer::new("1 = 2;").tokenize().unwrap();
        let result = Parser::new(tokens).parse();
        assert!(result.is_err());
    }
}
