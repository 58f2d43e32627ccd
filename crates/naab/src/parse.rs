use std::rc::Rc;

use crate::expressions::{
    AssignTarget, BinaryOp, CatchClause, CodeRange, Expr, ExprLoc, FieldDecl, FunctionDef,
    Literal, Node, Param, PolyglotBlock, StructDecl, UnaryOp,
};
use crate::lexer::{tokenize, SyntaxError, Tok, Token};
use crate::types::Type;

/// Maximum expression/type nesting depth. Prevents stack overflow on
/// pathological inputs like `((((((x))))))`.
pub const MAX_NESTING_DEPTH: u16 = 150;

/// Parses a source buffer into a program.
pub fn parse_program(source: &str) -> Result<Vec<Node>, SyntaxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    parser.parse_program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: u16,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].tok
    }

    fn here(&self) -> (u32, u32) {
        let t = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        (t.line, t.col)
    }

    fn prev_end(&self) -> (u32, u32) {
        let idx = self.pos.saturating_sub(1).min(self.tokens.len() - 1);
        let t = &self.tokens[idx];
        (t.line, t.col)
    }

    fn span_from(&self, start: (u32, u32)) -> CodeRange {
        let (el, ec) = self.prev_end();
        CodeRange::new(start.0, start.1, el, ec)
    }

    fn bump(&mut self) -> Token {
        let t = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.bump();
            true
        } else {
            false
        }
    }

    fn error_here(&self, message: impl Into<String>) -> SyntaxError {
        let (line, col) = self.here();
        SyntaxError::new(message, line, col)
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<Token, SyntaxError> {
        if self.peek() == tok {
            Ok(self.bump())
        } else {
            Err(self.error_here(format!(
                "expected {what}, found {}",
                self.peek().describe()
            )))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, SyntaxError> {
        match self.peek().clone() {
            Tok::Ident(name) => {
                self.bump();
                Ok(name)
            }
            other => Err(self.error_here(format!("expected {what}, found {}", other.describe()))),
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Tok::Newline | Tok::Semicolon) {
            self.bump();
        }
    }

    fn skip_soft_newlines(&mut self) {
        while matches!(self.peek(), Tok::Newline) {
            self.bump();
        }
    }

    fn descend<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, SyntaxError>,
    ) -> Result<T, SyntaxError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(self.error_here("expression nesting too deep"));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn parse_program(&mut self) -> Result<Vec<Node>, SyntaxError> {
        let mut nodes = Vec::new();
        loop {
            self.skip_newlines();
            if matches!(self.peek(), Tok::Eof) {
                return Ok(nodes);
            }
            nodes.push(self.parse_statement()?);
        }
    }

    fn end_of_statement(&mut self) -> Result<(), SyntaxError> {
        match self.peek() {
            Tok::Newline | Tok::Semicolon => {
                self.bump();
                Ok(())
            }
            Tok::RBrace | Tok::Eof => Ok(()),
            other => Err(self.error_here(format!(
                "expected end of statement, found {}",
                other.describe()
            ))),
        }
    }

    fn parse_statement(&mut self) -> Result<Node, SyntaxError> {
        match self.peek() {
            Tok::Export => {
                self.bump();
                let inner = self.parse_statement()?;
                match &inner {
                    Node::Let { .. } | Node::Fn(_) | Node::Struct(_) => {
                        Ok(Node::Export(Box::new(inner)))
                    }
                    _ => Err(self.error_here(
                        "`export` must prefix a `let`, `fn` or `struct` declaration",
                    )),
                }
            }
            Tok::Let => self.parse_let(),
            Tok::Fn => {
                // a named definition; `fn (` is a lambda in expression position
                if matches!(self.peek_at(1), Tok::Ident(_)) {
                    let def = self.parse_fn_def(true)?;
                    Ok(Node::Fn(Rc::new(def)))
                } else {
                    self.parse_expr_statement()
                }
            }
            Tok::Struct => self.parse_struct_decl(),
            Tok::If => self.parse_if(),
            Tok::While => {
                self.bump();
                let cond = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Node::While { cond, body })
            }
            Tok::For => {
                let start = self.here();
                self.bump();
                let var = self.expect_ident("a loop variable")?;
                self.expect(&Tok::In, "`in`")?;
                let iter = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Node::For {
                    var,
                    iter,
                    body,
                    range: self.span_from(start),
                })
            }
            Tok::Break => {
                let start = self.here();
                self.bump();
                let node = Node::Break(self.span_from(start));
                self.end_of_statement()?;
                Ok(node)
            }
            Tok::Continue => {
                let start = self.here();
                self.bump();
                let node = Node::Continue(self.span_from(start));
                self.end_of_statement()?;
                Ok(node)
            }
            Tok::Return => {
                let start = self.here();
                self.bump();
                let value = if matches!(
                    self.peek(),
                    Tok::Newline | Tok::Semicolon | Tok::RBrace | Tok::Eof
                ) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                let node = Node::Return {
                    value,
                    range: self.span_from(start),
                };
                self.end_of_statement()?;
                Ok(node)
            }
            Tok::Try => self.parse_try(),
            Tok::Throw => {
                let start = self.here();
                self.bump();
                let value = self.parse_expr()?;
                let node = Node::Throw {
                    value,
                    range: self.span_from(start),
                };
                self.end_of_statement()?;
                Ok(node)
            }
            Tok::Use => {
                let start = self.here();
                self.bump();
                let mut path = vec![self.expect_ident("a module path")?];
                while self.eat(&Tok::Dot) {
                    path.push(self.expect_ident("a module path segment")?);
                }
                let alias = if self.eat(&Tok::As) {
                    Some(self.expect_ident("an alias")?)
                } else {
                    None
                };
                let node = Node::Use {
                    path,
                    alias,
                    range: self.span_from(start),
                };
                self.end_of_statement()?;
                Ok(node)
            }
            Tok::LBrace => Ok(Node::Block(self.parse_block()?)),
            _ => self.parse_expr_statement(),
        }
    }

    fn parse_let(&mut self) -> Result<Node, SyntaxError> {
        let start = self.here();
        self.bump();
        let name = self.expect_ident("a variable name")?;
        let ty = if self.eat(&Tok::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        self.expect(&Tok::Assign, "`=`")?;
        let value = self.parse_expr()?;
        let node = Node::Let {
            name,
            ty,
            value,
            range: self.span_from(start),
        };
        self.end_of_statement()?;
        Ok(node)
    }

    fn parse_expr_statement(&mut self) -> Result<Node, SyntaxError> {
        let start = self.here();
        let expr = self.parse_expr()?;
        if self.eat(&Tok::Assign) {
            let target = match expr.expr {
                Expr::Ident(name) => AssignTarget::Name(name),
                Expr::Member { object, field } => AssignTarget::Member {
                    object: *object,
                    field,
                },
                Expr::Index { object, index } => AssignTarget::Index {
                    object: *object,
                    index: *index,
                },
                _ => return Err(self.error_here("invalid assignment target")),
            };
            let value = self.parse_expr()?;
            let node = Node::Assign {
                target,
                value,
                range: self.span_from(start),
            };
            self.end_of_statement()?;
            Ok(node)
        } else {
            let node = Node::Expr(expr);
            self.end_of_statement()?;
            Ok(node)
        }
    }

    fn parse_block(&mut self) -> Result<Vec<Node>, SyntaxError> {
        self.skip_soft_newlines();
        self.expect(&Tok::LBrace, "`{`")?;
        let mut nodes = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat(&Tok::RBrace) {
                return Ok(nodes);
            }
            if matches!(self.peek(), Tok::Eof) {
                return Err(self.error_here("unclosed block (missing `}`)"));
            }
            nodes.push(self.parse_statement()?);
        }
    }

    fn parse_if(&mut self) -> Result<Node, SyntaxError> {
        self.bump();
        let cond = self.parse_expr()?;
        let then_block = self.parse_block()?;
        let else_block = if self.eat(&Tok::Else) {
            if matches!(self.peek(), Tok::If) {
                Some(vec![self.parse_if()?])
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };
        Ok(Node::If {
            cond,
            then_block,
            else_block,
        })
    }

    fn parse_try(&mut self) -> Result<Node, SyntaxError> {
        self.bump();
        let body = self.parse_block()?;
        self.skip_soft_newlines();
        let catch = if self.eat(&Tok::Catch) {
            self.expect(&Tok::LParen, "`(`")?;
            let name = self.expect_ident("an exception variable")?;
            self.expect(&Tok::RParen, "`)`")?;
            let handler = self.parse_block()?;
            Some(CatchClause {
                name,
                body: handler,
            })
        } else {
            None
        };
        self.skip_soft_newlines();
        let finally = if self.eat(&Tok::Finally) {
            Some(self.parse_block()?)
        } else {
            None
        };
        if catch.is_none() && finally.is_none() {
            return Err(self.error_here("`try` requires a `catch` or `finally` clause"));
        }
        Ok(Node::Try {
            body,
            catch,
            finally,
        })
    }

    fn parse_generic_params(&mut self) -> Result<Vec<String>, SyntaxError> {
        let mut generics = Vec::new();
        if self.eat(&Tok::Lt) {
            loop {
                generics.push(self.expect_ident("a type parameter")?);
                if self.eat(&Tok::Gt) {
                    break;
                }
                self.expect(&Tok::Comma, "`,`")?;
            }
        }
        Ok(generics)
    }

    fn parse_fn_def(&mut self, named: bool) -> Result<FunctionDef, SyntaxError> {
        let start = self.here();
        self.expect(&Tok::Fn, "`fn`")?;
        let name = if named {
            Some(self.expect_ident("a function name")?)
        } else {
            None
        };
        let generics = self.parse_generic_params()?;
        self.expect(&Tok::LParen, "`(`")?;
        let mut params = Vec::new();
        loop {
            if self.eat(&Tok::RParen) {
                break;
            }
            let pname = self.expect_ident("a parameter name")?;
            let ty = if self.eat(&Tok::Colon) {
                self.parse_type()?
            } else {
                Type::Any
            };
            params.push(Param { name: pname, ty });
            if !self.eat(&Tok::Comma) {
                self.expect(&Tok::RParen, "`)`")?;
                break;
            }
        }
        let return_type = if self.eat(&Tok::Arrow) {
            self.parse_type()?
        } else {
            Type::Void
        };
        let body = self.parse_block()?;
        Ok(FunctionDef {
            name,
            generics,
            params,
            return_type,
            body,
            range: self.span_from(start),
        })
    }

    fn parse_struct_decl(&mut self) -> Result<Node, SyntaxError> {
        let start = self.here();
        self.bump();
        let name = self.expect_ident("a struct name")?;
        let generics = self.parse_generic_params()?;
        self.expect(&Tok::LBrace, "`{`")?;
        let mut fields = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat(&Tok::RBrace) {
                break;
            }
            let fname = self.expect_ident("a field name")?;
            self.expect(&Tok::Colon, "`:`")?;
            let ty = self.parse_type()?;
            let default = if self.eat(&Tok::Assign) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            fields.push(FieldDecl {
                name: fname,
                ty,
                default,
            });
            if !matches!(self.peek(), Tok::RBrace) && !self.eat(&Tok::Comma) {
                self.skip_newlines();
            }
        }
        Ok(Node::Struct(Rc::new(StructDecl {
            name,
            generics,
            fields,
            range: self.span_from(start),
        })))
    }

    // ---- types ----

    fn parse_type(&mut self) -> Result<Type, SyntaxError> {
        self.descend(|p| {
            let first = p.parse_nullable_type()?;
            if !matches!(p.peek(), Tok::Pipe) {
                return Ok(first);
            }
            let mut members = vec![first];
            while p.eat(&Tok::Pipe) {
                members.push(p.parse_nullable_type()?);
            }
            Ok(Type::Union(members))
        })
    }

    fn parse_nullable_type(&mut self) -> Result<Type, SyntaxError> {
        let mut ty = self.parse_base_type()?;
        while self.eat(&Tok::Question) {
            ty = Type::Nullable(Box::new(ty));
        }
        Ok(ty)
    }

    fn parse_type_args(&mut self) -> Result<Vec<Type>, SyntaxError> {
        let mut args = Vec::new();
        self.expect(&Tok::Lt, "`<`")?;
        loop {
            args.push(self.parse_type()?);
            if self.eat(&Tok::Gt) {
                return Ok(args);
            }
            self.expect(&Tok::Comma, "`,`")?;
        }
    }

    fn parse_base_type(&mut self) -> Result<Type, SyntaxError> {
        if matches!(self.peek(), Tok::Fn) {
            self.bump();
            self.expect(&Tok::LParen, "`(`")?;
            let mut params = Vec::new();
            loop {
                if self.eat(&Tok::RParen) {
                    break;
                }
                params.push(self.parse_type()?);
                if !self.eat(&Tok::Comma) {
                    self.expect(&Tok::RParen, "`)`")?;
                    break;
                }
            }
            let ret = if self.eat(&Tok::Arrow) {
                self.parse_type()?
            } else {
                Type::Void
            };
            return Ok(Type::Function {
                params,
                ret: Box::new(ret),
            });
        }
        let name = self.expect_ident("a type name")?;
        Ok(match name.as_str() {
            "any" => Type::Any,
            "void" => Type::Void,
            "int" => Type::Int,
            "float" => Type::Float,
            "string" => Type::Str,
            "bool" => Type::Bool,
            "list" => {
                let mut args = self.parse_type_args()?;
                if args.len() != 1 {
                    return Err(self.error_here("`list` takes exactly one type argument"));
                }
                Type::List(Box::new(args.remove(0)))
            }
            "dict" => {
                let mut args = self.parse_type_args()?;
                if args.len() != 2 {
                    return Err(self.error_here("`dict` takes exactly two type arguments"));
                }
                let v = args.remove(1);
                let k = args.remove(0);
                Type::Dict(Box::new(k), Box::new(v))
            }
            _ => {
                if matches!(self.peek(), Tok::Lt) {
                    // a generic struct annotation names the specialization
                    let args = self.parse_type_args()?;
                    let mut internal = name;
                    for arg in &args {
                        internal.push('_');
                        internal.push_str(&arg.canonical().replace(' ', ""));
                    }
                    Type::Named(internal)
                } else {
                    Type::Named(name)
                }
            }
        })
    }

    // ---- expressions ----

    fn parse_expr(&mut self) -> Result<ExprLoc, SyntaxError> {
        self.descend(Self::parse_pipeline)
    }

    fn parse_pipeline(&mut self) -> Result<ExprLoc, SyntaxError> {
        let start = self.here();
        let mut expr = self.parse_or()?;
        while self.eat(&Tok::PipeGt) {
            let stage = self.parse_or()?;
            let call = match stage.expr {
                Expr::Call { .. } => stage,
                // `x |> f` sugar: treat the bare callee as a zero-arg call
                _ => ExprLoc::new(
                    Expr::Call {
                        callee: Box::new(stage.clone()),
                        args: Vec::new(),
                    },
                    stage.range,
                ),
            };
            expr = ExprLoc::new(
                Expr::Pipeline {
                    value: Box::new(expr),
                    call: Box::new(call),
                },
                self.span_from(start),
            );
        }
        Ok(expr)
    }

    fn binary_level(
        &mut self,
        ops: &[(Tok, BinaryOp)],
        next: impl Fn(&mut Self) -> Result<ExprLoc, SyntaxError> + Copy,
    ) -> Result<ExprLoc, SyntaxError> {
        let start = self.here();
        let mut lhs = next(self)?;
        'outer: loop {
            for (tok, op) in ops {
                if self.peek() == tok {
                    self.bump();
                    let rhs = next(self)?;
                    lhs = ExprLoc::new(
                        Expr::Binary {
                            op: *op,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                        },
                        self.span_from(start),
                    );
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn parse_or(&mut self) -> Result<ExprLoc, SyntaxError> {
        self.binary_level(&[(Tok::OrOr, BinaryOp::Or)], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<ExprLoc, SyntaxError> {
        self.binary_level(&[(Tok::AndAnd, BinaryOp::And)], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<ExprLoc, SyntaxError> {
        self.binary_level(
            &[(Tok::EqEq, BinaryOp::Eq), (Tok::NotEq, BinaryOp::NotEq)],
            Self::parse_comparison,
        )
    }

    fn parse_comparison(&mut self) -> Result<ExprLoc, SyntaxError> {
        self.binary_level(
            &[
                (Tok::LtEq, BinaryOp::LtEq),
                (Tok::GtEq, BinaryOp::GtEq),
                (Tok::Lt, BinaryOp::Lt),
                (Tok::Gt, BinaryOp::Gt),
            ],
            Self::parse_range,
        )
    }

    fn parse_range(&mut self) -> Result<ExprLoc, SyntaxError> {
        let start = self.here();
        let lhs = self.parse_additive()?;
        let inclusive = match self.peek() {
            Tok::DotDotEq => true,
            Tok::DotDot => false,
            _ => return Ok(lhs),
        };
        self.bump();
        let rhs = self.parse_additive()?;
        Ok(ExprLoc::new(
            Expr::Range {
                start: Box::new(lhs),
                end: Box::new(rhs),
                inclusive,
            },
            self.span_from(start),
        ))
    }

    fn parse_additive(&mut self) -> Result<ExprLoc, SyntaxError> {
        self.binary_level(
            &[(Tok::Plus, BinaryOp::Add), (Tok::Minus, BinaryOp::Sub)],
            Self::parse_multiplicative,
        )
    }

    fn parse_multiplicative(&mut self) -> Result<ExprLoc, SyntaxError> {
        self.binary_level(
            &[
                (Tok::Star, BinaryOp::Mul),
                (Tok::Slash, BinaryOp::Div),
                (Tok::Percent, BinaryOp::Mod),
            ],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<ExprLoc, SyntaxError> {
        let start = self.here();
        let op = match self.peek() {
            Tok::Minus => Some(UnaryOp::Neg),
            Tok::Not => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let operand = self.descend(Self::parse_unary)?;
            return Ok(ExprLoc::new(
                Expr::Unary {
                    op,
                    operand: Box::new(operand),
                },
                self.span_from(start),
            ));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<ExprLoc, SyntaxError> {
        let start = self.here();
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Tok::LParen => {
                    self.bump();
                    let mut args = Vec::new();
                    loop {
                        if self.eat(&Tok::RParen) {
                            break;
                        }
                        args.push(self.parse_expr()?);
                        if !self.eat(&Tok::Comma) {
                            self.expect(&Tok::RParen, "`)`")?;
                            break;
                        }
                    }
                    expr = ExprLoc::new(
                        Expr::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        self.span_from(start),
                    );
                }
                Tok::Dot => {
                    self.bump();
                    let field = self.expect_ident("a field name")?;
                    expr = ExprLoc::new(
                        Expr::Member {
                            object: Box::new(expr),
                            field,
                        },
                        self.span_from(start),
                    );
                }
                Tok::LBracket => {
                    self.bump();
                    let index = self.parse_expr()?;
                    self.expect(&Tok::RBracket, "`]`")?;
                    expr = ExprLoc::new(
                        Expr::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                        },
                        self.span_from(start),
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<ExprLoc, SyntaxError> {
        let start = self.here();
        let tok = self.peek().clone();
        match tok {
            Tok::Int(i) => {
                self.bump();
                Ok(ExprLoc::new(
                    Expr::Literal(Literal::Int(i)),
                    self.span_from(start),
                ))
            }
            Tok::Float(f) => {
                self.bump();
                Ok(ExprLoc::new(
                    Expr::Literal(Literal::Float(f)),
                    self.span_from(start),
                ))
            }
            Tok::Str(s) => {
                self.bump();
                Ok(ExprLoc::new(
                    Expr::Literal(Literal::Str(s)),
                    self.span_from(start),
                ))
            }
            Tok::True | Tok::False => {
                self.bump();
                Ok(ExprLoc::new(
                    Expr::Literal(Literal::Bool(matches!(tok, Tok::True))),
                    self.span_from(start),
                ))
            }
            Tok::Null => {
                self.bump();
                Ok(ExprLoc::new(
                    Expr::Literal(Literal::Null),
                    self.span_from(start),
                ))
            }
            Tok::Ident(name) => {
                self.bump();
                Ok(ExprLoc::new(Expr::Ident(name), self.span_from(start)))
            }
            Tok::LParen => {
                self.bump();
                let inner = self.parse_expr()?;
                self.expect(&Tok::RParen, "`)`")?;
                Ok(inner)
            }
            Tok::LBracket => {
                self.bump();
                let mut items = Vec::new();
                loop {
                    if self.eat(&Tok::RBracket) {
                        break;
                    }
                    items.push(self.parse_expr()?);
                    if !self.eat(&Tok::Comma) {
                        self.expect(&Tok::RBracket, "`]`")?;
                        break;
                    }
                }
                Ok(ExprLoc::new(Expr::List(items), self.span_from(start)))
            }
            Tok::LBrace => {
                self.bump();
                let mut entries = Vec::new();
                loop {
                    self.skip_soft_newlines();
                    if self.eat(&Tok::RBrace) {
                        break;
                    }
                    let key = self.parse_expr()?;
                    self.expect(&Tok::Colon, "`:`")?;
                    let value = self.parse_expr()?;
                    entries.push((key, value));
                    self.skip_soft_newlines();
                    if !self.eat(&Tok::Comma) {
                        self.skip_soft_newlines();
                        self.expect(&Tok::RBrace, "`}`")?;
                        break;
                    }
                }
                Ok(ExprLoc::new(Expr::Dict(entries), self.span_from(start)))
            }
            Tok::Fn => {
                let def = self.parse_fn_def(false)?;
                Ok(ExprLoc::new(
                    Expr::Lambda(Rc::new(def)),
                    self.span_from(start),
                ))
            }
            Tok::New => self.parse_struct_literal(),
            Tok::Polyglot {
                lang,
                bindings,
                code,
            } => {
                self.bump();
                let range = self.span_from(start);
                Ok(ExprLoc::new(
                    Expr::Polyglot(Rc::new(PolyglotBlock {
                        lang,
                        bindings,
                        code,
                        range,
                    })),
                    range,
                ))
            }
            other => Err(self.error_here(format!(
                "expected an expression, found {}",
                other.describe()
            ))),
        }
    }

    fn parse_struct_literal(&mut self) -> Result<ExprLoc, SyntaxError> {
        let start = self.here();
        self.expect(&Tok::New, "`new`")?;
        let name = self.expect_ident("a struct name")?;
        let type_args = if matches!(self.peek(), Tok::Lt) {
            self.parse_type_args()?
        } else {
            Vec::new()
        };
        self.expect(&Tok::LBrace, "`{`")?;
        let mut fields = Vec::new();
        loop {
            self.skip_soft_newlines();
            if self.eat(&Tok::RBrace) {
                break;
            }
            let fname = self.expect_ident("a field name")?;
            self.expect(&Tok::Colon, "`:`")?;
            let value = self.parse_expr()?;
            fields.push((fname, value));
            self.skip_soft_newlines();
            if !self.eat(&Tok::Comma) {
                self.skip_soft_newlines();
                self.expect(&Tok::RBrace, "`}`")?;
                break;
            }
        }
        Ok(ExprLoc::new(
            Expr::StructLit {
                name,
                type_args,
                fields,
            },
            self.span_from(start),
        ))
    }
}

/// Static checks run by `check` without evaluating: control-flow keywords
/// outside their context and duplicate parameter names.
pub fn check_program(nodes: &[Node]) -> Result<(), SyntaxError> {
    check_nodes(nodes, false, false)
}

fn check_nodes(nodes: &[Node], in_fn: bool, in_loop: bool) -> Result<(), SyntaxError> {
    for node in nodes {
        check_node(node, in_fn, in_loop)?;
    }
    Ok(())
}

fn check_node(node: &Node, in_fn: bool, in_loop: bool) -> Result<(), SyntaxError> {
    match node {
        Node::Break(range) if !in_loop => Err(SyntaxError::new(
            "`break` outside of a loop",
            range.line,
            range.col,
        )),
        Node::Continue(range) if !in_loop => Err(SyntaxError::new(
            "`continue` outside of a loop",
            range.line,
            range.col,
        )),
        Node::Return { range, .. } if !in_fn => Err(SyntaxError::new(
            "`return` outside of a function",
            range.line,
            range.col,
        )),
        Node::Fn(def) => {
            let mut seen = std::collections::HashSet::new();
            for param in &def.params {
                if !seen.insert(param.name.as_str()) {
                    return Err(SyntaxError::new(
                        format!("duplicate parameter `{}`", param.name),
                        def.range.line,
                        def.range.col,
                    ));
                }
            }
            check_nodes(&def.body, true, false)
        }
        Node::If {
            then_block,
            else_block,
            ..
        } => {
            check_nodes(then_block, in_fn, in_loop)?;
            if let Some(else_block) = else_block {
                check_nodes(else_block, in_fn, in_loop)?;
            }
            Ok(())
        }
        Node::While { body, .. } | Node::For { body, .. } => check_nodes(body, in_fn, true),
        Node::Try {
            body,
            catch,
            finally,
        } => {
            check_nodes(body, in_fn, in_loop)?;
            if let Some(clause) = catch {
                check_nodes(&clause.body, in_fn, in_loop)?;
            }
            if let Some(finally) = finally {
                check_nodes(finally, in_fn, in_loop)?;
            }
            Ok(())
        }
        Node::Block(body) => check_nodes(body, in_fn, in_loop),
        Node::Export(inner) => check_node(inner, in_fn, in_loop),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_let_with_type() {
        let nodes = parse_program("let x: int = 1 + 2\n").unwrap();
        assert!(matches!(
            &nodes[0],
            Node::Let { name, ty: Some(Type::Int), .. } if name == "x"
        ));
    }

    #[test]
    fn parses_for_over_inclusive_range() {
        let nodes = parse_program("for i in 1..=5 { print(i) }").unwrap();
        let Node::For { iter, .. } = &nodes[0] else {
            panic!("expected for");
        };
        assert!(matches!(iter.expr, Expr::Range { inclusive: true, .. }));
    }

    #[test]
    fn parses_nullable_struct_field() {
        let nodes = parse_program("struct P { id: int, note: string? }").unwrap();
        let Node::Struct(decl) = &nodes[0] else {
            panic!("expected struct");
        };
        assert_eq!(decl.fields.len(), 2);
        assert_eq!(decl.fields[1].ty, Type::Nullable(Box::new(Type::Str)));
    }

    #[test]
    fn parses_pipeline_into_call() {
        let nodes = parse_program("let y = 3 |> double()\n").unwrap();
        let Node::Let { value, .. } = &nodes[0] else {
            panic!("expected let");
        };
        assert!(matches!(value.expr, Expr::Pipeline { .. }));
    }

    #[test]
    fn parses_struct_literal_with_new() {
        let nodes = parse_program("let a = new P { id: 1, note: null }\n").unwrap();
        let Node::Let { value, .. } = &nodes[0] else {
            panic!("expected let");
        };
        let Expr::StructLit { name, fields, .. } = &value.expr else {
            panic!("expected struct literal");
        };
        assert_eq!(name, "P");
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn rejects_struct_literal_without_new() {
        // `P { id: 1 }` parses as an identifier followed by a block, which
        // fails at the `:` inside the block
        assert!(parse_program("let a = P { id: 1 }\n").is_err());
    }

    #[test]
    fn parses_try_catch_finally() {
        let src = "try { throw \"x\" } catch (e) { print(e) } finally { print(1) }";
        let nodes = parse_program(src).unwrap();
        let Node::Try { catch, finally, .. } = &nodes[0] else {
            panic!("expected try");
        };
        assert!(catch.is_some());
        assert!(finally.is_some());
    }

    #[test]
    fn parses_union_and_generic_types() {
        let nodes = parse_program("let x: int | string = 1\nlet b: Box<int> = null\n");
        let nodes = nodes.unwrap();
        assert!(matches!(
            &nodes[0],
            Node::Let { ty: Some(Type::Union(members)), .. } if members.len() == 2
        ));
        assert!(matches!(
            &nodes[1],
            Node::Let { ty: Some(Type::Named(n)), .. } if n == "Box_int"
        ));
    }

    #[test]
    fn parses_polyglot_let() {
        let nodes = parse_program("let r = <<bash echo hi >>\nprint(r)\n").unwrap();
        let Node::Let { value, .. } = &nodes[0] else {
            panic!("expected let");
        };
        assert!(matches!(value.expr, Expr::Polyglot(_)));
    }

    #[test]
    fn check_rejects_stray_break() {
        let nodes = parse_program("break\n").unwrap();
        assert!(check_program(&nodes).is_err());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut src = String::new();
        for _ in 0..200 {
            src.push('(');
        }
        src.push('1');
        for _ in 0..200 {
            src.push(')');
        }
        assert!(parse_program(&src).is_err());
    }

    #[test]
    fn lambda_expression() {
        let nodes = parse_program("let f = fn (x: int) -> int { return x + 1 }\n").unwrap();
        let Node::Let { value, .. } = &nodes[0] else {
            panic!("expected let");
        };
        assert!(matches!(value.expr, Expr::Lambda(_)));
    }
}
