use std::fmt;
use std::rc::Rc;

use crate::types::Type;

/// Source span of a token, expression or statement.
///
/// Lines and columns are 1-indexed to match what editors and the error
/// reporter display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRange {
    pub line: u32,
    pub col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

impl CodeRange {
    pub fn new(line: u32, col: u32, end_line: u32, end_col: u32) -> Self {
        Self {
            line,
            col,
            end_line,
            end_col,
        }
    }

    /// A span covering a single point, used for synthesized nodes.
    pub fn point(line: u32, col: u32) -> Self {
        Self::new(line, col, line, col)
    }

    /// Merges two spans into one covering both.
    pub fn to(self, other: Self) -> Self {
        Self {
            line: self.line,
            col: self.col,
            end_line: other.end_line,
            end_col: other.end_col,
        }
    }
}

impl fmt::Display for CodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// A literal constant in source.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Binary operators, in the surface syntax's spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// An expression paired with its source span.
#[derive(Debug, Clone)]
pub struct ExprLoc {
    pub expr: Expr,
    pub range: CodeRange,
}

impl ExprLoc {
    pub fn new(expr: Expr, range: CodeRange) -> Self {
        Self { expr, range }
    }
}

/// A function definition: named statement form or anonymous lambda literal.
///
/// The body is behind `Rc` so every closure value created from this
/// definition shares one copy of the AST.
#[derive(Debug)]
pub struct FunctionDef {
    pub name: Option<String>,
    /// Generic parameter names, resolved per call by argument inference.
    pub generics: Vec<String>,
    pub params: Vec<Param>,
    pub return_type: Type,
    pub body: Vec<Node>,
    pub range: CodeRange,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

/// A struct declaration with its ordered field list.
#[derive(Debug)]
pub struct StructDecl {
    pub name: String,
    pub generics: Vec<String>,
    pub fields: Vec<FieldDecl>,
    pub range: CodeRange,
}

#[derive(Debug)]
pub struct FieldDecl {
    pub name: String,
    pub ty: Type,
    pub default: Option<ExprLoc>,
}

/// An inline foreign-code block as it appears in source:
/// `<<lang[a, b] …code… >>`.
#[derive(Debug)]
pub struct PolyglotBlock {
    /// Language tag as written (`python`, `js`, `bash`, …).
    pub lang: String,
    /// Host variables injected into the foreign scope.
    pub bindings: Vec<String>,
    /// The foreign source text, verbatim.
    pub code: String,
    pub range: CodeRange,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Literal),
    Ident(String),
    List(Vec<ExprLoc>),
    Dict(Vec<(ExprLoc, ExprLoc)>),
    Unary {
        op: UnaryOp,
        operand: Box<ExprLoc>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<ExprLoc>,
        rhs: Box<ExprLoc>,
    },
    Range {
        start: Box<ExprLoc>,
        end: Box<ExprLoc>,
        inclusive: bool,
    },
    Call {
        callee: Box<ExprLoc>,
        args: Vec<ExprLoc>,
    },
    /// `value |> call`, rewritten at evaluation into a call whose first
    /// argument is `value`.
    Pipeline {
        value: Box<ExprLoc>,
        call: Box<ExprLoc>,
    },
    Member {
        object: Box<ExprLoc>,
        field: String,
    },
    Index {
        object: Box<ExprLoc>,
        index: Box<ExprLoc>,
    },
    Lambda(Rc<FunctionDef>),
    /// `new Name<args> { field: value, ... }`; the `new` keyword is mandatory.
    StructLit {
        name: String,
        type_args: Vec<Type>,
        fields: Vec<(String, ExprLoc)>,
    },
    Polyglot(Rc<PolyglotBlock>),
}

/// Assignment target of `target = value`.
#[derive(Debug, Clone)]
pub enum AssignTarget {
    Name(String),
    Member { object: ExprLoc, field: String },
    Index { object: ExprLoc, index: ExprLoc },
}

/// A statement node.
#[derive(Debug)]
pub enum Node {
    Expr(ExprLoc),
    Let {
        name: String,
        ty: Option<Type>,
        value: ExprLoc,
        range: CodeRange,
    },
    Assign {
        target: AssignTarget,
        value: ExprLoc,
        range: CodeRange,
    },
    Fn(Rc<FunctionDef>),
    Struct(Rc<StructDecl>),
    If {
        cond: ExprLoc,
        then_block: Vec<Node>,
        else_block: Option<Vec<Node>>,
    },
    While {
        cond: ExprLoc,
        body: Vec<Node>,
    },
    For {
        var: String,
        iter: ExprLoc,
        body: Vec<Node>,
        range: CodeRange,
    },
    Break(CodeRange),
    Continue(CodeRange),
    Return {
        value: Option<ExprLoc>,
        range: CodeRange,
    },
    Try {
        body: Vec<Node>,
        catch: Option<CatchClause>,
        finally: Option<Vec<Node>>,
    },
    Throw {
        value: ExprLoc,
        range: CodeRange,
    },
    Use {
        path: Vec<String>,
        alias: Option<String>,
        range: CodeRange,
    },
    /// `export` prefix on a top-level `let`, `fn` or `struct`.
    Export(Box<Node>),
    Block(Vec<Node>),
}

#[derive(Debug)]
pub struct CatchClause {
    pub name: String,
    pub body: Vec<Node>,
}

impl Node {
    /// The span used for error attribution of this statement.
    pub fn range(&self) -> CodeRange {
        match self {
            Self::Expr(e) => e.range,
            Self::Let { range, .. }
            | Self::Assign { range, .. }
            | Self::For { range, .. }
            | Self::Break(range)
            | Self::Continue(range)
            | Self::Return { range, .. }
            | Self::Throw { range, .. }
            | Self::Use { range, .. } => *range,
            Self::Fn(def) => def.range,
            Self::Struct(decl) => decl.range,
            Self::If { cond, .. } | Self::While { cond, .. } => cond.range,
            Self::Try { body, .. } | Self::Block(body) => {
                body.first().map_or(CodeRange::point(1, 1), Self::range)
            }
            Self::Export(inner) => inner.range(),
        }
    }
}
