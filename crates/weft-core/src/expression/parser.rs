//! Recursive-descent parser producing an [`Expr`] tree.
//!
//! Precedence, loosest first:
//! `||`, `&&`, `== !=`, `< <= > >=`, `+ -`, `* / %`, unary `! -`,
//! postfix (`.field`, `[index]`, `|transform`).

use serde_json::Value;

use super::ExpressionError;
use super::lexer::{Spanned, Token, tokenize};

/// Deepest nesting of groups, unary operators, chained binary operators and
/// postfix steps a single expression may use. Parsing and evaluation both
/// recurse over the tree, so this bounds their stack use.
pub const MAX_NESTING: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Or => "||",
            Self::And => "&&",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
        }
    }
}

/// One step of a member-access chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Field(String),
    Index(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Array(Vec<Expr>),
    /// `root.a[0].b` where `root` is a bound name.
    Path {
        root: String,
        segments: Vec<Segment>,
    },
    /// Member access on a computed value, e.g. `[1, 2][0]` or `f(x).y`.
    Member {
        target: Box<Expr>,
        segment: Segment,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `name(args)`, or `arg0|name(rest)`.
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

pub fn parse(src: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    parser.expect(&Token::Eof)?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|s| s.pos).unwrap_or_default()
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), ExpressionError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected {}", token.describe())))
        }
    }

    fn unexpected(&self, context: &str) -> ExpressionError {
        ExpressionError::Syntax {
            position: self.position(),
            message: format!("{context}, found {}", self.peek().describe()),
        }
    }

    /// Enter one nesting level; the caller leaves it with [`Self::leave`].
    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ExpressionError::Syntax {
                position: self.position(),
                message: format!("expression nests deeper than {MAX_NESTING} levels"),
            });
        }
        Ok(())
    }

    fn leave(&mut self, levels: usize) {
        self.depth = self.depth.saturating_sub(levels);
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> Result<Expr, ExpressionError>,
        ops: &[(Token, BinaryOp)],
    ) -> Result<Expr, ExpressionError> {
        let mut left = next(self)?;
        let mut chained = 0;
        'outer: loop {
            for (token, op) in ops {
                if self.eat(token) {
                    self.enter()?;
                    chained += 1;
                    let right = next(self)?;
                    left = Expr::Binary {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                    continue 'outer;
                }
            }
            self.leave(chained);
            return Ok(left);
        }
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        self.enter()?;
        let expr = self.binary_level(Self::and, &[(Token::OrOr, BinaryOp::Or)])?;
        self.leave(1);
        Ok(expr)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(Self::equality, &[(Token::AndAnd, BinaryOp::And)])
    }

    fn equality(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            Self::relational,
            &[(Token::EqEq, BinaryOp::Eq), (Token::NotEq, BinaryOp::NotEq)],
        )
    }

    fn relational(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            Self::additive,
            &[
                (Token::Le, BinaryOp::Le),
                (Token::Lt, BinaryOp::Lt),
                (Token::Ge, BinaryOp::Ge),
                (Token::Gt, BinaryOp::Gt),
            ],
        )
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            Self::multiplicative,
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            Self::unary,
            &[
                (Token::Star, BinaryOp::Mul),
                (Token::Slash, BinaryOp::Div),
                (Token::Percent, BinaryOp::Rem),
            ],
        )
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        let op = if self.eat(&Token::Bang) {
            UnaryOp::Not
        } else if self.eat(&Token::Minus) {
            UnaryOp::Neg
        } else {
            return self.postfix();
        };
        self.enter()?;
        let expr = self.unary()?;
        self.leave(1);
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.primary()?;
        let mut steps = 0;
        loop {
            if matches!(self.peek(), Token::Dot | Token::LBracket | Token::Pipe) {
                self.enter()?;
                steps += 1;
            }
            let segment = if self.eat(&Token::Dot) {
                match self.advance() {
                    Token::Ident(name) => Segment::Field(name),
                    // keywords are valid field names after a dot
                    Token::True => Segment::Field("true".into()),
                    Token::False => Segment::Field("false".into()),
                    Token::Null => Segment::Field("null".into()),
                    _ => {
                        self.pos -= 1;
                        return Err(self.unexpected("expected field name after '.'"));
                    }
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.or()?;
                self.expect(&Token::RBracket)?;
                Segment::Index(Box::new(index))
            } else if self.eat(&Token::Pipe) {
                let Token::Ident(name) = self.advance() else {
                    self.pos -= 1;
                    return Err(self.unexpected("expected transform name after '|'"));
                };
                let mut args = vec![expr];
                if self.eat(&Token::LParen) {
                    args.extend(self.arguments()?);
                }
                expr = Expr::Call { name, args };
                continue;
            } else {
                self.leave(steps);
                return Ok(expr);
            };

            expr = match expr {
                Expr::Path { root, mut segments } => {
                    segments.push(segment);
                    Expr::Path { root, segments }
                }
                other => Expr::Member {
                    target: Box::new(other),
                    segment,
                },
            };
        }
    }

    /// Arguments after an opening parenthesis, consuming the closing one.
    fn arguments(&mut self) -> Result<Vec<Expr>, ExpressionError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.or()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(&Token::Comma)?;
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            Token::Int(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Float(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::LParen => {
                let expr = self.or()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.or()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(&Token::Comma)?;
                    }
                }
                Ok(Expr::Array(items))
            }
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let args = self.arguments()?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Path {
                        root: name,
                        segments: Vec::new(),
                    })
                }
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("expected an expression"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(root: &str, fields: &[&str]) -> Expr {
        Expr::Path {
            root: root.into(),
            segments: fields.iter().map(|f| Segment::Field(f.to_string())).collect(),
        }
    }

    #[test]
    fn multiplicative_binds_tighter_than_additive() {
        let expr = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinaryOp::Add,
                left: Box::new(Expr::Literal(json!(1))),
                right: Box::new(Expr::Binary {
                    op: BinaryOp::Mul,
                    left: Box::new(Expr::Literal(json!(2))),
                    right: Box::new(Expr::Literal(json!(3))),
                }),
            }
        );
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse("a || b && c").unwrap();
        let Expr::Binary { op, right, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Or);
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::And, .. }));
    }

    #[test]
    fn dotted_path_with_index() {
        let expr = parse("node.fetch.output.items[0]").unwrap();
        let Expr::Path { root, segments } = expr else {
            panic!("expected path");
        };
        assert_eq!(root, "node");
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[3], Segment::Index(Box::new(Expr::Literal(json!(0)))));
    }

    #[test]
    fn pipe_transform_becomes_call() {
        let expr = parse("input.tags|length > 0").unwrap();
        let Expr::Binary { left, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(
            *left,
            Expr::Call {
                name: "length".into(),
                args: vec![path("input", &["tags"])],
            }
        );
    }

    #[test]
    fn pipe_transform_with_arguments() {
        let expr = parse("input.name|contains('bob')").unwrap();
        let Expr::Call { name, args } = expr else {
            panic!("expected call");
        };
        assert_eq!(name, "contains");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn unary_chains() {
        let expr = parse("!!flag").unwrap();
        assert!(matches!(expr, Expr::Unary { op: UnaryOp::Not, .. }));
        let expr = parse("-(1)").unwrap();
        assert!(matches!(expr, Expr::Unary { op: UnaryOp::Neg, .. }));
    }

    #[test]
    fn syntax_errors_carry_position() {
        let err = parse("input >= ").unwrap_err();
        assert!(matches!(err, ExpressionError::Syntax { position: 9, .. }));

        assert!(parse("(1 + 2").is_err());
        assert!(parse("a.").is_err());
        assert!(parse("1 2").is_err());
    }

    fn nesting_error(src: &str) -> bool {
        matches!(
            parse(src),
            Err(ExpressionError::Syntax { message, .. }) if message.contains("nests deeper")
        )
    }

    #[test]
    fn deep_nesting_is_a_syntax_error() {
        let depth = 10_000;
        assert!(nesting_error(&format!("{}1{}", "(".repeat(depth), ")".repeat(depth))));
        assert!(nesting_error(&format!("{}true", "!".repeat(depth))));
        assert!(nesting_error(&format!("{}1", "-".repeat(depth))));
        assert!(nesting_error(&format!("{}1{}", "[".repeat(depth), "]".repeat(depth))));
        assert!(nesting_error(&vec!["1"; depth].join(" + ")));
        assert!(nesting_error(&format!("x{}", "|length".repeat(depth))));
    }

    #[test]
    fn moderate_nesting_still_parses() {
        let src = format!("{}1{}", "(".repeat(40), ")".repeat(40));
        assert_eq!(parse(&src).unwrap(), Expr::Literal(json!(1)));
        assert!(parse(&vec!["1"; 50].join(" + ")).is_ok());
    }
}
