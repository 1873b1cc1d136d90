//! Recursive-descent parser for the step language.

use std::rc::Rc;

use crate::ast::BinOp;
use crate::ast::BoolOp;
use crate::ast::CmpOp;
use crate::ast::Expr;
use crate::ast::ExprKind;
use crate::ast::FStringPart;
use crate::ast::Index;
use crate::ast::Loc;
use crate::ast::Param;
use crate::ast::Program;
use crate::ast::Stmt;
use crate::ast::StmtKind;
use crate::ast::UnaryOp;
use crate::error::ParseError;
use crate::token::FStrPart;
use crate::token::Spanned;
use crate::token::Tok;
use crate::token::tokenize;

/// Parse one step source into a [`Program`].
pub fn parse_program(source: &str) -> Result<Program, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut body = Vec::new();
    while !parser.at_end() {
        match parser.peek() {
            Tok::KwIf | Tok::KwWhile | Tok::KwFor | Tok::KwDef => body.push(parser.statement()?),
            Tok::Newline | Tok::Dedent => {
                parser.bump();
            }
            Tok::Indent => return Err(parser.err("unexpected indent")),
            _ => body.extend(parser.simple_line()?),
        }
    }
    Ok(Program { body })
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|s| &s.tok)
            .unwrap_or(&Tok::EndOfInput)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .map(|s| &s.tok)
            .unwrap_or(&Tok::EndOfInput)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.line)
            .unwrap_or(1)
    }

    fn loc(&self) -> Loc {
        Loc::new(self.line())
    }

    fn bump(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), ParseError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.err(format!("expected {what}, found {:?}", self.peek())))
        }
    }

    fn err(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.line(), message)
    }

    fn at_end(&self) -> bool {
        matches!(self.peek(), Tok::EndOfInput)
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Compound statements only; simple lines go through [`Self::simple_line`]
    /// so `;`-separated statements splice into the enclosing suite.
    fn statement(&mut self) -> Result<Stmt, ParseError> {
        match self.peek() {
            Tok::KwIf => self.if_statement(),
            Tok::KwWhile => self.while_statement(),
            Tok::KwFor => self.for_statement(),
            Tok::KwDef => self.def_statement(),
            other => Err(self.err(format!("expected statement, found {other:?}"))),
        }
    }

    /// Parse all statements of one logical line (handles `;` separators) and
    /// consume the trailing newline. Used for suites, which may hold several
    /// small statements.
    fn simple_line(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = vec![self.small_statement()?];
        while self.eat(&Tok::Semicolon) {
            if matches!(self.peek(), Tok::Newline | Tok::EndOfInput) {
                break;
            }
            stmts.push(self.small_statement()?);
        }
        if !self.eat(&Tok::Newline) && !self.at_end() {
            return Err(self.err(format!("expected newline, found {:?}", self.peek())));
        }
        Ok(stmts)
    }

    fn small_statement(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        match self.peek() {
            Tok::KwPass => {
                self.bump();
                Ok(Stmt {
                    kind: StmtKind::Pass,
                    loc,
                })
            }
            Tok::KwBreak => {
                self.bump();
                Ok(Stmt {
                    kind: StmtKind::Break,
                    loc,
                })
            }
            Tok::KwContinue => {
                self.bump();
                Ok(Stmt {
                    kind: StmtKind::Continue,
                    loc,
                })
            }
            Tok::KwReturn => {
                self.bump();
                let value = if matches!(self.peek(), Tok::Newline | Tok::Semicolon | Tok::EndOfInput)
                {
                    None
                } else {
                    Some(self.expr_or_tuple()?)
                };
                Ok(Stmt {
                    kind: StmtKind::Return { value },
                    loc,
                })
            }
            Tok::KwDel => {
                self.bump();
                let mut targets = vec![self.expression()?];
                while self.eat(&Tok::Comma) {
                    targets.push(self.expression()?);
                }
                Ok(Stmt {
                    kind: StmtKind::Del { targets },
                    loc,
                })
            }
            Tok::KwImport => {
                self.bump();
                let module = self.dotted_name()?;
                // Swallow the rest of the line (`as x`, more modules); the
                // policy rejects the construct regardless.
                self.skip_to_line_end();
                Ok(Stmt {
                    kind: StmtKind::Import { module },
                    loc,
                })
            }
            Tok::KwFrom => {
                self.bump();
                let module = self.dotted_name()?;
                self.skip_to_line_end();
                Ok(Stmt {
                    kind: StmtKind::FromImport { module },
                    loc,
                })
            }
            Tok::KwGlobal => {
                self.bump();
                let names = self.name_list()?;
                Ok(Stmt {
                    kind: StmtKind::Global { names },
                    loc,
                })
            }
            Tok::KwNonlocal => {
                self.bump();
                let names = self.name_list()?;
                Ok(Stmt {
                    kind: StmtKind::Nonlocal { names },
                    loc,
                })
            }
            _ => self.expr_statement(),
        }
    }

    fn dotted_name(&mut self) -> Result<String, ParseError> {
        let mut name = match self.bump() {
            Tok::Name(n) => n,
            other => return Err(self.err(format!("expected module name, found {other:?}"))),
        };
        while self.eat(&Tok::Dot) {
            match self.bump() {
                Tok::Name(n) => {
                    name.push('.');
                    name.push_str(&n);
                }
                other => return Err(self.err(format!("expected name after '.', found {other:?}"))),
            }
        }
        Ok(name)
    }

    fn name_list(&mut self) -> Result<Vec<String>, ParseError> {
        let mut names = Vec::new();
        loop {
            match self.bump() {
                Tok::Name(n) => names.push(n),
                other => return Err(self.err(format!("expected name, found {other:?}"))),
            }
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        Ok(names)
    }

    fn skip_to_line_end(&mut self) {
        while !matches!(self.peek(), Tok::Newline | Tok::EndOfInput) {
            self.bump();
        }
    }

    fn expr_statement(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        let first = self.expr_or_tuple()?;

        let aug = match self.peek() {
            Tok::PlusAssign => Some(BinOp::Add),
            Tok::MinusAssign => Some(BinOp::Sub),
            Tok::StarAssign => Some(BinOp::Mul),
            Tok::SlashAssign => Some(BinOp::Div),
            Tok::DoubleSlashAssign => Some(BinOp::FloorDiv),
            Tok::PercentAssign => Some(BinOp::Mod),
            _ => None,
        };
        if let Some(op) = aug {
            self.bump();
            let value = self.expr_or_tuple()?;
            return Ok(Stmt {
                kind: StmtKind::AugAssign {
                    target: first,
                    op,
                    value,
                },
                loc,
            });
        }

        if self.peek() == &Tok::Assign {
            let mut targets = vec![first];
            let mut value = None;
            while self.eat(&Tok::Assign) {
                let next = self.expr_or_tuple()?;
                if self.peek() == &Tok::Assign {
                    targets.push(next);
                } else {
                    value = Some(next);
                }
            }
            let value = value.ok_or_else(|| self.err("expected value after '='"))?;
            return Ok(Stmt {
                kind: StmtKind::Assign { targets, value },
                loc,
            });
        }

        Ok(Stmt {
            kind: StmtKind::Expr(first),
            loc,
        })
    }

    // ------------------------------------------------------------------
    // Compound statements
    // ------------------------------------------------------------------

    fn if_statement(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        self.expect(&Tok::KwIf, "'if'")?;
        let mut branches = Vec::new();
        let test = self.expression()?;
        self.expect(&Tok::Colon, "':'")?;
        branches.push((test, self.suite()?));
        let mut orelse = Vec::new();
        loop {
            if self.peek() == &Tok::KwElif {
                self.bump();
                let test = self.expression()?;
                self.expect(&Tok::Colon, "':'")?;
                branches.push((test, self.suite()?));
            } else if self.peek() == &Tok::KwElse {
                self.bump();
                self.expect(&Tok::Colon, "':'")?;
                orelse = self.suite()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt {
            kind: StmtKind::If { branches, orelse },
            loc,
        })
    }

    fn while_statement(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        self.expect(&Tok::KwWhile, "'while'")?;
        let test = self.expression()?;
        self.expect(&Tok::Colon, "':'")?;
        let body = self.suite()?;
        Ok(Stmt {
            kind: StmtKind::While { test, body },
            loc,
        })
    }

    fn for_statement(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        self.expect(&Tok::KwFor, "'for'")?;
        let target = self.target_list()?;
        self.expect(&Tok::KwIn, "'in'")?;
        let iter = self.expr_or_tuple()?;
        self.expect(&Tok::Colon, "':'")?;
        let body = self.suite()?;
        Ok(Stmt {
            kind: StmtKind::For { target, iter, body },
            loc,
        })
    }

    fn def_statement(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        self.expect(&Tok::KwDef, "'def'")?;
        let name = match self.bump() {
            Tok::Name(n) => n,
            other => return Err(self.err(format!("expected function name, found {other:?}"))),
        };
        self.expect(&Tok::LParen, "'('")?;
        let params = self.param_list(&Tok::RParen)?;
        self.expect(&Tok::RParen, "')'")?;
        self.expect(&Tok::Colon, "':'")?;
        let body = self.suite()?;
        Ok(Stmt {
            kind: StmtKind::FuncDef {
                name,
                params,
                body: Rc::new(body),
            },
            loc,
        })
    }

    fn param_list(&mut self, terminator: &Tok) -> Result<Vec<Param>, ParseError> {
        let mut params = Vec::new();
        let mut seen_default = false;
        while self.peek() != terminator {
            let name = match self.bump() {
                Tok::Name(n) => n,
                other => return Err(self.err(format!("expected parameter name, found {other:?}"))),
            };
            let default = if self.eat(&Tok::Assign) {
                seen_default = true;
                Some(self.expression()?)
            } else {
                if seen_default {
                    return Err(self.err("parameter without default after defaulted parameter"));
                }
                None
            };
            params.push(Param { name, default });
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        Ok(params)
    }

    /// A suite is either the rest of the line (`if x: y = 1`) or an indented
    /// block.
    fn suite(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if self.eat(&Tok::Newline) {
            self.expect(&Tok::Indent, "an indented block")?;
            let mut body = Vec::new();
            while self.peek() != &Tok::Dedent {
                if self.at_end() {
                    return Err(self.err("unexpected end of input inside block"));
                }
                match self.peek() {
                    Tok::KwIf | Tok::KwWhile | Tok::KwFor | Tok::KwDef => {
                        body.push(self.statement()?);
                    }
                    _ => body.extend(self.simple_line()?),
                }
            }
            self.expect(&Tok::Dedent, "dedent")?;
            Ok(body)
        } else {
            self.simple_line()
        }
    }

    /// Assignment/`for` target list: names, attributes, subscripts and
    /// (possibly parenthesized) tuples of those. Parsed separately from
    /// expressions so `in` is not consumed as a comparison operator.
    fn target_list(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();
        let mut items = vec![self.target_item()?];
        let mut trailing_comma = false;
        while self.eat(&Tok::Comma) {
            if matches!(self.peek(), Tok::KwIn | Tok::Colon | Tok::Assign) {
                trailing_comma = true;
                break;
            }
            items.push(self.target_item()?);
        }
        if items.len() == 1 && !trailing_comma {
            Ok(items.remove(0))
        } else {
            Ok(Expr {
                kind: ExprKind::Tuple(items),
                loc,
            })
        }
    }

    fn target_item(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Tok::LParen) {
            let inner = self.target_list()?;
            self.expect(&Tok::RParen, "')'")?;
            return Ok(inner);
        }
        let loc = self.loc();
        let base = match self.bump() {
            Tok::Name(n) => Expr {
                kind: ExprKind::Name(n),
                loc,
            },
            other => return Err(self.err(format!("invalid assignment target: {other:?}"))),
        };
        self.trailers(base)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Expression list that may form a tuple: `a, b` or `a,`.
    fn expr_or_tuple(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();
        let first = self.expression()?;
        if self.peek() != &Tok::Comma {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Tok::Comma) {
            if matches!(
                self.peek(),
                Tok::Newline
                    | Tok::EndOfInput
                    | Tok::Semicolon
                    | Tok::RParen
                    | Tok::RBracket
                    | Tok::RBrace
                    | Tok::Assign
                    | Tok::Colon
            ) {
                break;
            }
            items.push(self.expression()?);
        }
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            loc,
        })
    }

    fn expression(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == &Tok::KwLambda {
            return self.lambda();
        }
        let loc = self.loc();
        let value = self.or_expr()?;
        if self.peek() == &Tok::KwIf {
            self.bump();
            let test = self.or_expr()?;
            self.expect(&Tok::KwElse, "'else'")?;
            let orelse = self.expression()?;
            return Ok(Expr {
                kind: ExprKind::Ternary {
                    test: Box::new(test),
                    body: Box::new(value),
                    orelse: Box::new(orelse),
                },
                loc,
            });
        }
        Ok(value)
    }

    fn lambda(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();
        self.expect(&Tok::KwLambda, "'lambda'")?;
        let params = self.param_list(&Tok::Colon)?;
        self.expect(&Tok::Colon, "':'")?;
        let body = self.expression()?;
        Ok(Expr {
            kind: ExprKind::Lambda {
                params,
                body: Box::new(body),
            },
            loc,
        })
    }

    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();
        let first = self.and_expr()?;
        if self.peek() != &Tok::KwOr {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Tok::KwOr) {
            values.push(self.and_expr()?);
        }
        Ok(Expr {
            kind: ExprKind::BoolChain {
                op: BoolOp::Or,
                values,
            },
            loc,
        })
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();
        let first = self.not_expr()?;
        if self.peek() != &Tok::KwAnd {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Tok::KwAnd) {
            values.push(self.not_expr()?);
        }
        Ok(Expr {
            kind: ExprKind::BoolChain {
                op: BoolOp::And,
                values,
            },
            loc,
        })
    }

    fn not_expr(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == &Tok::KwNot {
            let loc = self.loc();
            self.bump();
            let operand = self.not_expr()?;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                loc,
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();
        let left = self.arith()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::EqEq => CmpOp::Eq,
                Tok::NotEq => CmpOp::NotEq,
                Tok::Lt => CmpOp::Lt,
                Tok::Le => CmpOp::Le,
                Tok::Gt => CmpOp::Gt,
                Tok::Ge => CmpOp::Ge,
                Tok::KwIn => CmpOp::In,
                Tok::KwNot => {
                    if self.peek_at(1) == &Tok::KwIn {
                        self.bump();
                        CmpOp::NotIn
                    } else {
                        break;
                    }
                }
                Tok::KwIs => {
                    if self.peek_at(1) == &Tok::KwNot {
                        self.bump();
                        self.bump();
                        ops.push(CmpOp::IsNot);
                        comparators.push(self.arith()?);
                        continue;
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.bump();
            ops.push(op);
            comparators.push(self.arith()?);
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr {
                kind: ExprKind::Compare {
                    left: Box::new(left),
                    ops,
                    comparators,
                },
                loc,
            })
        }
    }

    fn arith(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            let loc = self.loc();
            self.bump();
            let right = self.term()?;
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                loc,
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::DoubleSlash => BinOp::FloorDiv,
                Tok::Percent => BinOp::Mod,
                _ => break,
            };
            let loc = self.loc();
            self.bump();
            let right = self.factor()?;
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                loc,
            };
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();
        match self.peek() {
            Tok::Minus => {
                self.bump();
                let operand = self.factor()?;
                Ok(Expr {
                    kind: ExprKind::Unary {
                        op: UnaryOp::Neg,
                        operand: Box::new(operand),
                    },
                    loc,
                })
            }
            Tok::Plus => {
                self.bump();
                let operand = self.factor()?;
                Ok(Expr {
                    kind: ExprKind::Unary {
                        op: UnaryOp::Pos,
                        operand: Box::new(operand),
                    },
                    loc,
                })
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, ParseError> {
        let base = self.postfix()?;
        if self.peek() == &Tok::DoubleStar {
            let loc = self.loc();
            self.bump();
            // Right-associative, binds tighter than unary on the right.
            let exp = self.factor()?;
            return Ok(Expr {
                kind: ExprKind::Binary {
                    op: BinOp::Pow,
                    left: Box::new(base),
                    right: Box::new(exp),
                },
                loc,
            });
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let atom = self.atom()?;
        self.trailers(atom)
    }

    fn trailers(&mut self, mut value: Expr) -> Result<Expr, ParseError> {
        loop {
            match self.peek() {
                Tok::LParen => {
                    let loc = self.loc();
                    self.bump();
                    let (args, kwargs) = self.call_args()?;
                    self.expect(&Tok::RParen, "')'")?;
                    value = Expr {
                        kind: ExprKind::Call {
                            func: Box::new(value),
                            args,
                            kwargs,
                        },
                        loc,
                    };
                }
                Tok::Dot => {
                    let loc = self.loc();
                    self.bump();
                    let attr = match self.bump() {
                        Tok::Name(n) => n,
                        other => {
                            return Err(
                                self.err(format!("expected attribute name, found {other:?}"))
                            );
                        }
                    };
                    value = Expr {
                        kind: ExprKind::Attribute {
                            value: Box::new(value),
                            attr,
                        },
                        loc,
                    };
                }
                Tok::LBracket => {
                    let loc = self.loc();
                    self.bump();
                    let index = self.subscript_index()?;
                    self.expect(&Tok::RBracket, "']'")?;
                    value = Expr {
                        kind: ExprKind::Subscript {
                            value: Box::new(value),
                            index: Box::new(index),
                        },
                        loc,
                    };
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ParseError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while self.peek() != &Tok::RParen {
            let is_kwarg =
                matches!(self.peek(), Tok::Name(_)) && self.peek_at(1) == &Tok::Assign;
            if is_kwarg {
                let name = match self.bump() {
                    Tok::Name(n) => n,
                    _ => unreachable!("checked by is_kwarg"),
                };
                self.expect(&Tok::Assign, "'='")?;
                let value = self.expression()?;
                kwargs.push((name, value));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.err("positional argument after keyword argument"));
                }
                args.push(self.expression()?);
            }
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        Ok((args, kwargs))
    }

    fn subscript_index(&mut self) -> Result<Index, ParseError> {
        let lower = if matches!(self.peek(), Tok::Colon) {
            None
        } else {
            Some(self.expression()?)
        };
        if !self.eat(&Tok::Colon) {
            let item = lower.ok_or_else(|| self.err("expected subscript expression"))?;
            return Ok(Index::Item(item));
        }
        let upper = if matches!(self.peek(), Tok::Colon | Tok::RBracket) {
            None
        } else {
            Some(self.expression()?)
        };
        let step = if self.eat(&Tok::Colon) {
            if matches!(self.peek(), Tok::RBracket) {
                None
            } else {
                Some(self.expression()?)
            }
        } else {
            None
        };
        Ok(Index::Slice { lower, upper, step })
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();
        match self.bump() {
            Tok::KwNone => Ok(Expr {
                kind: ExprKind::None,
                loc,
            }),
            Tok::KwTrue => Ok(Expr {
                kind: ExprKind::Bool(true),
                loc,
            }),
            Tok::KwFalse => Ok(Expr {
                kind: ExprKind::Bool(false),
                loc,
            }),
            Tok::Int(v) => Ok(Expr {
                kind: ExprKind::Int(v),
                loc,
            }),
            Tok::Float(v) => Ok(Expr {
                kind: ExprKind::Float(v),
                loc,
            }),
            Tok::Str(s) => Ok(Expr {
                kind: ExprKind::Str(s),
                loc,
            }),
            Tok::FStr(parts) => {
                let mut out = Vec::with_capacity(parts.len());
                for part in parts {
                    match part {
                        FStrPart::Lit(s) => out.push(FStringPart::Lit(s)),
                        FStrPart::Expr(src) => {
                            let expr = parse_embedded_expr(&src, loc.line)?;
                            out.push(FStringPart::Expr(expr));
                        }
                    }
                }
                Ok(Expr {
                    kind: ExprKind::FString(out),
                    loc,
                })
            }
            Tok::Name(n) => Ok(Expr {
                kind: ExprKind::Name(n),
                loc,
            }),
            Tok::LParen => {
                if self.eat(&Tok::RParen) {
                    return Ok(Expr {
                        kind: ExprKind::Tuple(Vec::new()),
                        loc,
                    });
                }
                let inner = self.expr_or_tuple()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::LBracket => self.list_display(loc),
            Tok::LBrace => self.dict_display(loc),
            other => Err(self.err(format!("unexpected token: {other:?}"))),
        }
    }

    fn list_display(&mut self, loc: Loc) -> Result<Expr, ParseError> {
        if self.eat(&Tok::RBracket) {
            return Ok(Expr {
                kind: ExprKind::List(Vec::new()),
                loc,
            });
        }
        let first = self.expression()?;
        if self.peek() == &Tok::KwFor {
            let (target, iter, ifs) = self.comp_clause()?;
            self.expect(&Tok::RBracket, "']'")?;
            return Ok(Expr {
                kind: ExprKind::ListComp {
                    elt: Box::new(first),
                    target: Box::new(target),
                    iter: Box::new(iter),
                    ifs,
                },
                loc,
            });
        }
        let mut items = vec![first];
        while self.eat(&Tok::Comma) {
            if self.peek() == &Tok::RBracket {
                break;
            }
            items.push(self.expression()?);
        }
        self.expect(&Tok::RBracket, "']'")?;
        Ok(Expr {
            kind: ExprKind::List(items),
            loc,
        })
    }

    fn dict_display(&mut self, loc: Loc) -> Result<Expr, ParseError> {
        if self.eat(&Tok::RBrace) {
            return Ok(Expr {
                kind: ExprKind::Dict(Vec::new()),
                loc,
            });
        }
        let key = self.expression()?;
        if !self.eat(&Tok::Colon) {
            return Err(self.err("set literals are not supported; expected ':' after dict key"));
        }
        let value = self.expression()?;
        if self.peek() == &Tok::KwFor {
            let (target, iter, ifs) = self.comp_clause()?;
            self.expect(&Tok::RBrace, "'}'")?;
            return Ok(Expr {
                kind: ExprKind::DictComp {
                    key: Box::new(key),
                    value: Box::new(value),
                    target: Box::new(target),
                    iter: Box::new(iter),
                    ifs,
                },
                loc,
            });
        }
        let mut pairs = vec![(key, value)];
        while self.eat(&Tok::Comma) {
            if self.peek() == &Tok::RBrace {
                break;
            }
            let key = self.expression()?;
            self.expect(&Tok::Colon, "':'")?;
            let value = self.expression()?;
            pairs.push((key, value));
        }
        self.expect(&Tok::RBrace, "'}'")?;
        Ok(Expr {
            kind: ExprKind::Dict(pairs),
            loc,
        })
    }

    /// One `for <target> in <iter> [if <cond>]*` comprehension clause.
    fn comp_clause(&mut self) -> Result<(Expr, Expr, Vec<Expr>), ParseError> {
        self.expect(&Tok::KwFor, "'for'")?;
        let target = self.target_list()?;
        self.expect(&Tok::KwIn, "'in'")?;
        let iter = self.expression()?;
        let mut ifs = Vec::new();
        while self.peek() == &Tok::KwIf {
            self.bump();
            ifs.push(self.or_expr()?);
        }
        if self.peek() == &Tok::KwFor {
            return Err(self.err("nested comprehension clauses are not supported"));
        }
        Ok((target, iter, ifs))
    }
}

/// Parse a single expression embedded in an f-string.
fn parse_embedded_expr(source: &str, line: u32) -> Result<Expr, ParseError> {
    let tokens =
        tokenize(source).map_err(|e| ParseError::new(line, format!("in f-string: {}", e.message)))?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser
        .expr_or_tuple()
        .map_err(|e| ParseError::new(line, format!("in f-string: {}", e.message)))?;
    if !matches!(parser.peek(), Tok::Newline | Tok::EndOfInput) {
        return Err(ParseError::new(line, "trailing tokens in f-string expression"));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(source: &str) -> Program {
        parse_program(source).unwrap()
    }

    #[test]
    fn parses_slice_and_call() {
        let program = parse("snippet = context[0][0:5]\ntool.FINAL(snippet)\n");
        assert_eq!(program.body.len(), 2);
        match &program.body[0].kind {
            StmtKind::Assign { targets, value } => {
                assert_eq!(targets.len(), 1);
                match &value.kind {
                    ExprKind::Subscript { index, .. } => {
                        assert!(matches!(**index, Index::Slice { .. }));
                    }
                    other => panic!("expected subscript, got {other:?}"),
                }
            }
            other => panic!("expected assign, got {other:?}"),
        }
        match &program.body[1].kind {
            StmtKind::Expr(expr) => {
                assert!(matches!(expr.kind, ExprKind::Call { .. }));
            }
            other => panic!("expected expr stmt, got {other:?}"),
        }
    }

    #[test]
    fn parses_if_elif_else_blocks() {
        let source = "if x > 1:\n    y = 1\nelif x:\n    y = 2\nelse:\n    y = 3\n";
        let program = parse(source);
        match &program.body[0].kind {
            StmtKind::If { branches, orelse } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(orelse.len(), 1);
            }
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn parses_for_with_tuple_target() {
        let program = parse("for i, d in enumerate(docs):\n    total += len(d)\n");
        match &program.body[0].kind {
            StmtKind::For { target, .. } => {
                assert!(matches!(target.kind, ExprKind::Tuple(_)));
            }
            other => panic!("expected for, got {other:?}"),
        }
    }

    #[test]
    fn parses_kwargs_and_positional_args() {
        let program = parse("hits = doc.find('needle', start=0, max_hits=5)\n");
        match &program.body[0].kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::Call { args, kwargs, .. } => {
                    assert_eq!(args.len(), 1);
                    assert_eq!(kwargs.len(), 2);
                    assert_eq!(kwargs[0].0, "start");
                }
                other => panic!("expected call, got {other:?}"),
            },
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn parses_list_comprehension_with_condition() {
        let program = parse("xs = [w for w in words if len(w) > 3]\n");
        match &program.body[0].kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value.kind, ExprKind::ListComp { .. }));
            }
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn parses_imports_for_policy() {
        let program = parse("import os\nfrom sys import path\n");
        assert!(matches!(
            program.body[0].kind,
            StmtKind::Import { ref module } if module == "os"
        ));
        assert!(matches!(
            program.body[1].kind,
            StmtKind::FromImport { ref module } if module == "sys"
        ));
    }

    #[test]
    fn parses_chained_comparison() {
        let program = parse("ok = 0 <= i < n\n");
        match &program.body[0].kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::Compare { ops, .. } => assert_eq!(ops.len(), 2),
                other => panic!("expected compare, got {other:?}"),
            },
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn parses_ternary_and_lambda() {
        let program = parse("best = sorted(xs, key=lambda p: p[1], reverse=True)[0] if xs else None\n");
        assert!(matches!(program.body[0].kind, StmtKind::Assign { .. }));
    }

    #[test]
    fn parses_multiline_dict() {
        let source = "state['work'] = {\n    'a': 1,\n    'b': [1, 2],\n}\n";
        let program = parse(source);
        assert_eq!(program.body.len(), 1);
    }

    #[test]
    fn rejects_set_literal() {
        assert!(parse_program("x = {1, 2}\n").is_err());
    }

    #[test]
    fn rejects_unbalanced_block() {
        assert!(parse_program("if x:\ny = 1\n").is_err());
    }

    #[test]
    fn fstring_expressions_are_parsed() {
        let program = parse("msg = f'count={len(xs)}'\n");
        match &program.body[0].kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::FString(parts) => {
                    assert_eq!(parts.len(), 2);
                    assert!(matches!(parts[1], FStringPart::Expr(_)));
                }
                other => panic!("expected f-string, got {other:?}"),
            },
            other => panic!("expected assign, got {other:?}"),
        }
    }
}
