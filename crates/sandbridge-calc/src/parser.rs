//! Pratt parser for the calculator language.

use std::rc::Rc;

use crate::lexer::{Spanned, Token, tokenize};

/// Deepest expression nesting accepted before the parser gives up, keeping
/// recursion well inside the sandbox thread's stack.
pub const MAX_NESTING_DEPTH: u16 = 200;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} at offset {offset}")]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
}

impl ParseError {
    pub fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Range,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallArg {
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub params: Vec<Param>,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Ident(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Assign(String, Box<Expr>),
    Call(Box<Expr>, Vec<CallArg>),
    Block(Vec<Expr>),
    If(Box<Expr>, Box<Expr>, Option<Box<Expr>>),
    Function(Rc<FunctionDef>),
}

/// Parse a program: expressions separated by newlines or `;`.
pub fn parse(source: &str) -> Result<Vec<Expr>, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        parens: 0,
        nesting: 0,
        end: source.len(),
    };
    let program = parser.statements(None)?;
    Ok(program)
}

const ASSIGN_BP: (u8, u8) = (2, 1);
const CALL_BP: u8 = 20;
const PREFIX_BP: u8 = 13;

fn infix_binding_power(token: &Token) -> Option<(BinaryOp, u8, u8)> {
    let (op, l, r) = match token {
        Token::EqEq => (BinaryOp::Eq, 5, 6),
        Token::NotEq => (BinaryOp::Ne, 5, 6),
        Token::Lt => (BinaryOp::Lt, 5, 6),
        Token::Le => (BinaryOp::Le, 5, 6),
        Token::Gt => (BinaryOp::Gt, 5, 6),
        Token::Ge => (BinaryOp::Ge, 5, 6),
        Token::Plus => (BinaryOp::Add, 7, 8),
        Token::Minus => (BinaryOp::Sub, 7, 8),
        Token::Star => (BinaryOp::Mul, 9, 10),
        Token::Slash => (BinaryOp::Div, 9, 10),
        Token::Colon => (BinaryOp::Range, 11, 12),
        // Right associative, and binds tighter than unary minus.
        Token::Caret => (BinaryOp::Pow, 16, 15),
        _ => return None,
    };
    Some((op, l, r))
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    /// Open parentheses; newlines inside them do not end an expression.
    parens: usize,
    nesting: u16,
    end: usize,
}

impl Parser {
    fn peek(&mut self) -> Option<&Token> {
        if self.parens > 0 {
            self.skip_newlines();
        }
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |t| t.offset)
    }

    fn bump(&mut self) -> Option<Token> {
        self.peek()?;
        let token = self.tokens.get(self.pos).map(|t| t.token.clone());
        self.pos += 1;
        token
    }

    fn skip_newlines(&mut self) {
        while matches!(
            self.tokens.get(self.pos).map(|t| &t.token),
            Some(Token::Newline)
        ) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ParseError> {
        if self.peek() == Some(expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn unexpected(&mut self, wanted: &str) -> ParseError {
        let offset = self.offset();
        match self.peek() {
            Some(token) => ParseError::new(format!("unexpected {token:?}, expected {wanted}"), offset),
            None => ParseError::new(format!("unexpected end of input, expected {wanted}"), offset),
        }
    }

    /// Statements until `close` (or end of input when `None`).
    fn statements(&mut self, close: Option<&Token>) -> Result<Vec<Expr>, ParseError> {
        let mut statements = Vec::new();
        loop {
            while matches!(self.peek(), Some(Token::Newline | Token::Semi)) {
                self.pos += 1;
            }
            match (self.peek(), close) {
                (None, None) => return Ok(statements),
                (None, Some(_)) => return Err(self.unexpected("'}'")),
                (Some(token), Some(close)) if token == close => {
                    self.pos += 1;
                    return Ok(statements);
                }
                _ => {}
            }
            statements.push(self.expr(0)?);
            match self.peek() {
                None | Some(Token::Newline | Token::Semi) => {}
                Some(token) if Some(token) == close => {}
                _ => return Err(self.unexpected("end of statement")),
            }
        }
    }

    fn expr(&mut self, min_bp: u8) -> Result<Expr, ParseError> {
        if self.nesting >= MAX_NESTING_DEPTH {
            return Err(ParseError::new("expression nested too deeply", self.offset()));
        }
        self.nesting += 1;
        let result = self.expr_inner(min_bp);
        self.nesting -= 1;
        result
    }

    fn expr_inner(&mut self, min_bp: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.prefix()?;
        loop {
            let Some(token) = self.peek() else { break };
            if *token == Token::LParen {
                if CALL_BP < min_bp {
                    break;
                }
                self.pos += 1;
                let args = self.call_args()?;
                lhs = Expr::Call(Box::new(lhs), args);
                continue;
            }
            if matches!(token, Token::Arrow | Token::Assign) {
                if ASSIGN_BP.0 < min_bp {
                    break;
                }
                let offset = self.offset();
                let Expr::Ident(name) = lhs else {
                    return Err(ParseError::new("invalid assignment target", offset));
                };
                self.pos += 1;
                self.skip_newlines();
                let value = self.expr(ASSIGN_BP.1)?;
                lhs = Expr::Assign(name, Box::new(value));
                continue;
            }
            let Some((op, l_bp, r_bp)) = infix_binding_power(token) else {
                break;
            };
            if l_bp < min_bp {
                break;
            }
            self.pos += 1;
            self.skip_newlines();
            let rhs = self.expr(r_bp)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        let Some(token) = self.bump() else {
            return Err(self.unexpected("an expression"));
        };
        match token {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Null => Ok(Expr::Null),
            Token::Ident(name) => Ok(Expr::Ident(name)),
            Token::Minus => Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.expr(PREFIX_BP)?))),
            Token::Plus => Ok(Expr::Unary(UnaryOp::Plus, Box::new(self.expr(PREFIX_BP)?))),
            Token::LParen => {
                self.parens += 1;
                let inner = self.expr(0);
                let close = inner.and_then(|inner| {
                    self.expect(&Token::RParen, "')'")?;
                    Ok(inner)
                });
                self.parens -= 1;
                close
            }
            Token::LBrace => self.block(),
            Token::Function => self.function(),
            Token::If => self.if_else(),
            other => Err(ParseError::new(format!("unexpected {other:?}"), offset)),
        }
    }

    fn block(&mut self) -> Result<Expr, ParseError> {
        // Newlines separate statements again inside braces.
        let parens = std::mem::take(&mut self.parens);
        let body = self.statements(Some(&Token::RBrace));
        self.parens = parens;
        Ok(Expr::Block(body?))
    }

    fn function(&mut self) -> Result<Expr, ParseError> {
        self.expect(&Token::LParen, "'('")?;
        self.parens += 1;
        let params = self.params();
        self.parens -= 1;
        let params = params?;
        self.skip_newlines();
        let body = self.expr(ASSIGN_BP.1)?;
        Ok(Expr::Function(Rc::new(FunctionDef { params, body })))
    }

    fn params(&mut self) -> Result<Vec<Param>, ParseError> {
        let mut params = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(params);
        }
        loop {
            let Some(Token::Ident(name)) = self.bump() else {
                self.pos = self.pos.saturating_sub(1);
                return Err(self.unexpected("a parameter name"));
            };
            let default = if self.peek() == Some(&Token::Assign) {
                self.pos += 1;
                Some(self.expr(ASSIGN_BP.1)?)
            } else {
                None
            };
            params.push(Param { name, default });
            match self.bump() {
                Some(Token::Comma) => {}
                Some(Token::RParen) => return Ok(params),
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    return Err(self.unexpected("',' or ')'"));
                }
            }
        }
    }

    fn if_else(&mut self) -> Result<Expr, ParseError> {
        self.expect(&Token::LParen, "'('")?;
        self.parens += 1;
        let condition = self.expr(0).and_then(|c| {
            self.expect(&Token::RParen, "')'")?;
            Ok(c)
        });
        self.parens -= 1;
        let condition = condition?;
        self.skip_newlines();
        let then = self.expr(ASSIGN_BP.1)?;

        let save = self.pos;
        self.skip_newlines();
        let otherwise = if self.peek() == Some(&Token::Else) {
            self.pos += 1;
            self.skip_newlines();
            Some(Box::new(self.expr(ASSIGN_BP.1)?))
        } else {
            self.pos = save;
            None
        };
        Ok(Expr::If(Box::new(condition), Box::new(then), otherwise))
    }

    /// Arguments after an opening `(`, through the closing `)`.
    fn call_args(&mut self) -> Result<Vec<CallArg>, ParseError> {
        self.parens += 1;
        let args = self.call_args_inner();
        self.parens -= 1;
        args
    }

    fn call_args_inner(&mut self) -> Result<Vec<CallArg>, ParseError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            self.skip_newlines();
            let name = match (
                self.tokens.get(self.pos).map(|t| &t.token),
                self.tokens.get(self.pos + 1).map(|t| &t.token),
            ) {
                (Some(Token::Ident(name) | Token::Str(name)), Some(Token::Assign)) => {
                    let name = name.clone();
                    self.pos += 2;
                    Some(name)
                }
                _ => None,
            };
            let value = self.expr(ASSIGN_BP.1)?;
            args.push(CallArg { name, value });
            match self.bump() {
                Some(Token::Comma) => {}
                Some(Token::RParen) => return Ok(args),
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    return Err(self.unexpected("',' or ')'"));
                }
            }
        }
    }
}
