//! Recursive-descent parser for the expression sublanguage.
//!
//! Precedence, loosest first: `or`, `and`, `not`, comparison/`in`,
//! additive, multiplicative, unary minus, postfix (`.attr`, `[index]`,
//! `| filter`).

use crate::ast::{BinOp, Expr};
use crate::error::TemplateError;
use crate::lexer::{tokenize, Token};

/// Parse a full expression string; trailing tokens are an error.
pub fn parse_expr(src: &str) -> Result<Expr, TemplateError> {
    let tokens = tokenize(src)?;
    let mut p = Parser { tokens, pos: 0 };
    let expr = p.or_expr()?;
    if p.pos != p.tokens.len() {
        return Err(TemplateError::syntax(
            0,
            format!("unexpected trailing input in expression '{src}'"),
        ));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), TemplateError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(TemplateError::syntax(self.pos, format!("expected {what}")))
        }
    }

    fn or_expr(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::Or) {
            let rhs = self.and_expr()?;
            lhs = Expr::Bin(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.not_expr()?;
        while self.eat(&Token::And) {
            let rhs = self.not_expr()?;
            lhs = Expr::Bin(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, TemplateError> {
        if self.eat(&Token::Not) {
            let inner = self.not_expr()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, TemplateError> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Token::EqEq) => Some(BinOp::Eq),
            Some(Token::NotEq) => Some(BinOp::Ne),
            Some(Token::Lt) => Some(BinOp::Lt),
            Some(Token::LtEq) => Some(BinOp::Le),
            Some(Token::Gt) => Some(BinOp::Gt),
            Some(Token::GtEq) => Some(BinOp::Ge),
            Some(Token::In) => Some(BinOp::In),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let rhs = self.additive()?;
            return Ok(Expr::Bin(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, TemplateError> {
        if self.eat(&Token::Minus) {
            let inner = self.unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, TemplateError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(name)) => {
                            expr = Expr::Attr(Box::new(expr), name);
                        }
                        _ => {
                            return Err(TemplateError::syntax(
                                self.pos,
                                "expected attribute name after '.'",
                            ))
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.or_expr()?;
                    self.expect(Token::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::Pipe) => {
                    self.pos += 1;
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        _ => {
                            return Err(TemplateError::syntax(
                                self.pos,
                                "expected filter name after '|'",
                            ))
                        }
                    };
                    let args = if self.eat(&Token::LParen) {
                        self.arg_list()?
                    } else {
                        Vec::new()
                    };
                    expr = Expr::Filter(Box::new(expr), name, args);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn arg_list(&mut self) -> Result<Vec<Expr>, TemplateError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.or_expr()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(Token::RParen, "')'")?;
            break;
        }
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, TemplateError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Int(v)) => Ok(Expr::Int(v)),
            Some(Token::Float(v)) => Ok(Expr::Float(v)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let args = self.arg_list()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.eat(&Token::RBracket) {
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.or_expr()?);
                    if self.eat(&Token::Comma) {
                        continue;
                    }
                    self.expect(Token::RBracket, "']'")?;
                    break;
                }
                Ok(Expr::List(items))
            }
            other => Err(TemplateError::syntax(
                self.pos,
                format!("unexpected token {other:?}"),
            )),
        }
    }
}
