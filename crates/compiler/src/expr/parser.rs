use common::{Error, Result};

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::token::{tokenize, Token};

/// Parse an expression string into an AST.
///
/// Precedence, loosest first: `||`, `&&`, equality, comparison, additive,
/// multiplicative, unary, postfix (`[k]` history index, `.field` member
/// access). Member access is rewritten to `name_field` here; it is the only
/// syntax-level rewrite in the language.
pub fn parse(source: &str, location: &str) -> Result<Expr> {
    let tokens = tokenize(source, location)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        location,
    };
    let expr = parser.expression(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error(format!(
            "unexpected trailing input at token {}",
            parser.pos
        )));
    }
    Ok(expr)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    location: &'a str,
}

impl<'a> Parser<'a> {
    fn error(&self, message: String) -> Error {
        Error::Parse {
            location: self.location.to_string(),
            message,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.advance() {
            Some(ref tok) if tok == expected => Ok(()),
            Some(tok) => Err(self.error(format!("expected {expected:?}, found {tok:?}"))),
            None => Err(self.error(format!("expected {expected:?}, found end of input"))),
        }
    }

    /// Pratt loop: parse a prefix expression then fold infix operators with
    /// binding power above `min_bp`.
    fn expression(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = self.prefix()?;

        while let Some(tok) = self.peek() {
            let (op, bp) = match tok {
                Token::OrOr => (BinaryOp::Or, 1),
                Token::AndAnd => (BinaryOp::And, 2),
                Token::EqEq => (BinaryOp::Eq, 3),
                Token::NotEq => (BinaryOp::Ne, 3),
                Token::Lt => (BinaryOp::Lt, 4),
                Token::Le => (BinaryOp::Le, 4),
                Token::Gt => (BinaryOp::Gt, 4),
                Token::Ge => (BinaryOp::Ge, 4),
                Token::Plus => (BinaryOp::Add, 5),
                Token::Minus => (BinaryOp::Sub, 5),
                Token::Star => (BinaryOp::Mul, 6),
                Token::Slash => (BinaryOp::Div, 6),
                Token::Percent => (BinaryOp::Rem, 6),
                _ => break,
            };
            if bp < min_bp {
                break;
            }
            self.advance();
            let rhs = self.expression(bp + 1)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Minus) => {
                let operand = self.expression(7)?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                })
            }
            Some(Token::Bang) => {
                let operand = self.expression(7)?;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                })
            }
            Some(Token::LParen) => {
                let inner = self.expression(0)?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => self.postfix(name),
            Some(tok) => Err(self.error(format!("unexpected token {tok:?}"))),
            None => Err(self.error("unexpected end of input".to_string())),
        }
    }

    /// Handle what may follow an identifier: a call, member access, or
    /// history indexing.
    fn postfix(&mut self, mut name: String) -> Result<Expr> {
        // Member access chains fold into the identifier: a.b.c -> a_b_c.
        while self.peek() == Some(&Token::Dot) {
            self.advance();
            match self.advance() {
                Some(Token::Ident(field)) => {
                    name.push('_');
                    name.push_str(&field);
                }
                other => {
                    return Err(self.error(format!(
                        "expected field name after '.', found {other:?}"
                    )))
                }
            }
        }

        match self.peek() {
            Some(Token::LParen) => {
                self.advance();
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.expression(0)?);
                        match self.peek() {
                            Some(Token::Comma) => {
                                self.advance();
                            }
                            _ => break,
                        }
                    }
                }
                self.expect(&Token::RParen)?;
                Ok(Expr::Call { name, args })
            }
            Some(Token::LBracket) => {
                self.advance();
                let offset = match self.advance() {
                    Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => n as usize,
                    Some(tok) => {
                        return Err(self.error(format!(
                            "history index must be a non-negative integer, found {tok:?}"
                        )))
                    }
                    None => {
                        return Err(self.error("unterminated history index".to_string()))
                    }
                };
                self.expect(&Token::RBracket)?;
                Ok(Expr::Index {
                    name,
                    bars_ago: offset,
                })
            }
            _ => Ok(Expr::Ident(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(src: &str) -> Expr {
        parse(src, "test").unwrap()
    }

    #[test]
    fn precedence_mul_over_add() {
        assert_eq!(
            p("1 + 2 * 3"),
            Expr::Binary {
                op: BinaryOp::Add,
                lhs: Box::new(Expr::Number(1.0)),
                rhs: Box::new(Expr::Binary {
                    op: BinaryOp::Mul,
                    lhs: Box::new(Expr::Number(2.0)),
                    rhs: Box::new(Expr::Number(3.0)),
                }),
            }
        );
    }

    #[test]
    fn precedence_comparison_over_and() {
        // (close > ema20) && (rsi < 30), not close > (ema20 && rsi) < 30
        let expr = p("close > ema20 && rsi < 30");
        match expr {
            Expr::Binary {
                op: BinaryOp::And, ..
            } => {}
            other => panic!("expected top-level &&, got {other:?}"),
        }
    }

    #[test]
    fn member_access_normalizes_to_underscore() {
        assert_eq!(p("macd.histogram"), Expr::Ident("macd_histogram".into()));
        assert_eq!(p("a.b.c"), Expr::Ident("a_b_c".into()));
    }

    #[test]
    fn history_index_parses() {
        assert_eq!(
            p("close[1]"),
            Expr::Index {
                name: "close".into(),
                bars_ago: 1
            }
        );
    }

    #[test]
    fn history_index_rejects_negative_or_fractional() {
        assert!(parse("close[-1]", "test").is_err());
        assert!(parse("close[1.5]", "test").is_err());
    }

    #[test]
    fn call_with_args() {
        assert_eq!(
            p("clamp(rsi, 0, 100)"),
            Expr::Call {
                name: "clamp".into(),
                args: vec![
                    Expr::Ident("rsi".into()),
                    Expr::Number(0.0),
                    Expr::Number(100.0)
                ],
            }
        );
    }

    #[test]
    fn unary_binds_tighter_than_mul() {
        // -2 * 3 parses as (-2) * 3
        assert_eq!(
            p("-2 * 3"),
            Expr::Binary {
                op: BinaryOp::Mul,
                lhs: Box::new(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(Expr::Number(2.0)),
                }),
                rhs: Box::new(Expr::Number(3.0)),
            }
        );
    }

    #[test]
    fn trailing_garbage_rejected() {
        assert!(parse("close > 1 )", "test").is_err());
    }

    #[test]
    fn parens_override_precedence() {
        assert_eq!(
            p("(1 + 2) * 3"),
            Expr::Binary {
                op: BinaryOp::Mul,
                lhs: Box::new(Expr::Binary {
                    op: BinaryOp::Add,
                    lhs: Box::new(Expr::Number(1.0)),
                    rhs: Box::new(Expr::Number(2.0)),
                }),
                rhs: Box::new(Expr::Number(3.0)),
            }
        );
    }
}
