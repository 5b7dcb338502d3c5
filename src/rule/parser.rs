//! Precedence-climbing parser producing the rule AST.

use regex::Regex;

use super::eval::Value;
use super::lexer::{Op, Token};
use super::RuleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Right-hand side of `=~` / `!~`. Literal patterns are compiled once.
#[derive(Debug, Clone)]
pub enum Pattern {
    Compiled(Regex),
    Dynamic(Box<Expr>),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(Op, Box<Expr>, Box<Expr>),
    Match {
        negate: bool,
        subject: Box<Expr>,
        pattern: Pattern,
    },
}

/// Binding power of a binary operator, higher binds tighter.
fn precedence(op: Op) -> Option<u8> {
    match op {
        Op::Or => Some(1),
        Op::And => Some(2),
        Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge | Op::Match | Op::NotMatch => Some(3),
        Op::Plus | Op::Minus => Some(4),
        Op::Star | Op::Slash | Op::Percent => Some(5),
        Op::Not => None,
    }
}

/// Deepest allowed tree, and deepest nesting of parentheses and unary operators.
const MAX_DEPTH: usize = 256;

fn too_deep() -> RuleError {
    RuleError::Compile("expression too deeply nested".to_string())
}

/// Depth of a node one level above a child of depth `depth`.
fn bump(depth: usize) -> Result<usize, RuleError> {
    let depth = depth + 1;
    if depth > MAX_DEPTH {
        return Err(too_deep());
    }
    Ok(depth)
}

pub fn parse(tokens: Vec<Token>) -> Result<Expr, RuleError> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        nesting: 0,
    };
    if parser.tokens.is_empty() {
        return Err(RuleError::Compile("empty expression".to_string()));
    }
    let (expr, _) = parser.expression(0)?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(RuleError::Compile(format!("unexpected token {:?}", token))),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nesting: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn enter(&mut self) -> Result<(), RuleError> {
        self.nesting += 1;
        if self.nesting > MAX_DEPTH {
            return Err(too_deep());
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.nesting -= 1;
    }

    /// Parse operators binding tighter than `min_prec`. Returns the tree and its depth.
    fn expression(&mut self, min_prec: u8) -> Result<(Expr, usize), RuleError> {
        let (mut lhs, mut depth) = self.unary()?;

        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            let prec = match precedence(op) {
                Some(p) if p > min_prec => p,
                Some(_) => break,
                None => return Err(RuleError::Compile(format!("unexpected operator '{}'", op.symbol()))),
            };
            self.pos += 1;
            let (rhs, rhs_depth) = self.expression(prec)?;
            depth = bump(depth.max(rhs_depth))?;
            lhs = combine(op, lhs, rhs)?;
        }

        Ok((lhs, depth))
    }

    fn unary(&mut self) -> Result<(Expr, usize), RuleError> {
        match self.next() {
            Some(Token::Op(op @ (Op::Not | Op::Minus))) => {
                self.enter()?;
                let (inner, depth) = self.unary()?;
                self.leave();
                let op = if op == Op::Not { UnaryOp::Not } else { UnaryOp::Neg };
                Ok((Expr::Unary(op, Box::new(inner)), bump(depth)?))
            }
            Some(Token::Number(n)) => Ok((Expr::Literal(Value::Number(n)), 1)),
            Some(Token::Str(s)) => Ok((Expr::Literal(Value::Str(s)), 1)),
            Some(Token::Bool(b)) => Ok((Expr::Literal(Value::Bool(b)), 1)),
            Some(Token::Ident(name)) => Ok((Expr::Ident(name), 1)),
            Some(Token::LParen) => {
                self.enter()?;
                let inner = self.expression(0)?;
                self.leave();
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(RuleError::Compile("missing ')'".to_string())),
                }
            }
            Some(Token::Op(op)) => Err(RuleError::Compile(format!("unexpected operator '{}'", op.symbol()))),
            Some(Token::RParen) => Err(RuleError::Compile("unexpected ')'".to_string())),
            None => Err(RuleError::Compile("unexpected end of expression".to_string())),
        }
    }
}

fn combine(op: Op, lhs: Expr, rhs: Expr) -> Result<Expr, RuleError> {
    match op {
        Op::Match | Op::NotMatch => {
            let pattern = match rhs {
                Expr::Literal(Value::Str(raw)) => Pattern::Compiled(
                    Regex::new(&raw)
                        .map_err(|e| RuleError::Compile(format!("invalid regex '{}': {}", raw, e)))?,
                ),
                Expr::Literal(other) => {
                    return Err(RuleError::Compile(format!("regex pattern must be a string, got {}", other)))
                }
                other => Pattern::Dynamic(Box::new(other)),
            };
            Ok(Expr::Match {
                negate: op == Op::NotMatch,
                subject: Box::new(lhs),
                pattern,
            })
        }
        _ => Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::lexer::tokenize;

    fn parse_str(source: &str) -> Result<Expr, RuleError> {
        parse(tokenize(source)?)
    }

    #[test]
    fn test_precedence() {
        // a || b && c  ==>  a || (b && c)
        match parse_str("a || b && c").unwrap() {
            Expr::Binary(Op::Or, lhs, rhs) => {
                assert!(matches!(*lhs, Expr::Ident(ref n) if n == "a"));
                assert!(matches!(*rhs, Expr::Binary(Op::And, _, _)));
            }
            other => panic!("unexpected tree {:?}", other),
        }

        // 1 + 2 * 3 > 6  ==>  (1 + (2 * 3)) > 6
        match parse_str("1 + 2 * 3 > 6").unwrap() {
            Expr::Binary(Op::Gt, lhs, _) => {
                assert!(matches!(*lhs, Expr::Binary(Op::Plus, _, ref r) if matches!(**r, Expr::Binary(Op::Star, _, _))));
            }
            other => panic!("unexpected tree {:?}", other),
        }
    }

    #[test]
    fn test_left_associative() {
        // 10 - 4 - 3  ==>  (10 - 4) - 3
        match parse_str("10 - 4 - 3").unwrap() {
            Expr::Binary(Op::Minus, lhs, rhs) => {
                assert!(matches!(*lhs, Expr::Binary(Op::Minus, _, _)));
                assert!(matches!(*rhs, Expr::Literal(Value::Number(n)) if n == 3.0));
            }
            other => panic!("unexpected tree {:?}", other),
        }
    }

    #[test]
    fn test_match_precompiles_literal_patterns() {
        assert!(matches!(
            parse_str("body =~ '^ok'").unwrap(),
            Expr::Match { negate: false, pattern: Pattern::Compiled(_), .. }
        ));
        assert!(matches!(
            parse_str("body !~ expected").unwrap(),
            Expr::Match { negate: true, pattern: Pattern::Dynamic(_), .. }
        ));
        assert!(matches!(parse_str("body =~ '('"), Err(RuleError::Compile(_))));
        assert!(matches!(parse_str("body =~ 5"), Err(RuleError::Compile(_))));
    }

    #[test]
    fn test_nesting_limit() {
        let too_deep = [
            format!("{}true", "!".repeat(200_000)),
            format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000)),
            format!("1{}", " + 1".repeat(10_000)),
            format!("{}1", "- ".repeat(MAX_DEPTH + 1)),
        ];
        for source in &too_deep {
            match parse_str(source) {
                Err(RuleError::Compile(msg)) => assert_eq!(msg, "expression too deeply nested"),
                other => panic!("expected nesting error, got {:?}", other.map(|_| ())),
            }
        }

        let fine = format!("{}status == 200{}", "(".repeat(100), ")".repeat(100));
        assert!(parse_str(&fine).is_ok());
        assert!(parse_str(&format!("1{}", " + 1".repeat(100))).is_ok());
    }

    #[test]
    fn test_syntax_errors() {
        for source in ["", "(1 + 2", "1 +", "status 200", "== 3", ")", "!"] {
            assert!(matches!(parse_str(source), Err(RuleError::Compile(_))), "{}", source);
        }
    }
}
