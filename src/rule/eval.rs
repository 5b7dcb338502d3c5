//! Tree-walking evaluator over a probe's outputs.

use std::fmt;

use regex::Regex;

use super::lexer::Op;
use super::parser::{Expr, Pattern, UnaryOp};
use super::RuleError;
use crate::db::{OutputValue, Outputs};

/// Runtime value of a rule expression. Every number is an `f64`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<&OutputValue> for Value {
    fn from(value: &OutputValue) -> Self {
        match value {
            OutputValue::Int(i) => Value::Number(*i as f64),
            OutputValue::Float(f) => Value::Number(*f),
            OutputValue::Str(s) => Value::Str(s.clone()),
        }
    }
}

pub fn evaluate(expr: &Expr, outputs: &Outputs) -> Result<Value, RuleError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => outputs
            .get(name)
            .map(Value::from)
            .ok_or_else(|| RuleError::Eval(format!("no parameter '{}' found", name))),
        Expr::Unary(op, operand) => {
            let value = evaluate(operand, outputs)?;
            match (op, value) {
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnaryOp::Neg, Value::Number(n)) => Ok(Value::Number(-n)),
                (UnaryOp::Not, other) => Err(type_error("!", &other)),
                (UnaryOp::Neg, other) => Err(type_error("-", &other)),
            }
        }
        Expr::Binary(Op::And, lhs, rhs) => {
            if !truth(Op::And, evaluate(lhs, outputs)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truth(Op::And, evaluate(rhs, outputs)?)?))
        }
        Expr::Binary(Op::Or, lhs, rhs) => {
            if truth(Op::Or, evaluate(lhs, outputs)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truth(Op::Or, evaluate(rhs, outputs)?)?))
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = evaluate(lhs, outputs)?;
            let rhs = evaluate(rhs, outputs)?;
            binary(*op, lhs, rhs)
        }
        Expr::Match {
            negate,
            subject,
            pattern,
        } => {
            let subject = match evaluate(subject, outputs)? {
                Value::Str(s) => s,
                other => return Err(type_error(if *negate { "!~" } else { "=~" }, &other)),
            };
            let matched = match pattern {
                Pattern::Compiled(re) => re.is_match(&subject),
                Pattern::Dynamic(expr) => match evaluate(expr, outputs)? {
                    Value::Str(raw) => Regex::new(&raw)
                        .map_err(|e| RuleError::Eval(format!("invalid regex '{}': {}", raw, e)))?
                        .is_match(&subject),
                    other => return Err(type_error("=~", &other)),
                },
            };
            Ok(Value::Bool(matched != *negate))
        }
    }
}

fn truth(op: Op, value: Value) -> Result<bool, RuleError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(type_error(op.symbol(), &other)),
    }
}

fn type_error(symbol: &str, value: &Value) -> RuleError {
    RuleError::Eval(format!(
        "operator '{}' cannot be applied to {} '{}'",
        symbol,
        value.type_name(),
        value
    ))
}

fn binary(op: Op, lhs: Value, rhs: Value) -> Result<Value, RuleError> {
    use Value::*;

    let mismatch = |lhs: &Value, rhs: &Value| {
        RuleError::Eval(format!(
            "operator '{}' cannot compare {} '{}' with {} '{}'",
            op.symbol(),
            lhs.type_name(),
            lhs,
            rhs.type_name(),
            rhs
        ))
    };

    let value = match (op, &lhs, &rhs) {
        (Op::Eq, _, _) => Bool(lhs == rhs),
        (Op::Ne, _, _) => Bool(lhs != rhs),

        (Op::Lt, Number(a), Number(b)) => Bool(a < b),
        (Op::Le, Number(a), Number(b)) => Bool(a <= b),
        (Op::Gt, Number(a), Number(b)) => Bool(a > b),
        (Op::Ge, Number(a), Number(b)) => Bool(a >= b),
        (Op::Lt, Str(a), Str(b)) => Bool(a < b),
        (Op::Le, Str(a), Str(b)) => Bool(a <= b),
        (Op::Gt, Str(a), Str(b)) => Bool(a > b),
        (Op::Ge, Str(a), Str(b)) => Bool(a >= b),
        (Op::Lt | Op::Le | Op::Gt | Op::Ge, _, _) => return Err(mismatch(&lhs, &rhs)),

        (Op::Plus, Number(a), Number(b)) => Number(a + b),
        (Op::Plus, Str(_), _) | (Op::Plus, _, Str(_)) => Str(format!("{}{}", lhs, rhs)),
        (Op::Minus, Number(a), Number(b)) => Number(a - b),
        (Op::Star, Number(a), Number(b)) => Number(a * b),
        (Op::Slash, Number(a), Number(b)) => Number(a / b),
        (Op::Percent, Number(a), Number(b)) => Number(a % b),
        (Op::Plus | Op::Minus | Op::Star | Op::Slash | Op::Percent, _, _) => {
            return Err(mismatch(&lhs, &rhs))
        }

        (Op::And | Op::Or | Op::Match | Op::NotMatch | Op::Not, _, _) => {
            return Err(RuleError::Eval(format!("operator '{}' is not binary here", op.symbol())))
        }
    };

    Ok(value)
}
