//! Rule expressions evaluated against probe outputs.
//!
//! A rule such as `status == 200 && respTime < 500` is compiled once per
//! check and evaluated with the probe's outputs bound as identifiers.

mod eval;
mod lexer;
mod parser;

pub use eval::Value;

use std::str::FromStr;
use thiserror::Error;

use crate::db::Outputs;
use parser::Expr;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("{0}")]
    Compile(String),
    #[error("{0}")]
    Eval(String),
}

/// A compiled rule expression.
#[derive(Debug, Clone)]
pub struct Rule {
    source: String,
    expr: Expr,
}

impl Rule {
    pub fn compile(source: &str) -> Result<Self, RuleError> {
        let tokens = lexer::tokenize(source)?;
        let expr = parser::parse(tokens)?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn evaluate(&self, outputs: &Outputs) -> Result<Value, RuleError> {
        eval::evaluate(&self.expr, outputs)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl FromStr for Rule {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::compile(s)
    }
}
