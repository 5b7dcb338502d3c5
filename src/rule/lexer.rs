//! Tokenizer for rule expressions.

use super::RuleError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Bool(bool),
    Ident(String),
    Op(Op),
    LParen,
    RParen,
}

/// Operator tokens. Binary versus unary use of `-` is decided by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
    NotMatch,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,
}

impl Op {
    pub fn symbol(&self) -> &'static str {
        match self {
            Op::Or => "||",
            Op::And => "&&",
            Op::Eq => "==",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Match => "=~",
            Op::NotMatch => "!~",
            Op::Plus => "+",
            Op::Minus => "-",
            Op::Star => "*",
            Op::Slash => "/",
            Op::Percent => "%",
            Op::Not => "!",
        }
    }
}

/// Operators sorted so two-character forms are tried first.
const OPERATORS: &[(&str, Op)] = &[
    ("||", Op::Or),
    ("&&", Op::And),
    ("==", Op::Eq),
    ("!=", Op::Ne),
    ("<=", Op::Le),
    (">=", Op::Ge),
    ("=~", Op::Match),
    ("!~", Op::NotMatch),
    ("<", Op::Lt),
    (">", Op::Gt),
    ("+", Op::Plus),
    ("-", Op::Minus),
    ("*", Op::Star),
    ("/", Op::Slash),
    ("%", Op::Percent),
    ("!", Op::Not),
];

pub fn tokenize(source: &str) -> Result<Vec<Token>, RuleError> {
    let mut tokens = Vec::new();
    let mut rest = source;

    while let Some(c) = rest.chars().next() {
        if c.is_whitespace() {
            rest = &rest[c.len_utf8()..];
            continue;
        }

        let offset = source.len() - rest.len();
        let (token, len) = match c {
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            '\'' | '"' => lex_string(rest, c, offset)?,
            '[' => {
                let end = rest
                    .find(']')
                    .ok_or_else(|| RuleError::Compile(format!("unclosed '[' at position {}", offset)))?;
                (Token::Ident(rest[1..end].to_string()), end + 1)
            }
            c if c.is_ascii_digit() || (c == '.' && starts_with_digit(&rest[1..])) => lex_number(rest, offset)?,
            c if c.is_ascii_alphabetic() || c == '_' => {
                let len = rest
                    .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '.'))
                    .unwrap_or(rest.len());
                let word = &rest[..len];
                let token = match word {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    _ => Token::Ident(word.to_string()),
                };
                (token, len)
            }
            _ => {
                let (symbol, op) = OPERATORS
                    .iter()
                    .find(|(symbol, _)| rest.starts_with(symbol))
                    .ok_or_else(|| {
                        RuleError::Compile(format!("unexpected character '{}' at position {}", c, offset))
                    })?;
                (Token::Op(*op), symbol.len())
            }
        };

        tokens.push(token);
        rest = &rest[len..];
    }

    Ok(tokens)
}

fn starts_with_digit(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn lex_number(rest: &str, offset: usize) -> Result<(Token, usize), RuleError> {
    let len = rest
        .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
        .unwrap_or(rest.len());
    let text = &rest[..len];
    let value = text
        .parse::<f64>()
        .map_err(|_| RuleError::Compile(format!("invalid number '{}' at position {}", text, offset)))?;
    Ok((Token::Number(value), len))
}

/// Read a quoted string starting at `rest[0]`. Supports `\` escapes.
fn lex_string(rest: &str, quote: char, offset: usize) -> Result<(Token, usize), RuleError> {
    let mut value = String::new();
    let mut chars = rest.char_indices().skip(1);

    while let Some((i, ch)) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, escaped)) => value.push(escaped),
                None => break,
            },
            ch if ch == quote => return Ok((Token::Str(value), i + ch.len_utf8())),
            ch => value.push(ch),
        }
    }

    Err(RuleError::Compile(format!("unclosed string at position {}", offset)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_comparison() {
        let tokens = tokenize("status == 200 && respTime < 1.5").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("status".to_string()),
                Token::Op(Op::Eq),
                Token::Number(200.0),
                Token::Op(Op::And),
                Token::Ident("respTime".to_string()),
                Token::Op(Op::Lt),
                Token::Number(1.5),
            ]
        );
    }

    #[test]
    fn test_tokenize_strings_and_brackets() {
        let tokens = tokenize(r#"[odd name] =~ 'ab\'c' || x != "q""#).unwrap();
        assert_eq!(tokens[0], Token::Ident("odd name".to_string()));
        assert_eq!(tokens[1], Token::Op(Op::Match));
        assert_eq!(tokens[2], Token::Str("ab'c".to_string()));
        assert_eq!(tokens[5], Token::Op(Op::Ne));
        assert_eq!(tokens[6], Token::Str("q".to_string()));
    }

    #[test]
    fn test_tokenize_keywords_and_dotted_idents() {
        let tokens = tokenize("!true && result.count >= .5").unwrap();
        assert_eq!(tokens[0], Token::Op(Op::Not));
        assert_eq!(tokens[1], Token::Bool(true));
        assert_eq!(tokens[3], Token::Ident("result.count".to_string()));
        assert_eq!(tokens[5], Token::Number(0.5));
    }

    #[test]
    fn test_tokenize_errors() {
        assert!(matches!(tokenize(",,3!"), Err(RuleError::Compile(_))));
        assert!(matches!(tokenize("'open"), Err(RuleError::Compile(_))));
        assert!(matches!(tokenize("[open"), Err(RuleError::Compile(_))));
        assert!(matches!(tokenize("1.2.3"), Err(RuleError::Compile(_))));
        assert!(matches!(tokenize("a = b"), Err(RuleError::Compile(_))));
    }
}
