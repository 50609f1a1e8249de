//! Minimal arithmetic expression evaluator for formula calculation.
//!
//! Recursive descent over a fixed token set: numbers, named variables,
//! `+ - * / ^ ( )`. Variables resolve against an explicit symbol table;
//! nothing beyond arithmetic on known names is reachable. `^` is
//! right-associative and binds tighter than `*` and `/`.

use anyhow::{bail, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value: f64 = literal
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid number: {literal}"))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => bail!("unexpected character in expression: '{other}'"),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    vars: &'a HashMap<String, f64>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<f64> {
        let mut value = self.term()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Plus => {
                    self.advance();
                    value += self.term()?;
                }
                Token::Minus => {
                    self.advance();
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    // term := power (('*' | '/') power)*
    fn term(&mut self) -> Result<f64> {
        let mut value = self.power()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Star => {
                    self.advance();
                    value *= self.power()?;
                }
                Token::Slash => {
                    self.advance();
                    let divisor = self.power()?;
                    if divisor == 0.0 {
                        bail!("division by zero");
                    }
                    value /= divisor;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    // power := atom ('^' power)?   (right-associative)
    fn power(&mut self) -> Result<f64> {
        let base = self.atom()?;
        if matches!(self.peek(), Some(Token::Caret)) {
            self.advance();
            let exponent = self.power()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    // atom := NUMBER | IDENT | '-' atom | '(' expr ')'
    fn atom(&mut self) -> Result<f64> {
        match self.advance() {
            Some(Token::Number(value)) => Ok(value),
            Some(Token::Ident(name)) => self
                .vars
                .get(&name)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("unknown variable: {name}")),
            Some(Token::Minus) => Ok(-self.atom()?),
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(value),
                    _ => bail!("expected closing parenthesis"),
                }
            }
            Some(other) => bail!("unexpected token: {other:?}"),
            None => bail!("unexpected end of expression"),
        }
    }
}

/// Evaluate `expression` over the given symbol table.
pub fn evaluate(expression: &str, vars: &HashMap<String, f64>) -> Result<f64> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        bail!("empty expression");
    }

    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        vars,
    };
    let value = parser.expr()?;

    if parser.pos != tokens.len() {
        bail!("trailing input after expression");
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_precedence() {
        let empty = HashMap::new();
        assert_eq!(evaluate("2 + 3 * 4", &empty).unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4", &empty).unwrap(), 20.0);
        assert_eq!(evaluate("2 * 3 ^ 2", &empty).unwrap(), 18.0);
    }

    #[test]
    fn test_power_right_associative() {
        let empty = HashMap::new();
        // 2^(3^2) = 512, not (2^3)^2 = 64
        assert_eq!(evaluate("2 ^ 3 ^ 2", &empty).unwrap(), 512.0);
    }

    #[test]
    fn test_unary_minus() {
        let empty = HashMap::new();
        assert_eq!(evaluate("-3 + 5", &empty).unwrap(), 2.0);
        assert_eq!(evaluate("2 * -4", &empty).unwrap(), -8.0);
    }

    #[test]
    fn test_net_premium_formula() {
        // The canonical formula from the source system: P = (I/N) * (L/B)
        let table = vars(&[("I", 100.0), ("N", 1000.0), ("L", 500000.0), ("B", 10.0)]);
        assert_eq!(evaluate("(I/N) * (L/B)", &table).unwrap(), 5000.0);
    }

    #[test]
    fn test_unknown_variable() {
        let table = vars(&[("I", 1.0)]);
        let err = evaluate("I + N", &table).unwrap_err();
        assert!(err.to_string().contains("unknown variable: N"));
    }

    #[test]
    fn test_division_by_zero() {
        let empty = HashMap::new();
        let err = evaluate("1 / 0", &empty).unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn test_syntax_errors() {
        let empty = HashMap::new();
        assert!(evaluate("", &empty).is_err());
        assert!(evaluate("(1 + 2", &empty).is_err());
        assert!(evaluate("1 +", &empty).is_err());
        assert!(evaluate("1 2", &empty).is_err());
        assert!(evaluate("1 $ 2", &empty).is_err());
    }

    #[test]
    fn test_no_function_calls_reachable() {
        // Identifiers only resolve through the symbol table; call syntax
        // is a parse error.
        let empty = HashMap::new();
        assert!(evaluate("exec(1)", &empty).is_err());
    }
}
