//! Selector lexer and recursive-descent parser

use super::expr::{CmpOp, Expr, Value};
use super::SelectorError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    Comma,
    Cmp(CmpOp),
    And,
    Or,
    Not,
    Is,
    Null,
    In,
    Like,
    Between,
    True,
    False,
}

fn keyword(word: &str) -> Option<Token> {
    let token = match word.to_ascii_uppercase().as_str() {
        "AND" => Token::And,
        "OR" => Token::Or,
        "NOT" => Token::Not,
        "IS" => Token::Is,
        "NULL" => Token::Null,
        "IN" => Token::In,
        "LIKE" => Token::Like,
        "BETWEEN" => Token::Between,
        "TRUE" => Token::True,
        "FALSE" => Token::False,
        _ => return None,
    };
    Some(token)
}

struct Lexer<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
        }
    }

    fn error(&self, position: usize, reason: impl Into<String>) -> SelectorError {
        SelectorError::Parse {
            expression: self.source.to_string(),
            position,
            reason: reason.into(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<(Token, usize)>, SelectorError> {
        let mut tokens = Vec::new();

        while let Some(&(pos, c)) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
                continue;
            }

            let token = match c {
                '(' => {
                    self.chars.next();
                    Token::LParen
                }
                ')' => {
                    self.chars.next();
                    Token::RParen
                }
                ',' => {
                    self.chars.next();
                    Token::Comma
                }
                '=' => {
                    self.chars.next();
                    Token::Cmp(CmpOp::Eq)
                }
                '<' => {
                    self.chars.next();
                    match self.chars.peek() {
                        Some((_, '>')) => {
                            self.chars.next();
                            Token::Cmp(CmpOp::Ne)
                        }
                        Some((_, '=')) => {
                            self.chars.next();
                            Token::Cmp(CmpOp::Le)
                        }
                        _ => Token::Cmp(CmpOp::Lt),
                    }
                }
                '>' => {
                    self.chars.next();
                    if let Some((_, '=')) = self.chars.peek() {
                        self.chars.next();
                        Token::Cmp(CmpOp::Ge)
                    } else {
                        Token::Cmp(CmpOp::Gt)
                    }
                }
                '!' => {
                    self.chars.next();
                    match self.chars.next() {
                        Some((_, '=')) => Token::Cmp(CmpOp::Ne),
                        _ => return Err(self.error(pos, "expected '=' after '!'")),
                    }
                }
                '\'' => self.string(pos)?,
                c if c.is_ascii_digit() || c == '-' => self.number(pos)?,
                c if c.is_alphabetic() || c == '_' || c == '$' => self.word(pos),
                other => return Err(self.error(pos, format!("unexpected character '{}'", other))),
            };
            tokens.push((token, pos));
        }

        Ok(tokens)
    }

    fn string(&mut self, start: usize) -> Result<Token, SelectorError> {
        self.chars.next();
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some((_, '\'')) => {
                    // '' is an escaped quote
                    if let Some((_, '\'')) = self.chars.peek() {
                        self.chars.next();
                        value.push('\'');
                    } else {
                        return Ok(Token::Str(value));
                    }
                }
                Some((_, c)) => value.push(c),
                None => return Err(self.error(start, "unterminated string literal")),
            }
        }
    }

    fn number(&mut self, start: usize) -> Result<Token, SelectorError> {
        let mut end = start;
        let mut is_float = false;
        let mut first = true;
        while let Some(&(pos, c)) = self.chars.peek() {
            let accept = c.is_ascii_digit() || (first && c == '-') || (c == '.' && !is_float);
            if !accept {
                break;
            }
            is_float |= c == '.';
            first = false;
            end = pos + c.len_utf8();
            self.chars.next();
        }

        let text = &self.source[start..end];
        let parsed = if is_float {
            text.parse().ok().map(Token::Float)
        } else {
            text.parse().ok().map(Token::Int)
        };
        parsed.ok_or_else(|| self.error(start, format!("invalid number '{}'", text)))
    }

    fn word(&mut self, start: usize) -> Token {
        let mut end = start;
        while let Some(&(pos, c)) = self.chars.peek() {
            if !(c.is_alphanumeric() || matches!(c, '_' | '$' | '.' | '-')) {
                break;
            }
            end = pos + c.len_utf8();
            self.chars.next();
        }
        let word = &self.source[start..end];
        keyword(word).unwrap_or_else(|| Token::Ident(word.to_string()))
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(Token, usize)>,
    index: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: impl Into<String>) -> SelectorError {
        let position = self
            .tokens
            .get(self.index)
            .map(|(_, pos)| *pos)
            .unwrap_or(self.source.len());
        SelectorError::Parse {
            expression: self.source.to_string(),
            position,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index).map(|(t, _)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.index + offset).map(|(t, _)| t)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), SelectorError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn or(&mut self) -> Result<Expr, SelectorError> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, SelectorError> {
        let mut left = self.not()?;
        while self.eat(&Token::And) {
            let right = self.not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, SelectorError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Expr, SelectorError> {
        let left = self.operand()?;

        if let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.index += 1;
            let right = self.operand()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }

        if self.eat(&Token::Is) {
            let negated = self.eat(&Token::Not);
            self.expect(&Token::Null, "NULL")?;
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        let negated = matches!(
            (self.peek(), self.peek_at(1)),
            (Some(Token::Not), Some(Token::In | Token::Like | Token::Between))
        );
        if negated {
            self.index += 1;
        }

        match self.peek() {
            Some(Token::In) => {
                self.index += 1;
                self.expect(&Token::LParen, "'('")?;
                let mut list = vec![self.literal()?];
                while self.eat(&Token::Comma) {
                    list.push(self.literal()?);
                }
                self.expect(&Token::RParen, "')'")?;
                Ok(Expr::In {
                    expr: Box::new(left),
                    list,
                    negated,
                })
            }
            Some(Token::Like) => {
                self.index += 1;
                let Some(Token::Str(pattern)) = self.peek().cloned() else {
                    return Err(self.error("LIKE needs a string pattern"));
                };
                self.index += 1;
                Ok(Expr::Like {
                    expr: Box::new(left),
                    pattern,
                    negated,
                })
            }
            Some(Token::Between) => {
                self.index += 1;
                let low = self.operand()?;
                self.expect(&Token::And, "AND")?;
                let high = self.operand()?;
                Ok(Expr::Between {
                    expr: Box::new(left),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated,
                })
            }
            _ => Ok(left),
        }
    }

    fn literal(&mut self) -> Result<Value, SelectorError> {
        let value = match self.peek() {
            Some(Token::Str(s)) => Value::Str(s.clone()),
            Some(Token::Int(i)) => Value::Int(*i),
            Some(Token::Float(f)) => Value::Float(*f),
            Some(Token::True) => Value::Bool(true),
            Some(Token::False) => Value::Bool(false),
            _ => return Err(self.error("expected a literal")),
        };
        self.index += 1;
        Ok(value)
    }

    fn operand(&mut self) -> Result<Expr, SelectorError> {
        match self.peek() {
            Some(Token::LParen) => {
                self.index += 1;
                let inner = self.or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.index += 1;
                Ok(Expr::Header(name))
            }
            Some(Token::Null) => {
                self.index += 1;
                Ok(Expr::Literal(Value::Null))
            }
            _ => Ok(Expr::Literal(self.literal()?)),
        }
    }
}

/// Parse a selector expression into a predicate tree
pub(super) fn parse(source: &str) -> Result<Expr, SelectorError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser {
        source,
        tokens,
        index: 0,
    };

    if parser.peek().is_none() {
        return Err(parser.error("empty selector"));
    }

    let expr = parser.or()?;
    if parser.peek().is_some() {
        return Err(parser.error("unexpected trailing input"));
    }
    if !expr.is_condition() {
        parser.index = 0;
        return Err(parser.error("expected a condition"));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_precedence() {
        let expr = parse("a = 1 OR b = 2 AND c = 3").unwrap();
        let Expr::Or(_, right) = expr else {
            panic!("OR should be the root");
        };
        assert!(matches!(*right, Expr::And(_, _)));
    }

    #[test]
    fn test_negative_numbers_and_floats() {
        assert_eq!(
            parse("x > -3").unwrap(),
            Expr::Compare(
                CmpOp::Gt,
                Box::new(Expr::Header("x".to_string())),
                Box::new(Expr::Literal(Value::Int(-3)))
            )
        );
        assert!(matches!(
            parse("x < 2.25").unwrap(),
            Expr::Compare(CmpOp::Lt, _, _)
        ));
    }

    #[test]
    fn test_keywords_case_insensitive() {
        assert!(parse("a is not null and b in ('x')").is_ok());
    }

    #[test]
    fn test_error_position() {
        match parse("a = 1 AND") {
            Err(SelectorError::Parse { position, .. }) => assert_eq!(position, 9),
            other => panic!("unexpected {:?}", other),
        }
    }
}
