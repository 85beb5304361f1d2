//! Recursive-descent parser for SQL-style selectors.

use crate::error::SyntaxError;
use crate::value::Value;

use super::{
    CompareOp, Identifier, LikePattern, Selector, SelectorDomain, SelectorParser,
    MAX_SELECTOR_DEPTH, MAX_TREE_DEPTH,
};

/// Default selector parser.
///
/// Grammar (keywords are case-insensitive):
///
/// ```text
/// or      := and ("OR" and)*
/// and     := not ("AND" not)*
/// not     := "NOT" not | pred
/// pred    := operand [ cmp operand
///                    | "IS" ["NOT"] "NULL"
///                    | ["NOT"] "LIKE" string ["ESCAPE" string]
///                    | ["NOT"] "IN" "(" literal ("," literal)* ")"
///                    | ["NOT"] "BETWEEN" operand "AND" operand ]
/// operand := "(" or ")" | literal | identifier
/// ```
///
/// Parenthesized groups and `NOT` may nest at most [`MAX_SELECTOR_DEPTH`]
/// levels. AND and OR chains are folded into balanced trees, so a long flat
/// chain stays shallow.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlSelectorParser;

impl SelectorParser for SqlSelectorParser {
    fn parse(&self, selector: &str, _domain: SelectorDomain) -> Result<Selector, SyntaxError> {
        let tokens = tokenize(selector)?;
        let mut parser = Parser {
            source: selector,
            tokens,
            pos: 0,
            nesting: 0,
        };

        if parser.tokens.is_empty() {
            return Err(parser.error_at(0, "empty selector"));
        }

        let tree = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            let offset = tok.offset;
            return Err(parser.error_at(offset, "unexpected trailing input"));
        }
        if !is_boolean(&tree) {
            return Err(parser.error_at(0, "selector is not a boolean expression"));
        }
        if tree.depth() > MAX_TREE_DEPTH {
            return Err(parser.error_at(0, format!("tree deeper than {MAX_TREE_DEPTH} levels")));
        }
        Ok(tree)
    }
}

fn is_boolean(sel: &Selector) -> bool {
    match sel {
        Selector::Literal(v) => v.is_bool(),
        Selector::Identifier(_)
        | Selector::Compare { .. }
        | Selector::IsNull { .. }
        | Selector::Like { .. }
        | Selector::In { .. }
        | Selector::Between { .. }
        | Selector::And(..)
        | Selector::Or(..)
        | Selector::Not(_) => true,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Is,
    In,
    Like,
    Escape,
    Between,
    LParen,
    RParen,
    Comma,
    Minus,
    Cmp(CompareOp),
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    offset: usize,
}

fn syntax(selector: &str, offset: usize, reason: impl Into<String>) -> SyntaxError {
    SyntaxError::InvalidSelector {
        selector: selector.to_string(),
        offset,
        reason: reason.into(),
    }
}

fn keyword(word: &str) -> Option<Tok> {
    let tok = match word.to_ascii_uppercase().as_str() {
        "AND" => Tok::And,
        "OR" => Tok::Or,
        "NOT" => Tok::Not,
        "IS" => Tok::Is,
        "IN" => Tok::In,
        "LIKE" => Tok::Like,
        "ESCAPE" => Tok::Escape,
        "BETWEEN" => Tok::Between,
        "NULL" => Tok::Null,
        "TRUE" => Tok::True,
        "FALSE" => Tok::False,
        _ => return None,
    };
    Some(tok)
}

fn tokenize(src: &str) -> Result<Vec<Token>, SyntaxError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let tok = match c {
            b'(' => {
                i += 1;
                Tok::LParen
            }
            b')' => {
                i += 1;
                Tok::RParen
            }
            b',' => {
                i += 1;
                Tok::Comma
            }
            b'-' => {
                i += 1;
                Tok::Minus
            }
            b'=' => {
                i += 1;
                Tok::Cmp(CompareOp::Eq)
            }
            b'<' => match bytes.get(i + 1) {
                Some(b'=') => {
                    i += 2;
                    Tok::Cmp(CompareOp::Le)
                }
                Some(b'>') => {
                    i += 2;
                    Tok::Cmp(CompareOp::Ne)
                }
                _ => {
                    i += 1;
                    Tok::Cmp(CompareOp::Lt)
                }
            },
            b'>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    Tok::Cmp(CompareOp::Ge)
                } else {
                    i += 1;
                    Tok::Cmp(CompareOp::Gt)
                }
            }
            b'\'' => {
                // '' inside a literal is an escaped quote.
                let mut value = String::new();
                i += 1;
                loop {
                    let Some(rel) = src[i..].find('\'') else {
                        return Err(syntax(src, start, "unterminated string literal"));
                    };
                    value.push_str(&src[i..i + rel]);
                    i += rel + 1;
                    if bytes.get(i) == Some(&b'\'') {
                        value.push('\'');
                        i += 1;
                    } else {
                        break;
                    }
                }
                Tok::Str(value)
            }
            b'0'..=b'9' => {
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let is_float = bytes.get(i) == Some(&b'.')
                    && bytes.get(i + 1).is_some_and(u8::is_ascii_digit);
                if is_float {
                    i += 1;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                    let text = &src[start..i];
                    let v = text
                        .parse::<f64>()
                        .map_err(|e| syntax(src, start, format!("invalid number '{text}': {e}")))?;
                    Tok::Float(v)
                } else {
                    let text = &src[start..i];
                    let v = text
                        .parse::<i64>()
                        .map_err(|e| syntax(src, start, format!("invalid number '{text}': {e}")))?;
                    Tok::Int(v)
                }
            }
            c if c.is_ascii_alphabetic() || c == b'_' || c == b'$' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'_' | b'$' | b'.'))
                {
                    i += 1;
                }
                let word = &src[start..i];
                keyword(word).unwrap_or_else(|| Tok::Ident(word.to_string()))
            }
            _ => {
                let ch = src[start..].chars().next().unwrap_or('?');
                return Err(syntax(src, start, format!("unexpected character '{ch}'")));
            }
        };

        tokens.push(Token { tok, offset: start });
    }

    Ok(tokens)
}

// Joins an associative chain pairwise, keeping left-to-right order.
fn balance(
    first: Selector,
    rest: Vec<Selector>,
    join: fn(Box<Selector>, Box<Selector>) -> Selector,
) -> Selector {
    if rest.is_empty() {
        return first;
    }
    let mut level = Vec::with_capacity(rest.len() + 1);
    level.push(first);
    level.extend(rest);
    loop {
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        let mut items = level.into_iter();
        while let Some(a) = items.next() {
            next.push(match items.next() {
                Some(b) => join(Box::new(a), Box::new(b)),
                None => a,
            });
        }
        if next.len() == 1 {
            return next.swap_remove(0);
        }
        level = next;
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    nesting: usize,
}

impl Parser<'_> {
    fn error_at(&self, offset: usize, reason: impl Into<String>) -> SyntaxError {
        syntax(self.source, offset, reason)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_tok(&self) -> Option<&Tok> {
        self.peek().map(|t| &t.tok)
    }

    fn peek_tok_at(&self, ahead: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + ahead).map(|t| &t.tok)
    }

    fn offset(&self) -> usize {
        self.peek().map_or(self.source.len(), |t| t.offset)
    }

    fn next(&mut self) -> Result<Token, SyntaxError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.error_at(self.source.len(), "unexpected end of input"))?;
        self.pos += 1;
        Ok(tok)
    }

    fn eat(&mut self, expected: &Tok) -> bool {
        if self.peek_tok() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Tok, what: &str) -> Result<(), SyntaxError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error_at(self.offset(), format!("expected {what}")))
        }
    }

    fn descend(&mut self, offset: usize) -> Result<(), SyntaxError> {
        if self.nesting >= MAX_SELECTOR_DEPTH {
            return Err(self.error_at(
                offset,
                format!("nesting deeper than {MAX_SELECTOR_DEPTH} levels"),
            ));
        }
        self.nesting += 1;
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Selector, SyntaxError> {
        let first = self.parse_and()?;
        let mut rest = Vec::new();
        while self.eat(&Tok::Or) {
            rest.push(self.parse_and()?);
        }
        Ok(balance(first, rest, Selector::Or))
    }

    fn parse_and(&mut self) -> Result<Selector, SyntaxError> {
        let first = self.parse_not()?;
        let mut rest = Vec::new();
        while self.eat(&Tok::And) {
            rest.push(self.parse_not()?);
        }
        Ok(balance(first, rest, Selector::And))
    }

    fn parse_not(&mut self) -> Result<Selector, SyntaxError> {
        let offset = self.offset();
        if self.eat(&Tok::Not) {
            self.descend(offset)?;
            let inner = self.parse_not()?;
            self.nesting -= 1;
            return Ok(Selector::Not(Box::new(inner)));
        }
        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> Result<Selector, SyntaxError> {
        let operand = self.parse_operand()?;

        match self.peek_tok().cloned() {
            Some(Tok::Cmp(op)) => {
                self.pos += 1;
                let right = self.parse_operand()?;
                Ok(Selector::Compare {
                    op,
                    left: Box::new(operand),
                    right: Box::new(right),
                })
            }
            Some(Tok::Is) => {
                self.pos += 1;
                let negated = self.eat(&Tok::Not);
                self.expect(&Tok::Null, "NULL after IS")?;
                Ok(Selector::IsNull {
                    operand: Box::new(operand),
                    negated,
                })
            }
            Some(Tok::Not)
                if matches!(
                    self.peek_tok_at(1),
                    Some(Tok::Like | Tok::In | Tok::Between)
                ) =>
            {
                self.pos += 1;
                self.parse_suffix(operand, true)
            }
            Some(Tok::Like | Tok::In | Tok::Between) => self.parse_suffix(operand, false),
            _ => Ok(operand),
        }
    }

    fn parse_suffix(&mut self, operand: Selector, negated: bool) -> Result<Selector, SyntaxError> {
        let tok = self.next()?;
        match tok.tok {
            Tok::Like => {
                let offset = self.offset();
                let Tok::Str(pattern) = self.next()?.tok else {
                    return Err(self.error_at(offset, "LIKE requires a string pattern"));
                };
                let escape = if self.eat(&Tok::Escape) {
                    let offset = self.offset();
                    let Tok::Str(esc) = self.next()?.tok else {
                        return Err(self.error_at(offset, "ESCAPE requires a string"));
                    };
                    let mut chars = esc.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => Some(c),
                        _ => {
                            return Err(
                                self.error_at(offset, "ESCAPE must be a single character")
                            )
                        }
                    }
                } else {
                    None
                };
                let pattern = LikePattern::new(&pattern, escape)
                    .map_err(|reason| self.error_at(offset, reason))?;
                Ok(Selector::Like {
                    operand: Box::new(operand),
                    pattern,
                    negated,
                })
            }
            Tok::In => {
                self.expect(&Tok::LParen, "'(' after IN")?;
                let mut values = vec![self.parse_literal()?];
                while self.eat(&Tok::Comma) {
                    values.push(self.parse_literal()?);
                }
                self.expect(&Tok::RParen, "')' to close IN list")?;
                Ok(Selector::In {
                    operand: Box::new(operand),
                    values,
                    negated,
                })
            }
            Tok::Between => {
                let low = self.parse_operand()?;
                self.expect(&Tok::And, "AND in BETWEEN")?;
                let high = self.parse_operand()?;
                Ok(Selector::Between {
                    operand: Box::new(operand),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated,
                })
            }
            _ => Err(self.error_at(tok.offset, "expected LIKE, IN or BETWEEN")),
        }
    }

    fn parse_literal(&mut self) -> Result<Value, SyntaxError> {
        let offset = self.offset();
        match self.parse_operand()? {
            Selector::Literal(v) if !v.is_null() => Ok(v),
            _ => Err(self.error_at(offset, "expected a literal")),
        }
    }

    fn parse_operand(&mut self) -> Result<Selector, SyntaxError> {
        let tok = self.next()?;
        let sel = match tok.tok {
            Tok::LParen => {
                self.descend(tok.offset)?;
                let inner = self.parse_or()?;
                self.expect(&Tok::RParen, "')'")?;
                self.nesting -= 1;
                inner
            }
            Tok::Ident(name) => Selector::Identifier(Identifier::new(name)),
            Tok::Str(s) => Selector::Literal(Value::String(s)),
            Tok::Int(v) => Selector::Literal(Value::Int(v)),
            Tok::Float(v) => Selector::Literal(Value::Float(v)),
            Tok::True => Selector::Literal(Value::Bool(true)),
            Tok::False => Selector::Literal(Value::Bool(false)),
            Tok::Null => Selector::Literal(Value::Null),
            Tok::Minus => match self.next()?.tok {
                Tok::Int(v) => Selector::Literal(Value::Int(-v)),
                Tok::Float(v) => Selector::Literal(Value::Float(-v)),
                _ => return Err(self.error_at(tok.offset, "'-' must precede a number")),
            },
            _ => return Err(self.error_at(tok.offset, "expected an operand")),
        };
        Ok(sel)
    }
}
