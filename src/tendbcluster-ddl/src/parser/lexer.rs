// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! MySQL lexer.
//!
//! The lexer only knows enough of MySQL's lexical structure to find statement
//! boundaries and the handful of tokens that classify a statement. Comments,
//! including executable `/*! ... */` and optimizer `/*+ ... */` hints, are
//! dropped.

use std::ops::Range;

use crate::error::ParseError;

/// A lexical token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// An unquoted identifier or keyword.
    Word(String),
    /// A backtick-quoted identifier, unescaped.
    QuotedIdent(String),
    /// A single- or double-quoted string literal, unescaped.
    String(String),
    /// A numeric literal.
    Number(String),
    /// Any other single character.
    Punct(char),
}

/// A token and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosToken {
    pub kind: Token,
    /// Byte range in the source.
    pub span: Range<usize>,
    /// One-based line of the first byte.
    pub line: usize,
}

/// The tokens of one statement, without its terminating `;`.
#[derive(Debug, Clone)]
pub struct RawStatement {
    pub tokens: Vec<PosToken>,
}

impl RawStatement {
    /// Line of the first token.
    pub fn line(&self) -> usize {
        self.tokens.first().map(|t| t.line).unwrap_or(1)
    }
}

pub struct Lexer<'a> {
    file: &'a str,
    src: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(file: &'a str, src: &'a str) -> Lexer<'a> {
        Lexer {
            file,
            src,
            pos: 0,
            line: 1,
        }
    }

    pub fn source(&self) -> &'a str {
        self.src
    }

    pub fn file(&self) -> &'a str {
        self.file
    }

    /// Returns the next non-empty statement, or `None` at end of input.
    pub fn next_statement(&mut self) -> Result<Option<RawStatement>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            match self.next_token()? {
                None if tokens.is_empty() => return Ok(None),
                None => return Ok(Some(RawStatement { tokens })),
                Some(t) if t.kind == Token::Punct(';') => {
                    if !tokens.is_empty() {
                        return Ok(Some(RawStatement { tokens }));
                    }
                }
                Some(t) => tokens.push(t),
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn error(&self, line: usize, message: impl Into<String>) -> ParseError {
        ParseError::new(self.file, line, message)
    }

    fn next_token(&mut self) -> Result<Option<PosToken>, ParseError> {
        loop {
            let Some(c) = self.peek() else {
                return Ok(None);
            };
            let start = self.pos;
            let line = self.line;
            let kind = match c {
                c if c.is_whitespace() => {
                    self.bump();
                    continue;
                }
                '#' => {
                    self.skip_line();
                    continue;
                }
                '-' if self.peek_nth(1) == Some('-')
                    && self.peek_nth(2).map_or(true, |c| c.is_whitespace()) =>
                {
                    self.skip_line();
                    continue;
                }
                '/' if self.peek_nth(1) == Some('*') => {
                    self.skip_block_comment(line)?;
                    continue;
                }
                '`' => Token::QuotedIdent(self.quoted('`', line, "quoted identifier")?),
                '\'' | '"' => Token::String(self.quoted(c, line, "string literal")?),
                c if is_word_char(c) => {
                    let word = self.take_while(is_word_char);
                    if word.bytes().all(|b| b.is_ascii_digit()) {
                        self.number_tail(word)
                    } else {
                        Token::Word(word)
                    }
                }
                c => {
                    self.bump();
                    Token::Punct(c)
                }
            };
            return Ok(Some(PosToken {
                kind,
                span: start..self.pos,
                line,
            }));
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.bump();
        }
        self.src[start..self.pos].to_string()
    }

    fn number_tail(&mut self, mut digits: String) -> Token {
        if self.peek() == Some('.') && self.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
            digits.push('.');
            digits.push_str(&self.take_while(|c| c.is_ascii_digit()));
        }
        Token::Number(digits)
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.bump() {
            if c == '\n' {
                break;
            }
        }
    }

    fn skip_block_comment(&mut self, line: usize) -> Result<(), ParseError> {
        self.bump();
        self.bump();
        loop {
            match self.bump() {
                Some('*') if self.peek() == Some('/') => {
                    self.bump();
                    return Ok(());
                }
                Some(_) => {}
                None => return Err(self.error(line, "unterminated comment")),
            }
        }
    }

    fn quoted(&mut self, quote: char, line: usize, what: &str) -> Result<String, ParseError> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => {
                    if self.peek() == Some(quote) {
                        self.bump();
                        out.push(quote);
                    } else {
                        return Ok(out);
                    }
                }
                Some('\\') if quote != '`' => match self.bump() {
                    Some(escaped) => out.push(escaped),
                    None => break,
                },
                Some(c) => out.push(c),
                None => break,
            }
        }
        Err(self.error(line, format!("unterminated {what}")))
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}
