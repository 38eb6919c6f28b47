// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Splits SQL files into classified statements.
//!
//! Statements are produced lazily, in file order, by [`parse_statements`].
//! The iterator tracks the database selected by `USE` so that every
//! statement carries the database it applies to. Session `SET` statements
//! and comments are dropped; the executor manages session state itself.
//!
//! An `ALTER TABLE` is destructive when any of its comma separated options
//! drops a column or an index (`DROP [COLUMN] c`, `DROP INDEX`, `DROP KEY`,
//! `DROP PRIMARY KEY`, `DROP FOREIGN KEY`). Everything else it can do is
//! additive.

mod lexer;

use serde::Serialize;

use crate::error::ParseError;
use crate::parser::lexer::{Lexer, PosToken, RawStatement, Token};

/// How a statement is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    /// `USE db`.
    Use,
    /// An `ALTER TABLE` that only adds.
    AlterAdditive,
    /// An `ALTER TABLE` that drops a column or an index.
    AlterDestructive,
    /// Anything else.
    Other,
}

/// A classified statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// The classification.
    pub kind: StatementKind,
    /// The database the statement applies to: the `USE` target, the
    /// qualifier of an `ALTER TABLE`, or the current database.
    pub db: Option<String>,
    /// The altered table, for `ALTER TABLE`.
    pub table: Option<String>,
    /// The comma separated options of an `ALTER TABLE`, one per entry.
    pub alter_options: Vec<String>,
    /// The statement with comments removed and whitespace collapsed.
    pub text: String,
    /// One-based line where the statement starts.
    pub line: usize,
}

impl Statement {
    /// Reports whether the statement is an `ALTER TABLE`.
    pub fn is_alter(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::AlterAdditive | StatementKind::AlterDestructive
        )
    }

    /// Returns the alter specification, without the `ALTER TABLE t` prefix.
    pub fn alter_clause(&self) -> String {
        self.alter_options.join(", ")
    }
}

/// Lazily parses `sql`, read from `file`, with `db` as the current database.
pub fn parse_statements<'a>(file: &'a str, sql: &'a str, db: Option<String>) -> StatementIter<'a> {
    StatementIter {
        lexer: Lexer::new(file, sql),
        current_db: db,
        done: false,
    }
}

/// Iterator returned by [`parse_statements`]. Stops after the first error.
pub struct StatementIter<'a> {
    lexer: Lexer<'a>,
    current_db: Option<String>,
    done: bool,
}

impl Iterator for StatementIter<'_> {
    type Item = Result<Statement, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let res = match self.lexer.next_statement() {
                Ok(None) => return None,
                Ok(Some(raw)) => self.classify(raw),
                Err(e) => Err(e),
            };
            match res {
                Ok(Some(stmt)) => return Some(Ok(stmt)),
                Ok(None) => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

impl StatementIter<'_> {
    fn classify(&mut self, raw: RawStatement) -> Result<Option<Statement>, ParseError> {
        let line = raw.line();
        let tokens = &raw.tokens;
        let text = self.render(tokens);
        let file = self.lexer.file();
        let err = |message: String| ParseError::new(file, line, message);

        if is_keyword(&tokens[0], "SET") {
            return Ok(None);
        }

        if is_keyword(&tokens[0], "USE") {
            let db = match tokens.get(1).and_then(ident) {
                Some(db) if tokens.len() == 2 => db,
                _ => return Err(err(format!("expected a single database name: {text}"))),
            };
            self.current_db = Some(db.clone());
            return Ok(Some(Statement {
                kind: StatementKind::Use,
                db: Some(db),
                table: None,
                alter_options: vec![],
                text,
                line,
            }));
        }

        if is_keyword(&tokens[0], "ALTER") {
            let mut i = 1;
            while tokens.get(i).is_some_and(|t| {
                is_keyword(t, "ONLINE") || is_keyword(t, "OFFLINE") || is_keyword(t, "IGNORE")
            }) {
                i += 1;
            }
            if tokens.get(i).is_some_and(|t| is_keyword(t, "TABLE")) {
                i += 1;
                let Some(first) = tokens.get(i).and_then(ident) else {
                    return Err(err(format!("expected table name after ALTER TABLE: {text}")));
                };
                i += 1;
                let (db, table) = if tokens.get(i).map(|t| &t.kind) == Some(&Token::Punct('.')) {
                    let Some(table) = tokens.get(i + 1).and_then(ident) else {
                        return Err(err(format!("expected table name after {first}.: {text}")));
                    };
                    i += 2;
                    (Some(first), table)
                } else {
                    (self.current_db.clone(), first)
                };
                let Some(db) = db else {
                    return Err(err(format!("no database selected for ALTER TABLE {table}")));
                };
                let options = split_options(&tokens[i..]);
                if options.is_empty() || options.iter().any(|o| o.is_empty()) {
                    return Err(err(format!(
                        "ALTER TABLE {table} has an empty alter specification"
                    )));
                }
                let kind = if options.iter().any(|o| is_destructive(o)) {
                    StatementKind::AlterDestructive
                } else {
                    StatementKind::AlterAdditive
                };
                let alter_options = options.iter().map(|o| self.render(o)).collect();
                return Ok(Some(Statement {
                    kind,
                    db: Some(db),
                    table: Some(table),
                    alter_options,
                    text,
                    line,
                }));
            }
        }

        Ok(Some(Statement {
            kind: StatementKind::Other,
            db: self.current_db.clone(),
            table: None,
            alter_options: vec![],
            text,
            line,
        }))
    }

    /// Renders tokens from their source text, collapsing anything between
    /// two tokens that was not adjacent into a single space.
    fn render(&self, tokens: &[PosToken]) -> String {
        let src = self.lexer.source();
        let mut out = String::new();
        let mut prev_end = None;
        for token in tokens {
            if prev_end.is_some_and(|end| end != token.span.start) {
                out.push(' ');
            }
            out.push_str(&src[token.span.clone()]);
            prev_end = Some(token.span.end);
        }
        out
    }
}

fn is_keyword(token: &PosToken, keyword: &str) -> bool {
    matches!(&token.kind, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
}

fn ident(token: &PosToken) -> Option<String> {
    match &token.kind {
        Token::Word(w) | Token::QuotedIdent(w) => Some(w.clone()),
        _ => None,
    }
}

/// Splits alter options at top-level commas.
fn split_options(tokens: &[PosToken]) -> Vec<&[PosToken]> {
    if tokens.is_empty() {
        return vec![];
    }
    let mut options = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') => depth = depth.saturating_sub(1),
            Token::Punct(',') if depth == 0 => {
                options.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    options.push(&tokens[start..]);
    options
}

fn is_destructive(option: &[PosToken]) -> bool {
    let [first, second, ..] = option else {
        return false;
    };
    if !is_keyword(first, "DROP") {
        return false;
    }
    match &second.kind {
        Token::Word(w) => {
            let w = w.to_ascii_uppercase();
            match w.as_str() {
                "COLUMN" | "INDEX" | "KEY" | "PRIMARY" | "FOREIGN" => true,
                "PARTITION" | "CHECK" | "CONSTRAINT" => false,
                // `DROP c` drops column `c`.
                _ => true,
            }
        }
        Token::QuotedIdent(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(sql: &str, db: Option<&str>) -> Vec<Statement> {
        parse_statements("t.sql", sql, db.map(String::from))
            .collect::<Result<_, _>>()
            .unwrap()
    }

    fn kinds(sql: &str) -> Vec<StatementKind> {
        parse(sql, Some("db1")).into_iter().map(|s| s.kind).collect()
    }

    #[test]
    fn test_alter_classification() {
        use StatementKind::*;
        for (sql, kind) in [
            ("ALTER TABLE t1 ADD COLUMN c INT", AlterAdditive),
            ("alter table t1 add index idx_c (c), add d int", AlterAdditive),
            ("ALTER TABLE t1 MODIFY c BIGINT NOT NULL DEFAULT 0", AlterAdditive),
            ("ALTER TABLE t1 DROP COLUMN c", AlterDestructive),
            ("ALTER TABLE t1 ADD d INT, DROP c", AlterDestructive),
            ("ALTER TABLE t1 DROP `c`", AlterDestructive),
            ("ALTER TABLE t1 DROP INDEX idx_c", AlterDestructive),
            ("ALTER TABLE t1 DROP KEY idx_c", AlterDestructive),
            ("ALTER TABLE t1 DROP PRIMARY KEY", AlterDestructive),
            ("ALTER TABLE t1 DROP FOREIGN KEY fk_1", AlterDestructive),
            ("ALTER TABLE t1 DROP PARTITION p0", AlterAdditive),
            ("ALTER TABLE t1 ADD c VARCHAR(10) COMMENT 'drop, me'", AlterAdditive),
            ("ALTER ONLINE TABLE t1 DROP c", AlterDestructive),
            ("ALTER DATABASE db1 CHARACTER SET utf8mb4", Other),
            ("ALTER VIEW v1 AS SELECT 1", Other),
            ("CREATE TABLE t2 (id INT PRIMARY KEY)", Other),
            ("DROP TABLE t2", Other),
        ] {
            assert_eq!(kinds(sql), vec![kind], "{sql}");
        }
    }

    #[test]
    fn test_use_threads_current_database() {
        let stmts = parse(
            "ALTER TABLE t1 ADD c INT;\nUSE `db2`;\nALTER TABLE t1 ADD c INT;\nALTER TABLE db3.t1 ADD c INT;\nCREATE TABLE t2 (id INT);",
            Some("db1"),
        );
        let dbs: Vec<_> = stmts.iter().map(|s| s.db.as_deref()).collect();
        assert_eq!(
            dbs,
            vec![Some("db1"), Some("db2"), Some("db2"), Some("db3"), Some("db2")]
        );
        assert_eq!(stmts[1].kind, StatementKind::Use);
        assert_eq!(stmts[3].table.as_deref(), Some("t1"));
    }

    #[test]
    fn test_set_and_comments_dropped() {
        let stmts = parse(
            "/*!40101 SET NAMES utf8mb4 */;\nSET sql_mode = '';\n-- c\nALTER TABLE t1 /* why */ ADD   c INT ,\n  ADD d INT;",
            Some("db1"),
        );
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].text, "ALTER TABLE t1 ADD c INT , ADD d INT");
        assert_eq!(stmts[0].alter_options, vec!["ADD c INT", "ADD d INT"]);
        assert_eq!(stmts[0].alter_clause(), "ADD c INT, ADD d INT");
        assert_eq!(stmts[0].line, 4);
    }

    #[test]
    fn test_errors() {
        for (sql, db, line, message) in [
            ("ALTER TABLE t1 ADD c INT", None, 1, "no database selected for ALTER TABLE t1"),
            ("USE db1;\nALTER TABLE", None, 2, "expected table name after ALTER TABLE: ALTER TABLE"),
            ("ALTER TABLE t1", Some("db1"), 1, "ALTER TABLE t1 has an empty alter specification"),
            ("ALTER TABLE t1 ADD c INT,", Some("db1"), 1, "ALTER TABLE t1 has an empty alter specification"),
            ("USE a b", None, 1, "expected a single database name: USE a b"),
        ] {
            let err = parse_statements("t.sql", sql, db.map(String::from))
                .find_map(Result::err)
                .unwrap_or_else(|| panic!("expected an error for {sql:?}"));
            assert_eq!(err, ParseError::new("t.sql", line, message), "{sql:?}");
        }
    }

    #[test]
    fn test_stops_after_error() {
        let mut iter = parse_statements("t.sql", "SELECT 'x;\nSELECT 1;", None);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_reparse_is_stable() {
        let sql = "USE db1;\nALTER TABLE t1 ADD c INT DEFAULT 1, DROP KEY k;\nINSERT INTO t2 VALUES (1);";
        let first = parse(sql, None);
        let rendered: String = first.iter().map(|s| format!("{};\n", s.text)).collect();
        assert_eq!(parse(&rendered, None), {
            let mut expected = first.clone();
            for (i, s) in expected.iter_mut().enumerate() {
                s.line = i + 1;
            }
            expected
        });
    }
}
