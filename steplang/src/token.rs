//! Tokenizer for the step language.
//!
//! Indentation-aware: emits `Newline`, `Indent` and `Dedent` tokens the way a
//! Python tokenizer does, with implicit line joining inside brackets.

use crate::error::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Newline,
    Indent,
    Dedent,
    EndOfInput,

    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// f-string, split into literal and `{expression}` parts. Expression
    /// parts carry raw source re-parsed by the parser.
    FStr(Vec<FStrPart>),

    // keywords
    KwNone,
    KwTrue,
    KwFalse,
    KwAnd,
    KwOr,
    KwNot,
    KwIf,
    KwElif,
    KwElse,
    KwFor,
    KwWhile,
    KwIn,
    KwIs,
    KwBreak,
    KwContinue,
    KwPass,
    KwReturn,
    KwDef,
    KwLambda,
    KwDel,
    KwImport,
    KwFrom,
    KwGlobal,
    KwNonlocal,

    // operators and delimiters
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    DoubleSlashAssign,
    PercentAssign,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Semicolon,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FStrPart {
    Lit(String),
    Expr(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub tok: Tok,
    pub line: u32,
}

fn keyword(name: &str) -> Option<Tok> {
    let tok = match name {
        "None" => Tok::KwNone,
        "True" => Tok::KwTrue,
        "False" => Tok::KwFalse,
        "and" => Tok::KwAnd,
        "or" => Tok::KwOr,
        "not" => Tok::KwNot,
        "if" => Tok::KwIf,
        "elif" => Tok::KwElif,
        "else" => Tok::KwElse,
        "for" => Tok::KwFor,
        "while" => Tok::KwWhile,
        "in" => Tok::KwIn,
        "is" => Tok::KwIs,
        "break" => Tok::KwBreak,
        "continue" => Tok::KwContinue,
        "pass" => Tok::KwPass,
        "return" => Tok::KwReturn,
        "def" => Tok::KwDef,
        "lambda" => Tok::KwLambda,
        "del" => Tok::KwDel,
        "import" => Tok::KwImport,
        "from" => Tok::KwFrom,
        "global" => Tok::KwGlobal,
        "nonlocal" => Tok::KwNonlocal,
        _ => return None,
    };
    Some(tok)
}

pub(crate) struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    /// Bracket nesting depth; newlines and indentation are ignored inside.
    depth: usize,
    indents: Vec<usize>,
    out: Vec<Spanned>,
    /// True when the current physical line has produced at least one token.
    line_has_tokens: bool,
    source: &'a str,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, ParseError> {
    Lexer::new(source).run()
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            depth: 0,
            indents: vec![0],
            out: Vec::new(),
            line_has_tokens: false,
            source,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn push(&mut self, tok: Tok) {
        self.line_has_tokens = true;
        self.out.push(Spanned {
            tok,
            line: self.line,
        });
    }

    fn err(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.line, message)
    }

    fn run(mut self) -> Result<Vec<Spanned>, ParseError> {
        // Guard against pathological inputs before any parsing happens.
        if self.source.len() > 1_000_000 {
            return Err(ParseError::new(1, "step source too large"));
        }
        self.handle_line_start()?;
        while self.pos < self.chars.len() {
            let c = match self.peek() {
                Some(c) => c,
                None => break,
            };
            match c {
                '\n' => {
                    self.bump();
                    if self.depth == 0 && self.line_has_tokens {
                        self.push(Tok::Newline);
                    }
                    self.line += 1;
                    self.line_has_tokens = false;
                    if self.depth == 0 {
                        self.handle_line_start()?;
                    }
                }
                '\r' => {
                    self.bump();
                }
                ' ' | '\t' => {
                    self.bump();
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '\'' | '"' => self.lex_string(false, false)?,
                c if c.is_ascii_digit() => self.lex_number()?,
                '.' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => self.lex_number()?,
                c if c.is_alphabetic() || c == '_' => self.lex_name()?,
                _ => self.lex_operator()?,
            }
        }
        if self.line_has_tokens {
            self.push(Tok::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.out.push(Spanned {
                tok: Tok::Dedent,
                line: self.line,
            });
        }
        self.out.push(Spanned {
            tok: Tok::EndOfInput,
            line: self.line,
        });
        Ok(self.out)
    }

    /// Measure leading whitespace of the line starting at `self.pos` and emit
    /// Indent/Dedent tokens. Blank and comment-only lines produce nothing.
    fn handle_line_start(&mut self) -> Result<(), ParseError> {
        loop {
            let line_start = self.pos;
            let mut column = 0usize;
            while let Some(c) = self.peek() {
                match c {
                    ' ' => {
                        column += 1;
                        self.bump();
                    }
                    '\t' => {
                        column = (column / 8 + 1) * 8;
                        self.bump();
                    }
                    _ => break,
                }
            }
            match self.peek() {
                // Blank line: consume it and measure the next one.
                Some('\n') => {
                    self.bump();
                    self.line += 1;
                    continue;
                }
                Some('\r') => {
                    self.bump();
                    continue;
                }
                // Comment-only line: skip to the newline, loop again.
                Some('#') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    continue;
                }
                None => {
                    // Rewind is unnecessary at EOF; trailing indentation on
                    // the last line is meaningless.
                    let _ = line_start;
                    return Ok(());
                }
                Some(_) => {}
            }

            let current = *self.indents.last().unwrap_or(&0);
            if column > current {
                self.indents.push(column);
                self.out.push(Spanned {
                    tok: Tok::Indent,
                    line: self.line,
                });
            } else if column < current {
                while self.indents.len() > 1 && *self.indents.last().unwrap_or(&0) > column {
                    self.indents.pop();
                    self.out.push(Spanned {
                        tok: Tok::Dedent,
                        line: self.line,
                    });
                }
                if *self.indents.last().unwrap_or(&0) != column {
                    return Err(self.err("unindent does not match any outer indentation level"));
                }
            }
            return Ok(());
        }
    }

    fn lex_name(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        let name: String = self.chars[start..self.pos].iter().collect();

        // String prefixes: r"", f"", rf""/fr"".
        if let Some(next) = self.peek() {
            if (next == '"' || next == '\'') && name.len() <= 2 {
                let lower = name.to_ascii_lowercase();
                let raw = lower.contains('r');
                let fstr = lower.contains('f');
                let valid = lower.chars().all(|c| c == 'r' || c == 'f');
                if valid {
                    return self.lex_string(raw, fstr);
                }
            }
        }

        match keyword(&name) {
            Some(tok) => self.push(tok),
            None => self.push(Tok::Name(name)),
        }
        Ok(())
    }

    fn lex_number(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else if c == '.' && !is_float && self.peek_at(1).is_none_or(|n| n != '.') {
                // Allow a trailing `.` only when it is part of the number,
                // not an attribute access like `1 .real` (unsupported anyway).
                is_float = true;
                self.bump();
            } else if (c == 'e' || c == 'E')
                && self
                    .peek_at(1)
                    .is_some_and(|n| n.is_ascii_digit() || n == '+' || n == '-')
            {
                is_float = true;
                self.bump();
                if matches!(self.peek(), Some('+') | Some('-')) {
                    self.bump();
                }
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| self.err(format!("invalid float literal: {text}")))?;
            self.push(Tok::Float(value));
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| self.err(format!("integer literal out of range: {text}")))?;
            self.push(Tok::Int(value));
        }
        Ok(())
    }

    fn lex_string(&mut self, raw: bool, fstr: bool) -> Result<(), ParseError> {
        let quote = match self.bump() {
            Some(q @ ('\'' | '"')) => q,
            _ => return Err(self.err("expected string quote")),
        };
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }

        let mut text = String::new();
        loop {
            let c = match self.bump() {
                Some(c) => c,
                None => return Err(self.err("unterminated string literal")),
            };
            if c == quote {
                if !triple {
                    break;
                }
                if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                    self.bump();
                    self.bump();
                    break;
                }
                text.push(c);
                continue;
            }
            if c == '\n' {
                if !triple {
                    return Err(self.err("unterminated string literal"));
                }
                self.line += 1;
                text.push(c);
                continue;
            }
            if c == '\\' && !raw {
                let esc = match self.bump() {
                    Some(e) => e,
                    None => return Err(self.err("unterminated escape sequence")),
                };
                match esc {
                    'n' => text.push('\n'),
                    't' => text.push('\t'),
                    'r' => text.push('\r'),
                    '0' => text.push('\0'),
                    '\\' => text.push('\\'),
                    '\'' => text.push('\''),
                    '"' => text.push('"'),
                    '\n' => {
                        // Escaped newline: line continuation inside a string.
                        self.line += 1;
                    }
                    'x' => {
                        let hi = self.bump();
                        let lo = self.bump();
                        let (Some(hi), Some(lo)) = (hi, lo) else {
                            return Err(self.err("truncated \\x escape"));
                        };
                        let code = u32::from_str_radix(&format!("{hi}{lo}"), 16)
                            .map_err(|_| self.err("invalid \\x escape"))?;
                        match char::from_u32(code) {
                            Some(c) => text.push(c),
                            None => return Err(self.err("invalid \\x escape")),
                        }
                    }
                    'u' => {
                        let mut code = String::new();
                        for _ in 0..4 {
                            match self.bump() {
                                Some(c) => code.push(c),
                                None => return Err(self.err("truncated \\u escape")),
                            }
                        }
                        let code = u32::from_str_radix(&code, 16)
                            .map_err(|_| self.err("invalid \\u escape"))?;
                        match char::from_u32(code) {
                            Some(c) => text.push(c),
                            None => return Err(self.err("invalid \\u escape")),
                        }
                    }
                    other => {
                        // Unknown escapes keep the backslash, like CPython.
                        text.push('\\');
                        text.push(other);
                    }
                }
                continue;
            }
            if c == '\\' && raw {
                text.push('\\');
                if let Some(next) = self.bump() {
                    if next == '\n' {
                        self.line += 1;
                    }
                    text.push(next);
                }
                continue;
            }
            text.push(c);
        }

        if fstr {
            let parts = split_fstring(&text).map_err(|m| self.err(m))?;
            self.push(Tok::FStr(parts));
        } else {
            self.push(Tok::Str(text));
        }
        Ok(())
    }

    fn lex_operator(&mut self) -> Result<(), ParseError> {
        let c = match self.bump() {
            Some(c) => c,
            None => return Ok(()),
        };
        let next = self.peek();
        let tok = match (c, next) {
            ('*', Some('*')) => {
                self.bump();
                Tok::DoubleStar
            }
            ('*', Some('=')) => {
                self.bump();
                Tok::StarAssign
            }
            ('*', _) => Tok::Star,
            ('/', Some('/')) => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    Tok::DoubleSlashAssign
                } else {
                    Tok::DoubleSlash
                }
            }
            ('/', Some('=')) => {
                self.bump();
                Tok::SlashAssign
            }
            ('/', _) => Tok::Slash,
            ('+', Some('=')) => {
                self.bump();
                Tok::PlusAssign
            }
            ('+', _) => Tok::Plus,
            ('-', Some('=')) => {
                self.bump();
                Tok::MinusAssign
            }
            ('-', _) => Tok::Minus,
            ('%', Some('=')) => {
                self.bump();
                Tok::PercentAssign
            }
            ('%', _) => Tok::Percent,
            ('=', Some('=')) => {
                self.bump();
                Tok::EqEq
            }
            ('=', _) => Tok::Assign,
            ('!', Some('=')) => {
                self.bump();
                Tok::NotEq
            }
            ('!', _) => return Err(self.err("unexpected character: !")),
            ('<', Some('=')) => {
                self.bump();
                Tok::Le
            }
            ('<', _) => Tok::Lt,
            ('>', Some('=')) => {
                self.bump();
                Tok::Ge
            }
            ('>', _) => Tok::Gt,
            ('(', _) => {
                self.depth += 1;
                Tok::LParen
            }
            (')', _) => {
                self.depth = self.depth.saturating_sub(1);
                Tok::RParen
            }
            ('[', _) => {
                self.depth += 1;
                Tok::LBracket
            }
            (']', _) => {
                self.depth = self.depth.saturating_sub(1);
                Tok::RBracket
            }
            ('{', _) => {
                self.depth += 1;
                Tok::LBrace
            }
            ('}', _) => {
                self.depth = self.depth.saturating_sub(1);
                Tok::RBrace
            }
            (',', _) => Tok::Comma,
            (':', _) => Tok::Colon,
            ('.', _) => Tok::Dot,
            (';', _) => Tok::Semicolon,
            (other, _) => return Err(self.err(format!("unexpected character: {other}"))),
        };
        self.push(tok);
        Ok(())
    }
}

/// Split an f-string body into literal and expression parts. Nested braces
/// inside expressions are tracked; format specs and conversions are not
/// supported in the subset.
fn split_fstring(text: &str) -> Result<Vec<FStrPart>, String> {
    let mut parts = Vec::new();
    let mut lit = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    lit.push('{');
                    continue;
                }
                if !lit.is_empty() {
                    parts.push(FStrPart::Lit(std::mem::take(&mut lit)));
                }
                let mut expr = String::new();
                let mut depth = 1usize;
                loop {
                    let c = match chars.next() {
                        Some(c) => c,
                        None => return Err("unterminated { in f-string".to_string()),
                    };
                    match c {
                        '{' => {
                            depth += 1;
                            expr.push(c);
                        }
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                            expr.push(c);
                        }
                        ':' if depth == 1 => {
                            return Err("format specs are not supported in f-strings".to_string());
                        }
                        _ => expr.push(c),
                    }
                }
                if expr.trim().is_empty() {
                    return Err("empty expression in f-string".to_string());
                }
                parts.push(FStrPart::Expr(expr));
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                    lit.push('}');
                } else {
                    return Err("single } in f-string".to_string());
                }
            }
            _ => lit.push(c),
        }
    }
    if !lit.is_empty() {
        parts.push(FStrPart::Lit(lit));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|s| s.tok)
            .collect()
    }

    #[test]
    fn lexes_assignment_line() {
        assert_eq!(
            toks("x = 1\n"),
            vec![
                Tok::Name("x".to_string()),
                Tok::Assign,
                Tok::Int(1),
                Tok::Newline,
                Tok::EndOfInput,
            ]
        );
    }

    #[test]
    fn emits_indent_and_dedent() {
        let toks = toks("if x:\n    y = 1\nz = 2\n");
        assert!(toks.contains(&Tok::Indent));
        assert!(toks.contains(&Tok::Dedent));
    }

    #[test]
    fn implicit_line_joining_inside_brackets() {
        let toks = toks("x = [1,\n     2]\n");
        let newlines = toks.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 1);
        assert!(!toks.contains(&Tok::Indent));
    }

    #[test]
    fn string_escapes_and_raw_strings() {
        assert_eq!(toks("'a\\nb'\n")[0], Tok::Str("a\nb".to_string()));
        assert_eq!(toks("r'a\\nb'\n")[0], Tok::Str("a\\nb".to_string()));
    }

    #[test]
    fn triple_quoted_string_spans_lines() {
        let toks = toks("x = \"\"\"a\nb\"\"\"\n");
        assert_eq!(toks[2], Tok::Str("a\nb".to_string()));
    }

    #[test]
    fn fstring_splits_parts() {
        match &toks("f'a{b}c'\n")[0] {
            Tok::FStr(parts) => {
                assert_eq!(
                    parts,
                    &vec![
                        FStrPart::Lit("a".to_string()),
                        FStrPart::Expr("b".to_string()),
                        FStrPart::Lit("c".to_string()),
                    ]
                );
            }
            other => panic!("expected FStr, got {other:?}"),
        }
    }

    #[test]
    fn comment_only_lines_do_not_affect_indentation() {
        let toks = toks("x = 1\n# comment\n    # indented comment\ny = 2\n");
        assert!(!toks.contains(&Tok::Indent));
    }

    #[test]
    fn slice_colon_and_floats() {
        assert_eq!(
            toks("d[0:5]\n"),
            vec![
                Tok::Name("d".to_string()),
                Tok::LBracket,
                Tok::Int(0),
                Tok::Colon,
                Tok::Int(5),
                Tok::RBracket,
                Tok::Newline,
                Tok::EndOfInput,
            ]
        );
        assert_eq!(toks("1.5e3\n")[0], Tok::Float(1500.0));
    }

    #[test]
    fn rejects_unknown_characters() {
        assert!(tokenize("x = `y`\n").is_err());
        assert!(tokenize("x = 'unterminated\n").is_err());
    }
}
