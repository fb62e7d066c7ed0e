//! Tokenizer for the openCypher-like statement grammar (`spec.md` §4.1).
//!
//! Implemented as a classical state-function machine in the style Rob
//! Pike's `text/template` lexer popularized: each state consumes zero or
//! more runes from the input and returns the state to run next. Whitespace
//! is a separator only; it's discarded except inside quoted strings. On
//! syntactic failure the remaining input is drained and a single `Error`
//! token carrying a formatted message is emitted.

use std::iter::Peekable;
use std::str::CharIndices;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Match,
    Merge,
    Create,
    Delete,
    Where,
    Since,
    Set,
    Subscribe,
    Unsubscribe,
    Or,
    And,
}

impl Keyword {
    fn from_lowercase(word: &str) -> Option<Self> {
        Some(match word {
            "match" => Keyword::Match,
            "merge" => Keyword::Merge,
            "create" => Keyword::Create,
            "delete" => Keyword::Delete,
            "where" => Keyword::Where,
            "since" => Keyword::Since,
            "set" => Keyword::Set,
            "subscribe" => Keyword::Subscribe,
            "unsubscribe" => Keyword::Unsubscribe,
            "or" => Keyword::Or,
            "and" => Keyword::And,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Colon,
    Comma,
    Dash,
    Arrow,     // ->
    ArrowLeft, // <-
    LAngle,    // bare '<', reserved
    Ident,
    Number,
    Str,
    Keyword(Keyword),
    Eof,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
    pub lexeme: String,
}

type StateFn<'a> = fn(&mut Lexer<'a>) -> Option<StateFn<'a>>;

struct Lexer<'a> {
    src: &'a str,
    iter: Peekable<CharIndices<'a>>,
    tokens: Vec<Token>,
}

pub fn lex(input: &str) -> Vec<Token> {
    let mut l = Lexer { src: input, iter: input.char_indices().peekable(), tokens: Vec::new() };
    let mut state: StateFn = lex_start;
    while let Some(next) = state(&mut l) {
        state = next;
    }
    l.tokens
}

impl<'a> Lexer<'a> {
    fn push(&mut self, kind: TokenKind, offset: usize, lexeme: impl Into<String>) {
        self.tokens.push(Token { kind, offset, lexeme: lexeme.into() });
    }

    /// Current byte offset: the offset of the next unconsumed char, or the
    /// input's length at EOF.
    fn offset(&mut self) -> usize {
        self.iter.peek().map(|(i, _)| *i).unwrap_or(self.src.len())
    }

    fn error(&mut self, offset: usize, message: impl Into<String>) {
        // Drain remaining input: a single `Error` token is terminal.
        while self.iter.next().is_some() {}
        self.push(TokenKind::Error, offset, message.into());
    }
}

fn lex_start<'a>(l: &mut Lexer<'a>) -> Option<StateFn<'a>> {
    let (offset, c) = match l.iter.peek().copied() {
        Some(pair) => pair,
        None => {
            let eof_offset = l.src.len();
            l.push(TokenKind::Eof, eof_offset, "");
            return None;
        }
    };

    if c.is_whitespace() {
        l.iter.next();
        return Some(lex_start);
    }

    match c {
        '(' => {
            l.iter.next();
            l.push(TokenKind::LParen, offset, "(");
        }
        ')' => {
            l.iter.next();
            l.push(TokenKind::RParen, offset, ")");
        }
        '{' => {
            l.iter.next();
            l.push(TokenKind::LBrace, offset, "{");
        }
        '}' => {
            l.iter.next();
            l.push(TokenKind::RBrace, offset, "}");
        }
        '[' => {
            l.iter.next();
            l.push(TokenKind::LBracket, offset, "[");
        }
        ']' => {
            l.iter.next();
            l.push(TokenKind::RBracket, offset, "]");
        }
        ':' => {
            l.iter.next();
            l.push(TokenKind::Colon, offset, ":");
        }
        ',' => {
            l.iter.next();
            l.push(TokenKind::Comma, offset, ",");
        }
        '-' => {
            l.iter.next();
            if matches!(l.iter.peek(), Some((_, '>'))) {
                l.iter.next();
                l.push(TokenKind::Arrow, offset, "->");
            } else {
                l.push(TokenKind::Dash, offset, "-");
            }
        }
        '<' => {
            l.iter.next();
            if matches!(l.iter.peek(), Some((_, '-'))) {
                l.iter.next();
                l.push(TokenKind::ArrowLeft, offset, "<-");
            } else {
                l.push(TokenKind::LAngle, offset, "<");
            }
        }
        '\'' | '"' => return Some(lex_quoted(l, c, offset)),
        c if c.is_ascii_digit() => return Some(lex_number(l, offset)),
        c if c.is_ascii_alphabetic() => return Some(lex_ident(l, offset)),
        other => {
            l.error(offset, format!("unexpected character {other:?}"));
            return None;
        }
    }
    Some(lex_start)
}

fn lex_quoted<'a>(l: &mut Lexer<'a>, quote: char, start: usize) -> Option<StateFn<'a>> {
    l.iter.next(); // consume opening quote
    let mut lexeme = String::new();
    loop {
        match l.iter.next() {
            Some((_, '\\')) => {
                // Backslash escapes are preserved verbatim: keep both the
                // backslash and the escaped character in the lexeme.
                lexeme.push('\\');
                if let Some((_, escaped)) = l.iter.next() {
                    lexeme.push(escaped);
                } else {
                    l.error(start, "unterminated string, trailing backslash");
                    return None;
                }
            }
            Some((_, c)) if c == quote => {
                l.push(TokenKind::Str, start, lexeme);
                return Some(lex_start);
            }
            Some((_, c)) => lexeme.push(c),
            None => {
                l.error(start, "unterminated string literal");
                return None;
            }
        }
    }
}

fn lex_number<'a>(l: &mut Lexer<'a>, start: usize) -> Option<StateFn<'a>> {
    let mut lexeme = String::new();
    while matches!(l.iter.peek(), Some((_, c)) if c.is_ascii_digit()) {
        lexeme.push(l.iter.next().unwrap().1);
    }
    if matches!(l.iter.peek(), Some((_, '.'))) {
        // only consume the dot if followed by a digit (fractional part)
        let mut lookahead = l.iter.clone();
        lookahead.next();
        if matches!(lookahead.peek(), Some((_, c)) if c.is_ascii_digit()) {
            lexeme.push(l.iter.next().unwrap().1); // '.'
            while matches!(l.iter.peek(), Some((_, c)) if c.is_ascii_digit()) {
                lexeme.push(l.iter.next().unwrap().1);
            }
        }
    }
    if matches!(l.iter.peek(), Some((_, 'e' | 'E'))) {
        let mut lookahead = l.iter.clone();
        let (_, e) = lookahead.next().unwrap();
        let mut probe = lookahead.clone();
        let has_sign = matches!(probe.peek(), Some((_, '+' | '-')));
        if has_sign {
            probe.next();
        }
        if matches!(probe.peek(), Some((_, c)) if c.is_ascii_digit()) {
            lexeme.push(e);
            l.iter.next();
            if has_sign {
                lexeme.push(l.iter.next().unwrap().1);
            }
            while matches!(l.iter.peek(), Some((_, c)) if c.is_ascii_digit()) {
                lexeme.push(l.iter.next().unwrap().1);
            }
        }
    }
    l.push(TokenKind::Number, start, lexeme);
    Some(lex_start)
}

fn lex_ident<'a>(l: &mut Lexer<'a>, start: usize) -> Option<StateFn<'a>> {
    let mut lexeme = String::new();
    while matches!(l.iter.peek(), Some((_, c)) if c.is_ascii_alphanumeric()) {
        lexeme.push(l.iter.next().unwrap().1);
    }
    let kind = match Keyword::from_lowercase(&lexeme.to_ascii_lowercase()) {
        Some(kw) => TokenKind::Keyword(kw),
        None => TokenKind::Ident,
    };
    l.push(kind, start, lexeme);
    Some(lex_start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_merge_with_relation() {
        let src = "MERGE (i:Identity:Person {name: 'john'})-[:posted{ipAddress:'127.0.0.1'}]->(p:Post {uri: 'ipfs://xyz', count: 1})";
        let tokens = lex(src);
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
        assert_eq!(tokens[0].kind, TokenKind::Keyword(Keyword::Merge));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Arrow));
        let quoted: Vec<_> = tokens.iter().filter(|t| t.kind == TokenKind::Str).map(|t| t.lexeme.as_str()).collect();
        assert_eq!(quoted, vec!["john", "127.0.0.1", "ipfs://xyz"]);
    }

    #[test]
    fn lexes_number_with_exponent() {
        let tokens = lex("0.5E+2");
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[0].lexeme, "0.5E+2");
    }

    #[test]
    fn lexes_since_clause() {
        let tokens = lex("SINCE '2024-01-01T00:00:00Z'");
        assert_eq!(kinds(&tokens)[..2], [TokenKind::Keyword(Keyword::Since), TokenKind::Str]);
    }

    #[test]
    fn preserves_backslash_escapes_verbatim() {
        let tokens = lex(r#"'a\'b'"#);
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].lexeme, r"a\'b");
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let tokens = lex("match merge MATCH");
        assert_eq!(tokens[0].kind, TokenKind::Keyword(Keyword::Match));
        assert_eq!(tokens[1].kind, TokenKind::Keyword(Keyword::Merge));
        assert_eq!(tokens[2].kind, TokenKind::Keyword(Keyword::Match));
    }

    #[test]
    fn unexpected_character_emits_single_error_token() {
        let tokens = lex("MERGE (n) ~ garbage");
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Error);
        // error is terminal: nothing lexed after it
        let err_pos = tokens.iter().position(|t| t.kind == TokenKind::Error).unwrap();
        assert_eq!(err_pos, tokens.len() - 1);
    }
}
