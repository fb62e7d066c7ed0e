//! Recursive-descent parser building a typed command tree from the lexer's
//! token stream (`spec.md` §4.2). O(n) over tokens: each grammar rule
//! consumes a fixed lookahead and never backtracks.

use chrono::{DateTime, Utc};

use crate::error::PropolisError;
use crate::lexer::{Keyword, Token, TokenKind};
use crate::model::{AttrMap, AttrType, AttrValue, Command, Direction, EntityPattern, NodePattern, RelationPattern};

type Result<T> = std::result::Result<T, PropolisError>;

pub fn parse(tokens: &[Token]) -> Result<Command> {
    let mut p = Parser { tokens, pos: 0 };
    let cmd = p.parse_cmd()?;
    Ok(cmd)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> &Token {
        let tok = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn syntax_error(&self, tok: &Token) -> PropolisError {
        PropolisError::SyntaxError { offset: tok.offset, lexeme: tok.lexeme.clone() }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        let tok = self.peek().clone();
        if tok.kind == kind {
            self.advance();
            Ok(tok)
        } else {
            Err(self.syntax_error(&tok))
        }
    }

    fn parse_cmd(&mut self) -> Result<Command> {
        let head = self.peek().clone();
        let is_match = match head.kind {
            TokenKind::Keyword(Keyword::Merge) => false,
            TokenKind::Keyword(Keyword::Match) => true,
            _ => return Err(self.syntax_error(&head)),
        };
        self.advance();

        let entity = self.parse_entity()?;

        if is_match {
            let since = if self.peek().kind == TokenKind::Keyword(Keyword::Since) {
                self.advance();
                let quoted = self.expect(TokenKind::Str)?;
                Some(parse_rfc3339(&quoted)?)
            } else {
                None
            };
            if self.peek().kind != TokenKind::Eof {
                return Err(self.syntax_error(self.peek()));
            }
            Ok(Command::Match { entity, since })
        } else {
            if self.peek().kind != TokenKind::Eof {
                return Err(self.syntax_error(self.peek()));
            }
            Ok(Command::Merge(entity))
        }
    }

    fn parse_entity(&mut self) -> Result<EntityPattern> {
        let left = self.parse_node()?;

        let is_reldir = matches!(
            self.peek().kind,
            TokenKind::Dash | TokenKind::Arrow | TokenKind::ArrowLeft
        );
        if !is_reldir {
            return Ok(EntityPattern::Node(left));
        }

        let first = self.advance().clone();
        self.expect(TokenKind::LBracket)?;
        let relation = self.parse_relation_body()?;
        self.expect(TokenKind::RBracket)?;

        let second_tok = self.peek().clone();
        if !matches!(second_tok.kind, TokenKind::Dash | TokenKind::Arrow | TokenKind::ArrowLeft) {
            return Err(self.syntax_error(&second_tok));
        }
        self.advance();

        let direction = if first.kind == TokenKind::ArrowLeft {
            Direction::Left
        } else if second_tok.kind == TokenKind::Arrow {
            Direction::Right
        } else {
            Direction::Neutral
        };

        let right = self.parse_node()?;

        Ok(EntityPattern::Relation { left, relation: RelationPattern { direction, ..relation }, right })
    }

    fn parse_node(&mut self) -> Result<NodePattern> {
        self.expect(TokenKind::LParen)?;
        let identifier = self.parse_optional_ident();
        let labels = self.parse_labels()?;
        let attrs = self.parse_optional_attrs()?;
        self.expect(TokenKind::RParen)?;
        Ok(NodePattern { identifier, labels, attrs })
    }

    /// Parses the body of `[...]` without direction (filled in by the caller,
    /// which knows the surrounding reldir tokens).
    fn parse_relation_body(&mut self) -> Result<RelationPattern> {
        let identifier = self.parse_optional_ident();
        let labels = self.parse_labels()?;
        let attrs = self.parse_optional_attrs()?;
        Ok(RelationPattern { identifier, labels, attrs, direction: Direction::Neutral })
    }

    fn parse_optional_ident(&mut self) -> Option<String> {
        if self.peek().kind == TokenKind::Ident {
            Some(self.advance().lexeme.clone())
        } else {
            None
        }
    }

    fn parse_labels(&mut self) -> Result<Vec<String>> {
        let mut labels = Vec::new();
        while self.peek().kind == TokenKind::Colon {
            self.advance();
            let label = self.expect(TokenKind::Ident)?;
            labels.push(label.lexeme);
        }
        Ok(labels)
    }

    fn parse_optional_attrs(&mut self) -> Result<AttrMap> {
        let mut attrs = AttrMap::new();
        if self.peek().kind != TokenKind::LBrace {
            return Ok(attrs);
        }
        self.advance();
        loop {
            let (name, value) = self.parse_attr()?;
            attrs.insert(name, value);
            if self.peek().kind == TokenKind::Comma {
                self.advance();
                continue;
            }
            break;
        }
        self.expect(TokenKind::RBrace)?;
        Ok(attrs)
    }

    fn parse_attr(&mut self) -> Result<(String, AttrValue)> {
        let name = self.expect(TokenKind::Ident)?;
        self.expect(TokenKind::Colon)?;
        let value_tok = self.peek().clone();
        let value = match value_tok.kind {
            TokenKind::Number => {
                self.advance();
                AttrValue { lexeme: value_tok.lexeme, kind: AttrType::Number }
            }
            TokenKind::Str => {
                self.advance();
                AttrValue { lexeme: value_tok.lexeme, kind: AttrType::String }
            }
            _ => return Err(self.syntax_error(&value_tok)),
        };
        Ok((name.lexeme, value))
    }
}

fn parse_rfc3339(tok: &Token) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&tok.lexeme)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| PropolisError::SyntaxError { offset: tok.offset, lexeme: tok.lexeme.clone() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn parse_str(src: &str) -> Result<Command> {
        parse(&lex(src))
    }

    #[test]
    fn parses_merge_with_relation_scenario() {
        let src = "MERGE (i:Identity:Person {name: 'john'})-[:posted{ipAddress:'127.0.0.1'}]->(p:Post {uri: 'ipfs://xyz', count: 1})";
        let cmd = parse_str(src).unwrap();
        match cmd {
            Command::Merge(EntityPattern::Relation { left, relation, right }) => {
                assert_eq!(left.labels, vec!["Identity", "Person"]);
                assert_eq!(left.attrs.get("name").unwrap().lexeme, "john");
                assert_eq!(left.attrs.get("name").unwrap().kind, AttrType::String);
                assert_eq!(relation.labels, vec!["posted"]);
                assert_eq!(relation.direction, Direction::Right);
                assert_eq!(right.labels, vec!["Post"]);
                assert_eq!(right.attrs.get("count").unwrap().lexeme, "1");
                assert_eq!(right.attrs.get("count").unwrap().kind, AttrType::Number);
            }
            other => panic!("expected merge relation, got {other:?}"),
        }
    }

    #[test]
    fn parses_match_with_since_clause() {
        let cmd = parse_str("MATCH (i:Identity:Person {name: 'john'})-[r]-(c) SINCE '2024-01-01T00:00:00Z'").unwrap();
        match cmd {
            Command::Match { entity: EntityPattern::Relation { relation, .. }, since } => {
                assert_eq!(relation.identifier.as_deref(), Some("r"));
                assert_eq!(relation.direction, Direction::Neutral);
                assert!(since.is_some());
            }
            other => panic!("expected match with since, got {other:?}"),
        }
    }

    #[test]
    fn bare_node_merge() {
        let cmd = parse_str("MERGE (p:Post {uri: 'ipfs://xyz'})").unwrap();
        assert!(matches!(cmd, Command::Merge(EntityPattern::Node(_))));
    }

    #[test]
    fn left_direction_relation() {
        let cmd = parse_str("MATCH (a)<-[:knows]-(b)").unwrap();
        match cmd {
            Command::Match { entity: EntityPattern::Relation { relation, .. }, .. } => {
                assert_eq!(relation.direction, Direction::Left);
            }
            other => panic!("expected left relation, got {other:?}"),
        }
    }

    #[test]
    fn syntax_error_reports_offset_within_input() {
        let src = "MERGE (n {";
        let err = parse_str(src).unwrap_err();
        match err {
            PropolisError::SyntaxError { offset, .. } => assert!(offset <= src.len()),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn delete_and_subscribe_keywords_have_no_parse_rule() {
        assert!(parse_str("DELETE (n)").is_err());
        assert!(parse_str("SUBSCRIBE (n)").is_err());
    }
}
