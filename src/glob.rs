//! Glob patterns with a configurable hierarchy separator.
//!
//! Domain patterns use `.` as the separator so that `*` stays inside a
//! single label while `**` may span several:
//!
//! - `*` any run of characters except the separator
//! - `**` any run of characters, separators included
//! - `?` exactly one character except the separator
//! - `[abc]`, `[a-z]`, `[!abc]` one character from (or not from) a class
//! - `{a,b}` any of the comma separated sub-patterns
//! - `\x` the literal character `x`

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(char),
    Single,
    Star,
    SuperStar,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

/// A compiled glob pattern.
///
/// Alternatives are expanded at compile time, so matching walks a handful
/// of flat token sequences.
#[derive(Debug, Clone)]
pub struct Glob {
    variants: Vec<Vec<Token>>,
    separator: char,
}

impl Glob {
    /// Compile `pattern`, treating `separator` as the hierarchy separator.
    pub fn compile(pattern: &str, separator: char) -> Result<Self> {
        let mut parser = Parser {
            chars: pattern.chars().collect(),
            pos: 0,
            pattern,
        };
        let variants = parser.sequence(false)?;
        if let Some(c) = parser.peek() {
            return Err(parser.error(format!("unexpected {c:?} at offset {}", parser.pos)));
        }

        Ok(Self {
            variants,
            separator,
        })
    }

    /// Check whether `text` matches the whole pattern.
    pub fn is_match(&self, text: &str) -> bool {
        let text: Vec<char> = text.chars().collect();
        self.variants.iter().any(|tokens| {
            Matcher {
                tokens,
                text: &text,
                sep: self.separator,
                memo: vec![None; (tokens.len() + 1) * (text.len() + 1)],
            }
            .matches(0, 0)
        })
    }
}

/// Backtracking matcher over one token sequence.
///
/// Results are memoised per (token, offset) pair so stacked `**` stay
/// polynomial in the length of the text.
struct Matcher<'a> {
    tokens: &'a [Token],
    text: &'a [char],
    sep: char,
    memo: Vec<Option<bool>>,
}

impl Matcher<'_> {
    fn matches(&mut self, ti: usize, xi: usize) -> bool {
        let slot = ti * (self.text.len() + 1) + xi;
        if let Some(hit) = self.memo[slot] {
            return hit;
        }
        let hit = self.step(ti, xi);
        self.memo[slot] = Some(hit);
        hit
    }

    fn step(&mut self, ti: usize, xi: usize) -> bool {
        let (tokens, text, sep) = (self.tokens, self.text, self.sep);
        let Some(token) = tokens.get(ti) else {
            return xi == text.len();
        };
        let next = text.get(xi).copied();

        match token {
            Token::Literal(expected) => next == Some(*expected) && self.matches(ti + 1, xi + 1),
            Token::Single => matches!(next, Some(c) if c != sep) && self.matches(ti + 1, xi + 1),
            Token::Class { negated, ranges } => match next {
                Some(c) if c != sep => {
                    let hit = ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi);
                    hit != *negated && self.matches(ti + 1, xi + 1)
                }
                _ => false,
            },
            Token::Star => {
                for skip in xi..=text.len() {
                    if self.matches(ti + 1, skip) {
                        return true;
                    }
                    if skip < text.len() && text[skip] == sep {
                        return false;
                    }
                }
                false
            }
            Token::SuperStar => (xi..=text.len()).any(|skip| self.matches(ti + 1, skip)),
        }
    }
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    pattern: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn error(&self, reason: String) -> Error {
        Error::Compile {
            pattern: self.pattern.to_string(),
            reason,
        }
    }

    /// Parse tokens up to the end of input, or up to an unconsumed `,`/`}`
    /// when inside braces. Returns every expansion of the sequence.
    fn sequence(&mut self, in_braces: bool) -> Result<Vec<Vec<Token>>> {
        let mut variants: Vec<Vec<Token>> = vec![Vec::new()];

        while let Some(c) = self.peek() {
            if in_braces && (c == ',' || c == '}') {
                break;
            }

            let token = match c {
                '{' => {
                    let alternatives = self.alternatives()?;
                    variants = variants
                        .iter()
                        .flat_map(|prefix| {
                            alternatives.iter().map(move |alt| {
                                let mut joined = prefix.clone();
                                joined.extend(alt.iter().cloned());
                                joined
                            })
                        })
                        .collect();
                    continue;
                }
                '*' => {
                    self.bump();
                    if self.peek() == Some('*') {
                        self.bump();
                        Token::SuperStar
                    } else {
                        Token::Star
                    }
                }
                '?' => {
                    self.bump();
                    Token::Single
                }
                '[' => self.class()?,
                '\\' => {
                    self.bump();
                    match self.bump() {
                        Some(escaped) => Token::Literal(escaped),
                        None => return Err(self.error("dangling escape".into())),
                    }
                }
                '}' => return Err(self.error("unmatched '}'".into())),
                other => {
                    self.bump();
                    Token::Literal(other)
                }
            };

            for variant in &mut variants {
                variant.push(token.clone());
            }
        }

        Ok(variants)
    }

    fn alternatives(&mut self) -> Result<Vec<Vec<Token>>> {
        self.bump();
        let mut all = Vec::new();

        loop {
            all.extend(self.sequence(true)?);
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(all),
                _ => return Err(self.error("unclosed '{'".into())),
            }
        }
    }

    fn class(&mut self) -> Result<Token> {
        self.bump();
        let negated = matches!(self.peek(), Some('!') | Some('^'));
        if negated {
            self.bump();
        }

        let mut ranges = Vec::new();
        loop {
            let lo = match self.bump() {
                None => return Err(self.error("unclosed '['".into())),
                Some(']') if ranges.is_empty() => {
                    return Err(self.error("empty character class".into()));
                }
                Some(']') => break,
                Some('\\') => self
                    .bump()
                    .ok_or_else(|| self.error("unclosed '['".into()))?,
                Some(c) => c,
            };

            let hi = if self.peek() == Some('-') && self.chars.get(self.pos + 1) != Some(&']') {
                self.bump();
                match self.bump() {
                    Some('\\') => self
                        .bump()
                        .ok_or_else(|| self.error("unclosed '['".into()))?,
                    Some(c) => c,
                    None => return Err(self.error("unclosed '['".into())),
                }
            } else {
                lo
            };

            if hi < lo {
                return Err(self.error(format!("invalid range {lo}-{hi}")));
            }
            ranges.push((lo, hi));
        }

        Ok(Token::Class { negated, ranges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn glob(pattern: &str) -> Glob {
        Glob::compile(pattern, '.').unwrap()
    }

    #[test]
    fn literal_matches_exactly() {
        let g = glob("example.com.");

        assert!(g.is_match("example.com."));
        assert!(!g.is_match("www.example.com."));
        assert!(!g.is_match("example.com"));
    }

    #[test]
    fn star_stays_within_label() {
        let g = glob("*.example.com.");

        assert!(g.is_match("www.example.com."));
        assert!(!g.is_match("a.b.example.com."));
        assert!(!g.is_match("example.com."));
    }

    #[test]
    fn super_star_spans_labels() {
        let g = glob("**.com.");

        assert!(g.is_match("yo.test.com."));
        assert!(g.is_match("test.com."));
        assert!(!g.is_match("test.net."));
    }

    #[test]
    fn question_mark_skips_separator() {
        let g = glob("a?c.");

        assert!(g.is_match("abc."));
        assert!(!g.is_match("a.c."));
    }

    #[test]
    fn classes_and_negation() {
        let g = glob("host[0-9].lan.");
        assert!(g.is_match("host7.lan."));
        assert!(!g.is_match("hostx.lan."));

        let g = glob("[!a]b.");
        assert!(g.is_match("xb."));
        assert!(!g.is_match("ab."));
    }

    #[test]
    fn alternatives_expand() {
        let g = glob("{api,www}.{example,test}.com.");

        assert!(g.is_match("api.test.com."));
        assert!(g.is_match("www.example.com."));
        assert!(!g.is_match("mail.example.com."));
    }

    #[test]
    fn nested_alternatives() {
        let g = glob("{a,{b,c*}}.");

        assert!(g.is_match("a."));
        assert!(g.is_match("cat."));
        assert!(!g.is_match("d."));
    }

    #[test]
    fn escape_matches_literal() {
        let g = glob(r"\*.com.");

        assert!(g.is_match("*.com."));
        assert!(!g.is_match("a.com."));
    }

    #[test]
    fn invalid_patterns_fail() {
        for pattern in ["[abc", "{a,b", "a\\", "[]", "a}", "[z-a]"] {
            let err = Glob::compile(pattern, '.').unwrap_err();
            assert!(
                matches!(err, Error::Compile { .. }),
                "{pattern}: unexpected {err:?}"
            );
        }
    }

    #[test]
    fn stacked_super_stars_stay_fast() {
        let g = glob("**.**.**.**.**.corp.");
        let long = format!("{}example.", "a.".repeat(120));

        let start = Instant::now();
        assert!(!g.is_match(&long));
        assert!(g.is_match(&format!("{}corp.", "a.".repeat(120))));
        assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());
    }
}
