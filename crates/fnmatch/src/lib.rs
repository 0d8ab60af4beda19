// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Glob-with-captures matcher for the copy engine's ignore/no-hard-link/
//! no-flags pattern sets: `?` matches one character, `*` matches a run with
//! no `/`, and `(name:subpattern)` captures the text a subpattern matched
//! under `name` — e.g. `/usr/lib/modules/(version:*)/modules.symbols`.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unterminated capture group in {0:?}")]
    UnterminatedGroup(String),
    #[error("capture group in {0:?} is missing a 'name:subpattern' separator")]
    MalformedGroup(String),
    #[error("invalid regex compiled from pattern: {0}")]
    Regex(#[from] regex::Error),
}

/// One parsed element of a glob: a wildcard, a run of literal text, or a
/// named capture wrapping a nested sequence of tokens.
#[derive(Debug)]
enum Token {
    AnyRun,
    AnyChar,
    Literal(String),
    Capture(String, Vec<Token>),
}

/// Split `source` into `Token`s, recursing into `(name:...)` groups. `source`
/// for a recursive call is the text between a group's parentheses.
fn tokenize(source: &str) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => {
                flush_literal(&mut literal, &mut tokens);
                tokens.push(Token::AnyRun);
            }
            '?' => {
                flush_literal(&mut literal, &mut tokens);
                tokens.push(Token::AnyChar);
            }
            '(' => {
                flush_literal(&mut literal, &mut tokens);
                let inner = take_balanced_group(&mut chars).ok_or_else(|| Error::UnterminatedGroup(source.into()))?;
                let (name, subpattern) = inner.split_once(':').ok_or_else(|| Error::MalformedGroup(source.into()))?;
                tokens.push(Token::Capture(name.to_string(), tokenize(subpattern)?));
            }
            other => literal.push(other),
        }
    }
    flush_literal(&mut literal, &mut tokens);
    Ok(tokens)
}

fn flush_literal(literal: &mut String, tokens: &mut Vec<Token>) {
    if !literal.is_empty() {
        tokens.push(Token::Literal(std::mem::take(literal)));
    }
}

/// Consume up to the matching close paren, tracking nesting depth so a
/// group's subpattern may itself contain groups. Returns `None` if `chars`
/// runs out before the group closes.
fn take_balanced_group(chars: &mut std::iter::Peekable<std::str::Chars>) -> Option<String> {
    let mut depth = 1;
    let mut inner = String::new();
    for c in chars.by_ref() {
        match c {
            '(' => {
                depth += 1;
                inner.push(c);
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(inner);
                }
                inner.push(c);
            }
            c => inner.push(c),
        }
    }
    None
}

/// Render one token as a regex fragment, collecting the names of any
/// capture groups encountered (including nested ones) into `names`.
fn token_to_regex(token: &Token, names: &mut Vec<String>) -> String {
    match token {
        Token::AnyRun => "[^/]*".into(),
        Token::AnyChar => ".".into(),
        Token::Literal(text) => regex::escape(text),
        Token::Capture(name, inner) => {
            names.push(name.clone());
            let body: String = inner.iter().map(|t| token_to_regex(t, names)).collect();
            format!("(?<{name}>{body})")
        }
    }
}

/// A single compiled glob, ready to test paths and extract named captures.
#[derive(Debug)]
pub struct Pattern {
    pub source: String,
    regex: Regex,
    capture_names: Vec<String>,
}

/// The result of a successful [`Pattern::match_path`]: the matched path and
/// whatever named captures the pattern defined.
#[derive(Debug)]
pub struct Match {
    pub path: String,
    pub captures: HashMap<String, String>,
}

impl Pattern {
    pub fn compile(source: &str) -> Result<Self, Error> {
        let tokens = tokenize(source)?;
        let mut capture_names = Vec::new();
        let regex_str: String = tokens.iter().map(|t| token_to_regex(t, &mut capture_names)).collect();
        Ok(Self {
            source: source.to_string(),
            regex: Regex::new(&regex_str)?,
            capture_names,
        })
    }

    pub fn match_path(&self, path: &str) -> Option<Match> {
        let captures = self.regex.captures(path)?;
        let named = self
            .capture_names
            .iter()
            .map(|name| (name.clone(), captures.name(name).expect("name present in capture_names").as_str().to_string()))
            .collect();
        Some(Match {
            path: path.to_string(),
            captures: named,
        })
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// An ordered collection of compiled patterns, used as a whole to decide
/// whether a path is excluded (`ignore_patterns`), hard-link-ineligible
/// (`no_hard_link_patterns`), or flag-clearing (`no_flags_patterns`) per the
/// copy engine's contract. A local list always takes precedence in ordering
/// over the global/site-wide list it's layered on, though any member
/// matching is sufficient — order only matters for diagnostics.
#[derive(Debug, Default)]
pub struct PatternSet(Vec<Pattern>);

impl PatternSet {
    pub fn compile(patterns: impl IntoIterator<Item = impl AsRef<str>>) -> Result<Self, Error> {
        let compiled = patterns.into_iter().map(|p| Pattern::compile(p.as_ref())).collect::<Result<_, _>>()?;
        Ok(Self(compiled))
    }

    /// Build a set from a per-operation `local` list layered over a
    /// site-wide `global` one; both contribute, local patterns are checked
    /// first.
    pub fn local_and_global(local: &[String], global: &[String]) -> Result<Self, Error> {
        let mut set = Self::compile(local)?;
        set.0.extend(Self::compile(global)?.0);
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.0.iter().any(|p| p.match_path(path).is_some())
    }

    /// The first member that matches `path`, with its captures, if any.
    pub fn first_match(&self, path: &str) -> Option<Match> {
        self.0.iter().find_map(|p| p.match_path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_and_capture_group_extract_version() {
        let pattern = Pattern::compile("/usr/lib/modules/(version:*)/modules.symbols").unwrap();

        let good = pattern.match_path("/usr/lib/modules/6.2.6/modules.symbols").unwrap();
        assert_eq!(good.path, "/usr/lib/modules/6.2.6/modules.symbols");
        assert_eq!(good.captures.get("version").map(String::as_str), Some("6.2.6"));

        assert!(pattern.match_path("/usr/lib/modules/6.2.6/l/modules.symbols").is_none());
    }

    #[test]
    fn question_mark_matches_exactly_one_character() {
        let pattern = Pattern::compile("a?c").unwrap();
        assert!(pattern.match_path("abc").is_some());
        assert!(pattern.match_path("ac").is_none());
        assert!(pattern.match_path("abbc").is_none());
    }

    #[test]
    fn star_does_not_cross_path_separators() {
        let pattern = Pattern::compile("/apps/*/cache").unwrap();
        assert!(pattern.match_path("/apps/A/cache").is_some());
        assert!(pattern.match_path("/apps/A/B/cache").is_none());
    }

    #[test]
    fn pattern_set_matches_any_member_local_or_global() {
        let set = PatternSet::local_and_global(&["*.bak".to_string()], &["*.tmp".to_string()]).unwrap();
        assert!(set.is_match("notes.bak"));
        assert!(set.is_match("scratch.tmp"));
        assert!(!set.is_match("keep.me"));
    }

    #[test]
    fn empty_pattern_set_matches_nothing() {
        let set = PatternSet::default();
        assert!(set.is_empty());
        assert!(!set.is_match("/anything"));
    }
}
