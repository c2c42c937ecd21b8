// Subscription patterns.
//
// `*` matches any run of characters (dots included); everything else is
// literal. A pattern is anchored at the start unless it begins with `*`
// and at the end unless it ends with `*`. Matchers are compiled once,
// when the pattern is first tracked.

use std::fmt;

use regex::Regex;

/// A compiled subscription pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact,
    Regex(Regex),
}

impl Pattern {
    pub fn new(source: &str) -> Self {
        let matcher = if source.contains('*') {
            match Regex::new(&to_regex(source)) {
                Ok(regex) => Matcher::Regex(regex),
                Err(e) => {
                    tracing::warn!(pattern = source, error = %e, "pattern too complex, matching literally");
                    Matcher::Exact
                }
            }
        } else {
            Matcher::Exact
        };
        Self {
            source: source.to_owned(),
            matcher,
        }
    }

    pub fn matches(&self, id: &str) -> bool {
        match &self.matcher {
            Matcher::Exact => self.source == id,
            Matcher::Regex(regex) => regex.is_match(id),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn has_wildcard(&self) -> bool {
        matches!(self.matcher, Matcher::Regex(_))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Regex source for a pattern.
pub fn to_regex(pattern: &str) -> String {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");

    let mut out = String::with_capacity(body.len() + 2);
    if !pattern.starts_with('*') {
        out.push('^');
    }
    out.push_str(&body);
    if !pattern.ends_with('*') {
        out.push('$');
    }
    out
}
