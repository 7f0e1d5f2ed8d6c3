// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use regex::{Captures, Regex};
use std::borrow::Cow;

/// Selects lines by a regular expression and optionally rewrites them.
///
/// The output template may reference capture groups with `\0` (whole match) through
/// `\9`; `\\` produces a single backslash and any other escape is kept as written.
#[derive(Debug, Clone, Default)]
pub struct LineMatcher {
    regex: Option<Regex>,
    template: Option<String>,
}

impl LineMatcher {
    /// An empty pattern matches every line; an empty template keeps the line as is.
    pub fn new(pattern: &str, template: Option<&str>) -> Result<Self> {
        let regex = if pattern.is_empty() {
            None
        } else {
            Some(Regex::new(pattern).map_err(|e| {
                Error::Config(format!("Cannot compile regular expression \"{pattern}\": {e}"))
            })?)
        };

        let template = template.filter(|t| !t.is_empty()).map(str::to_string);
        Ok(Self { regex, template })
    }

    /// Whether `line` matches, without building any output.
    pub fn is_match(&self, line: &str) -> bool {
        match &self.regex {
            Some(re) => re.is_match(line),
            None => true,
        }
    }

    /// The value to dispatch for `line`, or `None` if it does not match.
    pub fn apply<'a>(&self, line: &'a str) -> Option<Cow<'a, str>> {
        let Some(re) = &self.regex else {
            return Some(Cow::Borrowed(line));
        };

        let caps = re.captures(line)?;
        match &self.template {
            Some(template) => Some(Cow::Owned(substitute(template, &caps))),
            None => Some(Cow::Borrowed(line)),
        }
    }
}

fn substitute(template: &str, caps: &Captures<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        match chars.peek().copied() {
            Some('\\') => {
                chars.next();
                out.push('\\');
            }
            Some(d @ '0'..='9') => {
                chars.next();
                let group = d as usize - '0' as usize;
                if let Some(m) = caps.get(group) {
                    out.push_str(m.as_str());
                }
            }
            _ => out.push('\\'),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pattern_matches_everything() {
        let m = LineMatcher::new("", None).unwrap();
        assert_eq!(m.apply("anything").as_deref(), Some("anything"));
    }

    #[test]
    fn test_pattern_searches_unanchored() {
        let m = LineMatcher::new("error", None).unwrap();
        assert!(m.is_match("2024-01-01 error: disk full"));
        assert_eq!(m.apply("all good"), None);
    }

    #[test]
    fn test_template_substitution() {
        let m = LineMatcher::new(r"user=(\w+) id=(\d+)", Some(r"\2:\1 [\0]")).unwrap();
        assert_eq!(
            m.apply("login user=bob id=42 ok").as_deref(),
            Some("42:bob [user=bob id=42]")
        );
    }

    #[test]
    fn test_template_escapes() {
        let m = LineMatcher::new(r"(a)", Some(r"\\x\n\5")).unwrap();
        assert_eq!(m.apply("a").as_deref(), Some(r"\x\n"));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        assert!(matches!(
            LineMatcher::new("(", None).unwrap_err(),
            Error::Config(_)
        ));
    }
}
