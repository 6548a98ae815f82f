//! Tag patterns and tag prefix stripping
//!
//! Tags are dot-separated words (`access.web.nginx`). Patterns follow the
//! usual log-router conventions:
//!
//! - `*` matches exactly one part
//! - `**` matches zero or more parts
//! - `{a,b}` matches either alternative (alternatives may nest)
//! - `\c` matches `c` literally
//! - several patterns separated by whitespace match if any of them matches
//! - `/regex/` is a regular expression matched against the whole tag

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use regex::Regex;

use crate::error::ConfigError;

/// Compiled tag-match pattern
#[derive(Debug, Clone)]
pub struct TagPattern {
    source: String,
    matchers: Vec<Regex>,
}

impl TagPattern {
    /// Compile a pattern string
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        let mut matchers = Vec::new();
        for part in pattern.split_whitespace() {
            let source = if part.len() >= 2 && part.starts_with('/') && part.ends_with('/') {
                format!(r"\A(?:{})\z", &part[1..part.len() - 1])
            } else {
                format!(r"\A{}\z", glob_to_regex(part))
            };
            matchers.push(Regex::new(&source).map_err(|e| invalid(e.to_string()))?);
        }

        if matchers.is_empty() {
            return Err(invalid("pattern is empty".to_string()));
        }

        Ok(Self {
            source: pattern.to_string(),
            matchers,
        })
    }

    /// True if any of the alternatives matches the whole tag
    pub fn matches(&self, tag: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl FromStr for TagPattern {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TagPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// Translate one glob pattern into a regex body (without anchors)
fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    // (text before the '{', alternatives collected so far)
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    let mut current = String::new();
    let mut escape = false;
    let mut dot = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if escape {
            current.push_str(&regex::escape(&c.to_string()));
            escape = false;
            i += 1;
            continue;
        }

        if c == '*' && chars.get(i + 1) == Some(&'*') {
            let then_dot = chars.get(i + 2) == Some(&'.');
            let fragment = match (dot, then_dot) {
                // "a.**.b": the parts around ** stay dot separated
                (true, true) => r"\.(?:.*\.)?",
                // "a.**": "a" alone, or "a." followed by anything
                (true, false) => r"(?:\..*)?",
                (false, true) => r"(?:.*\.|\A)",
                (false, false) => ".*",
            };
            current.push_str(fragment);
            dot = false;
            i += if then_dot { 3 } else { 2 };
            continue;
        }

        if dot {
            current.push_str(r"\.");
            dot = false;
        }

        match c {
            '\\' => escape = true,
            '.' => dot = true,
            '*' => current.push_str(r"[^.]*"),
            '{' => groups.push((std::mem::take(&mut current), Vec::new())),
            ',' if !groups.is_empty() => {
                if let Some((_, alternatives)) = groups.last_mut() {
                    alternatives.push(std::mem::take(&mut current));
                }
            }
            '}' if !groups.is_empty() => close_group(&mut groups, &mut current),
            c if c.is_ascii_alphanumeric() || c == '_' => current.push(c),
            c => current.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    if dot {
        current.push_str(r"\.");
    }

    // Unterminated braces are closed implicitly
    while !groups.is_empty() {
        close_group(&mut groups, &mut current);
    }

    current
}

fn close_group(groups: &mut Vec<(String, Vec<String>)>, current: &mut String) {
    if let Some((prefix, mut alternatives)) = groups.pop() {
        alternatives.push(std::mem::take(current));
        *current = format!("{}(?:{})", prefix, alternatives.join("|"));
    }
}

/// Removes a configured literal prefix from the start of a tag
#[derive(Debug, Clone)]
pub struct TagPrefix {
    prefix: String,
    regex: Regex,
}

impl TagPrefix {
    pub fn new(prefix: &str) -> Result<Self, ConfigError> {
        if prefix.is_empty() {
            return Err(ConfigError::InvalidTagPrefix(prefix.to_string()));
        }
        let regex = Regex::new(&format!("^{}", regex::escape(prefix)))
            .map_err(|_| ConfigError::InvalidTagPrefix(prefix.to_string()))?;
        Ok(Self {
            prefix: prefix.to_string(),
            regex,
        })
    }

    /// Remove one leading occurrence of the prefix
    pub fn strip<'a>(&self, tag: &'a str) -> Cow<'a, str> {
        self.regex.replace(tag, "")
    }

    pub fn as_str(&self) -> &str {
        &self.prefix
    }
}
