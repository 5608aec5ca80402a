//! Route matching — structural path patterns with named captures.
//!
//! Patterns are `/`-separated segment lists. Three segment styles are supported:
//!
//! | Segment      | Example pattern     | Matches                | Captured params       |
//! |--------------|---------------------|------------------------|-----------------------|
//! | literal      | `memory/config`     | `memory/config`        | *(none)*              |
//! | `:name`      | `resource/:id`      | `resource/123`         | `id → "123"`          |
//! | `:name+`     | `resource/:rest+`   | `resource/123/extra`   | `rest → "123/extra"`  |
//!
//! Matching is purely structural: literals compare exactly, `:name` consumes
//! exactly one segment, and `:name+` — legal only in final position — consumes
//! all remaining segments (at least one). There is no backtracking and no
//! partial match; [`Pattern::matches`] either returns every capture or `None`.
//!
//! Malformed patterns are a configuration problem, so [`Pattern::parse`]
//! reports them at registration time rather than silently misrouting at
//! dispatch time.

use thiserror::Error;

use crate::context::Params;

/// Error raised when compiling a malformed route pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// A `:name+` segment appeared anywhere but the final position.
    #[error("multi-segment parameter `:{0}+` must be the final segment")]
    RestNotLast(String),

    /// A `:` segment with no parameter name.
    #[error("empty parameter name in pattern segment `{0}`")]
    EmptyName(String),
}

// A single compiled pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Rest(String),
}

/// Compiled representation of a route pattern string.
///
/// # Examples
///
/// ```
/// use recache::Pattern;
///
/// let pattern = Pattern::parse("resource/:id").unwrap();
/// let params = pattern.matches("resource/123").unwrap();
/// assert_eq!(params.get("id"), Some("123"));
/// assert!(pattern.matches("resource/123/extra").is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Compile a pattern string.
    ///
    /// Leading, trailing, and doubled separators are ignored, so
    /// `/resource/:id/` compiles identically to `resource/:id`.
    ///
    /// # Errors
    ///
    /// [`PatternError::RestNotLast`] when a `:name+` segment is not final, and
    /// [`PatternError::EmptyName`] for `:` or `:+` segments.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let Some(name) = part.strip_prefix(':') else {
                segments.push(Segment::Literal((*part).to_owned()));
                continue;
            };

            if let Some(name) = name.strip_suffix('+') {
                if name.is_empty() {
                    return Err(PatternError::EmptyName((*part).to_owned()));
                }
                if i + 1 != parts.len() {
                    return Err(PatternError::RestNotLast(name.to_owned()));
                }
                segments.push(Segment::Rest(name.to_owned()));
            } else if name.is_empty() {
                return Err(PatternError::EmptyName((*part).to_owned()));
            } else {
                segments.push(Segment::Param(name.to_owned()));
            }
        }

        Ok(Self {
            raw: pattern.to_owned(),
            segments,
        })
    }

    /// The pattern string this was compiled from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match `path` against this pattern, returning the captures on success.
    ///
    /// Consumes the path deterministically left to right: every literal must
    /// match exactly, every `:name` consumes one segment, and a trailing
    /// `:name+` consumes everything left (at least one segment, separators
    /// included in the captured value).
    pub fn matches(&self, path: &str) -> Option<Params> {
        let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = Params::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(literal) => {
                    if path_segments.get(i) != Some(&literal.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = path_segments.get(i)?;
                    params.insert(name.clone(), (*value).to_owned());
                }
                Segment::Rest(name) => {
                    // Final by construction; must consume at least one segment.
                    if path_segments.len() <= i {
                        return None;
                    }
                    params.insert(name.clone(), path_segments[i..].join("/"));
                    return Some(params);
                }
            }
        }

        if path_segments.len() != self.segments.len() {
            return None;
        }

        Some(params)
    }
}
