//! Placeholder parsing and substitution for shell commands.
//!
//! Shell scripts refer to other targets and to files through placeholders.
//! Parsing a script yields the references the graph builder turns into
//! edges; substituting renders the resolved values right before the script
//! runs.
//!
//! # Placeholder Formats
//!
//! - `$${name}` - value of the target or import `name`
//! - `$${file_in:path}` - a file input (tracked by content)
//! - `$${file_out:path}` - a file output produced by the script
//!
//! Single `$` characters pass through unchanged, so shell variables like
//! `$HOME` work without escaping. `$$${` produces a literal `$${`.
//!
//! # Example
//!
//! ```
//! use strata_lib::command::placeholder::{parse, Placeholder, Segment};
//!
//! let segments = parse("wc -l $${file_in:data.csv} > $$HOME").unwrap();
//! assert_eq!(segments[1], Segment::Placeholder(Placeholder::FileIn("data.csv".to_string())));
//! ```

use thiserror::Error;

/// A parsed placeholder reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
  /// `$${name}` - a target or import value.
  Ref(String),

  /// `$${file_in:path}`
  FileIn(String),

  /// `$${file_out:path}`
  FileOut(String),
}

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  Literal(String),
  Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder type: {0}")]
  UnknownType(String),

  #[error("malformed placeholder: {0}")]
  Malformed(String),

  #[error("unresolved reference: {0}")]
  Unresolved(String),
}

/// Resolves placeholder values at run time.
pub trait Resolver {
  /// Rendered value of a target or import.
  fn resolve_ref(&self, name: &str) -> Result<String, PlaceholderError>;

  /// Path substituted for a file marker.
  fn resolve_file(&self, path: &str) -> Result<String, PlaceholderError>;
}

/// Parse a string containing placeholders into segments.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    if !matches!(chars.peek(), Some((_, '$'))) {
      literal.push('$');
      continue;
    }
    chars.next();

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();
        if matches!(chars.peek(), Some((_, '{'))) {
          chars.next();
          literal.push_str("$${");
        } else {
          literal.push_str("$$$");
        }
      }
      Some((_, '{')) => {
        chars.next();

        if !literal.is_empty() {
          segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }

        let mut content = String::new();
        let mut closed = false;
        for (_, c) in chars.by_ref() {
          if c == '}' {
            closed = true;
            break;
          }
          content.push(c);
        }

        if !closed {
          return Err(PlaceholderError::Unclosed(pos));
        }

        segments.push(Segment::Placeholder(parse_content(&content)?));
      }
      _ => literal.push_str("$$"),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

fn parse_content(content: &str) -> Result<Placeholder, PlaceholderError> {
  let content = content.trim();
  if content.is_empty() {
    return Err(PlaceholderError::Malformed("empty placeholder".to_string()));
  }

  let Some((kind, rest)) = content.split_once(':') else {
    if !is_identifier(content) {
      return Err(PlaceholderError::Malformed(format!("invalid identifier '{content}'")));
    }
    return Ok(Placeholder::Ref(content.to_string()));
  };

  if rest.is_empty() {
    return Err(PlaceholderError::Malformed(format!("missing path in '{content}'")));
  }

  match kind {
    "file_in" => Ok(Placeholder::FileIn(rest.to_string())),
    "file_out" => Ok(Placeholder::FileOut(rest.to_string())),
    _ => Err(PlaceholderError::UnknownType(kind.to_string())),
  }
}

fn is_identifier(s: &str) -> bool {
  let mut chars = s.chars();
  matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
    && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '-')
}

/// Target/import names referenced by the segments, in first-use order.
pub fn references(segments: &[Segment]) -> Vec<String> {
  let mut out: Vec<String> = Vec::new();
  for segment in segments {
    if let Segment::Placeholder(Placeholder::Ref(name)) = segment
      && !out.contains(name)
    {
      out.push(name.clone());
    }
  }
  out
}

/// File input markers in the segments.
pub fn files_in(segments: &[Segment]) -> Vec<String> {
  segments
    .iter()
    .filter_map(|s| match s {
      Segment::Placeholder(Placeholder::FileIn(p)) => Some(p.clone()),
      _ => None,
    })
    .collect()
}

/// File output markers in the segments.
pub fn files_out(segments: &[Segment]) -> Vec<String> {
  segments
    .iter()
    .filter_map(|s| match s {
      Segment::Placeholder(Placeholder::FileOut(p)) => Some(p.clone()),
      _ => None,
    })
    .collect()
}

/// Substitute placeholders in pre-parsed segments.
pub fn substitute_segments(segments: &[Segment], resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::new();

  for segment in segments {
    match segment {
      Segment::Literal(s) => result.push_str(s),
      Segment::Placeholder(Placeholder::Ref(name)) => result.push_str(&resolver.resolve_ref(name)?),
      Segment::Placeholder(Placeholder::FileIn(path) | Placeholder::FileOut(path)) => {
        result.push_str(&resolver.resolve_file(path)?)
      }
    }
  }

  Ok(result)
}

/// Parse and substitute in one step.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let segments = parse(input)?;
  substitute_segments(&segments, resolver)
}
