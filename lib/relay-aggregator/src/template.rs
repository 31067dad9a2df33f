//! Output metric name templates.
//!
//! A template is the name an aggregate is written to. It can refer back to capture groups of the expression that
//! routed the sample to the aggregator, so a single aggregator can fan out into one series per captured host, shard,
//! and so on.
//!
//! References take the form `\N`, where `N` is a capture group between 0 and 9. Any combination of the following flags
//! may be placed between the backslash and the group number to transform the captured text:
//!
//! - `_`: lowercase
//! - `^`: uppercase
//! - `.`: replace `.` with `_`
//!
//! A literal backslash is written as `\\`.

use std::ops::Range;

use crate::error::{AggregatorError, InvalidTemplate};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Case {
    Keep,
    Lower,
    Upper,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Segment {
    Literal(String),
    Capture { group: usize, case: Case, replace_dots: bool },
}

/// A parsed output metric name template.
#[derive(Clone, Debug)]
pub struct NameTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl NameTemplate {
    /// Parses a template.
    ///
    /// # Errors
    ///
    /// If the template ends in the middle of a reference, or a reference does not end in a group number, an error is
    /// returned.
    pub fn parse(template: &str) -> Result<Self, AggregatorError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '\\' {
                literal.push(c);
                continue;
            }

            if chars.peek() == Some(&'\\') {
                chars.next();
                literal.push('\\');
                continue;
            }

            let mut case = Case::Keep;
            let mut replace_dots = false;
            let group = loop {
                match chars.next() {
                    Some('_') => case = Case::Lower,
                    Some('^') => case = Case::Upper,
                    Some('.') => replace_dots = true,
                    Some(d @ '0'..='9') => break d as usize - '0' as usize,
                    Some(_) => {
                        return InvalidTemplate {
                            template,
                            reason: "reference must end in a capture group number",
                        }
                        .fail()
                    }
                    None => {
                        return InvalidTemplate {
                            template,
                            reason: "template ends inside a reference",
                        }
                        .fail()
                    }
                }
            };

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Capture {
                group,
                case,
                replace_dots,
            });
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    /// Returns the template as it was configured.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns `true` if the template refers to any capture group.
    pub fn has_captures(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Capture { .. }))
    }

    /// Expands the template into `out`.
    ///
    /// `captures` holds the byte ranges of each capture group within `metric`, indexed by group number, with group 0
    /// covering the whole match. `out` is cleared first.
    ///
    /// Returns `false`, leaving `out` in an unspecified state, if the template refers to a group that did not
    /// participate in the match or whose range does not fall within `metric`.
    pub fn expand(&self, metric: &str, captures: &[Option<Range<usize>>], out: &mut String) -> bool {
        out.clear();

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Capture {
                    group,
                    case,
                    replace_dots,
                } => {
                    let Some(captured) = captures
                        .get(*group)
                        .and_then(Option::as_ref)
                        .and_then(|range| metric.get(range.clone()))
                    else {
                        return false;
                    };

                    for c in captured.chars() {
                        let c = if *replace_dots && c == '.' { '_' } else { c };
                        match case {
                            Case::Keep => out.push(c),
                            Case::Lower => out.extend(c.to_lowercase()),
                            Case::Upper => out.extend(c.to_uppercase()),
                        }
                    }
                }
            }
        }

        true
    }
}
