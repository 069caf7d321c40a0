//! Formatter templates.
//!
//! A formatter is what a user types to describe how each row turns into a
//! geocoding query, e.g. `{street}, {city}, Spain`. Backends want an
//! expression instead: a comma-separated list of column references and quoted
//! literals, `street, ', ', city, ', Spain'`.

use serde::{Deserialize, Serialize};

use geojobs_core::{DomainError, DomainResult, ValueObject};

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text, emitted single-quoted.
    Literal(String),
    /// A `{column}` placeholder, emitted bare.
    Field(String),
}

/// A validated formatter template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Formatter {
    template: String,
    segments: Vec<Segment>,
}

impl ValueObject for Formatter {}

impl Formatter {
    /// Parse and validate a template.
    ///
    /// Adjacent literal text is merged into a single segment. A `}` without
    /// an opening brace is treated as literal text.
    pub fn parse(template: &str) -> DomainResult<Self> {
        if template.trim().is_empty() {
            return Err(DomainError::validation("formatter", "is not present"));
        }

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                DomainError::validation("formatter", format!("unclosed placeholder in {template:?}"))
            })?;

            let name = after[..close].trim();
            if !is_identifier(name) {
                return Err(DomainError::validation(
                    "formatter",
                    format!("invalid field name {name:?}"),
                ));
            }

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Field(name.to_string()));
            rest = &after[close + 1..];
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            template: template.to_string(),
            segments,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Column names referenced by the template, in order of appearance.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Translate into the backend expression.
    pub fn compile(&self) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Field(name) => name.clone(),
                Segment::Literal(text) => quote(text),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Parse `template` and compile it in one go.
pub fn compile(template: &str) -> DomainResult<String> {
    Formatter::parse(template).map(|f| f.compile())
}

impl TryFrom<String> for Formatter {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Formatter::parse(&value)
    }
}

impl From<Formatter> for String {
    fn from(value: Formatter) -> Self {
        value.template
    }
}

impl core::fmt::Display for Formatter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.template)
    }
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
