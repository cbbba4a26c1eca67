//! URI templates for backend descriptors
//!
//! Implements RFC 6570 expressions up to level 3 plus the prefix modifier,
//! which covers every way a backend address is parameterised in practice.
//! All variable values are plain strings.

use std::collections::HashMap;
use std::fmt;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::TemplateError;

/// Variable name to value, as offered by one client request
pub type Variables = HashMap<String, String>;

/// Everything except RFC 3986 unreserved characters
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Everything except unreserved and reserved characters
const RESERVED: &AsciiSet = &UNRESERVED
    .remove(b':')
    .remove(b'/')
    .remove(b'?')
    .remove(b'#')
    .remove(b'[')
    .remove(b']')
    .remove(b'@')
    .remove(b'!')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b';')
    .remove(b'=');

const MAX_PREFIX: usize = 9999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Simple,
    Reserved,
    Fragment,
    Label,
    Path,
    PathParam,
    Query,
    QueryContinuation,
}

impl Operator {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Self::Reserved),
            '#' => Some(Self::Fragment),
            '.' => Some(Self::Label),
            '/' => Some(Self::Path),
            ';' => Some(Self::PathParam),
            '?' => Some(Self::Query),
            '&' => Some(Self::QueryContinuation),
            _ => None,
        }
    }

    fn first(self) -> &'static str {
        match self {
            Self::Simple | Self::Reserved => "",
            Self::Fragment => "#",
            Self::Label => ".",
            Self::Path => "/",
            Self::PathParam => ";",
            Self::Query => "?",
            Self::QueryContinuation => "&",
        }
    }

    fn separator(self) -> &'static str {
        match self {
            Self::Simple | Self::Reserved | Self::Fragment => ",",
            Self::Label => ".",
            Self::Path => "/",
            Self::PathParam => ";",
            Self::Query | Self::QueryContinuation => "&",
        }
    }

    fn named(self) -> bool {
        matches!(self, Self::PathParam | Self::Query | Self::QueryContinuation)
    }

    fn if_empty(self) -> &'static str {
        match self {
            Self::Query | Self::QueryContinuation => "=",
            _ => "",
        }
    }

    fn allow_reserved(self) -> bool {
        matches!(self, Self::Reserved | Self::Fragment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VarSpec {
    name: String,
    prefix: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Expression { op: Operator, vars: Vec<VarSpec> },
}

/// A parsed URI template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    raw: String,
    parts: Vec<Part>,
}

impl UriTemplate {
    /// Parse a template string
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = raw.char_indices();

        while let Some((offset, c)) = rest.next() {
            match c {
                '{' => {
                    let mut body = String::new();
                    let mut closed = false;
                    for (_, c) in rest.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        body.push(c);
                    }
                    if !closed {
                        return Err(TemplateError::UnclosedExpression(offset));
                    }
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(parse_expression(&body, offset)?);
                }
                '}' => return Err(TemplateError::UnexpectedClose(offset)),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_string(),
            parts,
        })
    }

    /// The template as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Every variable the template references, in order of first appearance
    pub fn var_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for part in &self.parts {
            if let Part::Expression { vars, .. } = part {
                for var in vars {
                    if !names.contains(&var.name.as_str()) {
                        names.push(&var.name);
                    }
                }
            }
        }
        names
    }

    /// Whether every referenced variable is present in `vars`
    pub fn is_satisfied_by(&self, vars: &Variables) -> bool {
        self.var_names().iter().all(|name| vars.contains_key(*name))
    }

    /// Expand the template, requiring every referenced variable to be defined
    pub fn expand(&self, vars: &Variables) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.raw.len());
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Expression { op, vars: specs } => {
                    for (i, spec) in specs.iter().enumerate() {
                        let value = vars
                            .get(&spec.name)
                            .ok_or_else(|| TemplateError::MissingVariable(spec.name.clone()))?;
                        out.push_str(if i == 0 { op.first() } else { op.separator() });
                        expand_var(&mut out, *op, spec, value);
                    }
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for UriTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_expression(body: &str, offset: usize) -> Result<Part, TemplateError> {
    let mut chars = body.chars();
    let (op, list) = match chars.next() {
        None => return Err(TemplateError::EmptyVariable(offset)),
        Some(c) => match Operator::from_char(c) {
            Some(op) => (op, chars.as_str()),
            None if matches!(c, '=' | ',' | '!' | '@' | '|') => {
                return Err(TemplateError::UnsupportedOperator(c))
            }
            None => (Operator::Simple, body),
        },
    };

    let vars = list
        .split(',')
        .map(|spec| parse_varspec(spec, offset))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Part::Expression { op, vars })
}

fn parse_varspec(spec: &str, offset: usize) -> Result<VarSpec, TemplateError> {
    // Explode has no effect on string values.
    let spec = spec.strip_suffix('*').unwrap_or(spec);

    let (name, prefix) = match spec.split_once(':') {
        Some((name, len)) => {
            let len: usize = len
                .parse()
                .map_err(|_| TemplateError::InvalidPrefix(spec.to_string()))?;
            if len == 0 || len > MAX_PREFIX {
                return Err(TemplateError::InvalidPrefix(spec.to_string()));
            }
            (name, Some(len))
        }
        None => (spec, None),
    };

    if name.is_empty() {
        return Err(TemplateError::EmptyVariable(offset));
    }
    if !is_valid_varname(name) {
        return Err(TemplateError::InvalidVariable(name.to_string()));
    }

    Ok(VarSpec {
        name: name.to_string(),
        prefix,
    })
}

fn is_valid_varname(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.first() == Some(&b'.') || bytes.last() == Some(&b'.') || name.contains("..") {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let valid = bytes.len() > i + 2
                    && bytes[i + 1].is_ascii_hexdigit()
                    && bytes[i + 2].is_ascii_hexdigit();
                if !valid {
                    return false;
                }
                i += 3;
            }
            b if b.is_ascii_alphanumeric() || b == b'_' || b == b'.' => i += 1,
            _ => return false,
        }
    }
    true
}

fn expand_var(out: &mut String, op: Operator, spec: &VarSpec, value: &str) {
    if op.named() {
        out.push_str(&spec.name);
        if value.is_empty() {
            out.push_str(op.if_empty());
            return;
        }
        out.push('=');
    }

    let value = match spec.prefix {
        Some(len) => match value.char_indices().nth(len) {
            Some((end, _)) => &value[..end],
            None => value,
        },
        None => value,
    };

    if op.allow_reserved() {
        encode_reserved(out, value);
    } else {
        out.extend(utf8_percent_encode(value, UNRESERVED));
    }
}

/// Encode while passing reserved characters and existing pct-triplets through
fn encode_reserved(out: &mut String, value: &str) {
    let bytes = value.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let triplet = bytes[i] == b'%'
            && bytes.len() > i + 2
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit();
        if triplet {
            out.extend(utf8_percent_encode(&value[start..i], RESERVED));
            out.push_str(&value[i..i + 3]);
            i += 3;
            start = i;
        } else {
            i += 1;
        }
    }
    out.extend(utf8_percent_encode(&value[start..], RESERVED));
}
