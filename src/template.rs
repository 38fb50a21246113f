//! Sink path templates.
//!
//! A template is compiled once from a pattern like
//! `servers.{attr.version}.{metric.name}` and resolved per metric. Enum
//! dispatch over node kinds keeps resolution allocation-light.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::message::{Header, Metric};

/// Errors raised while compiling a template pattern.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error(r#"invalid member "{member}" on "metric", only "name" is allowed"#)]
    InvalidMetricMember { member: String },

    #[error(r#"invalid placeholder holder "{holder}", only "attr" and "metric" are allowed"#)]
    InvalidHolder { holder: String },
}

/// Errors raised while resolving a template against a context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error(r#"failed to resolve attribute "{0}""#)]
    UnknownAttribute(String),
}

/// Resolution context: the message's header attributes and the metric whose
/// path is being built.
pub struct ResolveContext<'a> {
    pub attrs: &'a Header,
    pub metric: &'a Metric,
}

#[derive(Debug, Clone)]
enum Node {
    Static(Vec<u8>),
    Attr(String),
    MetricName,
}

/// A compiled path template: static byte runs interleaved with placeholders.
#[derive(Debug, Clone, Default)]
pub struct PathTemplate {
    nodes: Vec<Node>,
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{([a-z]+)\.([a-zA-Z][a-zA-Z0-9_]*)\}").expect("placeholder regex is valid")
    })
}

impl PathTemplate {
    /// Compile a template pattern.
    pub fn parse(input: &str) -> Result<Self, TemplateError> {
        let mut nodes = Vec::new();
        let mut prev = 0;

        for caps in placeholder_regex().captures_iter(input) {
            let whole = caps.get(0).expect("capture group 0 always exists");

            // Everything between placeholders is static.
            if whole.start() > prev {
                nodes.push(Node::Static(input[prev..whole.start()].as_bytes().to_vec()));
            }

            let holder = &caps[1];
            let member = &caps[2];

            match holder {
                "attr" => nodes.push(Node::Attr(member.to_owned())),
                "metric" => {
                    if member != "name" {
                        return Err(TemplateError::InvalidMetricMember {
                            member: member.to_owned(),
                        });
                    }
                    nodes.push(Node::MetricName);
                }
                other => {
                    return Err(TemplateError::InvalidHolder {
                        holder: other.to_owned(),
                    });
                }
            }

            prev = whole.end();
        }

        if prev < input.len() {
            nodes.push(Node::Static(input[prev..].as_bytes().to_vec()));
        }

        Ok(Self { nodes })
    }

    /// Render the template against a context.
    ///
    /// Attribute values containing `.` are rewritten with `_` so a
    /// substituted value can never introduce an extra path level. The
    /// metric name is rendered verbatim.
    pub fn resolve(&self, ctx: &ResolveContext<'_>) -> Result<Vec<u8>, ResolveError> {
        let mut buf = Vec::new();

        for node in &self.nodes {
            match node {
                Node::Static(bytes) => buf.extend_from_slice(bytes),
                Node::Attr(name) => {
                    let value = ctx
                        .attrs
                        .get(name)
                        .ok_or_else(|| ResolveError::UnknownAttribute(name.clone()))?;
                    buf.extend(value.iter().map(|&b| if b == b'.' { b'_' } else { b }));
                }
                Node::MetricName => buf.extend_from_slice(&ctx.metric.name),
            }
        }

        Ok(buf)
    }
}
