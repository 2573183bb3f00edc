//! Role command templates
//!
//! Commands are written before the network exists, so host addresses are
//! referenced symbolically and resolved at fire time:
//!
//! - `{addr:h2}` expands to the address assigned to host `h2`
//! - `{port}` expands to the proxy listen port
//! - `{{` and `}}` are literal braces

use crate::{Result, ScenarioError};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(String);

/// Values available to a template when it is rendered
#[derive(Clone, Debug, Default)]
pub struct RenderContext {
    pub addresses: HashMap<String, IpAddr>,
    pub proxy_port: u16,
}

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Literal(String),
    Addr(&'a str),
    Port,
}

impl CommandTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn segments(&self) -> Result<Vec<Segment<'_>>> {
        let src = self.0.as_str();
        let mut out = Vec::new();
        let mut literal = String::new();
        let mut rest = src;

        while let Some(pos) = rest.find(['{', '}']) {
            literal.push_str(&rest[..pos]);
            let tail = &rest[pos..];

            if tail.starts_with("{{") {
                literal.push('{');
                rest = &tail[2..];
                continue;
            }
            if tail.starts_with("}}") {
                literal.push('}');
                rest = &tail[2..];
                continue;
            }
            if tail.starts_with('}') {
                return Err(ScenarioError::invalid(format!(
                    "unmatched '}}' in command template '{}'",
                    src
                )));
            }

            let end = tail.find('}').ok_or_else(|| {
                ScenarioError::invalid(format!("unterminated placeholder in '{}'", src))
            })?;
            let token = &tail[1..end];
            let segment = match token.split_once(':') {
                Some(("addr", host)) if !host.is_empty() => Segment::Addr(host),
                None if token == "port" => Segment::Port,
                _ => {
                    return Err(ScenarioError::invalid(format!(
                        "unknown placeholder '{{{}}}' in '{}'",
                        token, src
                    )))
                }
            };

            if !literal.is_empty() {
                out.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            out.push(segment);
            rest = &tail[end + 1..];
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            out.push(Segment::Literal(literal));
        }
        Ok(out)
    }

    /// Hosts referenced through `{addr:...}` placeholders
    pub fn referenced_hosts(&self) -> Result<Vec<&str>> {
        Ok(self
            .segments()?
            .into_iter()
            .filter_map(|s| match s {
                Segment::Addr(host) => Some(host),
                _ => None,
            })
            .collect())
    }

    pub fn render(&self, ctx: &RenderContext) -> Result<String> {
        let mut out = String::with_capacity(self.0.len());
        for segment in self.segments()? {
            match segment {
                Segment::Literal(text) => out.push_str(&text),
                Segment::Port => out.push_str(&ctx.proxy_port.to_string()),
                Segment::Addr(host) => {
                    let addr = ctx.addresses.get(host).ok_or_else(|| {
                        ScenarioError::invalid(format!("no address known for host '{}'", host))
                    })?;
                    out.push_str(&addr.to_string());
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommandTemplate {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Quote a single argument for `sh -c`
pub fn shell_quote(arg: &str) -> Cow<'_, str> {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}
