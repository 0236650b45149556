//! Request rendering: turning a fuzz tuple into exact on-wire bytes.
//!
//! The token `FUZZ` marks substitution points. A single-element tuple
//! replaces every occurrence; a longer tuple consumes one occurrence per
//! element, in order.

use tracing::debug;

use crate::{Error, RequestRenderer, Scheme, Wrapper};

const FUZZ_TOKEN: &str = "FUZZ";

/// Renders `GET`-style requests built from a target URL.
///
/// The request line, `Host` header and terminating blank line are
/// constructed from the parsed URL; substitution applies to the path.
pub struct UrlRenderer {
    scheme: Scheme,
    host: String,
    authority: String,
    path: String,
    method: String,
}

impl UrlRenderer {
    /// Parse a target URL of the form `scheme://host[:port][/path]`.
    pub fn parse(url: &str, method: &str) -> Result<Self, Error> {
        let (scheme_str, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("url [{url}] must include a scheme")))?;
        let scheme: Scheme = scheme_str.parse()?;

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, format!("/{path}")),
            None => (rest, "/".to_string()),
        };
        if authority.is_empty() {
            return Err(Error::Config(format!("url [{url}] is missing a host")));
        }

        Ok(UrlRenderer {
            scheme,
            host: resolve_host(authority, scheme),
            authority: authority.to_string(),
            path,
            method: method.to_string(),
        })
    }
}

impl RequestRenderer for UrlRenderer {
    fn render(&self, fuzz: &[String]) -> Result<Wrapper, Error> {
        if fuzz.is_empty() {
            return Err(Error::Invariant("empty fuzz tuple at render time".into()));
        }
        let path = substitute(&self.path, fuzz);
        let request = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\n\r\n",
            self.method, path, self.authority
        );
        Ok(Wrapper {
            scheme: self.scheme,
            host: self.host.clone(),
            fuzz: fuzz.to_vec(),
            request: request.into_bytes(),
        })
    }
}

/// Renders requests from a caller-supplied raw HTTP template.
///
/// Substitution runs over the entire template, headers included, so
/// header values are fuzzable just like path segments.
pub struct RawTemplateRenderer {
    template: String,
    scheme: Scheme,
    host: String,
}

impl RawTemplateRenderer {
    /// Validate and normalise a raw request template.
    ///
    /// Bare `\n` line endings are rewritten to `\r\n`, the request line
    /// must carry `method path version`, and a `Host` header is
    /// required to know where to dial.
    pub fn parse(template: &str, scheme: Scheme) -> Result<Self, Error> {
        let normalized = normalize_line_endings(template);

        let first_line = normalized
            .split("\r\n")
            .next()
            .unwrap_or_default()
            .to_string();
        let mut parts = first_line.split_whitespace();
        let (method, path, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(p), Some(v)) => (m, p, v),
            _ => {
                return Err(Error::Config(format!(
                    "request template line [{first_line}] is not `method path version`"
                )))
            }
        };
        if !version.starts_with("HTTP/") {
            return Err(Error::Config(format!(
                "request template version [{version}] is not an HTTP version"
            )));
        }

        let host_value = normalized
            .split("\r\n")
            .skip(1)
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim().eq_ignore_ascii_case("host").then(|| value.trim())
            })
            .ok_or_else(|| Error::Config("request template is missing a Host header".into()))?;

        debug!(method, path, host = host_value, "parsed request template");
        let host = resolve_host(host_value, scheme);

        // Requests without the closing blank line would run together on
        // the wire.
        let template = if normalized.ends_with("\r\n\r\n") {
            normalized
        } else if normalized.ends_with("\r\n") {
            format!("{normalized}\r\n")
        } else {
            format!("{normalized}\r\n\r\n")
        };

        Ok(RawTemplateRenderer {
            template,
            scheme,
            host,
        })
    }
}

impl RequestRenderer for RawTemplateRenderer {
    fn render(&self, fuzz: &[String]) -> Result<Wrapper, Error> {
        if fuzz.is_empty() {
            return Err(Error::Invariant("empty fuzz tuple at render time".into()));
        }
        let rendered = substitute(&self.template, fuzz);
        Ok(Wrapper {
            scheme: self.scheme,
            host: self.host.clone(),
            fuzz: fuzz.to_vec(),
            request: rendered.into_bytes(),
        })
    }
}

/// Append the scheme's default port when the authority does not name one.
fn resolve_host(authority: &str, scheme: Scheme) -> String {
    if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{authority}:{}", scheme.default_port())
    }
}

fn normalize_line_endings(template: &str) -> String {
    template.replace("\r\n", "\n").replace('\n', "\r\n")
}

fn substitute(template: &str, fuzz: &[String]) -> String {
    if fuzz.len() == 1 {
        return template.replace(FUZZ_TOKEN, &fuzz[0]);
    }
    let mut out = template.to_string();
    let mut search_from = 0;
    for value in fuzz {
        match out[search_from..].find(FUZZ_TOKEN) {
            Some(offset) => {
                let pos = search_from + offset;
                out.replace_range(pos..pos + FUZZ_TOKEN.len(), value);
                search_from = pos + value.len();
            }
            None => break,
        }
    }
    out
}
