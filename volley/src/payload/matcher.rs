//! Response matching.

use rustc_hash::FxHashSet;

use crate::{Error, FuzzResponse, ResponseMatcher};

/// Matches responses by status code.
///
/// Built from a comma-separated spec where each element is a single code
/// (`404`) or a closed range (`500-599`). The literal `all` accepts every
/// response.
/// ```
/// use volley::payload::matcher::StatusCodeMatcher;
///
/// let matcher = StatusCodeMatcher::parse("200,300-302").unwrap();
/// ```
pub struct StatusCodeMatcher {
    codes: FxHashSet<u16>,
    match_all: bool,
}

impl StatusCodeMatcher {
    /// Expand a matcher spec into the set of accepted status codes.
    pub fn parse(spec: &str) -> Result<Self, Error> {
        if spec == "all" {
            return Ok(StatusCodeMatcher {
                codes: FxHashSet::default(),
                match_all: true,
            });
        }

        let mut codes = FxHashSet::default();
        for bit in spec.split(',') {
            match bit.split_once('-') {
                Some((start, end)) => {
                    let start = parse_code(start)?;
                    let end = parse_code(end)?;
                    if start > end {
                        return Err(Error::Config(format!(
                            "found invalid range [{bit}] for response matcher"
                        )));
                    }
                    codes.extend(start..=end);
                }
                None => {
                    let _ = codes.insert(parse_code(bit)?);
                }
            }
        }

        Ok(StatusCodeMatcher {
            codes,
            match_all: false,
        })
    }
}

fn parse_code(value: &str) -> Result<u16, Error> {
    value.trim().parse::<u16>().map_err(|_| {
        Error::Config(format!(
            "found invalid status code [{}] for response matcher",
            value.trim()
        ))
    })
}

impl ResponseMatcher for StatusCodeMatcher {
    fn matches(&self, response: &FuzzResponse) -> bool {
        self.match_all || self.codes.contains(&response.status_code)
    }
}
