//! Payload sources feeding the fuzzing run.
//!
//! Two generator flavours are provided: numeric sequences parsed from a
//! compact `start:end:step:format` spec, and wordlists read one line per
//! call. The [`TupleDriver`] advances any number of generators in
//! lock-step to build the fuzz tuple for each request.

use async_trait::async_trait;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::warn;

use crate::{Error, Generator};

pub mod matcher;
pub mod renderer;

/// Formatted integer sequence generator.
///
/// Parsed from `start:end:step:format` where `step` defaults to 1 and
/// `format` to `%d`. Emits formatted values from `start` while the value
/// stays at or below `end`.
pub struct NumericGenerator {
    next: i64,
    end: i64,
    step: i64,
    format: NumericFormat,
}

impl NumericGenerator {
    /// Parse a generator spec such as `0:100:1:%03d`.
    pub fn parse(spec: &str) -> Result<Self, Error> {
        let bits: Vec<&str> = spec.split(':').collect();

        let start = parse_bound(get_or_default(&bits, 0, "0"))?;
        let end = parse_bound(get_or_default(&bits, 1, "0"))?;
        let step = parse_bound(get_or_default(&bits, 2, "1"))?;
        let format = NumericFormat::parse(get_or_default(&bits, 3, "%d"))?;

        if start < 0 || end < 0 {
            return Err(Error::Config(
                "negative values are not allowed for numeric generator".into(),
            ));
        }
        if start >= end {
            return Err(Error::Config(
                "invalid sequence for numeric generator".into(),
            ));
        }
        if step < 1 {
            return Err(Error::Config(
                "step must be at least 1 for numeric generator".into(),
            ));
        }

        Ok(NumericGenerator {
            next: start,
            end,
            step,
            format,
        })
    }

    fn done(&self) -> bool {
        self.next > self.end
    }
}

fn get_or_default<'a>(bits: &[&'a str], idx: usize, default: &'a str) -> &'a str {
    bits.get(idx).copied().unwrap_or(default)
}

fn parse_bound(value: &str) -> Result<i64, Error> {
    value
        .parse::<i64>()
        .map_err(|_| Error::Config(format!("invalid numeric generator value [{value}]")))
}

#[async_trait]
impl Generator for NumericGenerator {
    async fn generate(&mut self) -> (String, bool) {
        let current = self.format.render(self.next);
        self.next += self.step;
        (current, !self.done())
    }
}

#[derive(Clone, Copy)]
enum Verb {
    Decimal,
    HexLower,
    HexUpper,
    Octal,
    Binary,
}

/// A parsed printf-style verb with optional literal text around it.
/// Supports `%d`, width and zero-pad flags (`%5d`, `%03d`) and the
/// `%x`/`%X`/`%o`/`%b` radix verbs.
struct NumericFormat {
    prefix: String,
    suffix: String,
    pad_zero: bool,
    width: usize,
    verb: Verb,
}

impl NumericFormat {
    fn parse(format: &str) -> Result<Self, Error> {
        let pos = format.find('%').ok_or_else(|| {
            Error::Config(format!("numeric format [{format}] is missing a % verb"))
        })?;
        let prefix = format[..pos].to_string();
        let rest = &format[pos + 1..];

        let pad_zero = rest.starts_with('0');
        let rest = if pad_zero { &rest[1..] } else { rest };
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let width = if digits > 0 {
            rest[..digits]
                .parse::<usize>()
                .map_err(|_| Error::Config(format!("invalid width in numeric format [{format}]")))?
        } else {
            0
        };
        let rest = &rest[digits..];

        let mut chars = rest.chars();
        let verb = match chars.next() {
            Some('d') => Verb::Decimal,
            Some('x') => Verb::HexLower,
            Some('X') => Verb::HexUpper,
            Some('o') => Verb::Octal,
            Some('b') => Verb::Binary,
            _ => {
                return Err(Error::Config(format!(
                    "unsupported verb in numeric format [{format}]"
                )))
            }
        };
        let suffix = chars.as_str().to_string();
        if suffix.contains('%') {
            return Err(Error::Config(format!(
                "numeric format [{format}] may only contain one verb"
            )));
        }

        Ok(NumericFormat {
            prefix,
            suffix,
            pad_zero,
            width,
            verb,
        })
    }

    fn render(&self, value: i64) -> String {
        let w = self.width;
        let digits = match (self.verb, self.pad_zero) {
            (Verb::Decimal, true) => format!("{value:0w$}"),
            (Verb::Decimal, false) => format!("{value:w$}"),
            (Verb::HexLower, true) => format!("{value:0w$x}"),
            (Verb::HexLower, false) => format!("{value:w$x}"),
            (Verb::HexUpper, true) => format!("{value:0w$X}"),
            (Verb::HexUpper, false) => format!("{value:w$X}"),
            (Verb::Octal, true) => format!("{value:0w$o}"),
            (Verb::Octal, false) => format!("{value:w$o}"),
            (Verb::Binary, true) => format!("{value:0w$b}"),
            (Verb::Binary, false) => format!("{value:w$b}"),
        };
        format!("{}{}{}", self.prefix, digits, self.suffix)
    }
}

/// Wordlist generator reading one line per call from a file.
pub struct WordlistGenerator {
    lines: Lines<BufReader<File>>,
    current: Option<String>,
}

impl WordlistGenerator {
    /// Open `path` and read ahead one line. Fails when the file cannot
    /// be opened or holds no lines at all.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let display = path.as_ref().display().to_string();
        let file = File::open(path.as_ref())
            .await
            .map_err(|e| Error::Config(format!("{display}: {e}")))?;
        let mut lines = BufReader::new(file).lines();
        let first = lines
            .next_line()
            .await
            .map_err(|e| Error::Config(format!("{display}: {e}")))?;
        match first {
            Some(line) => Ok(WordlistGenerator {
                lines,
                current: Some(line),
            }),
            None => Err(Error::Config(format!("{display}: wordlist file is empty"))),
        }
    }
}

#[async_trait]
impl Generator for WordlistGenerator {
    async fn generate(&mut self) -> (String, bool) {
        let value = self.current.take().unwrap_or_default();
        self.current = match self.lines.next_line().await {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "wordlist read failed, ending the sequence");
                None
            }
        };
        let has_more = self.current.is_some();
        (value, has_more)
    }
}

/// Advances a set of generators in lock-step, producing one fuzz tuple
/// per call. The tuple stream ends as soon as any member generator is
/// exhausted; that terminal tuple is still valid and must be dispatched.
pub struct TupleDriver {
    generators: Vec<Box<dyn Generator>>,
}

impl TupleDriver {
    /// Build a driver over the given generators, in substitution order.
    pub fn new(generators: Vec<Box<dyn Generator>>) -> Result<Self, Error> {
        if generators.is_empty() {
            return Err(Error::Config(
                "at least one payload generator is required".into(),
            ));
        }
        Ok(TupleDriver { generators })
    }

    /// Number of generators, which is also the tuple arity.
    pub fn arity(&self) -> usize {
        self.generators.len()
    }

    /// Advance every generator once and collect the tuple. The boolean
    /// is the logical AND of the per-generator continuation flags.
    pub async fn next_tuple(&mut self) -> (Vec<String>, bool) {
        let mut values = Vec::with_capacity(self.generators.len());
        let mut has_more = true;
        for generator in &mut self.generators {
            let (value, more) = generator.generate().await;
            values.push(value);
            has_more &= more;
        }
        (values, has_more)
    }

    /// Close every generator, keeping the first failure.
    pub async fn close(&mut self) -> Result<(), Error> {
        let mut result = Ok(());
        for generator in &mut self.generators {
            if let Err(e) = generator.close().await {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}
