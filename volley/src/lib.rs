//! Fast HTTP/1.1 fuzzing engine built on request pipelining
//!
//! Provides a library for running high-volume templated HTTP requests
//! against a single endpoint. A pool of client workers keeps persistent
//! connections open and sends requests in pipelined batches, reading the
//! responses back in order, which sustains request rates well beyond a
//! request-per-round-trip client.
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod client;
pub mod fuzzer;
pub mod payload;

pub use fuzzer::{FuzzReport, FuzzStats, Fuzzer, StatsSnapshot};

/// URL scheme of a fuzzing target. Decides the default port and whether
/// the client performs a TLS handshake after dialing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Scheme {
    /// Plain TCP transport, port 80 unless given explicitly.
    Http,
    /// TLS transport, port 443 unless given explicitly.
    #[default]
    Https,
}

impl Scheme {
    /// Port used when the target authority does not carry one.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(Error::Config(format!(
                "unsupported scheme [{other}], expected http or https"
            ))),
        }
    }
}

/// A fully rendered request plus the routing metadata needed to deliver it.
///
/// Wrappers are produced by a [`RequestRenderer`], delivered to exactly one
/// client worker, and carried by value inside the matching [`FuzzResponse`]
/// for reporting.
#[derive(Clone, Debug)]
pub struct Wrapper {
    /// Transport scheme used to dial the target.
    pub scheme: Scheme,
    /// Resolved `hostname:port` authority to dial.
    pub host: String,
    /// Substitution values that produced this request, kept for reporting.
    pub fuzz: Vec<String>,
    /// Exact on-wire request bytes, CRLF terminated including the final
    /// blank line.
    pub request: Vec<u8>,
}

/// A single observed HTTP response paired with the request that caused it.
#[derive(Clone, Debug)]
pub struct FuzzResponse {
    /// The originating request wrapper.
    pub req: Wrapper,
    /// Full status line as received, e.g. `HTTP/1.1 200 OK`.
    pub status_line: String,
    /// Parsed numeric status code.
    pub status_code: u16,
    /// Captured response body bytes.
    pub body: Vec<u8>,
    /// Number of body bytes captured.
    pub size: usize,
    /// Whitespace-separated token count of the body.
    pub words: usize,
    /// Newline count of the body.
    pub lines: usize,
}

impl FuzzResponse {
    /// Fill in the derived `words` and `lines` counters from the body.
    pub fn count_body_stats(&mut self) {
        self.lines = self.body.iter().filter(|b| **b == b'\n').count();
        self.words = String::from_utf8_lossy(&self.body).split_whitespace().count();
    }
}

/// A finite, single-pass producer of payload values.
///
/// `generate` yields the next value together with a flag telling whether
/// more values remain. Once the flag comes back `false` the generator is
/// exhausted and must not be advanced again; the tuple driver upholds that
/// contract for every generator it owns.
#[async_trait]
pub trait Generator: Send {
    /// Produce the next payload value and whether another one exists.
    async fn generate(&mut self) -> (String, bool);

    /// Release any resource held by the generator. Called once after the
    /// final value has been consumed.
    async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Renders a fuzz tuple into an on-wire request [`Wrapper`].
pub trait RequestRenderer: Send + Sync {
    /// Substitute the tuple into the template and produce the wrapper.
    /// Fails if the tuple is empty.
    fn render(&self, fuzz: &[String]) -> Result<Wrapper, Error>;
}

/// Predicate selecting which responses reach the result sink.
///
/// Matchers are infallible at steady state; anything that can go wrong is
/// surfaced when the matcher is constructed.
pub trait ResponseMatcher: Send + Sync {
    /// Whether the response should be reported.
    fn matches(&self, response: &FuzzResponse) -> bool;
}

/// Destination for responses accepted by a [`ResponseMatcher`].
#[async_trait]
pub trait ResultSink: Send {
    /// Deliver one matched response.
    async fn deliver(&mut self, response: FuzzResponse) -> Result<(), Error>;
}

/// Enum to capture errors occurring throughout the fuzzing pipeline.
///
/// Uses `thiserror` for ergonomic error handling with a proper
/// `std::error::Error` implementation.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid generator, matcher or renderer specification, or a missing
    /// required input. Reported before the run starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dial, TLS, read or write failure on a live connection. A clean
    /// end-of-stream between pipelined responses is not a transport error;
    /// workers repair those by reconnecting.
    #[error("Transport error while {context}: {source}")]
    Transport {
        /// Operation that failed, e.g. `dialing example.com:443`.
        context: String,
        /// Underlying io error.
        #[source]
        source: std::io::Error,
    },

    /// The peer sent bytes that do not parse as an HTTP/1.1 response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An internal invariant was broken, such as restarting a running
    /// pool or observing a closed channel with work still outstanding.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// A send on an internal channel found the other side gone.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl Error {
    pub(crate) fn transport(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Transport {
            context: context.into(),
            source,
        }
    }
}
