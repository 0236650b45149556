//! Fast and flexible HTTP/1.1 fuzzer built on request pipelining
//!
//! Provides a cli for running high-volume fuzzing campaigns against a
//! single HTTP endpoint using pipelined persistent connections.
use volley::Error;
use volley_cmd::run;

#[tokio::main]
async fn main() -> Result<(), Error> {
    run().await
}
