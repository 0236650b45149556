//! Fuzzing run orchestration.
//!
//! The [`Fuzzer`] wires the payload generators, the request renderer and
//! the client pool together: a generation task renders tuples into the
//! pool's ingress channel while the controller drains the egress channel,
//! keeps the run counters and forwards matched responses to the sink.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::client::{ClientPool, PoolConfig};
use crate::payload::TupleDriver;
use crate::{Error, Generator, RequestRenderer, ResponseMatcher, ResultSink, Wrapper};

/// Shared run counters. Updated with atomic operations so the status
/// reporter can snapshot them from another task at any time.
pub struct FuzzStats {
    req_count: AtomicU64,
    conn_create_count: AtomicU64,
    started_at: Instant,
}

impl FuzzStats {
    /// Fresh counters; the elapsed clock starts now.
    pub fn new() -> Self {
        FuzzStats {
            req_count: AtomicU64::new(0),
            conn_create_count: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub(crate) fn record_response(&self) {
        let _ = self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection(&self) {
        let _ = self.conn_create_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of responses observed so far, matched or not.
    pub fn req_count(&self) -> u64 {
        self.req_count.load(Ordering::Relaxed)
    }

    /// Number of connections dialed so far.
    pub fn conn_create_count(&self) -> u64 {
        self.conn_create_count.load(Ordering::Relaxed)
    }

    /// Consistent point-in-time view of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            req_count: self.req_count(),
            conn_count: self.conn_create_count(),
            elapsed: self.started_at.elapsed(),
        }
    }
}

impl Default for FuzzStats {
    fn default() -> Self {
        Self::new()
    }
}

/// One sample of the run counters.
#[derive(Clone, Copy, Debug)]
pub struct StatsSnapshot {
    /// Responses observed.
    pub req_count: u64,
    /// Connections dialed.
    pub conn_count: u64,
    /// Time since the run was set up.
    pub elapsed: Duration,
}

impl StatsSnapshot {
    /// Requests per second over the whole run.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.req_count as f64 / secs
        } else {
            0.0
        }
    }
}

/// Final tally of a completed run.
#[derive(Clone, Copy, Debug)]
pub struct FuzzReport {
    /// Requests generated and answered.
    pub requests: u64,
    /// Responses accepted by a matcher and delivered to the sink.
    pub matched: u64,
    /// Connections dialed over the run.
    pub connections: u64,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

/// Coordinates payload generation, request dispatch and response
/// aggregation for one fuzzing run.
pub struct Fuzzer {
    pool_config: PoolConfig,
    renderer: Arc<dyn RequestRenderer>,
    driver: TupleDriver,
    matchers: Vec<Box<dyn ResponseMatcher>>,
    stats: Arc<FuzzStats>,
}

impl Fuzzer {
    /// Assemble a run. At least one generator and one matcher are
    /// required.
    pub fn new(
        pool_config: PoolConfig,
        renderer: Arc<dyn RequestRenderer>,
        generators: Vec<Box<dyn Generator>>,
        matchers: Vec<Box<dyn ResponseMatcher>>,
    ) -> Result<Self, Error> {
        if matchers.is_empty() {
            return Err(Error::Config(
                "at least one response matcher is required".into(),
            ));
        }
        let driver = TupleDriver::new(generators)?;
        Ok(Fuzzer {
            pool_config,
            renderer,
            driver,
            matchers,
            stats: Arc::new(FuzzStats::new()),
        })
    }

    /// Handle to the run counters, for status reporting.
    pub fn stats(&self) -> Arc<FuzzStats> {
        self.stats.clone()
    }

    /// Drive the run to completion, delivering matched responses to
    /// `sink`. Returns the final tally, or the first fatal error from a
    /// worker, the generator task or the sink.
    pub async fn run(self, sink: &mut dyn ResultSink) -> Result<FuzzReport, Error> {
        let Fuzzer {
            pool_config,
            renderer,
            driver,
            matchers,
            stats,
        } = self;

        let mut pool = ClientPool::new(pool_config, stats.clone())?;
        pool.start()?;
        let ingress = pool.take_ingress()?;
        let egress = pool.egress();

        let generated = Arc::new(AtomicU64::new(0));
        let done_generating = Arc::new(AtomicBool::new(false));
        let generator_task = tokio::spawn(generate(
            driver,
            renderer,
            ingress,
            generated.clone(),
            done_generating.clone(),
        ));

        let mut matched: u64 = 0;
        let mut workers_running = true;
        loop {
            if done_generating.load(Ordering::Acquire)
                && generated.load(Ordering::Acquire) == stats.req_count()
            {
                break;
            }
            tokio::select! {
                received = egress.recv_async() => match received {
                    Ok(mut response) => {
                        stats.record_response();
                        response.count_body_stats();
                        trace!(
                            status = response.status_code,
                            size = response.size,
                            "response received"
                        );
                        if matchers.iter().any(|m| m.matches(&response)) {
                            matched += 1;
                            sink.deliver(response).await?;
                        }
                    }
                    Err(_) => {
                        // Workers only drop their egress senders on exit,
                        // so a disconnect here with responses outstanding
                        // means a worker died. Surface its error.
                        if done_generating.load(Ordering::Acquire)
                            && generated.load(Ordering::Acquire) == stats.req_count()
                        {
                            break;
                        }
                        pool.join().await?;
                        return Err(Error::Invariant(
                            "response channel closed with requests outstanding".into(),
                        ));
                    }
                },
                joined = pool.join_next(), if workers_running => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => return Err(e),
                    None => workers_running = false,
                },
            }
        }

        match generator_task.await {
            Ok(result) => result?,
            Err(e) => {
                return Err(Error::Invariant(format!("generator task failed: {e}")));
            }
        }
        pool.join().await?;

        let snapshot = stats.snapshot();
        info!(
            requests = snapshot.req_count,
            matched,
            connections = snapshot.conn_count,
            "fuzzing run complete"
        );
        Ok(FuzzReport {
            requests: snapshot.req_count,
            matched,
            connections: snapshot.conn_count,
            elapsed: snapshot.elapsed,
        })
    }
}

/// Generation task: render tuples and feed the ingress channel until the
/// driver runs dry, then drop the sender to signal the workers.
async fn generate(
    mut driver: TupleDriver,
    renderer: Arc<dyn RequestRenderer>,
    ingress: flume::Sender<Wrapper>,
    generated: Arc<AtomicU64>,
    done_generating: Arc<AtomicBool>,
) -> Result<(), Error> {
    loop {
        let (tuple, has_more) = driver.next_tuple().await;
        let wrapper = renderer.render(&tuple)?;
        ingress
            .send_async(wrapper)
            .await
            .map_err(|_| Error::ChannelClosed("request channel".into()))?;
        let _ = generated.fetch_add(1, Ordering::Release);
        if !has_more {
            break;
        }
    }
    done_generating.store(true, Ordering::Release);
    let count = generated.load(Ordering::Acquire);
    debug!(generated = count, "payload generation complete");
    driver.close().await?;
    drop(ingress);
    Ok(())
}
