//! Pooled pipelined HTTP client.
//!
//! The pool owns a set of worker tasks, each driving one persistent
//! connection. Workers pull rendered requests off a shared bounded
//! ingress channel into a local batch and flush the batch as a single
//! pipelined exchange: write every request, then read every response in
//! the same order. A server closing the connection mid-batch is repaired
//! by resuming the remaining requests on a fresh connection.

use flume::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::fuzzer::FuzzStats;
use crate::{Error, FuzzResponse, Wrapper};

mod conn;
mod http;

use conn::Connection;

/// Default read/write deadline applied to every connection from the
/// moment it is dialed.
pub const DEFAULT_CONN_DEADLINE_SECS: u64 = 60;

/// Sizing and timeout knobs for the client pool.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Requests a worker accumulates before flushing a pipelined batch.
    /// Also the capacity of the ingress and egress channels.
    pub batch_size: usize,
    /// Number of concurrent client workers, one connection each.
    pub pool_size: usize,
    /// How long a dial may take before it is abandoned.
    pub dial_timeout: Duration,
    /// Absolute io deadline for each connection, reset on reconnect.
    pub conn_deadline: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            batch_size: 100,
            pool_size: 25,
            dial_timeout: Duration::from_secs(10),
            conn_deadline: Duration::from_secs(DEFAULT_CONN_DEADLINE_SECS),
        }
    }
}

/// A pool of pipelined client workers sharing one ingress and one egress
/// channel.
///
/// Requests sent to the ingress channel are fanned out to whichever
/// worker accepts them; responses appear on the egress channel in
/// arbitrary interleaving across workers, though always in batch order
/// within a single worker. Dropping the last ingress sender is the
/// shutdown signal: workers flush what they hold and exit, and the
/// egress channel disconnects only once every worker has finished.
pub struct ClientPool {
    config: PoolConfig,
    stats: Arc<FuzzStats>,
    ingress_tx: Option<Sender<Wrapper>>,
    ingress_rx: Option<Receiver<Wrapper>>,
    egress_tx: Option<Sender<FuzzResponse>>,
    egress_rx: Receiver<FuzzResponse>,
    workers: JoinSet<Result<(), Error>>,
    started: bool,
}

impl ClientPool {
    /// Initialise a pool without starting any workers.
    pub fn new(config: PoolConfig, stats: Arc<FuzzStats>) -> Result<Self, Error> {
        if config.batch_size == 0 {
            return Err(Error::Config("batch size must be at least 1".into()));
        }
        if config.pool_size == 0 {
            return Err(Error::Config("client pool size must be at least 1".into()));
        }
        let (ingress_tx, ingress_rx) = bounded(config.batch_size);
        let (egress_tx, egress_rx) = bounded(config.batch_size);
        Ok(ClientPool {
            config,
            stats,
            ingress_tx: Some(ingress_tx),
            ingress_rx: Some(ingress_rx),
            egress_tx: Some(egress_tx),
            egress_rx,
            workers: JoinSet::new(),
            started: false,
        })
    }

    /// Spawn every worker. Fails if the pool was already started; only
    /// one task may ever own a worker's connection, as the read/write
    /// sequencing of a pipelined batch depends on it.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Err(Error::Invariant("client pool already started".into()));
        }
        let ingress_rx = self
            .ingress_rx
            .take()
            .ok_or_else(|| Error::Invariant("client pool ingress already taken".into()))?;
        let egress_tx = self
            .egress_tx
            .take()
            .ok_or_else(|| Error::Invariant("client pool egress already taken".into()))?;

        for id in 0..self.config.pool_size {
            let worker = Worker {
                id,
                ingress: ingress_rx.clone(),
                egress: egress_tx.clone(),
                batch: Vec::with_capacity(self.config.batch_size),
                capacity: self.config.batch_size,
                dial_timeout: self.config.dial_timeout,
                conn_deadline: self.config.conn_deadline,
                conn: None,
                taint: true,
                stats: self.stats.clone(),
            };
            self.workers.spawn(worker.run());
        }
        self.started = true;
        debug!(
            pool_size = self.config.pool_size,
            batch_size = self.config.batch_size,
            "client pool started"
        );
        Ok(())
    }

    /// Hand out the single ingress sender. The caller closing (dropping)
    /// it tells the workers to finish up.
    pub fn take_ingress(&mut self) -> Result<Sender<Wrapper>, Error> {
        self.ingress_tx
            .take()
            .ok_or_else(|| Error::Invariant("client pool ingress already taken".into()))
    }

    /// Receiver side of the egress channel.
    pub fn egress(&self) -> Receiver<FuzzResponse> {
        self.egress_rx.clone()
    }

    /// Await the next worker to finish, if any are still running.
    pub async fn join_next(&mut self) -> Option<Result<(), Error>> {
        let joined = self.workers.join_next().await?;
        Some(match joined {
            Ok(result) => result,
            Err(e) => Err(Error::Invariant(format!("client worker task failed: {e}"))),
        })
    }

    /// Await every remaining worker, surfacing the first error.
    pub async fn join(&mut self) -> Result<(), Error> {
        while let Some(result) = self.join_next().await {
            result?;
        }
        Ok(())
    }
}

/// One client worker: a single connection, a single in-flight batch.
struct Worker {
    id: usize,
    ingress: Receiver<Wrapper>,
    egress: Sender<FuzzResponse>,
    batch: Vec<Wrapper>,
    capacity: usize,
    dial_timeout: Duration,
    conn_deadline: Duration,
    conn: Option<Connection>,
    taint: bool,
    stats: Arc<FuzzStats>,
}

impl Worker {
    async fn run(mut self) -> Result<(), Error> {
        debug!(worker = self.id, "client worker started");
        loop {
            match self.ingress.recv_async().await {
                Ok(wrapper) => {
                    self.batch.push(wrapper);
                    if self.batch.len() >= self.capacity {
                        self.flush().await?;
                    }
                }
                Err(_) => {
                    // Ingress closed: flush whatever is left and wind down.
                    self.flush().await?;
                    break;
                }
            }
        }
        debug!(worker = self.id, "client worker terminating");
        Ok(())
    }

    /// Process the whole batch as one pipelined exchange, reconnecting
    /// and resuming from the first unanswered request whenever the
    /// server closes the connection part-way through.
    async fn flush(&mut self) -> Result<(), Error> {
        if self.batch.is_empty() {
            return Ok(());
        }
        trace!(worker = self.id, occupancy = self.batch.len(), "flushing batch");

        let mut start = 0;
        let mut stalled_at = None;
        loop {
            let processed = self.process_batch(start).await?;
            if start + processed == self.batch.len() {
                self.batch.clear();
                return Ok(());
            }
            if processed == 0 {
                // A fresh connection that yields nothing will not yield
                // anything on the next attempt either.
                if stalled_at == Some(start) {
                    return Err(Error::Protocol(
                        "server closed the connection without responding".into(),
                    ));
                }
                stalled_at = Some(start);
            } else {
                stalled_at = None;
            }
            start += processed;
            debug!(
                worker = self.id,
                processed,
                remaining = self.batch.len() - start,
                "connection closed mid batch, resuming on a new connection"
            );
        }
    }

    /// One write-all-then-read-all pass over `batch[start..]`. Returns
    /// how many responses were observed; fewer than requested means the
    /// connection went away cleanly and the caller should resume.
    async fn process_batch(&mut self, start: usize) -> Result<usize, Error> {
        if start >= self.batch.len() {
            return Ok(0);
        }
        if self.taint || self.conn.is_none() {
            let target = &self.batch[start];
            let conn = Connection::open(
                target.scheme,
                &target.host,
                self.dial_timeout,
                self.conn_deadline,
            )
            .await?;
            self.stats.record_connection();
            self.conn = Some(conn);
            self.taint = false;
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::Invariant("worker lost its connection".into()));
        };

        for wrapper in &self.batch[start..] {
            conn.enqueue(wrapper);
        }
        conn.flush().await?;

        let mut processed = 0;
        for i in start..self.batch.len() {
            match conn.read_response().await? {
                None => {
                    // Clean close at a response boundary; the remainder
                    // of the batch is resumed by the caller.
                    self.taint = true;
                    return Ok(processed);
                }
                Some((raw, more)) => {
                    let size = raw.body.len();
                    let response = FuzzResponse {
                        req: self.batch[i].clone(),
                        status_line: raw.status_line,
                        status_code: raw.status_code,
                        body: raw.body,
                        size,
                        words: 0,
                        lines: 0,
                    };
                    self.egress
                        .send_async(response)
                        .await
                        .map_err(|_| Error::ChannelClosed("response channel".into()))?;
                    processed += 1;
                    if !more {
                        self.taint = true;
                        return Ok(processed);
                    }
                }
            }
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pool_rejects_zero_sizes() {
        let stats = Arc::new(FuzzStats::new());
        let config = PoolConfig {
            batch_size: 0,
            ..PoolConfig::default()
        };
        assert!(ClientPool::new(config, stats.clone()).is_err());

        let config = PoolConfig {
            pool_size: 0,
            ..PoolConfig::default()
        };
        assert!(ClientPool::new(config, stats).is_err());
    }

    #[tokio::test]
    async fn pool_start_is_single_shot() {
        let stats = Arc::new(FuzzStats::new());
        let mut pool = ClientPool::new(PoolConfig::default(), stats).unwrap();
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(Error::Invariant(_))));
    }
}
