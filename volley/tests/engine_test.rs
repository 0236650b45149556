#![allow(unused_crate_dependencies)]
#![allow(missing_docs)]
#![allow(dead_code)]
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use volley::client::PoolConfig;
use volley::payload::matcher::StatusCodeMatcher;
use volley::payload::renderer::{RawTemplateRenderer, UrlRenderer};
use volley::payload::NumericGenerator;
use volley::{
    Error, FuzzResponse, Fuzzer, Generator, RequestRenderer, ResponseMatcher, ResultSink, Scheme,
};

mod support;
use support::{Reply, ScriptedServer};

#[derive(Default)]
struct VecSink(Vec<FuzzResponse>);

#[async_trait]
impl ResultSink for VecSink {
    async fn deliver(&mut self, response: FuzzResponse) -> Result<(), Error> {
        self.0.push(response);
        Ok(())
    }
}

fn small_pool(batch_size: usize, pool_size: usize) -> PoolConfig {
    PoolConfig {
        batch_size,
        pool_size,
        dial_timeout: Duration::from_secs(5),
        conn_deadline: Duration::from_secs(30),
    }
}

fn default_matchers() -> Vec<Box<dyn ResponseMatcher>> {
    vec![Box::new(
        StatusCodeMatcher::parse("200,204,301,302,307,401,403").unwrap(),
    )]
}

#[tokio::test]
async fn happy_path_dispatches_every_tuple() {
    let server = ScriptedServer::start(
        Reply::Framed {
            status: "200 OK",
            body: "OK",
        },
        None,
    )
    .await;

    let url = format!("http://{}/item/FUZZ/FUZZ", server.addr);
    let renderer: Arc<dyn RequestRenderer> = Arc::new(UrlRenderer::parse(&url, "GET").unwrap());
    let generators: Vec<Box<dyn Generator>> = vec![
        Box::new(NumericGenerator::parse("0:1:1").unwrap()),
        Box::new(NumericGenerator::parse("10:11:1").unwrap()),
    ];

    let fuzzer = Fuzzer::new(small_pool(4, 1), renderer, generators, default_matchers()).unwrap();
    let stats = fuzzer.stats();
    let mut sink = VecSink::default();
    let report = fuzzer.run(&mut sink).await.unwrap();

    assert_eq!(report.requests, 2);
    assert_eq!(report.matched, 2);
    assert_eq!(stats.req_count(), 2);
    assert_eq!(sink.0.len(), 2);
    for response in &sink.0 {
        assert_eq!(response.status_code, 200);
        assert_eq!(response.status_line, "HTTP/1.1 200 OK");
        assert_eq!(response.size, 2);
        assert_eq!(response.body, b"OK");
        assert_eq!(response.words, 1);
        assert_eq!(response.lines, 0);
    }

    let tuples: Vec<Vec<String>> = sink.0.iter().map(|r| r.req.fuzz.clone()).collect();
    assert!(tuples.contains(&vec!["0".to_string(), "10".to_string()]));
    assert!(tuples.contains(&vec!["1".to_string(), "11".to_string()]));

    let requests = server.requests.lock().unwrap();
    assert!(requests
        .iter()
        .any(|r| r.starts_with("GET /item/0/10 HTTP/1.1\r\n")));
    assert!(requests
        .iter()
        .any(|r| r.starts_with("GET /item/1/11 HTTP/1.1\r\n")));
}

#[tokio::test]
async fn mid_batch_close_resumes_on_a_new_connection() {
    let server = ScriptedServer::start(
        Reply::Framed {
            status: "200 OK",
            body: "OK",
        },
        Some(2),
    )
    .await;

    let url = format!("http://{}/FUZZ", server.addr);
    let renderer: Arc<dyn RequestRenderer> = Arc::new(UrlRenderer::parse(&url, "GET").unwrap());
    let generators: Vec<Box<dyn Generator>> =
        vec![Box::new(NumericGenerator::parse("0:3:1").unwrap())];

    let fuzzer = Fuzzer::new(small_pool(4, 1), renderer, generators, default_matchers()).unwrap();
    let mut sink = VecSink::default();
    let report = fuzzer.run(&mut sink).await.unwrap();

    assert_eq!(report.requests, 4);
    assert_eq!(report.connections, 2);
    assert_eq!(server.conn_count.load(std::sync::atomic::Ordering::SeqCst), 2);

    // One worker, so responses arrive in batch order despite the
    // reconnect in the middle.
    let order: Vec<String> = sink.0.iter().map(|r| r.req.fuzz[0].clone()).collect();
    assert_eq!(order, ["0", "1", "2", "3"]);
}

#[tokio::test]
async fn unframed_body_is_captured_and_connection_replaced() {
    let server = ScriptedServer::start(Reply::Unframed { body: "stream-data" }, None).await;

    let url = format!("http://{}/FUZZ", server.addr);
    let renderer: Arc<dyn RequestRenderer> = Arc::new(UrlRenderer::parse(&url, "GET").unwrap());
    let generators: Vec<Box<dyn Generator>> =
        vec![Box::new(NumericGenerator::parse("0:1:1").unwrap())];

    let fuzzer = Fuzzer::new(
        small_pool(2, 1),
        renderer,
        generators,
        vec![Box::new(StatusCodeMatcher::parse("all").unwrap())],
    )
    .unwrap();
    let mut sink = VecSink::default();
    let report = fuzzer.run(&mut sink).await.unwrap();

    assert_eq!(report.requests, 2);
    // Every response ends the connection, so each request dials anew.
    assert_eq!(report.connections, 2);
    for response in &sink.0 {
        assert_eq!(response.body, b"stream-data");
        assert_eq!(response.size, 11);
    }
}

#[tokio::test]
async fn raw_template_renders_on_the_wire() {
    let server = ScriptedServer::start(
        Reply::Framed {
            status: "200 OK",
            body: "OK",
        },
        None,
    )
    .await;

    let template = format!("POST /x/FUZZ HTTP/1.1\nHost: {}\n\n", server.addr);
    let renderer: Arc<dyn RequestRenderer> =
        Arc::new(RawTemplateRenderer::parse(&template, Scheme::Http).unwrap());
    let generators: Vec<Box<dyn Generator>> =
        vec![Box::new(NumericGenerator::parse("0:1:1").unwrap())];

    let fuzzer = Fuzzer::new(
        small_pool(2, 1),
        renderer,
        generators,
        vec![Box::new(StatusCodeMatcher::parse("all").unwrap())],
    )
    .unwrap();
    let mut sink = VecSink::default();
    let report = fuzzer.run(&mut sink).await.unwrap();

    assert_eq!(report.requests, 2);
    let requests = server.requests.lock().unwrap();
    assert!(requests.iter().any(|r| r.starts_with("POST /x/0 HTTP/1.1\r\n")));
    assert!(requests.iter().any(|r| r.starts_with("POST /x/1 HTTP/1.1\r\n")));
}

#[tokio::test]
async fn matcher_filters_without_affecting_counts() {
    let server = ScriptedServer::start(
        Reply::Framed {
            status: "404 Not Found",
            body: "nope",
        },
        None,
    )
    .await;

    let url = format!("http://{}/FUZZ", server.addr);
    let generators: Vec<Box<dyn Generator>> =
        vec![Box::new(NumericGenerator::parse("0:4:1").unwrap())];
    let renderer: Arc<dyn RequestRenderer> = Arc::new(UrlRenderer::parse(&url, "GET").unwrap());

    let fuzzer = Fuzzer::new(
        small_pool(5, 1),
        renderer.clone(),
        generators,
        vec![Box::new(StatusCodeMatcher::parse("200").unwrap())],
    )
    .unwrap();
    let mut sink = VecSink::default();
    let report = fuzzer.run(&mut sink).await.unwrap();

    // Nothing matched, but every response was still observed.
    assert_eq!(report.requests, 5);
    assert_eq!(report.matched, 0);
    assert!(sink.0.is_empty());

    // The wildcard matcher reports everything.
    let generators: Vec<Box<dyn Generator>> =
        vec![Box::new(NumericGenerator::parse("0:4:1").unwrap())];
    let fuzzer = Fuzzer::new(
        small_pool(5, 1),
        renderer,
        generators,
        vec![Box::new(StatusCodeMatcher::parse("all").unwrap())],
    )
    .unwrap();
    let mut sink = VecSink::default();
    let report = fuzzer.run(&mut sink).await.unwrap();
    assert_eq!(report.requests, 5);
    assert_eq!(report.matched, 5);
}

#[tokio::test]
async fn multi_worker_pool_reaches_completion() {
    let server = ScriptedServer::start(
        Reply::Framed {
            status: "200 OK",
            body: "OK",
        },
        None,
    )
    .await;

    let url = format!("http://{}/FUZZ", server.addr);
    let renderer: Arc<dyn RequestRenderer> = Arc::new(UrlRenderer::parse(&url, "GET").unwrap());
    let generators: Vec<Box<dyn Generator>> =
        vec![Box::new(NumericGenerator::parse("0:49:1").unwrap())];

    let fuzzer = Fuzzer::new(
        small_pool(10, 4),
        renderer,
        generators,
        vec![Box::new(StatusCodeMatcher::parse("all").unwrap())],
    )
    .unwrap();
    let mut sink = VecSink::default();
    let report = fuzzer.run(&mut sink).await.unwrap();

    assert_eq!(report.requests, 50);
    assert_eq!(report.matched, 50);
    assert_eq!(sink.0.len(), 50);

    // No ordering is promised across workers; every tuple must still
    // arrive exactly once.
    let mut seen: Vec<u32> = sink
        .0
        .iter()
        .map(|r| r.req.fuzz[0].parse::<u32>().unwrap())
        .collect();
    seen.sort_unstable();
    let expected: Vec<u32> = (0..50).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn dial_failure_aborts_the_run() {
    // Nothing listens on this port.
    let renderer: Arc<dyn RequestRenderer> =
        Arc::new(UrlRenderer::parse("http://127.0.0.1:1/FUZZ", "GET").unwrap());
    let generators: Vec<Box<dyn Generator>> =
        vec![Box::new(NumericGenerator::parse("0:1:1").unwrap())];

    let fuzzer = Fuzzer::new(
        small_pool(2, 1),
        renderer,
        generators,
        vec![Box::new(StatusCodeMatcher::parse("all").unwrap())],
    )
    .unwrap();
    let mut sink = VecSink::default();
    let result = fuzzer.run(&mut sink).await;
    assert!(matches!(result, Err(Error::Transport { .. })));
}
