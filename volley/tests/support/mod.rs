//! Scripted HTTP server for driving the engine end to end.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// How the server answers each request it receives.
#[derive(Clone, Copy)]
pub enum Reply {
    /// Status + body with a Content-Length header and
    /// `Connection: keep-alive`, so pipelining is sustained.
    Framed {
        status: &'static str,
        body: &'static str,
    },
    /// Status + body with no framing headers at all; the connection is
    /// closed right after the write, one request per connection.
    Unframed { body: &'static str },
}

/// A local server that answers with a fixed script and records what it
/// saw.
pub struct ScriptedServer {
    pub addr: SocketAddr,
    /// Connections accepted so far.
    pub conn_count: Arc<AtomicUsize>,
    /// Raw request text in arrival order.
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl ScriptedServer {
    /// Bind on an ephemeral port and start serving.
    ///
    /// When `close_after` is set, the first connection is shut down
    /// abruptly after that many responses; every later connection
    /// serves without limit.
    pub async fn start(reply: Reply, close_after: Option<usize>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conn_count = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let accepted = conn_count.clone();
        let seen = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let conn_index = accepted.fetch_add(1, Ordering::SeqCst);
                let limit = match close_after {
                    Some(limit) if conn_index == 0 => limit,
                    _ => usize::MAX,
                };
                tokio::spawn(handle_conn(stream, reply, limit, seen.clone()));
            }
        });

        ScriptedServer {
            addr,
            conn_count,
            requests,
        }
    }
}

async fn handle_conn(
    mut stream: TcpStream,
    reply: Reply,
    limit: usize,
    requests: Arc<Mutex<Vec<String>>>,
) {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 4096];
    let mut served = 0usize;
    loop {
        while let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            let raw: Vec<u8> = buf.drain(..pos + 4).collect();
            requests
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&raw).into_owned());

            match reply {
                Reply::Framed { status, body } => {
                    let response = format!(
                        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{body}",
                        body.len()
                    );
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                    served += 1;
                    if served >= limit {
                        let _ = stream.shutdown().await;
                        return;
                    }
                }
                Reply::Unframed { body } => {
                    let response = format!("HTTP/1.1 200 OK\r\n\r\n{body}");
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                    return;
                }
            }
        }

        match stream.read(&mut tmp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
