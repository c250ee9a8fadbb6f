//! Scripted RESP server on a loopback socket, for tests

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::ha::endpoint::Endpoint;
use crate::protocol::{Parser, RespValue};

type Writer = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

struct ServerState {
    /// Replies by upper-cased command name plus verbatim arguments
    script: Mutex<HashMap<String, RespValue>>,
    received: Mutex<Vec<String>>,
    subscribers: Mutex<Vec<Writer>>,
    connections: AtomicUsize,
    password: Mutex<Option<String>>,
}

pub struct FakeServer {
    endpoint: Endpoint,
    state: Arc<ServerState>,
    accept: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(ServerState {
            script: Mutex::new(HashMap::from([(
                "PING".to_string(),
                RespValue::simple("PONG"),
            )])),
            received: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            password: Mutex::new(None),
        });

        let shared = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, shared.clone()));
            }
        });

        Self {
            endpoint: Endpoint::new("127.0.0.1", port),
            state,
            accept,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port()
    }

    /// Answer `command` (e.g. `"GET k"`, `"SENTINEL MASTERS"`) with `reply`
    pub fn script(&self, command: &str, reply: RespValue) {
        self.state.script.lock().insert(command.to_string(), reply);
    }

    pub fn require_password(&self, password: &str) {
        *self.state.password.lock() = Some(password.to_string());
    }

    pub fn received(&self) -> Vec<String> {
        self.state.received.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.subscribers.lock().len()
    }

    /// Push a `message` to every subscribed connection
    pub async fn publish(&self, channel: &str, data: &str) {
        let frame = RespValue::array(vec![
            RespValue::bulk_string("message"),
            RespValue::bulk_string(channel),
            RespValue::bulk_string(data),
        ])
        .serialize();
        let subscribers = self.state.subscribers.lock().clone();
        for writer in subscribers {
            let _ = writer.lock().await.write_all(&frame).await;
        }
    }

    /// Close every subscribed connection
    pub async fn kick_subscribers(&self) {
        let subscribers: Vec<Writer> = self.state.subscribers.lock().drain(..).collect();
        for writer in subscribers {
            let _ = writer.lock().await.shutdown().await;
        }
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

fn words(command: &RespValue) -> Vec<String> {
    command
        .as_array()
        .unwrap_or_default()
        .iter()
        .filter_map(|a| a.as_str().map(str::to_string))
        .collect()
}

async fn serve(stream: TcpStream, state: Arc<ServerState>) {
    let (mut reader, writer) = stream.into_split();
    let writer: Writer = Arc::new(tokio::sync::Mutex::new(writer));
    let mut buf = BytesMut::with_capacity(4096);
    let mut authenticated = state.password.lock().is_none();

    loop {
        let command = match Parser::parse(&mut buf) {
            Ok(Some(command)) => command,
            Ok(None) => match reader.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            },
            Err(_) => return,
        };

        let mut args = words(&command);
        if args.is_empty() {
            continue;
        }
        args[0] = args[0].to_uppercase();
        let line = args.join(" ");
        state.received.lock().push(line.clone());

        let replies = match args[0].as_str() {
            "AUTH" => {
                let expected = state.password.lock().clone();
                if args.last() == expected.as_ref() {
                    authenticated = true;
                    vec![RespValue::simple("OK")]
                } else {
                    vec![RespValue::error("WRONGPASS invalid password")]
                }
            }
            _ if !authenticated => vec![RespValue::error("NOAUTH Authentication required.")],
            "SELECT" => vec![RespValue::simple("OK")],
            "SUBSCRIBE" => {
                state.subscribers.lock().push(writer.clone());
                args[1..]
                    .iter()
                    .enumerate()
                    .map(|(i, channel)| {
                        RespValue::array(vec![
                            RespValue::bulk_string("subscribe"),
                            RespValue::bulk_string(channel),
                            RespValue::Integer(i as i64 + 1),
                        ])
                    })
                    .collect()
            }
            _ => {
                let script = state.script.lock();
                let reply = (1..=args.len())
                    .rev()
                    .find_map(|n| script.get(&args[..n].join(" ")).cloned())
                    .unwrap_or_else(|| RespValue::error(&format!("ERR unknown command '{}'", line)));
                vec![reply]
            }
        };

        let mut out = BytesMut::new();
        for reply in &replies {
            reply.write_to(&mut out);
        }
        if writer.lock().await.write_all(&out).await.is_err() {
            return;
        }
    }
}
