//! In-memory transport and factory for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use tm_domain::config::{McpServerConfig, McpTransportKind};

use crate::connection::{Connection, ConnectionOptions};
use crate::error::McpError;
use crate::factory::ConnectionFactory;
use crate::protocol::{JsonRpcError, JsonRpcResponse, RequestId};
use crate::sink::TracingSink;
use crate::transport::{McpTransport, TransportError};

/// What the mock server does with one request.
pub(crate) enum Reply {
    Result(Value),
    Error(i64, String),
    /// Never answer.
    Silent,
    After(Duration, Box<Reply>),
}

impl Reply {
    pub(crate) fn text(text: &str) -> Self {
        Self::Result(json!({ "content": [{ "type": "text", "text": text }] }))
    }

    pub(crate) fn error(code: i64, message: &str) -> Self {
        Self::Error(code, message.to_owned())
    }

    pub(crate) fn after(delay: Duration, reply: Reply) -> Self {
        Self::After(delay, Box::new(reply))
    }

    pub(crate) fn tools(names: &[&str]) -> Self {
        let tools: Vec<Value> = names
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "description": format!("{name} tool"),
                    "inputSchema": { "type": "object", "properties": {} }
                })
            })
            .collect();
        Self::Result(json!({ "tools": tools }))
    }
}

type Handler = Box<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

pub(crate) struct MockTransport {
    kind: McpTransportKind,
    handler: Handler,
    inbound_tx: Mutex<Option<mpsc::Sender<String>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    sent: Mutex<Vec<String>>,
    alive: AtomicBool,
    shutdowns: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new(
        kind: McpTransportKind,
        handler: impl Fn(&str, &Value) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        let streaming = kind == McpTransportKind::Stdio;
        Arc::new(Self {
            kind,
            handler: Box::new(handler),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(streaming.then_some(rx)),
            sent: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
            shutdowns: AtomicUsize::new(0),
        })
    }

    /// A well-behaved stdio server named `server` exposing `tools`. Every
    /// call answers with the server's name.
    pub(crate) fn serving(server: &str, tools: &[&str]) -> Arc<Self> {
        Self::scripted(server, tools, Arc::new(ListScript::default()))
    }

    /// Like [`MockTransport::serving`], with `tools/list` answers shaped by
    /// `script`.
    pub(crate) fn scripted(server: &str, tools: &[&str], script: Arc<ListScript>) -> Arc<Self> {
        let server = server.to_owned();
        let tools: Vec<String> = tools.iter().map(|t| t.to_string()).collect();
        Self::new(McpTransportKind::Stdio, move |method, _params| match method {
            "initialize" => Reply::Result(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {} },
                "serverInfo": { "name": server, "version": "0.0.1" }
            })),
            "tools/list" => {
                if script.take_failure(&server) {
                    return Reply::error(-32603, "catalog not ready");
                }
                let names: Vec<&str> = tools.iter().map(String::as_str).collect();
                match script.delay(&server) {
                    Some(delay) => Reply::after(delay, Reply::tools(&names)),
                    None => Reply::tools(&names),
                }
            }
            "tools/call" => Reply::text(&server),
            _ => Reply::error(-32601, "method not found"),
        })
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub(crate) fn sent_methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|raw| serde_json::from_str::<Value>(raw).ok())
            .filter_map(|v| v["method"].as_str().map(str::to_owned))
            .collect()
    }

    pub(crate) fn sent_ids(&self) -> Vec<u64> {
        self.sent
            .lock()
            .iter()
            .filter_map(|raw| serde_json::from_str::<Value>(raw).ok())
            .filter_map(|v| v["id"].as_u64())
            .collect()
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Inject a raw line as if the server had written it.
    pub(crate) fn push_inbound(&self, line: &str) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.try_send(line.to_owned());
        }
    }

    /// Simulate the server's stdout closing.
    pub(crate) fn close_inbound(&self) {
        self.inbound_tx.lock().take();
    }

    /// Simulate a crashed server: sends fail and the stream closes.
    pub(crate) fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.close_inbound();
    }

    fn render(id: Value, reply: &Reply) -> Option<String> {
        let id: RequestId = serde_json::from_value(id).ok()?;
        let resp = match reply {
            Reply::Result(v) => JsonRpcResponse::success(id, v.clone()),
            Reply::Error(code, msg) => JsonRpcResponse::failure(id, JsonRpcError::new(*code, msg)),
            Reply::Silent | Reply::After(..) => return None,
        };
        serde_json::to_string(&resp).ok()
    }
}

#[async_trait]
impl McpTransport for MockTransport {
    fn kind(&self) -> McpTransportKind {
        self.kind
    }

    async fn send(&self, message: &str) -> Result<Option<String>, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        self.sent.lock().push(message.to_owned());

        let value: Value = serde_json::from_str(message)?;
        let (Some(method), Some(id)) = (value["method"].as_str(), value.get("id")) else {
            return Ok(None);
        };

        let mut reply = (self.handler)(method, &value["params"]);
        let mut delay = Duration::ZERO;
        while let Reply::After(d, inner) = reply {
            delay += d;
            reply = *inner;
        }
        if matches!(reply, Reply::Silent) && self.kind == McpTransportKind::Http {
            std::future::pending::<()>().await;
        }
        let line = Self::render(id.clone(), &reply);

        match self.kind {
            McpTransportKind::Http => {
                tokio::time::sleep(delay).await;
                Ok(line)
            }
            McpTransportKind::Stdio => {
                let tx = self.inbound_tx.lock().clone();
                if let (Some(line), Some(tx)) = (line, tx) {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(line).await;
                    });
                }
                Ok(None)
            }
        }
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<String>> {
        self.inbound_rx.lock().take()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self, _grace: Duration) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        self.close_inbound();
    }
}

/// Per-server `tools/list` behaviour, shared by every transport a
/// factory builds.
#[derive(Default)]
pub(crate) struct ListScript {
    failures: Mutex<HashMap<String, usize>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl ListScript {
    fn take_failure(&self, server: &str) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(server) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn delay(&self, server: &str) -> Option<Duration> {
        self.delays.lock().get(server).copied()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Builds connections over [`MockTransport::serving`] and remembers every
/// transport it handed out.
pub(crate) struct MockFactory {
    tools: HashMap<String, Vec<String>>,
    failing: Mutex<HashSet<String>>,
    built: Mutex<HashMap<String, Vec<Arc<MockTransport>>>>,
    builds: Mutex<HashMap<String, usize>>,
    lists: Arc<ListScript>,
}

impl MockFactory {
    pub(crate) fn new(servers: &[(&str, &[&str])]) -> Arc<Self> {
        Arc::new(Self {
            tools: servers
                .iter()
                .map(|(id, tools)| {
                    (id.to_string(), tools.iter().map(|t| t.to_string()).collect())
                })
                .collect(),
            failing: Mutex::new(HashSet::new()),
            built: Mutex::new(HashMap::new()),
            builds: Mutex::new(HashMap::new()),
            lists: Arc::new(ListScript::default()),
        })
    }

    /// Every later build of `id` fails to launch.
    pub(crate) fn fail_launch(&self, id: &str) {
        self.failing.lock().insert(id.to_owned());
    }

    /// The next `count` `tools/list` requests to `id` answer -32603.
    pub(crate) fn fail_lists(&self, id: &str, count: usize) {
        self.lists.failures.lock().insert(id.to_owned(), count);
    }

    /// `tools/list` answers from `id` arrive after `delay`.
    pub(crate) fn delay_lists(&self, id: &str, delay: Duration) {
        self.lists.delays.lock().insert(id.to_owned(), delay);
    }

    pub(crate) fn builds(&self, id: &str) -> usize {
        self.builds.lock().get(id).copied().unwrap_or(0)
    }

    /// The most recently built transport for `id`.
    pub(crate) fn transport(&self, id: &str) -> Arc<MockTransport> {
        self.built
            .lock()
            .get(id)
            .and_then(|v| v.last().cloned())
            .unwrap_or_else(|| panic!("no transport built for {id}"))
    }

    pub(crate) fn total_sends(&self) -> usize {
        self.built
            .lock()
            .values()
            .flatten()
            .map(|t| t.sent_count())
            .sum()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn build(&self, descriptor: &McpServerConfig) -> Result<Arc<Connection>, McpError> {
        *self.builds.lock().entry(descriptor.id.clone()).or_default() += 1;
        if self.failing.lock().contains(&descriptor.id) {
            return Err(McpError::Launch {
                server: descriptor.id.clone(),
                reason: "mock launch failure".into(),
            });
        }

        let names: Vec<&str> = self
            .tools
            .get(&descriptor.id)
            .map(|t| t.iter().map(String::as_str).collect())
            .unwrap_or_default();
        let transport = MockTransport::scripted(&descriptor.id, &names, self.lists.clone());
        self.built
            .lock()
            .entry(descriptor.id.clone())
            .or_default()
            .push(transport.clone());

        Ok(Arc::new(Connection::new(
            descriptor.clone(),
            transport,
            ConnectionOptions {
                request_timeout: Duration::from_secs(1),
                shutdown_grace: Duration::from_millis(10),
            },
            Arc::new(TracingSink),
        )))
    }
}
