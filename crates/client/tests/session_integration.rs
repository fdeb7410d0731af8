//! End-to-end tests for the ichibot client.
//!
//! These tests run the client against an in-process WebSocket server that
//! speaks the ichibot JSON-RPC dialect:
//! - Login handshake and context tracking
//! - Init-script persistence after successful commands
//! - Forced disconnects and reconnects
//! - The shutdown drain

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use client::config::Config;
use client::storage::StorageResult;
use client::{
    Client, CredentialStore, InitScript, KeyValueStore, MemoryOutput, MemoryStore, ScriptStore,
};
use futures_util::{SinkExt, StreamExt};
use protocol::{CredentialProfile, Exchange};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

// =============================================================================
// Mock server
// =============================================================================

#[derive(Default)]
struct ServerState {
    requests: Mutex<Vec<Value>>,
    exchanges: Mutex<Vec<String>>,
    connections: AtomicUsize,
    reject_hello: AtomicBool,
    /// Leave `ping` unanswered.
    silent: AtomicBool,
    /// Close the socket right after each pushed frame.
    hang_up_after_push: AtomicBool,
    /// Version reported in `hello`, "1.0" when unset.
    version: Mutex<Option<String>>,
}

struct MockServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    push: broadcast::Sender<String>,
    drop_all: broadcast::Sender<()>,
}

impl MockServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());
        let (push, _) = broadcast::channel(16);
        let (drop_all, _) = broadcast::channel(4);

        let server = Self {
            addr,
            state: state.clone(),
            push: push.clone(),
            drop_all: drop_all.clone(),
        };

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(
                    stream,
                    state.clone(),
                    push.subscribe(),
                    drop_all.subscribe(),
                ));
            }
        });

        server
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    fn requests(&self, method: &str) -> Vec<Value> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r["method"] == method)
            .cloned()
            .collect()
    }

    fn request_count(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }

    fn force_disconnect(&self, reason: &str) {
        let frame = json!({
            "notification": "instruction",
            "params": {"instruction": "force-disconnect", "reason": reason},
        });
        self.push.send(frame.to_string()).unwrap();
    }

    fn push(&self, frame: Value) {
        self.push.send(frame.to_string()).unwrap();
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<ServerState>,
    mut push: broadcast::Receiver<String>,
    mut drop_all: broadcast::Receiver<()>,
) {
    let capture = state.clone();
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if let Some(exchange) = request.headers().get("exchange") {
            capture
                .exchanges
                .lock()
                .unwrap()
                .push(exchange.to_str().unwrap_or_default().to_string());
        }
        Ok(response)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                if text == "ping" {
                    if !state.silent.load(Ordering::SeqCst) {
                        let _ = sink.send(Message::Text("pong".into())).await;
                    }
                    continue;
                }
                let request: Value = serde_json::from_str(&text).unwrap();
                state.requests.lock().unwrap().push(request.clone());
                for reply in replies(&state, &request) {
                    if sink.send(Message::Text(reply.to_string())).await.is_err() {
                        return;
                    }
                }
            }
            Ok(text) = push.recv() => {
                let _ = sink.send(Message::Text(text)).await;
                if state.hang_up_after_push.load(Ordering::SeqCst) {
                    let _ = sink.close().await;
                    return;
                }
            }
            _ = drop_all.recv() => return,
        }
    }
}

fn replies(state: &ServerState, request: &Value) -> Vec<Value> {
    let Some(id) = request.get("id").cloned() else {
        return Vec::new();
    };
    let result = |result: Value| json!({"jsonrpc": "2.0", "result": result, "id": id});

    match request["method"].as_str().unwrap_or_default() {
        "hello" if state.reject_hello.load(Ordering::SeqCst) => vec![json!({
            "jsonrpc": "2.0",
            "error": {"code": 401, "message": "invalid api key"},
            "id": id,
        })],
        "hello" => vec![
            result(json!({
                "instanceStarted": true,
                "version": state.version.lock().unwrap().clone().unwrap_or_else(|| "1.0".into()),
            })),
            json!({"notification": "context", "params": {"currentInstrument": "BTC-PERP"}}),
        ],
        "rawcmd" => vec![result(json!({"success": true, "message": "done"}))],
        "getCompletions" => vec![result(json!({"completions": [["buy", "sell"], "b"]}))],
        "bye" | "reloadInit" => vec![result(json!({"ok": true}))],
        _ => vec![result(json!({}))],
    }
}

// =============================================================================
// Client fixture
// =============================================================================

type ScriptWrite = (Exchange, String, Vec<String>, Option<String>);

#[derive(Default)]
struct RecordingScripts {
    writes: Mutex<Vec<ScriptWrite>>,
}

impl ScriptStore for RecordingScripts {
    fn read(&self, _exchange: Exchange) -> StorageResult<InitScript> {
        Ok(InitScript {
            init_lines: vec!["set timeout 30".to_string()],
        })
    }

    fn write(
        &self,
        exchange: Exchange,
        scope: &str,
        match_tokens: &[String],
        line: Option<&str>,
    ) -> StorageResult<()> {
        self.writes.lock().unwrap().push((
            exchange,
            scope.to_string(),
            match_tokens.to_vec(),
            line.map(str::to_string),
        ));
        Ok(())
    }
}

struct Harness {
    server: MockServer,
    client: Arc<Client>,
    output: Arc<MemoryOutput>,
    scripts: Arc<RecordingScripts>,
    _tasks: client::ClientTasks,
}

async fn harness(profiles: &[(&str, Exchange)]) -> Harness {
    harness_with(profiles, |_| {}).await
}

async fn harness_with(profiles: &[(&str, Exchange)], tune: impl FnOnce(&mut Config)) -> Harness {
    let server = MockServer::start().await;

    let mut config = Config::default();
    config.server.url = server.url();
    config.connection.initial_backoff_ms = 50;
    config.connection.max_backoff_ms = 200;
    config.connection.poke_interval_ms = 3_600_000;
    config.connection.login_timeout_ms = 5_000;
    config.connection.close_timeout_ms = 1_000;
    tune(&mut config);

    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let credentials = CredentialStore::new(kv.clone());
    for (name, exchange) in profiles {
        credentials
            .save(&CredentialProfile::new(*exchange, "key", "secret", *name))
            .unwrap();
    }

    let output = Arc::new(MemoryOutput::new());
    let scripts = Arc::new(RecordingScripts::default());
    let client = Client::new(&config, kv, scripts.clone(), output.clone()).unwrap();
    let tasks = client.start().unwrap();

    Harness {
        server,
        client,
        output,
        scripts,
        _tasks: tasks,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// Login and commands
// =============================================================================

#[tokio::test]
async fn test_login_runs_handshake_with_init_lines() {
    let h = harness(&[("default", Exchange::Binance)]).await;

    let outcome = h.client.process_command("login default").await;
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(h.client.active_logins(), vec!["default".to_string()]);
    assert!(h.output.contains("Login steps done."));

    let hello = h.server.requests("hello");
    assert_eq!(hello.len(), 1);
    assert_eq!(hello[0]["params"]["name"], "default");
    assert_eq!(hello[0]["params"]["version"], "1.0");
    assert_eq!(hello[0]["params"]["initLines"], json!(["set timeout 30"]));
    assert_eq!(hello[0]["params"]["auth"]["apiKey"], "key");
    assert_eq!(
        h.server.state.exchanges.lock().unwrap().as_slice(),
        ["binance"]
    );
}

#[tokio::test]
async fn test_successful_alias_is_persisted_under_current_instrument() {
    let h = harness(&[("default", Exchange::Binance)]).await;
    assert!(h.client.process_command("login default").await.success);
    wait_until(|| h.client.context().is_some()).await;
    assert_eq!(h.client.prompt_text(), "[BTC-PERP] > ");

    let outcome = h.client.process_command("alias foo: bar").await;
    assert!(outcome.success);
    assert_eq!(outcome.message.as_deref(), Some("done"));

    let writes = h.scripts.writes.lock().unwrap().clone();
    assert_eq!(
        writes,
        vec![(
            Exchange::Binance,
            "BTC-PERP".to_string(),
            vec!["alias".to_string(), "foo".to_string()],
            Some("alias foo: bar".to_string()),
        )]
    );

    let rawcmd = h.server.requests("rawcmd");
    assert_eq!(rawcmd.len(), 1);
    assert_eq!(rawcmd[0]["params"]["cmd"], "alias foo: bar");
    assert_eq!(rawcmd[0]["params"]["context"]["currentInstrument"], "BTC-PERP");
    assert!(rawcmd[0]["params"]["clientId"].is_string());
    assert!(rawcmd[0]["params"].get("debug").is_none());
}

#[tokio::test]
async fn test_plain_command_is_not_persisted() {
    let h = harness(&[("default", Exchange::Binance)]).await;
    assert!(h.client.process_command("login default").await.success);
    wait_until(|| h.client.context().is_some()).await;

    assert!(h.client.process_command("buy 1").await.success);
    assert!(h.scripts.writes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_comment_sends_nothing() {
    let h = harness(&[("default", Exchange::Binance)]).await;
    assert!(h.client.process_command("login default").await.success);
    let before = h.server.request_count();

    let outcome = h.client.process_command("# buy 100").await;
    assert!(outcome.success);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.server.request_count(), before);
}

#[tokio::test]
async fn test_reload_init_sends_script_and_instrument() {
    let h = harness(&[("default", Exchange::Binance)]).await;
    assert!(h.client.process_command("login default").await.success);
    wait_until(|| h.client.context().is_some()).await;

    assert!(h.client.process_command("reload init").await.success);
    let reload = h.server.requests("reloadInit");
    assert_eq!(reload.len(), 1);
    assert_eq!(
        reload[0]["params"]["initLines"],
        json!(["set timeout 30", "instrument BTC-PERP"])
    );
}

#[tokio::test]
async fn test_completions_come_from_server() {
    let h = harness(&[("default", Exchange::Binance)]).await;
    assert!(h.client.process_command("login default").await.success);

    let completions = h.client.completions().await.unwrap();
    assert_eq!(completions.completions.0, ["buy", "sell"]);
    assert_eq!(completions.completions.1, "b");
}

#[tokio::test]
async fn test_rejected_credentials_fail_login() {
    let h = harness(&[("default", Exchange::Binance)]).await;
    h.server.state.reject_hello.store(true, Ordering::SeqCst);

    let outcome = h.client.process_command("login default").await;
    assert!(!outcome.success);
    assert_eq!(
        outcome.message.as_deref(),
        Some("Not logged in. Your API key may not be correct.")
    );
    assert!(h.client.active_logins().is_empty());
}

#[tokio::test]
async fn test_unreadable_server_version_only_warns() {
    let h = harness(&[("default", Exchange::Binance)]).await;
    *h.server.state.version.lock().unwrap() = Some("beta".to_string());

    let outcome = h.client.process_command("login default").await;
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(h.client.active_logins(), vec!["default".to_string()]);
    assert!(h.output.contains("does not recognize"));
}

#[tokio::test]
async fn test_login_with_unknown_name_fails() {
    let h = harness(&[("default", Exchange::Binance)]).await;
    assert!(h.client.process_command("login default").await.success);

    let outcome = h.client.process_command("login nobody").await;
    assert!(!outcome.success);
    assert!(h.client.is_connected());
    assert_eq!(
        h.client.session().profile.as_ref().unwrap().friendly_name,
        "default"
    );
}

#[tokio::test]
async fn test_logout_forgets_profile() {
    let h = harness(&[("default", Exchange::Binance)]).await;
    assert!(h.client.process_command("login default").await.success);

    let outcome = h.client.process_command("logout").await;
    assert!(outcome.success);
    assert_eq!(h.server.requests("bye").len(), 1);
    assert!(h.client.active_logins().is_empty());
    assert!(h.client.session().profile.is_none());

    let outcome = h.client.process_command("login default").await;
    assert!(!outcome.success);
}

// =============================================================================
// Connection loss
// =============================================================================

#[tokio::test]
async fn test_force_disconnect_stops_reconnecting() {
    let h = harness(&[("default", Exchange::Binance)]).await;
    assert!(h.client.process_command("login default").await.success);

    h.server.force_disconnect("Logged in elsewhere.");
    wait_until(|| !h.client.is_connected()).await;
    assert!(h.output.contains("Logged in elsewhere."));
    assert!(h.output.contains("Type 'login default'"));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.server.connections(), 1);
    assert!(!h.output.contains("Lost connection"));

    let outcome = h.client.process_command("buy 1").await;
    assert!(!outcome.success);
    assert!(outcome.message.unwrap().contains("Not connected"));

    assert!(h.client.process_command("login default").await.success);
    assert_eq!(h.server.connections(), 2);
    assert!(h.output.contains("Reconnected."));
}

#[tokio::test]
async fn test_server_close_after_force_disconnect_is_not_retried() {
    let h = harness(&[("default", Exchange::Binance)]).await;
    assert!(h.client.process_command("login default").await.success);

    h.server.state.hang_up_after_push.store(true, Ordering::SeqCst);
    h.server.force_disconnect("kicked");
    wait_until(|| !h.client.is_connected()).await;
    assert!(h.output.contains("Type 'login default'"));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!h.output.contains("Lost connection"));
    assert_eq!(h.server.connections(), 1);
    assert_eq!(h.server.requests("hello").len(), 1);
}

#[tokio::test]
async fn test_silent_server_is_reset_once_per_stale_period() {
    let h = harness_with(&[("default", Exchange::Binance)], |config| {
        config.connection.ping_interval_ms = 100;
        config.connection.reset_interval_ms = 300;
    })
    .await;
    h.server.state.silent.store(true, Ordering::SeqCst);
    assert!(h.client.process_command("login default").await.success);

    wait_until(|| h.server.connections() >= 3).await;
    h.server.state.silent.store(false, Ordering::SeqCst);

    // Pongs flow again; let the last reconnect settle.
    tokio::time::sleep(Duration::from_millis(700)).await;
    wait_until(|| h.client.is_connected()).await;
    wait_until(|| h.server.requests("hello").len() == h.server.connections()).await;

    let connections = h.server.connections();
    assert_eq!(h.output.count("Lost connection to the server"), connections - 1);
    assert_eq!(h.output.count("Reconnected."), connections - 1);
    assert!(h.client.process_command("buy 1").await.success);
}

#[tokio::test]
async fn test_unknown_instruction_does_not_stall_the_session() {
    let h = harness(&[("default", Exchange::Binance)]).await;
    assert!(h.client.process_command("login default").await.success);
    wait_until(|| h.client.context().is_some()).await;

    h.server.push(json!({
        "notification": "instruction",
        "params": {"instruction": "self-destruct"},
    }));
    wait_until(|| h.output.contains("unknown instruction")).await;

    let outcome = tokio::time::timeout(Duration::from_secs(3), h.client.process_command("buy 1"))
        .await
        .expect("command finished");
    if cfg!(debug_assertions) {
        assert!(!outcome.success);
        assert!(outcome.message.unwrap().contains("Protocol violation"));
        assert!(h.client.violation().is_some());
    } else {
        assert!(outcome.success, "{outcome:?}");
    }

    // Responses are still routed.
    let completions = tokio::time::timeout(Duration::from_secs(3), h.client.completions())
        .await
        .expect("completions finished");
    assert!(completions.is_ok());
}

#[tokio::test]
async fn test_dropped_connection_reconnects_and_handshakes_again() {
    let h = harness(&[("default", Exchange::Binance)]).await;
    assert!(h.client.process_command("login default").await.success);
    wait_until(|| h.client.context().is_some()).await;

    h.server.drop_all.send(()).unwrap();
    wait_until(|| h.server.requests("hello").len() == 2).await;

    assert_eq!(h.output.count("Lost connection to the server"), 1);
    assert!(h.output.contains("Reconnected."));
    let hello = h.server.requests("hello");
    assert_eq!(
        hello[1]["params"]["initLines"],
        json!(["set timeout 30", "instrument BTC-PERP"])
    );
    wait_until(|| h.client.is_connected()).await;
    assert!(h.client.process_command("buy 1").await.success);
}

// =============================================================================
// Shutdown drain
// =============================================================================

#[tokio::test]
async fn test_quit_says_bye_once_per_profile() {
    let h = harness(&[("default", Exchange::Binance), ("second", Exchange::Ftx)]).await;

    assert!(h.client.process_command("login default").await.success);
    h.server.force_disconnect("Session ended.");
    wait_until(|| !h.client.is_connected()).await;

    // The forced-off profile never got a bye, so it stays active.
    assert!(h.client.process_command("login second").await.success);
    assert_eq!(
        h.client.active_logins(),
        vec!["default".to_string(), "second".to_string()]
    );

    let outcome = h.client.process_command("quit").await;
    assert!(outcome.exit);
    assert!(h.client.active_logins().is_empty());
    assert!(!h.client.is_connected());

    wait_until(|| h.server.requests("bye").len() == 2).await;
    let byes = h.server.requests("bye");
    let names: Vec<&str> = byes
        .iter()
        .map(|b| b["params"]["auth"]["friendlyName"].as_str().unwrap())
        .collect();
    // The live profile signs off on its own connection first.
    assert_eq!(names, ["second", "default"]);
    assert!(byes.iter().all(|b| b.get("id").is_none()));
    assert_eq!(h.server.connections(), 3);
}

#[tokio::test]
async fn test_run_loop_quits_on_end_of_input() {
    let server = MockServer::start().await;
    let mut config = Config::default();
    config.server.url = server.url();
    config.connection.login_timeout_ms = 5_000;

    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    CredentialStore::new(kv.clone())
        .save(&CredentialProfile::new(Exchange::Binance, "key", "secret", "default"))
        .unwrap();
    let output = Arc::new(MemoryOutput::new());
    let client = Client::new(
        &config,
        kv,
        Arc::new(RecordingScripts::default()),
        output.clone(),
    )
    .unwrap();

    let runner = tokio::spawn(client.clone().run());
    wait_until(|| output.contains("Login steps done.")).await;
    client.close_input();

    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    wait_until(|| server.requests("bye").len() == 1).await;
    assert!(client.active_logins().is_empty());
}
