//! Session orchestration.
//!
//! The [`Client`] ties the pieces together:
//! - an event pump routing connection events to the RPC layer and turning
//!   `Opened` into a handshake
//! - a poke ticker
//! - the command loop, reading lines through the prompt mailbox
//!
//! The session context (active profile + connection) is one immutable
//! snapshot, replaced wholesale on login and logout.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use protocol::messages::{CompletionsResult, HelloParams};
use protocol::{
    scope_label, CredentialProfile, Exchange, ExtraField, FeedLevel, GlobalContext, Instruction,
    Notification, ProtocolError, CLIENT_VERSION, DEFAULT_PROFILE_NAME,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::dispatcher::{script_edit, Command, CommandOutcome, ScriptEdit};
use crate::mailbox::PromptMailbox;
use crate::network::{ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionSettings};
use crate::output::OutputSink;
use crate::rpc::RpcSession;
use crate::script::ScriptStore;
use crate::storage::KeyValueStore;

const NOT_LOGGED_IN: &str =
    "It seems you have not inserted your API key yet. Please type 'login' to start.";
const BAD_CREDENTIALS: &str = "Not logged in. Your API key may not be correct.";
const LOST_CONNECTION: &str = "Lost connection to the server, reconnecting...";
const RECONNECTED: &str = "Reconnected.";

/// Client-level tuning.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Show server debug feeds and send `debug: true` with commands.
    pub debug: bool,
    pub poke_interval: Duration,
    /// Bound on waiting for a handshake after `login`, and for farewell
    /// connections to open during the drain.
    pub login_timeout: Duration,
    /// Bound on waiting for an acknowledged `bye`.
    pub bye_timeout: Duration,
}

impl ClientSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            debug: config.client.debug,
            poke_interval: config.connection.poke_interval(),
            login_timeout: config.connection.login_timeout(),
            bye_timeout: config.connection.close_timeout(),
        }
    }
}

/// Active profile and its connection.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub profile: Option<CredentialProfile>,
    pub connection: Option<ConnectionHandle>,
}

impl SessionContext {
    /// The connection, when it is open.
    pub fn open_connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref().filter(|c| c.is_open())
    }
}

#[derive(Debug, Clone)]
struct HandshakeOutcome {
    connection_id: u64,
    result: Result<(), String>,
}

/// Keeps `login_in_progress` set while the interactive flow runs.
struct LoginGuard<'a>(&'a AtomicBool);

impl<'a> LoginGuard<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for LoginGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Background tasks started by [`Client::start`]. Aborted on drop.
pub struct ClientTasks {
    pump: JoinHandle<()>,
    poke: JoinHandle<()>,
}

impl ClientTasks {
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for ClientTasks {
    fn drop(&mut self) {
        self.pump.abort();
        self.poke.abort();
    }
}

/// Interactive session engine.
pub struct Client {
    pub(crate) settings: ClientSettings,
    pub(crate) output: Arc<dyn OutputSink>,
    pub(crate) credentials: CredentialStore,
    scripts: Arc<dyn ScriptStore>,
    pub(crate) connections: ConnectionManager,
    pub(crate) rpc: RpcSession,
    mailbox: PromptMailbox,
    session: RwLock<Arc<SessionContext>>,
    active_logins: Mutex<BTreeSet<String>>,
    login_in_progress: AtomicBool,
    announce_reconnect: AtomicBool,
    first_handshake_done: AtomicBool,
    handshakes: watch::Sender<Option<HandshakeOutcome>>,
    /// Set on a fatal protocol violation; the command loop stops on it.
    violation: Mutex<Option<String>>,
}

impl Client {
    pub fn new(
        config: &Config,
        kv: Arc<dyn KeyValueStore>,
        scripts: Arc<dyn ScriptStore>,
        output: Arc<dyn OutputSink>,
    ) -> Result<Arc<Self>, ProtocolError> {
        Self::with_settings(
            ClientSettings::from_config(config),
            ConnectionSettings::from_config(config),
            kv,
            scripts,
            output,
        )
    }

    pub fn with_settings(
        settings: ClientSettings,
        connection_settings: ConnectionSettings,
        kv: Arc<dyn KeyValueStore>,
        scripts: Arc<dyn ScriptStore>,
        output: Arc<dyn OutputSink>,
    ) -> Result<Arc<Self>, ProtocolError> {
        let credentials = CredentialStore::new(kv);
        let client_id = credentials.client_id()?;
        let (handshakes, _) = watch::channel(None);

        Ok(Arc::new(Self {
            settings,
            output,
            connections: ConnectionManager::new(connection_settings, credentials.clone()),
            credentials,
            scripts,
            rpc: RpcSession::new(client_id),
            mailbox: PromptMailbox::new(),
            session: RwLock::new(Arc::new(SessionContext::default())),
            active_logins: Mutex::new(BTreeSet::new()),
            login_in_progress: AtomicBool::new(false),
            announce_reconnect: AtomicBool::new(false),
            first_handshake_done: AtomicBool::new(false),
            handshakes,
            violation: Mutex::new(None),
        }))
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    /// Current session context.
    pub fn session(&self) -> Arc<SessionContext> {
        self.session
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub(crate) fn replace_session(&self, context: SessionContext) {
        if let Ok(mut session) = self.session.write() {
            *session = Arc::new(context);
        }
    }

    pub fn context(&self) -> Option<GlobalContext> {
        self.rpc.context()
    }

    pub fn is_connected(&self) -> bool {
        self.session().open_connection().is_some()
    }

    /// Names with a completed handshake and no sign-off yet.
    pub fn active_logins(&self) -> Vec<String> {
        self.active_logins
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn next_active_login(&self) -> Option<String> {
        self.active_logins
            .lock()
            .ok()
            .and_then(|set| set.iter().next().cloned())
    }

    pub(crate) fn remove_active_login(&self, name: &str) {
        if let Ok(mut set) = self.active_logins.lock() {
            set.remove(name);
        }
    }

    /// Fatal protocol violation reported by the server side, if any.
    pub fn violation(&self) -> Option<String> {
        self.violation.lock().ok().and_then(|v| v.clone())
    }

    pub fn prompt_text(&self) -> String {
        match self.rpc.context() {
            None => "[not ready] ".to_string(),
            Some(GlobalContext {
                current_instrument: Some(symbol),
            }) => format!("[{symbol}] > "),
            Some(_) => "[global *] > ".to_string(),
        }
    }

    /// Feeds one line of user input.
    pub fn offer_input(&self, line: impl Into<String>) {
        self.mailbox.offer(line);
    }

    /// Input ended; the command loop treats this as `quit`.
    pub fn close_input(&self) {
        self.mailbox.close();
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    /// Starts the event pump and the poke ticker.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<ClientTasks> {
        let events = self
            .connections
            .events()
            .ok_or_else(|| anyhow!("client already started"))?;

        let pump = tokio::spawn(self.clone().pump_events(events));
        let poke = tokio::spawn(self.clone().poke_loop());
        Ok(ClientTasks { pump, poke })
    }

    async fn pump_events(self: Arc<Self>, mut events: mpsc::Receiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Opened { handle, first } => self.on_opened(handle, first),
                ConnectionEvent::Message { id, text } => self.on_message(id, &text),
                ConnectionEvent::Lost { id } => {
                    self.rpc.fail_pending(id);
                    let session = self.session();
                    let current = session
                        .connection
                        .as_ref()
                        .filter(|h| !h.is_closed_intentionally());
                    if current.map(ConnectionHandle::id) == Some(id) {
                        self.output.warn(LOST_CONNECTION);
                    }
                }
                ConnectionEvent::Closed { id } => {
                    self.rpc.fail_pending(id);
                }
            }
        }
        tracing::debug!("event pump stopped");
    }

    fn on_opened(self: &Arc<Self>, handle: ConnectionHandle, first: bool) {
        if handle.is_farewell() {
            tracing::debug!(id = handle.id(), "farewell connection open");
            return;
        }

        let armed = self.announce_reconnect.swap(false, Ordering::SeqCst);
        if !first || armed {
            self.output.log(RECONNECTED);
        } else {
            self.output.log("Connected to the server.");
        }

        if self.login_in_progress.load(Ordering::SeqCst) {
            tracing::debug!(id = handle.id(), "login in progress, handshake skipped");
            return;
        }

        let this = self.clone();
        tokio::spawn(async move { this.handshake(handle).await });
    }

    fn on_message(self: &Arc<Self>, id: u64, text: &str) {
        match self.rpc.handle_message(id, text) {
            Ok(Some(notification)) => self.on_notification(id, notification),
            Ok(None) => {}
            Err(ProtocolError::UnknownInstruction(detail)) => {
                tracing::error!(connection = id, %detail, "unknown instruction from server");
                self.output
                    .error(&format!("Received an unknown instruction from the server: {detail}"));
                if cfg!(debug_assertions) {
                    self.fail_fast(id, format!("unknown instruction: {detail}"));
                }
            }
            Err(e) => tracing::error!(connection = id, error = %e, "unreadable frame from server"),
        }
    }

    /// Stops the command loop without taking the event pump down with it.
    fn fail_fast(&self, id: u64, detail: String) {
        if let Ok(mut violation) = self.violation.lock() {
            if violation.is_none() {
                *violation = Some(detail);
            }
        }
        self.rpc.fail_pending(id);
        self.mailbox.close();
    }

    fn on_notification(self: &Arc<Self>, id: u64, notification: Notification) {
        match notification {
            Notification::Feed(feed) => match feed.level {
                FeedLevel::Log => self.output.log(&feed.text()),
                FeedLevel::Warn => self.output.warn(&feed.text()),
                FeedLevel::Error => self.output.error(&feed.text()),
                FeedLevel::Dir => self.output.dir(&feed.dir_entries()),
                FeedLevel::Debug => {
                    if self.settings.debug {
                        self.output.debug(&feed.text());
                    }
                }
            },
            Notification::Context(_) => self.output.set_prompt(&self.prompt_text()),
            Notification::Instruction(Instruction::ForceDisconnect { reason }) => {
                self.on_force_disconnect(id, reason)
            }
        }
    }

    fn on_force_disconnect(self: &Arc<Self>, id: u64, reason: Option<String>) {
        let session = self.session();
        let Some(handle) = session.connection.clone().filter(|h| h.id() == id) else {
            tracing::debug!(connection = id, "force-disconnect for a replaced connection");
            return;
        };

        let name = handle.profile().friendly_name.clone();
        tracing::info!(connection = id, profile = %name, ?reason, "server forced a disconnect");
        self.output
            .warn(reason.as_deref().unwrap_or("The server ended this session."));
        self.output
            .log(&format!("Disconnected. Type 'login {name}' to connect again."));

        // Cancel now so a close racing in from the server is not retried.
        handle.cancel();
        let this = self.clone();
        tokio::spawn(async move { this.connections.close(&handle).await });
    }

    async fn poke_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.poke_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let session = self.session();
            let Some(connection) = session.open_connection() else {
                continue;
            };
            if let Err(e) = self.rpc.poke(Some(connection), session.profile.as_ref()).await {
                tracing::debug!(error = %e, "poke failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Init lines for `exchange`, plus the current instrument when known.
    fn init_lines(&self, exchange: Exchange) -> Vec<String> {
        let mut lines = match self.scripts.read(exchange) {
            Ok(script) => script.init_lines,
            Err(e) => {
                tracing::warn!(%exchange, error = %e, "failed to read init script");
                Vec::new()
            }
        };
        if let Some(context) = self.rpc.context() {
            lines.push(format!("instrument {}", context.scope()));
        }
        lines
    }

    async fn handshake(&self, handle: ConnectionHandle) {
        let profile = handle.profile().clone();
        let params = HelloParams {
            name: profile.friendly_name.clone(),
            version: CLIENT_VERSION,
            init_lines: self.init_lines(profile.exchange),
        };

        let result = match self.rpc.hello(&handle, params).await {
            Ok(hello) => {
                if let Ok(mut set) = self.active_logins.lock() {
                    set.insert(profile.friendly_name.clone());
                }
                tracing::info!(
                    id = handle.id(),
                    profile = %profile.friendly_name,
                    server_version = ?hello.version,
                    instance_started = hello.instance_started,
                    "handshake complete"
                );

                match hello.version {
                    Some(version) if version.is_newer_than(&CLIENT_VERSION) => {
                        self.output.warn(&format!(
                            "The server reports version {version} which is newer than this \
                             client ({CLIENT_VERSION}). Things may not work until you upgrade."
                        ));
                    }
                    Some(_) => {}
                    None => self.output.warn(&format!(
                        "The server reports a version this client ({CLIENT_VERSION}) does not \
                         recognize. Things may not work until you upgrade."
                    )),
                }
                let first = !self.first_handshake_done.swap(true, Ordering::SeqCst);
                if first && !hello.instance_started {
                    self.output.log(
                        "Resumed your running session. The init script was not re-applied; \
                         type 'reload init' to apply it.",
                    );
                }
                self.output.log("Login steps done.");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(id = handle.id(), error = %e, "handshake failed");
                let message = describe_error(&e);
                self.output.error(&message);
                Err(message)
            }
        };

        self.handshakes.send_replace(Some(HandshakeOutcome {
            connection_id: handle.id(),
            result,
        }));
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Runs the command loop until `quit` or end of input.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let tasks = self.start()?;

        self.output.set_prompt(&self.prompt_text());
        self.output.log("Initializing...");
        self.resume_stored_profile().await;

        loop {
            if let Some(detail) = self.violation() {
                tasks.shutdown();
                return Err(ProtocolError::ProtocolViolation(detail).into());
            }

            self.output.set_prompt(&self.prompt_text());
            let line = match self.mailbox.ask().await {
                Some(line) => line,
                None => {
                    tracing::info!("input closed");
                    "quit".to_string()
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let outcome = self.process_command(line).await;
            self.report(line, &outcome);
            if outcome.exit {
                break;
            }
        }

        tasks.shutdown();
        Ok(())
    }

    async fn resume_stored_profile(&self) {
        match self.credentials.resolve(None, None) {
            Ok(Some(profile)) => {
                let handle = self.connections.connect(&profile).await;
                self.replace_session(SessionContext {
                    profile: Some(profile),
                    connection: Some(handle),
                });
            }
            Ok(None) => self.output.log(NOT_LOGGED_IN),
            Err(e) => self
                .output
                .error(&format!("Failed to read stored logins: {e}")),
        }
    }

    fn report(&self, line: &str, outcome: &CommandOutcome) {
        let verb = line.split_whitespace().next().unwrap_or_default();
        if outcome.success {
            if let Some(message) = &outcome.message {
                self.output.log(message);
            }
            tracing::debug!(command = verb, "command completed");
        } else {
            let message = outcome
                .message
                .clone()
                .unwrap_or_else(|| format!("Unspecified error processing {line}"));
            self.output
                .error(&format!("Error processing the command: {message}"));
        }
    }

    /// Executes one input line.
    pub async fn process_command(&self, line: &str) -> CommandOutcome {
        if let Some(detail) = self.violation() {
            return CommandOutcome::failed(format!("Protocol violation: {detail}"));
        }

        let command = Command::parse(line);
        match command {
            Command::Comment => return CommandOutcome::ok(),
            Command::Quit => {
                self.drain().await;
                return CommandOutcome::exit();
            }
            Command::Login { name } => return self.login(name).await,
            _ => {}
        }

        let session = self.session();
        let Some(profile) = session.profile.as_ref() else {
            return CommandOutcome::failed(NOT_LOGGED_IN);
        };

        if session.open_connection().is_none() && !self.login_in_progress.load(Ordering::SeqCst) {
            self.announce_reconnect.store(true, Ordering::SeqCst);
            return CommandOutcome::failed(
                "Not connected to the server. Commands will work again once the connection is back.",
            );
        }

        if command == Command::Logout {
            return self.logout(&session).await;
        }

        let Some(context) = self.rpc.context() else {
            return CommandOutcome::failed("Not ready. Cannot execute command yet.");
        };

        match command {
            Command::ReloadInit => self.reload_init(&session).await,
            Command::Raw(cmd) => self.raw_command(&session, profile, &context, cmd).await,
            Command::Comment | Command::Quit | Command::Login { .. } | Command::Logout => {
                CommandOutcome::ok()
            }
        }
    }

    async fn raw_command(
        &self,
        session: &SessionContext,
        profile: &CredentialProfile,
        context: &GlobalContext,
        cmd: &str,
    ) -> CommandOutcome {
        let result = self
            .rpc
            .rawcmd(
                session.connection.as_ref(),
                Some(profile),
                cmd,
                self.settings.debug,
            )
            .await;

        match result {
            Ok(reply) if reply.success => {
                if let Some(edit) = script_edit(cmd, context.current_instrument.as_deref()) {
                    self.persist(profile.exchange, context.scope(), &edit);
                }
                CommandOutcome {
                    success: true,
                    message: reply.message,
                    ..Default::default()
                }
            }
            Ok(reply) => CommandOutcome::failed(
                reply
                    .message
                    .unwrap_or_else(|| format!("Unspecified error processing {cmd}")),
            ),
            Err(e) => CommandOutcome::failed(describe_error(&e)),
        }
    }

    fn persist(&self, exchange: Exchange, scope: &str, edit: &ScriptEdit) {
        let label = scope_label(Some(scope));
        match edit {
            ScriptEdit::Upsert { line, .. } => self.output.log(&format!(
                "Writing command \"{line}\" to {label} initialization steps."
            )),
            ScriptEdit::Delete { tokens } => self.output.log(&format!(
                "Removing \"{}\" from {label} initialization steps.",
                tokens.join(" ")
            )),
        }

        if let Err(e) = self
            .scripts
            .write(exchange, scope, edit.tokens(), edit.line())
        {
            tracing::warn!(%exchange, scope, error = %e, "init script update failed");
            self.output
                .error(&format!("Failed to update the init script: {e}"));
        }
    }

    async fn reload_init(&self, session: &SessionContext) -> CommandOutcome {
        let profile = session.profile.as_ref();
        let lines = profile
            .map(|p| self.init_lines(p.exchange))
            .unwrap_or_default();

        match self
            .rpc
            .reload_init(session.connection.as_ref(), profile, lines)
            .await
        {
            Ok(_) => CommandOutcome::ok_with("Init script reloaded."),
            Err(e) => CommandOutcome::failed(describe_error(&e)),
        }
    }

    /// Completion candidates from the server.
    pub async fn completions(&self) -> Result<CompletionsResult, ProtocolError> {
        let session = self.session();
        self.rpc
            .get_completions(session.connection.as_ref(), session.profile.as_ref())
            .await
    }

    // -----------------------------------------------------------------------
    // Login / logout
    // -----------------------------------------------------------------------

    async fn login(&self, name: Option<&str>) -> CommandOutcome {
        let profile = match name {
            Some(name) => match self.credentials.resolve(None, Some(name)) {
                Ok(Some(profile)) => {
                    self.sign_off_current().await;
                    profile
                }
                Ok(None) => {
                    return CommandOutcome::failed(format!(
                        "No stored login named '{name}'. Type 'login' to add one."
                    ))
                }
                Err(e) => {
                    return CommandOutcome::failed(format!("Failed to read stored logins: {e}"))
                }
            },
            None => {
                self.sign_off_current().await;
                match self.interactive_login().await {
                    Ok(profile) => profile,
                    Err(outcome) => return outcome,
                }
            }
        };

        self.connect_profile(profile).await
    }

    /// Best-effort `bye` for the outgoing profile, then close its connection.
    async fn sign_off_current(&self) {
        let session = self.session();
        let Some(connection) = session.connection.clone() else {
            return;
        };

        if connection.is_open() {
            let profile = connection.profile();
            let bye = self.rpc.bye(Some(&connection), Some(profile));
            match tokio::time::timeout(self.settings.bye_timeout, bye).await {
                Ok(Ok(_)) => tracing::debug!(profile = %profile.friendly_name, "signed off"),
                Ok(Err(e)) => tracing::debug!(error = %e, "bye failed"),
                Err(_) => tracing::debug!("bye not acknowledged in time"),
            }
            self.remove_active_login(&profile.friendly_name);
        }

        self.connections.close(&connection).await;
        self.replace_session(SessionContext {
            profile: session.profile.clone(),
            connection: None,
        });
    }

    async fn query(&self, prompt: &str) -> Option<String> {
        self.output.set_prompt(prompt);
        let answer = self.mailbox.ask().await;
        self.output.set_prompt(&self.prompt_text());
        answer.map(|a| a.trim().to_string())
    }

    async fn query_until<T, F>(&self, prompt: &str, mut accept: F) -> Result<T, CommandOutcome>
    where
        F: FnMut(&str) -> Result<T, String>,
    {
        loop {
            let answer = self
                .query(prompt)
                .await
                .ok_or_else(|| CommandOutcome::failed("Login aborted."))?;
            match accept(&answer) {
                Ok(value) => return Ok(value),
                Err(problem) => self.output.warn(&problem),
            }
        }
    }

    async fn interactive_login(&self) -> Result<CredentialProfile, CommandOutcome> {
        let _guard = LoginGuard::new(&self.login_in_progress);

        let choices = Exchange::ALL
            .iter()
            .map(Exchange::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let exchange = self
            .query_until(&format!("Exchange ({choices}): "), |answer| {
                answer.parse::<Exchange>().map_err(|e| e.to_string())
            })
            .await?;

        let required = |what: &'static str| {
            move |answer: &str| {
                if answer.is_empty() {
                    Err(format!("{what} cannot be empty."))
                } else {
                    Ok(answer.to_string())
                }
            }
        };
        let api_key = self
            .query_until("Your API key: ", required("API key"))
            .await?;
        let api_secret = self
            .query_until("Your API secret: ", required("API secret"))
            .await?;

        let sub_account = match exchange.extra_field() {
            Some(ExtraField::SubAccount) => {
                self.query_until(
                    "Your FTX subaccount name (leave empty for none): ",
                    |answer| Ok::<_, String>(answer.to_string()),
                )
                .await?
            }
            None => String::new(),
        };

        let name = self
            .query_until(
                &format!("Name for this login (leave empty for '{DEFAULT_PROFILE_NAME}'): "),
                |answer| {
                    if answer.is_empty() {
                        Ok(DEFAULT_PROFILE_NAME.to_string())
                    } else if answer.contains(char::is_whitespace) {
                        Err("Login names cannot contain spaces.".to_string())
                    } else {
                        Ok(answer.to_string())
                    }
                },
            )
            .await?;

        let profile =
            CredentialProfile::new(exchange, api_key, api_secret, name).with_sub_account(sub_account);
        self.credentials
            .save(&profile)
            .map_err(|e| CommandOutcome::failed(format!("Failed to save credentials: {e}")))?;
        self.output
            .log("API key saved. To clear current credentials please type \"logout\".");
        Ok(profile)
    }

    /// Switches the session to `profile` and waits for its handshake.
    async fn connect_profile(&self, profile: CredentialProfile) -> CommandOutcome {
        let name = profile.friendly_name.clone();
        let mut outcomes = self.handshakes.subscribe();

        let handle = self.connections.connect(&profile).await;
        let id = handle.id();
        self.replace_session(SessionContext {
            profile: Some(profile),
            connection: Some(handle),
        });

        let waited = tokio::time::timeout(
            self.settings.login_timeout,
            outcomes.wait_for(|o| o.as_ref().is_some_and(|o| o.connection_id == id)),
        )
        .await;
        let result = match waited {
            Ok(Ok(outcome)) => outcome.as_ref().map(|o| o.result.clone()),
            Ok(Err(_)) => None,
            Err(_) => {
                return CommandOutcome::failed(format!(
                    "Timed out waiting for the server to accept login '{name}'. \
                     Still retrying in the background."
                ))
            }
        };

        match result {
            Some(Ok(())) => CommandOutcome::ok_with(format!("Logged in as '{name}'.")),
            Some(Err(message)) => CommandOutcome::failed(message),
            None => CommandOutcome::failed("Login aborted."),
        }
    }

    async fn logout(&self, session: &SessionContext) -> CommandOutcome {
        let Some(profile) = session.profile.as_ref() else {
            return CommandOutcome::failed(NOT_LOGGED_IN);
        };
        let name = profile.friendly_name.clone();

        self.output.log("Signing out...");
        let bye = self.rpc.bye(session.connection.as_ref(), Some(profile));
        match tokio::time::timeout(self.settings.bye_timeout, bye).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "bye failed"),
            Err(_) => tracing::debug!("bye not acknowledged in time"),
        }

        if let Some(connection) = &session.connection {
            self.connections.close(connection).await;
        }
        self.remove_active_login(&name);

        self.output.log("Clearing your credentials...");
        let forgotten = self.credentials.forget(&name);
        self.replace_session(SessionContext::default());

        match forgotten {
            Ok(()) => CommandOutcome::ok_with("Done."),
            Err(e) => CommandOutcome::failed(format!("Failed to delete stored credentials: {e}")),
        }
    }
}

/// User-facing text for a failed call.
pub fn describe_error(err: &ProtocolError) -> String {
    match err {
        ProtocolError::Authentication(_) => BAD_CREDENTIALS.to_string(),
        ProtocolError::NotConnected => "Not connected to the server.".to_string(),
        ProtocolError::NoActiveProfile => NOT_LOGGED_IN.to_string(),
        ProtocolError::ConnectionClosed(_) => {
            "The connection to the server was lost before an answer arrived.".to_string()
        }
        other => format!("Error from the server: {other}"),
    }
}
