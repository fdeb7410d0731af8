//! JSON-RPC session layer.
//!
//! Calls are correlated with responses through a pending table keyed by
//! request id. Every entry remembers the connection it was sent on, so a
//! lost connection fails exactly the calls that can no longer be answered.
//! Calls are never queued while disconnected and never retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use dashmap::DashMap;
use protocol::messages::{
    Ack, Bye, CompletionsResult, GetCompletions, Hello, HelloParams, HelloResult, NoParams, Poke,
    RawCmd, RawCmdParams, RawCmdResult, ReloadInit, ReloadInitParams,
};
use protocol::{
    CommonArgs, CredentialProfile, GlobalContext, Inbound, Notification, ProtocolError, Result,
    RpcMethod, RpcRequest,
};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::network::ConnectionHandle;

struct PendingCall {
    connection_id: u64,
    reply: oneshot::Sender<Result<Value>>,
}

/// Request/response correlation and the session's global context.
pub struct RpcSession {
    client_id: String,
    next_id: AtomicU64,
    pending: DashMap<u64, PendingCall>,
    context: RwLock<Option<GlobalContext>>,
}

impl RpcSession {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            context: RwLock::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Last context pushed by the server, if any arrived yet.
    pub fn context(&self) -> Option<GlobalContext> {
        self.context.read().ok().and_then(|c| c.clone())
    }

    pub fn set_context(&self, context: GlobalContext) {
        if let Ok(mut current) = self.context.write() {
            *current = Some(context);
        }
    }

    /// Number of calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    fn request<M: RpcMethod>(
        &self,
        id: Option<u64>,
        profile: &CredentialProfile,
        params: &M::Params,
    ) -> Result<RpcRequest> {
        let context = self.context();
        let common = CommonArgs {
            auth: profile,
            context: context.as_ref(),
            client_id: &self.client_id,
        };
        RpcRequest::new::<M>(id, &common, params)
    }

    /// Issues `M` and waits for its reply.
    pub async fn call<M: RpcMethod>(
        &self,
        connection: Option<&ConnectionHandle>,
        profile: Option<&CredentialProfile>,
        params: &M::Params,
    ) -> Result<M::Output> {
        let profile = profile.ok_or(ProtocolError::NoActiveProfile)?;
        let connection = connection
            .filter(|c| c.is_open())
            .ok_or(ProtocolError::NotConnected)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let json = self.request::<M>(Some(id), profile, params)?.to_json()?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingCall {
                connection_id: connection.id(),
                reply: tx,
            },
        );

        if let Err(e) = connection.send(json) {
            self.pending.remove(&id);
            return Err(e);
        }
        tracing::trace!(id, method = M::NAME, connection = connection.id(), "call sent");

        let value = match rx.await {
            Ok(outcome) => outcome?,
            Err(_) => {
                return Err(ProtocolError::ConnectionClosed(format!(
                    "connection lost before '{}' was answered",
                    M::NAME
                )))
            }
        };
        Ok(serde_json::from_value(value)?)
    }

    /// Sends `M` as a notification; no reply is expected.
    pub fn notify<M: RpcMethod>(
        &self,
        connection: &ConnectionHandle,
        profile: &CredentialProfile,
        params: &M::Params,
    ) -> Result<()> {
        let json = self.request::<M>(None, profile, params)?.to_json()?;
        connection.send(json)
    }

    /// Routes one inbound text frame.
    ///
    /// Responses complete their pending call; notifications are returned to
    /// the caller. `context` notifications also replace the stored context.
    pub fn handle_message(&self, connection_id: u64, text: &str) -> Result<Option<Notification>> {
        match Inbound::parse(text)? {
            Inbound::Response { id, outcome } => {
                match self.pending.remove(&id) {
                    Some((_, call)) => {
                        if call.connection_id != connection_id {
                            tracing::debug!(id, connection_id, "reply arrived on another connection");
                        }
                        let _ = call.reply.send(outcome.map_err(ProtocolError::from));
                    }
                    None => tracing::debug!(id, "reply for unknown request"),
                }
                Ok(None)
            }
            Inbound::Notification(notification) => {
                if let Notification::Context(context) = &notification {
                    self.set_context(context.clone());
                }
                Ok(Some(notification))
            }
            Inbound::Pong => Ok(None),
        }
    }

    /// Fails every call issued on `connection_id`.
    pub fn fail_pending(&self, connection_id: u64) -> usize {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| *entry.key())
            .collect();

        for id in &ids {
            if let Some((_, call)) = self.pending.remove(id) {
                let _ = call.reply.send(Err(ProtocolError::ConnectionClosed(
                    "connection to the server was lost".to_string(),
                )));
            }
        }
        if !ids.is_empty() {
            tracing::debug!(connection_id, failed = ids.len(), "failed in-flight calls");
        }
        ids.len()
    }

    // -----------------------------------------------------------------------
    // Methods
    // -----------------------------------------------------------------------

    pub async fn hello(
        &self,
        connection: &ConnectionHandle,
        params: HelloParams,
    ) -> Result<HelloResult> {
        self.call::<Hello>(Some(connection), Some(connection.profile()), &params)
            .await
    }

    /// Rejects with [`ProtocolError::NoActiveProfile`] before touching the
    /// network when no profile is active.
    pub async fn reload_init(
        &self,
        connection: Option<&ConnectionHandle>,
        profile: Option<&CredentialProfile>,
        init_lines: Vec<String>,
    ) -> Result<Ack> {
        let profile = profile.ok_or(ProtocolError::NoActiveProfile)?;
        self.call::<ReloadInit>(connection, Some(profile), &ReloadInitParams { init_lines })
            .await
    }

    pub async fn poke(
        &self,
        connection: Option<&ConnectionHandle>,
        profile: Option<&CredentialProfile>,
    ) -> Result<Value> {
        self.call::<Poke>(connection, profile, &NoParams {}).await
    }

    /// Sign-off that waits for the server's acknowledgement.
    pub async fn bye(
        &self,
        connection: Option<&ConnectionHandle>,
        profile: Option<&CredentialProfile>,
    ) -> Result<Ack> {
        self.call::<Bye>(connection, profile, &NoParams {}).await
    }

    /// Fire-and-forget sign-off.
    pub fn bye_notify(
        &self,
        connection: &ConnectionHandle,
        profile: &CredentialProfile,
    ) -> Result<()> {
        self.notify::<Bye>(connection, profile, &NoParams {})
    }

    pub async fn get_completions(
        &self,
        connection: Option<&ConnectionHandle>,
        profile: Option<&CredentialProfile>,
    ) -> Result<CompletionsResult> {
        self.call::<GetCompletions>(connection, profile, &NoParams {})
            .await
    }

    pub async fn rawcmd(
        &self,
        connection: Option<&ConnectionHandle>,
        profile: Option<&CredentialProfile>,
        cmd: &str,
        debug: bool,
    ) -> Result<RawCmdResult> {
        let params = RawCmdParams {
            cmd: cmd.to_string(),
            debug: debug.then_some(true),
        };
        self.call::<RawCmd>(connection, profile, &params).await
    }
}
