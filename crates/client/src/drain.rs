//! Shutdown drain.
//!
//! Before exiting, every profile that completed a handshake gets exactly one
//! fire-and-forget `bye`. Profiles other than the current one are reached
//! over a short-lived farewell connection that never handshakes.

use crate::client::{Client, SessionContext};
use crate::network::ConnectionHandle;

impl Client {
    /// Signs off every active login, then drops the session connection.
    pub async fn drain(&self) {
        // The live profile goes first, while its connection is still up.
        let live = self
            .session()
            .open_connection()
            .map(|c| c.profile().friendly_name.clone())
            .filter(|name| self.active_logins().contains(name));
        if let Some(name) = live {
            self.sign_off(&name).await;
        }

        while let Some(name) = self.next_active_login() {
            self.sign_off(&name).await;
        }

        let session = self.session();
        if let Some(connection) = &session.connection {
            self.connections.close(connection).await;
        }
        self.replace_session(SessionContext {
            profile: session.profile.clone(),
            connection: None,
        });
    }

    async fn sign_off(&self, name: &str) {
        self.output.log(&format!("Signing out of '{name}'..."));

        let connection = self.farewell_route(name).await;
        if let Some(connection) = &connection {
            if let Err(e) = self.rpc.bye_notify(connection, connection.profile()) {
                tracing::debug!(profile = name, error = %e, "bye not sent");
            }
        }

        // One attempt per name, delivered or not.
        self.remove_active_login(name);

        if let Some(connection) = &connection {
            self.connections.close(connection).await;
        }
        if let Err(e) = self.credentials.clear_cookies(name) {
            tracing::warn!(profile = name, error = %e, "failed to clear session cookies");
        }
    }

    /// Open connection for `name`: the session's own, or a farewell one.
    async fn farewell_route(&self, name: &str) -> Option<ConnectionHandle> {
        let session = self.session();
        if let Some(live) = session
            .open_connection()
            .filter(|c| c.profile().friendly_name == name)
        {
            return Some(live.clone());
        }

        let profile = match self.credentials.resolve(None, Some(name)) {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                tracing::warn!(profile = name, "no stored credentials, skipping bye");
                return None;
            }
            Err(e) => {
                tracing::warn!(profile = name, error = %e, "failed to read credentials");
                return None;
            }
        };

        let handle = self.connections.connect_farewell(&profile).await;
        if handle.wait_open(self.settings.login_timeout).await {
            Some(handle)
        } else {
            tracing::warn!(profile = name, "farewell connection did not open");
            self.connections.close(&handle).await;
            None
        }
    }
}
