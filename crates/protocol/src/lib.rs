//! # Ichibot Protocol Library
//!
//! Wire vocabulary shared by everything that talks to an ichibot server.
//!
//! ## Overview
//!
//! - **Credentials**: [`CredentialProfile`] and the supported [`Exchange`]s
//! - **Messages**: JSON-RPC 2.0 envelopes, the fixed method set and the
//!   closed [`Notification`] union pushed by the server
//! - **Versioning**: `(major, minor)` negotiation during `hello`
//! - **Errors**: the [`ProtocolError`] taxonomy used by the session layer
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Typed calls / notifications         │  RpcMethod, Notification
//! ├─────────────────────────────────────────┤
//! │          JSON-RPC 2.0 envelope          │  RpcRequest, Inbound
//! ├─────────────────────────────────────────┤
//! │        WebSocket text frames            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{CommonArgs, CredentialProfile, Exchange, Inbound, RpcRequest};
//! use protocol::messages::{RawCmd, RawCmdParams};
//!
//! let auth = CredentialProfile::new(Exchange::Binance, "key", "secret", "default");
//! let common = CommonArgs { auth: &auth, context: None, client_id: "c0ffee" };
//! let params = RawCmdParams { cmd: "buy 1".to_string(), debug: None };
//! let request = RpcRequest::new::<RawCmd>(Some(1), &common, &params).unwrap();
//! assert_eq!(request.method, "rawcmd");
//!
//! let reply = Inbound::parse(r#"{"jsonrpc":"2.0","result":{"success":true},"id":1}"#).unwrap();
//! assert!(matches!(reply, Inbound::Response { id: 1, .. }));
//! ```

pub mod auth;
pub mod error;
pub mod messages;
pub mod version;

pub use auth::{CredentialProfile, Exchange, ExtraField, UnknownExchange, DEFAULT_PROFILE_NAME};
pub use error::{ProtocolError, Result, UNAUTHORIZED_CODE};
pub use messages::{
    scope_label, CommonArgs, FeedLevel, FeedMessage, GlobalContext, Inbound, Instruction,
    Notification, RpcErrorObject, RpcMethod, RpcRequest, ALL_SYM, JSONRPC_VERSION,
};
pub use version::{Version, CLIENT_VERSION};
