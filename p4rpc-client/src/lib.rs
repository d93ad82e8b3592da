//! # p4rpc-client
//!
//! Async client for the Perforce RPC protocol.
//!
//! This crate provides:
//! - A [`Connection`] that queues commands and runs them one at a time
//! - A [`Handler`] answering the server's client-function callbacks
//!   (login challenges, messages, fstat records)
//! - [`Environment`], resolving identity from process variables, P4CONFIG
//!   files and the ticket store
//!
//! ```no_run
//! use std::sync::Arc;
//! use p4rpc_client::{Command, Connection, ConnectionConfig, Environment, Handler, PrintSink};
//!
//! # async fn demo() -> Result<(), p4rpc_client::ClientError> {
//! let env = Arc::new(Environment::load(std::env::current_dir()?));
//! let config = ConnectionConfig::from_identity(env.as_ref())?;
//! let conn = Connection::open(config, env).await?;
//!
//! let handler = Handler::with_sink(Arc::new(PrintSink));
//! conn.run(Command::new("info").with_handler(handler)).await?;
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod connection;
pub mod crypto;
pub mod diagnostic;
pub mod env;
pub mod error;
pub mod handler;
pub mod template;

pub use command::Command;
pub use connection::{Connection, ConnectionConfig, ConnectionState, PendingCommand};
pub use diagnostic::{MessageCode, Severity};
pub use env::{Environment, IdentityProvider, StaticIdentity, TicketStore};
pub use error::ClientError;
pub use handler::{
    CallbackContext, ClientFunction, Handler, MemorySink, NullSink, OutputSink, PrintSink,
};
