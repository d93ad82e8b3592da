//! Client function handlers.
//!
//! While a command runs, the server calls back into the client with
//! `client-<Name>` frames. Each command owns a [`Handler`] that resolves the
//! name to a [`ClientFunction`] and runs either a registered callback or the
//! built-in behavior for it. Output produced by the built-ins goes to an
//! [`OutputSink`].

use crate::crypto;
use crate::diagnostic::{MessageCode, Severity};
use crate::env::IdentityProvider;
use crate::error::ClientError;
use crate::template;
use p4rpc_protocol::{Message, ProtocolError, Symbols, FUNC};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

/// Prefix of server-to-client callback function names.
pub const CLIENT_PREFIX: &str = "client-";

/// Functions the server can call on the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientFunction {
    /// Login challenge.
    Crypto,
    /// Diagnostic output.
    Message,
    /// Partial metadata record.
    FstatPartial,
    /// Final fragment of a metadata record.
    FstatInfo,
    /// Any other function, by name.
    Unimplemented(String),
}

impl ClientFunction {
    /// Resolves a function name with the `client-` prefix removed.
    pub fn from_name(name: &str) -> Self {
        match name {
            "Crypto" => ClientFunction::Crypto,
            "Message" => ClientFunction::Message,
            "FstatPartial" => ClientFunction::FstatPartial,
            "FstatInfo" => ClientFunction::FstatInfo,
            other => ClientFunction::Unimplemented(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ClientFunction::Crypto => "Crypto",
            ClientFunction::Message => "Message",
            ClientFunction::FstatPartial => "FstatPartial",
            ClientFunction::FstatInfo => "FstatInfo",
            ClientFunction::Unimplemented(name) => name,
        }
    }
}

impl fmt::Display for ClientFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", CLIENT_PREFIX, self.name())
    }
}

/// State available to a callback while it runs.
pub struct CallbackContext<'a> {
    peer_addr: Option<SocketAddr>,
    identity: &'a dyn IdentityProvider,
    replies: Vec<Message>,
}

impl<'a> CallbackContext<'a> {
    pub fn new(peer_addr: Option<SocketAddr>, identity: &'a dyn IdentityProvider) -> Self {
        Self {
            peer_addr,
            identity,
            replies: Vec::new(),
        }
    }

    /// Address of the server the connection is talking to.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn identity(&self) -> &'a dyn IdentityProvider {
        self.identity
    }

    /// Queues a frame to send to the server. Queued frames are written, in
    /// order, before the next server frame is read.
    pub fn reply(&mut self, message: Message) {
        self.replies.push(message);
    }

    pub fn replies(&self) -> &[Message] {
        &self.replies
    }

    pub fn into_replies(self) -> Vec<Message> {
        self.replies
    }
}

/// A user-supplied client function implementation.
pub type Callback =
    Box<dyn FnMut(&mut CallbackContext<'_>, &Message) -> Result<(), ClientError> + Send>;

/// Destination for command output.
pub trait OutputSink: Send + Sync {
    /// Receives one expanded diagnostic.
    fn on_message(&self, severity: Severity, text: &str);

    /// Receives one complete metadata record.
    fn on_fstat(&self, record: &Symbols);
}

/// Discards all output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn on_message(&self, _severity: Severity, _text: &str) {}

    fn on_fstat(&self, _record: &Symbols) {}
}

/// Writes diagnostics to stdout (stderr for error-class) and records as
/// `... tag value` lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrintSink;

impl OutputSink for PrintSink {
    fn on_message(&self, severity: Severity, text: &str) {
        if severity.is_error() {
            eprintln!("{}", text);
        } else {
            println!("{}", text);
        }
    }

    fn on_fstat(&self, record: &Symbols) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for (tag, value) in record {
            let _ = writeln!(
                out,
                "... {} {}",
                String::from_utf8_lossy(tag),
                String::from_utf8_lossy(value)
            );
        }
        let _ = writeln!(out);
    }
}

/// Collects output in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<(Severity, String)>>,
    records: Mutex<Vec<Symbols>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(Severity, String)> {
        self.messages.lock().clone()
    }

    pub fn records(&self) -> Vec<Symbols> {
        self.records.lock().clone()
    }
}

impl OutputSink for MemorySink {
    fn on_message(&self, severity: Severity, text: &str) {
        self.messages.lock().push((severity, text.to_string()));
    }

    fn on_fstat(&self, record: &Symbols) {
        self.records.lock().push(record.clone());
    }
}

/// Per-command client function dispatcher.
pub struct Handler {
    sink: Arc<dyn OutputSink>,
    quiet: bool,
    callbacks: HashMap<ClientFunction, Callback>,
    fstat: Symbols,
}

impl Handler {
    pub fn new() -> Self {
        Self::with_sink(Arc::new(NullSink))
    }

    pub fn with_sink(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink,
            quiet: false,
            callbacks: HashMap::new(),
            fstat: Symbols::new(),
        }
    }

    /// Suppresses diagnostics below error severity.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Registers a callback for a function, replacing the built-in behavior.
    pub fn register<F>(&mut self, function: ClientFunction, callback: F)
    where
        F: FnMut(&mut CallbackContext<'_>, &Message) -> Result<(), ClientError> + Send + 'static,
    {
        self.callbacks.insert(function, Box::new(callback));
    }

    pub fn with_callback<F>(mut self, function: ClientFunction, callback: F) -> Self
    where
        F: FnMut(&mut CallbackContext<'_>, &Message) -> Result<(), ClientError> + Send + 'static,
    {
        self.register(function, callback);
        self
    }

    pub fn sink(&self) -> &Arc<dyn OutputSink> {
        &self.sink
    }

    /// Fields accumulated for the metadata record in progress.
    pub fn pending_record(&self) -> &Symbols {
        &self.fstat
    }

    /// Runs a client function.
    pub fn call(
        &mut self,
        function: &ClientFunction,
        ctx: &mut CallbackContext<'_>,
        message: &Message,
    ) -> Result<(), ClientError> {
        if let Some(callback) = self.callbacks.get_mut(function) {
            return callback(ctx, message);
        }

        match function {
            ClientFunction::Crypto => {
                let reply = crypto::challenge_response(ctx, message)?;
                ctx.reply(reply);
                Ok(())
            }
            ClientFunction::Message => self.on_message(message),
            ClientFunction::FstatPartial => {
                self.merge_record(message);
                Ok(())
            }
            ClientFunction::FstatInfo => {
                self.merge_record(message);
                let record = std::mem::take(&mut self.fstat);
                self.sink.on_fstat(&record);
                Ok(())
            }
            ClientFunction::Unimplemented(name) => {
                Err(ProtocolError::UnhandledClientFunction(name.clone()).into())
            }
        }
    }

    fn on_message(&mut self, message: &Message) -> Result<(), ClientError> {
        for (code, fmt) in message.indexed("code").zip(message.indexed("fmt")) {
            let severity = MessageCode::parse(code)?.severity();
            if self.quiet && !severity.is_error() {
                continue;
            }
            let text = template::expand_to_string(fmt, &message.symbols);
            self.sink.on_message(severity, &text);
        }
        Ok(())
    }

    fn merge_record(&mut self, message: &Message) {
        for (name, value) in &message.symbols {
            if name.as_ref() != FUNC.as_bytes() {
                self.fstat.insert(name.clone(), value.clone());
            }
        }
    }
}

impl Default for Handler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("quiet", &self.quiet)
            .field("callbacks", &self.callbacks.keys().collect::<Vec<_>>())
            .field("pending_fields", &self.fstat.len())
            .finish()
    }
}
