//! User commands.

use crate::handler::Handler;
use bytes::Bytes;
use p4rpc_protocol::{Message, Symbols};

/// A command to run on the server.
#[derive(Debug)]
pub struct Command {
    /// Command name, sent as `user-<verb>`.
    pub verb: String,
    /// Positional arguments.
    pub args: Vec<Bytes>,
    /// Symbols appended after the standard request symbols.
    pub symbols: Symbols,
    /// Handles client functions the server calls while the command runs.
    pub handler: Handler,
}

impl Command {
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            args: Vec::new(),
            symbols: Symbols::new(),
            handler: Handler::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_symbol(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.symbols.insert(name.into(), value.into());
        self
    }

    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handler = handler;
        self
    }

    /// Name of the function the request invokes.
    pub fn function(&self) -> String {
        format!("user-{}", self.verb)
    }
}

/// Request symbols a command's extra symbols cannot replace.
const FIXED_SYMBOLS: [&[u8]; 4] = [b"func", b"os", b"clientCase", b"charset"];

/// Identity and program values stamped on every request.
#[derive(Debug, Clone)]
pub(crate) struct RequestContext {
    pub client: String,
    pub host: String,
    pub user: String,
    pub cwd: String,
    pub program: String,
    pub version: String,
}

impl RequestContext {
    /// Builds the request frame for a command.
    pub fn request(&self, command: &Command) -> Message {
        let mut message = Message::function(command.function())
            .with_symbol("client", self.client.clone())
            .with_symbol("host", self.host.clone())
            .with_symbol("user", self.user.clone())
            .with_symbol("cwd", self.cwd.clone())
            .with_symbol("prog", self.program.clone())
            .with_symbol("version", self.version.clone())
            .with_symbol("os", "UNIX")
            .with_symbol("clientCase", "0")
            .with_symbol("charset", "1");
        message.args = command.args.clone();
        for (name, value) in &command.symbols {
            if FIXED_SYMBOLS.iter().any(|fixed| *fixed == &name[..]) {
                tracing::warn!(
                    "Ignoring request symbol {} on {}",
                    String::from_utf8_lossy(name),
                    command.verb
                );
                continue;
            }
            message.set(name.clone(), value.clone());
        }
        message
    }
}
