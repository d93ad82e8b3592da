//! Login challenge response.
//!
//! The server sends `client-Crypto` with a random `token` and the name of the
//! function to call back (`confirm`). Each available secret is hashed into a
//! response bound to the token and to the address the client connected to:
//!
//! ```text
//! stage1 = secret if it is already an MD5 digest, else MD5(secret)
//! stage2 = MD5(token ++ stage1)
//! result = MD5(stage2 ++ daddr)
//! ```
//!
//! All digests are uppercase hex text.

use crate::error::ClientError;
use crate::handler::CallbackContext;
use md5::{Digest, Md5};
use p4rpc_protocol::{Message, ProtocolError};
use std::net::SocketAddr;

/// Formats the peer address as sent in `daddr`.
pub fn daddr(peer: Option<SocketAddr>) -> String {
    match peer {
        Some(addr) => addr.to_string(),
        None => "unknown".to_string(),
    }
}

/// Returns whether a secret is already a 32 digit hex digest.
pub fn is_digest(secret: &[u8]) -> bool {
    secret.len() == 32 && secret.iter().all(u8::is_ascii_hexdigit)
}

fn md5_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode_upper(hasher.finalize())
}

/// Computes the challenge response for one secret.
pub fn response_digest(secret: &[u8], token: &[u8], daddr: &str) -> String {
    let stage1 = if is_digest(secret) {
        secret.to_vec()
    } else {
        md5_hex(&[secret]).into_bytes()
    };
    let stage2 = md5_hex(&[token, stage1.as_slice()]);
    md5_hex(&[stage2.as_bytes(), daddr.as_bytes()])
}

/// Builds the reply to a `client-Crypto` challenge.
///
/// Secrets are tried ticket first, then password. The ticket is looked up
/// by the challenge's `serverAddress` and `user`, falling back to the
/// configured identity.
pub fn challenge_response(
    ctx: &CallbackContext<'_>,
    challenge: &Message,
) -> Result<Message, ClientError> {
    let confirm = challenge
        .get("confirm")
        .ok_or(ProtocolError::MissingSymbol("confirm"))?;
    let token = challenge
        .get("token")
        .ok_or(ProtocolError::MissingSymbol("token"))?;

    let identity = ctx.identity();
    let address = challenge
        .get_str("serverAddress")
        .map(str::to_string)
        .unwrap_or_else(|| identity.server_address());
    let user = challenge
        .get_str("user")
        .map(str::to_string)
        .unwrap_or_else(|| identity.user());

    let daddr = daddr(ctx.peer_addr());
    let responses: Vec<String> = [identity.ticket(&address, &user), identity.password()]
        .into_iter()
        .flatten()
        .filter(|secret| !secret.is_empty())
        .map(|secret| response_digest(secret.as_bytes(), token, &daddr))
        .collect();

    tracing::debug!(
        "Answering login challenge with {} secret(s), daddr={}",
        responses.len(),
        daddr
    );

    let mut reply = Message::function(confirm.clone()).with_symbol("daddr", daddr);
    match responses.as_slice() {
        [] => {
            reply.set("token", "");
        }
        [only] => {
            reply.set("token", only.clone());
        }
        [ticket, password, ..] => {
            reply.set("token", ticket.clone());
            reply.set("token2", password.clone());
        }
    }
    Ok(reply)
}
