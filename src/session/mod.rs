//! Protocol state machines for the controller side of a connection.
//!
//! One OS thread per TCP session (§5: "a thread per connection, not an
//! event loop"); `ControllerContext` is the per-connection handle onto
//! shared state, passed down the call stack explicitly rather than
//! reached for as a global, per Design Note 9.

pub mod developer;
pub mod worker;

use crate::cache::ObjectCache;
use crate::errors::*;
use crate::ids::{WorkerId, WorkerIdAllocator};
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::workingcopy::WorkingCopy;
use splash_proto::{ClientType, Message};
use std::io::{Read, Write};
use std::sync::Arc;

pub struct ControllerContext {
    pub cache: Arc<ObjectCache>,
    pub registry: Arc<Registry>,
    pub scheduler: Arc<Scheduler>,
    pub working_copy: Arc<WorkingCopy>,
    worker_ids: WorkerIdAllocator,
}

impl ControllerContext {
    pub fn new(cache: Arc<ObjectCache>, registry: Arc<Registry>, scheduler: Arc<Scheduler>, working_copy: Arc<WorkingCopy>) -> ControllerContext {
        ControllerContext { cache, registry, scheduler, working_copy, worker_ids: WorkerIdAllocator::default() }
    }

    pub fn alloc_worker_id(&self) -> WorkerId {
        self.worker_ids.alloc()
    }
}

pub struct ClientHelloInfo {
    pub client_type: ClientType,
    pub hostname: String,
    pub uuid: Option<String>,
}

/// Performs the `ClientHello`/`ServerHello` exchange. Any magic or
/// version mismatch is a `BadHandshake` error; the caller drops the
/// connection without further protocol activity.
pub fn handshake<S: Read + Write>(stream: &mut S) -> Result<ClientHelloInfo> {
    let msg = splash_proto::read_message(stream)?.ok_or_else(|| ErrorKind::BadHandshake("connection closed before hello".into()))?;
    let (magic, version, client_type, hostname, uuid) = match msg {
        Message::ClientHello { magic, version, client_type, hostname, uuid } => (magic, version, client_type, hostname, uuid),
        other => return Err(ErrorKind::BadHandshake(format!("expected ClientHello, got {:?}", other)).into()),
    };
    if magic != splash_proto::PROTOCOL_MAGIC {
        return Err(ErrorKind::BadHandshake(format!("bad magic {:#x}", magic)).into());
    }
    if version != splash_proto::PROTOCOL_VERSION {
        return Err(ErrorKind::BadHandshake(format!("unsupported protocol version {}", version)).into());
    }
    splash_proto::write_message(stream, &Message::ServerHello { magic, version })?;
    Ok(ClientHelloInfo { client_type, hostname, uuid })
}

/// Runs the handshake and dispatches to the worker or developer protocol
/// state machine depending on the client's declared type. Returns once
/// the connection is closed or errors out; the caller is responsible for
/// any per-worker cleanup (`Scheduler::remove_node`) on error return.
pub fn handle_connection(ctx: &ControllerContext, stream: &mut std::net::TcpStream) -> Result<()> {
    let hello = handshake(stream)?;
    let client_id = ctx.working_copy.add_client(hello.client_type, &hello.hostname, hello.uuid.as_deref());
    let result = match hello.client_type {
        ClientType::Build => worker::run(ctx, stream, &hello),
        ClientType::Developer | ClientType::Ui => developer::run(ctx, stream, &hello),
    };
    ctx.working_copy.remove_client(client_id);
    result
}
