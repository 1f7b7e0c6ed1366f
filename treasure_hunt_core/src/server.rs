//! TCP front of the engine: one session per connected agent.
//!
//! Each connection gets a reader thread that applies requests to the shared engine and a
//! writer thread draining the session outbox. Replies and broadcasts both go through the
//! outbox, so a sender never waits on a slow peer and every agent sees its messages in order.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::engine::{EngineSnapshot, GridEngine};
use crate::lock;
use crate::protocol::{
    Broadcast, BroadcastKind, ClientMessage, MessageReader, ProtocolError, ServerMessage,
    write_message,
};
use crate::AgentId;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("could not bind listener: {0}")]
    Bind(#[source] io::Error),
    #[error("listener error: {0}")]
    Io(#[from] io::Error),
}

/// Shared state of a running session: the engine behind one lock, and one slot per agent.
pub struct Hub {
    engine: Mutex<GridEngine>,
    slots: Mutex<Vec<Option<Slot>>>,
}

/// Outbox of a live session, plus its socket when it came in over TCP.
struct Slot {
    outbox: Sender<ServerMessage>,
    stream: Option<TcpStream>,
}

impl Hub {
    pub fn new(engine: GridEngine) -> Arc<Self> {
        let slots = engine.expected_count();
        Arc::new(Hub {
            engine: Mutex::new(engine),
            slots: Mutex::new((0..slots).map(|_| None).collect()),
        })
    }

    /// Runs `f` with exclusive access to the engine.
    pub fn with_engine<T>(&self, f: impl FnOnce(&mut GridEngine) -> T) -> T {
        f(&mut lock(&self.engine))
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        lock(&self.engine).snapshot()
    }

    /// Claims an agent slot for a new connection; `None` when the session is full.
    pub fn open_session(self: &Arc<Self>, outbox: Sender<ServerMessage>) -> Option<AgentSession> {
        let id = lock(&self.engine).connect()?;
        lock(&self.slots)[id] = Some(Slot {
            outbox: outbox.clone(),
            stream: None,
        });
        Some(AgentSession {
            id,
            hub: Arc::clone(self),
            outbox,
        })
    }

    /// Remembers the socket of session `id` so [`Hub::close_connections`] can reach it.
    fn attach_stream(&self, id: AgentId, stream: TcpStream) {
        if let Some(Some(slot)) = lock(&self.slots).get_mut(id) {
            slot.stream = Some(stream);
        }
    }

    fn close_session(&self, id: AgentId) {
        if let Some(slot) = lock(&self.slots).get_mut(id) {
            *slot = None;
        }
        lock(&self.engine).disconnect(id);
    }

    /// Shuts down the socket of every live session. The sessions then end on their own.
    fn close_connections(&self) {
        for slot in lock(&self.slots).iter().flatten() {
            if let Some(stream) = &slot.stream {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }

    /// Queues `message` for every connected agent except `sender`. Returns how many
    /// outboxes accepted it.
    pub fn broadcast(&self, message: Broadcast, sender: AgentId) -> usize {
        let slots = lock(&self.slots);
        let mut delivered = 0;
        for (id, slot) in slots.iter().enumerate() {
            if id == sender {
                continue;
            }
            if let Some(slot) = slot {
                match slot.outbox.send(ServerMessage::BroadcastMsg(message)) {
                    Ok(()) => delivered += 1,
                    Err(_) => warn!(agent = id, "outbox closed, broadcast dropped"),
                }
            }
        }
        delivered
    }
}

/// Adapter between one agent connection and the engine.
pub struct AgentSession {
    id: AgentId,
    hub: Arc<Hub>,
    outbox: Sender<ServerMessage>,
}

impl AgentSession {
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Applies one request. Broadcasts are relayed and produce no reply.
    pub fn handle(&self, message: ClientMessage) -> Option<ServerMessage> {
        let id = self.id;
        match message {
            ClientMessage::GetData => self.hub.with_engine(|engine| {
                engine.initial_data(id).ok().map(|data| ServerMessage::GetData {
                    agent_id: data.agent_id,
                    x: data.position.x,
                    y: data.position.y,
                    w: data.width,
                    h: data.height,
                    cell_val: data.cell_val,
                })
            }),
            ClientMessage::Move { direction } => self.hub.with_engine(|engine| {
                engine
                    .apply_move(id, direction)
                    .ok()
                    .map(|outcome| ServerMessage::Move {
                        x: outcome.position.x,
                        y: outcome.position.y,
                        cell_val: outcome.cell_val,
                    })
            }),
            ClientMessage::GetNbAgents => Some(ServerMessage::GetNbAgents {
                nb_agents: self.hub.with_engine(|engine| engine.expected_count()),
            }),
            ClientMessage::GetNbConnectedAgents => Some(ServerMessage::GetNbConnectedAgents {
                nb_connected_agents: self.hub.with_engine(|engine| engine.connected_count()),
            }),
            ClientMessage::GetItemOwner => {
                let owner = self
                    .hub
                    .with_engine(|engine| engine.item_owner(id))
                    .ok()
                    .flatten();
                Some(ServerMessage::GetItemOwner {
                    owner: owner.map(|o| o.owner),
                    kind: owner.map(|o| o.kind),
                })
            }
            ClientMessage::BroadcastMsg(mut broadcast) => {
                broadcast.sender = id;
                if broadcast.kind == BroadcastKind::Completed {
                    let _ = self.hub.with_engine(|engine| engine.mark_completed(id));
                }
                let delivered = self.hub.broadcast(broadcast, id);
                debug!(agent = id, ?broadcast, delivered, "broadcast relayed");
                None
            }
        }
    }

    /// Handles `message` and queues the reply. Returns `false` once the writer is gone.
    pub fn deliver(&self, message: ClientMessage) -> bool {
        match self.handle(message) {
            Some(reply) => self.outbox.send(reply).is_ok(),
            None => true,
        }
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        self.hub.close_session(self.id);
    }
}

/// A bound, not yet running, server.
pub struct Server {
    listener: TcpListener,
    hub: Arc<Hub>,
}

impl Server {
    pub fn bind(addr: impl ToSocketAddrs, hub: Arc<Hub>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).map_err(ServerError::Bind)?;
        Ok(Server { listener, hub })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop on a background thread.
    pub fn spawn(self) -> Result<ServerHandle, ServerError> {
        let addr = self.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let hub = Arc::clone(&self.hub);
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("hunt-accept".into())
            .spawn(move || {
                if let Err(e) = self.run(&thread_stop) {
                    error!("accept loop stopped: {e}");
                }
            })?;
        Ok(ServerHandle {
            addr,
            hub,
            stop,
            thread: Some(thread),
        })
    }

    /// Accepts agents until `stop` is raised, then closes every open connection.
    pub fn run(self, stop: &AtomicBool) -> Result<(), ServerError> {
        self.listener.set_nonblocking(true)?;
        info!(addr = ?self.listener.local_addr().ok(), "waiting for agents");
        while !stop.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!(%peer, "agent connected");
                    if let Err(e) = self.start_session(stream) {
                        warn!(%peer, "could not start session: {e}");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    warn!("error accepting agent: {e}");
                    thread::sleep(ACCEPT_POLL_INTERVAL * 4);
                }
            }
        }
        self.hub.close_connections();
        info!("server stopped");
        Ok(())
    }

    /// Opens a session for `stream`, or closes the stream if the session is full.
    fn start_session(&self, stream: TcpStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let (outbox, inbox) = mpsc::channel();
        let Some(session) = self.hub.open_session(outbox) else {
            warn!("session is full, refusing agent");
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(());
        };
        let id = session.id();
        let writer = stream.try_clone()?;
        self.hub.attach_stream(id, stream.try_clone()?);

        thread::Builder::new()
            .name(format!("hunt-writer-{id}"))
            .spawn(move || write_outbox(id, writer, inbox))?;
        thread::Builder::new()
            .name(format!("hunt-session-{id}"))
            .spawn(move || serve_session(session, stream))?;
        Ok(())
    }
}

fn write_outbox(id: AgentId, mut stream: TcpStream, inbox: Receiver<ServerMessage>) {
    for message in inbox {
        if let Err(e) = write_message(&mut stream, &message) {
            warn!(agent = id, "dropping connection, write failed: {e}");
            let _ = stream.shutdown(Shutdown::Both);
            break;
        }
    }
    debug!(agent = id, "writer finished");
}

#[instrument(skip_all, fields(agent = session.id()))]
fn serve_session(session: AgentSession, stream: TcpStream) {
    let mut reader = MessageReader::new(&stream);
    loop {
        match reader.read::<ClientMessage>() {
            Ok(Some(message)) => {
                if !session.deliver(message) {
                    break;
                }
            }
            Ok(None) => {
                info!("agent disconnected");
                break;
            }
            Err(ProtocolError::Malformed { line, source }) => {
                warn!(%line, "ignoring malformed message: {source}");
            }
            Err(e) => {
                warn!("connection lost: {e}");
                break;
            }
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Handle on a server running in the background.
pub struct ServerHandle {
    addr: SocketAddr,
    hub: Arc<Hub>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Stops accepting, closes every connection and waits for the accept loop.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
