//! Agent side of the TCP protocol.
//!
//! A [`Connection`] splits the socket in two: the control loop writes requests and waits for
//! their replies on a channel, while a listener thread owns the read half, applies
//! broadcasts to the agent's [`SharedKnowledge`] as soon as they arrive and forwards every
//! other message as a reply.

use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::Position;
use crate::config::AgentConfig;
use crate::direction::Direction;
use crate::engine::{InitialData, ItemOwner};
use crate::link::{LinkError, OwnerReply, Sample, SharedKnowledge, WorldLink};
use crate::protocol::{
    Broadcast, ClientMessage, MessageReader, ProtocolError, ServerMessage, write_message,
};
use crate::search::{AgentStats, SearchController};

pub struct Connection {
    writer: TcpStream,
    replies: Receiver<ServerMessage>,
    knowledge: Arc<SharedKnowledge>,
    initial: InitialData,
    request_timeout: Duration,
    owner_timeout: Duration,
    /// Requests that timed out and whose replies are still to come.
    late_replies: usize,
    listener: Option<JoinHandle<()>>,
}

impl Connection {
    /// Connects to the engine at `config.addr` and performs the `GET_DATA` handshake.
    pub fn connect(config: &AgentConfig) -> Result<Self, LinkError> {
        let stream = TcpStream::connect(&config.addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.request_timeout))?;
        let mut writer = stream.try_clone()?;
        let mut reader = MessageReader::new(stream);

        write_message(&mut writer, &ClientMessage::GetData)?;
        let mut early = Vec::new();
        let initial = loop {
            match reader.read::<ServerMessage>() {
                Ok(Some(ServerMessage::GetData {
                    agent_id,
                    x,
                    y,
                    w,
                    h,
                    cell_val,
                })) => {
                    break InitialData {
                        agent_id,
                        position: Position { x, y },
                        width: w,
                        height: h,
                        cell_val,
                    };
                }
                Ok(Some(ServerMessage::BroadcastMsg(notice))) => early.push(notice),
                Ok(Some(other)) => debug!(?other, "ignoring message before handshake"),
                Ok(None) => {
                    return Err(LinkError::Handshake(
                        "server closed the connection, the session may be full".into(),
                    ));
                }
                Err(e) if e.is_timeout() => return Err(LinkError::Timeout("GET_DATA")),
                Err(ProtocolError::Malformed { line, source }) => {
                    warn!(%line, "ignoring malformed message: {source}");
                }
                Err(e) => return Err(e.into()),
            }
        };
        // From here on the listener blocks on reads; timeouts live in the reply channel.
        writer.set_read_timeout(None)?;

        let knowledge = Arc::new(SharedKnowledge::new(initial.agent_id));
        knowledge.set_position(initial.position);
        for notice in &early {
            knowledge.apply_broadcast(notice);
        }
        let (reply_tx, replies) = mpsc::channel();
        let listener_knowledge = Arc::clone(&knowledge);
        let listener = thread::Builder::new()
            .name(format!("hunt-listener-{}", initial.agent_id))
            .spawn(move || listen(reader, listener_knowledge, reply_tx))?;
        info!(agent = initial.agent_id, addr = %config.addr, "connected");

        Ok(Connection {
            writer,
            replies,
            knowledge,
            initial,
            request_timeout: config.request_timeout,
            owner_timeout: config.owner_timeout,
            late_replies: 0,
            listener: Some(listener),
        })
    }

    pub fn shared_knowledge(&self) -> Arc<SharedKnowledge> {
        Arc::clone(&self.knowledge)
    }

    /// Sends `message` and waits up to `timeout` for the reply that answers it. `Ok(None)` on
    /// timeout.
    ///
    /// The engine answers every request in order, so the first replies to arrive after a
    /// timeout belong to the requests that timed out and are skipped.
    fn request(
        &mut self,
        message: ClientMessage,
        timeout: Duration,
    ) -> Result<Option<ServerMessage>, LinkError> {
        if !self.knowledge.is_running() {
            return Err(LinkError::Disconnected("listener stopped".into()));
        }
        while self.late_replies > 0 {
            match self.replies.try_recv() {
                Ok(late) => self.skip_late(late),
                Err(_) => break,
            }
        }
        write_message(&mut self.writer, &message)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(late) if self.late_replies > 0 => self.skip_late(late),
                Ok(reply) if reply.answers(&message) => return Ok(Some(reply)),
                Ok(other) => debug!(?other, "discarding unrelated reply"),
                Err(RecvTimeoutError::Timeout) => {
                    self.late_replies += 1;
                    return Ok(None);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(LinkError::Disconnected("listener stopped".into()));
                }
            }
        }
    }

    fn skip_late(&mut self, reply: ServerMessage) {
        self.late_replies -= 1;
        debug!(?reply, "discarding late reply");
    }

    pub fn nb_agents(&mut self) -> Result<Option<usize>, LinkError> {
        Ok(
            match self.request(ClientMessage::GetNbAgents, self.request_timeout)? {
                Some(ServerMessage::GetNbAgents { nb_agents }) => Some(nb_agents),
                _ => None,
            },
        )
    }

    pub fn nb_connected_agents(&mut self) -> Result<Option<usize>, LinkError> {
        Ok(
            match self.request(ClientMessage::GetNbConnectedAgents, self.request_timeout)? {
                Some(ServerMessage::GetNbConnectedAgents {
                    nb_connected_agents,
                }) => Some(nb_connected_agents),
                _ => None,
            },
        )
    }

    /// Blocks until every agent of the session is connected, polling every `poll`.
    pub fn wait_for_peers(
        &mut self,
        poll: Duration,
        limit: Option<Duration>,
    ) -> Result<(), LinkError> {
        let started = Instant::now();
        let mut expected = None;
        loop {
            if expected.is_none() {
                expected = self.nb_agents()?;
            }
            if let (Some(expected), Some(connected)) = (expected, self.nb_connected_agents()?) {
                if connected >= expected {
                    info!(expected, "all agents connected");
                    return Ok(());
                }
                debug!(connected, expected, "waiting for peers");
            }
            if limit.is_some_and(|limit| started.elapsed() >= limit) {
                return Err(LinkError::Timeout("peers to connect"));
            }
            thread::sleep(poll);
        }
    }
}

impl WorldLink for Connection {
    fn knowledge(&self) -> &SharedKnowledge {
        &self.knowledge
    }

    fn initial(&mut self) -> Result<InitialData, LinkError> {
        Ok(self.initial)
    }

    fn step(&mut self, direction: Direction) -> Result<Sample, LinkError> {
        let request = ClientMessage::Move {
            direction: direction.code().into(),
        };
        match self.request(request, self.request_timeout)? {
            Some(ServerMessage::Move { x, y, cell_val }) => Ok(Sample {
                position: Position { x, y },
                value: Some(cell_val),
            }),
            _ => {
                warn!(?direction, "no reply to move, reading unknown");
                Ok(Sample {
                    position: self.knowledge.position().unwrap_or(self.initial.position),
                    value: None,
                })
            }
        }
    }

    fn item_owner(&mut self) -> Result<OwnerReply, LinkError> {
        Ok(
            match self.request(ClientMessage::GetItemOwner, self.owner_timeout)? {
                Some(ServerMessage::GetItemOwner {
                    owner: Some(owner),
                    kind: Some(kind),
                }) => OwnerReply::Owner(ItemOwner { owner, kind }),
                Some(_) => OwnerReply::NoOwner,
                None => OwnerReply::Unknown,
            },
        )
    }

    fn broadcast(&mut self, notice: Broadcast) -> Result<(), LinkError> {
        write_message(&mut self.writer, &ClientMessage::BroadcastMsg(notice))?;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.writer.shutdown(Shutdown::Both);
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
    }
}

fn listen(
    mut reader: MessageReader<TcpStream>,
    knowledge: Arc<SharedKnowledge>,
    replies: Sender<ServerMessage>,
) {
    loop {
        match reader.read::<ServerMessage>() {
            Ok(Some(ServerMessage::BroadcastMsg(notice))) => {
                knowledge.apply_broadcast(&notice);
            }
            Ok(Some(reply)) => {
                knowledge.observe(&reply);
                if replies.send(reply).is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!(agent = knowledge.agent_id(), "server closed the connection");
                break;
            }
            Err(ProtocolError::Malformed { line, source }) => {
                warn!(%line, "ignoring malformed message: {source}");
            }
            Err(e) => {
                warn!(agent = knowledge.agent_id(), "connection lost: {e}");
                break;
            }
        }
    }
    knowledge.stop();
}

/// Connects, waits for the whole session, then runs the search to the end.
#[instrument(skip_all, fields(addr = %config.addr))]
pub fn run_agent(config: &AgentConfig) -> Result<AgentStats, LinkError> {
    let mut connection = Connection::connect(config)?;
    connection.wait_for_peers(config.peer_poll, config.peer_wait_limit)?;
    SearchController::new(connection, config)?.run()
}
