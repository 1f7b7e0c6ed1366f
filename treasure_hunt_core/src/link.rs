//! The seam between an agent's decision logic and the engine it talks to.
//!
//! [`WorldLink`] is what the search controller drives. [`crate::client::Connection`] implements
//! it over TCP; [`LocalLink`] implements it in-process on top of the same [`Hub`] the server
//! uses, which is how multi-agent runs are tested without sockets.

use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::direction::Direction;
use crate::engine::{InitialData, ItemOwner};
use crate::lock;
use crate::percept::Percept;
use crate::protocol::{Broadcast, BroadcastKind, ClientMessage, ProtocolError, ServerMessage};
use crate::server::{AgentSession, Hub};
use crate::{AgentId, ItemKind, Position};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("connection closed: {0}")]
    Disconnected(String),
    #[error("no reply to {0} in time")]
    Timeout(&'static str),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result of one move: where the agent ended up and what it read there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub position: Position,
    /// `None` when the reading failed.
    pub value: Option<f64>,
}

impl Sample {
    pub fn percept(&self) -> Percept {
        Percept::classify(self.value)
    }

    /// The reading as a number, a failed reading counting as no signal.
    pub fn signal(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

/// Answer to an ownership query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerReply {
    Owner(ItemOwner),
    /// The agent does not stand on a key or a box.
    NoOwner,
    /// No answer arrived in time; ask again on the next visit.
    Unknown,
}

/// Fields shared between an agent's control loop and its inbound listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Knowledge {
    pub position: Option<Position>,
    pub nb_agents: Option<usize>,
    pub nb_connected: Option<usize>,
    /// Own key location, as reported by a peer.
    pub remote_key: Option<Position>,
    /// Own box location, as reported by a peer.
    pub remote_box: Option<Position>,
    pub completed_peers: BTreeSet<AgentId>,
}

/// Lock-protected [`Knowledge`] of one agent.
#[derive(Debug)]
pub struct SharedKnowledge {
    agent_id: AgentId,
    inner: Mutex<Knowledge>,
    running: AtomicBool,
}

impl SharedKnowledge {
    pub fn new(agent_id: AgentId) -> Self {
        SharedKnowledge {
            agent_id,
            inner: Mutex::new(Knowledge::default()),
            running: AtomicBool::new(true),
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn snapshot(&self) -> Knowledge {
        lock(&self.inner).clone()
    }

    pub fn position(&self) -> Option<Position> {
        lock(&self.inner).position
    }

    pub fn set_position(&self, position: Position) {
        lock(&self.inner).position = Some(position);
    }

    pub fn remote_location(&self, kind: ItemKind) -> Option<Position> {
        let inner = lock(&self.inner);
        match kind {
            ItemKind::Key => inner.remote_key,
            ItemKind::Box => inner.remote_box,
        }
    }

    /// Drops a peer-reported location that turned out to be wrong.
    pub fn forget_remote(&self, kind: ItemKind) {
        let mut inner = lock(&self.inner);
        match kind {
            ItemKind::Key => inner.remote_key = None,
            ItemKind::Box => inner.remote_box = None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Records what a reply reveals about the session.
    pub fn observe(&self, message: &ServerMessage) {
        let mut inner = lock(&self.inner);
        match *message {
            ServerMessage::GetData { x, y, .. } | ServerMessage::Move { x, y, .. } => {
                inner.position = Some(Position { x, y });
            }
            ServerMessage::GetNbAgents { nb_agents } => inner.nb_agents = Some(nb_agents),
            ServerMessage::GetNbConnectedAgents {
                nb_connected_agents,
            } => inner.nb_connected = Some(nb_connected_agents),
            ServerMessage::GetItemOwner { .. } | ServerMessage::BroadcastMsg(_) => {}
        }
    }

    /// Applies a broadcast. Only discoveries addressed to this agent change its item
    /// locations. Returns whether anything changed.
    pub fn apply_broadcast(&self, notice: &Broadcast) -> bool {
        let mut inner = lock(&self.inner);
        let changed = match notice.kind {
            BroadcastKind::KeyDiscovered if notice.owner == self.agent_id => {
                inner.remote_key.replace(notice.position) != Some(notice.position)
            }
            BroadcastKind::BoxDiscovered if notice.owner == self.agent_id => {
                inner.remote_box.replace(notice.position) != Some(notice.position)
            }
            BroadcastKind::Completed => inner.completed_peers.insert(notice.sender),
            _ => false,
        };
        if changed {
            info!(agent = self.agent_id, from = notice.sender, kind = ?notice.kind,
                position = %notice.position, "learned from peer");
        }
        changed
    }
}

/// Everything the search controller needs from the engine.
pub trait WorldLink {
    fn knowledge(&self) -> &SharedKnowledge;

    fn agent_id(&self) -> AgentId {
        self.knowledge().agent_id()
    }

    /// Spawn position, grid size and first percept.
    fn initial(&mut self) -> Result<InitialData, LinkError>;

    /// Requests one move. A failed reading comes back as a sample without a value; only
    /// transport failures are errors.
    fn step(&mut self, direction: Direction) -> Result<Sample, LinkError>;

    fn item_owner(&mut self) -> Result<OwnerReply, LinkError>;

    fn broadcast(&mut self, notice: Broadcast) -> Result<(), LinkError>;
}

/// In-process link bound to a slot of a [`Hub`].
pub struct LocalLink {
    session: AgentSession,
    inbox: Receiver<ServerMessage>,
    knowledge: Arc<SharedKnowledge>,
}

impl LocalLink {
    /// Claims the next free slot of `hub`; `None` when the session is full.
    pub fn connect(hub: &Arc<Hub>) -> Option<Self> {
        let (outbox, inbox) = std::sync::mpsc::channel();
        let session = hub.open_session(outbox)?;
        let knowledge = Arc::new(SharedKnowledge::new(session.id()));
        debug!(agent = session.id(), "local link connected");
        Some(LocalLink {
            session,
            inbox,
            knowledge,
        })
    }

    pub fn shared_knowledge(&self) -> Arc<SharedKnowledge> {
        Arc::clone(&self.knowledge)
    }

    /// Applies the broadcasts queued for this agent.
    pub fn pump(&self) {
        while let Ok(message) = self.inbox.try_recv() {
            match message {
                ServerMessage::BroadcastMsg(notice) => {
                    self.knowledge.apply_broadcast(&notice);
                }
                other => self.knowledge.observe(&other),
            }
        }
    }

    fn request(&self, message: ClientMessage) -> Result<ServerMessage, LinkError> {
        self.pump();
        let reply = self
            .session
            .handle(message)
            .ok_or(LinkError::Disconnected("engine rejected the agent".into()))?;
        self.knowledge.observe(&reply);
        Ok(reply)
    }
}

impl WorldLink for LocalLink {
    fn knowledge(&self) -> &SharedKnowledge {
        &self.knowledge
    }

    fn initial(&mut self) -> Result<InitialData, LinkError> {
        match self.request(ClientMessage::GetData)? {
            ServerMessage::GetData {
                agent_id,
                x,
                y,
                w,
                h,
                cell_val,
            } => Ok(InitialData {
                agent_id,
                position: Position { x, y },
                width: w,
                height: h,
                cell_val,
            }),
            other => Err(LinkError::Handshake(format!("unexpected reply {other:?}"))),
        }
    }

    fn step(&mut self, direction: Direction) -> Result<Sample, LinkError> {
        match self.request(ClientMessage::Move {
            direction: direction.code().into(),
        })? {
            ServerMessage::Move { x, y, cell_val } => Ok(Sample {
                position: Position { x, y },
                value: Some(cell_val),
            }),
            _ => Ok(Sample {
                position: self.knowledge.position().unwrap_or_default(),
                value: None,
            }),
        }
    }

    fn item_owner(&mut self) -> Result<OwnerReply, LinkError> {
        Ok(match self.request(ClientMessage::GetItemOwner)? {
            ServerMessage::GetItemOwner {
                owner: Some(owner),
                kind: Some(kind),
            } => OwnerReply::Owner(ItemOwner { owner, kind }),
            ServerMessage::GetItemOwner { .. } => OwnerReply::NoOwner,
            _ => OwnerReply::Unknown,
        })
    }

    fn broadcast(&mut self, notice: Broadcast) -> Result<(), LinkError> {
        self.pump();
        self.session.handle(ClientMessage::BroadcastMsg(notice));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(kind: BroadcastKind, owner: AgentId) -> Broadcast {
        Broadcast {
            kind,
            position: Position::new(4, 7),
            owner,
            sender: 3,
        }
    }

    #[test]
    fn discoveries_only_reach_their_owner() {
        let k = SharedKnowledge::new(1);
        let j = SharedKnowledge::new(2);
        for agent in [&k, &j] {
            agent.apply_broadcast(&notice(BroadcastKind::KeyDiscovered, 1));
            agent.apply_broadcast(&notice(BroadcastKind::BoxDiscovered, 1));
        }
        assert_eq!(k.remote_location(ItemKind::Key), Some(Position::new(4, 7)));
        assert_eq!(k.remote_location(ItemKind::Box), Some(Position::new(4, 7)));
        assert_eq!(j.snapshot(), Knowledge::default());
    }

    #[test]
    fn repeated_discoveries_are_not_changes() {
        let k = SharedKnowledge::new(0);
        assert!(k.apply_broadcast(&notice(BroadcastKind::KeyDiscovered, 0)));
        assert!(!k.apply_broadcast(&notice(BroadcastKind::KeyDiscovered, 0)));
        k.forget_remote(ItemKind::Key);
        assert_eq!(k.remote_location(ItemKind::Key), None);
    }

    #[test]
    fn completion_notices_record_the_sender() {
        let k = SharedKnowledge::new(0);
        assert!(k.apply_broadcast(&notice(BroadcastKind::Completed, 3)));
        assert_eq!(k.snapshot().completed_peers, BTreeSet::from([3]));
    }

    #[test]
    fn replies_update_position_and_counts() {
        let k = SharedKnowledge::new(0);
        k.observe(&ServerMessage::Move {
            x: 2,
            y: 3,
            cell_val: 0.0,
        });
        k.observe(&ServerMessage::GetNbAgents { nb_agents: 4 });
        k.observe(&ServerMessage::GetNbConnectedAgents {
            nb_connected_agents: 2,
        });
        let snapshot = k.snapshot();
        assert_eq!(snapshot.position, Some(Position::new(2, 3)));
        assert_eq!(snapshot.nb_agents, Some(4));
        assert_eq!(snapshot.nb_connected, Some(2));
    }
}
