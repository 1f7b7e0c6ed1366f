//! Wire protocol between agents and the engine.
//!
//! Every message is one JSON object on its own line. The `header` field names the message
//! kind; replies reuse the header of the request they answer.

use std::io::{self, BufRead, BufReader, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{AgentId, ItemKind, Position};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("could not encode message: {0}")]
    Encode(serde_json::Error),
    #[error("malformed message {line:?}: {source}")]
    Malformed {
        line: String,
        source: serde_json::Error,
    },
}

impl ProtocolError {
    /// True for errors caused by a read timeout rather than a broken connection.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Io(e)
            if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut))
    }
}

/// What a broadcast announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastKind {
    KeyDiscovered,
    BoxDiscovered,
    Completed,
}

impl BroadcastKind {
    pub fn discovered(kind: ItemKind) -> Self {
        match kind {
            ItemKind::Key => BroadcastKind::KeyDiscovered,
            ItemKind::Box => BroadcastKind::BoxDiscovered,
        }
    }
}

/// A notice relayed by the engine to every agent but its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    #[serde(rename = "type")]
    pub kind: BroadcastKind,
    pub position: Position,
    /// Agent the notice is addressed to; the sender itself for [`BroadcastKind::Completed`].
    pub owner: AgentId,
    pub sender: AgentId,
}

/// Agent -> engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "header", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    GetData,
    /// Raw wire code; any integer is accepted, and codes outside `0..=8` are ignored by the
    /// engine.
    Move {
        direction: i64,
    },
    GetNbAgents,
    GetNbConnectedAgents,
    GetItemOwner,
    BroadcastMsg(Broadcast),
}

/// Engine -> agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "header", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    GetData {
        agent_id: AgentId,
        x: usize,
        y: usize,
        w: usize,
        h: usize,
        cell_val: f64,
    },
    Move {
        x: usize,
        y: usize,
        cell_val: f64,
    },
    GetNbAgents {
        nb_agents: usize,
    },
    GetNbConnectedAgents {
        nb_connected_agents: usize,
    },
    GetItemOwner {
        owner: Option<AgentId>,
        #[serde(rename = "type")]
        kind: Option<ItemKind>,
    },
    BroadcastMsg(Broadcast),
}

impl ServerMessage {
    /// True if this message answers `request`.
    pub fn answers(&self, request: &ClientMessage) -> bool {
        matches!(
            (request, self),
            (ClientMessage::GetData, ServerMessage::GetData { .. })
                | (ClientMessage::Move { .. }, ServerMessage::Move { .. })
                | (ClientMessage::GetNbAgents, ServerMessage::GetNbAgents { .. })
                | (
                    ClientMessage::GetNbConnectedAgents,
                    ServerMessage::GetNbConnectedAgents { .. }
                )
                | (ClientMessage::GetItemOwner, ServerMessage::GetItemOwner { .. })
        )
    }
}

/// Writes `message` as a single line and flushes.
pub fn write_message<W: Write, M: Serialize>(
    writer: &mut W,
    message: &M,
) -> Result<(), ProtocolError> {
    let mut line = serde_json::to_vec(message).map_err(ProtocolError::Encode)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// Line-oriented message decoder over any byte stream.
pub struct MessageReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: Read> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        MessageReader {
            inner: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Reads the next message, skipping blank lines. `Ok(None)` means the peer closed the
    /// stream. A malformed line is reported and consumed, so the next call reads on.
    pub fn read<M: DeserializeOwned>(&mut self) -> Result<Option<M>, ProtocolError> {
        loop {
            self.line.clear();
            if self.inner.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed)
                .map(Some)
                .map_err(|source| ProtocolError::Malformed {
                    line: trimmed.to_string(),
                    source,
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn requests_use_the_header_tag() {
        let encoded = serde_json::to_value(ClientMessage::Move { direction: 6 }).unwrap();
        assert_eq!(encoded, json!({"header": "MOVE", "direction": 6}));
        let encoded = serde_json::to_value(ClientMessage::GetNbConnectedAgents).unwrap();
        assert_eq!(encoded, json!({"header": "GET_NB_CONNECTED_AGENTS"}));
    }

    #[test]
    fn broadcast_fields_are_flat() {
        let message = ClientMessage::BroadcastMsg(Broadcast {
            kind: BroadcastKind::BoxDiscovered,
            position: Position::new(3, 4),
            owner: 2,
            sender: 0,
        });
        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(
            encoded,
            json!({
                "header": "BROADCAST_MSG",
                "type": "BOX_DISCOVERED",
                "position": {"x": 3, "y": 4},
                "owner": 2,
                "sender": 0
            })
        );
    }

    #[test]
    fn no_owner_reply_is_nullable() {
        let reply: ServerMessage =
            serde_json::from_str(r#"{"header":"GET_ITEM_OWNER","owner":null,"type":null}"#)
                .unwrap();
        assert_eq!(
            reply,
            ServerMessage::GetItemOwner {
                owner: None,
                kind: None
            }
        );
        let reply: ServerMessage =
            serde_json::from_str(r#"{"header":"GET_ITEM_OWNER","owner":1,"type":"BOX"}"#)
                .unwrap();
        assert_eq!(
            reply,
            ServerMessage::GetItemOwner {
                owner: Some(1),
                kind: Some(ItemKind::Box)
            }
        );
    }

    #[test]
    fn reader_frames_lines_and_survives_garbage() {
        let mut bytes = Vec::new();
        write_message(&mut bytes, &ClientMessage::GetData).unwrap();
        bytes.extend_from_slice(b"\nnot json\n{\"header\":\"TELEPORT\"}\n");
        write_message(&mut bytes, &ClientMessage::Move { direction: 12 }).unwrap();
        bytes.extend_from_slice(b"{\"header\":\"MOVE\",\"direction\":-1}\n");

        let mut reader = MessageReader::new(bytes.as_slice());
        assert_eq!(
            reader.read::<ClientMessage>().unwrap(),
            Some(ClientMessage::GetData)
        );
        assert!(matches!(
            reader.read::<ClientMessage>(),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            reader.read::<ClientMessage>(),
            Err(ProtocolError::Malformed { .. })
        ));
        assert_eq!(
            reader.read::<ClientMessage>().unwrap(),
            Some(ClientMessage::Move { direction: 12 })
        );
        assert_eq!(
            reader.read::<ClientMessage>().unwrap(),
            Some(ClientMessage::Move { direction: -1 })
        );
        assert_eq!(reader.read::<ClientMessage>().unwrap(), None);
    }

    #[test]
    fn replies_are_matched_to_their_request() {
        let reply = ServerMessage::Move {
            x: 1,
            y: 1,
            cell_val: 0.0,
        };
        assert!(reply.answers(&ClientMessage::Move { direction: 0 }));
        assert!(!reply.answers(&ClientMessage::GetData));
    }
}
