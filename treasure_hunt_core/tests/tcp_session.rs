use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use rand::{SeedableRng, rngs::StdRng};
use serde_json::{Value, json};

use treasure_hunt_core::client::{Connection, run_agent};
use treasure_hunt_core::config::AgentConfig;
use treasure_hunt_core::direction::Direction;
use treasure_hunt_core::engine::{GridEngine, ItemOwner};
use treasure_hunt_core::link::{OwnerReply, WorldLink};
use treasure_hunt_core::protocol::{Broadcast, BroadcastKind};
use treasure_hunt_core::server::{Hub, Server, ServerHandle};
use treasure_hunt_core::world::{AgentSpawn, MapConfig};
use treasure_hunt_core::{ItemKind, Position};

/// 10x10 grid; agent `i` spawns at `(i, 0)`, its key sits at `(i, 5)` and its box at `(9, i)`.
fn start_server(agents: usize) -> ServerHandle {
    let config = MapConfig {
        width: 10,
        height: 10,
        agents: (0..agents)
            .map(|i| AgentSpawn {
                position: Position::new(i, 0),
                color: [200, 100, 0],
            })
            .collect(),
        keys: (0..agents).map(|i| Position::new(i, 5)).collect(),
        boxes: (0..agents).map(|i| Position::new(9, i)).collect(),
    };
    let engine = GridEngine::from_map(&config, 0, &mut StdRng::seed_from_u64(3));
    Server::bind("127.0.0.1:0", Hub::new(engine))
        .unwrap()
        .spawn()
        .unwrap()
}

struct RawAgent {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl RawAgent {
    fn connect(server: &ServerHandle) -> Self {
        let stream = TcpStream::connect(server.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        RawAgent { stream, reader }
    }

    fn send_line(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).unwrap();
        self.stream.write_all(b"\n").unwrap();
    }

    fn send(&mut self, message: Value) {
        self.send_line(&message.to_string());
    }

    /// Next message, or `None` once the server has closed the connection.
    fn recv(&mut self) -> Option<Value> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(serde_json::from_str(&line).unwrap()),
        }
    }

    fn call(&mut self, message: Value) -> Value {
        self.send(message);
        self.recv().unwrap()
    }
}

#[test]
fn raw_client_handshake_move_and_owner() {
    let server = start_server(1);
    let mut agent = RawAgent::connect(&server);

    let data = agent.call(json!({"header": "GET_DATA"}));
    assert_eq!(
        data,
        json!({"header": "GET_DATA", "agent_id": 0, "x": 0, "y": 0, "w": 10, "h": 10, "cell_val": 0.0})
    );

    for _ in 0..4 {
        agent.call(json!({"header": "MOVE", "direction": 4}));
    }
    let moved = agent.call(json!({"header": "MOVE", "direction": 4}));
    assert_eq!(moved, json!({"header": "MOVE", "x": 0, "y": 5, "cell_val": 1.0}));

    let owner = agent.call(json!({"header": "GET_ITEM_OWNER"}));
    assert_eq!(owner, json!({"header": "GET_ITEM_OWNER", "owner": 0, "type": "KEY"}));

    let stay = agent.call(json!({"header": "MOVE", "direction": 1}));
    assert_eq!(stay["x"], 0);
    let off = agent.call(json!({"header": "MOVE", "direction": 2}));
    assert_eq!(off["x"], 1);
    assert_eq!(off["cell_val"], 0.5);
    let owner = agent.call(json!({"header": "GET_ITEM_OWNER"}));
    assert_eq!(owner, json!({"header": "GET_ITEM_OWNER", "owner": null, "type": null}));
}

#[test]
fn malformed_lines_do_not_end_the_session() {
    let server = start_server(1);
    let mut agent = RawAgent::connect(&server);
    agent.send_line("this is not json");
    agent.send_line(r#"{"header":"TELEPORT"}"#);
    let counts = agent.call(json!({"header": "GET_NB_AGENTS"}));
    assert_eq!(counts, json!({"header": "GET_NB_AGENTS", "nb_agents": 1}));
    let ignored = agent.call(json!({"header": "MOVE", "direction": 17}));
    assert_eq!(ignored, json!({"header": "MOVE", "x": 0, "y": 0, "cell_val": 0.0}));
}

#[test]
fn out_of_range_directions_still_get_a_reply() {
    let server = start_server(1);
    let mut agent = RawAgent::connect(&server);
    agent.call(json!({"header": "GET_DATA"}));
    agent.call(json!({"header": "MOVE", "direction": 4}));
    for direction in [json!(9), json!(300), json!(-1), json!(-300)] {
        let reply = agent.call(json!({"header": "MOVE", "direction": direction}));
        assert_eq!(
            reply,
            json!({"header": "MOVE", "x": 0, "y": 1, "cell_val": 0.0}),
            "direction {direction}"
        );
    }
}

#[test]
fn broadcasts_reach_everyone_but_the_sender() {
    let server = start_server(3);
    let mut agents: Vec<RawAgent> = (0..3).map(|_| RawAgent::connect(&server)).collect();
    let mut ids = Vec::new();
    for agent in &mut agents {
        ids.push(agent.call(json!({"header": "GET_DATA"}))["agent_id"].clone());
    }
    assert_eq!(ids, vec![json!(0), json!(1), json!(2)]);
    let connected = agents[0].call(json!({"header": "GET_NB_CONNECTED_AGENTS"}));
    assert_eq!(connected["nb_connected_agents"], 3);

    agents[1].send(json!({
        "header": "BROADCAST_MSG",
        "type": "KEY_DISCOVERED",
        "position": {"x": 2, "y": 5},
        "owner": 2,
        "sender": 2
    }));
    let expected = json!({
        "header": "BROADCAST_MSG",
        "type": "KEY_DISCOVERED",
        "position": {"x": 2, "y": 5},
        "owner": 2,
        "sender": 1
    });
    assert_eq!(agents[0].recv().unwrap(), expected);
    assert_eq!(agents[2].recv().unwrap(), expected);

    // Replies keep flowing to the sender, with no copy of its own broadcast in between.
    let reply = agents[1].call(json!({"header": "GET_NB_AGENTS"}));
    assert_eq!(reply["header"], "GET_NB_AGENTS");
}

#[test]
fn full_session_refuses_extra_agents() {
    let server = start_server(1);
    let mut first = RawAgent::connect(&server);
    first.call(json!({"header": "GET_DATA"}));

    let mut extra = RawAgent::connect(&server);
    assert!(extra.recv().is_none());
}

#[test]
fn disconnect_frees_the_slot() {
    let server = start_server(1);
    let mut first = RawAgent::connect(&server);
    first.call(json!({"header": "GET_DATA"}));
    drop(first);

    let mut connected = usize::MAX;
    for _ in 0..100 {
        connected = server.hub().with_engine(|e| e.connected_count());
        if connected == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(connected, 0);
    let mut second = RawAgent::connect(&server);
    assert_eq!(second.call(json!({"header": "GET_DATA"}))["agent_id"], 0);
}

#[test]
fn connection_drives_the_engine() {
    let server = start_server(2);
    let config = AgentConfig::new().with_addr(server.local_addr().to_string());
    let mut finder = Connection::connect(&config).unwrap();
    let mut owner = Connection::connect(&config).unwrap();
    assert_eq!(finder.agent_id(), 0);
    assert_eq!(owner.agent_id(), 1);
    finder
        .wait_for_peers(Duration::from_millis(10), Some(Duration::from_secs(5)))
        .unwrap();

    // (1, 0) -> (1, 5): agent 1's key.
    let mut sample = finder.step(Direction::Right).unwrap();
    for _ in 0..5 {
        sample = finder.step(Direction::Down).unwrap();
    }
    assert_eq!(sample.position, Position::new(1, 5));
    assert_eq!(sample.value, Some(1.0));
    assert_eq!(
        finder.item_owner().unwrap(),
        OwnerReply::Owner(ItemOwner {
            owner: 1,
            kind: ItemKind::Key
        })
    );

    finder
        .broadcast(Broadcast {
            kind: BroadcastKind::KeyDiscovered,
            position: sample.position,
            owner: 1,
            sender: 0,
        })
        .unwrap();
    let mut learned = None;
    for _ in 0..100 {
        learned = owner.knowledge().remote_location(ItemKind::Key);
        if learned.is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(learned, Some(Position::new(1, 5)));
    assert_eq!(finder.knowledge().remote_location(ItemKind::Key), None);
    assert_eq!(
        owner.step(Direction::Stand).unwrap().position,
        Position::new(1, 0)
    );
}

#[test]
fn agent_run_stops_at_its_step_budget() {
    let server = start_server(1);
    let config = AgentConfig::new()
        .with_addr(server.local_addr().to_string())
        .with_seed(5)
        .with_max_steps(40)
        .with_peer_wait_limit(Duration::from_secs(5));
    let stats = run_agent(&config).unwrap();
    assert!(stats.steps <= 40);
    assert!(stats.distinct_cells > 1);
    assert_eq!(stats.agent_id, 0);
}

#[test]
fn server_shutdown_disconnects_agents() {
    let server = start_server(1);
    let config = AgentConfig::new().with_addr(server.local_addr().to_string());
    let mut connection = Connection::connect(&config).unwrap();
    server.shutdown();

    let mut stopped = false;
    for _ in 0..100 {
        if !connection.knowledge().is_running() {
            stopped = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(stopped);
    assert!(connection.step(Direction::Left).is_err());
}

/// Stand-in engine on a 10x10 grid that answers the first MOVE after `delay`. Each MOVE reply
/// puts the agent at `(n, 0)`, `n` counting the moves received so far.
fn slow_engine(delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;
        let mut moves = 0;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                break;
            }
            let request: Value = serde_json::from_str(&line).unwrap();
            let reply = match request["header"].as_str() {
                Some("GET_DATA") => json!({
                    "header": "GET_DATA", "agent_id": 0, "x": 0, "y": 0,
                    "w": 10, "h": 10, "cell_val": 0.0
                }),
                Some("MOVE") => {
                    moves += 1;
                    if moves == 1 {
                        thread::sleep(delay);
                    }
                    json!({"header": "MOVE", "x": moves, "y": 0, "cell_val": 0.0})
                }
                _ => continue,
            };
            if writeln!(writer, "{reply}").is_err() {
                break;
            }
        }
    });
    addr
}

#[test]
fn late_reply_is_not_taken_for_the_next_one() {
    let addr = slow_engine(Duration::from_millis(450));
    let config = AgentConfig::new()
        .with_addr(addr.to_string())
        .with_request_timeout(Duration::from_millis(300));
    let mut connection = Connection::connect(&config).unwrap();

    let first = connection.step(Direction::Right).unwrap();
    assert_eq!(first.value, None);
    // The answer to the first move lands while this one waits.
    let second = connection.step(Direction::Right).unwrap();
    assert_eq!(second.position, Position::new(2, 0));
    assert_eq!(second.value, Some(0.0));
    let third = connection.step(Direction::Right).unwrap();
    assert_eq!(third.position, Position::new(3, 0));
}
