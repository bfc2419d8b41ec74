//! Per-connection protocol state machine
//!
//! A [`Session`] walks one connection through four phases. Hosts go
//! JustConnected -> ReceivingWords -> Playing, joiners go
//! JustConnected -> GettingName -> Playing. Messages that do not fit the
//! current phase are dropped without a reply.
//!
//! Every read or write of a lobby's collections, including the broadcasts
//! that follow from it, happens inside a single hold of that lobby's lock.

use crate::client::Connection;
use crate::lobby::{Lobby, LobbyState};
use crate::registry::LobbyRegistry;
use log::{debug, info};
use shared::{is_valid_name, split_command, ServerMessage, WordSubmission};
use std::sync::Arc;

/// Where a connection is in the protocol.
#[derive(Debug)]
pub enum Phase {
    JustConnected,
    /// Host is listing the lobby's words.
    ReceivingWords { lobby: Arc<Lobby>, name: String },
    /// Joiner has seen the roster and must pick a name.
    GettingName { lobby: Arc<Lobby> },
    Playing { lobby: Arc<Lobby>, name: String },
    /// Connection was refused; nothing more is accepted.
    Closed,
}

/// Whether the transport should keep reading from the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnect,
}

pub struct Session {
    conn: Connection,
    registry: Arc<LobbyRegistry>,
    phase: Phase,
}

impl Session {
    pub fn new(conn: Connection, registry: Arc<LobbyRegistry>) -> Self {
        Session {
            conn,
            registry,
            phase: Phase::JustConnected,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Name this connection plays under, once it has one.
    pub fn player_name(&self) -> Option<&str> {
        match &self.phase {
            Phase::ReceivingWords { name, .. } | Phase::Playing { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn lobby(&self) -> Option<&Arc<Lobby>> {
        match &self.phase {
            Phase::ReceivingWords { lobby, .. }
            | Phase::GettingName { lobby }
            | Phase::Playing { lobby, .. } => Some(lobby),
            _ => None,
        }
    }

    /// Handles one text message from the peer.
    pub async fn handle_message(&mut self, msg: &str) -> Flow {
        let phase = std::mem::replace(&mut self.phase, Phase::Closed);
        let (phase, flow) = match phase {
            Phase::JustConnected => self.on_first_message(msg).await,
            Phase::ReceivingWords { lobby, name } => self.on_word(lobby, name, msg).await,
            Phase::GettingName { lobby } => self.on_name(lobby, msg).await,
            Phase::Playing { lobby, name } => {
                self.on_play(&lobby, &name, msg).await;
                (Phase::Playing { lobby, name }, Flow::Continue)
            }
            Phase::Closed => (Phase::Closed, Flow::Disconnect),
        };
        self.phase = phase;
        flow
    }

    /// Handles the connection going away. Only players that made it into
    /// a game leave a trace to clean up.
    pub async fn on_close(&mut self) {
        let Phase::Playing { lobby, name } = std::mem::replace(&mut self.phase, Phase::Closed)
        else {
            return;
        };

        let abandoned = {
            let mut state = lobby.lock().await;
            state.mark_disconnected(&name);
            if state.connected_count() > 0 {
                announce(&state, &ServerMessage::Quit(name.clone()), None).await;
                if state.is_giveup_unanimous() {
                    announce(&state, &ServerMessage::AllGiveUp, None).await;
                }
                false
            } else {
                true
            }
        };
        info!("{} left lobby {}", name, lobby.id());

        if abandoned {
            self.registry.remove_if_abandoned(&lobby).await;
        }
    }

    async fn on_first_message(&mut self, msg: &str) -> (Phase, Flow) {
        match split_command(msg) {
            (shared::HOST, Some(name)) => {
                if !is_valid_name(name) {
                    self.conn.send_and_close(&ServerMessage::BadName).await;
                    return (Phase::Closed, Flow::Disconnect);
                }
                let lobby = self.registry.create_lobby().await;
                info!("{} is hosting lobby {}", name, lobby.id());
                let phase = Phase::ReceivingWords {
                    lobby,
                    name: name.to_string(),
                };
                (phase, Flow::Continue)
            }
            (shared::JOIN, Some(id)) => {
                let Some((lobby, state)) = self.registry.open_lobby(id).await else {
                    self.conn.send_and_close(&ServerMessage::NoLobby).await;
                    return (Phase::Closed, Flow::Disconnect);
                };
                if !state.has_any_players() {
                    drop(state);
                    self.conn.send_and_close(&ServerMessage::NoLobby).await;
                    return (Phase::Closed, Flow::Disconnect);
                }

                for (name, connected) in state.roster() {
                    let entry = ServerMessage::Player {
                        connected,
                        name: name.to_string(),
                    };
                    self.conn.send(&entry).await;
                }
                self.conn.send(&ServerMessage::EndPlayers).await;
                drop(state);

                (Phase::GettingName { lobby }, Flow::Continue)
            }
            _ => {
                debug!("Ignoring message before host/join: {:?}", msg);
                (Phase::JustConnected, Flow::Continue)
            }
        }
    }

    async fn on_word(&mut self, lobby: Arc<Lobby>, name: String, msg: &str) -> (Phase, Flow) {
        let mut state = lobby.lock().await;
        match WordSubmission::parse(msg) {
            WordSubmission::Done => {
                state.add_or_rejoin_player(&name, self.conn.clone());
                self.conn
                    .send(&ServerMessage::LobbyId(lobby.id().to_string()))
                    .await;
                drop(state);
                (Phase::Playing { lobby, name }, Flow::Continue)
            }
            WordSubmission::Word { word, presolved } => {
                let answerer = presolved.then_some(name.as_str());
                state.record_word(word, answerer);
                drop(state);
                (Phase::ReceivingWords { lobby, name }, Flow::Continue)
            }
        }
    }

    async fn on_name(&mut self, lobby: Arc<Lobby>, name: &str) -> (Phase, Flow) {
        let mut state = lobby.lock().await;
        if !is_valid_name(name) || state.is_connected(name) {
            self.conn.send(&ServerMessage::BadName).await;
            drop(state);
            return (Phase::GettingName { lobby }, Flow::Continue);
        }

        self.send_catch_up(&state).await;

        // A late joiner inherits a give-up the group already agreed on. A
        // lobby whose players have all left has no group to agree.
        if state.connected_count() > 0 && state.is_giveup_unanimous() {
            announce(&state, &ServerMessage::AllGiveUp, Some(name)).await;
            state.toggle_giveup(name, true);
        }

        announce(&state, &ServerMessage::Join(name.to_string()), Some(name)).await;
        state.add_or_rejoin_player(name, self.conn.clone());
        drop(state);

        info!("{} joined lobby {}", name, lobby.id());
        let phase = Phase::Playing {
            lobby,
            name: name.to_string(),
        };
        (phase, Flow::Continue)
    }

    // Words, solved words and current votes for a player entering the game
    async fn send_catch_up(&self, state: &LobbyState) {
        for word in state.words() {
            self.conn.send(&ServerMessage::Word(word.to_string())).await;
        }
        self.conn.send(&ServerMessage::EndWords).await;

        for (word, answerer) in state.solved_words() {
            let attempt = ServerMessage::Attempt {
                word: word.to_string(),
                player: answerer.to_string(),
            };
            self.conn.send(&attempt).await;
        }

        for voter in state.giveups() {
            self.conn.send(&ServerMessage::GiveUp(voter.to_string())).await;
        }
    }

    async fn on_play(&mut self, lobby: &Lobby, name: &str, msg: &str) {
        match split_command(msg) {
            (shared::ATTEMPT, Some(word)) => {
                let mut state = lobby.lock().await;
                let outcome = state.attempt_word(word, name);
                debug!("{} attempted {:?} in lobby {}: {:?}", name, word, lobby.id(), outcome);
                let attempt = ServerMessage::Attempt {
                    word: word.to_string(),
                    player: name.to_string(),
                };
                announce(&state, &attempt, Some(name)).await;
            }
            (shared::GIVE_UP, _) => {
                let mut state = lobby.lock().await;
                state.toggle_giveup(name, true);
                announce(&state, &ServerMessage::GiveUp(name.to_string()), Some(name)).await;
                if state.is_giveup_unanimous() {
                    announce(&state, &ServerMessage::AllGiveUp, None).await;
                }
            }
            (shared::UNGIVE_UP, _) => {
                let mut state = lobby.lock().await;
                state.toggle_giveup(name, false);
                announce(&state, &ServerMessage::UngiveUp(name.to_string()), Some(name)).await;
            }
            _ => debug!("Ignoring message from {} while playing: {:?}", name, msg),
        }
    }
}

/// Sends `message` to every connected player in the lobby except `exclude`.
pub async fn announce(state: &LobbyState, message: &ServerMessage, exclude: Option<&str>) {
    for conn in state.connections_except(exclude) {
        conn.send(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Outgoing;
    use tokio::sync::mpsc;

    struct TestPeer {
        session: Session,
        rx: mpsc::Receiver<Outgoing>,
    }

    impl TestPeer {
        fn new(id: u64, registry: &Arc<LobbyRegistry>) -> Self {
            let (tx, rx) = mpsc::channel(64);
            let session = Session::new(Connection::new(id, tx), Arc::clone(registry));
            TestPeer { session, rx }
        }

        async fn send(&mut self, msg: &str) -> Flow {
            self.session.handle_message(msg).await
        }

        fn received(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                match frame {
                    Outgoing::Text(text) => out.push(text),
                    Outgoing::Close => out.push("<close>".to_string()),
                }
            }
            out
        }
    }

    async fn host_game(registry: &Arc<LobbyRegistry>, words: &[&str]) -> (TestPeer, String) {
        let mut host = TestPeer::new(1, registry);
        assert_eq!(host.send(":host alice").await, Flow::Continue);
        for word in words {
            host.send(word).await;
        }
        host.send(":endwords").await;
        let id = host.received().pop().unwrap();
        (host, id)
    }

    async fn join_game(
        registry: &Arc<LobbyRegistry>,
        id: u64,
        lobby: &str,
        name: &str,
    ) -> TestPeer {
        let mut peer = TestPeer::new(id, registry);
        peer.send(&format!(":join {}", lobby)).await;
        peer.send(name).await;
        peer.received();
        peer
    }

    #[tokio::test]
    async fn test_host_with_bad_name_is_refused() {
        let registry = Arc::new(LobbyRegistry::new());
        let mut peer = TestPeer::new(1, &registry);

        assert_eq!(peer.send(":host bad name!").await, Flow::Disconnect);
        assert_eq!(peer.received(), vec![":badname", "<close>"]);
        assert!(matches!(peer.session.phase(), Phase::Closed));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_host_flow() {
        let registry = Arc::new(LobbyRegistry::new());
        let mut host = TestPeer::new(1, &registry);

        host.send(":host alice").await;
        assert!(matches!(host.session.phase(), Phase::ReceivingWords { .. }));
        assert_eq!(host.session.player_name(), Some("alice"));

        host.send("cat").await;
        host.send("dog y").await;
        assert!(host.received().is_empty());

        host.send(":endwords").await;
        let lobby = Arc::clone(host.session.lobby().unwrap());
        assert_eq!(host.received(), vec![lobby.id().to_string()]);
        assert!(matches!(host.session.phase(), Phase::Playing { .. }));

        let state = lobby.lock().await;
        assert_eq!(state.roster().collect::<Vec<_>>(), vec![("alice", true)]);
        assert_eq!(state.answerer("dog"), Some("alice"));
        assert_eq!(state.answerer("cat"), None);
    }

    #[tokio::test]
    async fn test_join_missing_or_unready_lobby() {
        let registry = Arc::new(LobbyRegistry::new());

        let mut peer = TestPeer::new(1, &registry);
        assert_eq!(peer.send(":join 12345").await, Flow::Disconnect);
        assert_eq!(peer.received(), vec![":nolobby", "<close>"]);

        let mut host = TestPeer::new(2, &registry);
        host.send(":host alice").await;
        let id = host.session.lobby().unwrap().id().to_string();

        let mut early = TestPeer::new(3, &registry);
        assert_eq!(early.send(&format!(":join {}", id)).await, Flow::Disconnect);
        assert_eq!(early.received(), vec![":nolobby", "<close>"]);
    }

    #[tokio::test]
    async fn test_joiner_catch_up() {
        let registry = Arc::new(LobbyRegistry::new());
        let (mut host, id) = host_game(&registry, &["cat", "dog y"]).await;

        let mut bob = TestPeer::new(2, &registry);
        bob.send(&format!(":join {}", id)).await;
        assert_eq!(bob.received(), vec![":player y alice", ":endplayers"]);
        assert!(matches!(bob.session.phase(), Phase::GettingName { .. }));

        bob.send("bob").await;
        assert_eq!(
            bob.received(),
            vec!["cat", "dog", ":endwords", ":attempt dog alice"]
        );
        assert_eq!(host.received(), vec![":join bob"]);

        let lobby = Arc::clone(bob.session.lobby().unwrap());
        let state = lobby.lock().await;
        assert_eq!(
            state.roster().collect::<Vec<_>>(),
            vec![("alice", true), ("bob", true)]
        );
    }

    #[tokio::test]
    async fn test_name_retry_after_rejection() {
        let registry = Arc::new(LobbyRegistry::new());
        let (_host, id) = host_game(&registry, &["cat"]).await;

        let mut peer = TestPeer::new(2, &registry);
        peer.send(&format!(":join {}", id)).await;
        peer.received();

        assert_eq!(peer.send("alice").await, Flow::Continue);
        assert_eq!(peer.received(), vec![":badname"]);
        assert_eq!(peer.send("not valid").await, Flow::Continue);
        assert_eq!(peer.received(), vec![":badname"]);
        assert!(matches!(peer.session.phase(), Phase::GettingName { .. }));

        peer.send("bob").await;
        assert!(matches!(peer.session.phase(), Phase::Playing { .. }));
    }

    #[tokio::test]
    async fn test_attempt_is_broadcast_whatever_the_outcome() {
        let registry = Arc::new(LobbyRegistry::new());
        let (mut host, id) = host_game(&registry, &["cat", "dog y"]).await;
        let mut bob = join_game(&registry, 2, &id, "bob").await;
        host.received();

        bob.send(":attempt dog").await;
        bob.send(":attempt cat").await;
        bob.send(":attempt emu").await;

        assert_eq!(
            host.received(),
            vec![":attempt dog bob", ":attempt cat bob", ":attempt emu bob"]
        );
        assert!(bob.received().is_empty());

        let lobby = Arc::clone(bob.session.lobby().unwrap());
        let state = lobby.lock().await;
        assert_eq!(state.answerer("dog"), Some("alice"));
        assert_eq!(state.answerer("cat"), Some("bob"));
        assert_eq!(state.words().count(), 2);
    }

    #[tokio::test]
    async fn test_unanimous_giveup() {
        let registry = Arc::new(LobbyRegistry::new());
        let (mut host, id) = host_game(&registry, &["cat"]).await;
        let mut bob = join_game(&registry, 2, &id, "bob").await;
        host.received();

        host.send(":giveup").await;
        assert_eq!(bob.received(), vec![":giveup alice"]);
        assert!(host.received().is_empty());

        bob.send(":giveup").await;
        assert_eq!(host.received(), vec![":giveup bob", ":allgiveup"]);
        assert_eq!(bob.received(), vec![":allgiveup"]);

        bob.send(":ungiveup").await;
        assert_eq!(host.received(), vec![":ungiveup bob"]);
        assert!(bob.received().is_empty());
    }

    #[tokio::test]
    async fn test_late_joiner_inherits_giveup() {
        let registry = Arc::new(LobbyRegistry::new());
        let (mut host, id) = host_game(&registry, &["cat"]).await;
        host.send(":giveup").await;
        assert_eq!(host.received(), vec![":allgiveup"]);

        let mut bob = TestPeer::new(2, &registry);
        bob.send(&format!(":join {}", id)).await;
        bob.received();
        bob.send("bob").await;
        assert_eq!(bob.received(), vec!["cat", ":endwords", ":giveup alice"]);
        assert_eq!(host.received(), vec![":allgiveup", ":join bob"]);

        let lobby = Arc::clone(bob.session.lobby().unwrap());
        let state = lobby.lock().await;
        assert_eq!(state.giveups().collect::<Vec<_>>(), vec!["alice", "bob"]);
        assert!(state.is_giveup_unanimous());
    }

    #[tokio::test]
    async fn test_giveup_can_be_reached_again() {
        let registry = Arc::new(LobbyRegistry::new());
        let (mut host, id) = host_game(&registry, &["cat"]).await;
        let mut bob = join_game(&registry, 2, &id, "bob").await;
        host.received();

        host.send(":giveup").await;
        bob.send(":giveup").await;
        assert_eq!(host.received(), vec![":giveup bob", ":allgiveup"]);
        assert_eq!(bob.received(), vec![":giveup alice", ":allgiveup"]);

        bob.send(":ungiveup").await;
        assert_eq!(host.received(), vec![":ungiveup bob"]);
        assert!(bob.received().is_empty());

        bob.send(":giveup").await;
        assert_eq!(host.received(), vec![":giveup bob", ":allgiveup"]);
        assert_eq!(bob.received(), vec![":allgiveup"]);
    }

    #[tokio::test]
    async fn test_catch_up_lists_votes_in_order() {
        let registry = Arc::new(LobbyRegistry::new());
        let (mut host, id) = host_game(&registry, &["cat", "dog y"]).await;
        let mut bob = join_game(&registry, 2, &id, "bob").await;
        let mut carol = join_game(&registry, 3, &id, "carol").await;

        carol.send(":giveup").await;
        host.send(":giveup").await;
        host.received();
        bob.received();
        carol.received();

        let mut dave = TestPeer::new(4, &registry);
        dave.send(&format!(":join {}", id)).await;
        dave.received();
        dave.send("dave").await;
        assert_eq!(
            dave.received(),
            vec![
                "cat",
                "dog",
                ":endwords",
                ":attempt dog alice",
                ":giveup carol",
                ":giveup alice"
            ]
        );
        assert_eq!(host.received(), vec![":join dave"]);
        assert_eq!(bob.received(), vec![":join dave"]);

        let lobby = Arc::clone(dave.session.lobby().unwrap());
        let state = lobby.lock().await;
        assert_eq!(state.giveups().collect::<Vec<_>>(), vec!["carol", "alice"]);
    }

    #[tokio::test]
    async fn test_voter_quitting_drops_vote() {
        let registry = Arc::new(LobbyRegistry::new());
        let (mut host, id) = host_game(&registry, &["cat"]).await;
        let mut bob = join_game(&registry, 2, &id, "bob").await;
        let mut carol = join_game(&registry, 3, &id, "carol").await;

        bob.send(":giveup").await;
        host.received();
        carol.received();

        bob.session.on_close().await;
        assert_eq!(host.received(), vec![":quit bob"]);
        assert_eq!(carol.received(), vec![":quit bob"]);

        let lobby = Arc::clone(host.session.lobby().unwrap());
        let state = lobby.lock().await;
        assert_eq!(state.giveups().count(), 0);
        assert_eq!(
            state.roster().collect::<Vec<_>>(),
            vec![("alice", true), ("bob", false), ("carol", true)]
        );
    }

    #[tokio::test]
    async fn test_joiner_of_deserted_lobby_does_not_inherit_giveup() {
        let registry = Arc::new(LobbyRegistry::new());
        let lobby = registry.create_lobby().await;
        {
            let (tx, _rx) = mpsc::channel(4);
            let mut state = lobby.lock().await;
            state.record_word("cat", None);
            state.add_or_rejoin_player("alice", Connection::new(1, tx));
            state.mark_disconnected("alice");
        }

        let mut bob = TestPeer::new(2, &registry);
        bob.send(&format!(":join {}", lobby.id())).await;
        assert_eq!(bob.received(), vec![":player n alice", ":endplayers"]);
        bob.send("bob").await;
        assert_eq!(bob.received(), vec!["cat", ":endwords"]);

        let state = lobby.lock().await;
        assert_eq!(state.giveups().count(), 0);
        assert!(!state.is_giveup_unanimous());
    }

    #[tokio::test]
    async fn test_quit_and_lobby_teardown() {
        let registry = Arc::new(LobbyRegistry::new());
        let (mut host, id) = host_game(&registry, &["cat"]).await;
        let mut bob = join_game(&registry, 2, &id, "bob").await;
        host.received();

        bob.session.on_close().await;
        assert_eq!(host.received(), vec![":quit bob"]);
        assert!(registry.lookup_lobby(&id).await.is_some());

        host.session.on_close().await;
        assert!(registry.lookup_lobby(&id).await.is_none());

        let mut late = TestPeer::new(3, &registry);
        assert_eq!(late.send(&format!(":join {}", id)).await, Flow::Disconnect);
        assert_eq!(late.received(), vec![":nolobby", "<close>"]);
    }

    #[tokio::test]
    async fn test_quit_completes_giveup() {
        let registry = Arc::new(LobbyRegistry::new());
        let (mut host, id) = host_game(&registry, &["cat"]).await;
        let mut bob = join_game(&registry, 2, &id, "bob").await;
        host.received();

        host.send(":giveup").await;
        bob.received();

        bob.session.on_close().await;
        assert_eq!(host.received(), vec![":quit bob", ":allgiveup"]);
    }

    #[tokio::test]
    async fn test_rejoin_as_ghost() {
        let registry = Arc::new(LobbyRegistry::new());
        let (mut host, id) = host_game(&registry, &["cat"]).await;
        let mut bob = join_game(&registry, 2, &id, "bob").await;
        bob.session.on_close().await;
        host.received();

        let mut back = TestPeer::new(3, &registry);
        back.send(&format!(":join {}", id)).await;
        assert_eq!(
            back.received(),
            vec![":player y alice", ":player n bob", ":endplayers"]
        );
        back.send("bob").await;
        assert_eq!(host.received(), vec![":join bob"]);

        let lobby = Arc::clone(back.session.lobby().unwrap());
        let state = lobby.lock().await;
        assert_eq!(
            state.roster().collect::<Vec<_>>(),
            vec![("alice", true), ("bob", true)]
        );
    }

    #[tokio::test]
    async fn test_malformed_messages_are_ignored() {
        let registry = Arc::new(LobbyRegistry::new());
        let mut peer = TestPeer::new(1, &registry);

        assert_eq!(peer.send("hello").await, Flow::Continue);
        assert_eq!(peer.send(":host").await, Flow::Continue);
        assert_eq!(peer.send(":join").await, Flow::Continue);
        assert!(matches!(peer.session.phase(), Phase::JustConnected));
        assert!(peer.received().is_empty());

        let (mut host, _id) = host_game(&registry, &["cat"]).await;
        assert_eq!(host.send(":attempt").await, Flow::Continue);
        assert_eq!(host.send("cat").await, Flow::Continue);
        assert_eq!(host.send(":bogus x").await, Flow::Continue);
        assert!(host.received().is_empty());

        let lobby = Arc::clone(host.session.lobby().unwrap());
        assert_eq!(lobby.lock().await.answerer("cat"), None);
    }

    #[tokio::test]
    async fn test_close_before_playing_leaves_lobby() {
        let registry = Arc::new(LobbyRegistry::new());
        let mut host = TestPeer::new(1, &registry);
        host.send(":host alice").await;

        host.session.on_close().await;
        assert_eq!(registry.len().await, 1);
    }
}
