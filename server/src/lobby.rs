//! Per-game state: the roster, the word list and the give-up votes.
//!
//! A [`Lobby`] owns its state behind its own mutex; callers only reach the
//! collections through the [`LobbyState`] methods while holding that lock.

use crate::client::Connection;
use indexmap::{IndexMap, IndexSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};

/// Outcome of a guess against the word list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Solved,
    AlreadySolved,
    UnknownWord,
}

/// The mutable part of a lobby, only reachable through the lobby's lock.
#[derive(Debug, Default)]
pub struct LobbyState {
    /// Join order is preserved. `None` marks a player who has left.
    players: IndexMap<String, Option<Connection>>,
    /// Submission order is preserved. The value is the answerer, if any.
    words: IndexMap<String, Option<String>>,
    giveups: IndexSet<String>,
}

impl LobbyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every player ever seen in this lobby with their connection status.
    pub fn roster(&self) -> impl Iterator<Item = (&str, bool)> + '_ {
        self.players
            .iter()
            .map(|(name, conn)| (name.as_str(), conn.is_some()))
    }

    pub fn has_any_players(&self) -> bool {
        !self.players.is_empty()
    }

    pub fn is_connected(&self, name: &str) -> bool {
        matches!(self.players.get(name), Some(Some(_)))
    }

    pub fn connected_count(&self) -> usize {
        self.players.values().filter(|conn| conn.is_some()).count()
    }

    /// Connections of every connected player except `exclude`, in join order.
    pub fn connections_except<'a>(
        &'a self,
        exclude: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.players
            .iter()
            .filter(move |(name, _)| Some(name.as_str()) != exclude)
            .filter_map(|(_, conn)| conn.as_ref())
    }

    /// Adds a new player at the end of the roster, or reconnects a
    /// returning one in place.
    pub fn add_or_rejoin_player(&mut self, name: &str, conn: Connection) {
        match self.players.get_mut(name) {
            Some(slot) => *slot = Some(conn),
            None => {
                self.players.insert(name.to_string(), Some(conn));
            }
        }
    }

    pub fn record_word(&mut self, word: &str, answerer: Option<&str>) {
        self.words
            .insert(word.to_string(), answerer.map(str::to_string));
    }

    /// Credits `player` with `word` unless it is unknown or already taken.
    pub fn attempt_word(&mut self, word: &str, player: &str) -> AttemptOutcome {
        match self.words.get_mut(word) {
            None => AttemptOutcome::UnknownWord,
            Some(answerer) if answerer.is_some() => AttemptOutcome::AlreadySolved,
            Some(answerer) => {
                *answerer = Some(player.to_string());
                AttemptOutcome::Solved
            }
        }
    }

    pub fn words(&self) -> impl Iterator<Item = &str> + '_ {
        self.words.keys().map(String::as_str)
    }

    /// Solved words with their answerer, in submission order.
    pub fn solved_words(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.words
            .iter()
            .filter_map(|(word, answerer)| answerer.as_deref().map(|a| (word.as_str(), a)))
    }

    pub fn answerer(&self, word: &str) -> Option<&str> {
        self.words.get(word).and_then(|a| a.as_deref())
    }

    /// Keeps the player's name in the roster but drops the connection and
    /// any give-up vote.
    pub fn mark_disconnected(&mut self, name: &str) {
        if let Some(slot) = self.players.get_mut(name) {
            *slot = None;
        }
        self.giveups.shift_remove(name);
    }

    pub fn toggle_giveup(&mut self, name: &str, wants: bool) {
        if wants {
            self.giveups.insert(name.to_string());
        } else {
            self.giveups.shift_remove(name);
        }
    }

    pub fn giveups(&self) -> impl Iterator<Item = &str> + '_ {
        self.giveups.iter().map(String::as_str)
    }

    pub fn is_giveup_unanimous(&self) -> bool {
        self.giveups.len() >= self.connected_count()
    }
}

/// One game instance, owning its state behind a dedicated lock.
#[derive(Debug)]
pub struct Lobby {
    id: String,
    state: Arc<Mutex<LobbyState>>,
}

impl Lobby {
    pub fn new(id: String) -> Self {
        Lobby {
            id,
            state: Arc::new(Mutex::new(LobbyState::new())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, LobbyState> {
        self.state.lock().await
    }

    /// Like [`Lobby::lock`] but the guard does not borrow the lobby, so it
    /// can outlive a registry lock the lobby was found under.
    pub async fn lock_owned(&self) -> OwnedMutexGuard<LobbyState> {
        Arc::clone(&self.state).lock_owned().await
    }
}
