//! Process-wide table of active lobbies.
//!
//! The registry lock is always taken before any lobby lock. Nothing holds a
//! lobby lock while waiting for the registry.

use crate::lobby::{Lobby, LobbyState};
use log::info;
use rand::Rng;
use shared::LOBBY_ID_UPPER;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct LobbyRegistry {
    lobbies: Mutex<HashMap<String, Arc<Lobby>>>,
}

impl LobbyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh id and registers an empty lobby under it.
    pub async fn create_lobby(&self) -> Arc<Lobby> {
        let mut lobbies = self.lobbies.lock().await;
        let id = unused_id(&lobbies);
        let lobby = Arc::new(Lobby::new(id.clone()));
        lobbies.insert(id.clone(), Arc::clone(&lobby));
        info!("Created lobby {} ({} active)", id, lobbies.len());
        lobby
    }

    pub async fn lookup_lobby(&self, id: &str) -> Option<Arc<Lobby>> {
        self.lobbies.lock().await.get(id).cloned()
    }

    /// Looks up a lobby and locks it before letting go of the registry.
    pub async fn open_lobby(
        &self,
        id: &str,
    ) -> Option<(Arc<Lobby>, OwnedMutexGuard<LobbyState>)> {
        let lobbies = self.lobbies.lock().await;
        let lobby = Arc::clone(lobbies.get(id)?);
        let state = lobby.lock_owned().await;
        drop(lobbies);
        Some((lobby, state))
    }

    pub async fn delete_lobby(&self, id: &str) -> bool {
        let mut lobbies = self.lobbies.lock().await;
        remove_entry(&mut lobbies, id)
    }

    /// Removes `lobby` if nobody is connected to it any more.
    ///
    /// The caller must not hold the lobby's lock. A player may have joined
    /// between the caller's own check and this call, so the roster is looked
    /// at again under registry then lobby lock.
    pub async fn remove_if_abandoned(&self, lobby: &Arc<Lobby>) -> bool {
        let mut lobbies = self.lobbies.lock().await;
        match lobbies.get(lobby.id()) {
            Some(current) if Arc::ptr_eq(current, lobby) => {}
            _ => return false,
        }

        let state = lobby.lock().await;
        if state.connected_count() > 0 {
            return false;
        }
        remove_entry(&mut lobbies, lobby.id())
    }

    /// Ids of the lobbies active right now.
    pub async fn ids(&self) -> Vec<String> {
        self.lobbies.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.lobbies.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.lobbies.lock().await.is_empty()
    }
}

fn remove_entry(lobbies: &mut HashMap<String, Arc<Lobby>>, id: &str) -> bool {
    let removed = lobbies.remove(id).is_some();
    if removed {
        info!("Deleted lobby {} ({} active)", id, lobbies.len());
    }
    removed
}

// Callers hold the registry lock across this call and the insert.
fn unused_id(lobbies: &HashMap<String, Arc<Lobby>>) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let id = rng.gen_range(0..LOBBY_ID_UPPER).to_string();
        if !lobbies.contains_key(&id) {
            return id;
        }
    }
}
