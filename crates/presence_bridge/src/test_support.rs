//! In-memory proxy double for unit tests.

use crate::error::ProxyError;
use crate::proxy::ProxyHandle;
use crate::types::{LocalPlayer, MessageBody, PlayerId};
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Default)]
struct ProxyState {
    players: Vec<LocalPlayer>,
    moves: Vec<(PlayerId, String)>,
    messages: Vec<(PlayerId, MessageBody)>,
    broadcasts: Vec<MessageBody>,
    kicks: Vec<(PlayerId, String)>,
}

pub(crate) struct RecordingProxy {
    backends: Vec<String>,
    state: Mutex<ProxyState>,
}

impl RecordingProxy {
    pub(crate) fn new(backends: &[&str]) -> Self {
        Self {
            backends: backends.iter().map(|b| b.to_string()).collect(),
            state: Mutex::new(ProxyState::default()),
        }
    }

    pub(crate) fn connect(&self, name: &str, backend: Option<&str>) -> PlayerId {
        let mut state = self.state.lock().unwrap();
        let port = 40000 + state.players.len() as u16;
        let player = LocalPlayer {
            id: PlayerId::new(),
            name: name.to_string(),
            remote: format!("10.0.0.1:{}", port).parse().unwrap(),
            backend: backend.map(str::to_string),
        };
        let id = player.id;
        state.players.push(player);
        id
    }

    pub(crate) fn moves(&self) -> Vec<(PlayerId, String)> {
        self.state.lock().unwrap().moves.clone()
    }

    pub(crate) fn messages(&self) -> Vec<(PlayerId, MessageBody)> {
        self.state.lock().unwrap().messages.clone()
    }

    pub(crate) fn broadcasts(&self) -> Vec<MessageBody> {
        self.state.lock().unwrap().broadcasts.clone()
    }

    pub(crate) fn kicks(&self) -> Vec<(PlayerId, String)> {
        self.state.lock().unwrap().kicks.clone()
    }
}

#[async_trait]
impl ProxyHandle for RecordingProxy {
    fn local_players(&self) -> Vec<LocalPlayer> {
        self.state.lock().unwrap().players.clone()
    }

    fn find_local(&self, name: &str) -> Option<LocalPlayer> {
        self.state
            .lock()
            .unwrap()
            .players
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    fn backend_names(&self) -> Vec<String> {
        self.backends.clone()
    }

    async fn connect_to_backend(&self, player: PlayerId, backend: &str) -> Result<(), ProxyError> {
        let mut state = self.state.lock().unwrap();
        let Some(local) = state.players.iter_mut().find(|p| p.id == player) else {
            return Err(ProxyError::NotConnected(player.to_string()));
        };
        local.backend = Some(backend.to_string());
        state.moves.push((player, backend.to_string()));
        Ok(())
    }

    async fn send_message(&self, player: PlayerId, body: MessageBody) -> Result<(), ProxyError> {
        self.state.lock().unwrap().messages.push((player, body));
        Ok(())
    }

    async fn broadcast(&self, body: MessageBody) -> Result<(), ProxyError> {
        self.state.lock().unwrap().broadcasts.push(body);
        Ok(())
    }

    async fn disconnect(&self, player: PlayerId, reason: &str) -> Result<(), ProxyError> {
        let mut state = self.state.lock().unwrap();
        state.players.retain(|p| p.id != player);
        state.kicks.push((player, reason.to_string()));
        Ok(())
    }
}
