//! The authoritative board store.
//!
//! ```text
//!   BoardSession ──▶ dyn BoardStore ──┬─▶ HttpBoardStore ──▶ REST API
//!                                     └─▶ MemoryStore (tests, demos)
//! ```
//!
//! Every failure is a [`StoreError`]; callers see it as
//! `SyncError::StoreUnavailable`.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use corkboard_core::{
    BoardId, Card, CardId, CardPosition, CardUpdate, Credential, List, ListId, ListPosition, NewCard, StoreError,
};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[async_trait]
pub trait BoardStore: Send + Sync {
    async fn lists(&self, board_id: BoardId) -> Result<Vec<List>, StoreError>;

    /// Create a list at the end of the board.
    async fn create_list(&self, board_id: BoardId, title: &str) -> Result<List, StoreError>;

    async fn update_list_positions(&self, positions: &[ListPosition]) -> Result<(), StoreError>;

    async fn delete_list(&self, list_id: ListId) -> Result<(), StoreError>;

    async fn cards(&self, list_id: ListId) -> Result<Vec<Card>, StoreError>;

    /// Create a card at the end of the list.
    async fn create_card(&self, list_id: ListId, card: &NewCard) -> Result<Card, StoreError>;

    async fn update_card(&self, card_id: CardId, update: &CardUpdate) -> Result<Card, StoreError>;

    async fn update_card_positions(&self, positions: &[CardPosition]) -> Result<(), StoreError>;

    async fn delete_card(&self, card_id: CardId) -> Result<(), StoreError>;
}

#[derive(Serialize)]
struct NewList<'a> {
    title: &'a str,
}

#[derive(Serialize)]
struct ListPositions<'a> {
    lists: &'a [ListPosition],
}

#[derive(Serialize)]
struct CardPositions<'a> {
    cards: &'a [CardPosition],
}

/// REST client for the board API.
pub struct HttpBoardStore {
    client: reqwest::Client,
    base_url: String,
    credential: Credential,
}

impl HttpBoardStore {
    pub fn new(base_url: impl Into<String>, credential: Credential) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, credential)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>, credential: Credential) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            credential,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(self.credential.expose())
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            log::warn!("Store rejected credential ({status})");
            return Err(StoreError::Unauthorized);
        }
        let message = response.text().await.unwrap_or_default();
        Err(StoreError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, StoreError> {
        let response = self.send(request).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn ack(&self, request: RequestBuilder) -> Result<(), StoreError> {
        self.send(request).await.map(|_| ())
    }
}

#[async_trait]
impl BoardStore for HttpBoardStore {
    async fn lists(&self, board_id: BoardId) -> Result<Vec<List>, StoreError> {
        self.fetch(self.request(Method::GET, &format!("/boards/{board_id}/lists")))
            .await
    }

    async fn create_list(&self, board_id: BoardId, title: &str) -> Result<List, StoreError> {
        let request = self
            .request(Method::POST, &format!("/boards/{board_id}/lists"))
            .json(&NewList { title });
        self.fetch(request).await
    }

    async fn update_list_positions(&self, positions: &[ListPosition]) -> Result<(), StoreError> {
        let request = self
            .request(Method::PUT, "/lists/positions")
            .json(&ListPositions { lists: positions });
        self.ack(request).await
    }

    async fn delete_list(&self, list_id: ListId) -> Result<(), StoreError> {
        self.ack(self.request(Method::DELETE, &format!("/lists/{list_id}")))
            .await
    }

    async fn cards(&self, list_id: ListId) -> Result<Vec<Card>, StoreError> {
        self.fetch(self.request(Method::GET, &format!("/lists/{list_id}/cards")))
            .await
    }

    async fn create_card(&self, list_id: ListId, card: &NewCard) -> Result<Card, StoreError> {
        let request = self
            .request(Method::POST, &format!("/lists/{list_id}/cards"))
            .json(card);
        self.fetch(request).await
    }

    async fn update_card(&self, card_id: CardId, update: &CardUpdate) -> Result<Card, StoreError> {
        let request = self
            .request(Method::PUT, &format!("/cards/{card_id}"))
            .json(update);
        self.fetch(request).await
    }

    async fn update_card_positions(&self, positions: &[CardPosition]) -> Result<(), StoreError> {
        let request = self
            .request(Method::PUT, "/cards/positions")
            .json(&CardPositions { cards: positions });
        self.ack(request).await
    }

    async fn delete_card(&self, card_id: CardId) -> Result<(), StoreError> {
        self.ack(self.request(Method::DELETE, &format!("/cards/{card_id}")))
            .await
    }
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    lists: BTreeMap<ListId, List>,
    cards: BTreeMap<CardId, Card>,
    fail_next: usize,
    offline: bool,
    revoked: bool,
    calls: usize,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn gate(&mut self) -> Result<(), StoreError> {
        self.calls += 1;
        if self.offline {
            return Err(StoreError::Transport("store offline".to_string()));
        }
        if self.revoked {
            return Err(StoreError::Unauthorized);
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(StoreError::Status {
                status: 500,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn list(&self, list_id: ListId) -> Result<&List, StoreError> {
        self.lists.get(&list_id).ok_or(StoreError::NotFound {
            kind: "list",
            id: list_id.0,
        })
    }

    fn card_mut(&mut self, card_id: CardId) -> Result<&mut Card, StoreError> {
        self.cards.get_mut(&card_id).ok_or(StoreError::NotFound {
            kind: "card",
            id: card_id.0,
        })
    }

    fn sorted<T: Clone>(items: impl Iterator<Item = T>, position: impl Fn(&T) -> i64) -> Vec<T> {
        let mut items: Vec<T> = items.collect();
        items.sort_by_key(|item| position(item));
        items
    }
}

/// In-memory authoritative store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a list directly, bypassing the failure gate.
    pub fn seed_list(&self, board_id: BoardId, title: impl Into<String>) -> List {
        let mut state = self.lock();
        let position = state.lists.values().filter(|l| l.board_id == board_id).count() as i64;
        let list = List {
            id: ListId(state.next_id()),
            title: title.into(),
            board_id,
            position,
        };
        state.lists.insert(list.id, list.clone());
        list
    }

    /// Seed a card directly, bypassing the failure gate.
    pub fn seed_card(&self, list: &List, title: impl Into<String>) -> Card {
        let mut state = self.lock();
        let position = state.cards.values().filter(|c| c.list_id == list.id).count() as i64;
        let card = Card {
            id: CardId(state.next_id()),
            title: title.into(),
            description: String::new(),
            status: Default::default(),
            list_id: list.id,
            board_id: list.board_id,
            position,
            assigned_to: None,
            due_date: None,
        };
        state.cards.insert(card.id, card.clone());
        card
    }

    /// Make the next `n` calls fail with a 500.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Answer every call as if the credential had expired.
    pub fn revoke_credentials(&self) {
        self.lock().revoked = true;
    }

    /// Calls made so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    pub fn list(&self, list_id: ListId) -> Option<List> {
        self.lock().lists.get(&list_id).cloned()
    }

    pub fn card(&self, card_id: CardId) -> Option<Card> {
        self.lock().cards.get(&card_id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BoardStore for MemoryStore {
    async fn lists(&self, board_id: BoardId) -> Result<Vec<List>, StoreError> {
        let mut state = self.lock();
        state.gate()?;
        let lists = state.lists.values().filter(|l| l.board_id == board_id).cloned();
        Ok(MemoryState::sorted(lists, |l| l.position))
    }

    async fn create_list(&self, board_id: BoardId, title: &str) -> Result<List, StoreError> {
        self.lock().gate()?;
        Ok(self.seed_list(board_id, title))
    }

    async fn update_list_positions(&self, positions: &[ListPosition]) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.gate()?;
        for entry in positions {
            state.list(entry.id)?;
        }
        for entry in positions {
            if let Some(list) = state.lists.get_mut(&entry.id) {
                list.position = entry.position;
            }
        }
        Ok(())
    }

    async fn delete_list(&self, list_id: ListId) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.gate()?;
        state.list(list_id)?;
        state.lists.remove(&list_id);
        state.cards.retain(|_, card| card.list_id != list_id);
        Ok(())
    }

    async fn cards(&self, list_id: ListId) -> Result<Vec<Card>, StoreError> {
        let mut state = self.lock();
        state.gate()?;
        state.list(list_id)?;
        let cards = state.cards.values().filter(|c| c.list_id == list_id).cloned();
        Ok(MemoryState::sorted(cards, |c| c.position))
    }

    async fn create_card(&self, list_id: ListId, card: &NewCard) -> Result<Card, StoreError> {
        let mut state = self.lock();
        state.gate()?;
        let board_id = state.list(list_id)?.board_id;
        let position = state.cards.values().filter(|c| c.list_id == list_id).count() as i64;
        let created = Card {
            id: CardId(state.next_id()),
            title: card.title.clone(),
            description: card.description.clone(),
            status: card.status,
            list_id,
            board_id,
            position,
            assigned_to: card.assigned_to,
            due_date: card.due_date,
        };
        state.cards.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_card(&self, card_id: CardId, update: &CardUpdate) -> Result<Card, StoreError> {
        let mut state = self.lock();
        state.gate()?;
        if let Some(list_id) = update.list_id {
            state.list(list_id)?;
        }
        let card = state.card_mut(card_id)?;
        card.title = update.title.clone();
        card.description = update.description.clone();
        card.status = update.status;
        card.assigned_to = update.assigned_to;
        card.due_date = update.due_date;
        if let Some(position) = update.position {
            card.position = position;
        }
        if let Some(list_id) = update.list_id {
            card.list_id = list_id;
        }
        Ok(card.clone())
    }

    async fn update_card_positions(&self, positions: &[CardPosition]) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.gate()?;
        for entry in positions {
            state.list(entry.list_id)?;
            state.card_mut(entry.id)?;
        }
        for entry in positions {
            let card = state.card_mut(entry.id)?;
            card.position = entry.position;
            card.list_id = entry.list_id;
        }
        Ok(())
    }

    async fn delete_card(&self, card_id: CardId) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.gate()?;
        state
            .cards
            .remove(&card_id)
            .map(|_| ())
            .ok_or(StoreError::NotFound {
                kind: "card",
                id: card_id.0,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn one_shot(status: &str, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}/api"), handle)
    }

    #[tokio::test]
    async fn test_http_lists_sends_bearer_and_decodes() {
        let body = r#"[{"id":1,"title":"To Do","board_id":5,"position":0}]"#;
        let (url, server) = one_shot("200 OK", body).await;
        let store = HttpBoardStore::new(url, Credential::new("tok-ana"));

        let lists = store.lists(BoardId(5)).await.unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].title, "To Do");

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/boards/5/lists "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer tok-ana"));
    }

    #[tokio::test]
    async fn test_http_position_update_body() {
        let (url, server) = one_shot("200 OK", "{}").await;
        let store = HttpBoardStore::new(url, Credential::new("tok"));
        let positions = [ListPosition { id: ListId(2), position: 0 }];
        store.update_list_positions(&positions).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("PUT /api/lists/positions "));
        assert!(request.contains(r#"{"lists":[{"id":2,"position":0}]}"#));
    }

    #[tokio::test]
    async fn test_http_unauthorized() {
        let (url, _server) = one_shot("403 Forbidden", "{}").await;
        let store = HttpBoardStore::new(url, Credential::new("tok"));
        assert_eq!(store.delete_card(CardId(1)).await, Err(StoreError::Unauthorized));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let (url, _server) = one_shot("500 Internal Server Error", "boom").await;
        let store = HttpBoardStore::new(url, Credential::new("tok"));
        assert_eq!(
            store.delete_list(ListId(1)).await,
            Err(StoreError::Status {
                status: 500,
                message: "boom".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_http_undecodable_body() {
        let (url, _server) = one_shot("200 OK", "not json").await;
        let store = HttpBoardStore::new(url, Credential::new("tok"));
        assert!(matches!(store.cards(ListId(1)).await, Err(StoreError::Decode(_))));
    }

    #[tokio::test]
    async fn test_http_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let store = HttpBoardStore::new(format!("http://127.0.0.1:{port}/api/"), Credential::new("tok"));
        assert_eq!(store.base_url(), format!("http://127.0.0.1:{port}/api"));
        assert!(matches!(store.lists(BoardId(1)).await, Err(StoreError::Transport(_))));
    }

    #[tokio::test]
    async fn test_memory_store_appends_positions() {
        let store = MemoryStore::new();
        let a = store.create_list(BoardId(1), "A").await.unwrap();
        let b = store.create_list(BoardId(1), "B").await.unwrap();
        store.create_list(BoardId(2), "Other").await.unwrap();
        assert_eq!((a.position, b.position), (0, 1));
        assert_eq!(store.lists(BoardId(1)).await.unwrap().len(), 2);

        let card = store.create_card(a.id, &NewCard::titled("x")).await.unwrap();
        assert_eq!(card.board_id, BoardId(1));
        assert_eq!(card.position, 0);
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryStore::new();
        let list = store.seed_list(BoardId(1), "A");
        store.fail_next(1);
        assert!(store.cards(list.id).await.is_err());
        assert!(store.cards(list.id).await.is_ok());

        store.set_offline(true);
        assert!(matches!(store.lists(BoardId(1)).await, Err(StoreError::Transport(_))));
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn test_memory_store_card_moves_between_lists() {
        let store = MemoryStore::new();
        let todo = store.seed_list(BoardId(1), "To Do");
        let done = store.seed_list(BoardId(1), "Done");
        let card = store.seed_card(&todo, "ship");

        store
            .update_card_positions(&[CardPosition {
                id: card.id,
                position: 0,
                list_id: done.id,
            }])
            .await
            .unwrap();
        assert_eq!(store.card(card.id).unwrap().list_id, done.id);
        assert!(store.cards(todo.id).await.unwrap().is_empty());

        let missing = [CardPosition {
            id: CardId(999),
            position: 0,
            list_id: done.id,
        }];
        assert!(matches!(
            store.update_card_positions(&missing).await,
            Err(StoreError::NotFound { kind: "card", .. })
        ));
    }
}
