use super::*;
use crate::conversation::Generation;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Canned backlog per peer, with an optional per-peer delay.
#[derive(Default)]
struct FakeApi {
    backlogs: HashMap<UserId, Vec<Message>>,
    delays: HashMap<UserId, Duration>,
    tokens: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl MessageApi for FakeApi {
    async fn fetch_history(&self, peer_id: UserId, auth_token: &str) -> Result<Vec<Message>, ApiError> {
        self.tokens.lock().unwrap().push(auth_token.to_owned());
        if let Some(delay) = self.delays.get(&peer_id) {
            tokio::time::sleep(*delay).await;
        }
        self.backlogs
            .get(&peer_id)
            .cloned()
            .ok_or(ApiError::Status { status: 503, body: "unavailable".into() })
    }
}

fn message(id: i64, from: i64, to: i64) -> Message {
    Message {
        id: crate::model::MessageId(id),
        sender_id: UserId(from),
        recipient_id: UserId(to),
        content: format!("m{id}"),
        created_at: String::new(),
    }
}

fn ticket(generation: u64, peer: i64) -> HistoryTicket {
    HistoryTicket { generation: Generation(generation), peer_id: UserId(peer) }
}

#[tokio::test]
async fn fetch_passes_token_and_returns_backlog() {
    let mut api = FakeApi::default();
    api.backlogs.insert(UserId(2), vec![message(1, 1, 2), message(2, 2, 1)]);
    let api = Arc::new(api);
    let loader = HistoryLoader::new(api.clone());

    let messages = loader.fetch(UserId(2), "tok").await.unwrap();

    assert_eq!(messages.len(), 2);
    assert_eq!(*api.tokens.lock().unwrap(), vec!["tok".to_owned()]);
}

#[tokio::test]
async fn spawn_fetch_hands_back_the_issuing_ticket() {
    let mut api = FakeApi::default();
    api.backlogs.insert(UserId(2), vec![message(1, 1, 2)]);
    let loader = HistoryLoader::new(Arc::new(api));
    let (tx, mut rx) = mpsc::unbounded_channel();

    loader
        .spawn_fetch(ticket(7, 2), "tok".into(), move |loaded| {
            let _ = tx.send(loaded);
        })
        .await
        .unwrap();

    let loaded = rx.recv().await.unwrap();
    assert_eq!(loaded.ticket, ticket(7, 2));
    assert_eq!(loaded.result.unwrap(), vec![message(1, 1, 2)]);
}

#[tokio::test]
async fn spawn_fetch_reports_failures() {
    let loader = HistoryLoader::new(Arc::new(FakeApi::default()));
    let (tx, mut rx) = mpsc::unbounded_channel();

    loader.spawn_fetch(ticket(1, 9), "tok".into(), move |loaded| {
        let _ = tx.send(loaded);
    });

    let loaded = rx.recv().await.unwrap();
    let error = loaded.result.unwrap_err();
    assert_eq!(error.error_code(), "E_API_RESPONSE");
    assert!(error.retryable());
}

#[tokio::test(start_paused = true)]
async fn overlapping_fetches_all_complete_in_finish_order() {
    let mut api = FakeApi::default();
    api.backlogs.insert(UserId(2), vec![message(1, 1, 2)]);
    api.backlogs.insert(UserId(3), vec![message(2, 1, 3)]);
    api.delays.insert(UserId(2), Duration::from_secs(2));
    api.delays.insert(UserId(3), Duration::from_millis(100));
    let loader = HistoryLoader::new(Arc::new(api));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let tx2 = tx.clone();
    loader.spawn_fetch(ticket(1, 2), "tok".into(), move |loaded| {
        let _ = tx2.send(loaded.ticket);
    });
    loader.spawn_fetch(ticket(2, 3), "tok".into(), move |loaded| {
        let _ = tx.send(loaded.ticket);
    });

    assert_eq!(rx.recv().await.unwrap(), ticket(2, 3));
    assert_eq!(rx.recv().await.unwrap(), ticket(1, 2));
}

#[test]
fn api_error_codes_and_retryability() {
    let unauthorized = ApiError::Unauthorized { status: 401 };
    assert_eq!(unauthorized.error_code(), "E_UNAUTHORIZED");
    assert!(!unauthorized.retryable());

    let throttled = ApiError::Status { status: 429, body: String::new() };
    assert!(throttled.retryable());

    let not_found = ApiError::Status { status: 404, body: String::new() };
    assert!(!not_found.retryable());

    let decode = ApiError::Decode("expected array".into());
    assert_eq!(decode.error_code(), "E_API_PARSE");
    assert!(!decode.retryable());
}

#[test]
fn client_trims_trailing_slash() {
    let config = EngineConfig::new("http://localhost:3000/");
    let client = ApiClient::new(&config).unwrap();
    assert_eq!(client.base_url, "http://localhost:3000");
}
