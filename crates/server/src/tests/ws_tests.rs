use super::*;
use std::{net::SocketAddr, time::Duration};

use chrono::Utc;
use relay_core::ConnectionRegistry;
use session_auth::mint_token;
use shared::{
    domain::{MessageStatus, RecipientKey},
    protocol::{ClientEnvelope, ServerEnvelope},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};

use crate::{build_router, tests::test_state};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);

struct TestServer {
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl TestServer {
    async fn start() -> Self {
        let state = Arc::new(test_state().await);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = build_router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        Self { addr, state }
    }

    fn registry(&self) -> &ConnectionRegistry {
        self.state.relay.registry()
    }

    fn url_for(&self, token: &str) -> String {
        format!("ws://{}/ws?token={token}", self.addr)
    }

    async fn connect(&self, user_id: UserId) -> Client {
        let token = mint_token(&self.state.tokens, user_id).expect("token");
        let (client, _) = connect_async(self.url_for(&token)).await.expect("connect");
        client
    }

    async fn wait_for_online(&self, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.registry().len().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry reached expected size");
    }
}

async fn send(client: &mut Client, envelope: &ClientEnvelope) {
    let text = serde_json::to_string(envelope).expect("encode");
    client.send(WsMessage::Text(text)).await.expect("send");
}

async fn next_envelope(client: &mut Client) -> ServerEnvelope {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return serde_json::from_str(&text).expect("server envelope")
                }
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await
    .expect("envelope arrived")
}

fn message_for(receiver_id: UserId) -> ClientEnvelope {
    ClientEnvelope::Message {
        receiver_id,
        content: "ciphertext".into(),
        keys: vec![RecipientKey {
            recipient_id: receiver_id,
            encrypted_key: "wrapped".into(),
        }],
        expires_at: (Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
        attachments: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_and_receipts_flow_between_two_clients() {
    let server = TestServer::start().await;
    let mut alice = server.connect(ALICE).await;
    let mut bob = server.connect(BOB).await;
    server.wait_for_online(2).await;

    send(&mut alice, &message_for(BOB)).await;

    let ServerEnvelope::NewMessage { message } = next_envelope(&mut bob).await else {
        panic!("bob expected new_message");
    };
    assert_eq!(message.sender_id, ALICE);
    assert_eq!(message.content, "ciphertext");
    assert_eq!(message.status, MessageStatus::Delivered);
    let message_id = message.message_id;

    // Bob acknowledges before reading alice's confirmation, so the ack can race
    // the relay finishing the submit.
    send(
        &mut bob,
        &ClientEnvelope::StatusUpdate {
            message_id,
            status: MessageStatus::Received,
        },
    )
    .await;

    let mut to_alice = vec![next_envelope(&mut alice).await, next_envelope(&mut alice).await];
    to_alice.sort_by_key(|envelope| matches!(envelope, ServerEnvelope::StatusUpdate { .. }));
    assert_eq!(
        to_alice,
        vec![
            ServerEnvelope::MessageSent {
                message_id,
                status: MessageStatus::Delivered,
            },
            ServerEnvelope::StatusUpdate {
                message_id,
                status: MessageStatus::Received,
            },
        ]
    );

    send(&mut bob, &ClientEnvelope::ReadReceipt { message_id }).await;
    assert_eq!(
        next_envelope(&mut alice).await,
        ServerEnvelope::StatusUpdate {
            message_id,
            status: MessageStatus::Read,
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn garbage_frames_do_not_drop_the_connection() {
    let server = TestServer::start().await;
    let mut alice = server.connect(ALICE).await;
    server.wait_for_online(1).await;

    alice
        .send(WsMessage::Text("{not json".into()))
        .await
        .expect("send");
    alice
        .send(WsMessage::Text(r#"{"type":"typing","payload":{}}"#.into()))
        .await
        .expect("send");
    alice
        .send(WsMessage::Binary(vec![1, 2, 3]))
        .await
        .expect("send");

    // Still served: a message to an offline peer is acknowledged as sent.
    send(&mut alice, &message_for(BOB)).await;
    let ServerEnvelope::MessageSent { status, .. } = next_envelope(&mut alice).await else {
        panic!("expected message_sent");
    };
    assert_eq!(status, MessageStatus::Sent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_unregisters_the_user() {
    let server = TestServer::start().await;
    let mut alice = server.connect(ALICE).await;
    server.wait_for_online(1).await;

    alice.close(None).await.expect("close");
    server.wait_for_online(0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_connection_replaces_and_closes_the_first() {
    let server = TestServer::start().await;
    let mut first = server.connect(ALICE).await;
    server.wait_for_online(1).await;
    let first_binding = server
        .registry()
        .lookup(ALICE)
        .await
        .expect("bound")
        .connection_id();

    let mut second = server.connect(ALICE).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("first connection closed");

    let current = server
        .registry()
        .lookup(ALICE)
        .await
        .expect("still bound")
        .connection_id();
    assert_ne!(current, first_binding);
    assert_eq!(server.registry().len().await, 1);

    send(&mut second, &message_for(BOB)).await;
    assert!(matches!(
        next_envelope(&mut second).await,
        ServerEnvelope::MessageSent { .. }
    ));
}

#[tokio::test]
async fn handshake_with_bad_token_is_refused() {
    let server = TestServer::start().await;

    match connect_async(server.url_for("not-a-token")).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        other => panic!("expected 401 handshake failure, got {:?}", other.map(|_| ())),
    }
    assert!(server.registry().is_empty().await);
}
