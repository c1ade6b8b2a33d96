//! Integration tests for end-to-end WebSocket sync.
//!
//! These tests start a real server and connect real clients,
//! verifying the full subscribe/mutate/broadcast pipeline.

use std::sync::Arc;
use tabula_core::{orders_contiguous, Scope};
use tabula_sync::auth::ChannelAuthorizer;
use tabula_sync::client::{ClientEvent, SyncClient};
use tabula_sync::protocol::{ErrorCode, EventPayload};
use tabula_sync::server::{ServerConfig, SyncServer};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start an in-memory server on a free port, return the port and the
/// authorizer that issues its credentials.
async fn start_test_server() -> (u16, Arc<ChannelAuthorizer>) {
    let port = free_port().await;
    let authorizer = Arc::new(ChannelAuthorizer::for_testing());
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_subscribers_per_channel: 10,
        broadcast_capacity: 64,
        lock_timeout_ms: 1_000,
        storage_path: None,
    };
    let server = SyncServer::new(config, authorizer.verifier()).unwrap();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, authorizer)
}

/// Connect, complete the Welcome handshake, subscribe, and swallow the
/// Connected + Synced events.
async fn connect_and_subscribe(
    url: &str,
    authorizer: &ChannelAuthorizer,
    actor: Uuid,
    channel: &str,
) -> (SyncClient, mpsc::Receiver<ClientEvent>) {
    let mut client = SyncClient::new(actor, channel, url);
    let mut events = client.take_event_rx().unwrap();

    let socket_id = client.connect().await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(ClientEvent::Connected { .. })) => {}
        other => panic!("Expected Connected event, got {other:?}"),
    }

    let credential = authorizer.authorize(actor, socket_id, channel).unwrap();
    client.subscribe(credential).await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(ClientEvent::Synced(_))) => {}
        other => panic!("Expected Synced event, got {other:?}"),
    }

    (client, events)
}

/// Drain any pending events.
async fn drain(events: &mut mpsc::Receiver<ClientEvent>) {
    while let Ok(Some(_)) = timeout(Duration::from_millis(50), events.recv()).await {}
}

/// Wait for this client's own mutation reply, skipping channel events.
async fn await_mutation_ok(events: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(reply @ ClientEvent::MutationOk { .. })) => return reply,
            Ok(Some(ClientEvent::MutationFailed { code, message })) => {
                panic!("Mutation rejected: {code:?} {message}")
            }
            Ok(Some(_)) => continue,
            other => panic!("Expected MutationOk, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (port, _authorizer) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_subscribe_receives_snapshot() {
    let (port, authorizer) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let team = Uuid::new_v4();

    let (client, _events) = connect_and_subscribe(
        &url,
        &authorizer,
        Uuid::new_v4(),
        &format!("team:{team}"),
    )
    .await;

    let view = client.view().await;
    assert_eq!(view.version(), 0);
    assert!(view.is_empty());
}

#[tokio::test]
async fn test_subscribe_rejected_with_foreign_credential() {
    let (port, authorizer) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let team = Uuid::new_v4();
    let channel = format!("team:{team}");
    let actor = Uuid::new_v4();

    let mut client = SyncClient::new(actor, &channel, &url);
    let mut events = client.take_event_rx().unwrap();
    let socket_id = client.connect().await.unwrap();
    let _ = timeout(Duration::from_secs(1), events.recv()).await; // Connected

    // Credential minted for some other socket must not admit this one.
    let foreign = authorizer
        .authorize(actor, Uuid::new_v4(), &channel)
        .unwrap();
    client.subscribe(foreign).await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(ClientEvent::MutationFailed { code, .. })) => {
            assert_eq!(code, ErrorCode::Forbidden);
        }
        other => panic!("Expected rejection, got {other:?}"),
    }

    // The connection survives; a correctly bound credential still works.
    let credential = authorizer.authorize(actor, socket_id, &channel).unwrap();
    client.subscribe(credential).await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(ClientEvent::Synced(_))) => {}
        other => panic!("Expected Synced after valid credential, got {other:?}"),
    }
}

#[tokio::test]
async fn test_create_reaches_other_subscriber() {
    let (port, authorizer) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let team = Uuid::new_v4();
    let channel = format!("team:{team}");

    let (alice, mut alice_events) =
        connect_and_subscribe(&url, &authorizer, Uuid::new_v4(), &channel).await;
    let (bob, mut bob_events) =
        connect_and_subscribe(&url, &authorizer, Uuid::new_v4(), &channel).await;

    alice.create(Scope::team(team), "Backlog").await.unwrap();
    await_mutation_ok(&mut alice_events).await;

    // Bob sees the change as a channel event
    match timeout(Duration::from_secs(2), bob_events.recv()).await {
        Ok(Some(ClientEvent::Event(event))) => {
            assert_eq!(event.name, "list-created");
            match &event.payload {
                EventPayload::Item(item) => assert_eq!(item.name, "Backlog"),
                other => panic!("Create must carry the single item, got {other:?}"),
            }
        }
        other => panic!("Expected broadcast event, got {other:?}"),
    }

    // Both replicas converge
    tokio::time::sleep(Duration::from_millis(100)).await;
    let alice_view = alice.view().await;
    let bob_view = bob.view().await;
    assert_eq!(alice_view.len(), 1);
    assert_eq!(bob_view.len(), 1);
    assert_eq!(bob_view.items()[0].name, "Backlog");
}

#[tokio::test]
async fn test_move_and_delete_broadcast_snapshots() {
    let (port, authorizer) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let team = Uuid::new_v4();
    let channel = format!("team:{team}");
    let scope = Scope::team(team);

    let (alice, mut alice_events) =
        connect_and_subscribe(&url, &authorizer, Uuid::new_v4(), &channel).await;
    let (bob, mut bob_events) =
        connect_and_subscribe(&url, &authorizer, Uuid::new_v4(), &channel).await;

    for name in ["A", "B", "C"] {
        alice.create(scope, name).await.unwrap();
        await_mutation_ok(&mut alice_events).await;
    }
    drain(&mut alice_events).await;
    drain(&mut bob_events).await;

    // Move A to the back; subscribers get the whole reindexed scope.
    let a_id = alice.view().await.items()[0].id;
    alice.update(a_id, "A", 3).await.unwrap();
    await_mutation_ok(&mut alice_events).await;

    match timeout(Duration::from_secs(2), bob_events.recv()).await {
        Ok(Some(ClientEvent::Event(event))) => {
            assert_eq!(event.name, "list-updated");
            match &event.payload {
                EventPayload::Snapshot(snapshot) => {
                    let names: Vec<&str> =
                        snapshot.items.iter().map(|i| i.name.as_str()).collect();
                    assert_eq!(names, vec!["B", "C", "A"]);
                }
                other => panic!("Move must carry a snapshot, got {other:?}"),
            }
        }
        other => panic!("Expected move event, got {other:?}"),
    }

    alice.delete(a_id).await.unwrap();
    await_mutation_ok(&mut alice_events).await;

    match timeout(Duration::from_secs(2), bob_events.recv()).await {
        Ok(Some(ClientEvent::Event(event))) => {
            assert_eq!(event.name, "list-deleted");
            assert!(matches!(event.payload, EventPayload::Snapshot(_)));
        }
        other => panic!("Expected delete event, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    let bob_view = bob.view().await;
    assert_eq!(bob_view.len(), 2);
    assert!(orders_contiguous(bob_view.items()));
}

#[tokio::test]
async fn test_channels_are_isolated() {
    let (port, authorizer) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let team_a = Uuid::new_v4();
    let team_b = Uuid::new_v4();

    let (alice, mut alice_events) =
        connect_and_subscribe(&url, &authorizer, Uuid::new_v4(), &format!("team:{team_a}")).await;
    let (_bob, mut bob_events) =
        connect_and_subscribe(&url, &authorizer, Uuid::new_v4(), &format!("team:{team_b}")).await;

    alice.create(Scope::team(team_a), "Private").await.unwrap();
    await_mutation_ok(&mut alice_events).await;

    // Bob watches a different team and must see nothing.
    let result = timeout(Duration::from_millis(200), bob_events.recv()).await;
    assert!(result.is_err(), "Bob should not receive team A events");
}

#[tokio::test]
async fn test_mutations_work_without_subscription() {
    let (port, _authorizer) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let team = Uuid::new_v4();

    let mut client = SyncClient::new(Uuid::new_v4(), format!("team:{team}"), &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    let _ = timeout(Duration::from_secs(1), events.recv()).await; // Connected

    client.create(Scope::team(team), "Headless").await.unwrap();
    match await_mutation_ok(&mut events).await {
        ClientEvent::MutationOk { item, snapshot } => {
            assert_eq!(item.name, "Headless");
            assert_eq!(item.order, 1);
            assert_eq!(snapshot.version, 1);
        }
        other => panic!("Expected MutationOk, got {other:?}"),
    }
}

#[tokio::test]
async fn test_mutation_survives_client_disconnect() {
    let (port, authorizer) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let team = Uuid::new_v4();
    let channel = format!("team:{team}");

    let (_alice, mut alice_events) =
        connect_and_subscribe(&url, &authorizer, Uuid::new_v4(), &channel).await;

    // A second client fires a create and hangs up without waiting for the
    // reply. The commit must land anyway.
    {
        let mut bob = SyncClient::new(Uuid::new_v4(), channel.as_str(), &url);
        let mut bob_events = bob.take_event_rx().unwrap();
        bob.connect().await.unwrap();
        let _ = timeout(Duration::from_secs(1), bob_events.recv()).await; // Connected
        bob.create(Scope::team(team), "Parting gift").await.unwrap();
        // Client dropped here, closing the socket before the reply arrives
    }

    match timeout(Duration::from_secs(2), alice_events.recv()).await {
        Ok(Some(ClientEvent::Event(event))) => {
            assert_eq!(event.name, "list-created");
            match &event.payload {
                EventPayload::Item(item) => assert_eq!(item.name, "Parting gift"),
                other => panic!("Expected item payload, got {other:?}"),
            }
        }
        other => panic!("Expected broadcast despite disconnect, got {other:?}"),
    }
}

#[tokio::test]
async fn test_tentative_move_confirmed_by_canonical_reply() {
    let (port, authorizer) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let team = Uuid::new_v4();
    let channel = format!("team:{team}");

    let (client, mut events) =
        connect_and_subscribe(&url, &authorizer, Uuid::new_v4(), &channel).await;
    for name in ["A", "B", "C"] {
        client.create(Scope::team(team), name).await.unwrap();
        await_mutation_ok(&mut events).await;
    }
    drain(&mut events).await;

    let c_id = client.view().await.items()[2].id;

    // Echo the move locally, then ask the server for the same move.
    assert!(client.apply_tentative_move(c_id, 1).await);
    let echoed: Vec<String> = client
        .view()
        .await
        .display_items()
        .iter()
        .map(|i| i.name.clone())
        .collect();
    assert_eq!(echoed, vec!["C", "A", "B"]);

    client.update(c_id, "C", 1).await.unwrap();
    await_mutation_ok(&mut events).await;

    let view = client.view().await;
    assert!(!view.has_tentative_order(), "Reply must replace the echo");
    let confirmed: Vec<&str> = view.items().iter().map(|i| i.name.as_str()).collect();
    assert_eq!(confirmed, vec!["C", "A", "B"]);
    assert!(orders_contiguous(view.items()));
}

#[tokio::test]
async fn test_rejected_update_reverts_tentative_order() {
    let (port, authorizer) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let team = Uuid::new_v4();
    let channel = format!("team:{team}");

    let (client, mut events) =
        connect_and_subscribe(&url, &authorizer, Uuid::new_v4(), &channel).await;
    for name in ["A", "B"] {
        client.create(Scope::team(team), name).await.unwrap();
        await_mutation_ok(&mut events).await;
    }
    drain(&mut events).await;

    let b_id = client.view().await.items()[1].id;
    assert!(client.apply_tentative_move(b_id, 1).await);

    // Blank name fails validation; the echo must not outlive the rejection.
    client.update(b_id, "   ", 1).await.unwrap();
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(ClientEvent::MutationFailed { code, .. })) => {
                assert_eq!(code, ErrorCode::BadRequest);
                break;
            }
            Ok(Some(ClientEvent::Event(_))) => continue,
            other => panic!("Expected BadRequest rejection, got {other:?}"),
        }
    }

    let view = client.view().await;
    assert!(!view.has_tentative_order());
    let names: Vec<&str> = view.items().iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B"]);
}

#[tokio::test]
async fn test_invalid_order_is_rejected() {
    let (port, authorizer) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let team = Uuid::new_v4();
    let channel = format!("team:{team}");

    let (client, mut events) =
        connect_and_subscribe(&url, &authorizer, Uuid::new_v4(), &channel).await;
    client.create(Scope::team(team), "Only").await.unwrap();
    await_mutation_ok(&mut events).await;
    drain(&mut events).await;

    let item_id = client.view().await.items()[0].id;
    client.update(item_id, "Only", 99).await.unwrap();
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(ClientEvent::MutationFailed { code, .. })) => {
                assert_eq!(code, ErrorCode::InvalidOrder);
                break;
            }
            Ok(Some(ClientEvent::Event(_))) => continue,
            other => panic!("Expected InvalidOrder rejection, got {other:?}"),
        }
    }

    // Nothing changed on the server.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.view().await.version(), 1);
}

#[tokio::test]
async fn test_concurrent_creates_stay_contiguous() {
    let (port, authorizer) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let team = Uuid::new_v4();
    let channel = format!("team:{team}");
    let scope = Scope::team(team);

    let (alice, mut alice_events) =
        connect_and_subscribe(&url, &authorizer, Uuid::new_v4(), &channel).await;
    let (bob, mut bob_events) =
        connect_and_subscribe(&url, &authorizer, Uuid::new_v4(), &channel).await;

    let (a, b) = tokio::join!(alice.create(scope, "From Alice"), bob.create(scope, "From Bob"));
    a.unwrap();
    b.unwrap();
    await_mutation_ok(&mut alice_events).await;
    await_mutation_ok(&mut bob_events).await;

    // A fresh subscriber sees both, in distinct slots.
    let (carol, _carol_events) =
        connect_and_subscribe(&url, &authorizer, Uuid::new_v4(), &channel).await;
    let view = carol.view().await;
    assert_eq!(view.len(), 2);
    assert!(orders_contiguous(view.items()));
}

#[tokio::test]
async fn test_ping_pong() {
    let (port, authorizer) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let team = Uuid::new_v4();

    let (client, mut events) = connect_and_subscribe(
        &url,
        &authorizer,
        Uuid::new_v4(),
        &format!("team:{team}"),
    )
    .await;

    client.ping().await.unwrap();

    // The connection is still healthy afterwards.
    client.create(Scope::team(team), "After ping").await.unwrap();
    await_mutation_ok(&mut events).await;
}

#[tokio::test]
async fn test_storage_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let authorizer = Arc::new(ChannelAuthorizer::for_testing());
    let team = Uuid::new_v4();
    let channel = format!("team:{team}");
    let scope = Scope::team(team);

    // First server instance: write two items, then shut down.
    let port_a = free_port().await;
    let server_a = SyncServer::with_storage(
        format!("127.0.0.1:{port_a}"),
        dir.path(),
        authorizer.verifier(),
    )
    .unwrap();
    let handle_a = tokio::spawn(async move { server_a.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    {
        let url = format!("ws://127.0.0.1:{port_a}");
        let (client, mut events) =
            connect_and_subscribe(&url, &authorizer, Uuid::new_v4(), &channel).await;
        for name in ["Persist me", "Me too"] {
            client.create(scope, name).await.unwrap();
            await_mutation_ok(&mut events).await;
        }
    }
    // Let the connection handler finish releasing its store handle.
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle_a.abort();
    let _ = handle_a.await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Second instance over the same directory serves the same items.
    let port_b = free_port().await;
    let server_b = SyncServer::with_storage(
        format!("127.0.0.1:{port_b}"),
        dir.path(),
        authorizer.verifier(),
    )
    .unwrap();
    tokio::spawn(async move { server_b.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let url = format!("ws://127.0.0.1:{port_b}");
    let (client, _events) =
        connect_and_subscribe(&url, &authorizer, Uuid::new_v4(), &channel).await;
    let view = client.view().await;
    assert_eq!(view.len(), 2);
    assert_eq!(view.version(), 2);
    let names: Vec<&str> = view.items().iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["Persist me", "Me too"]);
}
