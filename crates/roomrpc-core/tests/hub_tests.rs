//! Integration tests for rooms spread over a TCP hub.
//!
//! Each peer talks to the hub through its own `HubClient`, the same way
//! separate processes would.

use roomrpc_core::{
    CallContext, HubClient, HubServer, HubServerHandle, PeerId, PeerInfo, RoomRoster, RpcContext,
    RpcError,
};
use serde_json::{json, Value};
use std::time::Duration;

async fn start_hub() -> HubServerHandle {
    HubServer::start("127.0.0.1:0".parse().unwrap()).await.unwrap()
}

async fn connect(hub: &HubServerHandle, room: &RoomRoster, id: &str) -> RpcContext {
    let client = HubClient::connect(hub.addr()).await.unwrap();
    RpcContext::new(client, room.view_as(id))
}

#[tokio::test]
async fn test_request_round_trip_through_hub() {
    let mut hub = start_hub().await;
    let room = RoomRoster::with_peers([PeerInfo::coordinator("gm"), PeerInfo::member("ada")]);
    let gm = connect(&hub, &room, "gm").await;
    let ada = connect(&hub, &room, "ada").await;

    let double = |_ctx: CallContext, args: Vec<Value>| async move {
        let x = args.first().and_then(Value::as_i64).unwrap_or_default();
        anyhow::Ok(json!(x * 2))
    };
    gm.register_module("math")
        .await
        .unwrap()
        .register("double", double)
        .unwrap();
    let math = ada.register_module("math").await.unwrap();
    let handle = math.register("double", double).unwrap();

    let reply = math
        .invoke_as_coordinator(&handle, vec![json!(21)])
        .await
        .unwrap();
    let value = tokio::time::timeout(Duration::from_secs(5), reply.decode::<i64>())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(math.pending_calls(), 0);
    assert_eq!(hub.connection_count(), 2);

    hub.shutdown();
}

#[tokio::test]
async fn test_unregistered_handler_through_hub() {
    let mut hub = start_hub().await;
    let room = RoomRoster::with_peers([PeerInfo::member("a"), PeerInfo::member("b")]);
    let a = connect(&hub, &room, "a").await;
    let b = connect(&hub, &room, "b").await;

    let a_dice = a.register_module("dice").await.unwrap();
    b.register_module("dice").await.unwrap();
    let handle = a_dice
        .register("roll", |_ctx: CallContext, _args: Vec<Value>| async move {
            anyhow::Ok(json!(4))
        })
        .unwrap();

    let reply = a_dice
        .invoke_on_peer(&handle, &PeerId::from("b"), vec![])
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), reply.wait())
        .await
        .unwrap();
    match outcome {
        Err(RpcError::UnregisteredHandler { responder, .. }) => {
            assert_eq!(responder, Some(PeerId::from("b")));
        }
        other => panic!("Expected UnregisteredHandler, got: {:?}", other),
    }

    hub.shutdown();
}

#[tokio::test]
async fn test_pending_reply_fails_when_channel_is_dropped() {
    let mut hub = start_hub().await;
    let room = RoomRoster::with_peers([PeerInfo::member("a"), PeerInfo::member("b")]);
    let a = connect(&hub, &room, "a").await;

    let dice = a.register_module("dice").await.unwrap();
    let handle = dice
        .register("roll", |_ctx: CallContext, _args: Vec<Value>| async move {
            anyhow::Ok(json!(4))
        })
        .unwrap();

    // Nobody serves "b", so the request stays pending until the channel goes.
    let reply = dice
        .invoke_on_peer(&handle, &PeerId::from("b"), vec![])
        .await
        .unwrap();
    drop(a);
    drop(dice);

    let outcome = tokio::time::timeout(Duration::from_secs(5), reply.wait())
        .await
        .unwrap();
    assert!(matches!(outcome, Err(RpcError::ChannelClosed { .. })));

    hub.shutdown();
}
