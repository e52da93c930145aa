#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tally_api::{HttpInventory, SyncClient, SyncError};
use tally_core::{Action, NormalizedResource, OwnerTag};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn res(id: &str) -> NormalizedResource {
    NormalizedResource {
        identifier: id.to_string(),
        api_version: "apps/v1".into(),
        kind: "Deployment".into(),
        content_hash: "d41d8cd98f00b204e9800998ecf8427e".into(),
        owner: OwnerTag::cluster("c-1"),
        payload: json!({ "metadata": { "name": "web", "uid": id } }),
    }
}

fn client_for(server: &MockServer) -> SyncClient {
    let http = HttpInventory::new(&format!("{}/", server.uri()), Some("k".into()), Duration::from_secs(5)).unwrap();
    SyncClient::new(Arc::new(http))
}

#[tokio::test]
async fn create_posts_collection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/resources"))
        .and(header("X-API-KEY", "k"))
        .and(body_partial_json(json!({ "uid": "u1", "action": "create", "kind": "Deployment" })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    client_for(&server).send(Action::Create, &res("u1")).await.unwrap();
}

#[tokio::test]
async fn update_and_delete_address_uid() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/resources/uid/u1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/resources/uid/u1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.send(Action::Update, &res("u1")).await.unwrap();
    client.send(Action::Delete, &res("u1")).await.unwrap();
}

#[tokio::test]
async fn non_success_status_is_retryable_error() {
    let server = MockServer::start().await;
    Mock::given(method("PUT")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

    let client = client_for(&server);
    assert_eq!(client.send(Action::Update, &res("u1")).await, Err(SyncError::Status(500)));
    assert_eq!(client.error_count(), 1);
}

#[tokio::test]
async fn unreachable_server_is_transport_error() {
    let http = HttpInventory::new("http://127.0.0.1:9", None, Duration::from_millis(500)).unwrap();
    let client = SyncClient::new(Arc::new(http));
    assert!(matches!(client.send(Action::Create, &res("u1")).await, Err(SyncError::Transport(_))));
}

#[tokio::test]
async fn fetches_hash_list_for_owner() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/resources/hashes"))
        .and(query_param("ownerScope", "cluster"))
        .and(query_param("ownerSubject", "c-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [ { "uid": "a", "hash": "1" }, { "uid": "b", "hash": "2" } ]
        })))
        .mount(&server)
        .await;

    let map = client_for(&server).remote_hash_list(&OwnerTag::cluster("c-1")).await.unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map["a"], "1");
}

#[tokio::test]
async fn hash_list_error_status_fails_bootstrap() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(401)).mount(&server).await;

    assert!(client_for(&server).remote_hash_list(&OwnerTag::cluster("c-1")).await.is_err());
}
