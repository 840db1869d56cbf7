//! Integration tests for the Node public API.
//!
//! These tests run real nodes on loopback UDP sockets with shortened
//! protocol intervals and check that they find each other.

use std::time::Duration;

use overmesh::{Keypair, Node, OverlayConfig};
use tokio::time::{sleep, timeout, Instant};

/// Allow time for async operations
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

fn fast_config() -> OverlayConfig {
    OverlayConfig {
        max_friends: 10,
        exchange_interval: Duration::from_secs(20),
        exchange_jitter: Duration::from_secs(1),
        ping_interval: Duration::from_secs(1),
        friends_timeout: Duration::from_secs(10),
        ..OverlayConfig::default()
    }
}

async fn bind(login: &str) -> Node {
    Node::bind_with_config(
        "127.0.0.1:0",
        Keypair::from_credentials(login, "password"),
        fast_config(),
    )
    .await
    .expect("bind failed")
}

async fn wait_for_friends(node: &Node, expected: usize) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if node.friend_count().await.expect("node stopped") == expected {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn node_bind_and_identity() {
    let node = Node::bind("127.0.0.1:0", "login1", "password1")
        .await
        .expect("bind failed");

    let hex = node.identity_hex();
    assert_eq!(hex.len(), 64, "identity should be 64 hex chars");
    assert!(hex.chars().all(|c| c.is_ascii_hexdigit()), "identity should be hex");

    let again = Keypair::from_credentials("login1", "password1");
    assert_eq!(node.identity(), again.identity(), "credentials must be deterministic");
    assert!(node.local_addr().port() > 0, "port should be positive");

    node.shutdown().await;
}

#[tokio::test]
async fn node_bind_with_keypair() {
    let keypair = Keypair::generate();
    let expected = keypair.identity();
    let node = Node::bind_with_keypair("127.0.0.1:0", keypair)
        .await
        .expect("bind failed");
    assert_eq!(node.identity(), expected);
    assert_eq!(node.friend_count().await.unwrap(), 0);
    node.shutdown().await;
}

#[tokio::test]
async fn lone_node_has_no_friends() {
    let node = bind("lonely").await;
    assert_eq!(node.friend_count().await.unwrap(), 0);
    assert!(node.friends().await.unwrap().is_empty());
    node.shutdown().await;
}

#[tokio::test]
async fn two_nodes_become_friends() {
    let seed = bind("login1").await;
    let joiner = bind("login2").await;

    joiner
        .bootstrap(&seed.local_addr().to_string())
        .await
        .expect("bootstrap failed");

    assert!(wait_for_friends(&joiner, 1).await, "joiner never found the seed");
    assert!(wait_for_friends(&seed, 1).await, "seed never learned the joiner");

    let friends = joiner.friends().await.unwrap();
    assert_eq!(friends[0].identity, seed.identity());
    assert_eq!(friends[0].address, seed.local_addr().to_string());

    assert!(joiner.is_authorized(&seed.identity()).await.unwrap());
    assert!(seed.is_authorized(&joiner.identity()).await.unwrap());

    seed.shutdown().await;
    joiner.shutdown().await;
}

#[tokio::test]
async fn three_nodes_form_full_mesh() {
    let node1 = bind("login1").await;
    let node2 = bind("login2").await;
    let node3 = bind("login3").await;

    node2.bootstrap(&node1.local_addr().to_string()).await.unwrap();
    assert!(wait_for_friends(&node2, 1).await);
    node3.bootstrap(&node2.local_addr().to_string()).await.unwrap();

    let all = async {
        for node in [&node1, &node2, &node3] {
            assert!(wait_for_friends(node, 2).await, "{:?} did not reach 2 friends", node);
        }
    };
    timeout(TEST_TIMEOUT * 3, all).await.expect("mesh did not form");

    for node in [&node1, &node2, &node3] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn bootstrap_rejects_bad_address() {
    let node = bind("login1").await;
    assert!(node.bootstrap("not-an-address").await.is_err());
    node.shutdown().await;
}
