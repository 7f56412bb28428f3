//! DID exchange between agents wired over an in-process channel.

mod common;

use assert_matches::assert_matches;
use serde_json::json;
use std::sync::Arc;

use common::{
    agent, agent_with_resolver, config, connect, connect_with, test_init, EventRecorder, ExamplePeer,
};
use vcx_agent::{MultiResolver, StaticResolver};
use vcx_msg::message::connection::{ConnectionResponse, Invitation, REQUEST_TYPE, RESPONSE_TYPE};
use vcx_msg::message::problem_report::PROBLEM_REPORT_TYPE;
use vcx_msg::{MessageBody, PlainMessage};
use vcx_node::connection::CONNECTION_PROBLEM_CODE;
use vcx_node::error::ConnectionError;
use vcx_node::transport::ChannelTransport;
use vcx_node::{ConnectionRecord, ConnectionState, Error, EventKind, EventTopic, Framework};

#[tokio::test]
async fn test_request_to_static_did_is_resent_without_new_events() {
    test_init();
    let channel = Arc::new(ChannelTransport::default());

    // Alice only exists as a did:example document
    let documents = Arc::new(StaticResolver::new("example"));
    let resolver = Arc::new(MultiResolver::default());
    resolver.add_resolver(documents.clone());
    let alice = ExamplePeer::new("abc", resolver.clone(), &documents, &channel).await;

    let bob = agent_with_resolver(
        config("Bob", "http://bob.test/didcomm"),
        &channel,
        resolver,
    )
    .await;
    let connection_events = EventRecorder::topic(bob.events(), EventTopic::Connection);

    // Step 1: receive the invitation
    let invitation = Invitation::new(&alice.did, "Alice");
    let record = bob
        .connections()
        .receive_invitation(invitation.clone())
        .await
        .unwrap();
    assert_eq!(record.state, ConnectionState::Invited);
    assert_eq!(record.their_did.as_deref(), Some("did:example:abc"));
    assert_eq!(record.their_label.as_deref(), Some("Alice"));
    assert_eq!(connection_events.len(), 1);
    assert_eq!(connection_events.events()[0].kind, EventKind::Created);

    // Step 2: accept it
    let requested = bob.connections().send_request(&record.id).await.unwrap();
    assert_eq!(requested.state, ConnectionState::Requested);
    assert!(requested.our_did.as_deref().unwrap().starts_with("did:peer:2"));
    assert_eq!(connection_events.len(), 2);
    assert_eq!(connection_events.events()[1].kind, EventKind::Updated);

    // Step 3: send again, nothing changes but the message goes out again
    let resent = bob.connections().send_request(&record.id).await.unwrap();
    assert_eq!(resent.state, ConnectionState::Requested);
    assert_eq!(resent.our_did, requested.our_did);
    assert_eq!(connection_events.len(), 2);

    let opened = alice.opened().await;
    assert_eq!(opened.len(), 2);
    let (first, sender) = &opened[0];
    assert_eq!(first.type_, REQUEST_TYPE);
    assert_eq!(first.pthid.as_deref(), Some(invitation.id.as_str()));
    assert_eq!(Some(sender.as_str()), requested.our_did.as_deref());
    assert_eq!(opened[1].0.id, first.id);
    assert_eq!(requested.thread_id.as_deref(), Some(first.id.as_str()));
}

#[tokio::test]
async fn test_receiving_the_same_invitation_twice() {
    test_init();
    let channel = Arc::new(ChannelTransport::default());
    let alice = agent(config("Alice", "http://alice.test/didcomm"), &channel).await;
    let bob = agent(config("Bob", "http://bob.test/didcomm"), &channel).await;

    let (invitation, _) = alice.connections().create_invitation(None).await.unwrap();
    let first = bob
        .connections()
        .receive_invitation(invitation.clone())
        .await
        .unwrap();
    let second = bob.connections().receive_invitation(invitation).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(bob.connections().list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_full_handshake() {
    test_init();
    let channel = Arc::new(ChannelTransport::default());
    let alice = agent(config("Alice", "http://alice.test/didcomm"), &channel).await;
    let bob = agent(config("Bob", "http://bob.test/didcomm"), &channel).await;
    let alice_events = EventRecorder::topic(alice.events(), EventTopic::Connection);

    let (invitation, invitation_did) = alice
        .connections()
        .create_invitation(Some("Alice's shop"))
        .await
        .unwrap();
    assert_eq!(invitation.label, "Alice's shop");
    assert_eq!(invitation.from, invitation_did.did);
    // No connection exists until somebody asks for one
    assert!(alice.connections().list().await.unwrap().is_empty());

    let (alice_id, bob_id) = connect_with(&alice, &bob, invitation).await;

    let alice_record = alice.connections().get(&alice_id).await.unwrap().unwrap();
    let bob_record = bob.connections().get(&bob_id).await.unwrap().unwrap();
    println!("Alice: {:?}\nBob: {:?}", alice_record, bob_record);

    assert_eq!(alice_record.state, ConnectionState::Complete);
    assert_eq!(bob_record.state, ConnectionState::Complete);
    assert_eq!(alice_record.our_did, bob_record.their_did);
    assert_eq!(alice_record.their_did, bob_record.our_did);
    assert_eq!(alice_record.our_did.as_deref(), Some(invitation_did.did.as_str()));
    assert_eq!(alice_record.their_label.as_deref(), Some("Bob"));
    assert_eq!(alice_record.thread_id, bob_record.thread_id);

    // Created on request, then responded and completed
    let kinds: Vec<EventKind> = alice_events.events().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::Created, EventKind::Updated, EventKind::Updated]
    );

    let peers = bob
        .connections()
        .find_by_their_did(alice_record.our_did.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id, bob_id);
}

#[tokio::test]
async fn test_one_invitation_serves_several_invitees() {
    test_init();
    let channel = Arc::new(ChannelTransport::default());
    let alice = agent(config("Alice", "http://alice.test/didcomm"), &channel).await;
    let bob = agent(config("Bob", "http://bob.test/didcomm"), &channel).await;
    let carol = agent(config("Carol", "http://carol.test/didcomm"), &channel).await;

    let (invitation, _) = alice.connections().create_invitation(None).await.unwrap();
    for invitee in [&bob, &carol] {
        let record = invitee
            .connections()
            .receive_invitation(invitation.clone())
            .await
            .unwrap();
        invitee.connections().send_request(&record.id).await.unwrap();
    }

    let records = alice.connections().list().await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.state == ConnectionState::Complete));
    let mut labels: Vec<_> = records.iter().filter_map(|r| r.their_label.clone()).collect();
    labels.sort();
    assert_eq!(labels, vec!["Bob".to_string(), "Carol".to_string()]);
}

#[tokio::test]
async fn test_invalid_transition_is_rejected_without_events() {
    test_init();
    let channel = Arc::new(ChannelTransport::default());
    let alice = agent(config("Alice", "http://alice.test/didcomm"), &channel).await;
    let bob = agent(config("Bob", "http://bob.test/didcomm"), &channel).await;
    let (alice_id, bob_id) = connect(&alice, &bob).await;

    let recorder = EventRecorder::attach(alice.events(), |_| true);
    let result = alice.connections().send_response(&alice_id).await;
    assert_matches!(result, Err(ConnectionError::InvalidStateTransition { .. }));
    assert_eq!(recorder.len(), 0);

    // The invitee never sends a response, whatever its state
    let result = bob.connections().send_response(&bob_id).await;
    assert_matches!(result, Err(ConnectionError::InvalidStateTransition { .. }));

    let record = alice.connections().get(&alice_id).await.unwrap().unwrap();
    assert_eq!(record.state, ConnectionState::Complete);
}

#[tokio::test]
async fn test_unknown_connection() {
    test_init();
    let channel = Arc::new(ChannelTransport::default());
    let alice = agent(config("Alice", "http://alice.test/didcomm"), &channel).await;

    assert!(alice.connections().get("missing").await.unwrap().is_none());
    assert_matches!(
        alice.connections().send_request("missing").await,
        Err(ConnectionError::NotFound(id)) if id == "missing"
    );
}

#[tokio::test]
async fn test_fail_is_idempotent_and_terminal() {
    test_init();
    let channel = Arc::new(ChannelTransport::default());
    let alice = agent(config("Alice", "http://alice.test/didcomm"), &channel).await;
    let bob = agent(config("Bob", "http://bob.test/didcomm"), &channel).await;

    let (invitation, _) = alice.connections().create_invitation(None).await.unwrap();
    let record = bob.connections().receive_invitation(invitation).await.unwrap();
    let events = EventRecorder::topic(bob.events(), EventTopic::Connection);

    let failed = bob.connections().fail(&record.id, "user declined").await.unwrap();
    assert_eq!(failed.state, ConnectionState::Error);
    assert_eq!(failed.last_error.as_deref(), Some("user declined"));
    assert_eq!(events.len(), 1);

    // Same failure again is a replay
    let again = bob.connections().fail(&record.id, "user declined").await.unwrap();
    assert_eq!(again.state, ConnectionState::Error);
    assert_eq!(events.len(), 1);

    assert_matches!(
        bob.connections().send_request(&record.id).await,
        Err(ConnectionError::InvalidStateTransition { .. })
    );
    // No DID was minted for the rejected request
    let record = bob.connections().get(&record.id).await.unwrap().unwrap();
    assert!(record.our_did.is_none());
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_problem_report_fails_the_peer_connection() {
    test_init();
    let channel = Arc::new(ChannelTransport::default());
    let alice = agent(config("Alice", "http://alice.test/didcomm"), &channel).await;
    let mut bob_config = config("Bob", "http://bob.test/didcomm");
    bob_config.connection.auto_complete_requests = false;
    let bob = agent(bob_config, &channel).await;
    let alice_problems = EventRecorder::attach(alice.events(), |e| {
        e.kind == EventKind::ProblemReported && e.topic == EventTopic::Connection
    });

    let (alice_id, bob_id) = connect(&alice, &bob).await;
    let bob_record = bob.connections().get(&bob_id).await.unwrap().unwrap();
    assert_eq!(bob_record.state, ConnectionState::Responded);

    bob.connections().fail(&bob_id, "changed my mind").await.unwrap();

    let alice_record = alice.connections().get(&alice_id).await.unwrap().unwrap();
    assert_eq!(alice_record.state, ConnectionState::Error);
    assert_eq!(
        alice_record.last_error,
        Some(format!("{}: changed my mind", CONNECTION_PROBLEM_CODE))
    );
    assert_eq!(alice_problems.len(), 1);
    assert_eq!(alice_problems.events()[0].source_id, alice_id);

    // Bob did not get a report back
    let bob_record = bob.connections().get(&bob_id).await.unwrap().unwrap();
    assert_eq!(bob_record.last_error.as_deref(), Some("changed my mind"));
}

#[tokio::test]
async fn test_completing_manually() {
    test_init();
    let channel = Arc::new(ChannelTransport::default());
    let alice = agent(config("Alice", "http://alice.test/didcomm"), &channel).await;
    let mut bob_config = config("Bob", "http://bob.test/didcomm");
    bob_config.connection.auto_complete_requests = false;
    let bob = agent(bob_config, &channel).await;

    let (alice_id, bob_id) = connect(&alice, &bob).await;
    let completed = bob.connections().send_complete(&bob_id).await.unwrap();
    assert_eq!(completed.state, ConnectionState::Complete);

    let alice_record = alice.connections().get(&alice_id).await.unwrap().unwrap();
    assert_eq!(alice_record.state, ConnectionState::Complete);
}

#[tokio::test]
async fn test_garbage_is_reported_on_messaging_topic() {
    test_init();
    let channel = Arc::new(ChannelTransport::default());
    let alice = agent(config("Alice", "http://alice.test/didcomm"), &channel).await;
    let problems = EventRecorder::attach(alice.events(), |e| e.kind == EventKind::ProblemReported);

    assert!(alice.receive_message(b"garbage").await.is_err());

    let events = problems.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].topic, EventTopic::Messaging);
    assert!(alice.connections().list().await.unwrap().is_empty());
}

/// Bob has sent a request to a peer that only exists as a did:example
/// document.
async fn requested_by_bob(channel: &Arc<ChannelTransport>) -> (ExamplePeer, Arc<Framework>, ConnectionRecord) {
    let documents = Arc::new(StaticResolver::new("example"));
    let resolver = Arc::new(MultiResolver::default());
    resolver.add_resolver(documents.clone());
    let alice = ExamplePeer::new("abc", resolver.clone(), &documents, channel).await;
    let bob = agent_with_resolver(config("Bob", "http://bob.test/didcomm"), channel, resolver).await;

    let record = bob
        .connections()
        .receive_invitation(Invitation::new(&alice.did, "Alice"))
        .await
        .unwrap();
    let record = bob.connections().send_request(&record.id).await.unwrap();
    (alice, bob, record)
}

#[tokio::test]
async fn test_malformed_message_on_a_thread_fails_the_connection() {
    test_init();
    let channel = Arc::new(ChannelTransport::default());
    let (alice, bob, requested) = requested_by_bob(&channel).await;
    let bob_did = requested.our_did.clone().unwrap();
    let recorder = EventRecorder::topic(bob.events(), EventTopic::Connection);

    // A response without the responder's DID
    let plain = PlainMessage::new(RESPONSE_TYPE, json!({ "label": "Alice" }))
        .with_sender(&alice.did)
        .with_recipient(&bob_did)
        .with_thread_id(requested.thread_id.clone());
    let bytes = alice.seal(&plain, &bob_did).await;

    assert_matches!(bob.receive_message(&bytes).await, Err(Error::ParseMessage { .. }));

    let failed = bob.connections().get(&requested.id).await.unwrap().unwrap();
    assert_eq!(failed.state, ConnectionState::Error);
    assert!(failed.last_error.as_deref().unwrap().contains(&plain.id));
    assert_eq!(recorder.len(), 1);
    assert_eq!(recorder.events()[0].payload["state"], "error");

    // The peer hears about it on the same thread
    let opened = alice.opened().await;
    let (report, _) = opened.last().unwrap();
    assert_eq!(report.type_, PROBLEM_REPORT_TYPE);
    assert_eq!(report.thid, requested.thread_id);
}

#[tokio::test]
async fn test_unresolvable_response_did_fails_the_connection() {
    test_init();
    let channel = Arc::new(ChannelTransport::default());
    let (alice, bob, requested) = requested_by_bob(&channel).await;
    let bob_did = requested.our_did.clone().unwrap();
    let recorder = EventRecorder::topic(bob.events(), EventTopic::Connection);

    let plain = ConnectionResponse {
        did: "did:example:ghost".to_string(),
    }
    .to_plain(&alice.did, &bob_did)
    .unwrap()
    .with_thread_id(requested.thread_id.clone());
    let bytes = alice.seal(&plain, &bob_did).await;

    assert_matches!(
        bob.receive_message(&bytes).await,
        Err(Error::Connection(ConnectionError::DidResolution { did, .. })) if did == "did:example:ghost"
    );

    let failed = bob.connections().get(&requested.id).await.unwrap().unwrap();
    assert_eq!(failed.state, ConnectionState::Error);
    assert!(failed.last_error.as_deref().unwrap().contains("did:example:ghost"));
    assert_eq!(failed.their_did.as_deref(), Some(alice.did.as_str()));
    assert_eq!(recorder.len(), 1);
    assert_eq!(recorder.events()[0].kind, EventKind::Updated);
    assert_eq!(recorder.events()[0].payload["state"], "error");

    // Replaying the response changes nothing
    assert!(bob.receive_message(&bytes).await.is_err());
    assert_eq!(recorder.len(), 1);
}
