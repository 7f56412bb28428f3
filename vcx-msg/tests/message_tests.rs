//! Messages of one protocol thread as they travel between two agents.

use assert_matches::assert_matches;

use vcx_msg::message::connection::{ConnectionComplete, ConnectionRequest, ConnectionResponse, Invitation};
use vcx_msg::message::pickup::{Delivery, MessagesReceived};
use vcx_msg::message::problem_report::ProblemReport;
use vcx_msg::{AgentMessage, Attachment, Error, MessageBody, PlainMessage};

const ALICE: &str = "did:example:alice";
const BOB: &str = "did:example:bob";

/// Serialize and parse again, as the receiving side does.
fn transmit(plain: &PlainMessage) -> (PlainMessage, AgentMessage) {
    let received = PlainMessage::from_bytes(&plain.to_bytes().unwrap()).unwrap();
    let message = AgentMessage::parse(&received).unwrap();
    (received, message)
}

#[test]
fn test_did_exchange_thread() {
    // Out of band: the invitation travels as a URL
    let invitation = Invitation::new(ALICE, "Alice");
    let url = invitation.to_url("https://alice.example/invite").unwrap();
    let invitation = Invitation::from_url(&url).unwrap();

    let request = ConnectionRequest {
        label: "Bob".to_string(),
        did: BOB.to_string(),
        goal: None,
    }
    .to_plain(BOB, &invitation.from)
    .unwrap()
    .with_parent_thread_id(Some(invitation.id.clone()));
    let (request, message) = transmit(&request);
    assert_matches!(message, AgentMessage::Request(ref r) if r.label == "Bob");
    // A request opens its own thread
    assert_eq!(request.thread_id(), request.id);

    let response = ConnectionResponse {
        did: ALICE.to_string(),
    }
    .to_plain(ALICE, BOB)
    .unwrap()
    .with_thread_id(Some(request.id.clone()));
    let (response, message) = transmit(&response);
    assert_eq!(message.name(), "response");
    assert_eq!(response.thread_id(), request.id);
    assert_eq!(response.from.as_deref(), Some(ALICE));
    assert_eq!(response.to, vec![BOB.to_string()]);

    let complete = ConnectionComplete::default()
        .to_plain(BOB, ALICE)
        .unwrap()
        .with_thread_id(Some(request.id.clone()))
        .with_parent_thread_id(Some(invitation.id.clone()));
    let (complete, message) = transmit(&complete);
    assert_eq!(message, AgentMessage::Complete(ConnectionComplete::default()));
    assert_eq!(complete.pthid.as_deref(), Some(invitation.id.as_str()));
}

#[test]
fn test_problem_report_in_thread() {
    let report = ProblemReport::new("e.p.connection", "request rejected")
        .to_plain(ALICE, BOB)
        .unwrap()
        .with_thread_id(Some("request-1".to_string()));
    let (report, message) = transmit(&report);

    assert_eq!(report.thread_id(), "request-1");
    assert_matches!(
        message,
        AgentMessage::ProblemReport(ProblemReport { code, comment: Some(comment) })
            if code == "e.p.connection" && comment == "request rejected"
    );

    // Codes outside the problem-code namespaces are refused
    assert_matches!(
        ProblemReport::new("connection", "nope").to_plain(ALICE, BOB),
        Err(Error::Validation(_))
    );
}

#[test]
fn test_delivery_carries_envelopes_as_attachments() {
    let envelopes: Vec<&[u8]> = vec![b"{\"protected\":\"a\"}", b"{\"protected\":\"b\"}"];
    let attachments = envelopes
        .iter()
        .enumerate()
        .map(|(i, bytes)| Attachment::from_bytes(&format!("m{}", i), None, bytes))
        .collect();

    let delivery = Delivery::default()
        .to_plain("did:example:mediator", ALICE)
        .unwrap()
        .with_thread_id(Some("pickup-1".to_string()))
        .with_attachments(attachments);
    let (delivery, message) = transmit(&delivery);
    assert_eq!(message.name(), "delivery");

    let attachments = delivery.attachments.as_deref().unwrap_or_default();
    let unpacked: Vec<Vec<u8>> = attachments
        .iter()
        .map(|a| a.decode().unwrap())
        .collect();
    assert_eq!(unpacked, vec![envelopes[0].to_vec(), envelopes[1].to_vec()]);

    let ack = MessagesReceived {
        message_id_list: attachments.iter().map(|a| a.id.clone()).collect(),
    }
    .to_plain(ALICE, "did:example:mediator")
    .unwrap()
    .with_thread_id(Some(delivery.thread_id().to_string()));
    let (ack, message) = transmit(&ack);
    assert_eq!(ack.thid.as_deref(), Some("pickup-1"));
    assert_matches!(message, AgentMessage::MessagesReceived(m) if m.message_id_list == vec!["m0", "m1"]);
}
