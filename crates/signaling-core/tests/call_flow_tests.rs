// Call flow tests
//
// Ringing, acceptance, negotiation, candidate relay and the recording gate,
// driven against the scripted media backend.

mod common;

use std::time::Duration;

use common::*;
use rvoip_signaling_core::protocol::{CallParties, CandidateMessage};
use rvoip_signaling_core::{
    BrokerError, CallSide, CallState, ClientMessage, IceCandidate, MediaTopology, RestreamConfig, ServerMessage,
    StopOutcome,
};

#[tokio::test]
async fn test_make_and_accept_call() {
    let (backend, orchestrator) = setup(test_config());
    let mut a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;

    orchestrator.make_call(offer(&a, &b, "offer-a")).await.unwrap();
    assert_eq!(
        b.next().await,
        ServerMessage::ClientHaveIncomingCall(CallParties {
            caller_id: a.id.clone(),
            callee_id: b.id.clone(),
        })
    );
    assert!(orchestrator.is_ringing(&a.id, &b.id));
    assert!(backend.ops().is_empty(), "ringing must not touch the media server");

    let pipeline = orchestrator.accept_call(offer(&a, &b, "offer-b")).await.unwrap();

    // Each side gets the answer to its own offer
    assert_eq!(a.drain(), vec![ServerMessage::start_communication("answer-to:offer-a")]);
    assert_eq!(b.drain(), vec![ServerMessage::start_communication("answer-to:offer-b")]);
    assert_eq!(orchestrator.call_state(&pipeline), Some(CallState::Active));
    assert!(!orchestrator.is_ringing(&a.id, &b.id));

    let (ep_a, ep_b) = backend.endpoints(&pipeline);
    let ops = backend.ops();
    assert!(ops.contains(&Op::ProcessOffer {
        element: ep_a.clone(),
        offer: "offer-a".to_string(),
    }));
    assert!(ops.contains(&Op::ProcessOffer {
        element: ep_b.clone(),
        offer: "offer-b".to_string(),
    }));
    assert!(ops.contains(&Op::GatherCandidates(ep_a.clone())));
    assert!(ops.contains(&Op::GatherCandidates(ep_b.clone())));
    assert_eq!(
        backend.recorder_uri(&pipeline).as_deref(),
        Some("file:///tmp/video-A-to-B.webm")
    );

    let session_a = orchestrator.registry().lookup(&a.id).await.unwrap();
    let session_b = orchestrator.registry().lookup(&b.id).await.unwrap();
    assert_eq!(session_a.pipelines, vec![pipeline.clone()]);
    assert_eq!(session_b.pipelines, vec![pipeline.clone()]);
    assert_eq!(session_a.endpoint, Some(ep_a));
    assert_eq!(session_b.endpoint, Some(ep_b));
    assert_eq!(session_b.sdp.as_deref(), Some("offer-b"));
}

#[tokio::test]
async fn test_direct_topology_wiring() {
    let (backend, orchestrator) = setup(test_config());
    let mut a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;
    let pipeline = establish(&orchestrator, &mut a, &mut b).await;

    let (ep_a, ep_b) = backend.endpoints(&pipeline);
    let recorder = backend.elements_of(&pipeline, "RecorderEndpoint").remove(0);
    let ops = backend.ops();
    assert!(ops.contains(&Op::Connect { source: ep_a.clone(), sink: ep_b.clone() }));
    assert!(ops.contains(&Op::Connect { source: ep_b.clone(), sink: ep_a.clone() }));
    assert!(ops.contains(&Op::Connect { source: ep_a.clone(), sink: recorder }));
    assert!(backend.elements_of(&pipeline, "Composite").is_empty());
    assert_eq!(
        backend.count(|op| matches!(op, Op::Subscribe { .. })),
        4,
        "both endpoints subscribe to candidates and gathering"
    );
}

#[tokio::test]
async fn test_composite_topology_feeds_recorder_from_hub() {
    let (backend, orchestrator) = setup(test_config().with_topology(MediaTopology::Composite));
    let mut a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;
    let pipeline = establish(&orchestrator, &mut a, &mut b).await;

    let (ep_a, ep_b) = backend.endpoints(&pipeline);
    let recorder = backend.elements_of(&pipeline, "RecorderEndpoint").remove(0);
    let hub = backend.elements_of(&pipeline, "Composite").remove(0);

    let ports: Vec<_> = backend
        .ops()
        .into_iter()
        .filter_map(|op| match op {
            Op::CreateHubPort { hub: h, port } if h == hub => Some(port),
            _ => None,
        })
        .collect();
    assert_eq!(ports.len(), 3);

    let ops = backend.ops();
    assert!(ops.contains(&Op::Connect { source: ep_a.clone(), sink: ep_b.clone() }));
    assert!(ops.contains(&Op::Connect { source: ep_b.clone(), sink: ep_a.clone() }));
    assert!(ops.contains(&Op::Connect { source: ep_a, sink: ports[0].clone() }));
    assert!(ops.contains(&Op::Connect { source: ep_b, sink: ports[1].clone() }));
    assert!(ops.contains(&Op::Connect { source: ports[2].clone(), sink: recorder }));
}

#[tokio::test]
async fn test_recording_starts_once_after_both_sides_gathered() {
    let (backend, orchestrator) = setup(test_config());
    let mut a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;
    let pipeline = establish(&orchestrator, &mut a, &mut b).await;
    let (ep_a, ep_b) = backend.endpoints(&pipeline);

    assert!(backend.gathering_done(&ep_a));
    assert!(backend.gathering_done(&ep_a));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.recordings_started(), 0);

    assert!(backend.gathering_done(&ep_b));
    assert!(wait_for(|| backend.recordings_started() == 1).await);
    assert!(wait_for(|| orchestrator.call_state(&pipeline) == Some(CallState::Recording)).await);

    assert!(backend.gathering_done(&ep_b));
    assert!(backend.gathering_done(&ep_a));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.recordings_started(), 1);

    // Gathering notifications are never forwarded to browsers
    assert!(a.drain().is_empty());
    assert!(b.drain().is_empty());
}

#[tokio::test]
async fn test_local_candidates_reach_only_their_owner() {
    let (backend, orchestrator) = setup(test_config());
    let mut a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;
    let pipeline = establish(&orchestrator, &mut a, &mut b).await;
    let (ep_a, ep_b) = backend.endpoints(&pipeline);

    assert!(backend.local_candidate(&ep_b, "candidate:kms-b 1 udp 2122260223 10.0.0.9 40000 typ host"));
    assert_eq!(
        b.next().await,
        ServerMessage::candidate(IceCandidate::new(
            "candidate:kms-b 1 udp 2122260223 10.0.0.9 40000 typ host"
        ))
    );

    assert!(backend.local_candidate(&ep_a, "candidate:kms-a 1 udp 2122260223 10.0.0.9 40002 typ host"));
    assert_eq!(
        a.next().await,
        ServerMessage::candidate(IceCandidate::new(
            "candidate:kms-a 1 udp 2122260223 10.0.0.9 40002 typ host"
        ))
    );
    assert!(a.drain().is_empty());
    assert!(b.drain().is_empty());
}

#[tokio::test]
async fn test_early_candidates_delivered_in_order_on_accept() {
    let (backend, orchestrator) = setup(test_config());
    let a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;

    orchestrator.make_call(offer(&a, &b, "offer-a")).await.unwrap();
    b.drain();

    for n in 1..=3 {
        let message = ClientMessage::ClientSendIceCandidate(CandidateMessage {
            candidate: IceCandidate::new(format!("candidate:a{}", n)),
        });
        orchestrator.handle_client_message(&a.id, message).await;
    }
    assert_eq!(orchestrator.candidates().pending_len(&a.id), 3);
    assert_eq!(backend.count(|op| matches!(op, Op::AddIceCandidate { .. })), 0);

    let pipeline = orchestrator.accept_call(offer(&a, &b, "offer-b")).await.unwrap();
    let message = ClientMessage::ClientSendIceCandidate(CandidateMessage {
        candidate: IceCandidate::new("candidate:a4"),
    });
    orchestrator.handle_client_message(&a.id, message).await;

    let (ep_a, ep_b) = backend.endpoints(&pipeline);
    assert!(wait_for(|| backend.added_candidates(&ep_a).len() == 4).await);
    assert_eq!(
        backend.added_candidates(&ep_a),
        vec!["candidate:a1", "candidate:a2", "candidate:a3", "candidate:a4"]
    );
    assert!(backend.added_candidates(&ep_b).is_empty());
    assert_eq!(orchestrator.candidates().pending_len(&a.id), 0);
}

#[tokio::test]
async fn test_candidates_from_unknown_sessions_are_dropped() {
    let (_backend, orchestrator) = setup(test_config());
    let ghost = "ghost".into();
    orchestrator
        .add_remote_candidate(&ghost, IceCandidate::new("candidate:x"))
        .await;
    assert_eq!(orchestrator.candidates().pending_len(&ghost), 0);
}

#[tokio::test]
async fn test_accept_dispatched_on_its_own_task() {
    let (_backend, orchestrator) = setup(test_config());
    let mut a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;

    orchestrator
        .handle_client_message(&a.id, ClientMessage::ClientMakeCall(offer(&a, &b, "offer-a")))
        .await;
    assert!(matches!(b.next().await, ServerMessage::ClientHaveIncomingCall(_)));

    orchestrator
        .handle_client_message(&b.id, ClientMessage::ClientAcceptCall(offer(&a, &b, "offer-b")))
        .await;
    assert_eq!(a.next().await, ServerMessage::start_communication("answer-to:offer-a"));
    assert_eq!(b.next().await, ServerMessage::start_communication("answer-to:offer-b"));
}

#[tokio::test]
async fn test_unknown_participant_is_silently_ignored() {
    let (backend, orchestrator) = setup(test_config());
    let mut a = TestClient::connect(&orchestrator, "A").await;

    let call = rvoip_signaling_core::CallOffer {
        caller_id: a.id.clone(),
        callee_id: "nobody".into(),
        sdp: "offer-a".to_string(),
    };
    let result = orchestrator.make_call(call.clone()).await;
    assert!(matches!(result, Err(BrokerError::UnknownParticipant { .. })));

    let result = orchestrator.accept_call(call).await;
    assert!(matches!(result, Err(BrokerError::UnknownParticipant { .. })));

    assert!(a.drain().is_empty());
    assert!(backend.ops().is_empty());
}

#[tokio::test]
async fn test_accept_without_offer_is_rejected() {
    let (backend, orchestrator) = setup(test_config());
    let mut a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;

    let result = orchestrator.accept_call(offer(&a, &b, "offer-b")).await;
    assert!(matches!(result, Err(BrokerError::NoPendingOffer { .. })));
    assert!(matches!(b.drain().as_slice(), [ServerMessage::CallError(_)]));
    assert!(a.drain().is_empty());
    assert!(backend.ops().is_empty());
}

#[tokio::test]
async fn test_busy_participant_is_rejected() {
    let (backend, orchestrator) = setup(test_config());
    let mut a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;
    let mut c = TestClient::connect(&orchestrator, "C").await;
    establish(&orchestrator, &mut a, &mut b).await;

    orchestrator.make_call(offer(&c, &b, "offer-c")).await.unwrap();
    b.drain();
    let result = orchestrator.accept_call(offer(&c, &b, "offer-b2")).await;
    match result {
        Err(BrokerError::ParticipantBusy { session_id }) => assert_eq!(session_id, b.id),
        other => panic!("expected busy, got {:?}", other),
    }
    assert!(matches!(b.drain().as_slice(), [ServerMessage::CallError(_)]));
    assert!(c.drain().is_empty());
    assert_eq!(backend.count(|op| matches!(op, Op::CreatePipeline(_))), 1);
}

#[tokio::test]
async fn test_crossing_accepts_build_one_pipeline() {
    let (backend, orchestrator) = setup(test_config());
    let a = TestClient::connect(&orchestrator, "A").await;
    let b = TestClient::connect(&orchestrator, "B").await;

    orchestrator.make_call(offer(&a, &b, "offer-a")).await.unwrap();
    orchestrator.make_call(offer(&b, &a, "offer-b")).await.unwrap();
    let (a_to_b, b_to_a) = tokio::join!(
        orchestrator.accept_call(offer(&a, &b, "answer-b")),
        orchestrator.accept_call(offer(&b, &a, "answer-a")),
    );

    let (pipeline, rejected) = match (a_to_b, b_to_a) {
        (Ok(pipeline), Err(e)) | (Err(e), Ok(pipeline)) => (pipeline, e),
        other => panic!("expected exactly one accepted call, got {:?}", other),
    };
    match rejected {
        BrokerError::ParticipantBusy { session_id } => assert!(session_id == a.id || session_id == b.id),
        other => panic!("expected busy, got {:?}", other),
    }
    assert_eq!(orchestrator.active_calls(), vec![pipeline.clone()]);
    assert_eq!(backend.count(|op| matches!(op, Op::CreatePipeline(_))), 1);

    let session_a = orchestrator.registry().lookup(&a.id).await.unwrap();
    assert_eq!(session_a.pipelines, vec![pipeline.clone()]);
    assert_eq!(
        orchestrator.stop_call(&a.id, &a.id, &b.id).await.unwrap(),
        StopOutcome::Released(pipeline)
    );
    assert!(!orchestrator.is_engaged(&a.id));
    assert!(!orchestrator.is_engaged(&b.id));
}

#[tokio::test]
async fn test_callee_cannot_accept_two_callers_at_once() {
    let (backend, orchestrator) = setup(test_config());
    let a = TestClient::connect(&orchestrator, "A").await;
    let b = TestClient::connect(&orchestrator, "B").await;
    let c = TestClient::connect(&orchestrator, "C").await;

    orchestrator.make_call(offer(&a, &b, "offer-a")).await.unwrap();
    orchestrator.make_call(offer(&c, &b, "offer-c")).await.unwrap();
    let (from_a, from_c) = tokio::join!(
        orchestrator.accept_call(offer(&a, &b, "answer-to-a")),
        orchestrator.accept_call(offer(&c, &b, "answer-to-c")),
    );

    let rejected = match (from_a, from_c) {
        (Ok(_), Err(e)) | (Err(e), Ok(_)) => e,
        other => panic!("expected exactly one accepted call, got {:?}", other),
    };
    match rejected {
        BrokerError::ParticipantBusy { session_id } => assert_eq!(session_id, b.id),
        other => panic!("expected busy, got {:?}", other),
    }
    assert_eq!(orchestrator.active_calls().len(), 1);
    assert_eq!(backend.count(|op| matches!(op, Op::CreatePipeline(_))), 1);
    let session_b = orchestrator.registry().lookup(&b.id).await.unwrap();
    assert_eq!(session_b.pipelines.len(), 1);
}

#[tokio::test]
async fn test_failed_provisioning_frees_participants() {
    let (backend, orchestrator) = setup(test_config());
    let mut a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;

    backend.fail_on("create_pipeline");
    orchestrator.make_call(offer(&a, &b, "offer-a")).await.unwrap();
    assert!(orchestrator.accept_call(offer(&a, &b, "offer-b")).await.is_err());
    assert!(!orchestrator.is_engaged(&a.id));
    assert!(!orchestrator.is_engaged(&b.id));
    a.drain();
    b.drain();
}

#[tokio::test]
async fn test_self_call_is_rejected() {
    let (backend, orchestrator) = setup(test_config());
    let mut a = TestClient::connect(&orchestrator, "A").await;

    let result = orchestrator.make_call(offer(&a, &a, "offer-a")).await;
    match result {
        Err(BrokerError::SelfCall { session_id }) => assert_eq!(session_id, a.id),
        other => panic!("expected self-call rejection, got {:?}", other),
    }
    assert!(matches!(a.drain().as_slice(), [ServerMessage::CallError(_)]));
    assert!(!orchestrator.is_ringing(&a.id, &a.id));
    assert!(backend.ops().is_empty());
}

#[tokio::test]
async fn test_provisioning_failure_releases_and_notifies_both() {
    let (backend, orchestrator) = setup(test_config());
    let mut a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;
    orchestrator.make_call(offer(&a, &b, "offer-a")).await.unwrap();
    b.drain();

    backend.fail_on("connect");
    let result = orchestrator.accept_call(offer(&a, &b, "offer-b")).await;
    assert!(matches!(
        result,
        Err(BrokerError::BackendProvisioning { step: "connect endpoints", .. })
    ));

    assert_eq!(backend.released().len(), 1);
    assert!(matches!(a.drain().as_slice(), [ServerMessage::CallError(_)]));
    assert!(matches!(b.drain().as_slice(), [ServerMessage::CallError(_)]));
    assert!(orchestrator.active_calls().is_empty());

    let session_a = orchestrator.registry().lookup(&a.id).await.unwrap();
    assert!(session_a.pipelines.is_empty());
    assert!(!session_a.in_call());
}

#[tokio::test]
async fn test_pipeline_creation_failure_releases_nothing() {
    let (backend, orchestrator) = setup(test_config());
    let mut a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;
    orchestrator.make_call(offer(&a, &b, "offer-a")).await.unwrap();
    b.drain();

    backend.fail_on("create_pipeline");
    let result = orchestrator.accept_call(offer(&a, &b, "offer-b")).await;
    assert!(matches!(result, Err(BrokerError::BackendProvisioning { .. })));
    assert!(backend.released().is_empty());
    assert!(matches!(a.drain().as_slice(), [ServerMessage::CallError(_)]));
    assert!(matches!(b.drain().as_slice(), [ServerMessage::CallError(_)]));
}

#[tokio::test]
async fn test_negotiation_failure_reported_to_failing_side_only() {
    let (backend, orchestrator) = setup(test_config());
    let mut a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;
    orchestrator.make_call(offer(&a, &b, "offer-a")).await.unwrap();
    b.drain();

    backend.fail_offer("offer-b");
    let result = orchestrator.accept_call(offer(&a, &b, "offer-b")).await;
    match result {
        Err(BrokerError::Negotiation { side, .. }) => assert_eq!(side, CallSide::Callee),
        other => panic!("expected negotiation failure, got {:?}", other),
    }

    assert!(a.drain().is_empty(), "caller never reaches start-communication");
    assert!(matches!(b.drain().as_slice(), [ServerMessage::CallError(_)]));
    assert_eq!(backend.released().len(), 1);
    assert!(orchestrator.active_calls().is_empty());
    assert!(orchestrator.registry().lookup(&b.id).await.unwrap().pipelines.is_empty());
}

#[tokio::test]
async fn test_restream_failure_does_not_fail_call() {
    let restream = RestreamConfig {
        ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
        sdp_directory: std::env::temp_dir(),
        video_port_base: 56000,
        ..Default::default()
    };
    let (backend, orchestrator) = setup(test_config().with_restream(restream));
    let mut a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;
    let pipeline = establish(&orchestrator, &mut a, &mut b).await;

    assert_eq!(orchestrator.call_state(&pipeline), Some(CallState::Active));
    let rtp = backend.elements_of(&pipeline, "RtpEndpoint").remove(0);
    let offered = backend.ops().into_iter().find_map(|op| match op {
        Op::ProcessOffer { element, offer } if element == rtp => Some(offer),
        _ => None,
    });
    let offered = offered.expect("rtp endpoint received an offer");
    assert!(offered.contains("m=video 56000 RTP/AVP 96"));
    let _ = std::fs::remove_file(std::env::temp_dir().join("127.0.0.1_56000.sdp"));
}

#[tokio::test(start_paused = true)]
async fn test_ring_timeout_cancels_unanswered_call() {
    let config = rvoip_signaling_core::BrokerConfig {
        ring_timeout_secs: Some(5),
        ..test_config()
    };
    let (backend, orchestrator) = setup(config);
    let mut a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;

    orchestrator.make_call(offer(&a, &b, "offer-a")).await.unwrap();
    assert!(matches!(b.next().await, ServerMessage::ClientHaveIncomingCall(_)));

    tokio::time::sleep(Duration::from_secs(6)).await;
    let ended = ServerMessage::call_ended(&a.id, &b.id, rvoip_signaling_core::CallEndReason::NoAnswer);
    assert_eq!(a.next().await, ended);
    assert_eq!(b.next().await, ended);
    assert!(!orchestrator.is_ringing(&a.id, &b.id));

    let late = orchestrator.accept_call(offer(&a, &b, "offer-b")).await;
    assert!(matches!(late, Err(BrokerError::NoPendingOffer { .. })));
    assert!(backend.ops().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_answered_call_is_not_cancelled_by_ring_timer() {
    let config = rvoip_signaling_core::BrokerConfig {
        ring_timeout_secs: Some(5),
        ..test_config()
    };
    let (_backend, orchestrator) = setup(config);
    let mut a = TestClient::connect(&orchestrator, "A").await;
    let mut b = TestClient::connect(&orchestrator, "B").await;
    let pipeline = establish(&orchestrator, &mut a, &mut b).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(orchestrator.call_state(&pipeline), Some(CallState::Active));
    assert!(a.drain().is_empty());
    assert!(b.drain().is_empty());
}
