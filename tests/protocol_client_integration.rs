//! Protocol client tests against an in-process mock of the live backend.

mod mock_backend;

use std::time::{Duration, Instant};

use base64::prelude::*;
use serde_json::json;
use zeroize::Zeroizing;

use mock_backend::{Handshake, MockBackend, Step};
use waav_duplex::core::realtime::{
    ProtocolClient, ProtocolClientConfig, ProtocolEvent, RealtimeError, SessionState,
};

fn config(url: &str) -> ProtocolClientConfig {
    ProtocolClientConfig {
        url: url.to_string(),
        api_key: Zeroizing::new("integration-key".to_string()),
        close_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

/// Drain events until `done` matches one of them or two seconds pass.
async fn collect_until<F>(client: &mut ProtocolClient, done: F) -> Vec<ProtocolEvent>
where
    F: Fn(&ProtocolEvent) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut events = Vec::new();
    while Instant::now() < deadline {
        let batch = client.drain_events(64);
        let finished = batch.iter().any(&done);
        events.extend(batch);
        if finished {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    events
}

#[tokio::test]
async fn test_handshake_sends_setup_with_key_header() {
    let mock = MockBackend::start(vec![]).await;
    let mut client = ProtocolClient::new(config(&mock.url)).unwrap();

    client.connect(Duration::from_secs(2)).await.unwrap();
    assert_eq!(client.state(), SessionState::Connected);

    let frames = mock.wait_for_frames(1).await;
    let setup = &frames[0]["setup"];
    assert_eq!(setup["model"], "models/gemini-2.0-flash-live-001");
    assert_eq!(setup["generationConfig"]["responseModalities"], json!(["AUDIO"]));
    assert_eq!(
        setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
        "Puck"
    );
    assert_eq!(
        mock.api_key_header.lock().as_deref(),
        Some("integration-key")
    );

    let events = client.drain_events(16);
    assert_eq!(events, vec![ProtocolEvent::Connected]);

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_three_consecutive_turns_all_deliver() {
    let mut script = Vec::new();
    for reply in ["One.", "Two.", "Three."] {
        script.push(Step::AwaitClient);
        script.push(Step::Send(mock_backend::transcript(reply)));
        script.push(Step::Send(mock_backend::turn_complete()));
    }
    let mock = MockBackend::start(script).await;
    let mut client = ProtocolClient::new(config(&mock.url)).unwrap();
    client.connect(Duration::from_secs(2)).await.unwrap();

    for (turn, reply) in ["One.", "Two.", "Three."].into_iter().enumerate() {
        client.send_text(&format!("prompt {}", turn), true).unwrap();
        let events = collect_until(&mut client, |e| *e == ProtocolEvent::TurnComplete).await;

        assert!(
            events.contains(&ProtocolEvent::OutputTranscriptDelta {
                text: reply.to_string()
            }),
            "turn {} missing transcript: {:?}",
            turn,
            events
        );
        assert_eq!(events.last(), Some(&ProtocolEvent::TurnComplete));
    }

    let frames = mock.received();
    assert_eq!(frames.len(), 4);
    assert_eq!(
        frames[3]["clientContent"]["turns"][0]["parts"][0]["text"],
        "prompt 2"
    );
    assert_eq!(frames[3]["clientContent"]["turnComplete"], true);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_audio_envelopes_in_both_directions() {
    let mock = MockBackend::start(vec![
        Step::AwaitClient,
        Step::Send(mock_backend::audio(480, 16384)),
        Step::Send(mock_backend::turn_complete()),
    ])
    .await;
    let mut client = ProtocolClient::new(config(&mock.url)).unwrap();
    client.connect(Duration::from_secs(2)).await.unwrap();

    client.send_audio(&[0.5; 160], 16_000).unwrap();
    let events = collect_until(&mut client, |e| *e == ProtocolEvent::TurnComplete).await;

    let frames = mock.wait_for_frames(2).await;
    let chunk = &frames[1]["realtimeInput"]["mediaChunks"][0];
    assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
    let bytes = BASE64_STANDARD
        .decode(chunk["data"].as_str().unwrap())
        .unwrap();
    assert_eq!(bytes.len(), 320);

    let audio = events
        .iter()
        .find_map(|e| match e {
            ProtocolEvent::AudioChunk {
                samples,
                sample_rate,
            } => Some((samples.clone(), *sample_rate)),
            _ => None,
        })
        .expect("audio chunk event");
    assert_eq!(audio.1, 24_000);
    assert_eq!(audio.0.len(), 480);
    assert!((audio.0[0] - 0.5).abs() < 1e-3);

    client.send_audio_stream_end().unwrap();
    let frames = mock.wait_for_frames(3).await;
    assert_eq!(frames[2]["realtimeInput"]["audioStreamEnd"], true);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_function_call_round_trip() {
    let mock = MockBackend::start(vec![Step::Send(mock_backend::tool_call(
        "call-1",
        "set_light",
        json!({"on": true}),
    ))])
    .await;
    let mut client = ProtocolClient::new(config(&mock.url)).unwrap();
    client.connect(Duration::from_secs(2)).await.unwrap();

    let events = collect_until(&mut client, |e| {
        matches!(e, ProtocolEvent::FunctionCall { .. })
    })
    .await;
    assert!(events.contains(&ProtocolEvent::FunctionCall {
        call_id: "call-1".to_string(),
        name: "set_light".to_string(),
        args: json!({"on": true}),
    }));

    client
        .send_tool_response("call-1", "set_light", json!({"ok": true}))
        .unwrap();
    let frames = mock.wait_for_frames(2).await;
    let response = &frames[1]["toolResponse"]["functionResponses"][0];
    assert_eq!(response["id"], "call-1");
    assert_eq!(response["name"], "set_light");
    assert_eq!(response["response"]["ok"], true);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_setup_timeout_is_bounded() {
    let mock = MockBackend::start_with(Handshake::Silent, vec![]).await;
    let mut client = ProtocolClient::new(config(&mock.url)).unwrap();

    let started = Instant::now();
    let result = client.connect(Duration::from_millis(300)).await;
    assert!(matches!(result, Err(RealtimeError::Timeout(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(client.state(), SessionState::Error);

    let events = client.drain_events(16);
    assert!(matches!(events.as_slice(), [ProtocolEvent::Error { .. }]));

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_remote_close_reports_error_then_disconnected() {
    let mock = MockBackend::start(vec![
        Step::Send(mock_backend::transcript("Bye.")),
        Step::Close,
    ])
    .await;
    let mut client = ProtocolClient::new(config(&mock.url)).unwrap();
    client.connect(Duration::from_secs(2)).await.unwrap();

    let events = collect_until(&mut client, |e| *e == ProtocolEvent::Disconnected).await;
    let tail: Vec<&str> = events.iter().rev().take(2).map(|e| e.kind()).collect();
    assert_eq!(tail, vec!["disconnected", "error"]);
    assert_eq!(client.state(), SessionState::Error);
    assert!(matches!(
        client.send_text("anyone there?", true),
        Err(RealtimeError::NotConnected)
    ));

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_closes_socket_gracefully() {
    let mock = MockBackend::start(vec![]).await;
    let mut client = ProtocolClient::new(config(&mock.url)).unwrap();
    client.connect(Duration::from_secs(2)).await.unwrap();

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), SessionState::Disconnected);

    // The mock stops reading once it sees the close frame.
    tokio::time::timeout(Duration::from_secs(1), mock.handle)
        .await
        .expect("mock backend finished")
        .unwrap();

    // Teardown does not surface as an error.
    let events = client.drain_events(16);
    assert!(!events.iter().any(|e| matches!(e, ProtocolEvent::Error { .. })));
}
