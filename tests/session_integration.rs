//! End-to-end session tests: orchestrator, protocol client and playback
//! against the mock backend.

mod mock_backend;

use std::time::{Duration, Instant};

use serde_json::{Value, json};
use zeroize::Zeroizing;

use mock_backend::{MockBackend, Step};
use waav_duplex::{
    FunctionCallInfo, HandlerError, OrchestratorConfig, PlaybackConfig, PlaybackRenderer,
    ProtocolClientConfig, SessionEvent, SessionOrchestrator, SessionState, SyncPacket,
};

fn config(url: &str) -> OrchestratorConfig {
    OrchestratorConfig {
        protocol: ProtocolClientConfig {
            url: url.to_string(),
            api_key: Zeroizing::new("integration-key".to_string()),
            close_timeout: Duration::from_millis(500),
            ..Default::default()
        },
        playback: PlaybackConfig {
            source_sample_rate: 24_000,
            output_sample_rate: 24_000,
            watermark: Duration::ZERO,
            buffer_seconds: 5.0,
            max_frames_per_callback: 1024,
        },
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Tick (and optionally render) until `done` matches an event or three seconds pass.
async fn tick_until<F>(
    session: &mut SessionOrchestrator,
    renderer: &mut PlaybackRenderer,
    render: bool,
    done: F,
) -> Vec<SessionEvent>
where
    F: Fn(&SessionEvent) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut out = vec![0.0f32; 2048];
    let mut events = Vec::new();
    while Instant::now() < deadline {
        if render {
            renderer.render(&mut out, 1);
        }
        let batch = session.tick();
        let finished = batch.iter().any(&done);
        events.extend(batch);
        if finished {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    events
}

fn packets(events: &[SessionEvent]) -> Vec<SyncPacket> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Packet(p) => Some(p.clone()),
            _ => None,
        })
        .collect()
}

fn is_stopped(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::AssistantSpeakingStopped { .. })
}

#[tokio::test]
async fn test_streamed_reply_is_split_into_sentences() {
    let mut script = vec![Step::AwaitClient, Step::Send(mock_backend::audio(2400, 8000))];
    for c in "Hi! How are you?".chars() {
        script.push(Step::Send(mock_backend::transcript(&c.to_string())));
    }
    script.push(Step::Send(mock_backend::turn_complete()));
    let mock = MockBackend::start(script).await;

    let (mut session, mut renderer) = SessionOrchestrator::new(config(&mock.url)).unwrap();
    session.connect().await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    session.send_text("hello").unwrap();

    let events = tick_until(&mut session, &mut renderer, true, is_stopped).await;

    assert!(events.contains(&SessionEvent::StateChanged {
        from: SessionState::Connecting,
        to: SessionState::Connected
    }));
    assert!(events.contains(&SessionEvent::AssistantSpeakingStarted { turn_id: 1 }));
    assert_eq!(
        events.last(),
        Some(&SessionEvent::AssistantSpeakingStopped {
            turn_id: 1,
            interrupted: false
        })
    );

    let released = packets(&events);
    assert_eq!(released.len(), 2);
    assert_eq!(released[0].text, "Hi!");
    assert_eq!(released[0].sequence, 0);
    assert_eq!(released[0].audio.as_ref().map(Vec::len), Some(2400));
    assert_eq!(released[1].text, "How are you?");
    assert_eq!(released[1].sequence, 1);
    assert!(released[1].is_turn_end);

    assert!(session.playback().stats().rendered_frames >= 2400);

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_barge_in_drops_late_content_of_cancelled_turn() {
    let mock = MockBackend::start(vec![
        Step::AwaitClient,
        Step::Send(mock_backend::audio(24_000, 8000)),
        Step::Send(mock_backend::transcript("I am talking")),
        // Captured audio from the user
        Step::AwaitClient,
        Step::Send(mock_backend::transcript(" and late words. ")),
        Step::Send(mock_backend::audio(2400, 8000)),
        Step::Send(mock_backend::interrupted()),
        // audioStreamEnd after the user stops
        Step::AwaitClient,
        Step::Send(mock_backend::transcript("Fresh answer. ")),
        Step::Send(mock_backend::turn_complete()),
    ])
    .await;

    let (mut session, mut renderer) = SessionOrchestrator::new(config(&mock.url)).unwrap();
    session.connect().await.unwrap();
    session.send_text("tell me a story").unwrap();

    tick_until(&mut session, &mut renderer, false, |e| {
        matches!(e, SessionEvent::AssistantSpeakingStarted { .. })
    })
    .await;
    assert!(!session.playback().is_drained());

    session.start_capture().unwrap();
    let events = session.tick();
    assert_eq!(events[0], SessionEvent::UserSpeakingStarted);
    assert!(events.contains(&SessionEvent::AssistantSpeakingStopped {
        turn_id: 1,
        interrupted: true
    }));
    assert!(session.playback().is_drained());

    session.push_capture_audio(&[0.1; 160]).unwrap();
    session.stop_capture().unwrap();

    let events = tick_until(&mut session, &mut renderer, true, is_stopped).await;
    let released = packets(&events);
    assert!(
        released.iter().all(|p| !p.text.contains("late words")),
        "late content leaked: {:?}",
        released
    );
    assert_eq!(released.first().map(|p| p.text.as_str()), Some("Fresh answer."));
    assert_eq!(released[0].turn_id, 2);
    assert_eq!(released[0].sequence, 0);
    assert!(events.contains(&SessionEvent::AssistantSpeakingStopped {
        turn_id: 2,
        interrupted: false
    }));

    let frames = mock.received();
    assert!(frames[2]["realtimeInput"]["mediaChunks"].is_array());
    assert_eq!(frames[3]["realtimeInput"]["audioStreamEnd"], true);

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_function_call_response_goes_back_to_backend() {
    let mock = MockBackend::start(vec![
        Step::AwaitClient,
        Step::Send(mock_backend::tool_call("call-7", "get_time", json!({}))),
        Step::AwaitClient,
        Step::Send(mock_backend::turn_complete()),
    ])
    .await;

    let (mut session, mut renderer) = SessionOrchestrator::new(config(&mock.url)).unwrap();
    session.set_function_handler(
        |call: &FunctionCallInfo| -> Result<Option<Value>, HandlerError> {
            Ok(Some(json!({ "time": "noon", "for": call.name })))
        },
    );
    session.connect().await.unwrap();
    session.send_text("what time is it?").unwrap();

    let events = tick_until(&mut session, &mut renderer, true, is_stopped).await;
    let released = packets(&events);
    assert!(released[0].is_function_call());
    assert_eq!(
        released[0].function_call.as_ref().map(|c| c.call_id.as_str()),
        Some("call-7")
    );

    let frames = mock.wait_for_frames(3).await;
    let response = &frames[2]["toolResponse"]["functionResponses"][0];
    assert_eq!(response["id"], "call-7");
    assert_eq!(response["response"]["time"], "noon");
    assert_eq!(response["response"]["for"], "get_time");

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_remote_close_moves_session_to_error() {
    let mock = MockBackend::start(vec![
        Step::AwaitClient,
        Step::Send(mock_backend::transcript("Goodbye")),
        Step::Drop,
    ])
    .await;

    let (mut session, mut renderer) = SessionOrchestrator::new(config(&mock.url)).unwrap();
    session.connect().await.unwrap();
    session.send_text("bye").unwrap();

    let events = tick_until(&mut session, &mut renderer, false, |e| {
        matches!(
            e,
            SessionEvent::StateChanged {
                to: SessionState::Error,
                ..
            }
        )
    })
    .await;
    assert!(events.iter().any(|e| matches!(e, SessionEvent::Error { .. })));
    assert_eq!(session.state(), SessionState::Error);
    assert!(session.send_text("hello?").is_err());

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    let events = session.tick();
    assert_eq!(
        events.last(),
        Some(&SessionEvent::StateChanged {
            from: SessionState::Error,
            to: SessionState::Disconnected
        })
    );
}
