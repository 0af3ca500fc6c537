//! Voice pipeline integration tests
//!
//! Drives the orchestrator with scripted STT, TTS and response providers, so
//! no network or audio hardware is needed.

use std::sync::Arc;
use std::time::Duration;

use kiosk_voice::voice::{
    Announcement, AudioPayload, ClientMessage, ServerMessage, SttEvent, SttEventKind, Transcript,
    TtsEngine, VoiceState,
};
use kiosk_voice::{StaticSettings, VoiceSettings, VoiceStack};
use uuid::Uuid;

mod common;

use common::{EchoGenerator, TestClient, chunk_indices, harness, harness_with, kinds};

const REPLY: &str = "Sure thing. The museum opens at nine and closes at five every day.";

fn position(messages: &[ServerMessage], kind: &str) -> usize {
    messages
        .iter()
        .position(|m| m.kind() == kind)
        .unwrap_or_else(|| panic!("no {kind} in {:?}", kinds(messages)))
}

#[tokio::test]
async fn test_full_turn_message_order() {
    let h = harness(REPLY, Duration::ZERO);
    let mut kiosk = TestClient::connect(&h.stack, "kiosk-1");

    h.stack
        .orchestrator
        .handle_message("kiosk-1", ClientMessage::WakewordDetected { confidence: Some(0.9) })
        .await;
    assert_eq!(kiosk.next().await, ServerMessage::state(VoiceState::Listening));

    h.stt.link(1).await.say("when does the museum open", true).await;

    let messages = kiosk.until("assistant_response").await;
    assert_eq!(messages[0], ServerMessage::state(VoiceState::Processing));
    assert_eq!(
        messages[1],
        ServerMessage::Transcript {
            text: "when does the museum open".to_string(),
            is_final: true,
        }
    );

    let start = position(&messages, "tts_audio_start");
    let end = position(&messages, "tts_audio_end");
    let first_chunk = position(&messages, "tts_audio_chunk");
    assert!(start < first_chunk && first_chunk < end);
    assert!(messages.contains(&ServerMessage::state(VoiceState::Speaking)));

    let indices = chunk_indices(&messages);
    assert!(!indices.is_empty());
    assert_eq!(indices, (0..indices.len() as u64).collect::<Vec<_>>());
    assert!(messages[end..].iter().all(|m| m.kind() != "tts_audio_chunk"));

    assert_eq!(
        messages.last(),
        Some(&ServerMessage::AssistantResponse {
            text: REPLY.to_string()
        })
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.stack.orchestrator.turn_in_progress());
}

#[tokio::test]
async fn test_turn_audio_reaches_every_client() {
    let h = harness(REPLY, Duration::ZERO);
    let mut speaker = TestClient::connect(&h.stack, "kiosk-1");
    let mut display = TestClient::connect(&h.stack, "kiosk-2");

    h.stack
        .orchestrator
        .handle_message("kiosk-1", ClientMessage::WakewordDetected { confidence: None })
        .await;
    h.stt.link(1).await.say("hello", true).await;

    let spoken = speaker.until("tts_audio_end").await;
    let heard = display.until("tts_audio_end").await;
    assert_eq!(chunk_indices(&spoken), chunk_indices(&heard));

    // transcripts and the reply text stay with the client that asked
    assert!(heard.iter().all(|m| m.kind() != "transcript"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        display
            .drain()
            .iter()
            .all(|m| m.kind() != "assistant_response")
    );
}

#[tokio::test]
async fn test_interim_transcript_keeps_listening() {
    let h = harness(REPLY, Duration::ZERO);
    let mut kiosk = TestClient::connect(&h.stack, "kiosk-1");

    h.stack
        .orchestrator
        .handle_message("kiosk-1", ClientMessage::WakewordDetected { confidence: None })
        .await;
    kiosk.next().await;

    h.stt.link(1).await.say("when does", false).await;
    assert_eq!(
        kiosk.next().await,
        ServerMessage::Transcript {
            text: "when does".to_string(),
            is_final: false,
        }
    );
    assert_eq!(
        h.stack.connections.state("kiosk-1"),
        Some(VoiceState::Listening)
    );
    assert!(!h.stack.orchestrator.turn_in_progress());
}

#[tokio::test]
async fn test_barge_in_cancels_turn_audio() {
    let long_reply = "First sentence is here. Second sentence follows it. \
                      Third sentence keeps going. Fourth sentence is last.";
    let h = harness(long_reply, Duration::from_millis(100));
    let mut kiosk = TestClient::connect(&h.stack, "kiosk-1");
    let mut other = TestClient::connect(&h.stack, "kiosk-2");

    h.stack
        .orchestrator
        .handle_message("kiosk-1", ClientMessage::WakewordDetected { confidence: None })
        .await;
    h.stt.link(1).await.say("tell me a story", true).await;
    kiosk.until("tts_audio_chunk").await;
    other.until("tts_audio_chunk").await;

    h.stack
        .orchestrator
        .handle_message("kiosk-1", ClientMessage::WakewordBargeIn)
        .await;

    let mut seen = Vec::new();
    while !(seen.contains(&"interrupt_tts") && seen.contains(&"tts_audio_cancelled")) {
        seen.push(kiosk.next().await.kind());
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    let late = kinds(&kiosk.drain());
    assert!(!late.contains(&"tts_audio_chunk"), "audio after cancel: {late:?}");
    assert!(!late.contains(&"tts_audio_end"));
    assert!(!late.contains(&"assistant_response"));

    assert_eq!(
        h.stack.connections.state("kiosk-1"),
        Some(VoiceState::Listening)
    );
    assert_eq!(h.stack.connections.state("kiosk-2"), Some(VoiceState::Idle));
    assert!(!h.stack.orchestrator.turn_in_progress());

    // a fresh STT session replaces the paused one
    h.stt.link(2).await;
    assert_eq!(h.stt.connections(), 2);
    assert!(h.stack.stt.is_active("kiosk-1"));
}

#[tokio::test]
async fn test_wake_word_while_speaking_interrupts() {
    let h = harness(REPLY, Duration::ZERO);
    let mut kiosk = TestClient::connect(&h.stack, "kiosk-1");
    h.stack.stt.start("kiosk-1");
    let first = h.stack.stt.session_id("kiosk-1");

    h.stack
        .orchestrator
        .handle_message("kiosk-1", ClientMessage::TtsPlaybackStart)
        .await;
    assert_eq!(kiosk.next().await, ServerMessage::state(VoiceState::Speaking));
    assert!(h.stack.stt.is_paused("kiosk-1"));

    h.stack
        .orchestrator
        .handle_message("kiosk-1", ClientMessage::WakewordDetected { confidence: None })
        .await;
    let messages = kiosk.until("state").await;
    assert_eq!(kinds(&messages), vec!["interrupt_tts", "state"]);
    assert_eq!(messages[1], ServerMessage::state(VoiceState::Listening));

    assert_ne!(h.stack.stt.session_id("kiosk-1"), first);
    assert!(!h.stack.stt.is_paused("kiosk-1"));
}

#[tokio::test]
async fn test_playback_end_resumes_listening_in_conversation_mode() {
    let h = harness(REPLY, Duration::ZERO);
    let mut a = TestClient::connect(&h.stack, "kiosk-a");
    let mut b = TestClient::connect(&h.stack, "kiosk-b");

    h.stack
        .orchestrator
        .handle_message("kiosk-a", ClientMessage::TtsPlaybackStart)
        .await;
    h.stack
        .orchestrator
        .handle_message("kiosk-b", ClientMessage::TtsPlaybackEnd)
        .await;

    for client in [&mut a, &mut b] {
        assert_eq!(client.next().await, ServerMessage::state(VoiceState::Speaking));
        assert_eq!(client.next().await, ServerMessage::state(VoiceState::Listening));
    }
    assert!(h.stack.stt.is_active("kiosk-a"));
    assert!(h.stack.stt.is_active("kiosk-b"));
    assert!(!h.stack.stt.is_paused("kiosk-a"));
}

#[tokio::test]
async fn test_playback_end_goes_idle_without_conversation_mode() {
    let h = harness_with(REPLY, Duration::ZERO, false, |voice| {
        voice.conversation_mode = false;
    });
    let mut a = TestClient::connect(&h.stack, "kiosk-a");
    let mut b = TestClient::connect(&h.stack, "kiosk-b");

    h.stack
        .orchestrator
        .handle_message("kiosk-a", ClientMessage::WakewordDetected { confidence: None })
        .await;
    a.next().await;
    assert!(h.stack.stt.is_active("kiosk-a"));

    h.stack
        .orchestrator
        .handle_message("kiosk-a", ClientMessage::TtsPlaybackStart)
        .await;
    h.stack
        .orchestrator
        .handle_message("kiosk-b", ClientMessage::TtsPlaybackEnd)
        .await;
    for client in [&mut a, &mut b] {
        assert_eq!(client.next().await, ServerMessage::state(VoiceState::Speaking));
        assert_eq!(client.next().await, ServerMessage::state(VoiceState::Idle));
    }
    assert!(!h.stack.stt.is_active("kiosk-a"));
}

#[tokio::test]
async fn test_playback_end_ignored_when_nothing_speaks() {
    let h = harness(REPLY, Duration::ZERO);
    let mut a = TestClient::connect(&h.stack, "kiosk-a");
    let mut b = TestClient::connect(&h.stack, "kiosk-b");

    h.stack
        .orchestrator
        .handle_message("kiosk-a", ClientMessage::WakewordDetected { confidence: None })
        .await;
    a.next().await;
    let session = h.stack.stt.session_id("kiosk-a");

    h.stack
        .orchestrator
        .handle_message("kiosk-b", ClientMessage::TtsPlaybackEnd)
        .await;

    assert!(a.drain().is_empty());
    assert!(b.drain().is_empty());
    assert_eq!(
        h.stack.connections.state("kiosk-a"),
        Some(VoiceState::Listening)
    );
    assert_eq!(h.stack.connections.state("kiosk-b"), Some(VoiceState::Idle));
    assert_eq!(h.stack.stt.session_id("kiosk-a"), session);
    assert!(!h.stack.stt.is_active("kiosk-b"));
}

#[tokio::test]
async fn test_generator_failure_speaks_apology() {
    let h = harness_with(REPLY, Duration::ZERO, true, |_| {});
    let mut kiosk = TestClient::connect(&h.stack, "kiosk-1");

    h.stack
        .orchestrator
        .handle_message("kiosk-1", ClientMessage::WakewordDetected { confidence: None })
        .await;
    h.stt.link(1).await.say("what is the weather", true).await;

    let messages = kiosk.until("tts_audio_end").await;
    let start = &messages[position(&messages, "tts_audio_start")];
    let ServerMessage::TtsAudioStart {
        total_bytes,
        total_chunks,
        ..
    } = start
    else {
        unreachable!();
    };
    assert!(total_bytes.is_some_and(|n| n > 0));
    assert_eq!(*total_chunks, Some(chunk_indices(&messages).len()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        kiosk
            .drain()
            .iter()
            .all(|m| m.kind() != "assistant_response")
    );
}

#[tokio::test]
async fn test_audio_forwarded_only_while_listening() {
    let h = harness(REPLY, Duration::ZERO);
    let _kiosk = TestClient::connect(&h.stack, "kiosk-1");
    let orchestrator = &h.stack.orchestrator;

    // idle: nothing to forward to
    orchestrator.handle_audio("kiosk-1", vec![9u8, 9].into());

    orchestrator
        .handle_message("kiosk-1", ClientMessage::WakewordDetected { confidence: None })
        .await;
    orchestrator
        .handle_message(
            "kiosk-1",
            ClientMessage::AudioChunk {
                data: AudioPayload {
                    audio: "AAEC".to_string(),
                },
            },
        )
        .await;
    orchestrator.handle_audio("kiosk-1", vec![3u8, 4].into());

    let link = h.stt.link(1).await;
    let received = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let audio = link.audio.lock().unwrap().clone();
            if audio.len() == 2 {
                return audio;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("audio never reached STT");

    assert_eq!(&received[0][..], &[0u8, 1, 2][..]);
    assert_eq!(&received[1][..], &[3u8, 4][..]);
}

#[tokio::test]
async fn test_stale_stt_events_are_ignored() {
    let h = harness(REPLY, Duration::ZERO);
    let mut kiosk = TestClient::connect(&h.stack, "kiosk-1");

    h.stack
        .orchestrator
        .handle_message("kiosk-1", ClientMessage::WakewordDetected { confidence: None })
        .await;
    kiosk.next().await;

    h.stack
        .orchestrator
        .handle_stt_event(SttEvent {
            client_id: "kiosk-1".to_string(),
            session_id: Uuid::new_v4(),
            kind: SttEventKind::Transcript(Transcript {
                text: "from an old session".to_string(),
                is_final: true,
            }),
        })
        .await;

    assert!(kiosk.drain().is_empty());
    assert_eq!(
        h.stack.connections.state("kiosk-1"),
        Some(VoiceState::Listening)
    );
    assert!(!h.stack.orchestrator.turn_in_progress());
}

#[tokio::test]
async fn test_stt_error_returns_client_to_idle() {
    let h = harness(REPLY, Duration::ZERO);
    let mut kiosk = TestClient::connect(&h.stack, "kiosk-1");

    h.stack
        .orchestrator
        .handle_message("kiosk-1", ClientMessage::WakewordDetected { confidence: None })
        .await;
    kiosk.next().await;
    let session_id = h.stack.stt.session_id("kiosk-1").unwrap();

    h.stack
        .orchestrator
        .handle_stt_event(SttEvent {
            client_id: "kiosk-1".to_string(),
            session_id,
            kind: SttEventKind::Error("provider went away".to_string()),
        })
        .await;

    let messages = kiosk.until("state").await;
    assert!(matches!(&messages[0], ServerMessage::Error { code, .. } if code == "stt_error"));
    assert_eq!(messages[1], ServerMessage::state(VoiceState::Idle));
    assert!(!h.stack.stt.is_active("kiosk-1"));
}

#[tokio::test]
async fn test_provider_error_returns_client_to_idle() {
    let h = harness(REPLY, Duration::ZERO);
    let mut kiosk = TestClient::connect(&h.stack, "kiosk-1");

    h.stack
        .orchestrator
        .handle_message("kiosk-1", ClientMessage::WakewordDetected { confidence: None })
        .await;
    kiosk.next().await;

    h.stt
        .link(1)
        .await
        .transcripts
        .send(Err(kiosk_voice::Error::Stt("provider went away".to_string())))
        .await
        .unwrap();

    let messages = kiosk.until("state").await;
    assert!(matches!(
        &messages[0],
        ServerMessage::Error { code, message }
            if code == "stt_error" && message.contains("provider went away")
    ));
    assert_eq!(messages[1], ServerMessage::state(VoiceState::Idle));
    assert!(!h.stack.stt.is_active("kiosk-1"));

    // a new wake word opens a fresh session
    h.stack
        .orchestrator
        .handle_message("kiosk-1", ClientMessage::WakewordDetected { confidence: None })
        .await;
    assert_eq!(kiosk.next().await, ServerMessage::state(VoiceState::Listening));
    h.stt.link(2).await;
}

#[tokio::test]
async fn test_barge_in_cancels_announcement() {
    let h = harness(REPLY, Duration::from_millis(60));
    let mut kiosk = TestClient::connect(&h.stack, "kiosk-1");

    let orchestrator = Arc::clone(&h.stack.orchestrator);
    let announcement = tokio::spawn(async move {
        orchestrator
            .announce("The museum closes in ten minutes.")
            .await
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.stack.orchestrator.turn_in_progress());
    h.stack
        .orchestrator
        .handle_message("kiosk-1", ClientMessage::WakewordBargeIn)
        .await;

    let outcome = announcement.await.unwrap().unwrap();
    assert_eq!(outcome, Announcement::Cancelled);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let messages = kiosk.drain();
    assert_eq!(kinds(&messages), vec!["interrupt_tts", "state"]);
    assert_eq!(messages[1], ServerMessage::state(VoiceState::Listening));
    assert_eq!(
        h.stack.connections.state("kiosk-1"),
        Some(VoiceState::Listening)
    );
    assert!(!h.stack.orchestrator.turn_in_progress());
}

#[tokio::test]
async fn test_wake_without_stt_reports_unavailable() {
    let settings = Arc::new(StaticSettings::new(VoiceSettings::default()));
    let stack = VoiceStack::new(
        settings.clone(),
        TtsEngine::new(settings),
        None,
        Arc::new(EchoGenerator {
            reply: REPLY.to_string(),
            fail: false,
        }),
    );
    let mut kiosk = TestClient::connect(&stack, "kiosk-1");

    stack
        .orchestrator
        .handle_message("kiosk-1", ClientMessage::WakewordDetected { confidence: None })
        .await;

    assert_eq!(kiosk.next().await, ServerMessage::state(VoiceState::Listening));
    assert!(matches!(kiosk.next().await, ServerMessage::Error { code, .. } if code == "stt_unavailable"));
    assert_eq!(kiosk.next().await, ServerMessage::state(VoiceState::Idle));
}

#[tokio::test]
async fn test_heartbeat_and_unknown_messages() {
    let h = harness(REPLY, Duration::ZERO);
    let mut kiosk = TestClient::connect(&h.stack, "kiosk-1");
    let orchestrator = &h.stack.orchestrator;

    orchestrator
        .handle_message("kiosk-1", ClientMessage::Heartbeat)
        .await;
    assert_eq!(kiosk.next().await, ServerMessage::HeartbeatAck);

    orchestrator
        .handle_message("kiosk-1", ClientMessage::ConnectionReady)
        .await;
    assert_eq!(kiosk.next().await, ServerMessage::state(VoiceState::Idle));

    orchestrator
        .handle_message("kiosk-1", ClientMessage::Unknown)
        .await;
    assert!(kiosk.drain().is_empty());
    assert_eq!(h.stack.connections.state("kiosk-1"), Some(VoiceState::Idle));
}

#[tokio::test]
async fn test_stale_disconnect_keeps_reconnected_client() {
    let h = harness(REPLY, Duration::ZERO);
    let old = h
        .stack
        .orchestrator
        .handle_connect("kiosk-1", tokio::sync::mpsc::channel(8).0);
    let _fresh = TestClient::connect(&h.stack, "kiosk-1");
    h.stack.stt.start("kiosk-1");

    h.stack.orchestrator.handle_disconnect("kiosk-1", old);
    assert!(h.stack.connections.contains("kiosk-1"));
    assert!(h.stack.stt.is_active("kiosk-1"));

    let current = h.stack.connections.connection_id("kiosk-1").unwrap();
    h.stack.orchestrator.handle_disconnect("kiosk-1", current);
    assert!(!h.stack.connections.contains("kiosk-1"));
    assert!(!h.stack.stt.is_active("kiosk-1"));
}
