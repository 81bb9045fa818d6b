//! Conversation control loop tests
//!
//! Drives a session through whole turns with scripted collaborators.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use hark::conversation::{ConversationState as S, SessionHandle, Update};
use hark::voice::{RecognitionErrorCode, WakeWordEngine};
use hark::{Collaborators, Config, Error, Orchestrator};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

mod common;

use common::{FakeRecognizer, FakeStreamer, FakeSynth, FakeWake, expect_update, reach, test_config};

struct Harness {
    session: SessionHandle,
    updates: broadcast::Receiver<Update>,
    wake: FakeWake,
    recognizer: FakeRecognizer,
    streamer: FakeStreamer,
    synth: Arc<FakeSynth>,
    running: JoinHandle<hark::Result<()>>,
}

impl Harness {
    fn spawn(config: &Config, wake: FakeWake, per_unit: Duration) -> Self {
        let recognizer = FakeRecognizer::default();
        let streamer = FakeStreamer::default();
        let synth = Arc::new(FakeSynth::new(per_unit));

        let orchestrator = Orchestrator::new(
            config,
            Collaborators {
                wake: WakeWordEngine::ThirdPartyEngine(Box::new(wake.clone())),
                recognizer: Box::new(recognizer.clone()),
                streamer: Arc::new(streamer.clone()),
                synthesizer: synth.clone(),
            },
        );

        let session = orchestrator.handle();
        let updates = orchestrator.subscribe();
        let running = tokio::spawn(orchestrator.run());

        Self {
            session,
            updates,
            wake,
            recognizer,
            streamer,
            synth,
            running,
        }
    }

    fn new(continuous: bool) -> Self {
        Self::spawn(&test_config(continuous), FakeWake::default(), Duration::from_millis(20))
    }

    async fn started(continuous: bool) -> Self {
        let h = Self::new(continuous);
        h.session.start().unwrap();
        reach(&h.session, S::WakeWordWait).await;
        h
    }

    /// Wake, ask `query` and wait until the request is open
    async fn ask(&self, query: &str) {
        self.wake.fire("hey hark");
        reach(&self.session, S::Listening).await;
        self.recognizer.hear(query);
        reach(&self.session, S::AiStreaming).await;
    }

    async fn finish(self) {
        self.session.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(3), self.running)
            .await
            .expect("control loop did not exit")
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_full_turn_enters_continuous_dialog() {
    let mut h = Harness::started(true).await;

    h.ask("what time is it").await;
    assert_eq!(*h.streamer.queries.lock().unwrap(), vec!["what time is it"]);

    h.streamer.text("It is ");
    reach(&h.session, S::AiResponding).await;
    h.streamer.text("noon. Anything");
    h.streamer.text(" else?");
    h.streamer.complete();

    let complete = expect_update(&mut h.updates, |u| matches!(u, Update::ResponseComplete(_))).await;
    assert_eq!(complete, Update::ResponseComplete("It is noon. Anything else?".to_string()));

    // Playback drains, then the session listens again without a wake word
    reach(&h.session, S::ContinuousDialogWait).await;
    assert!(h.session.is_continuous_dialog_mode());
    reach(&h.session, S::Listening).await;

    assert_eq!(h.synth.spoken(), vec!["It is noon.", "Anything else?"]);
    assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 2);

    h.finish().await;
}

#[tokio::test]
async fn test_turn_without_continuous_dialog_returns_to_wake_wait() {
    let h = Harness::started(false).await;

    h.ask("tell me a joke").await;
    h.streamer.text("No.");
    h.streamer.complete();

    reach(&h.session, S::Speaking).await;
    reach(&h.session, S::WakeWordWait).await;
    assert!(!h.session.is_continuous_dialog_mode());
    assert_eq!(h.synth.spoken(), vec!["No."]);

    h.finish().await;
}

#[tokio::test]
async fn test_empty_reply_concludes_immediately() {
    let h = Harness::started(false).await;

    h.ask("hello").await;
    h.streamer.complete();

    reach(&h.session, S::WakeWordWait).await;
    assert!(h.synth.spoken().is_empty());

    h.finish().await;
}

#[tokio::test]
async fn test_barge_in_while_speaking() {
    let mut h = Harness::spawn(&test_config(true), FakeWake::default(), Duration::from_secs(5));
    h.session.start().unwrap();
    reach(&h.session, S::WakeWordWait).await;

    h.ask("read me a story").await;
    h.streamer.text("Once upon a time. There was a crab. The end.");
    h.streamer.complete();
    reach(&h.session, S::Speaking).await;

    h.wake.fire("hey hark");
    expect_update(&mut h.updates, |u| *u == Update::Interrupted).await;
    reach(&h.session, S::Listening).await;

    assert!(h.synth.interrupts.load(Ordering::SeqCst) >= 1);
    assert!(!h.session.is_continuous_dialog_mode());

    // The interrupted reply never concludes the new turn
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.session.state(), S::Listening);
    assert_eq!(h.synth.spoken().len(), 1);

    h.finish().await;
}

#[tokio::test]
async fn test_barge_in_while_streaming_cancels_request() {
    let mut h = Harness::started(true).await;

    h.ask("first question").await;
    h.streamer.text("Partial answer");
    reach(&h.session, S::AiResponding).await;

    h.wake.fire("hey hark");
    expect_update(&mut h.updates, |u| *u == Update::Interrupted).await;
    reach(&h.session, S::Listening).await;
    assert!(h.streamer.cancelled());

    // Late fragments of the old request are dropped
    h.streamer.text_ignoring_cancel("more of the old answer.");
    h.recognizer.hear("second question");
    reach(&h.session, S::AiStreaming).await;
    h.streamer.text("Fresh.");
    h.streamer.complete();
    reach(&h.session, S::ContinuousDialogWait).await;

    assert_eq!(h.synth.spoken(), vec!["Fresh."]);
    assert_eq!(h.streamer.queries.lock().unwrap().len(), 2);

    h.finish().await;
}

#[tokio::test]
async fn test_no_match_in_continuous_dialog_listens_again() {
    let h = Harness::started(true).await;

    h.ask("hi").await;
    h.streamer.text("Hello!");
    h.streamer.complete();
    reach(&h.session, S::ContinuousDialogWait).await;
    reach(&h.session, S::Listening).await;

    h.recognizer.fail(RecognitionErrorCode::NoMatch);
    reach(&h.session, S::ContinuousDialogWait).await;
    reach(&h.session, S::Listening).await;
    assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 3);

    h.finish().await;
}

#[tokio::test]
async fn test_no_match_after_wake_word_waits_for_wake_word() {
    let h = Harness::started(true).await;

    h.wake.fire("hey hark");
    reach(&h.session, S::Listening).await;
    h.recognizer.fail(RecognitionErrorCode::SpeechTimeout);
    reach(&h.session, S::WakeWordWait).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.session.state(), S::WakeWordWait);
    assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 1);

    h.finish().await;
}

#[tokio::test]
async fn test_empty_final_transcript_is_no_match() {
    let h = Harness::started(false).await;

    h.wake.fire("hey hark");
    reach(&h.session, S::Listening).await;
    h.recognizer.hear("   ");
    reach(&h.session, S::WakeWordWait).await;
    assert!(h.streamer.queries.lock().unwrap().is_empty());

    h.finish().await;
}

#[tokio::test]
async fn test_server_error_is_reported() {
    let mut h = Harness::started(true).await;

    h.wake.fire("hey hark");
    reach(&h.session, S::Listening).await;
    h.recognizer.fail(RecognitionErrorCode::Server);

    let error = expect_update(&mut h.updates, |u| matches!(u, Update::Error(_))).await;
    assert_eq!(error, Update::Error("server error".to_string()));
    reach(&h.session, S::WakeWordWait).await;

    h.finish().await;
}

#[tokio::test]
async fn test_client_cancellation_is_ignored_until_next_wake() {
    let h = Harness::started(true).await;

    h.wake.fire("hey hark");
    reach(&h.session, S::Listening).await;
    h.recognizer.fail(RecognitionErrorCode::Client);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.session.state(), S::Listening);
    assert!(!h.recognizer.listening());

    // Nothing is listening any more, so the wake word starts a new attempt
    h.wake.fire("hey hark");
    tokio::time::timeout(Duration::from_secs(3), async {
        while !h.recognizer.listening() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("listening did not restart");
    assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 2);

    h.recognizer.hear("are you there");
    reach(&h.session, S::AiStreaming).await;

    h.finish().await;
}

#[tokio::test]
async fn test_wake_while_listening_is_ignored() {
    let h = Harness::started(true).await;

    h.wake.fire("hey hark");
    reach(&h.session, S::Listening).await;
    h.wake.fire("hey hark");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.session.state(), S::Listening);
    assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 1);

    h.finish().await;
}

#[tokio::test]
async fn test_pause_in_reply_releases_buffered_text() {
    let h = Harness::started(false).await;

    h.ask("say something").await;
    h.streamer.text("no terminator");
    reach(&h.session, S::AiResponding).await;

    // The stream stays open; only the control loop's tick can release the text
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.synth.spoken(), vec!["no terminator"]);
    assert_eq!(h.session.state(), S::AiResponding);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.synth.spoken(), vec!["no terminator"]);

    h.streamer.complete();
    reach(&h.session, S::WakeWordWait).await;
    assert_eq!(h.synth.spoken(), vec!["no terminator"]);

    h.finish().await;
}

#[tokio::test]
async fn test_stream_failure_returns_to_wake_wait() {
    let mut h = Harness::started(true).await;

    h.ask("what's new").await;
    h.streamer.text("Well. ");
    h.streamer.fail("HTTP error: 500");

    let error = expect_update(&mut h.updates, |u| matches!(u, Update::Error(_))).await;
    assert_eq!(error, Update::Error("HTTP error: 500".to_string()));
    reach(&h.session, S::WakeWordWait).await;
    assert!(!h.session.is_continuous_dialog_mode());

    h.finish().await;
}

#[tokio::test]
async fn test_stop_from_speaking() {
    let h = Harness::spawn(&test_config(true), FakeWake::default(), Duration::from_secs(5));
    h.session.start().unwrap();
    reach(&h.session, S::WakeWordWait).await;

    h.ask("long answer please").await;
    h.streamer.text("This takes a while.");
    h.streamer.complete();
    reach(&h.session, S::Speaking).await;

    h.session.stop().unwrap();
    reach(&h.session, S::Stopped).await;
    assert_eq!(h.wake.stops.load(Ordering::SeqCst), 1);
    assert!(h.synth.interrupts.load(Ordering::SeqCst) >= 1);
    assert!(!h.recognizer.listening());

    h.finish().await;
}

#[tokio::test]
async fn test_stopped_session_ignores_events() {
    let h = Harness::started(true).await;

    h.session.stop().unwrap();
    reach(&h.session, S::Stopped).await;

    h.session.wake().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.session.state(), S::Stopped);
    assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 0);

    // And can be started again
    h.session.start().unwrap();
    reach(&h.session, S::WakeWordWait).await;
    assert_eq!(h.wake.starts.load(Ordering::SeqCst), 2);

    h.finish().await;
}

#[tokio::test]
async fn test_disable_continuous_dialog_while_waiting() {
    let mut config = test_config(true);
    config.dialog.grace_delay = Duration::from_secs(5);
    let h = Harness::spawn(&config, FakeWake::default(), Duration::from_millis(20));
    h.session.start().unwrap();
    reach(&h.session, S::WakeWordWait).await;

    h.ask("hi").await;
    h.streamer.text("Hi.");
    h.streamer.complete();
    reach(&h.session, S::ContinuousDialogWait).await;

    h.session.set_continuous_dialog(false).unwrap();
    reach(&h.session, S::WakeWordWait).await;
    assert!(!h.session.is_continuous_dialog_mode());

    h.finish().await;
}

#[tokio::test]
async fn test_wake_during_grace_delay_starts_listening() {
    let mut config = test_config(true);
    config.dialog.grace_delay = Duration::from_millis(300);
    let h = Harness::spawn(&config, FakeWake::default(), Duration::from_millis(20));
    h.session.start().unwrap();
    reach(&h.session, S::WakeWordWait).await;

    h.ask("hi").await;
    h.streamer.complete();
    reach(&h.session, S::ContinuousDialogWait).await;

    h.wake.fire("hey hark");
    reach(&h.session, S::Listening).await;
    assert!(!h.session.is_continuous_dialog_mode());

    // The pending resume must not start a second attempt
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 2);

    h.finish().await;
}

#[tokio::test]
async fn test_capture_failure_stops_session() {
    let mut h = Harness::started(true).await;

    h.wake.fail("device unplugged");
    let error = expect_update(&mut h.updates, |u| matches!(u, Update::Error(_))).await;
    assert!(matches!(error, Update::Error(m) if m.contains("device unplugged")));
    reach(&h.session, S::Stopped).await;

    h.finish().await;
}

#[tokio::test]
async fn test_permission_denied_ends_session() {
    let h = Harness::spawn(&test_config(true), FakeWake::denied(), Duration::from_millis(20));
    h.session.start().unwrap();

    let result = tokio::time::timeout(Duration::from_secs(3), h.running)
        .await
        .expect("control loop did not exit")
        .unwrap();
    assert!(matches!(result, Err(Error::PermissionDenied(_))));
    assert_eq!(h.session.state(), S::Stopped);
}

#[tokio::test]
async fn test_partial_and_final_transcripts_published() {
    let mut h = Harness::started(false).await;

    h.wake.fire("hey hark");
    reach(&h.session, S::Listening).await;
    h.recognizer.partial("what is");
    let partial = expect_update(&mut h.updates, |u| matches!(u, Update::PartialTranscript(_))).await;
    assert_eq!(partial, Update::PartialTranscript("what is".to_string()));

    h.recognizer.hear("what is rust");
    let transcript = expect_update(&mut h.updates, |u| matches!(u, Update::Transcript(_))).await;
    assert_eq!(transcript, Update::Transcript("what is rust".to_string()));

    h.finish().await;
}
