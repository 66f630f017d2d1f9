//! Speak queue.
//!
//! Sentences arrive faster than the avatar can speak them, so they queue here
//! and a single drain loop per session feeds them to the synthesis link one
//! at a time. The `speaking` flag guards against a second drain starting
//! while one is running; stopping flips the flag so the running drain exits
//! after the current utterance. The sentence being spoken when a link drops
//! is retained so it can be re-queued after a reconnect.

use crate::synthesis::{SynthesisControl, build_ssml};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Utterance {
    text: String,
    ending_silence_ms: u64,
}

#[derive(Default)]
struct SpeakerState {
    queue: VecDeque<Utterance>,
    speaking: bool,
    speaking_text: Option<String>,
    last_spoke: Option<Instant>,
}

#[derive(Clone)]
pub struct Speaker {
    state: Arc<Mutex<SpeakerState>>,
    control: Arc<RwLock<Option<Arc<dyn SynthesisControl>>>>,
    voice: Arc<RwLock<(String, Option<String>)>>,
}

impl Speaker {
    pub fn new(default_voice: String) -> Self {
        Self {
            state: Arc::new(Mutex::new(SpeakerState::default())),
            control: Arc::new(RwLock::new(None)),
            voice: Arc::new(RwLock::new((default_voice, None))),
        }
    }

    /// Swaps in the control handle of a newly bound link (or `None` on
    /// disconnect).
    pub fn set_control(&self, control: Option<Arc<dyn SynthesisControl>>) {
        *self.control.write().expect("speaker lock poisoned") = control;
    }

    /// Selects the voice and optional personal-voice profile for SSML.
    pub fn set_voice(&self, voice: String, speaker_profile_id: Option<String>) {
        *self.voice.write().expect("speaker lock poisoned") = (voice, speaker_profile_id);
    }

    /// Queues a sentence and starts the drain loop if it isn't running.
    pub fn enqueue(&self, text: String, ending_silence_ms: u64) {
        {
            let mut state = self.state.lock().expect("speaker lock poisoned");
            state.queue.push_back(Utterance {
                text,
                ending_silence_ms,
            });
        }
        self.ensure_draining();
    }

    /// Stops speaking. The queue is cleared unless `keep_queue` is set (a
    /// reconnect wants to resume where it left off); the interrupted sentence
    /// is retained either way only when kept.
    pub async fn stop(&self, keep_queue: bool) {
        {
            let mut state = self.state.lock().expect("speaker lock poisoned");
            state.speaking = false;
            if !keep_queue {
                state.queue.clear();
                state.speaking_text = None;
            }
        }
        let control = self.current_control();
        if let Some(control) = control {
            if let Err(e) = control.stop().await {
                debug!(error = ?e, "Synthesis stop request failed.");
            }
        }
    }

    /// Resumes the queue after a reconnect. With `repeat_interrupted`, the
    /// sentence that was cut off is spoken again first.
    pub fn continue_speaking(&self, repeat_interrupted: bool) {
        {
            let mut state = self.state.lock().expect("speaker lock poisoned");
            if repeat_interrupted {
                if let Some(text) = state.speaking_text.take() {
                    state.queue.push_front(Utterance {
                        text,
                        ending_silence_ms: 0,
                    });
                }
            }
            if state.queue.is_empty() {
                return;
            }
        }
        self.ensure_draining();
    }

    pub fn is_speaking(&self) -> bool {
        self.state.lock().expect("speaker lock poisoned").speaking
    }

    pub fn last_spoke(&self) -> Option<Instant> {
        self.state.lock().expect("speaker lock poisoned").last_spoke
    }

    fn current_control(&self) -> Option<Arc<dyn SynthesisControl>> {
        self.control.read().expect("speaker lock poisoned").clone()
    }

    fn ensure_draining(&self) {
        {
            let mut state = self.state.lock().expect("speaker lock poisoned");
            if state.speaking {
                return;
            }
            state.speaking = true;
        }
        let speaker = self.clone();
        tokio::spawn(async move { speaker.drain().await });
    }

    async fn drain(&self) {
        loop {
            let next = {
                let mut state = self.state.lock().expect("speaker lock poisoned");
                if !state.speaking {
                    // Stopped mid-drain; whatever remains stays queued for a
                    // later continue.
                    return;
                }
                match state.queue.pop_front() {
                    Some(utterance) => {
                        state.speaking_text = Some(utterance.text.clone());
                        Some(utterance)
                    }
                    None => {
                        state.speaking = false;
                        state.speaking_text = None;
                        None
                    }
                }
            };
            let Some(utterance) = next else {
                debug!("Speak queue drained.");
                return;
            };

            let Some(control) = self.current_control() else {
                // No link; leave the interrupted sentence recorded.
                let mut state = self.state.lock().expect("speaker lock poisoned");
                state.speaking = false;
                return;
            };

            let (voice, profile) = self.voice.read().expect("speaker lock poisoned").clone();
            let ssml = build_ssml(
                &utterance.text,
                &voice,
                profile.as_deref(),
                utterance.ending_silence_ms,
            );

            match control.speak_ssml(&ssml).await {
                Ok(_) => {
                    let mut state = self.state.lock().expect("speaker lock poisoned");
                    state.speaking_text = None;
                    state.last_spoke = Some(Instant::now());
                }
                Err(e) => {
                    // Keep speaking_text so the sentence can be repeated
                    // after the link recovers.
                    warn!(error = ?e, "Speaking failed; queue paused.");
                    let mut state = self.state.lock().expect("speaker lock poisoned");
                    state.speaking = false;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    struct MockControl {
        spoken: mpsc::UnboundedSender<String>,
        fail: AtomicBool,
    }

    impl MockControl {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    spoken: tx,
                    fail: AtomicBool::new(false),
                }),
                rx,
            )
        }
    }

    #[async_trait]
    impl SynthesisControl for MockControl {
        async fn speak_ssml(&self, ssml: &str) -> Result<String> {
            if self.fail.load(Ordering::SeqCst) {
                bail!("link down");
            }
            self.spoken.send(ssml.to_string()).unwrap();
            Ok("result-id".into())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            !self.fail.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn sentences_are_spoken_in_order() {
        let speaker = Speaker::new("en-US-Jenny".into());
        let (control, mut spoken) = MockControl::new();
        speaker.set_control(Some(control));

        speaker.enqueue("First.".into(), 0);
        speaker.enqueue("Second.".into(), 0);

        let a = spoken.recv().await.unwrap();
        let b = spoken.recv().await.unwrap();
        assert!(a.contains("First."));
        assert!(b.contains("Second."));
    }

    #[tokio::test]
    async fn stop_clears_the_queue() {
        let speaker = Speaker::new("en-US-Jenny".into());
        // No control attached: the drain pauses immediately, leaving the
        // queue populated.
        speaker.enqueue("Pending one.".into(), 0);
        tokio::task::yield_now().await;

        speaker.stop(false).await;
        let (control, mut spoken) = MockControl::new();
        speaker.set_control(Some(control));
        speaker.continue_speaking(false);

        tokio::task::yield_now().await;
        assert!(spoken.try_recv().is_err(), "cleared queue must stay silent");
    }

    #[tokio::test]
    async fn interrupted_sentence_repeats_after_continue() {
        let speaker = Speaker::new("en-US-Jenny".into());
        let (control, mut spoken) = MockControl::new();
        control.fail.store(true, Ordering::SeqCst);
        speaker.set_control(Some(control.clone()));

        speaker.enqueue("Cut off midway.".into(), 0);
        // Wait for the drain to hit the failure and pause.
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while speaker.is_speaking() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        control.fail.store(false, Ordering::SeqCst);
        speaker.continue_speaking(true);

        let replay = spoken.recv().await.unwrap();
        assert!(replay.contains("Cut off midway."));
    }

    #[tokio::test]
    async fn last_spoke_is_recorded() {
        let speaker = Speaker::new("en-US-Jenny".into());
        let (control, mut spoken) = MockControl::new();
        speaker.set_control(Some(control));

        assert!(speaker.last_spoke().is_none());
        speaker.enqueue("Hello.".into(), 0);
        spoken.recv().await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while speaker.last_spoke().is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
