//! Capture adapter fed by lines of already-recognised text.
//!
//! Used by the terminal client (each stdin line is an utterance) and by
//! external recognisers that print one transcript per line.

use super::{CaptureAdapter, CaptureErrorKind, CaptureEvent, CaptureSignal, CaptureSink};
use crate::echo_guard::EchoGuard;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Line-oriented speech source.
///
/// A cycle takes the next line: non-blank text is the final result, a blank
/// line or the listen timeout means no speech, a closed feed is an error.
pub struct LineCapture {
    lines: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    guard: EchoGuard,
    listen_timeout: Duration,
    listening: Arc<AtomicBool>,
    events: Option<CaptureSink>,
    active: Option<CancellationToken>,
}

impl LineCapture {
    pub fn new(
        lines: mpsc::UnboundedReceiver<String>,
        guard: EchoGuard,
        listen_timeout: Duration,
    ) -> Self {
        Self {
            lines: Arc::new(Mutex::new(lines)),
            guard,
            listen_timeout,
            listening: Arc::new(AtomicBool::new(false)),
            events: None,
            active: None,
        }
    }

    /// Feed the adapter from any buffered reader, one utterance per line.
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_reader<R>(reader: R, guard: EchoGuard, listen_timeout: Duration) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self::new(rx, guard, listen_timeout)
    }

    /// Shared flag that is true while a cycle waits for a line. Routers use
    /// it to decide whether input is an utterance or a typed message.
    pub fn listening(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.listening)
    }

    fn emit_refusal(&self, cycle: u64) {
        if let Some(events) = &self.events {
            let _ = events.send(CaptureSignal::new(
                cycle,
                CaptureEvent::Error(CaptureErrorKind::Aborted),
            ));
            let _ = events.send(CaptureSignal::new(cycle, CaptureEvent::Ended));
        }
    }
}

impl CaptureAdapter for LineCapture {
    fn subscribe(&mut self, events: CaptureSink) {
        self.events = Some(events);
    }

    fn start_capture(&mut self, cycle: u64) {
        let Some(events) = self.events.clone() else {
            warn!("capture started with no subscriber, ignoring");
            return;
        };
        if self.listening.load(Ordering::SeqCst) {
            warn!(cycle, "capture already active, ignoring start");
            return;
        }
        if self.guard.is_speaking() {
            warn!(cycle, "refusing to open capture while playback owns audio");
            self.emit_refusal(cycle);
            return;
        }

        let cancel = CancellationToken::new();
        self.active = Some(cancel.clone());
        self.listening.store(true, Ordering::SeqCst);

        let lines = Arc::clone(&self.lines);
        let listening = Arc::clone(&self.listening);
        let guard = self.guard.clone();
        let timeout = self.listen_timeout;

        debug!(cycle, "capture cycle started");
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => CaptureEvent::Error(CaptureErrorKind::Aborted),
                line = async {
                    let mut rx = lines.lock().await;
                    tokio::time::timeout(timeout, rx.recv()).await
                } => match line {
                    Ok(Some(text)) if text.trim().is_empty() => {
                        CaptureEvent::Error(CaptureErrorKind::NoSpeechDetected)
                    }
                    Ok(Some(text)) => CaptureEvent::FinalResult(text.trim().to_owned()),
                    Ok(None) => CaptureEvent::Error(CaptureErrorKind::Other("input closed".into())),
                    Err(_) => CaptureEvent::Error(CaptureErrorKind::NoSpeechDetected),
                },
            };
            // A stopped cycle already gave the flag back, possibly to a newer cycle.
            if !cancel.is_cancelled() {
                listening.store(false, Ordering::SeqCst);
            }

            // A result recognised after playback took the audio path is our own voice.
            let outcome = match outcome {
                CaptureEvent::FinalResult(text) if guard.is_speaking() => {
                    info!(cycle, len = text.len(), "dropping result captured during playback");
                    CaptureEvent::Error(CaptureErrorKind::Aborted)
                }
                other => other,
            };

            let _ = events.send(CaptureSignal::new(cycle, outcome));
            let _ = events.send(CaptureSignal::new(cycle, CaptureEvent::Ended));
        });
    }

    fn stop_capture(&mut self) {
        match self.active.take() {
            Some(cancel) if self.listening.load(Ordering::SeqCst) => {
                debug!("stopping capture cycle");
                self.listening.store(false, Ordering::SeqCst);
                cancel.cancel();
            }
            _ => debug!("stop requested with no active capture"),
        }
    }
}

impl Drop for LineCapture {
    fn drop(&mut self) {
        if let Some(cancel) = self.active.take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn setup(
        listen_timeout: Duration,
    ) -> (
        LineCapture,
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<CaptureSignal>,
    ) {
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut capture = LineCapture::new(line_rx, EchoGuard::new(), listen_timeout);
        capture.subscribe(event_tx);
        (capture, line_tx, event_rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<CaptureSignal>) -> CaptureSignal {
        tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("capture event in time")
            .expect("capture channel open")
    }

    #[tokio::test]
    async fn line_becomes_final_result_then_ended() {
        let (mut capture, line_tx, mut events) = setup(TIMEOUT);
        capture.start_capture(7);
        line_tx.send("  what time is it ".into()).unwrap();

        assert_eq!(
            next_event(&mut events).await,
            CaptureSignal::new(7, CaptureEvent::FinalResult("what time is it".into()))
        );
        assert_eq!(
            next_event(&mut events).await,
            CaptureSignal::new(7, CaptureEvent::Ended)
        );
    }

    #[tokio::test]
    async fn blank_line_is_no_speech() {
        let (mut capture, line_tx, mut events) = setup(TIMEOUT);
        capture.start_capture(1);
        line_tx.send("   ".into()).unwrap();
        assert_eq!(
            next_event(&mut events).await.event,
            CaptureEvent::Error(CaptureErrorKind::NoSpeechDetected)
        );
    }

    #[tokio::test]
    async fn timeout_is_no_speech() {
        let (mut capture, _line_tx, mut events) = setup(Duration::from_millis(20));
        capture.start_capture(1);
        assert_eq!(
            next_event(&mut events).await.event,
            CaptureEvent::Error(CaptureErrorKind::NoSpeechDetected)
        );
        assert_eq!(next_event(&mut events).await.event, CaptureEvent::Ended);
    }

    #[tokio::test]
    async fn stop_reports_aborted() {
        let (mut capture, _line_tx, mut events) = setup(TIMEOUT);
        capture.start_capture(3);
        capture.stop_capture();
        assert_eq!(
            next_event(&mut events).await,
            CaptureSignal::new(3, CaptureEvent::Error(CaptureErrorKind::Aborted))
        );
        assert_eq!(next_event(&mut events).await.event, CaptureEvent::Ended);

        // Redundant stop is tolerated.
        capture.stop_capture();
    }

    #[tokio::test]
    async fn restart_right_after_stop_takes_next_line() {
        let (mut capture, line_tx, mut events) = setup(TIMEOUT);
        capture.start_capture(1);
        capture.stop_capture();
        capture.start_capture(2);
        line_tx.send("again".into()).unwrap();

        assert_eq!(
            next_event(&mut events).await,
            CaptureSignal::new(1, CaptureEvent::Error(CaptureErrorKind::Aborted))
        );
        assert_eq!(next_event(&mut events).await.event, CaptureEvent::Ended);
        assert_eq!(
            next_event(&mut events).await,
            CaptureSignal::new(2, CaptureEvent::FinalResult("again".into()))
        );
    }

    #[tokio::test]
    async fn redundant_start_is_ignored() {
        let (mut capture, line_tx, mut events) = setup(TIMEOUT);
        capture.start_capture(1);
        capture.start_capture(2);
        line_tx.send("hello".into()).unwrap();

        assert_eq!(next_event(&mut events).await.cycle, 1);
        assert_eq!(next_event(&mut events).await.cycle, 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn refuses_to_start_while_speaking() {
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let guard = EchoGuard::new();
        let mut capture = LineCapture::new(line_rx, guard.clone(), TIMEOUT);
        capture.subscribe(event_tx);

        guard.engage();
        capture.start_capture(4);
        line_tx.send("echo of my own voice".into()).unwrap();

        assert_eq!(
            next_event(&mut events).await.event,
            CaptureEvent::Error(CaptureErrorKind::Aborted)
        );
        assert_eq!(next_event(&mut events).await.event, CaptureEvent::Ended);
        assert!(!capture.listening().load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn result_heard_after_playback_began_is_dropped() {
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let guard = EchoGuard::new();
        let mut capture = LineCapture::new(line_rx, guard.clone(), TIMEOUT);
        capture.subscribe(event_tx);

        capture.start_capture(5);
        assert!(capture.listening().load(Ordering::SeqCst));
        guard.engage();
        line_tx.send("tail of the reply".into()).unwrap();

        assert_eq!(
            next_event(&mut events).await,
            CaptureSignal::new(5, CaptureEvent::Error(CaptureErrorKind::Aborted))
        );
        assert_eq!(
            next_event(&mut events).await,
            CaptureSignal::new(5, CaptureEvent::Ended)
        );
        assert!(!capture.listening().load(Ordering::SeqCst));

        guard.release();
        capture.start_capture(6);
        line_tx.send("real question".into()).unwrap();
        assert_eq!(
            next_event(&mut events).await.event,
            CaptureEvent::FinalResult("real question".into())
        );
    }

    #[tokio::test]
    async fn closed_feed_is_an_error() {
        let (mut capture, line_tx, mut events) = setup(TIMEOUT);
        drop(line_tx);
        capture.start_capture(1);
        assert!(matches!(
            next_event(&mut events).await.event,
            CaptureEvent::Error(CaptureErrorKind::Other(_))
        ));
    }

    #[tokio::test]
    async fn reader_lines_feed_cycles() {
        let reader = tokio::io::BufReader::new(&b"first\nsecond\n"[..]);
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let mut capture = LineCapture::from_reader(reader, EchoGuard::new(), TIMEOUT);
        capture.subscribe(event_tx);

        capture.start_capture(1);
        assert_eq!(
            next_event(&mut events).await.event,
            CaptureEvent::FinalResult("first".into())
        );
        assert_eq!(next_event(&mut events).await.event, CaptureEvent::Ended);

        capture.start_capture(2);
        assert_eq!(
            next_event(&mut events).await,
            CaptureSignal::new(2, CaptureEvent::FinalResult("second".into()))
        );
    }
}
