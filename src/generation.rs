//! Streaming generation pipeline.
//!
//! A generation is owned by the run loop thread for its whole life. The
//! consumer holds a [`GenerationStream`]; every poll that needs a fragment
//! sends one pull (a reply slot) to the run loop, which produces exactly one
//! step per pull and blocks waiting for the next pull in between. Nothing else
//! is dequeued while a generation is running.
//!
//! ```text
//!   NotStarted ──init──▶ Running ──null / bound──▶ Completed
//!                          │  │
//!                          │  └──stream dropped──▶ Cancelled
//!                          └─────native fault────▶ Failed
//! ```
//!
//! Completed and Cancelled both clear the KV cache before the report is sent,
//! so the next `send` starts from a clean context.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::handles::EngineHandles;
use crate::native::EngineAbi;

/// Reply slot for one pulled fragment. `Ok(None)` ends the stream.
pub type Pull = oneshot::Sender<Result<Option<String>>>;

/// Position in the response, bounded by the maximum response length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationCursor {
    value: i32,
    limit: i32,
}

impl GenerationCursor {
    pub fn new(start: i32, limit: i32) -> Self {
        Self {
            value: start.min(limit),
            limit,
        }
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn limit(&self) -> i32 {
        self.limit
    }

    /// True once the cursor has reached the bound.
    pub fn exhausted(&self) -> bool {
        self.value >= self.limit
    }

    /// Run one native step that may advance the cursor, then clamp it.
    fn advance<T>(&mut self, step: impl FnOnce(&mut i32) -> T) -> T {
        let out = step(&mut self.value);
        if self.value > self.limit {
            warn!(
                cursor = self.value,
                limit = self.limit,
                "Engine advanced past response bound"
            );
            self.value = self.limit;
        }
        out
    }
}

/// How a generation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    /// Engine signalled end of text or the response bound was reached.
    Completed,
    /// The consumer stopped pulling.
    Cancelled,
    Failed(EngineError),
}

/// Final statistics of one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationReport {
    pub outcome: GenerationOutcome,
    /// Fragments delivered to the consumer.
    pub fragments: usize,
    /// Cursor value when the generation ended.
    pub cursor: i32,
    pub elapsed: Duration,
}

impl GenerationReport {
    fn new(outcome: GenerationOutcome, fragments: usize, cursor: i32, elapsed: Duration) -> Self {
        Self {
            outcome,
            fragments,
            cursor,
            elapsed,
        }
    }

    pub fn fragments_per_second(&self) -> f32 {
        let ms = self.elapsed.as_millis();
        if ms == 0 {
            0.0
        } else {
            (self.fragments as f32 * 1000.0) / ms as f32
        }
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == GenerationOutcome::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome == GenerationOutcome::Cancelled
    }
}

/// Parameters of one generation, captured when it is dequeued.
#[derive(Debug, Clone)]
pub(crate) struct GenerationPlan {
    pub text: String,
    pub format_chat: bool,
    pub max_len: i32,
}

fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `f`, turning a panic into an `EngineFault`.
pub(crate) fn guard_native<T>(op: &str, f: impl FnOnce() -> T) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let reason = format!("{} panicked: {}", op, describe_panic(payload.as_ref()));
        error!("{}", reason);
        EngineError::fault(reason)
    })
}

/// Reply to the next pull with `err`, if the consumer is still there.
fn fail_next_pull(pulls: &mut mpsc::UnboundedReceiver<Pull>, err: EngineError) {
    if let Some(reply) = pulls.blocking_recv() {
        let _ = reply.send(Err(err));
    }
}

/// Clear the KV cache of the loaded context. A panic becomes a fault.
fn clear_cache(abi: &mut dyn EngineAbi, handles: &EngineHandles) -> Result<()> {
    guard_native("kv_cache_clear", || abi.clear_cache(handles.context()))
}

/// Refuse a generation because the engine is unusable.
pub(crate) fn reject(
    mut pulls: mpsc::UnboundedReceiver<Pull>,
    err: EngineError,
) -> GenerationReport {
    warn!("Generation rejected: {}", err);
    fail_next_pull(&mut pulls, err.clone());
    GenerationReport::new(GenerationOutcome::Failed(err), 0, 0, Duration::ZERO)
}

/// Drive one generation on the run loop thread.
///
/// `engine` is `None` when nothing is loaded, which yields an empty,
/// completed stream. Returns the report and, on a native panic, the fault
/// reason so the caller can latch the engine.
pub(crate) fn drive(
    engine: Option<(&mut dyn EngineAbi, &EngineHandles)>,
    plan: GenerationPlan,
    mut pulls: mpsc::UnboundedReceiver<Pull>,
) -> (GenerationReport, Option<String>) {
    let started = Instant::now();

    let Some((abi, handles)) = engine else {
        debug!("send() with no model loaded, finishing immediately");
        pulls.close();
        while let Ok(reply) = pulls.try_recv() {
            let _ = reply.send(Ok(None));
        }
        let report = GenerationReport::new(GenerationOutcome::Completed, 0, 0, started.elapsed());
        return (report, None);
    };

    let start = guard_native("completion_init", || {
        abi.completion_init(
            handles.context(),
            handles.batch(),
            &plan.text,
            plan.format_chat,
            plan.max_len,
        )
    });
    let start = match start {
        Ok(Ok(start)) => start,
        Ok(Err(e)) => {
            error!("completion_init() failed: {}", e);
            let fault = clear_cache(abi, handles).err().map(|f| f.to_string());
            fail_next_pull(&mut pulls, e.clone());
            let report =
                GenerationReport::new(GenerationOutcome::Failed(e), 0, 0, started.elapsed());
            return (report, fault);
        }
        Err(fault) => {
            let reason = fault.to_string();
            fail_next_pull(&mut pulls, fault.clone());
            let report =
                GenerationReport::new(GenerationOutcome::Failed(fault), 0, 0, started.elapsed());
            return (report, Some(reason));
        }
    };

    let mut cursor = GenerationCursor::new(start, plan.max_len);
    let mut fragments = 0usize;
    debug!(start, limit = plan.max_len, "Generation running");

    // Err carries a native fault the caller must latch.
    let ended: Result<GenerationOutcome> = loop {
        let Some(reply) = pulls.blocking_recv() else {
            break Ok(GenerationOutcome::Cancelled);
        };

        let reply = if cursor.exhausted() {
            debug!(cursor = cursor.value(), "Response bound reached");
            reply
        } else {
            let step = guard_native("completion_step", || {
                cursor.advance(|value| {
                    abi.completion_step(
                        handles.context(),
                        handles.batch(),
                        handles.sampler(),
                        plan.max_len,
                        value,
                    )
                })
            });
            match step {
                Ok(Some(fragment)) => {
                    if reply.send(Ok(Some(fragment))).is_err() {
                        break Ok(GenerationOutcome::Cancelled);
                    }
                    fragments += 1;
                    continue;
                }
                Ok(None) => reply,
                Err(fault) => {
                    let _ = reply.send(Err(fault.clone()));
                    break Err(fault);
                }
            }
        };

        // The cache is clean before the consumer sees the end of the stream.
        if let Err(fault) = clear_cache(abi, handles) {
            let _ = reply.send(Err(fault.clone()));
            break Err(fault);
        }
        let _ = reply.send(Ok(None));
        break Ok(GenerationOutcome::Completed);
    };

    let ended = match ended {
        Ok(GenerationOutcome::Cancelled) => clear_cache(abi, handles).map(|()| {
            info!(fragments, cursor = cursor.value(), "Generation cancelled, cache cleared");
            GenerationOutcome::Cancelled
        }),
        other => other,
    };

    let (outcome, fault) = match ended {
        Ok(outcome) => {
            debug!(fragments, cursor = cursor.value(), ?outcome, "Generation finished");
            (outcome, None)
        }
        Err(fault) => {
            let reason = fault.to_string();
            (GenerationOutcome::Failed(fault), Some(reason))
        }
    };
    let report = GenerationReport::new(outcome, fragments, cursor.value(), started.elapsed());
    (report, fault)
}

/// Consumer side of a generation: an async stream of text fragments.
///
/// Dropping the stream cancels the generation; the run loop clears the KV
/// cache before it dequeues anything else. Use [`GenerationStream::cancel`]
/// to wait for that cleanup.
pub struct GenerationStream {
    pulls: Option<mpsc::UnboundedSender<Pull>>,
    pending: Option<oneshot::Receiver<Result<Option<String>>>>,
    report: Option<oneshot::Receiver<GenerationReport>>,
    /// Error to yield once when the request never reached the run loop.
    rejected: Option<EngineError>,
}

impl GenerationStream {
    pub(crate) fn new(
        pulls: mpsc::UnboundedSender<Pull>,
        report: oneshot::Receiver<GenerationReport>,
    ) -> Self {
        Self {
            pulls: Some(pulls),
            pending: None,
            report: Some(report),
            rejected: None,
        }
    }

    pub(crate) fn rejected(err: EngineError) -> Self {
        Self {
            pulls: None,
            pending: None,
            report: None,
            rejected: Some(err),
        }
    }

    fn close(&mut self) {
        self.pulls = None;
        self.pending = None;
    }

    /// Stop pulling and wait until the run loop has released the engine.
    pub async fn cancel(self) -> GenerationReport {
        self.finish().await
    }

    /// Wait for the final report. An unfinished stream is cancelled first.
    pub async fn finish(mut self) -> GenerationReport {
        self.close();
        let fallback = |err: EngineError| {
            GenerationReport::new(GenerationOutcome::Failed(err), 0, 0, Duration::ZERO)
        };
        if let Some(err) = self.rejected.take() {
            return fallback(err);
        }
        match self.report.take() {
            Some(report) => report
                .await
                .unwrap_or_else(|_| fallback(EngineError::fault("run loop terminated"))),
            None => fallback(EngineError::fault("run loop has stopped")),
        }
    }
}

impl Stream for GenerationStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(err) = self.rejected.take() {
            return Poll::Ready(Some(Err(err)));
        }

        if self.pending.is_none() {
            let Some(pulls) = self.pulls.as_ref() else {
                return Poll::Ready(None);
            };
            let (tx, rx) = oneshot::channel();
            if pulls.send(tx).is_err() {
                // Run loop already finished this generation.
                self.close();
                return Poll::Ready(None);
            }
            self.pending = Some(rx);
        }

        let Some(pending) = self.pending.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(pending).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Ok(Some(fragment)))) => {
                self.pending = None;
                Poll::Ready(Some(Ok(fragment)))
            }
            Poll::Ready(Ok(Ok(None))) => {
                self.close();
                Poll::Ready(None)
            }
            Poll::Ready(Err(_)) => {
                // Reply slot dropped unanswered: the run loop is gone.
                self.close();
                Poll::Ready(Some(Err(EngineError::fault("run loop terminated"))))
            }
            Poll::Ready(Ok(Err(e))) => {
                self.close();
                Poll::Ready(Some(Err(e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_cursor_bound() {
        let mut cursor = GenerationCursor::new(10, 12);
        assert!(!cursor.exhausted());
        cursor.advance(|v| *v += 1);
        cursor.advance(|v| *v += 1);
        assert!(cursor.exhausted());
        assert_eq!(cursor.value(), 12);

        cursor.advance(|v| *v += 5);
        assert_eq!(cursor.value(), cursor.limit());
    }

    #[test]
    fn test_cursor_start_past_bound() {
        let cursor = GenerationCursor::new(5000, 4096);
        assert!(cursor.exhausted());
        assert_eq!(cursor.value(), 4096);
    }

    #[test]
    fn test_report_rate() {
        let report = GenerationReport::new(
            GenerationOutcome::Completed,
            50,
            60,
            Duration::from_millis(500),
        );
        assert_eq!(report.fragments_per_second(), 100.0);
        assert!(report.is_completed());
    }

    #[tokio::test]
    async fn test_stream_pulls_one_fragment_per_poll() {
        let (pull_tx, mut pull_rx) = mpsc::unbounded_channel::<Pull>();
        let (report_tx, report_rx) = oneshot::channel();
        let mut stream = GenerationStream::new(pull_tx, report_rx);

        let producer = tokio::spawn(async move {
            for word in ["Hello", " World"] {
                let reply = pull_rx.recv().await.expect("test: pull");
                reply.send(Ok(Some(word.to_owned()))).expect("test: reply");
            }
            let reply = pull_rx.recv().await.expect("test: final pull");
            reply.send(Ok(None)).expect("test: reply");
            let _ = report_tx.send(GenerationReport::new(
                GenerationOutcome::Completed,
                2,
                2,
                Duration::ZERO,
            ));
        });

        assert_eq!(stream.next().await, Some(Ok("Hello".to_owned())));
        assert_eq!(stream.next().await, Some(Ok(" World".to_owned())));
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.next().await, None);

        producer.await.unwrap();
        let report = stream.finish().await;
        assert!(report.is_completed());
        assert_eq!(report.fragments, 2);
    }

    #[tokio::test]
    async fn test_unanswered_pull_is_a_fault() {
        let (pull_tx, mut pull_rx) = mpsc::unbounded_channel::<Pull>();
        let (report_tx, report_rx) = oneshot::channel::<GenerationReport>();
        let mut stream = GenerationStream::new(pull_tx, report_rx);

        let producer = tokio::spawn(async move {
            let reply = pull_rx.recv().await.expect("test: pull");
            reply.send(Ok(Some("a".to_owned()))).expect("test: reply");
            // Worker dies holding the next reply slot
            let reply = pull_rx.recv().await.expect("test: pull");
            drop(reply);
            drop(report_tx);
        });

        assert_eq!(stream.next().await, Some(Ok("a".to_owned())));
        assert!(matches!(
            stream.next().await,
            Some(Err(EngineError::EngineFault(_)))
        ));
        assert_eq!(stream.next().await, None);

        producer.await.unwrap();
        assert!(matches!(
            stream.finish().await.outcome,
            GenerationOutcome::Failed(EngineError::EngineFault(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_stream_yields_error_once() {
        let mut stream = GenerationStream::rejected(EngineError::fault("run loop stopped"));
        assert!(matches!(stream.next().await, Some(Err(EngineError::EngineFault(_)))));
        assert_eq!(stream.next().await, None);
    }
}
