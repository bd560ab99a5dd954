//! Frame capture: periodic sampling of a video source into encoded frames.

mod encode;
mod source;

use async_trait::async_trait;
use chrono::Utc;
use iris_types::{
    config::CaptureConfig,
    frame::{Frame, FrameId, RawImage},
    IrisError, Result,
};
use tokio::{
    task::JoinHandle,
    time::{interval, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info};

pub use encode::encode_jpeg;
pub use source::{ImageFileSource, SyntheticSource};

/// A live video source that can be sampled.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Current frame dimensions; `(0, 0)` while the source is still warming up.
    fn dimensions(&self) -> (u32, u32);
    async fn grab(&mut self) -> Result<RawImage>;
}

/// What a single tick of the scheduler did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A sample was taken and is now encoding.
    Started(FrameId),
    NotReady,
    /// The previous sample is still encoding.
    Busy,
}

/// Event produced by [`CaptureScheduler::next_event`].
#[derive(Debug)]
pub enum CaptureEvent {
    Tick,
    Encoded(Result<Frame>),
}

struct PendingEncode {
    id: FrameId,
    task: JoinHandle<Result<Frame>>,
}

/// Owns the capture timer and turns ticks into encoded frames.
///
/// The timer exists only between [`start`](Self::start) and
/// [`cancel`](Self::cancel); dropping the scheduler releases it as well.
pub struct CaptureScheduler<S: FrameSource> {
    source: S,
    config: CaptureConfig,
    timer: Option<Interval>,
    pending: Option<PendingEncode>,
    next_id: FrameId,
}

impl<S: FrameSource> CaptureScheduler<S> {
    pub fn new(source: S, config: CaptureConfig) -> Self {
        Self {
            source,
            config,
            timer: None,
            pending: None,
            next_id: FrameId(1),
        }
    }

    pub fn start(&mut self) {
        if self.timer.is_some() {
            return;
        }
        let mut timer = interval(self.config.interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.timer = Some(timer);
        info!("Capture timer started every {}ms", self.config.interval_ms);
    }

    /// Stops the timer and abandons any in-progress encode. Idempotent.
    pub fn cancel(&mut self) {
        if self.timer.take().is_some() {
            info!("Capture timer cancelled");
        }
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Waits for the next tick. Never resolves while the timer is cancelled.
    pub async fn tick(&mut self) {
        next_tick(&mut self.timer).await
    }

    /// Waits for whichever comes first: the next tick or the outstanding encode.
    ///
    /// Cancel safe, so it can sit in a `select!` next to other event sources.
    pub async fn next_event(&mut self) -> CaptureEvent {
        tokio::select! {
            _ = next_tick(&mut self.timer) => CaptureEvent::Tick,
            frame = finish_encode(&mut self.pending) => CaptureEvent::Encoded(frame),
        }
    }

    /// Samples the source and hands the pixels to the blocking pool for encoding.
    pub async fn sample(&mut self) -> Result<TickOutcome> {
        if self.pending.is_some() {
            return Ok(TickOutcome::Busy);
        }
        let (width, height) = self.source.dimensions();
        if width == 0 || height == 0 {
            return Ok(TickOutcome::NotReady);
        }

        let raw = self.source.grab().await?;
        if raw.is_empty() {
            return Ok(TickOutcome::NotReady);
        }

        let id = self.next_id;
        self.next_id = id.next();
        let captured_at = Instant::now().into_std();
        let wall_clock = Utc::now();
        let quality = self.config.jpeg_quality;
        let max_edge = self.config.max_frame_size;

        let task = tokio::task::spawn_blocking(move || {
            let (payload, width, height) = encode_jpeg(raw, quality, max_edge)?;
            Ok(Frame {
                id,
                payload,
                width,
                height,
                captured_at,
                wall_clock,
                target_quality: quality,
            })
        });
        debug!("Sampled frame {} ({}x{})", id, width, height);
        self.pending = Some(PendingEncode { id, task });
        Ok(TickOutcome::Started(id))
    }

    /// Resolves when the outstanding encode finishes.
    ///
    /// Cancel safe: if dropped early the encode keeps running and a later call
    /// picks it up. Never resolves when nothing is pending.
    pub async fn encoded(&mut self) -> Result<Frame> {
        finish_encode(&mut self.pending).await
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer.as_mut() {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn finish_encode(pending: &mut Option<PendingEncode>) -> Result<Frame> {
    let Some(encode) = pending.as_mut() else {
        return std::future::pending().await;
    };
    let id = encode.id;
    let joined = (&mut encode.task).await;
    *pending = None;
    match joined {
        Ok(result) => result,
        Err(err) => Err(capture_error(format!("encode task for {id} failed: {err}"))),
    }
}

impl<S: FrameSource> Drop for CaptureScheduler<S> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
        }
    }
}

pub fn capture_error(message: impl Into<String>) -> IrisError {
    IrisError::Capture(message.into())
}
