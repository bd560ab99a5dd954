//! Streaming pipeline wiring capture, transport and reconciliation on one event loop.

use std::sync::Arc;

use iris_capture::{CaptureEvent, CaptureScheduler, FrameSource, TickOutcome};
use iris_network::{BackoffPolicy, Connector, ExponentialBackoff, TransportChannel};
use iris_reconciler::{
    AnalysisReconciler, FrameThrottler, PerformanceAggregator, SendDecision, StateStore,
};
use iris_types::{
    analysis::{AnalysisEvent, AnalysisResults, FaceDetection},
    config::IrisConfig,
    frame::{Frame, FrameId},
    protocol::{Correlation, InboundMessage, OutboundMessage},
    state::{ConnectionState, UiSnapshot},
    telemetry::PipelineCounters,
    IrisError, Result,
};
use tokio::{
    sync::{mpsc, watch},
    time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Requests a running pipeline to stop from another task.
#[derive(Clone)]
pub struct PipelineControl {
    stop: Arc<watch::Sender<bool>>,
}

impl PipelineControl {
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.stop.borrow()
    }
}

/// Capture → throttle → transport → reconcile, driven from a single `select!` loop.
///
/// Every mutation of pipeline state happens on the task calling
/// [`run`](Self::run); the socket pumps and the encoder only exchange
/// messages with it.
pub struct StreamingPipeline<S: FrameSource> {
    scheduler: CaptureScheduler<S>,
    channel: TransportChannel,
    inbound: mpsc::Receiver<InboundMessage>,
    connection: watch::Receiver<ConnectionState>,
    /// Link session the in-flight frames were sent on.
    session: u64,
    throttler: FrameThrottler,
    reconciler: AnalysisReconciler,
    stats: PerformanceAggregator,
    store: StateStore,
    metrics_timer: Option<Interval>,
    stop: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    stopped: bool,
}

impl<S: FrameSource> StreamingPipeline<S> {
    /// Validates `config`, opens the transport channel and arms the capture timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: IrisConfig, source: S, connector: Arc<dyn Connector>) -> Result<Self> {
        let backoff = Box::new(ExponentialBackoff::from_config(&config.network));
        Self::start_with_backoff(config, source, connector, backoff)
    }

    pub fn start_with_backoff(
        config: IrisConfig,
        source: S,
        connector: Arc<dyn Connector>,
        backoff: Box<dyn BackoffPolicy>,
    ) -> Result<Self> {
        config.validate()?;

        let client_id = config
            .network
            .client_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info!(
            "Starting pipeline against {} as client {}",
            config.network.url, client_id
        );
        let (channel, inbound) =
            TransportChannel::connect(config.network.url.clone(), client_id, connector, backoff);
        let connection = channel.subscribe_state();

        let mut scheduler = CaptureScheduler::new(source, config.capture.clone());
        scheduler.start();

        let metrics_timer = (config.network.metrics_poll_interval_ms > 0).then(|| {
            let period = std::time::Duration::from_millis(config.network.metrics_poll_interval_ms);
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer
        });

        let (stop, stop_rx) = watch::channel(false);
        Ok(Self {
            scheduler,
            channel,
            inbound,
            connection,
            session: 0,
            throttler: FrameThrottler::new(config.throttle.clone()),
            reconciler: AnalysisReconciler::new(config.privacy),
            stats: PerformanceAggregator::new(&config.stats),
            store: StateStore::new(),
            metrics_timer,
            stop: Arc::new(stop),
            stop_rx,
            stopped: false,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<UiSnapshot> {
        self.store.subscribe()
    }

    pub fn snapshot(&self) -> UiSnapshot {
        self.store.snapshot()
    }

    pub fn control(&self) -> PipelineControl {
        PipelineControl {
            stop: self.stop.clone(),
        }
    }

    pub fn counters(&self) -> PipelineCounters {
        self.stats.counters()
    }

    pub fn in_flight(&self) -> usize {
        self.throttler.in_flight()
    }

    pub fn connection(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Drives the pipeline until a stop is requested or the channel goes away.
    ///
    /// Dropping the returned future pauses the pipeline without losing state;
    /// calling `run` again resumes it.
    pub async fn run(&mut self) -> Result<PipelineCounters> {
        loop {
            if self.stopped {
                break;
            }
            if *self.stop_rx.borrow_and_update() {
                self.stop();
                break;
            }

            let deadline = self.throttler.next_deadline().map(Instant::from_std);
            tokio::select! {
                event = self.scheduler.next_event() => match event {
                    CaptureEvent::Tick => self.on_tick().await,
                    CaptureEvent::Encoded(Ok(frame)) => self.on_encoded(frame),
                    CaptureEvent::Encoded(Err(err)) => {
                        self.stats.counters_mut().capture_failures += 1;
                        warn!("Frame encode failed: {err}");
                    }
                },
                message = self.inbound.recv() => match message {
                    Some(message) => self.on_inbound(message),
                    None => {
                        warn!("Transport channel ended; stopping pipeline");
                        self.stop();
                        break;
                    }
                },
                changed = self.connection.changed() => {
                    if changed.is_err() {
                        self.stop();
                        break;
                    }
                    let state = *self.connection.borrow_and_update();
                    self.on_connection(state);
                }
                _ = wait_until(deadline) => self.on_deadline(),
                _ = next_poll(&mut self.metrics_timer) => self.poll_metrics(),
                _ = self.stop_rx.changed() => {}
            }
        }
        Ok(self.stats.counters())
    }

    /// Cancels the timer, closes the channel and forgets in-flight frames. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.stop.send_replace(true);
        self.scheduler.cancel();
        self.channel.close();
        self.throttler.clear();
        self.metrics_timer = None;
        self.store.update(|snapshot| UiSnapshot {
            is_processing: false,
            connection: ConnectionState::Disconnected,
            ..snapshot.clone()
        });
        let counters = self.stats.counters();
        info!(
            "Pipeline stopped: sent {} accepted {} throttled {} timed out {} stale {}",
            counters.sent, counters.accepted, counters.throttled, counters.timed_out, counters.stale
        );
    }

    async fn on_tick(&mut self) {
        match self.scheduler.sample().await {
            Ok(TickOutcome::Started(id)) => debug!("Capture tick started frame {}", id),
            Ok(TickOutcome::NotReady) => debug!("Capture tick skipped: source not ready"),
            Ok(TickOutcome::Busy) => debug!("Capture tick skipped: previous frame still encoding"),
            Err(err) => {
                self.stats.counters_mut().capture_failures += 1;
                warn!("Capture tick failed: {err}");
            }
        }
        self.stats.publish(&self.store, now());
    }

    fn on_encoded(&mut self, frame: Frame) {
        self.stats.counters_mut().captured += 1;
        self.sync_session();
        let now = now();
        match self.throttler.decide(&frame, self.channel.state(), now) {
            SendDecision::Send => {}
            decision => {
                self.stats.counters_mut().throttled += 1;
                debug!("Dropping frame {}: {:?}", frame.id, decision);
                return;
            }
        }

        if let Err(err) = self.channel.send(OutboundMessage::video_frame(&frame)) {
            self.stats.counters_mut().throttled += 1;
            debug!("Dropping frame {}: {err}", frame.id);
            return;
        }
        if self.throttler.on_sent(&frame, now) {
            self.stats.counters_mut().sent += 1;
            debug!("Sent frame {} ({} bytes)", frame.id, frame.payload.len());
            self.store.update(|snapshot| UiSnapshot {
                is_processing: true,
                ..snapshot.clone()
            });
        }
    }

    fn on_inbound(&mut self, message: InboundMessage) {
        let correlation = message.correlation();
        match message {
            InboundMessage::Connected {
                status,
                services_ready,
                ..
            } => {
                info!(
                    "Service acknowledged connection (status {:?}, services ready {:?})",
                    status, services_ready
                );
                self.store.update(|snapshot| UiSnapshot {
                    services_ready,
                    last_error: None,
                    ..snapshot.clone()
                });
            }
            InboundMessage::FaceDetected {
                faces,
                processing_time,
                ..
            } => self.on_detection(
                correlation,
                faces.into_iter().map(FaceDetection::from).collect(),
                processing_time,
            ),
            InboundMessage::NoFacesDetected {
                processing_time, ..
            } => self.on_detection(correlation, Vec::new(), processing_time),
            InboundMessage::AnalysisComplete {
                results,
                processing_time,
                ..
            } => {
                let Some(frame_id) = self.resolve(correlation) else {
                    debug!("Discarding analysis that matches no known frame");
                    return;
                };
                let results = AnalysisResults {
                    frame_id,
                    results: results.into_iter().map(Into::into).collect(),
                    received_at: now(),
                    processing_time_ms: processing_time,
                };
                match self.reconciler.on_analysis(results, &self.store) {
                    Ok(applied) => self.stats.record_analysis(&applied),
                    Err(err) => debug!("{err}"),
                }
            }
            InboundMessage::MetricsUpdate(metrics) => {
                self.store.update(|snapshot| UiSnapshot {
                    server_metrics: Some(metrics),
                    ..snapshot.clone()
                });
            }
            InboundMessage::Error { message } => {
                warn!("Service reported an error: {message}");
                self.reconciler.on_service_error(message, &self.store);
            }
            InboundMessage::Unknown => debug!("Ignoring unknown message type"),
        }
    }

    fn on_detection(
        &mut self,
        correlation: Option<Correlation>,
        faces: Vec<FaceDetection>,
        processing_time_ms: Option<f64>,
    ) {
        let Some(frame_id) = self.resolve(correlation) else {
            self.stats.counters_mut().stale += 1;
            debug!("Discarding detection that matches no in-flight frame");
            return;
        };
        let event = AnalysisEvent {
            frame_id,
            faces,
            received_at: now(),
            processing_time_ms,
        };
        match self
            .reconciler
            .on_event(event, &mut self.throttler, &self.store)
        {
            Ok(accepted) => {
                debug!(
                    "Accepted frame {} with {} face(s) after {:.1}ms",
                    accepted.frame_id,
                    accepted.face_count,
                    accepted.latency_ms()
                );
                self.stats.record_accepted(&accepted);
                self.stats.publish(&self.store, accepted.received_at);
            }
            Err(err) if err.is_silent() => {
                self.stats.counters_mut().stale += 1;
                debug!("{err}");
            }
            Err(err) => warn!("Failed to reconcile frame {}: {err}", frame_id),
        }
    }

    fn resolve(&self, correlation: Option<Correlation>) -> Option<FrameId> {
        self.reconciler
            .resolve_frame(correlation?, &self.throttler)
    }

    fn on_connection(&mut self, state: ConnectionState) {
        if !state.is_connected() {
            self.evict_lost();
        }
        // A fast reconnect can coalesce into a single `Connected` update.
        self.sync_session();
        self.store.update(|snapshot| UiSnapshot {
            connection: state,
            is_processing: snapshot.is_processing && state.is_connected(),
            ..snapshot.clone()
        });
    }

    fn sync_session(&mut self) {
        let session = self.channel.session();
        if session != self.session {
            self.session = session;
            self.evict_lost();
        }
    }

    /// Counts every in-flight frame as timed out; its link is gone.
    fn evict_lost(&mut self) {
        let lost = self.throttler.evict_all();
        if !lost.is_empty() {
            self.stats.counters_mut().timed_out += lost.len() as u64;
            debug!("{} in-flight frame(s) lost with the link", lost.len());
        }
    }

    fn on_deadline(&mut self) {
        let expired = self.throttler.evict_expired(now());
        if expired.is_empty() {
            return;
        }
        self.stats.counters_mut().timed_out += expired.len() as u64;
        for id in expired {
            debug!("{}", IrisError::Timeout(id));
        }
        let is_processing = self.throttler.in_flight() > 0;
        self.store.update(|snapshot| UiSnapshot {
            is_processing,
            ..snapshot.clone()
        });
    }

    fn poll_metrics(&mut self) {
        if !self.channel.state().is_connected() {
            return;
        }
        if let Err(err) = self.channel.send(OutboundMessage::GetMetrics) {
            debug!("Metrics poll skipped: {err}");
        }
    }
}

impl<S: FrameSource> Drop for StreamingPipeline<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_poll(timer: &mut Option<Interval>) {
    match timer.as_mut() {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
