pub mod state;

use std::time::Duration;

use chrono::{DateTime, Local};
use frame_sentinel_common::config::Config;
use frame_sentinel_common::frame::Frame;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{should_alert, AlertEvent, TriggerTerms};
use crate::analyzer::{AnalysisError, Analyzer};
use crate::gate::change::ChangeGate;
use crate::gate::schedule::ActiveHours;
use crate::notifier::{DeliveryError, Notifier};
use crate::snapshot::SnapshotWriter;
use crate::source::FrameSource;

pub use state::{LoopState, LoopStats, TickOutcome};

/// Stats are logged every this many ticks.
const STATS_EVERY_TICKS: u64 = 100;

/// Everything the loop needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub active_hours: ActiveHours,
    pub change_gate: ChangeGate,
    pub trigger_terms: TriggerTerms,
    pub system_prompt: String,
    pub jpeg_quality: u8,
    pub analyzer_timeout: Duration,
    pub notifier_timeout: Duration,
    pub snapshot: Option<SnapshotWriter>,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        let snapshot = Some(config.alert.snapshot_path.clone())
            .filter(|p| !p.as_os_str().is_empty())
            .map(SnapshotWriter::new);
        Self {
            interval: Duration::from_secs(config.schedule.interval_secs),
            active_hours: ActiveHours::new(
                config.schedule.active_start_hour,
                config.schedule.active_end_hour,
            ),
            change_gate: ChangeGate::new(config.change.threshold, config.change.noise_floor),
            trigger_terms: TriggerTerms::new(&config.alert.trigger_terms),
            system_prompt: config.analyzer.system_prompt.clone(),
            jpeg_quality: config.analyzer.jpeg_quality,
            analyzer_timeout: Duration::from_secs(config.analyzer.timeout_secs),
            notifier_timeout: Duration::from_secs(config.telegram.timeout_secs),
            snapshot,
        }
    }
}

type Clock = Box<dyn Fn() -> DateTime<Local> + Send + Sync>;

/// Periodic capture → gate → analyze → alert driver.
///
/// Owns the last captured frame; ticks run strictly one after another.
pub struct MonitoringLoop {
    settings: MonitorSettings,
    source: Box<dyn FrameSource>,
    analyzer: Box<dyn Analyzer>,
    notifier: Box<dyn Notifier>,
    clock: Clock,
    last_frame: Option<Frame>,
    state: LoopState,
    stats: LoopStats,
}

impl MonitoringLoop {
    pub fn new(
        settings: MonitorSettings,
        source: Box<dyn FrameSource>,
        analyzer: Box<dyn Analyzer>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            source,
            analyzer,
            notifier,
            clock: Box::new(Local::now),
            last_frame: None,
            state: LoopState::Idle,
            stats: LoopStats::default(),
        }
    }

    /// Replace the wall clock used for the active-hours check.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Local> + Send + Sync + 'static,
    {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }

    /// Tick, sleep, repeat until `shutdown` fires. Cancellation is only
    /// observed while sleeping, so a tick in progress always completes.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            source = self.source.name(),
            interval_secs = self.settings.interval.as_secs(),
            threshold = self.settings.change_gate.threshold(),
            trigger_terms = self.settings.trigger_terms.len(),
            snapshot = self
                .settings
                .snapshot
                .as_ref()
                .map(|s| s.path().display().to_string()),
            "monitoring loop started"
        );
        if self.settings.trigger_terms.is_empty() {
            warn!("no trigger terms configured, alerts will never be sent");
        }

        loop {
            self.tick().await;

            if self.stats.ticks % STATS_EVERY_TICKS == 0 {
                let s = &self.stats;
                debug!(
                    ticks = s.ticks,
                    analyzed = s.analyzed,
                    alerts_sent = s.alerts_sent,
                    capture_failures = s.capture_failures,
                    "monitoring progress"
                );
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }

        let s = &self.stats;
        info!(
            ticks = s.ticks,
            skipped_inactive = s.skipped_inactive,
            capture_failures = s.capture_failures,
            unchanged = s.unchanged,
            analyzed = s.analyzed,
            analysis_failures = s.analysis_failures,
            alerts_sent = s.alerts_sent,
            delivery_failures = s.delivery_failures,
            "monitoring loop stopped"
        );
    }

    /// Run one pass. Every failure is turned into an outcome here and the
    /// loop is back in `Idle` on return.
    pub async fn tick(&mut self) -> TickOutcome {
        let outcome = self.step().await;
        self.state = LoopState::Idle;
        self.stats.record(&outcome);
        outcome
    }

    async fn step(&mut self) -> TickOutcome {
        let now = (self.clock)();
        if !self.settings.active_hours.contains(&now) {
            debug!(now = %now.format("%H:%M"), "outside active hours, skipping tick");
            return TickOutcome::OutsideActiveHours;
        }

        self.state = LoopState::Capturing;
        let frame = match self.source.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(source = self.source.name(), error = %e, "capture failed, skipping tick");
                return TickOutcome::CaptureFailed;
            }
        };

        self.state = LoopState::Gating;
        let outcome = if self
            .settings
            .change_gate
            .is_significant(self.last_frame.as_ref(), &frame)
        {
            self.examine(&frame).await
        } else {
            TickOutcome::Unchanged
        };

        // Replaced after every successful capture so small drifts never add up.
        self.last_frame = Some(frame);
        outcome
    }

    async fn examine(&mut self, frame: &Frame) -> TickOutcome {
        let jpeg = match frame.encode_jpeg(self.settings.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                warn!(seq = frame.seq, error = %e, "failed to encode frame");
                return TickOutcome::EncodeFailed;
            }
        };

        if let Some(snapshot) = &self.settings.snapshot {
            if let Err(e) = snapshot.write(&jpeg).await {
                warn!(error = %e, "failed to store snapshot");
            }
        }

        self.state = LoopState::Analyzing;
        let timeout = self.settings.analyzer_timeout;
        let analysis = tokio::time::timeout(
            timeout,
            self.analyzer.analyze(&jpeg, &self.settings.system_prompt),
        )
        .await
        .unwrap_or(Err(AnalysisError::Timeout(timeout)));

        let description = match analysis {
            Ok(text) => text,
            Err(e) => {
                warn!(seq = frame.seq, error = %e, "analysis failed, no alert this tick");
                return TickOutcome::AnalysisFailed;
            }
        };
        info!(
            seq = frame.seq,
            captured_at = frame.captured_at(),
            description,
            "analysis result"
        );

        self.state = LoopState::Deciding;
        if !should_alert(&description, &self.settings.trigger_terms) {
            debug!("no trigger term in analysis");
            return TickOutcome::NoAlert;
        }
        let event = AlertEvent {
            jpeg,
            caption: description,
        };

        self.state = LoopState::Notifying;
        let timeout = self.settings.notifier_timeout;
        let delivery = tokio::time::timeout(timeout, self.notifier.send(&event.jpeg, &event.caption))
            .await
            .unwrap_or(Err(DeliveryError::Timeout(timeout)));

        match delivery {
            Ok(()) => {
                info!(seq = frame.seq, bytes = event.jpeg.len(), "alert sent");
                TickOutcome::Alerted(event.caption)
            }
            Err(e) => {
                error!(seq = frame.seq, error = %e, "failed to deliver alert");
                TickOutcome::DeliveryFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CaptureError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use image::{Rgb, RgbImage};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const W: u32 = 320;
    const H: u32 = 240;

    fn at_hour(hour: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 1, 15, hour, 30, 0)
            .earliest()
            .unwrap()
    }

    fn black(seq: u64) -> Frame {
        Frame::new(RgbImage::from_pixel(W, H, Rgb([0, 0, 0])), 0, seq)
    }

    /// Black frame whose first `rows` rows are white.
    fn white_rows(rows: u32, seq: u64) -> Frame {
        let image = RgbImage::from_fn(W, H, |_, y| {
            if y < rows {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        Frame::new(image, 0, seq)
    }

    struct ScriptedSource {
        script: VecDeque<Result<Frame, CaptureError>>,
        captures: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn capture(&mut self) -> Result<Frame, CaptureError> {
            let n = self.captures.fetch_add(1, Ordering::SeqCst) as u64 + 1;
            self.script.pop_front().unwrap_or_else(|| Ok(black(n)))
        }
    }

    enum Reply {
        Text(&'static str),
        Fail,
        Hang,
    }

    struct FakeAnalyzer {
        reply: Reply,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Analyzer for FakeAnalyzer {
        async fn analyze(&self, jpeg: &[u8], _system_prompt: &str) -> Result<String, AnalysisError> {
            assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.reply {
                Reply::Text(text) => Ok(text.to_string()),
                Reply::Fail => Err(AnalysisError::Status {
                    status: 500,
                    body: "upstream error".into(),
                }),
                Reply::Hang => std::future::pending().await,
            }
        }
    }

    struct FakeNotifier {
        fail: bool,
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn send(&self, _jpeg: &[u8], caption: &str) -> Result<(), DeliveryError> {
            self.sent.lock().unwrap().push(caption.to_string());
            if self.fail {
                return Err(DeliveryError::Rejected {
                    status: 400,
                    description: "chat not found".into(),
                });
            }
            Ok(())
        }
    }

    struct Probes {
        captures: Arc<AtomicUsize>,
        analyses: Arc<AtomicUsize>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl Probes {
        fn captures(&self) -> usize {
            self.captures.load(Ordering::SeqCst)
        }

        fn analyses(&self) -> usize {
            self.analyses.load(Ordering::SeqCst)
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_secs(600),
            active_hours: ActiveHours::always(),
            change_gate: ChangeGate::new(0.03, 25),
            trigger_terms: TriggerTerms::new(["fall"]),
            system_prompt: "watch for risk".into(),
            jpeg_quality: 85,
            analyzer_timeout: Duration::from_secs(60),
            notifier_timeout: Duration::from_secs(30),
            snapshot: None,
        }
    }

    fn monitor(
        settings: MonitorSettings,
        script: Vec<Result<Frame, CaptureError>>,
        reply: Reply,
        delivery_fails: bool,
    ) -> (MonitoringLoop, Probes) {
        let probes = Probes {
            captures: Arc::new(AtomicUsize::new(0)),
            analyses: Arc::new(AtomicUsize::new(0)),
            sent: Arc::new(Mutex::new(Vec::new())),
        };
        let source = ScriptedSource {
            script: script.into(),
            captures: probes.captures.clone(),
        };
        let analyzer = FakeAnalyzer {
            reply,
            calls: probes.analyses.clone(),
        };
        let notifier = FakeNotifier {
            fail: delivery_fails,
            sent: probes.sent.clone(),
        };
        let monitor = MonitoringLoop::new(
            settings,
            Box::new(source),
            Box::new(analyzer),
            Box::new(notifier),
        )
        .with_clock(|| at_hour(12));
        (monitor, probes)
    }

    #[tokio::test]
    async fn first_frame_with_trigger_term_alerts_once() {
        let caption = "Person has fallen near the door";
        let (mut monitor, probes) = monitor(settings(), vec![Ok(black(1))], Reply::Text(caption), false);

        let outcome = monitor.tick().await;

        assert_eq!(outcome, TickOutcome::Alerted(caption.to_string()));
        assert_eq!(probes.analyses(), 1);
        assert_eq!(probes.sent(), vec![caption.to_string()]);
        assert_eq!(monitor.state(), LoopState::Idle);
        assert_eq!(monitor.last_frame().map(|f| f.seq), Some(1));
    }

    #[tokio::test]
    async fn identical_frames_never_reach_analyzer() {
        let (mut monitor, probes) = monitor(
            settings(),
            vec![Ok(black(1)), Ok(black(2)), Ok(black(3))],
            Reply::Text("all clear"),
            false,
        );

        assert_eq!(monitor.tick().await, TickOutcome::NoAlert);
        assert_eq!(monitor.tick().await, TickOutcome::Unchanged);
        assert_eq!(monitor.tick().await, TickOutcome::Unchanged);
        assert_eq!(probes.analyses(), 1);
        assert!(probes.sent().is_empty());
    }

    #[tokio::test]
    async fn analysis_failure_never_notifies() {
        let (mut monitor, probes) = monitor(settings(), vec![Ok(black(1))], Reply::Fail, false);

        assert_eq!(monitor.tick().await, TickOutcome::AnalysisFailed);
        assert_eq!(probes.analyses(), 1);
        assert!(probes.sent().is_empty());
        assert_eq!(monitor.last_frame().map(|f| f.seq), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn analyzer_timeout_is_an_analysis_failure() {
        let (mut monitor, probes) = monitor(settings(), vec![Ok(black(1))], Reply::Hang, false);

        let started = tokio::time::Instant::now();
        assert_eq!(monitor.tick().await, TickOutcome::AnalysisFailed);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(probes.sent().is_empty());
        assert_eq!(monitor.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn capture_failure_keeps_previous_frame() {
        let (mut monitor, probes) = monitor(
            settings(),
            vec![Ok(black(1)), Err(CaptureError::Unavailable), Ok(black(3))],
            Reply::Text("all clear"),
            false,
        );

        monitor.tick().await;
        assert_eq!(monitor.tick().await, TickOutcome::CaptureFailed);
        assert_eq!(monitor.last_frame().map(|f| f.seq), Some(1));

        // Compared with frame 1, not with nothing.
        assert_eq!(monitor.tick().await, TickOutcome::Unchanged);
        assert_eq!(probes.analyses(), 1);
        assert_eq!(monitor.stats().capture_failures, 1);
    }

    #[tokio::test]
    async fn small_changes_do_not_accumulate() {
        // 5 rows out of 240 is about 2% per step, 10 rows about 4% overall.
        let (mut monitor, probes) = monitor(
            settings(),
            vec![Ok(black(1)), Ok(white_rows(5, 2)), Ok(white_rows(10, 3))],
            Reply::Text("all clear"),
            false,
        );

        monitor.tick().await;
        assert_eq!(monitor.tick().await, TickOutcome::Unchanged);
        assert_eq!(monitor.tick().await, TickOutcome::Unchanged);
        assert_eq!(monitor.last_frame().map(|f| f.seq), Some(3));
        assert_eq!(probes.analyses(), 1);
    }

    #[tokio::test]
    async fn large_change_is_analyzed() {
        let (mut monitor, probes) = monitor(
            settings(),
            vec![Ok(black(1)), Ok(white_rows(120, 2))],
            Reply::Text("a person has fallen"),
            false,
        );

        monitor.tick().await;
        assert_eq!(
            monitor.tick().await,
            TickOutcome::Alerted("a person has fallen".to_string())
        );
        assert_eq!(probes.analyses(), 2);
        assert_eq!(probes.sent().len(), 2);
    }

    #[tokio::test]
    async fn outside_active_hours_skips_capture() {
        let settings = MonitorSettings {
            active_hours: ActiveHours::new(8, 20),
            ..settings()
        };
        let (monitor, probes) = monitor(settings, vec![], Reply::Text("fall"), false);
        let mut monitor = monitor.with_clock(|| at_hour(3));

        assert_eq!(monitor.tick().await, TickOutcome::OutsideActiveHours);
        assert_eq!(probes.captures(), 0);
        assert!(monitor.last_frame().is_none());
    }

    #[tokio::test]
    async fn delivery_failure_is_reported_not_retried() {
        let (mut monitor, probes) = monitor(settings(), vec![Ok(black(1))], Reply::Text("fall detected"), true);

        assert_eq!(monitor.tick().await, TickOutcome::DeliveryFailed);
        assert_eq!(probes.sent().len(), 1);
        assert_eq!(monitor.stats().delivery_failures, 1);
    }

    #[tokio::test]
    async fn significant_frame_is_written_to_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames_detected").join("last_frame.jpg");
        let settings = MonitorSettings {
            snapshot: Some(SnapshotWriter::new(path.clone())),
            ..settings()
        };
        let (mut monitor, _probes) = monitor(settings, vec![Ok(black(1)), Ok(black(2))], Reply::Text("ok"), false);

        monitor.tick().await;
        let written = std::fs::read(&path).unwrap();
        assert_eq!(&written[..2], &[0xFF, 0xD8]);

        std::fs::remove_file(&path).unwrap();
        assert_eq!(monitor.tick().await, TickOutcome::Unchanged);
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_each_interval_until_cancelled() {
        let (mut monitor, probes) = monitor(
            settings(),
            vec![Err(CaptureError::Unavailable)],
            Reply::Text("all clear"),
            false,
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                monitor.run(shutdown).await;
                monitor
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(probes.captures(), 1);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(probes.captures(), 1);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(probes.captures(), 2);

        shutdown.cancel();
        let monitor = handle.await.unwrap();
        assert_eq!(monitor.stats().ticks, 2);
        assert_eq!(monitor.stats().capture_failures, 1);
        assert_eq!(monitor.last_frame().map(|f| f.seq), Some(2));
        assert_eq!(monitor.state(), LoopState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_still_finishes_one_tick() {
        let (mut monitor, probes) = monitor(settings(), vec![], Reply::Text("fall"), false);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        monitor.run(shutdown).await;

        assert_eq!(probes.captures(), 1);
        assert_eq!(probes.sent().len(), 1);
        assert_eq!(monitor.stats().ticks, 1);
    }

    #[test]
    fn settings_follow_config() {
        let mut config = Config::default();
        config.schedule.interval_secs = 30;
        config.alert.trigger_terms = vec!["Intruder".into()];
        let settings = MonitorSettings::from_config(&config);

        assert_eq!(settings.interval, Duration::from_secs(30));
        assert!(settings.trigger_terms.matches("an INTRUDER"));
        assert_eq!(
            settings.snapshot.map(|s| s.path().to_path_buf()),
            Some(config.alert.snapshot_path.clone())
        );
    }
}
