//! Build trigger sources
//!
//! Manual requests, content publish events and the build schedule all end in
//! [`StatusTracker::start_build`]. This module holds the rules for the two
//! automatic sources and the background scheduler loop.

use chrono::{DateTime, NaiveTime, Utc};
use deploy_hooks_common::{BuildJob, Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::settings::{SettingKey, Settings, SCHEDULE_TIME_FORMAT};
use crate::tracker::{StatusTracker, TriggerSource};

/// How long the scheduler waits before retrying after it failed to read settings
const SETTINGS_RETRY: Duration = Duration::from_secs(60);

/// Recurrence of scheduled builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleInterval {
    Hourly,
    TwiceDaily,
    Daily,
    Weekly,
    Monthly,
}

impl ScheduleInterval {
    pub fn name(self) -> &'static str {
        match self {
            ScheduleInterval::Hourly => "hourly",
            ScheduleInterval::TwiceDaily => "twicedaily",
            ScheduleInterval::Daily => "daily",
            ScheduleInterval::Weekly => "weekly",
            ScheduleInterval::Monthly => "monthly",
        }
    }

    pub fn period(self) -> chrono::Duration {
        let secs = match self {
            ScheduleInterval::Hourly => 3_600,
            ScheduleInterval::TwiceDaily => 43_200,
            ScheduleInterval::Daily => 86_400,
            ScheduleInterval::Weekly => 604_800,
            ScheduleInterval::Monthly => 2_635_200,
        };
        chrono::Duration::seconds(secs)
    }
}

impl FromStr for ScheduleInterval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "hourly" => Ok(ScheduleInterval::Hourly),
            "twicedaily" => Ok(ScheduleInterval::TwiceDaily),
            "daily" => Ok(ScheduleInterval::Daily),
            "weekly" => Ok(ScheduleInterval::Weekly),
            "monthly" => Ok(ScheduleInterval::Monthly),
            other => Err(Error::InvalidInput(format!("unknown schedule interval: {}", other))),
        }
    }
}

/// Fixed grid of build times: `anchor + k * period`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub interval: ScheduleInterval,
    pub anchor: DateTime<Utc>,
}

impl Schedule {
    /// Anchor the grid at `time` on the day of `now`
    pub fn anchored_on(interval: ScheduleInterval, time: NaiveTime, now: DateTime<Utc>) -> Self {
        Self {
            interval,
            anchor: now.date_naive().and_time(time).and_utc(),
        }
    }

    /// Earliest grid point strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let period = self.interval.period().num_seconds();
        let elapsed = (now - self.anchor).num_seconds();
        let steps = elapsed.div_euclid(period) + 1;
        self.anchor + chrono::Duration::seconds(steps * period)
    }

    /// Read the schedule from settings, `None` when scheduled builds are off.
    ///
    /// The anchor is persisted the first time an enabled schedule is seen so
    /// weekly and monthly grids survive restarts.
    pub async fn load(settings: &Settings, now: DateTime<Utc>) -> Result<Option<Self>> {
        if !settings.flag(SettingKey::EnableScheduledBuilds).await? {
            return Ok(None);
        }

        let interval = match settings.stored(SettingKey::ScheduleInterval).await? {
            Some(name) => match name.parse::<ScheduleInterval>() {
                Ok(interval) => interval,
                Err(e) => {
                    warn!("Scheduled builds disabled: {}", e);
                    return Ok(None);
                }
            },
            None => ScheduleInterval::Daily,
        };

        if let Some(anchor) = settings.stored(SettingKey::ScheduleAnchor).await? {
            if let Ok(anchor) = DateTime::parse_from_rfc3339(&anchor) {
                return Ok(Some(Self {
                    interval,
                    anchor: anchor.with_timezone(&Utc),
                }));
            }
            warn!("Ignoring unreadable schedule anchor: {}", anchor);
        }

        let time = settings
            .stored(SettingKey::ScheduleTime)
            .await?
            .and_then(|t| NaiveTime::parse_from_str(&t, SCHEDULE_TIME_FORMAT).ok())
            .unwrap_or(NaiveTime::MIN);

        let schedule = Self::anchored_on(interval, time, now);
        settings
            .set(SettingKey::ScheduleAnchor, &schedule.anchor.to_rfc3339())
            .await?;
        info!(
            "Scheduled builds anchored at {} ({})",
            schedule.anchor,
            interval.name()
        );

        Ok(Some(schedule))
    }
}

/// Content lifecycle notification from the CMS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PublishEvent {
    /// A post changed status
    Transition {
        new_status: String,
        old_status: String,
        /// Set when the change came through the REST API, which the editor
        /// follows up with a second, regular transition
        #[serde(default)]
        via_rest: bool,
    },
    /// A scheduled post went live
    FuturePublished {
        #[serde(default)]
        post_id: Option<u64>,
    },
}

impl PublishEvent {
    /// Whether the event changes what the public site shows
    pub fn warrants_build(&self) -> bool {
        match self {
            PublishEvent::Transition {
                new_status,
                old_status,
                via_rest,
            } => !via_rest && (new_status == "publish" || old_status == "publish"),
            PublishEvent::FuturePublished { .. } => true,
        }
    }
}

/// Result of a publish event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub triggered: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<BuildJob>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PublishOutcome {
    fn skipped(reason: &str) -> Self {
        Self {
            triggered: false,
            job: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// Start a build for a publish event if the settings and the event call for one
pub async fn handle_publish(tracker: &StatusTracker, event: &PublishEvent) -> Result<PublishOutcome> {
    if !tracker
        .settings()
        .flag(SettingKey::EnableOnPostUpdate)
        .await?
    {
        debug!("Ignoring publish event, builds on publish are disabled");
        return Ok(PublishOutcome::skipped("builds on publish are disabled"));
    }

    if !event.warrants_build() {
        debug!("Ignoring publish event: {:?}", event);
        return Ok(PublishOutcome::skipped(
            "event does not change published content",
        ));
    }

    let response = tracker.start_build(TriggerSource::Publish).await?;
    Ok(PublishOutcome {
        triggered: true,
        job: Some(response.job),
        reason: None,
    })
}

/// Wall clock used to plan scheduled builds
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Background task firing scheduled builds
pub struct Scheduler {
    tracker: Arc<StatusTracker>,
    wake: Arc<Notify>,
    clock: Clock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Fire(DateTime<Utc>),
    Idle,
    Retry,
}

impl Scheduler {
    /// `wake` is notified whenever schedule settings change
    pub fn new(tracker: Arc<StatusTracker>, wake: Arc<Notify>) -> Self {
        Self::with_clock(tracker, wake, Arc::new(Utc::now))
    }

    pub fn with_clock(tracker: Arc<StatusTracker>, wake: Arc<Notify>, clock: Clock) -> Self {
        Self {
            tracker,
            wake,
            clock,
        }
    }

    /// Plan the next step. Planning never starts before `floor`, the last
    /// fire time, so a lagging wall clock cannot fire the same grid point twice.
    async fn plan(&self, floor: Option<DateTime<Utc>>) -> Plan {
        let now = match floor {
            Some(floor) => (self.clock)().max(floor),
            None => (self.clock)(),
        };
        match Schedule::load(self.tracker.settings(), now).await {
            Ok(Some(schedule)) => Plan::Fire(schedule.next_after(now)),
            Ok(None) => Plan::Idle,
            Err(e) => {
                error!("Failed to read schedule settings: {}", e);
                Plan::Retry
            }
        }
    }

    /// Run until `shutdown` receives a message or its sender is dropped
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        info!("Build scheduler started");
        let mut last_fired = None;

        loop {
            let plan = self.plan(last_fired).await;
            let wait = match plan {
                Plan::Fire(at) => {
                    info!("Next scheduled build at {}", at);
                    Some((at - (self.clock)()).to_std().unwrap_or(Duration::ZERO))
                }
                Plan::Idle => {
                    debug!("Scheduled builds are disabled");
                    None
                }
                Plan::Retry => Some(SETTINGS_RETRY),
            };

            let sleep = async {
                match wait {
                    Some(duration) => tokio::time::sleep(duration).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Build scheduler stopping");
                    return;
                }
                _ = self.wake.notified() => {
                    debug!("Schedule settings changed, replanning");
                }
                _ = sleep => {
                    if let Plan::Fire(at) = plan {
                        self.fire().await;
                        last_fired = Some(at);
                    }
                }
            }
        }
    }

    async fn fire(&self) {
        match self.tracker.start_build(TriggerSource::Schedule).await {
            Ok(response) => info!("Scheduled build started: job {}", response.job.id),
            Err(Error::BuildInProgress(id)) => {
                warn!("Skipping scheduled build, deployment {} is still building", id)
            }
            Err(e) => error!("Scheduled build failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DeploymentCache;
    use crate::settings::{DeployCredentials, OverrideCredentials};
    use crate::store::MemoryStore;
    use crate::vercel::DeploymentApi;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use deploy_hooks_common::{ApiError, DeploymentDetails, DeploymentSummary, TriggerResponse};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    /// Deploy hook that counts calls and hands out jobs in a fixed state
    struct CountingHook {
        job_state: &'static str,
        triggers: AtomicU32,
    }

    impl CountingHook {
        fn new(job_state: &'static str) -> Arc<Self> {
            Arc::new(Self {
                job_state,
                triggers: AtomicU32::new(0),
            })
        }

        fn triggers(&self) -> u32 {
            self.triggers.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeploymentApi for CountingHook {
        async fn list_deployments(
            &self,
            _credentials: &DeployCredentials,
            _from: &str,
            _limit: u32,
        ) -> std::result::Result<Vec<DeploymentSummary>, ApiError> {
            Err(ApiError::transport("not scripted"))
        }

        async fn get_deployment(
            &self,
            _credentials: &DeployCredentials,
            _id: &str,
        ) -> std::result::Result<DeploymentDetails, ApiError> {
            Err(ApiError::transport("not scripted"))
        }

        async fn trigger_build(
            &self,
            _credentials: &DeployCredentials,
        ) -> std::result::Result<TriggerResponse, ApiError> {
            let n = self.triggers.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TriggerResponse {
                job: BuildJob {
                    id: format!("job_{}", n),
                    state: self.job_state.into(),
                    created_at: n.to_string(),
                },
            })
        }
    }

    /// Hourly schedule anchored at `anchor`
    async fn hourly_tracker(hook: Arc<CountingHook>, anchor: DateTime<Utc>) -> Arc<StatusTracker> {
        let store = Arc::new(MemoryStore::new());
        let settings = Settings::new(store.clone(), OverrideCredentials::default());
        settings
            .set(SettingKey::WebhookAddress, "https://hooks.example/deploy")
            .await
            .unwrap();
        settings.set(SettingKey::EnableScheduledBuilds, "true").await.unwrap();
        settings.set(SettingKey::ScheduleInterval, "hourly").await.unwrap();
        settings
            .set(SettingKey::ScheduleAnchor, &anchor.to_rfc3339())
            .await
            .unwrap();

        Arc::new(StatusTracker::new(hook, DeploymentCache::new(store), settings))
    }

    /// Wall clock that follows tokio's (paused) clock from `base`
    fn tokio_clock(base: DateTime<Utc>) -> Clock {
        let start = tokio::time::Instant::now();
        Arc::new(move || base + chrono::Duration::from_std(start.elapsed()).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_fires_on_grid_until_disabled_and_stops_on_shutdown() {
        let base = at(2024, 1, 1, 0, 0);
        let hook = CountingHook::new("PENDING");
        let tracker = hourly_tracker(hook.clone(), base).await;
        let wake = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let scheduler = Scheduler::with_clock(tracker.clone(), wake.clone(), tokio_clock(base));
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        // Grid points at 01:00, 02:00 and 03:00
        tokio::time::sleep(Duration::from_secs(3 * 3600 + 60)).await;
        assert_eq!(hook.triggers(), 3);

        tracker
            .settings()
            .set(SettingKey::EnableScheduledBuilds, "false")
            .await
            .unwrap();
        wake.notify_one();

        tokio::time::sleep(Duration::from_secs(5 * 3600)).await;
        assert_eq!(hook.triggers(), 3);

        shutdown_tx.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_skips_grid_points_while_building() {
        let base = at(2024, 1, 1, 0, 0);
        let hook = CountingHook::new("BUILDING");
        let tracker = hourly_tracker(hook.clone(), base).await;
        let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let scheduler =
            Scheduler::with_clock(tracker.clone(), Arc::new(Notify::new()), tokio_clock(base));
        tokio::spawn(scheduler.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(3 * 3600 + 60)).await;

        // The first build is still BUILDING in the cache, later ticks are refused
        assert_eq!(hook.triggers(), 1);
        let record = tracker.cache().get().await.unwrap().unwrap();
        assert_eq!(record.id, "job_1");
    }

    #[tokio::test]
    async fn plan_never_goes_back_before_last_fire() {
        let base = at(2024, 1, 1, 0, 0);
        let tracker = hourly_tracker(CountingHook::new("PENDING"), base).await;

        // Wall clock reads slightly before the grid point that just fired
        let lagging = base + chrono::Duration::hours(1) - chrono::Duration::milliseconds(5);
        let scheduler =
            Scheduler::with_clock(tracker, Arc::new(Notify::new()), Arc::new(move || lagging));

        assert_eq!(
            scheduler.plan(None).await,
            Plan::Fire(base + chrono::Duration::hours(1))
        );
        assert_eq!(
            scheduler.plan(Some(base + chrono::Duration::hours(1))).await,
            Plan::Fire(base + chrono::Duration::hours(2))
        );
    }

    #[tokio::test]
    async fn plan_idles_when_disabled() {
        let base = at(2024, 1, 1, 0, 0);
        let tracker = hourly_tracker(CountingHook::new("PENDING"), base).await;
        tracker
            .settings()
            .set(SettingKey::EnableScheduledBuilds, "false")
            .await
            .unwrap();

        let scheduler = Scheduler::with_clock(tracker, Arc::new(Notify::new()), tokio_clock(base));
        assert_eq!(scheduler.plan(None).await, Plan::Idle);
    }

    #[test]
    fn interval_names_round_trip() {
        for interval in [
            ScheduleInterval::Hourly,
            ScheduleInterval::TwiceDaily,
            ScheduleInterval::Daily,
            ScheduleInterval::Weekly,
            ScheduleInterval::Monthly,
        ] {
            assert_eq!(interval.name().parse::<ScheduleInterval>().unwrap(), interval);
        }
        assert!("fortnightly".parse::<ScheduleInterval>().is_err());
    }

    #[test]
    fn next_after_picks_first_grid_point_after_now() {
        let schedule = Schedule {
            interval: ScheduleInterval::Daily,
            anchor: at(2024, 1, 1, 3, 0),
        };

        // Before the anchor, the anchor itself is next
        assert_eq!(schedule.next_after(at(2024, 1, 1, 1, 0)), at(2024, 1, 1, 3, 0));
        // Exactly on a grid point moves to the following one
        assert_eq!(schedule.next_after(at(2024, 1, 1, 3, 0)), at(2024, 1, 2, 3, 0));
        assert_eq!(schedule.next_after(at(2024, 1, 5, 12, 0)), at(2024, 1, 6, 3, 0));
    }

    #[test]
    fn weekly_grid_keeps_anchor_weekday() {
        let schedule = Schedule {
            interval: ScheduleInterval::Weekly,
            anchor: at(2024, 1, 1, 6, 30),
        };
        assert_eq!(schedule.next_after(at(2024, 1, 3, 0, 0)), at(2024, 1, 8, 6, 30));
    }

    #[test]
    fn anchored_on_uses_day_of_now() {
        let time = NaiveTime::from_hms_opt(22, 15, 0).unwrap();
        let schedule = Schedule::anchored_on(ScheduleInterval::Hourly, time, at(2024, 3, 9, 8, 0));
        assert_eq!(schedule.anchor, at(2024, 3, 9, 22, 15));
    }

    #[tokio::test]
    async fn load_persists_anchor_once() {
        let settings = Settings::new(Arc::new(MemoryStore::new()), OverrideCredentials::default());
        assert_eq!(Schedule::load(&settings, at(2024, 1, 1, 0, 0)).await.unwrap(), None);

        settings.set(SettingKey::EnableScheduledBuilds, "true").await.unwrap();
        settings.set(SettingKey::ScheduleInterval, "weekly").await.unwrap();
        settings.set(SettingKey::ScheduleTime, "04:00").await.unwrap();

        let first = Schedule::load(&settings, at(2024, 1, 1, 9, 0)).await.unwrap().unwrap();
        assert_eq!(first.anchor, at(2024, 1, 1, 4, 0));
        assert_eq!(first.interval, ScheduleInterval::Weekly);

        // A later load keeps the stored anchor instead of re-anchoring
        let later = Schedule::load(&settings, at(2024, 1, 4, 9, 0)).await.unwrap().unwrap();
        assert_eq!(later.anchor, first.anchor);
    }

    #[tokio::test]
    async fn load_with_unknown_interval_disables_schedule() {
        let settings = Settings::new(Arc::new(MemoryStore::new()), OverrideCredentials::default());
        settings.set(SettingKey::EnableScheduledBuilds, "true").await.unwrap();
        settings.set(SettingKey::ScheduleInterval, "sometimes").await.unwrap();

        assert_eq!(Schedule::load(&settings, Utc::now()).await.unwrap(), None);
    }

    #[test]
    fn publish_transitions_that_touch_published_content_build() {
        let transition = |new: &str, old: &str, via_rest: bool| PublishEvent::Transition {
            new_status: new.to_string(),
            old_status: old.to_string(),
            via_rest,
        };

        assert!(transition("publish", "draft", false).warrants_build());
        assert!(transition("trash", "publish", false).warrants_build());
        assert!(transition("publish", "publish", false).warrants_build());
        assert!(!transition("draft", "auto-draft", false).warrants_build());
        assert!(!transition("publish", "draft", true).warrants_build());
        assert!(PublishEvent::FuturePublished { post_id: Some(7) }.warrants_build());
    }

    #[test]
    fn publish_event_wire_format() {
        let event: PublishEvent = serde_json::from_value(serde_json::json!({
            "event": "transition",
            "new_status": "publish",
            "old_status": "future"
        }))
        .unwrap();

        assert_eq!(
            event,
            PublishEvent::Transition {
                new_status: "publish".to_string(),
                old_status: "future".to_string(),
                via_rest: false,
            }
        );
    }
}
