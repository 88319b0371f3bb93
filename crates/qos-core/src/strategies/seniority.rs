//! Age-based selection with a cooldown and estimator feedback
//!
//! Contentions naming an aggressor terminate it directly. For the others
//! the number of workloads to terminate is their mean severity times the
//! number of remaining candidates, and the youngest candidates go first.
//! A contention without severity counts as the starting severity.
//!
//! After a decision the strategy stays silent for `cooldown` cycles so the
//! correction can take effect, and asks the estimator to pause. The first
//! cycle without contention clears the cooldown and resumes the estimator.
//! Each feedback event is published once per transition.

use super::{candidate_id, candidates, check_severities};
use crate::bus::{ControlBus, ControlEvent};
use crate::config::{keys, QosConfig};
use crate::error::Result;
use crate::filters::AgeTracker;
use crate::models::{Contention, CorrectionAction, UsageSnapshot, WorkloadId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_STRATEGY_COOLDOWN: u64 = 10;

/// Severity assumed for contentions that carry none
pub const DEFAULT_STARTING_SEVERITY: f64 = 0.1;

const NAME: &str = "seniority";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SenioritySettings {
    pub cooldown: u64,
    pub starting_severity: f64,
}

impl Default for SenioritySettings {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_STRATEGY_COOLDOWN,
            starting_severity: DEFAULT_STARTING_SEVERITY,
        }
    }
}

impl SenioritySettings {
    pub fn from_config(config: &QosConfig) -> Self {
        Self {
            cooldown: config.non_negative_i64_or(keys::STRATEGY_COOLDOWN, DEFAULT_STRATEGY_COOLDOWN as i64) as u64,
            starting_severity: config.positive_f64_or(keys::STARTING_SEVERITY, DEFAULT_STARTING_SEVERITY),
        }
    }
}

/// `floor(candidates * mean)`, at least one whenever the product is positive
pub fn kill_count(candidates: usize, mean_severity: f64) -> usize {
    let product = candidates as f64 * mean_severity;
    if product.is_nan() || product <= 0.0 {
        return 0;
    }
    (product.floor() as usize).max(1)
}

pub struct SeniorityStrategy {
    settings: SenioritySettings,
    bus: Option<Arc<ControlBus>>,
    cooldown_remaining: u64,
    estimator_paused: bool,
}

impl std::fmt::Debug for SeniorityStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeniorityStrategy")
            .field("settings", &self.settings)
            .field("cooldown_remaining", &self.cooldown_remaining)
            .field("estimator_paused", &self.estimator_paused)
            .finish()
    }
}

impl SeniorityStrategy {
    pub fn new(settings: SenioritySettings) -> Self {
        Self {
            settings,
            bus: None,
            cooldown_remaining: 0,
            estimator_paused: false,
        }
    }

    /// Publish pause/resume feedback on `bus`
    pub fn with_bus(mut self, bus: Arc<ControlBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn cooldown_remaining(&self) -> u64 {
        self.cooldown_remaining
    }

    pub fn estimator_paused(&self) -> bool {
        self.estimator_paused
    }

    pub fn decide(
        &mut self,
        ages: &AgeTracker,
        contentions: &[Contention],
        usage: &UsageSnapshot,
    ) -> Result<Vec<CorrectionAction>> {
        if contentions.is_empty() {
            self.on_quiet_cycle();
            return Ok(Vec::new());
        }

        if self.cooldown_remaining > 0 {
            self.cooldown_remaining -= 1;
            debug!(remaining = self.cooldown_remaining, "Cooldown active, no corrections");
            return Ok(Vec::new());
        }

        // Nothing is committed until selection succeeded
        let actions = self.select(ages, contentions, usage)?;

        self.cooldown_remaining = self.settings.cooldown;
        if !self.estimator_paused {
            self.estimator_paused = true;
            self.publish(ControlEvent::EstimatorPaused);
        }
        Ok(actions)
    }

    pub fn on_quiet_cycle(&mut self) {
        self.cooldown_remaining = 0;
        if self.estimator_paused {
            self.estimator_paused = false;
            self.publish(ControlEvent::EstimatorResumed);
        }
    }

    fn publish(&self, event: ControlEvent) {
        info!(event = ?event, "Publishing estimator feedback");
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }

    fn select(
        &self,
        ages: &AgeTracker,
        contentions: &[Contention],
        usage: &UsageSnapshot,
    ) -> Result<Vec<CorrectionAction>> {
        check_severities(NAME, contentions)?;

        let mut pool: Vec<&WorkloadId> = candidates(usage).into_iter().filter_map(candidate_id).collect();
        let mut targets: Vec<WorkloadId> = Vec::new();
        let mut severity_sum = 0.0;
        let mut unattributed = 0usize;

        for contention in contentions {
            if let Some(aggressor) = &contention.aggressor {
                if let Some(pos) = pool.iter().position(|id| *id == aggressor) {
                    targets.push(pool.remove(pos).clone());
                }
                continue;
            }
            severity_sum += contention.severity.unwrap_or(self.settings.starting_severity);
            unattributed += 1;
        }

        let mean_severity = if unattributed == 0 {
            0.0
        } else {
            severity_sum / unattributed as f64
        };
        let count = kill_count(pool.len(), mean_severity);
        info!(
            mean_severity = mean_severity,
            kill_count = count,
            candidates = pool.len(),
            "Decided how many workloads to revoke"
        );

        let mut aged: Vec<(Duration, &WorkloadId)> = pool
            .into_iter()
            .filter_map(|id| match ages.age(id) {
                Ok(age) => Some((age, id)),
                Err(e) => {
                    warn!(workload = %id, error = %e, "No age for workload, skipping");
                    None
                }
            })
            .collect();
        aged.sort_by_key(|(age, _)| *age);

        for (age, id) in aged.into_iter().take(count) {
            info!(workload = %id, age_secs = age.as_secs_f64(), "Marked workload for removal");
            targets.push(id.clone());
        }

        Ok(targets.into_iter().map(CorrectionAction::terminate).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::bus::ControlSubscriber;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ControlEvent>>,
    }

    impl ControlSubscriber for Recorder {
        fn on_event(&self, event: ControlEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn fixture() -> (AgeTracker, UsageSnapshot) {
        let ages = AgeTracker::new();
        ages.observe(&id("old"), 70.0);
        ages.observe(&id("young"), 95.0);
        ages.observe(&id("mid"), 90.0);
        ages.observe(&id("pr"), 0.0);
        ages.observe(&id("pr"), 100.0);

        // Ages at t=100: old 30s, young 5s, mid 10s
        let usage = UsageSnapshot::new(100.0, vec![pr("pr"), be("mid", 1.0), be("young", 1.0), be("old", 1.0)]);
        (ages, usage)
    }

    fn strategy(cooldown: u64) -> (SeniorityStrategy, Arc<Recorder>) {
        let bus = Arc::new(ControlBus::new());
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(recorder.clone());
        let settings = SenioritySettings {
            cooldown,
            ..SenioritySettings::default()
        };
        (SeniorityStrategy::new(settings).with_bus(bus), recorder)
    }

    #[test]
    fn test_kill_count() {
        assert_eq!(kill_count(3, 0.7), 2);
        assert_eq!(kill_count(3, 0.1), 1);
        assert_eq!(kill_count(3, 0.0), 0);
        assert_eq!(kill_count(0, 1.0), 0);
        assert_eq!(kill_count(3, 5.0), 15);
    }

    #[test]
    fn test_youngest_first() {
        let (ages, usage) = fixture();
        let (mut s, _) = strategy(0);
        let actions = s.decide(&ages, &[contention("pr", 0.7)], &usage).unwrap();
        assert_eq!(targets(&actions), vec!["young", "mid"]);
    }

    #[test]
    fn test_mean_only_over_contentions_without_aggressor() {
        let (ages, usage) = fixture();
        let (mut s, _) = strategy(0);
        let contentions = vec![contention("pr", 1.0).with_aggressor(id("old")), contention("pr", 1.0)];
        // Mean 1.0 over the 2 remaining candidates: both go
        let actions = s.decide(&ages, &contentions, &usage).unwrap();
        assert_eq!(targets(&actions), vec!["old", "young", "mid"]);
    }

    #[test]
    fn test_only_aggressors_adds_no_extra_kills() {
        let (ages, usage) = fixture();
        let (mut s, _) = strategy(0);
        let contentions = vec![contention("pr", 1.0).with_aggressor(id("mid"))];
        let actions = s.decide(&ages, &contentions, &usage).unwrap();
        assert_eq!(targets(&actions), vec!["mid"]);
    }

    #[test]
    fn test_missing_severity_still_corrects() {
        let (ages, usage) = fixture();
        let (mut s, recorder) = strategy(10);
        let mut c = contention("pr", 0.0);
        c.severity = None;

        // Starting severity 0.1 over 3 candidates rounds up to one kill
        let actions = s.decide(&ages, &[c], &usage).unwrap();
        assert_eq!(targets(&actions), vec!["young"]);
        assert_eq!(s.cooldown_remaining(), 10);
        assert_eq!(*recorder.events.lock().unwrap(), vec![ControlEvent::EstimatorPaused]);
    }

    #[test]
    fn test_starting_severity_from_config() {
        let config = QosConfig::new().with(keys::STARTING_SEVERITY, 0.7);
        assert_eq!(SenioritySettings::from_config(&config).starting_severity, 0.7);
        assert_eq!(
            SenioritySettings::from_config(&QosConfig::new()).starting_severity,
            DEFAULT_STARTING_SEVERITY
        );
    }

    #[test]
    fn test_cooldown_and_feedback_once_per_transition() {
        let (ages, usage) = fixture();
        let (mut s, recorder) = strategy(2);
        let contentions = [contention("pr", 0.4)];

        assert_eq!(s.decide(&ages, &contentions, &usage).unwrap().len(), 1);
        assert!(s.decide(&ages, &contentions, &usage).unwrap().is_empty());
        assert!(s.decide(&ages, &contentions, &usage).unwrap().is_empty());
        // Cooldown over: decides again without a second pause event
        assert_eq!(s.decide(&ages, &contentions, &usage).unwrap().len(), 1);
        assert_eq!(*recorder.events.lock().unwrap(), vec![ControlEvent::EstimatorPaused]);

        s.on_quiet_cycle();
        s.on_quiet_cycle();
        assert_eq!(s.cooldown_remaining(), 0);
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![ControlEvent::EstimatorPaused, ControlEvent::EstimatorResumed]
        );
    }

    #[test]
    fn test_failure_leaves_state_untouched() {
        let (ages, usage) = fixture();
        let (mut s, recorder) = strategy(5);
        let bad = [Contention {
            severity: Some(f64::INFINITY),
            ..contention("pr", 1.0)
        }];

        assert!(s.decide(&ages, &bad, &usage).is_err());
        assert_eq!(s.cooldown_remaining(), 0);
        assert!(!s.estimator_paused());
        assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_workloads_without_age_are_skipped() {
        let ages = AgeTracker::new();
        ages.observe(&id("known"), 0.0);
        let usage = UsageSnapshot::new(100.0, vec![be("unknown", 1.0), be("known", 1.0)]);
        let (mut s, _) = strategy(0);

        let actions = s.decide(&ages, &[contention("pr", 1.0)], &usage).unwrap();
        assert_eq!(targets(&actions), vec!["known"]);
    }
}
