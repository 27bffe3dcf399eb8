//! Tamper events -> lock transition requests.
//!
//! # Invariants
//!
//! - **Rising edge only**: a type that is already latched produces nothing.
//!   The latch is released by [`Escalator::on_clear`].
//! - **Never below current**: the computed target is at least the current
//!   state, so an escalation never reads as a downgrade.
//! - **Medium stops at Hard**: only Critical events and repeated violations
//!   reach `PermanentLocked`.
//! - **Repeated violations escalate**: when fresh violations inside the
//!   window reach the limit, the target is `PermanentLocked`.
//!
//! Pure: the caller supplies the current state; time comes from the event.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};

use payo_lock::{LockReason, LockState, ReasonCategory, Severity};

use crate::types::{TamperEvent, TamperType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    pub target: LockState,
    pub reason: LockReason,
}

#[derive(Debug)]
pub struct Escalator {
    limit: u32,
    window: Duration,
    active: HashSet<TamperType>,
    violations: VecDeque<DateTime<Utc>>,
}

impl Escalator {
    pub fn new(repeated_violation_limit: u32, window: std::time::Duration) -> Self {
        Self {
            limit: repeated_violation_limit.max(1),
            window: Duration::from_std(window).unwrap_or(Duration::hours(1)),
            active: HashSet::new(),
            violations: VecDeque::new(),
        }
    }

    pub fn is_latched(&self, t: TamperType) -> bool {
        self.active.contains(&t)
    }

    /// Returns `None` when the event's type is already latched.
    pub fn on_event(&mut self, event: &TamperEvent, current: LockState) -> Option<Escalation> {
        if !self.active.insert(event.tamper_type) {
            return None;
        }

        let now = event.detected_at;
        self.violations.push_back(now);
        while let Some(front) = self.violations.front() {
            if now - *front > self.window {
                self.violations.pop_front();
            } else {
                break;
            }
        }

        if self.violations.len() as u32 >= self.limit {
            let reason = LockReason::new(ReasonCategory::RepeatedViolations, Severity::Critical)
                .with_detail(format!(
                    "{} violations in window; last {}",
                    self.violations.len(),
                    event.tamper_type
                ));
            return Some(Escalation {
                target: LockState::PermanentLocked,
                reason,
            });
        }

        let target = match event.severity {
            Severity::Low => LockState::SoftLocked,
            Severity::Medium => match current.step_up() {
                LockState::PermanentLocked | LockState::Deactivating => LockState::HardLocked,
                up => up,
            }
            .max_severity(LockState::SoftLocked),
            Severity::High => LockState::HardLocked,
            Severity::Critical => LockState::PermanentLocked,
        };
        let category = if event.severity == Severity::Critical {
            ReasonCategory::SecurityBreach
        } else {
            ReasonCategory::DeviceTampering
        };

        Some(Escalation {
            target: target.max_severity(current),
            reason: LockReason::new(category, event.severity).with_detail(format!(
                "{}: {}",
                event.tamper_type, event.details
            )),
        })
    }

    /// Release the latch for types that are no longer observed.
    pub fn on_clear(&mut self, kinds: &[TamperType]) {
        for k in kinds {
            self.active.remove(k);
        }
    }

    /// Release every latch. Called after the lock goes down so signals that
    /// are still active escalate again on their next tick.
    pub fn release_all(&mut self) {
        self.active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(t: TamperType, sev: Severity, at: DateTime<Utc>) -> TamperEvent {
        let mut e = TamperEvent::new("dev-1", t, sev, "test");
        e.detected_at = at;
        e
    }

    fn esc() -> Escalator {
        Escalator::new(3, std::time::Duration::from_secs(3600))
    }

    #[test]
    fn severity_ladder() {
        let now = Utc::now();
        let cases = [
            (Severity::Low, LockState::None, LockState::SoftLocked),
            (Severity::Medium, LockState::None, LockState::SoftLocked),
            (Severity::Medium, LockState::SoftLocked, LockState::HardLocked),
            (Severity::Medium, LockState::HardLocked, LockState::HardLocked),
            (Severity::High, LockState::None, LockState::HardLocked),
            (Severity::Critical, LockState::SoftLocked, LockState::PermanentLocked),
        ];
        for (sev, cur, want) in cases {
            let mut e = esc();
            let got = e.on_event(&ev(TamperType::SimChanged, sev, now), cur).unwrap();
            assert_eq!(got.target, want, "{sev:?} from {cur}");
        }
    }

    #[test]
    fn never_targets_below_current() {
        let mut e = esc();
        let got = e
            .on_event(
                &ev(TamperType::DeveloperMode, Severity::High, Utc::now()),
                LockState::PermanentLocked,
            )
            .unwrap();
        assert_eq!(got.target, LockState::PermanentLocked);
    }

    #[test]
    fn medium_from_hard_stays_clearable() {
        let mut e = esc();
        let got = e
            .on_event(
                &ev(TamperType::SimChanged, Severity::Medium, Utc::now()),
                LockState::HardLocked,
            )
            .unwrap();
        assert_eq!(got.target, LockState::HardLocked);
        assert_eq!(got.reason.category, ReasonCategory::DeviceTampering);
    }

    #[test]
    fn release_all_rearms_every_type() {
        let mut e = esc();
        let now = Utc::now();
        let dev = ev(TamperType::DeveloperMode, Severity::High, now);
        let sim = ev(TamperType::SimChanged, Severity::Medium, now);
        assert!(e.on_event(&dev, LockState::None).is_some());
        assert!(e.on_event(&sim, LockState::HardLocked).is_some());
        e.release_all();
        assert!(!e.is_latched(TamperType::DeveloperMode));
        assert!(!e.is_latched(TamperType::SimChanged));
        assert!(e.on_event(&dev, LockState::None).is_some());
    }

    #[test]
    fn latched_type_fires_once_until_cleared() {
        let mut e = esc();
        let now = Utc::now();
        let first = ev(TamperType::UsbDebugging, Severity::High, now);
        assert!(e.on_event(&first, LockState::None).is_some());
        assert!(e.on_event(&first, LockState::HardLocked).is_none());
        e.on_clear(&[TamperType::UsbDebugging]);
        assert!(e.on_event(&first, LockState::HardLocked).is_some());
    }

    #[test]
    fn repeated_violations_go_permanent() {
        let mut e = esc();
        let t0 = Utc::now();
        let types = [
            TamperType::SimChanged,
            TamperType::AccessibilityService,
            TamperType::VerifiedBootUnknown,
        ];
        let mut last = None;
        for (i, t) in types.into_iter().enumerate() {
            last = e.on_event(
                &ev(t, Severity::Medium, t0 + Duration::minutes(i as i64)),
                LockState::SoftLocked,
            );
        }
        let last = last.unwrap();
        assert_eq!(last.target, LockState::PermanentLocked);
        assert_eq!(last.reason.category, ReasonCategory::RepeatedViolations);
    }

    #[test]
    fn violations_outside_window_do_not_count() {
        let mut e = esc();
        let t0 = Utc::now();
        e.on_event(&ev(TamperType::SimChanged, Severity::Low, t0), LockState::None);
        e.on_clear(&[TamperType::SimChanged]);
        e.on_event(
            &ev(TamperType::SimChanged, Severity::Low, t0 + Duration::hours(2)),
            LockState::SoftLocked,
        );
        e.on_clear(&[TamperType::SimChanged]);
        let got = e
            .on_event(
                &ev(TamperType::SimChanged, Severity::Low, t0 + Duration::hours(4)),
                LockState::SoftLocked,
            )
            .unwrap();
        assert_eq!(got.target, LockState::SoftLocked);
        assert_eq!(got.reason.category, ReasonCategory::DeviceTampering);
    }

    #[test]
    fn critical_reason_is_security_breach() {
        let mut e = esc();
        let got = e
            .on_event(
                &ev(TamperType::Rooted, Severity::Critical, Utc::now()),
                LockState::None,
            )
            .unwrap();
        assert_eq!(got.reason.category, ReasonCategory::SecurityBreach);
    }
}
