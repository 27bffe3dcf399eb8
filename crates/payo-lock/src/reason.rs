//! Lock reasons.
//!
//! Reasons are typed end to end. The only place free text is turned into a
//! category is [`categorize_legacy`], used where backend commands arrive.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Severity> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCategory {
    PaymentDueSoon,
    PaymentOverdue,
    LoanDefault,
    DeviceTampering,
    SecurityBreach,
    RepeatedViolations,
    AdminAction,
    Unlocked,
}

impl ReasonCategory {
    /// Fixed user-facing message for the category.
    pub fn message(&self) -> &'static str {
        match self {
            ReasonCategory::PaymentDueSoon => {
                "Your payment is due soon. Please pay to avoid further restrictions."
            }
            ReasonCategory::PaymentOverdue => {
                "Your payment is overdue. Pay now to restore full access to this device."
            }
            ReasonCategory::LoanDefault => {
                "This loan is in default. Contact your lender to restore this device."
            }
            ReasonCategory::DeviceTampering => {
                "A change to protected device settings was detected. This device has been restricted."
            }
            ReasonCategory::SecurityBreach => {
                "A security breach was detected. This device has been locked."
            }
            ReasonCategory::RepeatedViolations => {
                "Repeated security violations were detected. Contact your lender."
            }
            ReasonCategory::AdminAction => "This device was locked by your lender.",
            ReasonCategory::Unlocked => "This device is unlocked.",
        }
    }

    /// Categories an offline unlock code may clear.
    pub fn is_payment(&self) -> bool {
        matches!(
            self,
            ReasonCategory::PaymentDueSoon | ReasonCategory::PaymentOverdue
        )
    }
}

/// Why the device is in its current state. Attached to every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockReason {
    pub category: ReasonCategory,
    pub severity: Severity,
    pub message: String,
    /// Free-form detail for logs and the backend; never shown as the headline.
    pub detail: Option<String>,
}

impl LockReason {
    pub fn new(category: ReasonCategory, severity: Severity) -> Self {
        Self {
            category,
            severity,
            message: category.message().to_string(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn unlocked() -> Self {
        Self::new(ReasonCategory::Unlocked, Severity::Low)
    }
}

/// Map backend free text ("Payment overdue", "loan_default", ...) to a category.
///
/// Unknown text is treated as an administrative lock.
pub fn categorize_legacy(text: &str) -> ReasonCategory {
    let t = text.to_ascii_lowercase();
    if t.contains("default") {
        ReasonCategory::LoanDefault
    } else if t.contains("overdue") || t.contains("missed") || t.contains("late") {
        ReasonCategory::PaymentOverdue
    } else if t.contains("due") || t.contains("reminder") {
        ReasonCategory::PaymentDueSoon
    } else if t.contains("repeat") {
        ReasonCategory::RepeatedViolations
    } else if t.contains("tamper") || t.contains("root") || t.contains("debug") {
        ReasonCategory::DeviceTampering
    } else if t.contains("breach") || t.contains("security") {
        ReasonCategory::SecurityBreach
    } else if t.contains("unlock") || t.contains("paid") {
        ReasonCategory::Unlocked
    } else {
        ReasonCategory::AdminAction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_text_categorization() {
        assert_eq!(
            categorize_legacy("Payment overdue"),
            ReasonCategory::PaymentOverdue
        );
        assert_eq!(
            categorize_legacy("loan_default"),
            ReasonCategory::LoanDefault
        );
        assert_eq!(
            categorize_legacy("Payment due in 2 days"),
            ReasonCategory::PaymentDueSoon
        );
        assert_eq!(
            categorize_legacy("USB debugging tamper"),
            ReasonCategory::DeviceTampering
        );
        assert_eq!(
            categorize_legacy("Manual lock by agent"),
            ReasonCategory::AdminAction
        );
    }

    #[test]
    fn reason_carries_template_message() {
        let r = LockReason::new(ReasonCategory::SecurityBreach, Severity::Critical)
            .with_detail("device owner removed");
        assert_eq!(r.message, ReasonCategory::SecurityBreach.message());
        assert_eq!(r.detail.as_deref(), Some("device owner removed"));
    }

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::parse("HIGH"), Some(Severity::High));
    }
}
