use chrono::Duration;
use serde::{Deserialize, Serialize};

/// How a freed seat is matched against the waitlist.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameMatching {
    /// A freed frame-tagged seat goes to the first entry asking for that frame
    /// (or for no frame). Untagged seats go to the head of the queue.
    #[default]
    StrictWhenTyped,
    /// Always the head of the queue that fits a free seat.
    Fifo,
}

/// Tunable booking rules, loaded from configuration or the
/// `business_rules` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookingPolicy {
    #[serde(default = "default_hours")]
    pub cancellation_window_hours: i64,
    #[serde(default = "default_hours")]
    pub payment_deadline_hours: i64,
    #[serde(default = "default_hours")]
    pub reschedule_min_hours: i64,
    #[serde(default = "default_warning_days")]
    pub expiry_warning_days: i64,
    #[serde(default)]
    pub frame_matching: FrameMatching,
}

fn default_hours() -> i64 {
    24
}

fn default_warning_days() -> i64 {
    7
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            cancellation_window_hours: default_hours(),
            payment_deadline_hours: default_hours(),
            reschedule_min_hours: default_hours(),
            expiry_warning_days: default_warning_days(),
            frame_matching: FrameMatching::default(),
        }
    }
}

impl BookingPolicy {
    pub fn cancellation_window(&self) -> Duration {
        Duration::hours(self.cancellation_window_hours)
    }

    pub fn payment_deadline(&self) -> Duration {
        Duration::hours(self.payment_deadline_hours)
    }

    pub fn reschedule_min_notice(&self) -> Duration {
        Duration::hours(self.reschedule_min_hours)
    }

    pub fn expiry_warning(&self) -> Duration {
        Duration::days(self.expiry_warning_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_rules_fall_back_to_defaults() {
        let policy: BookingPolicy =
            serde_json::from_value(serde_json::json!({ "cancellation_window_hours": 48 })).unwrap();
        assert_eq!(policy.cancellation_window(), Duration::hours(48));
        assert_eq!(policy.payment_deadline(), Duration::hours(24));
        assert_eq!(policy.expiry_warning(), Duration::days(7));
        assert_eq!(policy.frame_matching, FrameMatching::StrictWhenTyped);
    }

    #[test]
    fn test_frame_matching_names() {
        let policy: BookingPolicy =
            serde_json::from_value(serde_json::json!({ "frame_matching": "FIFO" })).unwrap();
        assert_eq!(policy.frame_matching, FrameMatching::Fifo);
    }
}
