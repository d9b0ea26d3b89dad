use serde::Serialize;

use super::TaskStatus;

/// Finished faster than this is suspicious (scanned without picking).
pub const INSTANT_COMPLETION_SECS: i64 = 30;
/// Execution slower than this is flagged.
pub const SLOW_COMPLETION_SECS: i64 = 2 * 60 * 60;
/// Waiting for a picker longer than this is flagged.
pub const SLOW_REACTION_SECS: i64 = 60;

/// Timeliness label attached to every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Classification {
    #[serde(rename = "Normal")]
    Normal,
    #[serde(rename = "SlowReaction(>2m)")]
    SlowReaction,
    #[serde(rename = "SlowCompletion(>2h)")]
    SlowCompletion,
    #[serde(rename = "InstantCompletion")]
    InstantCompletion,
    #[serde(rename = "CustomerWaiting(>2m)")]
    CustomerWaiting,
}

/// Classifies a task. Arms are checked in order; the first match wins.
pub fn classify(
    status: TaskStatus,
    reaction_seconds: i64,
    completion_seconds: i64,
) -> Classification {
    match status {
        s if s.is_finished() && completion_seconds < INSTANT_COMPLETION_SECS => {
            Classification::InstantCompletion
        }
        s if s.is_started() && completion_seconds > SLOW_COMPLETION_SECS => {
            Classification::SlowCompletion
        }
        s if s.is_started() && reaction_seconds > SLOW_REACTION_SECS => {
            Classification::SlowReaction
        }
        TaskStatus::Prepared if reaction_seconds > SLOW_REACTION_SECS => {
            Classification::CustomerWaiting
        }
        _ => Classification::Normal,
    }
}

/// Buckets reaction time by whole minutes.
pub fn reaction_scale(reaction_seconds: i64) -> f32 {
    match reaction_seconds / 60 {
        m if m <= 2 => 1.0,
        m if m <= 5 => 1.1,
        _ => 1.2,
    }
}

/// Completion time in minutes (half to even), clamped to [1, 180].
pub fn completion_scale(completion_seconds: i64) -> u32 {
    let minutes = (completion_seconds as f64 / 60.0).round_ties_even();
    if minutes > 180.0 {
        180
    } else if minutes <= 0.0 {
        1
    } else {
        minutes as u32
    }
}
