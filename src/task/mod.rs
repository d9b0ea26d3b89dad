pub mod classify;
pub mod parse;

use chrono::NaiveDateTime;
use serde::Serialize;

pub use self::classify::Classification;

/// Lifecycle status of a warehouse task as reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Prepared,
    InProgress,
    Completed,
    CompletedWithErrors,
}

impl TaskStatus {
    /// Maps an upstream status string. The legacy "completed without errors"
    /// value is folded into `Completed`.
    pub fn from_upstream(raw: &str) -> Option<Self> {
        match raw.trim() {
            "Подготовлено" => Some(Self::Prepared),
            "В работе" => Some(Self::InProgress),
            "Выполнено" | "Выполнено без ошибок" => Some(Self::Completed),
            "Выполнено с ошибками" => Some(Self::CompletedWithErrors),
            _ => None,
        }
    }

    /// True once a picker has taken the task.
    pub const fn is_started(self) -> bool {
        matches!(
            self,
            Self::InProgress | Self::Completed | Self::CompletedWithErrors
        )
    }

    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithErrors)
    }
}

/// How the goods leave the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    Pickup,
    ToCustomer,
}

impl DeliveryMethod {
    pub fn from_upstream(raw: &str) -> Option<Self> {
        match raw.trim() {
            "Самовывоз" => Some(Self::Pickup),
            "До клиента" => Some(Self::ToCustomer),
            _ => None,
        }
    }
}

/// A fully derived warehouse task.
///
/// Records are only ever built by [`parse::parse_task`] and only published
/// through [`crate::snapshot::Snapshot::aggregate`], which fills the
/// `active_*` load fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub reference: String,
    pub created_at: NaiveDateTime,
    pub execution_started_at: Option<NaiveDateTime>,
    pub execution_completed_at: Option<NaiveDateTime>,
    pub due_at: Option<NaiveDateTime>,
    pub status: TaskStatus,
    pub delivery_method: DeliveryMethod,
    pub volume: f64,
    pub line_count: u32,
    pub team: String,
    pub recipient_info: String,

    pub reaction_seconds: i64,
    pub completion_seconds: i64,
    pub classification: Classification,
    /// Marker size multiplier: 1.0 (<= 2 min), 1.1 (<= 5 min), 1.2 otherwise.
    pub reaction_scale: f32,
    /// Completion time in minutes, clamped to [1, 180].
    pub completion_scale: u32,

    pub active_line_load: u64,
    pub active_volume_load: f64,
}

impl TaskRecord {
    /// Whether this task counts as in flight at `instant`.
    ///
    /// A task with no completion time is still open.
    pub fn is_active_at(&self, instant: NaiveDateTime) -> bool {
        self.created_at <= instant
            && self
                .execution_completed_at
                .map_or(true, |done| done >= instant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_upstream() {
        assert_eq!(
            TaskStatus::from_upstream("Подготовлено"),
            Some(TaskStatus::Prepared)
        );
        assert_eq!(
            TaskStatus::from_upstream("В работе"),
            Some(TaskStatus::InProgress)
        );
        assert_eq!(
            TaskStatus::from_upstream("Выполнено"),
            Some(TaskStatus::Completed)
        );
        assert_eq!(
            TaskStatus::from_upstream("Выполнено с ошибками"),
            Some(TaskStatus::CompletedWithErrors)
        );
        assert_eq!(TaskStatus::from_upstream("Отменено"), None);
    }

    #[test]
    fn test_legacy_status_normalized() {
        assert_eq!(
            TaskStatus::from_upstream("Выполнено без ошибок"),
            Some(TaskStatus::Completed)
        );
    }

    #[test]
    fn test_delivery_method_from_upstream() {
        assert_eq!(
            DeliveryMethod::from_upstream("Самовывоз"),
            Some(DeliveryMethod::Pickup)
        );
        assert_eq!(
            DeliveryMethod::from_upstream(" До клиента "),
            Some(DeliveryMethod::ToCustomer)
        );
        assert_eq!(DeliveryMethod::from_upstream("Почта"), None);
    }

    #[test]
    fn test_status_predicates() {
        assert!(!TaskStatus::Prepared.is_started());
        assert!(TaskStatus::InProgress.is_started());
        assert!(!TaskStatus::InProgress.is_finished());
        assert!(TaskStatus::CompletedWithErrors.is_finished());
    }
}
