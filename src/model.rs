use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

// ── Entity types ──────────────────────────────────────────────

/// Triage lifecycle of a task.
///
/// `Done` and `Dropped` are the two closed states; a parent whose children
/// are all closed is closed itself (see `hierarchy::settle`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriageStatus {
    Backlog,
    Ready,
    #[serde(rename = "WIP")]
    Wip,
    Blocked,
    Done,
    Dropped,
    Archived,
}

impl TriageStatus {
    pub fn is_closed(self) -> bool {
        matches!(self, TriageStatus::Done | TriageStatus::Dropped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TriageStatus::Backlog => "Backlog",
            TriageStatus::Ready => "Ready",
            TriageStatus::Wip => "WIP",
            TriageStatus::Blocked => "Blocked",
            TriageStatus::Done => "Done",
            TriageStatus::Dropped => "Dropped",
            TriageStatus::Archived => "Archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Backlog" => Some(TriageStatus::Backlog),
            "Ready" => Some(TriageStatus::Ready),
            "WIP" => Some(TriageStatus::Wip),
            "Blocked" => Some(TriageStatus::Blocked),
            "Done" => Some(TriageStatus::Done),
            "Dropped" => Some(TriageStatus::Dropped),
            "Archived" => Some(TriageStatus::Archived),
            _ => None,
        }
    }
}

/// Effort estimate in points. Serialized as the bare number (0.5, 1, 2, 3, 5, 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub enum Difficulty {
    Half,
    One,
    Two,
    Three,
    Five,
    Eight,
}

impl Difficulty {
    pub fn points(self) -> f64 {
        match self {
            Difficulty::Half => 0.5,
            Difficulty::One => 1.0,
            Difficulty::Two => 2.0,
            Difficulty::Three => 3.0,
            Difficulty::Five => 5.0,
            Difficulty::Eight => 8.0,
        }
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Difficulty::One
    }
}

impl From<Difficulty> for f64 {
    fn from(d: Difficulty) -> f64 {
        d.points()
    }
}

impl TryFrom<f64> for Difficulty {
    type Error = String;

    fn try_from(points: f64) -> Result<Self, Self::Error> {
        [
            Difficulty::Half,
            Difficulty::One,
            Difficulty::Two,
            Difficulty::Three,
            Difficulty::Five,
            Difficulty::Eight,
        ]
        .into_iter()
        .find(|d| d.points() == points)
        .ok_or_else(|| format!("{points} is not a difficulty (0.5, 1, 2, 3, 5, 8)"))
    }
}

/// Reporting tag. No structural effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Category {
    #[default]
    Work,
    Personal,
    Learning,
    Health,
    Other,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Work => "Work",
            Category::Personal => "Personal",
            Category::Learning => "Learning",
            Category::Health => "Health",
            Category::Other => "Other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Work" => Some(Category::Work),
            "Personal" => Some(Category::Personal),
            "Learning" => Some(Category::Learning),
            "Health" => Some(Category::Health),
            "Other" => Some(Category::Other),
            _ => None,
        }
    }
}

/// One tracked work interval. Times are milliseconds since the Unix epoch.
/// `end_time == 0` marks the interval as still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerInterval {
    pub start_time: i64,
    #[serde(default)]
    pub end_time: i64,
}

impl TimerInterval {
    pub fn started_at(now_ms: i64) -> Self {
        TimerInterval { start_time: now_ms, end_time: 0 }
    }

    pub fn is_running(&self) -> bool {
        self.end_time == 0
    }

    /// Closed length in milliseconds; a running interval counts as zero.
    pub fn elapsed_ms(&self) -> i64 {
        if self.is_running() {
            0
        } else {
            (self.end_time - self.start_time).max(0)
        }
    }
}

/// A unit of work and a node in the parent/child hierarchy.
///
/// Never mutate these fields directly on a cached task: go through the
/// `TaskStore` operations so hierarchy and status rules are re-applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub children: Vec<Uuid>,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub triage_status: TriageStatus,
    #[serde(default)]
    pub urgent: bool,
    #[serde(default)]
    pub impact: bool,
    #[serde(default)]
    pub major_incident: bool,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub timer: Vec<TimerInterval>,
    #[serde(default)]
    pub category: Category,
    pub termination_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comment: String,
    pub duration_in_minutes: Option<u32>,
    pub priority: Option<i64>,
    pub user_id: Option<Uuid>,
}

impl Task {
    pub fn new(title: String, parent_id: Option<Uuid>, user_id: Option<Uuid>, now: DateTime<Utc>) -> Self {
        Task {
            id: Uuid::new_v4(),
            parent_id,
            children: Vec::new(),
            title,
            created_at: now,
            triage_status: TriageStatus::Backlog,
            urgent: false,
            impact: false,
            major_incident: false,
            difficulty: Difficulty::default(),
            timer: Vec::new(),
            category: Category::default(),
            termination_date: None,
            comment: String::new(),
            duration_in_minutes: None,
            priority: None,
            user_id,
        }
    }

    pub fn has_running_timer(&self) -> bool {
        self.timer.iter().any(TimerInterval::is_running)
    }

    /// Close every running interval at `now_ms`. Returns true if one was open.
    pub fn stop_timer(&mut self, now_ms: i64) -> bool {
        let mut stopped = false;
        for interval in self.timer.iter_mut().filter(|i| i.is_running()) {
            interval.end_time = now_ms.max(interval.start_time);
            stopped = true;
        }
        stopped
    }

    pub fn tracked_ms(&self) -> i64 {
        self.timer.iter().map(TimerInterval::elapsed_ms).sum()
    }
}

// ── Patches ───────────────────────────────────────────────────

/// Partial update of a task. `None` leaves a field untouched; for nullable
/// fields `Some(None)` clears it.
///
/// The same shape is used by the storage contract (`TaskBackend::update_task`)
/// and by `TaskStore::update`; the store refuses patches that touch the
/// fields it manages itself (`children`, `timer`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "some")]
    pub parent_id: Option<Option<Uuid>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Uuid>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triage_status: Option<TriageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major_incident: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer: Option<Vec<TimerInterval>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "some")]
    pub termination_date: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "some")]
    pub duration_in_minutes: Option<Option<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "some")]
    pub priority: Option<Option<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "some")]
    pub user_id: Option<Option<Uuid>>,
}

/// Present-but-null must become `Some(None)`, not `None`.
fn some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl TaskPatch {
    /// The minimal patch that turns `before` into `after`.
    pub fn between(before: &Task, after: &Task) -> Self {
        fn diff<T: PartialEq + Clone>(a: &T, b: &T) -> Option<T> {
            (a != b).then(|| b.clone())
        }

        TaskPatch {
            parent_id: diff(&before.parent_id, &after.parent_id),
            children: diff(&before.children, &after.children),
            title: diff(&before.title, &after.title),
            triage_status: diff(&before.triage_status, &after.triage_status),
            urgent: diff(&before.urgent, &after.urgent),
            impact: diff(&before.impact, &after.impact),
            major_incident: diff(&before.major_incident, &after.major_incident),
            difficulty: diff(&before.difficulty, &after.difficulty),
            timer: diff(&before.timer, &after.timer),
            category: diff(&before.category, &after.category),
            termination_date: diff(&before.termination_date, &after.termination_date),
            comment: diff(&before.comment, &after.comment),
            duration_in_minutes: diff(&before.duration_in_minutes, &after.duration_in_minutes),
            priority: diff(&before.priority, &after.priority),
            user_id: diff(&before.user_id, &after.user_id),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == TaskPatch::default()
    }

    /// True when the patch only moves the task in the priority order.
    pub fn is_priority_only(&self) -> bool {
        self.priority.is_some()
            && TaskPatch { priority: None, ..self.clone() }.is_empty()
    }

    /// Write every present field onto `task`. No rule is evaluated here.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(v) = self.parent_id {
            task.parent_id = v;
        }
        if let Some(v) = &self.children {
            task.children = v.clone();
        }
        if let Some(v) = &self.title {
            task.title = v.clone();
        }
        if let Some(v) = self.triage_status {
            task.triage_status = v;
        }
        if let Some(v) = self.urgent {
            task.urgent = v;
        }
        if let Some(v) = self.impact {
            task.impact = v;
        }
        if let Some(v) = self.major_incident {
            task.major_incident = v;
        }
        if let Some(v) = self.difficulty {
            task.difficulty = v;
        }
        if let Some(v) = &self.timer {
            task.timer = v.clone();
        }
        if let Some(v) = self.category {
            task.category = v;
        }
        if let Some(v) = self.termination_date {
            task.termination_date = v;
        }
        if let Some(v) = &self.comment {
            task.comment = v.clone();
        }
        if let Some(v) = self.duration_in_minutes {
            task.duration_in_minutes = v;
        }
        if let Some(v) = self.priority {
            task.priority = v;
        }
        if let Some(v) = self.user_id {
            task.user_id = v;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityUpdate {
    pub id: Uuid,
    pub priority: Option<i64>,
}

// ── Settings singletons ───────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    pub user_id: Option<Uuid>,
    pub display_name: Option<String>,
    pub daily_goal_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    pub default_view: String,
    pub week_starts_on_monday: bool,
    pub reminders_enabled: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            default_view: "board".to_string(),
            week_starts_on_monday: true,
            reminders_enabled: true,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("Write report".into(), None, None, Utc::now())
    }

    #[test]
    fn new_task_starts_in_backlog_unprioritized() {
        let t = task();
        assert_eq!(t.triage_status, TriageStatus::Backlog);
        assert_eq!(t.priority, None);
        assert!(t.children.is_empty());
        assert!(!t.has_running_timer());
    }

    #[test]
    fn status_serializes_wip_in_caps() {
        let json = serde_json::to_string(&TriageStatus::Wip).unwrap();
        assert_eq!(json, "\"WIP\"");
        assert_eq!(TriageStatus::parse("WIP"), Some(TriageStatus::Wip));
    }

    #[test]
    fn difficulty_is_a_bare_number_on_the_wire() {
        assert_eq!(serde_json::to_string(&Difficulty::Half).unwrap(), "0.5");
        let d: Difficulty = serde_json::from_str("8").unwrap();
        assert_eq!(d, Difficulty::Eight);
        assert!(serde_json::from_str::<Difficulty>("4").is_err());
    }

    #[test]
    fn stop_timer_closes_only_running_intervals() {
        let mut t = task();
        t.timer.push(TimerInterval { start_time: 10, end_time: 20 });
        t.timer.push(TimerInterval::started_at(100));
        assert!(t.has_running_timer());

        assert!(t.stop_timer(160));
        assert!(!t.has_running_timer());
        assert_eq!(t.timer[0].end_time, 20);
        assert_eq!(t.timer[1].end_time, 160);
        assert_eq!(t.tracked_ms(), 70);
        assert!(!t.stop_timer(200));
    }

    #[test]
    fn patch_between_contains_only_changes() {
        let before = task();
        let mut after = before.clone();
        after.priority = Some(4);
        after.urgent = true;

        let patch = TaskPatch::between(&before, &after);
        assert_eq!(patch.priority, Some(Some(4)));
        assert_eq!(patch.urgent, Some(true));
        assert_eq!(patch.title, None);
        assert!(!patch.is_priority_only());

        let mut replayed = before.clone();
        patch.apply_to(&mut replayed);
        assert_eq!(replayed, after);
    }

    #[test]
    fn priority_only_patch_detected() {
        let patch = TaskPatch { priority: Some(Some(-3)), ..Default::default() };
        assert!(patch.is_priority_only());
        assert!(!TaskPatch::default().is_priority_only());
    }

    #[test]
    fn explicit_null_clears_a_nullable_field() {
        let patch: TaskPatch = serde_json::from_str(r#"{"priority": null, "title": "x"}"#).unwrap();
        assert_eq!(patch.priority, Some(None));
        assert_eq!(patch.parent_id, None);

        let mut t = task();
        t.priority = Some(9);
        patch.apply_to(&mut t);
        assert_eq!(t.priority, None);
        assert_eq!(t.title, "x");
    }

    #[test]
    fn task_json_uses_camel_case() {
        let t = task();
        let value = serde_json::to_value(&t).unwrap();
        assert!(value.get("triageStatus").is_some());
        assert!(value.get("parentId").is_some());
        assert!(value.get("durationInMinutes").is_some());
    }
}
