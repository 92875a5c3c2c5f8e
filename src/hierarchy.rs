//! Pure hierarchy and status rules.
//!
//! Every rule works on a `Draft`: a copy-on-write view over the current
//! snapshot. Nothing here touches the cache, the backend or the replicated
//! document. `Draft::finish` yields the next snapshot plus the exact list of
//! records that changed, which is what the store persists and replicates.

use crate::error::EngineError;
use crate::model::{Task, TaskPatch, TimerInterval, TriageStatus};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// The whole task collection, keyed by id.
pub type Snapshot = HashMap<Uuid, Task>;

// ── Change sets ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Upsert { before: Option<Task>, after: Task },
    Delete { before: Task },
}

impl Change {
    pub fn id(&self) -> Uuid {
        match self {
            Change::Upsert { after, .. } => after.id,
            Change::Delete { before } => before.id,
        }
    }
}

pub type ChangeSet = Vec<Change>;

// ── Draft ─────────────────────────────────────────────────────

/// Copy-on-write working set over a snapshot.
///
/// Touched records are cloned on first write; `order` remembers the first
/// touch so new parents are always emitted before their new children.
pub struct Draft<'a> {
    base: &'a Snapshot,
    touched: HashMap<Uuid, Option<Task>>,
    order: Vec<Uuid>,
}

impl<'a> Draft<'a> {
    pub fn new(base: &'a Snapshot) -> Self {
        Draft { base, touched: HashMap::new(), order: Vec::new() }
    }

    pub fn get(&self, id: &Uuid) -> Option<&Task> {
        match self.touched.get(id) {
            Some(slot) => slot.as_ref(),
            None => self.base.get(id),
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.get(id).is_some()
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Task> {
        if !self.touched.contains_key(id) {
            let task = self.base.get(id)?.clone();
            self.touch(*id, Some(task));
        }
        self.touched.get_mut(id)?.as_mut()
    }

    pub fn insert(&mut self, task: Task) {
        self.touch(task.id, Some(task));
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Task> {
        let existing = self.get(id).cloned();
        if existing.is_some() {
            self.touch(*id, None);
        }
        existing
    }

    fn touch(&mut self, id: Uuid, slot: Option<Task>) {
        if self.touched.insert(id, slot).is_none() {
            self.order.push(id);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.base
            .values()
            .filter(|t| !self.touched.contains_key(&t.id))
            .chain(self.touched.values().filter_map(Option::as_ref))
    }

    /// Materialize the next snapshot and the records that really changed.
    pub fn finish(mut self) -> (Snapshot, ChangeSet) {
        let mut next = self.base.clone();
        let mut changes = ChangeSet::new();

        for id in &self.order {
            let before = self.base.get(id);
            match self.touched.remove(id).flatten() {
                Some(after) => {
                    if before != Some(&after) {
                        changes.push(Change::Upsert { before: before.cloned(), after: after.clone() });
                        next.insert(*id, after);
                    }
                }
                None => {
                    if let Some(before) = next.remove(id) {
                        changes.push(Change::Delete { before });
                    }
                }
            }
        }

        (next, changes)
    }
}

// ── Cascade origin ────────────────────────────────────────────

/// Who caused a status change. Replaces a shared re-entrancy flag: the
/// origin decides which cascades may fire from this change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Explicit operation: cascade down (on Done) and settle the parent.
    User,
    /// Settled from a child: keep settling upward, never cascade down.
    Child,
    /// Pushed down from an ancestor: no further cascading.
    Parent,
}

// ── Tree walks ────────────────────────────────────────────────

/// True if `ancestor` appears on the parent chain above `id`.
/// Walks `parent_id` pointers upward; stops on a revisited node.
pub fn is_ancestor(draft: &Draft, ancestor: Uuid, id: Uuid) -> bool {
    let mut seen = HashSet::new();
    let mut cursor = draft.get(&id).and_then(|t| t.parent_id);
    while let Some(current) = cursor {
        if current == ancestor {
            return true;
        }
        if !seen.insert(current) {
            return false;
        }
        cursor = draft.get(&current).and_then(|t| t.parent_id);
    }
    false
}

/// All descendants of `id`, parents before children.
pub fn descendants(draft: &Draft, id: Uuid) -> Vec<Uuid> {
    let mut out = Vec::new();
    let mut seen = HashSet::from([id]);
    let mut stack: Vec<Uuid> = draft
        .get(&id)
        .map(|t| t.children.iter().rev().copied().collect())
        .unwrap_or_default();

    while let Some(next) = stack.pop() {
        if !seen.insert(next) {
            continue;
        }
        out.push(next);
        if let Some(task) = draft.get(&next) {
            stack.extend(task.children.iter().rev().copied());
        }
    }
    out
}

fn min_priority<'t>(tasks: impl Iterator<Item = &'t Task>) -> Option<i64> {
    tasks.filter_map(|t| t.priority).min()
}

/// Lowest priority among prioritized Backlog tasks, ignoring `exclude`.
fn backlog_floor(draft: &Draft, exclude: Option<Uuid>) -> Option<i64> {
    min_priority(
        draft
            .iter()
            .filter(|t| t.triage_status == TriageStatus::Backlog && Some(t.id) != exclude),
    )
}

// ── Status rules ──────────────────────────────────────────────

/// Set a task's triage status and run the cascades its origin allows.
pub fn set_status(
    draft: &mut Draft,
    id: Uuid,
    status: TriageStatus,
    origin: Origin,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let floor = (status == TriageStatus::Blocked)
        .then(|| backlog_floor(draft, Some(id)))
        .flatten();

    let task = draft.get_mut(&id).ok_or(EngineError::TaskNotFound(id))?;
    if status == TriageStatus::Done && task.triage_status != TriageStatus::Done {
        task.termination_date = Some(now);
    }
    task.triage_status = status;
    if let Some(floor) = floor {
        task.priority = Some(floor.saturating_sub(1));
    }
    let parent = task.parent_id;

    if origin == Origin::User && status == TriageStatus::Done {
        for child in descendants(draft, id) {
            let reopen = draft
                .get(&child)
                .is_some_and(|c| !c.triage_status.is_closed());
            if reopen {
                set_status(draft, child, TriageStatus::Done, Origin::Parent, now)?;
            }
        }
    }

    if origin != Origin::Parent {
        if let Some(parent) = parent {
            settle(draft, parent, now)?;
        }
    }
    Ok(())
}

/// Re-derive a parent's status from its children.
///
/// All children closed → Done (Dropped if every child is Dropped).
/// Parent closed but some child open → back to Ready.
pub fn settle(draft: &mut Draft, parent_id: Uuid, now: DateTime<Utc>) -> Result<(), EngineError> {
    let Some(parent) = draft.get(&parent_id) else {
        return Ok(());
    };
    let statuses: Vec<TriageStatus> = parent
        .children
        .iter()
        .filter_map(|c| draft.get(c))
        .map(|c| c.triage_status)
        .collect();
    if statuses.is_empty() {
        return Ok(());
    }

    let target = if statuses.iter().all(|s| s.is_closed()) {
        if statuses.iter().all(|s| *s == TriageStatus::Dropped) {
            TriageStatus::Dropped
        } else {
            TriageStatus::Done
        }
    } else if parent.triage_status.is_closed() {
        TriageStatus::Ready
    } else {
        return Ok(());
    };

    if parent.triage_status != target {
        set_status(draft, parent_id, target, Origin::Child, now)?;
    }
    Ok(())
}

/// Re-establish "every Blocked task outranks the prioritized backlog".
pub fn enforce_blocked_precedence(draft: &mut Draft) {
    let Some(floor) = backlog_floor(draft, None) else {
        return;
    };
    let lagging: Vec<Uuid> = draft
        .iter()
        .filter(|t| t.triage_status == TriageStatus::Blocked)
        .filter(|t| t.priority.map_or(true, |p| p >= floor))
        .map(|t| t.id)
        .collect();
    for id in lagging {
        if let Some(task) = draft.get_mut(&id) {
            task.priority = Some(floor.saturating_sub(1));
        }
    }
}

// ── Structural operations ─────────────────────────────────────

pub fn create(
    draft: &mut Draft,
    title: &str,
    parent_id: Option<Uuid>,
    user_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<Uuid, EngineError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(EngineError::EmptyTitle);
    }
    if let Some(parent) = parent_id {
        if !draft.contains(&parent) {
            return Err(EngineError::TaskNotFound(parent));
        }
    }

    let task = Task::new(title.to_string(), parent_id, user_id, now);
    let id = task.id;
    draft.insert(task);

    if let Some(parent) = parent_id {
        if let Some(p) = draft.get_mut(&parent) {
            p.children.push(id);
        }
        settle(draft, parent, now)?;
    }
    Ok(id)
}

/// Move `id` under `new_parent`. Returns false when the move was refused
/// (self-parenting, a descendant as parent) or changed nothing.
pub fn reparent(
    draft: &mut Draft,
    id: Uuid,
    new_parent: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<bool, EngineError> {
    let old_parent = draft.get(&id).ok_or(EngineError::TaskNotFound(id))?.parent_id;

    if let Some(target) = new_parent {
        if !draft.contains(&target) {
            return Err(EngineError::TaskNotFound(target));
        }
        if target == id || is_ancestor(draft, id, target) {
            tracing::debug!(%id, %target, "reparent refused: would create a cycle");
            return Ok(false);
        }
    }
    if old_parent == new_parent {
        return Ok(false);
    }

    if let Some(old) = old_parent.and_then(|p| draft.get_mut(&p)) {
        old.children.retain(|c| *c != id);
    }
    if let Some(task) = draft.get_mut(&id) {
        task.parent_id = new_parent;
    }
    if let Some(new) = new_parent.and_then(|p| draft.get_mut(&p)) {
        if !new.children.contains(&id) {
            new.children.push(id);
        }
    }

    if let Some(old) = old_parent {
        settle(draft, old, now)?;
    }
    if let Some(new) = new_parent {
        settle(draft, new, now)?;
    }
    Ok(true)
}

/// Delete `id` and its whole subtree. Returns the removed ids, root first.
pub fn remove_subtree(draft: &mut Draft, id: Uuid, now: DateTime<Utc>) -> Result<Vec<Uuid>, EngineError> {
    let parent = draft.get(&id).ok_or(EngineError::TaskNotFound(id))?.parent_id;

    let mut doomed = vec![id];
    doomed.extend(descendants(draft, id));
    for victim in &doomed {
        draft.remove(victim);
    }

    if let Some(parent) = parent {
        if let Some(p) = draft.get_mut(&parent) {
            p.children.retain(|c| *c != id);
        }
        settle(draft, parent, now)?;
    }
    Ok(doomed)
}

/// Deep-copy `id` and its descendants under fresh ids, next to the original.
pub fn duplicate_subtree(draft: &mut Draft, id: Uuid, now: DateTime<Utc>) -> Result<Uuid, EngineError> {
    let source = draft.get(&id).cloned().ok_or(EngineError::TaskNotFound(id))?;
    let floor = min_priority(draft.iter());

    let copy_id = copy_node(draft, &source, source.parent_id, now);
    if let Some(copy) = draft.get_mut(&copy_id) {
        copy.title = format!("{} (Copy)", source.title);
        copy.priority = Some(floor.map_or(0, |p| p.saturating_sub(1)));
    }

    if let Some(parent) = source.parent_id {
        if let Some(p) = draft.get_mut(&parent) {
            p.children.push(copy_id);
        }
        settle(draft, parent, now)?;
    }
    Ok(copy_id)
}

fn copy_node(draft: &mut Draft, source: &Task, parent_id: Option<Uuid>, now: DateTime<Utc>) -> Uuid {
    let copy = Task {
        id: Uuid::new_v4(),
        parent_id,
        children: Vec::new(),
        created_at: now,
        timer: Vec::new(),
        ..source.clone()
    };
    let copy_id = copy.id;
    draft.insert(copy);

    let mut children = Vec::with_capacity(source.children.len());
    for child_id in &source.children {
        if let Some(child) = draft.get(child_id).cloned() {
            children.push(copy_node(draft, &child, Some(copy_id), now));
        }
    }
    if let Some(copy) = draft.get_mut(&copy_id) {
        copy.children = children;
    }
    copy_id
}

/// Start or stop the timer of `id`. Any other running interval is closed
/// first; starting forces the task into WIP.
pub fn toggle_timer(draft: &mut Draft, id: Uuid, now: DateTime<Utc>) -> Result<(), EngineError> {
    if !draft.contains(&id) {
        return Err(EngineError::TaskNotFound(id));
    }
    let now_ms = now.timestamp_millis();

    let others: Vec<Uuid> = draft
        .iter()
        .filter(|t| t.id != id && t.has_running_timer())
        .map(|t| t.id)
        .collect();
    for other in others {
        if let Some(task) = draft.get_mut(&other) {
            task.stop_timer(now_ms);
        }
    }

    let task = draft.get_mut(&id).ok_or(EngineError::TaskNotFound(id))?;
    if task.stop_timer(now_ms) {
        return Ok(());
    }
    task.timer.push(TimerInterval::started_at(now_ms));
    set_status(draft, id, TriageStatus::Wip, Origin::User, now)
}

/// Apply a caller patch. Status goes through the cascades, parent through
/// `reparent`; `children` and `timer` are refused.
pub fn apply_patch(draft: &mut Draft, id: Uuid, patch: &TaskPatch, now: DateTime<Utc>) -> Result<(), EngineError> {
    if patch.children.is_some() {
        return Err(EngineError::ManagedField("children"));
    }
    if patch.timer.is_some() {
        return Err(EngineError::ManagedField("timer"));
    }
    let title = match &patch.title {
        Some(t) if t.trim().is_empty() => return Err(EngineError::EmptyTitle),
        Some(t) => Some(t.trim().to_string()),
        None => None,
    };

    let plain = TaskPatch {
        parent_id: None,
        triage_status: None,
        title,
        ..patch.clone()
    };
    let task = draft.get_mut(&id).ok_or(EngineError::TaskNotFound(id))?;
    plain.apply_to(task);

    if let Some(parent) = patch.parent_id {
        reparent(draft, id, parent, now)?;
    }
    if let Some(status) = patch.triage_status {
        set_status(draft, id, status, Origin::User, now)?;
    }
    Ok(())
}

// ── Repair ────────────────────────────────────────────────────

/// Bring records written from outside the rules back in line: detach
/// parents that are missing or close a cycle, rebuild every `children` list
/// from `parent_id`, and leave at most one running interval (the latest).
/// Returns the ids it had to touch.
pub fn repair(draft: &mut Draft, now: DateTime<Utc>) -> Vec<Uuid> {
    let mut repaired = Vec::new();
    let mut ids: Vec<Uuid> = draft.iter().map(|t| t.id).collect();
    ids.sort();

    for id in &ids {
        let dangling = draft
            .get(id)
            .and_then(|t| t.parent_id)
            .is_some_and(|p| !draft.contains(&p));
        if dangling || is_ancestor(draft, *id, *id) {
            if let Some(task) = draft.get_mut(id) {
                task.parent_id = None;
            }
            repaired.push(*id);
        }
    }

    let relinked: Vec<(Uuid, Vec<Uuid>)> = {
        let mut by_parent: HashMap<Uuid, Vec<&Task>> = HashMap::new();
        for task in draft.iter() {
            if let Some(parent) = task.parent_id {
                by_parent.entry(parent).or_default().push(task);
            }
        }
        let mut relinked = Vec::new();
        for id in &ids {
            let Some(task) = draft.get(id) else {
                continue;
            };
            let mut actual = by_parent.remove(id).unwrap_or_default();
            actual.sort_by_key(|c| (c.created_at, c.id));
            // Keep the stored order for real children, append the missing ones.
            let mut children: Vec<Uuid> = Vec::with_capacity(actual.len());
            for child in &task.children {
                if actual.iter().any(|c| c.id == *child) && !children.contains(child) {
                    children.push(*child);
                }
            }
            for child in actual {
                if !children.contains(&child.id) {
                    children.push(child.id);
                }
            }
            if children != task.children {
                relinked.push((*id, children));
            }
        }
        relinked
    };
    for (id, children) in relinked {
        if let Some(task) = draft.get_mut(&id) {
            task.children = children;
        }
        repaired.push(id);
    }

    let latest = draft
        .iter()
        .flat_map(|t| {
            t.timer
                .iter()
                .enumerate()
                .filter(|(_, i)| i.is_running())
                .map(move |(n, i)| (i.start_time, t.id, n))
        })
        .max();
    let now_ms = now.timestamp_millis();
    let running: Vec<Uuid> = draft.iter().filter(|t| t.has_running_timer()).map(|t| t.id).collect();
    for id in running {
        if let Some(task) = draft.get_mut(&id) {
            let mut stopped = false;
            for (n, interval) in task.timer.iter_mut().enumerate() {
                if interval.is_running() && latest.map(|(_, keep, at)| (keep, at)) != Some((id, n)) {
                    interval.end_time = now_ms.max(interval.start_time);
                    stopped = true;
                }
            }
            if stopped {
                repaired.push(id);
            }
        }
    }

    repaired.sort();
    repaired.dedup();
    repaired
}

// ── Invariant checker ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Cycle(Uuid),
    MissingParent { id: Uuid, parent: Uuid },
    ChildrenMismatch(Uuid),
    SeveralRunningTimers(Vec<Uuid>),
    BlockedBelowBacklog(Uuid),
}

/// Check every collection-wide invariant. Empty result means consistent.
pub fn check(snapshot: &Snapshot) -> Vec<Violation> {
    let draft = Draft::new(snapshot);
    let mut violations = Vec::new();

    for task in snapshot.values() {
        if is_ancestor(&draft, task.id, task.id) {
            violations.push(Violation::Cycle(task.id));
        }
        if let Some(parent) = task.parent_id {
            if !snapshot.contains_key(&parent) {
                violations.push(Violation::MissingParent { id: task.id, parent });
            }
        }

        let mut declared: Vec<Uuid> = task.children.clone();
        let mut actual: Vec<Uuid> = snapshot
            .values()
            .filter(|c| c.parent_id == Some(task.id))
            .map(|c| c.id)
            .collect();
        declared.sort();
        actual.sort();
        if declared != actual {
            violations.push(Violation::ChildrenMismatch(task.id));
        }
    }

    let open_intervals: usize = snapshot
        .values()
        .map(|t| t.timer.iter().filter(|i| i.is_running()).count())
        .sum();
    if open_intervals > 1 {
        let mut running: Vec<Uuid> = snapshot
            .values()
            .filter(|t| t.has_running_timer())
            .map(|t| t.id)
            .collect();
        running.sort();
        violations.push(Violation::SeveralRunningTimers(running));
    }

    if let Some(floor) = backlog_floor(&draft, None) {
        for task in snapshot.values() {
            if task.triage_status == TriageStatus::Blocked && task.priority.map_or(true, |p| p >= floor) {
                violations.push(Violation::BlockedBelowBacklog(task.id));
            }
        }
    }

    violations
}

// ── Tests ──────────────────────────────────────────────────────
