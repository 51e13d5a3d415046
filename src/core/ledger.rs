use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::Serialize;

use super::error::{EngineError, Result};
use super::model::{new_id, DispatchOutcome, DispatchRecord, PendingResponse, PendingStatus};
use super::store::{parse_enum, parse_opt_ts, parse_ts, ts, Store};

const PENDING_COLUMNS: &str = "id, post_id, follower_id, trigger_id, scheduled_for, created_at, \
     status, attempts, stale_retries, dispatched_at, last_error";

fn pending_from_row(row: &Row) -> rusqlite::Result<PendingResponse> {
    Ok(PendingResponse {
        id: row.get(0)?,
        post_id: row.get(1)?,
        follower_id: row.get(2)?,
        trigger_id: row.get(3)?,
        scheduled_for: parse_ts(4, row.get(4)?)?,
        created_at: parse_ts(5, row.get(5)?)?,
        status: parse_enum(6, row.get(6)?)?,
        attempts: row.get(7)?,
        stale_retries: row.get(8)?,
        dispatched_at: parse_opt_ts(9, row.get(9)?)?,
        last_error: row.get(10)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

pub(crate) fn get_in(conn: &Connection, id: &str) -> Result<Option<PendingResponse>> {
    let pending = conn
        .query_row(
            &format!("SELECT {} FROM pending_responses WHERE id = ?1", PENDING_COLUMNS),
            params![id],
            pending_from_row,
        )
        .optional()?;
    Ok(pending)
}

/// Archive the row into `dispatch_history` and drop it from the ledger.
/// Returns `false` when there was nothing left to finalize.
pub(crate) fn mark_dispatched_in(
    conn: &Connection,
    id: &str,
    outcome: DispatchOutcome,
    interaction_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(row) = get_in(conn, id)? else {
        return Ok(false);
    };
    if row.status == PendingStatus::Failed {
        return Ok(false);
    }

    conn.execute(
        "INSERT OR REPLACE INTO dispatch_history
            (pending_id, post_id, follower_id, outcome, interaction_id, attempts, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            &row.id,
            &row.post_id,
            &row.follower_id,
            outcome.as_str(),
            interaction_id,
            row.attempts,
            ts(&now),
        ],
    )?;
    conn.execute("DELETE FROM pending_responses WHERE id = ?1", params![id])?;
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Rescheduled,
    /// A newer pending row for the same pair already exists; this one was archived.
    Superseded,
    /// The row was cancelled or finalized in the meantime.
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleAction {
    Requeued,
    Failed,
    Superseded,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    pub pending: usize,
    pub dispatched: usize,
    pub failed: usize,
    pub materialized: usize,
    pub skipped: usize,
    pub other_finished: usize,
}

/// Durable store of scheduled-but-not-yet-executed responses.
///
/// This is the only component that writes `pending_responses` rows. The
/// partial unique index on `(post_id, follower_id) WHERE status = 'pending'`
/// backs the one-active-row-per-pair guarantee, so concurrent writers can
/// race freely.
#[derive(Clone)]
pub struct Ledger {
    store: Store,
}

impl Ledger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn create(
        &self,
        post_id: &str,
        follower_id: &str,
        trigger_id: Option<&str>,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PendingResponse> {
        let pending = PendingResponse {
            id: new_id(),
            post_id: post_id.to_string(),
            follower_id: follower_id.to_string(),
            trigger_id: trigger_id.map(str::to_string),
            scheduled_for,
            created_at: now,
            status: PendingStatus::Pending,
            attempts: 0,
            stale_retries: 0,
            dispatched_at: None,
            last_error: None,
        };

        let inserted = self.store.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT OR IGNORE INTO pending_responses
                    (id, post_id, follower_id, trigger_id, scheduled_for, created_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
                params![
                    &pending.id,
                    &pending.post_id,
                    &pending.follower_id,
                    &pending.trigger_id,
                    ts(&pending.scheduled_for),
                    ts(&pending.created_at),
                ],
            )?)
        })?;

        if inserted == 0 {
            return Err(EngineError::DuplicateActive {
                post_id: post_id.to_string(),
                follower_id: follower_id.to_string(),
            });
        }
        Ok(pending)
    }

    pub fn get(&self, id: &str) -> Result<Option<PendingResponse>> {
        self.store.with_conn(|conn| get_in(conn, id))
    }

    /// `pending` rows due at `now`, earliest first.
    pub fn due_items(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PendingResponse>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM pending_responses
                 WHERE status = 'pending' AND scheduled_for <= ?1
                 ORDER BY scheduled_for ASC, created_at ASC
                 LIMIT ?2",
                PENDING_COLUMNS
            ))?;
            let items = stmt
                .query_map(params![ts(&now), limit as i64], pending_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(items)
        })
    }

    /// Compare-and-swap `pending -> dispatched`. Only one caller can win a row.
    pub fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.store.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE pending_responses SET status = 'dispatched', dispatched_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, ts(&now)],
            )?;
            Ok(updated == 1)
        })
    }

    /// Finalize a response. Calling it again for the same id is a no-op.
    pub fn mark_dispatched(
        &self,
        id: &str,
        outcome: DispatchOutcome,
        interaction_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.store
            .with_tx(|conn| mark_dispatched_in(conn, id, outcome, interaction_id, now))
    }

    /// Permanently fail a response, keeping it visible with its reason.
    /// Calling it again for the same id is a no-op.
    pub fn mark_failed(&self, id: &str, reason: &str) -> Result<bool> {
        self.store.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE pending_responses
                 SET status = 'failed', attempts = attempts + 1, last_error = ?2, dispatched_at = NULL
                 WHERE id = ?1 AND status != 'failed'",
                params![id, reason],
            )?;
            Ok(updated == 1)
        })
    }

    /// Put a claimed row back on the schedule after a transient failure.
    pub fn retry(&self, id: &str, at: DateTime<Utc>, reason: &str) -> Result<RetryOutcome> {
        self.store.with_tx(|conn| {
            let result = conn.execute(
                "UPDATE pending_responses
                 SET status = 'pending', scheduled_for = ?2, attempts = attempts + 1,
                     last_error = ?3, dispatched_at = NULL
                 WHERE id = ?1 AND status = 'dispatched'",
                params![id, ts(&at), reason],
            );
            match result {
                Ok(1) => Ok(RetryOutcome::Rescheduled),
                Ok(_) => Ok(RetryOutcome::Gone),
                Err(e) if is_unique_violation(&e) => {
                    mark_dispatched_in(conn, id, DispatchOutcome::Superseded, None, at)?;
                    Ok(RetryOutcome::Superseded)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Everything the ledger still knows about a post, earliest due first.
    pub fn list_by_post(&self, post_id: &str) -> Result<Vec<PendingResponse>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM pending_responses WHERE post_id = ?1
                 ORDER BY scheduled_for ASC, created_at ASC",
                PENDING_COLUMNS
            ))?;
            let items = stmt
                .query_map(params![post_id], pending_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(items)
        })
    }

    pub fn list_by_status(&self, status: PendingStatus) -> Result<Vec<PendingResponse>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM pending_responses WHERE status = ?1
                 ORDER BY scheduled_for ASC, created_at ASC",
                PENDING_COLUMNS
            ))?;
            let items = stmt
                .query_map(params![status.as_str()], pending_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(items)
        })
    }

    /// Remove still-`pending` rows for a post. In-flight and failed rows are left alone.
    pub fn cancel_for_post(&self, post_id: &str) -> Result<Vec<PendingResponse>> {
        self.store.with_tx(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM pending_responses WHERE post_id = ?1 AND status = 'pending'",
                PENDING_COLUMNS
            ))?;
            let cancelled = stmt
                .query_map(params![post_id], pending_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            conn.execute(
                "DELETE FROM pending_responses WHERE post_id = ?1 AND status = 'pending'",
                params![post_id],
            )?;
            Ok(cancelled)
        })
    }

    /// Remove still-`pending` rows scheduled by any of the given interactions.
    pub fn cancel_for_triggers(&self, trigger_ids: &[String]) -> Result<Vec<PendingResponse>> {
        self.store.with_tx(|conn| {
            let mut cancelled = Vec::new();
            for trigger_id in trigger_ids {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM pending_responses WHERE trigger_id = ?1 AND status = 'pending'",
                    PENDING_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![trigger_id], pending_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                conn.execute(
                    "DELETE FROM pending_responses WHERE trigger_id = ?1 AND status = 'pending'",
                    params![trigger_id],
                )?;
                cancelled.extend(rows);
            }
            Ok(cancelled)
        })
    }

    /// Handle `dispatched` rows that outlived `max_processing`: requeue once, then fail.
    pub fn reap_stale(
        &self,
        now: DateTime<Utc>,
        max_processing: Duration,
    ) -> Result<Vec<(PendingResponse, StaleAction)>> {
        let cutoff = now - max_processing;
        self.store.with_tx(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM pending_responses
                 WHERE status = 'dispatched' AND dispatched_at < ?1",
                PENDING_COLUMNS
            ))?;
            let stale = stmt
                .query_map(params![ts(&cutoff)], pending_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut reaped = Vec::with_capacity(stale.len());
            for row in stale {
                let action = if row.stale_retries == 0 {
                    let result = conn.execute(
                        "UPDATE pending_responses
                         SET status = 'pending', scheduled_for = ?2, stale_retries = 1,
                             dispatched_at = NULL, last_error = 'processing timed out'
                         WHERE id = ?1",
                        params![&row.id, ts(&now)],
                    );
                    match result {
                        Ok(_) => StaleAction::Requeued,
                        Err(e) if is_unique_violation(&e) => {
                            mark_dispatched_in(conn, &row.id, DispatchOutcome::Superseded, None, now)?;
                            StaleAction::Superseded
                        }
                        Err(e) => return Err(e.into()),
                    }
                } else {
                    conn.execute(
                        "UPDATE pending_responses
                         SET status = 'failed', attempts = attempts + 1,
                             last_error = 'processing timed out twice', dispatched_at = NULL
                         WHERE id = ?1",
                        params![&row.id],
                    )?;
                    StaleAction::Failed
                };
                reaped.push((row, action));
            }
            Ok(reaped)
        })
    }

    pub fn history_for_post(&self, post_id: &str) -> Result<Vec<DispatchRecord>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT pending_id, post_id, follower_id, outcome, interaction_id, attempts, finished_at
                 FROM dispatch_history WHERE post_id = ?1 ORDER BY finished_at ASC",
            )?;
            let records = stmt
                .query_map(params![post_id], |row| {
                    Ok(DispatchRecord {
                        pending_id: row.get(0)?,
                        post_id: row.get(1)?,
                        follower_id: row.get(2)?,
                        outcome: parse_enum(3, row.get(3)?)?,
                        interaction_id: row.get(4)?,
                        attempts: row.get(5)?,
                        finished_at: parse_ts(6, row.get(6)?)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    /// Number of rows not yet resolved (pending or in flight) for a post.
    pub fn unresolved_count(&self, post_id: &str) -> Result<usize> {
        self.store.with_conn(|conn| {
            let count: usize = conn.query_row(
                "SELECT COUNT(*) FROM pending_responses
                 WHERE post_id = ?1 AND status IN ('pending', 'dispatched')",
                params![post_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    pub fn stats(&self) -> Result<LedgerStats> {
        self.store.with_conn(|conn| {
            let mut stats = LedgerStats::default();

            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM pending_responses GROUP BY status")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let status: PendingStatus = parse_enum(0, row.get(0)?)?;
                let count: usize = row.get(1)?;
                match status {
                    PendingStatus::Pending => stats.pending = count,
                    PendingStatus::Dispatched => stats.dispatched = count,
                    PendingStatus::Failed => stats.failed = count,
                }
            }

            let mut stmt =
                conn.prepare("SELECT outcome, COUNT(*) FROM dispatch_history GROUP BY outcome")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let outcome: DispatchOutcome = parse_enum(0, row.get(0)?)?;
                let count: usize = row.get(1)?;
                match outcome {
                    DispatchOutcome::Materialized => stats.materialized += count,
                    DispatchOutcome::Skipped => stats.skipped += count,
                    _ => stats.other_finished += count,
                }
            }

            Ok(stats)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{AiFollower, Post, Responsiveness};

    struct Fixture {
        ledger: Ledger,
        post: Post,
        follower: AiFollower,
        now: DateTime<Utc>,
    }

    fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let post = Post::new("u1", None, "hello", now);
        store.create_post(&post).unwrap();
        let follower = AiFollower::new("u1", "Ava", "warm", Responsiveness::Instant, 100, now);
        store.create_follower(&follower).unwrap();
        Fixture {
            ledger: Ledger::new(store),
            post,
            follower,
            now,
        }
    }

    #[test]
    fn test_duplicate_active_is_rejected() {
        let f = fixture();
        f.ledger
            .create(&f.post.id, &f.follower.id, None, f.now, f.now)
            .unwrap();
        let second = f.ledger.create(&f.post.id, &f.follower.id, None, f.now, f.now);
        assert!(matches!(second, Err(EngineError::DuplicateActive { .. })));
        assert_eq!(f.ledger.list_by_post(&f.post.id).unwrap().len(), 1);
    }

    #[test]
    fn test_due_items_are_ordered_and_filtered() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let post = Post::new("u1", None, "hello", now);
        store.create_post(&post).unwrap();
        let ledger = Ledger::new(store.clone());

        let mut ids = Vec::new();
        for offset in [3, 1, 2, 90] {
            let follower = AiFollower::new("u1", "F", "", Responsiveness::Instant, 100, now);
            store.create_follower(&follower).unwrap();
            let row = ledger
                .create(&post.id, &follower.id, None, now + Duration::minutes(offset), now)
                .unwrap();
            ids.push((offset, row.id));
        }

        let due = ledger.due_items(now + Duration::minutes(10), 100).unwrap();
        let offsets: Vec<i64> = due
            .iter()
            .map(|d| ids.iter().find(|(_, id)| *id == d.id).unwrap().0)
            .collect();
        assert_eq!(offsets, vec![1, 2, 3]);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let f = fixture();
        let row = f
            .ledger
            .create(&f.post.id, &f.follower.id, None, f.now, f.now)
            .unwrap();
        assert!(f.ledger.claim(&row.id, f.now).unwrap());
        assert!(!f.ledger.claim(&row.id, f.now).unwrap());
        assert!(f.ledger.due_items(f.now, 10).unwrap().is_empty());
    }

    #[test]
    fn test_mark_dispatched_twice_is_a_no_op() {
        let f = fixture();
        let row = f
            .ledger
            .create(&f.post.id, &f.follower.id, None, f.now, f.now)
            .unwrap();
        f.ledger.claim(&row.id, f.now).unwrap();

        assert!(f
            .ledger
            .mark_dispatched(&row.id, DispatchOutcome::Skipped, None, f.now)
            .unwrap());
        let after_first = (
            f.ledger.list_by_post(&f.post.id).unwrap().len(),
            f.ledger.history_for_post(&f.post.id).unwrap().len(),
        );
        assert!(!f
            .ledger
            .mark_dispatched(&row.id, DispatchOutcome::Skipped, None, f.now)
            .unwrap());
        let after_second = (
            f.ledger.list_by_post(&f.post.id).unwrap().len(),
            f.ledger.history_for_post(&f.post.id).unwrap().len(),
        );
        assert_eq!(after_first, (0, 1));
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn test_mark_failed_is_idempotent_and_visible() {
        let f = fixture();
        let row = f
            .ledger
            .create(&f.post.id, &f.follower.id, None, f.now, f.now)
            .unwrap();
        assert!(f.ledger.mark_failed(&row.id, "parent vanished").unwrap());
        assert!(!f.ledger.mark_failed(&row.id, "again").unwrap());

        let rows = f.ledger.list_by_post(&f.post.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, PendingStatus::Failed);
        assert_eq!(rows[0].attempts, 1);
        assert_eq!(rows[0].last_error.as_deref(), Some("parent vanished"));

        // A failed row does not block a fresh schedule for the same pair.
        f.ledger
            .create(&f.post.id, &f.follower.id, None, f.now, f.now)
            .unwrap();
    }

    #[test]
    fn test_retry_reschedules_claimed_row() {
        let f = fixture();
        let row = f
            .ledger
            .create(&f.post.id, &f.follower.id, None, f.now, f.now)
            .unwrap();
        f.ledger.claim(&row.id, f.now).unwrap();

        let later = f.now + Duration::minutes(2);
        assert_eq!(
            f.ledger.retry(&row.id, later, "503").unwrap(),
            RetryOutcome::Rescheduled
        );
        let reloaded = f.ledger.get(&row.id).unwrap().unwrap();
        assert_eq!(reloaded.status, PendingStatus::Pending);
        assert_eq!(reloaded.attempts, 1);
        assert!(f.ledger.due_items(f.now, 10).unwrap().is_empty());
        assert_eq!(f.ledger.due_items(later, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_retry_yields_to_newer_pending_row() {
        let f = fixture();
        let row = f
            .ledger
            .create(&f.post.id, &f.follower.id, None, f.now, f.now)
            .unwrap();
        f.ledger.claim(&row.id, f.now).unwrap();
        let newer = f
            .ledger
            .create(&f.post.id, &f.follower.id, None, f.now, f.now)
            .unwrap();

        assert_eq!(
            f.ledger.retry(&row.id, f.now, "timeout").unwrap(),
            RetryOutcome::Superseded
        );
        let remaining = f.ledger.list_by_post(&f.post.id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, newer.id);
    }

    #[test]
    fn test_cancel_for_post_only_touches_pending() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let post = Post::new("u1", None, "hello", now);
        store.create_post(&post).unwrap();
        let ledger = Ledger::new(store.clone());

        let a = AiFollower::new("u1", "A", "", Responsiveness::Instant, 100, now);
        let b = AiFollower::new("u1", "B", "", Responsiveness::Instant, 100, now);
        store.create_follower(&a).unwrap();
        store.create_follower(&b).unwrap();
        ledger.create(&post.id, &a.id, None, now, now).unwrap();
        let in_flight = ledger.create(&post.id, &b.id, None, now, now).unwrap();
        ledger.claim(&in_flight.id, now).unwrap();

        let cancelled = ledger.cancel_for_post(&post.id).unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].follower_id, a.id);
        assert_eq!(ledger.list_by_post(&post.id).unwrap().len(), 1);
    }

    #[test]
    fn test_stale_dispatch_requeued_once_then_failed() {
        let f = fixture();
        let row = f
            .ledger
            .create(&f.post.id, &f.follower.id, None, f.now, f.now)
            .unwrap();
        let max = Duration::minutes(5);

        f.ledger.claim(&row.id, f.now).unwrap();
        let reaped = f.ledger.reap_stale(f.now + Duration::minutes(6), max).unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].1, StaleAction::Requeued);

        let later = f.now + Duration::minutes(7);
        f.ledger.claim(&row.id, later).unwrap();
        let reaped = f.ledger.reap_stale(later + Duration::minutes(6), max).unwrap();
        assert_eq!(reaped[0].1, StaleAction::Failed);
        let reloaded = f.ledger.get(&row.id).unwrap().unwrap();
        assert_eq!(reloaded.status, PendingStatus::Failed);
    }

    #[test]
    fn test_stats_counts_statuses_and_history() {
        let f = fixture();
        let row = f
            .ledger
            .create(&f.post.id, &f.follower.id, None, f.now, f.now)
            .unwrap();
        assert_eq!(f.ledger.stats().unwrap().pending, 1);

        f.ledger.claim(&row.id, f.now).unwrap();
        f.ledger
            .mark_dispatched(&row.id, DispatchOutcome::Materialized, Some("i1"), f.now)
            .unwrap();
        let stats = f.ledger.stats().unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.materialized, 1);
        assert_eq!(f.ledger.unresolved_count(&f.post.id).unwrap(), 0);
    }
}
