use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use super::error::{EngineError, Result};
use super::model::{
    AiFollower, Author, Circle, DelayRange, Interaction, Lab, LabStatus, Post, PostStatus,
};
use super::responsiveness::validate_follower;

const SCHEMA: &str = r#"
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS circles (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS ai_followers (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        personality TEXT NOT NULL,
        avatar_url TEXT NOT NULL,
        background TEXT,
        interests TEXT NOT NULL,
        communication_style TEXT,
        interaction_preferences TEXT NOT NULL,
        active INTEGER NOT NULL,
        responsiveness TEXT NOT NULL,
        delay_min INTEGER,
        delay_max INTEGER,
        response_chance INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_followers_user ON ai_followers(user_id);

    CREATE TABLE IF NOT EXISTS circle_members (
        circle_id TEXT NOT NULL REFERENCES circles(id) ON DELETE CASCADE,
        follower_id TEXT NOT NULL REFERENCES ai_followers(id) ON DELETE CASCADE,
        PRIMARY KEY (circle_id, follower_id)
    );

    CREATE TABLE IF NOT EXISTS labs (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS posts (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        circle_id TEXT,
        lab_id TEXT REFERENCES labs(id) ON DELETE CASCADE,
        content TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_posts_lab ON posts(lab_id);

    CREATE TABLE IF NOT EXISTS interactions (
        id TEXT PRIMARY KEY,
        post_id TEXT NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
        author_kind TEXT NOT NULL CHECK (author_kind IN ('ai', 'human')),
        author_id TEXT NOT NULL,
        type TEXT NOT NULL,
        content TEXT,
        parent_id TEXT REFERENCES interactions(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_interactions_post ON interactions(post_id, created_at);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_interactions_one_like
        ON interactions(post_id, author_kind, author_id) WHERE type = 'like';

    CREATE TABLE IF NOT EXISTS pending_responses (
        id TEXT PRIMARY KEY,
        post_id TEXT NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
        follower_id TEXT NOT NULL REFERENCES ai_followers(id) ON DELETE CASCADE,
        trigger_id TEXT,
        scheduled_for TEXT NOT NULL,
        created_at TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        stale_retries INTEGER NOT NULL DEFAULT 0,
        dispatched_at TEXT,
        last_error TEXT
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_pending_active_pair
        ON pending_responses(post_id, follower_id) WHERE status = 'pending';
    CREATE INDEX IF NOT EXISTS idx_pending_due ON pending_responses(status, scheduled_for);
    CREATE INDEX IF NOT EXISTS idx_pending_trigger ON pending_responses(trigger_id);

    CREATE TABLE IF NOT EXISTS dispatch_history (
        pending_id TEXT PRIMARY KEY,
        post_id TEXT NOT NULL,
        follower_id TEXT NOT NULL,
        outcome TEXT NOT NULL,
        interaction_id TEXT,
        attempts INTEGER NOT NULL,
        finished_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_history_post ON dispatch_history(post_id);
"#;

const FOLLOWER_COLUMNS: &str = "id, user_id, name, personality, avatar_url, background, interests, \
     communication_style, interaction_preferences, active, responsiveness, delay_min, delay_max, \
     response_chance, created_at";

const POST_COLUMNS: &str = "id, user_id, circle_id, lab_id, content, status, created_at";

pub(crate) const INTERACTION_COLUMNS: &str =
    "id, post_id, author_kind, author_id, type, content, parent_id, created_at";

/// Fixed-width UTC text so lexical order matches time order.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_opt_ts(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(idx, v)).transpose()
}

pub(crate) fn parse_enum<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = EngineError>,
{
    value.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_json<T: DeserializeOwned>(idx: usize, value: String) -> rusqlite::Result<T> {
    serde_json::from_str(&value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn follower_from_row(row: &Row) -> rusqlite::Result<AiFollower> {
    let delay_min: Option<u32> = row.get(11)?;
    let delay_max: Option<u32> = row.get(12)?;

    Ok(AiFollower {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        personality: row.get(3)?,
        avatar_url: row.get(4)?,
        background: row.get(5)?,
        interests: parse_json(6, row.get(6)?)?,
        communication_style: row.get(7)?,
        interaction_preferences: parse_json(8, row.get(8)?)?,
        active: row.get(9)?,
        responsiveness: parse_enum(10, row.get(10)?)?,
        response_delay: match (delay_min, delay_max) {
            (Some(min), Some(max)) => Some(DelayRange::new(min, max)),
            _ => None,
        },
        response_chance: row.get(13)?,
        created_at: parse_ts(14, row.get(14)?)?,
    })
}

fn post_from_row(row: &Row) -> rusqlite::Result<Post> {
    Ok(Post {
        id: row.get(0)?,
        user_id: row.get(1)?,
        circle_id: row.get(2)?,
        lab_id: row.get(3)?,
        content: row.get(4)?,
        status: parse_enum(5, row.get(5)?)?,
        created_at: parse_ts(6, row.get(6)?)?,
    })
}

pub(crate) fn interaction_from_row(row: &Row) -> rusqlite::Result<Interaction> {
    let kind: String = row.get(2)?;
    let author = Author::from_parts(&kind, row.get(3)?).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Interaction {
        id: row.get(0)?,
        post_id: row.get(1)?,
        author,
        interaction_type: parse_enum(4, row.get(4)?)?,
        content: row.get(5)?,
        parent_id: row.get(6)?,
        created_at: parse_ts(7, row.get(7)?)?,
    })
}

fn lab_from_row(row: &Row) -> rusqlite::Result<Lab> {
    Ok(Lab {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        status: parse_enum(3, row.get(3)?)?,
        created_at: parse_ts(4, row.get(4)?)?,
    })
}

pub(crate) fn get_post_in(conn: &Connection, id: &str) -> Result<Option<Post>> {
    let post = conn
        .query_row(
            &format!("SELECT {} FROM posts WHERE id = ?1", POST_COLUMNS),
            params![id],
            post_from_row,
        )
        .optional()?;
    Ok(post)
}

pub(crate) fn get_interaction_in(conn: &Connection, id: &str) -> Result<Option<Interaction>> {
    let interaction = conn
        .query_row(
            &format!("SELECT {} FROM interactions WHERE id = ?1", INTERACTION_COLUMNS),
            params![id],
            interaction_from_row,
        )
        .optional()?;
    Ok(interaction)
}

pub(crate) fn interactions_for_post_in(conn: &Connection, post_id: &str) -> Result<Vec<Interaction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM interactions WHERE post_id = ?1 ORDER BY created_at ASC, id ASC",
        INTERACTION_COLUMNS
    ))?;
    let interactions = stmt
        .query_map(params![post_id], interaction_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(interactions)
}

/// SQLite-backed storage shared by every engine component.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `db_path`
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside one transaction; any error rolls everything back.
    pub(crate) fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    // Circles

    pub fn create_circle(&self, circle: &Circle) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO circles (id, owner_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![&circle.id, &circle.owner_id, &circle.name, ts(&circle.created_at)],
            )?;
            Ok(())
        })
    }

    pub fn get_circle(&self, id: &str) -> Result<Circle> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, owner_id, name, created_at FROM circles WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Circle {
                        id: row.get(0)?,
                        owner_id: row.get(1)?,
                        name: row.get(2)?,
                        created_at: parse_ts(3, row.get(3)?)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("circle {}", id)))
        })
    }

    pub fn add_member(&self, circle_id: &str, follower_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO circle_members (circle_id, follower_id) VALUES (?1, ?2)",
                params![circle_id, follower_id],
            )?;
            Ok(())
        })
    }

    pub fn remove_member(&self, circle_id: &str, follower_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM circle_members WHERE circle_id = ?1 AND follower_id = ?2",
                params![circle_id, follower_id],
            )?;
            Ok(removed > 0)
        })
    }

    /// Members of a circle, active or not.
    pub fn circle_roster(&self, circle_id: &str) -> Result<Vec<AiFollower>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM ai_followers
                 WHERE id IN (SELECT follower_id FROM circle_members WHERE circle_id = ?1)
                 ORDER BY created_at ASC, id ASC",
                FOLLOWER_COLUMNS
            ))?;
            let followers = stmt
                .query_map(params![circle_id], follower_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(followers)
        })
    }

    // Followers

    pub fn create_follower(&self, follower: &AiFollower) -> Result<()> {
        validate_follower(follower)?;
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO ai_followers ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    FOLLOWER_COLUMNS
                ),
                params![
                    &follower.id,
                    &follower.user_id,
                    &follower.name,
                    &follower.personality,
                    &follower.avatar_url,
                    &follower.background,
                    serde_json::to_string(&follower.interests)?,
                    &follower.communication_style,
                    serde_json::to_string(&follower.interaction_preferences)?,
                    follower.active,
                    follower.responsiveness.as_str(),
                    follower.response_delay.map(|d| d.min),
                    follower.response_delay.map(|d| d.max),
                    follower.response_chance,
                    ts(&follower.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_follower(&self, id: &str) -> Result<AiFollower> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM ai_followers WHERE id = ?1", FOLLOWER_COLUMNS),
                params![id],
                follower_from_row,
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("follower {}", id)))
        })
    }

    /// Followers owned by `user_id`, or every follower when `None`.
    pub fn list_followers(&self, user_id: Option<&str>) -> Result<Vec<AiFollower>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM ai_followers WHERE (?1 IS NULL OR user_id = ?1)
                 ORDER BY created_at ASC, id ASC",
                FOLLOWER_COLUMNS
            ))?;
            let followers = stmt
                .query_map(params![user_id], follower_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(followers)
        })
    }

    pub fn set_follower_active(&self, id: &str, active: bool) -> Result<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE ai_followers SET active = ?1 WHERE id = ?2",
                params![active, id],
            )?;
            if updated == 0 {
                return Err(EngineError::NotFound(format!("follower {}", id)));
            }
            Ok(())
        })
    }

    // Posts

    pub fn create_post(&self, post: &Post) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO posts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)", POST_COLUMNS),
                params![
                    &post.id,
                    &post.user_id,
                    &post.circle_id,
                    &post.lab_id,
                    &post.content,
                    post.status.as_str(),
                    ts(&post.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_post(&self, id: &str) -> Result<Post> {
        self.with_conn(|conn| get_post_in(conn, id))?
            .ok_or_else(|| EngineError::NotFound(format!("post {}", id)))
    }

    pub fn post_exists(&self, id: &str) -> Result<bool> {
        Ok(self.with_conn(|conn| get_post_in(conn, id))?.is_some())
    }

    pub fn set_post_status(&self, id: &str, status: PostStatus) -> Result<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE posts SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
            if updated == 0 {
                return Err(EngineError::NotFound(format!("post {}", id)));
            }
            Ok(())
        })
    }

    /// Flip a draft to posted. Returns false if it was already published.
    pub fn publish_draft(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE posts SET status = 'posted' WHERE id = ?1 AND status = 'pending'",
                params![id],
            )?;
            Ok(updated == 1)
        })
    }

    /// Removes the post; interactions and ledger rows go with it through the foreign keys.
    pub fn delete_post(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM posts WHERE id = ?1", params![id])?;
            if removed == 0 {
                return Err(EngineError::NotFound(format!("post {}", id)));
            }
            Ok(())
        })
    }

    pub fn posts_for_lab(&self, lab_id: &str) -> Result<Vec<Post>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM posts WHERE lab_id = ?1 ORDER BY created_at ASC, id ASC",
                POST_COLUMNS
            ))?;
            let posts = stmt
                .query_map(params![lab_id], post_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(posts)
        })
    }

    // Labs

    pub fn create_lab(&self, lab: &Lab) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO labs (id, user_id, name, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![&lab.id, &lab.user_id, &lab.name, lab.status.as_str(), ts(&lab.created_at)],
            )?;
            Ok(())
        })
    }

    pub fn get_lab(&self, id: &str) -> Result<Lab> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, name, status, created_at FROM labs WHERE id = ?1",
                params![id],
                lab_from_row,
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("lab {}", id)))
        })
    }

    pub fn set_lab_status(&self, id: &str, status: LabStatus) -> Result<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE labs SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
            if updated == 0 {
                return Err(EngineError::NotFound(format!("lab {}", id)));
            }
            Ok(())
        })
    }

    // Interactions (read side; writes go through the thread materializer)

    pub fn get_interaction(&self, id: &str) -> Result<Interaction> {
        self.with_conn(|conn| get_interaction_in(conn, id))?
            .ok_or_else(|| EngineError::NotFound(format!("interaction {}", id)))
    }

    pub fn interactions_for_post(&self, post_id: &str) -> Result<Vec<Interaction>> {
        self.with_conn(|conn| interactions_for_post_in(conn, post_id))
    }

    pub fn count_interactions(&self, post_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: usize = conn.query_row(
                "SELECT COUNT(*) FROM interactions WHERE post_id = ?1",
                params![post_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}
