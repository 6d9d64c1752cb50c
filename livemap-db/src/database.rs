//! SQLite-backed authoritative storage.
//!
//! Timestamps are stored as Unix milliseconds. Marker payloads are stored as
//! their tagged JSON form in `markers.data`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use livemap_core::source::{LocationRecord, LocationSource, MarkerRepository, UnitDirectory};
use livemap_core::types::{Marker, MarkerCreator, MarkerData, MarkerId, UnitId, UserId};
use livemap_core::SourceError;

use crate::error::{DbError, DbResult};
use crate::open::{open_db, open_db_in_memory};

const LOCATION_SELECT_SQL: &str = "SELECT
    l.user_id, l.x, l.y, l.updated_at, l.hidden,
    u.job, u.job_grade, l.job, l.job_grade,
    u.name, u.job_label, u.grade_label, l.color
FROM user_locations l
JOIN users u ON u.id = l.user_id";

const MARKER_SELECT_SQL: &str = "SELECT
    id, job, x, y, name, description, color, data,
    creator_id, creator_job, creator_grade,
    created_at, updated_at, expires_at, deleted_at
FROM markers";

// ---------------------------------------------------------------------------
// Write-side inputs
// ---------------------------------------------------------------------------

/// A row of `users`.
#[derive(Debug, Clone, PartialEq)]
pub struct UserProfile {
    pub user_id: UserId,
    pub name: String,
    pub job: String,
    pub job_grade: i32,
    pub job_label: Option<String>,
    pub grade_label: Option<String>,
}

/// A position report. `job`/`job_grade` override the profile when set.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdate {
    pub user_id: UserId,
    pub x: f64,
    pub y: f64,
    pub hidden: bool,
    pub job: Option<String>,
    pub job_grade: Option<i32>,
    pub color: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

pub struct Database {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Ok(Self::from_connection(open_db(path)?))
    }

    pub fn open_in_memory() -> DbResult<Self> {
        Ok(Self::from_connection(open_db_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upsert_user(&self, profile: &UserProfile) -> DbResult<()> {
        self.conn().execute(
            "INSERT INTO users (id, name, job, job_grade, job_label, grade_label)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                job = excluded.job,
                job_grade = excluded.job_grade,
                job_label = excluded.job_label,
                grade_label = excluded.grade_label;",
            params![
                profile.user_id.0,
                profile.name,
                profile.job,
                profile.job_grade,
                profile.job_label,
                profile.grade_label,
            ],
        )?;
        Ok(())
    }

    pub fn record_location(&self, update: &LocationUpdate) -> DbResult<()> {
        self.conn().execute(
            "INSERT INTO user_locations (user_id, x, y, hidden, job, job_grade, color, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(user_id) DO UPDATE SET
                x = excluded.x,
                y = excluded.y,
                hidden = excluded.hidden,
                job = excluded.job,
                job_grade = excluded.job_grade,
                color = excluded.color,
                updated_at = excluded.updated_at;",
            params![
                update.user_id.0,
                update.x,
                update.y,
                update.hidden,
                update.job,
                update.job_grade,
                update.color,
                to_millis(update.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Returns whether a location row existed.
    pub fn remove_location(&self, user_id: UserId) -> DbResult<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM user_locations WHERE user_id = ?1;", [user_id.0])?;
        Ok(changed > 0)
    }

    /// `None` clears the assignment.
    pub fn set_unit(&self, user_id: UserId, unit_id: Option<UnitId>, at: DateTime<Utc>) -> DbResult<()> {
        let conn = self.conn();
        match unit_id {
            Some(unit_id) => conn.execute(
                "INSERT INTO unit_users (user_id, unit_id, assigned_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                    unit_id = excluded.unit_id,
                    assigned_at = excluded.assigned_at;",
                params![user_id.0, unit_id.0 as i64, to_millis(at)],
            )?,
            None => conn.execute("DELETE FROM unit_users WHERE user_id = ?1;", [user_id.0])?,
        };
        Ok(())
    }

    fn query_locations(&self, jobs: &[String], since: DateTime<Utc>) -> DbResult<Vec<LocationRecord>> {
        let mut sql = format!("{LOCATION_SELECT_SQL} WHERE l.updated_at >= ?");
        let mut values = vec![Value::Integer(to_millis(since))];
        if !jobs.is_empty() {
            sql.push_str(&format!(
                " AND COALESCE(l.job, u.job) IN ({})",
                placeholders(jobs.len())
            ));
            values.extend(jobs.iter().cloned().map(Value::Text));
        }
        sql.push_str(" ORDER BY l.user_id;");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), LocationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(LocationRow::into_record).collect()
    }

    fn query_markers(&self, jobs: &[String], expired_since: DateTime<Utc>) -> DbResult<Vec<Marker>> {
        let mut sql = format!(
            "{MARKER_SELECT_SQL} WHERE deleted_at IS NULL AND (expires_at IS NULL OR expires_at >= ?)"
        );
        let mut values = vec![Value::Integer(to_millis(expired_since))];
        if !jobs.is_empty() {
            sql.push_str(&format!(" AND job IN ({})", placeholders(jobs.len())));
            values.extend(jobs.iter().cloned().map(Value::Text));
        }
        sql.push_str(" ORDER BY id;");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), MarkerRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(MarkerRow::into_marker).collect()
    }

    fn fetch_marker(conn: &Connection, id: MarkerId) -> DbResult<Option<Marker>> {
        let row = conn
            .query_row(
                &format!("{MARKER_SELECT_SQL} WHERE id = ?1;"),
                [id.0 as i64],
                MarkerRow::from_row,
            )
            .optional()?;
        row.map(MarkerRow::into_marker).transpose()
    }

    fn insert_marker(&self, marker: &Marker) -> DbResult<Marker> {
        let conn = self.conn();
        let creator = marker.creator.as_ref();
        conn.execute(
            "INSERT INTO markers (
                job, x, y, name, description, color, data,
                creator_id, creator_job, creator_grade,
                created_at, updated_at, expires_at, deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14);",
            params![
                marker.job,
                marker.x,
                marker.y,
                marker.name,
                marker.description,
                marker.color,
                serde_json::to_string(&marker.data)?,
                creator.map(|c| c.user_id.0),
                creator.map(|c| c.job.as_str()),
                creator.map(|c| c.job_grade),
                to_millis(marker.created_at),
                to_millis(marker.updated_at),
                marker.expires_at.map(to_millis),
                marker.deleted_at.map(to_millis),
            ],
        )?;
        let id = MarkerId(conn.last_insert_rowid() as u64);
        Self::fetch_marker(&conn, id)?
            .ok_or_else(|| DbError::InvalidData(format!("marker {id} vanished after insert")))
    }

    fn overwrite_marker(&self, marker: &Marker) -> DbResult<Option<Marker>> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE markers SET
                job = ?1, x = ?2, y = ?3, name = ?4, description = ?5, color = ?6,
                data = ?7, updated_at = ?8, expires_at = ?9
             WHERE id = ?10;",
            params![
                marker.job,
                marker.x,
                marker.y,
                marker.name,
                marker.description,
                marker.color,
                serde_json::to_string(&marker.data)?,
                to_millis(marker.updated_at),
                marker.expires_at.map(to_millis),
                marker.id.0 as i64,
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Self::fetch_marker(&conn, marker.id)
    }

    fn mark_deleted(&self, id: MarkerId, at: DateTime<Utc>) -> DbResult<Option<Marker>> {
        let conn = self.conn();
        conn.execute(
            "UPDATE markers SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL;",
            params![to_millis(at), id.0 as i64],
        )?;
        Self::fetch_marker(&conn, id)
    }

    fn query_unit(&self, user_id: UserId) -> DbResult<Option<UnitId>> {
        let unit = self
            .conn()
            .query_row(
                "SELECT unit_id FROM unit_users WHERE user_id = ?1;",
                [user_id.0],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(unit.map(|id| UnitId(id as u64)))
    }

    fn query_units(&self, user_ids: &[UserId]) -> DbResult<BTreeMap<UserId, Option<UnitId>>> {
        let mut units: BTreeMap<UserId, Option<UnitId>> =
            user_ids.iter().map(|&id| (id, None)).collect();
        if user_ids.is_empty() {
            return Ok(units);
        }
        let sql = format!(
            "SELECT user_id, unit_id FROM unit_users WHERE user_id IN ({});",
            placeholders(user_ids.len())
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(user_ids.iter().map(|id| id.0)), |row| {
                Ok((row.get::<_, i32>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (user_id, unit_id) in rows {
            units.insert(UserId(user_id), Some(UnitId(unit_id as u64)));
        }
        Ok(units)
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

impl LocationSource for Database {
    fn active_locations(
        &self,
        jobs: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<LocationRecord>, SourceError> {
        Ok(self.query_locations(jobs, since)?)
    }
}

impl UnitDirectory for Database {
    fn unit_for_user(&self, user_id: UserId) -> Result<Option<UnitId>, SourceError> {
        Ok(self.query_unit(user_id)?)
    }

    fn units_for_users(
        &self,
        user_ids: &[UserId],
    ) -> Result<BTreeMap<UserId, Option<UnitId>>, SourceError> {
        Ok(self.query_units(user_ids)?)
    }
}

impl MarkerRepository for Database {
    fn list_markers(
        &self,
        jobs: &[String],
        expired_since: DateTime<Utc>,
    ) -> Result<Vec<Marker>, SourceError> {
        Ok(self.query_markers(jobs, expired_since)?)
    }

    fn get_marker(&self, id: MarkerId) -> Result<Option<Marker>, SourceError> {
        Ok(Self::fetch_marker(&self.conn(), id)?)
    }

    fn create_marker(&self, marker: &Marker) -> Result<Marker, SourceError> {
        Ok(self.insert_marker(marker)?)
    }

    fn update_marker(&self, marker: &Marker) -> Result<Marker, SourceError> {
        self.overwrite_marker(marker)?
            .ok_or_else(|| SourceError::NotFound {
                entity: "marker",
                id: marker.id.to_string(),
            })
    }

    fn soft_delete_marker(
        &self,
        id: MarkerId,
        at: DateTime<Utc>,
    ) -> Result<Option<Marker>, SourceError> {
        Ok(self.mark_deleted(id, at)?)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct LocationRow {
    user_id: i32,
    x: f64,
    y: f64,
    updated_at: i64,
    hidden: bool,
    profile_job: String,
    profile_grade: i32,
    override_job: Option<String>,
    override_grade: Option<i32>,
    name: String,
    job_label: Option<String>,
    grade_label: Option<String>,
    color: Option<String>,
}

impl LocationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            x: row.get(1)?,
            y: row.get(2)?,
            updated_at: row.get(3)?,
            hidden: row.get(4)?,
            profile_job: row.get(5)?,
            profile_grade: row.get(6)?,
            override_job: row.get(7)?,
            override_grade: row.get(8)?,
            name: row.get(9)?,
            job_label: row.get(10)?,
            grade_label: row.get(11)?,
            color: row.get(12)?,
        })
    }

    fn into_record(self) -> DbResult<LocationRecord> {
        Ok(LocationRecord {
            user_id: UserId(self.user_id),
            x: self.x,
            y: self.y,
            updated_at: from_millis(self.updated_at)?,
            hidden: self.hidden,
            profile_job: self.profile_job,
            profile_grade: self.profile_grade,
            override_job: self.override_job,
            override_grade: self.override_grade,
            name: Some(self.name).filter(|n| !n.is_empty()),
            job_label: self.job_label,
            grade_label: self.grade_label,
            color: self.color,
        })
    }
}

struct MarkerRow {
    id: i64,
    job: String,
    x: f64,
    y: f64,
    name: String,
    description: Option<String>,
    color: String,
    data: String,
    creator_id: Option<i32>,
    creator_job: Option<String>,
    creator_grade: Option<i32>,
    created_at: i64,
    updated_at: i64,
    expires_at: Option<i64>,
    deleted_at: Option<i64>,
}

impl MarkerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job: row.get(1)?,
            x: row.get(2)?,
            y: row.get(3)?,
            name: row.get(4)?,
            description: row.get(5)?,
            color: row.get(6)?,
            data: row.get(7)?,
            creator_id: row.get(8)?,
            creator_job: row.get(9)?,
            creator_grade: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
            expires_at: row.get(13)?,
            deleted_at: row.get(14)?,
        })
    }

    fn into_marker(self) -> DbResult<Marker> {
        let data: MarkerData = serde_json::from_str(&self.data)
            .map_err(|e| DbError::InvalidData(format!("marker {} payload: {e}", self.id)))?;
        let creator = match (self.creator_id, self.creator_job) {
            (Some(user_id), Some(job)) => Some(MarkerCreator {
                user_id: UserId(user_id),
                job,
                job_grade: self.creator_grade.unwrap_or_default(),
            }),
            _ => None,
        };
        Ok(Marker {
            id: MarkerId(self.id as u64),
            job: self.job,
            x: self.x,
            y: self.y,
            name: self.name,
            description: self.description,
            color: self.color,
            data,
            creator,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
            expires_at: self.expires_at.map(from_millis).transpose()?,
            deleted_at: self.deleted_at.map(from_millis).transpose()?,
        })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DbResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DbError::InvalidData(format!("timestamp {ms} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_match_count() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }

    #[test]
    fn millis_roundtrip_keeps_precision() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(from_millis(to_millis(at)).unwrap(), at);
    }
}
