//! Durable attempt records backed by SQLite.
//!
//! All mutations are single conditional statements (or one transaction)
//! executed while holding the connection mutex, so concurrent callers for the
//! same key can never push a stage counter past its ceiling or revive a
//! finalized record. Every recorded artifact also gets a versioned row in the
//! `assets` catalog.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use thiserror::Error;

use super::record::{
    AssetRecord, AttemptRecord, CreativeKey, CreativeKind, Stage, StageCounts, normalize_subject,
};
use super::segment::Segment;

const CURRENT_SCHEMA_VERSION: i32 = 2;

const RECORD_COLUMNS: &str = "subject, campaign, prompt, kind, image_path, audio_path, video_path, \
     sync_map, image_attempts, audio_attempts, video_attempts, total_attempts, is_final, \
     finalized_at, created_at";

const ASSET_COLUMNS: &str = "id, subject, campaign, stage, reference, prompt, version, created_at";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no attempt recorded for {subject}/{campaign}")]
    NotFound { subject: String, campaign: String },

    #[error("creative '{campaign}' is already finalized")]
    AlreadyFinalized { campaign: String },

    #[error("{stage} limit of {max} reached ({used} used)")]
    QuotaExceeded { stage: Stage, used: u32, max: u32 },

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare ledger location: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger connection poisoned")]
    Poisoned,
}

/// Result of a finalize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized { finalized_at: DateTime<Utc> },
    /// Already final; nothing was changed.
    AlreadyFinal { finalized_at: Option<DateTime<Utc>> },
}

/// A stage result to record against an attempt.
#[derive(Debug, Clone, Copy)]
pub enum StageArtifact<'a> {
    Image(&'a str),
    Voice(&'a str),
    /// The composed video together with the inputs it was built from.
    Video {
        video: &'a str,
        image: &'a str,
        audio: &'a str,
        sync_map: &'a [Segment],
    },
}

impl StageArtifact<'_> {
    pub fn stage(&self) -> Stage {
        match self {
            StageArtifact::Image(_) => Stage::Image,
            StageArtifact::Voice(_) => Stage::Voice,
            StageArtifact::Video { .. } => Stage::Video,
        }
    }

    /// The artifact this stage produced.
    pub fn reference(&self) -> &str {
        match self {
            StageArtifact::Image(reference) | StageArtifact::Voice(reference) => reference,
            StageArtifact::Video { video, .. } => video,
        }
    }
}

/// Filters for [`AttemptLedger::assets`]. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetQuery {
    pub subject: Option<String>,
    pub stage: Option<Stage>,
    pub campaign: Option<String>,
    /// Case-insensitive substring of the prompt.
    pub search: Option<String>,
    pub page: u32,
    pub limit: u32,
}

impl Default for AssetQuery {
    fn default() -> Self {
        Self {
            subject: None,
            stage: None,
            campaign: None,
            search: None,
            page: 1,
            limit: 10,
        }
    }
}

/// One page of catalog rows, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPage {
    pub assets: Vec<AssetRecord>,
    pub total: u64,
    pub page: u32,
    pub pages: u64,
}

#[derive(Clone)]
pub struct AttemptLedger {
    conn: Arc<Mutex<Connection>>,
}

impl AttemptLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL,
                updated TEXT NOT NULL,
                PRIMARY KEY (version)
            )",
            (),
        )?;

        let version: i32 = conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        if version < CURRENT_SCHEMA_VERSION {
            Self::migrate_schema(conn, version)?;
        }

        Ok(())
    }

    fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), LedgerError> {
        if from_version < 1 {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS attempts (
                    subject TEXT NOT NULL,
                    campaign TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    image_path TEXT,
                    audio_path TEXT,
                    video_path TEXT,
                    sync_map TEXT NOT NULL DEFAULT '[]',
                    image_attempts INTEGER NOT NULL DEFAULT 0,
                    audio_attempts INTEGER NOT NULL DEFAULT 0,
                    video_attempts INTEGER NOT NULL DEFAULT 0,
                    total_attempts INTEGER NOT NULL DEFAULT 1,
                    is_final INTEGER NOT NULL DEFAULT 0,
                    finalized_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (subject, campaign)
                )",
                (),
            )?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, updated) VALUES (1, datetime('now'))",
                [],
            )?;
        }
        if from_version < 2 {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS assets (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    subject TEXT NOT NULL,
                    campaign TEXT NOT NULL,
                    stage TEXT NOT NULL,
                    reference TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE (subject, campaign, stage, version)
                )",
                (),
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_assets_created ON assets (created_at DESC)",
                (),
            )?;
            // Records written before the catalog existed keep their latest artifact.
            for (stage, path, counter) in [
                (Stage::Image, "image_path", "image_attempts"),
                (Stage::Voice, "audio_path", "audio_attempts"),
                (Stage::Video, "video_path", "video_attempts"),
            ] {
                conn.execute(
                    &format!(
                        "INSERT OR IGNORE INTO assets
                            (subject, campaign, stage, reference, prompt, version, created_at)
                         SELECT subject, campaign, ?1, {path}, prompt, MAX({counter}, 1), updated_at
                         FROM attempts WHERE {path} IS NOT NULL"
                    ),
                    params![stage.as_str()],
                )?;
            }
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, updated) VALUES (2, datetime('now'))",
                [],
            )?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::Poisoned)
    }

    /// Returns the record for `key`, creating it seeded with `prompt` and
    /// `kind` when absent. Never creates duplicates.
    pub fn load_or_create(
        &self,
        key: &CreativeKey,
        prompt: &str,
        kind: CreativeKind,
    ) -> Result<AttemptRecord, LedgerError> {
        let conn = self.lock()?;
        let now = timestamp(Utc::now());
        conn.execute(
            "INSERT INTO attempts (subject, campaign, prompt, kind, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(subject, campaign) DO NOTHING",
            params![key.subject(), key.campaign(), prompt, kind.as_str(), now],
        )?;
        fetch(&conn, key)?.ok_or_else(|| not_found(key))
    }

    /// Like [`Self::load_or_create`], but counts a new attempt on an existing
    /// record. Fails with `AlreadyFinalized` for a final record.
    pub fn begin_attempt(
        &self,
        key: &CreativeKey,
        prompt: &str,
        kind: CreativeKind,
    ) -> Result<AttemptRecord, LedgerError> {
        let conn = self.lock()?;
        let now = timestamp(Utc::now());
        conn.execute(
            "INSERT INTO attempts (subject, campaign, prompt, kind, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(subject, campaign) DO UPDATE SET
                total_attempts = total_attempts + 1,
                updated_at = excluded.updated_at
             WHERE is_final = 0",
            params![key.subject(), key.campaign(), prompt, kind.as_str(), now],
        )?;
        let record = fetch(&conn, key)?.ok_or_else(|| not_found(key))?;
        if record.is_final {
            return Err(LedgerError::AlreadyFinalized {
                campaign: record.campaign,
            });
        }
        Ok(record)
    }

    pub fn get(&self, key: &CreativeKey) -> Result<Option<AttemptRecord>, LedgerError> {
        let conn = self.lock()?;
        fetch(&conn, key)
    }

    /// Sets the stage's artifact reference and bumps its counter in one
    /// conditional update, and catalogs the artifact under the new counter
    /// value as its version. Rejected when the record is final or when the
    /// counter already reached `max`; a rejection leaves both tables alone.
    pub fn record_stage_success(
        &self,
        key: &CreativeKey,
        artifact: StageArtifact<'_>,
        prompt: &str,
        max: Option<u32>,
    ) -> Result<AttemptRecord, LedgerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = timestamp(Utc::now());
        let max = max.map(i64::from);

        let changed = match artifact {
            StageArtifact::Image(reference) => tx.execute(
                "UPDATE attempts SET image_path = ?1, image_attempts = image_attempts + 1, updated_at = ?2
                 WHERE subject = ?3 AND campaign = ?4 AND is_final = 0
                   AND (?5 IS NULL OR image_attempts < ?5)",
                params![reference, now, key.subject(), key.campaign(), max],
            )?,
            StageArtifact::Voice(reference) => tx.execute(
                "UPDATE attempts SET audio_path = ?1, audio_attempts = audio_attempts + 1, updated_at = ?2
                 WHERE subject = ?3 AND campaign = ?4 AND is_final = 0
                   AND (?5 IS NULL OR audio_attempts < ?5)",
                params![reference, now, key.subject(), key.campaign(), max],
            )?,
            StageArtifact::Video {
                video,
                image,
                audio,
                sync_map,
            } => {
                let sync_map = serde_json::to_string(sync_map)
                    .map_err(|e| LedgerError::Corrupt(format!("unserializable sync map: {e}")))?;
                tx.execute(
                    "UPDATE attempts SET video_path = ?1, image_path = ?2, audio_path = ?3,
                        sync_map = ?4, video_attempts = video_attempts + 1, updated_at = ?5
                     WHERE subject = ?6 AND campaign = ?7 AND is_final = 0
                       AND (?8 IS NULL OR video_attempts < ?8)",
                    params![
                        video,
                        image,
                        audio,
                        sync_map,
                        now,
                        key.subject(),
                        key.campaign(),
                        max
                    ],
                )?
            }
        };

        let record = fetch(&tx, key)?.ok_or_else(|| not_found(key))?;
        let stage = artifact.stage();
        if changed == 1 {
            tx.execute(
                "INSERT INTO assets (subject, campaign, stage, reference, prompt, version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    key.subject(),
                    key.campaign(),
                    stage.as_str(),
                    artifact.reference(),
                    prompt,
                    record.stage_counts.get(stage),
                    now
                ],
            )?;
            tx.commit()?;
            return Ok(record);
        }

        if record.is_final {
            return Err(LedgerError::AlreadyFinalized {
                campaign: record.campaign,
            });
        }
        Err(LedgerError::QuotaExceeded {
            stage,
            used: record.stage_counts.get(stage),
            max: max.unwrap_or_default() as u32,
        })
    }

    /// One-way transition to final. Re-finalizing is reported, not applied.
    pub fn finalize(&self, key: &CreativeKey) -> Result<FinalizeOutcome, LedgerError> {
        let conn = self.lock()?;
        let now = Utc::now();
        let changed = conn.execute(
            "UPDATE attempts SET is_final = 1, finalized_at = ?1, updated_at = ?1
             WHERE subject = ?2 AND campaign = ?3 AND is_final = 0",
            params![timestamp(now), key.subject(), key.campaign()],
        )?;

        let record = fetch(&conn, key)?.ok_or_else(|| not_found(key))?;
        if changed == 1 {
            Ok(FinalizeOutcome::Finalized {
                finalized_at: record.finalized_at.unwrap_or(now),
            })
        } else {
            Ok(FinalizeOutcome::AlreadyFinal {
                finalized_at: record.finalized_at,
            })
        }
    }

    /// All records, newest first, optionally restricted to one subject.
    pub fn list(&self, subject: Option<&str>) -> Result<Vec<AttemptRecord>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM attempts
             WHERE (?1 IS NULL OR subject = ?1)
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![subject], RawRecord::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    /// Newest record whose campaign contains `pattern`, ignoring ASCII case.
    pub fn find_campaign(
        &self,
        pattern: &str,
        subject: Option<&str>,
    ) -> Result<Option<AttemptRecord>, LedgerError> {
        let conn = self.lock()?;
        let like = format!("%{}%", escape_like(pattern));
        conn.query_row(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM attempts
                 WHERE campaign LIKE ?1 ESCAPE '\\' AND (?2 IS NULL OR subject = ?2)
                 ORDER BY created_at DESC, rowid DESC LIMIT 1"
            ),
            params![like, subject],
            RawRecord::from_row,
        )
        .optional()?
        .map(RawRecord::into_record)
        .transpose()
    }

    /// Cataloged artifacts matching `query`, newest first.
    pub fn assets(&self, query: &AssetQuery) -> Result<AssetPage, LedgerError> {
        let conn = self.lock()?;
        let subject = query.subject.as_deref().map(normalize_subject);
        let stage = query.stage.map(Stage::as_str);
        let search = query
            .search
            .as_deref()
            .map(|s| format!("%{}%", escape_like(s)));
        let filter = "(?1 IS NULL OR subject = ?1) AND (?2 IS NULL OR stage = ?2)
             AND (?3 IS NULL OR campaign = ?3) AND (?4 IS NULL OR prompt LIKE ?4 ESCAPE '\\')";

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM assets WHERE {filter}"),
            params![subject, stage, query.campaign, search],
            |row| row.get(0),
        )?;

        let page = query.page.max(1);
        let limit = query.limit.max(1);
        let offset = i64::from(page - 1) * i64::from(limit);
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets WHERE {filter}
             ORDER BY created_at DESC, id DESC LIMIT ?5 OFFSET ?6"
        ))?;
        let rows = stmt.query_map(
            params![subject, stage, query.campaign, search, limit, offset],
            RawAsset::from_row,
        )?;

        let mut assets = Vec::new();
        for row in rows {
            assets.push(row?.into_asset()?);
        }
        let total = u64::try_from(total).unwrap_or(0);
        Ok(AssetPage {
            assets,
            total,
            page,
            pages: total.div_ceil(u64::from(limit)),
        })
    }
}

fn fetch(conn: &Connection, key: &CreativeKey) -> Result<Option<AttemptRecord>, LedgerError> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM attempts WHERE subject = ?1 AND campaign = ?2"),
        params![key.subject(), key.campaign()],
        RawRecord::from_row,
    )
    .optional()?
    .map(RawRecord::into_record)
    .transpose()
}

fn not_found(key: &CreativeKey) -> LedgerError {
    LedgerError::NotFound {
        subject: key.subject().to_string(),
        campaign: key.campaign().to_string(),
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::Corrupt(format!("bad timestamp '{value}': {e}")))
}

fn escape_like(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Column values as stored, converted outside the rusqlite row callback.
struct RawRecord {
    subject: String,
    campaign: String,
    prompt: String,
    kind: String,
    image_path: Option<String>,
    audio_path: Option<String>,
    video_path: Option<String>,
    sync_map: String,
    image_attempts: i64,
    audio_attempts: i64,
    video_attempts: i64,
    total_attempts: i64,
    is_final: bool,
    finalized_at: Option<String>,
    created_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            subject: row.get(0)?,
            campaign: row.get(1)?,
            prompt: row.get(2)?,
            kind: row.get(3)?,
            image_path: row.get(4)?,
            audio_path: row.get(5)?,
            video_path: row.get(6)?,
            sync_map: row.get(7)?,
            image_attempts: row.get(8)?,
            audio_attempts: row.get(9)?,
            video_attempts: row.get(10)?,
            total_attempts: row.get(11)?,
            is_final: row.get(12)?,
            finalized_at: row.get(13)?,
            created_at: row.get(14)?,
        })
    }

    fn into_record(self) -> Result<AttemptRecord, LedgerError> {
        let kind = self.kind.parse::<CreativeKind>().map_err(LedgerError::Corrupt)?;
        let sync_map: Vec<Segment> = serde_json::from_str(&self.sync_map)
            .map_err(|e| LedgerError::Corrupt(format!("bad sync map: {e}")))?;
        let finalized_at = self
            .finalized_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;

        Ok(AttemptRecord {
            subject: self.subject,
            campaign: self.campaign,
            source_prompt: self.prompt,
            kind,
            image_ref: self.image_path,
            audio_ref: self.audio_path,
            video_ref: self.video_path,
            sync_map,
            stage_counts: StageCounts {
                image: count(self.image_attempts),
                audio: count(self.audio_attempts),
                video: count(self.video_attempts),
            },
            total_attempts: count(self.total_attempts),
            is_final: self.is_final,
            finalized_at,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

struct RawAsset {
    id: i64,
    subject: String,
    campaign: String,
    stage: String,
    reference: String,
    prompt: String,
    version: i64,
    created_at: String,
}

impl RawAsset {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subject: row.get(1)?,
            campaign: row.get(2)?,
            stage: row.get(3)?,
            reference: row.get(4)?,
            prompt: row.get(5)?,
            version: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_asset(self) -> Result<AssetRecord, LedgerError> {
        Ok(AssetRecord {
            id: self.id,
            subject: self.subject,
            campaign: self.campaign,
            stage: self.stage.parse::<Stage>().map_err(LedgerError::Corrupt)?,
            reference: self.reference,
            prompt: self.prompt,
            version: count(self.version),
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn count(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creative::segment::build_sync_map;
    use tempfile::tempdir;

    fn key(subject: &str, campaign: &str) -> CreativeKey {
        CreativeKey::new(subject, campaign).unwrap()
    }

    #[test]
    fn load_or_create_is_a_singleton_per_key() {
        let ledger = AttemptLedger::open_in_memory().unwrap();
        let k = key("u1", "promo1");

        let first = ledger.load_or_create(&k, "Great deal.", CreativeKind::Image).unwrap();
        let second = ledger.load_or_create(&k, "Other prompt.", CreativeKind::Voice).unwrap();

        assert_eq!(first, second);
        assert_eq!(second.source_prompt, "Great deal.");
        assert_eq!(second.kind, CreativeKind::Image);
        assert_eq!(second.total_attempts, 1);
        assert_eq!(second.stage_counts, StageCounts::default());
        assert_eq!(ledger.list(None).unwrap().len(), 1);
    }

    #[test]
    fn begin_attempt_counts_touches() {
        let ledger = AttemptLedger::open_in_memory().unwrap();
        let k = key("u1", "promo1");

        assert_eq!(ledger.begin_attempt(&k, "p", CreativeKind::Video).unwrap().total_attempts, 1);
        assert_eq!(ledger.begin_attempt(&k, "p", CreativeKind::Video).unwrap().total_attempts, 2);
        // plain loads do not count
        assert_eq!(ledger.load_or_create(&k, "p", CreativeKind::Video).unwrap().total_attempts, 2);
    }

    #[test]
    fn stage_success_sets_ref_and_counter() {
        let ledger = AttemptLedger::open_in_memory().unwrap();
        let k = key("u1", "promo1");
        ledger.load_or_create(&k, "p", CreativeKind::Video).unwrap();

        let record = ledger
            .record_stage_success(&k, StageArtifact::Image("images/u1/a.png"), "p", Some(3))
            .unwrap();
        assert_eq!(record.image_ref.as_deref(), Some("images/u1/a.png"));
        assert_eq!(record.stage_counts.image, 1);
        assert_eq!(record.stage_counts.audio, 0);

        let record = ledger
            .record_stage_success(&k, StageArtifact::Voice("audio/u1/a.mp3"), "p", Some(3))
            .unwrap();
        assert_eq!(record.audio_ref.as_deref(), Some("audio/u1/a.mp3"));
        assert_eq!(record.stage_counts.audio, 1);
    }

    #[test]
    fn stage_success_respects_ceiling() {
        let ledger = AttemptLedger::open_in_memory().unwrap();
        let k = key("u1", "promo1");
        ledger.load_or_create(&k, "p", CreativeKind::Image).unwrap();

        for _ in 0..2 {
            ledger
                .record_stage_success(&k, StageArtifact::Image("images/u1/a.png"), "p", Some(2))
                .unwrap();
        }
        let err = ledger
            .record_stage_success(&k, StageArtifact::Image("images/u1/b.png"), "p", Some(2))
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::QuotaExceeded {
                stage: Stage::Image,
                used: 2,
                max: 2
            }
        ));
        let record = ledger.get(&k).unwrap().unwrap();
        assert_eq!(record.image_ref.as_deref(), Some("images/u1/a.png"));
    }

    #[test]
    fn video_success_records_inputs_and_sync_map() {
        let ledger = AttemptLedger::open_in_memory().unwrap();
        let k = key("u1", "promo1");
        ledger.load_or_create(&k, "p", CreativeKind::Video).unwrap();
        let sync_map = build_sync_map("Great deal today. Act now!");

        let record = ledger
            .record_stage_success(
                &k,
                StageArtifact::Video {
                    video: "videos/u1/promo1.mp4",
                    image: "images/u1/a.png",
                    audio: "audio/u1/a.mp3",
                    sync_map: &sync_map,
                },
                "Great deal today. Act now!",
                None,
            )
            .unwrap();

        assert_eq!(record.video_ref.as_deref(), Some("videos/u1/promo1.mp4"));
        assert_eq!(record.image_ref.as_deref(), Some("images/u1/a.png"));
        assert_eq!(record.audio_ref.as_deref(), Some("audio/u1/a.mp3"));
        assert_eq!(record.sync_map, sync_map);
        assert_eq!(record.stage_counts.video, 1);
    }

    #[test]
    fn finalize_is_one_way() {
        let ledger = AttemptLedger::open_in_memory().unwrap();
        let k = key("u1", "promo1");
        ledger.load_or_create(&k, "p", CreativeKind::Video).unwrap();

        let FinalizeOutcome::Finalized { finalized_at } = ledger.finalize(&k).unwrap() else {
            panic!("expected first finalize to apply");
        };
        let again = ledger.finalize(&k).unwrap();
        assert_eq!(
            again,
            FinalizeOutcome::AlreadyFinal {
                finalized_at: Some(finalized_at)
            }
        );

        let record = ledger.get(&k).unwrap().unwrap();
        assert!(record.is_final);
        assert_eq!(record.finalized_at, Some(finalized_at));

        let err = ledger
            .record_stage_success(&k, StageArtifact::Image("images/u1/a.png"), "p", Some(3))
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyFinalized { .. }));
        assert!(ledger.get(&k).unwrap().unwrap().image_ref.is_none());

        let err = ledger.begin_attempt(&k, "p", CreativeKind::Video).unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyFinalized { .. }));
        assert_eq!(ledger.get(&k).unwrap().unwrap().total_attempts, 1);
    }

    #[test]
    fn finalize_unknown_key_is_not_found() {
        let ledger = AttemptLedger::open_in_memory().unwrap();
        let err = ledger.finalize(&key("nobody", "nothing")).unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
    }

    #[test]
    fn list_and_find_campaign() {
        let ledger = AttemptLedger::open_in_memory().unwrap();
        ledger.load_or_create(&key("u1", "Spring Promo"), "p", CreativeKind::Video).unwrap();
        ledger.load_or_create(&key("u2", "Summer_Sale"), "p", CreativeKind::Image).unwrap();

        assert_eq!(ledger.list(None).unwrap().len(), 2);
        assert_eq!(ledger.list(Some("u2")).unwrap().len(), 1);

        let found = ledger.find_campaign("spring", None).unwrap().unwrap();
        assert_eq!(found.campaign, "Spring Promo");
        assert!(ledger.find_campaign("spring", Some("u2")).unwrap().is_none());
        // underscore is literal, not a wildcard
        assert!(ledger.find_campaign("g_p", None).unwrap().is_none());
        assert!(ledger.find_campaign("mer_s", None).unwrap().is_some());
    }

    #[test]
    fn every_recorded_artifact_is_cataloged_with_a_version() {
        let ledger = AttemptLedger::open_in_memory().unwrap();
        let k = key("u1", "promo1");
        ledger.load_or_create(&k, "p", CreativeKind::Video).unwrap();

        for (i, prompt) in ["Sunny beach", "Rainy city", "Snowy peak"].iter().enumerate() {
            let reference = format!("images/u1/image_{i}.png");
            ledger
                .record_stage_success(&k, StageArtifact::Image(&reference), prompt, Some(3))
                .unwrap();
        }
        ledger
            .record_stage_success(&k, StageArtifact::Voice("audio/u1/a.mp3"), "Buy now.", Some(3))
            .unwrap();
        // rejected writes add nothing
        ledger
            .record_stage_success(&k, StageArtifact::Image("images/u1/extra.png"), "p", Some(3))
            .unwrap_err();

        let images = ledger
            .assets(&AssetQuery {
                stage: Some(Stage::Image),
                ..AssetQuery::default()
            })
            .unwrap();
        assert_eq!(images.total, 3);
        let versions: Vec<u32> = images.assets.iter().map(|a| a.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
        assert_eq!(images.assets[0].reference, "images/u1/image_2.png");
        assert_eq!(images.assets[0].prompt, "Snowy peak");

        let all = ledger.assets(&AssetQuery::default()).unwrap();
        assert_eq!(all.total, 4);
        assert_eq!(all.assets[0].stage, Stage::Voice);
    }

    #[test]
    fn asset_query_filters_and_pages() {
        let ledger = AttemptLedger::open_in_memory().unwrap();
        for (subject, campaign) in [("u1", "Spring"), ("u1", "Summer"), ("u2", "Spring")] {
            let k = key(subject, campaign);
            ledger.load_or_create(&k, "p", CreativeKind::Image).unwrap();
            for i in 0..3 {
                let reference = format!("images/{subject}/{i}.png");
                let prompt = format!("{campaign} offer {i}");
                ledger
                    .record_stage_success(&k, StageArtifact::Image(&reference), &prompt, None)
                    .unwrap();
            }
        }

        let u1 = ledger
            .assets(&AssetQuery {
                subject: Some(" U1".to_string()),
                ..AssetQuery::default()
            })
            .unwrap();
        assert_eq!(u1.total, 6);

        let spring = ledger
            .assets(&AssetQuery {
                campaign: Some("Spring".to_string()),
                ..AssetQuery::default()
            })
            .unwrap();
        assert_eq!(spring.total, 6);
        assert!(spring.assets.iter().all(|a| a.campaign == "Spring"));

        let searched = ledger
            .assets(&AssetQuery {
                search: Some("SUMMER OFFER 1".to_string()),
                ..AssetQuery::default()
            })
            .unwrap();
        assert_eq!(searched.total, 1);
        assert_eq!(searched.assets[0].reference, "images/u1/1.png");

        let page = ledger
            .assets(&AssetQuery {
                page: 2,
                limit: 4,
                ..AssetQuery::default()
            })
            .unwrap();
        assert_eq!((page.total, page.pages, page.page), (9, 3, 2));
        assert_eq!(page.assets.len(), 4);
        let first_page = ledger
            .assets(&AssetQuery {
                limit: 4,
                ..AssetQuery::default()
            })
            .unwrap();
        assert!(first_page.assets.iter().all(|a| !page.assets.contains(a)));

        let voice = ledger
            .assets(&AssetQuery {
                stage: Some(Stage::Voice),
                ..AssetQuery::default()
            })
            .unwrap();
        assert_eq!((voice.total, voice.pages), (0, 0));
    }

    #[test]
    fn upgrade_catalogs_existing_artifacts() {
        let conn = Connection::open_in_memory().unwrap();
        AttemptLedger::init_schema(&conn).unwrap();
        conn.execute("DROP TABLE assets", []).unwrap();
        conn.execute("DELETE FROM schema_version WHERE version = 2", []).unwrap();
        conn.execute(
            "INSERT INTO attempts (subject, campaign, prompt, kind, image_path, image_attempts,
                created_at, updated_at)
             VALUES ('u1', 'promo1', 'Old prompt', 'image', 'images/u1/old.png', 2,
                '2024-01-01T00:00:00.000Z', '2024-01-02T00:00:00.000Z')",
            [],
        )
        .unwrap();

        let ledger = AttemptLedger::from_connection(conn).unwrap();
        let page = ledger.assets(&AssetQuery::default()).unwrap();
        assert_eq!(page.total, 1);
        let asset = &page.assets[0];
        assert_eq!(asset.reference, "images/u1/old.png");
        assert_eq!((asset.stage, asset.version), (Stage::Image, 2));
        assert_eq!(asset.prompt, "Old prompt");
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        let k = key("u1", "promo1");

        {
            let ledger = AttemptLedger::open(&path).unwrap();
            ledger.load_or_create(&k, "Great deal.", CreativeKind::Video).unwrap();
            ledger
                .record_stage_success(&k, StageArtifact::Image("images/u1/a.png"), "p", Some(3))
                .unwrap();
        }

        let ledger = AttemptLedger::open(&path).unwrap();
        let record = ledger.get(&k).unwrap().unwrap();
        assert_eq!(record.stage_counts.image, 1);
        assert_eq!(record.source_prompt, "Great deal.");
    }
}
