//! Session & game catalog adapter.
//!
//! The catalog is an external document database holding two collections:
//! `recording-sessions` and `basketball-games`. Every timestamp written by
//! this adapter is UTC ISO-8601 with a trailing `Z`; reads that carry
//! local-time strings are rejected rather than interpreted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courtside_types::{Angle, GameDoc, ProcessedGame, SegmentSession, SessionDoc, SessionStatus};

pub mod firestore;

pub use firestore::{CatalogCredentials, FirestoreCatalog};

pub const RECORDING_SESSIONS: &str = "recording-sessions";
pub const BASKETBALL_GAMES: &str = "basketball-games";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("http error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },
    #[error("catalog returned {status} for {context}")]
    RequestFailed {
        context: String,
        status: reqwest::StatusCode,
    },
    #[error("malformed catalog document: {0}")]
    BadDocument(String),
    #[error("{source}")]
    BadTimestamp {
        #[from]
        source: courtside_types::Error,
    },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http { source } => source.is_timeout() || source.is_connect(),
            Error::RequestFailed { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

/// CRUD surface over the two collections. One production implementation
/// exists ([FirestoreCatalog]); tests run against in-memory fakes.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Write the initial session document (state `recording`, open-ended).
    /// The angle parameter makes an out-of-vocabulary angle unrepresentable.
    async fn create_session(
        &self,
        device_id: &str,
        camera_name: &str,
        angle: Angle,
        segment_session: &SegmentSession,
        interface_id: &str,
    ) -> Result<String>;

    /// Transition to `stopped` with the drain totals.
    async fn finalize_session(
        &self,
        session_id: &str,
        ended_at: DateTime<Utc>,
        total_chapters: u32,
        total_bytes: u64,
    ) -> Result<()>;

    async fn update_session_state(&self, session_id: &str, status: SessionStatus) -> Result<()>;

    /// Set the ingest prefix; idempotent, the prefix is set at most once.
    async fn set_session_s3_prefix(&self, session_id: &str, prefix: &str) -> Result<()>;

    /// Array-union append; a game already present is not duplicated.
    async fn append_processed_game(&self, session_id: &str, game: &ProcessedGame) -> Result<()>;

    /// Sessions with state `stopped`, no ingest prefix, and chapters.
    async fn pending_upload(&self, device_id: &str) -> Result<Vec<SessionDoc>>;

    async fn recent_sessions(&self, device_id: &str, limit: u32) -> Result<Vec<SessionDoc>>;

    async fn find_session_by_segment(
        &self,
        segment_session: &SegmentSession,
    ) -> Result<Option<SessionDoc>>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionDoc>>;

    /// Games overlapping `[start, end]`; unended games are open-ended.
    async fn games_in_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<GameDoc>>;

    async fn get_game(&self, game_id: &str) -> Result<Option<GameDoc>>;

    async fn list_games(&self, limit: u32) -> Result<Vec<GameDoc>>;

    /// Ended games not yet carrying a registry id.
    async fn games_for_sync(&self, limit: u32) -> Result<Vec<GameDoc>>;

    async fn mark_game_synced(&self, game_id: &str, registry_game_id: &str) -> Result<()>;
}

/// Client-side part of the pending-upload predicate; the server query can
/// only express the status match.
pub fn is_pending_upload(session: &SessionDoc) -> bool {
    session.status == SessionStatus::Stopped
        && session.s3_prefix.is_none()
        && session.total_chapters > 0
}

/// Client-side part of the sync predicate.
pub fn is_ready_for_sync(game: &GameDoc) -> bool {
    game.ended_at.is_some() && game.registry_game_id.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtside_types::SegmentSession;

    fn session(status: SessionStatus, prefix: Option<&str>, chapters: u32) -> SessionDoc {
        SessionDoc {
            id: "s1".into(),
            jetson_id: "jetson-1".into(),
            camera_name: "GoPro FL".into(),
            angle_code: "FL".into(),
            started_at: "2026-01-20T19:50:30.000Z".into(),
            ended_at: Some("2026-01-20T21:00:00.000Z".into()),
            segment_session: SegmentSession::from_raw("enx_FL_20260120_195030"),
            interface_id: "enx".into(),
            total_chapters: chapters,
            total_size_bytes: 0,
            status,
            processed_games: vec![],
            s3_prefix: prefix.map(str::to_string),
        }
    }

    #[test]
    fn pending_upload_predicate() {
        assert!(is_pending_upload(&session(SessionStatus::Stopped, None, 3)));
        // already ingested
        assert!(!is_pending_upload(&session(
            SessionStatus::Stopped,
            Some("raw-chapters/x/"),
            3
        )));
        // still recording
        assert!(!is_pending_upload(&session(SessionStatus::Recording, None, 3)));
        // nothing to upload
        assert!(!is_pending_upload(&session(SessionStatus::Stopped, None, 0)));
    }

    #[test]
    fn sync_predicate() {
        let mut game = GameDoc {
            id: "g".into(),
            created_at: "2026-01-20T19:55:30.000Z".into(),
            ended_at: Some("2026-01-20T20:15:30.000Z".into()),
            left_team: None,
            right_team: None,
            registry_game_id: None,
        };
        assert!(is_ready_for_sync(&game));
        game.registry_game_id = Some("r1".into());
        assert!(!is_ready_for_sync(&game));
        game.registry_game_id = None;
        game.ended_at = None;
        assert!(!is_ready_for_sync(&game));
    }
}
