//! Clip planner: maps a game's `[start, end]` window and a session's ordered
//! chapter list onto the chapter subset, intra-chapter offset and duration
//! the remote encoder needs.
//!
//! Chapter durations may be unknown (power loss, unprobed uploads); the
//! planner substitutes a conservative default that only influences which
//! chapters are candidates. The remote encoder re-seeks accurately, so an
//! over-wide chapter subset costs bandwidth, never correctness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courtside_types::Angle;

/// Substitute duration for a chapter whose real duration is unknown.
pub const DEFAULT_CHAPTER_DURATION: f64 = 900.0;

/// Symmetric slack added around a clip to absorb clock skew between the
/// catalog and the cameras.
pub const CLIP_BUFFER_SECONDS: f64 = 30.0;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("no chapters to plan over")]
    NoChapters,
    #[error("game window has non-positive duration")]
    EmptyWindow,
    #[error("game window does not intersect the recording")]
    NoOverlap,
}

/// One chapter as the planner sees it: already ingested, object key known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedChapter {
    pub s3_key: String,
    pub size_bytes: u64,
    /// Seconds, when probed; `None` falls back to the default.
    pub duration_seconds: Option<f64>,
}

impl PlannedChapter {
    fn effective_duration(&self) -> f64 {
        match self.duration_seconds {
            Some(d) if d > 0.0 => d,
            _ => DEFAULT_CHAPTER_DURATION,
        }
    }
}

/// The extraction parameters for one game on one angle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipPlan {
    /// Chapter subset intersecting the game window, in recording order.
    pub chapters: Vec<PlannedChapter>,
    /// Seconds from recording start to game start, floored at zero.
    pub offset_in_recording: f64,
    /// Recording-time position where the first needed chapter starts.
    pub cursor0: f64,
    /// Seek position relative to the first needed chapter; never negative.
    pub relative_offset: f64,
    /// Clip duration in seconds, without buffer.
    pub duration: f64,
    /// Total bytes of the chapter subset, for encode queue selection.
    pub total_input_bytes: u64,
}

/// Compute the clip plan for a game against one session's chapters.
pub fn plan_clip(
    game_start: DateTime<Utc>,
    game_end: DateTime<Utc>,
    rec_start: DateTime<Utc>,
    chapters: &[PlannedChapter],
) -> Result<ClipPlan> {
    if chapters.is_empty() {
        return Err(Error::NoChapters);
    }
    let raw_duration = (game_end - game_start).num_milliseconds() as f64 / 1000.0;
    if raw_duration <= 0.0 {
        return Err(Error::EmptyWindow);
    }

    // A game that started before the recording is clipped to the recording
    // start; its duration is unchanged.
    let offset_in_recording =
        ((game_start - rec_start).num_milliseconds() as f64 / 1000.0).max(0.0);
    let window_start = offset_in_recording;
    let window_end = offset_in_recording + raw_duration;

    let mut cursor = 0.0f64;
    let mut cursor0 = None;
    let mut subset = Vec::new();
    for chapter in chapters {
        let chapter_end = cursor + chapter.effective_duration();
        // half-open [cursor, chapter_end) against [window_start, window_end)
        if cursor < window_end && chapter_end > window_start {
            if cursor0.is_none() {
                cursor0 = Some(cursor);
            }
            subset.push(chapter.clone());
        }
        cursor = chapter_end;
    }

    let cursor0 = cursor0.ok_or(Error::NoOverlap)?;
    let relative_offset = (offset_in_recording - cursor0).max(0.0);
    let total_input_bytes = subset.iter().map(|c| c.size_bytes).sum();

    Ok(ClipPlan {
        chapters: subset,
        offset_in_recording,
        cursor0,
        relative_offset,
        duration: raw_duration,
        total_input_bytes,
    })
}

/// Apply the symmetric clip buffer: offset floored at zero, duration widened
/// by twice the buffer. The remote extractor receives the buffer separately
/// and applies it there; this helper exists for the single-file path where
/// buffering happens before submission.
pub fn apply_buffer(offset: f64, duration: f64, buffer: f64) -> (f64, f64) {
    ((offset - buffer).max(0.0), duration + 2.0 * buffer)
}

// ---------------------------
// deliverable keys

/// Shorten a registry game id to its first four hyphen-delimited segments;
/// long enough to stay unique in practice, short enough for object paths.
pub fn game_folder(registry_game_id: &str) -> String {
    registry_game_id
        .split('-')
        .take(4)
        .collect::<Vec<_>>()
        .join("-")
}

/// `{date}_{gameFolder}_{ANGLE}.mp4`
pub fn deliverable_filename(date: &str, registry_game_id: &str, angle: Angle) -> String {
    format!("{date}_{}_{angle}.mp4", game_folder(registry_game_id))
}

/// `{court}/{date}/{gameFolder}/{date}_{gameFolder}_{ANGLE}.mp4`
pub fn deliverable_key(court: &str, date: &str, registry_game_id: &str, angle: Angle) -> String {
    let folder = game_folder(registry_game_id);
    format!(
        "{court}/{date}/{folder}/{}",
        deliverable_filename(date, registry_game_id, angle)
    )
}

/// The raw 4K variant, used for ordered enqueuing ahead of remote encode.
pub fn raw_4k_key(court: &str, date: &str, registry_game_id: &str, angle: Angle) -> String {
    format!("raw/{}", deliverable_key(court, date, registry_game_id, angle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtside_types::parse_utc;

    fn chapter(key: &str, size: u64, duration: Option<f64>) -> PlannedChapter {
        PlannedChapter {
            s3_key: key.to_string(),
            size_bytes: size,
            duration_seconds: duration,
        }
    }

    #[test]
    fn single_chapter_simple_extract() {
        // One 10.2 GB chapter with unknown duration; game starts five
        // minutes into the recording and runs twenty minutes.
        let rec_start = parse_utc("2026-01-20T19:50:30.000Z").unwrap();
        let game_start = parse_utc("2026-01-20T19:55:30.000Z").unwrap();
        let game_end = parse_utc("2026-01-20T20:15:30.000Z").unwrap();
        let chapters = vec![chapter(
            "raw-chapters/enxd43260ddac87_FL_20260120_195030/chapter_001_GX018471.MP4",
            10_208_434_006,
            None,
        )];

        let plan = plan_clip(game_start, game_end, rec_start, &chapters).unwrap();
        assert_eq!(plan.offset_in_recording, 300.0);
        assert_eq!(plan.duration, 1200.0);
        assert_eq!(plan.chapters.len(), 1);
        assert_eq!(plan.cursor0, 0.0);
        assert_eq!(plan.relative_offset, 300.0);
        assert_eq!(plan.total_input_bytes, 10_208_434_006);
    }

    #[test]
    fn game_straddling_two_chapters() {
        // Three 35-minute chapters; the game crosses the first boundary.
        let rec_start = parse_utc("2026-01-20T19:50:30.000Z").unwrap();
        let game_start = parse_utc("2026-01-20T20:15:30.000Z").unwrap();
        let game_end = parse_utc("2026-01-20T20:45:30.000Z").unwrap();
        let chapters = vec![
            chapter("c1", 1, Some(2100.0)),
            chapter("c2", 2, Some(2100.0)),
            chapter("c3", 4, Some(2100.0)),
        ];

        let plan = plan_clip(game_start, game_end, rec_start, &chapters).unwrap();
        assert_eq!(plan.offset_in_recording, 1500.0);
        assert_eq!(plan.duration, 1800.0);
        assert_eq!(plan.cursor0, 0.0);
        assert_eq!(plan.relative_offset, 1500.0);
        let keys: Vec<_> = plan.chapters.iter().map(|c| c.s3_key.as_str()).collect();
        assert_eq!(keys, vec!["c1", "c2"]);
        assert_eq!(plan.total_input_bytes, 3);
    }

    #[test]
    fn game_preceding_recording_clips_offset_only() {
        let rec_start = parse_utc("2026-01-20T20:00:00.000Z").unwrap();
        let game_start = parse_utc("2026-01-20T19:50:00.000Z").unwrap();
        let game_end = parse_utc("2026-01-20T20:20:00.000Z").unwrap();
        let chapters = vec![chapter("c1", 1, Some(2100.0))];

        let plan = plan_clip(game_start, game_end, rec_start, &chapters).unwrap();
        assert_eq!(plan.offset_in_recording, 0.0);
        // duration is unchanged by the clip
        assert_eq!(plan.duration, 1800.0);
        assert_eq!(plan.relative_offset, 0.0);
    }

    #[test]
    fn later_game_skips_leading_chapters() {
        let rec_start = parse_utc("2026-01-20T19:00:00.000Z").unwrap();
        let game_start = parse_utc("2026-01-20T20:00:00.000Z").unwrap();
        let game_end = parse_utc("2026-01-20T20:10:00.000Z").unwrap();
        // chapters of 1800 s: the game sits entirely inside the third
        let chapters = vec![
            chapter("c1", 1, Some(1800.0)),
            chapter("c2", 2, Some(1800.0)),
            chapter("c3", 4, Some(1800.0)),
        ];

        let plan = plan_clip(game_start, game_end, rec_start, &chapters).unwrap();
        assert_eq!(plan.cursor0, 3600.0);
        assert_eq!(plan.offset_in_recording, 3600.0);
        assert_eq!(plan.relative_offset, 0.0);
        let keys: Vec<_> = plan.chapters.iter().map(|c| c.s3_key.as_str()).collect();
        assert_eq!(keys, vec!["c3"]);
    }

    #[test]
    fn unknown_duration_defaults_for_inclusion_only() {
        let rec_start = parse_utc("2026-01-20T19:00:00.000Z").unwrap();
        let game_start = parse_utc("2026-01-20T19:20:00.000Z").unwrap();
        let game_end = parse_utc("2026-01-20T19:30:00.000Z").unwrap();
        // unknown duration -> 900 s default, so the game at 1200 s falls in
        // the second chapter
        let chapters = vec![chapter("c1", 1, None), chapter("c2", 2, Some(0.0))];

        let plan = plan_clip(game_start, game_end, rec_start, &chapters).unwrap();
        assert_eq!(plan.cursor0, 900.0);
        assert_eq!(plan.relative_offset, 300.0);
        assert_eq!(plan.chapters.len(), 1);
        assert_eq!(plan.chapters[0].s3_key, "c2");
    }

    #[test]
    fn window_outside_recording_has_no_overlap() {
        let rec_start = parse_utc("2026-01-20T19:00:00.000Z").unwrap();
        let game_start = parse_utc("2026-01-20T23:00:00.000Z").unwrap();
        let game_end = parse_utc("2026-01-20T23:30:00.000Z").unwrap();
        let chapters = vec![chapter("c1", 1, Some(1800.0))];
        assert_eq!(
            plan_clip(game_start, game_end, rec_start, &chapters),
            Err(Error::NoOverlap)
        );
    }

    #[test]
    fn degenerate_inputs_are_rejected() {
        let t0 = parse_utc("2026-01-20T19:00:00.000Z").unwrap();
        let t1 = parse_utc("2026-01-20T19:30:00.000Z").unwrap();
        assert_eq!(plan_clip(t0, t1, t0, &[]), Err(Error::NoChapters));
        let chapters = vec![chapter("c1", 1, None)];
        assert_eq!(plan_clip(t1, t0, t0, &chapters), Err(Error::EmptyWindow));
        assert_eq!(plan_clip(t0, t0, t0, &chapters), Err(Error::EmptyWindow));
    }

    #[test]
    fn buffer_floors_offset_and_widens_duration() {
        assert_eq!(apply_buffer(300.0, 1200.0, 30.0), (270.0, 1260.0));
        assert_eq!(apply_buffer(10.0, 1200.0, 30.0), (0.0, 1260.0));
    }

    #[test]
    fn deliverable_keys_follow_the_layout() {
        let id = "95efaeaa-8475-4db4-8967-0aa1b2c3d4e5";
        assert_eq!(game_folder(id), "95efaeaa-8475-4db4-8967");
        assert_eq!(
            deliverable_key("court-a", "2026-01-20", id, Angle::FL),
            "court-a/2026-01-20/95efaeaa-8475-4db4-8967/2026-01-20_95efaeaa-8475-4db4-8967_FL.mp4"
        );
        assert_eq!(
            raw_4k_key("court-a", "2026-01-20", id, Angle::NL),
            "raw/court-a/2026-01-20/95efaeaa-8475-4db4-8967/2026-01-20_95efaeaa-8475-4db4-8967_NL.mp4"
        );
    }
}
