//! Shared types for the courtside edge controller.
//!
//! These types cross crate boundaries: camera angles, on-camera chapter
//! references with their ordering convention, segment-session identifiers,
//! and the catalog document shapes for recording sessions and games.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------
// errors

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unrecognized angle code: {0:?}")]
    UnknownAngle(String),
    #[error("timestamp {value:?} is not UTC ISO-8601: {source}")]
    BadTimestamp {
        value: String,
        source: chrono::ParseError,
    },
    #[error("timestamp {0:?} does not carry a UTC offset")]
    NonUtcTimestamp(String),
    #[error("malformed segment session id: {0:?}")]
    BadSegmentSession(String),
}

// ---------------------------
// angles

/// One camera viewpoint: near/far crossed with left/right.
///
/// This is the only angle vocabulary the system persists. Cameras whose
/// advertised name cannot be mapped onto one of these four are filtered out
/// of pipelines with a log entry (see [AngleMap]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Angle {
    FL,
    FR,
    NL,
    NR,
}

impl Angle {
    pub const ALL: [Angle; 4] = [Angle::FL, Angle::FR, Angle::NL, Angle::NR];

    pub fn as_str(&self) -> &'static str {
        match self {
            Angle::FL => "FL",
            Angle::FR => "FR",
            Angle::NL => "NL",
            Angle::NR => "NR",
        }
    }

    /// The far-side angles are the only ones rendered and registered
    /// downstream.
    pub fn is_registrable(&self) -> bool {
        matches!(self, Angle::FL | Angle::FR)
    }

    /// The video registry uses its own side vocabulary for FL/FR.
    pub fn registry_side(&self) -> Option<RegistrySide> {
        match self {
            Angle::FL => Some(RegistrySide::Left),
            Angle::FR => Some(RegistrySide::Right),
            Angle::NL | Angle::NR => None,
        }
    }
}

impl fmt::Display for Angle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Angle {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FL" => Ok(Angle::FL),
            "FR" => Ok(Angle::FR),
            "NL" => Ok(Angle::NL),
            "NR" => Ok(Angle::NR),
            other => Err(Error::UnknownAngle(other.to_string())),
        }
    }
}

/// Angle vocabulary of the external video registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegistrySide {
    Left,
    Right,
}

impl RegistrySide {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrySide::Left => "LEFT",
            RegistrySide::Right => "RIGHT",
        }
    }
}

/// Operator-supplied dictionary from advertised camera names to angles.
///
/// Lookup tries three rules in order: exact match, case-insensitive match,
/// substring match (either direction). A miss yields `None`, which callers
/// surface as the `UNK` filter value; it is never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AngleMap(pub HashMap<String, Angle>);

impl AngleMap {
    /// Parse the `CAMERA_ANGLE_MAP` JSON object (camera name -> angle code).
    pub fn from_json(s: &str) -> std::result::Result<Self, serde_json::Error> {
        let raw: HashMap<String, String> = serde_json::from_str(s)?;
        let mut map = HashMap::new();
        for (name, code) in raw {
            match code.parse() {
                Ok(angle) => {
                    map.insert(name, angle);
                }
                Err(_) => {
                    // An entry with a bad code is dropped rather than
                    // poisoning the whole map.
                }
            }
        }
        Ok(AngleMap(map))
    }

    pub fn resolve(&self, camera_name: &str) -> Option<Angle> {
        if let Some(angle) = self.0.get(camera_name) {
            return Some(*angle);
        }
        let lower = camera_name.to_lowercase();
        for (key, angle) in &self.0 {
            if key.to_lowercase() == lower {
                return Some(*angle);
            }
        }
        for (key, angle) in &self.0 {
            let key_lower = key.to_lowercase();
            if key_lower.contains(&lower) || lower.contains(&key_lower) {
                return Some(*angle);
            }
        }
        None
    }
}

// ---------------------------
// timestamps

/// Format a timestamp the way every catalog write must: UTC ISO-8601 with a
/// trailing `Z` and millisecond precision.
pub fn format_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a catalog timestamp. Local-time strings without a UTC designator are
/// rejected; the catalog adapter must never interpret them.
pub fn parse_utc(s: &str) -> Result<DateTime<Utc>> {
    if !(s.ends_with('Z') || s.ends_with("+00:00")) {
        return Err(Error::NonUtcTimestamp(s.to_string()));
    }
    let fixed = DateTime::parse_from_rfc3339(s).map_err(|source| Error::BadTimestamp {
        value: s.to_string(),
        source,
    })?;
    Ok(fixed.with_timezone(&Utc))
}

// ---------------------------
// chapters

/// One fragment of a continuous recording, as listed on the camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRef {
    /// On-camera DCIM directory, e.g. `100GOPRO`.
    pub directory: String,
    /// On-camera filename, e.g. `GX010041.MP4`.
    pub filename: String,
    /// Size in bytes as advertised by the camera (0 when unknown).
    pub size_bytes: u64,
}

impl ChapterRef {
    pub fn is_mp4(&self) -> bool {
        self.filename.to_ascii_lowercase().ends_with(".mp4")
    }

    /// Authoritative ordering key following the camera naming convention.
    ///
    /// Filenames look like `GXffrrrr.MP4` where `ff` is the two-digit
    /// per-fragment index and `rrrr` the four-digit per-recording index; the
    /// recording index is the major key. Names outside the pattern sort by
    /// full filename after all patterned names with that prefix length.
    pub fn sort_key(&self) -> (String, String) {
        let upper = self.filename.to_ascii_uppercase();
        let stem = upper.split('.').next().unwrap_or(&upper);
        if stem.len() >= 8 && stem.starts_with('G') {
            let fragment = &stem[2..4];
            let recording = &stem[4..8];
            if fragment.chars().all(|c| c.is_ascii_digit())
                && recording.chars().all(|c| c.is_ascii_digit())
            {
                return (recording.to_string(), fragment.to_string());
            }
        }
        (upper, "00".to_string())
    }
}

/// Sort chapters in recording order, in place.
pub fn sort_chapters(chapters: &mut [ChapterRef]) {
    chapters.sort_by_key(|c| c.sort_key());
}

// ---------------------------
// segment sessions

/// Dense identifier scoping one angle's chapter set in object storage,
/// `{interface}_{angle}_{YYYYMMDD}_{HHMMSS}` (the angle part is omitted when
/// unknown at record time).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentSession(String);

impl SegmentSession {
    pub fn new(interface: &str, angle: Option<Angle>, started: DateTime<Utc>) -> Self {
        let stamp = started.format("%Y%m%d_%H%M%S");
        match angle {
            Some(angle) => SegmentSession(format!("{interface}_{angle}_{stamp}")),
            None => SegmentSession(format!("{interface}_{stamp}")),
        }
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        SegmentSession(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the `YYYYMMDD` date part, if the id carries one.
    pub fn date_part(&self) -> Option<&str> {
        self.0
            .split('_')
            .find(|part| part.len() == 8 && part.starts_with("20") && part.chars().all(|c| c.is_ascii_digit()))
    }
}

impl fmt::Display for SegmentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------
// catalog documents

/// Lifecycle of a recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Recording,
    Stopped,
    Processing,
    Uploaded,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Recording => "recording",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Processing => "processing",
            SessionStatus::Uploaded => "uploaded",
        }
    }
}

/// A game already cut from this session and placed in object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedGame {
    pub game_id: String,
    pub game_number: u32,
    pub extracted_filename: String,
    pub s3_key: String,
    pub uploaded_at: String,
}

/// One angle's recording over one contiguous press-to-stop interval, as held
/// in the catalog's `recording-sessions` collection.
///
/// The angle is kept as the raw catalog string: sessions written by this
/// system always carry one of the four codes, but reads must tolerate
/// anything, and the orchestrator filters on [SessionDoc::angle].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDoc {
    #[serde(default)]
    pub id: String,
    pub jetson_id: String,
    #[serde(default)]
    pub camera_name: String,
    pub angle_code: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub segment_session: SegmentSession,
    pub interface_id: String,
    #[serde(default)]
    pub total_chapters: u32,
    #[serde(default)]
    pub total_size_bytes: u64,
    pub status: SessionStatus,
    #[serde(default)]
    pub processed_games: Vec<ProcessedGame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_prefix: Option<String>,
}

impl SessionDoc {
    pub fn angle(&self) -> Option<Angle> {
        self.angle_code.parse().ok()
    }

    pub fn started_at_utc(&self) -> Result<DateTime<Utc>> {
        parse_utc(&self.started_at)
    }

    pub fn ended_at_utc(&self) -> Result<Option<DateTime<Utc>>> {
        self.ended_at.as_deref().map(parse_utc).transpose()
    }
}

/// Team info embedded in a game document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub score: Option<i64>,
}

/// An entry of the catalog's `basketball-games` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameDoc {
    #[serde(default)]
    pub id: String,
    pub created_at: String,
    pub ended_at: Option<String>,
    #[serde(default)]
    pub left_team: Option<TeamInfo>,
    #[serde(default)]
    pub right_team: Option<TeamInfo>,
    /// Set once the game has been synced to the external video registry.
    #[serde(
        rename = "uballGameId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub registry_game_id: Option<String>,
}

impl GameDoc {
    pub fn created_at_utc(&self) -> Result<DateTime<Utc>> {
        parse_utc(&self.created_at)
    }

    pub fn ended_at_utc(&self) -> Result<Option<DateTime<Utc>>> {
        self.ended_at.as_deref().map(parse_utc).transpose()
    }

    /// Overlap against a recording window; an unended game is open-ended.
    pub fn overlaps(&self, rec_start: DateTime<Utc>, rec_end: DateTime<Utc>) -> Result<bool> {
        let created = self.created_at_utc()?;
        if created > rec_end {
            return Ok(false);
        }
        match self.ended_at_utc()? {
            Some(ended) => Ok(ended >= rec_start),
            None => Ok(true),
        }
    }

    /// `YYYY-MM-DD` portion of the game start, used in deliverable keys.
    pub fn date(&self) -> &str {
        let end = self.created_at.len().min(10);
        &self.created_at[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn angle_round_trip() {
        for angle in Angle::ALL {
            assert_eq!(angle.as_str().parse::<Angle>().unwrap(), angle);
        }
        assert!("fl".parse::<Angle>().is_ok());
        assert!("UNK".parse::<Angle>().is_err());
        assert!("".parse::<Angle>().is_err());
    }

    #[test]
    fn registry_sides() {
        assert_eq!(Angle::FL.registry_side(), Some(RegistrySide::Left));
        assert_eq!(Angle::FR.registry_side(), Some(RegistrySide::Right));
        assert_eq!(Angle::NL.registry_side(), None);
        assert!(!Angle::NR.is_registrable());
    }

    #[test]
    fn angle_map_match_rules() {
        let map = AngleMap::from_json(r#"{"GoPro FL": "FL", "GoPro NR": "NR"}"#).unwrap();
        // exact
        assert_eq!(map.resolve("GoPro FL"), Some(Angle::FL));
        // case-insensitive
        assert_eq!(map.resolve("gopro nr"), Some(Angle::NR));
        // substring, either direction
        assert_eq!(map.resolve("GoPro FL 12345"), Some(Angle::FL));
        assert_eq!(map.resolve("FL"), Some(Angle::FL));
        assert_eq!(map.resolve("HERO12"), None);
    }

    #[test]
    fn angle_map_drops_bad_entries() {
        let map = AngleMap::from_json(r#"{"GoPro FL": "FL", "Spare": "XX"}"#).unwrap();
        assert_eq!(map.0.len(), 1);
    }

    #[test]
    fn chapter_sort_follows_recording_then_fragment() {
        let mut chapters: Vec<ChapterRef> = ["GX020028.MP4", "GX010041.MP4", "GX010028.MP4"]
            .iter()
            .map(|name| ChapterRef {
                directory: "100GOPRO".to_string(),
                filename: name.to_string(),
                size_bytes: 0,
            })
            .collect();
        sort_chapters(&mut chapters);
        let names: Vec<_> = chapters.iter().map(|c| c.filename.as_str()).collect();
        // recording 0028 fragments 01,02 come before recording 0041
        assert_eq!(names, vec!["GX010028.MP4", "GX020028.MP4", "GX010041.MP4"]);
    }

    #[test]
    fn chapter_sort_tolerates_foreign_names() {
        let a = ChapterRef {
            directory: "100GOPRO".into(),
            filename: "notes.MP4".into(),
            size_bytes: 0,
        };
        assert_eq!(a.sort_key(), ("NOTES".to_string(), "00".to_string()));
    }

    #[test]
    fn segment_session_format() {
        let t = Utc.with_ymd_and_hms(2026, 1, 20, 19, 50, 30).unwrap();
        let s = SegmentSession::new("enxd43260ddac87", Some(Angle::FL), t);
        assert_eq!(s.as_str(), "enxd43260ddac87_FL_20260120_195030");
        assert_eq!(s.date_part(), Some("20260120"));

        let bare = SegmentSession::new("enxd43260ddac87", None, t);
        assert_eq!(bare.as_str(), "enxd43260ddac87_20260120_195030");
    }

    #[test]
    fn utc_formatting_is_z_suffixed_millis() {
        let t = Utc.with_ymd_and_hms(2026, 1, 20, 19, 55, 30).unwrap();
        assert_eq!(format_utc(t), "2026-01-20T19:55:30.000Z");
        assert_eq!(parse_utc("2026-01-20T19:55:30.000Z").unwrap(), t);
    }

    #[test]
    fn local_time_strings_are_rejected() {
        assert!(parse_utc("2026-01-20T19:55:30").is_err());
        assert!(parse_utc("2026-01-20T19:55:30+02:00").is_err());
    }

    #[test]
    fn game_overlap_rules() {
        let game = GameDoc {
            id: "g1".into(),
            created_at: "2026-01-20T19:55:30.000Z".into(),
            ended_at: Some("2026-01-20T20:15:30.000Z".into()),
            left_team: None,
            right_team: None,
            registry_game_id: None,
        };
        let rec_start = parse_utc("2026-01-20T19:50:30.000Z").unwrap();
        let rec_end = parse_utc("2026-01-20T21:00:00.000Z").unwrap();
        assert!(game.overlaps(rec_start, rec_end).unwrap());

        // window entirely after the game
        let late_start = parse_utc("2026-01-20T20:20:00.000Z").unwrap();
        assert!(!game.overlaps(late_start, rec_end).unwrap());
        // window entirely before the game
        let early_start = parse_utc("2026-01-19T00:00:00.000Z").unwrap();
        let early_end = parse_utc("2026-01-20T19:54:00.000Z").unwrap();
        assert!(!game.overlaps(early_start, early_end).unwrap());

        // unended game is open-ended
        let open = GameDoc {
            ended_at: None,
            ..game.clone()
        };
        assert!(open.overlaps(late_start, rec_end).unwrap());
    }

    #[test]
    fn session_doc_round_trips_catalog_field_names() {
        let doc = SessionDoc {
            id: "abc".into(),
            jetson_id: "jetson-1".into(),
            camera_name: "GoPro FL".into(),
            angle_code: "FL".into(),
            started_at: "2026-01-20T19:50:30.000Z".into(),
            ended_at: None,
            segment_session: SegmentSession::from_raw("enxd43260ddac87_FL_20260120_195030"),
            interface_id: "enxd43260ddac87".into(),
            total_chapters: 0,
            total_size_bytes: 0,
            status: SessionStatus::Recording,
            processed_games: vec![],
            s3_prefix: None,
        };
        let v = serde_json::to_value(&doc).unwrap();
        assert_eq!(v["jetsonId"], "jetson-1");
        assert_eq!(v["angleCode"], "FL");
        assert_eq!(v["status"], "recording");
        assert!(v.get("s3Prefix").is_none());
        let back: SessionDoc = serde_json::from_value(v).unwrap();
        assert_eq!(back.angle(), Some(Angle::FL));
        assert!(back.ended_at_utc().unwrap().is_none());
    }
}
