//! Firestore REST implementation of the [Catalog] trait.
//!
//! Documents travel as typed value envelopes (`stringValue`, `integerValue`,
//! …); this module converts between those envelopes and plain JSON so the
//! shared document types can stay serde-typed. Authentication is a bearer
//! token read from the credentials file; acquiring the token is deployment
//! glue outside this crate.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    is_pending_upload, is_ready_for_sync, Catalog, Error, Result, BASKETBALL_GAMES,
    RECORDING_SESSIONS,
};
use courtside_types::{
    format_utc, Angle, GameDoc, ProcessedGame, SegmentSession, SessionDoc, SessionStatus,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Contents of the catalog credentials file.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogCredentials {
    pub project_id: String,
    pub api_token: String,
}

impl CatalogCredentials {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::BadDocument(format!("credentials file: {e}")))
    }
}

// ---------------------------
// value codec

/// Encode plain JSON as a Firestore value envelope.
pub(crate) fn json_to_fire(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                json!({ "integerValue": i.to_string() })
            } else {
                json!({ "doubleValue": n.as_f64() })
            }
        }
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(json_to_fire).collect::<Vec<_>>() }
        }),
        Value::Object(map) => json!({
            "mapValue": { "fields": map.iter()
                .map(|(k, v)| (k.clone(), json_to_fire(v)))
                .collect::<serde_json::Map<_, _>>() }
        }),
    }
}

/// Decode a Firestore value envelope back to plain JSON.
pub(crate) fn fire_to_json(value: &Value) -> Value {
    let Some(map) = value.as_object() else {
        return Value::Null;
    };
    if let Some(s) = map.get("stringValue") {
        return s.clone();
    }
    if let Some(b) = map.get("booleanValue") {
        return b.clone();
    }
    if let Some(i) = map.get("integerValue") {
        // integers arrive as decimal strings
        if let Some(parsed) = i.as_str().and_then(|s| s.parse::<i64>().ok()) {
            return json!(parsed);
        }
        return i.clone();
    }
    if let Some(d) = map.get("doubleValue") {
        return d.clone();
    }
    if let Some(t) = map.get("timestampValue") {
        return t.clone();
    }
    if map.contains_key("nullValue") {
        return Value::Null;
    }
    if let Some(arr) = map.get("arrayValue") {
        let items = arr
            .get("values")
            .and_then(|v| v.as_array())
            .map(|values| values.iter().map(fire_to_json).collect())
            .unwrap_or_default();
        return Value::Array(items);
    }
    if let Some(inner) = map.get("mapValue") {
        let fields = inner
            .get("fields")
            .and_then(|f| f.as_object())
            .map(|fields| {
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), fire_to_json(v)))
                    .collect()
            })
            .unwrap_or_default();
        return Value::Object(fields);
    }
    Value::Null
}

/// Wrap a plain JSON object as a Firestore `fields` map.
pub(crate) fn fields_of(doc: &Value) -> Value {
    let Some(map) = doc.as_object() else {
        return json!({});
    };
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), json_to_fire(v)))
            .collect(),
    )
}

/// Extract `(id, plain-json)` from a Firestore document resource.
pub(crate) fn doc_to_json(document: &Value) -> Result<(String, Value)> {
    let id = document
        .get("name")
        .and_then(|n| n.as_str())
        .and_then(|n| n.rsplit('/').next())
        .ok_or_else(|| Error::BadDocument("document without a name".to_string()))?
        .to_string();
    let fields = document
        .get("fields")
        .and_then(|f| f.as_object())
        .cloned()
        .unwrap_or_default();
    let plain: serde_json::Map<String, Value> = fields
        .iter()
        .map(|(k, v)| (k.clone(), fire_to_json(v)))
        .collect();
    Ok((id, Value::Object(plain)))
}

// ---------------------------
// query building

fn field_filter(field: &str, op: &str, value: Value) -> Value {
    json!({
        "fieldFilter": {
            "field": { "fieldPath": field },
            "op": op,
            "value": json_to_fire(&value),
        }
    })
}

fn structured_query(
    collection: &str,
    filters: Vec<Value>,
    order_by: Option<(&str, bool)>,
    limit: Option<u32>,
) -> Value {
    let mut query = json!({
        "from": [{ "collectionId": collection }],
    });
    let obj = query.as_object_mut().expect("literal object");
    match filters.len() {
        0 => {}
        1 => {
            obj.insert("where".to_string(), filters.into_iter().next().expect("one"));
        }
        _ => {
            obj.insert(
                "where".to_string(),
                json!({ "compositeFilter": { "op": "AND", "filters": filters } }),
            );
        }
    }
    if let Some((field, descending)) = order_by {
        obj.insert(
            "orderBy".to_string(),
            json!([{
                "field": { "fieldPath": field },
                "direction": if descending { "DESCENDING" } else { "ASCENDING" },
            }]),
        );
    }
    if let Some(limit) = limit {
        obj.insert("limit".to_string(), json!(limit));
    }
    json!({ "structuredQuery": query })
}

// ---------------------------
// write payloads

fn new_session_doc(
    device_id: &str,
    camera_name: &str,
    angle: Angle,
    segment_session: &SegmentSession,
    interface_id: &str,
    now: DateTime<Utc>,
) -> Value {
    json!({
        "jetsonId": device_id,
        "cameraName": camera_name,
        "angleCode": angle.as_str(),
        "startedAt": format_utc(now),
        "endedAt": null,
        "segmentSession": segment_session.as_str(),
        "interfaceId": interface_id,
        "totalChapters": 0,
        "totalSizeBytes": 0,
        "status": SessionStatus::Recording.as_str(),
        "processedGames": [],
    })
}

fn processed_game_value(game: &ProcessedGame) -> Value {
    json!({
        "firebaseGameId": game.game_id,
        "gameNumber": game.game_number,
        "extractedFilename": game.extracted_filename,
        "s3Key": game.s3_key,
        "uploadedAt": game.uploaded_at,
    })
}

fn session_from_json(id: String, mut plain: Value) -> Result<SessionDoc> {
    if let Some(obj) = plain.as_object_mut() {
        obj.insert("id".to_string(), json!(id));
        // wire name differs from the shared document field
        if let Some(games) = obj.remove("processedGames") {
            let mapped: Vec<Value> = games
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .map(|g| {
                            json!({
                                "gameId": g.get("firebaseGameId").cloned().unwrap_or(Value::Null),
                                "gameNumber": g.get("gameNumber").cloned().unwrap_or(json!(0)),
                                "extractedFilename": g.get("extractedFilename").cloned().unwrap_or(json!("")),
                                "s3Key": g.get("s3Key").cloned().unwrap_or(json!("")),
                                "uploadedAt": g.get("uploadedAt").cloned().unwrap_or(json!("")),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            obj.insert("processedGames".to_string(), Value::Array(mapped));
        }
    }
    serde_json::from_value(plain).map_err(|e| Error::BadDocument(format!("session: {e}")))
}

fn game_from_json(id: String, mut plain: Value) -> Result<GameDoc> {
    if let Some(obj) = plain.as_object_mut() {
        obj.insert("id".to_string(), json!(id));
    }
    serde_json::from_value(plain).map_err(|e| Error::BadDocument(format!("game: {e}")))
}

// ---------------------------
// the client

pub struct FirestoreCatalog {
    http: reqwest::Client,
    /// `https://firestore.googleapis.com/v1` in production; overridable for
    /// emulators.
    api_base: String,
    project_id: String,
    api_token: String,
}

impl FirestoreCatalog {
    pub fn new(credentials: CatalogCredentials) -> Result<Self> {
        Self::with_api_base(credentials, "https://firestore.googleapis.com/v1")
    }

    pub fn with_api_base(credentials: CatalogCredentials, api_base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(FirestoreCatalog {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            project_id: credentials.project_id,
            api_token: credentials.api_token,
        })
    }

    fn documents_base(&self) -> String {
        format!(
            "{}/projects/{}/databases/(default)/documents",
            self.api_base, self.project_id
        )
    }

    fn doc_name(&self, collection: &str, id: &str) -> String {
        format!(
            "projects/{}/databases/(default)/documents/{collection}/{id}",
            self.project_id
        )
    }

    async fn check(&self, context: &str, resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::RequestFailed {
                context: context.to_string(),
                status,
            });
        }
        Ok(resp.json().await?)
    }

    async fn create_doc(&self, collection: &str, doc: &Value) -> Result<String> {
        let url = format!("{}/{collection}", self.documents_base());
        let resp = self
            .http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&self.api_token)
            .json(&json!({ "fields": fields_of(doc) }))
            .send()
            .await?;
        let body = self.check(&format!("create {collection}"), resp).await?;
        let (id, _) = doc_to_json(&body)?;
        Ok(id)
    }

    async fn patch_doc(&self, collection: &str, id: &str, updates: &Value) -> Result<()> {
        let url = format!("{}/{collection}/{id}", self.documents_base());
        let mask: Vec<(&str, String)> = updates
            .as_object()
            .map(|obj| {
                obj.keys()
                    .map(|k| ("updateMask.fieldPaths", k.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let resp = self
            .http
            .patch(&url)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&self.api_token)
            .query(&mask)
            .json(&json!({ "fields": fields_of(updates) }))
            .send()
            .await?;
        self.check(&format!("update {collection}/{id}"), resp)
            .await?;
        Ok(())
    }

    async fn get_doc(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let url = format!("{}/{collection}/{id}", self.documents_base());
        let resp = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(self.check(&format!("get {collection}/{id}"), resp).await?))
    }

    async fn run_query(&self, query: Value) -> Result<Vec<Value>> {
        let url = format!("{}:runQuery", self.documents_base());
        let resp = self
            .http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&self.api_token)
            .json(&query)
            .send()
            .await?;
        let body = self.check("runQuery", resp).await?;
        let items = body.as_array().cloned().unwrap_or_default();
        Ok(items
            .into_iter()
            .filter_map(|item| item.get("document").cloned())
            .collect())
    }

    /// Array-union transform; the server drops elements already present.
    async fn append_array(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        element: Value,
    ) -> Result<()> {
        let url = format!("{}:commit", self.documents_base());
        let body = json!({
            "writes": [{
                "transform": {
                    "document": self.doc_name(collection, id),
                    "fieldTransforms": [{
                        "fieldPath": field,
                        "appendMissingElements": { "values": [json_to_fire(&element)] },
                    }],
                }
            }]
        });
        let resp = self
            .http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;
        self.check(&format!("append {collection}/{id}.{field}"), resp)
            .await?;
        Ok(())
    }

    async fn query_sessions(&self, query: Value) -> Result<Vec<SessionDoc>> {
        let docs = self.run_query(query).await?;
        let mut sessions = Vec::with_capacity(docs.len());
        for doc in &docs {
            let (id, plain) = doc_to_json(doc)?;
            sessions.push(session_from_json(id, plain)?);
        }
        Ok(sessions)
    }

    async fn query_games(&self, query: Value) -> Result<Vec<GameDoc>> {
        let docs = self.run_query(query).await?;
        let mut games = Vec::with_capacity(docs.len());
        for doc in &docs {
            let (id, plain) = doc_to_json(doc)?;
            games.push(game_from_json(id, plain)?);
        }
        Ok(games)
    }
}

#[async_trait::async_trait]
impl Catalog for FirestoreCatalog {
    async fn create_session(
        &self,
        device_id: &str,
        camera_name: &str,
        angle: Angle,
        segment_session: &SegmentSession,
        interface_id: &str,
    ) -> Result<String> {
        let doc = new_session_doc(
            device_id,
            camera_name,
            angle,
            segment_session,
            interface_id,
            Utc::now(),
        );
        let id = self.create_doc(RECORDING_SESSIONS, &doc).await?;
        info!("created recording session {id} ({segment_session})");
        Ok(id)
    }

    async fn finalize_session(
        &self,
        session_id: &str,
        ended_at: DateTime<Utc>,
        total_chapters: u32,
        total_bytes: u64,
    ) -> Result<()> {
        self.patch_doc(
            RECORDING_SESSIONS,
            session_id,
            &json!({
                "endedAt": format_utc(ended_at),
                "status": SessionStatus::Stopped.as_str(),
                "totalChapters": total_chapters,
                "totalSizeBytes": total_bytes,
            }),
        )
        .await
    }

    async fn update_session_state(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        self.patch_doc(
            RECORDING_SESSIONS,
            session_id,
            &json!({ "status": status.as_str() }),
        )
        .await
    }

    async fn set_session_s3_prefix(&self, session_id: &str, prefix: &str) -> Result<()> {
        // Set-at-most-once guard: a session that already carries a prefix is
        // left untouched.
        if let Some(existing) = self.get_session(session_id).await? {
            if let Some(current) = existing.s3_prefix {
                debug!("session {session_id} already has prefix {current}, not overwriting");
                return Ok(());
            }
        }
        self.patch_doc(
            RECORDING_SESSIONS,
            session_id,
            &json!({
                "s3Prefix": prefix,
                "s3UploadedAt": format_utc(Utc::now()),
            }),
        )
        .await
    }

    async fn append_processed_game(
        &self,
        session_id: &str,
        game: &ProcessedGame,
    ) -> Result<()> {
        self.append_array(
            RECORDING_SESSIONS,
            session_id,
            "processedGames",
            processed_game_value(game),
        )
        .await
    }

    async fn pending_upload(&self, device_id: &str) -> Result<Vec<SessionDoc>> {
        let query = structured_query(
            RECORDING_SESSIONS,
            vec![
                field_filter("status", "EQUAL", json!("stopped")),
                field_filter("jetsonId", "EQUAL", json!(device_id)),
            ],
            None,
            None,
        );
        let mut sessions: Vec<SessionDoc> = self
            .query_sessions(query)
            .await?
            .into_iter()
            .filter(is_pending_upload)
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }

    async fn recent_sessions(&self, device_id: &str, limit: u32) -> Result<Vec<SessionDoc>> {
        let query = structured_query(
            RECORDING_SESSIONS,
            vec![field_filter("jetsonId", "EQUAL", json!(device_id))],
            Some(("startedAt", true)),
            Some(limit),
        );
        self.query_sessions(query).await
    }

    async fn find_session_by_segment(
        &self,
        segment_session: &SegmentSession,
    ) -> Result<Option<SessionDoc>> {
        let query = structured_query(
            RECORDING_SESSIONS,
            vec![field_filter(
                "segmentSession",
                "EQUAL",
                json!(segment_session.as_str()),
            )],
            None,
            Some(1),
        );
        Ok(self.query_sessions(query).await?.into_iter().next())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionDoc>> {
        match self.get_doc(RECORDING_SESSIONS, session_id).await? {
            None => Ok(None),
            Some(doc) => {
                let (id, plain) = doc_to_json(&doc)?;
                Ok(Some(session_from_json(id, plain)?))
            }
        }
    }

    async fn games_in_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<GameDoc>> {
        // The server side can only express the created-before-end half; the
        // ended-after-start half (with open-ended games) filters here.
        let query = structured_query(
            BASKETBALL_GAMES,
            vec![field_filter(
                "createdAt",
                "LESS_THAN_OR_EQUAL",
                json!(format_utc(end)),
            )],
            None,
            None,
        );
        let games = self.query_games(query).await?;
        let mut overlapping = Vec::new();
        for game in games {
            match game.overlaps(start, end) {
                Ok(true) => overlapping.push(game),
                Ok(false) => {}
                Err(err) => {
                    // A malformed game never aborts discovery.
                    debug!("skipping game {} with bad timestamps: {err}", game.id);
                }
            }
        }
        Ok(overlapping)
    }

    async fn get_game(&self, game_id: &str) -> Result<Option<GameDoc>> {
        match self.get_doc(BASKETBALL_GAMES, game_id).await? {
            None => Ok(None),
            Some(doc) => {
                let (id, plain) = doc_to_json(&doc)?;
                Ok(Some(game_from_json(id, plain)?))
            }
        }
    }

    async fn list_games(&self, limit: u32) -> Result<Vec<GameDoc>> {
        let query = structured_query(
            BASKETBALL_GAMES,
            vec![],
            Some(("createdAt", true)),
            Some(limit),
        );
        self.query_games(query).await
    }

    async fn games_for_sync(&self, limit: u32) -> Result<Vec<GameDoc>> {
        let query = structured_query(
            BASKETBALL_GAMES,
            vec![],
            Some(("endedAt", true)),
            Some(limit * 2),
        );
        let games = self.query_games(query).await?;
        Ok(games
            .into_iter()
            .filter(is_ready_for_sync)
            .take(limit as usize)
            .collect())
    }

    async fn mark_game_synced(&self, game_id: &str, registry_game_id: &str) -> Result<()> {
        self.patch_doc(
            BASKETBALL_GAMES,
            game_id,
            &json!({
                "uballGameId": registry_game_id,
                "syncedAt": format_utc(Utc::now()),
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn value_codec_round_trips() {
        let original = json!({
            "name": "GoPro FL",
            "count": 42,
            "ratio": 1.5,
            "live": true,
            "missing": null,
            "tags": ["a", "b"],
            "nested": { "inner": 7 },
        });
        let encoded = json_to_fire(&original);
        assert_eq!(encoded["mapValue"]["fields"]["count"]["integerValue"], "42");
        assert_eq!(
            encoded["mapValue"]["fields"]["name"]["stringValue"],
            "GoPro FL"
        );
        let decoded = fire_to_json(&encoded);
        assert_eq!(decoded, original);
    }

    #[test]
    fn document_resource_decodes_to_id_and_json() {
        let doc = json!({
            "name": "projects/p/databases/(default)/documents/recording-sessions/abc123",
            "fields": {
                "jetsonId": { "stringValue": "jetson-1" },
                "totalChapters": { "integerValue": "3" },
            }
        });
        let (id, plain) = doc_to_json(&doc).unwrap();
        assert_eq!(id, "abc123");
        assert_eq!(plain["jetsonId"], "jetson-1");
        assert_eq!(plain["totalChapters"], 3);
    }

    #[test]
    fn new_session_doc_is_utc_and_recording() {
        let now = Utc.with_ymd_and_hms(2026, 1, 20, 19, 50, 30).unwrap();
        let ss = SegmentSession::from_raw("enx_FL_20260120_195030");
        let doc = new_session_doc("jetson-1", "GoPro FL", Angle::FL, &ss, "enx", now);
        assert_eq!(doc["startedAt"], "2026-01-20T19:50:30.000Z");
        assert_eq!(doc["endedAt"], Value::Null);
        assert_eq!(doc["status"], "recording");
        assert_eq!(doc["angleCode"], "FL");
        assert_eq!(doc["totalChapters"], 0);
    }

    #[test]
    fn structured_query_shapes() {
        let single = structured_query(
            "recording-sessions",
            vec![field_filter("status", "EQUAL", json!("stopped"))],
            None,
            None,
        );
        assert_eq!(
            single["structuredQuery"]["where"]["fieldFilter"]["op"],
            "EQUAL"
        );
        assert!(single["structuredQuery"].get("orderBy").is_none());

        let composite = structured_query(
            "recording-sessions",
            vec![
                field_filter("status", "EQUAL", json!("stopped")),
                field_filter("jetsonId", "EQUAL", json!("jetson-1")),
            ],
            Some(("startedAt", true)),
            Some(10),
        );
        let q = &composite["structuredQuery"];
        assert_eq!(q["where"]["compositeFilter"]["op"], "AND");
        assert_eq!(
            q["where"]["compositeFilter"]["filters"]
                .as_array()
                .unwrap()
                .len(),
            2
        );
        assert_eq!(q["orderBy"][0]["direction"], "DESCENDING");
        assert_eq!(q["limit"], 10);
    }

    #[test]
    fn session_decoding_maps_wire_names() {
        let plain = json!({
            "jetsonId": "jetson-1",
            "cameraName": "GoPro FL",
            "angleCode": "FL",
            "startedAt": "2026-01-20T19:50:30.000Z",
            "endedAt": null,
            "segmentSession": "enx_FL_20260120_195030",
            "interfaceId": "enx",
            "totalChapters": 2,
            "totalSizeBytes": 99,
            "status": "recording",
            "processedGames": [{
                "firebaseGameId": "g1",
                "gameNumber": 1,
                "extractedFilename": "f.mp4",
                "s3Key": "k",
                "uploadedAt": "2026-01-20T21:00:00.000Z",
            }],
        });
        let session = session_from_json("abc".to_string(), plain).unwrap();
        assert_eq!(session.id, "abc");
        assert_eq!(session.total_chapters, 2);
        assert_eq!(session.processed_games.len(), 1);
        assert_eq!(session.processed_games[0].game_id, "g1");
        assert_eq!(session.status, SessionStatus::Recording);
    }

    #[test]
    fn processed_game_wire_shape() {
        let game = ProcessedGame {
            game_id: "g1".to_string(),
            game_number: 2,
            extracted_filename: "f.mp4".to_string(),
            s3_key: "court-a/x".to_string(),
            uploaded_at: "2026-01-20T21:00:00.000Z".to_string(),
        };
        let v = processed_game_value(&game);
        assert_eq!(v["firebaseGameId"], "g1");
        assert_eq!(v["gameNumber"], 2);
        assert_eq!(v["s3Key"], "court-a/x");
    }
}
