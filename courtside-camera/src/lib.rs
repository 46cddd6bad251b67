//! Camera adapter: discovery over per-camera USB-Ethernet links and the HTTP
//! control surface of the cameras themselves.
//!
//! Each camera sits on its own point-to-point interface; the camera's address
//! is inferred from our own address by last-octet adjacency and confirmed by
//! probing the state endpoint. Confirmed addresses are cached per interface
//! and re-verified before use, so a stale entry triggers re-discovery rather
//! than failure.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use courtside_types::{Angle, AngleMap, ChapterRef};

pub mod keep_alive;

pub use keep_alive::KeepAliveHandle;

/// Fixed control/media port exposed by the cameras.
pub const CAMERA_HTTP_PORT: u16 = 8080;
/// Vendor USB-Ethernet interfaces all carry this name prefix.
pub const INTERFACE_PREFIX: &str = "enx";

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
const MEDIA_LIST_TIMEOUT: Duration = Duration::from_secs(15);
const DELETE_ALL_TIMEOUT: Duration = Duration::from_secs(60);

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("http error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },
    #[error("camera returned {status} for {endpoint}")]
    UnexpectedStatus {
        endpoint: &'static str,
        status: reqwest::StatusCode,
    },
    #[error("no camera reachable on interface {interface}")]
    NoCamera { interface: String },
    #[error("interface {interface} has no usable address")]
    NoInterfaceAddress { interface: String },
    #[error("malformed camera payload: {source}")]
    BadPayload {
        #[from]
        source: serde_json::Error,
    },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Transient errors are worth retrying at a higher layer.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http { source } => source.is_timeout() || source.is_connect(),
            Error::NoCamera { .. } => true,
            _ => false,
        }
    }
}

/// A discovered camera on one point-to-point link.
#[derive(Debug, Clone)]
pub struct Camera {
    /// Opaque interface id, e.g. `enxd43260ddac87`.
    pub interface: String,
    /// Our address on the link.
    pub our_ip: Ipv4Addr,
    /// The camera's confirmed address.
    pub peer_ip: Ipv4Addr,
    /// Advertised friendly name (the SSID), empty when unavailable.
    pub name: String,
    /// Angle resolved through the operator dictionary, if any.
    pub angle: Option<Angle>,
}

/// Storage counters pulled from the camera state document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    pub remaining_photos: u64,
    pub remaining_video_seconds: u64,
    pub sd_card_present: bool,
}

/// Camera operations the orchestrator depends on, kept narrow so pipeline
/// tests can stand in a fake fleet.
#[async_trait::async_trait]
pub trait CameraFleet: Send + Sync {
    async fn peer_address_for(&self, interface: &str) -> Result<Ipv4Addr>;
    async fn list_media(&self, peer: Ipv4Addr) -> Result<Vec<ChapterRef>>;
    async fn delete_all_media(&self, peer: Ipv4Addr) -> Result<()>;
    /// Single liveness ping; the orchestrator runs one ping task per active
    /// transfer.
    async fn keep_alive_ping(&self, peer: Ipv4Addr) -> Result<()>;
}

/// Address candidates for the camera, derived from our own last octet.
///
/// The devices take .50/.51 on their link and sometimes .1; our own address
/// is excluded from the set.
pub fn candidate_peers(our_ip: Ipv4Addr) -> Vec<Ipv4Addr> {
    let [a, b, c, last] = our_ip.octets();
    let candidates: &[u8] = match last {
        50 => &[51, 1],
        51 => &[50, 1],
        _ => &[51, 50, 1],
    };
    candidates
        .iter()
        .map(|&d| Ipv4Addr::new(a, b, c, d))
        .filter(|ip| *ip != our_ip)
        .collect()
}

/// Whether an address belongs to the private range the device family uses.
pub fn is_camera_link_addr(ip: Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    a == 172 && (16..=31).contains(&b)
}

fn base_url(peer: Ipv4Addr) -> String {
    format!("http://{peer}:{CAMERA_HTTP_PORT}")
}

// media list payload; sizes arrive as decimal strings.

fn u64_lenient<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct MediaFileEntry {
    n: String,
    #[serde(default, deserialize_with = "u64_lenient")]
    s: u64,
}

#[derive(Debug, Deserialize)]
struct MediaDirEntry {
    d: String,
    #[serde(default)]
    fs: Vec<MediaFileEntry>,
}

#[derive(Debug, Deserialize)]
struct MediaListPayload {
    #[serde(default)]
    media: Vec<MediaDirEntry>,
}

fn chapters_from_media_list(payload: MediaListPayload) -> Vec<ChapterRef> {
    let mut out = Vec::new();
    for dir in payload.media {
        for file in dir.fs {
            out.push(ChapterRef {
                directory: dir.d.clone(),
                filename: file.n,
                size_bytes: file.s,
            });
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct StatePayload {
    #[serde(default)]
    status: serde_json::Map<String, serde_json::Value>,
}

fn status_u64(status: &serde_json::Map<String, serde_json::Value>, key: &str) -> u64 {
    match status.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// The camera adapter. One instance serves every camera on the device; all
/// state is the per-interface address cache.
pub struct CameraAdapter {
    http: reqwest::Client,
    angle_map: AngleMap,
    cache: Mutex<HashMap<String, Ipv4Addr>>,
}

impl CameraAdapter {
    pub fn new(angle_map: AngleMap) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()?;
        Ok(CameraAdapter {
            http,
            angle_map,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Enumerate camera links: vendor-prefixed interfaces carrying an address
    /// in the device family's private range.
    pub fn camera_links(&self) -> Result<Vec<(String, Ipv4Addr)>> {
        let mut links = Vec::new();
        for iface in if_addrs::get_if_addrs()? {
            if !iface.name.starts_with(INTERFACE_PREFIX) {
                continue;
            }
            if let if_addrs::IfAddr::V4(v4) = &iface.addr {
                if is_camera_link_addr(v4.ip) {
                    links.push((iface.name.clone(), v4.ip));
                }
            }
        }
        Ok(links)
    }

    /// Probe a single candidate address; a 200 from the state endpoint wins.
    async fn probe(&self, peer: Ipv4Addr) -> bool {
        let url = format!("{}/gopro/camera/state", base_url(peer));
        match self.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn discover_on_link(&self, interface: &str, our_ip: Ipv4Addr) -> Option<Ipv4Addr> {
        for candidate in candidate_peers(our_ip) {
            if self.probe(candidate).await {
                info!("discovered camera at {candidate} on {interface}");
                self.cache
                    .lock()
                    .unwrap()
                    .insert(interface.to_string(), candidate);
                return Some(candidate);
            }
        }
        None
    }

    /// Discover every reachable camera. Interfaces whose probe fails are
    /// reported without a peer by omission; cache entries for interfaces that
    /// disappeared are evicted.
    pub async fn discover(&self) -> Result<Vec<Camera>> {
        let links = self.camera_links()?;
        {
            let live: Vec<&str> = links.iter().map(|(name, _)| name.as_str()).collect();
            self.cache
                .lock()
                .unwrap()
                .retain(|iface, _| live.contains(&iface.as_str()));
        }

        let mut cameras = Vec::new();
        for (interface, our_ip) in links {
            let Some(peer_ip) = self.discover_on_link(&interface, our_ip).await else {
                debug!("no camera answered on {interface}");
                continue;
            };
            let name = match self.friendly_name(peer_ip).await {
                Ok(name) => name,
                Err(err) => {
                    warn!("could not read camera name on {interface}: {err}");
                    String::new()
                }
            };
            let angle = self.angle_map.resolve(&name);
            cameras.push(Camera {
                interface,
                our_ip,
                peer_ip,
                name,
                angle,
            });
        }
        Ok(cameras)
    }

    /// Angle for an advertised camera name via the operator dictionary.
    pub fn angle_for_name(&self, name: &str) -> Option<Angle> {
        self.angle_map.resolve(name)
    }

    async fn control_get(&self, peer: Ipv4Addr, path: &'static str) -> Result<reqwest::Response> {
        let url = format!("{}{path}", base_url(peer));
        let resp = self.http.get(&url).timeout(CONTROL_TIMEOUT).send().await?;
        if !resp.status().is_success() {
            return Err(Error::UnexpectedStatus {
                endpoint: path,
                status: resp.status(),
            });
        }
        Ok(resp)
    }

    /// Enable USB control mode; required before any other command sticks.
    pub async fn enable_wired_control(&self, peer: Ipv4Addr) -> Result<()> {
        self.control_get(peer, "/gopro/camera/control/wired_usb?p=1")
            .await?;
        Ok(())
    }

    /// Switch the camera to its video preset group.
    pub async fn set_video_preset(&self, peer: Ipv4Addr) -> Result<()> {
        self.control_get(peer, "/gopro/camera/presets/set_group?id=1000")
            .await?;
        Ok(())
    }

    /// Stop the shutter (ends an in-progress recording).
    pub async fn stop_shutter(&self, peer: Ipv4Addr) -> Result<()> {
        self.control_get(peer, "/gopro/camera/shutter/stop").await?;
        Ok(())
    }

    /// Liveness ping; expected at least every 30 s during long transfers.
    pub async fn keep_alive(&self, peer: Ipv4Addr) -> Result<()> {
        let url = format!("{}/gopro/camera/keep_alive", base_url(peer));
        self.http
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await?;
        Ok(())
    }

    /// The advertised SSID, held at status key 30 of the state document.
    pub async fn friendly_name(&self, peer: Ipv4Addr) -> Result<String> {
        let state: StatePayload = self
            .control_get(peer, "/gopro/camera/state")
            .await?
            .json()
            .await?;
        Ok(match state.status.get("30") {
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => String::new(),
        })
    }

    /// Storage counters from the state document.
    pub async fn storage_info(&self, peer: Ipv4Addr) -> Result<StorageInfo> {
        let state: StatePayload = self
            .control_get(peer, "/gopro/camera/state")
            .await?
            .json()
            .await?;
        Ok(StorageInfo {
            remaining_photos: status_u64(&state.status, "34"),
            remaining_video_seconds: status_u64(&state.status, "35"),
            sd_card_present: status_u64(&state.status, "33") == 0,
        })
    }

}

#[async_trait::async_trait]
impl CameraFleet for CameraAdapter {
    /// Cached address for an interface, re-verified by probing; a stale entry
    /// falls back to re-discovery on that link.
    async fn peer_address_for(&self, interface: &str) -> Result<Ipv4Addr> {
        let cached = self.cache.lock().unwrap().get(interface).copied();
        if let Some(peer) = cached {
            if self.probe(peer).await {
                return Ok(peer);
            }
            debug!("cached address {peer} for {interface} is stale, re-probing");
        }
        let our_ip = self
            .camera_links()?
            .into_iter()
            .find(|(name, _)| name == interface)
            .map(|(_, ip)| ip)
            .ok_or_else(|| Error::NoInterfaceAddress {
                interface: interface.to_string(),
            })?;
        self.discover_on_link(interface, our_ip)
            .await
            .ok_or_else(|| Error::NoCamera {
                interface: interface.to_string(),
            })
    }

    /// All media on the camera as chapter references, unsorted.
    async fn list_media(&self, peer: Ipv4Addr) -> Result<Vec<ChapterRef>> {
        let url = format!("{}/gopro/media/list", base_url(peer));
        let resp = self
            .http
            .get(&url)
            .timeout(MEDIA_LIST_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::UnexpectedStatus {
                endpoint: "/gopro/media/list",
                status: resp.status(),
            });
        }
        let payload: MediaListPayload = resp.json().await?;
        Ok(chapters_from_media_list(payload))
    }

    async fn keep_alive_ping(&self, peer: Ipv4Addr) -> Result<()> {
        self.keep_alive(peer).await
    }

    /// Bulk-delete everything on the SD card.
    async fn delete_all_media(&self, peer: Ipv4Addr) -> Result<()> {
        let url = format!("{}/gopro/media/delete/all", base_url(peer));
        let resp = self
            .http
            .get(&url)
            .timeout(DELETE_ALL_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::UnexpectedStatus {
                endpoint: "/gopro/media/delete/all",
                status: resp.status(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_by_last_octet() {
        let from_50 = candidate_peers(Ipv4Addr::new(172, 20, 110, 50));
        assert_eq!(
            from_50,
            vec![
                Ipv4Addr::new(172, 20, 110, 51),
                Ipv4Addr::new(172, 20, 110, 1)
            ]
        );

        let from_51 = candidate_peers(Ipv4Addr::new(172, 20, 110, 51));
        assert_eq!(
            from_51,
            vec![
                Ipv4Addr::new(172, 20, 110, 50),
                Ipv4Addr::new(172, 20, 110, 1)
            ]
        );

        let other = candidate_peers(Ipv4Addr::new(172, 20, 110, 2));
        assert_eq!(other.len(), 3);

        // our own address never appears
        let from_1 = candidate_peers(Ipv4Addr::new(172, 20, 110, 1));
        assert!(!from_1.contains(&Ipv4Addr::new(172, 20, 110, 1)));
        assert_eq!(from_1.len(), 2);
    }

    #[test]
    fn camera_link_range() {
        assert!(is_camera_link_addr(Ipv4Addr::new(172, 16, 0, 50)));
        assert!(is_camera_link_addr(Ipv4Addr::new(172, 31, 255, 51)));
        assert!(!is_camera_link_addr(Ipv4Addr::new(172, 32, 0, 50)));
        assert!(!is_camera_link_addr(Ipv4Addr::new(192, 168, 1, 50)));
        assert!(!is_camera_link_addr(Ipv4Addr::new(10, 0, 0, 50)));
    }

    #[test]
    fn media_list_parses_string_sizes() {
        let payload: MediaListPayload = serde_json::from_str(
            r#"{"media":[{"d":"100GOPRO","fs":[
                {"n":"GX010041.MP4","s":"10208434006","cre":"1737400000","mod":"1737403000"},
                {"n":"GX010040.MP4","s":512}
            ]}]}"#,
        )
        .unwrap();
        let chapters = chapters_from_media_list(payload);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].filename, "GX010041.MP4");
        assert_eq!(chapters[0].size_bytes, 10_208_434_006);
        assert_eq!(chapters[1].size_bytes, 512);
        assert_eq!(chapters[0].directory, "100GOPRO");
    }

    #[test]
    fn state_status_extraction() {
        let state: StatePayload = serde_json::from_str(
            r#"{"status":{"30":"GoPro FL","33":0,"34":"1234","35":5678}}"#,
        )
        .unwrap();
        assert_eq!(status_u64(&state.status, "34"), 1234);
        assert_eq!(status_u64(&state.status, "35"), 5678);
        assert_eq!(status_u64(&state.status, "33"), 0);
        assert_eq!(status_u64(&state.status, "99"), 0);
    }
}
