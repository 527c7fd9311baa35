//! Fakes and mock servers shared by the unit tests

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes as AxumBytes;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::config::{HlsConfig, WebRtcConfig};
use crate::error::{PlayerError, Result};
use crate::orchestrator::{ReadinessSource, StreamReadiness};
use crate::sink::{HlsFragment, RemoteTrack, VideoSink};
use crate::transport::TransportContext;
use crate::webrtc::{
    IceServerDescriptor, LocalCandidate, PeerConnector, PeerEvent, PeerEventSender, PeerSession,
};

/// Poll `check` every 10 ms for up to 5 s
pub async fn wait_until(check: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn transport_context(peers: Arc<FakePeerConnector>) -> TransportContext {
    TransportContext {
        http: reqwest::Client::new(),
        peers,
        webrtc: WebRtcConfig::default(),
        hls: HlsConfig::default(),
    }
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

#[derive(Default)]
pub struct MemorySink {
    tracks: Mutex<Vec<RemoteTrack>>,
    fragments: Mutex<Vec<HlsFragment>>,
    resets: AtomicU32,
}

impl MemorySink {
    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.lock().clone()
    }

    pub fn fragments(&self) -> Vec<HlsFragment> {
        self.fragments.lock().clone()
    }

    pub fn resets(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }
}

impl VideoSink for MemorySink {
    fn attach_track(&self, track: RemoteTrack) {
        self.tracks.lock().push(track);
    }

    fn append_fragment(&self, fragment: HlsFragment) {
        self.fragments.lock().push(fragment);
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.tracks.lock().clear();
        self.fragments.lock().clear();
    }
}

const FAKE_OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:fakeufrag\r\n\
a=ice-pwd:fakepwd\r\n\
a=mid:0\r\n\
a=recvonly\r\n\
a=rtpmap:96 H264/90000\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:fakeufrag\r\n\
a=ice-pwd:fakepwd\r\n\
a=mid:1\r\n\
a=recvonly\r\n\
a=rtpmap:111 opus/48000/2\r\n";

/// Scripted peer connection
pub struct FakePeerSession {
    events: PeerEventSender,
    candidates: Vec<LocalCandidate>,
    remote: Mutex<Option<String>>,
    closed: AtomicBool,
    bytes: AtomicU64,
}

impl FakePeerSession {
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn remote_answer(&self) -> Option<String> {
        self.remote.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerSession for FakePeerSession {
    async fn create_offer(&self) -> Result<String> {
        Ok(FAKE_OFFER.to_string())
    }

    async fn set_local_description(&self, _offer: &str) -> Result<()> {
        for candidate in &self.candidates {
            self.emit(PeerEvent::LocalCandidate(candidate.clone()));
        }
        Ok(())
    }

    async fn set_remote_answer(&self, answer: &str) -> Result<()> {
        if self.is_closed() {
            return Err(PlayerError::Peer("session closed".into()));
        }
        *self.remote.lock() = Some(answer.to_string());
        Ok(())
    }

    async fn stats(&self) -> Vec<Value> {
        let bytes = self.bytes.fetch_add(12_500, Ordering::SeqCst) + 12_500;
        vec![
            json!({
                "id": "IT01V", "type": "inbound-rtp", "ssrc": 1111, "kind": "video",
                "bytesReceived": bytes, "packetsReceived": bytes / 1250,
                "packetsLost": 0, "jitter": 0.004
            }),
            json!({ "id": "CP1", "type": "candidate-pair", "localCandidateId": "L1",
                    "selected": true }),
            json!({ "id": "L1", "type": "local-candidate", "protocol": "udp" }),
        ]
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakePeerConnector {
    candidates: Vec<LocalCandidate>,
    sessions: Mutex<Vec<Arc<FakePeerSession>>>,
}

impl FakePeerConnector {
    /// Sessions emit `candidates` when the local description is set
    pub fn with_candidates(candidates: Vec<LocalCandidate>) -> Self {
        Self {
            candidates,
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn last_session(&self) -> Option<Arc<FakePeerSession>> {
        self.sessions.lock().last().cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn connect(
        &self,
        _ice_servers: &[IceServerDescriptor],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerSession>> {
        let session = Arc::new(FakePeerSession {
            events,
            candidates: self.candidates.clone(),
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
            bytes: AtomicU64::new(0),
        });
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

const FAKE_ANSWER: &str = "v=0\r\n\
o=- 2 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:0\r\n\
a=rtpmap:96 H264/90000\r\n\
a=ssrc:1111 cname:stream\r\n\
a=candidate:1 1 UDP 2130706431 10.0.0.1 8189 typ host\r\n\
a=candidate:2 1 TCP 2130706431 10.0.0.1 8189 typ host tcptype passive\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=mid:1\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=ssrc:2222 cname:stream\r\n";

type RequestLog = Arc<Mutex<Vec<(String, String)>>>;

/// WHEP endpoint at `/cam/whep` with its session at `/cam/whep/session`
pub struct WhepMock {
    pub url: String,
    requests: RequestLog,
}

impl WhepMock {
    /// `offer_status` is returned for the POST; 201 answers with an SDP.
    pub async fn spawn(offer_status: u16) -> Self {
        let requests: RequestLog = Arc::new(Mutex::new(Vec::new()));

        let log = requests.clone();
        let endpoint = any(move |method: Method, body: String| {
            let log = log.clone();
            async move {
                log.lock().push((method.to_string(), body));
                match method {
                    Method::OPTIONS => (
                        StatusCode::NO_CONTENT,
                        [(
                            header::LINK,
                            HeaderValue::from_static(
                                "<stun:stun.example.org:3478>; rel=\"ice-server\"",
                            ),
                        )],
                    )
                        .into_response(),
                    Method::POST if offer_status == 201 => (
                        StatusCode::CREATED,
                        [
                            (header::LOCATION, HeaderValue::from_static("/cam/whep/session")),
                            (header::CONTENT_TYPE, HeaderValue::from_static("application/sdp")),
                        ],
                        FAKE_ANSWER,
                    )
                        .into_response(),
                    Method::POST => StatusCode::from_u16(offer_status)
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                        .into_response(),
                    _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
                }
            }
        });

        let log = requests.clone();
        let session = any(move |method: Method, body: String| {
            let log = log.clone();
            async move {
                log.lock().push((method.to_string(), body));
                match method {
                    Method::PATCH => StatusCode::NO_CONTENT,
                    Method::DELETE => StatusCode::OK,
                    _ => StatusCode::METHOD_NOT_ALLOWED,
                }
            }
        });

        let router = Router::new()
            .route("/cam/whep", endpoint)
            .route("/cam/whep/session", session);
        let base = serve(router).await;

        Self {
            url: format!("{}/cam/whep", base),
            requests,
        }
    }

    pub fn count(&self, method: &str) -> usize {
        self.requests.lock().iter().filter(|(m, _)| m == method).count()
    }

    pub fn bodies(&self, method: &str) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, b)| b.clone())
            .collect()
    }
}

#[derive(Clone)]
struct HlsState {
    playlist: Arc<Mutex<String>>,
    playlist_status: Arc<AtomicU32>,
    segment_status: Arc<AtomicU32>,
    requests: Arc<Mutex<Vec<String>>>,
}

/// HLS origin under `/live/`: `master.m3u8` points at `index.m3u8`, every
/// other name is served as a 1000 byte segment.
pub struct HlsMock {
    base: String,
    state: HlsState,
}

const MASTER_PLAYLIST: &str = "#EXTM3U\n\
#EXT-X-VERSION:9\n\
#EXT-X-STREAM-INF:BANDWIDTH=1200000,CODECS=\"avc1.42e01f\",RESOLUTION=1280x720\n\
index.m3u8\n";

impl HlsMock {
    pub async fn spawn(playlist: &str) -> Self {
        let state = HlsState {
            playlist: Arc::new(Mutex::new(playlist.to_string())),
            playlist_status: Arc::new(AtomicU32::new(200)),
            segment_status: Arc::new(AtomicU32::new(200)),
            requests: Arc::new(Mutex::new(Vec::new())),
        };

        let s = state.clone();
        let router = Router::new().fallback(move |uri: Uri| {
            let s = s.clone();
            async move { Self::respond(s, uri).await }
        });
        let base = serve(router).await;
        Self { base, state }
    }

    async fn respond(state: HlsState, uri: Uri) -> Response {
        let path_and_query = uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_default();
        state.requests.lock().push(path_and_query);

        let status = |code: &AtomicU32| {
            StatusCode::from_u16(code.load(Ordering::SeqCst) as u16).unwrap_or(StatusCode::OK)
        };
        let mut headers = HeaderMap::new();

        if uri.path().ends_with("master.m3u8") {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/vnd.apple.mpegurl"),
            );
            return (StatusCode::OK, headers, MASTER_PLAYLIST).into_response();
        }
        if uri.path().ends_with("index.m3u8") {
            let code = status(&state.playlist_status);
            if !code.is_success() {
                return code.into_response();
            }
            if uri.query().is_some_and(|q| q.contains("_HLS_msn")) {
                // blocking reload: hold the request like a live origin would
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/vnd.apple.mpegurl"),
            );
            let body = state.playlist.lock().clone();
            return (StatusCode::OK, headers, body).into_response();
        }

        let code = status(&state.segment_status);
        if !code.is_success() {
            return code.into_response();
        }
        (StatusCode::OK, AxumBytes::from(vec![0u8; 1000])).into_response()
    }

    pub fn media_url(&self) -> String {
        format!("{}/live/index.m3u8", self.base)
    }

    pub fn master_url(&self) -> String {
        format!("{}/live/master.m3u8", self.base)
    }

    pub fn set_playlist(&self, playlist: &str) {
        *self.state.playlist.lock() = playlist.to_string();
    }

    pub fn set_playlist_status(&self, status: u16) {
        self.state.playlist_status.store(status as u32, Ordering::SeqCst);
    }

    pub fn set_segment_status(&self, status: u16) {
        self.state.segment_status.store(status as u32, Ordering::SeqCst);
    }

    /// Path and query of every request so far
    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().clone()
    }

    /// Requests whose path or query contains `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|r| r.contains(needle))
            .count()
    }
}

/// Readiness answers set by the test; `None` behaves like an unreachable
/// endpoint.
pub struct FakeReadiness {
    answer: Mutex<Option<StreamReadiness>>,
    calls: AtomicU32,
}

impl FakeReadiness {
    pub fn new(answer: Option<StreamReadiness>) -> Self {
        Self {
            answer: Mutex::new(answer),
            calls: AtomicU32::new(0),
        }
    }

    pub fn ready(codecs: &[&str]) -> Self {
        Self::new(Some(StreamReadiness {
            codecs: codecs.iter().map(|c| c.to_string()).collect(),
            ready: true,
        }))
    }

    pub fn set(&self, answer: Option<StreamReadiness>) {
        *self.answer.lock() = answer;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessSource for FakeReadiness {
    async fn fetch(&self) -> Result<StreamReadiness> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .lock()
            .clone()
            .ok_or_else(|| PlayerError::Other("readiness endpoint unreachable".into()))
    }
}
