//! WHEP signaling over HTTP
//!
//! `OPTIONS` discovers ICE servers, `POST` exchanges the offer for an answer
//! and a session URL, `PATCH` trickles local candidates, `DELETE` tears the
//! session down.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, IF_MATCH, LINK, LOCATION};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PlayerError, Result};

const SDP_CONTENT_TYPE: &str = "application/sdp";
const TRICKLE_CONTENT_TYPE: &str = "application/trickle-ice-sdpfrag";

/// ICE server advertised in a `Link` header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerDescriptor {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_type: Option<String>,
}

fn link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"(?i)^<(.+?)>; rel="ice-server"(; username="(.*?)"; credential="(.*?)"; credential-type="password")?"#,
        )
        .expect("valid link pattern")
    })
}

/// Quoted header values are JSON string contents
fn unquote_credential(value: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", value)).unwrap_or_else(|_| value.to_string())
}

/// Parse a `Link` header into ICE server descriptors.
///
/// Entries that do not describe an ICE server are skipped.
pub fn parse_link_header(links: Option<&str>) -> Vec<IceServerDescriptor> {
    let Some(links) = links else {
        return Vec::new();
    };

    links
        .split(", ")
        .filter_map(|link| {
            let caps = link_pattern().captures(link.trim())?;
            let mut server = IceServerDescriptor {
                urls: vec![caps.get(1)?.as_str().to_string()],
                ..Default::default()
            };
            if let (Some(username), Some(credential)) = (caps.get(3), caps.get(4)) {
                server.username = Some(unquote_credential(username.as_str()));
                server.credential = Some(unquote_credential(credential.as_str()));
                server.credential_type = Some("password".to_string());
            }
            Some(server)
        })
        .collect()
}

/// Peer connection state mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the session cannot recover
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Result of a successful offer exchange
#[derive(Debug, Clone)]
pub struct WhepAnswer {
    /// Session URL, resolved against the endpoint
    pub session_url: Url,
    pub sdp: String,
}

/// HTTP side of a WHEP session
#[derive(Debug, Clone)]
pub struct WhepClient {
    http: reqwest::Client,
    endpoint: Url,
    auth: Option<String>,
    timeout: Duration,
}

impl WhepClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: &str,
        auth: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint =
            Url::parse(endpoint).map_err(|e| PlayerError::Url(format!("{}: {}", endpoint, e)))?;
        Ok(Self {
            http,
            endpoint,
            auth,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url).timeout(self.timeout);
        match &self.auth {
            Some(auth) => builder.header(AUTHORIZATION, auth),
            None => builder,
        }
    }

    /// `OPTIONS` the endpoint and read the advertised ICE servers
    pub async fn ice_servers(&self) -> Result<Vec<IceServerDescriptor>> {
        let res = self
            .request(Method::OPTIONS, self.endpoint.clone())
            .send()
            .await?;

        let links: Vec<&str> = res
            .headers()
            .get_all(LINK)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let servers = if links.is_empty() {
            Vec::new()
        } else {
            parse_link_header(Some(&links.join(", ")))
        };

        debug!("Discovered {} ICE servers", servers.len());
        Ok(servers)
    }

    /// `POST` the offer. 201 yields the answer; 400/401/403/404 mean the
    /// stream is unavailable.
    pub async fn send_offer(&self, offer: &str) -> Result<WhepAnswer> {
        let res = self
            .request(Method::POST, self.endpoint.clone())
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .body(offer.to_string())
            .send()
            .await?;

        match res.status() {
            StatusCode::CREATED => {}
            StatusCode::BAD_REQUEST
            | StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::NOT_FOUND => {
                return Err(PlayerError::StreamUnavailable {
                    status: res.status().as_u16(),
                })
            }
            status => {
                return Err(PlayerError::HttpStatus {
                    stage: "Offer",
                    status: status.as_u16(),
                })
            }
        }

        let location = res
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| PlayerError::Negotiation("Invalid Stream Location".into()))?;
        let session_url = self
            .endpoint
            .join(location)
            .map_err(|e| PlayerError::Url(format!("{}: {}", location, e)))?;

        let sdp = res.text().await?;
        debug!("Offer accepted, session {}", session_url);
        Ok(WhepAnswer { session_url, sdp })
    }

    /// `PATCH` a trickle fragment to the session
    pub async fn patch_candidates(&self, session_url: &Url, fragment: String) -> Result<()> {
        let res = self
            .request(Method::PATCH, session_url.clone())
            .header(CONTENT_TYPE, TRICKLE_CONTENT_TYPE)
            .header(IF_MATCH, "*")
            .body(fragment)
            .send()
            .await?;

        match res.status() {
            StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => Err(PlayerError::StreamUnavailable { status: 404 }),
            status => Err(PlayerError::HttpStatus {
                stage: "Candidate patch",
                status: status.as_u16(),
            }),
        }
    }

    /// `DELETE` the session
    pub async fn teardown(&self, session_url: &Url) -> Result<()> {
        let res = self
            .request(Method::DELETE, session_url.clone())
            .send()
            .await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(PlayerError::HttpStatus {
                stage: "Teardown",
                status: res.status().as_u16(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{any, post};
    use axum::Router;
    use parking_lot::Mutex;

    #[test]
    fn test_missing_link_header_is_empty() {
        assert!(parse_link_header(None).is_empty());
    }

    #[test]
    fn test_parse_link_header() {
        let header = r#"<stun:stun.example.com:3478>; rel="ice-server", <turn:turn.example.com:3478?transport=udp>; rel="ice-server"; username="user"; credential="p@ss"; credential-type="password", <https://example.com>; rel="alternate""#;
        let servers = parse_link_header(Some(header));
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.com:3478"]);
        assert_eq!(servers[0].username, None);
        assert_eq!(
            servers[1],
            IceServerDescriptor {
                urls: vec!["turn:turn.example.com:3478?transport=udp".into()],
                username: Some("user".into()),
                credential: Some("p@ss".into()),
                credential_type: Some("password".into()),
            }
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/cam/whep", addr)
    }

    fn client(url: &str, auth: Option<String>) -> WhepClient {
        WhepClient::new(reqwest::Client::new(), url, auth, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_options_without_link_header() {
        let url = serve(Router::new().route("/cam/whep", any(|| async { AxumStatus::NO_CONTENT })))
            .await;
        let servers = client(&url, None).ice_servers().await.unwrap();
        assert!(servers.is_empty());
    }

    #[tokio::test]
    async fn test_offer_resolves_location() {
        let seen_auth = Arc::new(Mutex::new(None::<String>));
        let seen = seen_auth.clone();
        let router = Router::new().route(
            "/cam/whep",
            post(move |headers: HeaderMap, body: String| {
                let seen = seen.clone();
                async move {
                    *seen.lock() = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    assert_eq!(
                        headers.get("content-type").unwrap(),
                        "application/sdp"
                    );
                    assert!(body.starts_with("v=0"));
                    (
                        AxumStatus::CREATED,
                        [("location", "session/1234")],
                        "v=0\r\nanswer",
                    )
                        .into_response()
                }
            }),
        );
        let url = serve(router).await;

        let answer = client(&url, Some("Bearer tok".into()))
            .send_offer("v=0\r\n")
            .await
            .unwrap();
        assert!(answer.session_url.as_str().ends_with("/cam/session/1234"));
        assert_eq!(answer.sdp, "v=0\r\nanswer");
        assert_eq!(seen_auth.lock().as_deref(), Some("Bearer tok"));
    }

    #[tokio::test]
    async fn test_offer_404_is_unavailable() {
        let url = serve(Router::new().route("/cam/whep", post(|| async { AxumStatus::NOT_FOUND })))
            .await;
        let err = client(&url, None).send_offer("v=0\r\n").await.unwrap_err();
        assert!(matches!(err, PlayerError::StreamUnavailable { status: 404 }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_offer_500_is_negotiation_failure() {
        let url = serve(Router::new().route(
            "/cam/whep",
            post(|| async { AxumStatus::INTERNAL_SERVER_ERROR }),
        ))
        .await;
        let err = client(&url, None).send_offer("v=0\r\n").await.unwrap_err();
        assert!(matches!(
            err,
            PlayerError::HttpStatus {
                stage: "Offer",
                status: 500
            }
        ));
    }

    #[tokio::test]
    async fn test_offer_without_location_fails() {
        let url = serve(Router::new().route("/cam/whep", post(|| async { AxumStatus::CREATED })))
            .await;
        let err = client(&url, None).send_offer("v=0\r\n").await.unwrap_err();
        assert!(matches!(err, PlayerError::Negotiation(_)));
    }

    #[tokio::test]
    async fn test_patch_status_mapping() {
        let router = Router::new()
            .route(
                "/ok",
                any(|headers: HeaderMap| async move {
                    assert_eq!(headers.get("if-match").unwrap(), "*");
                    assert_eq!(
                        headers.get("content-type").unwrap(),
                        "application/trickle-ice-sdpfrag"
                    );
                    AxumStatus::NO_CONTENT
                }),
            )
            .route("/gone", any(|| async { AxumStatus::NOT_FOUND }));
        let url = serve(router).await;
        let whep = client(&url, None);

        let ok = whep.endpoint().join("/ok").unwrap();
        whep.patch_candidates(&ok, "a=ice-ufrag:x\r\n".into())
            .await
            .unwrap();

        let gone = whep.endpoint().join("/gone").unwrap();
        let err = whep
            .patch_candidates(&gone, "a=ice-ufrag:x\r\n".into())
            .await
            .unwrap_err();
        assert!(matches!(err, PlayerError::StreamUnavailable { status: 404 }));
    }
}
