use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::peer::{PeerConnector, PeerEvent, PeerSession};
use super::sdp::{
    filter_answer, generate_sdp_fragment, parse_answer_medias, SdpOffer, SdpOfferMedia,
};
use super::signaling::{ConnectionState, WhepClient};
use super::stats::aggregate;
use super::trickle::{TrickleBatch, TrickleBuffer};
use crate::error::{PlayerError, Result};
use crate::sink::VideoSink;
use crate::stats::{ByteRateMeter, TransportSample};
use crate::transport::reader::{ReaderConfiguration, ReaderCore, ReaderState, StatsSource};
use crate::transport::TransportContext;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// WHEP-signaled WebRTC reader
pub struct WebRtcTransport {
    inner: Arc<Inner>,
}

struct Inner {
    core: Arc<ReaderCore>,
    whep: WhepClient,
    peers: Arc<dyn PeerConnector>,
    sink: Arc<dyn VideoSink>,
    teardown_on_close: bool,
    session: Mutex<Option<Arc<dyn PeerSession>>>,
    offer: Mutex<Option<SdpOffer>>,
    medias: Mutex<BTreeMap<usize, SdpOfferMedia>>,
    trickle: Mutex<TrickleBuffer>,
    connection_state: Mutex<ConnectionState>,
    meter: Mutex<ByteRateMeter>,
    noise: LogThrottler,
}

impl WebRtcTransport {
    pub fn new(
        config: ReaderConfiguration,
        context: &TransportContext,
        sink: Arc<dyn VideoSink>,
        debug: bool,
    ) -> Result<Self> {
        let whep = WhepClient::new(
            context.http.clone(),
            &config.url,
            config.auth_header(),
            Duration::from_millis(context.webrtc.request_timeout_ms),
        )?;
        let trickle = TrickleBuffer::new(config.protocol.candidate_transport());

        Ok(Self {
            inner: Arc::new(Inner {
                core: Arc::new(ReaderCore::new(config, debug)),
                whep,
                peers: context.peers.clone(),
                sink,
                teardown_on_close: context.webrtc.teardown_on_close,
                session: Mutex::new(None),
                offer: Mutex::new(None),
                medias: Mutex::new(BTreeMap::new()),
                trickle: Mutex::new(trickle),
                connection_state: Mutex::new(ConnectionState::New),
                meter: Mutex::new(ByteRateMeter::new()),
                noise: LogThrottler::with_secs(10),
            }),
        })
    }

    /// Begin negotiation in the background
    pub fn start(&self) -> Result<()> {
        self.inner.core.begin()?;
        info!(
            "Starting {} negotiation with {}",
            self.inner.core.protocol(),
            self.inner.whep.endpoint()
        );

        self.inner.spawn_trickle_sender();
        self.inner
            .core
            .spawn_stats_sampler(self.inner.clone() as Arc<dyn StatsSource>);

        let inner = self.inner.clone();
        let handle = self.inner.core.scheduler().spawn(move |_token| async move {
            if let Err(e) = inner.negotiate().await {
                inner.fail(e);
            }
        });
        self.inner.core.hold(handle);
        Ok(())
    }

    pub fn close(&self) {
        if self.inner.core.close() {
            debug!("{} reader closed", self.inner.core.protocol());
            self.inner.release();
        }
    }

    /// Playback is driven by the peer connection
    pub fn play(&self) {
        trace!("play() has no effect on WebRTC readers");
    }

    pub fn pause(&self) {
        trace!("pause() has no effect on WebRTC readers");
    }

    pub fn set_debug_state(&self, enabled: bool) {
        self.inner.core.set_debug(enabled);
    }

    pub fn state(&self) -> ReaderState {
        self.inner.core.state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection_state.lock()
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn fail(&self, err: PlayerError) {
        if self.core.fail(err) {
            self.release();
        }
    }

    /// Close the peer connection and tear down the WHEP session
    fn release(&self) {
        let session_url = {
            let mut trickle = self.trickle.lock();
            trickle.detach();
            trickle.session_url().cloned().filter(|_| self.teardown_on_close)
        };
        let session = self.session.lock().take();
        if session.is_none() && session_url.is_none() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime to release peer connection on");
            return;
        };
        let whep = self.whep.clone();
        runtime.spawn(async move {
            if let Some(session) = session {
                session.close().await;
            }
            if let Some(url) = session_url {
                match whep.teardown(&url).await {
                    Ok(()) => debug!("WHEP session {} deleted", url),
                    Err(e) => debug!("WHEP teardown of {} failed: {}", url, e),
                }
            }
        });
    }

    async fn negotiate(self: &Arc<Self>) -> Result<()> {
        let ice_servers = self.whep.ice_servers().await?;
        self.core.ensure_running()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = self.peers.connect(&ice_servers, events_tx).await?;
        *self.session.lock() = Some(session.clone());
        if self.core.state() == ReaderState::Closed {
            // closed while connecting; release() found no session
            self.session.lock().take();
            session.close().await;
            return Ok(());
        }
        self.spawn_event_loop(events_rx);

        let offer_sdp = session.create_offer().await?;
        *self.offer.lock() = Some(SdpOffer::parse(&offer_sdp)?);
        session.set_local_description(&offer_sdp).await?;
        self.core.ensure_running()?;

        let answer = self.whep.send_offer(&offer_sdp).await?;
        self.core.ensure_running()?;

        *self.medias.lock() = parse_answer_medias(&answer.sdp);
        let filtered = filter_answer(&answer.sdp, self.core.protocol().candidate_transport());
        session.set_remote_answer(&filtered).await?;
        self.core.ensure_running()?;

        // live candidates pushed after this point follow the flushed batch
        let flushed = self.trickle.lock().set_session(answer.session_url);
        if flushed > 0 {
            debug!("Flushed {} queued candidates", flushed);
        }

        info!("{} negotiated", self.core.protocol());
        Ok(())
    }

    fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        let inner = self.clone();
        let handle = self.core.scheduler().spawn(move |_token| async move {
            while let Some(event) = events.recv().await {
                if !inner.core.is_running() {
                    break;
                }
                inner.handle_peer_event(event);
            }
        });
        self.core.hold(handle);
    }

    fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if candidate.sdp_mline_index.is_none() {
                    warn_throttled!(
                        self.noise,
                        "candidate-without-index",
                        "Skipping local candidate without media index: {}",
                        candidate.candidate
                    );
                    return;
                }
                self.trickle.lock().push(candidate);
            }
            PeerEvent::ConnectionState(state) => {
                *self.connection_state.lock() = state;
                debug!("Peer connection state: {}", state);
                if state.is_terminal() {
                    self.fail(PlayerError::ConnectionClosed);
                }
            }
            PeerEvent::Track(track) => {
                info!("Attaching {} track ({})", track.kind, track.codec);
                self.sink.attach_track(track);
            }
        }
    }

    /// PATCH batches one at a time so candidates reach the server in order
    fn spawn_trickle_sender(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TrickleBatch>();
        self.trickle.lock().attach(tx);

        let inner = self.clone();
        let handle = self.core.scheduler().spawn(move |_token| async move {
            while let Some((url, batch)) = rx.recv().await {
                let fragment = match inner.offer.lock().as_ref() {
                    Some(offer) => generate_sdp_fragment(
                        offer,
                        &batch,
                        inner.core.protocol().candidate_transport(),
                    ),
                    None => {
                        inner.fail(PlayerError::Negotiation("No Offer Data".into()));
                        return;
                    }
                };

                let result = inner.whep.patch_candidates(&url, fragment).await;
                if !inner.core.is_running() {
                    return;
                }
                match result {
                    Ok(()) => trace!("Sent {} candidates", batch.len()),
                    Err(e) => {
                        inner.fail(e);
                        return;
                    }
                }
            }
        });
        self.core.hold(handle);
    }
}

#[async_trait]
impl StatsSource for Inner {
    async fn sample(&self, interval: Duration) -> Option<TransportSample> {
        let session = self.session.lock().clone()?;
        let entries = session.stats().await;
        let medias = self.medias.lock().clone();

        let mut sample = aggregate(&entries, &medias);
        sample.bandwidth_bps = self.meter.lock().sample(sample.bytes_received, interval);
        Some(TransportSample::WebRtc(sample))
    }

    fn reset_baseline(&self) {
        *self.meter.lock() = ByteRateMeter::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::{CandidateTransport, StreamProtocol};
    use crate::sink::{MediaKind, RemoteTrack};
    use crate::webrtc::sdp::LocalCandidate;
    use crate::stats::keys;
    use crate::test_support::{
        transport_context, wait_until, FakePeerConnector, MemorySink, WhepMock,
    };

    fn candidate(n: u32, transport: CandidateTransport) -> LocalCandidate {
        LocalCandidate {
            candidate: format!(
                "candidate:{} 1 {} 2130706431 192.168.1.{} 5000 typ host",
                n,
                transport.as_str(),
                n
            ),
            sdp_mline_index: Some((n % 2) as u16),
            protocol: Some(transport),
        }
    }

    struct Harness {
        transport: WebRtcTransport,
        errors: Arc<Mutex<Vec<PlayerError>>>,
        peers: Arc<FakePeerConnector>,
        sink: Arc<MemorySink>,
    }

    fn harness(mock: &WhepMock, protocol: StreamProtocol, peers: FakePeerConnector) -> Harness {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = errors.clone();
        let peers = Arc::new(peers);
        let sink = Arc::new(MemorySink::default());
        let config = ReaderConfiguration::new(mock.url.clone(), protocol).on_error(move |err| {
            e.lock().push(err);
        });
        let transport =
            WebRtcTransport::new(config, &transport_context(peers.clone()), sink.clone(), false)
                .unwrap();
        Harness {
            transport,
            errors,
            peers,
            sink,
        }
    }

    #[tokio::test]
    async fn test_negotiation_flushes_queued_candidates_in_order() {
        let mock = WhepMock::spawn(201).await;
        let peers = FakePeerConnector::with_candidates(vec![
            candidate(1, CandidateTransport::Udp),
            candidate(2, CandidateTransport::Udp),
            candidate(3, CandidateTransport::Udp),
        ]);
        let h = harness(&mock, StreamProtocol::WebRtc, peers);

        h.transport.start().unwrap();
        assert!(wait_until(|| mock.count("PATCH") == 1).await);

        let patch = mock.bodies("PATCH").remove(0);
        let c1 = patch.find("candidate:1 ").unwrap();
        let c3 = patch.find("candidate:3 ").unwrap();
        assert!(patch.starts_with("a=ice-ufrag:fakeufrag\r\na=ice-pwd:fakepwd\r\n"));
        // index 0 (candidate 2) is emitted before index 1 (candidates 1, 3)
        assert!(patch.find("candidate:2 ").unwrap() < c1);
        assert!(c1 < c3);

        // later candidates are sent one by one
        let session = h.peers.last_session().unwrap();
        session.emit(PeerEvent::LocalCandidate(candidate(4, CandidateTransport::Udp)));
        assert!(wait_until(|| mock.count("PATCH") == 2).await);
        assert!(mock.bodies("PATCH")[1].contains("candidate:4 "));

        assert_eq!(mock.count("OPTIONS"), 1);
        assert_eq!(mock.count("POST"), 1);
        assert!(h.errors.lock().is_empty());
        assert_eq!(h.transport.state(), ReaderState::Running);
    }

    #[tokio::test]
    async fn test_constrained_protocol_filters_answer_and_candidates() {
        let mock = WhepMock::spawn(201).await;
        let peers = FakePeerConnector::with_candidates(vec![
            candidate(1, CandidateTransport::Udp),
            candidate(2, CandidateTransport::Tcp),
        ]);
        let h = harness(&mock, StreamProtocol::WebRtcTcp, peers);

        h.transport.start().unwrap();
        assert!(wait_until(|| mock.count("PATCH") == 1).await);

        let answer = h.peers.last_session().unwrap().remote_answer().unwrap();
        assert!(answer.contains(" TCP "));
        assert!(!answer.contains(" UDP "));

        let patch = mock.bodies("PATCH").remove(0);
        assert!(patch.contains("candidate:2 "));
        assert!(!patch.contains("candidate:1 "));
    }

    #[tokio::test]
    async fn test_offer_rejection_reports_unavailable_once() {
        let mock = WhepMock::spawn(404).await;
        let h = harness(&mock, StreamProtocol::WebRtc, FakePeerConnector::default());

        h.transport.start().unwrap();
        assert!(wait_until(|| !h.errors.lock().is_empty()).await);
        assert_eq!(h.errors.lock()[0].kind(), ErrorKind::Unavailable);
        assert_eq!(h.transport.state(), ReaderState::Closed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.errors.lock().len(), 1);
        assert!(wait_until(|| h.peers.last_session().unwrap().is_closed()).await);
    }

    #[tokio::test]
    async fn test_failed_connection_state_is_fatal() {
        let mock = WhepMock::spawn(201).await;
        let h = harness(&mock, StreamProtocol::WebRtc, FakePeerConnector::default());
        h.transport.start().unwrap();
        assert!(wait_until(|| mock.count("POST") == 1).await);
        assert!(wait_until(|| h.peers.last_session().and_then(|s| s.remote_answer()).is_some()).await);

        let session = h.peers.last_session().unwrap();
        session.emit(PeerEvent::ConnectionState(ConnectionState::Connected));
        assert!(wait_until(|| h.transport.connection_state() == ConnectionState::Connected).await);

        session.emit(PeerEvent::ConnectionState(ConnectionState::Closed));
        session.emit(PeerEvent::ConnectionState(ConnectionState::Failed));
        assert!(wait_until(|| h.errors.lock().len() == 1).await);
        assert!(matches!(h.errors.lock()[0], PlayerError::ConnectionClosed));
        assert_eq!(h.transport.state(), ReaderState::Closed);

        // WHEP session torn down after failure
        assert!(wait_until(|| mock.count("DELETE") == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_tracks_reach_sink_and_close_is_idempotent() {
        let mock = WhepMock::spawn(201).await;
        let h = harness(&mock, StreamProtocol::WebRtc, FakePeerConnector::default());
        h.transport.start().unwrap();
        assert!(wait_until(|| h.peers.last_session().and_then(|s| s.remote_answer()).is_some()).await);

        let session = h.peers.last_session().unwrap();
        session.emit(PeerEvent::Track(RemoteTrack {
            kind: MediaKind::Video,
            codec: "video/H264".into(),
            ssrc: 1111,
            track: None,
        }));
        assert!(wait_until(|| h.sink.tracks().len() == 1).await);

        h.transport.close();
        h.transport.close();
        assert_eq!(h.transport.state(), ReaderState::Closed);
        assert!(wait_until(|| session.is_closed()).await);
        assert!(wait_until(|| mock.count("DELETE") == 1).await);

        // events after close are ignored
        session.emit(PeerEvent::Track(RemoteTrack {
            kind: MediaKind::Audio,
            codec: "audio/opus".into(),
            ssrc: 2222,
            track: None,
        }));
        session.emit(PeerEvent::ConnectionState(ConnectionState::Failed));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.sink.tracks().len(), 1);
        assert_eq!(mock.count("DELETE"), 1);
        assert!(h.errors.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stats_sampling_uses_answer_codecs() {
        let mock = WhepMock::spawn(201).await;
        let records = Arc::new(Mutex::new(Vec::new()));
        let r = records.clone();
        let peers = Arc::new(FakePeerConnector::default());
        let config = ReaderConfiguration::new(mock.url.clone(), StreamProtocol::WebRtc)
            .with_stats_interval(Duration::from_millis(50))
            .on_stats(move |batch| r.lock().push(batch));
        let transport = WebRtcTransport::new(
            config,
            &transport_context(peers.clone()),
            Arc::new(MemorySink::default()),
            true,
        )
        .unwrap();

        transport.start().unwrap();
        let has_codec = |batch: &Vec<crate::stats::PlayerStatsRecord>| {
            batch.iter().any(|rec| rec.key() == keys::CODEC_VIDEO)
        };
        assert!(wait_until(|| records.lock().iter().any(has_codec)).await);
        transport.close();

        let first = records
            .lock()
            .iter()
            .find(|batch| has_codec(batch))
            .cloned()
            .unwrap();
        let codec = first.iter().find(|rec| rec.key() == keys::CODEC_VIDEO).cloned();
        assert_eq!(
            codec,
            Some(crate::stats::PlayerStatsRecord::value(keys::CODEC_VIDEO, "H264"))
        );
        let transport_rec = first.iter().find(|rec| rec.key() == keys::TRANSPORT).cloned();
        assert_eq!(
            transport_rec,
            Some(crate::stats::PlayerStatsRecord::value(keys::TRANSPORT, "UDP"))
        );
    }
}
