//! SDP helpers for WHEP signaling
//!
//! Only the handful of attributes needed for trickle ICE and stats
//! attribution are read; descriptions are otherwise handed to the peer
//! connection untouched.

use std::collections::BTreeMap;

use crate::error::{PlayerError, Result};
use crate::protocol::CandidateTransport;
use crate::sink::MediaKind;

const LINE_END: &str = "\r\n";

/// ICE credentials and media lines of the local offer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpOffer {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    /// `m=` lines without the `m=` prefix, in order
    pub medias: Vec<String>,
}

impl SdpOffer {
    pub fn parse(sdp: &str) -> Result<Self> {
        let mut offer = SdpOffer::default();

        for line in sdp.split(LINE_END) {
            if let Some(media) = line.strip_prefix("m=") {
                offer.medias.push(media.to_string());
            } else if let Some(ufrag) = line.strip_prefix("a=ice-ufrag:") {
                if offer.ice_ufrag.is_empty() {
                    offer.ice_ufrag = ufrag.to_string();
                }
            } else if let Some(pwd) = line.strip_prefix("a=ice-pwd:") {
                if offer.ice_pwd.is_empty() {
                    offer.ice_pwd = pwd.to_string();
                }
            }
        }

        if offer.medias.is_empty() {
            return Err(PlayerError::Sdp("offer has no media sections".into()));
        }
        Ok(offer)
    }
}

/// Media section of the remote answer, used to attribute inbound RTP stats
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpOfferMedia {
    pub mid: String,
    pub kind: MediaKind,
    pub ssrc: Option<u32>,
    /// Encoding name of the first payload type, e.g. `H264`
    pub codec: Option<String>,
}

/// Parse media sections of an answer, keyed by media index
pub fn parse_answer_medias(answer: &str) -> BTreeMap<usize, SdpOfferMedia> {
    struct Section {
        kind: Option<MediaKind>,
        mid: Option<String>,
        ssrc: Option<u32>,
        first_payload: Option<String>,
        rtpmap: BTreeMap<String, String>,
    }

    let mut sections: Vec<Section> = Vec::new();

    for line in answer.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(media) = line.strip_prefix("m=") {
            let mut fields = media.split(' ');
            let kind = fields.next().and_then(MediaKind::parse);
            let first_payload = fields.nth(2).map(str::to_string);
            sections.push(Section {
                kind,
                mid: None,
                ssrc: None,
                first_payload,
                rtpmap: BTreeMap::new(),
            });
            continue;
        }

        let Some(section) = sections.last_mut() else {
            continue;
        };

        if let Some(mid) = line.strip_prefix("a=mid:") {
            section.mid = Some(mid.to_string());
        } else if let Some(ssrc) = line.strip_prefix("a=ssrc:") {
            if section.ssrc.is_none() {
                section.ssrc = ssrc.split(' ').next().and_then(|s| s.parse().ok());
            }
        } else if let Some(map) = line.strip_prefix("a=rtpmap:") {
            if let Some((pt, encoding)) = map.split_once(' ') {
                let name = encoding.split('/').next().unwrap_or(encoding);
                section.rtpmap.insert(pt.to_string(), name.to_string());
            }
        }
    }

    sections
        .into_iter()
        .enumerate()
        .filter_map(|(index, section)| {
            let kind = section.kind?;
            let codec = section
                .first_payload
                .as_ref()
                .and_then(|pt| section.rtpmap.get(pt).cloned());
            Some((
                index,
                SdpOfferMedia {
                    mid: section.mid.unwrap_or_else(|| index.to_string()),
                    kind,
                    ssrc: section.ssrc,
                    codec,
                },
            ))
        })
        .collect()
}

/// Drop `a=candidate` lines whose transport does not match.
///
/// `None` passes the answer through unmodified. All other lines keep their
/// content and order.
pub fn filter_answer(answer: &str, transport: Option<CandidateTransport>) -> String {
    let Some(transport) = transport else {
        return answer.to_string();
    };

    answer
        .split(LINE_END)
        .filter(|line| {
            if !line.starts_with("a=candidate") {
                return true;
            }
            line.split(' ')
                .nth(2)
                .map(|token| token.eq_ignore_ascii_case(transport.as_str()))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>()
        .join(LINE_END)
}

/// Local ICE candidate as gathered by the peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCandidate {
    /// `candidate:...` attribute value
    pub candidate: String,
    pub sdp_mline_index: Option<u16>,
    pub protocol: Option<CandidateTransport>,
}

/// Build an `application/trickle-ice-sdpfrag` body.
///
/// Candidates are grouped by media-line index and emitted under the matching
/// offer media line; candidates without an index or with the wrong transport
/// are skipped.
pub fn generate_sdp_fragment(
    offer: &SdpOffer,
    candidates: &[LocalCandidate],
    transport: Option<CandidateTransport>,
) -> String {
    let mut by_media: BTreeMap<usize, Vec<&LocalCandidate>> = BTreeMap::new();
    for candidate in candidates {
        if let Some(t) = transport {
            if candidate.protocol != Some(t) {
                continue;
            }
        }
        let Some(index) = candidate.sdp_mline_index else {
            continue;
        };
        by_media.entry(index as usize).or_default().push(candidate);
    }

    let mut frag = format!(
        "a=ice-ufrag:{}{}a=ice-pwd:{}{}",
        offer.ice_ufrag, LINE_END, offer.ice_pwd, LINE_END
    );

    for (index, media) in offer.medias.iter().enumerate() {
        let Some(group) = by_media.get(&index) else {
            continue;
        };
        frag.push_str(&format!("m={}{}a=mid:{}{}", media, LINE_END, index, LINE_END));
        for candidate in group {
            frag.push_str(&format!("a={}{}", candidate.candidate, LINE_END));
        }
    }

    frag
}
