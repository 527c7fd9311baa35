//! Aggregation of RTCStats entries into a [`WebRtcSample`]
//!
//! Entries are read as loosely typed JSON since their shape differs between
//! implementations: camelCase or snake_case keys, transport protocol under
//! `protocol` or `networkType`, and several ways of flagging the active
//! candidate pair.

use std::collections::BTreeMap;

use serde_json::Value;

use super::sdp::SdpOfferMedia;
use crate::protocol::CandidateTransport;
use crate::sink::MediaKind;
use crate::stats::WebRtcSample;

/// Flatten a serialized stats entry and make sure it carries its id.
///
/// Externally tagged entries (`{"InboundRTP": {...}}`) are unwrapped.
pub(crate) fn stats_entry(id: String, value: Value) -> Value {
    let mut value = match value {
        Value::Object(map) if !map.contains_key("type") && map.len() == 1 => {
            match map.into_iter().next() {
                Some((_, inner @ Value::Object(_))) => inner,
                Some((key, other)) => {
                    let mut single = serde_json::Map::new();
                    single.insert(key, other);
                    Value::Object(single)
                }
                None => Value::Null,
            }
        }
        other => other,
    };
    if let Some(obj) = value.as_object_mut() {
        obj.entry("id").or_insert(Value::String(id));
    }
    value
}

fn to_snake(camel: &str) -> String {
    let mut out = String::with_capacity(camel.len() + 4);
    for c in camel.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn field<'a>(entry: &'a Value, camel: &str) -> Option<&'a Value> {
    entry.get(camel).or_else(|| entry.get(to_snake(camel)))
}

fn number(entry: &Value, camel: &str) -> Option<f64> {
    field(entry, camel).and_then(Value::as_f64)
}

fn flag(entry: &Value, camel: &str) -> bool {
    field(entry, camel).and_then(Value::as_bool).unwrap_or(false)
}

fn text<'a>(entry: &'a Value, camel: &str) -> Option<&'a str> {
    field(entry, camel).and_then(Value::as_str)
}

fn stats_type(entry: &Value) -> Option<&str> {
    text(entry, "type").or_else(|| text(entry, "statsType"))
}

/// Transport of the active candidate pair.
///
/// Pairs are checked for `selected`, then `nominated` with a positive
/// round-trip time, then `writable`.
fn active_transport(entries: &[Value]) -> Option<CandidateTransport> {
    let pairs: Vec<&Value> = entries
        .iter()
        .filter(|e| stats_type(e) == Some("candidate-pair"))
        .collect();

    let active = pairs
        .iter()
        .find(|p| flag(p, "selected"))
        .or_else(|| {
            pairs.iter().find(|p| {
                flag(p, "nominated") && number(p, "currentRoundTripTime").unwrap_or(0.0) > 0.0
            })
        })
        .or_else(|| pairs.iter().find(|p| flag(p, "writable")))?;

    let local_id = text(active, "localCandidateId")?;
    let candidate = entries.iter().find(|e| {
        text(e, "id") == Some(local_id)
            && matches!(
                stats_type(e),
                Some("local-candidate") | Some("localcandidate")
            )
    })?;

    text(candidate, "protocol")
        .or_else(|| text(candidate, "networkType"))
        .and_then(CandidateTransport::from_token)
}

/// Fold inbound-rtp and candidate-pair entries into one sample.
///
/// Bandwidth is left at zero; it needs the previous sample and is filled in
/// by the caller.
pub(crate) fn aggregate(
    entries: &[Value],
    medias: &BTreeMap<usize, SdpOfferMedia>,
) -> WebRtcSample {
    let mut sample = WebRtcSample::default();
    let mut jitters = Vec::new();
    let mut buffer_delays = Vec::new();

    for entry in entries.iter().filter(|e| stats_type(e) == Some("inbound-rtp")) {
        sample.bytes_received += number(entry, "bytesReceived").unwrap_or(0.0) as u64;
        sample.packets_received += number(entry, "packetsReceived").unwrap_or(0.0) as u64;
        sample.packets_lost += number(entry, "packetsLost").unwrap_or(0.0) as i64;
        sample.packets_discarded += number(entry, "packetsDiscarded").unwrap_or(0.0) as u64;

        if let Some(jitter) = number(entry, "jitter") {
            jitters.push(jitter);
        }

        let delay = number(entry, "jitterBufferDelay").unwrap_or(0.0);
        let emitted = number(entry, "jitterBufferEmittedCount").unwrap_or(0.0);
        if emitted > 0.0 {
            buffer_delays.push(delay / emitted);
        }

        let ssrc = number(entry, "ssrc").map(|s| s as u32);
        let kind = text(entry, "kind")
            .or_else(|| text(entry, "mediaType"))
            .and_then(MediaKind::parse);

        let media = ssrc
            .and_then(|ssrc| medias.values().find(|m| m.ssrc == Some(ssrc)))
            .or_else(|| kind.and_then(|k| medias.values().find(|m| m.kind == k)));

        if let Some(media) = media {
            let slot = match media.kind {
                MediaKind::Video => &mut sample.video_codec,
                MediaKind::Audio => &mut sample.audio_codec,
            };
            if slot.is_none() {
                *slot = media.codec.clone();
            }
        }
    }

    sample.jitter = average(&jitters);
    sample.jitter_buffer_delay = average(&buffer_delays);
    sample.transport = active_transport(entries);
    sample
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
