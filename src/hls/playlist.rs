//! M3U8 playlist parsing
//!
//! Covers what a live player needs: variant streams of a multivariant
//! playlist, and segments, LL-HLS partial segments, server control and
//! program date-times of a media playlist.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, TimeDelta};

use crate::error::{PlayerError, Result};

/// Longest segment, part or target duration accepted, in seconds
const MAX_DURATION_SECS: f64 = 86_400.0;

/// Variant stream of a multivariant playlist
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub uri: String,
    pub bandwidth: Option<u64>,
    pub codecs: Option<String>,
    pub resolution: Option<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartialSegment {
    pub uri: String,
    pub duration: f64,
    pub independent: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub sequence: u64,
    pub uri: String,
    pub duration: f64,
    pub program_date_time: Option<DateTime<FixedOffset>>,
    /// Partial segments this segment was published as
    pub parts: Vec<PartialSegment>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaPlaylist {
    pub target_duration: f64,
    pub media_sequence: u64,
    pub part_target: Option<f64>,
    pub can_block_reload: bool,
    pub end_list: bool,
    /// `EXT-X-MAP` initialization section
    pub init_uri: Option<String>,
    pub segments: Vec<Segment>,
    /// Parts of the segment still being produced
    pub pending_parts: Vec<PartialSegment>,
}

impl MediaPlaylist {
    /// Sequence number of the segment after the last complete one
    pub fn next_sequence(&self) -> u64 {
        self.media_sequence.saturating_add(self.segments.len() as u64)
    }

    /// Whether LL-HLS parts are published
    pub fn has_parts(&self) -> bool {
        self.part_target.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Playlist {
    Multivariant(Vec<Variant>),
    Media(MediaPlaylist),
}

/// Split an attribute list, honoring quoted values
pub fn parse_attributes(list: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut rest = list.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        attrs.insert(key.trim().to_string(), value.to_string());
        rest = remaining.trim_start_matches(',').trim_start();
    }

    attrs
}

/// Seconds as a finite, non-negative value no longer than a day
fn parse_duration(value: &str) -> Option<f64> {
    let secs: f64 = value.trim().parse().ok()?;
    (secs.is_finite() && (0.0..=MAX_DURATION_SECS).contains(&secs)).then_some(secs)
}

fn invalid_duration(tag: &str, value: &str) -> PlayerError {
    PlayerError::Hls {
        kind: "manifestParsingError".into(),
        details: format!("invalid {} duration: {}", tag, value),
    }
}

fn parse_part(attrs: &str) -> Option<PartialSegment> {
    let attrs = parse_attributes(attrs);
    Some(PartialSegment {
        uri: attrs.get("URI")?.clone(),
        duration: parse_duration(attrs.get("DURATION")?)?,
        independent: attrs.get("INDEPENDENT").map(|v| v == "YES").unwrap_or(false),
    })
}

fn parse_resolution(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

pub fn parse(text: &str) -> Result<Playlist> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    if lines.next() != Some("#EXTM3U") {
        return Err(PlayerError::Hls {
            kind: "manifestParsingError".into(),
            details: "missing #EXTM3U header".into(),
        });
    }

    let mut variants = Vec::new();
    let mut pending_variant: Option<HashMap<String, String>> = None;

    let mut media = MediaPlaylist::default();
    let mut is_media = false;
    let mut duration: Option<f64> = None;
    let mut pdt: Option<DateTime<FixedOffset>> = None;
    let mut parts: Vec<PartialSegment> = Vec::new();

    for line in lines {
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            pending_variant = Some(parse_attributes(attrs));
        } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            is_media = true;
            media.target_duration =
                parse_duration(value).ok_or_else(|| invalid_duration("target", value))?;
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            is_media = true;
            media.media_sequence = value.parse().unwrap_or(0);
        } else if let Some(attrs) = line.strip_prefix("#EXT-X-PART-INF:") {
            media.part_target = match parse_attributes(attrs).get("PART-TARGET") {
                Some(v) => {
                    Some(parse_duration(v).ok_or_else(|| invalid_duration("part target", v))?)
                }
                None => None,
            };
        } else if let Some(attrs) = line.strip_prefix("#EXT-X-SERVER-CONTROL:") {
            media.can_block_reload = parse_attributes(attrs)
                .get("CAN-BLOCK-RELOAD")
                .map(|v| v == "YES")
                .unwrap_or(false);
        } else if let Some(attrs) = line.strip_prefix("#EXT-X-MAP:") {
            media.init_uri = parse_attributes(attrs).get("URI").cloned();
        } else if let Some(value) = line.strip_prefix("#EXT-X-PROGRAM-DATE-TIME:") {
            pdt = DateTime::parse_from_rfc3339(value).ok();
        } else if let Some(attrs) = line.strip_prefix("#EXT-X-PART:") {
            if let Some(part) = parse_part(attrs) {
                parts.push(part);
            }
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            is_media = true;
            let value = value.split(',').next().unwrap_or_default();
            let secs = parse_duration(value).ok_or_else(|| invalid_duration("segment", value))?;
            duration = Some(secs);
        } else if line == "#EXT-X-ENDLIST" {
            media.end_list = true;
        } else if line.starts_with('#') {
            continue;
        } else if let Some(attrs) = pending_variant.take() {
            variants.push(Variant {
                uri: line.to_string(),
                bandwidth: attrs.get("BANDWIDTH").and_then(|v| v.parse().ok()),
                codecs: attrs.get("CODECS").cloned(),
                resolution: attrs.get("RESOLUTION").and_then(|v| parse_resolution(v)),
            });
        } else if let Some(d) = duration.take() {
            let program_date_time = pdt.take().or_else(|| {
                media.segments.last().and_then(|prev| {
                    let delta = TimeDelta::try_milliseconds((prev.duration * 1000.0) as i64)?;
                    prev.program_date_time?.checked_add_signed(delta)
                })
            });
            media.segments.push(Segment {
                sequence: media
                    .media_sequence
                    .saturating_add(media.segments.len() as u64),
                uri: line.to_string(),
                duration: d,
                program_date_time,
                parts: std::mem::take(&mut parts),
            });
        }
    }

    if !variants.is_empty() {
        return Ok(Playlist::Multivariant(variants));
    }
    if !is_media {
        return Err(PlayerError::Hls {
            kind: "manifestParsingError".into(),
            details: "no variants or segments".into(),
        });
    }
    media.pending_parts = parts;
    Ok(Playlist::Media(media))
}
