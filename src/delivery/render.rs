//! Outbound message rendering.
//!
//! Turns a packet group into one chat embed: author and title from the node
//! directory, provenance fields (packet link, hop budget, gateway count), an
//! optional position block, and the per-gateway relay breakdown grouped by
//! hop distance. Platform limits are enforced here: description at most
//! [`MAX_DESCRIPTION`] chars, at most [`MAX_FIELDS`] fields, each field value at
//! most [`MAX_FIELD_VALUE`] chars.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat};
use serde::Serialize;

use crate::logutil::{escape_log, MeshLogger};
use crate::meshtastic::nodeid::{node_hex_to_id, node_id_to_hex};
use crate::meshtastic::{AppPayload, Envelope};
use crate::protobuf::meshtastic_generated as proto;
use crate::storage::NodeInfo;

pub const MAX_DESCRIPTION: usize = 4096;
pub const MAX_FIELDS: usize = 25;
pub const MAX_FIELD_VALUE: usize = 1024;

pub const BOT_USERNAME: &str = "Mesh Bot";
pub const BOT_AVATAR_URL: &str =
    "https://cdn.discordapp.com/app-icons/1240017058046152845/295e77bec5f9a44f7311cf8723e9c332.png";
pub const DEFAULT_AVATAR_URL: &str = "https://cdn.discordapp.com/embed/avatars/0.png";
pub const EMBED_COLOR: u32 = 6810260;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub username: String,
    pub avatar_url: String,
    pub embeds: Vec<Embed>,
}

impl OutboundMessage {
    pub fn embed(&self) -> Option<&Embed> {
        self.embeds.first()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub color: u32,
    pub timestamp: String,
    pub author: EmbedAuthor,
    pub title: String,
    pub description: String,
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub icon_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl EmbedField {
    fn new(name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            inline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedImage {
    pub url: String,
}

/// Chat user that linked the sending node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub user_id: String,
    pub avatar_url: Option<String>,
}

/// Everything the renderer needs; lookups are done by the caller.
pub struct RenderRequest<'a> {
    pub packet_id: u32,
    pub envelopes: &'a [Envelope],
    pub text: &'a str,
    pub node_infos: &'a HashMap<String, NodeInfo>,
    pub owner: Option<&'a Owner>,
    pub mesh_view_base_url: &'a str,
    pub local_mesh: &'a str,
    pub log: &'a MeshLogger,
}

fn link(text: &str, url: &str, strip: bool) -> String {
    if strip {
        text.to_string()
    } else {
        format!("[{}]({})", text, url)
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Hop distance bucket. `Unknown` sorts after every numeric bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum HopGroup {
    Hops(i64),
    Unknown,
}

impl HopGroup {
    fn name(self) -> String {
        match self {
            HopGroup::Hops(0) => "Direct".to_string(),
            HopGroup::Hops(n) => format!("{} hops", n),
            HopGroup::Unknown => "Unknown Hops".to_string(),
        }
    }

    fn separator(self) -> &'static str {
        match self {
            HopGroup::Hops(0) => "\n",
            _ => " | ",
        }
    }
}

/// Multi-line summary of a position report.
pub fn position_summary(pos: &proto::Position) -> String {
    use proto::position::{AltSource, LocSource};

    let mut parts: Vec<String> = Vec::new();
    let time = DateTime::from_timestamp(i64::from(pos.time), 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default();
    parts.push(format!("Time: {}", time));
    parts.push(format!(
        "Location Source: {}",
        LocSource::try_from(pos.location_source)
            .map(|s| s.as_str_name())
            .unwrap_or("LOC_UNSET")
    ));
    parts.push(format!(
        "Altitude Source: {}",
        AltSource::try_from(pos.altitude_source)
            .map(|s| s.as_str_name())
            .unwrap_or("ALT_UNSET")
    ));
    if let Some(hae) = pos.altitude_hae {
        parts.push(format!("Altitude HAE: {} m", hae));
    }
    if let Some(sep) = pos.altitude_geoidal_separation {
        parts.push(format!("Geoidal Separation: {} m", sep));
    }
    for (label, value) in [("PDOP", pos.pdop), ("HDOP", pos.hdop), ("VDOP", pos.vdop)] {
        if value != 0 {
            parts.push(format!("{}: {}", label, value));
        }
    }
    if pos.gps_accuracy != 0 {
        parts.push(format!("GPS Accuracy: {} mm", pos.gps_accuracy));
    }
    if let Some(speed) = pos.ground_speed {
        parts.push(format!("Ground Speed: {} m/s", speed));
    }
    if let Some(track) = pos.ground_track {
        parts.push(format!("Ground Track: {:.2}°", f64::from(track) / 100.0));
    }
    if pos.fix_quality != 0 {
        parts.push(format!("Fix Quality: {}", pos.fix_quality));
    }
    if pos.fix_type != 0 {
        parts.push(format!("Fix Type: {}", pos.fix_type));
    }
    if pos.sats_in_view != 0 {
        parts.push(format!("Satellites in View: {}", pos.sats_in_view));
    }
    if pos.precision_bits != 0 {
        parts.push(format!("Precision Bits: {}", pos.precision_bits));
    }
    parts.join("\n")
}

pub fn static_map_url(lat: f64, lon: f64) -> String {
    format!(
        "https://api.smerty.org/api/v1/maps/static?lat={}&lon={}&width=400&height=400&zoom=12",
        lat, lon
    )
}

/// Distinct relaying gateways. In cross-deployment groups the same gateway
/// heard through two deployments counts twice.
pub fn gateway_count(envelopes: &[Envelope], local_mesh: &str) -> usize {
    envelopes
        .iter()
        .map(|e| (e.gateway_id.as_str(), e.mesh_id.as_deref().unwrap_or(local_mesh)))
        .collect::<HashSet<_>>()
        .len()
}

fn chunk_group(group: HopGroup, lines: &[String], log: &MeshLogger) -> Vec<EmbedField> {
    let base = group.name();
    let sep = group.separator();
    let mut fields = Vec::new();
    let mut current = String::new();
    let push = |fields: &mut Vec<EmbedField>, value: String| {
        let name = if fields.is_empty() {
            base.clone()
        } else {
            format!("{} (continued)", base)
        };
        fields.push(EmbedField::new(name, value, false));
    };

    for line in lines {
        let line = if line.chars().count() > MAX_FIELD_VALUE {
            log.error(format_args!(
                "Gateway field line exceeds {} chars (len={}): {}",
                MAX_FIELD_VALUE,
                line.chars().count(),
                escape_log(line)
            ));
            truncate_chars(line, MAX_FIELD_VALUE)
        } else {
            line.clone()
        };
        let joined = current.chars().count()
            + if current.is_empty() { 0 } else { sep.chars().count() }
            + line.chars().count();
        if !current.is_empty() && joined > MAX_FIELD_VALUE {
            push(&mut fields, std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str(sep);
        }
        current.push_str(&line);
    }
    if !current.is_empty() {
        push(&mut fields, current);
    }
    fields
}

fn gateway_fields(req: &RenderRequest<'_>, from_hex: &str, max_hop_start: u32, strip: bool) -> Vec<EmbedField> {
    let mut groups: BTreeMap<HopGroup, Vec<String>> = BTreeMap::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for envelope in req.envelopes {
        if !seen.insert(envelope.gateway_id.as_str()) {
            continue;
        }
        let packet = &envelope.packet;
        let gateway_hex = envelope.gateway_hex();
        let label = req
            .node_infos
            .get(gateway_hex)
            .map(|info| info.short_name.as_str())
            .unwrap_or(gateway_hex);

        let heard_direct = (packet.hop_start == 0 && packet.hop_limit == 0)
            || packet.hop_start == packet.hop_limit;
        let suffix = if gateway_hex == from_hex {
            "(Self Gated)".to_string()
        } else if heard_direct {
            format!("({} / {} dBm)", packet.rx_snr, packet.rx_rssi)
        } else {
            String::new()
        };
        let text = if suffix.is_empty() {
            label.to_string()
        } else {
            format!("{} {}", label, suffix)
        };
        let target = node_hex_to_id(gateway_hex)
            .map(|id| id.to_string())
            .unwrap_or_else(|| gateway_hex.to_string());
        let line = link(
            &text,
            &format!("{}/packet_list/{}", req.mesh_view_base_url, target),
            strip,
        );

        let group = if packet.hop_start == max_hop_start {
            HopGroup::Hops(packet.hops_away())
        } else {
            HopGroup::Unknown
        };
        groups.entry(group).or_default().push(line);
    }

    groups
        .iter()
        .flat_map(|(group, lines)| chunk_group(*group, lines, req.log))
        .collect()
}

/// Render a packet group. With `strip_links` every markdown link is reduced
/// to its text and the embed/author urls are dropped.
pub fn render(req: &RenderRequest<'_>, strip_links: bool) -> OutboundMessage {
    let first = &req.envelopes[0].packet;
    let from_hex = node_id_to_hex(first.from);
    let sender = req.node_infos.get(&from_hex);
    let max_hop_start = req
        .envelopes
        .iter()
        .map(|e| e.packet.hop_start)
        .max()
        .unwrap_or(0);

    let mut description = req.text.to_string();
    let mut fields = Vec::new();
    let mut image = None;

    if let Some(Ok(AppPayload::Position(pos))) = first.decoded().map(|d| d.app_payload()) {
        let lat = f64::from(pos.latitude_i.unwrap_or(0)) / 1e7;
        let lon = f64::from(pos.longitude_i.unwrap_or(0)) / 1e7;
        fields.push(EmbedField::new("Latitude", lat.to_string(), true));
        fields.push(EmbedField::new("Longitude", lon.to_string(), true));
        if let Some(alt) = pos.altitude.filter(|a| *a != 0) {
            fields.push(EmbedField::new("Altitude", format!("{}m", alt), true));
        }
        description = position_summary(&pos);
        image = Some(EmbedImage {
            url: static_map_url(lat, lon),
        });
    }

    if let Some(owner) = req.owner {
        fields.push(EmbedField::new("Owner", format!("<@{}>", owner.user_id), false));
    }
    fields.push(EmbedField::new(
        "Packet",
        link(
            &format!("{:x}", req.packet_id),
            &format!("{}/packet/{}", req.mesh_view_base_url, req.packet_id),
            strip_links,
        ),
        true,
    ));
    fields.push(EmbedField::new("Hop Limit", max_hop_start.to_string(), true));
    fields.push(EmbedField::new(
        "Gateway Count",
        gateway_count(req.envelopes, req.local_mesh).to_string(),
        true,
    ));
    fields.extend(gateway_fields(req, &from_hex, max_hop_start, strip_links));
    fields.truncate(MAX_FIELDS);

    let desc_len = description.chars().count();
    if desc_len > MAX_DESCRIPTION {
        req.log.error(format_args!(
            "Embed description exceeds {} chars (len={}): {}",
            MAX_DESCRIPTION,
            desc_len,
            escape_log(&description)
        ));
        description = truncate_chars(&description, MAX_DESCRIPTION);
    }

    let node_url = (!strip_links)
        .then(|| format!("{}/packet_list/{}", req.mesh_view_base_url, first.from));
    let timestamp = DateTime::from_timestamp(i64::from(first.rx_time), 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default();
    let icon_url = req
        .owner
        .and_then(|o| o.avatar_url.clone())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| DEFAULT_AVATAR_URL.to_string());

    OutboundMessage {
        username: BOT_USERNAME.to_string(),
        avatar_url: BOT_AVATAR_URL.to_string(),
        embeds: vec![Embed {
            url: node_url.clone(),
            color: EMBED_COLOR,
            timestamp,
            author: EmbedAuthor {
                name: sender
                    .map(|n| n.long_name.clone())
                    .unwrap_or_else(|| "Unknown".to_string()),
                url: node_url,
                icon_url,
            },
            title: sender
                .map(|n| n.short_name.clone())
                .unwrap_or_else(|| "UNK".to_string()),
            description,
            fields,
            image,
        }],
    }
}

/// One-line summary used in delivery logs.
pub fn describe(msg: &OutboundMessage) -> String {
    let mut out = String::new();
    if let Some(embed) = msg.embed() {
        let _ = write!(
            out,
            "{} ({}): {}",
            embed.author.name,
            embed.title,
            escape_log(&embed.description)
        );
    }
    out
}
