//! Traffic counters and the short-lived cache in front of the stats API

use crate::stats::Stat;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default freshness window for cached counters
pub const DEFAULT_TRAFFIC_CACHE_TTL: Duration = Duration::from_secs(2);

/// Merged uplink/downlink counters for one tag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Traffic {
    pub is_inbound: bool,
    pub tag: String,
    pub up: i64,
    pub down: i64,
}

/// Split a counter name of the form `{inbound|outbound}>>>{tag}>>>traffic>>>{downlink|uplink}`
///
/// Returns `(is_inbound, tag, is_downlink)`.
fn parse_counter_name(name: &str) -> Option<(bool, &str, bool)> {
    let mut parts = name.split(">>>");
    let is_inbound = match parts.next()? {
        "inbound" => true,
        "outbound" => false,
        _ => return None,
    };
    let tag = parts.next().filter(|tag| !tag.is_empty())?;
    if parts.next()? != "traffic" {
        return None;
    }
    let is_down = match parts.next()? {
        "downlink" => true,
        "uplink" => false,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((is_inbound, tag, is_down))
}

/// Merge raw counters into one record per tag, in first-seen order
///
/// Counters that do not follow the traffic naming convention are ignored, and
/// the stats API's own inbound is dropped.
pub fn merge_stats(stats: &[Stat]) -> Vec<Traffic> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut traffics: Vec<Traffic> = Vec::new();

    for stat in stats {
        let Some((is_inbound, tag, is_down)) = parse_counter_name(&stat.name) else {
            continue;
        };
        if tag == crate::xray_config::API_TAG {
            continue;
        }

        let slot = *index.entry(tag).or_insert_with(|| {
            traffics.push(Traffic {
                is_inbound,
                tag: tag.to_string(),
                ..Default::default()
            });
            traffics.len() - 1
        });

        let traffic = &mut traffics[slot];
        if is_down {
            traffic.down = stat.value;
        } else {
            traffic.up = stat.value;
        }
    }

    traffics
}

/// Snapshot cache of the last fetched counters
pub struct TrafficCache {
    ttl: Duration,
    entry: RwLock<Option<(Instant, Vec<Traffic>)>>,
}

impl TrafficCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: RwLock::new(None),
        }
    }

    /// Copy of the cached counters if they are younger than the TTL
    pub fn get(&self) -> Option<Vec<Traffic>> {
        let entry = self.entry.read();
        match entry.as_ref() {
            Some((fetched_at, traffics)) if fetched_at.elapsed() < self.ttl => {
                Some(traffics.clone())
            }
            _ => None,
        }
    }

    pub fn set(&self, traffics: Vec<Traffic>) {
        *self.entry.write() = Some((Instant::now(), traffics));
    }

    pub fn invalidate(&self) {
        *self.entry.write() = None;
    }
}

impl Default for TrafficCache {
    fn default() -> Self {
        Self::new(DEFAULT_TRAFFIC_CACHE_TTL)
    }
}
