//! Table columns and projectors for fleet entities.
//!
//! This module provides:
//! - Stable column IDs + specs (labels, widths)
//! - A registry mapping each [`EntityKind`] to its column set
//! - A JSON projector filling the kind-specific cells of a list row

#![forbid(unsafe_code)]

use smallvec::SmallVec;

use crate::{EntityKind, ProjectedEntry, Projector};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Name,
    Id,
    Age,
    Projected(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSpec {
    pub kind: ColumnKind,
    pub label: &'static str,
    pub width: usize,
}

// ---------------- Column IDs (stable) ----------------
// Agents
pub const AGENT_STATE: u32 = 10_001;
pub const AGENT_TAGS: u32 = 10_002;
pub const AGENT_LAST_HB: u32 = 10_003;

// Agent groups
pub const GROUP_MATCHING: u32 = 11_001;
pub const GROUP_TAGS: u32 = 11_002;

// Sinks
pub const SINK_BACKEND: u32 = 12_001;
pub const SINK_STATE: u32 = 12_002;

// Agent policies
pub const POLICY_BACKEND: u32 = 13_001;
pub const POLICY_VERSION: u32 = 13_002;

// Datasets
pub const DATASET_VALID: u32 = 14_001;
pub const DATASET_SINKS: u32 = 14_002;

fn col(kind: ColumnKind, label: &'static str, width: usize) -> ColumnSpec {
    ColumnSpec { kind, label, width }
}

/// Return the full column set for a kind, including Name/Id/Age.
pub fn columns_for(kind: EntityKind) -> Vec<ColumnSpec> {
    let mut cols = vec![col(ColumnKind::Name, "NAME", 24)];

    match kind {
        EntityKind::Agent => {
            cols.push(col(ColumnKind::Projected(AGENT_STATE), "STATE", 9));
            cols.push(col(ColumnKind::Projected(AGENT_TAGS), "TAGS", 28));
            cols.push(col(ColumnKind::Projected(AGENT_LAST_HB), "LAST HEARTBEAT", 21));
        }
        EntityKind::AgentGroup => {
            cols.push(col(ColumnKind::Projected(GROUP_MATCHING), "ONLINE/TOTAL", 13));
            cols.push(col(ColumnKind::Projected(GROUP_TAGS), "TAGS", 28));
        }
        EntityKind::Sink => {
            cols.push(col(ColumnKind::Projected(SINK_BACKEND), "BACKEND", 12));
            cols.push(col(ColumnKind::Projected(SINK_STATE), "STATE", 9));
        }
        EntityKind::AgentPolicy => {
            cols.push(col(ColumnKind::Projected(POLICY_BACKEND), "BACKEND", 10));
            cols.push(col(ColumnKind::Projected(POLICY_VERSION), "VERSION", 8));
        }
        EntityKind::Dataset => {
            cols.push(col(ColumnKind::Projected(DATASET_VALID), "VALID", 6));
            cols.push(col(ColumnKind::Projected(DATASET_SINKS), "SINKS", 6));
        }
    }

    cols.push(col(ColumnKind::Id, "ID", 36));
    cols.push(col(ColumnKind::Age, "AGE", 7));
    cols
}

/// Return the JSON projector for a kind.
pub fn projector_for(kind: EntityKind) -> std::sync::Arc<dyn Projector + Send + Sync> {
    std::sync::Arc::new(EntityProjector { kind })
}

/// Render every column of `cols` for one raw entity. `now_ts` is unix seconds.
pub fn render_row(cols: &[ColumnSpec], projector: &dyn Projector, raw: &serde_json::Value, now_ts: i64) -> Vec<String> {
    let projected = projector.project(raw);
    cols.iter()
        .map(|c| match &c.kind {
            ColumnKind::Name => raw.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            ColumnKind::Id => raw.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            ColumnKind::Age => {
                let created = raw
                    .get("ts_created")
                    .and_then(|v| v.as_str())
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.timestamp())
                    .unwrap_or(0);
                render_age(created, now_ts)
            }
            ColumnKind::Projected(id) => projected
                .iter()
                .find(|(pid, _)| pid == id)
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect()
}

pub fn render_age(creation_ts: i64, now_ts: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let mut secs = (now_ts - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

fn render_tags(raw: Option<&serde_json::Value>) -> Option<String> {
    let obj = raw?.as_object()?;
    if obj.is_empty() { return None; }
    let pairs: Vec<String> = obj
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v.as_str().unwrap_or("")))
        .collect();
    Some(pairs.join(","))
}

struct EntityProjector {
    kind: EntityKind,
}

impl EntityProjector {
    fn project_agent(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]> {
        let mut out = SmallVec::new();
        let state = raw.get("state").and_then(|v| v.as_str()).unwrap_or("new");
        out.push((AGENT_STATE, state.to_string()));
        // orb tags first, agent-reported tags fill in the rest
        let tags = render_tags(raw.get("orb_tags")).or_else(|| render_tags(raw.get("agent_tags")));
        if let Some(t) = tags { out.push((AGENT_TAGS, t)); }
        if let Some(hb) = raw.get("ts_last_hb").and_then(|v| v.as_str()) {
            out.push((AGENT_LAST_HB, hb.to_string()));
        }
        out
    }

    fn project_group(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]> {
        let mut out = SmallVec::new();
        let total = raw.pointer("/matching_agents/total").and_then(|v| v.as_u64()).unwrap_or(0);
        let online = raw.pointer("/matching_agents/online").and_then(|v| v.as_u64()).unwrap_or(0);
        out.push((GROUP_MATCHING, format!("{}/{}", online, total)));
        if let Some(t) = render_tags(raw.get("tags")) { out.push((GROUP_TAGS, t)); }
        out
    }

    fn project_sink(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]> {
        let mut out = SmallVec::new();
        if let Some(b) = raw.get("backend").and_then(|v| v.as_str()) { out.push((SINK_BACKEND, b.to_string())); }
        let state = raw.get("state").and_then(|v| v.as_str()).unwrap_or("unknown");
        out.push((SINK_STATE, state.to_string()));
        out
    }

    fn project_policy(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]> {
        let mut out = SmallVec::new();
        if let Some(b) = raw.get("backend").and_then(|v| v.as_str()) { out.push((POLICY_BACKEND, b.to_string())); }
        let version = raw.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
        out.push((POLICY_VERSION, version.to_string()));
        out
    }

    fn project_dataset(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]> {
        let mut out = SmallVec::new();
        let valid = raw.get("valid").and_then(|v| v.as_bool()).unwrap_or(false);
        out.push((DATASET_VALID, if valid { "Y".into() } else { "N".into() }));
        let sinks = raw.get("sink_ids").and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0);
        out.push((DATASET_SINKS, sinks.to_string()));
        out
    }
}

impl Projector for EntityProjector {
    fn project(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]> {
        match self.kind {
            EntityKind::Agent => self.project_agent(raw),
            EntityKind::AgentGroup => self.project_group(raw),
            EntityKind::Sink => self.project_sink(raw),
            EntityKind::AgentPolicy => self.project_policy(raw),
            EntityKind::Dataset => self.project_dataset(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_name_id_and_age() {
        for kind in EntityKind::ALL {
            let cols = columns_for(kind);
            assert_eq!(cols.first().map(|c| &c.kind), Some(&ColumnKind::Name));
            assert_eq!(cols.last().map(|c| &c.kind), Some(&ColumnKind::Age));
            assert!(cols.iter().any(|c| c.kind == ColumnKind::Id));
        }
    }

    #[test]
    fn group_row_renders_matching_agents() {
        let raw = serde_json::json!({
            "id": "g1",
            "name": "edge",
            "tags": { "region": "eu" },
            "matching_agents": { "total": 4, "online": 3 }
        });
        let cols = columns_for(EntityKind::AgentGroup);
        let pj = projector_for(EntityKind::AgentGroup);
        let row = render_row(&cols, pj.as_ref(), &raw, 0);
        assert_eq!(row, vec!["edge", "3/4", "region:eu", "g1", "-"]);
    }

    #[test]
    fn missing_projection_renders_dash() {
        let raw = serde_json::json!({ "id": "a1", "name": "probe" });
        let cols = columns_for(EntityKind::Agent);
        let row = render_row(&cols, projector_for(EntityKind::Agent).as_ref(), &raw, 0);
        assert_eq!(row[1], "new");
        assert_eq!(row[2], "-");
    }

    #[test]
    fn age_buckets() {
        assert_eq!(render_age(0, 100), "-");
        assert_eq!(render_age(100, 130), "30s");
        assert_eq!(render_age(100, 100 + 3 * 60), "3m");
        assert_eq!(render_age(100, 100 + 2 * 3600 + 60), "2h1m");
        assert_eq!(render_age(100, 100 + 86_400 + 3600), "1d1h");
    }
}
