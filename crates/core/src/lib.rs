//! Orb core types: fleet entities, entity kinds and pagination primitives.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod columns;

/// Key/value tags attached to agents, groups, sinks and policies.
pub type Tags = BTreeMap<String, String>;

/// Page size used by the console list views when none is given.
pub const DEFAULT_PAGE_LIMIT: u64 = 100;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown entity kind: {0} (expected one of agents, groups, sinks, policies, datasets)")]
pub struct UnknownKind(pub String);

/// The fleet entity families served by the Orb API.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Agent,
    AgentGroup,
    Sink,
    AgentPolicy,
    Dataset,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Agent,
        EntityKind::AgentGroup,
        EntityKind::Sink,
        EntityKind::AgentPolicy,
        EntityKind::Dataset,
    ];

    /// REST path below `/api/v1/`.
    pub fn path(&self) -> &'static str {
        match self {
            EntityKind::Agent => "agents",
            EntityKind::AgentGroup => "agents/groups",
            EntityKind::Sink => "sinks",
            EntityKind::AgentPolicy => "policies/agent",
            EntityKind::Dataset => "policies/dataset",
        }
    }

    /// JSON key holding the items array in a list response.
    pub fn list_key(&self) -> &'static str {
        match self {
            EntityKind::Agent => "agents",
            EntityKind::AgentGroup => "agentGroups",
            EntityKind::Sink => "sinks",
            EntityKind::AgentPolicy => "data",
            EntityKind::Dataset => "datasets",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Agent => "agents",
            EntityKind::AgentGroup => "groups",
            EntityKind::Sink => "sinks",
            EntityKind::AgentPolicy => "policies",
            EntityKind::Dataset => "datasets",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EntityKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "agent" | "agents" => Ok(EntityKind::Agent),
            "group" | "groups" | "agent-group" | "agent-groups" | "agent_groups" => Ok(EntityKind::AgentGroup),
            "sink" | "sinks" => Ok(EntityKind::Sink),
            "policy" | "policies" | "agent-policy" | "agent-policies" => Ok(EntityKind::AgentPolicy),
            "dataset" | "datasets" => Ok(EntityKind::Dataset),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// A typed fleet entity addressable through [`EntityKind`].
pub trait Entity: DeserializeOwned + Serialize + Clone + Send + Sync + 'static {
    const KIND: EntityKind;
    fn id(&self) -> &str;
    fn name(&self) -> &str;
}

// ---- entities ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    New,
    Online,
    Offline,
    Stale,
    Removed,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::New => "new",
            AgentState::Online => "online",
            AgentState::Offline => "offline",
            AgentState::Stale => "stale",
            AgentState::Removed => "removed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: AgentState,
    #[serde(default)]
    pub orb_tags: Tags,
    #[serde(default)]
    pub agent_tags: Tags,
    #[serde(default)]
    pub ts_created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ts_last_hb: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MatchingAgents {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub online: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub matching_agents: MatchingAgents,
    #[serde(default)]
    pub ts_created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SinkState {
    Active,
    Error,
    Idle,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sink {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub state: SinkState,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub ts_created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentPolicy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub ts_created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub agent_policy_id: String,
    #[serde(default)]
    pub agent_group_id: String,
    #[serde(default)]
    pub sink_ids: Vec<String>,
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub ts_created: Option<DateTime<Utc>>,
}

macro_rules! impl_entity {
    ($ty:ty, $kind:expr) => {
        impl Entity for $ty {
            const KIND: EntityKind = $kind;
            fn id(&self) -> &str { &self.id }
            fn name(&self) -> &str { &self.name }
        }
    };
}

impl_entity!(Agent, EntityKind::Agent);
impl_entity!(AgentGroup, EntityKind::AgentGroup);
impl_entity!(Sink, EntityKind::Sink);
impl_entity!(AgentPolicy, EntityKind::AgentPolicy);
impl_entity!(Dataset, EntityKind::Dataset);

// ---- pagination ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    pub fn as_str(&self) -> &'static str {
        match self { SortDir::Asc => "asc", SortDir::Desc => "desc" }
    }
}

/// Offset/limit page request with optional ordering and name filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PageRequest {
    pub offset: u64,
    pub limit: u64,
    pub order: String,
    pub dir: SortDir,
    pub name: Option<String>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { offset: 0, limit: DEFAULT_PAGE_LIMIT, order: "name".to_string(), dir: SortDir::Asc, name: None }
    }
}

impl PageRequest {
    pub fn first(limit: u64) -> Self {
        Self { limit: limit.max(1), ..Self::default() }
    }

    pub fn at(&self, offset: u64) -> Self {
        Self { offset, ..self.clone() }
    }

    /// Request for the page following this one, if any remain below `total`.
    pub fn next(&self, total: u64) -> Option<Self> {
        let next = self.offset.saturating_add(self.limit.max(1));
        if next >= total { None } else { Some(self.at(next)) }
    }

    /// Ordering and filter, without the position. Cached pages are only valid for one query key.
    pub fn query_key(&self) -> (String, SortDir, Option<String>) {
        (self.order.clone(), self.dir, self.name.clone())
    }

    /// Query string pairs as sent to the API.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut q = vec![
            ("offset", self.offset.to_string()),
            ("limit", self.limit.to_string()),
            ("order", self.order.clone()),
            ("dir", self.dir.as_str().to_string()),
        ];
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            q.push(("name", name.to_string()));
        }
        q
    }
}

/// One page of a paginated list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub offset: u64,
    pub limit: u64,
    pub total: u64,
    pub items: Vec<T>,
}

impl<T> Page<T> {
    pub fn empty(offset: u64, limit: u64) -> Self {
        Self { offset, limit, total: 0, items: Vec::new() }
    }
}

impl Page<serde_json::Value> {
    /// Decode the raw items into a typed entity page.
    pub fn decode<T: Entity>(self) -> Result<Page<T>, serde_json::Error> {
        let items = self.items.into_iter().map(serde_json::from_value).collect::<Result<Vec<T>, _>>()?;
        Ok(Page { offset: self.offset, limit: self.limit, total: self.total, items })
    }
}

/// Entry representing a projected field: `(ColumnId, RenderedValue)`
pub type ProjectedEntry = (u32, String);

/// Projector takes a raw JSON entity and yields rendered table cells.
pub trait Projector: Send + Sync {
    fn project(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]>;
}

pub mod prelude {
    pub use super::{
        Agent, AgentGroup, AgentPolicy, AgentState, Dataset, Entity, EntityKind, Page, PageRequest, Projector, Sink,
        SinkState, SortDir, Tags,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_aliases() {
        assert_eq!("agents".parse::<EntityKind>(), Ok(EntityKind::Agent));
        assert_eq!("Groups".parse::<EntityKind>(), Ok(EntityKind::AgentGroup));
        assert_eq!("policy".parse::<EntityKind>(), Ok(EntityKind::AgentPolicy));
        assert!("pods".parse::<EntityKind>().is_err());
    }

    #[test]
    fn page_request_walks_until_total() {
        let req = PageRequest::first(10);
        let second = req.next(25).expect("second page");
        assert_eq!(second.offset, 10);
        let third = second.next(25).expect("third page");
        assert_eq!(third.offset, 20);
        assert!(third.next(25).is_none());
        assert!(PageRequest::first(10).next(10).is_none());
    }

    #[test]
    fn query_pairs_skip_empty_name() {
        let mut req = PageRequest::default();
        req.name = Some(String::new());
        assert!(req.query_pairs().iter().all(|(k, _)| *k != "name"));
        req.name = Some("edge".into());
        assert!(req.query_pairs().contains(&("name", "edge".to_string())));
    }

    #[test]
    fn agent_decodes_with_missing_fields() {
        let raw = serde_json::json!({
            "id": "0b5a6c1e-0000-4000-8000-000000000001",
            "name": "edge-1",
            "state": "online",
            "orb_tags": { "region": "eu" },
            "ts_created": "2021-06-01T10:00:00Z"
        });
        let agent: Agent = serde_json::from_value(raw).expect("decode");
        assert_eq!(agent.state, AgentState::Online);
        assert_eq!(agent.orb_tags.get("region").map(String::as_str), Some("eu"));
        assert!(agent.ts_last_hb.is_none());
    }

    #[test]
    fn unknown_sink_state_maps_to_unknown() {
        let raw = serde_json::json!({ "id": "s", "name": "prom", "state": "provisioning" });
        let sink: Sink = serde_json::from_value(raw).expect("decode");
        assert_eq!(sink.state, SinkState::Unknown);
    }
}
