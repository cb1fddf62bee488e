//! Records exchanged between local storage, the progress service and the
//! conflict coordinator.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of entity whose progress is synchronised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Lesson,
    Quiz,
    Course,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lesson => "lesson",
            Self::Quiz => "quiz",
            Self::Course => "course",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lesson" => Ok(Self::Lesson),
            "quiz" => Ok(Self::Quiz),
            "course" => Ok(Self::Course),
            other => Err(format!("unknown entity type: {}", other)),
        }
    }
}

/// Identity of a synchronised entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }

    pub fn lesson(id: impl Into<String>) -> Self {
        Self::new(EntityType::Lesson, id)
    }

    pub fn quiz(id: impl Into<String>) -> Self {
        Self::new(EntityType::Quiz, id)
    }

    pub fn course(id: impl Into<String>) -> Self {
        Self::new(EntityType::Course, id)
    }
}

/// `<type>:<id>`, which is also the id of a conflict on this entity.
impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

impl FromStr for EntityKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity_type, entity_id) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <type>:<id>, got {}", s))?;
        if entity_id.is_empty() {
            return Err(format!("missing entity id in {}", s));
        }
        Ok(Self::new(entity_type.parse()?, entity_id))
    }
}

/// Progress payload. Fields the core does not interpret are preserved in
/// `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    /// Percentage, 0 to 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    /// Percentage, 0 to 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProgressData {
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }
}

/// One side's view of an entity at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSnapshot {
    pub updated_at: DateTime<Utc>,
    pub data: ProgressData,
}

impl VersionSnapshot {
    pub fn new(updated_at: DateTime<Utc>, data: ProgressData) -> Self {
        Self { updated_at, data }
    }
}

/// Which side of a conflict wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Server,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Server => "server",
        })
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "server" => Ok(Self::Server),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

/// An entity edited locally while the server moved on.
///
/// Lives only for the duration of a resolution session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// `<type>:<entity id>`.
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: String,
    pub local: VersionSnapshot,
    pub server: VersionSnapshot,
}

impl ConflictRecord {
    pub fn new(
        key: &EntityKey,
        entity_name: impl Into<String>,
        local: VersionSnapshot,
        server: VersionSnapshot,
    ) -> Self {
        Self {
            id: key.to_string(),
            entity_type: key.entity_type,
            entity_id: key.entity_id.clone(),
            entity_name: entity_name.into(),
            local,
            server,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}

/// Final per-conflict choice, keyed by conflict id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolutionDirective(BTreeMap<String, Side>);

impl ResolutionDirective {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, side: Side) -> Option<Side> {
        self.0.insert(id.into(), side)
    }

    pub fn get(&self, id: &str) -> Option<Side> {
        self.0.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Side)> {
        self.0.iter().map(|(id, side)| (id.as_str(), *side))
    }
}

impl FromIterator<(String, Side)> for ResolutionDirective {
    fn from_iter<I: IntoIterator<Item = (String, Side)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Locally stored progress for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRecord {
    pub key: EntityKey,
    pub entity_name: String,
    pub current: VersionSnapshot,
    /// Edited locally and not yet pushed.
    pub pending_sync: bool,
    /// What the server held when this record last synchronised.
    pub server_baseline: Option<VersionSnapshot>,
}

impl LocalRecord {
    /// A record that mirrors the server.
    pub fn synced(key: EntityKey, entity_name: impl Into<String>, server: VersionSnapshot) -> Self {
        Self {
            key,
            entity_name: entity_name.into(),
            current: server.clone(),
            pending_sync: false,
            server_baseline: Some(server),
        }
    }

    /// Record a local edit.
    pub fn edit(&mut self, data: ProgressData, at: DateTime<Utc>) {
        self.current = VersionSnapshot::new(at, data);
        self.pending_sync = true;
    }

    /// Mark the record as in agreement with `server`.
    pub fn mark_synced(&mut self, server: VersionSnapshot) {
        self.current = server.clone();
        self.server_baseline = Some(server);
        self.pending_sync = false;
    }
}

/// The server's copy of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub key: EntityKey,
    pub snapshot: VersionSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_round_trip() {
        let key = EntityKey::lesson("42");
        assert_eq!(key.to_string(), "lesson:42");
        assert_eq!("lesson:42".parse::<EntityKey>().unwrap(), key);
        assert!("lesson".parse::<EntityKey>().is_err());
        assert!("module:1".parse::<EntityKey>().is_err());
        assert!("quiz:".parse::<EntityKey>().is_err());
    }

    #[test]
    fn test_progress_data_preserves_unknown_fields() {
        let json = r#"{"progress":80,"bookmark":"03:12"}"#;
        let data: ProgressData = serde_json::from_str(json).unwrap();
        assert_eq!(data.progress, Some(80.0));
        assert_eq!(data.extra["bookmark"], "03:12");

        let back = serde_json::to_value(&data).unwrap();
        assert_eq!(back["bookmark"], "03:12");
        assert!(back.get("score").is_none());
    }

    #[test]
    fn test_local_record_edit_and_sync() {
        let t0 = Utc::now();
        let server = VersionSnapshot::new(t0, ProgressData::default().with_progress(10.0));
        let mut record = LocalRecord::synced(EntityKey::quiz("q1"), "Quiz 1", server.clone());
        assert!(!record.pending_sync);

        record.edit(ProgressData::default().with_score(90.0), t0);
        assert!(record.pending_sync);
        assert_eq!(record.server_baseline.as_ref(), Some(&server));

        record.mark_synced(server.clone());
        assert!(!record.pending_sync);
        assert_eq!(record.current, server);
    }

    #[test]
    fn test_directive_serialises_as_map() {
        let directive: ResolutionDirective = [
            ("lesson:1".to_string(), Side::Local),
            ("lesson:2".to_string(), Side::Server),
        ]
        .into_iter()
        .collect();
        let json = serde_json::to_string(&directive).unwrap();
        assert_eq!(json, r#"{"lesson:1":"local","lesson:2":"server"}"#);
    }
}
