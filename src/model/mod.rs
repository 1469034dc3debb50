use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Resource-kind tag carried in the `object` field of every pushed record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Accounts,
    Clusters,
    CspDomains,
    CspCredentials,
    ConsistencyGroups,
    ApplicationGroups,
    Nodes,
    Pools,
    ProtectionDomains,
    ServicePlans,
    ServicePlanAllocations,
    Snapshots,
    Users,
    Volumes,
    VolumeSeriesRequests,
    Metrics,
    ConnectionStatus,
    WatcherStatus,
    AuthExpired,
    Unknown(String),
}

impl ResourceKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "ACCOUNT" => Self::Accounts,
            "CLUSTER" => Self::Clusters,
            "CSP_DOMAIN" => Self::CspDomains,
            "CSP_CREDENTIAL" => Self::CspCredentials,
            "CONSISTENCY_GROUP" => Self::ConsistencyGroups,
            "APPLICATION_GROUP" => Self::ApplicationGroups,
            "NODE" => Self::Nodes,
            "POOL" => Self::Pools,
            "PROTECTION_DOMAIN" => Self::ProtectionDomains,
            "SERVICE_PLAN" => Self::ServicePlans,
            "SERVICE_PLAN_ALLOCATION" => Self::ServicePlanAllocations,
            "SNAPSHOT" => Self::Snapshots,
            "USER" => Self::Users,
            "VOLUME_SERIES" => Self::Volumes,
            "VOLUME_SERIES_REQUEST" => Self::VolumeSeriesRequests,
            "METRICS" => Self::Metrics,
            "CONNECTION_STATUS" => Self::ConnectionStatus,
            "WATCHER_STATUS" => Self::WatcherStatus,
            "AUTH_EXPIRED" => Self::AuthExpired,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Accounts => "ACCOUNT",
            Self::Clusters => "CLUSTER",
            Self::CspDomains => "CSP_DOMAIN",
            Self::CspCredentials => "CSP_CREDENTIAL",
            Self::ConsistencyGroups => "CONSISTENCY_GROUP",
            Self::ApplicationGroups => "APPLICATION_GROUP",
            Self::Nodes => "NODE",
            Self::Pools => "POOL",
            Self::ProtectionDomains => "PROTECTION_DOMAIN",
            Self::ServicePlans => "SERVICE_PLAN",
            Self::ServicePlanAllocations => "SERVICE_PLAN_ALLOCATION",
            Self::Snapshots => "SNAPSHOT",
            Self::Users => "USER",
            Self::Volumes => "VOLUME_SERIES",
            Self::VolumeSeriesRequests => "VOLUME_SERIES_REQUEST",
            Self::Metrics => "METRICS",
            Self::ConnectionStatus => "CONNECTION_STATUS",
            Self::WatcherStatus => "WATCHER_STATUS",
            Self::AuthExpired => "AUTH_EXPIRED",
            Self::Unknown(tag) => tag,
        }
    }

    /// Status kinds carry no resource and bypass path relevance.
    pub fn is_status(&self) -> bool {
        matches!(
            self,
            Self::ConnectionStatus | Self::WatcherStatus | Self::AuthExpired
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl Serialize for ResourceKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "POST" => Some(Self::Create),
            "PATCH" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub kind: ResourceKind,
    pub operation: Option<Operation>,
    pub payload: Value,
    pub message: Option<String>,
}

impl Notification {
    /// Frame that could not be decoded; only the free-text message survives.
    pub fn fallback(message: Option<String>) -> Self {
        Self {
            kind: ResourceKind::Unknown(String::new()),
            operation: None,
            payload: Value::Null,
            message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Append,
    Replace,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationCommand {
    pub kind: MutationKind,
    pub resource_type: ResourceKind,
    pub id: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertCommand {
    pub level: AlertLevel,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Mutate(MutationCommand),
    Alert(AlertCommand),
    ForceLogout { message: Option<String> },
}

/// Identity of a pushed resource: `meta.id`, else a top-level `id`.
pub fn resource_id(payload: &Value) -> Option<String> {
    payload
        .get("meta")
        .and_then(|meta| meta.get("id"))
        .or_else(|| payload.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tags_map_back_to_the_same_kind() {
        for tag in ["ACCOUNT", "VOLUME_SERIES", "VOLUME_SERIES_REQUEST", "AUTH_EXPIRED"] {
            assert_eq!(ResourceKind::from_tag(tag).tag(), tag);
        }
        let unknown = ResourceKind::from_tag("GADGET");
        assert_eq!(unknown, ResourceKind::Unknown("GADGET".to_string()));
        assert_eq!(unknown.tag(), "GADGET");
    }

    #[test]
    fn resource_id_prefers_meta_id() {
        assert_eq!(
            resource_id(&json!({ "meta": { "id": "vs-1" }, "id": "other" })).as_deref(),
            Some("vs-1")
        );
        assert_eq!(resource_id(&json!({ "id": "c-9" })).as_deref(), Some("c-9"));
        assert_eq!(resource_id(&json!({ "name": "x" })), None);
    }

    #[test]
    fn mutation_command_serializes_with_wire_names() {
        let cmd = Command::Mutate(MutationCommand {
            kind: MutationKind::Replace,
            resource_type: ResourceKind::Volumes,
            id: Some("vs-1".to_string()),
            payload: json!({}),
        });
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "mutate");
        assert_eq!(json["kind"], "replace");
        assert_eq!(json["resourceType"], "VOLUME_SERIES");
        assert_eq!(json["id"], "vs-1");
    }
}
