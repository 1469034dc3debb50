use crate::alerts;
use crate::model::{
    resource_id, AlertCommand, AlertLevel, Command, MutationCommand, MutationKind, Notification,
    Operation, ResourceKind,
};
use crate::store::ClientCaches;
use serde_json::Value;

pub mod paths {
    pub const DASHBOARD: &str = "/dashboard";
    pub const USERS: &str = "/users";
    pub const CLUSTERS: &str = "/clusters";
    pub const CSP_DOMAINS: &str = "/csp-domains";
    pub const VOLUMES: &str = "/volumes";
    pub const SERVICE_PLANS: &str = "/service-plans";
    pub const APPLICATION_GROUPS: &str = "/application-groups";
    pub const CONSISTENCY_GROUPS: &str = "/consistency-groups";
    pub const PROTECTION_DOMAINS: &str = "/protection-domains";
    pub const BACKUP: &str = "/backup";
    pub const RECOVER: &str = "/recover";
    pub const SETTINGS: &str = "/settings";
}

pub const FAILED_STATE: &str = "FAILED";

#[derive(Debug, Clone, Copy)]
enum PathRule {
    /// Whole path equals the screen path.
    Exact(&'static str),
    /// Any path segment equals the name (list and detail screens).
    Segment(&'static str),
}

impl PathRule {
    fn matches(self, path: &str) -> bool {
        match self {
            Self::Exact(expected) => path == expected,
            Self::Segment(name) => path.split('/').any(|segment| segment == name),
        }
    }
}

enum Relevance {
    Always,
    Screens(&'static [PathRule]),
}

fn relevance(kind: &ResourceKind) -> Relevance {
    use self::paths::*;
    use self::PathRule::{Exact, Segment};

    let rules: &'static [PathRule] = match kind {
        ResourceKind::ConnectionStatus
        | ResourceKind::WatcherStatus
        | ResourceKind::AuthExpired
        | ResourceKind::Unknown(_) => return Relevance::Always,
        ResourceKind::Accounts => &[Segment("accounts"), Exact(CSP_DOMAINS), Exact(USERS)],
        ResourceKind::Clusters => &[Segment("clusters"), Exact(CSP_DOMAINS), Exact(DASHBOARD)],
        ResourceKind::CspDomains => &[Segment("csp-domains"), Exact(CLUSTERS), Exact(DASHBOARD)],
        ResourceKind::CspCredentials => &[Segment("csp-domains"), Exact(SETTINGS)],
        ResourceKind::ConsistencyGroups => &[
            Segment("consistency-groups"),
            Exact(APPLICATION_GROUPS),
            Exact(VOLUMES),
        ],
        ResourceKind::ApplicationGroups => &[
            Segment("application-groups"),
            Exact(CONSISTENCY_GROUPS),
            Exact(VOLUMES),
        ],
        ResourceKind::Nodes => &[Segment("clusters")],
        ResourceKind::Pools => &[Exact(SERVICE_PLANS), Exact(DASHBOARD), Segment("clusters")],
        ResourceKind::ProtectionDomains => &[
            Exact(PROTECTION_DOMAINS),
            Segment("accounts"),
            Exact(BACKUP),
            Exact(RECOVER),
        ],
        ResourceKind::ServicePlans => &[Segment("service-plans"), Exact(VOLUMES), Exact(DASHBOARD)],
        ResourceKind::ServicePlanAllocations => &[
            Exact(SERVICE_PLANS),
            Exact(DASHBOARD),
            Segment("clusters"),
        ],
        ResourceKind::Snapshots => &[Exact(BACKUP), Exact(RECOVER), Segment("volumes")],
        ResourceKind::Users => &[Exact(USERS), Segment("accounts")],
        ResourceKind::Volumes => &[
            Segment("volumes"),
            Exact(DASHBOARD),
            Exact(APPLICATION_GROUPS),
            Exact(CONSISTENCY_GROUPS),
            Exact(RECOVER),
        ],
        ResourceKind::VolumeSeriesRequests => &[
            Segment("volumes"),
            Exact(DASHBOARD),
            Exact(BACKUP),
            Exact(RECOVER),
        ],
        ResourceKind::Metrics => &[Exact(DASHBOARD), Segment("volumes"), Segment("clusters")],
    };
    Relevance::Screens(rules)
}

/// Turns one notification into the commands the current screen needs. An
/// empty result means the notification is irrelevant to what is displayed.
pub fn route(notification: &Notification, current_path: &str, caches: &ClientCaches) -> Vec<Command> {
    let path = normalize_path(current_path);
    match relevance(&notification.kind) {
        Relevance::Always => return status_commands(notification),
        Relevance::Screens(rules) => {
            if !rules.iter().any(|rule| rule.matches(path)) {
                tracing::debug!(kind = %notification.kind, path, "notification not relevant to current screen");
                return Vec::new();
            }
        }
    }

    let mut commands = Vec::new();
    if notification.kind == ResourceKind::VolumeSeriesRequests {
        if let Some(alert) = failed_request_alert(&notification.payload, caches) {
            commands.push(Command::Alert(alert));
        }
    }
    if let Some(mutation) = mutation_for(notification) {
        commands.push(Command::Mutate(mutation));
    }
    commands
}

fn status_commands(notification: &Notification) -> Vec<Command> {
    let message = notification.message.clone();
    match &notification.kind {
        ResourceKind::AuthExpired => vec![Command::ForceLogout { message }],
        ResourceKind::ConnectionStatus => vec![info(message.unwrap_or_else(|| {
            status_text("Server connection", &notification.payload)
        }))],
        ResourceKind::WatcherStatus => vec![info(message.unwrap_or_else(|| {
            status_text("Change watcher", &notification.payload)
        }))],
        ResourceKind::Unknown(tag) if tag.is_empty() => vec![Command::Alert(AlertCommand {
            level: AlertLevel::Error,
            text: message.unwrap_or_else(|| "Received a notification that could not be read".to_string()),
        })],
        other => vec![info(
            message.unwrap_or_else(|| format!("Received {other} notification")),
        )],
    }
}

fn info(text: String) -> Command {
    Command::Alert(AlertCommand {
        level: AlertLevel::Info,
        text,
    })
}

fn status_text(subject: &str, payload: &Value) -> String {
    match payload.get("status").and_then(Value::as_str) {
        Some(status) => format!("{subject} status: {status}"),
        None => format!("{subject} status changed"),
    }
}

fn mutation_for(notification: &Notification) -> Option<MutationCommand> {
    let Some(operation) = notification.operation else {
        tracing::debug!(kind = %notification.kind, "notification without operation; no mutation");
        return None;
    };
    let id = resource_id(&notification.payload);
    let kind = match operation {
        Operation::Create => MutationKind::Append,
        Operation::Update => MutationKind::Replace,
        Operation::Delete => MutationKind::Remove,
    };
    if id.is_none() && kind != MutationKind::Append {
        tracing::warn!(kind = %notification.kind, operation = ?operation, "pushed record has no identity; mutation skipped");
        return None;
    }
    Some(MutationCommand {
        kind,
        resource_type: notification.kind.clone(),
        id,
        payload: notification.payload.clone(),
    })
}

fn failed_request_alert(payload: &Value, caches: &ClientCaches) -> Option<AlertCommand> {
    let state = payload
        .get("volumeSeriesRequestState")
        .and_then(Value::as_str)?;
    if state != FAILED_STATE {
        return None;
    }

    let operations = string_list(payload.get("requestedOperations"));
    let messages: Vec<String> = payload
        .get("requestMessages")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|m| m.get("message").and_then(Value::as_str).or_else(|| m.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let name = resolve_request_target(payload, caches);

    Some(AlertCommand {
        level: AlertLevel::Error,
        text: alerts::summarize(&messages, &operations, &name, state),
    })
}

/// Display name of what a request acted on, via the volume cache; falls back
/// to the raw identifier.
fn resolve_request_target(payload: &Value, caches: &ClientCaches) -> String {
    let field = |name: &str| {
        payload
            .get(name)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
    };

    if let Some(volume_id) = field("volumeSeriesId") {
        return caches
            .volume_name(volume_id)
            .unwrap_or_else(|| volume_id.to_string());
    }
    if let Some(group_id) = field("consistencyGroupId") {
        return caches
            .consistency_group_name(group_id)
            .unwrap_or_else(|| group_id.to_string());
    }
    resource_id(payload).unwrap_or_default()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn normalize_path(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}
