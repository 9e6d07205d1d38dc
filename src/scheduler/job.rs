use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Executor variant a job needs. Used as the lookup key in the executor registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Script,
    Shell,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Script => write!(f, "script"),
            JobKind::Shell => write!(f, "shell"),
        }
    }
}

/// Interpreter used to run a shell job's script file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellType {
    Bash,
    Sh,
    Ash,
    #[serde(rename = "powershell")]
    PowerShell,
    Cmd,
    Python,
    Node,
    Deno,
    Php,
}

impl ShellType {
    /// Program and leading arguments; the script path is appended.
    pub fn interpreter(&self) -> &'static [&'static str] {
        match self {
            ShellType::Bash => &["bash"],
            ShellType::Sh => &["sh"],
            ShellType::Ash => &["ash"],
            ShellType::PowerShell => &["powershell", "-NoProfile", "-File"],
            ShellType::Cmd => &["cmd", "/q", "/c"],
            ShellType::Python => &["python3"],
            ShellType::Node => &["node"],
            ShellType::Deno => &["deno", "run"],
            ShellType::Php => &["php"],
        }
    }

    pub fn file_suffix(&self) -> &'static str {
        match self {
            ShellType::Bash | ShellType::Sh | ShellType::Ash => ".sh",
            ShellType::PowerShell => ".ps1",
            ShellType::Cmd => ".bat",
            ShellType::Python => ".py",
            ShellType::Node => ".js",
            ShellType::Deno => ".ts",
            ShellType::Php => ".php",
        }
    }
}

impl std::str::FromStr for ShellType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bash" => Ok(ShellType::Bash),
            "sh" => Ok(ShellType::Sh),
            "ash" => Ok(ShellType::Ash),
            "powershell" | "pwsh" => Ok(ShellType::PowerShell),
            "cmd" => Ok(ShellType::Cmd),
            "python" | "python3" => Ok(ShellType::Python),
            "node" => Ok(ShellType::Node),
            "deno" => Ok(ShellType::Deno),
            "php" => Ok(ShellType::Php),
            other => Err(format!("unknown shell type: {other}")),
        }
    }
}

/// Which nodes may run a job, by instance name.
///
/// Each node applies the strategy to itself before claiming, so routing needs
/// no coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "instances", rename_all = "snake_case")]
pub enum RouteStrategy {
    #[default]
    Any,
    /// Only these instances run the job while at least one of them is active;
    /// otherwise any node may.
    Preferred(Vec<String>),
    Whitelist(Vec<String>),
    Blacklist(Vec<String>),
}

/// Parses `any` or `<strategy>:<name>,<name>...`.
impl std::str::FromStr for RouteStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "any" {
            return Ok(RouteStrategy::Any);
        }
        let (strategy, names) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <strategy>:<instances>, got {s}"))?;
        let names: Vec<String> = names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .collect();
        if names.is_empty() {
            return Err(format!("route strategy {strategy} needs at least one instance"));
        }
        match strategy {
            "preferred" => Ok(RouteStrategy::Preferred(names)),
            "whitelist" => Ok(RouteStrategy::Whitelist(names)),
            "blacklist" => Ok(RouteStrategy::Blacklist(names)),
            other => Err(format!("unknown route strategy: {other}")),
        }
    }
}

impl RouteStrategy {
    /// Whether `instance` may claim the job, given the instance names of the
    /// namespace's active nodes.
    pub fn allows(&self, instance: &str, active: &[&str]) -> bool {
        let listed = |names: &[String], name: &str| names.iter().any(|n| n == name);
        match self {
            RouteStrategy::Any => true,
            RouteStrategy::Preferred(names) => {
                listed(names, instance) || !active.iter().any(|a| listed(names, a))
            }
            RouteStrategy::Whitelist(names) => listed(names, instance),
            RouteStrategy::Blacklist(names) => !listed(names, instance),
        }
    }
}

/// What a job runs. The variant decides which executor handles it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Script { source: String },
    Shell { shell: ShellType, content: String },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Script { .. } => JobKind::Script,
            JobPayload::Shell { .. } => JobKind::Shell,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub namespace: String,
    pub name: String,
    pub payload: JobPayload,
    pub enabled: bool,
    /// Hard execution timeout; the node default applies when unset.
    pub timeout_ms: Option<u64>,
    /// Extra attempts within one fire after a failed or timed-out run.
    #[serde(default)]
    pub max_retry_count: u32,
    #[serde(default)]
    pub route_strategy: RouteStrategy,
    /// Executions across the cluster. Maintained by the store.
    #[serde(default)]
    pub run_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            name: name.into(),
            payload,
            enabled: true,
            timeout_ms: None,
            max_retry_count: 0,
            route_strategy: RouteStrategy::Any,
            run_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn shell(
        namespace: impl Into<String>,
        name: impl Into<String>,
        shell: ShellType,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            namespace,
            name,
            JobPayload::Shell {
                shell,
                content: content.into(),
            },
        )
    }

    pub fn script(
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self::new(
            namespace,
            name,
            JobPayload::Script {
                source: source.into(),
            },
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retries(mut self, max_retry_count: u32) -> Self {
        self.max_retry_count = max_retry_count;
        self
    }

    pub fn with_route(mut self, route_strategy: RouteStrategy) -> Self {
        self.route_strategy = route_strategy;
        self
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }
}
