use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sales velocity classification over the velocity window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VelocityTier {
    Fast,
    Medium,
    Slow,
    New,
}

impl VelocityTier {
    pub fn code(&self) -> &'static str {
        match self {
            VelocityTier::Fast => "FAST",
            VelocityTier::Medium => "MEDIUM",
            VelocityTier::Slow => "SLOW",
            VelocityTier::New => "NEW",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "FAST" => Some(VelocityTier::Fast),
            "MEDIUM" => Some(VelocityTier::Medium),
            "SLOW" => Some(VelocityTier::Slow),
            "NEW" => Some(VelocityTier::New),
            _ => None,
        }
    }
}

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Critical, // below the safety floor
    Consider, // at or under threshold but still above the floor
}

impl AlertSeverity {
    pub fn code(&self) -> &'static str {
        match self {
            AlertSeverity::Critical => "CRITICAL",
            AlertSeverity::Consider => "CONSIDER",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "CRITICAL" => Some(AlertSeverity::Critical),
            "CONSIDER" => Some(AlertSeverity::Consider),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Open,
    Superseded,
    Resolved,
}

impl AlertStatus {
    pub fn code(&self) -> &'static str {
        match self {
            AlertStatus::Open => "OPEN",
            AlertStatus::Superseded => "SUPERSEDED",
            AlertStatus::Resolved => "RESOLVED",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "OPEN" => Some(AlertStatus::Open),
            "SUPERSEDED" => Some(AlertStatus::Superseded),
            "RESOLVED" => Some(AlertStatus::Resolved),
            _ => None,
        }
    }
}

/// Outcome of evaluating one product against its reorder threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderAssessment {
    pub tier: VelocityTier,
    pub current_stock: i32,
    pub capacity: i32,
    pub tier_target: i32,
    pub threshold: i32,
    pub needs_reorder: bool,
    pub severity: Option<AlertSeverity>,
}

/// Persisted signal that a product is low
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorderAlert {
    pub alert_id: i64,
    pub product_code: String,
    pub current_stock: i32,
    pub threshold: i32,
    pub tier: VelocityTier,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAlert {
    pub product_code: String,
    pub current_stock: i32,
    pub threshold: i32,
    pub tier: VelocityTier,
    pub severity: AlertSeverity,
}
