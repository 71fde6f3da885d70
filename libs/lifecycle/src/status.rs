//! Component status, role tags and health roll-up.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a component.
///
/// Stored as an atomic u8 inside [`crate::Component`], so every variant has a
/// fixed discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ComponentStatus {
    Initializing = 0,
    InitializationError = 1,
    Stopped = 2,
    Starting = 3,
    Started = 4,
    StartedWithErrors = 5,
    Pausing = 6,
    Paused = 7,
    Stopping = 8,
    StoppedWithErrors = 9,
    Terminating = 10,
    Terminated = 11,
    LifecycleError = 12,
}

impl ComponentStatus {
    /// Converts from the u8 representation.
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Initializing,
            1 => Self::InitializationError,
            2 => Self::Stopped,
            3 => Self::Starting,
            4 => Self::Started,
            5 => Self::StartedWithErrors,
            6 => Self::Pausing,
            7 => Self::Paused,
            8 => Self::Stopping,
            9 => Self::StoppedWithErrors,
            10 => Self::Terminating,
            11 => Self::Terminated,
            12 => Self::LifecycleError,
            _ => return None,
        })
    }

    /// Returns true for the hard failure states.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::InitializationError | Self::LifecycleError)
    }

    /// Returns true for the "with errors" variants.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::StartedWithErrors | Self::StoppedWithErrors)
    }

    /// Returns true if the component is running (possibly degraded).
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started | Self::StartedWithErrors)
    }

    /// Returns true once no further transitions are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::LifecycleError)
    }

    /// Health bucket of this status taken on its own.
    pub fn health(&self) -> Health {
        if self.is_error() {
            Health::Error
        } else if self.is_degraded() {
            Health::Degraded
        } else {
            Health::Nominal
        }
    }

    /// Returns the status name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::InitializationError => "initialization_error",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::StartedWithErrors => "started_with_errors",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::StoppedWithErrors => "stopped_with_errors",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::LifecycleError => "lifecycle_error",
        }
    }
}

impl std::fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate health, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Nominal,
    Degraded,
    Error,
}

/// Role of a component inside a microservice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Microservice,
    TenantEngine,
    DataStore,
    CacheProvider,
    MessageConsumer,
    MessageProducer,
    EventProcessor,
    ScriptEngine,
    Other,
}

impl std::fmt::Display for ComponentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Microservice => "microservice",
            Self::TenantEngine => "tenant_engine",
            Self::DataStore => "data_store",
            Self::CacheProvider => "cache_provider",
            Self::MessageConsumer => "message_consumer",
            Self::MessageProducer => "message_producer",
            Self::EventProcessor => "event_processor",
            Self::ScriptEngine => "script_engine",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_u8_roundtrip() {
        for value in 0..=12u8 {
            let status = ComponentStatus::from_u8(value).unwrap();
            assert_eq!(status as u8, value);
        }
        assert!(ComponentStatus::from_u8(13).is_none());
    }

    #[test]
    fn test_health_ordering() {
        assert!(Health::Error > Health::Degraded);
        assert!(Health::Degraded > Health::Nominal);
        assert_eq!(ComponentStatus::LifecycleError.health(), Health::Error);
        assert_eq!(ComponentStatus::StartedWithErrors.health(), Health::Degraded);
        assert_eq!(ComponentStatus::Paused.health(), Health::Nominal);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ComponentStatus::StartedWithErrors).unwrap();
        assert_eq!(json, "\"started_with_errors\"");
    }
}
