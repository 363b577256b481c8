/// Event types and the host platform seam for homescript
///
/// This crate holds the vocabulary shared by the host runtime and whatever
/// delivers raw events to it, so either side can be swapped without the
/// other knowing.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Event kinds
// ============================================================================

/// Which manager type serves an event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ManagerKind {
    /// Entity state changes
    State,
    /// Named events fired on the host bus
    Bus,
    /// Interval timers
    Time,
}

impl fmt::Display for ManagerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerKind::State => write!(f, "state"),
            ManagerKind::Bus => write!(f, "bus"),
            ManagerKind::Time => write!(f, "time"),
        }
    }
}

/// Identifier of a class of host events a rule can react to
///
/// Textual form, as used by script authors:
/// - `state:<domain>.<object>` for a state change of one entity
/// - `every:<duration>` for an interval (`500ms`, `5s`, `2m`, `1h`)
/// - a bare identifier such as `motion` for a bus event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    StateChanged { entity_id: String },
    Bus(String),
    Interval(Duration),
}

impl EventKind {
    pub fn state(entity_id: impl Into<String>) -> Self {
        EventKind::StateChanged {
            entity_id: entity_id.into(),
        }
    }

    pub fn bus(event_type: impl Into<String>) -> Self {
        EventKind::Bus(event_type.into())
    }

    pub fn interval(period: Duration) -> Self {
        EventKind::Interval(period)
    }

    /// The manager type responsible for delivering this kind
    pub fn manager_kind(&self) -> ManagerKind {
        match self {
            EventKind::StateChanged { .. } => ManagerKind::State,
            EventKind::Bus(_) => ManagerKind::Bus,
            EventKind::Interval(_) => ManagerKind::Time,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::StateChanged { entity_id } => write!(f, "state:{}", entity_id),
            EventKind::Bus(event_type) => write!(f, "{}", event_type),
            EventKind::Interval(period) => write!(f, "every:{}", format_duration(*period)),
        }
    }
}

/// Reasons an event key is not recognized
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseEventKindError {
    #[error("event key is empty")]
    Empty,
    #[error("'{0}' is not a valid entity id (expected <domain>.<object>)")]
    InvalidEntityId(String),
    #[error("'{0}' is not a valid interval (expected e.g. 500ms, 5s, 2m, 1h)")]
    InvalidInterval(String),
    #[error("interval must be greater than zero")]
    ZeroInterval,
    #[error("'{0}' contains characters not allowed in an event name")]
    InvalidName(String),
}

impl FromStr for EventKind {
    type Err = ParseEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseEventKindError::Empty);
        }

        if let Some(entity_id) = s.strip_prefix("state:") {
            let valid = match entity_id.split_once('.') {
                Some((domain, object)) => is_identifier(domain) && is_identifier(object),
                None => false,
            };
            if !valid {
                return Err(ParseEventKindError::InvalidEntityId(entity_id.to_string()));
            }
            return Ok(EventKind::state(entity_id));
        }

        if let Some(period) = s.strip_prefix("every:") {
            let period = parse_duration(period)
                .ok_or_else(|| ParseEventKindError::InvalidInterval(period.to_string()))?;
            if period.is_zero() {
                return Err(ParseEventKindError::ZeroInterval);
            }
            return Ok(EventKind::Interval(period));
        }

        if s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
        {
            Ok(EventKind::bus(s))
        } else {
            Err(ParseEventKindError::InvalidName(s.to_string()))
        }
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Parse a short duration such as `250ms`, `5s`, `2m` or `1h`
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (number, unit) = s.split_at(split);
    let value: u64 = number.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs),
        "h" => value.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

/// Inverse of [`parse_duration`], picking the largest exact unit
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 3_600_000 == 0 && millis > 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 && millis > 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}ms", millis)
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Data carried by a host event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    #[default]
    None,
    State {
        entity_id: String,
        old: Option<String>,
        new: Option<String>,
    },
    Bus {
        data: BTreeMap<String, String>,
    },
    Tick {
        sequence: u64,
    },
}

impl EventPayload {
    /// Previous state of a state change, if this is one
    pub fn old_state(&self) -> Option<&str> {
        match self {
            EventPayload::State { old, .. } => old.as_deref(),
            _ => None,
        }
    }

    /// New state of a state change, if this is one
    pub fn new_state(&self) -> Option<&str> {
        match self {
            EventPayload::State { new, .. } => new.as_deref(),
            _ => None,
        }
    }

    /// Look up a value in a bus event's data
    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            EventPayload::Bus { data } => data.get(key).map(String::as_str),
            _ => None,
        }
    }
}

/// A raw event as delivered by the host platform
#[derive(Debug, Clone)]
pub struct HostEvent {
    pub kind: EventKind,
    pub payload: EventPayload,
    pub timestamp: Instant,
}

impl HostEvent {
    pub fn new(kind: EventKind, payload: EventPayload) -> Self {
        Self {
            kind,
            payload,
            timestamp: Instant::now(),
        }
    }

    pub fn bus(event_type: impl Into<String>, data: BTreeMap<String, String>) -> Self {
        Self::new(EventKind::bus(event_type), EventPayload::Bus { data })
    }

    pub fn state_changed(
        entity_id: impl Into<String>,
        old: Option<String>,
        new: Option<String>,
    ) -> Self {
        let entity_id = entity_id.into();
        Self::new(
            EventKind::state(entity_id.clone()),
            EventPayload::State { entity_id, old, new },
        )
    }
}

// ============================================================================
// Host platform seam
// ============================================================================

/// Callback invoked by the host for each matching event, on the host's own
/// delivery thread
pub type Listener = Arc<dyn Fn(&HostEvent) + Send + Sync>;

/// Handle returned by [`HostPlatform::listen`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// The host automation platform, as seen by the script host
pub trait HostPlatform: Send + Sync + 'static {
    /// Start delivering events of `kind` to `listener`
    fn listen(&self, kind: &EventKind, listener: Listener) -> ListenerId;

    /// Stop delivering to a listener. Once this returns, the host holds no
    /// reference to the listener and will not invoke it again.
    ///
    /// Returns false if the id was unknown.
    fn unlisten(&self, id: ListenerId) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bus_kind() {
        assert_eq!("motion".parse::<EventKind>(), Ok(EventKind::bus("motion")));
        assert_eq!(
            "door_opened".parse::<EventKind>().map(|k| k.manager_kind()),
            Ok(ManagerKind::Bus)
        );
    }

    #[test]
    fn test_parse_state_kind() {
        let kind: EventKind = "state:input_select.switch".parse().unwrap();
        assert_eq!(kind, EventKind::state("input_select.switch"));
        assert_eq!(kind.manager_kind(), ManagerKind::State);
        assert_eq!(kind.to_string(), "state:input_select.switch");
    }

    #[test]
    fn test_parse_interval_kind() {
        let kind: EventKind = "every:5s".parse().unwrap();
        assert_eq!(kind, EventKind::interval(Duration::from_secs(5)));
        assert_eq!(kind.manager_kind(), ManagerKind::Time);
        assert_eq!(kind.to_string(), "every:5s");
        assert_eq!(
            "every:250ms".parse::<EventKind>().unwrap().to_string(),
            "every:250ms"
        );
    }

    #[test]
    fn test_rejects_unrecognized_keys() {
        assert_eq!("".parse::<EventKind>(), Err(ParseEventKindError::Empty));
        assert!(matches!(
            "state:nodot".parse::<EventKind>(),
            Err(ParseEventKindError::InvalidEntityId(_))
        ));
        assert!(matches!(
            "every:soon".parse::<EventKind>(),
            Err(ParseEventKindError::InvalidInterval(_))
        ));
        assert_eq!(
            "every:0s".parse::<EventKind>(),
            Err(ParseEventKindError::ZeroInterval)
        );
        assert!(matches!(
            "Motion Detected".parse::<EventKind>(),
            Err(ParseEventKindError::InvalidName(_))
        ));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("ms"), None);
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
    }

    #[test]
    fn test_payload_accessors() {
        let event = HostEvent::state_changed("light.kitchen", None, Some("on".into()));
        assert_eq!(event.payload.new_state(), Some("on"));
        assert_eq!(event.kind, EventKind::state("light.kitchen"));

        let mut data = BTreeMap::new();
        data.insert("room".to_string(), "hall".to_string());
        let event = HostEvent::bus("motion", data);
        assert_eq!(event.payload.get("room"), Some("hall"));
        assert_eq!(event.payload.get("missing"), None);
    }
}
