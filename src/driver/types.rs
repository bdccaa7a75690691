// Core types shared by every automation driver

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// A named viewport the target application is driven at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentProfile {
    /// Display name (e.g., "Desktop", "Mobile")
    pub name: String,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// Largest width or height a parsed profile may ask for
pub const MAX_DIMENSION: u32 = 8192;

impl EnvironmentProfile {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
        }
    }

    /// The 1920x1080 desktop profile
    pub fn desktop() -> Self {
        Self::new("Desktop", 1920, 1080)
    }

    /// The 375x812 phone profile
    pub fn mobile() -> Self {
        Self::new("Mobile", 375, 812)
    }

    /// Parse a single profile from `Name:WxH`.
    pub fn parse(spec: &str) -> Option<Self> {
        let (name, size) = spec.trim().split_once(':')?;
        let (w, h) = size.trim().split_once('x')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let width: u32 = w.trim().parse().ok()?;
        let height: u32 = h.trim().parse().ok()?;
        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return None;
        }
        Some(Self::new(name, width, height))
    }

    /// Parse a comma-separated list of `Name:WxH` profiles.
    ///
    /// Returns `None` if any entry is malformed, if the list is empty, or if
    /// two profiles share a name (names key report files).
    pub fn parse_list(spec: &str) -> Option<Vec<Self>> {
        let mut profiles: Vec<Self> = Vec::new();
        for entry in spec.split(',').filter(|s| !s.trim().is_empty()) {
            let profile = Self::parse(entry)?;
            if profiles.iter().any(|p| p.name.eq_ignore_ascii_case(&profile.name)) {
                return None;
            }
            profiles.push(profile);
        }
        if profiles.is_empty() { None } else { Some(profiles) }
    }

    /// `WxH` label used in logs
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

impl fmt::Display for EnvironmentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}x{})", self.name, self.width, self.height)
    }
}

/// One actionable element on the board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Element {
    /// Visible value (e.g., "8")
    pub text: String,
    /// 0-based rank among the actionable elements of its snapshot
    pub position: usize,
}

impl Element {
    pub fn new(text: impl Into<String>, position: usize) -> Self {
        Self {
            text: text.into(),
            position,
        }
    }
}

static NEXT_SNAPSHOT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one capture. Unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    pub fn next() -> Self {
        SnapshotId(NEXT_SNAPSHOT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// All actionable elements at one instant, in position order.
///
/// Positions are only meaningful relative to the snapshot that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    pub id: SnapshotId,
    pub elements: Vec<Element>,
}

impl ElementSnapshot {
    /// Build a snapshot from values in position order, assigning a fresh id.
    pub fn from_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let elements = values
            .into_iter()
            .enumerate()
            .map(|(position, text)| Element::new(text, position))
            .collect();
        Self {
            id: SnapshotId::next(),
            elements,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn get(&self, position: usize) -> Option<&Element> {
        self.elements.get(position)
    }

    /// Values in position order, e.g. `["8", "1", "9"]`
    pub fn values(&self) -> Vec<&str> {
        self.elements.iter().map(|e| e.text.as_str()).collect()
    }
}

impl fmt::Display for ElementSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.values().join(", "))
    }
}

/// A PNG capture of the application window.
#[derive(Debug, Clone)]
pub struct Screenshot {
    /// PNG-encoded image data
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors raised by automation drivers
#[derive(Debug, Error)]
pub enum DriverError {
    /// The session could not be established
    #[error("session setup failed: {0}")]
    SessionSetup(String),

    /// The board could not be read
    #[error("snapshot capture failed: {0}")]
    Capture(String),

    /// The captured element is no longer where the snapshot put it
    #[error("target element not found: '{text}' at position {position}")]
    ElementNotFound { text: String, position: usize },

    /// Input could not be delivered to the application
    #[error("action failed: {0}")]
    Action(String),

    /// Screenshot rendering or encoding failed
    #[error("screenshot failed: {0}")]
    Screenshot(String),

    /// The session was already closed
    #[error("session is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_profile() {
        let profile = EnvironmentProfile::parse("Tablet:820x1180").unwrap();
        assert_eq!(profile, EnvironmentProfile::new("Tablet", 820, 1180));
        assert_eq!(profile.resolution(), "820x1180");
    }

    #[test]
    fn test_parse_profile_invalid() {
        assert!(EnvironmentProfile::parse("Tablet").is_none());
        assert!(EnvironmentProfile::parse("Tablet:820").is_none());
        assert!(EnvironmentProfile::parse(":820x1180").is_none());
        assert!(EnvironmentProfile::parse("Tablet:0x1180").is_none());
        assert!(EnvironmentProfile::parse("Wall:40000x40000").is_none());
        assert!(EnvironmentProfile::parse("Wall:8192x8192").is_some());
    }

    #[test]
    fn test_parse_list_rejects_duplicate_names() {
        assert!(EnvironmentProfile::parse_list("A:10x10,a:20x20").is_none());
        assert_eq!(EnvironmentProfile::parse_list("A:10x10, B:20x20").unwrap().len(), 2);
        assert!(EnvironmentProfile::parse_list(" , ").is_none());
    }

    #[test]
    fn test_snapshot_ids_are_unique() {
        let a = ElementSnapshot::from_values(["1", "2"]);
        let b = ElementSnapshot::from_values(["1", "2"]);
        assert_ne!(a.id, b.id);
        assert_eq!(a.elements, b.elements);
        assert_eq!(a.to_string(), "[1, 2]");
    }
}
