//! Core enumerations for the envelope protocol.

use serde::{Deserialize, Serialize};

/// What an envelope asks its receiver to do.
///
/// Closed set: the control path matches on this exhaustively, so a new
/// intent is a compile error until every handler decides what to do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Invoke,
    Register,
    Subscribe,
    Ping,
    Pong,
    Response,
    System,
}

impl Intent {
    /// Parse a wire intent, accepting the aliases older clients send.
    ///
    /// Matching is case-insensitive. Task types (`compute`, `execute`,
    /// `stream`) all collapse into `Invoke`.
    pub fn parse(raw: &str) -> Option<Self> {
        let intent = match raw.trim().to_ascii_lowercase().as_str() {
            "invoke" | "compute" | "execute" | "stream" => Intent::Invoke,
            "register" | "register_adapter" => Intent::Register,
            "subscribe" => Intent::Subscribe,
            "ping" | "health_check" => Intent::Ping,
            "pong" => Intent::Pong,
            "response" => Intent::Response,
            "system" | "system_control" => Intent::System,
            _ => return None,
        };
        Some(intent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Invoke => "invoke",
            Intent::Register => "register",
            Intent::Subscribe => "subscribe",
            Intent::Ping => "ping",
            Intent::Pong => "pong",
            Intent::Response => "response",
            Intent::System => "system",
        }
    }

    /// Intents that only make sense addressed to the kernel itself.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Intent::Register | Intent::Subscribe | Intent::System
        )
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling hint carried in envelope metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}
