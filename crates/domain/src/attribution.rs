//! Attribution context: what content and surface produced a click.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{AttributionContextId, CreatorId};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// The surface a shopper clicked from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    Live,
    Replay,
    Clip,
    LinkInBio,
    Dm,
    Agent,
    Direct,
}

impl Surface {
    /// Returns the wire/storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Surface::Live => "live",
            Surface::Replay => "replay",
            Surface::Clip => "clip",
            Surface::LinkInBio => "link_in_bio",
            Surface::Dm => "dm",
            Surface::Agent => "agent",
            Surface::Direct => "direct",
        }
    }
}

impl std::fmt::Display for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Surface {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(Surface::Live),
            "replay" => Ok(Surface::Replay),
            "clip" => Ok(Surface::Clip),
            "link_in_bio" => Ok(Surface::LinkInBio),
            "dm" => Ok(Surface::Dm),
            "agent" => Ok(Surface::Agent),
            "direct" => Ok(Surface::Direct),
            other => Err(ParseError::new("surface", other)),
        }
    }
}

/// Immutable record of what caused a click.
///
/// Created once when a short link is issued and only ever referenced
/// afterwards; there are no mutators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionContext {
    pub id: AttributionContextId,
    pub creator_id: CreatorId,
    pub surface: Surface,
    pub platform: Option<String>,
    pub live_session_id: Option<String>,
    pub stream_id: Option<String>,
    pub replay_id: Option<String>,
    pub moment_id: Option<String>,
    pub campaign: Option<String>,
    pub source: Option<String>,
    pub medium: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl AttributionContext {
    /// Creates a context with only the surface set.
    pub fn new(creator_id: CreatorId, surface: Surface, created_at: DateTime<Utc>) -> Self {
        Self {
            id: AttributionContextId::new(),
            creator_id,
            surface,
            platform: None,
            live_session_id: None,
            stream_id: None,
            replay_id: None,
            moment_id: None,
            campaign: None,
            source: None,
            medium: None,
            metadata: HashMap::new(),
            created_at,
        }
    }

    /// Sets the originating platform.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Sets the live session and stream the click came from.
    pub fn with_live(mut self, live_session_id: impl Into<String>, stream_id: Option<String>) -> Self {
        self.live_session_id = Some(live_session_id.into());
        self.stream_id = stream_id;
        self
    }

    /// Sets the replay and optional moment within it.
    pub fn with_replay(mut self, replay_id: impl Into<String>, moment_id: Option<String>) -> Self {
        self.replay_id = Some(replay_id.into());
        self.moment_id = moment_id;
        self
    }

    /// Sets campaign tags.
    pub fn with_campaign(
        mut self,
        campaign: Option<String>,
        source: Option<String>,
        medium: Option<String>,
    ) -> Self {
        self.campaign = campaign;
        self.source = source;
        self.medium = medium;
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
