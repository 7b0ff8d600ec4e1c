use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::query::QueryError;

/// Opaque id handed out by the fetch service for one outstanding request.
pub type RequestId = String;

/// What a fetch is for. Selects both the extraction rule sent to the fetch
/// service and the fact table the eventual result lands in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    PostText,
    FollowerCount,
}

impl Purpose {
    pub const ALL: [Purpose; 2] = [Purpose::PostText, Purpose::FollowerCount];

    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::PostText => "post_text",
            Purpose::FollowerCount => "follower_count",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "post_text" | "text" => Ok(Purpose::PostText),
            "follower_count" | "followers" => Ok(Purpose::FollowerCount),
            other => Err(QueryError::UnknownPurpose(other.to_string())),
        }
    }
}

/// Message handed to the fetch service when a fetch is issued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundFetch {
    pub request_id: RequestId,
    pub purpose: Purpose,
    /// Rendered `html(<url>).xpath(<path>)` query.
    pub query: String,
    /// Characters the fetch service strips from the extracted value.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub strip: String,
}

/// Message the fetch service sends back through the authenticated entry point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveredResult {
    pub request_id: RequestId,
    pub result: String,
}
