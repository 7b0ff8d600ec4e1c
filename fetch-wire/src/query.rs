//! Fetch queries: the wire contract with the fetch service.
//!
//! A query is a target URL plus an XPath extraction rule, rendered as
//! `html(<url>).xpath(<extraction>)`. The fetch service loads the page,
//! evaluates the extraction and strips the listed characters from the value
//! before delivering it back. These strings must stay byte-identical for the
//! fetch service to keep understanding them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::subject::profile_of;
use crate::types::{OutboundFetch, Purpose, RequestId};

pub const DEFAULT_BASE_URL: &str = "https://twitter.com/";

/// First element of the post-text container on a rendered post page.
pub const POST_TEXT_XPATH: &str = "(//p[contains(@class,'tweet-text')])[1]/text()";

/// `data-count` attribute of the followers anchor on a rendered profile page.
pub const FOLLOWER_COUNT_XPATH: &str =
    "//a[@data-nav='followers']/span[@class='ProfileNav-value']/@data-count";

/// Thousands separators removed from follower counts by the fetch service.
pub const FOLLOWER_COUNT_STRIP: &str = ",";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("fetch subject is empty")]
    EmptySubject,
    #[error("fetch subject contains characters the query syntax cannot carry: {0:?}")]
    InvalidSubject(String),
    #[error("unknown fetch purpose: {0}")]
    UnknownPurpose(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchQuery {
    pub purpose: Purpose,
    pub url: String,
    pub extraction: String,
    #[serde(default)]
    pub strip: String,
}

impl FetchQuery {
    /// Build the query for `subject`.
    ///
    /// `FollowerCount` targets the profile page, so a post subject is reduced
    /// to its profile portion first.
    pub fn for_purpose(purpose: Purpose, subject: &str, base_url: &str) -> Result<Self, QueryError> {
        validate_subject(subject)?;
        let base = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let q = match purpose {
            Purpose::PostText => Self {
                purpose,
                url: format!("{base}{subject}"),
                extraction: POST_TEXT_XPATH.to_string(),
                strip: String::new(),
            },
            Purpose::FollowerCount => {
                let profile = profile_of(subject);
                validate_subject(profile)?;
                Self {
                    purpose,
                    url: format!("{base}{profile}"),
                    extraction: FOLLOWER_COUNT_XPATH.to_string(),
                    strip: FOLLOWER_COUNT_STRIP.to_string(),
                }
            }
        };
        Ok(q)
    }

    pub fn render(&self) -> String {
        format!("html({}).xpath({})", self.url, self.extraction)
    }

    /// Package the query for the fetch service once it has assigned an id.
    pub fn into_outbound(self, request_id: RequestId) -> OutboundFetch {
        let query = self.render();
        OutboundFetch {
            request_id,
            purpose: self.purpose,
            query,
            strip: self.strip,
        }
    }
}

fn validate_subject(subject: &str) -> Result<(), QueryError> {
    if subject.is_empty() {
        return Err(QueryError::EmptySubject);
    }
    if subject
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '(' | ')'))
    {
        return Err(QueryError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}
