// Public modules so bounty-core can use them
pub mod numeral;
pub mod query;
pub mod subject;
pub mod types;

pub use numeral::parse_leading_numeral;
pub use query::{FetchQuery, QueryError, DEFAULT_BASE_URL};
pub use subject::{fact_subject, profile_of, SubjectHash};
pub use types::{DeliveredResult, OutboundFetch, Purpose, RequestId};

/// --- Pure Rust API for bounty-core ---
///
/// Render the wire query the fetch service expects for `(purpose, subject)`
/// against the default base URL.
pub fn render_query(purpose: Purpose, subject: &str) -> Result<String, QueryError> {
    Ok(FetchQuery::for_purpose(purpose, subject, DEFAULT_BASE_URL)?.render())
}
