use fetch_wire::{render_query, FetchQuery, OutboundFetch, Purpose, DEFAULT_BASE_URL};

#[test]
fn outbound_message_carries_rendered_query() {
    let q = FetchQuery::for_purpose(Purpose::FollowerCount, "bob/status/9", DEFAULT_BASE_URL).unwrap();
    let out: OutboundFetch = q.into_outbound("req-1".to_string());
    assert_eq!(out.request_id, "req-1");
    assert_eq!(out.purpose, Purpose::FollowerCount);
    assert!(out.query.starts_with("html(https://twitter.com/bob)"));

    let v = serde_json::to_value(&out).unwrap();
    assert_eq!(v["purpose"], "follower_count");
    assert_eq!(v["strip"], ",");
}

#[test]
fn post_text_message_omits_empty_strip() {
    let q = FetchQuery::for_purpose(Purpose::PostText, "bob/status/9", DEFAULT_BASE_URL).unwrap();
    let v = serde_json::to_value(q.into_outbound("req-2".into())).unwrap();
    assert!(v.get("strip").is_none());
    assert_eq!(v["purpose"], "post_text");
}

#[test]
fn purpose_parses_cli_spellings() {
    assert_eq!("post-text".parse::<Purpose>().unwrap(), Purpose::PostText);
    assert_eq!("followers".parse::<Purpose>().unwrap(), Purpose::FollowerCount);
    assert!("likes".parse::<Purpose>().is_err());
}

#[test]
fn render_query_uses_default_base() {
    let s = render_query(Purpose::PostText, "carol/status/3").unwrap();
    assert!(s.contains("https://twitter.com/carol/status/3"));
}
