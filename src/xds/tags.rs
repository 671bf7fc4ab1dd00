//! Tag matching over the synthetic `x-kuma-tags` request header.
//!
//! The sidecar stamps its tag set into the header as `&key=value&...&`;
//! selector-derived routes match it with a regex built here. Keys are
//! emitted in sorted order on both sides, so the regexes stay aligned with
//! the serialized form.

use crate::core::resource::Tags;

/// Request header carrying the source dataplane's tag set.
pub const TAGS_HEADER_NAME: &str = "x-kuma-tags";

/// Serialize a tag set into the header value format.
pub fn serialize_tags(tags: &Tags) -> String {
    if tags.is_empty() {
        return String::new();
    }
    let mut out = String::from("&");
    for (key, value) in tags {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('&');
    }
    out
}

/// Regex matching any serialized tag set that satisfies `tags`. A `*` value
/// matches any value of the key.
pub fn matching_regex(tags: &Tags) -> String {
    let mut re = String::from(".*");
    for (key, value) in tags {
        re.push_str(&format!("&{}=", regex::escape(key)));
        match value.as_str() {
            "*" => re.push_str("[^&]*"),
            v => re.push_str(&format!("[^&]*{}[^&]*", regex::escape(v))),
        }
        re.push_str("[,&]");
        re.push_str(".*");
    }
    re
}

/// Alternation of several matching regexes.
pub fn regex_or<I: IntoIterator<Item = String>>(regexes: I) -> String {
    let joined: Vec<String> = regexes.into_iter().collect();
    format!("({})", joined.join("|"))
}
