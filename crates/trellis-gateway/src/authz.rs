use tracing::warn;
use trellis_bus::api::config as cfg;
use trellis_object::{Fault, Map, Object};

use crate::dispatch::OperationInfo;

pub type ResourceMatcher = fn(&[u8], &[u8]) -> bool;

/// Checks the caller's access-control policies for `resource`.
///
/// Policies live in configuration at
/// `services/<component>/configuration/accessControl/<service>` as a map
/// of policy-id to `{operations, resources}`. Returns `Ok` on the first
/// policy whose operations cover this operation and whose resource
/// patterns match; `NoEntry` when nothing matches.
pub fn authorize(
    info: &OperationInfo,
    resource: &[u8],
    matcher: ResourceMatcher,
) -> Result<(), Fault> {
    let policies = cfg::read(&[
        b"services",
        &info.component,
        b"configuration",
        b"accessControl",
        info.service.as_bytes(),
    ])
    .map_err(|err| {
        warn!(service = info.service, %err, "failed to get access control policies");
        match err {
            trellis_bus::CallError::Remote(fault) => fault,
            trellis_bus::CallError::Local(fault) => fault,
        }
    })?;

    let Some(policy_map) = policies.as_map() else {
        warn!("accessControl section is not a map");
        return Err(Fault::Config);
    };

    for (_, policy) in policy_map.iter() {
        let Some(policy) = policy.as_map() else {
            warn!("policy value is not a map");
            return Err(Fault::Config);
        };
        // A malformed policy never grants access but doesn't block a
        // later well-formed one from matching.
        if policy_match(policy, info.operation, resource, matcher).unwrap_or(false) {
            return Ok(());
        }
    }

    Err(Fault::NoEntry)
}

fn str_list<'m>(policy: &'m Map<'_>, key: &[u8]) -> Result<Vec<&'m [u8]>, Fault> {
    let Some(items) = policy.get(key).and_then(Object::as_list) else {
        return Err(Fault::Config);
    };
    items.iter().map(|item| item.as_bytes().ok_or(Fault::Config)).collect()
}

fn policy_match(
    policy: &Map<'_>,
    operation: &str,
    resource: &[u8],
    matcher: ResourceMatcher,
) -> Result<bool, Fault> {
    let operations = str_list(policy, b"operations")?;
    let resources = str_list(policy, b"resources")?;

    let covers_operation = operations
        .iter()
        .any(|op| *op == operation.as_bytes() || *op == b"*");
    if !covers_operation {
        return Ok(false);
    }

    Ok(resources
        .iter()
        .any(|pattern| *pattern == b"*" || matcher(resource, pattern)))
}

/// Rewrites a policy resource pattern: `${...}` escape brackets are
/// stripped (contents literal) and each `*` becomes an internal
/// wildcard marker.
fn mark_wildcards(pattern: &[u8]) -> Vec<u8> {
    const MARKER: u8 = 0;
    let mut out = Vec::with_capacity(pattern.len());
    let mut in_escape = false;
    let mut i = 0;
    while i < pattern.len() {
        let c = pattern[i];
        if in_escape {
            if c == b'}' {
                in_escape = false;
            } else {
                out.push(c);
            }
        } else if c == b'*' {
            out.push(MARKER);
        } else if c == b'$' && pattern.get(i + 1) == Some(&b'{') {
            in_escape = true;
            i += 1;
        } else {
            out.push(c);
        }
        i += 1;
    }
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Matches `resource` against a marker-rewritten pattern: literal runs
/// in order, leftmost placement, with each marker spanning any byte
/// sequence (including empty).
fn glob_match(resource: &[u8], marked: &[u8]) -> bool {
    const MARKER: u8 = 0;
    let mut remaining = resource;
    let mut start = 0;
    let mut saw_wildcard = false;

    for i in 0..marked.len() {
        if marked[i] != MARKER {
            continue;
        }
        let segment = &marked[start..i];
        if start == 0 {
            if !remaining.starts_with(segment) {
                return false;
            }
            remaining = &remaining[segment.len()..];
        } else {
            let Some(pos) = find(remaining, segment) else {
                return false;
            };
            remaining = &remaining[pos + segment.len()..];
        }
        start = i + 1;
        saw_wildcard = true;
    }

    if !saw_wildcard {
        return remaining == marked;
    }
    remaining.ends_with(&marked[start..])
}

/// Default resource matcher: `*` wildcards with `${...}` escapes.
pub fn default_matcher(resource: &[u8], pattern: &[u8]) -> bool {
    glob_match(resource, &mark_wildcards(pattern))
}

/// MQTT topic matcher: on top of the default escape handling, `+`
/// consumes exactly one topic level and a terminal `#` consumes the
/// rest of the topic.
pub fn mqtt_matcher(resource: &[u8], pattern: &[u8]) -> bool {
    let marked = mark_wildcards(pattern);
    let pattern_levels: Vec<&[u8]> = marked.split(|b| *b == b'/').collect();
    let topic_levels: Vec<&[u8]> = resource.split(|b| *b == b'/').collect();

    for (i, pattern_level) in pattern_levels.iter().enumerate() {
        if *pattern_level == b"#" && i == pattern_levels.len() - 1 {
            return true;
        }
        let Some(topic_level) = topic_levels.get(i) else {
            return false;
        };
        if *pattern_level == b"+" {
            continue;
        }
        if !glob_match(topic_level, pattern_level) {
            return false;
        }
    }
    topic_levels.len() == pattern_levels.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_everything() {
        assert!(default_matcher(b"", b"*"));
        assert!(default_matcher(b"any/resource", b"*"));
    }

    #[test]
    fn literal_patterns_match_exactly() {
        assert!(default_matcher(b"widgets/1", b"widgets/1"));
        assert!(!default_matcher(b"widgets/1", b"widgets/2"));
        assert!(!default_matcher(b"widgets/12", b"widgets/1"));
    }

    #[test]
    fn wildcards_span_any_bytes() {
        assert!(default_matcher(b"widgets/1", b"widgets/*"));
        assert!(default_matcher(b"widgets/", b"widgets/*"));
        assert!(default_matcher(b"a-middle-b", b"a*b"));
        assert!(!default_matcher(b"a-middle-c", b"a*b"));
        assert!(default_matcher(b"abc", b"a*b*c"));
        assert!(!default_matcher(b"acb", b"a*b*c"));
    }

    #[test]
    fn escapes_are_literal() {
        // ${x}*${y} means: starts with literal x, ends with literal y.
        assert!(default_matcher(b"x-anything-y", b"${x}*${y}"));
        assert!(default_matcher(b"xy", b"${x}*${y}"));
        assert!(!default_matcher(b"x-anything-z", b"${x}*${y}"));
        // An escaped * is not a wildcard.
        assert!(default_matcher(b"a*b", b"${a*b}"));
        assert!(!default_matcher(b"aXb", b"${a*b}"));
    }

    #[test]
    fn mqtt_single_level_wildcard() {
        assert!(mqtt_matcher(b"sensor/1/temp", b"sensor/+/temp"));
        assert!(!mqtt_matcher(b"sensor/1/2/temp", b"sensor/+/temp"));
        assert!(!mqtt_matcher(b"sensor/1", b"sensor/+/temp"));
    }

    #[test]
    fn mqtt_multi_level_wildcard_is_terminal() {
        assert!(mqtt_matcher(b"sensor/1/temp", b"sensor/#"));
        assert!(!mqtt_matcher(b"sensor", b"sensor/1/#"));
        assert!(!mqtt_matcher(b"other/1", b"sensor/#"));
    }

    #[test]
    fn mqtt_levels_still_glob() {
        assert!(mqtt_matcher(b"widgets/1", b"widgets/*"));
        assert!(mqtt_matcher(b"widgets/1/state", b"widgets/*/state"));
        assert!(!mqtt_matcher(b"widgets/1/state", b"widgets/*"));
    }
}
