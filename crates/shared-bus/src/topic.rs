//! Topic routing keys and wildcard matching.
//!
//! Keys are `.`-separated segments. In binding patterns `*` matches exactly
//! one segment and `#` matches zero or more.

/// `command.<service>.<name>`
pub fn command_key(service: &str, name: &str) -> String {
    format!("command.{}.{}", service, name)
}

/// `query.<service>.<name>`
pub fn query_key(service: &str, name: &str) -> String {
    format!("query.{}.{}", service, name)
}

/// `event.<name>`
pub fn event_key(name: &str) -> String {
    format!("event.{}", name)
}

/// Whether `routing_key` matches binding `pattern`.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_segments(rest, &key[skip..])),
        Some((&segment, rest)) => match key.split_first() {
            Some((&head, tail)) if segment == "*" || segment == head => match_segments(rest, tail),
            _ => false,
        },
    }
}
