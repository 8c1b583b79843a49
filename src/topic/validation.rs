//! Topic name and filter validation
//!
//! Rules from the MQTT topic grammar:
//! - Topic names never contain wildcards
//! - `+` must occupy an entire level
//! - `#` must occupy an entire level and be the last one
//! - `$`-prefixed topics do not match filters whose first level is a wildcard

/// Maximum encoded length of a topic name or filter
const MAX_TOPIC_LEN: usize = 65_535;

/// Validate a topic name (used in PUBLISH and will messages)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic name exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }
    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err("topic filter exceeds maximum length");
    }
    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be the last level");
            }
        }
        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check whether a topic filter matches a concrete topic name.
///
/// `+` consumes exactly one level, a trailing `#` consumes the remainder
/// (including a zero-level remainder). `$`-prefixed topics are shielded
/// from wildcards at the first level.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    loop {
        match filter_levels.next() {
            Some("#") => return true,
            Some(pattern) => match topic_levels.next() {
                Some(level) if pattern == "+" || pattern == level => continue,
                _ => return false,
            },
            // Filter exhausted: match only if the topic is too
            None => return topic_levels.next().is_none(),
        }
    }
}
