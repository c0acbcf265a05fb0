//! Topic names, topic filters and the topic trie
//!
//! Topic names are non-empty sequences of non-empty `/`-separated levels
//! and carry no wildcards. Topic filters additionally allow `+` (exactly
//! one level) and a terminal `#` (all remaining levels).

mod trie;

pub use trie::TopicTrie;

/// Validate a topic name (used in PUBLISH)
///
/// Topic names must be non-empty, contain no wildcard characters, no null
/// character, and every level must be non-empty.
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    for level in topic.split('/') {
        if level.is_empty() {
            return Err("topic name cannot contain empty levels");
        }
        if level.contains('+') || level.contains('#') {
            return Err("topic name cannot contain wildcards");
        }
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE / permission sets)
///
/// `#` must be the final level and stand alone; `+` must occupy a whole
/// level; all other levels must be non-empty literals.
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > 65535 {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();
        match level {
            "#" => {
                if !is_last {
                    return Err("multi-level wildcard must be the last level");
                }
            }
            "+" => {}
            _ => {
                if level.is_empty() {
                    return Err("topic filter cannot contain empty levels");
                }
                if level.contains('+') || level.contains('#') {
                    return Err("wildcard must occupy an entire level");
                }
            }
        }
    }

    Ok(())
}
