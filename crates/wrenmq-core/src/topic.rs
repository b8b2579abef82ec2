//! Topic filter matching.

/// Test whether `topic` matches the subscription `filter`.
///
/// Levels are separated by `/` and compared byte-for-byte, case sensitive.
/// `#` matches the remainder of the topic, including zero trailing levels,
/// so `a/b/#` matches both `a/b/c` and `a/b` itself. `+` matches exactly one
/// non-empty level.
pub fn is_match(filter: &str, topic: &str) -> bool {
    if filter == topic {
        return true;
    }

    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();

    // A filter may exceed the topic by one level only, and only to hold a
    // trailing `#`.
    if filter_levels.len() - 1 > topic_levels.len() {
        return false;
    }

    for (i, level) in filter_levels.iter().enumerate() {
        match *level {
            "#" => return true,
            "+" => {
                if i >= topic_levels.len() || topic_levels[i].is_empty() {
                    return false;
                }
            }
            _ => {
                if i >= topic_levels.len() || topic_levels[i] != *level {
                    return false;
                }
            }
        }
    }

    topic_levels.len() == filter_levels.len()
}
