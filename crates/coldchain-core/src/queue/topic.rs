//! Topic-exchange routing: dot-separated words, `*` matches exactly one word,
//! `#` matches zero or more.

pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) => (word == "*" || word == first) && matches_words(rest, key_rest),
            None => false,
        },
    }
}

/// Wildcards must occupy a whole word.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    if pattern.trim().is_empty() {
        return Err("binding pattern must not be empty".to_string());
    }
    for word in pattern.split('.') {
        if word != "#" && word != "*" && (word.contains('#') || word.contains('*')) {
            return Err(format!(
                "binding pattern '{pattern}' mixes a wildcard into word '{word}'"
            ));
        }
    }
    Ok(())
}
