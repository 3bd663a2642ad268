/// Normalizes message text before it reaches the model or an embedding:
/// collapses runs of whitespace (including newlines) to single spaces and
/// trims the ends. HTML stripping happens upstream of this core.
pub fn clean_for_model(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Loose containment check used to decide whether a regenerated subject
/// still reflects the first message.
pub fn normalized_contains(haystack: &str, needle: &str) -> bool {
    let haystack = clean_for_model(haystack).to_lowercase();
    let needle = clean_for_model(needle).to_lowercase();
    !needle.is_empty() && haystack.contains(&needle)
}
