/// Cosine similarity between two embedding vectors. Mismatched lengths and
/// zero vectors score 0.0 rather than erroring; retrieval treats them as
/// non-matches.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut left_norm = 0.0f32;
    let mut right_norm = 0.0f32;
    for (a, b) in left.iter().zip(right.iter()) {
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }

    dot / (left_norm.sqrt() * right_norm.sqrt())
}

/// Ranks candidates by similarity to `query`, keeping only those strictly
/// above `threshold`, descending, capped at `limit`.
pub fn rank_by_similarity<T>(
    query: &[f32],
    candidates: Vec<(T, Vec<f32>)>,
    threshold: f32,
    limit: usize,
) -> Vec<(T, f32)> {
    let mut scored = candidates
        .into_iter()
        .filter_map(|(item, embedding)| {
            let similarity = cosine_similarity(query, &embedding);
            (similarity > threshold).then_some((item, similarity))
        })
        .collect::<Vec<_>>();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored
}
