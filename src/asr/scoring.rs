//! Character-level edit distance.

/// Levenshtein distance between `hypothesis` and `reference`, counted in chars.
///
/// Insertions, deletions and substitutions each cost 1.
pub fn cer(hypothesis: &str, reference: &str) -> usize {
    let hyp: Vec<char> = hypothesis.chars().collect();
    let reference: Vec<char> = reference.chars().collect();
    levenshtein(&hyp, &reference)
}

/// Two-row dynamic-programming edit distance over arbitrary symbols.
pub fn levenshtein<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, x) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(x != y);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
