use std::collections::HashSet;

/// Trigram similarity in [0, 1] with PostgreSQL pg_trgm semantics: each
/// alphanumeric word is lowercased and padded with two leading blanks and
/// one trailing blank, and the score is the Jaccard index of the two
/// trigram sets.
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let left = trigrams(a);
    let right = trigrams(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let shared = left.intersection(&right).count();
    let union = left.len() + right.len() - shared;
    shared as f64 / union as f64
}

fn trigrams(s: &str) -> HashSet<[char; 3]> {
    let mut set = HashSet::new();
    for word in s.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let padded: Vec<char> = "  "
            .chars()
            .chain(word.chars().flat_map(char::to_lowercase))
            .chain(" ".chars())
            .collect();
        for window in padded.windows(3) {
            set.insert([window[0], window[1], window[2]]);
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_names_score_one() {
        assert_eq!(trigram_similarity("John Smith", "john  smith"), 1.0);
    }

    #[test]
    fn test_disjoint_names_score_zero() {
        assert_eq!(trigram_similarity("abc", "xyz"), 0.0);
        assert_eq!(trigram_similarity("", "xyz"), 0.0);
    }

    #[test]
    fn test_partial_overlap() {
        // {"  j"," jo","joh","ohn","hn "} vs {"  j"," jo","jon","on "}
        let score = trigram_similarity("john", "jon");
        assert!((score - 2.0 / 7.0).abs() < 1e-9);
        assert_eq!(score, trigram_similarity("jon", "john"));
    }
}
