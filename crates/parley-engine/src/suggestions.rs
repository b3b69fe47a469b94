use rand::seq::SliceRandom;

use parley_core::suggestion::Suggestion;

/// Starter questions offered when a conversation has no content and no history.
pub const DEFAULT_SUGGESTIONS: &[&str] = &[
    "Write a short story about a lighthouse keeper",
    "Explain how vaccines train the immune system",
    "Plan a three day trip to Lisbon",
    "What are some tips for better sleep?",
    "Help me write a polite follow-up email",
    "Suggest a vegetarian dinner for four",
    "Explain recursion with a simple example",
    "What questions should I ask in a job interview?",
    "Summarize the causes of the French Revolution",
    "Give me a beginner weekly workout plan",
];

/// Pick `count` starter suggestions at random, in random order.
pub fn sample_default_suggestions(count: usize) -> Vec<Suggestion> {
    let mut rng = rand::thread_rng();
    let mut picked: Vec<&str> = DEFAULT_SUGGESTIONS
        .choose_multiple(&mut rng, count)
        .copied()
        .collect();
    picked.shuffle(&mut rng);
    picked.into_iter().map(Suggestion::query).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn sample_has_requested_size_without_repeats() {
        let sample = sample_default_suggestions(4);
        assert_eq!(sample.len(), 4);
        let unique: HashSet<_> = sample.iter().map(|s| s.title.clone()).collect();
        assert_eq!(unique.len(), 4);
        assert!(sample.iter().all(|s| DEFAULT_SUGGESTIONS.contains(&s.title.as_str())));
    }

    #[test]
    fn sample_caps_at_pool_size() {
        let sample = sample_default_suggestions(100);
        assert_eq!(sample.len(), DEFAULT_SUGGESTIONS.len());
    }
}
