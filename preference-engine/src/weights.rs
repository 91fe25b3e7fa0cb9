use memefeed_core::{ReactionKind, ReactionsConfig, DEFAULT_REACTION_WEIGHTS};
use std::collections::HashMap;

/// Reaction kind name to signed weight. Built once at startup and shared
/// read-only; kinds missing from the table weigh 0.0.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTable {
    weights: HashMap<String, f64>,
}

impl WeightTable {
    pub fn new<I, K>(weights: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        Self {
            weights: weights
                .into_iter()
                .map(|(kind, weight)| (kind.as_ref().to_ascii_uppercase(), weight))
                .collect(),
        }
    }

    pub fn from_config(config: &ReactionsConfig) -> Self {
        Self::new(config.weights.iter().map(|(kind, weight)| (kind, *weight)))
    }

    pub fn weight(&self, kind: &str) -> f64 {
        self.weights
            .get(&kind.to_ascii_uppercase())
            .copied()
            .unwrap_or(0.0)
    }

    pub fn weight_of(&self, kind: ReactionKind) -> f64 {
        self.weight(kind.as_str())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.weights.contains_key(&kind.to_ascii_uppercase())
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

impl Default for WeightTable {
    fn default() -> Self {
        Self::new(
            DEFAULT_REACTION_WEIGHTS
                .iter()
                .map(|(kind, weight)| (kind.as_str(), *weight)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights() {
        let table = WeightTable::default();
        assert_eq!(table.len(), 8);
        assert_eq!(table.weight_of(ReactionKind::Like), 1.0);
        assert_eq!(table.weight_of(ReactionKind::Dislike), -1.0);
        assert_eq!(table.weight_of(ReactionKind::Love), 2.0);
        assert_eq!(table.weight_of(ReactionKind::Laugh), 1.5);
        assert_eq!(table.weight_of(ReactionKind::Wow), 1.5);
        assert_eq!(table.weight_of(ReactionKind::Sad), 0.3);
        assert_eq!(table.weight_of(ReactionKind::Angry), -1.0);
        assert_eq!(table.weight_of(ReactionKind::Insightful), 1.0);
    }

    #[test]
    fn test_unknown_kind_weighs_zero() {
        let table = WeightTable::default();
        assert_eq!(table.weight("SHRUG"), 0.0);
        assert!(!table.contains("SHRUG"));
    }

    #[test]
    fn test_lookup_ignores_case() {
        let table = WeightTable::new([("love", 2.0)]);
        assert_eq!(table.weight("LOVE"), 2.0);
        assert_eq!(table.weight("Love"), 2.0);
        assert_eq!(table.weight_of(ReactionKind::Like), 0.0);
    }

    #[test]
    fn test_from_config_matches_default() {
        let table = WeightTable::from_config(&ReactionsConfig::default());
        assert_eq!(table, WeightTable::default());
    }
}
