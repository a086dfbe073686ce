// =============================================================================
// Generators — pluggable expansion of a sequence collection
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;

use super::opportunity::OpportunityContext;
use super::patterns::lot_quantity;
use crate::error::EngineError;
use crate::types::ActionSequence;

/// A generator transforms a sequence collection into a (usually larger)
/// one. The input sequences are always carried through.
pub trait Generator: Send + Sync {
    fn name(&self) -> &'static str;
    fn expand(
        &self,
        sequences: &[ActionSequence],
        ctx: &OpportunityContext,
    ) -> Result<Vec<ActionSequence>, EngineError>;
}

pub struct GeneratorRegistry {
    generators: RwLock<Vec<Arc<dyn Generator>>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self {
            generators: RwLock::new(Vec::new()),
        }
    }

    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(CombinePairsGenerator));
        registry.register(Arc::new(ScaleDownGenerator));
        registry
    }

    pub fn register(&self, generator: Arc<dyn Generator>) {
        self.generators.write().push(generator);
    }

    pub fn get_enabled(&self, names: &[&str]) -> Vec<Arc<dyn Generator>> {
        let generators = self.generators.read();
        names
            .iter()
            .filter_map(|name| generators.iter().find(|g| g.name() == *name).cloned())
            .collect()
    }
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Built-in generators
// =============================================================================

/// Only this many head sequences participate in pairing, bounding the
/// combinatorial growth.
const MAX_PAIR_SOURCES: usize = 6;

/// Merge pairs of single-action sequences on distinct symbols into
/// two-action sequences.
pub struct CombinePairsGenerator;

impl Generator for CombinePairsGenerator {
    fn name(&self) -> &'static str {
        "combine_pairs"
    }

    fn expand(
        &self,
        sequences: &[ActionSequence],
        _ctx: &OpportunityContext,
    ) -> Result<Vec<ActionSequence>, EngineError> {
        let mut expanded = sequences.to_vec();

        let singles: Vec<&ActionSequence> = sequences
            .iter()
            .filter(|s| s.actions.len() == 1)
            .take(MAX_PAIR_SOURCES)
            .collect();

        for (i, first) in singles.iter().enumerate() {
            for second in singles.iter().skip(i + 1) {
                if first.actions[0].symbol == second.actions[0].symbol {
                    continue;
                }
                let mut actions = first.actions.clone();
                actions.extend(second.actions.clone());
                expanded.push(ActionSequence::new(actions, self.name()));
            }
        }

        Ok(expanded)
    }
}

/// Add half-sized variants of every sequence, keeping lot alignment.
/// Variants where any action rounds to zero are dropped.
pub struct ScaleDownGenerator;

impl Generator for ScaleDownGenerator {
    fn name(&self) -> &'static str {
        "scale_down"
    }

    fn expand(
        &self,
        sequences: &[ActionSequence],
        ctx: &OpportunityContext,
    ) -> Result<Vec<ActionSequence>, EngineError> {
        let mut expanded = sequences.to_vec();

        for sequence in sequences {
            let mut actions = Vec::with_capacity(sequence.actions.len());
            for action in &sequence.actions {
                let min_lot = ctx
                    .universe
                    .get(&action.symbol)
                    .map(|s| s.min_lot)
                    .unwrap_or(1.0);
                let quantity = lot_quantity(action.quantity / 2.0, min_lot);
                if quantity <= 0.0 {
                    actions.clear();
                    break;
                }
                let mut scaled = action.clone();
                scaled.quantity = quantity;
                actions.push(scaled);
            }
            if !actions.is_empty() {
                expanded.push(ActionSequence::new(actions, self.name()));
            }
        }

        Ok(expanded)
    }
}
