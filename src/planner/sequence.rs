// =============================================================================
// Sequence Service — patterns → generators → filters, strictly in order
// =============================================================================

use std::sync::Arc;

use tracing::debug;

use super::filters::FilterRegistry;
use super::generators::GeneratorRegistry;
use super::opportunity::OpportunityContext;
use super::patterns::PatternRegistry;
use crate::config::PlannerSettings;
use crate::error::EngineError;
use crate::types::ActionSequence;

pub struct SequenceService {
    patterns: Arc<PatternRegistry>,
    generators: Arc<GeneratorRegistry>,
    filters: Arc<FilterRegistry>,
}

impl SequenceService {
    pub fn new(
        patterns: Arc<PatternRegistry>,
        generators: Arc<GeneratorRegistry>,
        filters: Arc<FilterRegistry>,
    ) -> Self {
        Self {
            patterns,
            generators,
            filters,
        }
    }

    /// Run the full pipeline. Individual pattern failures are tolerated
    /// (logged inside the pattern registry); a generator or filter failure
    /// is fatal to the call. Output size is bounded only by the enabled
    /// stages; downstream planning applies its own budget.
    pub fn generate(
        &self,
        ctx: &OpportunityContext,
        settings: &PlannerSettings,
    ) -> Result<Vec<ActionSequence>, EngineError> {
        let mut sequences = self
            .patterns
            .generate_sequences(ctx, &settings.enabled_patterns());
        debug!(count = sequences.len(), "patterns produced candidates");

        for generator in self.generators.get_enabled(&settings.enabled_generators()) {
            sequences = generator.expand(&sequences, ctx)?;
            debug!(
                generator = generator.name(),
                count = sequences.len(),
                "generator expanded candidates"
            );
        }

        for filter in self.filters.get_enabled(&settings.enabled_filters()) {
            sequences = filter.apply(sequences, ctx)?;
            debug!(
                filter = filter.name(),
                count = sequences.len(),
                "filter reduced candidates"
            );
        }

        Ok(sequences)
    }
}
