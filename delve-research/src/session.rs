//! High level entry point tying research and synthesis together

use crate::engine::{EngineSettings, ResearchEngine};
use crate::planner::QueryPlanner;
use crate::progress::ProgressReporter;
use crate::synthesizer::ReportSynthesizer;
use crate::types::ResearchOutcome;
use delve_core::performance::measure_async;
use delve_core::{
    CancellationToken, CompletionService, DelveConfig, DelveResult, OutputMode, ReportArtifact,
    ResearchSnapshot, SearchProvider,
};
use delve_llm::DelveLlmClient;
use delve_search::SearchProviderFactory;
use std::sync::Arc;
use tracing::info;

/// A finished session: the research outcome and its artifact
#[derive(Debug, Clone)]
pub struct ResearchRun {
    pub outcome: ResearchOutcome,
    pub artifact: ReportArtifact,
}

/// Deep research session over one search provider and one completion service
pub struct DeepResearch {
    config: DelveConfig,
    engine: ResearchEngine,
    synthesizer: ReportSynthesizer,
}

impl DeepResearch {
    /// Validate the configuration and build the configured services.
    ///
    /// Fails before any network activity on invalid settings, unknown providers or
    /// missing credentials.
    pub async fn from_config(config: DelveConfig) -> DelveResult<Self> {
        config.validate()?;
        config.validate_credentials()?;

        let search = SearchProviderFactory::from_settings(&config.search)?;
        let completion = DelveLlmClient::new(config.llm.clone()).await?;

        info!(
            search_provider = %search.kind(),
            llm_provider = %config.llm.provider,
            model = %config.llm.model,
            "Research session ready"
        );

        Ok(Self::with_services(config, search, Arc::new(completion)))
    }

    /// Build a session over explicit services
    pub fn with_services(
        config: DelveConfig,
        search: Arc<dyn SearchProvider>,
        completion: Arc<dyn CompletionService>,
    ) -> Self {
        let engine = ResearchEngine::new(
            search,
            completion.clone(),
            EngineSettings::from_config(&config),
        );
        let synthesizer = ReportSynthesizer::new(completion, config.llm.retry.clone());
        Self {
            config,
            engine,
            synthesizer,
        }
    }

    pub fn config(&self) -> &DelveConfig {
        &self.config
    }

    pub fn planner(&self) -> QueryPlanner {
        self.engine.planner()
    }

    /// Questions to ask the user before researching `topic`
    pub async fn clarifying_questions(&self, topic: &str, count: usize) -> DelveResult<Vec<String>> {
        self.planner()
            .clarifying_questions(topic, count, &CancellationToken::new())
            .await
    }

    /// Run the research phase only
    pub async fn research(
        &self,
        topic: &str,
        cancel: CancellationToken,
        progress: Option<ProgressReporter>,
    ) -> DelveResult<ResearchOutcome> {
        measure_async("research", self.engine.run(topic, cancel, progress)).await
    }

    /// Synthesize an artifact from a snapshot.
    ///
    /// Synthesis does not observe the research token, so a cancelled run can still
    /// be written up.
    pub async fn synthesize(
        &self,
        topic: &str,
        snapshot: &ResearchSnapshot,
        mode: OutputMode,
    ) -> DelveResult<ReportArtifact> {
        measure_async(
            "synthesis",
            self.synthesizer
                .synthesize(topic, snapshot, mode, &CancellationToken::new()),
        )
        .await
    }

    /// Research and synthesize in the configured output mode.
    ///
    /// A cancelled run is synthesized from its partial state.
    pub async fn run(
        &self,
        topic: &str,
        cancel: CancellationToken,
        progress: Option<ProgressReporter>,
    ) -> DelveResult<ResearchRun> {
        let outcome = self.research(topic, cancel, progress).await?;
        if outcome.is_cancelled() {
            info!(
                findings = outcome.snapshot.findings.len(),
                "Research cancelled, synthesizing partial results"
            );
        }

        let artifact = self
            .synthesize(topic, &outcome.snapshot, self.config.research.output_mode)
            .await?;

        Ok(ResearchRun { outcome, artifact })
    }
}
