use std::sync::Arc;

use ctfpilot_providers::{
    CategoryClassifier, OpenAiCompatibleAnalyst, RuleBasedAnalyst, SignatureClassifier,
    SuggestionProvider, WithFallback,
};
use ctfpilot_tools::{CommandExecutor, LocalExecutor, LocalScriptRunner, ScriptRunner};

use crate::EngineConfig;

/// External services a run depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn CommandExecutor>,
    pub classifier: Arc<dyn CategoryClassifier>,
    pub analyst: Arc<dyn SuggestionProvider>,
    pub script_runner: Arc<dyn ScriptRunner>,
}

impl Collaborators {
    /// Local processes for tools and scripts. The model endpoint is used when
    /// an API key is configured, with offline fallbacks behind it.
    pub fn local(config: &EngineConfig) -> anyhow::Result<Self> {
        let executor = Arc::new(LocalExecutor::new(config.sandbox.clone()));
        let script_runner = Arc::new(LocalScriptRunner::new(config.sandbox.clone()));

        let (classifier, analyst): (Arc<dyn CategoryClassifier>, Arc<dyn SuggestionProvider>) =
            if config.provider.model_enabled() {
                tracing::info!(
                    model = %config.provider.model,
                    url = %config.provider.url,
                    "using model-backed analyst"
                );
                let model = Arc::new(OpenAiCompatibleAnalyst::new(&config.provider)?);
                (
                    Arc::new(WithFallback::new(model.clone(), SignatureClassifier::new())),
                    Arc::new(WithFallback::new(model, RuleBasedAnalyst::new())),
                )
            } else {
                tracing::info!("no API key configured; using rule-based analyst");
                (
                    Arc::new(SignatureClassifier::new()),
                    Arc::new(RuleBasedAnalyst::new()),
                )
            };

        Ok(Self {
            executor,
            classifier,
            analyst,
            script_runner,
        })
    }
}
