//! History Compressor (RCH): model-assisted rewrite of the run's history.
//!
//! The historian is a separate collaborator with its own request contract,
//! even though the default implementation calls the same model the run uses.

use std::time::Instant;

use anyhow::{Result, anyhow};
use tracing::{info, warn};

use crate::core::context::context_chars;
use crate::core::folding::push_bounded;
use crate::core::text::truncate_ellipsis;
use crate::core::types::{Observation, Role, TrendSample};
use crate::io::config::{EngineConfig, HistoryConfig, RetryConfig};
use crate::io::model::{ChatMessage, ModelClient, ModelRequest, complete_with_retry};
use crate::io::prompt::PromptEngine;
use crate::io::run_state::RunState;

/// Input handed to a historian.
#[derive(Debug, Clone)]
pub struct HistorianRequest<'a> {
    pub summary: &'a str,
    pub observations: &'a [Observation],
    pub logs: &'a [Observation],
    pub max_chars: usize,
}

/// Rewrites accumulated history into a dense narrative.
pub trait Historian {
    fn summarize(&self, request: &HistorianRequest<'_>) -> Result<String>;
}

/// Historian backed by the run's model endpoint.
pub struct ModelHistorian<'a, M: ModelClient + ?Sized> {
    model: &'a M,
    prompts: &'a PromptEngine,
    config: &'a HistoryConfig,
    retry: &'a RetryConfig,
}

impl<'a, M: ModelClient + ?Sized> ModelHistorian<'a, M> {
    pub fn new(
        model: &'a M,
        prompts: &'a PromptEngine,
        config: &'a HistoryConfig,
        retry: &'a RetryConfig,
    ) -> Self {
        Self {
            model,
            prompts,
            config,
            retry,
        }
    }
}

impl<M: ModelClient + ?Sized> Historian for ModelHistorian<'_, M> {
    fn summarize(&self, request: &HistorianRequest<'_>) -> Result<String> {
        let prompt = self.prompts.historian(
            request.max_chars,
            request.summary,
            request.observations,
            request.logs,
        )?;
        let model_request = ModelRequest {
            messages: vec![ChatMessage {
                role: Role::User,
                content: prompt,
            }],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        let text = complete_with_retry(self.model, &model_request, self.retry)?;
        Ok(text)
    }
}

/// Interval trigger, or context pressure. Nothing to compress means no call.
pub fn should_compress(state: &RunState, config: &EngineConfig) -> bool {
    let history = &config.history;
    if !history.enabled {
        return false;
    }
    if state.history_summary.trim().is_empty() && state.observations.len() < 2 {
        return false;
    }
    let on_interval = state.iteration % history.interval == 0;
    let threshold = config.context.max_context_chars as f64 * history.context_threshold;
    let under_pressure = context_chars(&state.message_history) as f64 >= threshold;
    on_interval || under_pressure
}

/// Replace `history_summary` with the historian's rewrite.
///
/// The result is hard-capped at `max_summary_chars`. On failure the summary is
/// left unchanged and a warning is recorded. Returns whether a compression happened.
pub fn compress<H: Historian + ?Sized>(
    historian: &H,
    state: &mut RunState,
    config: &EngineConfig,
) -> bool {
    let history = &config.history;
    let recent_start = state.observations.len().saturating_sub(history.recent_observations);
    let log_start = state.iteration_log.len().saturating_sub(history.recent_logs);
    let observations = &state.observations[recent_start..];
    let logs = &state.iteration_log[log_start..];

    let raw_chars: usize = observations
        .iter()
        .map(|obs| obs.action.chars().count() + obs.outcome.chars().count() + 4)
        .sum();
    let before = state.history_summary.chars().count() + raw_chars;

    let started = Instant::now();
    let result = historian
        .summarize(&HistorianRequest {
            summary: &state.history_summary,
            observations,
            logs,
            max_chars: history.max_summary_chars,
        })
        .and_then(|text| {
            let text = text.trim();
            if text.is_empty() {
                Err(anyhow!("historian returned an empty summary"))
            } else {
                Ok(truncate_ellipsis(text, history.max_summary_chars))
            }
        });
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let summary = match result {
        Ok(summary) => summary,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "history compression failed, keeping summary");
            state.warn(format!(
                "iteration {}: history compression skipped: {err:#}",
                state.iteration
            ));
            return false;
        }
    };

    let after = summary.chars().count();
    let metrics = &mut state.rch_metrics;
    metrics.compressions += 1;
    metrics.total_chars_before += before as u64;
    metrics.total_chars_after += after as u64;
    metrics.tokens_saved += before.saturating_sub(after) as u64 / history.chars_per_token;
    metrics.last_compression_ratio = if before == 0 {
        100.0
    } else {
        after as f64 / before as f64 * 100.0
    };
    metrics.last_elapsed_ms = elapsed_ms;
    push_bounded(
        &mut metrics.trend,
        TrendSample {
            iteration: state.iteration,
            size: after,
        },
        history.trend_limit,
    );

    state.history_summary = summary;
    let keep_from = state
        .observations
        .len()
        .saturating_sub(config.observations.keep_recent);
    state.observations.drain(..keep_from);

    info!(
        before,
        after,
        elapsed_ms,
        compressions = state.rch_metrics.compressions,
        "history compressed"
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Plan;
    use crate::error::ModelError;
    use crate::test_support::{ScriptedModel, observation};

    struct Fixed(Result<String, String>);

    impl Historian for Fixed {
        fn summarize(&self, _request: &HistorianRequest<'_>) -> Result<String> {
            self.0.clone().map_err(|err| anyhow!(err))
        }
    }

    fn state_with(count: u32) -> RunState {
        let mut state = RunState::new("r", "g", Plan::default(), 4);
        for iter in 1..=count {
            let obs = observation(iter, "run `make`", Some("run:make"), "Exit 2\nOutput: boom", false);
            state.observations.push(obs.clone());
            state.iteration_log.push(obs);
        }
        state.iteration = count;
        state
    }

    /// Verifies the summary stays within the cap even when the model returns 3x the limit.
    #[test]
    fn summary_is_hard_capped() {
        let config = EngineConfig::default();
        let mut state = state_with(6);
        let limit = config.history.max_summary_chars;

        for round in 0..3 {
            let historian = Fixed(Ok(format!("{round}").repeat(limit * 3)));
            assert!(compress(&historian, &mut state, &config));
            assert!(state.history_summary.chars().count() <= limit);
        }

        assert_eq!(state.rch_metrics.compressions, 3);
        assert_eq!(state.rch_metrics.trend.len(), 3);
        assert_eq!(state.observations.len(), config.observations.keep_recent);
    }

    #[test]
    fn failure_leaves_summary_and_records_warning() {
        let config = EngineConfig::default();
        let mut state = state_with(5);
        state.history_summary = "- Iter 1: chose sqlite".to_string();

        let compressed = compress(&Fixed(Err("connection refused".to_string())), &mut state, &config);

        assert!(!compressed);
        assert_eq!(state.history_summary, "- Iter 1: chose sqlite");
        assert_eq!(state.observations.len(), 5);
        assert_eq!(state.rch_metrics.compressions, 0);
        assert!(state.warnings[0].contains("connection refused"));
    }

    #[test]
    fn metrics_track_savings() {
        let config = EngineConfig::default();
        let mut state = state_with(10);

        assert!(compress(&Fixed(Ok("short".to_string())), &mut state, &config));

        let metrics = &state.rch_metrics;
        assert_eq!(metrics.total_chars_after, 5);
        assert!(metrics.total_chars_before > 100);
        assert_eq!(
            metrics.tokens_saved,
            (metrics.total_chars_before - 5) / config.history.chars_per_token
        );
        assert!(metrics.last_compression_ratio < 10.0);
        assert_eq!(metrics.trend[0].iteration, 10);
    }

    #[test]
    fn triggers_on_interval_and_skips_empty_history() {
        let config = EngineConfig::default();
        let mut state = state_with(5);
        assert!(should_compress(&state, &config));
        state.iteration = 6;
        assert!(!should_compress(&state, &config));

        let mut empty = state_with(1);
        empty.iteration = 5;
        assert!(!should_compress(&empty, &config));
    }

    #[test]
    fn model_historian_sends_one_user_turn() {
        let config = EngineConfig::default();
        let prompts = PromptEngine::new().expect("prompts");
        let model = ScriptedModel::new();
        model.push_reply("Decided on sqlite after postgres failed to start.");
        let historian = ModelHistorian::new(&model, &prompts, &config.history, &config.retry);
        let mut state = state_with(5);

        assert!(compress(&historian, &mut state, &config));

        let requests = model.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[0].temperature, 0.3);
        assert_eq!(requests[0].max_tokens, 1000);
        assert!(requests[0].messages[0].content.contains("project historian"));
        assert_eq!(
            state.history_summary,
            "Decided on sqlite after postgres failed to start."
        );

        let failing = ScriptedModel::new();
        failing.push_error(ModelError::Status {
            code: 400,
            body: "bad request".to_string(),
        });
        let historian = ModelHistorian::new(&failing, &prompts, &config.history, &config.retry);
        assert!(!compress(&historian, &mut state, &config));
    }
}
