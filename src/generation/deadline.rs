//! Per-step deadlines with cooperative cancellation
//!
//! Each generation step runs as a future raced against its deadline and the
//! job's [`CancellationToken`]. The losing future is dropped, so the work it
//! was doing stops at its next await point instead of running on unobserved.

use crate::config::GenerationConfig;
use crate::error::{ChapterflowError, Result};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stages of generating one chapter, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationStep {
    Keywords,
    Retrieval,
    Search,
    Prompt,
    Model,
    References,
}

impl GenerationStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keywords => "keywords",
            Self::Retrieval => "retrieval",
            Self::Search => "search",
            Self::Prompt => "prompt",
            Self::Model => "model",
            Self::References => "references",
        }
    }
}

impl fmt::Display for GenerationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock limit for every step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDeadlines {
    pub keywords: Duration,
    pub retrieval: Duration,
    pub search: Duration,
    pub prompt: Duration,
    pub model: Duration,
    pub references: Duration,
}

impl StepDeadlines {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            keywords: Duration::from_secs(config.keyword_timeout_secs),
            retrieval: Duration::from_secs(config.retrieval_timeout_secs),
            search: Duration::from_secs(config.search_timeout_secs),
            prompt: Duration::from_secs(config.prompt_timeout_secs),
            model: Duration::from_secs(config.model_timeout_secs),
            references: Duration::from_secs(config.reference_timeout_secs),
        }
    }

    /// The same deadline for every step
    pub fn uniform(deadline: Duration) -> Self {
        Self {
            keywords: deadline,
            retrieval: deadline,
            search: deadline,
            prompt: deadline,
            model: deadline,
            references: deadline,
        }
    }

    pub fn for_step(&self, step: GenerationStep) -> Duration {
        match step {
            GenerationStep::Keywords => self.keywords,
            GenerationStep::Retrieval => self.retrieval,
            GenerationStep::Search => self.search,
            GenerationStep::Prompt => self.prompt,
            GenerationStep::Model => self.model,
            GenerationStep::References => self.references,
        }
    }
}

impl Default for StepDeadlines {
    fn default() -> Self {
        Self::from_config(&GenerationConfig::default())
    }
}

/// Run one step under its deadline
///
/// # Errors
///
/// Returns [`ChapterflowError::Canceled`] if `cancel` fires first and
/// [`ChapterflowError::StepTimeout`] if the deadline elapses first. Either
/// way `work` is dropped before this function returns. Errors produced by
/// `work` itself are passed through.
///
/// # Examples
///
/// ```
/// use chapterflow::generation::deadline::{run_step, GenerationStep};
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() {
/// let token = CancellationToken::new();
/// let value = run_step(GenerationStep::Prompt, Duration::from_secs(1), &token, async {
///     Ok::<_, anyhow::Error>(42)
/// })
/// .await
/// .unwrap();
/// assert_eq!(value, 42);
/// # }
/// ```
pub async fn run_step<T, F>(
    step: GenerationStep,
    deadline: Duration,
    cancel: &CancellationToken,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            tracing::debug!(step = %step, "Step canceled");
            Err(ChapterflowError::Canceled(format!("{} step canceled", step)).into())
        }

        outcome = tokio::time::timeout(deadline, work) => match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(step = %step, seconds = deadline.as_secs_f64(), "Step deadline elapsed");
                Err(ChapterflowError::StepTimeout {
                    step: step.to_string(),
                    seconds: deadline.as_secs(),
                }
                .into())
            }
        },
    }
}

/// Whether an error means the step was interrupted rather than failed
pub fn is_interruption(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ChapterflowError>(),
        Some(ChapterflowError::StepTimeout { .. } | ChapterflowError::Canceled(_))
    )
}

/// Whether an error is a cancellation
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ChapterflowError>(),
        Some(ChapterflowError::Canceled(_))
    )
}
