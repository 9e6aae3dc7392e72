//! Last-resort content for turns in which the upstream produced nothing.
//!
//! The chain is evaluated once per empty turn, in priority order; the final
//! step always succeeds, so an empty turn always yields exactly one fragment.

use crate::xml_encode::clarifying_question;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStep {
    PromoteReasoning,
    AskFollowup,
    Whitespace,
}

#[derive(Debug, Clone)]
pub struct FallbackChain {
    steps: Vec<FallbackStep>,
    question: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesized {
    pub step: FallbackStep,
    pub content: String,
}

impl FallbackChain {
    pub fn new(promote_reasoning: bool, synthesize_question: bool, question: impl Into<String>) -> Self {
        let mut steps = Vec::with_capacity(3);
        if promote_reasoning {
            steps.push(FallbackStep::PromoteReasoning);
        }
        if synthesize_question {
            steps.push(FallbackStep::AskFollowup);
        }
        steps.push(FallbackStep::Whitespace);
        Self {
            steps,
            question: question.into(),
        }
    }

    pub fn steps(&self) -> &[FallbackStep] {
        &self.steps
    }

    fn attempt(&self, step: FallbackStep, reasoning: &[String]) -> Option<String> {
        match step {
            FallbackStep::PromoteReasoning => {
                let promoted = reasoning.concat();
                let promoted = promoted.trim();
                if promoted.is_empty() {
                    None
                } else {
                    Some(promoted.to_string())
                }
            }
            FallbackStep::AskFollowup => Some(clarifying_question(&self.question)),
            FallbackStep::Whitespace => Some(" ".to_string()),
        }
    }

    pub fn synthesize(&self, reasoning: &[String]) -> Synthesized {
        for step in &self.steps {
            if let Some(content) = self.attempt(*step, reasoning) {
                match step {
                    FallbackStep::PromoteReasoning => {
                        tracing::warn!("Promoting reasoning to content (empty content stream)")
                    }
                    FallbackStep::AskFollowup => tracing::warn!(
                        "Synthesizing <ask_followup_question> because upstream produced no content or tool calls"
                    ),
                    FallbackStep::Whitespace => {
                        tracing::warn!("Emitting a single-space content chunk (no content produced)")
                    }
                }
                return Synthesized {
                    step: *step,
                    content,
                };
            }
        }
        Synthesized {
            step: FallbackStep::Whitespace,
            content: " ".to_string(),
        }
    }
}
