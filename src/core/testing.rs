//! Deterministic stand-ins for randomness and the generator, shared by unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::error::{EngineError, Result};
use super::generator::{Decision, ResponseGenerator, ThreadContext};
use super::model::{AiFollower, Post};
use super::random::RandomSource;

/// Bernoulli trials always land one way; delays always take the lower bound.
pub struct ForcedRandom {
    succeed: bool,
}

impl ForcedRandom {
    pub fn always() -> Self {
        Self { succeed: true }
    }

    pub fn never() -> Self {
        Self { succeed: false }
    }
}

impl RandomSource for ForcedRandom {
    fn chance(&self, percent: u8) -> bool {
        self.succeed && percent > 0
    }

    fn minutes_between(&self, min: u32, _max: u32) -> u32 {
        min
    }
}

pub enum Step {
    Decide(Decision),
    Fail(&'static str),
    Hang(Duration),
}

/// Plays back a script of steps, then repeats a fallback decision.
pub struct ScriptedGenerator {
    steps: Mutex<VecDeque<Step>>,
    fallback: Decision,
    calls: AtomicUsize,
    seen_context: Mutex<Vec<usize>>,
}

impl ScriptedGenerator {
    pub fn new(steps: Vec<Step>, fallback: Decision) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback,
            calls: AtomicUsize::new(0),
            seen_context: Mutex::new(Vec::new()),
        }
    }

    pub fn always(decision: Decision) -> Self {
        Self::new(Vec::new(), decision)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Thread sizes observed on each call.
    pub fn seen_context(&self) -> Vec<usize> {
        self.seen_context.lock().clone()
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        _post: &Post,
        _follower: &AiFollower,
        context: &ThreadContext,
    ) -> Result<Decision> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_context.lock().push(context.tree.len());

        let step = self.steps.lock().pop_front();
        match step {
            Some(Step::Decide(decision)) => Ok(decision),
            Some(Step::Fail(reason)) => Err(EngineError::GeneratorError(reason.to_string())),
            Some(Step::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(self.fallback.clone())
            }
            None => Ok(self.fallback.clone()),
        }
    }
}
