//! Scripted model backend for tests
//!
//! Enabled for this crate's own tests and, through the `test-utils`
//! feature, for downstream crates that need a deterministic `LlmClient`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use vg_core::{CompletionRequest, LlmClient, Result, VgError};

type Responder = Box<dyn Fn(&CompletionRequest) -> Result<String> + Send + Sync>;

enum Script {
    Sequence(Mutex<VecDeque<Result<String>>>),
    Function(Responder),
}

/// `LlmClient` that answers from a script and records every request
pub struct ScriptedLlm {
    script: Script,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    /// Answer with each queued response in turn; errors once exhausted
    pub fn sequence(responses: Vec<Result<String>>) -> Self {
        Self::with_script(Script::Sequence(Mutex::new(responses.into())))
    }

    /// Answer every request through `f`
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String> + Send + Sync + 'static,
    {
        Self::with_script(Script::Function(Box::new(f)))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of completions requested so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Copies of every request received, in order
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        match &self.script {
            Script::Sequence(queue) => queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .unwrap_or_else(|| Err(VgError::LlmError("script exhausted".to_string()))),
            Script::Function(f) => f(request),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
