//! Authoritative method execution.

mod cache;

pub use cache::{Begin, CacheKey, ResultCache};

use crate::store::MemoryStore;
use lagless_engine::{
    IdGenerator, InvocationId, MethodContext, MethodError, MethodRegistry, Outcome, UserId,
    DEFAULT_MAX_CALL_DEPTH,
};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// One method message, as received from a client.
#[derive(Debug, Clone)]
pub struct Call {
    pub client_id: String,
    pub invocation_id: InvocationId,
    pub name: String,
    pub params: serde_json::Value,
    pub random_seed: Option<String>,
    pub user_id: Option<UserId>,
}

/// Runs method bodies against the document store, at most once per
/// `(client_id, user_id, invocation_id)`.
#[derive(Clone)]
pub struct MethodDispatcher {
    methods: Arc<MethodRegistry>,
    store: MemoryStore,
    cache: Arc<ResultCache>,
    max_call_depth: usize,
}

impl MethodDispatcher {
    pub fn new(methods: Arc<MethodRegistry>, store: MemoryStore, cache_capacity: usize) -> Self {
        Self {
            methods,
            store,
            cache: Arc::new(ResultCache::new(cache_capacity)),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }

    pub fn methods(&self) -> &MethodRegistry {
        &self.methods
    }

    /// Execute a call, or answer it from an earlier execution.
    ///
    /// The body runs on a blocking worker. It completes and records its
    /// outcome even if the caller stops waiting.
    pub async fn execute(&self, call: Call) -> Outcome {
        let key = CacheKey::new(
            call.client_id.as_str(),
            call.user_id.as_deref(),
            call.invocation_id.as_str(),
        );
        match self.cache.begin(&key) {
            Begin::Done(outcome) => {
                tracing::debug!(invocation_id = %call.invocation_id, "Answering resent invocation from cache");
                return outcome;
            }
            Begin::Wait(rx) => {
                tracing::debug!(invocation_id = %call.invocation_id, "Waiting for in-flight invocation");
                return rx.await.unwrap_or_else(|_| internal_failure());
            }
            Begin::Run => {}
        }

        let dispatcher = self.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.run(&call)))
                .unwrap_or_else(|_| {
                    tracing::error!(invocation_id = %call.invocation_id, method = %call.name, "Method body panicked");
                    internal_failure()
                });
            dispatcher.cache.complete(key, outcome.clone());
            outcome
        });

        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Method worker failed: {}", e);
                internal_failure()
            }
        }
    }

    fn run(&self, call: &Call) -> Outcome {
        let Some(def) = self.methods.get(&call.name) else {
            return Outcome::Failed {
                error: MethodError::not_found(&call.name),
            };
        };

        if let Err(error) = def.check_authorized(call.user_id.as_deref(), &call.params) {
            tracing::debug!(invocation_id = %call.invocation_id, method = %call.name, "Call rejected");
            return Outcome::Failed { error };
        }

        let mut ids = match &call.random_seed {
            Some(seed) => IdGenerator::seeded(seed.as_str()),
            None => IdGenerator::random(),
        };
        let mut documents = self.store.clone();
        let mut ctx = MethodContext::new(
            &call.invocation_id,
            false,
            call.user_id.as_deref(),
            &mut documents,
            &mut ids,
            &self.methods,
        )
        .with_max_depth(self.max_call_depth);

        match def.run(&mut ctx, &call.params) {
            Ok(result) => Outcome::Confirmed { result },
            Err(error) => {
                tracing::debug!(invocation_id = %call.invocation_id, method = %call.name, %error, "Method failed");
                Outcome::Failed { error }
            }
        }
    }
}

fn internal_failure() -> Outcome {
    Outcome::Failed {
        error: MethodError::domain("internal-error", "the method could not be completed"),
    }
}
