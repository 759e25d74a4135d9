//! Conversation session over one model.
//!
//! A session is a pair of context keys (input and output) plus an
//! [`OperationQueue`]. Every call is admitted through the queue, so a caller
//! can fire `add_turn` and `generate` back to back and the backend sees them
//! strictly in order, each finishing before the next starts. Results are
//! delivered on the runtime's primary context.

use crate::runtime::Runtime;
use common::{
    Completion, EmbeddingParameters, GenerationConfig, MessageSequence, SequenceLimits,
    TokenCallback, DEFAULT_INPUT_CONTEXT, DEFAULT_OUTPUT_CONTEXT,
};
use llama_binding::InferenceBackend;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use task_scheduler::OperationQueue;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Builder-style options for a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub input_key: String,
    pub output_key: String,
    /// Copy the output context into the input context after each
    /// successful generation
    pub continue_conversation: bool,
    pub limits: SequenceLimits,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            input_key: DEFAULT_INPUT_CONTEXT.to_string(),
            output_key: DEFAULT_OUTPUT_CONTEXT.to_string(),
            continue_conversation: true,
            limits: SequenceLimits::default(),
        }
    }
}

pub struct Session {
    runtime: Runtime,
    model_id: String,
    input_key: String,
    output_key: String,
    limits: SequenceLimits,
    continue_conversation: Arc<AtomicBool>,
    queue: OperationQueue,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("model_id", &self.model_id)
            .field("input_key", &self.input_key)
            .field("output_key", &self.output_key)
            .field("queue", &self.queue)
            .finish()
    }
}

/// Await a callback-style call.
async fn completion<T, F>(start: F, failed: T) -> T
where
    T: Send + 'static,
    F: FnOnce(Completion<T>),
{
    let (tx, rx) = oneshot::channel();
    start(Box::new(move |value| {
        let _ = tx.send(value);
    }));
    rx.await.unwrap_or(failed)
}

impl Session {
    pub fn new(runtime: Runtime, model_id: impl Into<String>) -> Self {
        let limits = runtime.settings().sequence_limits();
        Self::with_options(
            runtime,
            model_id,
            SessionOptions {
                limits,
                ..Default::default()
            },
        )
    }

    pub fn with_options(runtime: Runtime, model_id: impl Into<String>, options: SessionOptions) -> Self {
        let model_id = model_id.into();
        let queue = OperationQueue::with_stall_timeout(
            format!("{}/{}", model_id, options.input_key),
            runtime.settings().queue_stall_timeout(),
        );
        Self {
            runtime,
            model_id,
            input_key: options.input_key,
            output_key: options.output_key,
            limits: options.limits,
            continue_conversation: Arc::new(AtomicBool::new(options.continue_conversation)),
            queue,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn input_key(&self) -> &str {
        &self.input_key
    }

    pub fn output_key(&self) -> &str {
        &self.output_key
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn set_continue_conversation(&self, enabled: bool) {
        self.continue_conversation.store(enabled, Ordering::Relaxed);
    }

    /// Admit `call` through the queue.
    ///
    /// The completion handed to `call` posts to the primary context, runs
    /// `callback` there and advances the queue. If the runtime has no
    /// binding when the call is admitted, `callback` gets `failed`.
    fn enqueue<T, C, F>(&self, op: &'static str, failed: T, callback: C, call: F)
    where
        T: Send + 'static,
        C: FnOnce(T) + Send + 'static,
        F: FnOnce(Arc<dyn InferenceBackend>, Completion<T>) + Send + 'static,
    {
        let id = self.queue.get_new_id();
        let done = self
            .runtime
            .primary()
            .wrap(self.queue.wrap_callback(id, callback));
        let runtime = self.runtime.clone();
        debug!("Session '{}': {} queued as {}", self.input_key, op, id);
        self.queue.submit(id, move || {
            match runtime.binding() {
                Some(binding) => call(binding, done),
                None => {
                    warn!("{}: runtime is not initialized", op);
                    done(failed);
                }
            }
            Ok(())
        });
    }

    /// Create both contexts, seeding the input with an optional system prompt.
    pub fn init<C>(&self, system_prompt: Option<&str>, callback: C)
    where
        C: FnOnce(bool) + Send + 'static,
    {
        let mut seed = MessageSequence::new();
        if let Some(prompt) = system_prompt {
            seed.push("system", prompt);
        }
        let (model_id, input, output) = self.keys();
        self.enqueue("init", false, callback, move |binding, done| {
            let follow = binding.clone();
            let next_model = model_id.clone();
            binding.init_context(
                &model_id,
                &input,
                &seed,
                Box::new(move |ok| {
                    if !ok {
                        return done(false);
                    }
                    follow.init_context(&next_model, &output, &MessageSequence::new(), done);
                }),
            );
        });
    }

    pub fn add_turn<C>(&self, role: &str, content: &str, callback: C)
    where
        C: FnOnce(bool) + Send + 'static,
    {
        let (key, role, content) = (self.input_key.clone(), role.to_string(), content.to_string());
        self.enqueue("add_turn", false, callback, move |binding, done| {
            binding.add_turn(&key, &role, &content, done);
        });
    }

    /// Append to the last turn of the input context.
    pub fn append<C>(&self, content: &str, callback: C)
    where
        C: FnOnce(bool) + Send + 'static,
    {
        let (key, content) = (self.input_key.clone(), content.to_string());
        self.enqueue("append", false, callback, move |binding, done| {
            binding.append_to_context(&key, &content, done);
        });
    }

    /// Generate a reply to the input context into the output context.
    ///
    /// Tokens are delivered on the primary context, in order, before the
    /// completion. With continue-conversation enabled, a successful
    /// generation is followed by copying output into input inside the same
    /// queue slot, so the next queued turn sees the reply.
    pub fn generate<C>(&self, config: &GenerationConfig, on_token: TokenCallback, callback: C)
    where
        C: FnOnce(bool) + Send + 'static,
    {
        let (model_id, input, output) = self.keys();
        let config = config.clone();
        let primary = self.runtime.primary().clone();
        let continue_conversation = self.continue_conversation.clone();
        let tokens: TokenCallback = Arc::new(move |token: &str| {
            let token = token.to_string();
            let on_token = on_token.clone();
            primary.post(move || on_token(&token));
        });

        self.enqueue("generate", false, callback, move |binding, done| {
            let follow = binding.clone();
            let (carry_from, carry_to) = (output.clone(), input.clone());
            binding.generate_response(
                &model_id,
                &input,
                &output,
                &config,
                tokens,
                Box::new(move |ok| {
                    if !ok || !continue_conversation.load(Ordering::Relaxed) {
                        return done(ok);
                    }
                    let (log_from, log_to) = (carry_from.clone(), carry_to.clone());
                    follow.copy_context(
                        &carry_from,
                        &carry_to,
                        Box::new(move |copied| {
                            if !copied {
                                warn!("Could not carry '{}' over into '{}'", log_from, log_to);
                            }
                            done(true);
                        }),
                    );
                }),
            );
        });
    }

    pub fn get_embeddings<C>(&self, text: &str, params: EmbeddingParameters, callback: C)
    where
        C: FnOnce(Option<Vec<f32>>) + Send + 'static,
    {
        let (model_id, text) = (self.model_id.clone(), text.to_string());
        self.enqueue("get_embeddings", None, callback, move |binding, done| {
            binding.compute_embeddings(&model_id, &text, &params, done);
        });
    }

    pub fn get_input_context<C>(&self, callback: C)
    where
        C: FnOnce(Option<MessageSequence>) + Send + 'static,
    {
        self.get_context(self.input_key.clone(), callback);
    }

    pub fn get_output_context<C>(&self, callback: C)
    where
        C: FnOnce(Option<MessageSequence>) + Send + 'static,
    {
        self.get_context(self.output_key.clone(), callback);
    }

    fn get_context<C>(&self, key: String, callback: C)
    where
        C: FnOnce(Option<MessageSequence>) + Send + 'static,
    {
        let limits = self.limits;
        self.enqueue("get_context", None, callback, move |binding, done| {
            binding.get_context(&key, limits, done);
        });
    }

    /// Persist the input context in the backend's cache.
    pub fn cache<C>(&self, callback: C)
    where
        C: FnOnce(bool) + Send + 'static,
    {
        let key = self.input_key.clone();
        self.enqueue("cache", false, callback, move |binding, done| {
            binding.cache_context(&key, done);
        });
    }

    /// Make the cached input context the model's active one.
    pub fn load<C>(&self, callback: C)
    where
        C: FnOnce(bool) + Send + 'static,
    {
        let (model_id, key) = (self.model_id.clone(), self.input_key.clone());
        self.enqueue("load", false, callback, move |binding, done| {
            binding.load_context(&model_id, &key, done);
        });
    }

    /// Drop both contexts and recreate them empty.
    pub fn reset<C>(&self, callback: C)
    where
        C: FnOnce(bool) + Send + 'static,
    {
        let (model_id, input, output) = self.keys();
        self.enqueue("reset", false, callback, move |binding, done| {
            let follow = binding.clone();
            let (free_input, free_output) = (input.clone(), output.clone());
            // Freeing a context that does not exist yet is not a failure here
            binding.free_context(
                &free_input,
                Box::new(move |_| {
                    let recreate = follow.clone();
                    follow.free_context(
                        &free_output,
                        Box::new(move |_| {
                            let next = recreate.clone();
                            let next_model = model_id.clone();
                            recreate.init_context(
                                &model_id,
                                &input,
                                &MessageSequence::new(),
                                Box::new(move |ok| {
                                    if !ok {
                                        return done(false);
                                    }
                                    next.init_context(
                                        &next_model,
                                        &output,
                                        &MessageSequence::new(),
                                        done,
                                    );
                                }),
                            );
                        }),
                    );
                }),
            );
        });
        info!("Session '{}' reset requested", self.input_key);
    }

    /// Ask the backend to stop the generation in flight. Not queued: the
    /// generation holds the queue until its own completion reports.
    pub fn abort(&self) {
        match self.runtime.binding() {
            Some(binding) => binding.abort_generation(&self.model_id),
            None => warn!("abort: runtime is not initialized"),
        }
    }

    /// Release both contexts.
    pub fn free<C>(&self, callback: C)
    where
        C: FnOnce(bool) + Send + 'static,
    {
        let (_, input, output) = self.keys();
        self.enqueue("free", false, callback, move |binding, done| {
            let follow = binding.clone();
            binding.free_context(
                &input,
                Box::new(move |freed_input| {
                    follow.free_context(
                        &output,
                        Box::new(move |freed_output| done(freed_input && freed_output)),
                    );
                }),
            );
        });
    }

    fn keys(&self) -> (String, String, String) {
        (
            self.model_id.clone(),
            self.input_key.clone(),
            self.output_key.clone(),
        )
    }

    // Async forms. These resolve once the primary context has run the
    // completion, so the primary loop must be running.

    pub async fn init_async(&self, system_prompt: Option<&str>) -> bool {
        completion(|done| self.init(system_prompt, done), false).await
    }

    pub async fn add_turn_async(&self, role: &str, content: &str) -> bool {
        completion(|done| self.add_turn(role, content, done), false).await
    }

    pub async fn append_async(&self, content: &str) -> bool {
        completion(|done| self.append(content, done), false).await
    }

    pub async fn generate_async(&self, config: &GenerationConfig, on_token: TokenCallback) -> bool {
        completion(|done| self.generate(config, on_token, done), false).await
    }

    pub async fn get_embeddings_async(
        &self,
        text: &str,
        params: EmbeddingParameters,
    ) -> Option<Vec<f32>> {
        completion(|done| self.get_embeddings(text, params, done), None).await
    }

    pub async fn get_input_context_async(&self) -> Option<MessageSequence> {
        completion(|done| self.get_input_context(done), None).await
    }

    pub async fn get_output_context_async(&self) -> Option<MessageSequence> {
        completion(|done| self.get_output_context(done), None).await
    }

    pub async fn cache_async(&self) -> bool {
        completion(|done| self.cache(done), false).await
    }

    pub async fn load_async(&self) -> bool {
        completion(|done| self.load(done), false).await
    }

    pub async fn reset_async(&self) -> bool {
        completion(|done| self.reset(done), false).await
    }

    pub async fn free_async(&self) -> bool {
        completion(|done| self.free(done), false).await
    }
}
