use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{info, warn};

use crate::capability::CapabilityProvider;
use crate::errors::ChorusError;
use crate::models::event::{Event, OutputEnvelope};
use crate::multiplexer::{merge, spawn_source, EventSource};
use crate::providers::base::ProviderAdapter;
use crate::providers::configs::ProviderConfig;
use crate::providers::factory::get_adapter;
use crate::session::Conversation;

/// Builds the adapter for one backend; called on first use and never again
/// until the orchestrator is shut down.
pub type AdapterFactory = Box<dyn Fn() -> Result<Arc<dyn ProviderAdapter>> + Send + Sync>;

/// A backend to build from a provider config
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub id: String,
    pub label: String,
    pub config: ProviderConfig,
}

struct Backend {
    id: String,
    label: String,
    factory: AdapterFactory,
    adapter: Mutex<Option<Arc<dyn ProviderAdapter>>>,
}

impl Backend {
    fn adapter(&self) -> Result<Arc<dyn ProviderAdapter>> {
        let mut slot = self.adapter.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(adapter) = slot.as_ref() {
            return Ok(adapter.clone());
        }
        let adapter = (self.factory)()?;
        info!("Created {} adapter for backend {}", adapter.kind(), self.id);
        *slot = Some(adapter.clone());
        Ok(adapter)
    }

    fn existing_adapter(&self) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapter
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[derive(Default)]
pub struct OrchestratorBuilder {
    backends: Vec<Backend>,
    capability: Option<Arc<dyn CapabilityProvider>>,
}

impl OrchestratorBuilder {
    /// Register a backend. Backends keep their registration order.
    pub fn backend<I, L, F>(mut self, id: I, label: L, factory: F) -> Self
    where
        I: Into<String>,
        L: Into<String>,
        F: Fn() -> Result<Arc<dyn ProviderAdapter>> + Send + Sync + 'static,
    {
        let id = id.into();
        if self.backends.iter().any(|b| b.id == id) {
            warn!("Backend {} registered twice, keeping the first", id);
            return self;
        }
        self.backends.push(Backend {
            id,
            label: label.into(),
            factory: Box::new(factory),
            adapter: Mutex::new(None),
        });
        self
    }

    /// Capability provider disconnected on shutdown
    pub fn capability(mut self, capability: Arc<dyn CapabilityProvider>) -> Self {
        self.capability = Some(capability);
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            backends: self.backends,
            capability: self.capability,
            spawned: AtomicUsize::new(0),
        }
    }
}

/// Fans one user message out to the configured backends and merges their
/// answers into a single labelled stream.
///
/// Each backend keeps one adapter, and so one conversation, across turns.
pub struct Orchestrator {
    backends: Vec<Backend>,
    capability: Option<Arc<dyn CapabilityProvider>>,
    spawned: AtomicUsize,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Real adapters for the given backends, all sharing one capability provider
    pub fn from_configs(
        specs: Vec<BackendSpec>,
        system_prompt: &str,
        capability: Option<Arc<dyn CapabilityProvider>>,
    ) -> Self {
        let mut builder = Self::builder();
        if let Some(capability) = capability.clone() {
            builder = builder.capability(capability);
        }
        for spec in specs {
            let system_prompt = system_prompt.to_string();
            let capability = capability.clone();
            let config = spec.config;
            builder = builder.backend(spec.id, spec.label, move || {
                get_adapter(config.clone(), &system_prompt, capability.clone())
            });
        }
        builder.build()
    }

    /// Start one turn on every requested backend.
    ///
    /// `None` (or an empty list) selects every backend in registration order;
    /// unknown ids are ignored. Fails before any backend runs when the message
    /// is blank or nothing known was requested.
    pub fn handle_turn(
        &self,
        message: &str,
        requested: Option<&[String]>,
    ) -> Result<BoxStream<'static, OutputEnvelope>, ChorusError> {
        if message.trim().is_empty() {
            return Err(ChorusError::InvalidRequest(
                "Message parameter is required".to_string(),
            ));
        }

        let active: Vec<&Backend> = match requested {
            Some(ids) if !ids.is_empty() => self
                .backends
                .iter()
                .filter(|b| ids.iter().any(|id| id == &b.id))
                .collect(),
            _ => self.backends.iter().collect(),
        };
        if active.is_empty() {
            return Err(ChorusError::InvalidRequest(
                "No valid backend ids provided".to_string(),
            ));
        }

        let ids: Vec<&str> = active.iter().map(|b| b.id.as_str()).collect();
        info!("Processing message with backends: {:?}", ids);

        let sources = active
            .into_iter()
            .map(|backend| (backend.label.clone(), self.start(backend, message)))
            .collect();
        Ok(merge(sources))
    }

    fn start(&self, backend: &Backend, message: &str) -> EventSource {
        match backend.adapter() {
            Ok(adapter) => {
                self.spawned.fetch_add(1, Ordering::SeqCst);
                spawn_source(adapter.initiate_turn(message.to_string()))
            }
            Err(e) => {
                warn!("Could not create adapter for {}: {}", backend.id, e);
                let error = ChorusError::Internal(format!("Failed to create adapter: {}", e));
                stream::once(async move { Err::<Event, _>(error) }).boxed()
            }
        }
    }

    /// Forget one backend's conversation and cached tools. False for an unknown id.
    pub fn reset(&self, id: &str) -> bool {
        match self.backend(id) {
            Some(backend) => {
                if let Some(adapter) = backend.existing_adapter() {
                    adapter.reset();
                }
                true
            }
            None => false,
        }
    }

    /// Forget every backend's conversation
    pub fn reset_all(&self) {
        for backend in &self.backends {
            if let Some(adapter) = backend.existing_adapter() {
                adapter.reset();
            }
        }
    }

    /// Drop every adapter and disconnect the capability provider
    pub async fn shutdown(&self) {
        for backend in &self.backends {
            backend
                .adapter
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take();
        }
        if let Some(capability) = &self.capability {
            if let Err(e) = capability.disconnect().await {
                warn!("Failed to disconnect capability provider: {}", e);
            }
        }
        info!("Orchestrator shut down");
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.id.clone()).collect()
    }

    pub fn label(&self, id: &str) -> Option<&str> {
        self.backend(id).map(|b| b.label.as_str())
    }

    /// Conversation of a backend that has run at least one turn
    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.backend(id)?
            .existing_adapter()
            .map(|adapter| adapter.conversation())
    }

    /// Backend tasks started so far
    pub fn spawned_tasks(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    fn backend(&self, id: &str) -> Option<&Backend> {
        self.backends.iter().find(|b| b.id == id)
    }
}
