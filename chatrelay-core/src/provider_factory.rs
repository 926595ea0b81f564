use std::{collections::HashMap, sync::Arc};

use crate::bridge::StreamBridge;
use crate::config::{Config, ModelCfg, ModelKind};
use crate::error::{CoreResult, RelayError};
use crate::http_client::HttpClient;
use crate::provider::ChatModel;
use crate::providers::coze::CozeBot;
use crate::providers::openai::OpenAiChat;

/// Shared handles every constructed model clones from.
#[derive(Debug, Clone)]
pub struct ModelDeps {
    pub http: HttpClient,
    pub bridge: StreamBridge,
}

/// What a constructor needs to build one per-request model instance.
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec<'a> {
    pub logical: &'a str,
    pub cfg: &'a ModelCfg,
    pub user_id: &'a str,
}

pub type ModelCtor = fn(&ModelDeps, &ModelSpec<'_>) -> CoreResult<Arc<dyn ChatModel>>;

struct Entry {
    cfg: ModelCfg,
    ctor: ModelCtor,
}

/// Logical model name -> constructor. Built once at startup and shared
/// read-only (wrap in `Arc`); lookups never mutate it.
pub struct ModelRegistry {
    deps: ModelDeps,
    entries: HashMap<String, Entry>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.names())
            .finish_non_exhaustive()
    }
}

impl ModelRegistry {
    pub fn new(deps: ModelDeps) -> Self {
        Self {
            deps,
            entries: HashMap::new(),
        }
    }

    /// Validate the config and register every model it lists.
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        cfg.validate()?;
        let deps = ModelDeps {
            http: HttpClient::from_cfg(&cfg.http)?,
            bridge: StreamBridge::new(cfg.stream.pipe_capacity),
        };
        let registry = cfg
            .models
            .iter()
            .fold(Self::new(deps), |reg, (name, m)| {
                reg.with_model(name.clone(), m.clone(), ctor_for(m.kind))
            });
        Ok(registry)
    }

    /// Register (or replace) `name`.
    pub fn with_model(mut self, name: impl Into<String>, cfg: ModelCfg, ctor: ModelCtor) -> Self {
        self.entries.insert(name.into(), Entry { cfg, ctor });
        self
    }

    /// Build a fresh instance of `name` bound to `user_id`.
    pub fn get(&self, name: &str, user_id: &str) -> CoreResult<Arc<dyn ChatModel>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| RelayError::ModelNotRegistered { model: name.to_string() })?;
        (entry.ctor)(
            &self.deps,
            &ModelSpec {
                logical: name,
                cfg: &entry.cfg,
                user_id,
            },
        )
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn kind(&self, name: &str) -> Option<ModelKind> {
        self.entries.get(name).map(|e| e.cfg.kind)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

pub fn ctor_for(kind: ModelKind) -> ModelCtor {
    match kind {
        ModelKind::Direct => OpenAiChat::construct as ModelCtor,
        ModelKind::Bot => CozeBot::construct as ModelCtor,
    }
}
