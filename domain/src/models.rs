//! Schema registry: named model handles bound to pooled connections.

use std::sync::{Arc, RwLock};

use serde_json::json;
use tracing::info;

use crate::model::Model;
use crate::pool::PoolSet;
use crate::{poisoned, CoreError, DescriptorProvider, ModelDescriptor};

/// A registered model and the descriptor it was built from.
#[derive(Clone, Debug)]
pub struct ModelHandle {
    pub descriptor: ModelDescriptor,
    pub model: Model,
}

impl ModelHandle {
    pub fn name(&self) -> &str {
        &self.descriptor.model_name
    }
}

/// Registry of model handles. Names are unique.
pub struct SchemaRegistry {
    pools: Arc<PoolSet>,
    models: RwLock<Vec<ModelHandle>>,
}

impl SchemaRegistry {
    pub fn new(pools: Arc<PoolSet>) -> Self {
        Self {
            pools,
            models: RwLock::new(Vec::new()),
        }
    }

    /// Build a registry holding every descriptor the provider returns, in
    /// order.
    pub async fn load(
        provider: &dyn DescriptorProvider<ModelDescriptor>,
        pools: Arc<PoolSet>,
    ) -> Result<Self, CoreError> {
        let registry = Self::new(pools);
        for descriptor in provider.descriptors()? {
            registry.create_model(descriptor).await?;
        }
        Ok(registry)
    }

    pub fn pools(&self) -> &Arc<PoolSet> {
        &self.pools
    }

    /// Create the model on its database's pooled connection, build its
    /// indexes, and register it.
    pub async fn create_model(&self, descriptor: ModelDescriptor) -> Result<Model, CoreError> {
        self.ensure_unique(&descriptor)?;

        let pool = self.pools.get(&descriptor.db_name)?;
        let model = pool
            .create_model(&descriptor.schema, &descriptor.model_name)
            .await?;
        let indexed = model.clone();
        tokio::task::spawn_blocking(move || indexed.create_indexes())
            .await
            .map_err(|e| CoreError::Repository(format!("index build task failed: {}", e)))??;

        let mut models = self.models.write().map_err(|_| poisoned("schema registry"))?;
        if let Some(existing) = models.iter().find(|m| m.name() == descriptor.model_name) {
            return Err(duplicate(&existing.descriptor, &descriptor));
        }
        info!(model = %descriptor.model_name, database = %descriptor.db_name, "registered model");
        models.push(ModelHandle {
            descriptor,
            model: model.clone(),
        });
        Ok(model)
    }

    fn ensure_unique(&self, descriptor: &ModelDescriptor) -> Result<(), CoreError> {
        let models = self.models.read().map_err(|_| poisoned("schema registry"))?;
        match models.iter().find(|m| m.name() == descriptor.model_name) {
            Some(existing) => Err(duplicate(&existing.descriptor, descriptor)),
            None => Ok(()),
        }
    }

    /// Snapshot of every registered handle.
    pub fn models(&self) -> Result<Vec<ModelHandle>, CoreError> {
        let models = self.models.read().map_err(|_| poisoned("schema registry"))?;
        Ok(models.clone())
    }

    pub fn model(&self, name: &str) -> Result<ModelHandle, CoreError> {
        let models = self.models.read().map_err(|_| poisoned("schema registry"))?;
        models
            .iter()
            .find(|m| m.name() == name)
            .cloned()
            .ok_or_else(|| {
                CoreError::not_found(format!("model not found: {}", name), json!({ "name": name }))
            })
    }

    pub fn len(&self) -> Result<usize, CoreError> {
        let models = self.models.read().map_err(|_| poisoned("schema registry"))?;
        Ok(models.len())
    }

    pub fn is_empty(&self) -> Result<bool, CoreError> {
        Ok(self.len()? == 0)
    }
}

fn duplicate(existing: &ModelDescriptor, incoming: &ModelDescriptor) -> CoreError {
    CoreError::validation(
        format!("duplicated model name: {}", incoming.model_name),
        json!({ "existing": existing, "duplicate": incoming }),
    )
}
