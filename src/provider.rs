//! The DRP provider: configuration plus dispatch to the resources.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::client::{DrpApi, DrpClient};
use crate::config::{provider_schema, ProviderConfig};
use crate::error::ProviderError;
use crate::resources::ResourceRegistry;
use crate::schema::{has_errors, Diagnostic, ProviderSchema};
use crate::server::ProviderService;
use crate::types::{ImportedResource, PlanResult};
use crate::validation::validate;

/// Provider for DigitalRebar Provision.
pub struct DrpProvider {
    api: RwLock<Option<Arc<dyn DrpApi>>>,
    resources: ResourceRegistry,
}

impl DrpProvider {
    /// An unconfigured provider; `Configure` connects it to DRP.
    pub fn new() -> Self {
        Self {
            api: RwLock::new(None),
            resources: ResourceRegistry::default(),
        }
    }

    /// A provider already bound to `api`. `Configure` replaces it.
    pub fn with_api(api: Arc<dyn DrpApi>) -> Self {
        Self {
            api: RwLock::new(Some(api)),
            resources: ResourceRegistry::default(),
        }
    }

    async fn api(&self) -> Result<Arc<dyn DrpApi>, ProviderError> {
        self.api.read().await.clone().ok_or_else(|| {
            ProviderError::Configuration("the provider has not been configured".to_string())
        })
    }

    /// Schema diagnostics followed by credential resolution diagnostics.
    fn check_config(config: &Value) -> Result<ProviderConfig, Vec<Diagnostic>> {
        let diagnostics = validate(&provider_schema(), config);
        if has_errors(&diagnostics) {
            return Err(diagnostics);
        }
        ProviderConfig::from_value(config.clone())
    }
}

impl Default for DrpProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProviderService for DrpProvider {
    fn schema(&self) -> ProviderSchema {
        self.resources.iter().fold(
            ProviderSchema::new().with_provider_config(provider_schema()),
            |schema, resource| schema.with_resource(resource.type_name(), resource.schema()),
        )
    }

    async fn validate_provider_config(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let settings = Self::check_config(&config).and_then(ProviderConfig::resolve);
        Ok(settings.err().unwrap_or_default())
    }

    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let settings = match Self::check_config(&config).and_then(ProviderConfig::resolve) {
            Ok(settings) => settings,
            Err(diagnostics) => return Ok(diagnostics),
        };

        let mut diagnostics = Vec::new();
        if settings.insecure {
            diagnostics.push(
                Diagnostic::warning("TLS certificate verification is disabled")
                    .with_detail("Set insecure = false once the DRP endpoint has a trusted certificate")
                    .with_attribute("insecure"),
            );
        }

        let client = DrpClient::new(&settings)?;
        *self.api.write().await = Some(Arc::new(client));
        info!(endpoint = %settings.endpoint, "configured DRP provider");
        Ok(diagnostics)
    }

    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        Ok(self.resources.get(resource_type)?.validate(&config))
    }

    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: i64,
        state: Value,
    ) -> Result<Value, ProviderError> {
        self.resources
            .get(resource_type)?
            .upgrade_state(version, state)
    }

    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        _config: Value,
    ) -> Result<PlanResult, ProviderError> {
        let resource = self.resources.get(resource_type)?;
        let plan = resource.plan(prior_state.as_ref(), proposed_state);
        debug!(
            resource_type,
            changes = plan.changes.len(),
            requires_replace = plan.requires_replace,
            "planned"
        );
        Ok(plan)
    }

    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ProviderError> {
        let resource = self.resources.get(resource_type)?;
        let api = self.api().await?;
        resource.create(api.as_ref(), planned_state).await
    }

    async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value, ProviderError> {
        let resource = self.resources.get(resource_type)?;
        let api = self.api().await?;
        match resource.read(api.as_ref(), current_state).await {
            Err(err) if err.is_not_found() => {
                // A null state tells the host the object is gone.
                warn!(resource_type, error = %err, "remote object no longer exists");
                Ok(Value::Null)
            },
            result => result,
        }
    }

    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        let resource = self.resources.get(resource_type)?;
        let api = self.api().await?;
        resource.update(api.as_ref(), prior_state, planned_state).await
    }

    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError> {
        let resource = self.resources.get(resource_type)?;
        let api = self.api().await?;
        match resource.delete(api.as_ref(), current_state).await {
            Err(err) if err.is_not_found() => {
                warn!(resource_type, "remote object already deleted");
                Ok(())
            },
            result => result,
        }
    }

    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        let resource = self.resources.get(resource_type)?;
        let api = self.api().await?;
        let state = resource.import(api.as_ref(), id).await?;
        Ok(vec![ImportedResource::new(resource_type, state)])
    }
}
