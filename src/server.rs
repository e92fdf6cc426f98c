//! The provider service trait and the gRPC server that exposes it.
//!
//! # Signal Handling
//!
//! On SIGTERM or SIGINT the server:
//! 1. stops accepting new connections,
//! 2. waits up to [`ServeOptions::shutdown_timeout`] for in-flight requests,
//! 3. calls the provider's `stop()` method.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tonic::transport::Server;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ProviderError;
use crate::protocol;
use crate::schema::{has_errors, BlockNestingMode, Diagnostic, DiagnosticSeverity, ProviderSchema};
use crate::types::{
    encode_json, ImportedResource, PlanResult, ProviderMetadata, HANDSHAKE_PREFIX,
    PROTOCOL_VERSION,
};

/// The provider operations, in terms of JSON values instead of wire messages.
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    /// Schemas of the provider block and every resource.
    fn schema(&self) -> ProviderSchema;

    /// Resource names. Derived from the schema by default.
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            resources: self.schema().resources.keys().cloned().collect(),
        }
    }

    /// Check the provider block without applying it.
    async fn validate_provider_config(
        &self,
        config: serde_json::Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = config;
        Ok(vec![])
    }

    /// Apply the provider block.
    async fn configure(&self, config: serde_json::Value) -> Result<Vec<Diagnostic>, ProviderError>;

    /// Release anything held by the provider.
    async fn stop(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Check a resource block.
    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: serde_json::Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = (resource_type, config);
        Ok(vec![])
    }

    /// Migrate state written under an older schema version.
    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: i64,
        state: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let _ = (resource_type, version);
        Ok(state)
    }

    /// Compute the planned state. `prior_state` is `None` on create.
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<serde_json::Value>,
        proposed_state: serde_json::Value,
        config: serde_json::Value,
    ) -> Result<PlanResult, ProviderError>;

    /// Create a resource.
    async fn create(
        &self,
        resource_type: &str,
        planned_state: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;

    /// Refresh a resource.
    async fn read(
        &self,
        resource_type: &str,
        current_state: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;

    /// Update a resource in place.
    async fn update(
        &self,
        resource_type: &str,
        prior_state: serde_json::Value,
        planned_state: serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;

    /// Delete a resource.
    async fn delete(
        &self,
        resource_type: &str,
        current_state: serde_json::Value,
    ) -> Result<(), ProviderError>;

    /// Adopt an existing remote object by id.
    async fn import_resource(
        &self,
        resource_type: &str,
        _id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        Err(ProviderError::Unimplemented(format!(
            "Import not supported for resource type: {}",
            resource_type
        )))
    }
}

/// Adapts a [`ProviderService`] to the generated gRPC trait.
pub(crate) struct ProviderGrpcService<P: ProviderService> {
    provider: Arc<P>,
}

impl<P: ProviderService> ProviderGrpcService<P> {
    pub(crate) fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }
}

/// Decode a JSON payload. An empty payload is `null`; malformed JSON is a
/// client error.
fn decode_json(bytes: &[u8], field: &str) -> Result<serde_json::Value, tonic::Status> {
    if bytes.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_slice(bytes)
        .map_err(|err| tonic::Status::invalid_argument(format!("malformed {}: {}", field, err)))
}

fn diagnostics_to_proto(diagnostics: Vec<Diagnostic>) -> Vec<protocol::Diagnostic> {
    diagnostics
        .into_iter()
        .map(|d| protocol::Diagnostic {
            severity: match d.severity {
                DiagnosticSeverity::Error => protocol::diagnostic::Severity::Error as i32,
                DiagnosticSeverity::Warning => protocol::diagnostic::Severity::Warning as i32,
            },
            summary: d.summary,
            detail: d.detail.unwrap_or_default(),
            attribute: d.attribute.unwrap_or_default(),
        })
        .collect()
}

fn error_to_diagnostics(err: ProviderError) -> Vec<protocol::Diagnostic> {
    diagnostics_to_proto(vec![Diagnostic::error(err.to_string())])
}

fn log_diagnostics(operation: &str, diagnostics: &[Diagnostic]) {
    if has_errors(diagnostics) {
        warn!(
            operation,
            diagnostics = diagnostics.len(),
            "completed with errors"
        );
    } else {
        info!(operation, "completed successfully");
    }
}

fn schema_to_proto(schema: &crate::schema::Schema) -> protocol::Schema {
    protocol::Schema {
        version: schema.version as i64,
        block: Some(block_to_proto(&schema.block)),
    }
}

fn block_to_proto(block: &crate::schema::Block) -> protocol::Block {
    use protocol::nested_block::NestingMode;

    protocol::Block {
        attributes: block
            .attributes
            .iter()
            .map(|(name, attr)| protocol::Attribute {
                name: name.clone(),
                r#type: serde_json::to_vec(&attr.attr_type).unwrap_or_default(),
                required: attr.flags.required,
                optional: attr.flags.optional,
                computed: attr.flags.computed,
                sensitive: attr.flags.sensitive,
                description: attr.description.clone().unwrap_or_default(),
                force_new: attr.force_new,
                default_value: attr.default.as_ref().map(encode_json).unwrap_or_default(),
            })
            .collect(),
        block_types: block
            .blocks
            .iter()
            .map(|(name, nested)| protocol::NestedBlock {
                type_name: name.clone(),
                block: Some(block_to_proto(&nested.block)),
                nesting_mode: match nested.nesting_mode {
                    BlockNestingMode::Single => NestingMode::Single as i32,
                    BlockNestingMode::List => NestingMode::List as i32,
                    BlockNestingMode::Set => NestingMode::Set as i32,
                    BlockNestingMode::Map => NestingMode::Map as i32,
                },
                min_items: 0,
                max_items: nested.max_items as i32,
            })
            .collect(),
        description: block.description.clone().unwrap_or_default(),
    }
}

#[tonic::async_trait]
impl<P: ProviderService> protocol::provider_server::Provider for ProviderGrpcService<P> {
    #[instrument(skip(self, _request), name = "grpc.get_metadata")]
    async fn get_metadata(
        &self,
        _request: tonic::Request<protocol::GetMetadataRequest>,
    ) -> Result<tonic::Response<protocol::GetMetadataResponse>, tonic::Status> {
        let metadata = self.provider.metadata();
        debug!(resources = metadata.resources.len(), "GetMetadata completed");
        Ok(tonic::Response::new(protocol::GetMetadataResponse {
            // Plan accepts a null proposed state and plans the destroy.
            server_capabilities: Some(protocol::ServerCapabilities { plan_destroy: true }),
            resources: metadata.resources,
            diagnostics: vec![],
        }))
    }

    #[instrument(skip(self, _request), name = "grpc.get_schema")]
    async fn get_schema(
        &self,
        _request: tonic::Request<protocol::GetSchemaRequest>,
    ) -> Result<tonic::Response<protocol::GetSchemaResponse>, tonic::Status> {
        let schema = self.provider.schema();
        debug!(resources = schema.resources.len(), "GetSchema completed");
        Ok(tonic::Response::new(protocol::GetSchemaResponse {
            provider: Some(schema_to_proto(&schema.provider)),
            resources: schema
                .resources
                .iter()
                .map(|(k, v)| (k.clone(), schema_to_proto(v)))
                .collect(),
            diagnostics: vec![],
        }))
    }

    #[instrument(skip(self, request), name = "grpc.validate_provider_config")]
    async fn validate_provider_config(
        &self,
        request: tonic::Request<protocol::ValidateProviderConfigRequest>,
    ) -> Result<tonic::Response<protocol::ValidateProviderConfigResponse>, tonic::Status> {
        let config = decode_json(&request.into_inner().config, "config")?;

        let diagnostics = match self.provider.validate_provider_config(config).await {
            Ok(diagnostics) => {
                log_diagnostics("ValidateProviderConfig", &diagnostics);
                diagnostics_to_proto(diagnostics)
            },
            Err(e) => {
                error!(error = %e, "ValidateProviderConfig failed");
                error_to_diagnostics(e)
            },
        };
        Ok(tonic::Response::new(
            protocol::ValidateProviderConfigResponse { diagnostics },
        ))
    }

    #[instrument(skip(self, request), name = "grpc.configure")]
    async fn configure(
        &self,
        request: tonic::Request<protocol::ConfigureRequest>,
    ) -> Result<tonic::Response<protocol::ConfigureResponse>, tonic::Status> {
        let config = decode_json(&request.into_inner().config, "config")?;

        let diagnostics = match self.provider.configure(config).await {
            Ok(diagnostics) => {
                log_diagnostics("Configure", &diagnostics);
                diagnostics_to_proto(diagnostics)
            },
            Err(e) => {
                error!(error = %e, "Configure failed");
                error_to_diagnostics(e)
            },
        };
        Ok(tonic::Response::new(protocol::ConfigureResponse {
            diagnostics,
        }))
    }

    #[instrument(skip(self, _request), name = "grpc.stop")]
    async fn stop(
        &self,
        _request: tonic::Request<protocol::StopRequest>,
    ) -> Result<tonic::Response<protocol::StopResponse>, tonic::Status> {
        info!("Stop called");
        let error = match self.provider.stop().await {
            Ok(()) => String::new(),
            Err(e) => {
                error!(error = %e, "Stop failed");
                e.to_string()
            },
        };
        Ok(tonic::Response::new(protocol::StopResponse { error }))
    }

    #[instrument(skip(self, request), name = "grpc.validate_resource_config", fields(resource_type = %request.get_ref().resource_type))]
    async fn validate_resource_config(
        &self,
        request: tonic::Request<protocol::ValidateResourceConfigRequest>,
    ) -> Result<tonic::Response<protocol::ValidateResourceConfigResponse>, tonic::Status> {
        let req = request.into_inner();
        let config = decode_json(&req.config, "config")?;

        let diagnostics = match self
            .provider
            .validate_resource_config(&req.resource_type, config)
            .await
        {
            Ok(diagnostics) => {
                log_diagnostics("ValidateResourceConfig", &diagnostics);
                diagnostics_to_proto(diagnostics)
            },
            Err(e) => {
                error!(error = %e, "ValidateResourceConfig failed");
                error_to_diagnostics(e)
            },
        };
        Ok(tonic::Response::new(
            protocol::ValidateResourceConfigResponse { diagnostics },
        ))
    }

    #[instrument(skip(self, request), name = "grpc.upgrade_resource_state", fields(resource_type = %request.get_ref().resource_type))]
    async fn upgrade_resource_state(
        &self,
        request: tonic::Request<protocol::UpgradeResourceStateRequest>,
    ) -> Result<tonic::Response<protocol::UpgradeResourceStateResponse>, tonic::Status> {
        let req = request.into_inner();
        let state = decode_json(&req.raw_state, "raw_state")?;

        match self
            .provider
            .upgrade_resource_state(&req.resource_type, req.version, state)
            .await
        {
            Ok(upgraded) => {
                debug!(from_version = req.version, "UpgradeResourceState completed");
                Ok(tonic::Response::new(
                    protocol::UpgradeResourceStateResponse {
                        upgraded_state: encode_json(&upgraded),
                        diagnostics: vec![],
                    },
                ))
            },
            Err(e) => {
                error!(version = req.version, error = %e, "UpgradeResourceState failed");
                Ok(tonic::Response::new(
                    protocol::UpgradeResourceStateResponse {
                        upgraded_state: vec![],
                        diagnostics: error_to_diagnostics(e),
                    },
                ))
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.plan", fields(resource_type = %request.get_ref().resource_type))]
    async fn plan(
        &self,
        request: tonic::Request<protocol::PlanRequest>,
    ) -> Result<tonic::Response<protocol::PlanResponse>, tonic::Status> {
        let req = request.into_inner();

        let prior_state = match decode_json(&req.prior_state, "prior_state")? {
            serde_json::Value::Null => None,
            prior => Some(prior),
        };
        let proposed_state = decode_json(&req.proposed_state, "proposed_state")?;
        let config = decode_json(&req.config, "config")?;
        debug!(is_create = prior_state.is_none(), "Plan called");

        match self
            .provider
            .plan(&req.resource_type, prior_state, proposed_state, config)
            .await
        {
            Ok(result) => {
                info!(
                    changes = result.changes.len(),
                    requires_replace = result.requires_replace,
                    "Plan completed"
                );
                Ok(tonic::Response::new(protocol::PlanResponse {
                    planned_state: encode_json(&result.planned_state),
                    changes: result.changes.into_iter().map(Into::into).collect(),
                    requires_replace: result.requires_replace,
                    diagnostics: vec![],
                }))
            },
            Err(e) => {
                error!(error = %e, "Plan failed");
                Ok(tonic::Response::new(protocol::PlanResponse {
                    planned_state: vec![],
                    changes: vec![],
                    requires_replace: false,
                    diagnostics: error_to_diagnostics(e),
                }))
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.create", fields(resource_type = %request.get_ref().resource_type))]
    async fn create(
        &self,
        request: tonic::Request<protocol::CreateRequest>,
    ) -> Result<tonic::Response<protocol::CreateResponse>, tonic::Status> {
        let req = request.into_inner();
        let planned_state = decode_json(&req.planned_state, "planned_state")?;
        info!("Create called");

        let (state, diagnostics) = match self
            .provider
            .create(&req.resource_type, planned_state)
            .await
        {
            Ok(state) => {
                info!("Create completed successfully");
                (encode_json(&state), vec![])
            },
            Err(e) => {
                error!(error = %e, "Create failed");
                (vec![], error_to_diagnostics(e))
            },
        };
        Ok(tonic::Response::new(protocol::CreateResponse {
            state,
            diagnostics,
        }))
    }

    #[instrument(skip(self, request), name = "grpc.read", fields(resource_type = %request.get_ref().resource_type))]
    async fn read(
        &self,
        request: tonic::Request<protocol::ReadRequest>,
    ) -> Result<tonic::Response<protocol::ReadResponse>, tonic::Status> {
        let req = request.into_inner();
        let current_state = decode_json(&req.current_state, "current_state")?;

        let (state, diagnostics) = match self.provider.read(&req.resource_type, current_state).await
        {
            Ok(state) => {
                debug!("Read completed successfully");
                (encode_json(&state), vec![])
            },
            Err(e) => {
                error!(error = %e, "Read failed");
                (vec![], error_to_diagnostics(e))
            },
        };
        Ok(tonic::Response::new(protocol::ReadResponse {
            state,
            diagnostics,
        }))
    }

    #[instrument(skip(self, request), name = "grpc.update", fields(resource_type = %request.get_ref().resource_type))]
    async fn update(
        &self,
        request: tonic::Request<protocol::UpdateRequest>,
    ) -> Result<tonic::Response<protocol::UpdateResponse>, tonic::Status> {
        let req = request.into_inner();
        let prior_state = decode_json(&req.prior_state, "prior_state")?;
        let planned_state = decode_json(&req.planned_state, "planned_state")?;
        info!("Update called");

        let (state, diagnostics) = match self
            .provider
            .update(&req.resource_type, prior_state, planned_state)
            .await
        {
            Ok(state) => {
                info!("Update completed successfully");
                (encode_json(&state), vec![])
            },
            Err(e) => {
                error!(error = %e, "Update failed");
                (vec![], error_to_diagnostics(e))
            },
        };
        Ok(tonic::Response::new(protocol::UpdateResponse {
            state,
            diagnostics,
        }))
    }

    #[instrument(skip(self, request), name = "grpc.delete", fields(resource_type = %request.get_ref().resource_type))]
    async fn delete(
        &self,
        request: tonic::Request<protocol::DeleteRequest>,
    ) -> Result<tonic::Response<protocol::DeleteResponse>, tonic::Status> {
        let req = request.into_inner();
        let current_state = decode_json(&req.current_state, "current_state")?;
        info!("Delete called");

        let diagnostics = match self
            .provider
            .delete(&req.resource_type, current_state)
            .await
        {
            Ok(()) => {
                info!("Delete completed successfully");
                vec![]
            },
            Err(e) => {
                error!(error = %e, "Delete failed");
                error_to_diagnostics(e)
            },
        };
        Ok(tonic::Response::new(protocol::DeleteResponse {
            diagnostics,
        }))
    }

    #[instrument(skip(self, request), name = "grpc.import_resource_state", fields(resource_type = %request.get_ref().resource_type))]
    async fn import_resource_state(
        &self,
        request: tonic::Request<protocol::ImportResourceStateRequest>,
    ) -> Result<tonic::Response<protocol::ImportResourceStateResponse>, tonic::Status> {
        let req = request.into_inner();
        info!(id = %req.id, "ImportResourceState called");

        match self
            .provider
            .import_resource(&req.resource_type, &req.id)
            .await
        {
            Ok(imported) => {
                info!(id = %req.id, imported = imported.len(), "ImportResourceState completed");
                Ok(tonic::Response::new(
                    protocol::ImportResourceStateResponse {
                        imported: imported
                            .into_iter()
                            .map(|r| protocol::ImportedResource {
                                resource_type: r.resource_type,
                                state: encode_json(&r.state),
                            })
                            .collect(),
                        diagnostics: vec![],
                    },
                ))
            },
            Err(e) => {
                error!(id = %req.id, error = %e, "ImportResourceState failed");
                Ok(tonic::Response::new(
                    protocol::ImportResourceStateResponse {
                        imported: vec![],
                        diagnostics: error_to_diagnostics(e),
                    },
                ))
            },
        }
    }
}

/// Options for the provider server.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// How long in-flight requests may run after a shutdown signal.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServeOptions {
    /// Create new serve options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Wait for SIGTERM or SIGINT (CTRL+C on Windows).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "Failed to install signal handlers");
                    return std::future::pending::<()>().await;
                },
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        }
    }

    #[cfg(windows)]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install CTRL+C handler");
            return std::future::pending::<()>().await;
        }
        info!("Received CTRL+C, initiating graceful shutdown");
    }

    #[cfg(not(any(unix, windows)))]
    {
        std::future::pending::<()>().await;
    }
}

/// The handshake line printed on stdout once the server is listening.
pub fn handshake_line(addr: SocketAddr) -> String {
    format!("{}|{}|{}", HANDSHAKE_PREFIX, PROTOCOL_VERSION, addr)
}

/// Serve `provider` on a free localhost port.
///
/// Prints `PROVIDER_PLUGIN|<version>|<address>` on stdout, then serves until
/// SIGTERM/SIGINT.
pub async fn serve<P: ProviderService>(provider: P) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    serve_on_listener(
        provider,
        listener,
        ServeOptions::default(),
        wait_for_shutdown_signal(),
    )
    .await
}

async fn serve_on_listener<P, F>(
    provider: P,
    listener: TcpListener,
    options: ServeOptions,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    P: ProviderService,
    F: std::future::Future<Output = ()>,
{
    let addr = listener.local_addr()?;
    println!("{}", handshake_line(addr));
    info!(address = %addr, "Provider server starting");

    let provider = Arc::new(provider);
    let service =
        protocol::provider_server::ProviderServer::new(ProviderGrpcService::new(Arc::clone(&provider)));

    // The drain timer only starts once the shutdown signal has fired.
    let signalled = Arc::new(Notify::new());
    let notify = Arc::clone(&signalled);
    let server = Server::builder()
        .add_service(service)
        .serve_with_incoming_shutdown(
            tokio_stream::wrappers::TcpListenerStream::new(listener),
            async move {
                shutdown.await;
                notify.notify_one();
            },
        );
    tokio::pin!(server);

    let drain_deadline = async {
        signalled.notified().await;
        tokio::time::sleep(options.shutdown_timeout).await;
    };

    tokio::select! {
        result = &mut server => match result {
            Ok(()) => info!("Server shutdown complete"),
            Err(e) => {
                error!(error = %e, "Server error");
                return Err(e.into());
            },
        },
        _ = drain_deadline => {
            warn!(timeout = ?options.shutdown_timeout, "Shutdown timeout exceeded, forcing shutdown");
        },
    }

    debug!("Calling provider stop()");
    if let Err(e) = provider.stop().await {
        warn!(error = %e, "Provider stop() returned error");
    }

    info!("Provider shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::provider_server::Provider;
    use crate::provider::DrpProvider;
    use crate::testing::MemoryDrp;
    use serde_json::json;

    fn grpc() -> ProviderGrpcService<DrpProvider> {
        ProviderGrpcService::new(Arc::new(DrpProvider::with_api(Arc::new(MemoryDrp::new()))))
    }

    #[test]
    fn test_handshake_line() {
        let addr: SocketAddr = "127.0.0.1:50051".parse().unwrap();
        assert_eq!(handshake_line(addr), "PROVIDER_PLUGIN|1|127.0.0.1:50051");
    }

    #[test]
    fn test_decode_json() {
        assert_eq!(decode_json(b"", "config").unwrap(), serde_json::Value::Null);
        assert_eq!(decode_json(br#"{"a":1}"#, "config").unwrap(), json!({"a": 1}));

        let status = decode_json(b"{not json", "config").unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("config"));
    }

    #[tokio::test]
    async fn test_get_metadata_lists_resources() {
        let response = grpc()
            .get_metadata(tonic::Request::new(protocol::GetMetadataRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(
            response.resources,
            vec!["drp_instance", "drp_pool", "drp_profile_param"]
        );
        assert!(response.server_capabilities.unwrap().plan_destroy);
    }

    #[tokio::test]
    async fn test_get_schema_converts_blocks() {
        let response = grpc()
            .get_schema(tonic::Request::new(protocol::GetSchemaRequest {}))
            .await
            .unwrap()
            .into_inner();

        let instance = &response.resources["drp_instance"];
        assert_eq!(instance.version, 1);

        let pool = response.resources["drp_pool"].block.as_ref().unwrap();
        let autofill = pool
            .block_types
            .iter()
            .find(|b| b.type_name == "autofill")
            .unwrap();
        assert_eq!(
            autofill.nesting_mode,
            protocol::nested_block::NestingMode::List as i32
        );
        assert_eq!(autofill.max_items, 1);

        let provider = response.provider.unwrap().block.unwrap();
        let token = provider
            .attributes
            .iter()
            .find(|a| a.name == "token")
            .unwrap();
        assert!(token.sensitive);
    }

    #[tokio::test]
    async fn test_errors_become_diagnostics() {
        let response = grpc()
            .read(tonic::Request::new(protocol::ReadRequest {
                resource_type: "drp_stage".to_string(),
                current_state: encode_json(&json!({"id": "x"})),
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(response.state.is_empty());
        assert_eq!(response.diagnostics.len(), 1);
        assert_eq!(
            response.diagnostics[0].severity,
            protocol::diagnostic::Severity::Error as i32
        );
        assert!(response.diagnostics[0].summary.contains("drp_stage"));
    }

    #[tokio::test]
    async fn test_malformed_state_is_rejected() {
        let status = grpc()
            .create(tonic::Request::new(protocol::CreateRequest {
                resource_type: "drp_pool".to_string(),
                planned_state: b"{".to_vec(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_plan_and_create_pool_over_grpc() {
        let service = grpc();
        let proposed = json!({"pool_id": "edge", "description": "edge racks"});

        let plan = service
            .plan(tonic::Request::new(protocol::PlanRequest {
                resource_type: "drp_pool".to_string(),
                prior_state: vec![],
                proposed_state: encode_json(&proposed),
                config: encode_json(&proposed),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(plan.diagnostics.is_empty());
        assert!(!plan.changes.is_empty());

        let created = service
            .create(tonic::Request::new(protocol::CreateRequest {
                resource_type: "drp_pool".to_string(),
                planned_state: plan.planned_state,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(created.diagnostics.is_empty());

        let state: serde_json::Value = serde_json::from_slice(&created.state).unwrap();
        assert_eq!(state["id"], "edge");
        assert_eq!(state["description"], "edge racks");
    }

    #[tokio::test]
    async fn test_serve_prints_handshake_and_stops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let provider = DrpProvider::with_api(Arc::new(MemoryDrp::new()));
        let options = ServeOptions::new().with_shutdown_timeout(Duration::from_millis(100));

        serve_on_listener(provider, listener, options, async {})
            .await
            .unwrap();
    }
}
