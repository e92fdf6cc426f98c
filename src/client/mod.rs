//! Access to the DRP REST API.
//!
//! Resources never see an HTTP client directly: they are handed a
//! `&dyn DrpApi`, implemented over HTTP by [`DrpClient`] and in memory by
//! [`crate::testing::MemoryDrp`].

pub mod models;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, instrument};
use url::Url;

use crate::config::{ClientSettings, Credentials};
use crate::error::ProviderError;
use crate::status::MachineStatus;
use models::{AllocationRequest, ApiError, Machine, Param, Pool, PoolResult, ReleaseRequest};

/// Operations the resources need from a DRP server.
#[async_trait]
pub trait DrpApi: Send + Sync {
    /// Global parameter definition, `None` if no such param exists.
    async fn get_param(&self, name: &str) -> Result<Option<Param>, ProviderError>;

    /// Value of a parameter set on a profile.
    async fn get_profile_param(
        &self,
        profile: &str,
        name: &str,
    ) -> Result<serde_json::Value, ProviderError>;

    /// Set a parameter on a profile. `value` is either the plain value or a
    /// serialized [`models::SecureData`].
    async fn set_profile_param(
        &self,
        profile: &str,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), ProviderError>;

    /// Remove a parameter from a profile.
    async fn delete_profile_param(&self, profile: &str, name: &str) -> Result<(), ProviderError>;

    /// Public key used to seal secure values for `profile`.
    async fn profile_public_key(&self, profile: &str) -> Result<Vec<u8>, ProviderError>;

    /// Create a pool.
    async fn create_pool(&self, pool: &Pool) -> Result<Pool, ProviderError>;

    /// Fetch a pool.
    async fn get_pool(&self, id: &str) -> Result<Pool, ProviderError>;

    /// Replace a pool.
    async fn update_pool(&self, pool: &Pool) -> Result<Pool, ProviderError>;

    /// Delete a pool.
    async fn delete_pool(&self, id: &str) -> Result<(), ProviderError>;

    /// Allocate one machine from `pool`.
    async fn allocate_machine(
        &self,
        pool: &str,
        request: &AllocationRequest,
    ) -> Result<Machine, ProviderError>;

    /// Return a machine to `pool`.
    async fn release_machine(&self, pool: &str, uuid: &str) -> Result<(), ProviderError>;

    /// Fetch a machine.
    async fn get_machine(&self, uuid: &str) -> Result<Machine, ProviderError>;

    /// Replace a machine.
    async fn update_machine(&self, machine: &Machine) -> Result<Machine, ProviderError>;

    /// Run a machine action such as `poweron`.
    async fn machine_action(&self, uuid: &str, action: &str) -> Result<(), ProviderError>;

    /// Current lifecycle status of a machine.
    async fn machine_status(&self, uuid: &str) -> Result<MachineStatus, ProviderError> {
        Ok(self.get_machine(uuid).await?.status())
    }
}

/// [`DrpApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct DrpClient {
    http: Client,
    endpoint: Url,
    credentials: Credentials,
}

impl DrpClient {
    /// Build a client from resolved settings.
    pub fn new(settings: &ClientSettings) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .danger_accept_invalid_certs(settings.insecure)
            .build()?;

        if settings.endpoint.cannot_be_a_base() {
            return Err(ProviderError::Configuration(format!(
                "endpoint {} cannot be used as a base URL",
                settings.endpoint
            )));
        }

        Ok(Self {
            http,
            endpoint: settings.endpoint.clone(),
            credentials: settings.credentials.clone(),
        })
    }

    /// `<endpoint>/api/v3/<segments...>`, each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ProviderError::Configuration(format!(
                    "endpoint {} cannot be used as a base URL",
                    self.endpoint
                ))
            })?
            .pop_if_empty()
            .extend(["api", "v3"])
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.credentials {
            Credentials::Token(token) => builder.bearer_auth(token),
            Credentials::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            },
        }
    }

    async fn send<B, T>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<T, ProviderError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = self.url(segments)?;
        debug!(%method, %url, "DRP request");
        let mut builder = self.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        Self::handle_response(response).await
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ProviderError> {
        self.send::<(), T>(Method::GET, segments, None).await
    }

    async fn post<B, T>(&self, segments: &[&str], body: &B) -> Result<T, ProviderError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        self.send(Method::POST, segments, Some(body)).await
    }

    async fn put<B, T>(&self, segments: &[&str], body: &B) -> Result<T, ProviderError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        self.send(Method::PUT, segments, Some(body)).await
    }

    async fn delete(&self, segments: &[&str]) -> Result<(), ProviderError> {
        self.send::<(), serde_json::Value>(Method::DELETE, segments, None)
            .await
            .map(|_| ())
    }

    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
        let status = response.status();
        if status.is_success() {
            let bytes = response.bytes().await?;
            // Some DRP endpoints answer with an empty body.
            let body: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
            return Ok(serde_json::from_slice(body)?);
        }

        let text = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ApiError>(&text) {
            Ok(api) if !api.messages.is_empty() => api.messages.join("; "),
            _ if !text.trim().is_empty() => text.trim().to_string(),
            _ => status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string(),
        };
        Err(ProviderError::from_status(status.as_u16(), message))
    }
}

#[async_trait]
impl DrpApi for DrpClient {
    #[instrument(skip(self))]
    async fn get_param(&self, name: &str) -> Result<Option<Param>, ProviderError> {
        match self.get::<Param>(&["params", name]).await {
            Ok(param) => Ok(Some(param)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self))]
    async fn get_profile_param(
        &self,
        profile: &str,
        name: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        self.get(&["profiles", profile, "params", name]).await
    }

    #[instrument(skip(self, value))]
    async fn set_profile_param(
        &self,
        profile: &str,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), ProviderError> {
        self.post::<_, serde_json::Value>(&["profiles", profile, "params", name], value)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn delete_profile_param(&self, profile: &str, name: &str) -> Result<(), ProviderError> {
        self.delete(&["profiles", profile, "params", name]).await
    }

    #[instrument(skip(self))]
    async fn profile_public_key(&self, profile: &str) -> Result<Vec<u8>, ProviderError> {
        let encoded: String = self.get(&["profiles", profile, "pubkey"]).await?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(|err| ProviderError::Crypto(format!("malformed public key: {}", err)))
    }

    #[instrument(skip(self, pool), fields(pool = %pool.id))]
    async fn create_pool(&self, pool: &Pool) -> Result<Pool, ProviderError> {
        self.post(&["pools"], pool).await
    }

    #[instrument(skip(self))]
    async fn get_pool(&self, id: &str) -> Result<Pool, ProviderError> {
        self.get(&["pools", id]).await
    }

    #[instrument(skip(self, pool), fields(pool = %pool.id))]
    async fn update_pool(&self, pool: &Pool) -> Result<Pool, ProviderError> {
        self.put(&["pools", &pool.id], pool).await
    }

    #[instrument(skip(self))]
    async fn delete_pool(&self, id: &str) -> Result<(), ProviderError> {
        self.delete(&["pools", id]).await
    }

    #[instrument(skip(self, request))]
    async fn allocate_machine(
        &self,
        pool: &str,
        request: &AllocationRequest,
    ) -> Result<Machine, ProviderError> {
        let results: Vec<PoolResult> = self
            .post(&["pools", pool, "allocateMachines"], request)
            .await?;
        let allocated = results.into_iter().next().ok_or_else(|| {
            ProviderError::ResourceExhausted(format!("no machine available in pool {}", pool))
        })?;
        self.get_machine(&allocated.uuid).await
    }

    #[instrument(skip(self))]
    async fn release_machine(&self, pool: &str, uuid: &str) -> Result<(), ProviderError> {
        let request = ReleaseRequest {
            machines: vec![uuid.to_string()],
        };
        self.post::<_, serde_json::Value>(&["pools", pool, "releaseMachines"], &request)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn get_machine(&self, uuid: &str) -> Result<Machine, ProviderError> {
        self.get(&["machines", uuid]).await
    }

    #[instrument(skip(self, machine), fields(uuid = %machine.uuid))]
    async fn update_machine(&self, machine: &Machine) -> Result<Machine, ProviderError> {
        self.put(&["machines", &machine.uuid], machine).await
    }

    #[instrument(skip(self))]
    async fn machine_action(&self, uuid: &str, action: &str) -> Result<(), ProviderError> {
        self.post::<_, serde_json::Value>(
            &["machines", uuid, "actions", action],
            &serde_json::json!({}),
        )
        .await
        .map(|_| ())
    }
}
