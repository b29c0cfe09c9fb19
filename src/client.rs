//! Typed client for the management API, used by the CLI.

use crate::api::{
    encode_hostname, AddServerRequest, CreatePoolRequest, ListPoolsResponse, PoolResponse,
    PoolStatsResponse, TransactionRequest, TransactionResponse, UpdatePoolRequest,
    VersionResponse,
};
use crate::auth::RequestSigner;
use crate::VERSION;
use anyhow::{bail, Context};
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Client-side configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Signing key file; requests go unsigned when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read client config {}", path.display()))?;
        serde_yaml::from_str(&contents).context("failed to parse client config")
    }

    pub fn sample() -> Self {
        Self {
            host: "http://localhost".to_string(),
            port: 8090,
            key_file: None,
        }
    }

    pub fn write_sample(path: impl AsRef<Path>) -> anyhow::Result<()> {
        let data = serde_yaml::to_string(&Self::sample()).context("failed to serialize config")?;
        std::fs::write(path.as_ref(), data)
            .with_context(|| format!("failed to write {}", path.as_ref().display()))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct ControlClient {
    http: reqwest::Client,
    base: String,
    signer: Option<RequestSigner>,
}

impl ControlClient {
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        let signer = config
            .key_file
            .as_ref()
            .map(RequestSigner::from_file)
            .transpose()?;
        Ok(Self {
            http: reqwest::Client::new(),
            base: format!("{}:{}", config.host, config.port),
            signer,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base, path));
        if let Some(signer) = &self.signer {
            builder = builder.header(AUTHORIZATION, signer.authorization());
        }
        builder
    }

    async fn expect_ok(response: Response) -> anyhow::Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| "unknown error".to_string());
        bail!("request failed, server responded: {status} - {message}");
    }

    pub async fn version(&self) -> anyhow::Result<String> {
        let response = Self::expect_ok(self.request(Method::GET, "/version").send().await?).await?;
        Ok(response.json::<VersionResponse>().await?.version)
    }

    /// Refuse to talk to a server running a different version.
    pub async fn check_version(&self) -> anyhow::Result<()> {
        let server = self.version().await.context("error getting server version")?;
        if server != VERSION {
            bail!("server version mismatch: expected {VERSION}, got {server}");
        }
        Ok(())
    }

    pub async fn list_pools(&self) -> anyhow::Result<Vec<String>> {
        let response = Self::expect_ok(self.request(Method::GET, "/pools").send().await?).await?;
        Ok(response.json::<ListPoolsResponse>().await?.pools)
    }

    pub async fn create_pool(&self, request: &CreatePoolRequest) -> anyhow::Result<()> {
        Self::expect_ok(
            self.request(Method::POST, "/pools")
                .json(request)
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    pub async fn delete_pool(&self, hostname: &str) -> anyhow::Result<()> {
        let path = format!("/pools/{}", encode_hostname(hostname));
        Self::expect_ok(self.request(Method::DELETE, &path).send().await?).await?;
        Ok(())
    }

    pub async fn get_pool(&self, hostname: &str) -> anyhow::Result<PoolResponse> {
        let path = format!("/pools/{}", encode_hostname(hostname));
        let response = Self::expect_ok(self.request(Method::GET, &path).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn pool_stats(&self, hostname: &str) -> anyhow::Result<PoolStatsResponse> {
        let path = format!("/pools/{}/stats", encode_hostname(hostname));
        let response = Self::expect_ok(self.request(Method::GET, &path).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn update_pool(
        &self,
        hostname: &str,
        request: &UpdatePoolRequest,
    ) -> anyhow::Result<()> {
        let path = format!("/pools/{}", encode_hostname(hostname));
        Self::expect_ok(self.request(Method::POST, &path).json(request).send().await?).await?;
        Ok(())
    }

    pub async fn add_server(&self, hostname: &str, request: &AddServerRequest) -> anyhow::Result<()> {
        let path = format!("/pools/{}/server", encode_hostname(hostname));
        Self::expect_ok(self.request(Method::POST, &path).json(request).send().await?).await?;
        Ok(())
    }

    pub async fn remove_server(&self, hostname: &str, server_id: Uuid) -> anyhow::Result<()> {
        let path = format!("/pools/{}/{}", encode_hostname(hostname), server_id);
        Self::expect_ok(self.request(Method::DELETE, &path).send().await?).await?;
        Ok(())
    }

    pub async fn start_transaction(
        &self,
        hostname: &str,
        request: &TransactionRequest,
    ) -> anyhow::Result<TransactionResponse> {
        let path = format!("/pools/{}/transaction", encode_hostname(hostname));
        let response =
            Self::expect_ok(self.request(Method::POST, &path).json(request).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn transaction_status(&self, id: Uuid) -> anyhow::Result<TransactionResponse> {
        let path = format!("/pools/transaction/{id}");
        let response = Self::expect_ok(self.request(Method::GET, &path).send().await?).await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.yaml");
        ClientConfig::write_sample(&path).unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.host, "http://localhost");
        assert_eq!(config.port, 8090);
        assert!(config.key_file.is_none());
    }

    #[test]
    fn test_client_base_url() {
        let client = ControlClient::new(&ClientConfig::sample()).unwrap();
        assert_eq!(client.base, "http://localhost:8090");
    }
}
