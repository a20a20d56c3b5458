use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use url::Url;

/// Content store for model parameters and their extra data.
///
/// Values are addressed by the key returned from `set`; jobs only ever hold
/// keys.
#[async_trait]
pub trait ParamStore: Send + Sync
{
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn set(&self, value: Vec<u8>) -> Result<String>;
}

/// Content address of a value.
fn content_key(value: &[u8]) -> String
{
    general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(value))
}

//////////////////////////////////////////////////
// in memory:

#[derive(Default)]
pub struct InMemoryParamStore
{
    table: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryParamStore
{
    pub fn new() -> Self
    {
        Self::default()
    }
}

#[async_trait]
impl ParamStore for InMemoryParamStore
{
    async fn get(&self, key: &str) -> Result<Vec<u8>>
    {
        self.table
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("No value stored under key [{key}]."))
    }

    async fn set(&self, value: Vec<u8>) -> Result<String>
    {
        let key = content_key(&value);
        self.table.write().await.insert(key.clone(), value);
        Ok(key)
    }
}

//////////////////////////////////////////////////
// http:

#[derive(Serialize)]
struct SetRequest
{
    value: String,
}

#[derive(Deserialize)]
struct SetResponse
{
    status: bool,
    key: Option<String>,
}

#[derive(Deserialize)]
struct GetResponse
{
    status: bool,
    value: Option<String>,
}

/// Client of the key-value service, `GET /get?key=` and `POST /set`.
///
/// Values are base64 encoded on the wire.
pub struct HttpParamStore
{
    http_client: reqwest::Client,
    base_url: Url,
}

impl HttpParamStore
{
    pub fn new(base_url: Url) -> Result<Self>
    {
        const CLIENT_USER_AGENT: &str =
            concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

        let http_client = reqwest::Client::builder()
            .user_agent(CLIENT_USER_AGENT)
            .build()
            .context("couldn't create HTTP client")?;

        Ok(HttpParamStore {
            http_client,
            base_url,
        })
    }
}

#[async_trait]
impl ParamStore for HttpParamStore
{
    async fn get(&self, key: &str) -> Result<Vec<u8>>
    {
        let url = self.base_url.join("get")?;
        let response: GetResponse = self
            .http_client
            .get(url)
            .query(&[("key", key)])
            .send()
            .await?
            .json()
            .await
            .context("malformed response from key-value store")?;

        match (response.status, response.value)
        {
            (true, Some(value)) => general_purpose::STANDARD
                .decode(value)
                .context("value is not base64 encoded"),
            _ => Err(anyhow!("No value stored under key [{key}].")),
        }
    }

    async fn set(&self, value: Vec<u8>) -> Result<String>
    {
        let url = self.base_url.join("set")?;
        let request = SetRequest {
            value: general_purpose::STANDARD.encode(value),
        };
        let response: SetResponse = self
            .http_client
            .post(url)
            .json(&request)
            .send()
            .await?
            .json()
            .await
            .context("malformed response from key-value store")?;

        match (response.status, response.key)
        {
            (true, Some(key)) => Ok(key),
            _ => Err(anyhow!("Key-value store refused to store value.")),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[tokio::test]
    async fn equal_values_share_a_key()
    {
        let store = InMemoryParamStore::new();
        let a = store.set(b"weights".to_vec()).await.unwrap();
        let b = store.set(b"weights".to_vec()).await.unwrap();
        let c = store.set(b"other".to_vec()).await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(store.get(&a).await.unwrap(), b"weights".to_vec());
        assert!(store.get("missing").await.is_err());
    }
}
