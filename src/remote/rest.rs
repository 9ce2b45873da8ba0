use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::{RemoteClient, RemoteError};
use crate::config::RemoteConfig;
use crate::models::EntityType;

/// Longest error body carried into a [`RemoteError::Rejected`]
const MAX_ERROR_BODY: usize = 300;

/// PostgREST-style REST backend client
#[derive(Clone)]
pub struct RestRemote {
  client: reqwest::Client,
  base: Url,
  api_key: String,
}

impl RestRemote {
  pub fn new(config: &RemoteConfig, api_key: String) -> Result<Self> {
    let mut base = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid remote url '{}': {}", config.url, e))?;
    // Url::join drops the last segment unless the path ends with '/'
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      api_key,
    })
  }

  fn table_url(&self, entity: EntityType) -> Result<Url, RemoteError> {
    self
      .base
      .join(&format!("rest/v1/{}", entity.table()))
      .map_err(|e| RemoteError::Unreachable(format!("bad table url: {}", e)))
  }

  fn fetch_url(&self, entity: EntityType, owner_id: &str) -> Result<Url, RemoteError> {
    let mut url = self.table_url(entity)?;
    url
      .query_pairs_mut()
      .append_pair("select", "*")
      .append_pair("user_id", &format!("eq.{}", owner_id));
    Ok(url)
  }

  fn upsert_url(&self, entity: EntityType) -> Result<Url, RemoteError> {
    let mut url = self.table_url(entity)?;
    url
      .query_pairs_mut()
      .append_pair("on_conflict", entity.identity_column());
    Ok(url)
  }

  fn delete_url(&self, entity: EntityType, id: &str) -> Result<Url, RemoteError> {
    let mut url = self.table_url(entity)?;
    url
      .query_pairs_mut()
      .append_pair(entity.identity_column(), &format!("eq.{}", id));
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    self
      .client
      .request(method, url)
      .header("apikey", &self.api_key)
      .bearer_auth(&self.api_key)
  }
}

fn transport(e: reqwest::Error) -> RemoteError {
  RemoteError::Unreachable(e.to_string())
}

/// Turn a non-success status into [`RemoteError::Rejected`].
async fn check(response: Response) -> Result<Response, RemoteError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let mut message = response.text().await.unwrap_or_default();
  if message.len() > MAX_ERROR_BODY {
    let mut cut = MAX_ERROR_BODY;
    while !message.is_char_boundary(cut) {
      cut -= 1;
    }
    message.truncate(cut);
  }
  Err(RemoteError::Rejected {
    status: status.as_u16(),
    message,
  })
}

#[async_trait]
impl RemoteClient for RestRemote {
  async fn fetch_all(&self, entity: EntityType, owner_id: &str) -> Result<Vec<Value>, RemoteError> {
    let url = self.fetch_url(entity, owner_id)?;
    let response = self
      .request(Method::GET, url)
      .send()
      .await
      .map_err(transport)?;

    check(response)
      .await?
      .json::<Vec<Value>>()
      .await
      .map_err(|e| RemoteError::Decode(e.to_string()))
  }

  async fn upsert(&self, entity: EntityType, record: &Value) -> Result<(), RemoteError> {
    let url = self.upsert_url(entity)?;
    let response = self
      .request(Method::POST, url)
      .header("Prefer", "resolution=merge-duplicates,return=minimal")
      .json(record)
      .send()
      .await
      .map_err(transport)?;

    check(response).await?;
    Ok(())
  }

  async fn delete(&self, entity: EntityType, id: &str) -> Result<(), RemoteError> {
    let url = self.delete_url(entity, id)?;
    let response = self
      .request(Method::DELETE, url)
      .send()
      .await
      .map_err(transport)?;

    check(response).await?;
    Ok(())
  }

  async fn ping(&self) -> Result<(), RemoteError> {
    let url = self
      .base
      .join("rest/v1/")
      .map_err(|e| RemoteError::Unreachable(format!("bad base url: {}", e)))?;
    let response = self
      .request(Method::HEAD, url)
      .send()
      .await
      .map_err(transport)?;

    // Any answer short of a server error means the backend is reachable
    if response.status().is_server_error() {
      return Err(RemoteError::Rejected {
        status: response.status().as_u16(),
        message: "server error".to_string(),
      });
    }
    Ok(())
  }
}
