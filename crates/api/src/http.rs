use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder};
use tally_core::OwnerTag;

use crate::{HashList, InventoryApi, ResourceUpdate};

const API_KEY_HEADER: &str = "X-API-KEY";

/// reqwest-backed inventory transport.
#[derive(Clone)]
pub struct HttpInventory {
    client: Client,
    base: String,
    api_key: Option<String>,
}

impl HttpInventory {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build().context("building http client")?;
        Ok(Self::with_client(client, base_url, api_key))
    }

    /// Use a client configured elsewhere (proxies, TLS roots).
    pub fn with_client(client: Client, base_url: &str, api_key: Option<String>) -> Self {
        Self { client, base: base_url.trim_end_matches('/').to_string(), api_key }
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.header(API_KEY_HEADER, key),
            None => req,
        }
    }

    fn uid_url(&self, uid: &str) -> String { format!("{}/v1/resources/uid/{}", self.base, uid) }

    async fn status_of(&self, req: RequestBuilder) -> Result<u16> {
        let resp = self.authed(req).send().await.context("sending request to inventory")?;
        Ok(resp.status().as_u16())
    }
}

#[async_trait::async_trait]
impl InventoryApi for HttpInventory {
    async fn create(&self, update: &ResourceUpdate) -> Result<u16> {
        self.status_of(self.client.post(format!("{}/v1/resources", self.base)).json(update)).await
    }

    async fn update(&self, update: &ResourceUpdate) -> Result<u16> {
        self.status_of(self.client.put(self.uid_url(&update.uid)).json(update)).await
    }

    async fn delete(&self, update: &ResourceUpdate) -> Result<u16> {
        self.status_of(self.client.delete(self.uid_url(&update.uid)).json(update)).await
    }

    async fn hash_list(&self, owner: &OwnerTag) -> Result<HashList> {
        let req = self
            .client
            .get(format!("{}/v1/resources/hashes", self.base))
            .query(&[("ownerScope", owner.scope.as_str()), ("ownerSubject", owner.subject.as_str())]);
        let resp = self.authed(req).send().await.context("requesting hash list")?;
        let resp = resp.error_for_status().context("hash list status")?;
        resp.json::<HashList>().await.context("decoding hash list")
    }
}
