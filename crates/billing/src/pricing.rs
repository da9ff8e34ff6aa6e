//! Live model-pricing catalog.
//!
//! Fetched from an OpenRouter-style `/api/v1/models` endpoint and cached
//! in the coordination store for six hours. Used to log real upstream
//! costs for BYOK accounts; everything else uses the static estimate
//! table in `kiln_domain::plans`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kiln_coordination::{keys, CoordStore, SetMode};
use serde::Deserialize;

const PRICING_TTL: Duration = Duration::from_secs(6 * 3600);

/// USD per single token, as the catalog reports it.
#[derive(Debug, Clone, Copy, Deserialize, serde::Serialize)]
pub struct ModelPrice {
    pub prompt: f64,
    pub completion: f64,
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    data: Vec<CatalogModel>,
}

#[derive(Debug, Deserialize)]
struct CatalogModel {
    id: String,
    pricing: CatalogPricing,
}

#[derive(Debug, Deserialize)]
struct CatalogPricing {
    prompt: String,
    completion: String,
}

pub struct PricingCatalog {
    http: reqwest::Client,
    coord: Arc<dyn CoordStore>,
    endpoint: Option<String>,
}

impl PricingCatalog {
    pub fn new(coord: Arc<dyn CoordStore>, endpoint: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            coord,
            endpoint,
        }
    }

    /// Catalog that never fetches; lookups only hit the cache. Used in
    /// tests and when no upstream endpoint is configured.
    pub fn without_endpoint(coord: Arc<dyn CoordStore>) -> Self {
        Self::new(coord, None)
    }

    /// Real cost for a call, or `None` when the catalog does not know
    /// the model (callers fall back to the static estimate).
    pub async fn estimate_cost(
        &self,
        model: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
    ) -> Option<f64> {
        let table = self.table().await?;
        // Catalog ids omit the router prefix.
        let id = model.strip_prefix("openrouter/").unwrap_or(model);
        let price = table.get(id)?;
        let cost =
            prompt_tokens as f64 * price.prompt + completion_tokens as f64 * price.completion;
        Some((cost * 1e6).round() / 1e6)
    }

    async fn table(&self) -> Option<HashMap<String, ModelPrice>> {
        if let Ok(Some(cached)) = self.coord.get(keys::PRICING_CATALOG).await {
            if let Ok(table) = serde_json::from_str(&cached) {
                return Some(table);
            }
        }

        let table = self.fetch().await?;
        match serde_json::to_string(&table) {
            Ok(serialized) => {
                if let Err(e) = self
                    .coord
                    .set(keys::PRICING_CATALOG, &serialized, PRICING_TTL, SetMode::Always)
                    .await
                {
                    tracing::warn!(error = %e, "failed to cache pricing catalog");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize pricing catalog"),
        }
        Some(table)
    }

    async fn fetch(&self) -> Option<HashMap<String, ModelPrice>> {
        let endpoint = self.endpoint.as_deref()?;
        let response = match self.http.get(endpoint).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "pricing catalog fetch failed");
                return None;
            }
        };
        let body: CatalogResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "pricing catalog response unparseable");
                return None;
            }
        };

        let mut table = HashMap::with_capacity(body.data.len());
        for model in body.data {
            let (Ok(prompt), Ok(completion)) = (
                model.pricing.prompt.parse::<f64>(),
                model.pricing.completion.parse::<f64>(),
            ) else {
                continue;
            };
            table.insert(model.id, ModelPrice { prompt, completion });
        }
        tracing::info!(models = table.len(), "refreshed pricing catalog");
        Some(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_coordination::MemoryStore;
    use kiln_coordination::store::DEFAULT_TTL;

    async fn seed_cache(coord: &MemoryStore) {
        let mut table = HashMap::new();
        table.insert(
            "openai/gpt-4o".to_string(),
            ModelPrice {
                prompt: 0.000005,
                completion: 0.000015,
            },
        );
        coord
            .set(
                keys::PRICING_CATALOG,
                &serde_json::to_string(&table).unwrap(),
                DEFAULT_TTL,
                SetMode::Always,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn no_endpoint_and_cold_cache_yields_none() {
        let coord = Arc::new(MemoryStore::new());
        let catalog = PricingCatalog::without_endpoint(coord);
        assert!(catalog.estimate_cost("openrouter/openai/gpt-4o", 100, 100).await.is_none());
    }

    #[tokio::test]
    async fn cached_table_is_used_and_prefix_stripped() {
        let coord = Arc::new(MemoryStore::new());
        seed_cache(&coord).await;
        let catalog = PricingCatalog::without_endpoint(coord);

        let cost = catalog
            .estimate_cost("openrouter/openai/gpt-4o", 1000, 1000)
            .await
            .unwrap();
        assert!((cost - 0.02).abs() < 1e-9);

        // Unknown model: fall back to None.
        assert!(catalog.estimate_cost("openrouter/unknown/x", 10, 10).await.is_none());
    }

    #[tokio::test]
    async fn catalog_response_parsing() {
        let raw = r#"{"data":[
            {"id":"openai/gpt-4o","pricing":{"prompt":"0.000005","completion":"0.000015"}},
            {"id":"broken/model","pricing":{"prompt":"not-a-number","completion":"0"}}
        ]}"#;
        let parsed: CatalogResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.data.len(), 2);

        // The unparseable entry is skipped when building the table.
        let mut table = HashMap::new();
        for model in parsed.data {
            if let (Ok(p), Ok(c)) = (
                model.pricing.prompt.parse::<f64>(),
                model.pricing.completion.parse::<f64>(),
            ) {
                table.insert(model.id, ModelPrice { prompt: p, completion: c });
            }
        }
        assert_eq!(table.len(), 1);
        assert!(table.contains_key("openai/gpt-4o"));
    }
}
