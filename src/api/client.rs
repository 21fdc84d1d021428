//! reqwest implementation of [`AnnotationApi`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::{AnnotationApi, ApiError, SearchParams, SearchResponse};
use crate::models::{Group, Profile};

/// Endpoint URLs resolved from the API root document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routes {
    pub search: String,
    pub profile: String,
    pub groups: String,
}

impl Routes {
    /// Resolve routes from the `links` tree of the API root document.
    ///
    /// Route names are dotted paths into the tree, e.g. `profile.read` is
    /// `links.profile.read.url`.
    pub fn from_index(index: &Value) -> Result<Self, ApiError> {
        let links = &index["links"];
        Ok(Self {
            search: route_url(links, "search")?,
            profile: route_url(links, "profile.read")?,
            groups: route_url(links, "groups.read")?,
        })
    }
}

fn route_url(links: &Value, route: &str) -> Result<String, ApiError> {
    route
        .split('.')
        .fold(Some(links), |entry, part| entry.and_then(|e| e.get(part)))
        .and_then(|entry| entry.get("url"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ApiError::MissingRoute(route.to_string()))
}

/// HTTP client for the annotation service.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    routes: Routes,
}

impl ApiClient {
    /// Connect to the API rooted at `api_url`, discovering its routes.
    ///
    /// `timeout` bounds every request made through the client.
    pub async fn connect(api_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = build_client(timeout)?;
        let index: Value = get_json(&client, api_url, None, None::<&()>).await?;
        let routes = Routes::from_index(&index)?;
        debug!("Resolved API routes: {:?}", routes);
        Ok(Self { client, routes })
    }

    /// Build a client with already-known routes.
    pub fn with_routes(routes: Routes, timeout: Duration) -> Result<Self, ApiError> {
        Ok(Self {
            client: build_client(timeout)?,
            routes,
        })
    }

    pub fn routes(&self) -> &Routes {
        &self.routes
    }
}

fn build_client(timeout: Duration) -> Result<Client, ApiError> {
    Ok(Client::builder()
        .user_agent(concat!("notecount/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .gzip(true)
        .build()?)
}

async fn get_json<T, Q>(
    client: &Client,
    url: &str,
    auth: Option<&str>,
    query: Option<&Q>,
) -> Result<T, ApiError>
where
    T: DeserializeOwned,
    Q: serde::Serialize + ?Sized,
{
    let mut request = client.get(url);
    if let Some(query) = query {
        request = request.query(query);
    }
    if let Some(auth) = auth {
        request = request.header(AUTHORIZATION, auth);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::Status {
            method: "GET",
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| ApiError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl AnnotationApi for ApiClient {
    async fn search(&self, params: &SearchParams) -> Result<SearchResponse, ApiError> {
        get_json(&self.client, &self.routes.search, None, Some(params)).await
    }

    async fn profile(&self, auth: Option<&str>) -> Result<Profile, ApiError> {
        get_json(&self.client, &self.routes.profile, auth, None::<&()>).await
    }

    async fn groups(&self, auth: Option<&str>) -> Result<Vec<Group>, ApiError> {
        get_json(&self.client, &self.routes.groups, auth, None::<&()>).await
    }
}
