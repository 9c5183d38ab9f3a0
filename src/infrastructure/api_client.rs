use crate::infrastructure::credential_store::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SecureStore};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::http_transport::{HttpRequest, HttpResponse, HttpTransport};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

pub const TOKEN_ENDPOINT: &str = "/token/";
pub const TOKEN_REFRESH_ENDPOINT: &str = "/token/refresh/";

const AUTHORIZATION: &str = "Authorization";
const CONTENT_TYPE: &str = "Content-Type";
const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: Vec::new(),
            body: None,
        }
    }
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn patch(body: Option<Value>) -> Self {
        Self {
            method: Method::PATCH,
            body,
            ..Self::default()
        }
    }

    pub fn delete() -> Self {
        Self {
            method: Method::DELETE,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, serde::Deserialize)]
struct RefreshResponsePayload {
    access: Option<String>,
    refresh: Option<String>,
}

/// Bearer-authenticated access to the task API.
///
/// A 401 triggers exactly one refresh of the access token followed by exactly one
/// retry of the original request. Whatever the retry returns is final.
pub struct AuthenticatedClient<S, T>
where
    S: SecureStore + ?Sized,
    T: HttpTransport + ?Sized,
{
    base_url: String,
    store: Arc<S>,
    transport: Arc<T>,
}

impl<S, T> AuthenticatedClient<S, T>
where
    S: SecureStore + ?Sized,
    T: HttpTransport + ?Sized,
{
    pub fn new(base_url: &str, store: Arc<S>, transport: Arc<T>) -> Result<Self, InfraError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        Url::parse(&base_url)
            .map_err(|error| InfraError::InvalidConfig(format!("invalid api base url: {error}")))?;
        Ok(Self {
            base_url,
            store,
            transport,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn endpoint_url(&self, endpoint: &str) -> Result<Url, InfraError> {
        let endpoint = endpoint.trim();
        let joined = if endpoint.starts_with('/') {
            format!("{}{endpoint}", self.base_url)
        } else {
            format!("{}/{endpoint}", self.base_url)
        };
        Url::parse(&joined)
            .map_err(|error| InfraError::Validation(format!("invalid endpoint `{endpoint}`: {error}")))
    }

    pub async fn request(&self, endpoint: &str, options: RequestOptions) -> Result<Value, InfraError> {
        let url = self.endpoint_url(endpoint)?;
        let token = self.store.get_item(ACCESS_TOKEN_KEY).await?;

        let response = self
            .transport
            .send(Self::build_request(&url, &options, token.as_deref()))
            .await?;

        let response = if response.is_unauthorized() {
            warn!(endpoint, "access token rejected; refreshing session");
            let access_token = self.refresh_access_token().await?;
            let retry = self
                .transport
                .send(Self::build_request(&url, &options, Some(&access_token)))
                .await?;
            if !retry.is_success() {
                warn!(endpoint, status = retry.status, "request still failing after token refresh");
            }
            retry
        } else {
            response
        };

        Self::parse_response(response)
    }

    pub async fn request_json<R>(&self, endpoint: &str, options: RequestOptions) -> Result<R, InfraError>
    where
        R: DeserializeOwned,
    {
        let value = self.request(endpoint, options).await?;
        Self::decode(value)
    }

    /// Sends without credentials and without the refresh path, for the token endpoint itself.
    pub async fn request_anonymous<R>(&self, endpoint: &str, options: RequestOptions) -> Result<R, InfraError>
    where
        R: DeserializeOwned,
    {
        let url = self.endpoint_url(endpoint)?;
        let response = self
            .transport
            .send(Self::build_request(&url, &options, None))
            .await?;
        Self::decode(Self::parse_response(response)?)
    }

    async fn refresh_access_token(&self) -> Result<String, InfraError> {
        let Some(refresh_token) = self
            .store
            .get_item(REFRESH_TOKEN_KEY)
            .await?
            .filter(|value| !value.trim().is_empty())
        else {
            warn!("no refresh token stored; login required");
            return Err(InfraError::Authentication);
        };

        let url = self.endpoint_url(TOKEN_REFRESH_ENDPOINT)?;
        let options = RequestOptions::post(serde_json::json!({ "refresh": refresh_token }));
        let response = self
            .transport
            .send(Self::build_request(&url, &options, None))
            .await?;

        if !response.is_success() {
            warn!(status = response.status, "token refresh rejected");
            return Err(InfraError::SessionExpired);
        }

        let payload = serde_json::from_str::<RefreshResponsePayload>(&response.body).map_err(|error| {
            warn!(%error, "token refresh returned an unreadable payload");
            InfraError::SessionExpired
        })?;
        let access_token = payload
            .access
            .filter(|value| !value.trim().is_empty())
            .ok_or(InfraError::SessionExpired)?;

        self.store.set_item(ACCESS_TOKEN_KEY, &access_token).await?;
        if let Some(rotated) = payload.refresh.filter(|value| !value.trim().is_empty()) {
            self.store.set_item(REFRESH_TOKEN_KEY, &rotated).await?;
        }
        info!("access token refreshed");
        Ok(access_token)
    }

    fn build_request(url: &Url, options: &RequestOptions, access_token: Option<&str>) -> HttpRequest {
        let mut headers = Vec::with_capacity(options.headers.len() + 2);
        if let Some(token) = access_token.map(str::trim).filter(|value| !value.is_empty()) {
            headers.push((AUTHORIZATION.to_string(), format!("Bearer {token}")));
        }
        headers.push((CONTENT_TYPE.to_string(), JSON_CONTENT_TYPE.to_string()));

        for (name, value) in &options.headers {
            if name.eq_ignore_ascii_case(AUTHORIZATION) {
                debug!("ignoring caller supplied Authorization header");
                continue;
            }
            match headers
                .iter_mut()
                .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            {
                Some(existing) => existing.1 = value.clone(),
                None => headers.push((name.clone(), value.clone())),
            }
        }

        HttpRequest {
            method: options.method.clone(),
            url: url.clone(),
            headers,
            body: options.body.as_ref().map(Value::to_string),
        }
    }

    fn parse_response(response: HttpResponse) -> Result<Value, InfraError> {
        if !response.is_success() {
            return Err(InfraError::Request {
                status: response.status,
                body: response.body,
            });
        }
        if response.body.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&response.body).map_err(|error| InfraError::Parse {
            message: error.to_string(),
            body: response.body,
        })
    }

    fn decode<R>(value: Value) -> Result<R, InfraError>
    where
        R: DeserializeOwned,
    {
        let body = value.to_string();
        serde_json::from_value(value).map_err(|error| InfraError::Parse {
            message: error.to_string(),
            body,
        })
    }
}
