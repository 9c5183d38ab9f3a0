use crate::domain::models::{SessionTokens, UserProfile};
use crate::infrastructure::api_client::{AuthenticatedClient, RequestOptions, TOKEN_ENDPOINT};
use crate::infrastructure::credential_store::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SecureStore};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::http_transport::HttpTransport;
use std::sync::Arc;
use tracing::{info, warn};

const PROFILE_ENDPOINT: &str = "/me";

#[derive(Debug, serde::Deserialize)]
struct TokenPairPayload {
    access: Option<String>,
    refresh: Option<String>,
}

/// Login, logout and profile lookup on top of the shared authenticated client.
pub struct SessionManager<S, T>
where
    S: SecureStore + ?Sized,
    T: HttpTransport + ?Sized,
{
    client: Arc<AuthenticatedClient<S, T>>,
}

impl<S, T> SessionManager<S, T>
where
    S: SecureStore + ?Sized,
    T: HttpTransport + ?Sized,
{
    pub fn new(client: Arc<AuthenticatedClient<S, T>>) -> Self {
        Self { client }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<SessionTokens, InfraError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(InfraError::Validation("username must not be empty".to_string()));
        }
        if password.is_empty() {
            return Err(InfraError::Validation("password must not be empty".to_string()));
        }

        let payload: TokenPairPayload = self
            .client
            .request_anonymous(
                TOKEN_ENDPOINT,
                RequestOptions::post(serde_json::json!({
                    "username": username,
                    "password": password,
                })),
            )
            .await
            .inspect_err(|error| warn!(%error, "login rejected"))?;

        let access_token = payload
            .access
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| InfraError::Parse {
                message: "login response did not include an access token".to_string(),
                body: String::new(),
            })?;
        let refresh_token = payload.refresh.filter(|value| !value.trim().is_empty());

        let store = self.client.store();
        store.set_item(ACCESS_TOKEN_KEY, &access_token).await?;
        match refresh_token.as_deref() {
            Some(refresh) => store.set_item(REFRESH_TOKEN_KEY, refresh).await?,
            None => store.remove_item(REFRESH_TOKEN_KEY).await?,
        }

        info!(username, "logged in");
        Ok(SessionTokens {
            access_token,
            refresh_token,
        })
    }

    pub async fn logout(&self) -> Result<(), InfraError> {
        let store = self.client.store();
        store.remove_item(ACCESS_TOKEN_KEY).await?;
        store.remove_item(REFRESH_TOKEN_KEY).await?;
        info!("logged out");
        Ok(())
    }

    /// Hydrates session state on start; true when an access token is stored.
    pub async fn restore(&self) -> Result<bool, InfraError> {
        let restored = self.is_authenticated().await?;
        if restored {
            info!("restored stored session");
        }
        Ok(restored)
    }

    pub async fn is_authenticated(&self) -> Result<bool, InfraError> {
        Ok(self
            .client
            .store()
            .get_item(ACCESS_TOKEN_KEY)
            .await?
            .is_some_and(|token| !token.trim().is_empty()))
    }

    pub async fn current_user(&self) -> Result<UserProfile, InfraError> {
        self.client
            .request_json(PROFILE_ENDPOINT, RequestOptions::get())
            .await
    }
}
