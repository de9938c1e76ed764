use std::sync::Arc;

use reqwest::{Client, StatusCode};
use shared::{
    domain::UserId,
    error::{ApiFailure, ApiRejection},
    protocol::{
        ConversationHistory, LoginRequest, LoginResponse, LogoutRequest, RefreshRequest,
        RefreshResponse, RegisterRequest, RegisterResponse, UserDirectory,
    },
};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use url::Url;

use crate::{
    credentials::{CredentialPair, CredentialStore},
    error::ClientError,
    SessionNotice,
};

/// Exchanges the stored refresh credential for a fresh pair. Renewal is
/// single-flight: concurrent authorization failures queue on `inflight`, and
/// every waiter re-checks the store before issuing its own network call, so
/// N simultaneous 401s produce exactly one renewal request.
pub struct CredentialRenewer {
    // Dedicated client so renewal never recurses through the gateway's
    // retry path.
    http: Client,
    refresh_url: Url,
    store: Arc<dyn CredentialStore>,
    notices: broadcast::Sender<SessionNotice>,
    inflight: Mutex<()>,
}

impl CredentialRenewer {
    pub fn new(
        refresh_url: Url,
        store: Arc<dyn CredentialStore>,
        notices: broadcast::Sender<SessionNotice>,
    ) -> Self {
        Self {
            http: Client::new(),
            refresh_url,
            store,
            notices,
            inflight: Mutex::new(()),
        }
    }

    /// `observed_access` is the token the failing request carried. If the
    /// stored access token no longer matches it, another renewal already
    /// completed while this caller waited, and its result is reused.
    pub async fn renew(&self, observed_access: &str) -> Result<CredentialPair, ClientError> {
        let _guard = self.inflight.lock().await;

        let current = self.store.load();
        if let Some(pair) = &current {
            if pair.access != observed_access {
                return Ok(pair.clone());
            }
        }

        let refresh = current
            .map(|pair| pair.refresh)
            .filter(|token| !token.is_empty())
            .ok_or(ClientError::AuthExpired)?;

        match self.request_renewal(&refresh).await {
            Ok(renewed) => {
                let pair = CredentialPair {
                    access: renewed.access,
                    // The backend rotates refresh tokens only sometimes; keep
                    // the old one when the response omits a replacement.
                    refresh: renewed.refresh.unwrap_or(refresh),
                };
                self.store.store(&pair)?;
                info!("credential renewal succeeded");
                Ok(pair)
            }
            Err(err) => {
                warn!("credential renewal failed: {err}");
                self.store.clear()?;
                let _ = self.notices.send(SessionNotice::SessionTerminated);
                Err(ClientError::RenewalFailed(err.to_string()))
            }
        }
    }

    async fn request_renewal(&self, refresh: &str) -> Result<RefreshResponse, ClientError> {
        let response = self
            .http
            .post(self.refresh_url.clone())
            .json(&RefreshRequest {
                refresh: refresh.to_string(),
            })
            .send()
            .await?;

        let response = reject_on_error_status(response).await?;
        Ok(response.json::<RefreshResponse>().await?)
    }
}

/// Wraps outbound REST calls: attaches the current access credential, and on
/// an authorization failure renews once and resubmits the original request
/// once with the new credential.
pub struct RequestGateway {
    http: Client,
    api_base: Url,
    store: Arc<dyn CredentialStore>,
    renewer: Arc<CredentialRenewer>,
}

impl RequestGateway {
    pub fn new(
        api_base: Url,
        store: Arc<dyn CredentialStore>,
        renewer: Arc<CredentialRenewer>,
    ) -> Self {
        Self {
            http: Client::new(),
            api_base,
            store,
            renewer,
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.store.load().map(|pair| pair.access)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.api_base
            .join(path)
            .map_err(|err| ClientError::Transport(format!("invalid endpoint '{path}': {err}")))
    }

    async fn send_authorized<F>(&self, build: F) -> Result<reqwest::Response, ClientError>
    where
        F: Fn(&Client) -> reqwest::RequestBuilder,
    {
        let access = self.access_token().unwrap_or_default();
        let response = build(&self.http).bearer_auth(&access).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return reject_on_error_status(response).await;
        }

        // Retried exactly once per request; a second 401 after renewal is a
        // hard failure, not another renewal trigger.
        info!("request unauthorized; renewing credentials and retrying once");
        let renewed = self.renewer.renew(&access).await?;
        let response = build(&self.http).bearer_auth(&renewed.access).send().await?;
        reject_on_error_status(response).await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ClientError> {
        let url = self.endpoint("login/")?;
        let response = self
            .http
            .post(url)
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let response = reject_on_error_status(response).await?;
        let body: LoginResponse = response.json().await?;

        self.store.store(&CredentialPair {
            access: body.access_token.clone(),
            refresh: body.refresh_token.clone(),
        })?;
        info!(user_id = body.user_details.id.0, "login succeeded");
        Ok(body)
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, ClientError> {
        let url = self.endpoint("register/")?;
        let response = self.http.post(url).json(request).send().await?;
        let response = reject_on_error_status(response).await?;
        Ok(response.json().await?)
    }

    /// Tells the backend to blacklist the refresh token, then clears the
    /// stored pair whether or not the request succeeded.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let refresh = self
            .store
            .load()
            .map(|pair| pair.refresh)
            .unwrap_or_default();
        let url = self.endpoint("logout/")?;
        let result = self
            .send_authorized(|http| {
                http.post(url.clone()).json(&LogoutRequest {
                    refresh_token: refresh.clone(),
                })
            })
            .await;

        self.store.clear()?;
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!("logout request failed; credentials cleared locally anyway: {err}");
                Err(err)
            }
        }
    }

    pub async fn list_users(&self) -> Result<UserDirectory, ClientError> {
        let url = self.endpoint("users/")?;
        let response = self.send_authorized(|http| http.get(url.clone())).await?;
        Ok(response.json().await?)
    }

    pub async fn conversation_history(
        &self,
        peer: UserId,
    ) -> Result<ConversationHistory, ClientError> {
        let url = self.endpoint(&format!("conversation/{}/", peer.0))?;
        let response = self.send_authorized(|http| http.get(url.clone())).await?;
        Ok(response.json().await?)
    }
}

async fn reject_on_error_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = match response.text().await {
        Ok(body) => serde_json::from_str::<ApiFailure>(&body)
            .map(|failure| failure.message)
            .unwrap_or(body),
        Err(_) => String::new(),
    };
    Err(ApiRejection::new(status.as_u16(), message).into())
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
