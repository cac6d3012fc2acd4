use crate::credential::{AccessToken, Credential};
use crate::GrantError;
use log::debug;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

const PUBLIC_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";

/// Page of an Azure Resource Manager listing.
#[derive(Deserialize, Debug)]
pub(crate) struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub(crate) value: Vec<T>,
    #[serde(rename = "nextLink")]
    pub(crate) next_link: Option<String>,
}

/// Client for Azure Resource Manager operations - listing labs, updating
/// virtual machines, editing vault access policies.
///
/// # Examples
///
/// ```
/// use devtestlab_msi_grant::{Credential, ManagementClient};
/// let client = ManagementClient::new(Credential::Static("{token}".to_owned()));
/// ```
#[derive(Debug)]
pub struct ManagementClient {
    pub(crate) credential: Credential,
    pub(crate) endpoint: String,
    pub(crate) token: Option<AccessToken>,
    http: reqwest::Client,
}

impl ManagementClient {
    /// Creates a new `ManagementClient` against a specific management endpoint.
    /// Useful for non-public Azure clouds. For the public cloud, use `ManagementClient::new`.
    ///
    /// # Examples
    ///
    /// ```
    /// use devtestlab_msi_grant::{Credential, ManagementClient};
    /// let client = ManagementClient::new_with_endpoint(Credential::Static("{token}".to_owned()), "https://management.usgovcloudapi.net");
    /// ```
    pub fn new_with_endpoint(credential: Credential, endpoint: &str) -> Self {
        Self {
            credential,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            token: None,
            http: reqwest::Client::new(),
        }
    }

    /// Creates a new `ManagementClient` for the public Azure cloud.
    pub fn new(credential: Credential) -> Self {
        ManagementClient::new_with_endpoint(credential, PUBLIC_MANAGEMENT_ENDPOINT)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) async fn refresh_token(&mut self) -> Result<&str, GrantError> {
        let valid = matches!(&self.token, Some(token) if token.is_valid());
        if !valid {
            debug!("Acquiring management token");
            self.token = Some(self.credential.get_token(MANAGEMENT_RESOURCE).await?);
        }
        match &self.token {
            Some(token) => Ok(token.secret()),
            None => Err(GrantError::AuthorizationError(anyhow::anyhow!("No token acquired"))),
        }
    }

    /// Builds a URL for a resource path such as `/subscriptions/{id}/...`.
    pub(crate) fn url(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, GrantError> {
        let raw = format!("{}{}", self.endpoint, path);
        Url::parse_with_params(&raw, params).map_err(|_| GrantError::InvalidResourceId(raw))
    }

    pub(crate) async fn get_authed<T: DeserializeOwned>(&mut self, uri: Url) -> Result<T, GrantError> {
        self.send_authed::<T, ()>(Method::GET, uri, None).await
    }

    pub(crate) async fn put_authed<T: DeserializeOwned, B: Serialize>(
        &mut self,
        uri: Url,
        body: &B,
    ) -> Result<T, GrantError> {
        self.send_authed(Method::PUT, uri, Some(body)).await
    }

    pub(crate) async fn patch_authed<T: DeserializeOwned, B: Serialize>(
        &mut self,
        uri: Url,
        body: &B,
    ) -> Result<T, GrantError> {
        self.send_authed(Method::PATCH, uri, Some(body)).await
    }

    /// Follows `nextLink` until the listing is exhausted.
    pub(crate) async fn list_authed<T: DeserializeOwned>(&mut self, uri: Url) -> Result<Vec<T>, GrantError> {
        let mut items = Vec::new();
        let mut next = Some(uri);
        while let Some(uri) = next.take() {
            let page: ListResponse<T> = self.get_authed(uri).await?;
            items.extend(page.value);
            if let Some(link) = page.next_link.filter(|l| !l.is_empty()) {
                next = Some(Url::parse(&link).map_err(|_| GrantError::InvalidResourceId(link.clone()))?);
            }
        }
        Ok(items)
    }

    async fn send_authed<T: DeserializeOwned, B: Serialize>(
        &mut self,
        method: Method,
        uri: Url,
        body: Option<&B>,
    ) -> Result<T, GrantError> {
        let token = self.refresh_token().await?.to_owned();
        let uri_str = uri.to_string();
        debug!("{} {}", method, uri_str);

        let mut request = self.http.request(method, uri).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request.send().await.map_err(|source| GrantError::HttpError {
            uri: uri_str.clone(),
            source,
        })?;
        let status = resp.status();
        let body = resp.text().await.map_err(|source| GrantError::HttpError {
            uri: uri_str.clone(),
            source,
        })?;
        if !status.is_success() {
            return Err(GrantError::UnexpectedStatus {
                uri: uri_str,
                status,
                body,
            });
        }

        // Some update operations answer with an empty body.
        let body = if body.trim().is_empty() { "null" } else { body.as_str() };
        serde_json::from_str::<T>(body).map_err(|source| GrantError::ParseError { uri: uri_str, source })
    }
}
