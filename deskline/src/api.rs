//! REST collaborators: conversation actions and upload authorization.
//!
//! [`HttpApi`] talks JSON over `reqwest`:
//!
//! | Call | Route |
//! |---|---|
//! | close conversation | `POST {api}/conversations/{id}/close` |
//! | link customer | `PUT {api}/conversations/{id}/customer` `{customerId}` |
//! | upload destination | `POST {api}/uploads` `{fileName, fileType}` → `{uploadUrl, fileUrl}` |
//! | upload bytes | `PUT {uploadUrl}` raw body with `Content-Type` |

use std::future::Future;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use deskline_proto::conversation::{Conversation, ConversationId, CustomerId};

use crate::attachment::{UploadService, UploadTarget};

/// Shown when the server gives no reason of its own.
pub const GENERIC_FAILURE: &str = "The request could not be completed";

/// Errors from REST calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request never got a response (network, TLS, body decoding).
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server returned {status}: {}", .message.as_deref().unwrap_or("no details"))]
    Status {
        status: u16,
        /// `message` field of the JSON error body, if there was one.
        message: Option<String>,
    },
}

impl ApiError {
    /// Text to show the user: the server's own message, or a generic one.
    #[must_use]
    pub fn user_message(&self) -> &str {
        match self {
            Self::Status {
                message: Some(message),
                ..
            } if !message.is_empty() => message,
            _ => GENERIC_FAILURE,
        }
    }
}

/// Conversation actions performed over REST.
pub trait ConsoleApi: Send + Sync + 'static {
    /// Close a conversation, returning its updated state.
    fn close_conversation(
        &self,
        id: ConversationId,
    ) -> impl Future<Output = Result<Conversation, ApiError>> + Send;

    /// Link a conversation to a customer record, returning its updated state.
    fn link_customer(
        &self,
        id: ConversationId,
        customer: CustomerId,
    ) -> impl Future<Output = Result<Conversation, ApiError>> + Send;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LinkCustomerRequest {
    customer_id: CustomerId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest<'a> {
    file_name: &'a str,
    file_type: &'a str,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// `reqwest` implementation of [`ConsoleApi`] and [`UploadService`].
#[derive(Debug, Clone)]
pub struct HttpApi {
    http: Client,
    base_url: String,
}

impl HttpApi {
    /// Create a client for the API rooted at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Turn a non-success response into [`ApiError::Status`].
async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(|body| body.message);
    tracing::warn!(status = status.as_u16(), message = ?message, "API call failed");
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

impl ConsoleApi for HttpApi {
    async fn close_conversation(&self, id: ConversationId) -> Result<Conversation, ApiError> {
        tracing::debug!(conversation = %id, "closing conversation");
        let response = self
            .http
            .post(self.url(&format!("/conversations/{id}/close")))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn link_customer(
        &self,
        id: ConversationId,
        customer: CustomerId,
    ) -> Result<Conversation, ApiError> {
        tracing::debug!(conversation = %id, customer = %customer, "linking customer");
        let response = self
            .http
            .put(self.url(&format!("/conversations/{id}/customer")))
            .json(&LinkCustomerRequest {
                customer_id: customer,
            })
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}

impl UploadService for HttpApi {
    async fn request_destination(
        &self,
        file_name: &str,
        mime_type: &str,
    ) -> Result<UploadTarget, ApiError> {
        let response = self
            .http
            .post(self.url("/uploads"))
            .json(&UploadRequest {
                file_name,
                file_type: mime_type,
            })
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn upload(
        &self,
        target: &UploadTarget,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<(), ApiError> {
        let size = bytes.len();
        let response = self
            .http
            .put(&target.upload_url)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(bytes)
            .send()
            .await?;
        check(response).await?;
        tracing::debug!(size, url = %target.file_url, "upload finished");
        Ok(())
    }
}
