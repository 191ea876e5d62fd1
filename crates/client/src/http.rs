//! The HTTP transport consumed by both client components.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::core::sliding::{SyncRequest, SyncRequestArgs, SyncResponse};
use crate::core::to_device::{Messages, SendToDeviceReqBody};
use crate::core::TransactionId;
use crate::{ClientError, ClientResult};

/// The wire operations the client components need.
///
/// Implementations must be cancellation safe: the callers drop in-flight
/// futures to abort requests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// One sliding sync long poll against the proxy at `proxy_base_url`.
    async fn sliding_sync(
        &self,
        proxy_base_url: &Url,
        args: &SyncRequestArgs,
        body: &SyncRequest,
    ) -> ClientResult<SyncResponse>;

    /// Send an event of type `event_type` to a set of devices.
    ///
    /// `txn_id` is used by the server to deduplicate retried requests.
    async fn send_to_device(
        &self,
        event_type: &str,
        messages: &Messages,
        txn_id: &TransactionId,
    ) -> ClientResult<()>;
}

/// A reqwest-backed [`Transport`] talking to a real homeserver.
pub struct HttpTransport {
    client: reqwest::Client,
    homeserver_url: Url,
    access_token: String,
}

impl HttpTransport {
    /// Creates a transport for the homeserver at `homeserver_url`.
    pub fn new(homeserver_url: Url, access_token: impl Into<String>) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            homeserver_url,
            access_token: access_token.into(),
        })
    }

    fn check_status(response: &reqwest::Response) -> ClientResult<()> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::Status {
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn sliding_sync(
        &self,
        proxy_base_url: &Url,
        args: &SyncRequestArgs,
        body: &SyncRequest,
    ) -> ClientResult<SyncResponse> {
        let url = proxy_base_url.join("/_matrix/client/unstable/org.matrix.msc3575/sync")?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .query(args)
            .json(body)
            .send()
            .await?;
        Self::check_status(&response)?;

        Ok(response.json().await?)
    }

    async fn send_to_device(
        &self,
        event_type: &str,
        messages: &Messages,
        txn_id: &TransactionId,
    ) -> ClientResult<()> {
        let url = self.homeserver_url.join(&format!(
            "/_matrix/client/v3/sendToDevice/{event_type}/{txn_id}"
        ))?;

        let response = self
            .client
            .put(url)
            .bearer_auth(&self.access_token)
            .json(&SendToDeviceReqBody {
                messages: messages.clone(),
            })
            .send()
            .await?;
        Self::check_status(&response)?;

        Ok(())
    }
}
