//! Upstream homeserver client.
//!
//! The sync loop only needs two calls: create a filter once, then long-poll
//! `/sync` with it. [`Homeserver`] is the seam that lets tests script the
//! upstream side.

use crate::error::HomeserverError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use syncproxy_types::{errcode, Filter, MatrixError, SyncResponse, UserId};
use url::Url;

/// Extra time allowed on top of the long-poll budget before the HTTP request
/// itself times out.
const SYNC_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

/// Timeout for requests that aren't long-polls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Who to call the homeserver as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// The bot user.
    pub user_id: UserId,
    /// Access token for the bot user.
    pub access_token: String,
}

/// Parameters of one long-poll.
#[derive(Debug, Clone, Copy)]
pub struct SyncRequest<'a> {
    /// Resume token; empty for an initial sync.
    pub since: &'a str,
    /// Filter created by [`Homeserver::create_filter`].
    pub filter_id: &'a str,
    /// How long the server may hold the request open.
    pub timeout: Duration,
}

/// The upstream calls the sync loop makes.
#[async_trait]
pub trait Homeserver: Send + Sync {
    /// Upload a filter for the user and return its ID.
    async fn create_filter(
        &self,
        credentials: &Credentials,
        filter: &Filter,
    ) -> Result<String, HomeserverError>;

    /// Perform one long-poll.
    async fn sync(
        &self,
        credentials: &Credentials,
        request: SyncRequest<'_>,
    ) -> Result<SyncResponse, HomeserverError>;
}

#[derive(Deserialize)]
struct FilterResponse {
    filter_id: String,
}

/// reqwest-backed [`Homeserver`].
#[derive(Clone)]
pub struct HomeserverClient {
    http: reqwest::Client,
    base_url: Url,
}

impl HomeserverClient {
    /// Create a client for the homeserver at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, HomeserverError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("syncproxy/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, HomeserverError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, HomeserverError> {
        let status = response.status();
        let body = response.bytes().await?;
        if status.is_success() {
            return Ok(serde_json::from_slice(&body)?);
        }

        let error = serde_json::from_slice::<MatrixError>(&body).unwrap_or_else(|_| {
            MatrixError::new(errcode::UNKNOWN, String::from_utf8_lossy(&body).into_owned())
        });
        if status == reqwest::StatusCode::UNAUTHORIZED && error.is(errcode::UNKNOWN_TOKEN) {
            Err(HomeserverError::UnknownToken(error))
        } else {
            Err(HomeserverError::Http {
                status: status.as_u16(),
                error,
            })
        }
    }
}

#[async_trait]
impl Homeserver for HomeserverClient {
    async fn create_filter(
        &self,
        credentials: &Credentials,
        filter: &Filter,
    ) -> Result<String, HomeserverError> {
        let url = self.endpoint(&[
            "_matrix",
            "client",
            "v3",
            "user",
            credentials.user_id.as_str(),
            "filter",
        ])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&credentials.access_token)
            .timeout(REQUEST_TIMEOUT)
            .json(filter)
            .send()
            .await?;
        let resp: FilterResponse = Self::handle_response(response).await?;
        Ok(resp.filter_id)
    }

    async fn sync(
        &self,
        credentials: &Credentials,
        request: SyncRequest<'_>,
    ) -> Result<SyncResponse, HomeserverError> {
        let mut url = self.endpoint(&["_matrix", "client", "v3", "sync"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", &request.timeout.as_millis().to_string());
            if !request.since.is_empty() {
                query.append_pair("since", request.since);
            }
            query
                .append_pair("filter", request.filter_id)
                .append_pair("full_state", "false")
                .append_pair("set_presence", "offline");
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(&credentials.access_token)
            .timeout(request.timeout + SYNC_TIMEOUT_MARGIN)
            .send()
            .await?;
        Self::handle_response(response).await
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted homeserver for driving the sync loop in tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Replays queued responses; once the queue is empty every call hangs
    /// like an idle long-poll.
    #[derive(Default)]
    pub struct MockHomeserver {
        filter_results: Mutex<VecDeque<Result<String, HomeserverError>>>,
        sync_results: Mutex<VecDeque<Result<SyncResponse, HomeserverError>>>,
        since_log: Mutex<Vec<String>>,
        filter_calls: Mutex<usize>,
        panic_next_sync: AtomicBool,
    }

    impl MockHomeserver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_filter(&self, result: Result<String, HomeserverError>) {
            self.filter_results.lock().unwrap().push_back(result);
        }

        pub fn push_sync(&self, result: Result<SyncResponse, HomeserverError>) {
            self.sync_results.lock().unwrap().push_back(result);
        }

        /// `since` value of every sync call so far.
        pub fn since_log(&self) -> Vec<String> {
            self.since_log.lock().unwrap().clone()
        }

        /// Make the next sync call panic instead of answering.
        pub fn panic_on_next_sync(&self) {
            self.panic_next_sync.store(true, Ordering::SeqCst);
        }

        pub fn filter_calls(&self) -> usize {
            *self.filter_calls.lock().unwrap()
        }

        /// Wait until at least `n` sync calls have been made.
        pub async fn wait_for_syncs(&self, n: usize) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.since_log.lock().unwrap().len() < n {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("homeserver never saw the expected number of syncs");
        }
    }

    #[async_trait]
    impl Homeserver for MockHomeserver {
        async fn create_filter(
            &self,
            _credentials: &Credentials,
            _filter: &Filter,
        ) -> Result<String, HomeserverError> {
            *self.filter_calls.lock().unwrap() += 1;
            let next = self.filter_results.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok("filter0".to_string()))
        }

        async fn sync(
            &self,
            _credentials: &Credentials,
            request: SyncRequest<'_>,
        ) -> Result<SyncResponse, HomeserverError> {
            self.since_log
                .lock()
                .unwrap()
                .push(request.since.to_string());
            if self.panic_next_sync.swap(false, Ordering::SeqCst) {
                panic!("scripted homeserver panic");
            }
            let next = self.sync_results.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncproxy_types::OtkCount;
    use wiremock::matchers::{body_json, header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> Credentials {
        Credentials {
            user_id: "@whatsappbot:example.com".into(),
            access_token: "syt_bot".into(),
        }
    }

    #[tokio::test]
    async fn create_filter_posts_to_user_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_matrix/client/v3/user/@whatsappbot:example.com/filter"))
            .and(header("authorization", "Bearer syt_bot"))
            .and(body_json(serde_json::to_value(Filter::to_device_only()).unwrap()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"filter_id": "42"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = HomeserverClient::new(&server.uri()).unwrap();
        let id = client
            .create_filter(&credentials(), &Filter::to_device_only())
            .await
            .unwrap();
        assert_eq!(id, "42");
    }

    #[tokio::test]
    async fn sync_sends_long_poll_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/sync"))
            .and(query_param("timeout", "30000"))
            .and(query_param("since", "s1_2_3"))
            .and(query_param("filter", "42"))
            .and(query_param("full_state", "false"))
            .and(query_param("set_presence", "offline"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "next_batch": "s2_3_4",
                "to_device": {"events": [{
                    "type": "m.room.encrypted",
                    "sender": "@alice:example.com",
                    "content": {"algorithm": "m.olm.v1.curve25519-aes-sha2"}
                }]},
                "device_one_time_keys_count": {"signed_curve25519": 50}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HomeserverClient::new(&server.uri()).unwrap();
        let resp = client
            .sync(
                &credentials(),
                SyncRequest {
                    since: "s1_2_3",
                    filter_id: "42",
                    timeout: Duration::from_secs(30),
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.next_batch, "s2_3_4");
        assert_eq!(resp.to_device.events.len(), 1);
        assert_eq!(
            resp.device_one_time_keys_count,
            OtkCount::from_pairs([("signed_curve25519", 50)])
        );
    }

    #[tokio::test]
    async fn initial_sync_omits_since() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/sync"))
            .and(query_param_is_missing("since"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"next_batch": "s1"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = HomeserverClient::new(&server.uri()).unwrap();
        let resp = client
            .sync(
                &credentials(),
                SyncRequest {
                    since: "",
                    filter_id: "42",
                    timeout: Duration::from_secs(30),
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.next_batch, "s1");
    }

    #[tokio::test]
    async fn unknown_token_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/sync"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "errcode": "M_UNKNOWN_TOKEN",
                "error": "Unknown access token"
            })))
            .mount(&server)
            .await;

        let client = HomeserverClient::new(&server.uri()).unwrap();
        let err = client
            .sync(
                &credentials(),
                SyncRequest {
                    since: "",
                    filter_id: "42",
                    timeout: Duration::from_secs(30),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HomeserverError::UnknownToken(_)));
    }

    #[tokio::test]
    async fn other_errors_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/sync"))
            .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
            .mount(&server)
            .await;

        let client = HomeserverClient::new(&server.uri()).unwrap();
        let err = client
            .sync(
                &credentials(),
                SyncRequest {
                    since: "",
                    filter_id: "42",
                    timeout: Duration::from_secs(30),
                },
            )
            .await
            .unwrap_err();
        match err {
            HomeserverError::Http { status, error } => {
                assert_eq!(status, 502);
                assert!(error.is(errcode::UNKNOWN));
                assert_eq!(error.message, "Bad Gateway");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_token_needs_unauthorized_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_matrix/client/v3/user/@whatsappbot:example.com/filter"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "errcode": "M_UNKNOWN_TOKEN",
                "error": "Unknown access token"
            })))
            .mount(&server)
            .await;

        let client = HomeserverClient::new(&server.uri()).unwrap();
        let err = client
            .create_filter(&credentials(), &Filter::to_device_only())
            .await
            .unwrap_err();
        match err {
            HomeserverError::Http { status, error } => {
                assert_eq!(status, 403);
                assert!(error.is(errcode::UNKNOWN_TOKEN));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let client = HomeserverClient::new("https://matrix.example.com/prefix/").unwrap();
        let url = client.endpoint(&["_matrix", "client", "v3", "sync"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://matrix.example.com/prefix/_matrix/client/v3/sync"
        );
    }
}
