//! Lightweight HTTP attempts over `reqwest`.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};

use super::{AttemptOutcome, FetchError, FetchRequest, RawFetchOutcome};

fn base_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers
}

/// One outbound request per call, no JS fallback.
///
/// Every attempt gets its own client, so a rotated endpoint never inherits
/// the previous attempt's gateway connection or cookie jar.
pub struct HttpFetcher {
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client(&self, proxy: Option<&str>, user_agent: &str) -> Result<reqwest::Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.timeout)
            .user_agent(user_agent)
            .default_headers(base_headers());

        if let Some(endpoint) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(endpoint)?);
        }
        builder.build()
    }

    pub async fn fetch(&self, request: &FetchRequest) -> AttemptOutcome {
        let proxy = request.proxy.as_ref().map(|endpoint| endpoint.http_proxy_url());
        let client = match self.client(proxy, &request.user_agent) {
            Ok(client) => client,
            Err(err) => return AttemptOutcome::Fatal(FetchError::InvalidRequest(err.to_string())),
        };

        let response = match client.get(&request.url).send().await {
            Ok(response) => response,
            Err(err) => return classify_error(err),
        };

        let status = response.status();
        if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            return AttemptOutcome::Retryable(FetchError::ProxyAuth);
        }

        let final_url = response.url().to_string();
        match response.text().await {
            Ok(content) => AttemptOutcome::Fetched(RawFetchOutcome {
                content,
                status: Some(status.as_u16()),
                title: None,
                final_url: Some(final_url),
            }),
            Err(err) => classify_error(err),
        }
    }
}

fn classify_error(err: reqwest::Error) -> AttemptOutcome {
    if err.is_builder() {
        return AttemptOutcome::Fatal(FetchError::InvalidRequest(err.to_string()));
    }
    if err.is_timeout() {
        return AttemptOutcome::Retryable(FetchError::Timeout(err.to_string()));
    }
    if err.is_connect() {
        let message = err.to_string();
        if message.contains("407") {
            return AttemptOutcome::Retryable(FetchError::ProxyAuth);
        }
        return AttemptOutcome::Retryable(FetchError::Connect(message));
    }
    AttemptOutcome::Retryable(FetchError::Transport(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::proxy::ProxyEndpoint;
    use crate::policy::FetchMethod;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request(url: &str) -> FetchRequest {
        FetchRequest {
            url: url.into(),
            method: FetchMethod::Http,
            proxy: None,
            user_agent: crate::config::DEFAULT_USER_AGENT.into(),
            block_resources: false,
        }
    }

    #[tokio::test]
    async fn malformed_url_is_fatal() {
        let fetcher = HttpFetcher::new(Duration::from_secs(1));
        let outcome = fetcher.fetch(&request("not a url")).await;
        assert!(matches!(outcome, AttemptOutcome::Fatal(FetchError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn refused_connection_is_retryable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let fetcher = HttpFetcher::new(Duration::from_secs(2));
        let outcome = fetcher.fetch(&request(&format!("http://127.0.0.1:{port}/"))).await;
        assert!(matches!(outcome, AttemptOutcome::Retryable(_)));
    }

    /// Minimal forward proxy answering every request with a cookie-setting 403.
    async fn flagging_proxy() -> (u16, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let flagged = Arc::new(AtomicUsize::new(0));

        let (opened, seen) = (connections.clone(), flagged.clone());
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                opened.fetch_add(1, Ordering::SeqCst);
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        let read = match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(read) => read,
                        };
                        head.extend_from_slice(&chunk[..read]);
                        if !head.windows(4).any(|window| window == b"\r\n\r\n") {
                            continue;
                        }
                        let text = String::from_utf8_lossy(&head).to_ascii_lowercase();
                        if text.contains("cf_flag=blocked") {
                            seen.fetch_add(1, Ordering::SeqCst);
                        }
                        head.clear();
                        let reply = "HTTP/1.1 403 Forbidden\r\n\
                            Set-Cookie: cf_flag=blocked; Path=/\r\n\
                            Content-Length: 7\r\n\
                            Connection: keep-alive\r\n\r\nblocked";
                        if socket.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        (port, connections, flagged)
    }

    #[tokio::test]
    async fn rotated_endpoints_get_fresh_connections_and_cookies() {
        let (port, connections, flagged) = flagging_proxy().await;
        let fetcher = HttpFetcher::new(Duration::from_secs(5));

        for build_id in [1, 2] {
            let mut attempt = request("http://shop.internal/listing");
            attempt.proxy = Some(ProxyEndpoint::new("http", "127.0.0.1", port, "user", "pass", build_id));
            let outcome = fetcher.fetch(&attempt).await;
            assert_eq!(outcome.fetched().and_then(|raw| raw.status), Some(403));
        }

        assert_eq!(connections.load(Ordering::SeqCst), 2);
        assert_eq!(flagged.load(Ordering::SeqCst), 0);
    }
}
