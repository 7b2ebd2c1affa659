use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use mockall::automock;
use std::sync::Arc;
use thiserror::Error;

pub type SharedHttpClient = Arc<dyn HttpClient + Send + Sync>;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("HTTP transport failure")]
    Transport(#[from] reqwest::Error),
}

/// Minimal HTTP surface needed to read device descriptions and invoke SOAP actions.
///
/// Any status code is a successful response; only a failure to get a response at all is an error.
#[automock]
pub trait HttpClient {
    fn get(&self, url: &str) -> BoxFuture<'static, Result<HttpResponse, HttpError>>;
    fn post(
        &self,
        url: &str,
        body: String,
        headers: Vec<(String, String)>,
    ) -> BoxFuture<'static, Result<HttpResponse, HttpError>>;
}

#[derive(Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(request: reqwest::RequestBuilder) -> Result<HttpResponse, HttpError> {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}

impl HttpClient for ReqwestHttpClient {
    fn get(&self, url: &str) -> BoxFuture<'static, Result<HttpResponse, HttpError>> {
        Self::send(self.client.get(url)).boxed()
    }

    fn post(
        &self,
        url: &str,
        body: String,
        headers: Vec<(String, String)>,
    ) -> BoxFuture<'static, Result<HttpResponse, HttpError>> {
        let request = headers
            .into_iter()
            .fold(self.client.post(url), |request, (name, value)| {
                request.header(name, value)
            })
            .body(body);
        Self::send(request).boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn client() -> ReqwestHttpClient {
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        ReqwestHttpClient::new(client)
    }

    /// Answers a single request with `response` and hands back the raw request.
    async fn serve_once(response: &'static str) -> anyhow::Result<(String, JoinHandle<String>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}/", listener.local_addr()?);
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::default();
            let mut buffer = [0; 4096];
            loop {
                let size = stream.read(&mut buffer).await.unwrap();
                request.extend_from_slice(&buffer[..size]);
                let text = String::from_utf8_lossy(&request);
                if let Some((head, body)) = text.split_once("\r\n\r\n") {
                    let content_length = head
                        .lines()
                        .filter_map(|l| l.split_once(':'))
                        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                        .map(|(_, v)| v.trim().parse().unwrap())
                        .unwrap_or(0);
                    if body.len() >= content_length {
                        break;
                    }
                }
                if size == 0 {
                    break;
                }
            }
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
            String::from_utf8(request).unwrap()
        });
        Ok((url, server))
    }

    #[tokio::test]
    async fn get() -> anyhow::Result<()> {
        crate::test::init();

        let (url, server) =
            serve_once("HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\n<root/>")
                .await?;

        // When
        let response = client().get(&url).await?;

        // Then
        assert_eq!(
            response,
            HttpResponse {
                status: 200,
                body: "<root/>".into()
            }
        );
        assert!(server.await?.starts_with("GET / HTTP/1.1\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn post_keeps_error_body() -> anyhow::Result<()> {
        crate::test::init();

        let (url, server) = serve_once(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 5\r\nConnection: close\r\n\r\nfault",
        )
        .await?;

        // When
        let response = client()
            .post(
                &url,
                "<body/>".into(),
                vec![("SOAPAction".into(), "\"urn:foo#Bar\"".into())],
            )
            .await?;

        // Then
        assert_eq!(response.status, 500);
        assert_eq!(response.body, "fault");
        let request = server.await?.to_ascii_lowercase();
        assert!(request.starts_with("post / http/1.1\r\n"));
        assert!(request.contains("soapaction: \"urn:foo#bar\"\r\n"));
        assert!(request.ends_with("\r\n\r\n<body/>"));
        Ok(())
    }

    #[tokio::test]
    async fn connection_refused() -> anyhow::Result<()> {
        crate::test::init();

        let port = TcpListener::bind("127.0.0.1:0").await?.local_addr()?.port();

        let result = client()
            .get(&format!("http://127.0.0.1:{}/", port))
            .await;

        assert!(result.is_err());
        Ok(())
    }
}
