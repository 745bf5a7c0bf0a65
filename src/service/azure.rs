use async_trait::async_trait;
use reqwest::{ Client, Method, RequestBuilder, Response };
use serde::{ de::DeserializeOwned, Serialize };
use std::time::Duration;
use log::{ info, error, debug, warn };

use super::SearchService;
use crate::config::{ SearchCredential, SearchServiceConfig };
use crate::datasource::DataSourceConnection;
use crate::error::{ PipelineError, ResourceKind, Result };
use crate::indexer::{ Indexer, IndexerStatus };
use crate::query::{ QueryRequest, QueryResponse, SearchHit };
use crate::schema::IndexSchema;
use crate::skillset::Skillset;

/// REST client for a managed search service.
pub struct AzureSearchService {
    client: Client,
    endpoint: String,
    credential: SearchCredential,
    api_version: String,
}

impl AzureSearchService {
    pub fn new(config: &SearchServiceConfig) -> Result<Self> {
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(PipelineError::config("search service endpoint is empty"));
        }
        let client = Client::builder()
            .timeout(if config.timeout.is_zero() { Duration::from_secs(30) } else { config.timeout })
            .build()?;

        info!("Search service endpoint: {} (api-version {})", endpoint, config.api_version);

        Ok(Self {
            client,
            endpoint,
            credential: config.credential.clone(),
            api_version: config.api_version.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}?api-version={}", self.endpoint, path, self.api_version)
    }

    fn build_request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client
            .request(method, self.url(path))
            .header("Accept", "application/json");
        match &self.credential {
            SearchCredential::ApiKey(key) => builder.header("api-key", key),
            SearchCredential::BearerToken(token) => builder.bearer_auth(token),
        }
    }

    async fn put_definition<T: Serialize + DeserializeOwned>(
        &self,
        kind: ResourceKind,
        name: &str,
        definition: &T
    ) -> Result<T> {
        let path = format!("{}/{}", kind.collection(), name);
        debug!("PUT {} {}", kind, name);

        let resp = self
            .build_request(Method::PUT, &path)
            .header("Prefer", "return=representation")
            .json(definition)
            .send().await?;
        let status = resp.status();
        let resp = check_response(resp, kind, name).await?;

        if status == reqwest::StatusCode::NO_CONTENT {
            warn!("Service returned no representation for {} '{}'; echoing the sent definition", kind, name);
            let echoed = serde_json::to_value(definition)?;
            return Ok(serde_json::from_value(echoed)?);
        }
        let stored: T = resp.json().await?;
        info!(
            "{} '{}' {}",
            kind,
            name,
            if status == reqwest::StatusCode::CREATED { "created" } else { "updated" }
        );
        Ok(stored)
    }
}

/// Maps non-success statuses onto the error taxonomy.
pub(crate) async fn check_response(resp: Response, kind: ResourceKind, name: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_else(|_| "Failed to read error body".to_string());
    let message = service_message(&text);
    error!("{} '{}' request failed ({}): {}", kind, name, status, message);

    match status.as_u16() {
        401 | 403 => Err(PipelineError::Auth { status: status.as_u16(), message }),
        404 => Err(PipelineError::not_found(kind, name)),
        code => Err(PipelineError::Remote { status: code, message }),
    }
}

/// Pulls `error.message` out of an OData error body, falling back to the raw text.
fn service_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error")?.get("message")?.as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl SearchService for AzureSearchService {
    async fn upsert_index(&self, index: &IndexSchema) -> Result<IndexSchema> {
        index.validate()?;
        self.put_definition(ResourceKind::Index, &index.name, index).await
    }

    async fn upsert_data_source(&self, data_source: &DataSourceConnection) -> Result<DataSourceConnection> {
        data_source.validate()?;
        self.put_definition(ResourceKind::DataSource, &data_source.name, data_source).await
    }

    async fn upsert_skillset(&self, skillset: &Skillset) -> Result<Skillset> {
        skillset.validate()?;
        self.put_definition(ResourceKind::Skillset, &skillset.name, skillset).await
    }

    async fn upsert_indexer(&self, indexer: &Indexer) -> Result<Indexer> {
        indexer.validate()?;
        let stored = self.put_definition(ResourceKind::Indexer, &indexer.name, indexer).await?;
        info!("Indexer '{}' is running; allow a few minutes before querying fresh data", indexer.name);
        Ok(stored)
    }

    async fn run_indexer(&self, name: &str) -> Result<()> {
        let path = format!("{}/{}/run", ResourceKind::Indexer.collection(), name);
        let resp = self.build_request(Method::POST, &path).send().await?;
        check_response(resp, ResourceKind::Indexer, name).await?;
        info!("Indexer '{}' run requested", name);
        Ok(())
    }

    async fn indexer_status(&self, name: &str) -> Result<IndexerStatus> {
        let path = format!("{}/{}/status", ResourceKind::Indexer.collection(), name);
        let resp = self.build_request(Method::GET, &path).send().await?;
        let resp = check_response(resp, ResourceKind::Indexer, name).await?;
        let status: IndexerStatus = resp.json().await?;
        debug!("Indexer '{}' status: {:?}", name, status.status);
        Ok(status)
    }

    async fn search(&self, index: &str, request: &QueryRequest) -> Result<Vec<SearchHit>> {
        let path = format!("{}/{}/docs/search", ResourceKind::Index.collection(), index);
        debug!("Search payload for '{}': {}", index, serde_json::to_string(request)?);

        let resp = self
            .build_request(Method::POST, &path)
            .header("Content-Type", "application/json")
            .json(request)
            .send().await?;
        let resp = check_response(resp, ResourceKind::Index, index).await?;
        let body: QueryResponse = resp.json().await?;

        debug!("Parsed {} hits from '{}'", body.value.len(), index);
        Ok(body.value)
    }

    async fn count_documents(&self, index: &str) -> Result<usize> {
        let path = format!("{}/{}/docs/$count", ResourceKind::Index.collection(), index);
        let resp = self.build_request(Method::GET, &path).send().await?;
        let resp = check_response(resp, ResourceKind::Index, index).await?;
        let text = resp.text().await?;
        // The body is a bare integer, sometimes preceded by a byte-order mark.
        let count = text
            .trim_start_matches('\u{feff}')
            .trim()
            .parse::<usize>()
            .map_err(|_| PipelineError::Remote {
                status: 200,
                message: format!("unexpected document count '{}'", text),
            })?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{ AsyncReadExt, AsyncWriteExt };
    use tokio::net::TcpListener;

    fn service(credential: SearchCredential) -> AzureSearchService {
        AzureSearchService::new(
            &(SearchServiceConfig {
                endpoint: "https://example-search.search.windows.net/".to_string(),
                credential,
                api_version: "2024-07-01".to_string(),
                timeout: Duration::from_secs(5),
            })
        ).unwrap()
    }

    #[test]
    fn urls_carry_api_version() {
        let svc = service(SearchCredential::ApiKey("k".to_string()));
        assert_eq!(
            svc.url("indexes/idx/docs/search"),
            "https://example-search.search.windows.net/indexes/idx/docs/search?api-version=2024-07-01"
        );
    }

    #[test]
    fn api_key_and_token_use_different_headers() {
        let svc = service(SearchCredential::ApiKey("secret".to_string()));
        let req = svc.build_request(Method::GET, "indexes").build().unwrap();
        assert_eq!(req.headers()["api-key"], "secret");
        assert!(req.headers().get("authorization").is_none());

        let svc = service(SearchCredential::BearerToken("tok".to_string()));
        let req = svc.build_request(Method::GET, "indexes").build().unwrap();
        assert_eq!(req.headers()["authorization"], "Bearer tok");
    }

    /// Answers the first request on a local socket with a canned response.
    async fn canned(status: &'static str, content_type: &'static str, body: &'static str) -> AzureSearchService {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            while !request_complete(&request) {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let mut response = format!("HTTP/1.1 {}\r\nConnection: close\r\n", status);
            if !body.is_empty() {
                response.push_str(&format!("Content-Type: {}\r\nContent-Length: {}\r\n", content_type, body.len()));
            }
            response.push_str("\r\n");
            response.push_str(body);
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });

        AzureSearchService::new(
            &(SearchServiceConfig {
                endpoint: format!("http://{}", addr),
                credential: SearchCredential::ApiKey("k".to_string()),
                api_version: "2024-07-01".to_string(),
                timeout: Duration::from_secs(5),
            })
        ).unwrap()
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= end + 4 + length
    }

    const JSON: &str = "application/json";

    fn index() -> IndexSchema {
        IndexSchema::define("idx", "https://example-openai.openai.azure.com").unwrap()
    }

    #[tokio::test]
    async fn forbidden_is_a_fatal_auth_error() {
        let svc = canned("403 Forbidden", JSON, r#"{"error":{"code":"","message":"Access denied"}}"#).await;
        let err = svc.upsert_index(&index()).await.unwrap_err();
        match &err {
            PipelineError::Auth { status, message } => {
                assert_eq!(*status, 403);
                assert_eq!(message, "Access denied");
            }
            other => panic!("expected auth error, got {:?}", other),
        }
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn missing_index_is_not_found() {
        let svc = canned("404 Not Found", JSON, r#"{"error":{"code":"","message":"No index with the name 'idx' was found"}}"#).await;
        let request = QueryRequest::hybrid("q", &crate::query::QueryOptions::default());
        let err = svc.search("idx", &request).await.unwrap_err();
        assert!(
            matches!(&err, PipelineError::NotFound { kind: ResourceKind::Index, name } if name == "idx"),
            "{:?}",
            err
        );
    }

    #[tokio::test]
    async fn unavailable_is_a_retryable_remote_error() {
        let svc = canned("503 Service Unavailable", "text/plain", "try later").await;
        let err = svc.count_documents("idx").await.unwrap_err();
        assert!(matches!(&err, PipelineError::Remote { status: 503, message } if message == "try later"), "{:?}", err);
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn no_content_echoes_the_sent_definition() {
        let svc = canned("204 No Content", JSON, "").await;
        let sent = index();
        let stored = svc.upsert_index(&sent).await.unwrap();
        assert_eq!(stored, sent);
    }

    #[tokio::test]
    async fn created_returns_the_stored_representation() {
        let svc = canned("201 Created", JSON, r#"{"name":"idx","fields":[{"name":"chunk_id","type":"Edm.String","key":true}]}"#).await;
        let stored = svc.upsert_index(&index()).await.unwrap();
        assert_eq!(stored.name, "idx");
        assert_eq!(stored.fields.len(), 1);
    }

    #[tokio::test]
    async fn count_body_may_start_with_a_byte_order_mark() {
        let svc = canned("200 OK", "text/plain", "\u{feff}42").await;
        assert_eq!(svc.count_documents("idx").await.unwrap(), 42);
    }

    #[tokio::test]
    async fn garbled_count_is_a_remote_error() {
        let svc = canned("200 OK", "text/plain", "forty-two").await;
        assert!(matches!(svc.count_documents("idx").await.unwrap_err(), PipelineError::Remote { status: 200, .. }));
    }

    #[test]
    fn extracts_odata_error_message() {
        let body = r#"{"error":{"code":"","message":"The index 'idx' was not found."}}"#;
        assert_eq!(service_message(body), "The index 'idx' was not found.");
        assert_eq!(service_message("plain failure"), "plain failure");
    }
}
