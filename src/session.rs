use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::error::{Error, Result};

const USER_AGENT: &str = concat!("osfsync/", env!("CARGO_PKG_VERSION"));
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const DATA_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct UserDataEnvelope {
    data: UserData,
}

#[derive(Debug, Deserialize)]
struct UserData {
    id: String,
}

/// An authenticated OSF REST session. Holds a bearer token once login
/// succeeds; every subsequent request attaches it.
pub struct Session {
    api_base: String,
    control: Client,
    data: Client,
    token: Option<String>,
}

impl Session {
    pub fn new(api_base: impl Into<String>) -> Result<Self> {
        let control = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(CONTROL_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Auth(format!("building http client: {e}")))?;
        let data = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(DATA_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Auth(format!("building http client: {e}")))?;
        Ok(Self {
            api_base: api_base.into(),
            control,
            data,
            token: None,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}", self.api_base.trim_end_matches('/'), path)
        }
    }

    /// Installs a previously stored bearer token and confirms it is still
    /// valid by calling `GET /users/me/`.
    pub async fn login_with_stored_token(&mut self, token: &str) -> Result<String> {
        self.token = Some(token.to_string());
        let resp = self
            .authed(self.control.get(self.url("/users/me/")))
            .send()
            .await
            .map_err(|e| Error::Auth(e.to_string()))?;
        if resp.status() != StatusCode::OK {
            self.token = None;
            return Err(Error::Auth(format!(
                "stored token rejected with status {}",
                resp.status()
            )));
        }
        let envelope: UserDataEnvelope = resp
            .json()
            .await
            .map_err(|e| Error::Auth(format!("parsing /users/me/ response: {e}")))?;
        Ok(envelope.data.id)
    }

    /// Exchanges a username/password (and optional second factor) for a
    /// personal access token via `POST /tokens/`. A 401/403 response
    /// carrying `X-OSF-OTP: required` surfaces as `Error::NeedsSecondFactor`
    /// rather than a hard auth failure, so callers can re-prompt.
    pub async fn login_with_password(
        &mut self,
        email: &str,
        password: &str,
        otp: Option<&str>,
    ) -> Result<(String, String)> {
        let mut req = self
            .control
            .post(self.url("/tokens/"))
            .basic_auth(email, Some(password))
            .json(&serde_json::json!({
                "data": {
                    "type": "tokens",
                    "attributes": {
                        "name": "osfsync",
                        "scopes": "osf.full_write",
                    }
                }
            }));
        if let Some(code) = otp {
            req = req.header("X-OSF-OTP", code);
        }

        let resp = req.send().await.map_err(|e| Error::Auth(e.to_string()))?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let needs_otp = resp
                .headers()
                .get("X-OSF-OTP")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("required"))
                .unwrap_or(false);
            if needs_otp {
                return Err(Error::NeedsSecondFactor);
            }
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Auth(body));
        }
        if status != StatusCode::CREATED {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Remote {
                status: status.as_u16(),
                url: self.url("/tokens/"),
                body,
            });
        }

        #[derive(Deserialize)]
        struct TokenEnvelope {
            data: TokenData,
        }
        #[derive(Deserialize)]
        struct TokenData {
            id: String,
        }
        let envelope: TokenEnvelope = resp
            .json()
            .await
            .map_err(|e| Error::Auth(format!("parsing token response: {e}")))?;

        self.token = Some(envelope.data.id.clone());
        let account_id = self.login_with_stored_token(&envelope.data.id).await?;
        Ok((account_id, envelope.data.id))
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => builder.bearer_auth(t),
            None => builder,
        }
    }

    pub async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .authed(self.control.get(&url))
            .send()
            .await
            .map_err(|e| Error::Remote {
                status: 0,
                url: url.clone(),
                body: e.to_string(),
            })?;
        self.decode_json(resp, &url).await
    }

    pub async fn put_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let resp = self
            .authed(self.control.put(url))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Remote {
                status: 0,
                url: url.to_string(),
                body: e.to_string(),
            })?;
        self.decode_json(resp, url).await
    }

    pub async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let resp = self
            .authed(self.control.post(url))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Remote {
                status: 0,
                url: url.to_string(),
                body: e.to_string(),
            })?;
        self.decode_json(resp, url).await
    }

    pub async fn delete(&self, url: &str) -> Result<()> {
        let resp = self
            .authed(self.control.delete(url))
            .send()
            .await
            .map_err(|e| Error::Remote {
                status: 0,
                url: url.to_string(),
                body: e.to_string(),
            })?;
        self.map_status(resp, url).await?;
        Ok(())
    }

    async fn decode_json<T: for<'de> Deserialize<'de>>(
        &self,
        resp: reqwest::Response,
        url: &str,
    ) -> Result<T> {
        let resp = self.map_status(resp, url).await?;
        let body = resp.bytes().await.map_err(|e| Error::Remote {
            status: 0,
            url: url.to_string(),
            body: e.to_string(),
        })?;
        serde_json::from_slice(&body).map_err(|e| Error::Remote {
            status: 0,
            url: url.to_string(),
            body: format!("decode error: {e}"),
        })
    }

    /// Maps non-2xx statuses to the appropriate error variant, treating 410
    /// as project-deletion and anything else as a generic remote error.
    async fn map_status(
        &self,
        resp: reqwest::Response,
        url: &str,
    ) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::GONE {
            return Err(Error::ProjectDeleted);
        }
        if status == StatusCode::CONFLICT {
            return Err(Error::AlreadyExists(url.to_string()));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Auth(body));
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::Remote {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        })
    }

    /// Streams a GET response into `sink`, checking `cancel` between reads
    /// of `chunk_size` bytes.
    pub async fn download_stream(
        &self,
        url: &str,
        sink: &mut impl Write,
        cancel: &std::sync::atomic::AtomicBool,
        mut on_progress: impl FnMut(u64),
    ) -> Result<()> {
        let resp = self
            .authed(self.data.get(url))
            .send()
            .await
            .map_err(|e| Error::Remote {
                status: 0,
                url: url.to_string(),
                body: e.to_string(),
            })?;
        let resp = self.map_status(resp, url).await?;
        let mut stream = resp.bytes_stream();
        let mut total = 0u64;
        while let Some(chunk) = stream.next().await {
            if cancel.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            let chunk = chunk.map_err(|e| Error::Remote {
                status: 0,
                url: url.to_string(),
                body: e.to_string(),
            })?;
            sink.write_all(&chunk)
                .map_err(|e| Error::local_io(std::path::PathBuf::new(), e))?;
            total += chunk.len() as u64;
            on_progress(total);
        }
        Ok(())
    }

    /// Uploads the file at `path` (size `len` known up front) to `url`.
    /// Files at or below `transfer::SMALL_FILE_THRESHOLD` are read fully and
    /// sent as a single in-memory body; anything larger is streamed off
    /// disk in `chunk_size` pieces via `Body::wrap_stream` so a large file
    /// is never fully materialized in memory. OSF takes one whole-body PUT
    /// per file either way — there is no part-numbered multipart protocol —
    /// so both paths issue exactly one request.
    pub async fn upload_stream(
        &self,
        url: &str,
        path: &Path,
        len: u64,
        chunk_size: usize,
        cancel: Arc<AtomicBool>,
        mut on_progress: impl FnMut(u64) + Send + Sync + 'static,
    ) -> Result<serde_json::Value> {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }

        let body = if len <= crate::transfer::SMALL_FILE_THRESHOLD {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| Error::local_io(path, e))?;
            on_progress(bytes.len() as u64);
            reqwest::Body::from(bytes)
        } else {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| Error::local_io(path, e))?;
            let cancel_stream = cancel.clone();
            let mut sent = 0u64;
            let stream = ReaderStream::with_capacity(file, chunk_size).map(move |chunk| {
                let chunk = chunk?;
                if cancel_stream.load(Ordering::Relaxed) {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, "cancelled"));
                }
                sent += chunk.len() as u64;
                on_progress(sent);
                Ok(chunk)
            });
            reqwest::Body::wrap_stream(stream)
        };

        let resp = self
            .authed(self.data.put(url))
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if cancel.load(Ordering::Relaxed) {
                    Error::Cancelled
                } else {
                    Error::Remote {
                        status: 0,
                        url: url.to_string(),
                        body: e.to_string(),
                    }
                }
            })?;
        let resp = self.map_status(resp, url).await?;
        let body = resp.bytes().await.map_err(|e| Error::Remote {
            status: 0,
            url: url.to_string(),
            body: e.to_string(),
        })?;
        serde_json::from_slice(&body).map_err(|e| Error::Remote {
            status: 0,
            url: url.to_string(),
            body: format!("decode error: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    async fn spawn(app: axum::Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn login_with_stored_token_accepts_valid_and_rejects_invalid() {
        let app = axum::Router::new().route(
            "/users/me/",
            axum::routing::get(|headers: axum::http::HeaderMap| async move {
                let auth = headers
                    .get(axum::http::header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                if auth == "Bearer good-token" {
                    axum::Json(serde_json::json!({"data": {"id": "acct-1"}})).into_response()
                } else {
                    axum::http::StatusCode::UNAUTHORIZED.into_response()
                }
            }),
        );
        let base = spawn(app).await;

        let mut session = Session::new(&base).unwrap();
        let account_id = session.login_with_stored_token("good-token").await.unwrap();
        assert_eq!(account_id, "acct-1");
        assert!(session.is_authenticated());

        let mut rejected = Session::new(&base).unwrap();
        let err = rejected.login_with_stored_token("bad-token").await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(!rejected.is_authenticated());
    }

    #[tokio::test]
    async fn login_with_password_reports_needs_second_factor() {
        let app = axum::Router::new().route(
            "/tokens/",
            axum::routing::post(|| async move {
                (
                    axum::http::StatusCode::UNAUTHORIZED,
                    [("X-OSF-OTP", "required")],
                )
                    .into_response()
            }),
        );
        let base = spawn(app).await;

        let mut session = Session::new(&base).unwrap();
        let err = session
            .login_with_password("alice@example.com", "hunter2", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NeedsSecondFactor));
    }

    #[tokio::test]
    async fn login_with_password_succeeds_and_stores_token() {
        let app = axum::Router::new()
            .route(
                "/tokens/",
                axum::routing::post(|| async move {
                    (
                        axum::http::StatusCode::CREATED,
                        axum::Json(serde_json::json!({"data": {"id": "issued-token"}})),
                    )
                        .into_response()
                }),
            )
            .route(
                "/users/me/",
                axum::routing::get(|| async move {
                    axum::Json(serde_json::json!({"data": {"id": "acct-1"}}))
                }),
            );
        let base = spawn(app).await;

        let mut session = Session::new(&base).unwrap();
        let (account_id, token) = session
            .login_with_password("alice@example.com", "hunter2", None)
            .await
            .unwrap();
        assert_eq!(account_id, "acct-1");
        assert_eq!(token, "issued-token");
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn get_put_post_delete_round_trip_json() {
        let app = axum::Router::new()
            .route(
                "/thing",
                axum::routing::get(|| async move { axum::Json(serde_json::json!({"ok": "get"})) })
                    .put(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                        axum::Json(serde_json::json!({"echo": body}))
                    })
                    .post(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                        axum::Json(serde_json::json!({"echo": body}))
                    })
                    .delete(|| async move { axum::http::StatusCode::NO_CONTENT }),
            );
        let base = spawn(app).await;
        let session = Session::new(&base).unwrap();

        let got: serde_json::Value = session.get_json("/thing").await.unwrap();
        assert_eq!(got, serde_json::json!({"ok": "get"}));

        let put_url = format!("{base}/thing");
        let put_resp: serde_json::Value = session
            .put_json(&put_url, &serde_json::json!({"v": 1}))
            .await
            .unwrap();
        assert_eq!(put_resp, serde_json::json!({"echo": {"v": 1}}));

        let post_resp: serde_json::Value = session
            .post_json(&put_url, &serde_json::json!({"v": 2}))
            .await
            .unwrap();
        assert_eq!(post_resp, serde_json::json!({"echo": {"v": 2}}));

        session.delete(&put_url).await.unwrap();
    }

    #[tokio::test]
    async fn map_status_translates_gone_and_conflict() {
        let app = axum::Router::new()
            .route(
                "/deleted",
                axum::routing::get(|| async move { axum::http::StatusCode::GONE }),
            )
            .route(
                "/conflict",
                axum::routing::put(|| async move { axum::http::StatusCode::CONFLICT }),
            );
        let base = spawn(app).await;
        let session = Session::new(&base).unwrap();

        let err = session.get_json::<serde_json::Value>("/deleted").await.unwrap_err();
        assert!(matches!(err, Error::ProjectDeleted));

        let put_url = format!("{base}/conflict");
        let err = session
            .put_json::<serde_json::Value>(&put_url, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn download_stream_writes_bytes_and_reports_progress() {
        let payload = b"hello osfsync".to_vec();
        let app = {
            let payload = payload.clone();
            axum::Router::new().route(
                "/download",
                axum::routing::get(move || {
                    let payload = payload.clone();
                    async move { payload }
                }),
            )
        };
        let base = spawn(app).await;
        let session = Session::new(&base).unwrap();
        let cancel = AtomicBool::new(false);

        let mut sink = Vec::new();
        let mut last_progress = 0u64;
        let url = format!("{base}/download");
        session
            .download_stream(&url, &mut sink, &cancel, |n| last_progress = n)
            .await
            .unwrap();

        assert_eq!(sink, payload);
        assert_eq!(last_progress, payload.len() as u64);
    }

    #[tokio::test]
    async fn upload_stream_sends_small_file_as_whole_body() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("small.bin");
        let contents = b"small payload".to_vec();
        tokio::fs::write(&path, &contents).await.unwrap();

        let app = axum::Router::new().route(
            "/upload",
            axum::routing::put(|body: axum::body::Body| async move {
                let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
                axum::Json(serde_json::json!({"data": {"attributes": {"extra": {"hashes": {}}}}, "received": bytes.len()}))
            }),
        );
        let base = spawn(app).await;
        let session = Session::new(&base).unwrap();
        let url = format!("{base}/upload");
        let cancel = Arc::new(AtomicBool::new(false));

        let response = session
            .upload_stream(&url, &path, contents.len() as u64, 64 * 1024, cancel, |_| {})
            .await
            .unwrap();
        assert_eq!(response["received"], contents.len());
    }

    #[tokio::test]
    async fn upload_stream_streams_large_file_in_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("large.bin");
        let size = crate::transfer::SMALL_FILE_THRESHOLD as usize + 4096;
        let contents = vec![7u8; size];
        tokio::fs::write(&path, &contents).await.unwrap();

        let app = axum::Router::new().route(
            "/upload",
            axum::routing::put(|body: axum::body::Body| async move {
                let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
                axum::Json(serde_json::json!({"received": bytes.len()}))
            }),
        );
        let base = spawn(app).await;
        let session = Session::new(&base).unwrap();
        let url = format!("{base}/upload");
        let cancel = Arc::new(AtomicBool::new(false));

        let progress = Arc::new(Mutex::new(0u64));
        let progress_clone = progress.clone();
        let response = session
            .upload_stream(&url, &path, size as u64, 64 * 1024, cancel, move |n| {
                *progress_clone.lock().unwrap() = n;
            })
            .await
            .unwrap();

        assert_eq!(response["received"], size);
        assert_eq!(*progress.lock().unwrap(), size as u64);
    }
}
