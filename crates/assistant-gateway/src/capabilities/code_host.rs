//! Source-code-hosting operations backed by the GitHub REST API
use super::generator::http_client;
use super::{bool_param, str_param, u32_param, WireParams};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeHostOperation {
    ListRepos,
    CreateRepo { name: String, description: String, private: bool },
    SearchRepos { query: String, page: u32, per_page: u32 },
    GetFile { owner: String, repo: String, path: String, git_ref: String },
    PutFile {
        owner: String,
        repo: String,
        path: String,
        content: String,
        message: String,
        branch: String,
        sha: Option<String>,
    },
    CreateIssue { owner: String, repo: String, title: String, body: String },
    CreatePullRequest { owner: String, repo: String, title: String, body: String, head: String, base: String },
}

impl CodeHostOperation {
    pub fn tag(&self) -> &'static str {
        match self {
            CodeHostOperation::ListRepos => "list_repos",
            CodeHostOperation::CreateRepo { .. } => "create_repo",
            CodeHostOperation::SearchRepos { .. } => "search_repos",
            CodeHostOperation::GetFile { .. } => "get_file",
            CodeHostOperation::PutFile { .. } => "update_file",
            CodeHostOperation::CreateIssue { .. } => "create_issue",
            CodeHostOperation::CreatePullRequest { .. } => "create_pr",
        }
    }

    /// Build from a detector's `{operation_type, parameters}` pair. None when
    /// the tag is unknown or a required parameter is missing.
    pub fn from_wire(tag: &str, params: &WireParams) -> Option<Self> {
        let req = |key: &str| str_param(params, key);
        let opt = |key: &str, default: &str| str_param(params, key).unwrap_or_else(|| default.to_string());
        let text = |key: &str| {
            params.get(key).and_then(|v| v.as_str()).unwrap_or_default().to_string()
        };

        let operation = match tag.trim().to_ascii_lowercase().as_str() {
            "list_repos" => CodeHostOperation::ListRepos,
            "create_repo" => CodeHostOperation::CreateRepo {
                name: req("name")?,
                description: text("description"),
                private: bool_param(params, "private").unwrap_or(false),
            },
            "search_repos" => CodeHostOperation::SearchRepos {
                query: req("query")?,
                page: u32_param(params, "page").unwrap_or(1).max(1),
                per_page: u32_param(params, "per_page").unwrap_or(10).clamp(1, 100),
            },
            "get_file" => CodeHostOperation::GetFile {
                owner: req("owner")?,
                repo: req("repo")?,
                path: req("path")?,
                git_ref: opt("ref", "main"),
            },
            "update_file" | "put_file" | "create_file" => CodeHostOperation::PutFile {
                owner: req("owner")?,
                repo: req("repo")?,
                path: req("path")?,
                content: text("content"),
                message: opt("message", "Update via API"),
                branch: opt("branch", "main"),
                sha: req("sha"),
            },
            "create_issue" => CodeHostOperation::CreateIssue {
                owner: req("owner")?,
                repo: req("repo")?,
                title: req("title")?,
                body: text("body"),
            },
            "create_pr" | "create_pull_request" => CodeHostOperation::CreatePullRequest {
                owner: req("owner")?,
                repo: req("repo")?,
                title: req("title")?,
                body: text("body"),
                head: req("head")?,
                base: opt("base", "main"),
            },
            _ => return None,
        };
        Some(operation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeHostOutcome {
    pub success: bool,
    pub message: String,
    pub data: Option<Value>,
}

impl CodeHostOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), data: None }
    }
}

#[async_trait]
pub trait CodeHostClient: Send + Sync {
    async fn execute(&self, operation: &CodeHostOperation) -> anyhow::Result<CodeHostOutcome>;
}

pub struct GitHubClient {
    token: Option<String>,
    api_url: String,
    http_client: reqwest::Client,
}

impl GitHubClient {
    pub fn new(token: Option<String>, api_url: impl Into<String>, timeout: Duration) -> Self {
        let token = token.filter(|t| !t.trim().is_empty());
        if token.is_none() {
            warn!("GITHUB_TOKEN is not set; code-host operations will report failure");
        }
        let api_url = api_url.into().trim_end_matches('/').to_string();
        info!("GitHub client initialized: {}", api_url);
        Self { token, api_url, http_client: http_client(timeout) }
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> anyhow::Result<CodeHostOutcome> {
        let Some(token) = &self.token else {
            return Ok(CodeHostOutcome::failure("GitHub APIトークンが設定されていません。"));
        };

        debug!("GitHub {} {}", method, endpoint);
        let mut request = self.http_client
            .request(method, format!("{}{}", self.api_url, endpoint))
            .header("Accept", "application/vnd.github.v3+json")
            .header("Authorization", format!("token {}", token))
            .header("User-Agent", "assistant-gateway");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GitHub request failed: {}", e))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            error!("GitHub API error: {} - {}", status, text);
            return Ok(CodeHostOutcome::failure(format!("GitHub APIエラー: {} - {}", status.as_u16(), text)));
        }

        let data = if text.trim().is_empty() {
            None
        } else {
            Some(serde_json::from_str(&text)
                .map_err(|e| anyhow::anyhow!("Failed to parse GitHub response: {}", e))?)
        };
        Ok(CodeHostOutcome { success: true, message: "操作が成功しました".to_string(), data })
    }

    async fn get_file(&self, owner: &str, repo: &str, path: &str, git_ref: &str) -> anyhow::Result<CodeHostOutcome> {
        let endpoint = format!("/repos/{}/{}/contents/{}", owner, repo, path.trim_start_matches('/'));
        let mut outcome = self.request(Method::GET, &endpoint, &[("ref", git_ref.to_string())], None).await?;

        if let Some(Value::Object(data)) = outcome.data.as_mut() {
            let encoded: Option<String> = data
                .get("content")
                .and_then(|v| v.as_str())
                .map(|s| s.chars().filter(|c| !c.is_whitespace()).collect());
            if let Some(encoded) = encoded.filter(|s| !s.is_empty()) {
                match STANDARD.decode(encoded).map(String::from_utf8) {
                    Ok(Ok(decoded)) => {
                        data.insert("decoded_content".to_string(), Value::String(decoded));
                    }
                    _ => warn!("Could not decode content of {}", path),
                }
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl CodeHostClient for GitHubClient {
    async fn execute(&self, operation: &CodeHostOperation) -> anyhow::Result<CodeHostOutcome> {
        match operation {
            CodeHostOperation::ListRepos => self.request(Method::GET, "/user/repos", &[], None).await,
            CodeHostOperation::CreateRepo { name, description, private } => {
                let body = json!({
                    "name": name,
                    "description": description,
                    "private": private,
                    "auto_init": true,
                });
                self.request(Method::POST, "/user/repos", &[], Some(body)).await
            }
            CodeHostOperation::SearchRepos { query, page, per_page } => {
                let params = [("q", query.clone()), ("page", page.to_string()), ("per_page", per_page.to_string())];
                self.request(Method::GET, "/search/repositories", &params, None).await
            }
            CodeHostOperation::GetFile { owner, repo, path, git_ref } => {
                self.get_file(owner, repo, path, git_ref).await
            }
            CodeHostOperation::PutFile { owner, repo, path, content, message, branch, sha } => {
                let mut body = json!({
                    "message": message,
                    "content": STANDARD.encode(content.as_bytes()),
                    "branch": branch,
                });
                if let Some(sha) = sha {
                    body["sha"] = Value::String(sha.clone());
                }
                let endpoint = format!("/repos/{}/{}/contents/{}", owner, repo, path.trim_start_matches('/'));
                self.request(Method::PUT, &endpoint, &[], Some(body)).await
            }
            CodeHostOperation::CreateIssue { owner, repo, title, body } => {
                let endpoint = format!("/repos/{}/{}/issues", owner, repo);
                self.request(Method::POST, &endpoint, &[], Some(json!({"title": title, "body": body}))).await
            }
            CodeHostOperation::CreatePullRequest { owner, repo, title, body, head, base } => {
                let endpoint = format!("/repos/{}/{}/pulls", owner, repo);
                let payload = json!({"title": title, "body": body, "head": head, "base": base});
                self.request(Method::POST, &endpoint, &[], Some(payload)).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn wire(value: Value) -> WireParams {
        value.as_object().cloned().unwrap()
    }

    fn client(url: String) -> GitHubClient {
        GitHubClient::new(Some("secret".into()), url, Duration::from_secs(5))
    }

    // ===== Wire mapping =====

    #[test]
    fn test_from_wire_defaults() {
        let op = CodeHostOperation::from_wire("get_file", &wire(json!({"owner": "o", "repo": "r", "path": "README.md"}))).unwrap();
        assert_eq!(op, CodeHostOperation::GetFile {
            owner: "o".into(),
            repo: "r".into(),
            path: "README.md".into(),
            git_ref: "main".into(),
        });

        let op = CodeHostOperation::from_wire("search_repos", &wire(json!({"query": "markdown parser"}))).unwrap();
        assert_eq!(op, CodeHostOperation::SearchRepos { query: "markdown parser".into(), page: 1, per_page: 10 });
    }

    #[test]
    fn test_from_wire_rejects_incomplete() {
        assert!(CodeHostOperation::from_wire("create_issue", &wire(json!({"owner": "o", "repo": "r"}))).is_none());
        assert!(CodeHostOperation::from_wire("delete_everything", &wire(json!({}))).is_none());
        assert_eq!(CodeHostOperation::from_wire("list_repos", &wire(json!({}))), Some(CodeHostOperation::ListRepos));
    }

    // ===== HTTP =====

    #[tokio::test]
    async fn test_missing_token_fails_in_band() {
        let client = GitHubClient::new(None, "http://127.0.0.1:1", Duration::from_secs(1));
        let outcome = client.execute(&CodeHostOperation::ListRepos).await.unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_list_repos_sends_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/user/repos")
            .match_header("Authorization", "token secret")
            .with_status(200)
            .with_body(r#"[{"name":"demo","private":false}]"#)
            .create_async()
            .await;

        let outcome = client(server.url()).execute(&CodeHostOperation::ListRepos).await.unwrap();
        mock.assert_async().await;
        assert!(outcome.success);
        assert_eq!(outcome.data.unwrap()[0]["name"], "demo");
    }

    #[tokio::test]
    async fn test_get_file_decodes_content() {
        let mut server = mockito::Server::new_async().await;
        let encoded = STANDARD.encode("# Hello\n");
        server
            .mock("GET", "/repos/o/r/contents/README.md")
            .match_query(Matcher::UrlEncoded("ref".into(), "main".into()))
            .with_status(200)
            .with_body(json!({"path": "README.md", "content": format!("{}\n", encoded)}).to_string())
            .create_async()
            .await;

        let op = CodeHostOperation::GetFile {
            owner: "o".into(),
            repo: "r".into(),
            path: "README.md".into(),
            git_ref: "main".into(),
        };
        let outcome = client(server.url()).execute(&op).await.unwrap();
        assert_eq!(outcome.data.unwrap()["decoded_content"], "# Hello\n");
    }

    #[tokio::test]
    async fn test_put_file_encodes_content() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/repos/o/r/contents/a.txt")
            .match_body(Matcher::PartialJson(json!({"content": STANDARD.encode("hi"), "branch": "main"})))
            .with_status(201)
            .with_body("{}")
            .create_async()
            .await;

        let op = CodeHostOperation::PutFile {
            owner: "o".into(),
            repo: "r".into(),
            path: "a.txt".into(),
            content: "hi".into(),
            message: "add".into(),
            branch: "main".into(),
            sha: None,
        };
        assert!(client(server.url()).execute(&op).await.unwrap().success);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_error_is_in_band() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/repos/o/r/issues").with_status(404).with_body("Not Found").create_async().await;

        let op = CodeHostOperation::CreateIssue {
            owner: "o".into(),
            repo: "r".into(),
            title: "bug".into(),
            body: String::new(),
        };
        let outcome = client(server.url()).execute(&op).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("404"));
    }
}
