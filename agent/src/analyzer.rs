use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use frame_sentinel_common::config::AnalyzerConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Describes risk-relevant content in an image.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// `jpeg` is the encoded frame; the returned text is free-form.
    async fn analyze(&self, jpeg: &[u8], system_prompt: &str) -> Result<String, AnalysisError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("request to vision service failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("vision service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response from vision service: {0}")]
    Malformed(String),
    #[error("vision service returned no description")]
    Empty,
    #[error("vision service did not answer within {0:?}")]
    Timeout(Duration),
}

/// OpenAI-compatible chat-completions client with image input.
pub struct VisionAnalyzer {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: MessageContent<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl VisionAnalyzer {
    pub fn new(config: &AnalyzerConfig) -> Result<Self, AnalysisError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn request_body<'a>(&'a self, jpeg: &[u8], system_prompt: &'a str) -> ChatRequest<'a> {
        let data_url = format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(jpeg)
        );
        ChatRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: MessageContent::Text(system_prompt),
                },
                ChatMessage {
                    role: "user",
                    content: MessageContent::Parts(vec![ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url },
                    }]),
                },
            ],
        }
    }
}

#[async_trait]
impl Analyzer for VisionAnalyzer {
    async fn analyze(&self, jpeg: &[u8], system_prompt: &str) -> Result<String, AnalysisError> {
        let body = self.request_body(jpeg, system_prompt);
        debug!(
            model = self.model,
            image_bytes = jpeg.len(),
            max_tokens = self.max_tokens,
            "requesting image analysis"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(AnalysisError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_description(&text)
    }
}

/// Pull the first choice's text out of a chat-completions response body.
fn parse_description(body: &str) -> Result<String, AnalysisError> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| AnalysisError::Malformed(e.to_string()))?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|c| c.trim().to_string())
        .unwrap_or_default();
    if content.is_empty() {
        return Err(AnalysisError::Empty);
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn analyzer() -> VisionAnalyzer {
        analyzer_at("http://localhost:1/v1".into())
    }

    fn analyzer_at(base_url: String) -> VisionAnalyzer {
        let config = AnalyzerConfig {
            api_key: "sk-test".into(),
            base_url,
            ..AnalyzerConfig::default()
        };
        VisionAnalyzer::new(&config).unwrap()
    }

    /// Answer one request with `status_line` and a JSON `body`, returning the raw request.
    async fn one_shot_server(
        status_line: &'static str,
        body: String,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 8192];
            while !request_complete(&request) {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}/v1"), handle)
    }

    /// Headers are in and the body has reached its declared length.
    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= header_end + 4 + length
    }

    #[test]
    fn request_carries_prompt_image_and_token_cap() {
        let analyzer = analyzer();
        assert_eq!(analyzer.endpoint, "http://localhost:1/v1/chat/completions");

        let body = serde_json::to_value(analyzer.request_body(&[0xFF, 0xD8, 0xFF], "watch closely")).unwrap();
        assert_eq!(
            body,
            json!({
                "model": "gpt-4o",
                "max_tokens": 300,
                "messages": [
                    { "role": "system", "content": "watch closely" },
                    {
                        "role": "user",
                        "content": [
                            {
                                "type": "image_url",
                                "image_url": { "url": "data:image/jpeg;base64,/9j/" }
                            }
                        ]
                    }
                ]
            })
        );
    }

    #[test]
    fn description_is_trimmed() {
        let body = r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"  Person has fallen near the door.\n"}}]}"#;
        assert_eq!(parse_description(body).unwrap(), "Person has fallen near the door.");
    }

    #[test]
    fn empty_or_missing_content_is_an_error() {
        assert!(matches!(parse_description(r#"{"choices":[]}"#), Err(AnalysisError::Empty)));
        assert!(matches!(
            parse_description(r#"{"choices":[{"message":{"content":null}}]}"#),
            Err(AnalysisError::Empty)
        ));
        assert!(matches!(
            parse_description(r#"{"choices":[{"message":{"content":"   "}}]}"#),
            Err(AnalysisError::Empty)
        ));
    }

    #[test]
    fn non_json_body_is_malformed() {
        assert!(matches!(parse_description("<html>bad gateway</html>"), Err(AnalysisError::Malformed(_))));
    }

    #[tokio::test]
    async fn unreachable_service_is_an_analysis_error() {
        let err = analyzer().analyze(&[0xFF, 0xD8], "prompt").await.unwrap_err();
        assert!(matches!(err, AnalysisError::Http(_)));
    }

    #[tokio::test]
    async fn successful_reply_is_parsed_end_to_end() {
        let body = json!({
            "choices": [
                { "index": 0, "message": { "role": "assistant", "content": " Person has fallen near the door. " } }
            ]
        })
        .to_string();
        let (base_url, server) = one_shot_server("200 OK", body).await;

        let description = analyzer_at(base_url)
            .analyze(&[0xFF, 0xD8, 0xFF], "watch closely")
            .await
            .unwrap();
        assert_eq!(description, "Person has fallen near the door.");

        let request = server.await.unwrap();
        let lower = request.to_lowercase();
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(lower.contains("authorization: bearer sk-test"));
        assert!(lower.contains("content-type: application/json"));
        assert!(request.contains("data:image/jpeg;base64,/9j/"));
        assert!(request.contains("watch closely"));
    }

    #[tokio::test]
    async fn error_status_carries_body() {
        let (base_url, _server) = one_shot_server(
            "429 Too Many Requests",
            r#"{"error":{"message":"Rate limit reached"}}"#.to_string(),
        )
        .await;

        let err = analyzer_at(base_url)
            .analyze(&[0xFF, 0xD8], "prompt")
            .await
            .unwrap_err();
        match err {
            AnalysisError::Status { status, body } => {
                assert_eq!(status, 429);
                assert!(body.contains("Rate limit reached"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
