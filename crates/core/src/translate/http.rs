//! HTTP translation backend.
//! Posts `{texts, srcLang, targetLang}` as JSON and expects
//! `{translations: [...]}` back, one entry per text.

use super::{pair_results, TranslateRequest, Translator};
use crate::error::TranslateError;
use crate::model::{TranslationResult, TranslationUnit};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestBody<'a> {
    texts: Vec<&'a str>,
    src_lang: &'a str,
    target_lang: &'a str,
}

#[derive(Deserialize)]
struct ResponseBody {
    translations: Vec<Option<String>>,
}

/// Translator that talks to a remote JSON endpoint.
#[derive(Clone)]
pub struct HttpTranslator {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTranslator {
    /// Build a client for `endpoint`; `timeout` bounds every single request.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TranslateError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TranslateError::BadRequest(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    /// Send the batch and return the raw per-text answers.
    async fn post(
        &self,
        units: &[TranslationUnit],
        request: &TranslateRequest<'_>,
    ) -> Result<Vec<Option<String>>, TranslateError> {
        let body = RequestBody {
            texts: units.iter().map(|u| u.source_text.as_str()).collect(),
            src_lang: request.src_lang,
            target_lang: request.target_lang,
        };
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::USER_AGENT, request.identity)
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().await.map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }
        let parsed: ResponseBody = resp.json().await.map_err(transport_error)?;
        Ok(parsed.translations)
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(
        &self,
        request: TranslateRequest<'_>,
    ) -> Result<Vec<TranslationResult>, TranslateError> {
        trace!(
            "translate units={} {}->{}",
            request.units.len(),
            request.src_lang,
            request.target_lang
        );
        let sendable: Vec<TranslationUnit> = request
            .units
            .iter()
            .filter(|u| !u.is_blank())
            .cloned()
            .collect();
        let answers = if sendable.is_empty() {
            Vec::new()
        } else {
            self.post(&sendable, &request).await?
        };
        if answers.len() != sendable.len() {
            return Err(TranslateError::retryable(format!(
                "backend returned {} translations for {} texts",
                answers.len(),
                sendable.len()
            )));
        }
        // blank units never leave the process; put placeholders back in order
        let mut answers = answers.into_iter();
        let texts = request
            .units
            .iter()
            .map(|u| if u.is_blank() { None } else { answers.next().flatten() })
            .collect();
        let results = pair_results(request.units, texts)?;
        debug!("backend answered {} units", results.len());
        Ok(results)
    }
}

/// Map a non-success status to the retry classification.
fn classify_status(status: StatusCode, body: String) -> TranslateError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        body
    };
    match status.as_u16() {
        429 | 408 | 500..=599 => TranslateError::Retryable {
            status: Some(status.as_u16()),
            message,
        },
        401 | 403 => TranslateError::Auth(message),
        400 | 422 if message.to_lowercase().contains("language") => {
            TranslateError::UnsupportedLanguage(message)
        }
        _ => TranslateError::BadRequest(message),
    }
}

/// Timeouts, connection failures and undecodable bodies are worth retrying.
fn transport_error(err: reqwest::Error) -> TranslateError {
    if err.is_builder() {
        return TranslateError::BadRequest(err.to_string());
    }
    TranslateError::Retryable {
        status: err.status().map(|s| s.as_u16()),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OffsetSpan;
    use httpmock::prelude::*;
    use serde_json::json;

    fn tu(id: &str, text: &str) -> TranslationUnit {
        TranslationUnit {
            id: id.into(),
            source_text: text.into(),
            spans: vec![OffsetSpan {
                unit_index: 1,
                range: 0..text.len(),
                local_offset: 0,
            }],
        }
    }

    fn request<'a>(units: &'a [TranslationUnit]) -> TranslateRequest<'a> {
        TranslateRequest {
            units,
            src_lang: "en",
            target_lang: "pt-BR",
            identity: "agent/1",
        }
    }

    fn translator(server: &MockServer) -> HttpTranslator {
        HttpTranslator::new(
            server.url("/translate"),
            Some("secret".into()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn posts_texts_and_pairs_answers() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/translate")
                    .header("user-agent", "agent/1")
                    .header("authorization", "Bearer secret")
                    .json_body(json!({
                        "texts": ["Hello.", "Bye."],
                        "srcLang": "en",
                        "targetLang": "pt-BR"
                    }));
                then.status(200)
                    .json_body(json!({"translations": ["Olá.", null]}));
            })
            .await;
        let units = vec![tu("a", "Hello."), tu("b", ""), tu("c", "Bye.")];
        let results = translator(&server).translate(request(&units)).await.unwrap();
        mock.assert_async().await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].translated_text, "Olá.");
        assert!(results[1].is_success());
        assert_eq!(results[1].translated_text, "");
        assert!(!results[2].is_success());
    }

    #[tokio::test]
    async fn throttling_is_retryable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/translate");
                then.status(429).body("slow down");
            })
            .await;
        let units = vec![tu("a", "Hello.")];
        let err = translator(&server)
            .translate(request(&units))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TranslateError::Retryable {
                status: Some(429),
                message: "slow down".into()
            }
        );
    }

    #[tokio::test]
    async fn bad_credentials_are_fatal() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/translate");
                then.status(401);
            })
            .await;
        let units = vec![tu("a", "Hello.")];
        let err = translator(&server)
            .translate(request(&units))
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::Auth(_)));
    }

    #[tokio::test]
    async fn truncated_answer_list_is_retryable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/translate");
                then.status(200).json_body(json!({"translations": []}));
            })
            .await;
        let units = vec![tu("a", "Hello.")];
        let err = translator(&server)
            .translate(request(&units))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn classifies_statuses() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, String::new()).is_retryable());
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, String::new()),
            TranslateError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "unsupported target language xx".into()),
            TranslateError::UnsupportedLanguage(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "missing texts".into()),
            TranslateError::BadRequest(_)
        ));
    }
}
