use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const SMILE_PROMPT: &str = "Analyze this selfie and rate the smile on a scale of 0-10, \
     where 0 means no smile and 10 means a full genuine smile. Return only the numeric score.";

/// Rates how strongly a face is smiling, in [0, 10].
///
/// Transport and upstream failures propagate as errors so callers can
/// distinguish "the API was down" from "the model saw no smile".
#[async_trait]
pub trait SmileScorer: Send + Sync {
    async fn score(&self, image: &[u8]) -> Result<f64>;
}

/// HTTP adapter for a Gemini-style `generateContent` vision endpoint.
///
/// Reads `SMILE_SCORER_URL`, `SMILE_SCORER_MODEL`, and `SMILE_SCORER_API_KEY`
/// from the environment at construction time.
pub struct GeminiScorer {
    endpoint: String,
    model: String,
    api_key: String,
    http: reqwest::Client,
}

impl GeminiScorer {
    pub fn new(endpoint: Option<String>, model: Option<String>, api_key: Option<String>) -> Self {
        let endpoint = endpoint
            .or_else(|| std::env::var("SMILE_SCORER_URL").ok())
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string());
        let model = model
            .or_else(|| std::env::var("SMILE_SCORER_MODEL").ok())
            .unwrap_or_else(|| "gemini-1.5-flash".to_string());
        let api_key = api_key
            .or_else(|| std::env::var("SMILE_SCORER_API_KEY").ok())
            .unwrap_or_default();

        if api_key.is_empty() {
            warn!("SMILE_SCORER_API_KEY is not set; scoring requests will be rejected upstream");
        }

        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model,
            api_key,
            http: reqwest::Client::new(),
        }
    }
}

impl Default for GeminiScorer {
    fn default() -> Self {
        Self::new(None, None, None)
    }
}

// ── Gemini generateContent wire types ────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum Part {
    Text(String),
    InlineData(InlineData),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl SmileScorer for GeminiScorer {
    async fn score(&self, image: &[u8]) -> Result<f64> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.endpoint, self.model, self.api_key
        );

        let body = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![
                    Part::Text(SMILE_PROMPT.to_owned()),
                    Part::InlineData(InlineData {
                        mime_type: "image/jpeg".to_owned(),
                        data: STANDARD.encode(image),
                    }),
                ],
            }],
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("smile scorer transport")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("smile scorer HTTP {status}: {text}");
        }

        let body: GenerateContentResponse = response
            .json()
            .await
            .context("smile scorer parse")?;

        let text = body
            .candidates
            .first()
            .and_then(|candidate| candidate.content.parts.first())
            .map(|part| part.text.as_str())
            .unwrap_or_default();

        Ok(parse_score(text))
    }
}

/// Interprets the model's reply as a score. Only the leading numeric
/// token counts, so chatty replies like "7.2/10" still parse. A reply
/// that does not start with a number counts as no smile; anything
/// numeric is clamped to [0, 10].
pub fn parse_score(text: &str) -> f64 {
    let trimmed = text.trim();

    let mut end = 0;
    let mut seen_dot = false;
    for (index, ch) in trimmed.char_indices() {
        match ch {
            '+' | '-' if index == 0 => {}
            '.' if !seen_dot => seen_dot = true,
            '0'..='9' => {}
            _ => break,
        }
        end = index + ch.len_utf8();
    }

    match trimmed[..end].parse::<f64>() {
        Ok(value) if value.is_finite() => value.clamp(0.0, 10.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_reply_passes_through() {
        assert_eq!(parse_score("7.2"), 7.2);
        assert_eq!(parse_score(" 5\n"), 5.0);
    }

    #[test]
    fn out_of_range_replies_are_clamped() {
        assert_eq!(parse_score("12.5"), 10.0);
        assert_eq!(parse_score("-3"), 0.0);
    }

    #[test]
    fn leading_numeric_token_is_extracted() {
        assert_eq!(parse_score("7.2/10"), 7.2);
        assert_eq!(parse_score("8 out of 10"), 8.0);
        assert_eq!(parse_score("6.5.1"), 6.5);
        assert_eq!(parse_score(".5!"), 0.5);
    }

    #[test]
    fn non_numeric_reply_scores_zero() {
        assert_eq!(parse_score("a big smile!"), 0.0);
        assert_eq!(parse_score(""), 0.0);
        assert_eq!(parse_score("NaN"), 0.0);
    }
}
