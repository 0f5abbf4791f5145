//! Gemini API client
//!
//! Single reqwest-backed client for both plain generation (query
//! interpretation, field extraction) and function-calling turns driven by
//! the conversation orchestrator. Uses a long-lived Client for connection
//! pooling.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info};

use crate::error::AgentError;
use crate::models::ChatMessage;
use crate::Result;

const DEFAULT_BASE_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Generate a plain text completion.
    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        let request = GenerateRequest {
            contents: vec![Content::user_text(prompt)],
            tools: None,
            system_instruction: system.map(SystemInstruction::from_text),
            generation_config: GenerationConfig::assistant_defaults(),
        };

        let response = self.call(&request).await?;
        let candidate = first_candidate(response)?;

        let text = candidate.content.joined_text();
        if text.is_empty() {
            return Err(AgentError::Llm("Empty response from Gemini".to_string()));
        }

        Ok(text)
    }

    /// Run one function-calling turn: the model may answer with text, with
    /// one or more tool calls, or both.
    pub async fn generate_turn(
        &self,
        system: &str,
        contents: Vec<Content>,
        declarations: &[FunctionDeclaration],
    ) -> Result<LlmTurn> {
        let request = GenerateRequest {
            contents,
            tools: Some(vec![ToolSet {
                function_declarations: declarations.to_vec(),
            }]),
            system_instruction: Some(SystemInstruction::from_text(system)),
            generation_config: GenerationConfig::assistant_defaults(),
        };

        let response = self.call(&request).await?;
        let candidate = first_candidate(response)?;

        let tool_calls: Vec<FunctionCall> = candidate
            .content
            .parts
            .iter()
            .filter_map(|part| part.function_call.clone())
            .collect();
        let text = candidate.content.joined_text();

        Ok(LlmTurn {
            content: candidate.content,
            text: if text.is_empty() { None } else { Some(text) },
            tool_calls,
        })
    }

    async fn call(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        if self.api_key.is_empty() {
            return Err(AgentError::Llm("GEMINI_API_KEY not configured".to_string()));
        }

        let url = format!("{}?key={}", self.base_url, self.api_key);

        info!("Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                AgentError::Llm(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(AgentError::Llm(format!("Gemini API error: {}", error_text)));
        }

        response.json::<GenerateResponse>().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            AgentError::Llm(format!("Gemini parse error: {}", e))
        })
    }
}

fn first_candidate(response: GenerateResponse) -> Result<Candidate> {
    response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::Llm("No response from Gemini API".to_string()))
}

/// One finished model turn.
#[derive(Debug, Clone)]
pub struct LlmTurn {
    /// The raw content, echoed back into the conversation when tool results
    /// are returned.
    pub content: Content,
    pub text: Option<String>,
    pub tool_calls: Vec<FunctionCall>,
}

//
// ================= Wire types =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: &str) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part::text(text)],
        }
    }

    /// Content carrying tool results back to the model.
    pub fn tool_results(parts: Vec<Part>) -> Self {
        Self {
            role: "user".to_string(),
            parts,
        }
    }

    /// Map caller-supplied chat history onto Gemini roles. Anything that is
    /// not an assistant turn is treated as user input.
    pub fn from_history(history: &[ChatMessage]) -> Vec<Content> {
        history
            .iter()
            .filter(|message| !message.content.trim().is_empty())
            .map(|message| {
                let role = match message.role.to_lowercase().as_str() {
                    "assistant" | "model" | "agent" => "model",
                    _ => "user",
                };
                Self {
                    role: role.to_string(),
                    parts: vec![Part::text(&message.content)],
                }
            })
            .collect()
    }

    fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    pub fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Default::default()
        }
    }

    pub fn function_response(name: &str, content: String) -> Self {
        Self {
            function_response: Some(FunctionResponse {
                name: name.to_string(),
                response: serde_json::json!({ "content": content }),
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

/// Callable tool surface advertised to the model. `parameters` is an
/// OpenAPI-style schema object.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolSet {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolSet>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

impl SystemInstruction {
    fn from_text(text: &str) -> Self {
        Self {
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

impl GenerationConfig {
    fn assistant_defaults() -> Self {
        Self {
            temperature: 0.2,
            top_p: 0.9,
            top_k: 40,
            max_output_tokens: 1024,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}
