//! Vision-model evaluation of a frame batch.
//!
//! The model is served behind an OpenAI-compatible chat-completions endpoint
//! (vLLM). Each request carries the batch as one `video/jpeg` data URL, the
//! rendered instruction prompt and the verdict schema for guided decoding.

use std::ops::RangeInclusive;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::Frame;
use thiserror::Error;
use tracing::{debug, error};

use crate::prompt::PromptCache;
use crate::verdict::WatcherVerdict;

pub const DEFAULT_MODEL: &str = "Qwen/Qwen2.5-VL-7B-Instruct-AWQ";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/v1";
pub const DEFAULT_FPS: u32 = 2;
/// Frame rates outside this band are treated as measurement noise.
pub const FPS_BAND: RangeInclusive<u32> = 1..=30;

const SYSTEM_PROMPT: &str = "You are a helpful assistant.";
/// Longest slice of an error body kept in [`InferenceFailure::Endpoint`].
const MAX_ERROR_BODY: usize = 512;

/// Why an evaluation produced no verdict.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceFailure {
    /// The model answered, but not with a valid verdict.
    #[error("response failed schema validation: {error}")]
    Schema { error: String, raw_response: String },
    /// The endpoint could not be reached or the request timed out.
    #[error("inference transport error: {0}")]
    Transport(String),
    /// The endpoint answered with a non-success status.
    #[error("inference endpoint returned {status}: {message}")]
    Endpoint { status: u16, message: String },
    /// The endpoint answered 2xx with something that is not a chat completion.
    #[error("malformed completion: {0}")]
    Protocol(String),
}

/// Anything that can turn a frame batch plus instructions into a verdict.
pub trait FrameAnalyzer {
    /// Evaluate `frames` (oldest first) against `instructions`.
    ///
    /// Implementations panic on an empty frame batch or an empty instruction
    /// list; both are caller bugs.
    fn evaluate(
        &self,
        frames: &[Frame],
        instructions: &[String],
    ) -> Result<WatcherVerdict, InferenceFailure>;
}

impl<T: FrameAnalyzer + ?Sized> FrameAnalyzer for Box<T> {
    fn evaluate(
        &self,
        frames: &[Frame],
        instructions: &[String],
    ) -> Result<WatcherVerdict, InferenceFailure> {
        (**self).evaluate(frames, instructions)
    }
}

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Base URL including the API version prefix, e.g. `http://localhost:8000/v1`.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub default_fps: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            temperature: 0.1,
            max_tokens: 512,
            timeout: Duration::from_secs(120),
            default_fps: DEFAULT_FPS,
        }
    }
}

/// Frame rate of a batch as observed from its capture timestamps.
///
/// `round((n - 1) / span_seconds)`, falling back to `default_fps` when the
/// batch has fewer than two frames, a non-positive span, or a rate outside
/// `band`.
pub fn effective_fps(frames: &[Frame], default_fps: u32, band: RangeInclusive<u32>) -> u32 {
    let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
        return default_fps;
    };
    if frames.len() < 2 {
        return default_fps;
    }

    let span = last.captured_at() - first.captured_at();
    let secs = span.num_microseconds().map(|us| us as f64 / 1e6);
    match secs {
        Some(secs) if secs > 0.0 => {
            let rate = ((frames.len() - 1) as f64 / secs).round();
            if rate.is_finite() && rate >= *band.start() as f64 && rate <= *band.end() as f64 {
                rate as u32
            } else {
                default_fps
            }
        }
        _ => default_fps,
    }
}

/// Blocking client for a vLLM chat-completions endpoint.
pub struct InferenceClient {
    config: InferenceConfig,
    http: Client,
    prompts: PromptCache,
    schema: Value,
}

impl InferenceClient {
    pub fn new(mut config: InferenceConfig) -> Result<Self, InferenceFailure> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| InferenceFailure::Transport(err.to_string()))?;
        config.base_url = trim_trailing_slash(config.base_url);
        Ok(Self {
            config,
            http,
            prompts: PromptCache::new(),
            schema: WatcherVerdict::json_schema(),
        })
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<ChatResponse, InferenceFailure> {
        let url = format!("{}/{}", self.config.base_url, path.trim_start_matches('/'));
        let mut request = self.http.post(url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .map_err(|err| InferenceFailure::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut message = response.text().unwrap_or_default();
            if message.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
            return Err(InferenceFailure::Endpoint {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<ChatResponse>()
            .map_err(|err| InferenceFailure::Protocol(err.to_string()))
    }
}

impl FrameAnalyzer for InferenceClient {
    fn evaluate(
        &self,
        frames: &[Frame],
        instructions: &[String],
    ) -> Result<WatcherVerdict, InferenceFailure> {
        assert!(!frames.is_empty(), "cannot evaluate an empty frame batch");
        let prompt = self.prompts.get(instructions);

        let fps = effective_fps(frames, self.config.default_fps, FPS_BAND);
        let encoded: Vec<String> = frames.iter().map(|f| STANDARD.encode(f.payload())).collect();
        let video_url = format!("data:video/jpeg;base64,{}", encoded.join(","));

        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: MessageContent::Text(SYSTEM_PROMPT),
                },
                ChatMessage {
                    role: "user",
                    content: MessageContent::Parts(vec![
                        ContentPart::VideoUrl {
                            video_url: MediaUrl { url: video_url },
                        },
                        ContentPart::Text { text: &*prompt },
                    ]),
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            mm_processor_kwargs: ProcessorKwargs { fps: [fps] },
            guided_json: &self.schema,
        };

        debug!(frames = frames.len(), fps, "Requesting evaluation");
        let response = self.post_json("chat/completions", &request)?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| InferenceFailure::Protocol("completion has no message content".into()))?;

        WatcherVerdict::parse(&content).map_err(|err| {
            error!(raw_response = %content, "Failed to validate response: {err}");
            InferenceFailure::Schema {
                error: err.to_string(),
                raw_response: content.clone(),
            }
        })
    }
}

fn trim_trailing_slash(mut base: String) -> String {
    while base.ends_with('/') {
        base.pop();
    }
    base
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    mm_processor_kwargs: ProcessorKwargs,
    guided_json: &'a Value,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: MessageContent<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    VideoUrl { video_url: MediaUrl },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct MediaUrl {
    url: String,
}

#[derive(Serialize)]
struct ProcessorKwargs {
    fps: [u32; 1],
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}
