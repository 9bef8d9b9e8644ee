//! MCP tool surface served over stdio with `rmcp`.
//!
//! Each tool forwards its typed arguments to [`ToolDispatcher::handle`] on
//! the blocking pool, since every call ends up waiting on `osascript`.

use crate::dispatch::{
    ToolContent, ToolDispatcher, ToolResponse, ASK, CHECK_GENERATION_STATUS, GENERATE_IMAGE,
    GET_CONVERSATIONS, GET_LATEST_IMAGE, START_IMAGE_GENERATION,
};
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult, Content, Implementation, ProtocolVersion, ServerCapabilities, ServerInfo,
        Tool,
    },
    tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AskArgs {
    /// The prompt to send
    pub prompt: String,
    /// Title (or part of it) of an existing conversation to use
    pub conversation_ref: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct ConversationsArgs {
    /// Maximum number of titles to return (1-50, default 50)
    pub limit: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateImageArgs {
    /// Description of the image
    pub prompt: String,
    /// Style hint appended to the prompt
    pub style: Option<String>,
    /// Size hint appended to the prompt, e.g. 1024x1024
    pub size: Option<String>,
    /// Title (or part of it) of an existing conversation to use
    pub conversation_ref: Option<String>,
    /// Download the image when done (default true)
    pub download_image: Option<bool>,
    /// File name or path inside the download directory
    pub save_path: Option<String>,
    /// Sweep old downloads afterwards (default false)
    pub cleanup_after: Option<bool>,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartGenerationArgs {
    /// Description of the image
    pub prompt: String,
    /// Style hint appended to the prompt
    pub style: Option<String>,
    /// Size hint appended to the prompt, e.g. 1024x1024
    pub size: Option<String>,
    /// Title (or part of it) of an existing conversation to use
    pub conversation_ref: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct GenerationStatusArgs {
    /// Id returned by start_image_generation
    pub generation_id: String,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LatestImageArgs {
    /// File name or path inside the download directory
    pub save_path: Option<String>,
}

#[derive(Clone)]
pub struct ChatGptServer {
    dispatcher: Arc<ToolDispatcher>,
    tool_router: ToolRouter<Self>,
}

impl ChatGptServer {
    pub fn new(dispatcher: Arc<ToolDispatcher>) -> Self {
        Self {
            dispatcher,
            tool_router: Self::tool_router(),
        }
    }

    /// Tool listing with input schemas, as served on `tools/list`.
    pub fn catalogue() -> Vec<Tool> {
        Self::tool_router().list_all()
    }

    async fn call<A: Serialize>(
        &self,
        name: &'static str,
        args: A,
    ) -> Result<CallToolResult, McpError> {
        let args = serde_json::to_value(args)
            .map_err(|err| McpError::invalid_params(err.to_string(), None))?;
        debug!(tool = name, "tools/call");
        let dispatcher = Arc::clone(&self.dispatcher);
        let response = tokio::task::spawn_blocking(move || dispatcher.handle(name, &args))
            .await
            .map_err(|err| {
                warn!(tool = name, error = %err, "tool task aborted");
                McpError::internal_error(format!("{name} did not complete"), None)
            })?;
        Ok(into_call_result(response))
    }
}

fn into_call_result(response: ToolResponse) -> CallToolResult {
    let content = response
        .content
        .into_iter()
        .map(|item| match item {
            ToolContent::Text { text } => Content::text(text),
        })
        .collect();
    if response.is_error {
        CallToolResult::error(content)
    } else {
        CallToolResult::success(content)
    }
}

#[tool_router]
impl ChatGptServer {
    #[tool(description = "Send a prompt to the ChatGPT desktop app and return its reply")]
    async fn ask(&self, Parameters(args): Parameters<AskArgs>) -> Result<CallToolResult, McpError> {
        self.call(ASK, args).await
    }

    #[tool(description = "List conversation titles from the ChatGPT sidebar")]
    async fn get_conversations(
        &self,
        Parameters(args): Parameters<ConversationsArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call(GET_CONVERSATIONS, args).await
    }

    #[tool(
        description = "Generate an image with DALL-E in ChatGPT, wait for it, and optionally download it"
    )]
    async fn generate_image(
        &self,
        Parameters(args): Parameters<GenerateImageArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call(GENERATE_IMAGE, args).await
    }

    #[tool(
        description = "Start an image generation without waiting; returns a generation_id to poll"
    )]
    async fn start_image_generation(
        &self,
        Parameters(args): Parameters<StartGenerationArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call(START_IMAGE_GENERATION, args).await
    }

    #[tool(
        description = "Check the status of an image generation started with start_image_generation"
    )]
    async fn check_generation_status(
        &self,
        Parameters(args): Parameters<GenerationStatusArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call(CHECK_GENERATION_STATUS, args).await
    }

    #[tool(description = "Download the newest image in the open ChatGPT conversation")]
    async fn get_latest_image(
        &self,
        Parameters(args): Parameters<LatestImageArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.call(GET_LATEST_IMAGE, args).await
    }
}

#[tool_handler]
impl ServerHandler for ChatGptServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Drives the ChatGPT macOS desktop app. Use 'ask' for a text reply, \
                 'get_conversations' to list sidebar titles, 'generate_image' to generate and \
                 download in one call, or 'start_image_generation' followed by \
                 'check_generation_status' and 'get_latest_image' for long generations."
                    .into(),
            ),
        }
    }
}
