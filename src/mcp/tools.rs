//! Tool definitions for the `tools/list` and `tools/call` endpoints.

use serde::{Deserialize, Serialize};
use serde_json::json;

pub const GENERATE_IMAGE: &str = "generate_image";
pub const UNLOAD_MODEL: &str = "unload_model";
pub const GET_STATUS: &str = "get_status";
pub const SET_TIMEOUT: &str = "set_timeout";
pub const SWITCH_MODEL: &str = "switch_model";

/// MCP tool definition: name, description, and a JSON Schema for the input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// All tools exposed by the server.
pub fn get_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            GENERATE_IMAGE,
            "Generate an image from a text prompt with the FLUX diffusion model. \
             The image is saved to the configured output directory alongside a JSON \
             sidecar recording the exact parameters for reproducibility.",
            json!({
                "type": "object",
                "properties": {
                    "prompt": {
                        "type": "string",
                        "description": "Text description of the image to generate"
                    },
                    "steps": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": 100,
                        "description": "Number of inference steps (default: per-model smart default)"
                    },
                    "guidance_scale": {
                        "type": "number",
                        "minimum": 0,
                        "maximum": 30,
                        "description": "Guidance scale (default: per-model smart default)"
                    },
                    "width": {
                        "type": "integer",
                        "default": 1024,
                        "description": "Image width in pixels (multiple of 8, 256-2048)"
                    },
                    "height": {
                        "type": "integer",
                        "default": 1024,
                        "description": "Image height in pixels (multiple of 8, 256-2048)"
                    },
                    "seed": {
                        "type": "integer",
                        "description": "Random seed for reproducibility (random if not provided)"
                    }
                },
                "required": ["prompt"]
            }),
        ),
        ToolDefinition::new(
            UNLOAD_MODEL,
            "Immediately unload the diffusion pipeline from GPU memory. The model is \
             reloaded automatically on the next generation request.",
            json!({
                "type": "object",
                "properties": {}
            }),
        ),
        ToolDefinition::new(
            GET_STATUS,
            "Report whether the pipeline is loaded, which model and offload tier are \
             active, time until auto-unload, and current VRAM usage.",
            json!({
                "type": "object",
                "properties": {}
            }),
        ),
        ToolDefinition::new(
            SET_TIMEOUT,
            "Set the auto-unload timeout. The pipeline is released after this many \
             seconds of inactivity. 0 disables auto-unload.",
            json!({
                "type": "object",
                "properties": {
                    "timeout_seconds": {
                        "type": "integer",
                        "minimum": 0,
                        "description": "Timeout in seconds (0 to disable auto-unload)"
                    }
                },
                "required": ["timeout_seconds"]
            }),
        ),
        ToolDefinition::new(
            SWITCH_MODEL,
            "Select a different model. The current pipeline is released immediately; \
             the new model loads lazily on the next generation request. Accepts a \
             preset name (flux1-dev, flux2-dev) or a full model id.",
            json!({
                "type": "object",
                "properties": {
                    "model": {
                        "type": "string",
                        "description": "Model preset name or full model id"
                    }
                },
                "required": ["model"]
            }),
        ),
    ]
}
