//! Tool dispatch for the MCP server.
//!
//! Tool-level failures are reported as tool results with `isError` set, not
//! as JSON-RPC errors: the caller asked a well-formed question and deserves
//! a structured answer. JSON-RPC errors are reserved for protocol problems.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::generator::FluxGenerator;
use crate::models::{GenerateRequest, GeneratorStatus};
use crate::{artifact, log_error, log_info};

use super::protocol::{error_codes, methods, JsonRpcRequest, JsonRpcResponse};
use super::tools;

pub const SERVER_NAME: &str = "flux-gen";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub struct Handlers {
    generator: Arc<FluxGenerator>,
}

impl Handlers {
    pub fn new(generator: Arc<FluxGenerator>) -> Self {
        Handlers { generator }
    }

    pub async fn dispatch(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        match request.method.as_str() {
            methods::INITIALIZE => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": SERVER_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            ),
            methods::INITIALIZED => JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: None,
                result: None,
                error: None,
            },
            methods::PING => JsonRpcResponse::success(id, json!({})),
            methods::SHUTDOWN => {
                log_info!("Shutdown requested");
                JsonRpcResponse::success(id, Value::Null)
            }
            methods::TOOLS_LIST => JsonRpcResponse::success(
                id,
                json!({ "tools": tools::get_tool_definitions() }),
            ),
            methods::TOOLS_CALL => self.handle_tool_call(id, request.params).await,
            other => JsonRpcResponse::error(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        }
    }

    async fn handle_tool_call(
        &self,
        id: Option<super::protocol::JsonRpcId>,
        params: Option<Value>,
    ) -> JsonRpcResponse {
        let params = match params {
            Some(p) => p,
            None => {
                return JsonRpcResponse::error(
                    id,
                    error_codes::INVALID_PARAMS,
                    "tools/call requires params",
                )
            }
        };
        let name = match params.get("name").and_then(Value::as_str) {
            Some(n) => n.to_string(),
            None => {
                return JsonRpcResponse::error(
                    id,
                    error_codes::INVALID_PARAMS,
                    "tools/call requires a tool name",
                )
            }
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let result = match name.as_str() {
            tools::GENERATE_IMAGE => self.generate_image(arguments).await,
            tools::UNLOAD_MODEL => self.unload_model(),
            tools::GET_STATUS => self.get_status(),
            tools::SET_TIMEOUT => self.set_timeout(&arguments),
            tools::SWITCH_MODEL => self.switch_model(&arguments),
            other => tool_error(format!("Unknown tool '{other}'")),
        };

        JsonRpcResponse::success(id, result)
    }

    async fn generate_image(&self, args: Value) -> Value {
        let prompt = match args.get("prompt").and_then(Value::as_str) {
            Some(p) => p.to_string(),
            None => return tool_error("'prompt' is required"),
        };

        let mut request = GenerateRequest::new(prompt);
        if let Some(steps) = args.get("steps") {
            match steps.as_u64() {
                Some(s) => request.steps = Some(s as u32),
                None => return tool_error("'steps' must be a non-negative integer"),
            }
        }
        if let Some(guidance) = args.get("guidance_scale") {
            match guidance.as_f64() {
                Some(g) => request.guidance = Some(g as f32),
                None => return tool_error("'guidance_scale' must be a number"),
            }
        }
        if let Some(width) = args.get("width") {
            match width.as_u64() {
                Some(w) => request.width = w as u32,
                None => return tool_error("'width' must be a non-negative integer"),
            }
        }
        if let Some(height) = args.get("height") {
            match height.as_u64() {
                Some(h) => request.height = h as u32,
                None => return tool_error("'height' must be a non-negative integer"),
            }
        }
        if let Some(seed) = args.get("seed") {
            match seed.as_u64() {
                Some(s) => request.seed = Some(s),
                None => return tool_error("'seed' must be a non-negative integer"),
            }
        }

        // Renders take minutes; keep the async loop free for status queries.
        let generator = self.generator.clone();
        let outcome = tokio::task::spawn_blocking(move || generator.generate(request)).await;

        let outcome = match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                log_error!("generate_image failed: {e}");
                return tool_error(e.to_string());
            }
            Err(e) => {
                log_error!("generate_image task panicked: {e}");
                return tool_error(format!("generation task failed: {e}"));
            }
        };

        let text = format!(
            "Image generated successfully.\n\n\
             Image: {}\n\
             Sidecar: {}\n\
             Seed: {}\n\
             Settings:\n\
             - Steps: {}\n\
             - Guidance scale: {}\n\
             - Resolution: {}x{}\n\
             - Model: {}\n\
             - Generation time: {:.2}s\n\n\
             Use the same seed to reproduce this image.",
            outcome.image_path.display(),
            outcome.sidecar_path.display(),
            outcome.seed,
            outcome.steps,
            outcome.guidance,
            outcome.width,
            outcome.height,
            outcome.model,
            outcome.duration_seconds,
        );

        let mut content = vec![json!({ "type": "text", "text": text })];

        // Attach a 512px preview so clients can show the result instantly.
        match std::fs::read(&outcome.image_path)
            .map_err(crate::error::GenerateError::from)
            .and_then(|bytes| artifact::thumbnail_base64(&bytes))
        {
            Ok(thumb) => content.push(json!({
                "type": "image",
                "data": thumb,
                "mimeType": "image/png",
            })),
            Err(e) => log_error!("thumbnail generation failed: {e}"),
        }

        json!({ "content": content, "isError": false })
    }

    fn unload_model(&self) -> Value {
        self.generator.unload();
        tool_text("Pipeline unloaded. GPU memory freed.")
    }

    fn get_status(&self) -> Value {
        let status = self.generator.status();
        tool_text(format_status(&status))
    }

    fn set_timeout(&self, args: &Value) -> Value {
        let seconds = match args.get("timeout_seconds").and_then(Value::as_u64) {
            Some(s) => s,
            None => return tool_error("'timeout_seconds' must be a non-negative integer"),
        };

        let previous = self.generator.set_timeout(seconds);
        let text = if seconds == 0 {
            format!("Auto-unload disabled (was {previous}s). The pipeline stays loaded until unloaded explicitly.")
        } else {
            format!("Auto-unload timeout set to {seconds}s (was {previous}s).")
        };
        tool_text(text)
    }

    fn switch_model(&self, args: &Value) -> Value {
        let model = match args.get("model").and_then(Value::as_str) {
            Some(m) => m,
            None => return tool_error("'model' is required"),
        };

        self.generator.switch_model(model);
        let status = self.generator.status();
        tool_text(format!(
            "Switched to {}. The pipeline will load on the next generation request.",
            status.next_model
        ))
    }
}

fn format_status(status: &GeneratorStatus) -> String {
    let mut lines = Vec::new();
    if status.loaded {
        lines.push("Pipeline status: LOADED".to_string());
        if let Some(ref model) = status.model {
            lines.push(format!("Model: {model}"));
        }
        if let Some(ref strategy) = status.strategy {
            lines.push(format!(
                "Offload tier: {} (device: {:?}, reduced precision: {})",
                strategy.tier.as_str(),
                strategy.device,
                strategy.reduced_precision
            ));
        }
        match status.seconds_until_unload {
            Some(secs) => lines.push(format!("Time until auto-unload: {secs:.1}s")),
            None => lines.push("Auto-unload: disabled".to_string()),
        }
        if let Some(last) = status.last_access_unix {
            lines.push(format!("Last access (unix): {last}"));
        }
    } else {
        lines.push("Pipeline status: NOT LOADED".to_string());
        lines.push(format!(
            "Next model: {} (loads automatically on the next generation request)",
            status.next_model
        ));
    }
    lines.push(format!("Auto-unload timeout: {}s", status.timeout_seconds));
    if let (Some(used), Some(total)) = (status.vram_used_gb, status.vram_total_gb) {
        lines.push(format!("VRAM: {used:.2} / {total:.2} GB"));
    }
    lines.join("\n")
}

fn tool_text(text: impl Into<String>) -> Value {
    json!({
        "content": [{ "type": "text", "text": text.into() }],
        "isError": false,
    })
}

fn tool_error(message: impl Into<String>) -> Value {
    json!({
        "content": [{ "type": "text", "text": format!("Error: {}", message.into()) }],
        "isError": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{FluxGenerator, GeneratorOptions, ProbeFn};
    use crate::mcp::protocol::JsonRpcId;
    use crate::pipeline_mock::MockPipeline;
    use crate::strategy::TierThresholds;
    use std::time::Duration;

    fn test_handlers(tag: &str) -> Handlers {
        let dir = std::env::temp_dir().join(format!("flux_gen_mcp_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let options = GeneratorOptions {
            model_id: "black-forest-labs/FLUX.2-dev".to_string(),
            idle_timeout: Duration::from_secs(300),
            auto_unload: false,
            output_dir: dir,
            default_steps: 50,
            default_guidance: 7.5,
            thresholds: TierThresholds::default(),
        };
        let probe: ProbeFn = Arc::new(|| Some(24.0));
        let generator = Arc::new(FluxGenerator::with_probe(
            Arc::new(MockPipeline::new()),
            options,
            probe,
        ));
        Handlers::new(generator)
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(JsonRpcId::Number(1)),
            method: method.to_string(),
            params: Some(params),
        }
    }

    #[tokio::test]
    async fn initialize_reports_tools_capability() {
        let handlers = test_handlers("init");
        let resp = handlers.dispatch(request(methods::INITIALIZE, json!({}))).await;
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert!(result["capabilities"]["tools"].is_object());
        assert_eq!(result["serverInfo"]["name"], SERVER_NAME);
    }

    #[tokio::test]
    async fn tools_list_returns_all_tools() {
        let handlers = test_handlers("list");
        let resp = handlers.dispatch(request(methods::TOOLS_LIST, json!({}))).await;
        let tools = resp.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 5);
    }

    #[tokio::test]
    async fn unknown_method_is_a_json_rpc_error() {
        let handlers = test_handlers("unknown");
        let resp = handlers.dispatch(request("bogus/method", json!({}))).await;
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_tool_error_not_a_protocol_error() {
        let handlers = test_handlers("unknown_tool");
        let resp = handlers
            .dispatch(request(
                methods::TOOLS_CALL,
                json!({"name": "bogus_tool", "arguments": {}}),
            ))
            .await;
        assert!(resp.error.is_none());
        assert_eq!(resp.result.unwrap()["isError"], true);
    }

    #[tokio::test]
    async fn generate_image_round_trip() {
        let handlers = test_handlers("generate");
        let resp = handlers
            .dispatch(request(
                methods::TOOLS_CALL,
                json!({
                    "name": tools::GENERATE_IMAGE,
                    "arguments": {
                        "prompt": "a lighthouse at dusk",
                        "width": 256,
                        "height": 256,
                        "steps": 4,
                        "seed": 42
                    }
                }),
            ))
            .await;

        let result = resp.result.unwrap();
        assert_eq!(result["isError"], false);
        let content = result["content"].as_array().unwrap();
        let text = content[0]["text"].as_str().unwrap();
        assert!(text.contains("Seed: 42"));
        assert!(text.contains("256x256"));
        // Thumbnail attached as a second content block.
        assert_eq!(content[1]["type"], "image");
        assert_eq!(content[1]["mimeType"], "image/png");
    }

    #[tokio::test]
    async fn generate_image_rejects_bad_dimensions() {
        let handlers = test_handlers("baddims");
        let resp = handlers
            .dispatch(request(
                methods::TOOLS_CALL,
                json!({
                    "name": tools::GENERATE_IMAGE,
                    "arguments": { "prompt": "x", "width": 1023 }
                }),
            ))
            .await;

        let result = resp.result.unwrap();
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("multiple of 8"));
    }

    #[tokio::test]
    async fn set_timeout_reports_previous_value() {
        let handlers = test_handlers("timeout");
        let resp = handlers
            .dispatch(request(
                methods::TOOLS_CALL,
                json!({
                    "name": tools::SET_TIMEOUT,
                    "arguments": { "timeout_seconds": 0 }
                }),
            ))
            .await;

        let result = resp.result.unwrap();
        assert_eq!(result["isError"], false);
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("disabled"));
        assert!(text.contains("300"));
    }

    #[tokio::test]
    async fn switch_model_resolves_presets() {
        let handlers = test_handlers("switch");
        let resp = handlers
            .dispatch(request(
                methods::TOOLS_CALL,
                json!({
                    "name": tools::SWITCH_MODEL,
                    "arguments": { "model": "flux1-dev" }
                }),
            ))
            .await;

        let result = resp.result.unwrap();
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("black-forest-labs/FLUX.1-dev"));
    }

    #[tokio::test]
    async fn status_reports_not_loaded_initially() {
        let handlers = test_handlers("status");
        let resp = handlers
            .dispatch(request(
                methods::TOOLS_CALL,
                json!({"name": tools::GET_STATUS, "arguments": {}}),
            ))
            .await;

        let text_value = resp.result.unwrap();
        let text = text_value["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("NOT LOADED"));
        assert!(text.contains("black-forest-labs/FLUX.2-dev"));
    }
}
