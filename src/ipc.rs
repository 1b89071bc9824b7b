//! Wire protocol between the server and the sidecar render worker.
//!
//! JSON Lines (one JSON object per line) over stdin/stdout pipes. Image
//! bytes travel base64-encoded inside the JSON payload.

use serde::{Deserialize, Serialize};

/// Request sent to the worker via stdin.
#[derive(Serialize, Deserialize, Debug)]
pub struct WorkerRequest {
    /// Monotonic request ID for correlating responses.
    pub id: u64,
    pub command: WorkerCommand,
}

/// Commands the server can send to the worker.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum WorkerCommand {
    /// Construct the diffusion pipeline for a model.
    LoadPipeline {
        model_id: String,
        device: String,
        tier: String,
        reduced_precision: bool,
        attention_slicing: bool,
        sequential_offload: bool,
        cache_dir: Option<String>,
    },
    /// Render one image with fully-resolved parameters.
    Render {
        prompt: String,
        steps: u32,
        guidance: f32,
        width: u32,
        height: u32,
        seed: u64,
    },
    /// Health check.
    Ping,
    /// Graceful shutdown.
    Shutdown,
}

/// Response sent from the worker via stdout.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerReply {
    /// Matches the request ID.
    pub id: u64,
    pub payload: WorkerPayload,
}

/// Response payloads from the worker.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum WorkerPayload {
    PipelineLoaded {
        model_id: String,
        load_seconds: f64,
    },
    RenderComplete {
        /// Base64-encoded PNG bytes.
        image_b64: String,
        render_seconds: f64,
    },
    Pong,
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_command_round_trips() {
        let req = WorkerRequest {
            id: 7,
            command: WorkerCommand::LoadPipeline {
                model_id: "black-forest-labs/FLUX.2-dev".to_string(),
                device: "cuda".to_string(),
                tier: "balanced-offload".to_string(),
                reduced_precision: true,
                attention_slicing: true,
                sequential_offload: false,
                cache_dir: None,
            },
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"LoadPipeline\""));
        let back: WorkerRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 7);
        match back.command {
            WorkerCommand::LoadPipeline { model_id, .. } => {
                assert_eq!(model_id, "black-forest-labs/FLUX.2-dev");
            }
            other => panic!("wrong command: {other:?}"),
        }
    }

    #[test]
    fn render_reply_round_trips() {
        let reply = WorkerReply {
            id: 3,
            payload: WorkerPayload::RenderComplete {
                image_b64: "aGVsbG8=".to_string(),
                render_seconds: 12.5,
            },
        };
        let json = serde_json::to_string(&reply).unwrap();
        let back: WorkerReply = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 3);
        match back.payload {
            WorkerPayload::RenderComplete { render_seconds, .. } => {
                assert!((render_seconds - 12.5).abs() < f64::EPSILON);
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[test]
    fn error_payload_parses_from_raw_json() {
        let raw = r#"{"id":9,"payload":{"type":"Error","message":"CUDA out of memory"}}"#;
        let reply: WorkerReply = serde_json::from_str(raw).unwrap();
        match reply.payload {
            WorkerPayload::Error { message } => assert!(message.contains("out of memory")),
            other => panic!("wrong payload: {other:?}"),
        }
    }
}
