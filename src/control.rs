//! Instruction routing for the remote control channel.
//!
//! Every instruction received is answered with exactly one [`InstructionAck`],
//! including instruction types nobody registered a handler for.

use crate::config::{PipelineConfig, SharedConfig};
use crate::observability::logging::PipelineLog;
use crate::processor::EventProcessor;
use crate::runtime::queue::EventQueue;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const MODULE: &str = "epu_ingest::control";

/// Instruction pushed by the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub instruction_id: String,
    pub instruction_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl Instruction {
    pub fn new(
        instruction_id: impl Into<String>,
        instruction_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            instruction_id: instruction_id.into(),
            instruction_type: instruction_type.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Processed,
    Failed,
}

/// Answer sent back for every instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionAck {
    pub instruction_id: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub processing_time_ms: u64,
}

/// Transport errors reported by a [`ControlChannel`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlChannelError {
    #[error("control channel connect failed: {0}")]
    Connect(String),
    #[error("control channel disconnected: {0}")]
    Disconnected(String),
    /// Remote side ended the stream; the worker stops without reconnecting.
    #[error("control channel closed")]
    Closed,
}

/// Bidirectional instruction stream. Implementations own the wire protocol.
pub trait ControlChannel: Send {
    fn connect(&mut self) -> Result<(), ControlChannelError>;

    /// Waits at most `timeout` for the next instruction.
    fn next_instruction(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Instruction>, ControlChannelError>;

    fn acknowledge(&mut self, ack: InstructionAck) -> Result<(), ControlChannelError>;
}

/// Components an instruction handler may inspect or mutate.
#[derive(Clone)]
pub struct ControlContext {
    pub processor: Arc<EventProcessor>,
    pub queue: EventQueue,
    pub config: SharedConfig,
}

impl ControlContext {
    /// Pushes the hot knobs of `config` into the running components.
    pub fn apply_config(&self, config: &PipelineConfig) {
        self.processor
            .error_handler()
            .set_policy(config.retry_policy());
        self.processor.log().set_level(config.logging.level);
        self.processor.set_options(config.processor_options());
    }
}

pub type InstructionHandler =
    Box<dyn Fn(&ControlContext, &Value) -> anyhow::Result<Value> + Send + Sync>;

/// Dispatches instructions by `instruction_type`.
pub struct InstructionRouter {
    context: ControlContext,
    log: PipelineLog,
    handlers: BTreeMap<String, InstructionHandler>,
}

impl InstructionRouter {
    /// Router with the built-in `status`, `reset_stats`, `recover_evicted`,
    /// `sweep_orphans` and `update_config` handlers.
    pub fn new(context: ControlContext) -> Self {
        let log = context.processor.log().clone();
        let mut router = Self {
            context,
            log,
            handlers: BTreeMap::new(),
        };
        router.register("status", |ctx, _| {
            let snapshot = ctx.processor.status_snapshot(Some(ctx.queue.telemetry()));
            Ok(serde_json::to_value(snapshot)?)
        });
        router.register("reset_stats", |ctx, _| {
            ctx.processor.reset_stats();
            Ok(json!({ "reset": true }))
        });
        router.register("recover_evicted", |ctx, _| {
            let recovered = ctx.queue.recover_evicted_events();
            Ok(json!({ "recovered": recovered }))
        });
        router.register("sweep_orphans", |ctx, payload| {
            let max_age = match payload.get("max_age_seconds") {
                None | Some(Value::Null) => ctx.config.snapshot().orphan_timeout(),
                Some(value) => {
                    let seconds = value.as_u64().ok_or_else(|| {
                        anyhow::anyhow!("max_age_seconds must be a non-negative integer")
                    })?;
                    Duration::from_secs(seconds)
                }
            };
            let expired = ctx.processor.expire_orphans(max_age);
            Ok(json!({ "timed_out": expired.len() }))
        });
        router.register("update_config", |ctx, payload| {
            let (changed, config) = ctx.config.patch(payload)?;
            ctx.apply_config(&config);
            Ok(json!({ "changed": changed }))
        });
        router
    }

    /// Adds or replaces the handler for `instruction_type`.
    pub fn register<F>(&mut self, instruction_type: impl Into<String>, handler: F)
    where
        F: Fn(&ControlContext, &Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.handlers
            .insert(instruction_type.into(), Box::new(handler));
    }

    pub fn instruction_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn context(&self) -> &ControlContext {
        &self.context
    }

    pub fn handle(&self, instruction: &Instruction) -> InstructionAck {
        let started = Instant::now();
        let outcome = match self.handlers.get(&instruction.instruction_type) {
            Some(handler) => handler(&self.context, &instruction.payload),
            None => {
                self.log.warn(
                    MODULE,
                    None,
                    &format!(
                        "no handler for instruction type '{}' ({})",
                        instruction.instruction_type, instruction.instruction_id
                    ),
                );
                Ok(json!({ "handled": false }))
            }
        };
        let processing_time_ms = elapsed_ms(started);
        match outcome {
            Ok(result) => InstructionAck {
                instruction_id: instruction.instruction_id.clone(),
                status: AckStatus::Processed,
                result: Some(result),
                error_message: None,
                processing_time_ms,
            },
            Err(err) => {
                let message = format!("{err:#}");
                self.log.error(
                    MODULE,
                    None,
                    &format!(
                        "instruction {} ({}) failed: {message}",
                        instruction.instruction_id, instruction.instruction_type
                    ),
                );
                InstructionAck {
                    instruction_id: instruction.instruction_id.clone(),
                    status: AckStatus::Failed,
                    result: None,
                    error_message: Some(message),
                    processing_time_ms,
                }
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}
