//! # Operation Task Envelope Codec
//!
//! Serializes application commands into transport-neutral envelopes
//! (stable type tag + JSON payload) and back through an explicit
//! tag → decoder registry. Tags are registered per command type, never
//! derived from Rust type paths, so the wire form survives refactors and
//! crosses process/version boundaries.

use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::errors::CodecError;
use crate::models::Resource;

/// Resource shape a command carries.
///
/// `Single` and `Multi` distinguish commands that address one resource per
/// task from batching commands that carry their whole resource list in a
/// single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResources {
    /// The command does not reference platform resources.
    None,
    /// One resource per task; `None` until the dispatcher binds it.
    Single(Option<Resource>),
    /// The command batches all of its resources into one task.
    Multi(Vec<Resource>),
}

impl CommandResources {
    /// Resources currently embedded in the command.
    pub fn to_vec(&self) -> Vec<Resource> {
        match self {
            Self::None => Vec::new(),
            Self::Single(resource) => resource.iter().cloned().collect(),
            Self::Multi(resources) => resources.clone(),
        }
    }

    /// Whether the command batches its resources into a single task.
    pub fn is_multi(&self) -> bool {
        matches!(self, Self::Multi(_))
    }
}

/// An application command that can travel inside a task envelope.
///
/// Implementations supply a stable tag and describe how resources and the
/// optional correlation id are embedded in the command body.
pub trait CoreCommand: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable wire discriminator, explicitly chosen (e.g.
    /// `"converge_machine"`), never a type path.
    fn type_tag() -> &'static str
    where
        Self: Sized;

    /// Correlation id for idempotent operation creation, when the caller
    /// supplied one.
    fn correlation_id(&self) -> Option<Uuid> {
        None
    }

    /// Resources embedded in the command body.
    fn resources(&self) -> CommandResources {
        CommandResources::None
    }

    /// Bind the fan-out resources for one dispatched task back onto the
    /// command. Single-resource commands take the first entry,
    /// multi-resource commands take the full set; resource-less commands
    /// ignore the call.
    fn bind_resources(&mut self, _resources: Vec<Resource>) {}
}

/// A decoded envelope: the command's facts without its concrete type.
///
/// The saga engine and routers work on this erased view; handlers that
/// need the typed command re-decode with [`CommandRegistry::decode_as`].
#[derive(Debug, Clone)]
pub struct DecodedCommand {
    pub type_tag: String,
    pub payload: Value,
    pub correlation_id: Option<Uuid>,
    pub resources: CommandResources,
}

type DecoderFn = Arc<dyn Fn(&Value) -> Result<DecodedCommand, CodecError> + Send + Sync>;

/// Explicit tag → decoder registry (one entry per registered command
/// type). Decoding is pure: no side effects beyond the returned value.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    decoders: Arc<DashMap<String, DecoderFn>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command type under its stable tag.
    pub fn register<C: CoreCommand>(&self) -> Result<(), CodecError> {
        let tag = C::type_tag();
        let decoder: DecoderFn = Arc::new(move |payload: &Value| {
            let command: C =
                serde_json::from_value(payload.clone()).map_err(|e| CodecError::MalformedPayload {
                    tag: tag.to_string(),
                    message: e.to_string(),
                })?;
            Ok(DecodedCommand {
                type_tag: tag.to_string(),
                payload: payload.clone(),
                correlation_id: command.correlation_id(),
                resources: command.resources(),
            })
        });

        if self.decoders.insert(tag.to_string(), decoder).is_some() {
            return Err(CodecError::DuplicateTag {
                tag: tag.to_string(),
            });
        }
        Ok(())
    }

    /// Encode a command into `(type tag, payload)`.
    pub fn encode<C: CoreCommand>(&self, command: &C) -> Result<(String, Value), CodecError> {
        let tag = C::type_tag();
        let payload = serde_json::to_value(command).map_err(|e| CodecError::EncodeFailed {
            tag: tag.to_string(),
            message: e.to_string(),
        })?;
        Ok((tag.to_string(), payload))
    }

    /// Decode an envelope payload into the erased command view.
    pub fn decode(&self, tag: &str, payload: &Value) -> Result<DecodedCommand, CodecError> {
        let decoder = self
            .decoders
            .get(tag)
            .ok_or_else(|| CodecError::UnknownCommandType {
                tag: tag.to_string(),
            })?;
        decoder(payload)
    }

    /// Decode an envelope payload into a concrete command type.
    pub fn decode_as<C: CoreCommand>(&self, tag: &str, payload: &Value) -> Result<C, CodecError> {
        if C::type_tag() != tag {
            return Err(CodecError::UnknownCommandType {
                tag: tag.to_string(),
            });
        }
        serde_json::from_value(payload.clone()).map_err(|e| CodecError::MalformedPayload {
            tag: tag.to_string(),
            message: e.to_string(),
        })
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tags: Vec<String> = self.decoders.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("CommandRegistry").field("tags", &tags).finish()
    }
}
