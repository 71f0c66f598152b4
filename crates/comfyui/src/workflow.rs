//! Workflow template loading and parameter injection.
//!
//! A template file wraps a ComfyUI API-format graph together with a slot
//! map that says where each job parameter goes:
//!
//! ```json
//! {
//!   "version": 1,
//!   "slots": {
//!     "prompt": { "node": "6",  "index": 0 },
//!     "image":  { "node": "10", "index": 0 },
//!     "width":  { "node": "12", "index": 0 },
//!     "height": { "node": "12", "index": 1 },
//!     "frames": { "node": "12", "index": 2 },
//!     "fps":    { "node": "20", "index": 0 },
//!     "seed":   { "node": "3",  "index": 0 }
//!   },
//!   "graph": { "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "", "clip": ["4", 1] } } }
//! }
//! ```
//!
//! `index` is the position of the parameter within the node's ordered
//! `inputs`, not its name. The whole map is checked against the graph when
//! the template is loaded, so a drifted template is rejected up front
//! instead of overwriting an unrelated input at submission time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use im2vid_core::params::JobParams;
use serde::Deserialize;
use serde_json::Value;

/// Template format version understood by this parameterizer.
pub const TEMPLATE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The template does not have the shape the parameterizer expects.
///
/// Always a configuration problem; jobs failing with it are not retried.
#[derive(Debug, thiserror::Error)]
pub enum TemplateShapeError {
    #[error("cannot read workflow template {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("workflow template is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported workflow template version {found} (expected {})", TEMPLATE_VERSION)]
    UnsupportedVersion { found: u32 },

    #[error("required slot '{slot}' is not mapped")]
    MissingRequiredSlot { slot: &'static str },

    #[error("slot '{slot}' points at node '{node}', which is not in the graph")]
    MissingNode { slot: String, node: String },

    #[error("node '{node}' has no inputs object")]
    MissingInputs { node: String },

    #[error("slot '{slot}' uses index {index} but node '{node}' has only {len} inputs")]
    SlotOutOfRange {
        slot: String,
        node: String,
        index: usize,
        len: usize,
    },

    #[error("slot '{slot}' maps to input '{input}' of node '{node}', expected {expected}, found {found}")]
    TypeMismatch {
        slot: String,
        node: String,
        input: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("unknown slot '{0}'")]
    UnknownSlot(String),
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

/// Location of one overridable parameter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SlotRef {
    pub node: String,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Text,
    Integer,
    Number,
}

impl SlotKind {
    fn name(self) -> &'static str {
        match self {
            Self::Text => "string",
            Self::Integer => "integer",
            Self::Number => "number",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Text => value.is_string(),
            Self::Integer => value.is_u64() || value.is_i64(),
            Self::Number => value.is_number(),
        }
    }
}

/// Known slots: name, expected value kind, required.
const SLOTS: &[(&str, SlotKind, bool)] = &[
    ("prompt", SlotKind::Text, true),
    ("seed", SlotKind::Integer, true),
    ("width", SlotKind::Integer, true),
    ("height", SlotKind::Integer, true),
    ("frames", SlotKind::Integer, true),
    ("fps", SlotKind::Number, false),
    ("image", SlotKind::Text, false),
];

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "link",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TemplateFile {
    version: u32,
    slots: BTreeMap<String, SlotRef>,
    graph: serde_json::Map<String, Value>,
}

/// A validated workflow template.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    slots: BTreeMap<String, SlotRef>,
    graph: serde_json::Map<String, Value>,
}

impl WorkflowTemplate {
    /// Read and validate a template file.
    pub async fn load(path: &Path) -> Result<Self, TemplateShapeError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| TemplateShapeError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let value: Value = serde_json::from_slice(&bytes)?;
        Self::from_value(value)
    }

    /// Validate an in-memory template document.
    pub fn from_value(value: Value) -> Result<Self, TemplateShapeError> {
        let file: TemplateFile = serde_json::from_value(value)?;
        if file.version != TEMPLATE_VERSION {
            return Err(TemplateShapeError::UnsupportedVersion {
                found: file.version,
            });
        }

        let template = Self {
            slots: file.slots,
            graph: file.graph,
        };
        template.validate()?;
        Ok(template)
    }

    pub fn has_slot(&self, slot: &str) -> bool {
        self.slots.contains_key(slot)
    }

    /// The unmodified graph.
    pub fn graph(&self) -> &serde_json::Map<String, Value> {
        &self.graph
    }

    fn validate(&self) -> Result<(), TemplateShapeError> {
        for (name, _, required) in SLOTS {
            if *required && !self.slots.contains_key(*name) {
                return Err(TemplateShapeError::MissingRequiredSlot { slot: *name });
            }
        }

        for (name, slot) in &self.slots {
            let kind = SLOTS
                .iter()
                .find(|(known, _, _)| *known == name.as_str())
                .map(|(_, kind, _)| *kind)
                .ok_or_else(|| TemplateShapeError::UnknownSlot(name.clone()))?;

            let (input, current) = locate(&self.graph, name, slot)?;
            if !kind.accepts(current) {
                return Err(TemplateShapeError::TypeMismatch {
                    slot: name.clone(),
                    node: slot.node.clone(),
                    input: input.to_string(),
                    expected: kind.name(),
                    found: value_kind(current),
                });
            }
        }
        Ok(())
    }

    /// Return a copy of the graph with the job's values injected.
    ///
    /// `image` is the backend-side name of the uploaded input; it is only
    /// written when the template maps an image slot.
    pub fn parameterize(
        &self,
        prompt: &str,
        params: &JobParams,
        image: Option<&str>,
    ) -> Result<Value, TemplateShapeError> {
        let mut graph = self.graph.clone();

        self.set(&mut graph, "prompt", Value::from(prompt))?;
        self.set(&mut graph, "seed", Value::from(params.seed))?;
        self.set(&mut graph, "width", Value::from(params.resolution.width))?;
        self.set(&mut graph, "height", Value::from(params.resolution.height))?;
        self.set(&mut graph, "frames", Value::from(params.frame_count()))?;
        if self.has_slot("fps") {
            self.set(&mut graph, "fps", Value::from(params.fps))?;
        }
        if let (Some(image), true) = (image, self.has_slot("image")) {
            self.set(&mut graph, "image", Value::from(image))?;
        }

        Ok(Value::Object(graph))
    }

    fn set(
        &self,
        graph: &mut serde_json::Map<String, Value>,
        name: &str,
        value: Value,
    ) -> Result<(), TemplateShapeError> {
        let slot = self
            .slots
            .get(name)
            .ok_or_else(|| TemplateShapeError::UnknownSlot(name.to_string()))?;
        let node = slot.node.clone();
        let inputs = graph
            .get_mut(&slot.node)
            .ok_or_else(|| TemplateShapeError::MissingNode {
                slot: name.to_string(),
                node: node.clone(),
            })?
            .get_mut("inputs")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| TemplateShapeError::MissingInputs { node: node.clone() })?;
        let len = inputs.len();
        let target = inputs
            .values_mut()
            .nth(slot.index)
            .ok_or_else(|| TemplateShapeError::SlotOutOfRange {
                slot: name.to_string(),
                node,
                index: slot.index,
                len,
            })?;
        *target = value;
        Ok(())
    }
}

/// Find the input a slot refers to; returns its name and current value.
fn locate<'a>(
    graph: &'a serde_json::Map<String, Value>,
    name: &str,
    slot: &SlotRef,
) -> Result<(&'a str, &'a Value), TemplateShapeError> {
    let node = graph
        .get(&slot.node)
        .ok_or_else(|| TemplateShapeError::MissingNode {
            slot: name.to_string(),
            node: slot.node.clone(),
        })?;
    let inputs = node
        .get("inputs")
        .and_then(Value::as_object)
        .ok_or_else(|| TemplateShapeError::MissingInputs {
            node: slot.node.clone(),
        })?;
    inputs
        .iter()
        .nth(slot.index)
        .map(|(k, v)| (k.as_str(), v))
        .ok_or_else(|| TemplateShapeError::SlotOutOfRange {
            slot: name.to_string(),
            node: slot.node.clone(),
            index: slot.index,
            len: inputs.len(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
