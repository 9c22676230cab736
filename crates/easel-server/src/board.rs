//! An in-memory board that stands in for the real canvas service, so the
//! server has tools to offer out of the box.
use easel::errors::AgentError;
use easel::models::tool::Tool;
use easel::tool::{ToolOutput, ToolRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub id: String,
    pub kind: String,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddShapeArgs {
    kind: String,
    x: f64,
    y: f64,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RenameArgs {
    name: String,
}

#[derive(Debug, Default)]
struct BoardState {
    name: String,
    shapes: Vec<Shape>,
    next_id: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Board {
    state: Arc<Mutex<BoardState>>,
}

fn parse<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, AgentError> {
    serde_json::from_value(arguments).map_err(|e| AgentError::InvalidParameters(e.to_string()))
}

impl Board {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            state: Arc::new(Mutex::new(BoardState {
                name: name.into(),
                ..BoardState::default()
            })),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BoardState>, AgentError> {
        self.state
            .lock()
            .map_err(|_| AgentError::Internal("board state poisoned".to_string()))
    }

    pub fn add_shape(&self, arguments: Value) -> Result<Value, AgentError> {
        let args: AddShapeArgs = parse(arguments)?;
        let mut state = self.lock()?;
        state.next_id += 1;
        let shape = Shape {
            id: format!("shape-{}", state.next_id),
            kind: args.kind,
            x: args.x,
            y: args.y,
            text: args.text,
        };
        let id = shape.id.clone();
        state.shapes.push(shape);
        Ok(json!({ "id": id }))
    }

    pub fn list_shapes(&self) -> Result<Value, AgentError> {
        let state = self.lock()?;
        Ok(json!({ "name": state.name, "shapes": state.shapes }))
    }

    pub fn rename(&self, arguments: Value) -> Result<Value, AgentError> {
        let args: RenameArgs = parse(arguments)?;
        if args.name.trim().is_empty() {
            return Err(AgentError::InvalidParameters(
                "name must not be empty".to_string(),
            ));
        }
        let mut state = self.lock()?;
        let previous = std::mem::replace(&mut state.name, args.name);
        Ok(json!({ "previous": previous, "name": state.name }))
    }

    /// Register this board's tools
    pub fn register(&self, registry: &mut ToolRegistry) {
        let board = self.clone();
        registry.register_fn(
            Tool::new(
                "addShape",
                "Add a shape to the board and return its id",
                json!({
                    "type": "object",
                    "required": ["kind", "x", "y"],
                    "properties": {
                        "kind": {"type": "string", "enum": ["rectangle", "ellipse", "sticky", "arrow"]},
                        "x": {"type": "number"},
                        "y": {"type": "number"},
                        "text": {"type": "string"}
                    }
                }),
            ),
            move |arguments, _| {
                let result = board.add_shape(arguments);
                async move { result.map(ToolOutput::new) }
            },
        );

        let board = self.clone();
        registry.register_fn(
            Tool::new(
                "listShapes",
                "List every shape on the board",
                json!({"type": "object", "properties": {}}),
            ),
            move |_, _| {
                let result = board.list_shapes();
                async move { result.map(ToolOutput::new) }
            },
        );

        let board = self.clone();
        registry.register_fn(
            Tool::new(
                "renameBoard",
                "Rename the board",
                json!({
                    "type": "object",
                    "required": ["name"],
                    "properties": {"name": {"type": "string"}}
                }),
            ),
            move |arguments, _| {
                let result = board.rename(arguments);
                async move { result.map(ToolOutput::new) }
            },
        );
    }
}
