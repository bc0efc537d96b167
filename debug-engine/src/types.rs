// Core type definitions
//
// Identifiers and value types shared across the engine

use serde::{Deserialize, Serialize};

// Thread and frame identifiers are opaque 8-byte handles assigned by the target
pub type ObjectId = u64;
pub type ThreadId = ObjectId;
pub type FrameId = u64;

/// Identifier of an event request registered with the target
pub type RequestId = i32;

// Location identifies an executable code position in the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub class_id: u64,
    pub method_id: u64,
    pub index: u64, // code index (PC)
}

/// Resolved source position, as reported by the target's debug info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    pub file: String,
    pub line: u32,
}

impl SourcePosition {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

/// Suspend policy of an event request or event set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuspendPolicy {
    None,
    EventThread,
    All,
}

/// Requested stepping depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepDepth {
    Into,
    Over,
    Out,
}

/// Information about the method a thread is currently executing,
/// used by step filtering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub declaring_type: String,
    pub name: String,
    pub signature: String,
    pub is_synthetic: bool,
    pub is_constructor: bool,
    pub is_getter: bool,
    pub is_class_loading: bool,
}

/// A method to invoke in the target during evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCall {
    pub declaring_type: String,
    pub name: String,
    pub signature: String,
    /// Receiver object, or `None` for a static call
    pub receiver: Option<ObjectId>,
}

// Tagged value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Void,
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(ObjectId),
}

impl Value {
    /// Format value for display
    pub fn format(&self) -> String {
        match self {
            Value::Void => "(void)".to_string(),
            Value::Boolean(v) => format!("(boolean) {}", v),
            Value::Byte(v) => format!("(byte) {}", v),
            Value::Char(v) => format!("(char) '{}'", char::from_u32(*v as u32).unwrap_or('?')),
            Value::Short(v) => format!("(short) {}", v),
            Value::Int(v) => format!("(int) {}", v),
            Value::Long(v) => format!("(long) {}", v),
            Value::Float(v) => format!("(float) {}", v),
            Value::Double(v) => format!("(double) {}", v),
            Value::Object(id) => {
                if *id == 0 {
                    "(object) null".to_string()
                } else {
                    format!("(object) @{:x}", id)
                }
            }
        }
    }
}
