//! Admission validators for the hierarchical-namespace adjunct
//!
//! Each validator exposes a pure `validate_*` entry point over decoded
//! request data, so the rules are unit-testable without building full
//! admission requests.

pub mod namespace;
pub mod object;

pub use namespace::NamespaceValidator;
pub use object::{ObjectReview, ObjectValidator};

/// Admission operation, as delivered by the API server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "CREATE" => Some(Operation::Create),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// Structured admission outcome: `{reason, code, message}` on denial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmissionVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
    pub code: i32,
    pub message: String,
}

pub fn allow(message: &str) -> AdmissionVerdict {
    AdmissionVerdict {
        allowed: true,
        reason: None,
        code: 200,
        message: message.to_string(),
    }
}

pub fn deny(reason: &str, message: String) -> AdmissionVerdict {
    let code = match reason {
        "BadRequest" => 400,
        "Conflict" | "AlreadyExists" => 409,
        _ => 403,
    };
    AdmissionVerdict {
        allowed: false,
        reason: Some(reason.to_string()),
        code,
        message,
    }
}
