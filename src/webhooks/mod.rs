//! Admission webhooks for the hierarchical-namespace adjunct
//!
//! Implements the ValidatingAdmissionWebhook endpoints guarding the
//! namespace forest and the objects propagated through it.
//!
//! Failure policy differs by endpoint: namespace and hierarchy admission
//! fail closed, object admission fails open.

pub mod forest;
mod server;
pub mod validators;

pub use forest::Forest;
pub use server::{
    create_webhook_router, run_webhook_server, WebhookError, WebhookState, HIERARCHY_SERVING_PATH,
    NAMESPACE_SERVING_PATH, OBJECTS_SERVING_PATH, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH,
    WEBHOOK_PORT,
};
pub use validators::{NamespaceValidator, ObjectValidator};
