//! Runtime permission collaborator.
//!
//! Platforms with runtime prompts (mobile) answer through their own
//! implementation; desktop stacks grant scanning implicitly.

use async_trait::async_trait;

#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn has_bluetooth_scan_permission(&self) -> bool;
}

/// Fixed answer, decided when the session is created
#[derive(Debug, Clone, Copy)]
pub struct StaticPermissionGate {
    granted: bool,
}

impl StaticPermissionGate {
    pub fn granted() -> Self {
        Self { granted: true }
    }

    pub fn denied() -> Self {
        Self { granted: false }
    }
}

#[async_trait]
impl PermissionGate for StaticPermissionGate {
    async fn has_bluetooth_scan_permission(&self) -> bool {
        self.granted
    }
}
