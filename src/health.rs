//! Health filtering of discovered instances.

use crate::instance::ServiceInstance;

/// Selects which instances of a service are exposed to the consumer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum HealthFilterMode {
    /// Only instances with passing health checks. The discovery backend is
    /// asked to filter server-side.
    #[default]
    OnlyHealthy,

    /// Prefer instances with passing health checks, but if none are passing,
    /// expose every instance rather than none at all.
    FallbackToUnhealthy,
}

impl HealthFilterMode {
    /// Whether queries should ask the backend for passing instances only.
    pub fn healthy_only(&self) -> bool {
        matches!(self, HealthFilterMode::OnlyHealthy)
    }
}

/// Applies the client-side part of `mode` to `instances`.
///
/// For [HealthFilterMode::OnlyHealthy] the backend already filtered, and the
/// input is returned as-is.
pub fn filter(mut instances: Vec<ServiceInstance>, mode: HealthFilterMode) -> Vec<ServiceInstance> {
    match mode {
        HealthFilterMode::OnlyHealthy => instances,
        HealthFilterMode::FallbackToUnhealthy => {
            if instances.iter().any(ServiceInstance::is_passing) {
                instances.retain(ServiceInstance::is_passing);
            }
            instances
        }
    }
}
