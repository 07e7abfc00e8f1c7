//! Typed change notifications.

/// A KV change observed under one of the watched prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    PipelineDefinitionChanged {
        pipeline_id: String,
        value: String,
    },
    ModuleRegistrationChanged {
        module_id: String,
        value: String,
    },
    ClusterPipelineChanged {
        cluster: String,
        pipeline_id: String,
        value: String,
    },
}

impl ChangeEvent {
    /// Id of the changed pipeline or module.
    pub fn id(&self) -> &str {
        match self {
            ChangeEvent::PipelineDefinitionChanged { pipeline_id, .. } => pipeline_id,
            ChangeEvent::ModuleRegistrationChanged { module_id, .. } => module_id,
            ChangeEvent::ClusterPipelineChanged { pipeline_id, .. } => pipeline_id,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            ChangeEvent::PipelineDefinitionChanged { value, .. }
            | ChangeEvent::ModuleRegistrationChanged { value, .. }
            | ChangeEvent::ClusterPipelineChanged { value, .. } => value,
        }
    }
}
