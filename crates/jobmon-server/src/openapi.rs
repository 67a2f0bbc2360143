//! OpenAPI document for the FSM API.

use utoipa::OpenApi;

use jobmon_core::constants::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus};
use jobmon_core::contracts::*;

use crate::routes;

#[derive(OpenApi)]
#[openapi(
    paths(
        routes::workflow::bind_workflow,
        routes::workflow::set_resume,
        routes::workflow::get_tasks,
        routes::workflow_run::register_workflow_run,
        routes::workflow_run::log_heartbeat,
    ),
    components(schemas(
        TaskStatus,
        TaskInstanceStatus,
        WorkflowStatus,
        WorkflowRunStatus,
        ErrorResponse,
        BindWorkflowRequest,
        BindWorkflowResponse,
        SetResumeRequest,
        GetTasksResponse,
        TaskMetadata,
        RegisterWorkflowRunRequest,
        RegisterWorkflowRunResponse,
        LogHeartbeatRequest,
        WorkflowRunStatusResponse,
        TaskInstanceBatchWire,
        WorkerTaskInstance,
    )),
    tags(
        (name = "workflow", description = "Workflow binding and resume"),
        (name = "workflow_run", description = "Run registration and liveness"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_document_builds() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/workflow"));
        assert!(doc.paths.paths.contains_key("/workflow_run"));
    }
}
