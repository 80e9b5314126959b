use std::{path::PathBuf, time::Duration};

use cdb_bridge_core::{
    CdbConfig, CdbError, CommandOutput, EngineHandle, ExecuteRequest, SessionEngine, StartupArgs,
};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const DEFAULT_ATTACH_COMMAND: &str = "|";
const DEFAULT_DUMP_COMMAND: &str = "!analyze -v";
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct RunCommandParams {
    command: String,
    #[serde(default)]
    cdb_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct AttachProcessParams {
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    process_name: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    cdb_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct OpenDumpParams {
    dump_path: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    cdb_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct StopSessionParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct SessionStatusParams {}

#[derive(Clone)]
struct CdbMcpServer {
    tool_router: ToolRouter<Self>,
    engine: EngineHandle,
    config: CdbConfig,
}

fn describe_error(err: &CdbError) -> String {
    match err {
        e if e.is_launch_failure() => format!(
            "{e}. Verify that cdb.exe (Debugging Tools for Windows) is installed and on PATH, \
             or pass cdb_path / set CDB_PATH to its location."
        ),
        CdbError::CommandInFlight => {
            format!("{err}. Wait for the previous command to finish, then retry.")
        }
        CdbError::CommandTimeout { partial_output, .. } if !partial_output.is_empty() => {
            format!("{err}.\nPartial output:\n{partial_output}")
        }
        CdbError::UnexpectedExit { .. } => {
            format!("{err}. The next command will start a new debugger session.")
        }
        other => other.to_string(),
    }
}

fn to_mcp_error(err: CdbError) -> McpError {
    McpError::internal_error(describe_error(&err), None)
}

fn attach_args(pid: Option<u32>, process_name: Option<&str>) -> Result<Vec<String>, String> {
    match (pid, process_name.map(str::trim).filter(|name| !name.is_empty())) {
        (Some(pid), None) => Ok(StartupArgs::attach_pid(pid)),
        (None, Some(name)) => Ok(StartupArgs::attach_name(name)),
        (Some(_), Some(_)) => Err("Provide either pid or process_name, not both.".to_string()),
        (None, None) => Err("Provide pid or process_name to attach to.".to_string()),
    }
}

fn command_result(output: CommandOutput, engine: &EngineHandle) -> CallToolResult {
    CallToolResult::structured(json!({
        "ok": true,
        "command": output.command,
        "output": output.render(),
        "completed_at": output.completed_at,
        "exit": output.exit,
        "state": engine.state(),
    }))
}

#[tool_router]
impl CdbMcpServer {
    fn new(engine: EngineHandle, config: CdbConfig) -> Self {
        Self {
            tool_router: Self::tool_router(),
            engine,
            config,
        }
    }

    fn candidates(&self, cdb_path: Option<String>) -> Vec<PathBuf> {
        self.config.candidate_paths(cdb_path.map(PathBuf::from))
    }

    #[tool(description = "Run a cdb command in the current session, starting one if needed")]
    async fn cdb_run_command(
        &self,
        params: Parameters<RunCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        if params.command.contains(['\r', '\n']) {
            return Err(McpError::invalid_params(
                "command must be a single line",
                None,
            ));
        }

        let request = ExecuteRequest::new(params.command)
            .with_candidate_paths(self.candidates(params.cdb_path));
        let output = self.engine.execute(request).await.map_err(to_mcp_error)?;

        Ok(command_result(output, &self.engine))
    }

    #[tool(description = "Attach cdb to a running process by pid or name, replacing the session")]
    async fn cdb_attach_process(
        &self,
        params: Parameters<AttachProcessParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let startup_args = attach_args(params.pid, params.process_name.as_deref())
            .map_err(|e| McpError::invalid_params(e, None))?;

        self.engine.stop().await.map_err(to_mcp_error)?;

        let request = ExecuteRequest::new(
            params
                .command
                .unwrap_or_else(|| DEFAULT_ATTACH_COMMAND.to_string()),
        )
        .with_candidate_paths(self.candidates(params.cdb_path))
        .with_startup_args(startup_args);
        let output = self.engine.execute(request).await.map_err(to_mcp_error)?;

        Ok(command_result(output, &self.engine))
    }

    #[tool(description = "Open a crash dump in cdb (replaces the current session)")]
    async fn cdb_open_dump(
        &self,
        params: Parameters<OpenDumpParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        if params.dump_path.trim().is_empty() {
            return Err(McpError::invalid_params("dump_path must not be empty", None));
        }

        self.engine.stop().await.map_err(to_mcp_error)?;

        let request = ExecuteRequest::new(
            params
                .command
                .unwrap_or_else(|| DEFAULT_DUMP_COMMAND.to_string()),
        )
        .with_candidate_paths(self.candidates(params.cdb_path))
        .with_startup_args(StartupArgs::open_dump(params.dump_path.trim()));
        let output = self.engine.execute(request).await.map_err(to_mcp_error)?;

        Ok(command_result(output, &self.engine))
    }

    #[tool(description = "Stop the current cdb session")]
    async fn cdb_stop_session(
        &self,
        _params: Parameters<StopSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        self.engine.stop().await.map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": self.engine.state(),
        })))
    }

    #[tool(description = "Report the state of the cdb session")]
    async fn cdb_session_status(
        &self,
        _params: Parameters<SessionStatusParams>,
    ) -> Result<CallToolResult, McpError> {
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": self.engine.state(),
            "busy": self.engine.is_busy(),
        })))
    }
}

#[tool_handler]
impl ServerHandler for CdbMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "CDB MCP Server: one cdb session, one command at a time".into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the MCP transport.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = CdbConfig::from_env();
    let shutdown_timeout = config.command_timeout + config.stop_grace + SHUTDOWN_SLACK;
    let engine = SessionEngine::spawn(config.clone());
    let server = CdbMcpServer::new(engine.clone(), config);

    tracing::info!("Starting CDB MCP Server on stdio...");

    let service = server.serve(transport::stdio()).await?;
    tokio::select! {
        result = service.waiting() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received, shutting down");
        }
    }

    if tokio::time::timeout(shutdown_timeout, engine.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("cdb session did not stop in time; leaving it to kill-on-drop");
    }

    Ok(())
}
