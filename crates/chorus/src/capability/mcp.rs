use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, Tool as McpTool};
use rmcp::service::{Peer, RunningService, ServiceError, ServiceExt};
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use rmcp::RoleClient;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{normalize_call_result, CapabilityError, CapabilityProvider};
use crate::models::tool::Tool;

/// How to launch the capability server process
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl McpServerConfig {
    /// The Brave web search server, fetched and run through npx
    pub fn brave_search<S: Into<String>>(api_key: S) -> Self {
        Self {
            command: "npx".to_string(),
            args: vec![
                "-y".to_string(),
                "@modelcontextprotocol/server-brave-search".to_string(),
                "stdio".to_string(),
            ],
            env: HashMap::from([("BRAVE_API_KEY".to_string(), api_key.into())]),
        }
    }
}

fn convert_tool(tool: McpTool) -> Tool {
    let schema = Value::Object(tool.input_schema.as_ref().clone());
    Tool::new(
        tool.name.to_string(),
        tool.description.map(|d| d.to_string()).unwrap_or_default(),
        if schema.as_object().map_or(true, |o| o.is_empty()) {
            json!({"type": "object", "properties": {}})
        } else {
            schema
        },
    )
}

fn service_error(error: ServiceError) -> CapabilityError {
    match error {
        ServiceError::McpError(error) => CapabilityError::Server {
            code: i64::from(error.code.0),
            message: error.message.to_string(),
        },
        other => CapabilityError::Transport(other.to_string()),
    }
}

/// Capability provider backed by a child process speaking MCP over stdio
pub struct McpStdioClient {
    config: McpServerConfig,
    // Serializes connect and disconnect; tool calls go through `peer`
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
    peer: RwLock<Option<Peer<RoleClient>>>,
    tools: RwLock<Vec<Tool>>,
}

impl McpStdioClient {
    pub fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            service: Mutex::new(None),
            peer: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
        }
    }

    fn live_peer(&self) -> Option<Peer<RoleClient>> {
        self.peer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn start(&self) -> Result<RunningService<RoleClient, ()>, CapabilityError> {
        let spawn_error = |reason: String| CapabilityError::Spawn {
            command: self.config.command.clone(),
            reason,
        };

        let args = self.config.args.clone();
        let env = self.config.env.clone();
        let transport = TokioChildProcess::new(Command::new(&self.config.command).configure(
            move |cmd| {
                cmd.args(&args).envs(&env);
            },
        ))
        .map_err(|e| spawn_error(e.to_string()))?;

        ().serve(transport)
            .await
            .map_err(|e| CapabilityError::Transport(format!("initialize failed: {}", e)))
    }

    /// Run a web search without any model involved
    pub async fn execute_search(&self, query: &str) -> Result<Value, CapabilityError> {
        info!("Executing direct search for: '{}'", query);
        self.call_tool("brave_web_search", json!({"query": query}))
            .await
    }
}

#[async_trait]
impl CapabilityProvider for McpStdioClient {
    async fn connect(&self) -> Result<Vec<Tool>, CapabilityError> {
        let mut service = self.service.lock().await;
        if service.is_some() && self.live_peer().is_some() {
            return Ok(self.tools());
        }

        info!("Connecting to capability server `{}`", self.config.command);
        let running = self.start().await?;

        let listed = running
            .list_tools(Default::default())
            .await
            .map_err(service_error)?;
        let tools: Vec<Tool> = listed.tools.into_iter().map(convert_tool).collect();

        info!(
            "Connected to capability server with tools: {:?}",
            tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>()
        );

        *self.tools.write().unwrap_or_else(|p| p.into_inner()) = tools.clone();
        *self.peer.write().unwrap_or_else(|p| p.into_inner()) = Some(running.peer().clone());
        *service = Some(running);
        Ok(tools)
    }

    fn tools(&self) -> Vec<Tool> {
        self.tools
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, CapabilityError> {
        let peer = self.live_peer().ok_or(CapabilityError::NotConnected)?;
        debug!("Calling tool {} with {}", name, arguments);
        let result = peer
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: arguments.as_object().cloned(),
            })
            .await
            .map_err(service_error)?;

        let raw = serde_json::to_value(&result)
            .map_err(|e| CapabilityError::Transport(format!("invalid tools/call result: {}", e)))?;
        normalize_call_result(raw)
    }

    async fn disconnect(&self) -> Result<(), CapabilityError> {
        let mut service = self.service.lock().await;
        self.peer.write().unwrap_or_else(|p| p.into_inner()).take();
        self.tools.write().unwrap_or_else(|p| p.into_inner()).clear();

        if let Some(running) = service.take() {
            if let Err(e) = running.cancel().await {
                warn!("Failed to stop capability server: {}", e);
            }
            info!("Disconnected from capability server");
        }
        Ok(())
    }
}
