//! N1QL query helper
//!
//! Query-capable nodes are discovered from the cluster config's
//! `nodesExt` section; statements are POSTed form-encoded to a randomly
//! chosen one.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::utils::error::McError;
use crate::utils::http;

#[derive(Debug, Deserialize)]
struct ClusterConfigDoc {
    #[serde(rename = "nodesExt", default)]
    nodes_ext: Vec<NodeExt>,
}

#[derive(Debug, Deserialize)]
struct NodeExt {
    #[serde(default)]
    services: HashMap<String, u16>,
    hostname: Option<String>,
}

/// Parses the `GetClusterConfig` response body and records every node
/// offering an `n1ql` service port.
///
/// Nodes without an explicit hostname (the config uses a placeholder for
/// the node being asked) fall back to `fallback_host`.
pub(crate) fn parse_n1ql_nodes(
    config_body: &[u8],
    fallback_host: &str,
) -> Result<Vec<(String, u16)>, McError> {
    let doc: ClusterConfigDoc = serde_json::from_slice(config_body)?;

    let nodes: Vec<(String, u16)> = doc
        .nodes_ext
        .iter()
        .filter_map(|node| {
            let port = *node.services.get("n1ql")?;
            let host = match node.hostname.as_deref() {
                Some(host) if !host.contains("$HOST") => host.to_string(),
                _ => fallback_host.to_string(),
            };
            Some((host, port))
        })
        .collect();

    debug!(count = nodes.len(), "discovered n1ql nodes");
    Ok(nodes)
}

/// POSTs `statement=<n1ql>` to a random query node and returns the JSON
/// `results` field.
pub(crate) fn run_query(
    nodes: &[(String, u16)],
    basic_auth: &str,
    statement: &str,
    timeout: Duration,
) -> Result<Value, McError> {
    if nodes.is_empty() {
        return Err(McError::Query("no n1ql nodes available".to_string()));
    }

    let (host, port) = &nodes[fastrand::usize(..nodes.len())];
    let body = format!("statement={}", http::form_urlencode(statement));
    let response = http::post_form(host, *port, "/query/service", Some(basic_auth), &body, timeout)?;

    if !response.is_ok() {
        return Err(McError::Query(format!(
            "query node returned status {}: {}",
            response.status,
            String::from_utf8_lossy(&response.body)
        )));
    }

    let doc: Value = serde_json::from_slice(&response.body)?;
    doc.get("results")
        .cloned()
        .ok_or_else(|| McError::Query("query response has no results field".to_string()))
}
