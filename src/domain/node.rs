//! Fleet nodes as enumerated by the registry node.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which kind of protocol node an address belongs to.
///
/// Only [`NodeKind::ShareAgent`] is upgraded by this tool; every other kind
/// is support infrastructure or an agent type managed elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    ShareAgent,
    OwnAgent,
    ShareService,
    /// An agent with a sub-type this tool does not know.
    OtherAgent(String),
    /// Registry, creator, language-model helper and similar support nodes.
    Infrastructure(String),
}

impl NodeKind {
    pub fn is_upgrade_eligible(&self) -> bool {
        matches!(self, NodeKind::ShareAgent)
    }

    /// Decode the registry's variant encoding, e.g.
    /// `{"MainerAgent":{"ShareAgent":{}}}` or `{"MainerLlm":null}`.
    pub fn from_registry(value: &Value) -> NodeKind {
        let Some((outer, inner)) = value.as_object().and_then(|o| o.iter().next()) else {
            return NodeKind::Infrastructure("unknown".to_string());
        };
        if outer != "MainerAgent" {
            return NodeKind::Infrastructure(outer.clone());
        }
        let sub = inner
            .as_object()
            .and_then(|o| o.keys().next().cloned())
            .unwrap_or_default();
        match sub.as_str() {
            "ShareAgent" => NodeKind::ShareAgent,
            "Own" => NodeKind::OwnAgent,
            "ShareService" => NodeKind::ShareService,
            _ => NodeKind::OtherAgent(sub),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::ShareAgent => write!(f, "ShareAgent"),
            NodeKind::OwnAgent => write!(f, "Own"),
            NodeKind::ShareService => write!(f, "ShareService"),
            NodeKind::OtherAgent(s) => write!(f, "agent:{s}"),
            NodeKind::Infrastructure(s) => write!(f, "{s}"),
        }
    }
}

/// One entry of the fleet listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub address: String,
    pub owner: String,
    pub kind: NodeKind,
}

impl Node {
    pub fn new(address: &str, owner: &str, kind: NodeKind) -> Self {
        Self {
            address: address.to_string(),
            owner: owner.to_string(),
            kind,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListingError {
    #[error("registry listing is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("registry returned an error: {0}")]
    Remote(String),
    #[error("registry listing has an unexpected shape")]
    Shape,
}

/// Parse the registry's `{"Ok": [...]}` listing into nodes.
///
/// Records without an address are kept with an empty address so the
/// selection filter can account for them.
pub fn parse_listing(raw: &str) -> Result<Vec<Node>, ListingError> {
    let value: Value = serde_json::from_str(raw)?;
    if let Some(err) = value.get("Err") {
        return Err(ListingError::Remote(err.to_string()));
    }
    let entries = value
        .get("Ok")
        .and_then(Value::as_array)
        .ok_or(ListingError::Shape)?;

    Ok(entries
        .iter()
        .map(|entry| {
            let text = |key: &str| {
                entry
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_string()
            };
            Node {
                address: text("address"),
                owner: text("ownedBy"),
                kind: entry
                    .get("canisterType")
                    .map(NodeKind::from_registry)
                    .unwrap_or_else(|| NodeKind::Infrastructure("unknown".to_string())),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_agent_kinds() {
        let share = json!({"MainerAgent": {"ShareAgent": {}}});
        let own = json!({"MainerAgent": {"Own": null}});
        let llm = json!({"MainerLlm": null});
        assert_eq!(NodeKind::from_registry(&share), NodeKind::ShareAgent);
        assert_eq!(NodeKind::from_registry(&own), NodeKind::OwnAgent);
        assert_eq!(
            NodeKind::from_registry(&llm),
            NodeKind::Infrastructure("MainerLlm".into())
        );
        assert!(NodeKind::from_registry(&share).is_upgrade_eligible());
        assert!(!NodeKind::from_registry(&own).is_upgrade_eligible());
    }

    #[test]
    fn parses_listing() {
        let raw = r#"{"Ok":[
            {"address":"aaaaa-aa","ownedBy":"user-1","canisterType":{"MainerAgent":{"ShareAgent":{}}}},
            {"address":"","ownedBy":"user-2","canisterType":{"MainerAgent":{"ShareAgent":{}}}},
            {"address":"bbbbb-bb","ownedBy":"user-1","canisterType":{"MainerAgent":{"OtherType":{}}}}
        ]}"#;
        let nodes = parse_listing(raw).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].address, "aaaaa-aa");
        assert_eq!(nodes[0].owner, "user-1");
        assert_eq!(nodes[1].address, "");
        assert_eq!(nodes[2].kind, NodeKind::OtherAgent("OtherType".into()));
    }

    #[test]
    fn registry_error_is_reported() {
        let err = parse_listing(r#"{"Err":{"Unauthorized":null}}"#).unwrap_err();
        assert!(matches!(err, ListingError::Remote(_)));
        assert!(matches!(parse_listing("[]").unwrap_err(), ListingError::Shape));
    }
}
