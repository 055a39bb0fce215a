//! Parsing of the render node list string, a comma or space separated
//! sequence of `host[:port]` entries.

use crate::message::DEFAULT_PORT;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    /// Parse one `host[:port]` token. Returns `None` for empty or malformed
    /// entries, including ports that do not parse.
    pub fn parse(token: &str) -> Option<NodeAddr> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        match token.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return None;
                }
                let port = port.parse().ok()?;
                Some(NodeAddr {
                    host: host.to_string(),
                    port,
                })
            }
            None => Some(NodeAddr {
                host: token.to_string(),
                port: DEFAULT_PORT,
            }),
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse the full node list, logging and skipping entries that make no
/// sense instead of failing the whole list.
pub fn parse_node_list(list: &str) -> Vec<NodeAddr> {
    list.split([',', ' '])
        .filter_map(|token| {
            let token = token.trim();
            if token.is_empty() {
                return None;
            }
            let parsed = NodeAddr::parse(token);
            if parsed.is_none() {
                log::warn!("Ignoring malformed render node entry {token:?}");
            }
            parsed
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_host_gets_default_port() {
        let nodes = parse_node_list("renderbox");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].host, "renderbox");
        assert_eq!(nodes[0].port, DEFAULT_PORT);
    }

    #[test]
    fn test_comma_and_space_separators_mix() {
        let nodes = parse_node_list("a:1234, b c:9,  ,d");
        let rendered: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
        assert_eq!(rendered, vec!["a:1234", "b:2222", "c:9", "d:2222"]);
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let nodes = parse_node_list("good:80,bad:notaport,:77");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].host, "good");
        assert_eq!(nodes[0].port, 80);
    }

    #[test]
    fn test_empty_list_parses_to_nothing() {
        assert!(parse_node_list("").is_empty());
        assert!(parse_node_list("  , ,").is_empty());
    }
}
