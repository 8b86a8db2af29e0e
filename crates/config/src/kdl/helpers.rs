//! Small accessors over KDL nodes.
//!
//! Settings are written as child nodes with a single argument:
//!
//! ```kdl
//! renewal {
//!     renew-before-days 7
//! }
//! ```

use kdl::{KdlNode, KdlValue};

fn child_arg<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlValue> {
    node.children()?.get_arg(name)
}

/// String argument of the child node `name`
pub fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    child_arg(node, name)?.as_string().map(str::to_string)
}

/// Integer argument of the child node `name`
pub fn get_int_entry(node: &KdlNode, name: &str) -> Option<i128> {
    child_arg(node, name)?.as_integer()
}

/// Boolean argument of the child node `name`
pub fn get_bool_entry(node: &KdlNode, name: &str) -> Option<bool> {
    child_arg(node, name)?.as_bool()
}

/// Names of all child nodes, for rejecting unknown settings
pub fn child_names(node: &KdlNode) -> Vec<String> {
    node.children()
        .map(|doc| {
            doc.nodes()
                .iter()
                .map(|n| n.name().value().to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Fail on any child node that is not in `allowed`
pub fn ensure_known_children(node: &KdlNode, allowed: &[&str]) -> anyhow::Result<()> {
    let block = node.name().value();
    for name in child_names(node) {
        if !allowed.contains(&name.as_str()) {
            return Err(anyhow::anyhow!(
                "Unknown setting '{}' in '{}' block. Valid settings: {}",
                name,
                block,
                allowed.join(", ")
            ));
        }
    }
    Ok(())
}
