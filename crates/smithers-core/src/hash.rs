//! Content hashing for idempotent re-execution.

use sha2::{Digest, Sha256};
use smithers_proto::{Node, NodeKind};

/// Hash over a node's type, typed props, extra props, and descendant text.
///
/// Handlers are not part of the hash. Text leaves and control nodes carry
/// no hash.
pub fn content_hash(node: &Node) -> Option<String> {
    if node.kind.is_control() || matches!(node.kind, NodeKind::Text { .. }) {
        return None;
    }

    let payload = serde_json::json!({
        "type": node.type_name(),
        "props": node.kind,
        "extra": node.extra,
        "text": node.descendant_text(),
    });

    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    Some(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_same_content_same_hash() {
        let a = Node::claude("Review").child(Node::text("src/lib.rs"));
        let b = Node::claude("Review")
            .child(Node::text("src/lib.rs"))
            .on_finished(|_| vec![]);
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_eq!(content_hash(&a).unwrap().len(), 64);
    }

    #[test]
    fn test_hash_covers_props_text_and_extra() {
        let base = content_hash(&Node::claude("Review")).unwrap();
        assert_ne!(base, content_hash(&Node::claude("Review").with_model("opus")).unwrap());
        assert_ne!(
            base,
            content_hash(&Node::claude("Review").child(Node::text("more"))).unwrap()
        );
        assert_ne!(
            base,
            content_hash(&Node::claude("Review").with_prop("temperature", json!(0.2))).unwrap()
        );
    }

    #[test]
    fn test_control_and_text_have_no_hash() {
        assert!(content_hash(&Node::stop(Some("done"))).is_none());
        assert!(content_hash(&Node::human("Ship?")).is_none());
        assert!(content_hash(&Node::text("hello")).is_none());
        assert!(content_hash(&Node::phase("plan")).is_some());
    }
}
