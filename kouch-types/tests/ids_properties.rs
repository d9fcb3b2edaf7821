//! Property-based tests for identifier serialization.

use kouch_types::{DocId, Revision, Sequence};
use proptest::prelude::*;

// =============================================================================
// HELPER STRATEGIES
// =============================================================================

fn non_blank_strategy() -> impl Strategy<Value = String> {
    ".{0,16}[^\\s].{0,16}"
}

// =============================================================================
// IDENTIFIER PROPERTIES
// =============================================================================

proptest! {
    /// Identifiers serialize as bare JSON strings.
    #[test]
    fn doc_id_is_transparent(raw in ".{0,64}") {
        let json = serde_json::to_string(&DocId::new(raw.clone())).unwrap();
        prop_assert_eq!(&json, &serde_json::to_string(&raw).unwrap());
        let back: DocId = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back.as_str(), raw.as_str());
    }

    /// `parse` accepts exactly the non-blank strings.
    #[test]
    fn parse_accepts_non_blank(raw in non_blank_strategy()) {
        prop_assert!(Revision::parse(raw.clone()).is_ok());
        prop_assert!(!DocId::new(raw).is_blank());
    }

    #[test]
    fn parse_rejects_whitespace(raw in "[ \t\n]{0,8}") {
        prop_assert!(DocId::parse(raw).is_err());
    }

    /// Integer sequences keep their decimal form.
    #[test]
    fn integer_sequences_become_text(n in any::<u64>()) {
        let seq: Sequence = serde_json::from_str(&n.to_string()).unwrap();
        prop_assert_eq!(seq.as_str(), n.to_string());
    }
}
