//! Fuzz target for revision id parsing and ordering.
//!
//! Parsing and comparison must never panic on arbitrary input, and the
//! ordering must stay antisymmetric.

#![no_main]

use doc_replication::model::{compare_revs, parse_rev, RevisionHistory};
use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    // Should never panic
    if let Some((generation, hash)) = parse_rev(a) {
        assert!(generation >= 1);
        assert!(!hash.is_empty());
        assert!(a.ends_with(hash));

        // Leading zeros and signs normalize away, the parts survive
        let history = RevisionHistory::from_rev(a).unwrap();
        let head = history.head().unwrap();
        assert_eq!(parse_rev(&head), Some((generation, hash)));
    }

    let ab = compare_revs(a, b);
    let ba = compare_revs(b, a);
    assert_eq!(ab.reverse(), ba);
    assert_eq!(compare_revs(a, a), Ordering::Equal);
});
