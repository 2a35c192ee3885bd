//! 性质测试：预筛不漏报、三元组提取的编码校验、二进制判定
//!
//! 预筛只是加速：规则集会改动的内容，`content_may_match` 必须返回 true。

use proptest::prelude::*;
use trirewrite_core::{is_binary, valid_utf8_pair, RuleSet, RuleSpec, TrigramSet, BINARY_SNIFF_LEN};

fn literal() -> impl Strategy<Value = String> {
    "[abcé]{1,5}"
}

fn pattern() -> impl Strategy<Value = String> {
    prop_oneof![
        literal(),
        (literal(), literal()).prop_map(|(a, b)| format!("{a}|{b}")),
        (literal(), literal()).prop_map(|(a, b)| format!("{a}.{b}")),
        (literal(), literal()).prop_map(|(a, b)| format!("(?:{a})+{b}")),
        (literal(), literal()).prop_map(|(a, b)| format!("{a}[bc]{b}")),
        (literal(), literal()).prop_map(|(a, b)| format!("{a}?{b}")),
        (literal(), literal()).prop_map(|(a, b)| format!("({a}|{b}){{2}}")),
        literal().prop_map(|a| format!("(?i){a}")),
        literal().prop_map(|a| format!("^{a}")),
        literal().prop_map(|a| format!("{a}\\w*")),
    ]
}

fn rules() -> impl Strategy<Value = Vec<RuleSpec>> {
    prop::collection::vec((pattern(), "[abcABC]{0,4}"), 1..4)
        .prop_map(|v| v.into_iter().map(|(p, r)| RuleSpec::new(p, r)).collect())
}

fn content() -> impl Strategy<Value = String> {
    "[abcAB é\n]{0,48}"
}

proptest! {
    #[test]
    fn prefilter_never_rejects_rewritten_content(specs in rules(), text in content()) {
        let rs = RuleSet::compile(&specs).unwrap();
        let (_, changed) = rs.apply(text.as_bytes());
        if changed {
            prop_assert!(rs.content_may_match(text.as_bytes()), "query {} rejected {:?}", rs.query(), text);
        }
    }

    #[test]
    fn prefilter_tolerates_arbitrary_bytes(specs in rules(), bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let rs = RuleSet::compile(&specs).unwrap();
        let (_, changed) = rs.apply(&bytes);
        if changed {
            prop_assert!(rs.content_may_match(&bytes));
        }
    }

    #[test]
    fn rules_apply_in_sequence(specs in rules(), text in content()) {
        let rs = RuleSet::compile(&specs).unwrap();
        let expected = specs.iter().fold(text.as_bytes().to_vec(), |acc, spec| {
            let single = RuleSet::compile(std::slice::from_ref(spec)).unwrap();
            single.apply(&acc).0
        });
        prop_assert_eq!(rs.apply(text.as_bytes()).0, expected);
    }

    #[test]
    fn valid_utf8_always_yields_trigrams(text in "\\PC{0,64}") {
        prop_assert!(TrigramSet::from_bytes(text.as_bytes()).is_ok());
    }

    #[test]
    fn encoding_error_iff_bad_pair(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let mut prev = 0u8;
        let bad_pair = bytes.iter().any(|&c| {
            let bad = !valid_utf8_pair(prev, c);
            prev = c;
            bad
        });
        prop_assert_eq!(TrigramSet::from_bytes(&bytes).is_err(), bad_pair);
        if std::str::from_utf8(&bytes).is_ok() {
            prop_assert!(!bad_pair);
        }
    }

    #[test]
    fn binary_iff_nul_in_sniff_window(
        len in 0usize..10_000,
        nul_at in prop::option::of(0usize..10_000),
    ) {
        let mut buf = vec![b'x'; len];
        if let Some(i) = nul_at.filter(|&i| i < len) {
            buf[i] = 0;
        }
        let expected = buf.iter().take(BINARY_SNIFF_LEN).any(|&b| b == 0);
        prop_assert_eq!(is_binary(&buf), expected);
    }
}
