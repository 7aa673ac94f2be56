use proptest::prelude::*;
use rapidpipe_engine::config::parser;
use rapidpipe_engine::config::validator;
use rapidpipe_engine::execution::partition_evenly;

proptest! {
    #[test]
    fn skip_quarantined_requires_quarantine_section(has_quarantine in any::<bool>()) {
        let quarantine = if has_quarantine {
            "quarantine:\n  location: quarantine.prop\n"
        } else {
            ""
        };

        let yaml = format!(
            r#"
version: "1.0"
pipe: prop_skip_policy
command: ["sh", "-c", "cat"]
on_partition_failure: skip_quarantined
{quarantine}"#
        );

        let config = parser::parse_pipe_str(&yaml).expect("generated yaml must parse");
        let result = validator::validate_pipe(&config);

        if has_quarantine {
            prop_assert!(result.is_ok());
        } else {
            prop_assert!(result.is_err());
        }
    }

    #[test]
    fn manual_parallelism_must_be_positive(parallelism in 0_u32..64) {
        let yaml = format!(
            "version: \"1.0\"\npipe: prop_parallelism\ncommand: [cat]\nresources:\n  parallelism: {parallelism}\n"
        );

        let config = parser::parse_pipe_str(&yaml).expect("generated yaml must parse");
        let result = validator::validate_pipe(&config);

        if parallelism == 0 {
            prop_assert!(result.is_err());
        } else {
            prop_assert!(result.is_ok());
            prop_assert_eq!(config.pipe_options().parallelism, parallelism as usize);
        }
    }

    #[test]
    fn env_keys_with_equals_are_rejected(key in "[A-Z]{1,8}", bad in any::<bool>()) {
        let key = if bad { format!("{key}=X") } else { key };
        let yaml = format!(
            "version: \"1.0\"\npipe: prop_env\ncommand: [cat]\nenv:\n  \"{key}\": value\n"
        );

        let config = parser::parse_pipe_str(&yaml).expect("generated yaml must parse");
        prop_assert_eq!(validator::validate_pipe(&config).is_err(), bad);
    }

    #[test]
    fn partition_evenly_preserves_order_and_balance(
        records in proptest::collection::vec(any::<i64>(), 0..200),
        partitions in 1_usize..16,
    ) {
        let parts = partition_evenly(records.clone(), partitions);

        prop_assert_eq!(parts.len(), partitions);
        prop_assert_eq!(parts.concat(), records);
        let max = parts.iter().map(Vec::len).max().unwrap_or(0);
        let min = parts.iter().map(Vec::len).min().unwrap_or(0);
        prop_assert!(max - min <= 1);
    }
}
