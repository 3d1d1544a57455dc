//! Property 3: Environment merge for exec
//!
//! `build_envp` puts the extra entries first, then `PATH`, `HOME` and the
//! installation prefix variable taken from the host, then the emulated
//! environment without those three names. Nothing from the emulated block
//! is lost except the carried names.

use std::collections::HashMap;

use guestproc::spawn::argv::{variable_name, CARRIED_HOST_VARIABLES};
use guestproc::spawn::build_envp;
use proptest::prelude::*;

const PREFIX: &str = "GUESTPROC_PREFIX";

fn arb_entry() -> impl Strategy<Value = String> {
    prop_oneof![
        ("[A-Z][A-Z0-9_]{0,8}", "[a-z0-9/:]{0,12}").prop_map(|(k, v)| format!("{k}={v}")),
        "[a-z0-9/:]{0,12}".prop_map(|v| format!("PATH={v}")),
        "[a-z0-9/:]{0,12}".prop_map(|v| format!("HOME={v}")),
        "[a-z0-9/:]{0,12}".prop_map(|v| format!("{PREFIX}={v}")),
    ]
}

fn carried(name: &str) -> bool {
    CARRIED_HOST_VARIABLES.contains(&name) || name == PREFIX
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn extra_then_host_then_emulated(
        environment in proptest::collection::vec(arb_entry(), 0..12),
        extra in proptest::collection::vec(arb_entry(), 0..4),
        host_path in proptest::option::of("[a-z/:]{1,12}"),
        host_home in proptest::option::of("[a-z/]{1,12}"),
        host_prefix in proptest::option::of("[a-z/]{1,12}"),
    ) {
        let host: HashMap<&str, String> = [
            ("PATH", host_path),
            ("HOME", host_home),
            (PREFIX, host_prefix),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect();
        let envp = build_envp(&environment, &extra, |name| host.get(name).cloned(), PREFIX);

        // extra entries lead, untouched
        prop_assert_eq!(&envp[..extra.len()], &extra[..]);

        // then the host values of the carried names that are set, in order
        let expected_host: Vec<String> = ["PATH", "HOME", PREFIX]
            .iter()
            .filter_map(|name| host.get(name).map(|v| format!("{name}={v}")))
            .collect();
        let host_end = extra.len() + expected_host.len();
        prop_assert_eq!(&envp[extra.len()..host_end], &expected_host[..]);

        // then the emulated block minus carried names, order preserved
        let expected_rest: Vec<String> = environment
            .iter()
            .filter(|e| !carried(variable_name(e)))
            .cloned()
            .collect();
        prop_assert_eq!(&envp[host_end..], &expected_rest[..]);
    }

    /// The first occurrence of a name in the result is the extra entry
    /// whenever one exists.
    #[test]
    fn extra_wins(
        environment in proptest::collection::vec(arb_entry(), 0..12),
        extra in proptest::collection::vec(arb_entry(), 1..4),
    ) {
        let envp = build_envp(&environment, &extra, |_| Some("host".to_string()), PREFIX);
        for entry in &extra {
            let name = variable_name(entry);
            let first = envp.iter().find(|e| variable_name(e) == name).unwrap();
            let first_extra = extra.iter().find(|e| variable_name(e) == name).unwrap();
            prop_assert_eq!(first, first_extra);
        }
    }
}

#[test]
fn unset_host_variables_are_not_invented() {
    let envp = build_envp(&["A=1".to_string()], &[], |_| None, PREFIX);
    assert_eq!(envp, vec!["A=1".to_string()]);
}
