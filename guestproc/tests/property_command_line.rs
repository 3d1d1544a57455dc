//! Property 1: Command line splitting
//!
//! Joining an argument vector with `build_command_line` and splitting the
//! result with `build_argv` gives the vector back, as long as no argument
//! after the first contains whitespace or quotes. A program name with
//! spaces survives because it is quoted.

use guestproc::spawn::{build_argv, build_command_line};
use proptest::prelude::*;

fn arb_program() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_./\\-]{1,16}( [a-zA-Z0-9_.\\-]{1,8}){0,2}"
}

fn arb_arg() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_=./:\\-]{1,16}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Join then split returns the original arguments.
    #[test]
    fn split_inverts_join(
        program in arb_program(),
        args in proptest::collection::vec(arb_arg(), 0..8),
    ) {
        let mut argv = vec![program];
        argv.extend(args);
        let line = build_command_line(&argv);
        prop_assert_eq!(build_argv(&line), argv);
    }

    /// Runs of whitespace between arguments never produce empty arguments.
    #[test]
    fn no_empty_arguments(
        args in proptest::collection::vec(arb_arg(), 1..8),
        gaps in proptest::collection::vec("[ \t]{1,4}", 8),
    ) {
        let mut line = String::new();
        for (arg, gap) in args.iter().zip(gaps.iter()) {
            line.push_str(gap);
            line.push_str(arg);
        }
        let argv = build_argv(&line);
        prop_assert!(argv.iter().all(|a| !a.is_empty()));
        prop_assert_eq!(argv, args);
    }

    /// Only the leading token gets quote handling.
    #[test]
    fn inner_quotes_are_literal(program in arb_arg(), word in "[a-z]{1,8}") {
        let line = format!("{program} \"{word}\"");
        let argv = build_argv(&line);
        prop_assert_eq!(argv, vec![program, format!("\"{word}\"")]);
    }
}

#[test]
fn quoted_program_with_spaces() {
    let argv = build_argv("\"C:/Program Files/app.exe\" /s");
    assert_eq!(argv, vec!["C:/Program Files/app.exe".to_string(), "/s".to_string()]);
}
