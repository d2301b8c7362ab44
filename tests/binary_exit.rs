//! Runs the `vector-sum` binary with group sizes that must fail on every rank.

use std::process::{Command, Output};

use mpi_vector_sum::RANK_ENV;

fn vector_sum(procs: &str) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vector-sum"))
        .env("VECSUM_PROCS", procs)
        .env_remove(RANK_ENV)
        .env_remove("VECSUM_SHM")
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

#[test]
fn test_uneven_group_exits_with_failure() {
    // 100_000_000 is not divisible by 3
    let output = vector_sum("3");
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not divisible"));
}

#[test]
fn test_invalid_group_size_exits_with_failure() {
    let output = vector_sum("0");
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
}
