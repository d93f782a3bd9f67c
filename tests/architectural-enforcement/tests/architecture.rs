//! Workspace-wide architectural checks

use architectural_enforcement::{find_in_production, production_sources, Violation};

const CRATES: [&str; 2] = ["relay/core", "relay/daemon"];

fn report(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn test_sources_are_found() {
    for krate in CRATES {
        assert!(
            !production_sources(krate).is_empty(),
            "no sources found for {krate}"
        );
    }
}

#[test]
fn test_no_blocking_sleep() {
    for krate in CRATES {
        let violations = find_in_production(krate, &["std::thread::sleep", "thread::sleep("]);
        assert!(
            violations.is_empty(),
            "blocking sleep in async code:\n{}",
            report(&violations)
        );
    }
}

#[test]
fn test_no_unwrap_or_expect_in_production() {
    for krate in CRATES {
        let violations = find_in_production(krate, &[".unwrap()", ".expect("]);
        assert!(
            violations.is_empty(),
            "unwrap/expect outside tests:\n{}",
            report(&violations)
        );
    }
}

#[test]
fn test_core_is_transport_agnostic() {
    let violations = find_in_production(
        "relay/core",
        &["tokio_tungstenite", "tracing_subscriber", "TcpListener::bind"],
    );
    assert!(
        violations.is_empty(),
        "transport or subscriber setup in core:\n{}",
        report(&violations)
    );
}
