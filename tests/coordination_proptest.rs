//! Property-based tests for the coordination facade using proptest.
//!
//! Verifies:
//! - CAS safety: per generation of a key at most one guarded write lands,
//!   and every writer holding a stale read is rejected
//! - Filter correctness: exact, case-sensitive name matching with
//!   `"<address>:<port>"` formatting, over arbitrary catalogs

use std::collections::BTreeSet;

use proptest::prelude::*;
use waypoint::Coordinator;
use waypoint::DeterministicBackend;
use waypoint::ServiceFragment;
use waypoint::WaypointConfig;

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("test runtime")
        .block_on(fut)
}

/// A writer either reads fresh state right before committing or commits a
/// read taken earlier (possibly stale by then).
#[derive(Debug, Clone, Copy)]
enum Step {
    Read(usize),
    Commit(usize),
}

fn arbitrary_steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(prop_oneof![(0..4usize).prop_map(Step::Read), (0..4usize).prop_map(Step::Commit)], 1..40)
}

fn arbitrary_catalog() -> impl Strategy<Value = Vec<(String, String, u8, u16)>> {
    // (node, service name, last address octet, port)
    prop::collection::vec(
        (
            prop::sample::select(vec!["n1", "n2", "n3"]).prop_map(str::to_string),
            prop::sample::select(vec!["web", "Web", "db", "web-api", "cache"]).prop_map(str::to_string),
            1..=254u8,
            1..=65535u16,
        ),
        0..20,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_cas_accepts_only_current_generation(steps in arbitrary_steps()) {
        block_on(async {
            let backend = DeterministicBackend::new();
            let coordinator = Coordinator::new(backend.clone(), WaypointConfig::default());
            let mut tickets: Vec<Option<waypoint::CasTicket>> = (0..4).map(|_| None).collect();

            for step in steps {
                match step {
                    Step::Read(writer) => {
                        tickets[writer] = Some(coordinator.begin_cas("cfg/x").await.unwrap());
                    }
                    Step::Commit(writer) => {
                        let Some(ticket) = tickets[writer].take() else { continue };
                        let read_index = ticket.modify_index();
                        let current_index = coordinator
                            .get_key("cfg/x")
                            .await
                            .unwrap()
                            .map_or(0, |entry| entry.modify_index);

                        let accepted = ticket.commit(format!("w{writer}").into_bytes()).await.unwrap();
                        prop_assert_eq!(accepted, read_index == current_index);
                    }
                }
            }
            Ok(())
        })?;
    }

    #[test]
    fn test_filter_is_exact_and_formatted(catalog in arbitrary_catalog()) {
        block_on(async {
            let backend = DeterministicBackend::new();
            for (i, (node, service, octet, port)) in catalog.iter().enumerate() {
                backend.register_service(
                    node,
                    &format!("svc-{i}"),
                    ServiceFragment::new(service.clone(), format!("10.0.0.{octet}"), *port),
                );
            }
            let coordinator = Coordinator::new(backend.clone(), WaypointConfig::default());

            let got: BTreeSet<String> = coordinator.addresses_for_service("web").await.unwrap().into_iter().collect();
            let expected: BTreeSet<String> = catalog
                .iter()
                .filter(|(_, service, _, _)| service == "web")
                .map(|(_, _, octet, port)| format!("10.0.0.{octet}:{port}"))
                .collect();
            prop_assert_eq!(got, expected);

            let all = coordinator.list_all_services().await.unwrap();
            prop_assert_eq!(all.len(), catalog.len());
            Ok(())
        })?;
    }
}
